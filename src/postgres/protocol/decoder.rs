//! Binary decoding of replication frames and pgoutput messages
//!
//! Two layers: [`decode_wal_frame`] splits the CopyData payload into
//! XLogData/keepalive frames, and [`PgOutputDecoder`] decodes the
//! pgoutput message carried inside XLogData. Every length and tag is
//! checked before it is consumed - a malformed frame is a hard error for
//! the slot, never a silent skip, because skipping would break per-key
//! ordering.

use super::message::*;
use bytes::{Buf, Bytes};
use thiserror::Error;

/// Decoder errors
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("Not enough data (needed {needed} more bytes)")]
    NotEnoughData { needed: usize },
    #[error("Invalid message type: {0:#04x}")]
    InvalidType(u8),
    #[error("UTF8 error: {0}")]
    Utf8(#[from] std::str::Utf8Error),
    #[error("Protocol error: {0}")]
    Protocol(String),
}

fn need(buf: &Bytes, n: usize) -> Result<(), DecodeError> {
    if buf.remaining() < n {
        Err(DecodeError::NotEnoughData {
            needed: n - buf.remaining(),
        })
    } else {
        Ok(())
    }
}

/// Decode the outer replication frame from one CopyData payload.
pub fn decode_wal_frame(data: &mut Bytes) -> Result<WalFrame, DecodeError> {
    need(data, 1)?;
    let tag = data.get_u8();
    match tag {
        b'w' => {
            need(data, 8 + 8 + 8)?;
            let wal_start = data.get_u64();
            let wal_end = data.get_u64();
            let timestamp = data.get_i64();
            Ok(WalFrame::XLogData {
                wal_start,
                wal_end,
                timestamp,
                data: data.clone(),
            })
        }
        b'k' => {
            need(data, 8 + 8 + 1)?;
            let wal_end = data.get_u64();
            let timestamp = data.get_i64();
            let reply_requested = data.get_u8() == 1;
            Ok(WalFrame::Keepalive {
                wal_end,
                timestamp,
                reply_requested,
            })
        }
        t => Err(DecodeError::InvalidType(t)),
    }
}

/// pgoutput message decoder (protocol version 1)
pub struct PgOutputDecoder;

impl PgOutputDecoder {
    /// Decode one pgoutput message.
    pub fn decode(data: &mut Bytes) -> Result<PgOutputMessage, DecodeError> {
        need(data, 1)?;
        let tag = data.get_u8();

        match tag {
            b'B' => Self::decode_begin(data).map(PgOutputMessage::Begin),
            b'C' => Self::decode_commit(data).map(PgOutputMessage::Commit),
            b'O' => Self::decode_origin(data).map(PgOutputMessage::Origin),
            b'R' => Self::decode_relation(data).map(PgOutputMessage::Relation),
            b'Y' => Self::decode_type(data).map(PgOutputMessage::Type),
            b'I' => Self::decode_insert(data).map(PgOutputMessage::Insert),
            b'U' => Self::decode_update(data).map(PgOutputMessage::Update),
            b'D' => Self::decode_delete(data).map(PgOutputMessage::Delete),
            b'T' => Self::decode_truncate(data).map(PgOutputMessage::Truncate),
            t => Err(DecodeError::InvalidType(t)),
        }
    }

    fn decode_begin(buf: &mut Bytes) -> Result<BeginBody, DecodeError> {
        need(buf, 8 + 8 + 4)?;
        Ok(BeginBody {
            final_lsn: buf.get_u64(),
            timestamp: buf.get_i64(),
            xid: buf.get_u32(),
        })
    }

    fn decode_commit(buf: &mut Bytes) -> Result<CommitBody, DecodeError> {
        need(buf, 1 + 8 + 8 + 8)?;
        Ok(CommitBody {
            flags: buf.get_u8(),
            commit_lsn: buf.get_u64(),
            end_lsn: buf.get_u64(),
            timestamp: buf.get_i64(),
        })
    }

    fn decode_origin(buf: &mut Bytes) -> Result<OriginBody, DecodeError> {
        need(buf, 8)?;
        let commit_lsn = buf.get_u64();
        let name = read_cstring(buf)?;
        Ok(OriginBody { commit_lsn, name })
    }

    fn decode_relation(buf: &mut Bytes) -> Result<RelationBody, DecodeError> {
        need(buf, 4)?;
        let id = buf.get_u32();
        let namespace = read_cstring(buf)?;
        let name = read_cstring(buf)?;
        need(buf, 1 + 2)?;
        let replica_identity = buf.get_u8();
        let num_columns = buf.get_u16();

        let mut columns = Vec::with_capacity(num_columns as usize);
        for _ in 0..num_columns {
            need(buf, 1)?;
            let flags = buf.get_u8();
            let col_name = read_cstring(buf)?;
            need(buf, 4 + 4)?;
            columns.push(Column {
                flags,
                name: col_name,
                type_id: buf.get_i32(),
                type_mode: buf.get_i32(),
            });
        }

        Ok(RelationBody {
            id,
            namespace,
            name,
            replica_identity,
            columns,
        })
    }

    fn decode_type(buf: &mut Bytes) -> Result<TypeBody, DecodeError> {
        need(buf, 4)?;
        let id = buf.get_u32();
        let namespace = read_cstring(buf)?;
        let name = read_cstring(buf)?;
        Ok(TypeBody {
            id,
            namespace,
            name,
        })
    }

    fn decode_insert(buf: &mut Bytes) -> Result<InsertBody, DecodeError> {
        need(buf, 4 + 1)?;
        let relation_id = buf.get_u32();
        let marker = buf.get_u8();
        if marker != b'N' {
            return Err(DecodeError::Protocol(format!(
                "expected new-tuple marker in insert, got {:#04x}",
                marker
            )));
        }
        Ok(InsertBody {
            relation_id,
            tuple: decode_tuple(buf)?,
        })
    }

    fn decode_update(buf: &mut Bytes) -> Result<UpdateBody, DecodeError> {
        need(buf, 4 + 1)?;
        let relation_id = buf.get_u32();
        let marker = buf.get_u8();

        let (old_tuple, new_tuple) = match marker {
            b'K' | b'O' => {
                let old = decode_tuple(buf)?;
                need(buf, 1)?;
                let next = buf.get_u8();
                if next != b'N' {
                    return Err(DecodeError::Protocol(format!(
                        "expected new-tuple marker after old tuple, got {:#04x}",
                        next
                    )));
                }
                (Some(old), decode_tuple(buf)?)
            }
            b'N' => (None, decode_tuple(buf)?),
            t => return Err(DecodeError::InvalidType(t)),
        };

        Ok(UpdateBody {
            relation_id,
            old_tuple,
            new_tuple,
        })
    }

    fn decode_delete(buf: &mut Bytes) -> Result<DeleteBody, DecodeError> {
        need(buf, 4 + 1)?;
        let relation_id = buf.get_u32();
        let marker = buf.get_u8();
        match marker {
            b'K' | b'O' => Ok(DeleteBody {
                relation_id,
                old_tuple: decode_tuple(buf)?,
            }),
            t => Err(DecodeError::InvalidType(t)),
        }
    }

    fn decode_truncate(buf: &mut Bytes) -> Result<TruncateBody, DecodeError> {
        need(buf, 4 + 1)?;
        let num_rels = buf.get_u32();
        let options = buf.get_u8();
        need(buf, num_rels as usize * 4)?;
        let mut relation_ids = Vec::with_capacity(num_rels as usize);
        for _ in 0..num_rels {
            relation_ids.push(buf.get_u32());
        }
        Ok(TruncateBody {
            options,
            relation_ids,
        })
    }
}

fn read_cstring(buf: &mut Bytes) -> Result<String, DecodeError> {
    let n = buf
        .iter()
        .position(|&b| b == 0)
        .ok_or(DecodeError::NotEnoughData { needed: 1 })?;
    let raw = buf.copy_to_bytes(n);
    buf.advance(1); // null terminator
    Ok(std::str::from_utf8(&raw)?.to_string())
}

fn decode_tuple(buf: &mut Bytes) -> Result<Tuple, DecodeError> {
    need(buf, 2)?;
    let num_cols = buf.get_u16();
    let mut columns = Vec::with_capacity(num_cols as usize);

    for _ in 0..num_cols {
        need(buf, 1)?;
        let kind = buf.get_u8();
        let data = match kind {
            b'n' => TupleData::Null,
            b'u' => TupleData::Toast,
            b't' => {
                need(buf, 4)?;
                let len = buf.get_u32() as usize;
                need(buf, len)?;
                TupleData::Text(buf.copy_to_bytes(len))
            }
            t => return Err(DecodeError::InvalidType(t)),
        };
        columns.push(data);
    }

    Ok(Tuple(columns))
}
