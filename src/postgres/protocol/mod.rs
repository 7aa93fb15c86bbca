//! Replication wire protocol
//!
//! - [`ReplicationClient`] / [`ReplicationStream`] - connection and
//!   CopyBoth streaming
//! - [`decode_wal_frame`] / [`PgOutputDecoder`] - binary decoding
//! - pgoutput message types

mod client;
mod decoder;
mod message;

pub use client::{
    pg_epoch_micros_now, ReplicationClient, ReplicationStream, CONNECT_TIMEOUT, IO_TIMEOUT,
    MAX_MESSAGE_SIZE,
};
pub use decoder::{decode_wal_frame, DecodeError, PgOutputDecoder};
pub use message::{
    BeginBody, Column, CommitBody, DeleteBody, InsertBody, OriginBody, PgOutputMessage,
    RelationBody, TruncateBody, Tuple, TupleData, TypeBody, UpdateBody, WalFrame,
};
