//! pgoutput protocol messages
//!
//! Message types for logical replication with the `pgoutput` plugin,
//! protocol version 1, plus the outer replication frames (`XLogData` and
//! primary keepalive) they arrive in.

use bytes::Bytes;

/// Outer frame of the replication CopyData stream.
#[derive(Debug, Clone)]
pub enum WalFrame {
    /// `w`: a WAL data payload carrying one pgoutput message
    XLogData {
        wal_start: u64,
        wal_end: u64,
        /// Server clock, microseconds since the Postgres epoch
        timestamp: i64,
        data: Bytes,
    },
    /// `k`: primary keepalive
    Keepalive {
        wal_end: u64,
        timestamp: i64,
        reply_requested: bool,
    },
}

/// A decoded pgoutput message.
#[derive(Debug, Clone)]
pub enum PgOutputMessage {
    /// Transaction begin
    Begin(BeginBody),
    /// Transaction commit
    Commit(CommitBody),
    /// Replication origin; decoded and ignored
    Origin(OriginBody),
    /// Relation (table) definition
    Relation(RelationBody),
    /// Type definition; decoded and ignored
    Type(TypeBody),
    /// Row insert
    Insert(InsertBody),
    /// Row update
    Update(UpdateBody),
    /// Row delete
    Delete(DeleteBody),
    /// Table truncate; not representable in the subject scheme
    Truncate(TruncateBody),
}

/// BEGIN message
#[derive(Debug, Clone)]
pub struct BeginBody {
    /// LSN of the transaction's commit record
    pub final_lsn: u64,
    pub timestamp: i64,
    pub xid: u32,
}

/// COMMIT message
#[derive(Debug, Clone)]
pub struct CommitBody {
    pub flags: u8,
    pub commit_lsn: u64,
    /// LSN one past the commit record; the resume position
    pub end_lsn: u64,
    pub timestamp: i64,
}

/// ORIGIN message
#[derive(Debug, Clone)]
pub struct OriginBody {
    pub commit_lsn: u64,
    pub name: String,
}

/// RELATION message (table definition)
#[derive(Debug, Clone)]
pub struct RelationBody {
    pub id: u32,
    pub namespace: String,
    pub name: String,
    pub replica_identity: u8,
    pub columns: Vec<Column>,
}

impl RelationBody {
    /// Names of the columns in the replica key (primary key or replica
    /// identity), in declaration order.
    pub fn key_columns(&self) -> impl Iterator<Item = &Column> {
        self.columns.iter().filter(|c| c.is_key())
    }
}

/// Column definition within a relation
#[derive(Debug, Clone)]
pub struct Column {
    pub flags: u8,
    pub name: String,
    pub type_id: i32,
    pub type_mode: i32,
}

impl Column {
    /// Whether this column is part of the replica key.
    pub fn is_key(&self) -> bool {
        self.flags & 0x01 != 0
    }
}

/// TYPE message
#[derive(Debug, Clone)]
pub struct TypeBody {
    pub id: u32,
    pub namespace: String,
    pub name: String,
}

/// INSERT message
#[derive(Debug, Clone)]
pub struct InsertBody {
    pub relation_id: u32,
    pub tuple: Tuple,
}

/// UPDATE message
#[derive(Debug, Clone)]
pub struct UpdateBody {
    pub relation_id: u32,
    /// Old key (`K`) or full old row (`O`), when replica identity provides it
    pub old_tuple: Option<Tuple>,
    pub new_tuple: Tuple,
}

/// DELETE message
#[derive(Debug, Clone)]
pub struct DeleteBody {
    pub relation_id: u32,
    /// Key (`K`) or full old row (`O`)
    pub old_tuple: Tuple,
}

/// TRUNCATE message
#[derive(Debug, Clone)]
pub struct TruncateBody {
    pub relation_ids: Vec<u32>,
    pub options: u8,
}

/// Row tuple
#[derive(Debug, Clone)]
pub struct Tuple(pub Vec<TupleData>);

/// Column data within a tuple
#[derive(Debug, Clone)]
pub enum TupleData {
    /// NULL value
    Null,
    /// Unchanged TOAST value (not sent by the server)
    Toast,
    /// Text representation
    Text(Bytes),
}
