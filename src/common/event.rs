//! Logical change events
//!
//! A [`ChangeEvent`] is one decoded row change from the replication
//! stream (or a backfill scan), carrying enough identity information to
//! derive the message subject and the commit position it belongs to.

use serde::{Deserialize, Serialize};

/// Row-change operation type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeOp {
    /// Row inserted (also used for backfilled rows)
    Insert,
    /// Row updated
    Update,
    /// Row deleted
    Delete,
}

impl std::fmt::Display for ChangeOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChangeOp::Insert => write!(f, "insert"),
            ChangeOp::Update => write!(f, "update"),
            ChangeOp::Delete => write!(f, "delete"),
        }
    }
}

/// A decoded logical row change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Operation type
    pub op: ChangeOp,
    /// Schema (namespace) of the source table
    pub schema: String,
    /// Source table name
    pub table: String,
    /// Row identity: primary-key (or replica-identity) column values
    /// joined with `.`, in column order
    pub row_id: String,
    /// Row state: the new row for insert/update, the old/key row for delete
    pub row: serde_json::Value,
    /// LSN of the COMMIT record this change belongs to
    pub commit_lsn: u64,
    /// Commit timestamp, microseconds since the Postgres epoch (2000-01-01)
    pub commit_ts: i64,
}

impl ChangeEvent {
    /// Create an INSERT event.
    pub fn insert(
        schema: impl Into<String>,
        table: impl Into<String>,
        row_id: impl Into<String>,
        row: serde_json::Value,
    ) -> Self {
        Self {
            op: ChangeOp::Insert,
            schema: schema.into(),
            table: table.into(),
            row_id: row_id.into(),
            row,
            commit_lsn: 0,
            commit_ts: 0,
        }
    }

    /// Create an UPDATE event.
    pub fn update(
        schema: impl Into<String>,
        table: impl Into<String>,
        row_id: impl Into<String>,
        row: serde_json::Value,
    ) -> Self {
        Self {
            op: ChangeOp::Update,
            ..Self::insert(schema, table, row_id, row)
        }
    }

    /// Create a DELETE event carrying the old/key row.
    pub fn delete(
        schema: impl Into<String>,
        table: impl Into<String>,
        row_id: impl Into<String>,
        row: serde_json::Value,
    ) -> Self {
        Self {
            op: ChangeOp::Delete,
            ..Self::insert(schema, table, row_id, row)
        }
    }

    /// Stamp the commit position onto this event.
    pub fn at_commit(mut self, commit_lsn: u64, commit_ts: i64) -> Self {
        self.commit_lsn = commit_lsn;
        self.commit_ts = commit_ts;
        self
    }
}
