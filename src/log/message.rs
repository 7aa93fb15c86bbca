//! Message records and the consumer envelope

use crate::subject::Subject;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Compute the content digest of a payload: SHA-256 over the compact JSON
/// encoding, hex-encoded.
///
/// Used for idempotent upsert detection - re-ingesting an identical row
/// (at-least-once redelivery, backfill overlap) produces the same digest.
pub fn data_hash(data: &serde_json::Value) -> String {
    let bytes = serde_json::to_vec(data).unwrap_or_default();
    hex::encode(Sha256::digest(&bytes))
}

/// A message in a stream's log.
///
/// Uniquely identified by `(stream, subject)`. `seq` is assigned by the
/// log at write time and is strictly increasing within the stream; an
/// update to an existing subject bumps `seq` together with `data` and
/// `data_hash` in one atomic step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Owning stream
    pub stream: String,
    /// Subject address
    pub subject: Subject,
    /// Per-stream sequence number, assigned at commit time, never reused
    pub seq: u64,
    /// Payload
    pub data: serde_json::Value,
    /// Content digest of `data`
    pub data_hash: String,
    /// Tombstone marker: the row was deleted at the source
    pub deleted: bool,
    /// First time this subject was observed
    pub inserted_at: DateTime<Utc>,
    /// Last write to this subject
    pub updated_at: DateTime<Utc>,
}

impl Message {
    /// The JSON envelope a consumer sees for this message. The subject
    /// travels as separate metadata, never inside the payload.
    pub fn envelope(&self) -> MessageEnvelope {
        MessageEnvelope {
            data: self.data.clone(),
            deleted: self.deleted,
        }
    }
}

/// The payload envelope delivered to every consumer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEnvelope {
    /// Row data as captured from the source
    pub data: serde_json::Value,
    /// Whether this message is a delete notification
    pub deleted: bool,
}
