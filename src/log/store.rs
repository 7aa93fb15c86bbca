//! The message log
//!
//! Append-only, per-stream ordered store of messages keyed by
//! `(stream, subject)`. Each write is assigned a strictly increasing
//! per-stream sequence number; updates to an existing subject move the
//! message to its new position in seq order, so a cursor scan always sees
//! the latest state of a subject exactly once.
//!
//! Writers to the same subject serialize through the owning stream's
//! lock; streams are independent. The critical section covers only the
//! map updates - hashing and JSON work happen outside it.

use crate::common::{Result, RiffleError};
use crate::log::message::{data_hash, Message};
use crate::subject::{Subject, SubjectPattern};
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

/// Per-stream counters for introspection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamStats {
    /// Messages currently in the stream (tombstones included)
    pub messages: u64,
    /// Highest assigned seq (0 = empty stream)
    pub head_seq: u64,
    /// Total writes accepted (inserts + updates + deletes)
    pub writes: u64,
}

#[derive(Default)]
struct StreamInner {
    /// seq → message, ordered for cursor scans
    by_seq: BTreeMap<u64, Message>,
    /// subject string → current seq
    by_subject: HashMap<String, u64>,
    /// Next seq to assign; never reused, never decreases
    next_seq: u64,
    writes: u64,
}

#[derive(Default)]
struct StreamLog {
    inner: Mutex<StreamInner>,
}

/// The shared message log.
///
/// Cheap to clone (`Arc` internally); one instance is shared by the
/// ingestion pipeline (writer) and every consumer of its streams
/// (readers).
#[derive(Clone, Default)]
pub struct MessageLog {
    streams: Arc<RwLock<HashMap<String, Arc<StreamLog>>>>,
}

impl MessageLog {
    pub fn new() -> Self {
        Self::default()
    }

    async fn stream(&self, stream: &str) -> Arc<StreamLog> {
        if let Some(existing) = self.streams.read().await.get(stream) {
            return existing.clone();
        }
        let mut streams = self.streams.write().await;
        streams
            .entry(stream.to_string())
            .or_insert_with(|| Arc::new(StreamLog::default()))
            .clone()
    }

    /// Insert or update the message at `(stream, subject)`.
    ///
    /// Assigns a fresh seq in either case; `data`, `data_hash`, and `seq`
    /// change together under the stream lock, so no reader ever observes
    /// one without the others. Writing identical data is permitted and
    /// produces a new seq with an unchanged hash - that is what makes
    /// at-least-once redelivery and backfill overlap harmless.
    pub async fn append_or_update(
        &self,
        stream: &str,
        subject: Subject,
        data: serde_json::Value,
    ) -> Message {
        let hash = data_hash(&data);
        let now = Utc::now();

        let stream_log = self.stream(stream).await;
        let mut inner = stream_log.inner.lock().await;

        inner.next_seq += 1;
        let seq = inner.next_seq;

        let key = subject.to_string();
        let message = match inner.by_subject.get(&key).copied() {
            Some(old_seq) => {
                let old = inner
                    .by_seq
                    .remove(&old_seq)
                    .expect("subject index points at a live seq");
                Message {
                    seq,
                    data,
                    data_hash: hash,
                    deleted: false,
                    updated_at: now,
                    ..old
                }
            }
            None => Message {
                stream: stream.to_string(),
                subject,
                seq,
                data,
                data_hash: hash,
                deleted: false,
                inserted_at: now,
                updated_at: now,
            },
        };

        inner.by_subject.insert(key, seq);
        inner.by_seq.insert(seq, message.clone());
        inner.writes += 1;

        message
    }

    /// Mark the message at `(stream, subject)` deleted.
    ///
    /// The row is retained as a tombstone with a fresh seq, so consumers
    /// observe the delete as an envelope with `deleted = true`. Deleting
    /// an already-tombstoned subject bumps its seq again (a repeated
    /// delete is still a loggable event under at-least-once redelivery).
    pub async fn delete(&self, stream: &str, subject: &Subject) -> Result<Message> {
        let now = Utc::now();
        let stream_log = self.stream(stream).await;
        let mut inner = stream_log.inner.lock().await;

        let key = subject.to_string();
        let Some(old_seq) = inner.by_subject.get(&key).copied() else {
            return Err(RiffleError::not_found(format!(
                "no message at {stream}/{key}"
            )));
        };

        inner.next_seq += 1;
        let seq = inner.next_seq;

        let old = inner
            .by_seq
            .remove(&old_seq)
            .expect("subject index points at a live seq");
        let message = Message {
            seq,
            deleted: true,
            updated_at: now,
            ..old
        };

        inner.by_subject.insert(key, seq);
        inner.by_seq.insert(seq, message.clone());
        inner.writes += 1;

        Ok(message)
    }

    /// Physically remove a tombstoned subject.
    ///
    /// Operator escape hatch for after delete notifications have been
    /// drained; refuses to purge a live (non-deleted) message.
    pub async fn purge(&self, stream: &str, subject: &Subject) -> Result<()> {
        let stream_log = self.stream(stream).await;
        let mut inner = stream_log.inner.lock().await;

        let key = subject.to_string();
        let Some(seq) = inner.by_subject.get(&key).copied() else {
            return Err(RiffleError::not_found(format!(
                "no message at {stream}/{key}"
            )));
        };
        let deleted = inner.by_seq.get(&seq).map(|m| m.deleted).unwrap_or(false);
        if !deleted {
            return Err(RiffleError::InvalidState(format!(
                "{stream}/{key} is not tombstoned"
            )));
        }

        inner.by_subject.remove(&key);
        inner.by_seq.remove(&seq);
        debug!(stream, subject = %key, "Purged tombstone");
        Ok(())
    }

    /// Messages with `seq > after_seq` matching `pattern`, ascending,
    /// at most `max` of them.
    ///
    /// Strict `seq >` comparison makes the scan restartable: polling with
    /// the last returned seq as the next cursor neither misses nor
    /// duplicates rows.
    pub async fn query_by_pattern(
        &self,
        stream: &str,
        pattern: &SubjectPattern,
        after_seq: u64,
        max: usize,
    ) -> Vec<Message> {
        let stream_log = self.stream(stream).await;
        let inner = stream_log.inner.lock().await;

        inner
            .by_seq
            .range(after_seq + 1..)
            .filter(|(_, m)| pattern.matches(&m.subject))
            .take(max)
            .map(|(_, m)| m.clone())
            .collect()
    }

    /// The message currently holding `seq`, if any.
    ///
    /// A `None` for a previously observed seq means the subject was
    /// rewritten since (update or delete moved it to a newer seq).
    pub async fn get_by_seq(&self, stream: &str, seq: u64) -> Option<Message> {
        let stream_log = self.stream(stream).await;
        let inner = stream_log.inner.lock().await;
        inner.by_seq.get(&seq).cloned()
    }

    /// Current message for each of the given subjects, absent entries
    /// omitted.
    pub async fn query_exact(
        &self,
        stream: &str,
        subjects: &[Subject],
    ) -> HashMap<String, Message> {
        let stream_log = self.stream(stream).await;
        let inner = stream_log.inner.lock().await;

        let mut out = HashMap::new();
        for subject in subjects {
            let key = subject.to_string();
            if let Some(seq) = inner.by_subject.get(&key) {
                if let Some(msg) = inner.by_seq.get(seq) {
                    out.insert(key, msg.clone());
                }
            }
        }
        out
    }

    /// Highest assigned seq in a stream (0 if empty). Feeds consumer lag.
    pub async fn head_seq(&self, stream: &str) -> u64 {
        let stream_log = self.stream(stream).await;
        let next_seq = stream_log.inner.lock().await.next_seq;
        next_seq
    }

    /// Counters for a stream.
    pub async fn stats(&self, stream: &str) -> StreamStats {
        let stream_log = self.stream(stream).await;
        let inner = stream_log.inner.lock().await;
        StreamStats {
            messages: inner.by_seq.len() as u64,
            head_seq: inner.next_seq,
            writes: inner.writes,
        }
    }
}
