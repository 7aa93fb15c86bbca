//! Sink collaborator contract
//!
//! Push delivery hands ordered batches to a [`Sink`]; the sink owns
//! everything wire-specific (HTTP, broker, pub/sub clients, auth) and
//! reports back one of three outcomes. The core never inspects
//! sink-specific formats.

use crate::consumer::dispatch::Delivery;
use async_trait::async_trait;

/// Outcome of one delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// The batch was accepted; its messages may be acked.
    Delivered,
    /// The attempt failed but a later retry may succeed (connection
    /// refused, 5xx, throttling).
    Retryable(String),
    /// The destination permanently rejected the payload; retrying is
    /// pointless.
    Fatal(String),
}

/// A push destination.
///
/// `deliver` receives messages in seq order and must treat the batch as a
/// unit: partial acceptance is reported as `Retryable` so the whole batch
/// is retried (consumers are idempotent by `seq`/`data_hash`).
#[async_trait]
pub trait Sink: Send + Sync {
    async fn deliver(&self, batch: &[Delivery]) -> DeliveryOutcome;
}

/// Writes envelopes to stdout as JSON lines. Useful for demos and as the
/// smallest possible sink reference.
#[derive(Debug, Default)]
pub struct StdoutSink;

#[async_trait]
impl Sink for StdoutSink {
    async fn deliver(&self, batch: &[Delivery]) -> DeliveryOutcome {
        for delivery in batch {
            match serde_json::to_string(&delivery.envelope) {
                Ok(line) => println!("{}\t{}\t{}", delivery.subject, delivery.seq, line),
                Err(e) => return DeliveryOutcome::Fatal(format!("unencodable envelope: {e}")),
            }
        }
        DeliveryOutcome::Delivered
    }
}
