//! Consumer dispatch
//!
//! Tracks, per consumer, which messages have been handed out, acked,
//! or abandoned. Pull consumers call [`Dispatcher::next_batch`] and
//! [`Dispatcher::ack`] directly; push consumers are driven by the loop in
//! [`crate::consumer::push`], which uses the same primitives, so both
//! kinds share one delivery-state model:
//!
//! - a message becomes *in-flight* when handed out, with a fresh ack
//!   token and a visibility deadline;
//! - an expired or nacked delivery reverts to *pending* and re-enters the
//!   next batch (in seq order, ahead of newer messages);
//! - a delivery whose attempts exceed the cap moves to *failed-terminal*
//!   and is recorded for operator visibility;
//! - acks advance the consumer's cursor under the configured
//!   [`AckPolicy`], and the cursor is persisted for crash recovery.

use crate::common::{
    Checkpoint, CheckpointStore, Health, HealthConfig, HealthTracker, Result, RiffleError,
};
use crate::log::{MessageEnvelope, MessageLog};
use crate::subject::SubjectPattern;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

/// Remembered acked tokens, for `AlreadyAcked` answers to duplicate acks.
const ACKED_TOKEN_MEMORY: usize = 10_000;

/// Cursor-advancement policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckPolicy {
    /// The cursor never advances past an unacked earlier delivery, so a
    /// slow or lost ack can never cause a silent skip. Default.
    #[default]
    Contiguous,
    /// The cursor advances per ack, out of order; an unacked earlier
    /// message is abandoned once later acks move past it.
    PerMessage,
}

/// Kind of consumer, for introspection only - the core treats all push
/// sinks identically through the [`crate::consumer::Sink`] trait.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConsumerKind {
    #[default]
    Pull,
    PushHttp,
    PushBroker,
    PushPubsub,
}

/// Per-consumer configuration.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Stable identifier
    pub id: String,
    /// Stream to consume
    pub stream: String,
    /// Kind tag for status reporting
    pub kind: ConsumerKind,
    /// Subject filter; `None` means every message in the stream
    pub filter: Option<SubjectPattern>,
    /// Maximum messages per batch
    pub batch_size: usize,
    /// How long a delivery may stay unacked before redelivery
    pub visibility_timeout: Duration,
    /// Delivery attempts before a message is failed terminally
    pub max_attempts: u32,
    /// Cursor-advancement policy
    pub ack_policy: AckPolicy,
    /// Push mode: strict seq-order delivery (single batch in flight)
    pub ordered: bool,
    /// Push mode: concurrent deliveries when `ordered` is false
    pub max_in_flight: usize,
}

impl ConsumerConfig {
    /// Create a configuration builder.
    pub fn builder(id: impl Into<String>, stream: impl Into<String>) -> ConsumerConfigBuilder {
        ConsumerConfigBuilder {
            id: id.into(),
            stream: stream.into(),
            kind: ConsumerKind::default(),
            filter: None,
            batch_size: 100,
            visibility_timeout: Duration::from_secs(30),
            max_attempts: 5,
            ack_policy: AckPolicy::default(),
            ordered: true,
            max_in_flight: 16,
        }
    }
}

/// Builder for [`ConsumerConfig`].
#[derive(Debug, Clone)]
pub struct ConsumerConfigBuilder {
    id: String,
    stream: String,
    kind: ConsumerKind,
    filter: Option<SubjectPattern>,
    batch_size: usize,
    visibility_timeout: Duration,
    max_attempts: u32,
    ack_policy: AckPolicy,
    ordered: bool,
    max_in_flight: usize,
}

impl ConsumerConfigBuilder {
    pub fn kind(mut self, kind: ConsumerKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn filter(mut self, pattern: SubjectPattern) -> Self {
        self.filter = Some(pattern);
        self
    }

    pub fn batch_size(mut self, n: usize) -> Self {
        self.batch_size = n;
        self
    }

    pub fn visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = timeout;
        self
    }

    pub fn max_attempts(mut self, n: u32) -> Self {
        self.max_attempts = n;
        self
    }

    pub fn ack_policy(mut self, policy: AckPolicy) -> Self {
        self.ack_policy = policy;
        self
    }

    pub fn ordered(mut self, ordered: bool) -> Self {
        self.ordered = ordered;
        self
    }

    pub fn max_in_flight(mut self, n: usize) -> Self {
        self.max_in_flight = n;
        self
    }

    pub fn build(self) -> Result<ConsumerConfig> {
        if self.id.is_empty() {
            return Err(RiffleError::config("Consumer id is required"));
        }
        // The id names the cursor checkpoint file.
        if self.id.contains(['/', '\\']) || self.id.contains("..") || self.id.contains(char::is_whitespace) {
            return Err(RiffleError::config(format!("Invalid consumer id: {:?}", self.id)));
        }
        if self.stream.is_empty() {
            return Err(RiffleError::config("Stream is required"));
        }
        if self.batch_size == 0 {
            return Err(RiffleError::config("Batch size must be nonzero"));
        }
        if self.max_attempts == 0 {
            return Err(RiffleError::config("Max attempts must be nonzero"));
        }
        if !self.ordered && self.max_in_flight == 0 {
            return Err(RiffleError::config("In-flight window must be nonzero"));
        }
        Ok(ConsumerConfig {
            id: self.id,
            stream: self.stream,
            kind: self.kind,
            filter: self.filter,
            batch_size: self.batch_size,
            visibility_timeout: self.visibility_timeout,
            max_attempts: self.max_attempts,
            ack_policy: self.ack_policy,
            ordered: self.ordered,
            max_in_flight: self.max_in_flight,
        })
    }
}

/// Opaque token identifying one delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AckToken(Uuid);

/// One message handed to a consumer.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Subject, as separate metadata
    pub subject: String,
    /// Seq within the stream
    pub seq: u64,
    /// Attempt number, starting at 1
    pub attempt: u32,
    /// The payload envelope
    pub envelope: MessageEnvelope,
}

/// Outcome of an ack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    Acked,
    AlreadyAcked,
}

/// A terminally failed delivery, kept for operator visibility.
#[derive(Debug, Clone, serde::Serialize)]
pub struct TerminalFailure {
    pub seq: u64,
    pub subject: String,
    pub attempts: u32,
    pub reason: String,
    pub failed_at: DateTime<Utc>,
}

struct InFlight {
    seq: u64,
    subject: String,
    attempts: u32,
    deadline: Instant,
}

struct ConsumerState {
    config: ConsumerConfig,
    /// Last seq the consumer is known to have fully processed
    cursor: u64,
    /// Highest acked seq (may run ahead of cursor under Contiguous)
    acked_high: u64,
    /// Highest seq ever handed out
    delivered_hwm: u64,
    in_flight: HashMap<Uuid, InFlight>,
    /// Reverted deliveries awaiting redelivery: seq → (subject, attempts)
    pending_retry: BTreeMap<u64, (String, u32)>,
    acked_tokens: VecDeque<Uuid>,
    acked_token_set: BTreeSet<Uuid>,
    terminal: Vec<TerminalFailure>,
    health: HealthTracker,
}

impl ConsumerState {
    fn outstanding_min(&self) -> Option<u64> {
        let in_flight = self.in_flight.values().map(|f| f.seq).min();
        let pending = self.pending_retry.keys().next().copied();
        match (in_flight, pending) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Advance the cursor after an ack, per policy. Returns true if it
    /// moved.
    fn advance_cursor(&mut self, acked_seq: u64) -> bool {
        let before = self.cursor;
        self.acked_high = self.acked_high.max(acked_seq);
        match self.config.ack_policy {
            AckPolicy::Contiguous => {
                // Never move past a delivered-but-unacked earlier seq.
                let limit = self
                    .outstanding_min()
                    .map(|min| min.saturating_sub(1))
                    .unwrap_or(self.acked_high);
                self.cursor = self.cursor.max(self.acked_high.min(limit));
            }
            AckPolicy::PerMessage => {
                self.cursor = self.cursor.max(acked_seq);
            }
        }
        self.cursor > before
    }

    fn remember_acked(&mut self, token: Uuid) {
        self.acked_tokens.push_back(token);
        self.acked_token_set.insert(token);
        while self.acked_tokens.len() > ACKED_TOKEN_MEMORY {
            if let Some(old) = self.acked_tokens.pop_front() {
                self.acked_token_set.remove(&old);
            }
        }
    }
}

/// Snapshot of one consumer for the status interface.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ConsumerStatusSnapshot {
    pub id: String,
    pub kind: ConsumerKind,
    pub stream: String,
    pub cursor: u64,
    pub lag: u64,
    pub in_flight: usize,
    pub pending_retry: usize,
    pub terminal_failures: usize,
    pub health: Health,
}

/// The dispatch engine: delivery state for every registered consumer.
pub struct Dispatcher {
    log: MessageLog,
    checkpoints: Arc<CheckpointStore>,
    health_config: HealthConfig,
    consumers: RwLock<HashMap<String, Arc<Mutex<ConsumerState>>>>,
}

impl Dispatcher {
    pub fn new(log: MessageLog, checkpoints: Arc<CheckpointStore>) -> Self {
        Self {
            log,
            checkpoints,
            health_config: HealthConfig::default(),
            consumers: RwLock::new(HashMap::new()),
        }
    }

    fn checkpoint_key(id: &str) -> String {
        format!("consumer.{id}")
    }

    /// Register a consumer, resuming its cursor from the checkpoint
    /// store. Registering an id twice is an error.
    pub async fn register(&self, config: ConsumerConfig) -> Result<()> {
        let mut consumers = self.consumers.write().await;
        if consumers.contains_key(&config.id) {
            return Err(RiffleError::AlreadyRunning(config.id));
        }

        let cursor = self
            .checkpoints
            .load(&Self::checkpoint_key(&config.id))
            .await
            .and_then(|cp| cp.as_seq())
            .unwrap_or(0);

        debug!(consumer = %config.id, cursor, "Consumer registered");
        let state = ConsumerState {
            cursor,
            acked_high: cursor,
            delivered_hwm: cursor,
            in_flight: HashMap::new(),
            pending_retry: BTreeMap::new(),
            acked_tokens: VecDeque::new(),
            acked_token_set: BTreeSet::new(),
            terminal: Vec::new(),
            health: HealthTracker::new(),
            config,
        };
        consumers.insert(state.config.id.clone(), Arc::new(Mutex::new(state)));
        Ok(())
    }

    /// Remove a consumer's delivery state. Its persisted cursor is kept,
    /// so re-registering resumes where it left off.
    pub async fn deregister(&self, id: &str) -> Result<()> {
        self.consumers
            .write()
            .await
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| RiffleError::not_found(format!("consumer {id}")))
    }

    async fn consumer(&self, id: &str) -> Result<Arc<Mutex<ConsumerState>>> {
        self.consumers
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| RiffleError::not_found(format!("consumer {id}")))
    }

    /// Hand out the next batch for a consumer: redeliveries first (seq
    /// order), then unseen messages past the delivery high-water mark.
    pub async fn next_batch(
        &self,
        id: &str,
        max_n: usize,
    ) -> Result<Vec<(Delivery, AckToken)>> {
        let state = self.consumer(id).await?;
        let mut state = state.lock().await;
        let now = Instant::now();
        let max_n = max_n.min(state.config.batch_size);

        // Expire overdue in-flight deliveries back to pending.
        let expired: Vec<Uuid> = state
            .in_flight
            .iter()
            .filter(|(_, f)| f.deadline <= now)
            .map(|(token, _)| *token)
            .collect();
        for token in expired {
            if let Some(f) = state.in_flight.remove(&token) {
                debug!(consumer = %id, seq = f.seq, "Visibility timeout, redelivering");
                state.pending_retry.insert(f.seq, (f.subject, f.attempts));
            }
        }

        let mut out = Vec::new();

        // Redeliveries in seq order, so a retrying message is never
        // overtaken by a newer one.
        let retry_seqs: Vec<u64> = state.pending_retry.keys().copied().collect();
        for seq in retry_seqs {
            if out.len() >= max_n {
                break;
            }
            let (subject, attempts) = state.pending_retry.remove(&seq).expect("key just listed");

            if attempts >= state.config.max_attempts {
                warn!(consumer = %id, seq, attempts, "Delivery failed terminally");
                state.terminal.push(TerminalFailure {
                    seq,
                    subject,
                    attempts,
                    reason: format!("exhausted {attempts} delivery attempts"),
                    failed_at: Utc::now(),
                });
                state.health.record_failure();
                continue;
            }

            // The seq may have been superseded by a newer write; the new
            // seq will be delivered as an unseen message instead.
            let Some(message) = self.log.get_by_seq(&state.config.stream, seq).await else {
                continue;
            };

            let token = Uuid::new_v4();
            let attempt = attempts + 1;
            let deadline = now + state.config.visibility_timeout;
            state.in_flight.insert(
                token,
                InFlight {
                    seq,
                    subject: message.subject.to_string(),
                    attempts: attempt,
                    deadline,
                },
            );
            out.push((
                Delivery {
                    subject: message.subject.to_string(),
                    seq,
                    attempt,
                    envelope: message.envelope(),
                },
                AckToken(token),
            ));
        }

        // Unseen messages.
        if out.len() < max_n {
            let all = SubjectPattern::parse(">").expect("static pattern");
            let pattern = state.config.filter.as_ref().unwrap_or(&all);
            let fresh = self
                .log
                .query_by_pattern(
                    &state.config.stream,
                    pattern,
                    state.delivered_hwm,
                    max_n - out.len(),
                )
                .await;

            for message in fresh {
                let token = Uuid::new_v4();
                state.delivered_hwm = state.delivered_hwm.max(message.seq);
                let deadline = now + state.config.visibility_timeout;
                state.in_flight.insert(
                    token,
                    InFlight {
                        seq: message.seq,
                        subject: message.subject.to_string(),
                        attempts: 1,
                        deadline,
                    },
                );
                out.push((
                    Delivery {
                        subject: message.subject.to_string(),
                        seq: message.seq,
                        attempt: 1,
                        envelope: message.envelope(),
                    },
                    AckToken(token),
                ));
            }
        }

        Ok(out)
    }

    /// Acknowledge a delivery. Advances the cursor per the consumer's
    /// ack policy and persists it when it moves.
    pub async fn ack(&self, id: &str, token: AckToken) -> Result<AckOutcome> {
        let state = self.consumer(id).await?;
        let mut state = state.lock().await;

        let Some(flight) = state.in_flight.remove(&token.0) else {
            if state.acked_token_set.contains(&token.0) {
                return Ok(AckOutcome::AlreadyAcked);
            }
            return Err(RiffleError::not_found(format!("ack token for consumer {id}")));
        };

        state.remember_acked(token.0);
        state.health.record_success();
        let moved = state.advance_cursor(flight.seq);

        if moved {
            let cursor = state.cursor;
            self.checkpoints
                .save(&Self::checkpoint_key(id), Checkpoint::seq(cursor))
                .await?;
        }
        Ok(AckOutcome::Acked)
    }

    /// Return a delivery for immediate redelivery (e.g. a retryable sink
    /// failure).
    pub async fn nack(&self, id: &str, token: AckToken) -> Result<()> {
        let state = self.consumer(id).await?;
        let mut state = state.lock().await;

        let flight = state
            .in_flight
            .remove(&token.0)
            .ok_or_else(|| RiffleError::not_found(format!("ack token for consumer {id}")))?;
        state.health.record_failure();
        state
            .pending_retry
            .insert(flight.seq, (flight.subject, flight.attempts));
        Ok(())
    }

    /// Record a delivery as terminally failed and move on.
    pub async fn fail(&self, id: &str, token: AckToken, reason: impl Into<String>) -> Result<()> {
        let state = self.consumer(id).await?;
        let mut state = state.lock().await;

        let flight = state
            .in_flight
            .remove(&token.0)
            .ok_or_else(|| RiffleError::not_found(format!("ack token for consumer {id}")))?;
        let reason = reason.into();
        warn!(consumer = %id, seq = flight.seq, %reason, "Delivery failed terminally");
        state.health.record_failure();
        state.terminal.push(TerminalFailure {
            seq: flight.seq,
            subject: flight.subject,
            attempts: flight.attempts,
            reason,
            failed_at: Utc::now(),
        });

        // A terminal failure no longer blocks the cursor.
        let acked_high = state.acked_high;
        let moved = state.advance_cursor(acked_high);
        if moved {
            let cursor = state.cursor;
            self.checkpoints
                .save(&Self::checkpoint_key(id), Checkpoint::seq(cursor))
                .await?;
        }
        Ok(())
    }

    /// Current cursor of a consumer.
    pub async fn cursor(&self, id: &str) -> Result<u64> {
        let state = self.consumer(id).await?;
        let state = state.lock().await;
        Ok(state.cursor)
    }

    /// Terminal failures recorded for a consumer.
    pub async fn terminal_failures(&self, id: &str) -> Result<Vec<TerminalFailure>> {
        let state = self.consumer(id).await?;
        let state = state.lock().await;
        Ok(state.terminal.clone())
    }

    /// Configuration of a registered consumer.
    pub async fn config(&self, id: &str) -> Result<ConsumerConfig> {
        let state = self.consumer(id).await?;
        let state = state.lock().await;
        Ok(state.config.clone())
    }

    /// Status snapshot for one consumer, lag included.
    pub async fn snapshot(&self, id: &str) -> Result<ConsumerStatusSnapshot> {
        let state = self.consumer(id).await?;
        let state = state.lock().await;
        let head = self.log.head_seq(&state.config.stream).await;
        let lag = head.saturating_sub(state.cursor);
        Ok(ConsumerStatusSnapshot {
            id: state.config.id.clone(),
            kind: state.config.kind,
            stream: state.config.stream.clone(),
            cursor: state.cursor,
            lag,
            in_flight: state.in_flight.len(),
            pending_retry: state.pending_retry.len(),
            terminal_failures: state.terminal.len(),
            health: state.health.assess(Some(lag), &self.health_config),
        })
    }

    /// Registered consumer ids.
    pub async fn consumer_ids(&self) -> Vec<String> {
        self.consumers.read().await.keys().cloned().collect()
    }
}
