//! Push delivery loop
//!
//! One [`PushRunner`] per push consumer: pulls batches from the
//! dispatcher, invokes the sink, and settles each delivery by the
//! outcome. Retryable failures back off and redeliver without advancing
//! past the failing batch; fatal failures are isolated per message so a
//! poison record never stalls the consumer.

use crate::common::{Result, RetryConfig, RiffleError};
use crate::consumer::dispatch::{AckToken, Delivery, Dispatcher};
use crate::consumer::sink::{DeliveryOutcome, Sink};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Drives push delivery for one registered consumer.
pub struct PushRunner {
    consumer_id: String,
    dispatcher: Arc<Dispatcher>,
    sink: Arc<dyn Sink>,
    /// Backoff between retryable failures
    retry: RetryConfig,
    /// Idle poll interval when the log has nothing new
    poll_interval: Duration,
}

impl PushRunner {
    pub fn new(
        consumer_id: impl Into<String>,
        dispatcher: Arc<Dispatcher>,
        sink: Arc<dyn Sink>,
    ) -> Self {
        Self {
            consumer_id: consumer_id.into(),
            dispatcher,
            sink,
            retry: RetryConfig::default(),
            poll_interval: Duration::from_millis(250),
        }
    }

    /// Override the retry backoff policy.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Override the idle poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Run until shutdown. The consumer must already be registered with
    /// the dispatcher.
    pub async fn run(&self, shutdown: &mut broadcast::Receiver<()>) -> Result<()> {
        let config = self.dispatcher.config(&self.consumer_id).await?;
        info!(consumer = %self.consumer_id, ordered = config.ordered, "Push delivery starting");

        let mut backoff_attempt: u32 = 0;

        loop {
            if shutdown.try_recv().is_ok() {
                break;
            }

            let batch_size = if config.ordered {
                config.batch_size
            } else {
                config.max_in_flight
            };
            let batch = self.dispatcher.next_batch(&self.consumer_id, batch_size).await?;

            if batch.is_empty() {
                tokio::select! {
                    _ = tokio::time::sleep(self.poll_interval) => continue,
                    _ = shutdown.recv() => break,
                }
            }

            let settled = if config.ordered {
                self.deliver_ordered(batch, shutdown, &mut backoff_attempt).await?
            } else {
                self.deliver_unordered(batch).await?
            };
            if !settled {
                break;
            }
        }

        info!(consumer = %self.consumer_id, "Push delivery stopped");
        Ok(())
    }

    /// Deliver one batch in order. Returns `Ok(false)` when shutdown
    /// interrupted the backoff.
    async fn deliver_ordered(
        &self,
        batch: Vec<(Delivery, AckToken)>,
        shutdown: &mut broadcast::Receiver<()>,
        backoff_attempt: &mut u32,
    ) -> Result<bool> {
        let deliveries: Vec<Delivery> = batch.iter().map(|(d, _)| d.clone()).collect();

        match self.sink.deliver(&deliveries).await {
            DeliveryOutcome::Delivered => {
                for (_, token) in batch {
                    self.ack_settled(token).await?;
                }
                *backoff_attempt = 0;
                Ok(true)
            }

            DeliveryOutcome::Retryable(reason) => {
                // Return the whole batch for redelivery; the dispatcher
                // hands it back in seq order ahead of anything newer, and
                // its attempt cap turns persistent failure into terminal
                // records.
                debug!(consumer = %self.consumer_id, %reason, "Retryable delivery failure");
                for (_, token) in batch {
                    self.nack_settled(token).await?;
                }
                let delay = self.retry.delay_for_attempt(*backoff_attempt);
                *backoff_attempt = backoff_attempt.saturating_add(1);
                tokio::select! {
                    _ = tokio::time::sleep(delay) => Ok(true),
                    _ = shutdown.recv() => Ok(false),
                }
            }

            DeliveryOutcome::Fatal(reason) => {
                *backoff_attempt = 0;
                if batch.len() == 1 {
                    let (delivery, token) = batch.into_iter().next().expect("len checked");
                    warn!(
                        consumer = %self.consumer_id,
                        subject = %delivery.subject,
                        seq = delivery.seq,
                        %reason,
                        "Fatal delivery failure"
                    );
                    self.fail_settled(token, reason).await?;
                    return Ok(true);
                }

                // Isolate the poison message: deliver one at a time so
                // only the rejected record goes terminal.
                debug!(consumer = %self.consumer_id, %reason, "Fatal batch failure, isolating");
                for (delivery, token) in batch {
                    match self.sink.deliver(std::slice::from_ref(&delivery)).await {
                        DeliveryOutcome::Delivered => self.ack_settled(token).await?,
                        DeliveryOutcome::Retryable(_) => {
                            self.nack_settled(token).await?
                        }
                        DeliveryOutcome::Fatal(reason) => {
                            warn!(
                                consumer = %self.consumer_id,
                                subject = %delivery.subject,
                                seq = delivery.seq,
                                %reason,
                                "Fatal delivery failure"
                            );
                            self.fail_settled(token, reason).await?;
                        }
                    }
                }
                Ok(true)
            }
        }
    }

    /// Deliver a batch as concurrent single-message deliveries, bounded
    /// by the batch size the dispatcher already applied.
    async fn deliver_unordered(&self, batch: Vec<(Delivery, AckToken)>) -> Result<bool> {
        let mut tasks = JoinSet::new();
        for (delivery, token) in batch {
            let sink = self.sink.clone();
            tasks.spawn(async move {
                let outcome = sink.deliver(std::slice::from_ref(&delivery)).await;
                (delivery, token, outcome)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            let (delivery, token, outcome) = joined
                .map_err(|e| RiffleError::other(format!("delivery task panicked: {e}")))?;
            match outcome {
                DeliveryOutcome::Delivered => self.ack_settled(token).await?,
                DeliveryOutcome::Retryable(reason) => {
                    debug!(consumer = %self.consumer_id, seq = delivery.seq, %reason, "Retryable");
                    self.nack_settled(token).await?;
                }
                DeliveryOutcome::Fatal(reason) => {
                    warn!(
                        consumer = %self.consumer_id,
                        subject = %delivery.subject,
                        seq = delivery.seq,
                        %reason,
                        "Fatal delivery failure"
                    );
                    self.fail_settled(token, reason).await?;
                }
            }
        }
        Ok(true)
    }

    async fn ack_settled(&self, token: AckToken) -> Result<()> {
        match self.dispatcher.ack(&self.consumer_id, token).await {
            Ok(_) => Ok(()),
            // The delivery expired mid-flight and was re-queued; the
            // redelivery will settle it.
            Err(RiffleError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn nack_settled(&self, token: AckToken) -> Result<()> {
        match self.dispatcher.nack(&self.consumer_id, token).await {
            Ok(()) | Err(RiffleError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn fail_settled(&self, token: AckToken, reason: String) -> Result<()> {
        match self.dispatcher.fail(&self.consumer_id, token, reason).await {
            Ok(()) | Err(RiffleError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::CheckpointStore;
    use crate::consumer::dispatch::ConsumerConfig;
    use crate::log::MessageLog;
    use crate::subject::Subject;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;

    /// Sink scripted with a sequence of outcomes; records every call.
    struct ScriptedSink {
        script: Mutex<Vec<DeliveryOutcome>>,
        calls: Mutex<Vec<Vec<u64>>>,
    }

    impl ScriptedSink {
        fn new(script: Vec<DeliveryOutcome>) -> Self {
            Self {
                script: Mutex::new(script),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> Vec<Vec<u64>> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Sink for ScriptedSink {
        async fn deliver(&self, batch: &[Delivery]) -> DeliveryOutcome {
            self.calls
                .lock()
                .unwrap()
                .push(batch.iter().map(|d| d.seq).collect());
            let mut script = self.script.lock().unwrap();
            if script.is_empty() {
                DeliveryOutcome::Delivered
            } else {
                script.remove(0)
            }
        }
    }

    async fn fixture(config: ConsumerConfig, n: u64) -> (MessageLog, Arc<Dispatcher>) {
        let dir = tempfile::tempdir().unwrap();
        let checkpoints = Arc::new(
            CheckpointStore::with_options(dir.path(), false).await.unwrap(),
        );
        std::mem::forget(dir);
        let log = MessageLog::new();
        for i in 1..=n {
            log.append_or_update(
                "s",
                Subject::parse(&format!("db.public.users.{i}")).unwrap(),
                json!({"id": i}),
            )
            .await;
        }
        let dispatcher = Arc::new(Dispatcher::new(log.clone(), checkpoints));
        dispatcher.register(config).await.unwrap();
        (log, dispatcher)
    }

    fn shutdown_after(delay: Duration) -> broadcast::Receiver<()> {
        let (tx, rx) = broadcast::channel(1);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(());
        });
        rx
    }

    #[tokio::test]
    async fn test_delivers_and_acks_in_order() {
        let config = ConsumerConfig::builder("c", "s").build().unwrap();
        let (_log, dispatcher) = fixture(config, 3).await;
        let sink = Arc::new(ScriptedSink::new(vec![]));

        let runner = PushRunner::new("c", dispatcher.clone(), sink.clone())
            .with_poll_interval(Duration::from_millis(10));
        let mut shutdown = shutdown_after(Duration::from_millis(100));
        runner.run(&mut shutdown).await.unwrap();

        assert_eq!(sink.calls()[0], vec![1, 2, 3]);
        assert_eq!(dispatcher.cursor("c").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_retryable_retries_same_batch_in_order() {
        let config = ConsumerConfig::builder("c", "s").build().unwrap();
        let (_log, dispatcher) = fixture(config, 2).await;
        let sink = Arc::new(ScriptedSink::new(vec![
            DeliveryOutcome::Retryable("503".into()),
            DeliveryOutcome::Retryable("503".into()),
        ]));

        let retry = RetryConfig::builder()
            .base_delay(Duration::from_millis(1))
            .jitter(0.0)
            .build();
        let runner = PushRunner::new("c", dispatcher.clone(), sink.clone())
            .with_retry(retry)
            .with_poll_interval(Duration::from_millis(5));
        let mut shutdown = shutdown_after(Duration::from_millis(150));
        runner.run(&mut shutdown).await.unwrap();

        let calls = sink.calls();
        assert!(calls.len() >= 3);
        // The failing batch is redelivered whole and in order, never
        // skipped past
        assert_eq!(calls[0], vec![1, 2]);
        assert_eq!(calls[1], vec![1, 2]);
        assert_eq!(calls[2], vec![1, 2]);
        assert_eq!(dispatcher.cursor("c").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_fatal_isolates_poison_message() {
        let config = ConsumerConfig::builder("c", "s").build().unwrap();
        let (_log, dispatcher) = fixture(config, 3).await;
        // Batch fails fatally; per-message pass rejects only seq 2
        let sink = Arc::new(ScriptedSink::new(vec![
            DeliveryOutcome::Fatal("schema mismatch".into()),
            DeliveryOutcome::Delivered,
            DeliveryOutcome::Fatal("schema mismatch".into()),
            DeliveryOutcome::Delivered,
        ]));

        let runner = PushRunner::new("c", dispatcher.clone(), sink.clone())
            .with_poll_interval(Duration::from_millis(5));
        let mut shutdown = shutdown_after(Duration::from_millis(100));
        runner.run(&mut shutdown).await.unwrap();

        let calls = sink.calls();
        assert_eq!(calls[0], vec![1, 2, 3]);
        assert_eq!(&calls[1..4], &[vec![1], vec![2], vec![3]]);

        // Seq 2 is terminal, the rest acked; the consumer kept going
        let failures = dispatcher.terminal_failures("c").await.unwrap();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].seq, 2);
        assert_eq!(dispatcher.cursor("c").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_unordered_mode_settles_everything() {
        let config = ConsumerConfig::builder("c", "s")
            .ordered(false)
            .max_in_flight(4)
            .build()
            .unwrap();
        let (_log, dispatcher) = fixture(config, 8).await;
        let sink = Arc::new(ScriptedSink::new(vec![]));

        let runner = PushRunner::new("c", dispatcher.clone(), sink.clone())
            .with_poll_interval(Duration::from_millis(5));
        let mut shutdown = shutdown_after(Duration::from_millis(150));
        runner.run(&mut shutdown).await.unwrap();

        // Window bound respected per round
        assert!(sink.calls().iter().all(|c| c.len() == 1));
        assert_eq!(dispatcher.cursor("c").await.unwrap(), 8);
    }
}
