//! Supervision and recovery
//!
//! The [`Supervisor`] owns one worker per active slot and one per push
//! consumer, keyed by stable identifiers. Start and stop are idempotent:
//! a duplicate start answers `AlreadyRunning` instead of spawning a
//! competing worker, and stopping an unknown unit is a no-op.
//!
//! A worker that panics is restarted with backoff; on restart the slot
//! pipeline resumes from its persisted LSN and dispatch from each
//! consumer's persisted cursor, both via the shared
//! [`CheckpointStore`]. A worker that returns an error has already
//! exhausted its own retries (or hit a data-integrity failure) and is
//! left stopped with the error recorded for the operator.

use crate::common::{CheckpointStore, Result, RetryConfig, RiffleError};
use crate::consumer::{ConsumerConfig, ConsumerKind, ConsumerStatusSnapshot, Dispatcher, PushRunner, Sink};
use crate::log::MessageLog;
use crate::postgres::{SlotConfig, SlotStatus, SlotStatusSnapshot, SlotWorker};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// How long a graceful stop waits before aborting the worker task.
const STOP_GRACE: Duration = Duration::from_secs(30);

struct Worker {
    stop: broadcast::Sender<()>,
    stopping: Arc<AtomicBool>,
    join: JoinHandle<()>,
    restarts: Arc<AtomicU64>,
    last_error: Arc<RwLock<Option<String>>>,
    slot_status: Option<Arc<SlotStatus>>,
}

/// Report on one supervised unit.
#[derive(Debug, Clone, serde::Serialize)]
pub struct WorkerReport {
    pub running: bool,
    pub restarts: u64,
    pub last_error: Option<String>,
}

/// Full status snapshot for the introspection surface.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SupervisorStatus {
    pub slots: HashMap<String, (WorkerReport, SlotStatusSnapshot)>,
    pub consumers: HashMap<String, ConsumerStatusSnapshot>,
}

/// The supervision tree root.
pub struct Supervisor {
    log: MessageLog,
    checkpoints: Arc<CheckpointStore>,
    dispatcher: Arc<Dispatcher>,
    workers: RwLock<HashMap<String, Worker>>,
    restart: RetryConfig,
}

impl Supervisor {
    pub fn new(log: MessageLog, checkpoints: Arc<CheckpointStore>) -> Self {
        let dispatcher = Arc::new(Dispatcher::new(log.clone(), checkpoints.clone()));
        Self {
            log,
            checkpoints,
            dispatcher,
            workers: RwLock::new(HashMap::new()),
            restart: RetryConfig::builder()
                .max_retries(-1)
                .base_delay(Duration::from_secs(1))
                .max_delay(Duration::from_secs(60))
                .build(),
        }
    }

    /// The shared message log.
    pub fn log(&self) -> MessageLog {
        self.log.clone()
    }

    /// The dispatch engine (for pull consumers and status queries).
    pub fn dispatcher(&self) -> Arc<Dispatcher> {
        self.dispatcher.clone()
    }

    /// Start the ingestion pipeline for a slot.
    ///
    /// Keyed by the slot name; a second start while the first worker is
    /// alive returns [`RiffleError::AlreadyRunning`].
    pub async fn start_slot(&self, config: SlotConfig) -> Result<()> {
        let key = format!("slot:{}", config.slot_name);
        let mut workers = self.workers.write().await;
        self.ensure_absent(&mut workers, &key)?;

        let worker = Arc::new(SlotWorker::new(
            config,
            self.log.clone(),
            self.checkpoints.clone(),
        ));
        let slot_status = worker.status();

        let (stop_tx, _) = broadcast::channel(1);
        let stopping = Arc::new(AtomicBool::new(false));
        let restarts = Arc::new(AtomicU64::new(0));
        let last_error = Arc::new(RwLock::new(None));

        let join = tokio::spawn(supervise(
            key.clone(),
            stop_tx.clone(),
            stopping.clone(),
            restarts.clone(),
            last_error.clone(),
            self.restart.clone(),
            move |mut stop| {
                let worker = worker.clone();
                async move { worker.run(&mut stop).await }
            },
        ));

        info!(unit = %key, "Started");
        workers.insert(
            key,
            Worker {
                stop: stop_tx,
                stopping,
                join,
                restarts,
                last_error,
                slot_status: Some(slot_status),
            },
        );
        Ok(())
    }

    /// Register a consumer and, for push kinds, start its delivery loop.
    ///
    /// Pull consumers only need dispatch state; push consumers get a
    /// supervised [`PushRunner`] driving the given sink.
    pub async fn start_consumer(
        &self,
        config: ConsumerConfig,
        sink: Option<Arc<dyn Sink>>,
    ) -> Result<()> {
        let key = format!("consumer:{}", config.id);
        let is_push = !matches!(config.kind, ConsumerKind::Pull);
        if is_push && sink.is_none() {
            return Err(RiffleError::config(format!(
                "push consumer {} needs a sink",
                config.id
            )));
        }

        let mut workers = self.workers.write().await;
        self.ensure_absent(&mut workers, &key)?;

        let consumer_id = config.id.clone();
        self.dispatcher.register(config).await?;

        let Some(sink) = sink.filter(|_| is_push) else {
            return Ok(()); // pull consumer: dispatch state only
        };

        let (stop_tx, _) = broadcast::channel(1);
        let stopping = Arc::new(AtomicBool::new(false));
        let restarts = Arc::new(AtomicU64::new(0));
        let last_error = Arc::new(RwLock::new(None));

        let dispatcher = self.dispatcher.clone();
        let runner = Arc::new(PushRunner::new(consumer_id, dispatcher, sink));

        let join = tokio::spawn(supervise(
            key.clone(),
            stop_tx.clone(),
            stopping.clone(),
            restarts.clone(),
            last_error.clone(),
            self.restart.clone(),
            move |mut stop| {
                let runner = runner.clone();
                async move { runner.run(&mut stop).await }
            },
        ));

        info!(unit = %key, "Started");
        workers.insert(
            key,
            Worker {
                stop: stop_tx,
                stopping,
                join,
                restarts,
                last_error,
                slot_status: None,
            },
        );
        Ok(())
    }

    /// Gracefully stop a slot worker. Stopping an unknown or finished
    /// slot is a no-op.
    pub async fn stop_slot(&self, slot_name: &str) -> Result<()> {
        self.stop_unit(&format!("slot:{slot_name}")).await
    }

    /// Gracefully stop a consumer and drop its dispatch state (the
    /// persisted cursor is kept for resume).
    pub async fn stop_consumer(&self, consumer_id: &str) -> Result<()> {
        self.stop_unit(&format!("consumer:{consumer_id}")).await?;
        match self.dispatcher.deregister(consumer_id).await {
            Ok(()) | Err(RiffleError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Status of every supervised unit plus every registered consumer.
    pub async fn status(&self) -> SupervisorStatus {
        let workers = self.workers.read().await;
        let mut slots = HashMap::new();
        for (key, worker) in workers.iter() {
            if let Some(slot_status) = &worker.slot_status {
                let name = key.trim_start_matches("slot:").to_string();
                let report = WorkerReport {
                    running: !worker.join.is_finished(),
                    restarts: worker.restarts.load(Ordering::Relaxed),
                    last_error: worker.last_error.read().await.clone(),
                };
                slots.insert(name, (report, slot_status.snapshot().await));
            }
        }
        drop(workers);

        let mut consumers = HashMap::new();
        for id in self.dispatcher.consumer_ids().await {
            if let Ok(snapshot) = self.dispatcher.snapshot(&id).await {
                consumers.insert(id, snapshot);
            }
        }

        SupervisorStatus { slots, consumers }
    }

    /// Stop every supervised unit.
    pub async fn shutdown(&self) {
        let keys: Vec<String> = self.workers.read().await.keys().cloned().collect();
        for key in keys {
            if let Err(e) = self.stop_unit(&key).await {
                warn!(unit = %key, "Stop failed: {e}");
            }
        }
    }

    fn ensure_absent(&self, workers: &mut HashMap<String, Worker>, key: &str) -> Result<()> {
        if let Some(existing) = workers.get(key) {
            if existing.join.is_finished() {
                workers.remove(key);
            } else {
                return Err(RiffleError::AlreadyRunning(key.to_string()));
            }
        }
        Ok(())
    }

    async fn stop_unit(&self, key: &str) -> Result<()> {
        let Some(worker) = self.workers.write().await.remove(key) else {
            return Ok(());
        };

        worker.stopping.store(true, Ordering::Release);
        let _ = worker.stop.send(());

        // Graceful drain: let the in-flight operation finish before the
        // task exits; abort only if it overstays.
        let abort = worker.join.abort_handle();
        match tokio::time::timeout(STOP_GRACE, worker.join).await {
            Ok(_) => info!(unit = %key, "Stopped"),
            Err(_) => {
                warn!(unit = %key, "Stop timed out, aborting");
                abort.abort();
            }
        }
        Ok(())
    }
}

/// Supervising wrapper: runs the unit, restarting on panic with backoff.
///
/// A clean return ends supervision; an error return records the failure
/// and ends supervision (the worker has already applied its own retry
/// policy to transient failures, so what reaches here is fatal).
async fn supervise<F, Fut>(
    key: String,
    stop_tx: broadcast::Sender<()>,
    stopping: Arc<AtomicBool>,
    restarts: Arc<AtomicU64>,
    last_error: Arc<RwLock<Option<String>>>,
    restart: RetryConfig,
    run: F,
) where
    F: Fn(broadcast::Receiver<()>) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = Result<()>> + Send + 'static,
{
    let mut attempt: u32 = 0;

    loop {
        let stop_rx = stop_tx.subscribe();
        let unit = tokio::spawn(run(stop_rx));

        match unit.await {
            Ok(Ok(())) => break,
            Ok(Err(e)) => {
                error!(unit = %key, "Worker failed: {e}");
                *last_error.write().await = Some(e.to_string());
                break;
            }
            Err(join_err) => {
                let reason = if join_err.is_panic() {
                    "panicked"
                } else {
                    "was cancelled"
                };
                *last_error.write().await = Some(format!("worker {reason}"));

                if stopping.load(Ordering::Acquire) {
                    break;
                }
                if !restart.should_retry(attempt) {
                    error!(unit = %key, "Worker {reason}; restart attempts exhausted");
                    break;
                }

                let delay = restart.delay_for_attempt(attempt);
                attempt += 1;
                restarts.fetch_add(1, Ordering::Relaxed);
                warn!(
                    unit = %key,
                    delay_ms = delay.as_millis() as u64,
                    "Worker {reason}, restarting"
                );

                // Subscribe before re-checking the flag so a stop racing
                // with the backoff is never missed.
                let mut stop_rx = stop_tx.subscribe();
                if stopping.load(Ordering::Acquire) {
                    break;
                }
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = stop_rx.recv() => break,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consumer::StdoutSink;
    use crate::subject::Subject;
    use serde_json::json;

    async fn supervisor() -> Arc<Supervisor> {
        let dir = tempfile::tempdir().unwrap();
        let checkpoints = Arc::new(
            CheckpointStore::with_options(dir.path(), false).await.unwrap(),
        );
        std::mem::forget(dir);
        Arc::new(Supervisor::new(MessageLog::new(), checkpoints))
    }

    fn slot_config(name: &str) -> SlotConfig {
        SlotConfig::builder()
            // Reserved TEST-NET address: connects fail fast or hang, the
            // worker just retries in the background
            .connection_string("postgres://u:p@192.0.2.1:5432/mydb")
            .slot_name(name)
            .publication("pub")
            .stream("s")
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_duplicate_slot_start_is_already_running() {
        let sup = supervisor().await;
        sup.start_slot(slot_config("s1")).await.unwrap();
        assert!(matches!(
            sup.start_slot(slot_config("s1")).await.unwrap_err(),
            RiffleError::AlreadyRunning(_)
        ));
        // A different slot is fine
        sup.start_slot(slot_config("s2")).await.unwrap();
        sup.shutdown().await;
    }

    #[tokio::test]
    async fn test_stop_unknown_unit_is_noop() {
        let sup = supervisor().await;
        sup.stop_slot("ghost").await.unwrap();
        sup.stop_consumer("ghost").await.unwrap();
    }

    #[tokio::test]
    async fn test_pull_consumer_registers_dispatch_only() {
        let sup = supervisor().await;
        let config = ConsumerConfig::builder("audit", "s").build().unwrap();
        sup.start_consumer(config.clone(), None).await.unwrap();

        // Usable through the dispatcher
        sup.log()
            .append_or_update("s", Subject::parse("db.public.users.1").unwrap(), json!({}))
            .await;
        let batch = sup.dispatcher().next_batch("audit", 10).await.unwrap();
        assert_eq!(batch.len(), 1);

        // Duplicate start rejected
        assert!(matches!(
            sup.start_consumer(config, None).await.unwrap_err(),
            RiffleError::AlreadyRunning(_)
        ));

        sup.stop_consumer("audit").await.unwrap();
        // Stop released the id: restart is allowed
        let config = ConsumerConfig::builder("audit", "s").build().unwrap();
        sup.start_consumer(config, None).await.unwrap();
        sup.shutdown().await;
    }

    #[tokio::test]
    async fn test_push_consumer_requires_sink() {
        let sup = supervisor().await;
        let config = ConsumerConfig::builder("hook", "s")
            .kind(ConsumerKind::PushHttp)
            .build()
            .unwrap();
        assert!(sup.start_consumer(config, None).await.is_err());
    }

    #[tokio::test]
    async fn test_push_consumer_lifecycle() {
        let sup = supervisor().await;
        let config = ConsumerConfig::builder("hook", "s")
            .kind(ConsumerKind::PushHttp)
            .build()
            .unwrap();
        sup.start_consumer(config, Some(Arc::new(StdoutSink))).await.unwrap();

        let status = sup.status().await;
        assert!(status.consumers.contains_key("hook"));

        sup.stop_consumer("hook").await.unwrap();
        let status = sup.status().await;
        assert!(!status.consumers.contains_key("hook"));
    }

    #[tokio::test]
    async fn test_status_reports_slots() {
        let sup = supervisor().await;
        sup.start_slot(slot_config("s1")).await.unwrap();

        let status = sup.status().await;
        let (report, snapshot) = status.slots.get("s1").unwrap();
        assert!(report.running);
        assert_eq!(report.restarts, 0);
        assert_eq!(snapshot.last_committed_lsn, "0/0");

        sup.shutdown().await;
    }
}
