//! Asynchronous audit logger.
//!
//! Decouples persistence from the request path. Producers place events on a
//! bounded queue; a single background worker drains the queue in batches
//! and writes them to an [`AuditSink`]. With one worker and a FIFO queue,
//! events from the same producer are persisted in enqueue order.
//!
//! ## Backpressure
//!
//! When the queue is full, [`EnqueuePolicy::FailFast`] rejects immediately
//! and [`EnqueuePolicy::Block`] waits up to a bounded timeout. Either way a
//! rejected event is reported to the caller as a queue-full error; nothing
//! is dropped silently.
//!
//! ## Shutdown
//!
//! [`AuditLogger::stop`] refuses new events, lets the worker drain what is
//! queued, and reports whether the drain finished within the timeout.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{AuditError, AuditResult, QueueErrorKind};

use super::event::AuditEvent;
use super::sink::AuditSink;
use super::truncate::{DEFAULT_MAX_OBJECT_BYTES, MIN_MAX_OBJECT_BYTES};

/// What `enqueue` does when the queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueuePolicy {
    /// Reject immediately with a queue-full error.
    FailFast,
    /// Wait up to `timeout` for a free slot, then reject.
    Block { timeout: Duration },
}

/// Tuning for the logger queue and worker.
#[derive(Debug, Clone)]
pub struct LoggerConfig {
    /// Maximum number of queued events.
    pub queue_capacity: usize,
    /// Behavior when the queue is full.
    pub enqueue_policy: EnqueuePolicy,
    /// Maximum events handed to the sink in one write.
    pub batch_size: usize,
    /// Additional attempts after a failed write.
    pub max_retries: u32,
    /// Pause between attempts.
    pub retry_backoff: Duration,
    /// Largest serialized snapshot admitted by `enqueue`.
    pub max_object_bytes: usize,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            enqueue_policy: EnqueuePolicy::FailFast,
            batch_size: 64,
            max_retries: 2,
            retry_backoff: Duration::from_millis(100),
            max_object_bytes: DEFAULT_MAX_OBJECT_BYTES,
        }
    }
}

/// Observable state of the logger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoggerState {
    /// Nothing queued and the worker is waiting.
    Idle,
    /// Accepting events with free queue capacity.
    Accepting,
    /// Queue at capacity.
    Saturated,
    /// Stop requested; the worker is flushing what is left.
    Draining,
    /// Worker has terminated.
    Stopped,
}

/// Logger counters for monitoring.
#[derive(Debug, Default)]
pub struct LoggerMetrics {
    /// Events accepted onto the queue.
    pub enqueued: AtomicU64,
    /// Events refused by `enqueue` (full, stopped or invalid).
    pub rejected: AtomicU64,
    /// Events handed to the sink successfully.
    pub persisted: AtomicU64,
    /// Events dropped after exhausting retries.
    pub failed: AtomicU64,
}

impl LoggerMetrics {
    pub fn enqueued(&self) -> u64 {
        self.enqueued.load(Ordering::Relaxed)
    }

    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    pub fn persisted(&self) -> u64 {
        self.persisted.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }
}

/// Bounded-queue audit logger with one background worker.
pub struct AuditLogger {
    sender: mpsc::Sender<AuditEvent>,
    shutdown: watch::Sender<bool>,
    worker: Mutex<Option<JoinHandle<()>>>,
    accepting: AtomicBool,
    busy: Arc<AtomicBool>,
    finished: Arc<AtomicBool>,
    /// Drain result, published once by the first `stop`.
    outcome: watch::Sender<Option<bool>>,
    metrics: Arc<LoggerMetrics>,
    config: LoggerConfig,
}

impl AuditLogger {
    /// Create the queue and spawn the worker on the current tokio runtime.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Arguments
    ///
    /// * `sink` - Destination the worker writes to
    /// * `config` - Queue and worker tuning; zero sizes are raised to one
    pub fn start(sink: Arc<dyn AuditSink>, config: LoggerConfig) -> Arc<Self> {
        let config = LoggerConfig {
            queue_capacity: config.queue_capacity.max(1),
            batch_size: config.batch_size.max(1),
            max_object_bytes: config.max_object_bytes.max(MIN_MAX_OBJECT_BYTES),
            ..config
        };

        let (sender, receiver) = mpsc::channel(config.queue_capacity);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let metrics = Arc::new(LoggerMetrics::default());
        let busy = Arc::new(AtomicBool::new(false));
        let finished = Arc::new(AtomicBool::new(false));

        let worker = Worker {
            receiver,
            sink,
            metrics: Arc::clone(&metrics),
            busy: Arc::clone(&busy),
            batch_size: config.batch_size,
            max_retries: config.max_retries,
            retry_backoff: config.retry_backoff,
        };
        let finished_flag = Arc::clone(&finished);
        let handle = tokio::spawn(async move {
            worker.run(shutdown_rx).await;
            finished_flag.store(true, Ordering::Release);
        });

        info!(
            capacity = config.queue_capacity,
            batch_size = config.batch_size,
            policy = ?config.enqueue_policy,
            "Audit logger started"
        );

        Arc::new(Self {
            sender,
            shutdown,
            worker: Mutex::new(Some(handle)),
            accepting: AtomicBool::new(true),
            busy,
            finished,
            outcome: watch::channel(None).0,
            metrics,
            config,
        })
    }

    /// Enqueue an event according to the configured policy.
    ///
    /// Never performs I/O; the only wait is for a queue slot under
    /// [`EnqueuePolicy::Block`].
    ///
    /// # Errors
    ///
    /// - Validation error if the event breaks an invariant
    /// - Queue error if the logger is stopped or the queue stays full
    pub async fn enqueue(&self, event: AuditEvent) -> AuditResult<()> {
        match self.config.enqueue_policy {
            EnqueuePolicy::FailFast => self.try_enqueue(event),
            EnqueuePolicy::Block { timeout } => {
                self.admit(&event)?;
                match self.sender.send_timeout(event, timeout).await {
                    Ok(()) => self.accepted(),
                    Err(mpsc::error::SendTimeoutError::Timeout(_)) => self.reject(QueueErrorKind::Full {
                        capacity: self.config.queue_capacity,
                    }),
                    Err(mpsc::error::SendTimeoutError::Closed(_)) => {
                        self.reject(QueueErrorKind::Closed)
                    }
                }
            }
        }
    }

    /// Enqueue without waiting, regardless of the configured policy.
    pub fn try_enqueue(&self, event: AuditEvent) -> AuditResult<()> {
        self.admit(&event)?;
        match self.sender.try_send(event) {
            Ok(()) => self.accepted(),
            Err(mpsc::error::TrySendError::Full(_)) => self.reject(QueueErrorKind::Full {
                capacity: self.config.queue_capacity,
            }),
            Err(mpsc::error::TrySendError::Closed(_)) => self.reject(QueueErrorKind::Closed),
        }
    }

    fn admit(&self, event: &AuditEvent) -> AuditResult<()> {
        if let Err(e) = event.validate_within(self.config.max_object_bytes) {
            self.metrics.rejected.fetch_add(1, Ordering::Relaxed);
            return Err(e);
        }
        if !self.accepting.load(Ordering::Acquire) {
            return self.reject(QueueErrorKind::Closed);
        }
        Ok(())
    }

    fn accepted(&self) -> AuditResult<()> {
        self.metrics.enqueued.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn reject(&self, kind: QueueErrorKind) -> AuditResult<()> {
        self.metrics.rejected.fetch_add(1, Ordering::Relaxed);
        Err(AuditError::Queue { kind })
    }

    /// Stop accepting events and drain the queue within `timeout`.
    ///
    /// Returns `true` if every queued event was handed to the sink before
    /// the deadline. On timeout the worker is aborted and `false` is
    /// returned. Concurrent and later calls wait up to their own `timeout`
    /// for the first call to finish and return its outcome.
    pub async fn stop(&self, timeout: Duration) -> bool {
        self.accepting.store(false, Ordering::Release);

        let handle = self
            .worker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let Some(mut handle) = handle else {
            return self.stop_outcome(timeout).await;
        };

        info!(pending = self.pending(), "Stopping audit logger, draining queue");
        let _ = self.shutdown.send(true);

        let drained = match tokio::time::timeout(timeout, &mut handle).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                error!(error = %e, "Audit logger worker terminated abnormally");
                false
            }
            Err(_) => {
                warn!(
                    timeout_ms = timeout.as_millis() as u64,
                    pending = self.pending(),
                    "Audit logger drain timed out, remaining events dropped"
                );
                handle.abort();
                false
            }
        };

        self.finished.store(true, Ordering::Release);
        self.outcome.send_replace(Some(drained));
        info!(
            drained = drained,
            persisted = self.metrics.persisted(),
            failed = self.metrics.failed(),
            "Audit logger stopped"
        );
        drained
    }

    async fn stop_outcome(&self, timeout: Duration) -> bool {
        let mut outcome = self.outcome.subscribe();
        let drained = match tokio::time::timeout(timeout, outcome.wait_for(Option::is_some)).await {
            Ok(Ok(drained)) => *drained == Some(true),
            Ok(Err(_)) | Err(_) => false,
        };
        drained
    }

    /// Enqueue behavior when the queue is full.
    pub fn policy(&self) -> EnqueuePolicy {
        self.config.enqueue_policy
    }

    /// Number of events waiting in the queue.
    pub fn pending(&self) -> usize {
        self.sender.max_capacity() - self.sender.capacity()
    }

    /// Configured queue capacity.
    pub fn capacity(&self) -> usize {
        self.config.queue_capacity
    }

    pub fn state(&self) -> LoggerState {
        if self.finished.load(Ordering::Acquire) {
            return LoggerState::Stopped;
        }
        if !self.accepting.load(Ordering::Acquire) {
            return LoggerState::Draining;
        }
        let pending = self.pending();
        if pending >= self.config.queue_capacity {
            LoggerState::Saturated
        } else if pending == 0 && !self.busy.load(Ordering::Acquire) {
            LoggerState::Idle
        } else {
            LoggerState::Accepting
        }
    }

    pub fn metrics(&self) -> Arc<LoggerMetrics> {
        Arc::clone(&self.metrics)
    }
}

/// Background task owning the receiving end of the queue.
struct Worker {
    receiver: mpsc::Receiver<AuditEvent>,
    sink: Arc<dyn AuditSink>,
    metrics: Arc<LoggerMetrics>,
    busy: Arc<AtomicBool>,
    batch_size: usize,
    max_retries: u32,
    retry_backoff: Duration,
}

impl Worker {
    async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        debug!("Audit worker running");

        loop {
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                received = self.receiver.recv() => {
                    match received {
                        Some(first) => {
                            let batch = self.fill_batch(first);
                            self.persist(batch).await;
                        }
                        None => return,
                    }
                }
            }
        }

        // Refuse further sends and flush what is already queued.
        self.receiver.close();
        while let Some(first) = self.receiver.recv().await {
            let batch = self.fill_batch(first);
            self.persist(batch).await;
        }
        debug!("Audit worker drained");
    }

    fn fill_batch(&mut self, first: AuditEvent) -> Vec<AuditEvent> {
        self.busy.store(true, Ordering::Release);
        let mut batch = Vec::with_capacity(self.batch_size);
        batch.push(first);
        while batch.len() < self.batch_size {
            match self.receiver.try_recv() {
                Ok(event) => batch.push(event),
                Err(_) => break,
            }
        }
        batch
    }

    async fn persist(&self, mut batch: Vec<AuditEvent>) {
        let now = Utc::now();
        for event in batch.iter_mut() {
            event.mark_persisted(now);
        }

        if batch.len() > 1 && self.sink.supports_batch() {
            match self.save_batch_with_retry(&batch).await {
                Ok(()) => {
                    self.metrics
                        .persisted
                        .fetch_add(batch.len() as u64, Ordering::Relaxed);
                }
                Err(e) => {
                    warn!(
                        error = %e,
                        size = batch.len(),
                        "Batch write failed, falling back to single writes"
                    );
                    for event in &batch {
                        self.persist_one(event).await;
                    }
                }
            }
        } else {
            for event in &batch {
                self.persist_one(event).await;
            }
        }

        self.busy.store(false, Ordering::Release);
    }

    async fn persist_one(&self, event: &AuditEvent) {
        let mut attempt = 0;
        loop {
            match self.sink.save(event).await {
                Ok(()) => {
                    self.metrics.persisted.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                Err(e) if attempt < self.max_retries => {
                    attempt += 1;
                    debug!(
                        error = %e,
                        attempt = attempt,
                        request_id = %event.request_id(),
                        "Audit write failed, retrying"
                    );
                    tokio::time::sleep(self.retry_backoff).await;
                }
                Err(e) => {
                    self.metrics.failed.fetch_add(1, Ordering::Relaxed);
                    error!(
                        error = %e,
                        event_id = %event.id(),
                        request_id = %event.request_id(),
                        action = %event.action(),
                        "Dropping audit event after failed writes"
                    );
                    return;
                }
            }
        }
    }

    async fn save_batch_with_retry(&self, batch: &[AuditEvent]) -> AuditResult<()> {
        let mut attempt = 0;
        loop {
            match self.sink.save_batch(batch).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < self.max_retries => {
                    attempt += 1;
                    debug!(error = %e, attempt = attempt, "Audit batch write failed, retrying");
                    tokio::time::sleep(self.retry_backoff).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::event::{Action, ResourceInfo};
    use crate::audit::sink::MemoryAuditSink;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    fn event(resource: &str) -> AuditEvent {
        AuditEvent::builder(Action::Created)
            .resource(ResourceInfo::new(resource, ""))
            .build()
            .unwrap()
    }

    /// Sink that blocks every write until released.
    struct GatedSink {
        gate: tokio::sync::Semaphore,
        inner: MemoryAuditSink,
    }

    #[async_trait]
    impl AuditSink for GatedSink {
        async fn save(&self, event: &AuditEvent) -> AuditResult<()> {
            let permit = self.gate.acquire().await.map_err(|e| AuditError::Persistence {
                message: e.to_string(),
            })?;
            permit.forget();
            self.inner.save(event).await
        }
    }

    /// Sink failing the first `failures` writes.
    struct FlakySink {
        failures: AtomicUsize,
        calls: AtomicUsize,
        inner: MemoryAuditSink,
    }

    #[async_trait]
    impl AuditSink for FlakySink {
        async fn save(&self, event: &AuditEvent) -> AuditResult<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.failures.load(Ordering::SeqCst) > 0 {
                self.failures.fetch_sub(1, Ordering::SeqCst);
                return Err(AuditError::Persistence {
                    message: "store unavailable".to_string(),
                });
            }
            self.inner.save(event).await
        }
    }

    fn fast_retry_config() -> LoggerConfig {
        LoggerConfig {
            retry_backoff: Duration::from_millis(1),
            ..LoggerConfig::default()
        }
    }

    #[tokio::test]
    async fn test_enqueue_and_drain() {
        let sink = Arc::new(MemoryAuditSink::default());
        let logger = AuditLogger::start(sink.clone(), LoggerConfig::default());

        for name in ["a", "b", "c"] {
            logger.enqueue(event(name)).await.unwrap();
        }
        assert!(logger.stop(Duration::from_secs(5)).await);

        let stored: Vec<String> = sink
            .events()
            .iter()
            .map(|e| e.resource_type().to_string())
            .collect();
        assert_eq!(stored, vec!["a", "b", "c"]);
        assert!(sink.events().iter().all(|e| e.created_at().is_some()));
        assert_eq!(logger.metrics().persisted(), 3);
        assert_eq!(logger.state(), LoggerState::Stopped);
    }

    #[tokio::test]
    async fn test_fail_fast_when_full() {
        let sink = Arc::new(GatedSink {
            gate: tokio::sync::Semaphore::new(0),
            inner: MemoryAuditSink::default(),
        });
        let logger = AuditLogger::start(
            sink.clone(),
            LoggerConfig {
                queue_capacity: 2,
                batch_size: 1,
                ..LoggerConfig::default()
            },
        );

        // The worker takes the first event and blocks on the gate.
        logger.try_enqueue(event("first")).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        logger.try_enqueue(event("q1")).unwrap();
        logger.try_enqueue(event("q2")).unwrap();
        assert_eq!(logger.state(), LoggerState::Saturated);

        let err = logger.try_enqueue(event("overflow")).unwrap_err();
        assert!(err.is_queue_full());
        assert_eq!(logger.metrics().rejected(), 1);

        sink.gate.add_permits(10);
        assert!(logger.stop(Duration::from_secs(5)).await);
        assert_eq!(sink.inner.len(), 3);
    }

    #[tokio::test]
    async fn test_block_policy_times_out() {
        let sink = Arc::new(GatedSink {
            gate: tokio::sync::Semaphore::new(0),
            inner: MemoryAuditSink::default(),
        });
        let logger = AuditLogger::start(
            sink.clone(),
            LoggerConfig {
                queue_capacity: 1,
                batch_size: 1,
                enqueue_policy: EnqueuePolicy::Block {
                    timeout: Duration::from_millis(20),
                },
                ..LoggerConfig::default()
            },
        );

        logger.enqueue(event("first")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        logger.enqueue(event("queued")).await.unwrap();

        let err = logger.enqueue(event("late")).await.unwrap_err();
        assert!(err.is_queue_full());

        sink.gate.add_permits(10);
        assert!(logger.stop(Duration::from_secs(5)).await);
    }

    #[tokio::test]
    async fn test_enqueue_after_stop_is_closed() {
        let logger = AuditLogger::start(
            Arc::new(MemoryAuditSink::default()),
            LoggerConfig::default(),
        );
        assert!(logger.stop(Duration::from_secs(1)).await);
        let err = logger.try_enqueue(event("late")).unwrap_err();
        assert!(matches!(
            err,
            AuditError::Queue {
                kind: QueueErrorKind::Closed
            }
        ));
        // Second stop reports the first outcome.
        assert!(logger.stop(Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn test_retry_then_success() {
        let sink = Arc::new(FlakySink {
            failures: AtomicUsize::new(2),
            calls: AtomicUsize::new(0),
            inner: MemoryAuditSink::default(),
        });
        let logger = AuditLogger::start(sink.clone(), fast_retry_config());

        logger.enqueue(event("retried")).await.unwrap();
        assert!(logger.stop(Duration::from_secs(5)).await);

        assert_eq!(sink.calls.load(Ordering::SeqCst), 3);
        assert_eq!(sink.inner.len(), 1);
        assert_eq!(logger.metrics().failed(), 0);
    }

    #[tokio::test]
    async fn test_failed_event_dropped_and_pipeline_continues() {
        let sink = Arc::new(FlakySink {
            failures: AtomicUsize::new(3),
            calls: AtomicUsize::new(0),
            inner: MemoryAuditSink::default(),
        });
        let logger = AuditLogger::start(
            sink.clone(),
            LoggerConfig {
                batch_size: 1,
                ..fast_retry_config()
            },
        );

        logger.enqueue(event("poison")).await.unwrap();
        logger.enqueue(event("healthy")).await.unwrap();
        assert!(logger.stop(Duration::from_secs(5)).await);

        let events = sink.inner.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].resource_type(), "healthy");
        assert_eq!(logger.metrics().failed(), 1);
        assert_eq!(logger.metrics().persisted(), 1);
    }

    #[tokio::test]
    async fn test_stop_timeout_reports_incomplete_drain() {
        let sink = Arc::new(GatedSink {
            gate: tokio::sync::Semaphore::new(0),
            inner: MemoryAuditSink::default(),
        });
        let logger = AuditLogger::start(sink.clone(), LoggerConfig::default());

        logger.enqueue(event("stuck")).await.unwrap();
        assert!(!logger.stop(Duration::from_millis(50)).await);
        assert!(!logger.stop(Duration::from_millis(50)).await);
    }

    #[tokio::test]
    async fn test_concurrent_stop_waits_for_drain() {
        let sink = Arc::new(GatedSink {
            gate: tokio::sync::Semaphore::new(0),
            inner: MemoryAuditSink::default(),
        });
        let logger = AuditLogger::start(sink.clone(), LoggerConfig::default());
        for name in ["a", "b", "c"] {
            logger.enqueue(event(name)).await.unwrap();
        }

        let first = tokio::spawn({
            let logger = Arc::clone(&logger);
            async move { logger.stop(Duration::from_secs(5)).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        let second = tokio::spawn({
            let logger = Arc::clone(&logger);
            async move { logger.stop(Duration::from_secs(5)).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!second.is_finished());

        sink.gate.add_permits(10);
        assert!(first.await.unwrap());
        assert!(second.await.unwrap());
        assert_eq!(sink.inner.len(), 3);
    }

    #[tokio::test]
    async fn test_late_stop_times_out_while_first_drains() {
        let sink = Arc::new(GatedSink {
            gate: tokio::sync::Semaphore::new(0),
            inner: MemoryAuditSink::default(),
        });
        let logger = AuditLogger::start(sink.clone(), LoggerConfig::default());
        logger.enqueue(event("slow")).await.unwrap();

        let first = tokio::spawn({
            let logger = Arc::clone(&logger);
            async move { logger.stop(Duration::from_secs(5)).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!logger.stop(Duration::from_millis(10)).await);

        sink.gate.add_permits(1);
        assert!(first.await.unwrap());
        assert!(logger.stop(Duration::from_millis(10)).await);
    }

    #[tokio::test]
    async fn test_admission_uses_configured_ceiling() {
        let sink = Arc::new(MemoryAuditSink::default());
        let logger = AuditLogger::start(
            sink.clone(),
            LoggerConfig {
                max_object_bytes: 512,
                ..LoggerConfig::default()
            },
        );

        let mut value = serde_json::to_value(event("configmaps")).unwrap();
        value["diffObject"] = serde_json::json!({
            "newObject": {"blob": "x".repeat(1024)},
            "newObjectTruncated": false,
            "truncatedFields": []
        });
        let oversized: AuditEvent = serde_json::from_value(value).unwrap();

        let err = logger.try_enqueue(oversized).unwrap_err();
        assert!(err.is_validation());
        assert_eq!(logger.metrics().rejected(), 1);
        assert!(logger.stop(Duration::from_secs(1)).await);
        assert!(sink.is_empty());
    }

    #[tokio::test]
    async fn test_idle_state() {
        let logger = AuditLogger::start(
            Arc::new(MemoryAuditSink::default()),
            LoggerConfig::default(),
        );
        assert_eq!(logger.state(), LoggerState::Idle);
        assert_eq!(logger.pending(), 0);
        assert_eq!(logger.capacity(), 1024);
        logger.stop(Duration::from_secs(1)).await;
    }
}
