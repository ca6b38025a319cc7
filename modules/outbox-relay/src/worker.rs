//! Claim-and-dispatch worker
//!
//! Each poll cycle runs inside one claim scope:
//!
//! 1. claim up to `batch_size` pending records (oldest first, `SKIP LOCKED`)
//! 2. publish each record and, on broker ack, mark it processed in the same scope
//! 3. commit if anything was marked, roll back otherwise
//!
//! A failed publish leaves its record pending and never aborts the rest of
//! the batch. A storage error aborts the cycle only; the scope is dropped
//! (rolled back) and the worker retries after `poll_interval`, backing off
//! while the failures continue. A crash between publish and commit leaves
//! the record pending, so it is re-published later (at-least-once).

use chrono::Utc;
use event_bus::retry::Backoff;
use event_bus::{MessagePublisher, TopicRouter};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::error::StorageResult;
use crate::metrics::RelayMetrics;
use crate::store::{ClaimScope, OutboxStore};

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Claim limit per cycle
    pub batch_size: usize,
    /// Sleep between cycles that found no work
    pub poll_interval: Duration,
    /// Cap for the backoff applied to consecutive storage failures
    pub max_backoff: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            poll_interval: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Stopped,
    Running,
}

/// Result of a single poll cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleOutcome {
    pub claimed: usize,
    pub published: usize,
    pub failed: usize,
}

impl CycleOutcome {
    pub fn found_work(&self) -> bool {
        self.claimed > 0
    }

    /// True when at least one record was marked. Only such cycles loop
    /// again without sleeping; a batch that published nothing waits
    /// `poll_interval` like an empty one.
    pub fn made_progress(&self) -> bool {
        self.published > 0
    }
}

/// Totals accumulated over one `run`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub cycles: u64,
    pub published: u64,
    pub failed: u64,
    pub storage_errors: u64,
}

/// Cloneable handle that asks a worker to stop after its current cycle
#[derive(Clone)]
pub struct StopHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl StopHandle {
    pub fn stop(&self) {
        self.tx.send_replace(true);
    }
}

/// One relay worker; owns its publisher connection
///
/// Workers share nothing in memory. Running several against the same store
/// is safe because the store's claim hands every pending record to at most
/// one open scope.
///
/// ```rust,no_run
/// use event_bus::{InMemoryPublisher, TopicRouter};
/// use outbox_relay_rs::store::InMemoryOutboxStore;
/// use outbox_relay_rs::worker::{OutboxWorker, WorkerConfig};
/// use std::sync::Arc;
///
/// # async fn example() {
/// let worker = Arc::new(OutboxWorker::new(
///     "relay-1",
///     InMemoryOutboxStore::new(),
///     Arc::new(InMemoryPublisher::new()),
///     TopicRouter::new("chat"),
///     WorkerConfig::default(),
/// ));
///
/// let stop = worker.stop_handle();
/// let task = tokio::spawn({
///     let worker = worker.clone();
///     async move { worker.run().await }
/// });
///
/// stop.stop();
/// let summary = task.await.unwrap();
/// println!("published {}", summary.published);
/// # }
/// ```
pub struct OutboxWorker<S: OutboxStore> {
    worker_id: String,
    store: S,
    publisher: Arc<dyn MessagePublisher>,
    router: TopicRouter,
    config: WorkerConfig,
    metrics: Option<RelayMetrics>,
    stop_tx: Arc<watch::Sender<bool>>,
    running: AtomicBool,
}

impl<S: OutboxStore> OutboxWorker<S> {
    pub fn new(
        worker_id: impl Into<String>,
        store: S,
        publisher: Arc<dyn MessagePublisher>,
        router: TopicRouter,
        config: WorkerConfig,
    ) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            worker_id: worker_id.into(),
            store,
            publisher,
            router,
            config,
            metrics: None,
            stop_tx: Arc::new(stop_tx),
            running: AtomicBool::new(false),
        }
    }

    pub fn with_metrics(mut self, metrics: RelayMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn state(&self) -> WorkerState {
        if self.running.load(Ordering::SeqCst) {
            WorkerState::Running
        } else {
            WorkerState::Stopped
        }
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            tx: self.stop_tx.clone(),
        }
    }

    /// Request a cooperative stop; the current cycle is allowed to finish
    pub fn stop(&self) {
        self.stop_tx.send_replace(true);
    }

    fn stop_requested(&self) -> bool {
        *self.stop_tx.borrow()
    }

    /// Start the publisher, poll until stopped, then stop the publisher
    ///
    /// Never fails: publisher start errors are retried with backoff until the
    /// worker is stopped, and cycle errors are logged and retried.
    pub async fn run(&self) -> RunSummary {
        let mut summary = RunSummary::default();

        if self.running.swap(true, Ordering::SeqCst) {
            tracing::warn!(worker_id = %self.worker_id, "Outbox worker is already running");
            return summary;
        }

        tracing::info!(
            worker_id = %self.worker_id,
            batch_size = self.config.batch_size,
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            "Starting outbox worker"
        );

        if self.start_publisher().await {
            tracing::info!(worker_id = %self.worker_id, "Outbox worker started");
            self.process_events(&mut summary).await;
        }

        if let Err(e) = self.publisher.stop().await {
            tracing::warn!(worker_id = %self.worker_id, error = %e, "Failed to stop publisher");
        }

        self.running.store(false, Ordering::SeqCst);

        tracing::info!(
            worker_id = %self.worker_id,
            cycles = summary.cycles,
            published = summary.published,
            failed = summary.failed,
            storage_errors = summary.storage_errors,
            "Outbox worker stopped"
        );

        summary
    }

    /// Returns false if the worker was stopped before the publisher came up
    async fn start_publisher(&self) -> bool {
        let mut backoff = Backoff::new(self.config.poll_interval, self.config.max_backoff);

        loop {
            if self.stop_requested() {
                return false;
            }

            match self.publisher.start().await {
                Ok(()) => return true,
                Err(e) => {
                    let delay = backoff.next_delay();
                    tracing::warn!(
                        worker_id = %self.worker_id,
                        error = %e,
                        attempt = backoff.failures(),
                        retry_in_ms = delay.as_millis() as u64,
                        "Failed to start publisher, retrying"
                    );
                    self.pause(delay).await;
                }
            }
        }
    }

    async fn process_events(&self, summary: &mut RunSummary) {
        let mut backoff = Backoff::new(self.config.poll_interval, self.config.max_backoff);

        while !self.stop_requested() {
            summary.cycles += 1;

            match self.poll_cycle().await {
                Ok(outcome) => {
                    backoff.reset();
                    summary.published += outcome.published as u64;
                    summary.failed += outcome.failed as u64;

                    // Drain the backlog without sleeping while records go out
                    if !outcome.made_progress() {
                        self.pause(self.config.poll_interval).await;
                    }
                }
                Err(e) => {
                    summary.storage_errors += 1;
                    if let Some(metrics) = &self.metrics {
                        metrics
                            .cycle_errors_total
                            .with_label_values(&[self.worker_id.as_str()])
                            .inc();
                    }

                    let delay = backoff.next_delay();
                    tracing::error!(
                        worker_id = %self.worker_id,
                        error = %e,
                        consecutive_failures = backoff.failures(),
                        retry_in_ms = delay.as_millis() as u64,
                        "Outbox poll cycle failed"
                    );
                    self.pause(delay).await;
                }
            }
        }
    }

    /// Run one claim-publish-mark cycle
    ///
    /// Publish failures are absorbed into the outcome; only storage errors
    /// are returned. On error the claim scope is dropped, releasing every
    /// claimed record.
    pub async fn poll_cycle(&self) -> StorageResult<CycleOutcome> {
        let mut scope = self.store.begin().await?;
        let batch = scope.claim_batch(self.config.batch_size, Utc::now()).await?;

        if batch.is_empty() {
            scope.commit().await?;
            return Ok(CycleOutcome::default());
        }

        tracing::debug!(
            worker_id = %self.worker_id,
            claimed = batch.len(),
            "Claimed pending outbox records"
        );

        let mut outcome = CycleOutcome {
            claimed: batch.len(),
            ..Default::default()
        };
        let mut published_types: Vec<&str> = Vec::with_capacity(batch.len());

        for record in &batch {
            let topic = self.router.topic_key(&record.aggregate_type);
            let event = record.to_event();

            match self.publisher.publish(&topic, &event).await {
                Ok(ack) => {
                    scope.mark_processed(record.id, Utc::now()).await?;
                    outcome.published += 1;
                    published_types.push(&record.aggregate_type);

                    tracing::debug!(
                        worker_id = %self.worker_id,
                        event_id = %record.id,
                        event_type = %record.event_type,
                        topic = %topic,
                        sequence = ack.sequence,
                        "Published outbox record"
                    );
                }
                Err(e) => {
                    outcome.failed += 1;
                    if let Some(metrics) = &self.metrics {
                        metrics
                            .publish_failures_total
                            .with_label_values(&[self.worker_id.as_str(), record.aggregate_type.as_str()])
                            .inc();
                    }

                    tracing::warn!(
                        worker_id = %self.worker_id,
                        event_id = %record.id,
                        event_type = %record.event_type,
                        topic = %topic,
                        error = %e,
                        "Failed to publish outbox record, leaving it pending"
                    );
                }
            }
        }

        if outcome.made_progress() {
            scope.commit().await?;
        } else {
            scope.rollback().await?;
        }

        if let Some(metrics) = &self.metrics {
            metrics
                .records_claimed_total
                .with_label_values(&[self.worker_id.as_str()])
                .inc_by(outcome.claimed as u64);
            for aggregate_type in published_types {
                metrics
                    .records_published_total
                    .with_label_values(&[self.worker_id.as_str(), aggregate_type])
                    .inc();
            }
        }

        tracing::info!(
            worker_id = %self.worker_id,
            claimed = outcome.claimed,
            published = outcome.published,
            failed = outcome.failed,
            "Processed outbox batch"
        );

        Ok(outcome)
    }

    /// Sleep for `delay` unless a stop is requested first
    async fn pause(&self, delay: Duration) {
        let mut stop_rx = self.stop_tx.subscribe();
        if *stop_rx.borrow_and_update() {
            return;
        }

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = stop_rx.changed() => {}
        }
    }
}
