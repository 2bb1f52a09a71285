//! Polling jobs
//!
//! One job per deduplicated (service, entity, filters) key, driven by its own
//! tokio task. A tick runs under the job's async mutex: query, snapshot, cursor
//! advance, hand-off, cleanup. Either the cursor advances and the batch is
//! handed off, or neither happens.
//!
//! A tick also republishes the snapshot without new changes when subscribers
//! may have diverged: after the trigger feed lagged, after an update trigger on
//! a filtered view, or while a bound outbox awaits a resync.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tablewatch_common::config::{EntityConfig, PollingConfig};
use tablewatch_common::{
    metrics, ChangeEvent, Error, JobKey, Operation, Result, Row, TableFilters,
};

use crate::detector::{ChangeDetector, DetectedBatch};
use crate::scheduler::{AdaptiveInterval, IntervalPolicy, PollOutcome};
use crate::source::RowSource;

/// Where a batch came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchOrigin {
    Poll,
    Trigger,
}

/// Changes handed to subscribers in one go
#[derive(Debug, Clone)]
pub struct ChangeBatch {
    pub origin: BatchOrigin,
    pub events: Vec<ChangeEvent>,
    /// Current view of the job's filters, present for polled batches
    pub snapshot: Option<Vec<Row>>,
}

/// Receives the output of polling jobs
pub trait ChangeBatchHandler: Send + Sync {
    /// Called after each committed, non-empty batch, and for snapshot-only
    /// refreshes with no events
    fn on_change_batch(&self, key: &JobKey, batch: &ChangeBatch);

    /// Called when a tick fails; the job retries at its next scheduled tick
    fn on_polling_error(&self, key: &JobKey, error: &Error);

    /// Whether some subscriber of the job has dropped messages and needs a
    /// fresh snapshot even when nothing changed
    fn needs_resync(&self, _key: &JobKey) -> bool {
        false
    }
}

/// Everything a job needs besides its channels
pub struct JobParams {
    pub key: JobKey,
    pub entity: EntityConfig,
    /// Resolved change-tracking column
    pub column: String,
    pub filters: TableFilters,
    pub source: Arc<dyn RowSource>,
    pub handler: Arc<dyn ChangeBatchHandler>,
    pub polling: PollingConfig,
}

/// Outcome of one tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    pub events: usize,
    pub interval_ms: u64,
}

pub struct PollingJob {
    key: JobKey,
    label: String,
    table: String,
    id_field: String,
    filters: TableFilters,
    /// The view has equality predicates, so rows can move in and out of it
    filtered: bool,
    source: Arc<dyn RowSource>,
    handler: Arc<dyn ChangeBatchHandler>,
    detector: tokio::sync::Mutex<ChangeDetector>,
    interval: Mutex<AdaptiveInterval>,
    query_timeout: Duration,
    wake: Notify,
    cancel: CancellationToken,
    triggers_wanted: AtomicBool,
    resync_due: AtomicBool,
    ticks: AtomicU64,
}

impl PollingJob {
    /// Build a job at the base interval. Channel preferences are applied
    /// with [`PollingJob::rebind`] once channels are bound.
    pub fn new(params: JobParams) -> Result<Self> {
        let filtered = !params.filters.equality_predicates()?.is_empty();
        let detector = ChangeDetector::new(
            &params.entity,
            &params.column,
            params.polling.default_batch_size,
        );
        let policy = IntervalPolicy::from_config(&params.polling);
        Ok(Self {
            label: format!("{}.{}", params.key.service, params.key.entity),
            key: params.key,
            table: params.entity.table_name(),
            id_field: params.entity.id_field.clone(),
            filters: params.filters,
            filtered,
            source: params.source,
            handler: params.handler,
            detector: tokio::sync::Mutex::new(detector),
            interval: Mutex::new(AdaptiveInterval::new(policy)),
            query_timeout: Duration::from_millis(params.polling.query_timeout_ms.max(1)),
            wake: Notify::new(),
            cancel: CancellationToken::new(),
            triggers_wanted: AtomicBool::new(false),
            resync_due: AtomicBool::new(false),
            ticks: AtomicU64::new(0),
        })
    }

    pub fn key(&self) -> &JobKey {
        &self.key
    }

    pub fn interval_ms(&self) -> u64 {
        self.interval.lock().current_ms()
    }

    pub fn empty_polls(&self) -> u32 {
        self.interval.lock().empty_polls()
    }

    /// Ticks run so far, failed ones included
    pub fn tick_count(&self) -> u64 {
        self.ticks.load(Ordering::SeqCst)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn triggers_enabled(&self) -> bool {
        self.triggers_wanted.load(Ordering::SeqCst)
    }

    /// Apply the requested intervals of the currently bound channels
    pub fn rebind<I: IntoIterator<Item = u64>>(&self, requested: I) {
        let current = self.interval.lock().rebind(requested);
        metrics::set_poll_interval(&self.label, current);
        self.wake.notify_one();
    }

    /// Start consuming the source's trigger feed
    pub fn enable_triggers(&self) {
        if !self.triggers_wanted.swap(true, Ordering::SeqCst) {
            self.wake.notify_one();
        }
    }

    /// Make the next tick publish a snapshot even if nothing changed
    pub fn request_resync(&self) {
        self.resync_due.store(true, Ordering::SeqCst);
    }

    pub fn resync_pending(&self) -> bool {
        self.resync_due.load(Ordering::SeqCst)
    }

    /// Stop future ticks. A tick already running completes.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    async fn bounded<T>(&self, fut: impl Future<Output = Result<T>>) -> Result<T> {
        match tokio::time::timeout(self.query_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(
                u64::try_from(self.query_timeout.as_millis()).unwrap_or(u64::MAX),
            )),
        }
    }

    /// Establish the baseline cursor
    pub async fn prime(&self) -> Result<()> {
        let mut detector = self.detector.lock().await;
        self.bounded(detector.prime(self.source.as_ref())).await
    }

    /// Run one poll and feed the outcome into the schedule
    pub async fn tick(&self) -> Result<TickReport> {
        let started = Instant::now();
        self.ticks.fetch_add(1, Ordering::SeqCst);

        let result = {
            let mut detector = self.detector.lock().await;
            self.poll_once(&mut detector).await
        };
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;

        let outcome = match &result {
            Ok(0) => PollOutcome::Empty,
            Ok(_) => PollOutcome::Activity,
            Err(_) => PollOutcome::Failed,
        };
        let interval_ms = self.interval.lock().record(outcome);
        metrics::set_poll_interval(&self.label, interval_ms);

        match result {
            Ok(events) => {
                let outcome = if events > 0 { "changes" } else { "empty" };
                metrics::record_poll(&self.label, outcome, elapsed_ms);
                debug!(job = %self.key, events, interval_ms, "Tick complete");
                Ok(TickReport {
                    events,
                    interval_ms,
                })
            }
            Err(e) => {
                metrics::record_poll(&self.label, "error", elapsed_ms);
                metrics::record_poll_error(&self.label, e.error_code());
                warn!(job = %self.key, error = %e, "Poll failed");
                self.handler.on_polling_error(&self.key, &e);
                Err(e)
            }
        }
    }

    async fn poll_once(&self, detector: &mut ChangeDetector) -> Result<usize> {
        let batch = self.bounded(detector.detect(self.source.as_ref())).await?;
        let requested = self.resync_due.swap(false, Ordering::SeqCst);
        let resync = requested || self.handler.needs_resync(&self.key);
        if batch.is_empty() && !resync {
            // Baseline detections carry a watermark but no events
            detector.commit(&batch);
            return Ok(0);
        }

        let snapshot = match self
            .bounded(self.source.fetch_page(&self.table, &self.filters))
            .await
        {
            Ok(snapshot) => snapshot,
            Err(e) => {
                if requested {
                    self.resync_due.store(true, Ordering::SeqCst);
                }
                return Err(e);
            }
        };

        detector.commit(&batch);
        let count = batch.events.len();
        if count > 0 {
            metrics::record_events_detected(&self.label, "poll", count);
        } else {
            debug!(job = %self.key, "Publishing resync snapshot");
        }
        self.handler.on_change_batch(
            &self.key,
            &ChangeBatch {
                origin: BatchOrigin::Poll,
                events: batch.events.clone(),
                snapshot: Some(snapshot),
            },
        );

        if count > 0 {
            self.run_cleanup(detector, &batch).await;
        }
        Ok(count)
    }

    async fn run_cleanup(&self, detector: &ChangeDetector, batch: &DetectedBatch) {
        if let Err(e) = self.bounded(detector.cleanup(self.source.as_ref(), batch)).await {
            // Rows stay unmarked and are delivered again next tick
            warn!(job = %self.key, error = %e, "Cleanup failed");
            metrics::record_poll_error(&self.label, e.error_code());
            self.handler.on_polling_error(&self.key, &e);
        }
    }

    /// Forward one source trigger event to subscribers.
    ///
    /// A row outside the view is sent as a delete of its id, so a client
    /// holding it from before drops it. Inserts outside the view are skipped.
    pub fn handle_trigger(&self, event: ChangeEvent) {
        let (operation, record) = if self.filters.matches(&event.record) {
            if self.filtered && event.operation == Operation::Update {
                // The row may have just entered the view
                self.request_resync();
            }
            (
                event.operation,
                self.filters.project(&event.record, &self.id_field),
            )
        } else {
            if event.operation == Operation::Insert {
                return;
            }
            let Some(id) = event.record.get(&self.id_field) else {
                return;
            };
            let mut record = Row::new();
            record.insert(self.id_field.clone(), id.clone());
            (Operation::Delete, record)
        };
        self.interval.lock().note_trigger();
        metrics::record_events_detected(&self.label, "trigger", 1);

        self.handler.on_change_batch(
            &self.key,
            &ChangeBatch {
                origin: BatchOrigin::Trigger,
                events: vec![ChangeEvent {
                    operation,
                    record,
                    ..event
                }],
                snapshot: None,
            },
        );
    }

    /// Start the job's task
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let job = Arc::clone(self);
        tokio::spawn(async move { job.run().await })
    }

    async fn run(self: Arc<Self>) {
        info!(job = %self.key, interval_ms = self.interval_ms(), "Polling job started");
        if let Err(e) = self.prime().await {
            // The first tick establishes the baseline instead
            warn!(job = %self.key, error = %e, "Priming failed");
        }

        let mut last_run = Instant::now();
        let mut feed: Option<broadcast::Receiver<ChangeEvent>> = None;

        loop {
            if feed.is_none() && self.triggers_enabled() {
                feed = self.source.trigger_feed(&self.table);
                if feed.is_none() {
                    warn!(job = %self.key, "Source has no trigger feed");
                    self.triggers_wanted.store(false, Ordering::SeqCst);
                }
            }

            let due = last_run + self.interval.lock().current();

            tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                () = self.wake.notified() => {}
                event = next_trigger(&mut feed) => match event {
                    Ok(event) => self.handle_trigger(event),
                    Err(RecvError::Lagged(missed)) => {
                        // Run a tick now; it republishes the snapshot
                        warn!(job = %self.key, missed, "Trigger feed lagged");
                        self.request_resync();
                        last_run = Instant::now()
                            .checked_sub(self.interval.lock().current())
                            .unwrap_or(last_run);
                    }
                    Err(RecvError::Closed) => {
                        debug!(job = %self.key, "Trigger feed closed");
                        feed = None;
                        self.triggers_wanted.store(false, Ordering::SeqCst);
                    }
                },
                () = tokio::time::sleep_until(due) => {
                    // Errors are reported to subscribers inside tick
                    let _ = self.tick().await;
                    last_run = Instant::now();
                }
            }
        }
        info!(job = %self.key, ticks = self.tick_count(), "Polling job stopped");
    }
}

async fn next_trigger(
    feed: &mut Option<broadcast::Receiver<ChangeEvent>>,
) -> std::result::Result<ChangeEvent, RecvError> {
    match feed {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
