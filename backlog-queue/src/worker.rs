//! Worker loop draining claimed lists.

use crate::config::Environment;
use crate::error::{QueueError, QueueResult};
use crate::key::{ListKey, validate_item_type};
use crate::payload::{Outcome, Payload};
use crate::store::{ItemListStore, ReadinessListener};
use backlog_log::{debug, error, info, warn};
use rand::Rng;
use serde::Serialize;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Payload handler function type.
///
/// Receives the item type and one payload.
pub type ItemHandler =
    Arc<dyn Fn(String, Payload) -> Pin<Box<dyn Future<Output = Outcome> + Send>> + Send + Sync>;

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Number of loop tasks
    pub concurrency: usize,

    /// Generations a list may be retried before it is deferred
    pub max_retries: u32,

    /// Pause after a backend error
    pub error_backoff: Duration,

    /// Shortest random pause after waking
    pub wake_stagger_min: Duration,

    /// Longest random pause after waking
    pub wake_stagger_max: Duration,

    /// How long `stop` waits for tasks to finish their current list
    pub shutdown_grace: Duration,

    /// Copy handled payloads to the audit lists; `None` follows the environment
    pub audit: Option<bool>,

    /// Whether to log every drained list at info level
    pub log_execution: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 1,
            max_retries: 5,
            error_backoff: Duration::from_secs(5),
            wake_stagger_min: Duration::from_millis(100),
            wake_stagger_max: Duration::from_secs(2),
            shutdown_grace: Duration::from_secs(10),
            audit: None,
            log_execution: true,
        }
    }
}

/// State of one loop task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[repr(u8)]
pub enum WorkerState {
    /// Looking for work or waiting for a notification
    Idle = 0,
    /// Draining a claimed list
    Draining = 1,
    /// Finished
    Stopped = 2,
}

impl WorkerState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Idle,
            1 => Self::Draining,
            _ => Self::Stopped,
        }
    }
}

/// What happens to payloads carried forward from a drained list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum FollowUp {
    /// Nothing was carried forward.
    None,
    /// Scheduled as a retry under this key.
    Retry(ListKey),
    /// Retries exhausted; parked in the deferred ring under this key.
    Deferred(ListKey),
}

/// Result of draining one list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    /// The drained list
    pub key: ListKey,
    /// Payloads processed successfully
    pub succeeded: usize,
    /// Payloads dropped after a permanent failure
    pub dropped: usize,
    /// Payloads moved to the next generation
    pub carried: usize,
    /// Where the carried payloads went
    pub follow_up: FollowUp,
}

/// Result of draining every ready list once.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunReport {
    /// Lists drained
    pub lists_processed: usize,
    /// Retry lists created
    pub retries_scheduled: usize,
    /// Lists moved to the deferred ring
    pub lists_deferred: usize,
}

impl RunReport {
    fn record(&mut self, drained: &DrainReport) {
        self.lists_processed += 1;
        match drained.follow_up {
            FollowUp::None => {}
            FollowUp::Retry(_) => self.retries_scheduled += 1,
            FollowUp::Deferred(_) => self.lists_deferred += 1,
        }
    }
}

/// Snapshot of a worker's counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    pub lists_drained: u64,
    pub payloads_succeeded: u64,
    pub payloads_dropped: u64,
    pub payloads_carried: u64,
    pub retries_scheduled: u64,
    pub lists_deferred: u64,
    pub backend_errors: u64,
}

#[derive(Default)]
struct Counters {
    lists_drained: AtomicU64,
    payloads_succeeded: AtomicU64,
    payloads_dropped: AtomicU64,
    payloads_carried: AtomicU64,
    retries_scheduled: AtomicU64,
    lists_deferred: AtomicU64,
    backend_errors: AtomicU64,
}

impl Counters {
    fn record(&self, drained: &DrainReport) {
        self.lists_drained.fetch_add(1, Ordering::Relaxed);
        self.payloads_succeeded
            .fetch_add(drained.succeeded as u64, Ordering::Relaxed);
        self.payloads_dropped
            .fetch_add(drained.dropped as u64, Ordering::Relaxed);
        self.payloads_carried
            .fetch_add(drained.carried as u64, Ordering::Relaxed);
        match drained.follow_up {
            FollowUp::None => {}
            FollowUp::Retry(_) => {
                self.retries_scheduled.fetch_add(1, Ordering::Relaxed);
            }
            FollowUp::Deferred(_) => {
                self.lists_deferred.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn snapshot(&self) -> WorkerStats {
        WorkerStats {
            lists_drained: self.lists_drained.load(Ordering::Relaxed),
            payloads_succeeded: self.payloads_succeeded.load(Ordering::Relaxed),
            payloads_dropped: self.payloads_dropped.load(Ordering::Relaxed),
            payloads_carried: self.payloads_carried.load(Ordering::Relaxed),
            retries_scheduled: self.retries_scheduled.load(Ordering::Relaxed),
            lists_deferred: self.lists_deferred.load(Ordering::Relaxed),
            backend_errors: self.backend_errors.load(Ordering::Relaxed),
        }
    }
}

/// Everything a loop task needs; cheap to clone.
#[derive(Clone)]
struct Runner {
    store: ItemListStore,
    item_type: Arc<str>,
    handler: ItemHandler,
    config: Arc<WorkerConfig>,
    audit: bool,
    counters: Arc<Counters>,
}

impl Runner {
    async fn drain_list(&self, key: &ListKey) -> QueueResult<DrainReport> {
        let mut report = DrainReport {
            key: key.clone(),
            succeeded: 0,
            dropped: 0,
            carried: 0,
            follow_up: FollowUp::None,
        };
        let mut next = self.unscheduled_carry(key).await?;

        if let Err(e) = self.drain_payloads(key, &mut report, &mut next).await {
            // Carried payloads already live under the next key; keep them reachable.
            if let Some(next) = next
                && let Err(follow_up_error) = self.follow_up(next).await
            {
                error!(
                    "Failed to schedule carried payloads of '{}': {}",
                    key, follow_up_error
                );
            }
            return Err(e);
        }

        if let Some(next) = next {
            report.follow_up = self.follow_up(next).await?;
        }
        self.store.remove_completed(key).await?;

        self.counters.record(&report);
        if self.config.log_execution {
            info!(
                "Drained '{}': {} succeeded, {} dropped, {} carried forward",
                key, report.succeeded, report.dropped, report.carried
            );
        } else {
            debug!(
                "Drained '{}': {} succeeded, {} dropped, {} carried forward",
                key, report.succeeded, report.dropped, report.carried
            );
        }
        Ok(report)
    }

    /// The next generation of `key` if it holds payloads but was never
    /// scheduled, which happens when the previous holder of the claim died
    /// between carrying a payload forward and following up.
    async fn unscheduled_carry(&self, key: &ListKey) -> QueueResult<Option<ListKey>> {
        let next = key.next_generation();
        let carried = self.store.item_count(&next).await?;
        if carried == 0 || self.store.score_of(&next).await?.is_some() {
            return Ok(None);
        }
        warn!(
            "Recovering {} payload(s) carried forward to '{}'",
            carried, next
        );
        Ok(Some(next))
    }

    async fn drain_payloads(
        &self,
        key: &ListKey,
        report: &mut DrainReport,
        next: &mut Option<ListKey>,
    ) -> QueueResult<()> {
        while let Some(payload) = self.store.pop_item(key).await? {
            let outcome = (self.handler)(self.item_type.to_string(), payload.clone()).await;

            match outcome {
                Outcome::Success => {
                    report.succeeded += 1;
                    self.audit(true, &payload).await;
                }
                Outcome::PermanentFailure(reason) => {
                    warn!("Dropping payload from '{}': {}", key, reason);
                    report.dropped += 1;
                }
                Outcome::TransientFailure(reason) => {
                    debug!("Carrying payload from '{}' forward: {}", key, reason);
                    let next = next.get_or_insert_with(|| key.next_generation());
                    self.store
                        .append_items(next, std::slice::from_ref(&payload))
                        .await?;
                    report.carried += 1;
                    self.audit(false, &payload).await;
                }
            }
        }
        Ok(())
    }

    async fn follow_up(&self, next: ListKey) -> QueueResult<FollowUp> {
        if next.generation() > self.config.max_retries {
            warn!(
                "List '{}' exhausted {} retries, deferring",
                next, self.config.max_retries
            );
            self.store.add_deferred(&next).await?;
            Ok(FollowUp::Deferred(next))
        } else {
            self.store.add_retry(&next).await?;
            Ok(FollowUp::Retry(next))
        }
    }

    async fn audit(&self, succeeded: bool, payload: &Payload) {
        if !self.audit {
            return;
        }
        if let Err(e) = self
            .store
            .record_audit(&self.item_type, succeeded, payload)
            .await
        {
            warn!("Failed to record audit entry: {}", e);
        }
    }

    async fn process_ready(
        &self,
        state: Option<&AtomicU8>,
        cancel: Option<&watch::Receiver<bool>>,
    ) -> QueueResult<RunReport> {
        let mut report = RunReport::default();

        while !cancel.is_some_and(|c| *c.borrow()) {
            let Some(key) = self.store.select_for_processing(&self.item_type).await? else {
                break;
            };

            set_state(state, WorkerState::Draining);
            let drained = self.drain_list(&key).await;
            set_state(state, WorkerState::Idle);

            report.record(&drained?);
        }

        Ok(report)
    }

    async fn run(self, index: usize, state: Arc<AtomicU8>, mut cancel: watch::Receiver<bool>) {
        debug!("Worker '{}' task {} started", self.item_type, index);
        let mut listener: Option<ReadinessListener> = None;

        while !*cancel.borrow() {
            if listener.is_none() {
                match self.store.listen(&self.item_type).await {
                    Ok(l) => listener = Some(l),
                    Err(e) => {
                        if self.on_error(&e, &mut cancel).await {
                            break;
                        }
                        continue;
                    }
                }
            }

            if let Err(e) = self.process_ready(Some(state.as_ref()), Some(&cancel)).await {
                if e.is_unavailable() {
                    listener = None;
                }
                if self.on_error(&e, &mut cancel).await {
                    break;
                }
                continue;
            }

            let bound = match self.store.time_until_ready(&self.item_type).await {
                Ok(until) => until.map(|d| d + self.wake_jitter()),
                Err(e) => {
                    if self.on_error(&e, &mut cancel).await {
                        break;
                    }
                    continue;
                }
            };

            let Some(active) = listener.as_mut() else {
                continue;
            };
            let woken = tokio::select! {
                biased;
                _ = cancelled(&mut cancel) => break,
                woken = wait_for_wake(active, bound) => woken,
            };

            match woken {
                Wake::Notified(key) => debug!("Worker '{}' woken by '{}'", self.item_type, key),
                Wake::Due => {}
                Wake::Closed => {
                    if self.store.is_closed() {
                        break;
                    }
                    listener = None;
                }
            }

            let stagger = self.stagger();
            if pause(&mut cancel, stagger).await {
                break;
            }
        }

        state.store(WorkerState::Stopped as u8, Ordering::Release);
        debug!("Worker '{}' task {} stopped", self.item_type, index);
    }

    /// Log and back off. Returns `true` if the task should stop.
    async fn on_error(&self, error: &QueueError, cancel: &mut watch::Receiver<bool>) -> bool {
        if matches!(error, QueueError::StoreClosed) {
            return true;
        }
        self.counters.backend_errors.fetch_add(1, Ordering::Relaxed);
        error!("Worker '{}' error: {}", self.item_type, error);
        pause(cancel, self.config.error_backoff).await
    }

    fn wake_jitter(&self) -> Duration {
        let drift = self.store.config().clock_drift.as_secs_f64();
        let low = 0.1_f64.min(drift);
        if drift <= low {
            return Duration::from_secs_f64(low);
        }
        Duration::from_secs_f64(rand::rng().random_range(low..=drift))
    }

    fn stagger(&self) -> Duration {
        let min = self.config.wake_stagger_min;
        let max = self.config.wake_stagger_max;
        if max <= min {
            return min;
        }
        rand::rng().random_range(min..=max)
    }
}

enum Wake {
    Notified(ListKey),
    Due,
    Closed,
}

async fn wait_for_wake(listener: &mut ReadinessListener, bound: Option<Duration>) -> Wake {
    let next = match bound {
        Some(bound) => match tokio::time::timeout(bound, listener.next()).await {
            Ok(next) => next,
            Err(_) => return Wake::Due,
        },
        None => listener.next().await,
    };
    match next {
        Some(key) => Wake::Notified(key),
        None => Wake::Closed,
    }
}

/// Resolves once cancellation is signalled or the signal is dropped.
async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    let _ = cancel.wait_for(|stop| *stop).await;
}

/// Sleep unless cancelled first. Returns `true` if cancelled.
async fn pause(cancel: &mut watch::Receiver<bool>, duration: Duration) -> bool {
    tokio::select! {
        biased;
        _ = cancelled(cancel) => true,
        _ = tokio::time::sleep(duration) => false,
    }
}

fn set_state(state: Option<&AtomicU8>, value: WorkerState) {
    if let Some(state) = state {
        state.store(value as u8, Ordering::Release);
    }
}

/// Worker draining lists of one item type.
pub struct Worker {
    runner: Runner,
    cancel: Option<watch::Sender<bool>>,
    tasks: Vec<JoinHandle<()>>,
    states: Vec<Arc<AtomicU8>>,
}

impl Worker {
    /// Create a worker with the default configuration.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use backlog_queue::*;
    ///
    /// # async fn example() -> QueueResult<()> {
    /// let store = ItemListStore::open(StoreConfig::from_env()?).await?;
    /// let mut worker = Worker::new(store, "webhook", |item_type, payload| async move {
    ///     println!("{}: {} bytes", item_type, payload.len());
    ///     Outcome::Success
    /// });
    ///
    /// worker.start().await?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn new<F, Fut>(store: ItemListStore, item_type: impl Into<String>, handler: F) -> Self
    where
        F: Fn(String, Payload) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Outcome> + Send + 'static,
    {
        Self::with_config(store, item_type, WorkerConfig::default(), handler)
    }

    /// Create a worker with custom configuration.
    pub fn with_config<F, Fut>(
        store: ItemListStore,
        item_type: impl Into<String>,
        config: WorkerConfig,
        handler: F,
    ) -> Self
    where
        F: Fn(String, Payload) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Outcome> + Send + 'static,
    {
        let handler: ItemHandler = Arc::new(
            move |item_type: String,
                  payload: Payload|
                  -> Pin<Box<dyn Future<Output = Outcome> + Send>> {
                Box::pin(handler(item_type, payload))
            },
        );
        let audit = config
            .audit
            .unwrap_or(store.config().environment == Environment::Dev);
        let item_type: String = item_type.into();

        Self {
            runner: Runner {
                store,
                item_type: item_type.into(),
                handler,
                config: Arc::new(config),
                audit,
                counters: Arc::new(Counters::default()),
            },
            cancel: None,
            tasks: Vec::new(),
            states: Vec::new(),
        }
    }

    /// The item type this worker drains.
    pub fn item_type(&self) -> &str {
        &self.runner.item_type
    }

    /// Start the loop tasks.
    pub async fn start(&mut self) -> QueueResult<()> {
        if self.cancel.is_some() {
            return Err(QueueError::WorkerAlreadyRunning);
        }
        validate_item_type(&self.runner.item_type)?;

        let concurrency = self.runner.config.concurrency.max(1);
        let (cancel, _) = watch::channel(false);

        self.tasks.clear();
        self.states.clear();
        for i in 0..concurrency {
            let state = Arc::new(AtomicU8::new(WorkerState::Idle as u8));
            let task = self
                .runner
                .clone()
                .run(i, Arc::clone(&state), cancel.subscribe());
            self.tasks.push(tokio::spawn(task));
            self.states.push(state);
        }
        self.cancel = Some(cancel);

        if self.runner.config.log_execution {
            info!(
                "Worker '{}' started with concurrency {}",
                self.runner.item_type, concurrency
            );
        }
        Ok(())
    }

    /// Stop the loop tasks.
    ///
    /// Tasks finish the list they are draining; any still running after the
    /// grace period are aborted and their claims are recovered as abandoned.
    pub async fn stop(&mut self) -> QueueResult<()> {
        let Some(cancel) = self.cancel.take() else {
            return Err(QueueError::WorkerNotRunning);
        };
        cancel.send_replace(true);

        if self.runner.config.log_execution {
            info!("Worker '{}' stopping...", self.runner.item_type);
        }

        let grace = self.runner.config.shutdown_grace;
        let finished =
            tokio::time::timeout(grace, futures::future::join_all(self.tasks.iter_mut())).await;
        if finished.is_err() {
            warn!(
                "Worker '{}' did not stop within {:?}, aborting",
                self.runner.item_type, grace
            );
        }
        for task in self.tasks.drain(..) {
            task.abort();
        }
        for state in &self.states {
            state.store(WorkerState::Stopped as u8, Ordering::Release);
        }

        if self.runner.config.log_execution {
            info!("Worker '{}' stopped", self.runner.item_type);
        }
        Ok(())
    }

    /// Check if the worker is running.
    pub fn is_running(&self) -> bool {
        self.cancel.is_some()
    }

    /// State of each loop task.
    pub fn states(&self) -> Vec<WorkerState> {
        self.states
            .iter()
            .map(|s| WorkerState::from_u8(s.load(Ordering::Acquire)))
            .collect()
    }

    /// Counter snapshot.
    pub fn stats(&self) -> WorkerStats {
        self.runner.counters.snapshot()
    }

    /// Drain every ready list once.
    pub async fn process_ready(&self) -> QueueResult<RunReport> {
        self.runner.process_ready(None, None).await
    }

    /// Drain one list this caller has claimed.
    pub async fn drain_list(&self, key: &ListKey) -> QueueResult<DrainReport> {
        self.runner.drain_list(key).await
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        if let Some(cancel) = &self.cancel {
            cancel.send_replace(true);
        }
    }
}
