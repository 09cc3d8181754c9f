//! The item list store: the coordinator that owns every queue structure.
//!
//! Each item type has
//!
//! - a ready-time index (`{prefix}:{item_type}:ready`) scoring every live key
//!   with the time it becomes claimable, or with a far-future claim marker
//!   while a worker holds it,
//! - a deferred ring (`{prefix}:{item_type}:deferred`) of keys that ran out
//!   of retries,
//! - a readiness channel (`{prefix}:{item_type}:arrivals`) announcing new keys,
//! - one payload list per key (`{prefix}:{item_type}:list:{stamp}:{generation}`).
//!
//! A claim that is never released is detected purely from its score: once
//! the claim marker falls into the abandoned window, another worker may take
//! it over. No heartbeats are involved.

use crate::backend::{
    ClaimTransaction, MemoryBackend, QueueBackend, RedisBackend, ScoreBound, ScoreRange,
};
use crate::clock::{Clock, SystemClock};
use crate::config::StoreConfig;
use crate::error::{QueueError, QueueResult};
use crate::key::ListKey;
use crate::payload::Payload;
use backlog_log::{debug, error, info, warn};
use backlog_redis::Subscription;
use parking_lot::Mutex;
use rand::Rng;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Result of one pass of the claim algorithm.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimAttempt {
    /// The key now belongs to the caller.
    Claimed(ListKey),
    /// Nothing is ready or abandoned.
    NoneReady,
    /// Another writer changed the index first; try again.
    Conflict,
}

/// Score windows for a claim attempt started at `start`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClaimWindows {
    /// Claims old enough that their holder must be gone.
    pub abandoned: ScoreRange,
    /// Entries due now, allowing for clock drift.
    pub ready: ScoreRange,
    /// Score written when claiming.
    pub claim_marker: f64,
}

impl ClaimWindows {
    /// Compute the windows.
    ///
    /// ```
    /// use backlog_queue::{ClaimWindows, Environment, StoreConfig};
    ///
    /// let config = StoreConfig::new(Environment::Dev);
    /// let windows = ClaimWindows::at(0.0, &config);
    ///
    /// assert!(windows.ready.contains(15.0));
    /// assert!(windows.abandoned.contains(915.0));
    /// assert!(!windows.abandoned.contains(603_585.0));
    /// assert_eq!(windows.claim_marker, 604_800.0);
    /// ```
    pub fn at(start: f64, config: &StoreConfig) -> Self {
        let in_process = config.in_process_window.as_secs_f64();
        let timeout = config.timeout.as_secs_f64();
        let retry = config.retry_delay.as_secs_f64();
        let drift = config.clock_drift.as_secs_f64();

        Self {
            abandoned: ScoreRange::half_open(
                start + retry + drift,
                start + in_process - timeout - drift,
            ),
            ready: ScoreRange::up_to(start + drift),
            claim_marker: start + in_process,
        }
    }
}

/// Producer acknowledgement: how many payloads entered the queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Accepted {
    /// Key of the new list; `None` when nothing was submitted
    pub key: Option<ListKey>,
    /// Number of payloads accepted
    pub accepted: usize,
}

/// Coordinator over the queue structures of every item type.
///
/// Construct once per process and clone the handle into each worker task.
///
/// ```
/// use backlog_queue::{ItemListStore, ListKey, MemoryBackend, Payload, StoreConfig, Environment};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> backlog_queue::QueueResult<()> {
/// let store = ItemListStore::with_backend(MemoryBackend::new(), StoreConfig::new(Environment::Dev))?;
///
/// let accepted = store.submit("webhook", vec![Payload::from("{\"id\":1}")]).await?;
/// assert_eq!(accepted.accepted, 1);
///
/// let key = store.select_for_processing("webhook").await?.unwrap();
/// assert_eq!(Some(&key), accepted.key.as_ref());
/// while let Some(payload) = store.pop_item(&key).await? {
///     println!("{:?}", payload);
/// }
/// store.remove_completed(&key).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct ItemListStore {
    backend: Arc<dyn QueueBackend>,
    config: Arc<StoreConfig>,
    prefix: Arc<str>,
    clock: Arc<dyn Clock>,
    shutdown: Arc<watch::Sender<bool>>,
    timers: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl ItemListStore {
    /// Connect to Redis and open the store.
    pub async fn open(config: StoreConfig) -> QueueResult<Self> {
        config.validate()?;
        let backend = RedisBackend::connect(&config.redis).await?;
        info!(
            "Opened item list store '{}' ({} environment)",
            config.prefix(),
            config.environment
        );
        Self::with_backend(backend, config)
    }

    /// A store on an in-process backend.
    pub fn in_memory(config: StoreConfig) -> QueueResult<Self> {
        Self::with_backend(MemoryBackend::new(), config)
    }

    /// Open the store on any backend.
    pub fn with_backend(backend: impl QueueBackend, config: StoreConfig) -> QueueResult<Self> {
        config.validate()?;
        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            backend: Arc::new(backend),
            prefix: config.prefix().into(),
            config: Arc::new(config),
            clock: Arc::new(SystemClock),
            shutdown: Arc::new(shutdown),
            timers: Arc::new(Mutex::new(Vec::new())),
        })
    }

    /// Replace the time source.
    pub fn with_clock(mut self, clock: impl Clock) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Close the store for every handle.
    ///
    /// Pending channel waits return `None`, scheduled retry notifications are
    /// cancelled and further operations fail with [`QueueError::StoreClosed`].
    pub fn close(&self) {
        if self.shutdown.send_replace(true) {
            return;
        }
        for timer in self.timers.lock().drain(..) {
            timer.abort();
        }
        info!("Closed item list store '{}'", self.prefix);
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// The configuration.
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Current time according to the store's clock.
    pub fn now(&self) -> f64 {
        self.clock.now()
    }

    fn ensure_open(&self) -> QueueResult<()> {
        if self.is_closed() {
            return Err(QueueError::StoreClosed);
        }
        Ok(())
    }

    // ========================================================================
    // Naming
    // ========================================================================

    /// Ready-time index of an item type.
    pub fn index_name(&self, item_type: &str) -> String {
        format!("{}:{}:ready", self.prefix, item_type)
    }

    /// Deferred ring of an item type.
    pub fn ring_name(&self, item_type: &str) -> String {
        format!("{}:{}:deferred", self.prefix, item_type)
    }

    /// Readiness channel of an item type.
    pub fn channel_name(&self, item_type: &str) -> String {
        format!("{}:{}:arrivals", self.prefix, item_type)
    }

    /// Payload storage of a key.
    pub fn list_name(&self, key: &ListKey) -> String {
        format!(
            "{}:{}:list:{}:{}",
            self.prefix,
            key.item_type(),
            key.stamp(),
            key.generation()
        )
    }

    /// Audit list of handled payloads.
    pub fn audit_name(&self, item_type: &str, succeeded: bool) -> String {
        let outcome = if succeeded { "succeeded" } else { "failed" };
        format!("{}:{}:audit:{}", self.prefix, item_type, outcome)
    }

    // ========================================================================
    // Producer side
    // ========================================================================

    /// Append payloads to a key's storage. Returns the stored count.
    pub async fn append_items(&self, key: &ListKey, payloads: &[Payload]) -> QueueResult<usize> {
        self.ensure_open()?;
        let items: Vec<Vec<u8>> = payloads.iter().map(|p| p.as_bytes().to_vec()).collect();
        self.backend.append(&self.list_name(key), &items).await
    }

    /// Store payloads under a new key and announce it.
    pub async fn submit(&self, item_type: &str, payloads: Vec<Payload>) -> QueueResult<Accepted> {
        self.ensure_open()?;
        if payloads.is_empty() {
            return Ok(Accepted {
                key: None,
                accepted: 0,
            });
        }

        let key = ListKey::new(item_type)?;
        self.append_items(&key, &payloads).await?;
        self.add_new(&key).await?;

        debug!("Accepted {} payload(s) as '{}'", payloads.len(), key);
        Ok(Accepted {
            key: Some(key),
            accepted: payloads.len(),
        })
    }

    /// Remove and return the next payload of a key.
    pub async fn pop_item(&self, key: &ListKey) -> QueueResult<Option<Payload>> {
        self.ensure_open()?;
        Ok(self
            .backend
            .pop_front(&self.list_name(key))
            .await?
            .map(Payload::new))
    }

    /// Payloads left in a key's storage.
    pub async fn item_count(&self, key: &ListKey) -> QueueResult<usize> {
        self.ensure_open()?;
        self.backend.list_len(&self.list_name(key)).await
    }

    /// Drop a key's storage without touching the index or ring.
    pub async fn delete_items(&self, key: &ListKey) -> QueueResult<bool> {
        self.ensure_open()?;
        self.backend.delete(&self.list_name(key)).await
    }

    /// Copy a handled payload to the audit list for its outcome.
    pub async fn record_audit(
        &self,
        item_type: &str,
        succeeded: bool,
        payload: &Payload,
    ) -> QueueResult<()> {
        self.ensure_open()?;
        let name = self.audit_name(item_type, succeeded);
        self.backend
            .append(&name, &[payload.as_bytes().to_vec()])
            .await?;
        Ok(())
    }

    // ========================================================================
    // Ready-time index
    // ========================================================================

    /// Register a key as ready now and wake a listening worker.
    pub async fn add_new(&self, key: &ListKey) -> QueueResult<()> {
        self.ensure_open()?;
        let member = key.to_string();
        let now = self.clock.now();

        self.backend
            .set_score(&self.index_name(key.item_type()), &member, now)
            .await?;
        self.backend
            .publish(&self.channel_name(key.item_type()), &member)
            .await?;

        debug!("Added new list '{}'", member);
        Ok(())
    }

    /// Register a key as ready after the retry delay.
    ///
    /// A notification is published once the delay has passed, so idle workers
    /// wake when the retry becomes due.
    pub async fn add_retry(&self, key: &ListKey) -> QueueResult<()> {
        self.ensure_open()?;
        let member = key.to_string();
        let delay = self.config.retry_delay;
        let score = self.clock.now() + delay.as_secs_f64();

        self.backend
            .set_score(&self.index_name(key.item_type()), &member, score)
            .await?;

        let backend = Arc::clone(&self.backend);
        let channel = self.channel_name(key.item_type());
        let notice = member.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = backend.publish(&channel, &notice).await {
                warn!("Failed to announce retry of '{}': {}", notice, e);
            }
        });

        let mut timers = self.timers.lock();
        timers.retain(|t| !t.is_finished());
        timers.push(timer);

        debug!("Scheduled retry of '{}' in {}s", member, delay.as_secs());
        Ok(())
    }

    /// Forget a drained key: remove it from the index and delete its storage.
    ///
    /// Removing a key that is already gone is not an error.
    pub async fn remove_completed(&self, key: &ListKey) -> QueueResult<()> {
        self.ensure_open()?;
        self.backend
            .remove_member(&self.index_name(key.item_type()), &key.to_string())
            .await?;
        self.backend.delete(&self.list_name(key)).await?;
        Ok(())
    }

    /// Number of keys in the index, claimed or not.
    pub async fn pending_count(&self, item_type: &str) -> QueueResult<usize> {
        self.ensure_open()?;
        self.backend.index_len(&self.index_name(item_type)).await
    }

    /// A key's current score, if it is in the index.
    pub async fn score_of(&self, key: &ListKey) -> QueueResult<Option<f64>> {
        self.ensure_open()?;
        self.backend
            .score(&self.index_name(key.item_type()), &key.to_string())
            .await
    }

    // ========================================================================
    // Claiming
    // ========================================================================

    /// One pass of the claim algorithm.
    ///
    /// Abandoned claims are taken before ready entries; within each tier the
    /// earliest score wins. Index members that are not keys are removed.
    pub async fn claim_once(&self, item_type: &str) -> QueueResult<ClaimAttempt> {
        self.ensure_open()?;
        let index = self.index_name(item_type);

        loop {
            let windows = ClaimWindows::at(self.clock.now(), &self.config);
            let mut tx = self.backend.begin_claim(&index).await?;

            let candidate = match find_candidate(tx.as_mut(), &windows).await {
                Ok(candidate) => candidate,
                Err(e) => {
                    let _ = tx.abandon().await;
                    return Err(e);
                }
            };

            let Some((member, abandoned)) = candidate else {
                tx.abandon().await?;
                return Ok(ClaimAttempt::NoneReady);
            };

            let key = match member.parse::<ListKey>() {
                Ok(key) if key.item_type() == item_type => key,
                _ => {
                    tx.abandon().await?;
                    drop(tx);
                    error!("Removing unrecognized entry '{}' from '{}'", member, index);
                    self.backend.remove_member(&index, &member).await?;
                    continue;
                }
            };

            if !tx.commit(&member, windows.claim_marker).await? {
                return Ok(ClaimAttempt::Conflict);
            }

            if abandoned {
                warn!("Reclaimed abandoned list '{}'", member);
            } else {
                debug!("Claimed list '{}'", member);
            }
            return Ok(ClaimAttempt::Claimed(key));
        }
    }

    /// Claim the next key to process, or `None` if nothing is ready.
    ///
    /// Conflicts and transient backend errors are retried after a short
    /// random pause; an unreachable backend is reported to the caller.
    pub async fn select_for_processing(&self, item_type: &str) -> QueueResult<Option<ListKey>> {
        loop {
            match self.claim_once(item_type).await {
                Ok(ClaimAttempt::Claimed(key)) => return Ok(Some(key)),
                Ok(ClaimAttempt::NoneReady) => return Ok(None),
                Ok(ClaimAttempt::Conflict) => {
                    debug!("Claim conflict on '{}', retrying", item_type);
                }
                Err(e) if e.is_transient() => {
                    warn!("Transient error claiming from '{}': {}", item_type, e);
                }
                Err(e) => return Err(e),
            }
            tokio::time::sleep(self.claim_pause()).await;
        }
    }

    fn claim_pause(&self) -> Duration {
        let min = self.config.claim_backoff_min;
        let max = self.config.claim_backoff_max;
        if max <= min {
            return min;
        }
        rand::rng().random_range(min..=max)
    }

    /// How long until some entry becomes claimable.
    ///
    /// That is the earlier of the next pending entry coming due and the
    /// oldest claim becoming abandoned. `None` when the index is empty.
    pub async fn time_until_ready(&self, item_type: &str) -> QueueResult<Option<Duration>> {
        self.ensure_open()?;
        let index = self.index_name(item_type);
        let now = self.clock.now();
        let in_process = self.config.in_process_window.as_secs_f64();
        let timeout = self.config.timeout.as_secs_f64();
        let retry = self.config.retry_delay.as_secs_f64();
        let drift = self.config.clock_drift.as_secs_f64();

        // Pending entries score below this; claim markers at or above it.
        let claim_floor = now + retry + drift;

        let mut due: Option<f64> = None;
        if let Some((_, score)) = self
            .backend
            .first_in_range(&index, &ScoreRange::all())
            .await?
            && score < claim_floor
        {
            due = Some(score - drift);
        }

        let claims = ScoreRange::new(ScoreBound::Inclusive(claim_floor), ScoreBound::Unbounded);
        if let Some((_, marker)) = self.backend.first_in_range(&index, &claims).await? {
            let abandoned_at = marker - in_process + timeout + drift;
            due = Some(due.map_or(abandoned_at, |d| d.min(abandoned_at)));
        }

        Ok(due.map(|at| Duration::from_secs_f64((at - now).max(0.0))))
    }

    // ========================================================================
    // Deferred ring
    // ========================================================================

    /// Park a key for manual follow-up.
    ///
    /// The key enters the ring before it leaves the index, so a crash in
    /// between leaves it in both places and never in neither. A key already
    /// in the ring is moved to the head rather than added twice.
    pub async fn add_deferred(&self, key: &ListKey) -> QueueResult<()> {
        self.ensure_open()?;
        let member = key.to_string();
        let ring = self.ring_name(key.item_type());
        self.backend.ring_remove(&ring, &member).await?;
        self.backend.ring_push(&ring, &member).await?;
        self.backend
            .remove_member(&self.index_name(key.item_type()), &member)
            .await?;
        info!("Deferred list '{}' for manual follow-up", member);
        Ok(())
    }

    /// Remove a key from the deferred ring.
    pub async fn remove_deferred(&self, key: &ListKey) -> QueueResult<bool> {
        self.ensure_open()?;
        self.backend
            .ring_remove(&self.ring_name(key.item_type()), &key.to_string())
            .await
    }

    /// Number of deferred keys.
    pub async fn get_deferred_count(&self, item_type: &str) -> QueueResult<usize> {
        self.ensure_open()?;
        self.backend.ring_len(&self.ring_name(item_type)).await
    }

    /// Rotate the ring and return the rotated key, which stays in the ring
    /// until [`remove_deferred`](Self::remove_deferred).
    pub async fn select_for_undeferral(&self, item_type: &str) -> QueueResult<Option<ListKey>> {
        self.ensure_open()?;
        let ring = self.ring_name(item_type);

        loop {
            let Some(member) = self.backend.ring_rotate(&ring).await? else {
                return Ok(None);
            };
            match member.parse::<ListKey>() {
                Ok(key) => return Ok(Some(key)),
                Err(_) => {
                    error!("Removing unrecognized entry '{}' from '{}'", member, ring);
                    self.backend.ring_remove(&ring, &member).await?;
                }
            }
        }
    }

    // ========================================================================
    // Readiness channel
    // ========================================================================

    /// Subscribe to an item type's readiness notifications.
    pub async fn listen(&self, item_type: &str) -> QueueResult<ReadinessListener> {
        self.ensure_open()?;
        let subscription = self.backend.subscribe(&self.channel_name(item_type)).await?;
        Ok(ReadinessListener {
            subscription,
            shutdown: self.shutdown.subscribe(),
        })
    }

    /// Wait for the next readiness notification.
    ///
    /// Returns `None` if the store is closed, before or while waiting.
    pub async fn select_from_channel(&self, item_type: &str) -> QueueResult<Option<ListKey>> {
        if self.is_closed() {
            return Ok(None);
        }
        let mut listener = self.listen(item_type).await?;
        Ok(listener.next().await)
    }
}

async fn find_candidate(
    tx: &mut (dyn ClaimTransaction + '_),
    windows: &ClaimWindows,
) -> QueueResult<Option<(String, bool)>> {
    if let Some((member, _)) = tx.first_in_range(&windows.abandoned).await? {
        return Ok(Some((member, true)));
    }
    Ok(tx
        .first_in_range(&windows.ready)
        .await?
        .map(|(member, _)| (member, false)))
}

/// A standing subscription to one item type's readiness channel.
///
/// Notifications published while the holder is busy are kept until the next
/// call to [`next`](Self::next).
pub struct ReadinessListener {
    subscription: Subscription,
    shutdown: watch::Receiver<bool>,
}

impl ReadinessListener {
    /// Wait for the next announced key.
    ///
    /// `None` once the store is closed or the subscription ends.
    pub async fn next(&mut self) -> Option<ListKey> {
        loop {
            if *self.shutdown.borrow_and_update() {
                return None;
            }

            let message = tokio::select! {
                biased;
                changed = self.shutdown.changed() => {
                    if changed.is_err() {
                        return None;
                    }
                    continue;
                }
                message = self.subscription.recv() => message?,
            };

            match message.payload.parse() {
                Ok(key) => return Some(key),
                Err(_) => warn!(
                    "Ignoring malformed notification '{}' on '{}'",
                    message.payload, message.channel
                ),
            }
        }
    }

    /// Discard notifications already received. Returns how many.
    pub fn drain(&mut self) -> usize {
        let mut drained = 0;
        while self.subscription.try_recv().is_some() {
            drained += 1;
        }
        drained
    }
}
