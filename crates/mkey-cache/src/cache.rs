//! Background-replenished key cache
//!
//! [`KeyCache`] owns one [`ClassEntry`] per cached size class and a
//! worker task per entry. Workers react to doorbell kicks and armed
//! deadlines, issue asynchronous key creations while an entry sits
//! below its high-water mark (2x limit), and trim idle keys back down
//! once an entry sits above it. Consumers never wait on the device on
//! the hot path: [`KeyCache::get`] only pops a pooled key, and a miss
//! merely rings the doorbell for the background fill.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tracing::{debug, error, info, trace, warn};

use crate::backend::{CommandBackend, CreateCompletion, KeyHandle};
use crate::config::{CacheConfig, MAX_LIMIT, MAX_RELEASE_TIMEOUT_SECS};
use crate::entry::ClassEntry;
use crate::error::{BackendError, CacheError, Result};
use crate::index::{KeyIndex, KeyInfo};
use crate::key::CachedKey;
use crate::stats::{CacheStats, EntryStats, LifetimeCounters};

/// Upper bound on a single deferred-trim arming.
///
/// A stale `last_add` far in the future of the release window can ask
/// for an absurd delay; clamping keeps every arming observable.
const MAX_RELEASE_DELAY: Duration = Duration::from_secs(MAX_RELEASE_TIMEOUT_SECS as u64);

/// What a worker should do after one dispatch round.
#[derive(Debug)]
enum Redispatch {
    /// Run another round right away (after yielding).
    Now,
    /// Arm the entry's deadline and sleep.
    After(Duration),
    /// Nothing to do until the next kick.
    Idle,
}

/// Result of trying to issue one asynchronous creation.
#[derive(Debug)]
enum IssueOutcome {
    /// A creation command is in flight.
    Issued,
    /// `cur + pending` already covers the high-water mark.
    Covered,
    /// The in-flight budget is exhausted or the device queue is full.
    Saturated,
    /// The device rejected the command outright.
    Failed(BackendError),
}

/// State shared between the cache handle, its workers, and in-flight
/// completion tasks.
struct Shared {
    backend: Arc<dyn CommandBackend>,
    index: Arc<KeyIndex>,
    entries: Box<[ClassEntry]>,
    min_order: u8,
    max_pending: u32,
    busy_retry: Duration,
    failure_retry: Duration,
    fill_cooldown: Duration,
    grow_timeout: Duration,
    drain_interval: Duration,
    drain_rounds: u32,
    /// Set once at teardown; checked before every state mutation.
    stopped: AtomicBool,
    /// Cache-wide creation backoff after a non-busy failure.
    fill_delay: AtomicBool,
    /// Trim immediately, ignoring the release window. Self-clearing.
    rel_imm: AtomicBool,
    /// Release window in seconds, `-1` disables deferred trimming.
    rel_timeout_secs: AtomicI64,
    /// Time of the most recent successful pooling of a new key.
    last_add: Mutex<Instant>,
    cooldown_timer: Mutex<Option<JoinHandle<()>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    counters: LifetimeCounters,
}

impl Shared {
    fn stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Maps an order onto an entry slot, clamping below-range orders
    /// onto the smallest cached class. Orders above the range have no
    /// slot.
    fn order2idx(&self, order: u8) -> Option<usize> {
        let idx = usize::from(order.saturating_sub(self.min_order));
        (idx < self.entries.len()).then_some(idx)
    }

    /// Strict order lookup for administrative operations. Unlike
    /// [`Self::order2idx`] this rejects below-range orders instead of
    /// clamping them.
    fn idx_for(&self, order: u8) -> Result<usize> {
        if order < self.min_order {
            return Err(CacheError::UnknownOrder(order));
        }
        self.order2idx(order).ok_or(CacheError::UnknownOrder(order))
    }

    /// Whether any entry sits below its low-water mark. Trimming yields
    /// to such entries so one class's surplus never starves another
    /// class's refill.
    fn someone_adding(&self) -> bool {
        self.entries.iter().any(|entry| {
            let state = entry.lock();
            state.cur < state.limit
        })
    }

    /// Whether any entry still sits above its high-water mark.
    fn someone_releasing(&self) -> bool {
        self.entries.iter().any(|entry| {
            let state = entry.lock();
            state.cur > 2 * state.limit
        })
    }

    /// One dispatch round for one entry. Runs on the entry's worker
    /// task, so at most one round per entry executes at a time.
    async fn dispatch(self: &Arc<Self>, idx: usize) -> Redispatch {
        if self.stopped() {
            return Redispatch::Idle;
        }
        let entry = &self.entries[idx];
        let (cur, limit) = entry.watermarks();

        if cur < 2 * limit && !self.fill_delay.load(Ordering::Acquire) {
            let outcome = self.issue_create(idx);
            let (cur, pending, limit) = entry.fill_state();
            let undersupplied = cur + pending < 2 * limit;
            match outcome {
                IssueOutcome::Issued if undersupplied => Redispatch::Now,
                IssueOutcome::Saturated if undersupplied => Redispatch::After(self.busy_retry),
                IssueOutcome::Failed(_) if undersupplied => Redispatch::After(self.failure_retry),
                _ => Redispatch::Idle,
            }
        } else if cur > 2 * limit {
            self.trim_step(idx).await
        } else {
            if self.rel_imm.load(Ordering::Relaxed) && !self.someone_releasing() {
                debug!("Immediate trim finished, clearing rel_imm");
                self.rel_imm.store(false, Ordering::Relaxed);
            }
            Redispatch::Idle
        }
    }

    /// Issues one asynchronous creation if the entry still needs one
    /// and the in-flight budget allows it.
    fn issue_create(self: &Arc<Self>, idx: usize) -> IssueOutcome {
        let entry = &self.entries[idx];
        {
            let mut state = entry.lock();
            if state.cur + state.pending >= 2 * state.limit {
                return IssueOutcome::Covered;
            }
            if state.pending >= self.max_pending {
                return IssueOutcome::Saturated;
            }
            state.pending += 1;
        }
        match self.backend.create_key_async(entry.order) {
            Ok(completion) => {
                trace!("Issued async key creation for order {}", entry.order);
                tokio::spawn(completion_task(
                    Arc::downgrade(self),
                    Arc::clone(&self.backend),
                    idx,
                    entry.order,
                    completion,
                ));
                IssueOutcome::Issued
            }
            Err(err) => {
                entry.lock().pending -= 1;
                if err.is_busy() {
                    trace!("Device busy, deferring creation for order {}", entry.order);
                    IssueOutcome::Saturated
                } else {
                    warn!("Key creation for order {} rejected: {err}", entry.order);
                    self.counters.create_failures.fetch_add(1, Ordering::Relaxed);
                    self.enter_fill_delay();
                    IssueOutcome::Failed(err)
                }
            }
        }
    }

    /// Books a finished creation. Returns a handle the caller must
    /// destroy when the key cannot be pooled.
    fn on_create_complete(
        self: &Arc<Self>,
        idx: usize,
        order: u8,
        result: std::result::Result<KeyHandle, BackendError>,
    ) -> Option<KeyHandle> {
        let entry = &self.entries[idx];
        entry.lock().pending -= 1;
        match result {
            Err(err) => {
                warn!("Async key creation for order {order} failed: {err}");
                self.counters.create_failures.fetch_add(1, Ordering::Relaxed);
                self.enter_fill_delay();
                None
            }
            Ok(handle) => {
                if self.stopped() {
                    debug!("Creation of {handle} finished after stop, destroying");
                    return Some(handle);
                }
                if self.index.insert(handle, KeyInfo { order }).is_err() {
                    error!("Device returned duplicate handle {handle}, destroying key");
                    // The entry is still short one key; try again.
                    entry.kick();
                    return Some(handle);
                }
                let undersupplied = {
                    let mut state = entry.lock();
                    state.free.push(CachedKey::new(handle, order));
                    state.cur += 1;
                    state.cur + state.pending < 2 * state.limit
                };
                *self.last_add.lock() = Instant::now();
                self.counters.created.fetch_add(1, Ordering::Relaxed);
                trace!("Pooled new key {handle} for order {order}");
                if undersupplied {
                    entry.kick();
                }
                None
            }
        }
    }

    /// Removes at most one idle key above the high-water mark, or arms
    /// the deferred-trim deadline when the release window is still
    /// open.
    async fn trim_step(self: &Arc<Self>, idx: usize) -> Redispatch {
        let entry = &self.entries[idx];
        let rel_timeout = self.rel_timeout_secs.load(Ordering::Relaxed);
        let rel_imm = self.rel_imm.load(Ordering::Relaxed);
        let window_end = (rel_timeout >= 0)
            .then(|| *self.last_add.lock() + Duration::from_secs(rel_timeout.unsigned_abs()));
        let now = Instant::now();
        let window_closed = window_end.is_some_and(|end| now >= end);

        if rel_imm || (window_closed && !self.someone_adding()) {
            let Some(key) = entry.take_idle() else {
                // Everything above the mark is checked out; the next
                // release rings the doorbell again.
                return Redispatch::Idle;
            };
            debug!("Trimming idle key {} from order {}", key.handle(), entry.order);
            self.retire_key(key).await;
            // Re-evaluate from the top: keep trimming while over
            // water, and let the quiet branch retire rel_imm once
            // nothing is.
            Redispatch::Now
        } else if let Some(end) = window_end {
            let remaining = end.saturating_duration_since(now);
            let delay = if remaining.is_zero() {
                // Blocked by a class below its low-water mark; check
                // again after a full window.
                Duration::from_secs(rel_timeout.unsigned_abs()).max(self.busy_retry)
            } else {
                remaining.min(MAX_RELEASE_DELAY)
            };
            trace!("Deferring trim for order {} by {delay:?}", entry.order);
            Redispatch::After(delay)
        } else {
            // rel_timeout < 0: automatic trimming is disabled.
            Redispatch::Idle
        }
    }

    /// Unlinks a key from the index and destroys it on the device.
    async fn retire_key(&self, key: CachedKey) {
        self.index.remove(key.handle());
        if let Err(err) = self.backend.destroy_key(key.handle()).await {
            // Bookkeeping already dropped the key; a leaked hardware
            // object is preferred over an inconsistent pool.
            warn!("Destroying key {} failed: {err}", key.handle());
        }
        self.counters.destroyed.fetch_add(1, Ordering::Relaxed);
    }

    /// Pauses all creations for one cooldown period. Re-entering while
    /// a cooldown is already running restarts it from scratch.
    fn enter_fill_delay(self: &Arc<Self>) {
        self.fill_delay.store(true, Ordering::Release);
        let cooldown = self.fill_cooldown;
        let weak = Arc::downgrade(self);
        let timer = tokio::spawn(async move {
            time::sleep(cooldown).await;
            if let Some(shared) = weak.upgrade() {
                shared.clear_fill_delay();
            }
        });
        if let Some(stale) = self.cooldown_timer.lock().replace(timer) {
            stale.abort();
        }
    }

    /// Ends the creation backoff and wakes every undersupplied entry,
    /// since their workers may have gone idle while the backoff held.
    fn clear_fill_delay(&self) {
        self.fill_delay.store(false, Ordering::Release);
        if self.stopped() {
            return;
        }
        debug!("Creation cooldown over, resuming fills");
        for entry in self.entries.iter() {
            let undersupplied = {
                let state = entry.lock();
                state.limit > 0 && state.cur + state.pending < 2 * state.limit
            };
            if undersupplied {
                entry.kick();
            }
        }
    }

    fn snapshot(&self) -> CacheStats {
        CacheStats {
            entries: self.entries.iter().map(ClassEntry::stats).collect(),
            created: self.counters.created.load(Ordering::Relaxed),
            create_failures: self.counters.create_failures.load(Ordering::Relaxed),
            destroyed: self.counters.destroyed.load(Ordering::Relaxed),
            checkouts: self.counters.checkouts.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            releases: self.counters.releases.load(Ordering::Relaxed),
            fill_delay: self.fill_delay.load(Ordering::Acquire),
            rel_imm: self.rel_imm.load(Ordering::Relaxed),
            rel_timeout_secs: self.rel_timeout_secs.load(Ordering::Relaxed),
            stopped: self.stopped(),
        }
    }
}

/// Per-entry scheduler loop.
///
/// Sleeps on the entry's doorbell, or on the armed deadline when one
/// exists. Every wakeup replaces the pending deadline, so a kick that
/// arrives while a deferred trim is armed runs a round immediately and
/// the round decides whether to arm a new one.
async fn entry_worker(shared: Weak<Shared>, idx: usize, wakeup: Arc<tokio::sync::Notify>) {
    let mut deadline: Option<Instant> = None;
    loop {
        match deadline.take() {
            Some(at) => {
                tokio::select! {
                    () = wakeup.notified() => {}
                    () = time::sleep_until(at) => {}
                }
            }
            None => wakeup.notified().await,
        }
        let Some(shared) = shared.upgrade() else {
            return;
        };
        if shared.stopped() {
            return;
        }
        loop {
            match shared.dispatch(idx).await {
                Redispatch::Now => tokio::task::yield_now().await,
                Redispatch::After(delay) => {
                    deadline = Some(Instant::now() + delay);
                    break;
                }
                Redispatch::Idle => break,
            }
        }
    }
}

/// Waits for one creation completion and books the result.
///
/// Holds only a weak reference to the cache: when the cache is gone by
/// the time the device answers, the fresh key is destroyed instead of
/// leaked.
async fn completion_task(
    shared: Weak<Shared>,
    backend: Arc<dyn CommandBackend>,
    idx: usize,
    order: u8,
    completion: CreateCompletion,
) {
    let result = completion.await.unwrap_or(Err(BackendError::CompletionLost));
    let Some(shared) = shared.upgrade() else {
        if let Ok(handle) = result {
            if let Err(err) = backend.destroy_key(handle).await {
                warn!("Destroying orphaned key {handle} failed: {err}");
            }
        }
        return;
    };
    if let Some(doomed) = shared.on_create_complete(idx, order, result) {
        if let Err(err) = backend.destroy_key(doomed).await {
            warn!("Destroying unpoolable key {doomed} failed: {err}");
        }
        shared.counters.destroyed.fetch_add(1, Ordering::Relaxed);
    }
}

/// Size-classed cache of pre-created registration keys.
///
/// Construction spawns one worker task per size class and immediately
/// rings every doorbell, so the pools start filling toward their
/// high-water marks in the background. The handle is cheap to clone
/// via `Arc` sharing inside; all methods take `&self`.
///
/// Must be created from within a Tokio runtime.
pub struct KeyCache {
    shared: Arc<Shared>,
}

impl KeyCache {
    /// Creates a cache with a fresh handle index.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Config`] when the configuration fails
    /// validation.
    pub fn new(backend: Arc<dyn CommandBackend>, config: CacheConfig) -> Result<Self> {
        Self::with_index(backend, config, Arc::new(KeyIndex::new()))
    }

    /// Creates a cache around an existing handle index, so completion
    /// routing and the cache share one registry.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Config`] when the configuration fails
    /// validation.
    pub fn with_index(
        backend: Arc<dyn CommandBackend>,
        config: CacheConfig,
        index: Arc<KeyIndex>,
    ) -> Result<Self> {
        config.validate().map_err(CacheError::Config)?;

        let entries: Box<[ClassEntry]> = config
            .limits
            .iter()
            .enumerate()
            .map(|(i, &limit)| ClassEntry::new(config.min_order + i as u8, limit))
            .collect();

        let shared = Arc::new(Shared {
            backend,
            index,
            entries,
            min_order: config.min_order,
            max_pending: config.max_pending,
            busy_retry: config.busy_retry,
            failure_retry: config.failure_retry,
            fill_cooldown: config.fill_cooldown,
            grow_timeout: config.grow_timeout,
            drain_interval: config.drain_interval,
            drain_rounds: config.drain_rounds,
            stopped: AtomicBool::new(false),
            fill_delay: AtomicBool::new(false),
            rel_imm: AtomicBool::new(false),
            rel_timeout_secs: AtomicI64::new(config.release_timeout_secs),
            last_add: Mutex::new(Instant::now()),
            cooldown_timer: Mutex::new(None),
            workers: Mutex::new(Vec::new()),
            counters: LifetimeCounters::default(),
        });

        {
            let mut workers = shared.workers.lock();
            for (idx, entry) in shared.entries.iter().enumerate() {
                workers.push(tokio::spawn(entry_worker(
                    Arc::downgrade(&shared),
                    idx,
                    entry.wakeup(),
                )));
            }
        }

        // Start filling every class toward its high-water mark.
        for entry in shared.entries.iter() {
            entry.kick();
        }

        info!("Key cache started with {} size classes", shared.entries.len());
        Ok(Self { shared })
    }

    /// Checks out a pooled key for `order`, or `None` when the pool is
    /// empty, the order is above the cached range, or the cache has
    /// stopped.
    ///
    /// Orders below the cached range are clamped onto the smallest
    /// class. A miss rings the entry's doorbell so the background fill
    /// replenishes behind the caller's slow path; the caller is
    /// expected to fall back to a direct, uncached registration.
    pub fn get(&self, order: u8) -> Option<CachedKey> {
        let shared = &self.shared;
        if shared.stopped() {
            return None;
        }
        let Some(idx) = shared.order2idx(order) else {
            trace!("Order {order} is above the cached range");
            return None;
        };
        shared.counters.checkouts.fetch_add(1, Ordering::Relaxed);
        let entry = &shared.entries[idx];
        let key = entry.checkout();
        if key.is_none() {
            shared.counters.misses.fetch_add(1, Ordering::Relaxed);
            entry.kick();
        }
        key
    }

    /// Returns a checked-out key to its pool.
    ///
    /// After [`shutdown`](Self::shutdown) the key is destroyed instead
    /// of pooled. Crossing the high-water mark rings the doorbell so
    /// the trim policy decides the key's fate.
    pub async fn put(&self, key: CachedKey) {
        let shared = &self.shared;
        let Some(idx) = shared.order2idx(key.order()) else {
            warn!(
                "Released key {} has order {} outside the cached range, destroying",
                key.handle(),
                key.order()
            );
            shared.retire_key(key).await;
            return;
        };
        if shared.stopped() {
            debug!("Cache stopped, destroying released key {}", key.handle());
            shared.entries[idx].lock().cur -= 1;
            shared.retire_key(key).await;
            return;
        }
        shared.counters.releases.fetch_add(1, Ordering::Relaxed);
        let entry = &shared.entries[idx];
        if entry.release(key) {
            entry.kick();
        }
    }

    /// Adopts an externally created key into the pool for `order`.
    ///
    /// # Errors
    ///
    /// Fails with [`CacheError::Stopped`] after shutdown,
    /// [`CacheError::UnknownOrder`] for orders outside the cached
    /// range, and [`CacheError::DuplicateHandle`] when the handle is
    /// already indexed.
    pub fn seed(&self, handle: KeyHandle, order: u8) -> Result<()> {
        let shared = &self.shared;
        if shared.stopped() {
            return Err(CacheError::Stopped);
        }
        let idx = shared.idx_for(order)?;
        shared
            .index
            .insert(handle, KeyInfo { order })
            .map_err(|_| CacheError::DuplicateHandle(handle))?;
        {
            let mut state = shared.entries[idx].lock();
            state.free.push(CachedKey::new(handle, order));
            state.cur += 1;
        }
        debug!("Seeded key {handle} into order {order}");
        Ok(())
    }

    /// Changes the steady-state limit of one size class.
    ///
    /// Raising the limit issues creations until `cur + pending` covers
    /// the new high-water mark; the call returns once the commands are
    /// issued, not once they complete. Lowering the limit leaves the
    /// surplus to the trim policy. The new limit sticks even when a
    /// grow step fails.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::UnknownOrder`] for orders outside the
    /// cached range, [`CacheError::Stopped`] after shutdown,
    /// [`CacheError::LimitRange`] for limits above
    /// [`MAX_LIMIT`](crate::config::MAX_LIMIT),
    /// [`CacheError::GrowTimeout`] when the device stays busy past the
    /// configured bound, and the underlying [`BackendError`] when a
    /// creation is rejected.
    pub async fn resize_limit(&self, order: u8, new_limit: u32) -> Result<()> {
        let shared = &self.shared;
        let idx = shared.idx_for(order)?;
        if shared.stopped() {
            return Err(CacheError::Stopped);
        }
        if new_limit > MAX_LIMIT {
            return Err(CacheError::LimitRange(new_limit));
        }
        let entry = &shared.entries[idx];

        entry.lock().limit = new_limit;
        debug!("Limit for order {order} set to {new_limit}");

        let started = Instant::now();
        loop {
            match shared.issue_create(idx) {
                IssueOutcome::Covered => break,
                IssueOutcome::Issued => {}
                IssueOutcome::Saturated => {
                    if started.elapsed() >= shared.grow_timeout {
                        return Err(CacheError::GrowTimeout {
                            order,
                            elapsed_ms: u64::try_from(started.elapsed().as_millis())
                                .unwrap_or(u64::MAX),
                        });
                    }
                    time::sleep(shared.busy_retry).await;
                }
                IssueOutcome::Failed(err) => return Err(err.into()),
            }
        }

        // A lowered limit can leave the entry above its new high-water
        // mark; the worker takes it from here.
        entry.kick();
        Ok(())
    }

    /// Resizes one pool to exactly `new_size` keys, synchronously.
    ///
    /// Growth creates keys one at a time with the blocking command
    /// path, retrying while the device reports busy. Shrinking
    /// destroys idle keys; checked-out keys cannot be reclaimed, so a
    /// shrink past the idle supply fails with the remaining shortfall.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::UnknownOrder`] for orders outside the
    /// cached range, [`CacheError::Stopped`] after shutdown,
    /// [`CacheError::SizeBelowLimit`] when `new_size` undercuts the
    /// entry's limit, [`CacheError::KeysBusy`] when a shrink runs out
    /// of idle keys, [`CacheError::GrowTimeout`] when the device stays
    /// busy past the configured bound, and the underlying
    /// [`BackendError`] when a creation is rejected.
    pub async fn resize_pool(&self, order: u8, new_size: u32) -> Result<()> {
        let shared = &self.shared;
        let idx = shared.idx_for(order)?;
        if shared.stopped() {
            return Err(CacheError::Stopped);
        }
        let entry = &shared.entries[idx];

        {
            let state = entry.lock();
            if new_size < state.limit {
                return Err(CacheError::SizeBelowLimit {
                    order,
                    new_size,
                    limit: state.limit,
                });
            }
        }

        let started = Instant::now();
        loop {
            let cur = entry.lock().cur;
            if cur == new_size {
                debug!("Pool for order {order} resized to {new_size}");
                return Ok(());
            }
            if cur < new_size {
                match shared.backend.create_key_sync(order).await {
                    Ok(handle) => {
                        if shared.index.insert(handle, KeyInfo { order }).is_err() {
                            error!("Device returned duplicate handle {handle}, destroying key");
                            if let Err(err) = shared.backend.destroy_key(handle).await {
                                warn!("Destroying key {handle} failed: {err}");
                            }
                            return Err(CacheError::DuplicateHandle(handle));
                        }
                        {
                            let mut state = entry.lock();
                            state.free.push(CachedKey::new(handle, order));
                            state.cur += 1;
                        }
                        shared.counters.created.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(err) if err.is_busy() => {
                        if started.elapsed() >= shared.grow_timeout {
                            return Err(CacheError::GrowTimeout {
                                order,
                                elapsed_ms: u64::try_from(started.elapsed().as_millis())
                                    .unwrap_or(u64::MAX),
                            });
                        }
                        time::sleep(shared.busy_retry).await;
                    }
                    Err(err) => return Err(err.into()),
                }
            } else {
                let Some(key) = entry.take_idle() else {
                    // `cur` can move under a concurrent post-stop
                    // release; the loop-head snapshot is strictly
                    // above `new_size`.
                    return Err(CacheError::KeysBusy { order, missing: cur - new_size });
                };
                shared.retire_key(key).await;
            }
        }
    }

    /// Requests an immediate trim of every entry above its high-water
    /// mark, bypassing the release window. The flag clears itself once
    /// no entry is left above water.
    pub fn set_rel_imm(&self, value: bool) {
        let shared = &self.shared;
        if !value {
            shared.rel_imm.store(false, Ordering::Relaxed);
            return;
        }
        shared.rel_imm.store(true, Ordering::Relaxed);
        let mut kicked = false;
        for entry in shared.entries.iter() {
            let over_water = {
                let state = entry.lock();
                state.cur > 2 * state.limit
            };
            if over_water {
                entry.kick();
                kicked = true;
            }
        }
        if !kicked {
            // Nothing to trim, the request is already satisfied.
            shared.rel_imm.store(false, Ordering::Relaxed);
        }
    }

    /// Whether an immediate trim is still in progress.
    pub fn rel_imm(&self) -> bool {
        self.shared.rel_imm.load(Ordering::Relaxed)
    }

    /// Sets the release window in seconds. `-1` disables deferred
    /// trimming entirely; `0` trims as soon as the cache goes quiet.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::ReleaseTimeoutRange`] when `secs` is
    /// outside `-1..=600`.
    pub fn set_rel_timeout(&self, secs: i64) -> Result<()> {
        if !(-1..=MAX_RELEASE_TIMEOUT_SECS).contains(&secs) {
            return Err(CacheError::ReleaseTimeoutRange(secs));
        }
        self.shared.rel_timeout_secs.store(secs, Ordering::Relaxed);
        debug!("Release timeout set to {secs}s");
        if secs >= 0 {
            for entry in self.shared.entries.iter() {
                let over_water = {
                    let state = entry.lock();
                    state.cur > 2 * state.limit
                };
                if over_water {
                    entry.kick();
                }
            }
        }
        Ok(())
    }

    /// Current release window in seconds, `-1` when disabled.
    pub fn rel_timeout(&self) -> i64 {
        self.shared.rel_timeout_secs.load(Ordering::Relaxed)
    }

    /// Steady-state limit of one size class.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::UnknownOrder`] for orders outside the
    /// cached range.
    pub fn limit(&self, order: u8) -> Result<u32> {
        let idx = self.shared.idx_for(order)?;
        Ok(self.shared.entries[idx].watermarks().1)
    }

    /// Number of keys owned by one size class, pooled and checked out.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::UnknownOrder`] for orders outside the
    /// cached range.
    pub fn cur(&self, order: u8) -> Result<u32> {
        let idx = self.shared.idx_for(order)?;
        Ok(self.shared.entries[idx].watermarks().0)
    }

    /// Checkout misses of one size class since the last reset.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::UnknownOrder`] for orders outside the
    /// cached range.
    pub fn miss(&self, order: u8) -> Result<u64> {
        let idx = self.shared.idx_for(order)?;
        Ok(self.shared.entries[idx].lock().miss)
    }

    /// Resets the miss counter of one size class.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::UnknownOrder`] for orders outside the
    /// cached range.
    pub fn reset_miss(&self, order: u8) -> Result<()> {
        let idx = self.shared.idx_for(order)?;
        self.shared.entries[idx].lock().miss = 0;
        Ok(())
    }

    /// Whether the cache has been shut down.
    pub fn is_stopped(&self) -> bool {
        self.shared.stopped()
    }

    /// The handle index shared with completion routing.
    pub fn index(&self) -> &Arc<KeyIndex> {
        &self.shared.index
    }

    /// Snapshot of every entry's watermarks plus the lifetime
    /// counters.
    pub fn stats(&self) -> CacheStats {
        self.shared.snapshot()
    }

    /// Snapshot of one size class.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::UnknownOrder`] for orders outside the
    /// cached range.
    pub fn entry_stats(&self, order: u8) -> Result<EntryStats> {
        let idx = self.shared.idx_for(order)?;
        Ok(self.shared.entries[idx].stats())
    }

    /// Stops the cache and destroys every idle key.
    ///
    /// Workers and the cooldown timer are cancelled, idle keys are
    /// destroyed on the device, and in-flight creations get a bounded
    /// grace period to land; stragglers complete against the stopped
    /// cache and destroy their own keys. Checked-out keys are
    /// destroyed as they come back through [`put`](Self::put).
    ///
    /// Calling `shutdown` more than once is harmless.
    pub async fn shutdown(&self) {
        let shared = &self.shared;
        if shared.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Stopping key cache");

        if let Some(timer) = shared.cooldown_timer.lock().take() {
            timer.abort();
        }
        for worker in shared.workers.lock().drain(..) {
            worker.abort();
        }

        let mut idle_destroyed = 0_u64;
        for entry in shared.entries.iter() {
            while let Some(key) = entry.take_idle() {
                shared.retire_key(key).await;
                idle_destroyed += 1;
            }
        }

        let mut rounds = 0;
        let residual = loop {
            let pending: u32 = shared.entries.iter().map(|entry| entry.lock().pending).sum();
            if pending == 0 {
                break 0;
            }
            if rounds >= shared.drain_rounds {
                break pending;
            }
            rounds += 1;
            time::sleep(shared.drain_interval).await;
        };
        if residual > 0 {
            warn!("Gave up waiting on {residual} in-flight creation(s) at teardown");
        }
        info!("Key cache stopped, destroyed {idle_destroyed} idle key(s)");
    }
}

impl Drop for KeyCache {
    fn drop(&mut self) {
        if self.shared.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        // No async context here, so only cancel the background tasks.
        // Keys still pooled are not destroyed; call `shutdown` for a
        // clean teardown.
        if let Some(timer) = self.shared.cooldown_timer.lock().take() {
            timer.abort();
        }
        for worker in self.shared.workers.lock().drain(..) {
            worker.abort();
        }
    }
}
