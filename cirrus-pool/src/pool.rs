//! Bounded per-destination resource pool.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use parking_lot::Mutex;
use tokio::task::AbortHandle;
use tokio::time::{Instant, MissedTickBehavior};

use cirrus_core::{Callback, Cancellable, TransportError};

use crate::config::{PoolConfig, Strategy};
use crate::handle::{AsyncPool, PoolHandle, Recycle};
use crate::lifecycle::Lifecycle;
use crate::rate_limiter::RateLimiter;
use crate::stats::{LatencyTracker, PoolStats};

/// Lifecycle phase of a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolState {
    /// Created but not started; `get` fails.
    NotStarted,
    /// Serving requests.
    Running,
    /// Refusing requests and draining checked-out resources.
    ShuttingDown,
    /// Shut down.
    Stopped,
}

struct Idle<R> {
    resource: R,
    created: Instant,
    idle_since: Instant,
}

struct Waiter<R: Send + 'static> {
    callback: Callback<PoolHandle<R>>,
    since: Instant,
}

#[derive(Debug, Default)]
struct Counters {
    created: u64,
    destroyed: u64,
    create_errors: u64,
    destroy_errors: u64,
    bad_destroyed: u64,
    timed_out: u64,
    create_ignored: u64,
    waiters_cancelled: u64,
    sample_max_pool_size: usize,
    max_outstanding: usize,
}

struct State<R: Send + 'static> {
    phase: PoolState,
    /// Idle, checked out, creating, awaiting a creation permit, or being
    /// destroyed.
    pool_size: usize,
    checked_out: usize,
    creating: usize,
    pending_creates: usize,
    idle: VecDeque<Idle<R>>,
    waiters: BTreeMap<u64, Waiter<R>>,
    next_waiter: u64,
    shutdown: Option<Callback<()>>,
    shutdown_timer: Option<AbortHandle>,
    reaper: Option<AbortHandle>,
    retry_scheduled: bool,
    counters: Counters,
    creation_latency: LatencyTracker,
    wait_latency: LatencyTracker,
}

impl<R: Send + 'static> State<R> {
    fn checkout(&mut self) {
        self.checked_out += 1;
        self.counters.max_outstanding = self.counters.max_outstanding.max(self.checked_out);
    }

    fn pop_waiter(&mut self) -> Option<Waiter<R>> {
        self.waiters.pop_first().map(|(_, waiter)| waiter)
    }

    /// Reserve pool slots for creations the current demand calls for.
    fn reserve_creates(&mut self, config: &PoolConfig) {
        while self.phase == PoolState::Running
            && self.pool_size < config.max_size
            && (self.waiters.len() > self.creating + self.pending_creates
                || self.pool_size < config.min_size)
        {
            self.pool_size += 1;
            self.pending_creates += 1;
        }
        self.counters.sample_max_pool_size = self.counters.sample_max_pool_size.max(self.pool_size);
    }

    fn shutdown_ready(&self) -> bool {
        self.phase == PoolState::ShuttingDown
            && self.shutdown.is_some()
            && self.pool_size == self.idle.len()
    }
}

struct PoolInner<L: Lifecycle> {
    name: Arc<str>,
    config: PoolConfig,
    lifecycle: L,
    limiter: RateLimiter,
    state: Mutex<State<L::Resource>>,
}

/// A bounded pool of resources for one destination.
///
/// Resources are created on demand through a [`Lifecycle`], gated by a
/// [`RateLimiter`], and handed out through [`PoolHandle`]s. Callers that
/// find nothing idle are queued and served strictly in arrival order, by a
/// returned resource or a new one, whichever comes first.
///
/// The pool lock is never held while calling into the lifecycle or a
/// caller's callback.
///
/// ## Example
///
/// ```rust
/// use cirrus_core::TransportError;
/// use cirrus_pool::{AcquireExt, AsyncPool, Lifecycle, PoolConfig, ResourcePool};
/// use std::time::Duration;
///
/// struct Numbers;
///
/// impl Lifecycle for Numbers {
///     type Resource = u32;
///
///     async fn create(&self) -> Result<u32, TransportError> {
///         Ok(1)
///     }
///
///     async fn destroy(&self, _n: u32, _error: bool) -> Result<(), TransportError> {
///         Ok(())
///     }
/// }
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), TransportError> {
/// let pool = ResourcePool::new("numbers", PoolConfig::new().max_size(4), Numbers);
/// pool.start();
///
/// let n = pool.acquire(Duration::from_secs(1)).await?;
/// assert_eq!(*n, 1);
/// n.release();
/// # Ok(())
/// # }
/// ```
pub struct ResourcePool<L: Lifecycle> {
    inner: Arc<PoolInner<L>>,
}

impl<L: Lifecycle> Clone for ResourcePool<L> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<L: Lifecycle> fmt::Debug for ResourcePool<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("ResourcePool")
            .field("name", &self.inner.name)
            .field("phase", &state.phase)
            .field("pool_size", &state.pool_size)
            .field("idle", &state.idle.len())
            .field("checked_out", &state.checked_out)
            .field("waiters", &state.waiters.len())
            .finish()
    }
}

impl<L: Lifecycle> ResourcePool<L> {
    /// Create a pool. Call [`AsyncPool::start`] before use.
    #[must_use]
    pub fn new(name: impl Into<Arc<str>>, config: PoolConfig, lifecycle: L) -> Self {
        let limiter = RateLimiter::new(config.rate_limiter.clone());
        Self {
            inner: Arc::new(PoolInner {
                name: name.into(),
                config,
                lifecycle,
                limiter,
                state: Mutex::new(State {
                    phase: PoolState::NotStarted,
                    pool_size: 0,
                    checked_out: 0,
                    creating: 0,
                    pending_creates: 0,
                    idle: VecDeque::new(),
                    waiters: BTreeMap::new(),
                    next_waiter: 0,
                    shutdown: None,
                    shutdown_timer: None,
                    reaper: None,
                    retry_scheduled: false,
                    counters: Counters::default(),
                    creation_latency: LatencyTracker::new(),
                    wait_latency: LatencyTracker::new(),
                }),
            }),
        }
    }

    #[must_use]
    pub fn state(&self) -> PoolState {
        self.inner.state.lock().phase
    }

    #[must_use]
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    #[must_use]
    pub fn lifecycle(&self) -> &L {
        &self.inner.lifecycle
    }

    #[must_use]
    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.inner.limiter
    }
}

impl<L: Lifecycle> AsyncPool<L::Resource> for ResourcePool<L> {
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn start(&self) {
        self.inner.start();
    }

    fn get(&self, callback: Callback<PoolHandle<L::Resource>>) -> Cancellable {
        self.inner.get(callback)
    }

    fn shutdown(&self, callback: Callback<()>) {
        self.inner.shutdown(callback);
    }

    fn cancel_waiters(&self) -> Vec<Callback<PoolHandle<L::Resource>>> {
        let waiters = std::mem::take(&mut self.inner.state.lock().waiters);
        waiters.into_values().map(|w| w.callback).collect()
    }

    fn stats(&self) -> PoolStats {
        self.inner.stats()
    }
}

impl<L: Lifecycle> Recycle<L::Resource> for PoolInner<L> {
    fn put(self: Arc<Self>, resource: L::Resource, created: Instant) {
        if !self.lifecycle.validate_put(&resource) {
            tracing::debug!(pool = %self.name, "returned resource failed validation");
            self.discard(resource);
            return;
        }
        // a full request lifecycle completed, so the destination is healthy
        self.limiter.reset_backoff();

        let mut state = self.state.lock();
        if state.phase != PoolState::Running {
            state.checked_out -= 1;
            drop(state);
            self.destroy(resource, false);
            return;
        }

        if let Some(waiter) = state.pop_waiter() {
            state.wait_latency.record(waiter.since.elapsed());
            drop(state);
            (waiter.callback)(Ok(self.handle(resource, created)));
            return;
        }

        state.checked_out -= 1;
        state.idle.push_back(Idle {
            resource,
            created,
            idle_since: Instant::now(),
        });
    }

    fn dispose(self: Arc<Self>, resource: L::Resource, _created: Instant) {
        self.discard(resource);
    }
}

impl<L: Lifecycle> PoolInner<L> {
    fn handle(self: &Arc<Self>, resource: L::Resource, created: Instant) -> PoolHandle<L::Resource> {
        let pool: Arc<dyn Recycle<L::Resource>> = self.clone();
        PoolHandle::new(resource, created, pool)
    }

    fn start(self: &Arc<Self>) {
        let mut state = self.state.lock();
        if state.phase != PoolState::NotStarted {
            return;
        }
        state.phase = PoolState::Running;
        state.reserve_creates(&self.config);
        state.reaper = Some(self.spawn_reaper());
        drop(state);

        tracing::debug!(pool = %self.name, min_size = self.config.min_size, "pool started");
        self.start_creates();
    }

    fn spawn_reaper(self: &Arc<Self>) -> AbortHandle {
        let weak = Arc::downgrade(self);
        let period = self.config.reap_interval();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                inner.reap();
            }
        })
        .abort_handle()
    }

    fn get(self: &Arc<Self>, callback: Callback<PoolHandle<L::Resource>>) -> Cancellable {
        loop {
            let mut state = self.state.lock();
            match state.phase {
                PoolState::Running => {}
                PoolState::ShuttingDown => {
                    drop(state);
                    callback(Err(TransportError::ShuttingDown(self.name.clone())));
                    return Cancellable::noop();
                }
                PoolState::NotStarted | PoolState::Stopped => {
                    drop(state);
                    callback(Err(TransportError::NotRunning(self.name.clone())));
                    return Cancellable::noop();
                }
            }

            let candidate = match self.config.strategy {
                Strategy::Mru => state.idle.pop_back(),
                Strategy::Lru => state.idle.pop_front(),
            };
            if let Some(idle) = candidate {
                state.checkout();
                drop(state);

                if self.lifecycle.validate_get(&idle.resource) {
                    callback(Ok(self.handle(idle.resource, idle.created)));
                    return Cancellable::noop();
                }
                tracing::debug!(pool = %self.name, "idle resource failed validation");
                self.discard(idle.resource);
                continue;
            }

            if state.waiters.len() >= self.config.max_waiters {
                drop(state);
                callback(Err(TransportError::WaitersExceeded {
                    pool: self.name.clone(),
                    max: self.config.max_waiters,
                }));
                return Cancellable::noop();
            }

            let id = state.next_waiter;
            state.next_waiter += 1;
            state.waiters.insert(
                id,
                Waiter {
                    callback,
                    since: Instant::now(),
                },
            );
            state.reserve_creates(&self.config);
            drop(state);

            self.start_creates();

            let weak = Arc::downgrade(self);
            return Cancellable::new(move || {
                weak.upgrade()
                    .is_some_and(|inner| inner.cancel_waiter(id))
            });
        }
    }

    fn cancel_waiter(&self, id: u64) -> bool {
        let mut state = self.state.lock();
        let removed = state.waiters.remove(&id);
        if removed.is_some() {
            state.counters.waiters_cancelled += 1;
        }
        drop(state);
        removed.is_some()
    }

    /// Start every reserved creation the rate limiter allows.
    fn start_creates(self: &Arc<Self>) {
        loop {
            let mut state = self.state.lock();
            if state.pending_creates == 0 {
                return;
            }

            let needed = state.phase == PoolState::Running
                && (state.waiters.len() > state.creating
                    || state.pool_size <= self.config.min_size);
            if !needed {
                state.pending_creates -= 1;
                state.pool_size -= 1;
                state.counters.create_ignored += 1;
                drop(state);
                tracing::debug!(pool = %self.name, "dropping creation nobody needs");
                self.check_shutdown();
                continue;
            }

            if !self.limiter.try_acquire() {
                if state.retry_scheduled {
                    return;
                }
                match self.limiter.retry_after() {
                    Some(delay) => {
                        state.retry_scheduled = true;
                        drop(state);
                        self.schedule_retry(delay);
                        return;
                    }
                    // the backoff window closed in between
                    None if self.limiter.in_flight() == 0 => continue,
                    None => return,
                }
            }

            state.pending_creates -= 1;
            state.creating += 1;
            drop(state);
            self.spawn_create();
        }
    }

    fn schedule_retry(self: &Arc<Self>, delay: Duration) {
        let inner = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            inner.state.lock().retry_scheduled = false;
            inner.start_creates();
        });
    }

    fn spawn_create(self: &Arc<Self>) {
        let inner = self.clone();
        tokio::spawn(async move {
            let started = Instant::now();
            let timeout = inner.config.creation_timeout;
            let result = match tokio::time::timeout(timeout, inner.lifecycle.create()).await {
                Ok(result) => result,
                Err(_) => Err(TransportError::Timeout(timeout)),
            };

            match result {
                Ok(resource) => {
                    inner.limiter.on_success();
                    inner.on_created(resource, started);
                }
                Err(e) => {
                    inner.limiter.on_failure();
                    inner.on_create_failed(e);
                }
            }
            inner.start_creates();
        });
    }

    fn on_created(self: &Arc<Self>, resource: L::Resource, started: Instant) {
        let now = Instant::now();
        let mut state = self.state.lock();
        state.creating -= 1;
        state.counters.created += 1;
        state.creation_latency.record(now - started);
        tracing::debug!(pool = %self.name, latency = ?(now - started), "resource created");

        if state.phase != PoolState::Running {
            drop(state);
            self.destroy(resource, false);
            return;
        }

        if let Some(waiter) = state.pop_waiter() {
            state.checkout();
            state.wait_latency.record(now - waiter.since);
            drop(state);
            (waiter.callback)(Ok(self.handle(resource, now)));
            return;
        }

        if state.idle.len() + state.checked_out >= self.config.min_size {
            drop(state);
            tracing::debug!(pool = %self.name, "no waiter for created resource");
            self.destroy(resource, false);
            return;
        }

        state.idle.push_back(Idle {
            resource,
            created: now,
            idle_since: now,
        });
    }

    fn on_create_failed(self: &Arc<Self>, error: TransportError) {
        let mut state = self.state.lock();
        state.creating -= 1;
        state.pool_size -= 1;
        state.counters.create_errors += 1;
        let waiter = state.pop_waiter();
        state.reserve_creates(&self.config);
        drop(state);

        tracing::debug!(pool = %self.name, error = %error, "resource creation failed");
        if let Some(waiter) = waiter {
            (waiter.callback)(Err(error));
        }
        self.check_shutdown();
    }

    /// Destroy a checked-out resource that is broken.
    fn discard(self: &Arc<Self>, resource: L::Resource) {
        {
            let mut state = self.state.lock();
            state.checked_out -= 1;
            state.counters.bad_destroyed += 1;
        }
        self.destroy(resource, true);
    }

    /// Destroy a resource that is no longer counted as idle or checked out.
    fn destroy(self: &Arc<Self>, resource: L::Resource, error: bool) {
        let inner = self.clone();
        tokio::spawn(async move {
            let result = inner.lifecycle.destroy(resource, error).await;
            if let Err(e) = &result {
                tracing::error!(pool = %inner.name, error = %e, "failed to destroy resource");
            }
            inner.on_destroyed(result.is_err());
        });
    }

    fn on_destroyed(self: &Arc<Self>, failed: bool) {
        let mut state = self.state.lock();
        state.pool_size -= 1;
        state.counters.destroyed += 1;
        if failed {
            state.counters.destroy_errors += 1;
        }
        state.reserve_creates(&self.config);
        drop(state);

        self.start_creates();
        self.check_shutdown();
    }

    fn reap(self: &Arc<Self>) {
        let now = Instant::now();
        let mut expired = Vec::new();
        {
            let mut state = self.state.lock();
            if state.phase != PoolState::Running {
                return;
            }
            while let Some(front) = state.idle.front() {
                if now.duration_since(front.idle_since) < self.config.idle_timeout
                    || state.idle.len() + state.checked_out <= self.config.min_size
                {
                    break;
                }
                if let Some(idle) = state.idle.pop_front() {
                    expired.push(idle.resource);
                }
            }
            state.counters.timed_out += expired.len() as u64;
        }

        if !expired.is_empty() {
            tracing::debug!(pool = %self.name, count = expired.len(), "reaping idle resources");
        }
        for resource in expired {
            self.destroy(resource, false);
        }
    }

    fn shutdown(self: &Arc<Self>, callback: Callback<()>) {
        let mut state = self.state.lock();
        if state.phase != PoolState::Running {
            drop(state);
            callback(Err(TransportError::NotRunning(self.name.clone())));
            return;
        }

        state.phase = PoolState::ShuttingDown;
        state.shutdown = Some(callback);
        let waiters = std::mem::take(&mut state.waiters);
        if let Some(reaper) = state.reaper.take() {
            reaper.abort();
        }
        state.shutdown_timer = Some(self.spawn_shutdown_timer());
        drop(state);

        tracing::info!(pool = %self.name, waiters = waiters.len(), "pool shutting down");
        for waiter in waiters.into_values() {
            (waiter.callback)(Err(TransportError::ShuttingDown(self.name.clone())));
        }

        self.start_creates();
        self.check_shutdown();
    }

    fn spawn_shutdown_timer(self: &Arc<Self>) -> AbortHandle {
        let inner = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(inner.config.shutdown_timeout).await;
            inner.force_shutdown();
        })
        .abort_handle()
    }

    /// Finish shutdown once only idle resources remain.
    fn check_shutdown(self: &Arc<Self>) {
        let mut state = self.state.lock();
        if !state.shutdown_ready() {
            return;
        }
        let Some(callback) = state.shutdown.take() else {
            return;
        };
        let idle = std::mem::take(&mut state.idle);
        if let Some(timer) = state.shutdown_timer.take() {
            timer.abort();
        }
        drop(state);

        let inner = self.clone();
        tokio::spawn(async move {
            inner.destroy_all(idle).await;
            inner.state.lock().phase = PoolState::Stopped;
            tracing::info!(pool = %inner.name, "pool shut down");
            callback(Ok(()));
        });
    }

    fn force_shutdown(self: &Arc<Self>) {
        let mut state = self.state.lock();
        let Some(callback) = state.shutdown.take() else {
            return;
        };
        state.phase = PoolState::Stopped;
        state.shutdown_timer = None;
        let idle = std::mem::take(&mut state.idle);
        let outstanding = state.checked_out;
        drop(state);

        tracing::warn!(
            pool = %self.name,
            outstanding,
            timeout = ?self.config.shutdown_timeout,
            "pool shutdown timed out"
        );
        let inner = self.clone();
        tokio::spawn(async move {
            inner.destroy_all(idle).await;
        });
        callback(Err(TransportError::Timeout(self.config.shutdown_timeout)));
    }

    async fn destroy_all(&self, idle: VecDeque<Idle<L::Resource>>) {
        let results = join_all(
            idle.into_iter()
                .map(|idle| self.lifecycle.destroy(idle.resource, false)),
        )
        .await;

        let failed = results.iter().filter(|r| r.is_err()).count();
        if failed > 0 {
            tracing::error!(pool = %self.name, failed, "failed to destroy idle resources");
        }

        let mut state = self.state.lock();
        state.pool_size = state.pool_size.saturating_sub(results.len());
        state.counters.destroyed += results.len() as u64;
        state.counters.destroy_errors += failed as u64;
    }

    fn stats(&self) -> PoolStats {
        let state = self.state.lock();
        let c = &state.counters;
        PoolStats {
            total_created: c.created,
            total_destroyed: c.destroyed,
            total_create_errors: c.create_errors,
            total_destroy_errors: c.destroy_errors,
            total_bad_destroyed: c.bad_destroyed,
            total_timed_out: c.timed_out,
            total_create_ignored: c.create_ignored,
            total_waiters_cancelled: c.waiters_cancelled,
            max_pool_size: self.config.max_size,
            min_pool_size: self.config.min_size,
            pool_size: state.pool_size,
            sample_max_pool_size: c.sample_max_pool_size,
            idle: state.idle.len(),
            outstanding: state.checked_out,
            max_outstanding: c.max_outstanding,
            waiters: state.waiters.len(),
            creation_latency: state.creation_latency.snapshot(),
            wait_latency: state.wait_latency.snapshot(),
            lifecycle: self.lifecycle.stats(),
        }
    }
}
