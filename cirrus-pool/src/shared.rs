//! Pool of a single resource shared by every caller.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::AbortHandle;
use tokio::time::{Instant, MissedTickBehavior};

use cirrus_core::{Callback, Cancellable, TransportError};

use crate::config::PoolConfig;
use crate::handle::{AsyncPool, PoolHandle, Recycle};
use crate::lifecycle::Lifecycle;
use crate::pool::PoolState;
use crate::rate_limiter::RateLimiter;
use crate::stats::{LatencyTracker, PoolStats};

struct Entry<R> {
    item: R,
    refs: usize,
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
    waiters_cancelled: u64,
    max_outstanding: usize,
}

struct State<R: Send + 'static> {
    phase: PoolState,
    current: Option<Entry<R>>,
    /// Disposed items still checked out by someone.
    retired: Vec<Entry<R>>,
    creating: bool,
    retry_scheduled: bool,
    waiters: BTreeMap<u64, Waiter<R>>,
    next_waiter: u64,
    shutdown: Option<Callback<()>>,
    shutdown_timer: Option<AbortHandle>,
    reaper: Option<AbortHandle>,
    counters: Counters,
    creation_latency: LatencyTracker,
    wait_latency: LatencyTracker,
}

impl<R: Send + 'static> State<R> {
    fn outstanding(&self) -> usize {
        self.current.as_ref().map_or(0, |e| e.refs) + self.retired.iter().map(|e| e.refs).sum::<usize>()
    }

    fn track_outstanding(&mut self) {
        let outstanding = self.outstanding();
        self.counters.max_outstanding = self.counters.max_outstanding.max(outstanding);
    }

    fn shutdown_ready(&self) -> bool {
        self.phase == PoolState::ShuttingDown
            && self.shutdown.is_some()
            && !self.creating
            && self.retired.is_empty()
            && self.current.as_ref().map_or(true, |e| e.refs == 0)
    }
}

struct SharedInner<L: Lifecycle> {
    name: Arc<str>,
    config: PoolConfig,
    lifecycle: L,
    limiter: RateLimiter,
    state: Mutex<State<L::Resource>>,
}

/// A pool holding at most one live resource, checked out by any number of
/// callers at once.
///
/// Used for multiplexed connections: every caller receives a handle to the
/// same resource. All callers that arrive while no resource exists share one
/// creation and all fail together if it fails. Disposing a handle retires
/// the resource; the next `get` creates a fresh one, and the retired
/// resource is destroyed once its last handle comes back.
///
/// Only `max_waiters`, `idle_timeout`, `shutdown_timeout`,
/// `creation_timeout` and the rate limiter settings of [`PoolConfig`] apply.
pub struct SharedPool<L: Lifecycle>
where
    L::Resource: Clone + PartialEq,
{
    inner: Arc<SharedInner<L>>,
}

impl<L: Lifecycle> Clone for SharedPool<L>
where
    L::Resource: Clone + PartialEq,
{
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<L: Lifecycle> fmt::Debug for SharedPool<L>
where
    L::Resource: Clone + PartialEq,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("SharedPool")
            .field("name", &self.inner.name)
            .field("phase", &state.phase)
            .field("live", &state.current.is_some())
            .field("outstanding", &state.outstanding())
            .field("waiters", &state.waiters.len())
            .finish()
    }
}

impl<L: Lifecycle> SharedPool<L>
where
    L::Resource: Clone + PartialEq,
{
    /// Create a pool. Call [`AsyncPool::start`] before use.
    #[must_use]
    pub fn new(name: impl Into<Arc<str>>, config: PoolConfig, lifecycle: L) -> Self {
        let limiter = RateLimiter::new(config.rate_limiter.clone());
        Self {
            inner: Arc::new(SharedInner {
                name: name.into(),
                config,
                lifecycle,
                limiter,
                state: Mutex::new(State {
                    phase: PoolState::NotStarted,
                    current: None,
                    retired: Vec::new(),
                    creating: false,
                    retry_scheduled: false,
                    waiters: BTreeMap::new(),
                    next_waiter: 0,
                    shutdown: None,
                    shutdown_timer: None,
                    reaper: None,
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
    pub fn lifecycle(&self) -> &L {
        &self.inner.lifecycle
    }
}

impl<L: Lifecycle> AsyncPool<L::Resource> for SharedPool<L>
where
    L::Resource: Clone + PartialEq,
{
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

impl<L: Lifecycle> Recycle<L::Resource> for SharedInner<L>
where
    L::Resource: Clone + PartialEq,
{
    fn put(self: Arc<Self>, item: L::Resource, _created: Instant) {
        self.check_in(item, false);
    }

    fn dispose(self: Arc<Self>, item: L::Resource, _created: Instant) {
        self.check_in(item, true);
    }
}

impl<L: Lifecycle> SharedInner<L>
where
    L::Resource: Clone + PartialEq,
{
    fn handle(self: &Arc<Self>, item: L::Resource, created: Instant) -> PoolHandle<L::Resource> {
        let pool: Arc<dyn Recycle<L::Resource>> = self.clone();
        PoolHandle::new(item, created, pool)
    }

    fn start(self: &Arc<Self>) {
        let mut state = self.state.lock();
        if state.phase != PoolState::NotStarted {
            return;
        }
        state.phase = PoolState::Running;

        let weak = Arc::downgrade(self);
        let period = self.config.reap_interval();
        let reaper = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                inner.reap();
            }
        });
        state.reaper = Some(reaper.abort_handle());
        drop(state);

        tracing::debug!(pool = %self.name, "shared pool started");
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

            if let Some(entry) = state.current.as_mut() {
                entry.refs += 1;
                let (item, created) = (entry.item.clone(), entry.created);
                state.track_outstanding();
                drop(state);

                if self.lifecycle.validate_get(&item) {
                    callback(Ok(self.handle(item, created)));
                    return Cancellable::noop();
                }
                tracing::debug!(pool = %self.name, "shared resource failed validation");
                self.check_in(item, true);
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
            let create = !state.creating;
            state.creating = true;
            drop(state);

            if create {
                self.try_create();
            }

            let weak = Arc::downgrade(self);
            return Cancellable::new(move || {
                weak.upgrade().is_some_and(|inner| {
                    let mut state = inner.state.lock();
                    let removed = state.waiters.remove(&id).is_some();
                    if removed {
                        state.counters.waiters_cancelled += 1;
                    }
                    removed
                })
            });
        }
    }

    /// Start the shared creation once the rate limiter allows it.
    fn try_create(self: &Arc<Self>) {
        if self.limiter.try_acquire() {
            self.spawn_create();
            return;
        }

        let mut state = self.state.lock();
        if state.retry_scheduled {
            return;
        }
        state.retry_scheduled = true;
        drop(state);

        let delay = self
            .limiter
            .retry_after()
            .unwrap_or(self.config.rate_limiter.initial_backoff);
        let inner = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            inner.state.lock().retry_scheduled = false;
            inner.try_create();
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
                Ok(item) => {
                    inner.limiter.on_success();
                    inner.on_created(item, started);
                }
                Err(e) => {
                    inner.limiter.on_failure();
                    inner.on_create_failed(e);
                }
            }
        });
    }

    fn on_created(self: &Arc<Self>, item: L::Resource, started: Instant) {
        let now = Instant::now();
        let mut state = self.state.lock();
        state.creating = false;
        state.counters.created += 1;
        state.creation_latency.record(now - started);

        if state.phase != PoolState::Running {
            drop(state);
            self.destroy(item, false);
            self.check_shutdown();
            return;
        }

        let waiters = std::mem::take(&mut state.waiters);
        for waiter in waiters.values() {
            state.wait_latency.record(now - waiter.since);
        }
        state.current = Some(Entry {
            item: item.clone(),
            refs: waiters.len(),
            created: now,
            idle_since: now,
        });
        state.track_outstanding();
        drop(state);

        tracing::debug!(
            pool = %self.name,
            waiters = waiters.len(),
            latency = ?(now - started),
            "shared resource created"
        );
        for waiter in waiters.into_values() {
            (waiter.callback)(Ok(self.handle(item.clone(), now)));
        }
    }

    fn on_create_failed(self: &Arc<Self>, error: TransportError) {
        let mut state = self.state.lock();
        state.creating = false;
        state.counters.create_errors += 1;
        let waiters = std::mem::take(&mut state.waiters);
        drop(state);

        tracing::debug!(
            pool = %self.name,
            waiters = waiters.len(),
            error = %error,
            "shared resource creation failed"
        );
        for waiter in waiters.into_values() {
            (waiter.callback)(Err(error.clone()));
        }
        self.check_shutdown();
    }

    /// Return one checkout of `item`; `broken` retires the item.
    fn check_in(self: &Arc<Self>, item: L::Resource, broken: bool) {
        let broken = broken || !self.lifecycle.validate_put(&item);
        let mut state = self.state.lock();
        let now = Instant::now();

        let is_current = state.current.as_ref().is_some_and(|e| e.item == item);
        if is_current {
            if broken {
                if let Some(mut entry) = state.current.take() {
                    entry.refs -= 1;
                    state.counters.bad_destroyed += 1;
                    if entry.refs > 0 {
                        state.retired.push(entry);
                    } else {
                        drop(state);
                        self.destroy(entry.item, true);
                        self.check_shutdown();
                        return;
                    }
                }
            } else if let Some(entry) = state.current.as_mut() {
                entry.refs -= 1;
                if entry.refs == 0 {
                    entry.idle_since = now;
                }
                self.limiter.reset_backoff();
            }
            drop(state);
            self.check_shutdown();
            return;
        }

        let Some(pos) = state.retired.iter().position(|e| e.item == item) else {
            return;
        };
        state.retired[pos].refs -= 1;
        if state.retired[pos].refs == 0 {
            let entry = state.retired.swap_remove(pos);
            drop(state);
            self.destroy(entry.item, true);
        } else {
            drop(state);
        }
        self.check_shutdown();
    }

    fn destroy(self: &Arc<Self>, item: L::Resource, error: bool) {
        let inner = self.clone();
        tokio::spawn(async move {
            let result = inner.lifecycle.destroy(item, error).await;
            let mut state = inner.state.lock();
            state.counters.destroyed += 1;
            if let Err(e) = result {
                state.counters.destroy_errors += 1;
                drop(state);
                tracing::error!(pool = %inner.name, error = %e, "failed to destroy shared resource");
            }
        });
    }

    fn reap(self: &Arc<Self>) {
        let mut state = self.state.lock();
        if state.phase != PoolState::Running {
            return;
        }
        let expired = state.current.as_ref().is_some_and(|e| {
            e.refs == 0 && e.idle_since.elapsed() >= self.config.idle_timeout
        });
        if !expired {
            return;
        }
        let entry = state.current.take();
        state.counters.timed_out += 1;
        drop(state);

        if let Some(entry) = entry {
            tracing::debug!(pool = %self.name, "reaping idle shared resource");
            self.destroy(entry.item, false);
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

        let inner = self.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(inner.config.shutdown_timeout).await;
            inner.force_shutdown();
        });
        state.shutdown_timer = Some(timer.abort_handle());
        drop(state);

        tracing::info!(pool = %self.name, waiters = waiters.len(), "shared pool shutting down");
        for waiter in waiters.into_values() {
            (waiter.callback)(Err(TransportError::ShuttingDown(self.name.clone())));
        }
        self.check_shutdown();
    }

    fn check_shutdown(self: &Arc<Self>) {
        let mut state = self.state.lock();
        if !state.shutdown_ready() {
            return;
        }
        let Some(callback) = state.shutdown.take() else {
            return;
        };
        let entry = state.current.take();
        if let Some(timer) = state.shutdown_timer.take() {
            timer.abort();
        }
        drop(state);

        let inner = self.clone();
        tokio::spawn(async move {
            if let Some(entry) = entry {
                let result = inner.lifecycle.destroy(entry.item, false).await;
                let mut state = inner.state.lock();
                state.counters.destroyed += 1;
                if result.is_err() {
                    state.counters.destroy_errors += 1;
                }
            }
            inner.state.lock().phase = PoolState::Stopped;
            tracing::info!(pool = %inner.name, "shared pool shut down");
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
        let outstanding = state.outstanding();
        // still-checked-out entries are destroyed when their handles return
        if let Some(entry) = state.current.take() {
            if entry.refs == 0 {
                drop(state);
                self.destroy(entry.item, false);
            } else {
                state.retired.push(entry);
                drop(state);
            }
        } else {
            drop(state);
        }

        tracing::warn!(
            pool = %self.name,
            outstanding,
            timeout = ?self.config.shutdown_timeout,
            "shared pool shutdown timed out"
        );
        callback(Err(TransportError::Timeout(self.config.shutdown_timeout)));
    }

    fn stats(&self) -> PoolStats {
        let state = self.state.lock();
        let c = &state.counters;
        let live = usize::from(state.current.is_some());
        PoolStats {
            total_created: c.created,
            total_destroyed: c.destroyed,
            total_create_errors: c.create_errors,
            total_destroy_errors: c.destroy_errors,
            total_bad_destroyed: c.bad_destroyed,
            total_timed_out: c.timed_out,
            total_create_ignored: 0,
            total_waiters_cancelled: c.waiters_cancelled,
            max_pool_size: 1,
            min_pool_size: 0,
            pool_size: live + state.retired.len() + usize::from(state.creating),
            sample_max_pool_size: 1,
            idle: usize::from(state.current.as_ref().is_some_and(|e| e.refs == 0)),
            outstanding: state.outstanding(),
            max_outstanding: c.max_outstanding,
            waiters: state.waiters.len(),
            creation_latency: state.creation_latency.snapshot(),
            wait_latency: state.wait_latency.snapshot(),
            lifecycle: self.lifecycle.stats(),
        }
    }
}
