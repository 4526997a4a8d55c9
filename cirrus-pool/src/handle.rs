//! Pool trait, checkout handles and the deadline-bounded acquire helper.

use std::fmt;
use std::future::Future;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;

use cirrus_core::{callback, Callback, Cancellable, TimeoutGuard, TransportError};

use crate::stats::PoolStats;

/// A pool of reusable resources handed out through callbacks.
///
/// `get` never blocks: it either completes the callback immediately or
/// queues it and returns a [`Cancellable`] that withdraws the request.
pub trait AsyncPool<R: Send + 'static>: Send + Sync {
    /// Pool name used in logs and errors.
    fn name(&self) -> &str;

    /// Start background maintenance and pre-create the minimum size.
    fn start(&self);

    /// Check out a resource.
    ///
    /// The callback runs exactly once, with a handle or an error, unless the
    /// returned handle is cancelled first.
    fn get(&self, callback: Callback<PoolHandle<R>>) -> Cancellable;

    /// Refuse new requests, drain checked-out resources and destroy the rest.
    fn shutdown(&self, callback: Callback<()>);

    /// Remove and return every queued callback without completing it.
    fn cancel_waiters(&self) -> Vec<Callback<PoolHandle<R>>>;

    /// Current statistics.
    fn stats(&self) -> PoolStats;
}

/// Return path for checked-out resources.
pub(crate) trait Recycle<R>: Send + Sync {
    fn put(self: Arc<Self>, resource: R, created: Instant);
    fn dispose(self: Arc<Self>, resource: R, created: Instant);
}

/// The right to return or dispose exactly one checked-out resource.
///
/// Dropping the handle returns the resource as healthy.
pub struct PoolHandle<R: Send + 'static> {
    resource: Option<R>,
    created: Instant,
    pool: Arc<dyn Recycle<R>>,
}

impl<R: Send + 'static> PoolHandle<R> {
    pub(crate) fn new(resource: R, created: Instant, pool: Arc<dyn Recycle<R>>) -> Self {
        Self {
            resource: Some(resource),
            created,
            pool,
        }
    }

    /// When the underlying resource was created.
    #[must_use]
    pub fn created(&self) -> Instant {
        self.created
    }

    /// Return the resource to its pool.
    pub fn release(mut self) {
        if let Some(resource) = self.resource.take() {
            self.pool.clone().put(resource, self.created);
        }
    }

    /// Report the resource broken; the pool destroys it.
    pub fn dispose(mut self) {
        if let Some(resource) = self.resource.take() {
            self.pool.clone().dispose(resource, self.created);
        }
    }
}

impl<R: Send + 'static> Deref for PoolHandle<R> {
    type Target = R;

    fn deref(&self) -> &R {
        self.resource.as_ref().expect("resource taken")
    }
}

impl<R: Send + 'static> DerefMut for PoolHandle<R> {
    fn deref_mut(&mut self) -> &mut R {
        self.resource.as_mut().expect("resource taken")
    }
}

impl<R: Send + 'static> Drop for PoolHandle<R> {
    fn drop(&mut self) {
        if let Some(resource) = self.resource.take() {
            self.pool.clone().put(resource, self.created);
        }
    }
}

impl<R: Send + fmt::Debug + 'static> fmt::Debug for PoolHandle<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolHandle")
            .field("resource", &self.resource)
            .finish()
    }
}

/// Deadline-bounded checkout for any [`AsyncPool`].
pub trait AcquireExt<R: Send + 'static> {
    /// Check out a resource, failing with [`TransportError::Timeout`] when
    /// `timeout` elapses first.
    ///
    /// The request is queued when `acquire` is called, not when the future
    /// is first polled. On timeout, or when the future is dropped, the
    /// waiter is withdrawn; a handle that arrives late goes straight back to
    /// the pool.
    fn acquire(
        &self,
        timeout: Duration,
    ) -> impl Future<Output = Result<PoolHandle<R>, TransportError>> + Send + 'static;
}

impl<R, P> AcquireExt<R> for P
where
    R: Send + 'static,
    P: AsyncPool<R> + ?Sized,
{
    fn acquire(
        &self,
        timeout: Duration,
    ) -> impl Future<Output = Result<PoolHandle<R>, TransportError>> + Send + 'static {
        let (tx, rx) = oneshot::channel();
        let guard = TimeoutGuard::new(timeout, move |res| {
            let _ = tx.send(res);
        });

        let completer = guard.clone();
        let cancellable = self.get(callback(move |res| {
            completer.complete(res);
        }));
        guard.add_timeout_task(move || {
            cancellable.cancel();
        });

        let on_drop = ExpireOnDrop(guard);
        async move {
            let result = rx.await.unwrap_or(Err(TransportError::Cancelled));
            drop(on_drop);
            result
        }
    }
}

struct ExpireOnDrop<T>(TimeoutGuard<T>);

impl<T> Drop for ExpireOnDrop<T> {
    fn drop(&mut self) {
        self.0.expire_now();
    }
}
