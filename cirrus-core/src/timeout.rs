//! Deadline-bounded, exactly-once completion.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::AbortHandle;

use crate::callback::{Callback, Settle};
use crate::error::TransportError;

type TimeoutTask = Box<dyn FnOnce() + Send + 'static>;

enum Tasks {
    Pending(Vec<TimeoutTask>),
    Fired,
    Completed,
}

struct Inner<T> {
    settle: Settle,
    callback: Mutex<Option<Callback<T>>>,
    tasks: Mutex<Tasks>,
    timer: Mutex<Option<AbortHandle>>,
    timeout: Duration,
}

/// Wraps a completion callback with a deadline.
///
/// The first of a real completion ([`TimeoutGuard::complete`]) and the
/// deadline wins. The loser is a no-op, so the inner callback runs exactly
/// once. When the deadline wins, every registered timeout task runs and the
/// inner callback receives [`TransportError::Timeout`].
///
/// Guards are cheap to clone; all clones share one settle flag.
///
/// ## Example
///
/// ```rust
/// use cirrus_core::TimeoutGuard;
/// use std::time::Duration;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let (tx, rx) = tokio::sync::oneshot::channel();
/// let guard = TimeoutGuard::new(Duration::from_secs(5), move |res| {
///     let _ = tx.send(res);
/// });
///
/// assert!(guard.complete(Ok(42)));
/// assert!(!guard.complete(Ok(7)));
/// assert_eq!(rx.await.unwrap().unwrap(), 42);
/// # }
/// ```
pub struct TimeoutGuard<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for TimeoutGuard<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> fmt::Debug for TimeoutGuard<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimeoutGuard")
            .field("timeout", &self.inner.timeout)
            .field("settled", &self.inner.settle.is_settled())
            .finish()
    }
}

impl<T: Send + 'static> TimeoutGuard<T> {
    /// Arm a deadline `timeout` from now around `callback`.
    ///
    /// Must be called from within a tokio runtime; the deadline is a task
    /// on that runtime.
    pub fn new<F>(timeout: Duration, callback: F) -> Self
    where
        F: FnOnce(Result<T, TransportError>) + Send + 'static,
    {
        let inner = Arc::new(Inner {
            settle: Settle::new(),
            callback: Mutex::new(Some(Box::new(callback))),
            tasks: Mutex::new(Tasks::Pending(Vec::new())),
            timer: Mutex::new(None),
            timeout,
        });

        let timer = inner.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(timer.timeout).await;
            timer.expire();
        });
        *inner.timer.lock() = Some(handle.abort_handle());

        Self { inner }
    }
}

impl<T> TimeoutGuard<T> {
    /// Deliver the real result.
    ///
    /// Returns `false` (dropping `result`) when the deadline already won.
    pub fn complete(&self, result: Result<T, TransportError>) -> bool {
        if !self.inner.settle.settle() {
            return false;
        }

        if let Some(timer) = self.inner.timer.lock().take() {
            timer.abort();
        }
        let discarded = std::mem::replace(&mut *self.inner.tasks.lock(), Tasks::Completed);
        drop(discarded);

        let callback = self.inner.callback.lock().take();
        if let Some(callback) = callback {
            callback(result);
        }
        true
    }

    /// Fire the deadline now.
    ///
    /// Returns `false` when a result was already delivered.
    pub fn expire_now(&self) -> bool {
        self.inner.expire()
    }

    /// Register an action to run if and when the deadline fires.
    ///
    /// Runs immediately when the deadline has already fired; dropped when
    /// the guard completed normally.
    pub fn add_timeout_task<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut tasks = self.inner.tasks.lock();
        if let Tasks::Pending(list) = &mut *tasks {
            list.push(Box::new(task));
            return;
        }
        let fired = matches!(*tasks, Tasks::Fired);
        drop(tasks);

        if fired {
            task();
        }
    }

    /// Whether a result (real or synthetic) has been delivered.
    #[must_use]
    pub fn is_settled(&self) -> bool {
        self.inner.settle.is_settled()
    }

    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.inner.timeout
    }
}

impl<T> Inner<T> {
    fn expire(&self) -> bool {
        if !self.settle.settle() {
            return false;
        }

        let tasks = match std::mem::replace(&mut *self.tasks.lock(), Tasks::Fired) {
            Tasks::Pending(tasks) => tasks,
            Tasks::Fired | Tasks::Completed => Vec::new(),
        };
        tracing::debug!(timeout = ?self.timeout, tasks = tasks.len(), "deadline elapsed");

        for task in tasks {
            task();
        }

        let callback = self.callback.lock().take();
        if let Some(callback) = callback {
            callback(Err(TransportError::Timeout(self.timeout)));
        }

        if let Some(timer) = self.timer.lock().take() {
            timer.abort();
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn recorder<T: Send + 'static>() -> (
        Arc<Mutex<Vec<Result<T, TransportError>>>>,
        impl FnOnce(Result<T, TransportError>) + Send + 'static,
    ) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        (seen, move |res| sink.lock().push(res))
    }

    #[tokio::test(start_paused = true)]
    async fn test_completion_wins() {
        let (seen, cb) = recorder::<u32>();
        let guard = TimeoutGuard::new(Duration::from_millis(50), cb);

        let ran = Arc::new(AtomicUsize::new(0));
        let counter = ran.clone();
        guard.add_timeout_task(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(guard.complete(Ok(1)));
        tokio::time::sleep(Duration::from_millis(100)).await;

        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(*seen[0].as_ref().unwrap(), 1);
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_wins() {
        let (seen, cb) = recorder::<u32>();
        let guard = TimeoutGuard::new(Duration::from_millis(50), cb);

        let ran = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let counter = ran.clone();
            guard.add_timeout_task(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(guard.is_settled());
        assert!(!guard.complete(Ok(2)));

        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert!(matches!(seen[0], Err(TransportError::Timeout(d)) if d == Duration::from_millis(50)));
        assert_eq!(ran.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_task_added_after_deadline_runs_immediately() {
        let (_seen, cb) = recorder::<()>();
        let guard = TimeoutGuard::new(Duration::from_millis(10), cb);
        tokio::time::sleep(Duration::from_millis(20)).await;

        let ran = Arc::new(AtomicUsize::new(0));
        let counter = ran.clone();
        guard.add_timeout_task(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_expire_now_delivers_timeout() {
        let (seen, cb) = recorder::<()>();
        let guard = TimeoutGuard::new(Duration::from_secs(30), cb);

        assert!(guard.expire_now());
        assert!(!guard.expire_now());
        assert!(matches!(seen.lock()[0], Err(TransportError::Timeout(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_exactly_once_under_race() {
        for _ in 0..200 {
            let calls = Arc::new(AtomicUsize::new(0));
            let counter = calls.clone();
            let guard = TimeoutGuard::new(Duration::from_micros(50), move |_: Result<(), _>| {
                counter.fetch_add(1, Ordering::SeqCst);
            });

            let a = guard.clone();
            let b = guard.clone();
            let complete = tokio::spawn(async move { a.complete(Ok(())) });
            let expire = tokio::spawn(async move { b.expire_now() });
            let (won_complete, won_expire) = (complete.await.unwrap(), expire.await.unwrap());

            tokio::time::sleep(Duration::from_millis(1)).await;
            assert_eq!(calls.load(Ordering::SeqCst), 1);
            assert!(!(won_complete && won_expire));
        }
    }
}
