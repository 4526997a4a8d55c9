//! Completion callbacks, cancellation handles and the settle flag.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::TransportError;

/// One-shot completion callback carrying a typed success value or error.
pub type Callback<T> = Box<dyn FnOnce(Result<T, TransportError>) + Send + 'static>;

/// Box a closure as a [`Callback`].
pub fn callback<T, F>(f: F) -> Callback<T>
where
    F: FnOnce(Result<T, TransportError>) + Send + 'static,
{
    Box::new(f)
}

/// Handle for an operation that may complete later.
///
/// Cancelling returns `true` when the operation was withdrawn before it
/// delivered a result. Dropping the handle does not cancel anything.
pub struct Cancellable {
    cancel: Option<Box<dyn FnOnce() -> bool + Send + 'static>>,
}

impl Cancellable {
    /// Create a handle that runs `f` on cancellation.
    pub fn new<F>(f: F) -> Self
    where
        F: FnOnce() -> bool + Send + 'static,
    {
        Self {
            cancel: Some(Box::new(f)),
        }
    }

    /// A handle for an operation that already completed.
    #[must_use]
    pub fn noop() -> Self {
        Self { cancel: None }
    }

    /// Withdraw the operation.
    pub fn cancel(mut self) -> bool {
        self.cancel.take().is_some_and(|f| f())
    }
}

impl fmt::Debug for Cancellable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cancellable")
            .field("pending", &self.cancel.is_some())
            .finish()
    }
}

/// Atomic pending → settled transition.
///
/// Whoever calls [`Settle::settle`] first wins; every later call observes
/// `false`. Used wherever two paths race to deliver one terminal result.
#[derive(Debug, Default)]
pub struct Settle(AtomicBool);

impl Settle {
    #[must_use]
    pub const fn new() -> Self {
        Self(AtomicBool::new(false))
    }

    /// Returns `true` if this call performed the transition.
    pub fn settle(&self) -> bool {
        self.0
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    #[must_use]
    pub fn is_settled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_settle_once() {
        let settle = Settle::new();
        assert!(!settle.is_settled());
        assert!(settle.settle());
        assert!(!settle.settle());
        assert!(settle.is_settled());
    }

    #[test]
    fn test_settle_concurrent() {
        let settle = Arc::new(Settle::new());
        let winners = Arc::new(AtomicUsize::new(0));

        let threads: Vec<_> = (0..8)
            .map(|_| {
                let settle = settle.clone();
                let winners = winners.clone();
                std::thread::spawn(move || {
                    if settle.settle() {
                        winners.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }

        assert_eq!(winners.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_cancellable() {
        assert!(!Cancellable::noop().cancel());
        assert!(Cancellable::new(|| true).cancel());
        assert!(!Cancellable::new(|| false).cancel());
    }
}
