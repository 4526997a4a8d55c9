//! Destination-keyed pool registry with coordinated shutdown.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

use parking_lot::Mutex;

use cirrus_core::{callback, Callback, TransportError};

use crate::handle::{AsyncPool, PoolHandle};
use crate::stats::PoolStats;

/// Builds the pool for a destination the registry has not seen yet.
pub trait PoolFactory<K, R>: Send + Sync + 'static {
    fn create_pool(&self, key: &K) -> Arc<dyn AsyncPool<R>>;
}

impl<K, R, F> PoolFactory<K, R> for F
where
    F: Fn(&K) -> Arc<dyn AsyncPool<R>> + Send + Sync + 'static,
{
    fn create_pool(&self, key: &K) -> Arc<dyn AsyncPool<R>> {
        self(key)
    }
}

struct State<K, R> {
    accepting: bool,
    pools: HashMap<K, Arc<dyn AsyncPool<R>>>,
    /// Pools whose shutdown has not completed.
    shutting_down: usize,
    on_shutdown: Option<Callback<()>>,
}

struct Inner<K, R> {
    factory: Box<dyn PoolFactory<K, R>>,
    state: Mutex<State<K, R>>,
}

/// Lazily creates and caches one pool per destination key.
///
/// Pools are started as they are created. Once [`PoolRegistry::shutdown`]
/// is called the registry issues no more pools and completes when every
/// pool it owns has shut down.
pub struct PoolRegistry<K, R> {
    inner: Arc<Inner<K, R>>,
}

impl<K, R> Clone for PoolRegistry<K, R> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<K: fmt::Debug, R> fmt::Debug for PoolRegistry<K, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("PoolRegistry")
            .field("accepting", &state.accepting)
            .field("pools", &state.pools.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl<K, R> PoolRegistry<K, R>
where
    K: Eq + Hash + Clone + fmt::Debug + Send + 'static,
    R: Send + 'static,
{
    #[must_use]
    pub fn new(factory: impl PoolFactory<K, R>) -> Self {
        Self {
            inner: Arc::new(Inner {
                factory: Box::new(factory),
                state: Mutex::new(State {
                    accepting: true,
                    pools: HashMap::new(),
                    shutting_down: 0,
                    on_shutdown: None,
                }),
            }),
        }
    }

    /// The pool for `key`, created and started on first use.
    pub fn pool_for(&self, key: &K) -> Result<Arc<dyn AsyncPool<R>>, TransportError> {
        let mut state = self.inner.state.lock();
        if !state.accepting {
            return Err(TransportError::NotAccepting);
        }
        if let Some(pool) = state.pools.get(key) {
            return Ok(pool.clone());
        }

        let pool = self.inner.factory.create_pool(key);
        pool.start();
        state.pools.insert(key.clone(), pool.clone());
        tracing::debug!(destination = ?key, pool = pool.name(), "created pool");
        Ok(pool)
    }

    /// Withdraw every queued callback from every pool.
    pub fn cancel_waiters(&self) -> Vec<Callback<PoolHandle<R>>> {
        let pools: Vec<_> = self.inner.state.lock().pools.values().cloned().collect();
        pools
            .iter()
            .flat_map(|pool| pool.cancel_waiters())
            .collect()
    }

    /// Stop issuing pools and shut down every owned pool.
    ///
    /// `done` receives `Ok` once all pools finished, whether cleanly or by
    /// their own shutdown timeout.
    pub fn shutdown(&self, done: Callback<()>) {
        let mut state = self.inner.state.lock();
        if !state.accepting {
            drop(state);
            done(Err(TransportError::AlreadyShuttingDown));
            return;
        }
        state.accepting = false;
        let pools: Vec<_> = state.pools.values().cloned().collect();
        if pools.is_empty() {
            drop(state);
            done(Ok(()));
            return;
        }
        state.shutting_down = pools.len();
        state.on_shutdown = Some(done);
        drop(state);

        tracing::info!(pools = pools.len(), "shutting down pools");
        for pool in pools {
            let inner = self.inner.clone();
            let name: Arc<str> = pool.name().into();
            pool.shutdown(callback(move |res| {
                if let Err(e) = res {
                    tracing::warn!(pool = %name, error = %e, "pool did not shut down cleanly");
                }
                inner.pool_finished();
            }));
        }
    }

    /// Whether new pools can still be issued.
    #[must_use]
    pub fn is_accepting(&self) -> bool {
        self.inner.state.lock().accepting
    }

    /// Statistics of every pool, by destination.
    #[must_use]
    pub fn pool_stats(&self) -> HashMap<K, PoolStats> {
        let pools: Vec<_> = self
            .inner
            .state
            .lock()
            .pools
            .iter()
            .map(|(k, p)| (k.clone(), p.clone()))
            .collect();
        pools.into_iter().map(|(k, p)| (k, p.stats())).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.state.lock().pools.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K, R> Inner<K, R> {
    fn pool_finished(&self) {
        let mut state = self.state.lock();
        state.shutting_down = state.shutting_down.saturating_sub(1);
        if state.shutting_down > 0 {
            return;
        }
        let callback = state.on_shutdown.take();
        drop(state);

        if let Some(callback) = callback {
            tracing::info!("all pools shut down");
            callback(Ok(()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;
    use crate::handle::AcquireExt;
    use crate::lifecycle::Lifecycle;
    use crate::pool::ResourcePool;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::oneshot;

    struct Echo(String);

    impl Lifecycle for Echo {
        type Resource = String;

        async fn create(&self) -> Result<String, TransportError> {
            Ok(self.0.clone())
        }

        async fn destroy(&self, _conn: String, _error: bool) -> Result<(), TransportError> {
            Ok(())
        }
    }

    fn registry(created: Arc<AtomicUsize>) -> PoolRegistry<String, String> {
        PoolRegistry::new(move |key: &String| -> Arc<dyn AsyncPool<String>> {
            created.fetch_add(1, Ordering::SeqCst);
            Arc::new(ResourcePool::new(
                key.as_str(),
                PoolConfig::new()
                    .max_size(1)
                    .shutdown_timeout(Duration::from_millis(100)),
                Echo(key.clone()),
            ))
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_pool_per_destination() {
        let created = Arc::new(AtomicUsize::new(0));
        let registry = registry(created.clone());

        let a = registry.pool_for(&"a:80".to_string()).unwrap();
        let again = registry.pool_for(&"a:80".to_string()).unwrap();
        let b = registry.pool_for(&"b:80".to_string()).unwrap();
        assert!(Arc::ptr_eq(&a, &again));
        assert_eq!(created.load(Ordering::SeqCst), 2);

        let conn = b.acquire(Duration::from_secs(1)).await.unwrap();
        assert_eq!(*conn, "b:80");

        let stats = registry.pool_stats();
        assert_eq!(stats.len(), 2);
        assert_eq!(stats["b:80"].outstanding, 1);
        assert_eq!(stats["a:80"].outstanding, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_waiters_across_pools() {
        let registry = registry(Arc::new(AtomicUsize::new(0)));
        let mut held = Vec::new();
        for key in ["a", "b"] {
            let pool = registry.pool_for(&key.to_string()).unwrap();
            held.push(pool.acquire(Duration::from_secs(1)).await.unwrap());
            pool.get(callback(|_| {}));
        }

        assert_eq!(registry.cancel_waiters().len(), 2);
        assert!(registry.cancel_waiters().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_aggregates_and_stops_accepting() {
        let registry = registry(Arc::new(AtomicUsize::new(0)));
        let a = registry.pool_for(&"a".to_string()).unwrap();
        registry.pool_for(&"b".to_string()).unwrap();
        let held = a.acquire(Duration::from_secs(1)).await.unwrap();

        let (tx, mut done) = oneshot::channel();
        registry.shutdown(callback(move |res| {
            let _ = tx.send(res);
        }));
        assert!(!registry.is_accepting());
        assert!(matches!(
            registry.pool_for(&"c".to_string()),
            Err(TransportError::NotAccepting)
        ));

        tokio::task::yield_now().await;
        assert!(done.try_recv().is_err());

        held.release();
        done.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_twice_fails() {
        let registry = registry(Arc::new(AtomicUsize::new(0)));
        registry.shutdown(callback(|res| assert!(res.is_ok())));

        let (tx, rx) = oneshot::channel();
        registry.shutdown(callback(move |res| {
            let _ = tx.send(res);
        }));
        assert!(matches!(
            rx.await.unwrap(),
            Err(TransportError::AlreadyShuttingDown)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_completes_on_pool_timeout() {
        let registry = registry(Arc::new(AtomicUsize::new(0)));
        let pool = registry.pool_for(&"a".to_string()).unwrap();
        let _held = pool.acquire(Duration::from_secs(1)).await.unwrap();

        let (tx, rx) = oneshot::channel();
        registry.shutdown(callback(move |res| {
            let _ = tx.send(res);
        }));
        rx.await.unwrap().unwrap();
    }
}
