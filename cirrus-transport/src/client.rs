//! Transport client: per-destination pools, deadlines and ordered shutdown.

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::oneshot;

use cirrus_core::{callback, Callback, Reason, RequestContext, TimeoutGuard, TransportError};
use cirrus_pool::{AsyncPool, PoolConfig, PoolHandle, PoolRegistry, PoolStats, ResourcePool, SharedPool};

use crate::connection::MuxConnection;
use crate::lifecycle::{ConnectionLifecycle, Connector};
use crate::message::{Request, Response, ResponseBody};
use crate::mux::{MuxConfig, StreamMultiplexer};

/// Client lifecycle.
///
/// Transitions only move forward:
/// `Running -> ShuttingDown -> RequestsStopping -> Shutdown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ClientState {
    /// Accepting requests.
    Running = 0,
    /// Pools are draining; new requests are rejected.
    ShuttingDown = 1,
    /// Outstanding work is being failed and connections closed.
    RequestsStopping = 2,
    /// Fully stopped.
    Shutdown = 3,
}

impl ClientState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Running,
            1 => Self::ShuttingDown,
            2 => Self::RequestsStopping,
            _ => Self::Shutdown,
        }
    }
}

/// How exchanges use pooled connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Protocol {
    /// One shared connection per destination carries every exchange;
    /// response bodies are streamed.
    #[default]
    Multiplexed,
    /// Each exchange checks out a connection exclusively; response bodies
    /// are buffered before delivery.
    Exclusive,
}

/// Configuration for a [`TransportClient`].
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Settings for every per-destination pool.
    pub pool: PoolConfig,
    pub mux: MuxConfig,
    pub protocol: Protocol,
    /// Bound on closing connections once requests have stopped.
    pub close_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            pool: PoolConfig::default(),
            mux: MuxConfig::default(),
            protocol: Protocol::default(),
            close_timeout: Duration::from_secs(5),
        }
    }
}

impl ClientConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn pool(mut self, pool: PoolConfig) -> Self {
        self.pool = pool;
        self
    }

    #[must_use]
    pub fn mux(mut self, mux: MuxConfig) -> Self {
        self.mux = mux;
        self
    }

    #[must_use]
    pub fn protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }

    #[must_use]
    pub fn close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }
}

struct ClientInner {
    config: ClientConfig,
    state: AtomicU8,
    registry: PoolRegistry<String, MuxConnection>,
    mux: StreamMultiplexer,
    /// User callbacks not yet completed, failed in bulk at shutdown.
    pending: DashMap<u64, Mutex<Callback<Response>>>,
    next_request: AtomicU64,
}

/// Sends requests to destinations over pooled connections.
///
/// Each request runs under a deadline taken from the client's
/// `request_timeout`, optionally overridden and scaled by its
/// [`RequestContext`]. The result callback runs exactly once.
///
/// ## Example
///
/// ```rust,no_run
/// use cirrus_core::RequestContext;
/// use cirrus_transport::{ClientConfig, Request, TcpConnector, TransportClient};
///
/// # async fn example() -> Result<(), cirrus_core::TransportError> {
/// let client = TransportClient::new(ClientConfig::new(), TcpConnector::new());
/// let response = client
///     .send("127.0.0.1:9000", Request::new("GET /"), &RequestContext::new())
///     .await?;
/// let body = response.body.collect().await?;
/// println!("{} bytes", body.len());
/// client.close().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct TransportClient {
    inner: Arc<ClientInner>,
}

impl fmt::Debug for TransportClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportClient")
            .field("state", &self.state())
            .field("protocol", &self.inner.config.protocol)
            .field("pending", &self.inner.pending.len())
            .finish()
    }
}

impl TransportClient {
    pub fn new<C: Connector>(config: ClientConfig, connector: C) -> Self {
        let mux = StreamMultiplexer::new(config.mux.clone());
        let connector = Arc::new(connector);
        let factory = {
            let mux = mux.clone();
            let pool_config = config.pool.clone();
            let protocol = config.protocol;
            move |destination: &String| -> Arc<dyn AsyncPool<MuxConnection>> {
                let lifecycle =
                    ConnectionLifecycle::new(connector.clone(), destination.as_str(), mux.clone());
                match protocol {
                    Protocol::Multiplexed => Arc::new(SharedPool::new(
                        destination.as_str(),
                        pool_config.clone(),
                        lifecycle,
                    )),
                    Protocol::Exclusive => Arc::new(ResourcePool::new(
                        destination.as_str(),
                        pool_config.clone(),
                        lifecycle,
                    )),
                }
            }
        };

        Self {
            inner: Arc::new(ClientInner {
                config,
                state: AtomicU8::new(ClientState::Running as u8),
                registry: PoolRegistry::new(factory),
                mux,
                pending: DashMap::new(),
                next_request: AtomicU64::new(1),
            }),
        }
    }

    #[must_use]
    pub fn state(&self) -> ClientState {
        self.inner.state()
    }

    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    #[must_use]
    pub fn multiplexer(&self) -> &StreamMultiplexer {
        &self.inner.mux
    }

    /// Statistics of every destination pool.
    #[must_use]
    pub fn pool_stats(&self) -> std::collections::HashMap<String, PoolStats> {
        self.inner.registry.pool_stats()
    }

    /// Requests whose callback has not run yet.
    #[must_use]
    pub fn pending_requests(&self) -> usize {
        self.inner.pending.len()
    }

    /// Send `request` to `destination`; `done` receives the outcome.
    ///
    /// Must be called from within a tokio runtime.
    pub fn request(
        &self,
        destination: &str,
        request: Request,
        ctx: &RequestContext,
        done: Callback<Response>,
    ) {
        if self.state() != ClientState::Running {
            done(Err(TransportError::ShuttingDown("client".into())));
            return;
        }

        let id = self.inner.next_request.fetch_add(1, Ordering::Relaxed);
        self.inner.pending.insert(id, Mutex::new(done));
        if self.state() >= ClientState::RequestsStopping {
            // Shutdown swept the pending table before this insert landed.
            self.inner
                .deliver(id, Err(TransportError::ShuttingDown("client".into())));
            return;
        }

        let timeout = ctx.resolve_timeout(self.inner.config.pool.request_timeout);
        tracing::trace!(request_id = ctx.request_id, destination, ?timeout, "request");

        let guard = TimeoutGuard::new(timeout, {
            let inner = self.inner.clone();
            move |res| inner.deliver(id, res)
        });

        let pool = match self.inner.registry.pool_for(&destination.to_string()) {
            Ok(pool) => pool,
            Err(e) => {
                guard.complete(Err(e));
                return;
            }
        };

        let on_handle = {
            let inner = self.inner.clone();
            let guard = guard.clone();
            callback(move |res| inner.dispatch(res, request, guard))
        };
        let cancellable = pool.get(on_handle);
        guard.add_timeout_task(move || {
            cancellable.cancel();
        });
    }

    /// Send `request` and wait for the response.
    pub async fn send(
        &self,
        destination: &str,
        request: Request,
        ctx: &RequestContext,
    ) -> Result<Response, TransportError> {
        let (tx, rx) = oneshot::channel();
        self.request(
            destination,
            request,
            ctx,
            callback(move |res| {
                let _ = tx.send(res);
            }),
        );
        rx.await.unwrap_or(Err(TransportError::Cancelled))
    }

    /// Shut the client down.
    ///
    /// Pools drain for up to the pool `shutdown_timeout`. Whatever is still
    /// outstanding then fails with [`TransportError::ShutdownTimeout`] and
    /// connections are closed, bounded by `close_timeout`. A second call
    /// fails with [`TransportError::AlreadyShuttingDown`].
    pub fn shutdown(&self, done: Callback<()>) {
        let started = self.inner.state.compare_exchange(
            ClientState::Running as u8,
            ClientState::ShuttingDown as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        if started.is_err() {
            done(Err(TransportError::AlreadyShuttingDown));
            return;
        }
        tracing::info!(pending = self.inner.pending.len(), "client shutting down");

        let inner = self.inner.clone();
        let guard = TimeoutGuard::new(
            self.inner.config.pool.shutdown_timeout,
            move |res: Result<(), TransportError>| {
                if let Err(e) = res {
                    tracing::warn!(error = %e, "pools did not shut down in time");
                }
                tokio::spawn(async move {
                    inner.stop_requests().await;
                    done(Ok(()));
                });
            },
        );

        self.inner.registry.shutdown(callback(move |res| {
            guard.complete(res);
        }));
    }

    /// Shut down and wait for completion.
    pub async fn close(&self) -> Result<(), TransportError> {
        let (tx, rx) = oneshot::channel();
        self.shutdown(callback(move |res| {
            let _ = tx.send(res);
        }));
        rx.await.unwrap_or(Err(TransportError::Cancelled))
    }
}

impl ClientInner {
    fn state(&self) -> ClientState {
        ClientState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ClientState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn deliver(&self, id: u64, result: Result<Response, TransportError>) {
        if let Some((_, callback)) = self.pending.remove(&id) {
            (callback.into_inner())(result);
        }
    }

    /// Start the exchange once the pool produced a connection.
    fn dispatch(
        &self,
        res: Result<PoolHandle<MuxConnection>, TransportError>,
        request: Request,
        guard: TimeoutGuard<Response>,
    ) {
        let handle = match res {
            Ok(handle) => handle,
            Err(e) => {
                guard.complete(Err(e));
                return;
            }
        };
        if guard.is_settled() {
            handle.release();
            return;
        }
        if self.state() >= ClientState::RequestsStopping {
            handle.release();
            guard.complete(Err(TransportError::ShutdownTimeout));
            return;
        }

        let on_response = {
            let guard = guard.clone();
            let protocol = self.config.protocol;
            callback(move |res: Result<Response, TransportError>| match res {
                Ok(response) if protocol == Protocol::Exclusive && !response.body.is_buffered() => {
                    tokio::spawn(async move {
                        let Response {
                            stream_id,
                            headers,
                            body,
                        } = response;
                        let result = body.collect().await.map(|body| Response {
                            stream_id,
                            headers,
                            body: ResponseBody::full(body),
                        });
                        guard.complete(result);
                    });
                }
                res => {
                    guard.complete(res);
                }
            })
        };

        if let Some(key) = self.mux.open_stream(handle, request, on_response) {
            let mux = self.mux.clone();
            let timeout = guard.timeout();
            guard.add_timeout_task(move || {
                mux.reset_stream(key, Reason::Cancel, TransportError::Timeout(timeout));
            });
        }
    }

    /// Fail everything still outstanding and close connections.
    async fn stop_requests(self: Arc<Self>) {
        self.set_state(ClientState::RequestsStopping);

        let waiters = self.registry.cancel_waiters();
        let cancelled = waiters.len();
        for waiter in waiters {
            waiter(Err(TransportError::ShutdownTimeout));
        }

        let ids: Vec<u64> = self.pending.iter().map(|e| *e.key()).collect();
        let abandoned = ids.len();
        for id in ids {
            self.deliver(id, Err(TransportError::ShutdownTimeout));
        }

        let reset = self.mux.fail_all(TransportError::ShutdownTimeout);
        if cancelled + abandoned + reset > 0 {
            tracing::warn!(cancelled, abandoned, reset, "failed outstanding requests");
        }

        if tokio::time::timeout(self.config.close_timeout, self.mux.close_all())
            .await
            .is_err()
        {
            tracing::warn!("connections did not close in time");
        }

        self.set_state(ClientState::Shutdown);
        tracing::info!("client shut down");
    }
}
