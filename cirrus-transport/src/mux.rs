//! Stream multiplexing over shared connections.
//!
//! Every in-flight exchange lives in a side table keyed by connection and
//! stream id. Removing an exchange from the table is the single point at
//! which it reaches a terminal state, so each exchange completes, fails or
//! is reset exactly once no matter which path gets there first.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};

use cirrus_codec::{Frame, DEFAULT_MAX_FRAME_SIZE};
use cirrus_core::{Callback, CodecError, Reason, TransportError};
use cirrus_pool::PoolHandle;

use crate::buffer::{BufferedWriter, Watermarks};
use crate::connection::{
    self, ConnId, ConnectionSettings, MuxConnection, WindowOverrun, DEFAULT_INITIAL_WINDOW,
};
use crate::message::{BodyChannel, Request, Response, ResponseBody};

/// Identifies one stream on one connection.
pub type StreamKey = (ConnId, u32);

/// Configuration for a [`StreamMultiplexer`].
#[derive(Debug, Clone)]
pub struct MuxConfig {
    /// Maximum response body bytes per exchange; `None` disables the check.
    pub max_content_length: Option<u64>,
    /// Initial send window assumed for the peer.
    pub initial_window: u32,
    pub max_frame_size: usize,
    /// Outgoing bodies flush once more than this many bytes are buffered.
    pub write_high_water: usize,
    /// Outgoing bodies flush once this many chunks are buffered.
    pub write_max_chunks: usize,
    /// Incoming body watermarks.
    pub read_watermarks: Watermarks,
    /// How long a draining connection waits for active streams.
    pub grace_period: Duration,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            max_content_length: None,
            initial_window: DEFAULT_INITIAL_WINDOW,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            write_high_water: 64 * 1024,
            write_max_chunks: 16,
            read_watermarks: Watermarks::default(),
            grace_period: Duration::from_secs(5),
        }
    }
}

impl MuxConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn max_content_length(mut self, max: u64) -> Self {
        self.max_content_length = Some(max);
        self
    }

    #[must_use]
    pub fn initial_window(mut self, window: u32) -> Self {
        self.initial_window = window;
        self
    }

    #[must_use]
    pub fn max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = size.max(1);
        self
    }

    /// Set the outgoing body flush thresholds.
    #[must_use]
    pub fn write_buffer(mut self, high_water: usize, max_chunks: usize) -> Self {
        self.write_high_water = high_water;
        self.write_max_chunks = max_chunks.max(1);
        self
    }

    /// Set the incoming body watermarks.
    #[must_use]
    pub fn read_watermarks(mut self, high: usize, low: usize) -> Self {
        self.read_watermarks = Watermarks::new(high, low);
        self
    }

    #[must_use]
    pub fn grace_period(mut self, grace: Duration) -> Self {
        self.grace_period = grace;
        self
    }

    #[must_use]
    pub fn connection_settings(&self) -> ConnectionSettings {
        ConnectionSettings {
            initial_window: self.initial_window,
            max_frame_size: self.max_frame_size,
        }
    }
}

/// Where an exchange is in its lifecycle.
///
/// Terminal exchanges leave the side table, so only live states exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeState {
    /// Stream allocated, headers being written.
    Opened,
    /// Request body is being written.
    SendingBody,
    /// Request fully written, waiting for response headers.
    AwaitingHeaders,
    /// Response headers delivered, body arriving.
    ReceivingBody,
}

struct Exchange {
    state: ExchangeState,
    /// Behind a lock only so the table is `Sync`; access is exclusive.
    callback: Mutex<Option<Callback<Response>>>,
    handle: PoolHandle<MuxConnection>,
    writer: BufferedWriter,
    body: Option<Arc<BodyChannel>>,
    received: u64,
}

impl Exchange {
    /// Deliver `error` to whoever is waiting and hand the connection back.
    fn fail(self, error: TransportError, broken: bool) {
        let Exchange {
            callback,
            body,
            handle,
            ..
        } = self;
        if broken {
            handle.dispose();
        } else {
            handle.release();
        }
        if let Some(callback) = callback.into_inner() {
            callback(Err(error));
        } else if let Some(body) = body {
            body.fail(error);
        }
    }
}

enum DataOutcome {
    Buffered,
    Finished,
    TooLarge { size: u64, max: u64 },
    Unexpected,
}

struct Inner {
    config: MuxConfig,
    exchanges: DashMap<StreamKey, Exchange>,
    connections: DashMap<ConnId, MuxConnection>,
}

/// Runs request/response exchanges as streams over pooled connections.
///
/// ## Example
///
/// ```rust,no_run
/// use cirrus_core::callback;
/// use cirrus_pool::{AcquireExt, AsyncPool};
/// use cirrus_transport::{MuxConnection, Request, Response, StreamMultiplexer};
/// use std::time::Duration;
///
/// # async fn example(mux: StreamMultiplexer, pool: &dyn AsyncPool<MuxConnection>) {
/// let handle = pool.acquire(Duration::from_secs(1)).await.unwrap();
/// mux.open_stream(handle, Request::new("GET /"), callback(|res| {
///     println!("{:?}", res.map(|r: Response| r.headers));
/// }));
/// # }
/// ```
#[derive(Clone)]
pub struct StreamMultiplexer {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for StreamMultiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamMultiplexer")
            .field("connections", &self.inner.connections.len())
            .field("exchanges", &self.inner.exchanges.len())
            .finish()
    }
}

impl StreamMultiplexer {
    #[must_use]
    pub fn new(config: MuxConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                exchanges: DashMap::new(),
                connections: DashMap::new(),
            }),
        }
    }

    #[must_use]
    pub fn config(&self) -> &MuxConfig {
        &self.inner.config
    }

    /// Drive `io` as a multiplexed connection owned by this multiplexer.
    ///
    /// Must be called from within a tokio runtime.
    pub fn attach<IO>(&self, io: IO) -> MuxConnection
    where
        IO: AsyncRead + AsyncWrite + Send + 'static,
    {
        let conn = connection::spawn(io, self.clone());
        self.register(conn.clone());
        conn
    }

    /// Track a connection driven elsewhere.
    pub fn register(&self, conn: MuxConnection) {
        self.inner.connections.insert(conn.id(), conn);
    }

    /// Live connections.
    #[must_use]
    pub fn connections(&self) -> usize {
        self.inner.connections.len()
    }

    /// Exchanges that have not reached a terminal state.
    #[must_use]
    pub fn active_streams(&self) -> usize {
        self.inner.exchanges.len()
    }

    #[must_use]
    pub fn state(&self, key: StreamKey) -> Option<ExchangeState> {
        self.inner.exchanges.get(&key).map(|e| e.state)
    }

    /// Start an exchange on the connection behind `handle`.
    ///
    /// `callback` receives the response once its headers arrive, or the
    /// error that ended the exchange first. The handle is released when the
    /// exchange finishes and disposed when the connection fails. Returns the
    /// stream key, or `None` when the exchange failed before it started.
    pub fn open_stream(
        &self,
        handle: PoolHandle<MuxConnection>,
        request: Request,
        callback: Callback<Response>,
    ) -> Option<StreamKey> {
        let conn = (*handle).clone();
        let max_frame = self.inner.config.max_frame_size;

        if request.headers.len() > max_frame {
            handle.release();
            callback(Err(CodecError::FrameTooLarge {
                size: request.headers.len(),
                max: max_frame,
            }
            .into()));
            return None;
        }

        let stream_id = match conn.open_stream() {
            Ok(id) => id,
            Err(e) => {
                if conn.is_closed() {
                    handle.dispose();
                } else {
                    handle.release();
                }
                callback(Err(e));
                return None;
            }
        };
        let key = (conn.id(), stream_id);
        let end_stream = request.body.is_empty();

        self.inner.exchanges.insert(
            key,
            Exchange {
                state: ExchangeState::Opened,
                callback: Mutex::new(Some(callback)),
                handle,
                writer: BufferedWriter::new(
                    self.inner.config.write_high_water,
                    self.inner.config.write_max_chunks,
                ),
                body: None,
                received: 0,
            },
        );
        tracing::trace!(conn_id = key.0, stream_id, "stream opened");

        let headers = Frame::Headers {
            stream_id,
            payload: request.headers,
            end_stream,
        };
        if let Err(e) = conn.send(headers) {
            self.on_connection_error(&conn, e);
            return None;
        }

        if let Some(mut exchange) = self.inner.exchanges.get_mut(&key) {
            if exchange.state == ExchangeState::Opened {
                exchange.state = if end_stream {
                    ExchangeState::AwaitingHeaders
                } else {
                    ExchangeState::SendingBody
                };
            }
        }
        if end_stream {
            return Some(key);
        }

        for chunk in request.body {
            let flush = match self.inner.exchanges.get_mut(&key) {
                Some(mut exchange) => exchange.writer.write(chunk),
                None => return Some(key),
            };
            if flush {
                self.flush(&conn, key);
            }
        }
        match self.inner.exchanges.get_mut(&key) {
            Some(mut exchange) => exchange.writer.finish(),
            None => return Some(key),
        }
        self.flush(&conn, key);
        Some(key)
    }

    /// Dispatch one inbound frame.
    pub fn on_frame(&self, conn: &MuxConnection, frame: Frame) {
        if frame.stream_id() == 0
            && matches!(
                frame,
                Frame::Headers { .. } | Frame::Data { .. } | Frame::Reset { .. }
            )
        {
            self.on_connection_error(
                conn,
                TransportError::Protocol("stream frame on stream 0".into()),
            );
            return;
        }

        match frame {
            Frame::Headers {
                stream_id,
                payload,
                end_stream,
            } => self.on_headers(conn, stream_id, payload, end_stream),
            Frame::Data {
                stream_id,
                payload,
                end_stream,
            } => self.on_data(conn, stream_id, payload, end_stream),
            Frame::WindowUpdate {
                stream_id,
                increment,
            } => self.on_window_update(conn, stream_id, increment),
            Frame::Reset { stream_id, reason } => {
                if let Some(exchange) = self.take((conn.id(), stream_id)) {
                    tracing::debug!(conn_id = conn.id(), stream_id, %reason, "stream reset by peer");
                    exchange.fail(TransportError::reset(stream_id, reason), false);
                }
            }
            Frame::GoAway {
                last_stream_id,
                reason,
            } => self.on_go_away(conn, last_stream_id, reason),
        }
    }

    /// Reset one stream. The connection stays usable.
    ///
    /// Returns `false` when the exchange already finished.
    pub fn reset_stream(&self, key: StreamKey, reason: Reason, error: TransportError) -> bool {
        let Some(exchange) = self.take(key) else {
            return false;
        };
        let _ = exchange.handle.send(Frame::Reset {
            stream_id: key.1,
            reason,
        });
        tracing::debug!(conn_id = key.0, stream_id = key.1, %reason, "stream reset");
        exchange.fail(error, false);
        true
    }

    /// Fail every exchange on `conn` with `error` and close it.
    ///
    /// Each exchange disposes its handle, so the pool discards the
    /// connection once the last one is back.
    pub fn on_connection_error(&self, conn: &MuxConnection, error: TransportError) {
        if conn.close() {
            tracing::warn!(conn_id = conn.id(), error = %error, "connection failed");
        }
        self.inner.connections.remove(&conn.id());

        for key in self.keys_of(conn.id()) {
            if let Some(exchange) = self.take(key) {
                exchange.fail(error.clone(), true);
            }
        }
    }

    /// Gracefully shut down one connection.
    ///
    /// New streams are refused at once. Active streams get `grace` to
    /// finish; whatever is left is reset before the connection closes.
    pub async fn drain(&self, conn: &MuxConnection, grace: Duration) {
        if conn.drain() {
            tracing::debug!(
                conn_id = conn.id(),
                active = conn.active_streams(),
                "draining connection"
            );
            let _ = conn.send(Frame::GoAway {
                last_stream_id: 0,
                reason: Reason::NoError,
            });
        }

        if tokio::time::timeout(grace, conn.wait_idle()).await.is_err() {
            let keys = self.keys_of(conn.id());
            tracing::warn!(
                conn_id = conn.id(),
                streams = keys.len(),
                "grace period elapsed, resetting streams"
            );
            for key in keys {
                self.reset_stream(key, Reason::Cancel, TransportError::reset(key.1, Reason::Cancel));
            }
        }

        self.inner.connections.remove(&conn.id());
        conn.close();
    }

    /// Gracefully shut down every connection, each with `grace`.
    pub async fn shutdown(&self, grace: Duration) {
        let conns = self.live_connections();
        futures::future::join_all(conns.iter().map(|conn| self.drain(conn, grace))).await;
    }

    /// Fail every live exchange with `error`, resetting its stream.
    pub fn fail_all(&self, error: TransportError) -> usize {
        let keys: Vec<StreamKey> = self.inner.exchanges.iter().map(|e| *e.key()).collect();
        let mut failed = 0;
        for key in keys {
            if self.reset_stream(key, Reason::Cancel, error.clone()) {
                failed += 1;
            }
        }
        failed
    }

    /// Close every connection and wait for their drivers to finish.
    pub async fn close_all(&self) {
        let conns = self.live_connections();
        self.inner.connections.clear();
        for conn in &conns {
            conn.close();
        }
        futures::future::join_all(conns.iter().map(MuxConnection::terminated)).await;
    }

    fn on_headers(&self, conn: &MuxConnection, stream_id: u32, headers: Bytes, end_stream: bool) {
        let key = (conn.id(), stream_id);
        let delivery = match self.inner.exchanges.get_mut(&key) {
            None => {
                tracing::debug!(conn_id = conn.id(), stream_id, "HEADERS for unknown stream");
                return;
            }
            Some(mut exchange) => {
                if exchange.state == ExchangeState::ReceivingBody {
                    None
                } else {
                    let callback = exchange.callback.get_mut().take();
                    let body = if end_stream {
                        ResponseBody::empty()
                    } else {
                        let channel =
                            BodyChannel::new(conn.clone(), stream_id, self.inner.config.read_watermarks);
                        exchange.body = Some(channel.clone());
                        exchange.state = ExchangeState::ReceivingBody;
                        ResponseBody::streaming(channel)
                    };
                    Some((
                        callback,
                        Response {
                            stream_id,
                            headers,
                            body,
                        },
                    ))
                }
            }
        };

        let Some((callback, response)) = delivery else {
            self.reset_stream(
                key,
                Reason::Protocol,
                TransportError::Protocol(format!("duplicate HEADERS on stream {stream_id}")),
            );
            return;
        };
        if end_stream {
            self.complete(key);
        }
        if let Some(callback) = callback {
            callback(Ok(response));
        }
    }

    fn on_data(&self, conn: &MuxConnection, stream_id: u32, payload: Bytes, end_stream: bool) {
        let key = (conn.id(), stream_id);
        let len = payload.len();

        let charged = conn.receive_data(stream_id, len);
        if charged == Err(WindowOverrun::Connection) {
            tracing::warn!(conn_id = conn.id(), stream_id, len, "connection receive window exceeded");
            let _ = conn.send(Frame::GoAway {
                last_stream_id: 0,
                reason: Reason::FlowControl,
            });
            self.on_connection_error(
                conn,
                TransportError::Protocol("connection receive window exceeded".to_string()),
            );
            return;
        }

        // Connection-level credit is returned on receipt; stream-level
        // credit follows consumption of the body.
        if let Ok(increment @ 1..) = u32::try_from(len) {
            conn.release_recv_window(0, increment);
            let _ = conn.send(Frame::WindowUpdate {
                stream_id: 0,
                increment,
            });
        }

        if charged == Err(WindowOverrun::Stream) {
            tracing::warn!(conn_id = conn.id(), stream_id, len, "stream receive window exceeded");
            self.reset_stream(
                key,
                Reason::FlowControl,
                TransportError::reset(stream_id, Reason::FlowControl),
            );
            return;
        }

        let outcome = match self.inner.exchanges.get_mut(&key) {
            None => {
                tracing::trace!(conn_id = conn.id(), stream_id, "DATA for unknown stream");
                return;
            }
            Some(mut exchange) => match exchange.body.clone() {
                Some(body) if exchange.state == ExchangeState::ReceivingBody => {
                    exchange.received += len as u64;
                    match self.inner.config.max_content_length {
                        Some(max) if exchange.received > max => DataOutcome::TooLarge {
                            size: exchange.received,
                            max,
                        },
                        _ => {
                            body.push(payload);
                            if end_stream {
                                DataOutcome::Finished
                            } else {
                                DataOutcome::Buffered
                            }
                        }
                    }
                }
                _ => DataOutcome::Unexpected,
            },
        };

        match outcome {
            DataOutcome::Buffered => {}
            DataOutcome::Finished => self.complete(key),
            DataOutcome::TooLarge { size, max } => {
                tracing::warn!(conn_id = conn.id(), stream_id, size, max, "response body too large");
                self.reset_stream(key, Reason::Cancel, TransportError::TooLarge { size, max });
            }
            DataOutcome::Unexpected => {
                self.reset_stream(
                    key,
                    Reason::Protocol,
                    TransportError::Protocol(format!("DATA before HEADERS on stream {stream_id}")),
                );
            }
        }
    }

    fn on_window_update(&self, conn: &MuxConnection, stream_id: u32, increment: u32) {
        if !conn.grant_window(stream_id, increment) {
            return;
        }
        let keys: Vec<StreamKey> = if stream_id == 0 {
            self.inner
                .exchanges
                .iter()
                .filter(|e| e.key().0 == conn.id() && e.writer.has_pending())
                .map(|e| *e.key())
                .collect()
        } else {
            vec![(conn.id(), stream_id)]
        };
        for key in keys {
            self.flush(conn, key);
        }
    }

    fn on_go_away(&self, conn: &MuxConnection, last_stream_id: u32, reason: Reason) {
        conn.drain();
        if reason == Reason::NoError {
            tracing::debug!(conn_id = conn.id(), last_stream_id, "peer is going away");
        } else {
            tracing::warn!(conn_id = conn.id(), last_stream_id, %reason, "peer is going away");
        }

        for key in self.keys_of(conn.id()) {
            if key.1 <= last_stream_id {
                continue;
            }
            if let Some(exchange) = self.take(key) {
                exchange.fail(TransportError::reset(key.1, Reason::RefusedStream), false);
            }
        }
    }

    /// Write as much buffered body as the windows allow.
    fn flush(&self, conn: &MuxConnection, key: StreamKey) {
        let failed = {
            let Some(mut exchange) = self.inner.exchanges.get_mut(&key) else {
                return;
            };
            let window = conn.send_window(key.1);
            let frames = exchange
                .writer
                .flush(key.1, window, self.inner.config.max_frame_size);
            let sent = frames.iter().map(Frame::flow_controlled_len).sum();
            conn.consume_window(key.1, sent);

            // Sent under the entry lock so frames of one stream stay ordered.
            let mut failed = None;
            for frame in frames {
                if let Err(e) = conn.send(frame) {
                    failed = Some(e);
                    break;
                }
            }
            if exchange.writer.is_complete() && exchange.state == ExchangeState::SendingBody {
                exchange.state = ExchangeState::AwaitingHeaders;
            }
            failed
        };

        if let Some(e) = failed {
            self.on_connection_error(conn, e);
        }
    }

    /// Finish an exchange whose response ended.
    fn complete(&self, key: StreamKey) {
        let Some(exchange) = self.take(key) else {
            return;
        };
        if let Some(body) = &exchange.body {
            body.finish();
        }
        if exchange.writer.has_pending() {
            // The peer answered before the request body was fully sent.
            let _ = exchange.handle.send(Frame::Reset {
                stream_id: key.1,
                reason: Reason::NoError,
            });
        }
        tracing::trace!(conn_id = key.0, stream_id = key.1, "exchange complete");
        exchange.handle.release();
    }

    /// Remove an exchange from the side table. Only one caller gets it.
    fn take(&self, key: StreamKey) -> Option<Exchange> {
        let (_, exchange) = self.inner.exchanges.remove(&key)?;
        exchange.handle.close_stream(key.1);
        Some(exchange)
    }

    fn keys_of(&self, conn_id: ConnId) -> Vec<StreamKey> {
        self.inner
            .exchanges
            .iter()
            .filter(|e| e.key().0 == conn_id)
            .map(|e| *e.key())
            .collect()
    }

    fn live_connections(&self) -> Vec<MuxConnection> {
        self.inner
            .connections
            .iter()
            .map(|e| e.value().clone())
            .collect()
    }
}
