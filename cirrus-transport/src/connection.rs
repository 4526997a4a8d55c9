//! Multiplexed connections and their I/O driver.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch, Notify};
use tokio_util::codec::{FramedRead, FramedWrite};

use cirrus_codec::{Frame, FrameCodec, DEFAULT_MAX_FRAME_SIZE};
use cirrus_core::{Reason, TransportError};

use crate::mux::StreamMultiplexer;

/// Client-initiated streams use odd ids.
const FIRST_STREAM_ID: u32 = 1;
const MAX_STREAM_ID: u32 = i32::MAX as u32;

/// Default initial flow-control window, per stream and per connection.
pub const DEFAULT_INITIAL_WINDOW: u32 = 65_535;

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// Connection identifier, unique within the process.
pub type ConnId = u64;

/// Outbound half of a connection.
///
/// `send` must not block: implementations queue the frame for a writer.
pub trait FrameSink: Send + Sync + 'static {
    fn send(&self, frame: Frame) -> Result<(), TransportError>;

    /// Flush what is queued and close the write side.
    fn close(&self);
}

/// Per-connection protocol settings.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionSettings {
    pub initial_window: u32,
    pub max_frame_size: usize,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            initial_window: DEFAULT_INITIAL_WINDOW,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Phase {
    Open,
    Closing,
    Terminated,
}

/// Inbound DATA exceeded a window advertised to the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowOverrun {
    /// The connection-wide receive window.
    Connection,
    /// The receive window of the addressed stream.
    Stream,
}

#[derive(Debug, Clone, Copy)]
struct Windows {
    send: i64,
    recv: i64,
}

struct State {
    next_stream_id: u32,
    send_window: i64,
    recv_window: i64,
    streams: HashMap<u32, Windows>,
    draining: bool,
}

struct Inner {
    id: ConnId,
    settings: ConnectionSettings,
    sink: Box<dyn FrameSink>,
    state: Mutex<State>,
    idle: Notify,
    phase: watch::Sender<Phase>,
}

/// A connection carrying many concurrent streams.
///
/// Tracks stream id allocation, the send windows granted by the peer and
/// the receive windows advertised to it.
/// Clones share the connection; equality is by connection id.
#[derive(Clone)]
pub struct MuxConnection {
    inner: Arc<Inner>,
}

impl MuxConnection {
    pub fn new(sink: impl FrameSink, settings: ConnectionSettings) -> Self {
        let (phase, _) = watch::channel(Phase::Open);
        Self {
            inner: Arc::new(Inner {
                id: NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed),
                settings,
                sink: Box::new(sink),
                state: Mutex::new(State {
                    next_stream_id: FIRST_STREAM_ID,
                    send_window: i64::from(settings.initial_window),
                    recv_window: i64::from(settings.initial_window),
                    streams: HashMap::new(),
                    draining: false,
                }),
                idle: Notify::new(),
                phase,
            }),
        }
    }

    #[must_use]
    pub fn id(&self) -> ConnId {
        self.inner.id
    }

    #[must_use]
    pub fn settings(&self) -> ConnectionSettings {
        self.inner.settings
    }

    /// Allocate the next stream id.
    ///
    /// Refused while draining; a connection that ran out of stream ids
    /// starts draining.
    pub fn open_stream(&self) -> Result<u32, TransportError> {
        if self.is_closed() {
            return Err(TransportError::ConnectionClosed);
        }
        let mut state = self.inner.state.lock();
        if state.draining {
            return Err(TransportError::reset(0, Reason::RefusedStream));
        }
        let id = state.next_stream_id;
        if id > MAX_STREAM_ID {
            state.draining = true;
            return Err(TransportError::reset(0, Reason::RefusedStream));
        }
        state.next_stream_id = id.saturating_add(2);
        let window = i64::from(self.inner.settings.initial_window);
        state.streams.insert(
            id,
            Windows {
                send: window,
                recv: window,
            },
        );
        Ok(id)
    }

    /// Forget a finished stream.
    pub fn close_stream(&self, stream_id: u32) {
        let mut state = self.inner.state.lock();
        state.streams.remove(&stream_id);
        let idle = state.streams.is_empty();
        drop(state);
        if idle {
            self.inner.idle.notify_waiters();
        }
    }

    #[must_use]
    pub fn active_streams(&self) -> usize {
        self.inner.state.lock().streams.len()
    }

    /// Queue a frame for the writer.
    pub fn send(&self, frame: Frame) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::ConnectionClosed);
        }
        self.inner.sink.send(frame)
    }

    /// Bytes of DATA that may be sent on `stream_id` right now.
    #[must_use]
    pub fn send_window(&self, stream_id: u32) -> usize {
        let state = self.inner.state.lock();
        let stream = state.streams.get(&stream_id).map_or(0, |w| w.send);
        usize::try_from(stream.min(state.send_window).max(0)).unwrap_or(0)
    }

    /// Charge `len` sent bytes against both windows.
    pub fn consume_window(&self, stream_id: u32, len: usize) {
        let len = i64::try_from(len).unwrap_or(i64::MAX);
        let mut state = self.inner.state.lock();
        state.send_window -= len;
        if let Some(windows) = state.streams.get_mut(&stream_id) {
            windows.send -= len;
        }
    }

    /// Apply a WINDOW_UPDATE from the peer. Stream `0` is the connection.
    ///
    /// Returns `false` for an unknown stream.
    pub fn grant_window(&self, stream_id: u32, increment: u32) -> bool {
        let mut state = self.inner.state.lock();
        if stream_id == 0 {
            state.send_window += i64::from(increment);
            return true;
        }
        match state.streams.get_mut(&stream_id) {
            Some(windows) => {
                windows.send += i64::from(increment);
                true
            }
            None => false,
        }
    }

    /// Charge `len` inbound DATA bytes on `stream_id` against the receive
    /// windows.
    ///
    /// A connection overrun charges nothing. A stream overrun still charges
    /// the connection, since the peer spent that credit. Bytes for a stream
    /// that is no longer open count against the connection only.
    pub fn receive_data(&self, stream_id: u32, len: usize) -> Result<(), WindowOverrun> {
        let len = i64::try_from(len).unwrap_or(i64::MAX);
        let mut state = self.inner.state.lock();
        if len > state.recv_window {
            return Err(WindowOverrun::Connection);
        }
        state.recv_window -= len;
        if let Some(windows) = state.streams.get_mut(&stream_id) {
            if len > windows.recv {
                return Err(WindowOverrun::Stream);
            }
            windows.recv -= len;
        }
        Ok(())
    }

    /// Record a WINDOW_UPDATE sent to the peer. Stream `0` is the connection.
    pub fn release_recv_window(&self, stream_id: u32, increment: u32) {
        let mut state = self.inner.state.lock();
        if stream_id == 0 {
            state.recv_window += i64::from(increment);
        } else if let Some(windows) = state.streams.get_mut(&stream_id) {
            windows.recv += i64::from(increment);
        }
    }

    /// Bytes the peer may still send on `stream_id` before a WINDOW_UPDATE.
    #[must_use]
    pub fn recv_window(&self, stream_id: u32) -> usize {
        let state = self.inner.state.lock();
        let window = if stream_id == 0 {
            state.recv_window
        } else {
            state.streams.get(&stream_id).map_or(0, |w| w.recv)
        };
        usize::try_from(window.max(0)).unwrap_or(0)
    }

    /// Stop accepting new streams. Returns `true` on the first call.
    pub fn drain(&self) -> bool {
        let mut state = self.inner.state.lock();
        !std::mem::replace(&mut state.draining, true)
    }

    #[must_use]
    pub fn is_draining(&self) -> bool {
        self.inner.state.lock().draining
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        *self.inner.phase.borrow() >= Phase::Closing
    }

    /// Open and not draining.
    #[must_use]
    pub fn is_usable(&self) -> bool {
        !self.is_closed() && !self.is_draining()
    }

    /// Close the connection. Returns `true` on the first call.
    pub fn close(&self) -> bool {
        let first = self.inner.phase.send_if_modified(|phase| {
            if *phase == Phase::Open {
                *phase = Phase::Closing;
                true
            } else {
                false
            }
        });
        if first {
            self.inner.sink.close();
            self.inner.idle.notify_waiters();
        }
        first
    }

    /// Resolves once no stream is active or the connection is closed.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.active_streams() == 0 || self.is_closed() {
                return;
            }
            notified.await;
        }
    }

    /// Resolves once closing has been requested.
    pub async fn closed(&self) {
        let mut rx = self.inner.phase.subscribe();
        let _ = rx.wait_for(|phase| *phase >= Phase::Closing).await;
    }

    /// Resolves once the I/O driver has finished writing and shut down.
    pub async fn terminated(&self) {
        let mut rx = self.inner.phase.subscribe();
        let _ = rx.wait_for(|phase| *phase == Phase::Terminated).await;
    }

    pub(crate) fn mark_terminated(&self) {
        self.inner.phase.send_replace(Phase::Terminated);
        self.inner.idle.notify_waiters();
    }
}

impl PartialEq for MuxConnection {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for MuxConnection {}

impl fmt::Debug for MuxConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MuxConnection")
            .field("id", &self.inner.id)
            .field("active_streams", &self.active_streams())
            .field("closed", &self.is_closed())
            .finish()
    }
}

enum Command {
    Frame(Frame),
    Close,
}

struct ChannelSink {
    tx: mpsc::UnboundedSender<Command>,
}

impl FrameSink for ChannelSink {
    fn send(&self, frame: Frame) -> Result<(), TransportError> {
        self.tx
            .send(Command::Frame(frame))
            .map_err(|_| TransportError::ConnectionClosed)
    }

    fn close(&self) {
        let _ = self.tx.send(Command::Close);
    }
}

/// Spawn reader and writer tasks for `io` and return the connection.
///
/// Inbound frames are dispatched to `mux`. Read, write and decode failures
/// are reported through [`StreamMultiplexer::on_connection_error`].
pub(crate) fn spawn<IO>(io: IO, mux: StreamMultiplexer) -> MuxConnection
where
    IO: AsyncRead + AsyncWrite + Send + 'static,
{
    let settings = mux.config().connection_settings();
    let codec = FrameCodec::with_max_frame_size(settings.max_frame_size);
    let (tx, rx) = mpsc::unbounded_channel();
    let conn = MuxConnection::new(ChannelSink { tx }, settings);
    let (reader, writer) = tokio::io::split(io);

    tokio::spawn(write_loop(writer, rx, codec, conn.clone(), mux.clone()));
    tokio::spawn(read_loop(reader, codec, conn.clone(), mux));

    tracing::debug!(conn_id = conn.id(), "connection started");
    conn
}

async fn write_loop<W>(
    io: W,
    mut rx: mpsc::UnboundedReceiver<Command>,
    codec: FrameCodec,
    conn: MuxConnection,
    mux: StreamMultiplexer,
) where
    W: AsyncWrite + Unpin,
{
    let mut framed = FramedWrite::new(io, codec);

    'outer: while let Some(first) = rx.recv().await {
        let mut close = false;
        let mut next = Some(first);

        // Coalesce whatever is already queued into one flush.
        while let Some(command) = next.take() {
            match command {
                Command::Frame(frame) => {
                    if let Err(e) = framed.feed(frame).await {
                        mux.on_connection_error(&conn, e);
                        break 'outer;
                    }
                }
                Command::Close => {
                    close = true;
                    break;
                }
            }
            next = rx.try_recv().ok();
        }

        if let Err(e) = framed.flush().await {
            mux.on_connection_error(&conn, e);
            break;
        }

        if close {
            let _ = framed.close().await;
            break;
        }
    }

    conn.mark_terminated();
    tracing::debug!(conn_id = conn.id(), "connection terminated");
}

async fn read_loop<R>(io: R, codec: FrameCodec, conn: MuxConnection, mux: StreamMultiplexer)
where
    R: AsyncRead + Unpin,
{
    let mut framed = FramedRead::new(io, codec);

    loop {
        let next = tokio::select! {
            next = framed.next() => next,
            () = conn.closed() => return,
        };

        match next {
            Some(Ok(frame)) => mux.on_frame(&conn, frame),
            Some(Err(e @ TransportError::Codec(_))) => {
                let _ = conn.send(Frame::GoAway {
                    last_stream_id: 0,
                    reason: Reason::Protocol,
                });
                mux.on_connection_error(&conn, e);
                return;
            }
            Some(Err(e)) => {
                mux.on_connection_error(&conn, e);
                return;
            }
            None => {
                mux.on_connection_error(&conn, TransportError::ConnectionClosed);
                return;
            }
        }
    }
}
