//! Request and response messages.

use std::collections::VecDeque;
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

use bytes::{Bytes, BytesMut};
use futures_core::Stream;
use parking_lot::Mutex;

use cirrus_codec::Frame;
use cirrus_core::TransportError;

use crate::buffer::{BufferedReader, Watermarks};
use crate::connection::MuxConnection;

/// An outgoing request: an opaque header block and body chunks.
#[derive(Debug, Clone, Default)]
pub struct Request {
    pub headers: Bytes,
    pub body: Vec<Bytes>,
}

impl Request {
    #[must_use]
    pub fn new(headers: impl Into<Bytes>) -> Self {
        Self {
            headers: headers.into(),
            body: Vec::new(),
        }
    }

    /// Append a body chunk.
    #[must_use]
    pub fn with_body(mut self, chunk: impl Into<Bytes>) -> Self {
        self.body.push(chunk.into());
        self
    }

    #[must_use]
    pub fn body_len(&self) -> usize {
        self.body.iter().map(Bytes::len).sum()
    }
}

/// A response as delivered to the caller.
#[derive(Debug)]
pub struct Response {
    pub stream_id: u32,
    pub headers: Bytes,
    pub body: ResponseBody,
}

/// Response body.
///
/// Either fully buffered, or streamed from the connection as it arrives.
/// A streamed body returns window credit to the peer as chunks are
/// consumed.
pub struct ResponseBody {
    kind: Kind,
}

enum Kind {
    Full(VecDeque<Bytes>),
    Streaming(Arc<BodyChannel>),
}

impl ResponseBody {
    #[must_use]
    pub fn empty() -> Self {
        Self {
            kind: Kind::Full(VecDeque::new()),
        }
    }

    #[must_use]
    pub fn full(body: Bytes) -> Self {
        let mut chunks = VecDeque::new();
        if !body.is_empty() {
            chunks.push_back(body);
        }
        Self {
            kind: Kind::Full(chunks),
        }
    }

    pub(crate) fn streaming(channel: Arc<BodyChannel>) -> Self {
        Self {
            kind: Kind::Streaming(channel),
        }
    }

    /// Whether the whole body is already in memory.
    #[must_use]
    pub fn is_buffered(&self) -> bool {
        matches!(self.kind, Kind::Full(_))
    }

    /// Read the remaining body into one buffer.
    pub async fn collect(mut self) -> Result<Bytes, TransportError> {
        if let Kind::Full(chunks) = &mut self.kind {
            if chunks.len() <= 1 {
                return Ok(chunks.pop_front().unwrap_or_default());
            }
        }

        let mut buf = BytesMut::new();
        while let Some(chunk) = std::future::poll_fn(|cx| Pin::new(&mut self).poll_next(cx)).await {
            buf.extend_from_slice(&chunk?);
        }
        Ok(buf.freeze())
    }
}

impl Stream for ResponseBody {
    type Item = Result<Bytes, TransportError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match &mut self.get_mut().kind {
            Kind::Full(chunks) => Poll::Ready(chunks.pop_front().map(Ok)),
            Kind::Streaming(channel) => channel.poll_chunk(cx),
        }
    }
}

impl fmt::Debug for ResponseBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            Kind::Full(chunks) => f
                .debug_struct("ResponseBody")
                .field("buffered", &chunks.iter().map(Bytes::len).sum::<usize>())
                .finish(),
            Kind::Streaming(channel) => f
                .debug_struct("ResponseBody")
                .field("stream_id", &channel.stream_id)
                .finish(),
        }
    }
}

struct BodyState {
    reader: BufferedReader,
    error: Option<TransportError>,
    finished: bool,
    waker: Option<Waker>,
}

/// Shared between the multiplexer, which feeds inbound DATA, and the
/// [`ResponseBody`] that drains it.
pub(crate) struct BodyChannel {
    conn: MuxConnection,
    stream_id: u32,
    state: Mutex<BodyState>,
}

impl BodyChannel {
    pub(crate) fn new(conn: MuxConnection, stream_id: u32, marks: Watermarks) -> Arc<Self> {
        Arc::new(Self {
            conn,
            stream_id,
            state: Mutex::new(BodyState {
                reader: BufferedReader::new(marks),
                error: None,
                finished: false,
                waker: None,
            }),
        })
    }

    pub(crate) fn push(&self, chunk: Bytes) {
        let mut state = self.state.lock();
        state.reader.push(chunk);
        let waker = state.waker.take();
        drop(state);
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    pub(crate) fn finish(&self) {
        self.settle(None);
    }

    pub(crate) fn fail(&self, error: TransportError) {
        self.settle(Some(error));
    }

    fn settle(&self, error: Option<TransportError>) {
        let mut state = self.state.lock();
        if state.finished {
            return;
        }
        state.finished = true;
        state.error = error;
        let waker = state.waker.take();
        drop(state);
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    #[cfg(test)]
    pub(crate) fn is_paused(&self) -> bool {
        self.state.lock().reader.is_paused()
    }

    fn poll_chunk(&self, cx: &mut Context<'_>) -> Poll<Option<Result<Bytes, TransportError>>> {
        let mut state = self.state.lock();

        // A failed body reports the error before any buffered data.
        if let Some(error) = state.error.take() {
            while state.reader.pop().is_some() {}
            return Poll::Ready(Some(Err(error)));
        }

        if let Some(chunk) = state.reader.pop() {
            let credit = state.reader.take_credit();
            let open = !state.finished;
            drop(state);
            if let (Some(increment), true) = (credit, open) {
                self.conn.release_recv_window(self.stream_id, increment);
                let _ = self.conn.send(Frame::WindowUpdate {
                    stream_id: self.stream_id,
                    increment,
                });
            }
            return Poll::Ready(Some(Ok(chunk)));
        }

        if state.finished {
            return Poll::Ready(None);
        }
        state.waker = Some(cx.waker().clone());
        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::tests::RecordingSink;
    use crate::connection::ConnectionSettings;
    use futures::StreamExt;

    fn channel(marks: Watermarks) -> (Arc<BodyChannel>, RecordingSink) {
        let sink = RecordingSink::default();
        let conn = MuxConnection::new(sink.clone(), ConnectionSettings::default());
        let stream_id = conn.open_stream().unwrap();
        (BodyChannel::new(conn, stream_id, marks), sink)
    }

    fn credits(sink: &RecordingSink) -> Vec<u32> {
        sink.frames
            .lock()
            .iter()
            .filter_map(|f| match f {
                Frame::WindowUpdate { increment, .. } => Some(*increment),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_full_body() {
        let body = ResponseBody::full(Bytes::from_static(b"hello"));
        assert!(body.is_buffered());
        assert_eq!(body.collect().await.unwrap(), "hello");
        assert!(ResponseBody::empty().collect().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_streaming_body_collects() {
        let (channel, _) = channel(Watermarks::default());
        let body = ResponseBody::streaming(channel.clone());

        let reader = tokio::spawn(body.collect());
        channel.push(Bytes::from_static(b"hel"));
        channel.push(Bytes::from_static(b"lo"));
        channel.finish();

        assert_eq!(reader.await.unwrap().unwrap(), "hello");
    }

    #[tokio::test]
    async fn test_streaming_body_error() {
        let (channel, _) = channel(Watermarks::default());
        let mut body = ResponseBody::streaming(channel.clone());

        channel.push(Bytes::from_static(b"partial"));
        channel.fail(TransportError::ConnectionClosed);
        channel.finish();

        assert!(matches!(
            body.next().await,
            Some(Err(TransportError::ConnectionClosed))
        ));
        assert!(body.next().await.is_none());
    }

    #[tokio::test]
    async fn test_credit_withheld_until_low_watermark() {
        let (channel, sink) = channel(Watermarks::new(8, 4));
        let mut body = ResponseBody::streaming(channel.clone());

        for _ in 0..5 {
            channel.push(Bytes::from_static(b"abc"));
        }
        assert!(channel.is_paused());

        body.next().await.unwrap().unwrap();
        body.next().await.unwrap().unwrap();
        assert!(credits(&sink).is_empty());

        body.next().await.unwrap().unwrap();
        body.next().await.unwrap().unwrap();
        assert!(!channel.is_paused());
        assert_eq!(credits(&sink), vec![12]);

        body.next().await.unwrap().unwrap();
        assert_eq!(credits(&sink), vec![12, 3]);
    }

    #[test]
    fn test_request_builder() {
        let request = Request::new("GET /")
            .with_body("ab")
            .with_body(Bytes::from_static(b"cde"));
        assert_eq!(request.headers, "GET /");
        assert_eq!(request.body_len(), 5);
    }
}
