//! End-to-end client tests against a scripted in-memory peer.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::oneshot;

use cirrus_codec::{Frame, FrameCodec, DEFAULT_MAX_FRAME_SIZE};
use cirrus_core::{callback, RequestContext, TransportError};
use cirrus_pool::PoolConfig;
use cirrus_transport::{
    ClientConfig, ClientState, Connector, MuxConfig, Protocol, Request, TransportClient,
    DEFAULT_INITIAL_WINDOW,
};

/// How the peer on one connection behaves.
#[derive(Debug, Clone, Copy)]
enum Behavior {
    /// Answer with the request headers followed by the request body.
    Echo,
    /// Read requests, never answer.
    Silent,
    /// Stay silent, then drop the connection once this many requests
    /// arrived.
    HangUpAfter(usize),
}

#[derive(Clone)]
struct DuplexConnector {
    script: Arc<Vec<Behavior>>,
    connects: Arc<AtomicUsize>,
    window: u32,
    refuse: bool,
}

impl DuplexConnector {
    fn new(script: impl Into<Vec<Behavior>>) -> Self {
        Self {
            script: Arc::new(script.into()),
            connects: Arc::new(AtomicUsize::new(0)),
            window: DEFAULT_INITIAL_WINDOW,
            refuse: false,
        }
    }

    fn refusing() -> Self {
        Self {
            refuse: true,
            ..Self::new(Vec::new())
        }
    }

    /// Receive window the client advertises, as the peer assumes it.
    fn window(mut self, window: u32) -> Self {
        self.window = window;
        self
    }

    fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

impl Connector for DuplexConnector {
    type Io = DuplexStream;

    async fn connect(&self, destination: &str) -> Result<DuplexStream, TransportError> {
        if self.refuse {
            return Err(TransportError::ConnectionFailed(format!(
                "{destination}: refused"
            )));
        }
        let n = self.connects.fetch_add(1, Ordering::SeqCst);
        let behavior = self
            .script
            .get(n)
            .or(self.script.last())
            .copied()
            .unwrap_or(Behavior::Echo);
        let (client, server) = tokio::io::duplex(64 * 1024);
        tokio::spawn(serve(server, behavior, self.window));
        Ok(client)
    }
}

/// Peer side of the connection, honoring the client's receive windows.
struct Peer {
    codec: FrameCodec,
    initial_window: i64,
    conn_window: i64,
    /// Response bodies waiting for credit, with the stream's window.
    outbound: BTreeMap<u32, (i64, Bytes)>,
}

impl Peer {
    fn new(window: u32) -> Self {
        Self {
            codec: FrameCodec::new(),
            initial_window: i64::from(window),
            conn_window: i64::from(window),
            outbound: BTreeMap::new(),
        }
    }

    fn encode(&self, frame: Frame, out: &mut BytesMut) {
        self.codec.encode_frame(&frame, out).unwrap();
    }

    fn grant(&mut self, stream_id: u32, increment: u32) {
        if stream_id == 0 {
            self.conn_window += i64::from(increment);
        } else if let Some((window, _)) = self.outbound.get_mut(&stream_id) {
            *window += i64::from(increment);
        }
    }

    fn respond(&mut self, stream_id: u32, body: Bytes, out: &mut BytesMut) {
        self.encode(
            Frame::Headers {
                stream_id,
                payload: Bytes::from_static(b"200"),
                end_stream: false,
            },
            out,
        );
        if body.is_empty() {
            self.encode(
                Frame::Data {
                    stream_id,
                    payload: Bytes::new(),
                    end_stream: true,
                },
                out,
            );
        } else {
            self.outbound.insert(stream_id, (self.initial_window, body));
        }
    }

    /// Send whatever response DATA the windows allow.
    fn flush(&mut self, out: &mut BytesMut) {
        let mut frames = Vec::new();
        for (&stream_id, (window, pending)) in &mut self.outbound {
            while !pending.is_empty() && *window > 0 && self.conn_window > 0 {
                let credit = (*window).min(self.conn_window) as usize;
                let n = pending.len().min(credit).min(DEFAULT_MAX_FRAME_SIZE);
                let payload = pending.split_to(n);
                *window -= n as i64;
                self.conn_window -= n as i64;
                frames.push(Frame::Data {
                    stream_id,
                    payload,
                    end_stream: pending.is_empty(),
                });
            }
        }
        self.outbound.retain(|_, (_, pending)| !pending.is_empty());
        for frame in frames {
            self.encode(frame, out);
        }
    }
}

async fn serve(io: DuplexStream, behavior: Behavior, window: u32) {
    let mut peer = Peer::new(window);
    let (mut rd, mut wr) = tokio::io::split(io);
    let mut buf = BytesMut::new();
    let mut requests: HashMap<u32, BytesMut> = HashMap::new();
    let mut served = 0;

    loop {
        let mut out = BytesMut::new();
        while let Some(frame) = peer.codec.decode_frame(&mut buf).unwrap() {
            let finished = match frame {
                Frame::Headers {
                    stream_id,
                    payload,
                    end_stream,
                } => {
                    requests.entry(stream_id).or_default().extend_from_slice(&payload);
                    end_stream.then_some(stream_id)
                }
                Frame::Data {
                    stream_id,
                    payload,
                    end_stream,
                } => {
                    if !payload.is_empty() {
                        let increment = payload.len() as u32;
                        peer.encode(Frame::WindowUpdate { stream_id, increment }, &mut out);
                        peer.encode(Frame::WindowUpdate { stream_id: 0, increment }, &mut out);
                    }
                    requests.entry(stream_id).or_default().extend_from_slice(&payload);
                    end_stream.then_some(stream_id)
                }
                Frame::WindowUpdate {
                    stream_id,
                    increment,
                } => {
                    peer.grant(stream_id, increment);
                    None
                }
                _ => None,
            };

            let Some(stream_id) = finished else { continue };
            served += 1;
            match behavior {
                Behavior::Echo => {
                    let body = requests.remove(&stream_id).unwrap_or_default().freeze();
                    peer.respond(stream_id, body, &mut out);
                }
                Behavior::Silent => {}
                Behavior::HangUpAfter(limit) => {
                    if served >= limit {
                        return;
                    }
                }
            }
        }
        peer.flush(&mut out);

        if !out.is_empty() && wr.write_all(&out).await.is_err() {
            return;
        }
        match rd.read_buf(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
    }
}

fn client(config: ClientConfig, connector: &DuplexConnector) -> TransportClient {
    TransportClient::new(config, connector.clone())
}

fn ctx() -> RequestContext {
    RequestContext::new()
}

#[tokio::test]
async fn test_round_trip() {
    let connector = DuplexConnector::new([Behavior::Echo]);
    let client = client(ClientConfig::new(), &connector);

    let response = client
        .send("peer:1", Request::new("GET /a").with_body("xyz"), &ctx())
        .await
        .unwrap();
    assert_eq!(response.headers, "200");
    assert!(!response.body.is_buffered());
    assert_eq!(response.body.collect().await.unwrap(), "GET /axyz");
    assert_eq!(client.pending_requests(), 0);
}

#[tokio::test]
async fn test_concurrent_requests_share_one_connection() {
    let connector = DuplexConnector::new([Behavior::Echo]);
    let client = client(ClientConfig::new(), &connector);

    let requests = (0..10).map(|i| {
        let client = client.clone();
        async move {
            let response = client
                .send("peer:1", Request::new(format!("req-{i}")), &ctx())
                .await?;
            response.body.collect().await
        }
    });
    let bodies = futures::future::join_all(requests).await;

    for (i, body) in bodies.into_iter().enumerate() {
        assert_eq!(body.unwrap(), format!("req-{i}"));
    }
    assert_eq!(connector.connects(), 1);
    assert_eq!(client.pool_stats()["peer:1"].total_created, 1);
}

#[tokio::test]
async fn test_large_bodies_are_flow_controlled() {
    let connector = DuplexConnector::new([Behavior::Echo]).window(1024);
    let config = ClientConfig::new().mux(
        MuxConfig::new()
            .initial_window(1024)
            .write_buffer(4096, 4)
            .read_watermarks(8 * 1024, 2 * 1024),
    );
    let client = client(config, &connector);

    let payload = Bytes::from(vec![7u8; 100 * 1024]);
    let request = payload
        .chunks(10 * 1024)
        .fold(Request::new("PUT /"), |req, chunk| {
            req.with_body(Bytes::copy_from_slice(chunk))
        });

    let response = client.send("peer:1", request, &ctx()).await.unwrap();
    let body = response.body.collect().await.unwrap();
    assert_eq!(body.len(), "PUT /".len() + payload.len());
    assert_eq!(&body[5..], &payload[..]);
}

#[tokio::test]
async fn test_exclusive_protocol_buffers_responses() {
    let connector = DuplexConnector::new([Behavior::Echo]);
    let config = ClientConfig::new()
        .protocol(Protocol::Exclusive)
        .pool(PoolConfig::new().max_size(2));
    let client = client(config, &connector);

    let requests = (0..4).map(|i| {
        let client = client.clone();
        async move {
            client
                .send("peer:1", Request::new(format!("req-{i}")), &ctx())
                .await
        }
    });
    for (i, response) in futures::future::join_all(requests)
        .await
        .into_iter()
        .enumerate()
    {
        let response = response.unwrap();
        assert!(response.body.is_buffered());
        assert_eq!(response.body.collect().await.unwrap(), format!("req-{i}"));
    }
    assert!(connector.connects() <= 2);
}

#[tokio::test(start_paused = true)]
async fn test_request_timeout_resets_stream() {
    let connector = DuplexConnector::new([Behavior::Silent]);
    let client = client(ClientConfig::new(), &connector);

    let ctx = ctx()
        .with_timeout(Duration::from_millis(100))
        .with_preemptive_timeout_rate(0.5);
    let err = client
        .send("peer:1", Request::new("GET /slow"), &ctx)
        .await
        .unwrap_err();

    assert!(matches!(err, TransportError::Timeout(d) if d == Duration::from_millis(50)));
    assert_eq!(client.pending_requests(), 0);
    assert_eq!(client.multiplexer().active_streams(), 0);
    assert_eq!(client.pool_stats()["peer:1"].outstanding, 0);
}

#[tokio::test]
async fn test_connection_loss_fails_every_stream() {
    let connector = DuplexConnector::new([Behavior::HangUpAfter(10), Behavior::Echo]);
    let client = client(ClientConfig::new(), &connector);

    let requests = (0..10).map(|i| {
        let client = client.clone();
        async move {
            client
                .send("peer:1", Request::new(format!("req-{i}")), &ctx())
                .await
        }
    });
    for result in futures::future::join_all(requests).await {
        let err = result.unwrap_err();
        assert!(err.is_connection_error(), "unexpected error: {err}");
    }
    assert_eq!(connector.connects(), 1);

    let response = client
        .send("peer:1", Request::new("again"), &ctx())
        .await
        .unwrap();
    assert_eq!(response.body.collect().await.unwrap(), "again");
    assert_eq!(connector.connects(), 2);
}

#[tokio::test]
async fn test_connect_failure_reaches_caller() {
    let connector = DuplexConnector::refusing();
    let client = client(ClientConfig::new(), &connector);

    let err = client
        .send("peer:1", Request::new("GET /"), &ctx())
        .await
        .unwrap_err();
    assert!(matches!(err, TransportError::ConnectionFailed(_)));
    assert_eq!(client.pool_stats()["peer:1"].lifecycle.connect_errors, 1);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_fails_outstanding_requests() {
    let connector = DuplexConnector::new([Behavior::Silent]);
    let config = ClientConfig::new().pool(
        PoolConfig::new()
            .shutdown_timeout(Duration::from_millis(100))
            .request_timeout(Duration::from_secs(30)),
    );
    let client = client(config, &connector);

    let (tx, pending) = oneshot::channel();
    client.request(
        "peer:1",
        Request::new("GET /never"),
        &ctx(),
        callback(move |res| {
            let _ = tx.send(res);
        }),
    );
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(client.multiplexer().active_streams(), 1);

    client.close().await.unwrap();

    assert!(matches!(
        pending.await.unwrap(),
        Err(TransportError::ShutdownTimeout)
    ));
    assert_eq!(client.state(), ClientState::Shutdown);
    assert_eq!(client.multiplexer().connections(), 0);

    assert!(matches!(
        client.close().await,
        Err(TransportError::AlreadyShuttingDown)
    ));
    let err = client
        .send("peer:1", Request::new("GET /"), &ctx())
        .await
        .unwrap_err();
    assert!(matches!(err, TransportError::ShuttingDown(_)));
}

#[tokio::test(start_paused = true)]
async fn test_idle_shutdown_is_clean() {
    let connector = DuplexConnector::new([Behavior::Echo]);
    let client = client(ClientConfig::new(), &connector);

    let response = client.send("peer:1", Request::new("ping"), &ctx()).await.unwrap();
    assert_eq!(response.body.collect().await.unwrap(), "ping");

    client.close().await.unwrap();
    assert_eq!(client.state(), ClientState::Shutdown);
    assert_eq!(client.pool_stats()["peer:1"].total_destroyed, 1);
}
