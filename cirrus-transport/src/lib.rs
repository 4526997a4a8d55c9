//! # cirrus-transport
//!
//! Stream multiplexing and transport clients for Cirrus.
//!
//! This crate provides:
//! - `StreamMultiplexer` - request/response exchanges as streams over shared
//!   connections, with flow control and content-length limits
//! - `MuxConnection` - connection state plus a tokio I/O driver
//! - `BufferedWriter` / `BufferedReader` - watermark-driven body buffering
//! - `Connector` / `TcpConnector` - pluggable connection establishment
//! - `TransportClient` - per-destination pools, request deadlines and
//!   ordered shutdown
//!
//! ## Architecture Note
//!
//! Connections are driven by two tokio tasks each: a reader decoding frames
//! into the multiplexer and a single writer draining an unbounded queue.
//! Everything that touches the multiplexer is non-blocking, so callbacks may
//! run on the reader task.

mod buffer;
mod client;
mod connection;
mod lifecycle;
mod message;
mod mux;

pub use buffer::{BufferedReader, BufferedWriter, Watermarks};
pub use client::{ClientConfig, ClientState, Protocol, TransportClient};
pub use connection::{
    ConnId, ConnectionSettings, FrameSink, MuxConnection, WindowOverrun, DEFAULT_INITIAL_WINDOW,
};
pub use lifecycle::{ConnectionLifecycle, Connector, TcpConnector};
pub use message::{Request, Response, ResponseBody};
pub use mux::{ExchangeState, MuxConfig, StreamKey, StreamMultiplexer};
