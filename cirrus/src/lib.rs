//! # Cirrus
//!
//! Connection pooling, deadline guards and stream multiplexing for RPC
//! clients built on tokio.
//!
//! Cirrus provides:
//! - **Exactly-once delivery** via `TimeoutGuard`, racing a completion
//!   against a deadline
//! - **Resource pools** with rate-limited creation and exponential backoff,
//!   exclusive (`ResourcePool`) or shared (`SharedPool`) checkout
//! - **Per-destination pools** through `PoolRegistry`
//! - **Stream multiplexing** with flow control, watermark buffering and
//!   content-length limits
//! - **Ordered shutdown**: running, shutting down, requests stopping, shut down
//!
//! ## Quick Start
//!
//! ```rust
//! use cirrus::{ClientConfig, PoolConfig, RequestContext, TcpConnector, TransportClient};
//! use std::time::Duration;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let config = ClientConfig::new().pool(
//!     PoolConfig::new()
//!         .request_timeout(Duration::from_secs(5))
//!         .shutdown_timeout(Duration::from_secs(2)),
//! );
//! let client = TransportClient::new(config, TcpConnector::new());
//!
//! // Deadlines come from the context, falling back to the pool config.
//! let ctx = RequestContext::new().with_timeout(Duration::from_millis(250));
//! assert_eq!(ctx.resolve_timeout(Duration::from_secs(5)), Duration::from_millis(250));
//!
//! client.close().await.unwrap();
//! # }
//! ```
//!
//! ## Features
//!
//! - `serde` - Serialize and deserialize pool configuration
//!
//! ## Architecture
//!
//! Cirrus is composed of several crates:
//!
//! - [`cirrus-core`] - Errors, callbacks, request contexts and `TimeoutGuard`
//! - [`cirrus-codec`] - Length-prefixed stream frame encoding/decoding
//! - [`cirrus-pool`] - Rate limiter, resource pools and the pool registry
//! - [`cirrus-transport`] - Connections, the multiplexer and `TransportClient`

// Re-export core types
pub use cirrus_core::{
    callback, Callback, Cancellable, CodecError, Metadata, Reason, RequestContext, Settle,
    TimeoutGuard, TransportError,
};

// Re-export codec
pub use cirrus_codec::{Frame, FrameCodec, DEFAULT_MAX_FRAME_SIZE};

// Re-export pooling
pub use cirrus_pool::{
    AcquireExt, AsyncPool, Lifecycle, LifecycleStats, PoolConfig, PoolFactory, PoolHandle,
    PoolRegistry, PoolState, PoolStats, RateLimiter, RateLimiterConfig, ResourcePool, SharedPool,
    Strategy,
};

// Re-export transport
pub use cirrus_transport::{
    BufferedReader, BufferedWriter, ClientConfig, ClientState, ConnectionLifecycle,
    ConnectionSettings, Connector, FrameSink, MuxConfig, MuxConnection, Protocol, Request,
    Response, ResponseBody, StreamKey, StreamMultiplexer, TcpConnector, TransportClient,
    Watermarks, WindowOverrun,
};

/// Prelude module for convenient imports.
///
/// ```rust
/// use cirrus::prelude::*;
/// ```
pub mod prelude {
    pub use crate::{
        callback, AcquireExt, ClientConfig, PoolConfig, Request, RequestContext, Response,
        TcpConnector, TransportClient, TransportError,
    };

    pub use cirrus_pool::{AsyncPool, Lifecycle};
    pub use cirrus_transport::Connector;
}

/// Version information.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
