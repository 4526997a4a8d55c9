//! Error types for the Cirrus transport core.

use std::sync::Arc;
use std::time::Duration;

/// Main error type for pool, deadline and transport operations.
///
/// The type is `Clone` so a single connection failure can be delivered to
/// every exchange multiplexed over that connection.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    /// The waiter queue of a pool is full.
    #[error("pool {pool} reached maximum waiter size: {max}")]
    WaitersExceeded {
        /// Name of the rejecting pool
        pool: Arc<str>,
        /// Configured waiter limit
        max: usize,
    },

    /// The registry stopped issuing new pools.
    #[error("pool registry is not accepting new pools")]
    NotAccepting,

    /// Resource creation failed.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// IO error from the underlying transport
    #[error("io error: {0}")]
    Io(Arc<std::io::Error>),

    /// A deadline elapsed before a real result arrived.
    #[error("timeout after {0:?}")]
    Timeout(Duration),

    /// The pool or client is not running (not started, or stopped).
    #[error("{0} is not running")]
    NotRunning(Arc<str>),

    /// The pool or client is shutting down.
    #[error("{0} is shutting down")]
    ShuttingDown(Arc<str>),

    /// A second shutdown was requested.
    #[error("shutdown has already been requested")]
    AlreadyShuttingDown,

    /// The operation was still pending when shutdown stopped all requests.
    #[error("operation did not complete before shutdown")]
    ShutdownTimeout,

    /// A single stream was reset; the connection remains usable.
    #[error("stream {stream_id} reset: {reason}")]
    StreamReset {
        /// Stream that was reset
        stream_id: u32,
        /// Reset reason
        reason: Reason,
    },

    /// Connection-level protocol violation.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Connection was closed unexpectedly
    #[error("connection closed")]
    ConnectionClosed,

    /// Accumulated body bytes of one exchange exceeded the limit.
    #[error("content too large: {size} bytes (max: {max})")]
    TooLarge {
        /// Bytes seen so far, including the offending chunk
        size: u64,
        /// Configured maximum
        max: u64,
    },

    /// Framing error.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// Request was cancelled
    #[error("request cancelled")]
    Cancelled,
}

/// Reset and go-away reason codes carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Reason {
    NoError,
    Protocol,
    Internal,
    FlowControl,
    StreamClosed,
    FrameSize,
    RefusedStream,
    Cancel,
    Unknown(u32),
}

impl Reason {
    /// Wire representation of this reason.
    #[must_use]
    pub const fn code(self) -> u32 {
        match self {
            Self::NoError => 0x0,
            Self::Protocol => 0x1,
            Self::Internal => 0x2,
            Self::FlowControl => 0x3,
            Self::StreamClosed => 0x5,
            Self::FrameSize => 0x6,
            Self::RefusedStream => 0x7,
            Self::Cancel => 0x8,
            Self::Unknown(code) => code,
        }
    }
}

impl From<u32> for Reason {
    fn from(code: u32) -> Self {
        match code {
            0x0 => Self::NoError,
            0x1 => Self::Protocol,
            0x2 => Self::Internal,
            0x3 => Self::FlowControl,
            0x5 => Self::StreamClosed,
            0x6 => Self::FrameSize,
            0x7 => Self::RefusedStream,
            0x8 => Self::Cancel,
            other => Self::Unknown(other),
        }
    }
}

impl std::fmt::Display for Reason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoError => f.write_str("no error"),
            Self::Protocol => f.write_str("protocol error"),
            Self::Internal => f.write_str("internal error"),
            Self::FlowControl => f.write_str("flow control error"),
            Self::StreamClosed => f.write_str("stream closed"),
            Self::FrameSize => f.write_str("frame size error"),
            Self::RefusedStream => f.write_str("refused stream"),
            Self::Cancel => f.write_str("cancelled"),
            Self::Unknown(code) => write!(f, "unknown reason {code:#x}"),
        }
    }
}

/// Codec errors for stream framing.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    /// Frame size exceeds maximum allowed
    #[error("frame too large: {size} bytes (max: {max})")]
    FrameTooLarge {
        /// Actual frame size
        size: usize,
        /// Maximum allowed size
        max: usize,
    },

    /// Frame type byte is not recognized.
    #[error("unknown frame type: {0:#04x}")]
    UnknownFrameType(u8),

    /// Invalid frame format
    #[error("invalid frame: {0}")]
    InvalidFrame(String),
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(Arc::new(e))
    }
}

impl TransportError {
    /// Create a stream reset error.
    #[must_use]
    pub fn reset(stream_id: u32, reason: Reason) -> Self {
        Self::StreamReset { stream_id, reason }
    }

    /// The operation was rejected for lack of capacity.
    #[must_use]
    pub fn is_capacity(&self) -> bool {
        matches!(self, Self::WaitersExceeded { .. } | Self::NotAccepting)
    }

    /// The deadline elapsed before a real result arrived.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }

    /// The operation was rejected or aborted by a planned shutdown.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        matches!(
            self,
            Self::NotRunning(_)
                | Self::ShuttingDown(_)
                | Self::AlreadyShuttingDown
                | Self::ShutdownTimeout
        )
    }

    /// The failure affects only one stream of a connection.
    #[must_use]
    pub fn is_stream_error(&self) -> bool {
        matches!(self, Self::StreamReset { .. } | Self::TooLarge { .. })
    }

    /// Check if this error indicates the connection should be closed.
    #[must_use]
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::ConnectionClosed | Self::Io(_) | Self::Protocol(_) | Self::Codec(_)
        )
    }

    /// Check if this error is retryable.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::WaitersExceeded { .. } => true,
            Self::ConnectionFailed(_) | Self::Io(_) | Self::ConnectionClosed => true,
            Self::StreamReset { reason, .. } => *reason == Reason::RefusedStream,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = TransportError::WaitersExceeded {
            pool: "10.0.0.1:80".into(),
            max: 4,
        };
        assert_eq!(
            err.to_string(),
            "pool 10.0.0.1:80 reached maximum waiter size: 4"
        );

        let err = TransportError::reset(3, Reason::Cancel);
        assert_eq!(err.to_string(), "stream 3 reset: cancelled");
    }

    #[test]
    fn test_classification() {
        assert!(TransportError::Timeout(Duration::from_millis(50)).is_timeout());
        assert!(!TransportError::ShutdownTimeout.is_timeout());
        assert!(TransportError::ShutdownTimeout.is_shutdown());
        assert!(TransportError::NotAccepting.is_capacity());
        assert!(TransportError::TooLarge { size: 10, max: 5 }.is_stream_error());
        assert!(!TransportError::TooLarge { size: 10, max: 5 }.is_connection_error());
        assert!(TransportError::Protocol("bad frame".into()).is_connection_error());
    }

    #[test]
    fn test_retryable() {
        assert!(TransportError::ConnectionClosed.is_retryable());
        assert!(TransportError::reset(1, Reason::RefusedStream).is_retryable());
        assert!(!TransportError::reset(1, Reason::Internal).is_retryable());
        assert!(!TransportError::Cancelled.is_retryable());
    }

    #[test]
    fn test_reason_codes() {
        for reason in [Reason::NoError, Reason::Protocol, Reason::RefusedStream, Reason::Cancel] {
            assert_eq!(Reason::from(reason.code()), reason);
        }
        assert_eq!(Reason::from(0xff), Reason::Unknown(0xff));
    }
}
