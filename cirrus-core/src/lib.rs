//! # cirrus-core
//!
//! Core types, completion primitives, and error definitions for the Cirrus
//! transport core.
//!
//! This crate provides:
//! - Error types (`TransportError`, `CodecError`, `Reason`)
//! - One-shot callbacks, cancellation handles and the atomic settle flag
//! - The deadline guard (`TimeoutGuard`)
//! - Request context (`RequestContext`)

mod callback;
mod context;
mod error;
mod timeout;

pub use callback::{callback, Callback, Cancellable, Settle};
pub use context::{Metadata, RequestContext};
pub use error::{CodecError, Reason, TransportError};
pub use timeout::TimeoutGuard;
