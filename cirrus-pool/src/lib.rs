//! # cirrus-pool
//!
//! Asynchronous resource pools for the Cirrus transport core.
//!
//! This crate provides:
//! - `ResourcePool` - bounded per-destination pool with FIFO waiters
//! - `SharedPool` - single shared resource for multiplexed connections
//! - `RateLimiter` - exponential-backoff throttle for resource creation
//! - `PoolRegistry` - destination-keyed pools with coordinated shutdown
//! - `AcquireExt` - deadline-bounded checkout on top of any pool
//!
//! ## Features
//!
//! - `serde` - `Serialize`/`Deserialize` for the configuration types

mod config;
mod handle;
mod lifecycle;
mod pool;
mod rate_limiter;
mod registry;
mod shared;
mod stats;

pub use config::{PoolConfig, RateLimiterConfig, Strategy};
pub use handle::{AcquireExt, AsyncPool, PoolHandle};
pub use lifecycle::{Lifecycle, LifecycleStats};
pub use pool::{PoolState, ResourcePool};
pub use rate_limiter::RateLimiter;
pub use registry::{PoolFactory, PoolRegistry};
pub use shared::SharedPool;
pub use stats::{LatencyStats, LatencyTracker, PoolStats};
