//! Pluggable resource lifecycle.

use std::future::Future;

use cirrus_core::TransportError;

/// Counters a lifecycle may report alongside pool statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LifecycleStats {
    /// Successful `create` calls.
    pub connects: u64,
    /// Failed `create` calls.
    pub connect_errors: u64,
}

/// Create, validate and destroy the resources a pool manages.
///
/// Validation runs outside the pool lock and must be cheap. A resource that
/// fails validation is destroyed silently; callers never see the failure.
///
/// ## Example
///
/// ```rust
/// use cirrus_core::TransportError;
/// use cirrus_pool::Lifecycle;
///
/// struct Counter;
///
/// impl Lifecycle for Counter {
///     type Resource = u32;
///
///     async fn create(&self) -> Result<u32, TransportError> {
///         Ok(7)
///     }
///
///     async fn destroy(&self, _resource: u32, _error: bool) -> Result<(), TransportError> {
///         Ok(())
///     }
/// }
/// ```
pub trait Lifecycle: Send + Sync + 'static {
    /// The pooled resource.
    type Resource: Send + 'static;

    /// Create a new resource.
    fn create(&self) -> impl Future<Output = Result<Self::Resource, TransportError>> + Send;

    /// Check an idle resource before handing it out.
    fn validate_get(&self, _resource: &Self::Resource) -> bool {
        true
    }

    /// Check a returned resource before it goes back to the idle set.
    fn validate_put(&self, _resource: &Self::Resource) -> bool {
        true
    }

    /// Tear a resource down. `error` is set when it is discarded because it
    /// failed or was reported broken.
    fn destroy(
        &self,
        resource: Self::Resource,
        error: bool,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Lifecycle-level counters.
    fn stats(&self) -> LifecycleStats {
        LifecycleStats::default()
    }
}
