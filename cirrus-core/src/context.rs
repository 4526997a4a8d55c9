//! Per-request context.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

static REQUEST_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

fn next_request_id() -> u64 {
    REQUEST_ID_COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// Metadata key-value pairs attached to a request.
pub type Metadata = HashMap<String, String>;

/// Request context carrying deadline overrides and metadata.
///
/// The effective deadline of a request is the client default, replaced by
/// [`RequestContext::timeout`] when set, then scaled by the preemptive
/// timeout rate when set.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Unique identifier for this request.
    pub request_id: u64,

    /// Per-request timeout replacing the client default.
    pub timeout: Option<Duration>,

    /// Multiplier applied to the resolved timeout.
    pub preemptive_timeout_rate: Option<f64>,

    /// Custom key-value metadata.
    pub metadata: Metadata,
}

impl RequestContext {
    /// Create a new context with a unique request ID.
    #[must_use]
    pub fn new() -> Self {
        Self {
            request_id: next_request_id(),
            timeout: None,
            preemptive_timeout_rate: None,
            metadata: HashMap::new(),
        }
    }

    /// Override the client's request timeout for this request.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Scale the resolved timeout by `rate`.
    #[must_use]
    pub fn with_preemptive_timeout_rate(mut self, rate: f64) -> Self {
        self.preemptive_timeout_rate = Some(rate);
        self
    }

    /// Add metadata to the context.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Get a metadata value.
    #[must_use]
    pub fn get_metadata(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }

    /// Resolve the deadline for this request against the client default.
    ///
    /// Non-finite or negative rates are ignored.
    #[must_use]
    pub fn resolve_timeout(&self, default: Duration) -> Duration {
        let timeout = self.timeout.unwrap_or(default);
        match self.preemptive_timeout_rate {
            Some(rate) if rate.is_finite() && rate >= 0.0 => timeout.mul_f64(rate),
            _ => timeout,
        }
    }
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::new()
    }
}
