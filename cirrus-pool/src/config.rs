//! Pool and rate-limiter configuration.

use std::time::Duration;

/// Which idle resource a pool hands out first.
///
/// Strategy never affects waiter fairness; waiters are always served in
/// arrival order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum Strategy {
    /// Least recently used first; spreads load over all idle resources.
    Lru,
    /// Most recently used first; lets surplus resources go idle and be reaped.
    #[default]
    Mru,
}

/// Configuration for the creation rate limiter.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct RateLimiterConfig {
    /// Ceiling on concurrent creation attempts.
    pub max_concurrent: usize,

    /// First backoff period after a creation failure.
    #[cfg_attr(feature = "serde", serde(with = "millis"))]
    pub initial_backoff: Duration,

    /// Upper bound for the doubling backoff period.
    #[cfg_attr(feature = "serde", serde(with = "millis"))]
    pub max_backoff: Duration,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            max_concurrent: usize::MAX,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
        }
    }
}

impl RateLimiterConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the ceiling on concurrent creations.
    #[must_use]
    pub fn max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max.max(1);
        self
    }

    /// Set the initial backoff period.
    #[must_use]
    pub fn initial_backoff(mut self, backoff: Duration) -> Self {
        self.initial_backoff = backoff;
        self
    }

    /// Set the maximum backoff period.
    #[must_use]
    pub fn max_backoff(mut self, backoff: Duration) -> Self {
        self.max_backoff = backoff;
        self
    }
}

/// Configuration for a resource pool.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct PoolConfig {
    /// Maximum resources (idle, checked out and creating) per pool.
    pub max_size: usize,

    /// Resources kept alive even when idle.
    pub min_size: usize,

    /// Maximum queued callers before `get` fails.
    pub max_waiters: usize,

    /// Idle resources unused for longer than this are reaped.
    #[cfg_attr(feature = "serde", serde(with = "millis"))]
    pub idle_timeout: Duration,

    /// How long shutdown waits for checked-out resources.
    #[cfg_attr(feature = "serde", serde(with = "millis"))]
    pub shutdown_timeout: Duration,

    /// Default deadline for a caller waiting on the pool.
    #[cfg_attr(feature = "serde", serde(with = "millis"))]
    pub request_timeout: Duration,

    /// Bound on a single `Lifecycle::create` call.
    #[cfg_attr(feature = "serde", serde(with = "millis"))]
    pub creation_timeout: Duration,

    /// Idle selection order.
    pub strategy: Strategy,

    /// Creation rate limiting.
    pub rate_limiter: RateLimiterConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: 200,
            min_size: 0,
            max_waiters: usize::MAX,
            idle_timeout: Duration::from_secs(25),
            shutdown_timeout: Duration::from_secs(15),
            request_timeout: Duration::from_secs(10),
            creation_timeout: Duration::from_secs(10),
            strategy: Strategy::default(),
            rate_limiter: RateLimiterConfig::default(),
        }
    }
}

impl PoolConfig {
    /// Create a new pool configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set maximum pool size.
    #[must_use]
    pub fn max_size(mut self, max: usize) -> Self {
        self.max_size = max.max(1);
        self
    }

    /// Set minimum pool size.
    #[must_use]
    pub fn min_size(mut self, min: usize) -> Self {
        self.min_size = min;
        self
    }

    /// Set maximum number of waiters.
    #[must_use]
    pub fn max_waiters(mut self, max: usize) -> Self {
        self.max_waiters = max;
        self
    }

    /// Set idle timeout.
    #[must_use]
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Set shutdown timeout.
    #[must_use]
    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Set the default request timeout.
    #[must_use]
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Set the per-creation timeout.
    #[must_use]
    pub fn creation_timeout(mut self, timeout: Duration) -> Self {
        self.creation_timeout = timeout;
        self
    }

    /// Set the idle selection strategy.
    #[must_use]
    pub fn strategy(mut self, strategy: Strategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Set the ceiling on concurrent creations.
    #[must_use]
    pub fn max_concurrent_connections(mut self, max: usize) -> Self {
        self.rate_limiter = self.rate_limiter.max_concurrent(max);
        self
    }

    /// Replace the rate limiter configuration.
    #[must_use]
    pub fn rate_limiter(mut self, config: RateLimiterConfig) -> Self {
        self.rate_limiter = config;
        self
    }

    /// Period of the idle reaper: a tenth of the idle timeout, at most 1s.
    #[must_use]
    pub fn reap_interval(&self) -> Duration {
        (self.idle_timeout / 10)
            .min(Duration::from_secs(1))
            .max(Duration::from_millis(1))
    }
}

#[cfg(feature = "serde")]
mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder() {
        let config = PoolConfig::new()
            .max_size(4)
            .min_size(1)
            .max_waiters(8)
            .strategy(Strategy::Lru)
            .max_concurrent_connections(2);

        assert_eq!(config.max_size, 4);
        assert_eq!(config.min_size, 1);
        assert_eq!(config.max_waiters, 8);
        assert_eq!(config.strategy, Strategy::Lru);
        assert_eq!(config.rate_limiter.max_concurrent, 2);
        assert_eq!(config.creation_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_reap_interval() {
        let config = PoolConfig::new().idle_timeout(Duration::from_secs(60));
        assert_eq!(config.reap_interval(), Duration::from_secs(1));

        let config = PoolConfig::new().idle_timeout(Duration::from_millis(500));
        assert_eq!(config.reap_interval(), Duration::from_millis(50));
    }

    #[test]
    fn test_zero_limits_clamped() {
        let config = PoolConfig::new().max_size(0).max_concurrent_connections(0);
        assert_eq!(config.max_size, 1);
        assert_eq!(config.rate_limiter.max_concurrent, 1);
    }
}
