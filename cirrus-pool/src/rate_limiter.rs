//! Exponential-backoff throttle for resource creation.

use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

use crate::config::RateLimiterConfig;

#[derive(Debug)]
struct State {
    in_flight: usize,
    permitted: usize,
    backoff: Duration,
    backoff_until: Option<Instant>,
}

/// Gates concurrent creation attempts for one pool.
///
/// The limiter tracks how many creations may run at once (`permitted`,
/// between 1 and the configured ceiling) and how many are running
/// (`in_flight`). A failure halves the budget and opens a backoff window
/// during which nothing is granted; consecutive failures double the window
/// up to `max_backoff`. A success doubles the budget back toward the ceiling
/// and closes the window.
///
/// Acquisition never blocks; callers that are refused consult
/// [`RateLimiter::retry_after`] and try again later.
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimiterConfig,
    state: Mutex<State>,
}

impl RateLimiter {
    #[must_use]
    pub fn new(config: RateLimiterConfig) -> Self {
        let ceiling = config.max_concurrent.max(1);
        Self {
            config,
            state: Mutex::new(State {
                in_flight: 0,
                permitted: ceiling,
                backoff: Duration::ZERO,
                backoff_until: None,
            }),
        }
    }

    fn ceiling(&self) -> usize {
        self.config.max_concurrent.max(1)
    }

    /// Reserve a creation permit.
    pub fn try_acquire(&self) -> bool {
        let mut state = self.state.lock();
        if state
            .backoff_until
            .is_some_and(|until| Instant::now() < until)
        {
            return false;
        }
        if state.in_flight >= state.permitted {
            return false;
        }
        state.in_flight += 1;
        true
    }

    /// Return a permit after a successful creation.
    pub fn on_success(&self) {
        let ceiling = self.ceiling();
        let mut state = self.state.lock();
        state.in_flight = state.in_flight.saturating_sub(1);
        state.permitted = state.permitted.saturating_mul(2).min(ceiling);
        state.backoff = Duration::ZERO;
        state.backoff_until = None;
    }

    /// Return a permit after a failed creation and back off.
    ///
    /// The budget shrinks to half of the concurrency actually in use, never
    /// below one.
    pub fn on_failure(&self) {
        let mut state = self.state.lock();
        let in_use = state.in_flight.max(1);
        state.in_flight = state.in_flight.saturating_sub(1);
        state.permitted = (state.permitted.min(in_use) / 2).max(1);

        state.backoff = if state.backoff.is_zero() {
            self.config.initial_backoff
        } else {
            state.backoff.saturating_mul(2).min(self.config.max_backoff)
        };
        state.backoff_until = Some(Instant::now() + state.backoff);

        tracing::debug!(
            permitted = state.permitted,
            backoff = ?state.backoff,
            "creation failed, backing off"
        );
    }

    /// Close the backoff window, keeping the current budget.
    pub fn reset_backoff(&self) {
        let mut state = self.state.lock();
        if !state.backoff.is_zero() {
            state.backoff = Duration::ZERO;
            state.backoff_until = None;
        }
    }

    /// Time left in the current backoff window.
    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        let state = self.state.lock();
        state
            .backoff_until
            .and_then(|until| until.checked_duration_since(Instant::now()))
            .filter(|d| !d.is_zero())
    }

    /// Current concurrent creation budget.
    #[must_use]
    pub fn permitted(&self) -> usize {
        self.state.lock().permitted
    }

    /// Creations currently holding a permit.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.state.lock().in_flight
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RateLimiterConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(max: usize) -> RateLimiter {
        RateLimiter::new(
            RateLimiterConfig::new()
                .max_concurrent(max)
                .initial_backoff(Duration::from_millis(100))
                .max_backoff(Duration::from_millis(400)),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_ceiling() {
        let limiter = limiter(2);
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());

        limiter.on_success();
        assert!(limiter.try_acquire());
        assert_eq!(limiter.permitted(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_shrinks_and_backs_off() {
        let limiter = limiter(8);
        for _ in 0..4 {
            assert!(limiter.try_acquire());
        }

        limiter.on_failure();
        assert_eq!(limiter.permitted(), 2);
        assert_eq!(limiter.in_flight(), 3);
        assert!(!limiter.try_acquire());
        assert_eq!(limiter.retry_after(), Some(Duration::from_millis(100)));

        tokio::time::advance(Duration::from_millis(100)).await;
        assert!(limiter.retry_after().is_none());
        // still over the shrunken budget
        assert!(!limiter.try_acquire());

        limiter.on_success();
        assert_eq!(limiter.permitted(), 4);
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());
        assert_eq!(limiter.in_flight(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_doubles_to_max() {
        let limiter = limiter(4);
        let mut seen = Vec::new();
        for _ in 0..4 {
            tokio::time::advance(Duration::from_secs(1)).await;
            assert!(limiter.try_acquire());
            limiter.on_failure();
            seen.push(limiter.retry_after().unwrap_or_default());
        }
        assert_eq!(
            seen,
            [100, 200, 400, 400].map(Duration::from_millis).to_vec()
        );
        assert_eq!(limiter.permitted(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_grows_back() {
        let limiter = limiter(8);
        assert!(limiter.try_acquire());
        limiter.on_failure();
        assert_eq!(limiter.permitted(), 1);

        tokio::time::advance(Duration::from_millis(100)).await;
        for expected in [2, 4, 8, 8] {
            assert!(limiter.try_acquire());
            limiter.on_success();
            assert_eq!(limiter.permitted(), expected);
        }
        assert!(limiter.retry_after().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_backoff() {
        let limiter = limiter(2);
        assert!(limiter.try_acquire());
        limiter.on_failure();
        assert!(!limiter.try_acquire());

        limiter.reset_backoff();
        assert!(limiter.try_acquire());
        // budget was halved to one
        assert!(!limiter.try_acquire());
    }
}
