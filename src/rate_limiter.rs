use governor::clock::{Clock, DefaultClock};
use governor::{Quota, RateLimiter as GovernorRateLimiter};
use std::num::NonZeroU32;
use std::time::Duration;
use tracing::warn;

/// Token-bucket limiter guarding one request class (config fetches, or
/// long-poll registrations) against runaway retry storms.
///
/// Wraps `governor`'s direct, non-keyed limiter: every caller of a given
/// `RateLimiter` instance shares the same bucket, which matches how the
/// fetch/notify design scopes rate limiting per request class rather than
/// per namespace or per endpoint.
pub struct RateLimiter {
    inner: GovernorRateLimiter<governor::state::NotKeyed, governor::state::InMemoryState, DefaultClock>,
}

impl RateLimiter {
    pub fn new(permits_per_second: u32) -> Self {
        let permits = NonZeroU32::new(permits_per_second).unwrap_or(NonZeroU32::new(1).unwrap());
        Self {
            inner: GovernorRateLimiter::direct(Quota::per_second(permits)),
        }
    }

    /// Blocks until a permit is available, up to `timeout`. If the timeout
    /// elapses first, the request is allowed to proceed anyway rather than
    /// being dropped: a config client must make forward progress even under
    /// sustained throttling, and over-calling the server by a bounded amount
    /// is preferable to a client that silently stalls.
    pub async fn acquire(&self, timeout: Duration) {
        let clock = DefaultClock::default();
        let deadline = std::time::Instant::now() + timeout;
        loop {
            match self.inner.check() {
                Ok(()) => return,
                Err(not_until) => {
                    let wait = not_until.wait_time_from(clock.now());
                    let remaining = deadline.saturating_duration_since(std::time::Instant::now());
                    if remaining.is_zero() {
                        warn!("rate limiter timed out; proceeding without a permit");
                        return;
                    }
                    tokio::time::sleep(wait.min(remaining)).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn permits_within_quota_do_not_wait() {
        let limiter = RateLimiter::new(100);
        let start = std::time::Instant::now();
        limiter.acquire(Duration::from_millis(500)).await;
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn exhausted_quota_eventually_proceeds_anyway() {
        let limiter = RateLimiter::new(1);
        limiter.acquire(Duration::from_millis(10)).await;
        // second call immediately exceeds the single-token-per-second quota;
        // with a short timeout it must still return rather than hang.
        let start = std::time::Instant::now();
        limiter.acquire(Duration::from_millis(50)).await;
        assert!(start.elapsed() < Duration::from_secs(2));
    }
}
