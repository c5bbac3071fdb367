// =============================================================================
// Retry combinator — exponential backoff gated by an error classifier
// =============================================================================
//
// Keeps retry policy out of business logic: callers describe *how many*
// attempts and *which* failures are worth repeating, and the combinator owns
// the backoff schedule `min(base * 2^attempt, cap)`.
// =============================================================================

use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

/// Backoff schedule and attempt budget for one retried operation.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts, including the first one. Must be >= 1.
    pub max_attempts: u32,
    /// First inter-attempt delay.
    pub base_delay: Duration,
    /// Ceiling on the doubled delay.
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// A single attempt, no backoff.
    pub fn once() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(1),
        }
    }

    pub fn attempts(max_attempts: u32, cap: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay: Duration::from_secs(1),
            max_delay: cap,
        }
    }

    /// Delay before the attempt following attempt number `attempt` (0-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let doubled = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt));
        doubled.min(self.max_delay)
    }
}

/// Run `op` up to `policy.max_attempts` times, sleeping between attempts.
///
/// `retryable` decides whether a given failure is worth another attempt;
/// a non-retryable failure is returned immediately.
pub async fn retry<T, E, F, Fut, C>(
    policy: RetryPolicy,
    label: &str,
    retryable: C,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    C: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let mut attempt = 0u32;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) => {
                let last = attempt + 1 >= policy.max_attempts;
                if last || !retryable(&err) {
                    if !last {
                        debug!(label, attempt, error = %err, "non-retryable failure");
                    }
                    return Err(err);
                }
                let delay = policy.delay_for(attempt);
                warn!(
                    label,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "attempt failed — backing off"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
