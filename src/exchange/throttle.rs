// =============================================================================
// Token-Bucket Throttle — per-endpoint-class throughput shaping
// =============================================================================
//
// Two buckets shape all venue traffic: `info` (high capacity, cost weighted
// by request size) and `exchange` (low capacity, one token per order-path
// call). `throttle` refills lazily, deducts when tokens are available, and
// otherwise sleeps for exactly the shortfall. The sleep happens outside the
// bucket lock so concurrent callers keep refilling and deducting.
// =============================================================================

use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::EngineError;

/// Wait beyond which a starved bucket gives up with `RateLimit`.
const MAX_THROTTLE_WAIT: Duration = Duration::from_secs(30);

struct BucketInner {
    tokens: f64,
    last_refill: Instant,
}

/// One named token bucket.
pub struct TokenBucket {
    name: &'static str,
    capacity: f64,
    refill_per_second: f64,
    inner: Mutex<BucketInner>,
}

/// Copy-out counters for introspection.
#[derive(Debug, Clone, Serialize)]
pub struct BucketSnapshot {
    pub name: &'static str,
    pub capacity: f64,
    pub refill_per_second: f64,
    pub tokens: f64,
}

impl TokenBucket {
    pub fn new(name: &'static str, capacity: f64, refill_per_second: f64) -> Self {
        Self {
            name,
            capacity,
            refill_per_second,
            inner: Mutex::new(BucketInner {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Deduct `cost` tokens, suspending the caller until the bucket can
    /// afford it. Fails with `RateLimit` when the projected wait exceeds
    /// [`MAX_THROTTLE_WAIT`].
    pub async fn throttle(&self, cost: f64) -> Result<(), EngineError> {
        let mut waited = Duration::ZERO;
        loop {
            let wait = {
                let mut b = self.inner.lock();
                self.refill(&mut b);
                if b.tokens >= cost {
                    b.tokens -= cost;
                    return Ok(());
                }
                let deficit = cost - b.tokens;
                Duration::from_secs_f64(deficit / self.refill_per_second)
            };

            if waited + wait > MAX_THROTTLE_WAIT {
                warn!(
                    bucket = self.name,
                    cost,
                    wait_ms = wait.as_millis() as u64,
                    "bucket starved beyond maximum wait"
                );
                return Err(EngineError::RateLimit(format!(
                    "bucket '{}' starved: {:.1}s wait for cost {cost}",
                    self.name,
                    wait.as_secs_f64()
                )));
            }

            debug!(
                bucket = self.name,
                cost,
                wait_ms = wait.as_millis() as u64,
                "throttling"
            );
            tokio::time::sleep(wait).await;
            waited += wait;
        }
    }

    fn refill(&self, b: &mut BucketInner) {
        let elapsed = b.last_refill.elapsed().as_secs_f64();
        b.tokens = (b.tokens + elapsed * self.refill_per_second).min(self.capacity);
        b.last_refill = Instant::now();
    }

    pub fn snapshot(&self) -> BucketSnapshot {
        let mut b = self.inner.lock();
        self.refill(&mut b);
        BucketSnapshot {
            name: self.name,
            capacity: self.capacity,
            refill_per_second: self.refill_per_second,
            tokens: b.tokens,
        }
    }
}

/// The exchange client's two buckets.
pub struct VenueThrottle {
    pub info: TokenBucket,
    pub exchange: TokenBucket,
}

impl VenueThrottle {
    pub fn new() -> Self {
        Self {
            // Info endpoints tolerate bursts; weight heavier requests by cost.
            info: TokenBucket::new("info", 100.0, 10.0),
            // Order-path calls are scarce.
            exchange: TokenBucket::new("exchange", 20.0, 2.0),
        }
    }

    pub fn snapshots(&self) -> Vec<BucketSnapshot> {
        vec![self.info.snapshot(), self.exchange.snapshot()]
    }
}

impl Default for VenueThrottle {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn deducts_when_tokens_available() {
        let bucket = TokenBucket::new("t", 10.0, 1.0);
        bucket.throttle(4.0).await.unwrap();
        let snap = bucket.snapshot();
        assert!(snap.tokens <= 6.0 + 1e-6);
    }

    #[tokio::test]
    async fn suspends_until_refilled() {
        let bucket = TokenBucket::new("t", 2.0, 100.0);
        bucket.throttle(2.0).await.unwrap();

        // Bucket is empty; cost 2 needs ~20ms of refill at 100/s.
        let start = Instant::now();
        bucket.throttle(2.0).await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(10));
    }

    #[tokio::test]
    async fn starved_bucket_fails_with_rate_limit() {
        // 0.001 tokens/s: a cost of 10 would take ~3 hours.
        let bucket = TokenBucket::new("t", 1.0, 0.001);
        bucket.throttle(1.0).await.unwrap();

        let err = bucket.throttle(10.0).await.unwrap_err();
        assert!(matches!(err, EngineError::RateLimit(_)));
    }

    #[tokio::test]
    async fn refill_clamps_to_capacity() {
        let bucket = TokenBucket::new("t", 5.0, 1000.0);
        bucket.throttle(5.0).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let snap = bucket.snapshot();
        assert!(snap.tokens <= 5.0 + 1e-6);
    }

    #[tokio::test]
    async fn venue_throttle_has_both_buckets() {
        let throttle = VenueThrottle::new();
        let snaps = throttle.snapshots();
        assert_eq!(snaps.len(), 2);
        assert_eq!(snaps[0].name, "info");
        assert_eq!(snaps[1].name, "exchange");
        assert!(snaps[0].capacity > snaps[1].capacity);
    }
}
