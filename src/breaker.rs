// =============================================================================
// Circuit-Breaker Registry — named breakers guarding every fragile call path
// =============================================================================
//
// Per-breaker state machine:
//
//   CLOSED --(failures >= threshold)--> OPEN
//   OPEN   --(open_ms elapsed)-------> HALF_OPEN
//   HALF_OPEN --(probe success)------> CLOSED
//   HALF_OPEN --(probe failure)------> OPEN
//
// Each breaker sits behind its own mutex; snapshots are copy-out. State
// transitions are announced on the message bus so operators see opens and
// recoveries in real time. The breaker named `execution` gates the whole
// cycle and recovery flow.
// =============================================================================

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{info, warn};

use crate::bus::{Channel, MessageBus};
use crate::config::BreakerConfig;
use crate::error::EngineError;

/// Breaker used by the orchestrator and recovery monitor to gate everything.
pub const EXECUTION_BREAKER: &str = "execution";

// =============================================================================
// Types
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BreakerState {
    #[serde(rename = "CLOSED")]
    Closed,
    #[serde(rename = "OPEN")]
    Open,
    #[serde(rename = "HALF_OPEN")]
    HalfOpen,
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "CLOSED"),
            Self::Open => write!(f, "OPEN"),
            Self::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// Copy-out snapshot of one breaker.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerStatus {
    pub name: String,
    pub state: BreakerState,
    pub failure_count: u32,
    pub consecutive_successes: u32,
    /// ISO 8601, present after at least one failure.
    pub last_failure_at: Option<String>,
    /// ISO 8601, present while OPEN.
    pub opened_at: Option<String>,
}

/// Aggregate health across all registered breakers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum HealthSummary {
    #[serde(rename = "HEALTHY")]
    Healthy,
    #[serde(rename = "DEGRADED")]
    Degraded,
    #[serde(rename = "CRITICAL")]
    Critical,
}

impl std::fmt::Display for HealthSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Healthy => write!(f, "HEALTHY"),
            Self::Degraded => write!(f, "DEGRADED"),
            Self::Critical => write!(f, "CRITICAL"),
        }
    }
}

// =============================================================================
// Single breaker
// =============================================================================

struct BreakerInner {
    state: BreakerState,
    failure_count: u32,
    consecutive_successes: u32,
    last_failure_at: Option<chrono::DateTime<chrono::Utc>>,
    opened_at: Option<(Instant, chrono::DateTime<chrono::Utc>)>,
    half_open_in_flight: u32,
}

struct Breaker {
    name: String,
    policy: BreakerConfig,
    inner: Mutex<BreakerInner>,
}

/// What happened to the breaker as a result of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Transition {
    None,
    Opened,
    Closed,
}

impl Breaker {
    fn new(name: &str, policy: BreakerConfig) -> Self {
        Self {
            name: name.to_string(),
            policy,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                failure_count: 0,
                consecutive_successes: 0,
                last_failure_at: None,
                opened_at: None,
                half_open_in_flight: 0,
            }),
        }
    }

    /// Gate a call. OPEN short-circuits unless the open window has elapsed,
    /// in which case the breaker moves to HALF_OPEN and admits up to
    /// `half_open_probes` concurrent probes.
    fn try_acquire(&self) -> Result<(), EngineError> {
        let mut s = self.inner.lock();
        match s.state {
            BreakerState::Closed => Ok(()),
            BreakerState::Open => {
                let elapsed_ms = s
                    .opened_at
                    .map(|(at, _)| at.elapsed().as_millis() as u64)
                    .unwrap_or(u64::MAX);
                if elapsed_ms >= self.policy.open_ms {
                    s.state = BreakerState::HalfOpen;
                    s.half_open_in_flight = 1;
                    info!(breaker = %self.name, "breaker half-open — probing");
                    Ok(())
                } else {
                    Err(EngineError::BreakerOpen(self.name.clone()))
                }
            }
            BreakerState::HalfOpen => {
                if s.half_open_in_flight < self.policy.half_open_probes {
                    s.half_open_in_flight += 1;
                    Ok(())
                } else {
                    Err(EngineError::BreakerOpen(self.name.clone()))
                }
            }
        }
    }

    fn on_success(&self) -> Transition {
        let mut s = self.inner.lock();
        s.half_open_in_flight = s.half_open_in_flight.saturating_sub(1);
        s.consecutive_successes += 1;
        match s.state {
            BreakerState::HalfOpen => {
                s.state = BreakerState::Closed;
                s.failure_count = 0;
                s.opened_at = None;
                Transition::Closed
            }
            BreakerState::Closed => {
                s.failure_count = 0;
                Transition::None
            }
            BreakerState::Open => Transition::None,
        }
    }

    fn on_failure(&self) -> Transition {
        let mut s = self.inner.lock();
        s.half_open_in_flight = s.half_open_in_flight.saturating_sub(1);
        s.consecutive_successes = 0;
        s.failure_count += 1;
        s.last_failure_at = Some(chrono::Utc::now());
        let should_open = match s.state {
            BreakerState::HalfOpen => true,
            BreakerState::Closed => s.failure_count >= self.policy.failure_threshold,
            BreakerState::Open => false,
        };
        if should_open {
            s.state = BreakerState::Open;
            s.opened_at = Some((Instant::now(), chrono::Utc::now()));
            Transition::Opened
        } else {
            Transition::None
        }
    }

    fn force_open(&self) -> Transition {
        let mut s = self.inner.lock();
        if s.state == BreakerState::Open {
            return Transition::None;
        }
        s.state = BreakerState::Open;
        s.opened_at = Some((Instant::now(), chrono::Utc::now()));
        Transition::Opened
    }

    fn reset(&self) -> Transition {
        let mut s = self.inner.lock();
        let was_open = s.state != BreakerState::Closed;
        s.state = BreakerState::Closed;
        s.failure_count = 0;
        s.consecutive_successes = 0;
        s.opened_at = None;
        s.half_open_in_flight = 0;
        if was_open {
            Transition::Closed
        } else {
            Transition::None
        }
    }

    fn is_open(&self) -> bool {
        self.inner.lock().state == BreakerState::Open
    }

    fn status(&self) -> BreakerStatus {
        let s = self.inner.lock();
        BreakerStatus {
            name: self.name.clone(),
            state: s.state,
            failure_count: s.failure_count,
            consecutive_successes: s.consecutive_successes,
            last_failure_at: s.last_failure_at.map(|t| t.to_rfc3339()),
            opened_at: s.opened_at.map(|(_, t)| t.to_rfc3339()),
        }
    }
}

// =============================================================================
// Registry
// =============================================================================

pub struct CircuitBreakerRegistry {
    policy: BreakerConfig,
    breakers: RwLock<HashMap<String, Arc<Breaker>>>,
    bus: Arc<MessageBus>,
}

impl CircuitBreakerRegistry {
    pub fn new(policy: BreakerConfig, bus: Arc<MessageBus>) -> Self {
        Self {
            policy,
            breakers: RwLock::new(HashMap::new()),
            bus,
        }
    }

    fn breaker(&self, name: &str) -> Arc<Breaker> {
        if let Some(b) = self.breakers.read().get(name) {
            return b.clone();
        }
        let mut map = self.breakers.write();
        map.entry(name.to_string())
            .or_insert_with(|| Arc::new(Breaker::new(name, self.policy.clone())))
            .clone()
    }

    fn announce(&self, name: &str, transition: Transition) {
        match transition {
            Transition::Opened => {
                warn!(breaker = name, "circuit breaker OPEN");
                self.bus.publish(
                    Channel::CircuitBreakerOpen,
                    serde_json::json!({ "name": name }),
                );
            }
            Transition::Closed => {
                info!(breaker = name, "circuit breaker closed");
                self.bus.publish(
                    Channel::CircuitBreakerClosed,
                    serde_json::json!({ "name": name }),
                );
            }
            Transition::None => {}
        }
    }

    // -------------------------------------------------------------------------
    // Execution
    // -------------------------------------------------------------------------

    /// Run `op` through the named breaker. Failures count against it; an OPEN
    /// breaker short-circuits with `BreakerOpen`.
    pub async fn execute<T, F, Fut>(&self, name: &str, op: F) -> Result<T, EngineError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, EngineError>>,
    {
        let breaker = self.breaker(name);
        breaker.try_acquire()?;

        match op().await {
            Ok(value) => {
                self.announce(name, breaker.on_success());
                Ok(value)
            }
            Err(err) => {
                self.announce(name, breaker.on_failure());
                Err(err)
            }
        }
    }

    /// Like [`execute`], but a breaker-open short-circuit or an operation
    /// failure falls back to `fallback()`. The breaker still records the
    /// failure.
    pub async fn execute_with_fallback<T, F, Fut, FB>(
        &self,
        name: &str,
        op: F,
        fallback: FB,
    ) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, EngineError>>,
        FB: FnOnce(&EngineError) -> T,
    {
        let breaker = self.breaker(name);
        if let Err(err) = breaker.try_acquire() {
            // A short-circuit also counts as a failure against the breaker so
            // its failure history reflects every degraded call.
            self.announce(name, breaker.on_failure());
            return fallback(&err);
        }

        match op().await {
            Ok(value) => {
                self.announce(name, breaker.on_success());
                value
            }
            Err(err) => {
                self.announce(name, breaker.on_failure());
                fallback(&err)
            }
        }
    }

    // -------------------------------------------------------------------------
    // Introspection & admin
    // -------------------------------------------------------------------------

    pub fn is_open(&self, name: &str) -> bool {
        self.breakers
            .read()
            .get(name)
            .map(|b| b.is_open())
            .unwrap_or(false)
    }

    pub fn all_statuses(&self) -> Vec<BreakerStatus> {
        let mut statuses: Vec<BreakerStatus> = self
            .breakers
            .read()
            .values()
            .map(|b| b.status())
            .collect();
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        statuses
    }

    /// HEALTHY when nothing is open, CRITICAL when more than half of all
    /// breakers are open, DEGRADED in between.
    pub fn health_summary(&self) -> HealthSummary {
        let breakers = self.breakers.read();
        let total = breakers.len();
        let open = breakers.values().filter(|b| b.is_open()).count();
        if open == 0 {
            HealthSummary::Healthy
        } else if open * 2 > total {
            HealthSummary::Critical
        } else {
            HealthSummary::Degraded
        }
    }

    /// Force a breaker back to CLOSED with zeroed counters.
    pub fn reset(&self, name: &str) {
        let breaker = self.breaker(name);
        self.announce(name, breaker.reset());
    }

    /// Force a breaker OPEN (operator action or the orchestrator's
    /// consecutive-error budget).
    pub fn force_open(&self, name: &str) {
        let breaker = self.breaker(name);
        self.announce(name, breaker.force_open());
    }

    /// Record a failure without running anything through the breaker.
    pub fn record_failure(&self, name: &str) {
        let breaker = self.breaker(name);
        self.announce(name, breaker.on_failure());
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> CircuitBreakerRegistry {
        CircuitBreakerRegistry::new(BreakerConfig::default(), Arc::new(MessageBus::new()))
    }

    fn fast_registry(open_ms: u64) -> CircuitBreakerRegistry {
        CircuitBreakerRegistry::new(
            BreakerConfig {
                failure_threshold: 3,
                open_ms,
                half_open_probes: 1,
                max_consecutive_cycle_errors: 5,
            },
            Arc::new(MessageBus::new()),
        )
    }

    async fn fail(reg: &CircuitBreakerRegistry, name: &str) {
        let _: Result<(), _> = reg
            .execute(name, || async { Err(EngineError::Network("boom".into())) })
            .await;
    }

    #[tokio::test]
    async fn opens_after_threshold_failures() {
        let reg = registry();
        for _ in 0..4 {
            fail(&reg, "api").await;
            assert!(!reg.is_open("api"));
        }
        fail(&reg, "api").await;
        assert!(reg.is_open("api"));
    }

    #[tokio::test]
    async fn open_breaker_short_circuits() {
        let reg = registry();
        reg.force_open("api");

        let result: Result<u32, _> = reg.execute("api", || async { Ok(1) }).await;
        assert!(matches!(result, Err(EngineError::BreakerOpen(name)) if name == "api"));
    }

    #[tokio::test]
    async fn half_open_probe_success_closes() {
        let reg = fast_registry(0);
        for _ in 0..3 {
            fail(&reg, "api").await;
        }
        assert!(reg.is_open("api"));

        // open_ms = 0, so the next call is admitted as a probe.
        let result: Result<u32, _> = reg.execute("api", || async { Ok(9) }).await;
        assert_eq!(result.unwrap(), 9);
        assert!(!reg.is_open("api"));

        let status = &reg.all_statuses()[0];
        assert_eq!(status.state, BreakerState::Closed);
        assert_eq!(status.failure_count, 0);
    }

    #[tokio::test]
    async fn half_open_probe_failure_reopens() {
        let reg = fast_registry(0);
        for _ in 0..3 {
            fail(&reg, "api").await;
        }
        fail(&reg, "api").await;
        assert!(reg.is_open("api"));
    }

    #[tokio::test]
    async fn fallback_used_and_failure_recorded() {
        let reg = registry();

        let value = reg
            .execute_with_fallback(
                "stage",
                || async { Err::<u32, _>(EngineError::Network("down".into())) },
                |_err| 99,
            )
            .await;
        assert_eq!(value, 99);
        assert_eq!(reg.all_statuses()[0].failure_count, 1);
    }

    #[tokio::test]
    async fn force_open_then_reset_restores_closed_zeroed() {
        let reg = registry();
        fail(&reg, "api").await;
        reg.force_open("api");
        assert!(reg.is_open("api"));

        reg.reset("api");
        let status = &reg.all_statuses()[0];
        assert_eq!(status.state, BreakerState::Closed);
        assert_eq!(status.failure_count, 0);
        assert_eq!(status.consecutive_successes, 0);
    }

    #[tokio::test]
    async fn health_summary_thresholds() {
        let reg = registry();
        let _: Result<(), _> = reg.execute("a", || async { Ok(()) }).await;
        let _: Result<(), _> = reg.execute("b", || async { Ok(()) }).await;
        let _: Result<(), _> = reg.execute("c", || async { Ok(()) }).await;
        assert_eq!(reg.health_summary(), HealthSummary::Healthy);

        reg.force_open("a");
        assert_eq!(reg.health_summary(), HealthSummary::Degraded);

        reg.force_open("b");
        assert_eq!(reg.health_summary(), HealthSummary::Critical);
    }

    #[tokio::test]
    async fn success_resets_failure_count_when_closed() {
        let reg = registry();
        fail(&reg, "api").await;
        fail(&reg, "api").await;

        let _: Result<(), _> = reg.execute("api", || async { Ok(()) }).await;
        assert_eq!(reg.all_statuses()[0].failure_count, 0);
    }

    #[tokio::test]
    async fn transitions_published_on_bus() {
        let bus = Arc::new(MessageBus::new());
        bus.connect();
        let opened = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let opened2 = opened.clone();
        bus.subscribe(
            Channel::CircuitBreakerOpen,
            "test",
            Arc::new(move |_| {
                opened2.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            }),
        );

        let reg = CircuitBreakerRegistry::new(BreakerConfig::default(), bus);
        reg.force_open("api");
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(opened.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
