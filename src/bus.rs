// =============================================================================
// Message Bus — process-wide pub/sub with per-subscriber worker queues
// =============================================================================
//
// Channels are a closed enumeration plus dotted free-form names. Each
// subscription owns a bounded queue drained by its own worker task, so
// delivery is FIFO per (channel, subscriber) and a slow handler on one
// channel can never starve another. Publishing is fire-and-forget: a full
// subscriber queue counts a drop instead of blocking the publisher.
//
// The bus itself is the process-local broker; `connect` / `disconnect` track
// the lifecycle so health reporting and degraded-mode delivery match what an
// external broker adapter would expose. Handlers must tolerate repeats.
// =============================================================================

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Capacity of each subscriber's queue.
const SUBSCRIBER_QUEUE_CAPACITY: usize = 256;

// =============================================================================
// Channels
// =============================================================================

/// The declared channel set plus free-form dotted names.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Channel {
    NewsClustered,
    NewsHotClusters,
    NewsCategorized,
    NewsAnomaly,
    NewsPrediction,
    NewsCrossCategory,
    EntityTrending,
    UserEngagement,
    QualityMetric,
    CycleStart,
    CycleComplete,
    CycleError,
    ExecutionFilled,
    ExecutionFailed,
    PositionOpened,
    PositionClosed,
    CircuitBreakerOpen,
    CircuitBreakerClosed,
    Error,
    /// Dotted producer namespaces (`pumpfun:*`, `research:*`, `safekeeping:*`).
    Custom(String),
}

impl Channel {
    pub fn as_name(&self) -> &str {
        match self {
            Self::NewsClustered => "NEWS_CLUSTERED",
            Self::NewsHotClusters => "NEWS_HOT_CLUSTERS",
            Self::NewsCategorized => "NEWS_CATEGORIZED",
            Self::NewsAnomaly => "NEWS_ANOMALY",
            Self::NewsPrediction => "NEWS_PREDICTION",
            Self::NewsCrossCategory => "NEWS_CROSS_CATEGORY",
            Self::EntityTrending => "ENTITY_TRENDING",
            Self::UserEngagement => "USER_ENGAGEMENT",
            Self::QualityMetric => "QUALITY_METRIC",
            Self::CycleStart => "CYCLE_START",
            Self::CycleComplete => "CYCLE_COMPLETE",
            Self::CycleError => "CYCLE_ERROR",
            Self::ExecutionFilled => "EXECUTION_FILLED",
            Self::ExecutionFailed => "EXECUTION_FAILED",
            Self::PositionOpened => "POSITION_OPENED",
            Self::PositionClosed => "POSITION_CLOSED",
            Self::CircuitBreakerOpen => "CIRCUIT_BREAKER_OPEN",
            Self::CircuitBreakerClosed => "CIRCUIT_BREAKER_CLOSED",
            Self::Error => "ERROR",
            Self::Custom(name) => name,
        }
    }

    pub fn from_name(name: &str) -> Self {
        match name {
            "NEWS_CLUSTERED" => Self::NewsClustered,
            "NEWS_HOT_CLUSTERS" => Self::NewsHotClusters,
            "NEWS_CATEGORIZED" => Self::NewsCategorized,
            "NEWS_ANOMALY" => Self::NewsAnomaly,
            "NEWS_PREDICTION" => Self::NewsPrediction,
            "NEWS_CROSS_CATEGORY" => Self::NewsCrossCategory,
            "ENTITY_TRENDING" => Self::EntityTrending,
            "USER_ENGAGEMENT" => Self::UserEngagement,
            "QUALITY_METRIC" => Self::QualityMetric,
            "CYCLE_START" => Self::CycleStart,
            "CYCLE_COMPLETE" => Self::CycleComplete,
            "CYCLE_ERROR" => Self::CycleError,
            "EXECUTION_FILLED" => Self::ExecutionFilled,
            "EXECUTION_FAILED" => Self::ExecutionFailed,
            "POSITION_OPENED" => Self::PositionOpened,
            "POSITION_CLOSED" => Self::PositionClosed,
            "CIRCUIT_BREAKER_OPEN" => Self::CircuitBreakerOpen,
            "CIRCUIT_BREAKER_CLOSED" => Self::CircuitBreakerClosed,
            "ERROR" => Self::Error,
            other => Self::Custom(other.to_string()),
        }
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_name())
    }
}

// =============================================================================
// Messages
// =============================================================================

/// A single published message. `data` is opaque JSON; the bus stamps the
/// timestamp at publish time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusMessage {
    pub channel: String,
    pub data: Value,
    /// Unix millis, stamped by the bus.
    pub timestamp: i64,
}

/// Handler invoked on the subscriber's worker task.
pub type Handler = Arc<dyn Fn(BusMessage) + Send + Sync>;

struct Subscription {
    channel: Channel,
    name: String,
    tx: mpsc::Sender<BusMessage>,
}

/// Serialisable bus status for `/api/health`.
#[derive(Debug, Clone, Serialize)]
pub struct BusStatus {
    pub connected: bool,
    pub subscriptions: usize,
    pub published: u64,
    pub dropped: u64,
}

// =============================================================================
// MessageBus
// =============================================================================

pub struct MessageBus {
    connected: AtomicBool,
    subscriptions: RwLock<Vec<Subscription>>,
    published: AtomicU64,
    dropped: AtomicU64,
}

impl MessageBus {
    pub fn new() -> Self {
        Self {
            connected: AtomicBool::new(false),
            subscriptions: RwLock::new(Vec::new()),
            published: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    /// Idempotent: connecting an already-connected bus is a no-op.
    pub fn connect(&self) {
        if !self.connected.swap(true, Ordering::SeqCst) {
            info!("message bus connected");
        }
    }

    /// Idempotent. Subscriptions survive a disconnect; delivery degrades to
    /// best-effort until reconnected.
    pub fn disconnect(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            info!("message bus disconnected");
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    // -------------------------------------------------------------------------
    // Subscribe
    // -------------------------------------------------------------------------

    /// Register `handler` for `channel` and spawn its worker task. Delivery to
    /// this subscriber starts with the next publish; earlier messages are not
    /// replayed.
    pub fn subscribe(&self, channel: Channel, name: impl Into<String>, handler: Handler) {
        let name = name.into();
        let (tx, mut rx) = mpsc::channel::<BusMessage>(SUBSCRIBER_QUEUE_CAPACITY);

        self.subscriptions.write().push(Subscription {
            channel: channel.clone(),
            name: name.clone(),
            tx,
        });

        debug!(channel = %channel, subscriber = %name, "subscription registered");

        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                handler(msg);
            }
            debug!(channel = %channel, subscriber = %name, "subscription worker stopped");
        });
    }

    // -------------------------------------------------------------------------
    // Publish
    // -------------------------------------------------------------------------

    /// Fire-and-forget publish. Stamps the timestamp and hands the message to
    /// every matching subscriber queue without blocking; full queues drop.
    pub fn publish(&self, channel: Channel, data: Value) {
        let msg = BusMessage {
            channel: channel.as_name().to_string(),
            data,
            timestamp: chrono::Utc::now().timestamp_millis(),
        };

        self.published.fetch_add(1, Ordering::Relaxed);

        if !self.is_connected() {
            debug!(channel = %channel, "bus degraded — best-effort local delivery");
        }

        let subs = self.subscriptions.read();
        for sub in subs.iter().filter(|s| s.channel == channel) {
            match sub.tx.try_send(msg.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        channel = %channel,
                        subscriber = %sub.name,
                        "subscriber queue full — message dropped"
                    );
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        channel = %channel,
                        subscriber = %sub.name,
                        "subscriber gone — message dropped"
                    );
                }
            }
        }
    }

    // -------------------------------------------------------------------------
    // Status
    // -------------------------------------------------------------------------

    pub fn status(&self) -> BusStatus {
        BusStatus {
            connected: self.is_connected(),
            subscriptions: self.subscriptions.read().len(),
            published: self.published.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

impl Default for MessageBus {
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
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn counting_handler(count: Arc<AtomicUsize>) -> Handler {
        Arc::new(move |_msg| {
            count.fetch_add(1, Ordering::SeqCst);
        })
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[test]
    fn channel_names_roundtrip() {
        for ch in [
            Channel::CycleStart,
            Channel::ExecutionFilled,
            Channel::CircuitBreakerOpen,
            Channel::Error,
        ] {
            assert_eq!(Channel::from_name(ch.as_name()), ch);
        }
        assert_eq!(
            Channel::from_name("pumpfun:launch"),
            Channel::Custom("pumpfun:launch".to_string())
        );
    }

    #[test]
    fn connect_disconnect_idempotent() {
        let bus = MessageBus::new();
        assert!(!bus.is_connected());
        bus.connect();
        bus.connect();
        assert!(bus.is_connected());
        bus.disconnect();
        bus.disconnect();
        assert!(!bus.is_connected());
    }

    #[tokio::test]
    async fn publish_reaches_matching_subscribers_only() {
        let bus = MessageBus::new();
        bus.connect();

        let filled = Arc::new(AtomicUsize::new(0));
        let failed = Arc::new(AtomicUsize::new(0));
        bus.subscribe(
            Channel::ExecutionFilled,
            "filled-counter",
            counting_handler(filled.clone()),
        );
        bus.subscribe(
            Channel::ExecutionFailed,
            "failed-counter",
            counting_handler(failed.clone()),
        );

        bus.publish(Channel::ExecutionFilled, serde_json::json!({"symbol": "BTC"}));
        bus.publish(Channel::ExecutionFilled, serde_json::json!({"symbol": "ETH"}));
        settle().await;

        assert_eq!(filled.load(Ordering::SeqCst), 2);
        assert_eq!(failed.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn late_subscriber_does_not_replay() {
        let bus = MessageBus::new();
        bus.connect();

        bus.publish(Channel::CycleComplete, serde_json::json!({"n": 1}));

        let count = Arc::new(AtomicUsize::new(0));
        bus.subscribe(
            Channel::CycleComplete,
            "late",
            counting_handler(count.clone()),
        );
        settle().await;
        assert_eq!(count.load(Ordering::SeqCst), 0);

        bus.publish(Channel::CycleComplete, serde_json::json!({"n": 2}));
        settle().await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn per_channel_fifo_for_a_subscriber() {
        let bus = MessageBus::new();
        bus.connect();

        let seen: Arc<parking_lot::Mutex<Vec<i64>>> =
            Arc::new(parking_lot::Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        bus.subscribe(
            Channel::CycleStart,
            "order-check",
            Arc::new(move |msg| {
                seen2.lock().push(msg.data["n"].as_i64().unwrap());
            }),
        );

        for n in 0..10 {
            bus.publish(Channel::CycleStart, serde_json::json!({ "n": n }));
        }
        settle().await;

        assert_eq!(*seen.lock(), (0..10).collect::<Vec<i64>>());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn slow_handler_does_not_starve_other_channel() {
        let bus = MessageBus::new();
        bus.connect();

        let fast = Arc::new(AtomicUsize::new(0));
        bus.subscribe(
            Channel::CycleStart,
            "slow",
            Arc::new(|_msg| {
                std::thread::sleep(Duration::from_millis(200));
            }),
        );
        bus.subscribe(
            Channel::PositionOpened,
            "fast",
            counting_handler(fast.clone()),
        );

        bus.publish(Channel::CycleStart, serde_json::json!({}));
        bus.publish(Channel::PositionOpened, serde_json::json!({}));
        settle().await;

        assert_eq!(fast.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn publish_stamps_timestamp() {
        let bus = MessageBus::new();
        bus.connect();

        let stamp: Arc<parking_lot::Mutex<Option<i64>>> =
            Arc::new(parking_lot::Mutex::new(None));
        let stamp2 = stamp.clone();
        bus.subscribe(
            Channel::Error,
            "stamp-check",
            Arc::new(move |msg| {
                *stamp2.lock() = Some(msg.timestamp);
            }),
        );

        let before = chrono::Utc::now().timestamp_millis();
        bus.publish(Channel::Error, serde_json::json!({"type": "TEST"}));
        settle().await;

        let ts = stamp.lock().unwrap();
        assert!(ts >= before);
    }
}
