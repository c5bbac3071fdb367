// =============================================================================
// Order Ledger — overfill protection for every submitted order
// =============================================================================
//
// Tracks cumulative fills per order and refuses any fill that would push
// `filled_qty` past `order_qty`. The ledger is authoritative: when the venue
// reports a different running total, the divergence is logged and the
// ledger's number wins. All operations are O(1) under a single mutex.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::bus::{Channel, MessageBus};
use crate::error::EngineError;
use crate::types::Action;

/// Lifecycle of a ledger entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    #[serde(rename = "PENDING")]
    Pending,
    #[serde(rename = "PARTIAL")]
    Partial,
    #[serde(rename = "FILLED")]
    Filled,
    #[serde(rename = "CANCELLED")]
    Cancelled,
    #[serde(rename = "REJECTED")]
    Rejected,
}

/// One tracked order. Invariant: `filled_qty <= order_qty` at all times.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderLedgerEntry {
    pub order_id: u64,
    pub client_order_id: String,
    pub symbol: String,
    pub side: Action,
    pub order_qty: f64,
    pub filled_qty: f64,
    /// Volume-weighted average fill price; 0 until the first fill.
    pub avg_px: f64,
    pub status: OrderStatus,
    /// Unix millis of registration.
    pub timestamp: i64,
}

struct Inner {
    orders: HashMap<u64, OrderLedgerEntry>,
    /// Idempotency index: client order id -> venue order id.
    by_client_id: HashMap<String, u64>,
    overfills_rejected: u64,
}

pub struct OrderLedger {
    inner: Mutex<Inner>,
    bus: Arc<MessageBus>,
}

impl OrderLedger {
    pub fn new(bus: Arc<MessageBus>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                orders: HashMap::new(),
                by_client_id: HashMap::new(),
                overfills_rejected: 0,
            }),
            bus,
        }
    }

    // -------------------------------------------------------------------------
    // Registration
    // -------------------------------------------------------------------------

    /// Insert a PENDING entry. Idempotent on `client_order_id`: re-registering
    /// the same client order returns the existing entry untouched.
    pub fn register_order(
        &self,
        order_id: u64,
        client_order_id: &str,
        symbol: &str,
        side: Action,
        order_qty: f64,
    ) -> OrderLedgerEntry {
        let mut inner = self.inner.lock();

        if let Some(&existing_id) = inner.by_client_id.get(client_order_id) {
            if let Some(entry) = inner.orders.get(&existing_id) {
                debug!(
                    client_order_id,
                    order_id = existing_id,
                    "order already registered — idempotent return"
                );
                return entry.clone();
            }
        }

        let entry = OrderLedgerEntry {
            order_id,
            client_order_id: client_order_id.to_string(),
            symbol: symbol.to_string(),
            side,
            order_qty,
            filled_qty: 0.0,
            avg_px: 0.0,
            status: OrderStatus::Pending,
            timestamp: chrono::Utc::now().timestamp_millis(),
        };

        inner
            .by_client_id
            .insert(client_order_id.to_string(), order_id);
        inner.orders.insert(order_id, entry.clone());

        debug!(order_id, client_order_id, symbol, order_qty, "order registered");
        entry
    }

    /// Re-key an entry once the venue assigns the real order id (orders are
    /// registered before submission under a provisional id).
    pub fn assign_venue_id(&self, provisional_id: u64, venue_id: u64) {
        let mut inner = self.inner.lock();
        if let Some(mut entry) = inner.orders.remove(&provisional_id) {
            entry.order_id = venue_id;
            inner
                .by_client_id
                .insert(entry.client_order_id.clone(), venue_id);
            inner.orders.insert(venue_id, entry);
        }
    }

    // -------------------------------------------------------------------------
    // Fills
    // -------------------------------------------------------------------------

    /// Record a fill. Rejects with `Overfill` (and publishes
    /// `EXECUTION_FAILED { reason: OVERFILL }`) if the fill would exceed the
    /// ordered quantity.
    pub fn record_fill(
        &self,
        order_id: u64,
        fill_qty: f64,
        fill_px: f64,
    ) -> Result<OrderLedgerEntry, EngineError> {
        let mut inner = self.inner.lock();

        let entry = inner.orders.get_mut(&order_id).ok_or_else(|| {
            EngineError::Overfill(format!("fill for unknown order {order_id}"))
        })?;

        let new_total = entry.filled_qty + fill_qty;
        // Tolerance one part in 1e9 of the order, for float dust from the
        // venue's string-formatted sizes.
        let epsilon = entry.order_qty * 1e-9;
        if new_total > entry.order_qty + epsilon {
            // Reject the fill only; the order itself keeps its real status.
            let message = format!(
                "order {order_id} ({}): fill {fill_qty} would take filled {} past ordered {}",
                entry.symbol, entry.filled_qty, entry.order_qty
            );
            let symbol = entry.symbol.clone();
            inner.overfills_rejected += 1;
            drop(inner);

            error!(order_id, symbol = %symbol, "OVERFILL rejected: {message}");
            self.bus.publish(
                Channel::ExecutionFailed,
                serde_json::json!({
                    "reason": "OVERFILL",
                    "orderId": order_id,
                    "symbol": symbol,
                    "message": message,
                }),
            );
            return Err(EngineError::Overfill(message));
        }

        // Volume-weighted average price across all fills.
        entry.avg_px = if new_total > 0.0 {
            (entry.avg_px * entry.filled_qty + fill_px * fill_qty) / new_total
        } else {
            0.0
        };
        entry.filled_qty = new_total;
        entry.status = if (entry.order_qty - entry.filled_qty).abs() <= epsilon {
            OrderStatus::Filled
        } else {
            OrderStatus::Partial
        };

        debug!(
            order_id,
            symbol = %entry.symbol,
            fill_qty,
            fill_px,
            filled = entry.filled_qty,
            ordered = entry.order_qty,
            "fill recorded"
        );
        Ok(entry.clone())
    }

    /// Compare a venue-reported running total against the ledger's. The
    /// ledger stays authoritative; a mismatch is logged.
    pub fn check_venue_total(&self, order_id: u64, venue_total: f64) {
        let inner = self.inner.lock();
        if let Some(entry) = inner.orders.get(&order_id) {
            if (entry.filled_qty - venue_total).abs() > entry.order_qty * 1e-6 {
                warn!(
                    order_id,
                    symbol = %entry.symbol,
                    ledger_total = entry.filled_qty,
                    venue_total,
                    "venue fill total diverges from ledger — ledger is authoritative"
                );
            }
        }
    }

    /// Finalize an order with a terminal status.
    pub fn close_order(&self, order_id: u64, final_status: OrderStatus) {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.orders.get_mut(&order_id) {
            entry.status = final_status;
            info!(order_id, symbol = %entry.symbol, status = ?final_status, "order closed in ledger");
        }
    }

    // -------------------------------------------------------------------------
    // Introspection
    // -------------------------------------------------------------------------

    pub fn get(&self, order_id: u64) -> Option<OrderLedgerEntry> {
        self.inner.lock().orders.get(&order_id).cloned()
    }

    pub fn overfills_rejected(&self) -> u64 {
        self.inner.lock().overfills_rejected
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn ledger() -> OrderLedger {
        OrderLedger::new(Arc::new(MessageBus::new()))
    }

    #[test]
    fn register_is_idempotent_on_client_id() {
        let l = ledger();
        let a = l.register_order(1, "client-1", "BTC", Action::Buy, 0.05);
        let b = l.register_order(2, "client-1", "BTC", Action::Buy, 0.05);
        assert_eq!(a.order_id, b.order_id);
        assert_eq!(b.order_id, 1);
        assert!(l.get(2).is_none());
    }

    #[test]
    fn partial_then_full_fill() {
        let l = ledger();
        l.register_order(7, "c", "BTC", Action::Buy, 0.05);

        let after_first = l.record_fill(7, 0.02, 50_000.0).unwrap();
        assert_eq!(after_first.status, OrderStatus::Partial);
        assert!((after_first.filled_qty - 0.02).abs() < 1e-12);

        let after_second = l.record_fill(7, 0.03, 50_100.0).unwrap();
        assert_eq!(after_second.status, OrderStatus::Filled);
        assert!((after_second.filled_qty - 0.05).abs() < 1e-12);

        // Weighted average: (0.02*50000 + 0.03*50100) / 0.05 = 50060.
        assert!((after_second.avg_px - 50_060.0).abs() < 1e-6);
    }

    #[test]
    fn overfill_rejected_one_satoshi_over() {
        let l = ledger();
        l.register_order(7, "c", "BTC", Action::Buy, 0.05);

        // Exactly to the brim is fine.
        assert!(l.record_fill(7, 0.05, 50_000.0).is_ok());
        // Anything more is not.
        let err = l.record_fill(7, 0.00000001, 50_000.0).unwrap_err();
        assert!(matches!(err, EngineError::Overfill(_)));
        assert_eq!(l.overfills_rejected(), 1);
    }

    #[test]
    fn double_fill_scenario() {
        // Order 0.05, venue reports 0.03 then 0.03: first accepted, second
        // rejected.
        let l = ledger();
        l.register_order(9, "c9", "BTC", Action::Buy, 0.05);

        assert!(l.record_fill(9, 0.03, 50_000.0).is_ok());
        let err = l.record_fill(9, 0.03, 50_000.0).unwrap_err();
        assert!(matches!(err, EngineError::Overfill(_)));

        let entry = l.get(9).unwrap();
        assert!((entry.filled_qty - 0.03).abs() < 1e-12);
    }

    #[tokio::test]
    async fn overfill_publishes_execution_failed() {
        let bus = Arc::new(MessageBus::new());
        bus.connect();
        let reasons: Arc<parking_lot::Mutex<Vec<String>>> =
            Arc::new(parking_lot::Mutex::new(Vec::new()));
        let reasons2 = reasons.clone();
        bus.subscribe(
            Channel::ExecutionFailed,
            "test",
            Arc::new(move |msg| {
                reasons2
                    .lock()
                    .push(msg.data["reason"].as_str().unwrap_or_default().to_string());
            }),
        );

        let l = OrderLedger::new(bus);
        l.register_order(1, "c", "ETH", Action::Sell, 1.0);
        let _ = l.record_fill(1, 2.0, 3_000.0);

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(*reasons.lock(), vec!["OVERFILL".to_string()]);
    }

    #[test]
    fn assign_venue_id_rekeys() {
        let l = ledger();
        l.register_order(u64::MAX - 5, "c", "SOL", Action::Buy, 1.0);
        l.assign_venue_id(u64::MAX - 5, 12345);

        assert!(l.get(u64::MAX - 5).is_none());
        let entry = l.get(12345).unwrap();
        assert_eq!(entry.client_order_id, "c");

        // Idempotency survives the re-key.
        let again = l.register_order(999, "c", "SOL", Action::Buy, 1.0);
        assert_eq!(again.order_id, 12345);
    }

    #[test]
    fn close_order_finalizes() {
        let l = ledger();
        l.register_order(4, "c", "BTC", Action::Buy, 0.01);
        l.close_order(4, OrderStatus::Cancelled);
        assert_eq!(l.get(4).unwrap().status, OrderStatus::Cancelled);
    }
}
