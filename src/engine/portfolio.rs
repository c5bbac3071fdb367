// =============================================================================
// Trade Log — in-memory journal of executed trades and realized PnL
// =============================================================================
//
// The durable copy goes through the trace store; this ring buffer serves the
// API and the recovery monitor's recent-trades classification without a
// round trip.
// =============================================================================

use parking_lot::RwLock;

use crate::types::Trade;

/// Maximum trades retained in memory.
const MAX_RETAINED_TRADES: usize = 1_000;

pub struct TradeLog {
    trades: RwLock<Vec<Trade>>,
}

impl TradeLog {
    pub fn new() -> Self {
        Self {
            trades: RwLock::new(Vec::new()),
        }
    }

    pub fn record(&self, trade: Trade) {
        let mut trades = self.trades.write();
        trades.push(trade);
        let excess = trades.len().saturating_sub(MAX_RETAINED_TRADES);
        if excess > 0 {
            trades.drain(..excess);
        }
    }

    /// Sum of realized PnL across the retained window.
    pub fn realized_pnl(&self) -> f64 {
        self.trades.read().iter().map(|t| t.pnl).sum()
    }

    /// Most recent trades, newest first.
    pub fn recent(&self, limit: usize) -> Vec<Trade> {
        let trades = self.trades.read();
        trades.iter().rev().take(limit).cloned().collect()
    }

    /// Most recent trades for one symbol, newest first.
    pub fn recent_for_symbol(&self, symbol: &str, limit: usize) -> Vec<Trade> {
        let trades = self.trades.read();
        trades
            .iter()
            .rev()
            .filter(|t| t.symbol == symbol)
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.trades.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.trades.read().is_empty()
    }
}

impl Default for TradeLog {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Action, EntryExit, OrderType, TradeStatus};

    fn trade(symbol: &str, pnl: f64) -> Trade {
        Trade {
            id: uuid::Uuid::new_v4().to_string(),
            strategy_id: "test".to_string(),
            symbol: symbol.to_string(),
            side: Action::Buy,
            size: 1.0,
            price: 100.0,
            fee: 0.0,
            pnl,
            timestamp: chrono::Utc::now().timestamp_millis(),
            order_type: OrderType::Market,
            status: TradeStatus::Filled,
            entry_exit: EntryExit::Exit,
        }
    }

    #[test]
    fn realized_pnl_sums() {
        let log = TradeLog::new();
        log.record(trade("BTC", 50.0));
        log.record(trade("ETH", -20.0));
        assert!((log.realized_pnl() - 30.0).abs() < 1e-9);
    }

    #[test]
    fn recent_is_newest_first() {
        let log = TradeLog::new();
        log.record(trade("BTC", 1.0));
        log.record(trade("ETH", 2.0));
        log.record(trade("SOL", 3.0));

        let recent = log.recent(2);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].symbol, "SOL");
        assert_eq!(recent[1].symbol, "ETH");
    }

    #[test]
    fn symbol_filter() {
        let log = TradeLog::new();
        log.record(trade("BTC", 1.0));
        log.record(trade("ETH", 2.0));
        log.record(trade("BTC", 3.0));

        let btc = log.recent_for_symbol("BTC", 10);
        assert_eq!(btc.len(), 2);
        assert!((btc[0].pnl - 3.0).abs() < 1e-9);
    }

    #[test]
    fn ring_buffer_caps_retention() {
        let log = TradeLog::new();
        for i in 0..(MAX_RETAINED_TRADES + 10) {
            log.record(trade("BTC", i as f64));
        }
        assert_eq!(log.len(), MAX_RETAINED_TRADES);
        // Oldest entries evicted.
        assert!((log.recent(1)[0].pnl - (MAX_RETAINED_TRADES + 9) as f64).abs() < 1e-9);
    }
}
