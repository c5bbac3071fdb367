// =============================================================================
// Persistence — trace/trade write points behind a seam
// =============================================================================
//
// The real database is an external collaborator; the engine only commits to
// the record schemas and write points. The default store appends JSONL rows
// under the data directory. Persistence failures are logged and swallowed:
// bus events fire regardless of storage outcome.
// =============================================================================

use std::io::Write;
use std::path::PathBuf;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::orchestrator::state::TraceSummary;
use crate::types::Trade;

/// Write points for cycle traces and trades.
pub trait TraceStore: Send + Sync {
    fn save_trace(&self, trace: &TraceSummary);
    fn save_trade(&self, trade: &Trade);
}

// =============================================================================
// JSONL store
// =============================================================================

/// Append-only JSONL files: `traces.jsonl` keyed by cycle id, `trades.jsonl`.
pub struct JsonlTraceStore {
    dir: PathBuf,
    // One writer at a time per process keeps rows whole.
    write_lock: Mutex<()>,
}

impl JsonlTraceStore {
    pub fn new(dir: impl Into<PathBuf>) -> std::io::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            write_lock: Mutex::new(()),
        })
    }

    fn append(&self, file: &str, line: &str) {
        let _guard = self.write_lock.lock();
        let path = self.dir.join(file);
        let result = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .and_then(|mut f| writeln!(f, "{line}"));
        match result {
            Ok(()) => debug!(file, "row appended"),
            Err(e) => warn!(file, error = %e, "persistence write failed — continuing"),
        }
    }
}

impl TraceStore for JsonlTraceStore {
    fn save_trace(&self, trace: &TraceSummary) {
        match serde_json::to_string(trace) {
            Ok(line) => self.append("traces.jsonl", &line),
            Err(e) => warn!(error = %e, "trace serialisation failed"),
        }
    }

    fn save_trade(&self, trade: &Trade) {
        match serde_json::to_string(trade) {
            Ok(line) => self.append("trades.jsonl", &line),
            Err(e) => warn!(error = %e, "trade serialisation failed"),
        }
    }
}

/// Store that drops everything; used when no data directory is wanted and in
/// tests.
pub struct NullTraceStore;

impl TraceStore for NullTraceStore {
    fn save_trace(&self, _trace: &TraceSummary) {}
    fn save_trade(&self, _trade: &Trade) {}
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::state::{CycleState, CycleStep};
    use crate::types::{Action, EntryExit, OrderType, TradeStatus};

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "meridian-store-{tag}-{}",
            uuid::Uuid::new_v4()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn trace_rows_roundtrip() {
        let dir = temp_dir("trace");
        let store = JsonlTraceStore::new(&dir).unwrap();

        let mut state = CycleState::new("BTC", "1h");
        state.advance_to(CycleStep::Done);
        store.save_trace(&state.to_trace());
        store.save_trace(&state.to_trace());

        let content = std::fs::read_to_string(dir.join("traces.jsonl")).unwrap();
        let rows: Vec<&str> = content.lines().collect();
        assert_eq!(rows.len(), 2);

        let parsed: TraceSummary = serde_json::from_str(rows[0]).unwrap();
        assert_eq!(parsed.symbol, "BTC");
        assert_eq!(parsed.final_step, CycleStep::Done);

        std::fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn trade_rows_roundtrip() {
        let dir = temp_dir("trade");
        let store = JsonlTraceStore::new(&dir).unwrap();

        store.save_trade(&Trade {
            id: "t1".to_string(),
            strategy_id: "momentum".to_string(),
            symbol: "ETH".to_string(),
            side: Action::Sell,
            size: 0.5,
            price: 3_000.0,
            fee: 0.45,
            pnl: 12.0,
            timestamp: 1_700_000_000_000,
            order_type: OrderType::Market,
            status: TradeStatus::Filled,
            entry_exit: EntryExit::Exit,
        });

        let content = std::fs::read_to_string(dir.join("trades.jsonl")).unwrap();
        let parsed: Trade = serde_json::from_str(content.lines().next().unwrap()).unwrap();
        assert_eq!(parsed.symbol, "ETH");
        assert_eq!(parsed.entry_exit, EntryExit::Exit);

        std::fs::remove_dir_all(dir).ok();
    }
}
