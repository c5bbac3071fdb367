// =============================================================================
// Stale-Order Watchdog — cancels resting orders the book has forgotten about
// =============================================================================
//
// Runs as a background task, waking every 5 seconds to scan the client's
// pending-order map. Orders older than the warn threshold are logged; orders
// older than the cancel threshold are cancelled at the venue.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::exchange::client::HyperliquidClient;

/// Scan cadence.
const WATCHDOG_INTERVAL_SECS: u64 = 5;

/// Run the watchdog until shutdown is signalled.
pub async fn run_stale_order_watchdog(
    client: Arc<HyperliquidClient>,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(interval_secs = WATCHDOG_INTERVAL_SECS, "stale-order watchdog started");
    let mut ticker = interval(Duration::from_secs(WATCHDOG_INTERVAL_SECS));

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("stale-order watchdog stopping");
                    return;
                }
            }
        }

        let cfg = client.exchange_config();
        let cancel_after = Duration::from_secs(cfg.stale_order_cancel_secs);
        let warn_after = Duration::from_secs(cfg.stale_order_warn_secs);

        let pending = client.pending_orders();
        if pending.is_empty() {
            continue;
        }
        debug!(count = pending.len(), "watchdog scanning pending orders");

        for order in pending {
            let age = order.submitted_at.elapsed();
            if age >= cancel_after {
                warn!(
                    symbol = %order.symbol,
                    order_id = order.order_id,
                    age_secs = age.as_secs(),
                    "stale order — cancelling"
                );
                if let Err(e) = client.cancel_order(&order.symbol, order.order_id).await {
                    warn!(
                        symbol = %order.symbol,
                        order_id = order.order_id,
                        error = %e,
                        "stale-order cancel failed"
                    );
                    // Drop it locally anyway so we do not retry forever; the
                    // venue copy, if any, shows up in open-orders reconciles.
                    client.clear_pending(order.order_id);
                }
            } else if age >= warn_after {
                warn!(
                    symbol = %order.symbol,
                    order_id = order.order_id,
                    age_secs = age.as_secs(),
                    "order resting longer than expected"
                );
            }
        }
    }
}
