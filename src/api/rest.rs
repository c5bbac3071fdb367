// =============================================================================
// Operator REST API — Axum 0.7
// =============================================================================
//
// Read endpoints are public, degrade to empty payloads, and never return 500.
// Mutating endpoints go through the bearer-token extractor. CORS is permissive
// for dashboard development.
// =============================================================================

use std::str::FromStr;
use std::sync::Arc;

use axum::{
    extract::{Json, Path, State},
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::api::auth::OperatorAuth;
use crate::app_state::AppState;
use crate::recovery::RecoveryAction;
use crate::types::Side;

/// Build the operator router with CORS and shared state.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // ── Reads ───────────────────────────────────────────────────
        .route("/api/health", get(health))
        .route("/api/circuit-breakers", get(circuit_breakers))
        .route("/api/position-recovery", get(position_recovery))
        .route("/api/portfolio", get(portfolio))
        .route("/api/exchange-stats", get(exchange_stats))
        // ── Operator actions ────────────────────────────────────────
        .route("/api/circuit-breakers/:name/reset", post(reset_breaker))
        .route("/api/position-recovery/recover", post(recover_position))
        .route("/api/emergency-stop", post(emergency_stop))
        .layer(cors)
        .with_state(state)
}

// =============================================================================
// Reads
// =============================================================================

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let bus = state.bus.status();
    let body = serde_json::json!({
        "status": state.orchestrator.get_health_status(),
        "summary": state.breakers.health_summary(),
        "messageBus": {
            "connected": bus.connected,
            "subscriptions": bus.subscriptions,
        },
        "cache": { "connected": true },
        "uptimeSecs": state.start_time.elapsed().as_secs(),
        "cyclesRun": state.orchestrator.cycles_run(),
        "cyclesFailed": state.orchestrator.cycles_failed(),
    });
    Json(body)
}

async fn circuit_breakers(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let body = serde_json::json!({
        "summary": state.breakers.health_summary(),
        "breakers": state.breakers.all_statuses(),
    });
    Json(body)
}

async fn position_recovery(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!(state.recovery.status()))
}

async fn portfolio(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    // Read-only introspection never errors out; degraded data is empty.
    let portfolio = state.engine.get_portfolio().await.unwrap_or_default();
    let body = serde_json::json!({
        "portfolio": {
            "accountValue": portfolio.account_value,
            "totalMarginUsed": portfolio.total_margin_used,
            "withdrawable": portfolio.withdrawable,
        },
        "positions": portfolio.positions,
        "realizedPnL": state.engine.get_realized_pnl(),
        "recentTrades": state.engine.get_recent_trades(50),
        "environment": state.config.environment(),
    });
    Json(body)
}

async fn exchange_stats(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let pending: Vec<serde_json::Value> = state
        .client
        .pending_orders()
        .into_iter()
        .map(|p| {
            serde_json::json!({
                "orderId": p.order_id,
                "symbol": p.symbol,
                "side": p.side,
                "ageSecs": p.submitted_at.elapsed().as_secs(),
            })
        })
        .collect();

    let open_orders = state
        .engine
        .get_open_orders()
        .await
        .map(|orders| orders.as_ref().clone())
        .unwrap_or_default();

    let body = serde_json::json!({
        "orderStats": state.client.order_stats(),
        "buckets": state.client.bucket_snapshots(),
        "pendingOrders": pending,
        "openOrders": open_orders,
        "overfillsRejected": state.ledger.overfills_rejected(),
    });
    Json(body)
}

// =============================================================================
// Operator actions
// =============================================================================

async fn reset_breaker(
    _auth: OperatorAuth,
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    state.breakers.reset(&name);
    info!(breaker = %name, "breaker reset by operator");
    Json(serde_json::json!({ "success": true, "message": format!("breaker '{name}' reset") }))
}

#[derive(Deserialize)]
struct RecoverRequest {
    symbol: String,
    side: String,
    #[serde(default)]
    action: Option<String>,
}

async fn recover_position(
    _auth: OperatorAuth,
    State(state): State<Arc<AppState>>,
    Json(req): Json<RecoverRequest>,
) -> impl IntoResponse {
    let Ok(side) = Side::from_str(&req.side) else {
        return Json(serde_json::json!({
            "success": false,
            "message": format!("unknown side '{}'", req.side),
        }));
    };
    let action = match req.action.as_deref() {
        None => None,
        Some("CLOSE") => Some(RecoveryAction::Close),
        Some("REDUCE") => Some(RecoveryAction::Reduce),
        Some(other) => {
            return Json(serde_json::json!({
                "success": false,
                "message": format!("unknown action '{other}'"),
            }));
        }
    };

    let (success, message) = state
        .recovery
        .recover_position(&req.symbol, side, action)
        .await;
    Json(serde_json::json!({ "success": success, "message": message }))
}

async fn emergency_stop(
    _auth: OperatorAuth,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    warn!("emergency stop requested via API");
    let (closed, cancelled) = state.engine.emergency_stop().await;
    Json(serde_json::json!({
        "success": true,
        "positionsClosed": closed,
        "ordersCancelled": cancelled,
    }))
}
