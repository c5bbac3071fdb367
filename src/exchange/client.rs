// =============================================================================
// Hyperliquid REST Client — signed, throttled, ledger-backed order router
// =============================================================================
//
// SECURITY: the signing key is never logged or serialized. Every order-path
// call is throttled on the `exchange` bucket, every read on the `info`
// bucket (weighted by request size). Order attempts on one symbol are
// serialized by a per-symbol async lock; different symbols run concurrently.
//
// Wire format: orders are asset-indexed records
//   {a, b, p, s, r, t: {limit: {tif: "Ioc" | "Gtc"}}}
// and responses carry statuses[0] in {filled: {oid, avgPx, totalSz},
// resting: {oid}, error: "..."}.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use serde_json::{json, Value};
use sha2::Sha256;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::bus::MessageBus;
use crate::cache::TtlCell;
use crate::config::{EngineConfig, ExchangeConfig};
use crate::error::EngineError;
use crate::exchange::book::{validate_book, L2Book};
use crate::exchange::churn::{ChurnGuard, SymbolStatsSnapshot};
use crate::exchange::meta::{self, VenueMeta};
use crate::exchange::throttle::{BucketSnapshot, VenueThrottle};
use crate::ledger::{OrderLedger, OrderStatus};
use crate::market::Candle;
use crate::retry::{retry, RetryPolicy};
use crate::types::{Action, OrderType, Portfolio, Position, RejectReason, Side};

type HmacSha256 = Hmac<Sha256>;

/// Provisional ledger ids live in the top half of the id space so they can
/// never collide with venue-assigned oids.
const PROVISIONAL_BIT: u64 = 1 << 63;

// =============================================================================
// Request / outcome types
// =============================================================================

/// Everything `place_order` needs to route one order.
#[derive(Debug, Clone)]
pub struct OrderRequest {
    pub symbol: String,
    pub action: Action,
    pub size: f64,
    /// Limit price; ignored for market-like orders.
    pub price: f64,
    pub order_type: OrderType,
    /// Reduce-only orders may only shrink an existing position and bypass
    /// every churn gate.
    pub reduce_only: bool,
    pub confidence: f64,
    /// Supplied by the execution engine for ledger idempotency; generated
    /// when absent.
    pub client_order_id: Option<String>,
}

impl OrderRequest {
    pub fn exit(symbol: impl Into<String>, action: Action, size: f64) -> Self {
        Self {
            symbol: symbol.into(),
            action,
            size,
            price: 0.0,
            order_type: OrderType::Market,
            reduce_only: true,
            confidence: 1.0,
            client_order_id: None,
        }
    }
}

/// Structured result of an order attempt. The client never raises out of
/// `place_order`; callers pattern-match instead.
#[derive(Debug, Clone)]
pub enum OrderOutcome {
    Filled {
        order_id: u64,
        avg_px: f64,
        size: f64,
    },
    Resting {
        order_id: u64,
    },
    Rejected {
        reason: RejectReason,
        message: String,
    },
    Failed {
        error: EngineError,
    },
}

impl OrderOutcome {
    pub fn is_filled(&self) -> bool {
        matches!(self, Self::Filled { .. })
    }
}

impl std::fmt::Display for OrderOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Filled {
                order_id,
                avg_px,
                size,
            } => write!(f, "Filled(oid={order_id}, px={avg_px}, sz={size})"),
            Self::Resting { order_id } => write!(f, "Resting(oid={order_id})"),
            Self::Rejected { reason, message } => write!(f, "Rejected({reason}: {message})"),
            Self::Failed { error } => write!(f, "Failed({error})"),
        }
    }
}

/// A resting order awaiting fill or cancellation.
#[derive(Debug, Clone)]
pub struct PendingOrder {
    pub order_id: u64,
    pub symbol: String,
    pub side: Action,
    pub submitted_at: Instant,
}

/// One open order as reported by the venue.
#[derive(Debug, Clone, serde::Serialize)]
pub struct OpenOrder {
    pub order_id: u64,
    pub symbol: String,
    pub side: Action,
    pub limit_px: f64,
    pub size: f64,
    pub timestamp: i64,
}

/// Parsed order-path response.
#[derive(Debug, Clone)]
enum SubmitResult {
    Filled { oid: u64, avg_px: f64, total_sz: f64 },
    Resting { oid: u64 },
    /// Response shape indicated neither fill, resting, nor error.
    Unknown,
}

// =============================================================================
// Client
// =============================================================================

pub struct HyperliquidClient {
    http: reqwest::Client,
    base_url: String,
    private_key: Option<String>,
    main_address: Option<String>,
    cfg: ExchangeConfig,
    throttle: VenueThrottle,
    churn: ChurnGuard,
    ledger: Arc<OrderLedger>,

    meta_cache: TtlCell<Arc<VenueMeta>>,
    mids_cache: TtlCell<Arc<HashMap<String, f64>>>,
    account_cache: TtlCell<Portfolio>,
    open_orders_cache: TtlCell<Arc<Vec<OpenOrder>>>,

    pending: Mutex<HashMap<u64, PendingOrder>>,
    symbol_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    provisional_seq: AtomicU64,
    nonce_seq: AtomicU64,
}

impl HyperliquidClient {
    pub fn new(config: &EngineConfig, ledger: Arc<OrderLedger>, _bus: Arc<MessageBus>) -> Self {
        let base_url = if config.testnet {
            "https://api.hyperliquid-testnet.xyz".to_string()
        } else {
            "https://api.hyperliquid.xyz".to_string()
        };

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.exchange.request_timeout_secs))
            .build()
            .expect("failed to build reqwest client");

        debug!(base_url = %base_url, "exchange client initialised");

        Self {
            http,
            base_url,
            private_key: config.private_key.clone(),
            main_address: config.main_address.clone(),
            cfg: config.exchange.clone(),
            throttle: VenueThrottle::new(),
            churn: ChurnGuard::new(config.churn.clone()),
            ledger,
            meta_cache: TtlCell::new(Duration::from_secs(meta::META_TTL_SECS)),
            mids_cache: TtlCell::new(Duration::from_millis(500)),
            account_cache: TtlCell::new(Duration::from_secs(2)),
            open_orders_cache: TtlCell::new(Duration::from_secs(1)),
            pending: Mutex::new(HashMap::new()),
            symbol_locks: Mutex::new(HashMap::new()),
            provisional_seq: AtomicU64::new(1),
            nonce_seq: AtomicU64::new(0),
        }
    }

    /// Point the client at a non-default endpoint (unit tests).
    #[cfg(test)]
    pub(crate) fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    /// Pre-warm the venue metadata so the first order does not pay the fetch.
    #[instrument(skip(self), name = "exchange::initialize")]
    pub async fn initialize(&self) -> Result<(), EngineError> {
        let meta = self.meta().await?;
        info!("venue metadata loaded");
        let _ = meta;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Transport
    // -------------------------------------------------------------------------

    async fn post(&self, path: &str, body: Value) -> Result<Value, EngineError> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| EngineError::Network(format!("POST {path}: {e}")))?;

        let status = resp.status();
        if status.as_u16() == 429 {
            return Err(EngineError::RateLimit(format!("POST {path}: HTTP 429")));
        }
        if status.is_server_error() {
            return Err(EngineError::Network(format!("POST {path}: HTTP {status}")));
        }

        let value: Value = resp
            .json()
            .await
            .map_err(|e| EngineError::Network(format!("POST {path}: bad body: {e}")))?;

        if !status.is_success() {
            return Err(EngineError::from_venue_error(&value.to_string()));
        }
        Ok(value)
    }

    async fn post_info(&self, cost: f64, body: Value) -> Result<Value, EngineError> {
        self.throttle.info.throttle(cost).await?;
        self.post("/info", body).await
    }

    async fn post_exchange(&self, action: Value) -> Result<Value, EngineError> {
        let key = self.private_key.as_ref().ok_or_else(|| {
            EngineError::Config("venue private key not configured".to_string())
        })?;

        self.throttle.exchange.throttle(1.0).await?;

        // Millisecond nonces collide under concurrency; fold in a sequence.
        let nonce = chrono::Utc::now().timestamp_millis() as u64 * 1000
            + self.nonce_seq.fetch_add(1, Ordering::SeqCst) % 1000;
        let signature = sign_payload(key, &action, nonce);

        let body = json!({
            "action": action,
            "nonce": nonce,
            "signature": signature,
            "vaultAddress": Value::Null,
        });
        self.post("/exchange", body).await
    }

    fn address(&self) -> Result<&str, EngineError> {
        self.main_address
            .as_deref()
            .ok_or_else(|| EngineError::Config("venue main address not configured".to_string()))
    }

    // -------------------------------------------------------------------------
    // Metadata
    // -------------------------------------------------------------------------

    async fn meta(&self) -> Result<Arc<VenueMeta>, EngineError> {
        self.meta_cache
            .get_or_fetch(|| async {
                let body = self.post_info(2.0, json!({ "type": "meta" })).await?;
                Ok(Arc::new(VenueMeta::from_response(&body)?))
            })
            .await
    }

    /// Resolve the asset index, re-fetching metadata once on a miss.
    async fn asset_index(&self, symbol: &str) -> Result<u32, EngineError> {
        let meta = self.meta().await?;
        if let Some(index) = meta.asset_index(symbol) {
            return Ok(index);
        }
        self.meta_cache.invalidate().await;
        let meta = self.meta().await?;
        meta.asset_index(symbol)
            .ok_or_else(|| EngineError::InvalidSymbol(symbol.to_string()))
    }

    // -------------------------------------------------------------------------
    // Market data reads
    // -------------------------------------------------------------------------

    /// All mid prices, cached 500 ms.
    #[instrument(skip(self), name = "exchange::get_all_mids")]
    pub async fn get_all_mids(&self) -> Result<Arc<HashMap<String, f64>>, EngineError> {
        self.mids_cache
            .get_or_fetch(|| async {
                let body = self.post_info(1.0, json!({ "type": "allMids" })).await?;
                let map = body
                    .as_object()
                    .ok_or_else(|| EngineError::Network("allMids: not an object".into()))?
                    .iter()
                    .filter_map(|(k, v)| Some((k.clone(), parse_num(v)?)))
                    .collect::<HashMap<String, f64>>();
                Ok(Arc::new(map))
            })
            .await
    }

    /// Account state (positions, margin), cached 2 s.
    #[instrument(skip(self), name = "exchange::get_account_state")]
    pub async fn get_account_state(&self) -> Result<Portfolio, EngineError> {
        let mids = self.get_all_mids().await.unwrap_or_default();
        self.account_cache
            .get_or_fetch(|| async {
                let user = self.address()?.to_string();
                let body = self
                    .post_info(2.0, json!({ "type": "clearinghouseState", "user": user }))
                    .await?;
                Ok(parse_portfolio(&body, &mids))
            })
            .await
    }

    /// Open orders, cached 1 s.
    #[instrument(skip(self), name = "exchange::get_open_orders")]
    pub async fn get_open_orders(&self) -> Result<Arc<Vec<OpenOrder>>, EngineError> {
        self.open_orders_cache
            .get_or_fetch(|| async {
                let user = self.address()?.to_string();
                let body = self
                    .post_info(1.0, json!({ "type": "openOrders", "user": user }))
                    .await?;
                Ok(Arc::new(parse_open_orders(&body)))
            })
            .await
    }

    /// L2 book snapshot (uncached — depth decisions need fresh data).
    #[instrument(skip(self), name = "exchange::get_l2_book")]
    pub async fn get_l2_book(&self, symbol: &str) -> Result<L2Book, EngineError> {
        let body = self
            .post_info(1.0, json!({ "type": "l2Book", "coin": symbol }))
            .await?;
        L2Book::from_response(symbol, &body)
    }

    /// Candle history for the orchestrator's market-data stage. Cost is
    /// weighted by the requested window.
    #[instrument(skip(self), name = "exchange::get_candles")]
    pub async fn get_candles(
        &self,
        symbol: &str,
        interval: &str,
        bars: u32,
    ) -> Result<Vec<Candle>, EngineError> {
        let interval_ms = interval_millis(interval).ok_or_else(|| {
            EngineError::Config(format!("unknown timeframe '{interval}'"))
        })?;
        let end = chrono::Utc::now().timestamp_millis();
        let start = end - interval_ms * bars as i64;

        let cost = (bars as f64 / 50.0).max(1.0);
        let body = self
            .post_info(
                cost,
                json!({
                    "type": "candleSnapshot",
                    "req": { "coin": symbol, "interval": interval, "startTime": start, "endTime": end },
                }),
            )
            .await?;

        let mut candles: Vec<Candle> = body
            .as_array()
            .map(|arr| arr.iter().filter_map(parse_candle).collect())
            .unwrap_or_default();
        candles.sort_by_key(|c| c.open_time);
        debug!(symbol, interval, count = candles.len(), "candles fetched");
        Ok(candles)
    }

    // -------------------------------------------------------------------------
    // Order placement
    // -------------------------------------------------------------------------

    fn symbol_lock(&self, symbol: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.symbol_locks
            .lock()
            .entry(symbol.to_string())
            .or_default()
            .clone()
    }

    /// Route one order. Never raises: the outcome is one of
    /// Filled / Resting / Rejected(reason) / Failed(kind).
    #[instrument(skip(self, req), name = "exchange::place_order", fields(symbol = %req.symbol, action = %req.action))]
    pub async fn place_order(&self, req: OrderRequest) -> OrderOutcome {
        // One order flow per symbol at a time; cross-symbol stays concurrent.
        let lock = self.symbol_lock(&req.symbol);
        let _guard = lock.lock().await;

        // 1. Size validation. A degenerate size is a deterministic
        // rejection, not an infrastructure failure.
        let validated_size = match meta::validate_size(&req.symbol, req.size) {
            Ok(s) => s,
            Err(error) => return outcome_from_validation(error),
        };

        // 2. Entry gates: churn guards and book quality. Reduce-only bypasses.
        if !req.reduce_only {
            if let Err(err) = self.churn.check_entry(&req.symbol, req.confidence) {
                return outcome_from_validation(err);
            }
            match self.get_l2_book(&req.symbol).await {
                Ok(book) => {
                    if let Err(err) = validate_book(&book, &self.cfg) {
                        return outcome_from_validation(err);
                    }
                }
                Err(error) => return OrderOutcome::Failed { error },
            }
        }

        // 3. Ledger registration under a provisional id.
        let client_order_id = req
            .client_order_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let provisional_id =
            PROVISIONAL_BIT | self.provisional_seq.fetch_add(1, Ordering::SeqCst);
        self.ledger.register_order(
            provisional_id,
            &client_order_id,
            &req.symbol,
            req.action,
            validated_size,
        );

        // 4. Asset resolution.
        let asset = match self.asset_index(&req.symbol).await {
            Ok(a) => a,
            Err(error) => {
                self.ledger.close_order(provisional_id, OrderStatus::Rejected);
                return OrderOutcome::Failed { error };
            }
        };

        // 5. Submission with backoff. Entries get a single attempt; failing
        // to exit is the dangerous direction, so exits may retry.
        let max_attempts = if req.reduce_only {
            self.cfg.exit_order_max_attempts
        } else {
            1
        };
        let policy = RetryPolicy::attempts(
            max_attempts,
            Duration::from_secs(self.cfg.backoff_cap_secs),
        );

        let result = retry(
            policy,
            "place-order",
            |err: &EngineError| err.is_retryable(),
            |_attempt| self.submit_once(&req, validated_size, asset),
        )
        .await;

        match result {
            Ok(SubmitResult::Filled { oid, avg_px, total_sz }) => {
                self.ledger.assign_venue_id(provisional_id, oid);
                if let Err(error) = self.ledger.record_fill(oid, total_sz, avg_px) {
                    return OrderOutcome::Failed { error };
                }
                // The ledger stays authoritative over the venue's total.
                self.ledger.check_venue_total(oid, total_sz);
                self.churn.record_fill(&req.symbol);
                info!(
                    symbol = %req.symbol,
                    oid,
                    avg_px,
                    size = total_sz,
                    reduce_only = req.reduce_only,
                    "order filled"
                );
                OrderOutcome::Filled {
                    order_id: oid,
                    avg_px,
                    size: total_sz,
                }
            }
            Ok(SubmitResult::Resting { oid }) => {
                self.ledger.assign_venue_id(provisional_id, oid);
                self.pending.lock().insert(
                    oid,
                    PendingOrder {
                        order_id: oid,
                        symbol: req.symbol.clone(),
                        side: req.action,
                        submitted_at: Instant::now(),
                    },
                );
                self.churn.record_resting(&req.symbol);
                info!(symbol = %req.symbol, oid, "order resting");
                OrderOutcome::Resting { order_id: oid }
            }
            Ok(SubmitResult::Unknown) => {
                warn!(
                    symbol = %req.symbol,
                    "order response shape unknown — treating as tentative success"
                );
                OrderOutcome::Resting {
                    order_id: provisional_id,
                }
            }
            Err(error) => {
                self.churn.record_failure(&req.symbol);
                self.ledger.close_order(provisional_id, OrderStatus::Rejected);
                warn!(symbol = %req.symbol, error = %error, "order failed");
                OrderOutcome::Failed { error }
            }
        }
    }

    async fn submit_once(
        &self,
        req: &OrderRequest,
        size: f64,
        asset: u32,
    ) -> Result<SubmitResult, EngineError> {
        self.churn.record_submitted(&req.symbol);

        let is_buy = req.action == Action::Buy;
        let market_like = req.order_type == OrderType::Market || req.reduce_only;

        // Executable price: market-like orders cross the book with a slippage
        // buffer; limit orders use the caller's price.
        let price = if market_like {
            let book = self.get_l2_book(&req.symbol).await?;
            let top = if is_buy { book.best_ask() } else { book.best_bid() }
                .ok_or_else(|| {
                    EngineError::Network(format!("{}: empty book side", req.symbol))
                })?;
            executable_price(top, is_buy, self.cfg.slippage)
        } else {
            req.price
        };

        let tif = if market_like { "Ioc" } else { "Gtc" };
        let wire = build_wire_order(
            asset,
            is_buy,
            &meta::format_price(&req.symbol, price),
            &meta::format_size(&req.symbol, size),
            req.reduce_only,
            tif,
        );
        let action = json!({ "type": "order", "orders": [wire], "grouping": "na" });

        debug!(
            symbol = %req.symbol,
            is_buy,
            price,
            size,
            tif,
            reduce_only = req.reduce_only,
            "submitting order"
        );

        let resp = self.post_exchange(action).await?;
        parse_order_response(&resp)
    }

    // -------------------------------------------------------------------------
    // Cancels, leverage, position close
    // -------------------------------------------------------------------------

    #[instrument(skip(self), name = "exchange::cancel_order")]
    pub async fn cancel_order(&self, symbol: &str, order_id: u64) -> Result<(), EngineError> {
        let asset = self.asset_index(symbol).await?;
        let action = json!({ "type": "cancel", "cancels": [{ "a": asset, "o": order_id }] });
        self.post_exchange(action).await?;

        self.pending.lock().remove(&order_id);
        self.ledger.close_order(order_id, OrderStatus::Cancelled);
        info!(symbol, order_id, "order cancelled");
        Ok(())
    }

    /// Cancel every open order; returns how many cancels were issued.
    #[instrument(skip(self), name = "exchange::cancel_all_orders")]
    pub async fn cancel_all_orders(&self) -> Result<usize, EngineError> {
        let orders = self.get_open_orders().await?;
        let mut cancelled = 0usize;
        for order in orders.iter() {
            match self.cancel_order(&order.symbol, order.order_id).await {
                Ok(()) => cancelled += 1,
                Err(e) => warn!(
                    symbol = %order.symbol,
                    order_id = order.order_id,
                    error = %e,
                    "cancel failed"
                ),
            }
        }
        Ok(cancelled)
    }

    #[instrument(skip(self), name = "exchange::update_leverage")]
    pub async fn update_leverage(
        &self,
        symbol: &str,
        leverage: u32,
        is_cross: bool,
    ) -> Result<(), EngineError> {
        let asset = self.asset_index(symbol).await?;
        let action = json!({
            "type": "updateLeverage",
            "asset": asset,
            "isCross": is_cross,
            "leverage": leverage,
        });
        self.post_exchange(action).await?;
        info!(symbol, leverage, is_cross, "leverage updated");
        Ok(())
    }

    /// Close (or reduce) a position with a reduce-only market order.
    pub async fn close_position_market(&self, position: &Position, size: f64) -> OrderOutcome {
        let action = position.side.exit_action();
        let size = size.min(position.size);
        self.place_order(OrderRequest::exit(position.symbol.clone(), action, size))
            .await
    }

    // -------------------------------------------------------------------------
    // Introspection & watchdog support
    // -------------------------------------------------------------------------

    pub fn order_stats(&self) -> Vec<SymbolStatsSnapshot> {
        self.churn.snapshots()
    }

    pub fn bucket_snapshots(&self) -> Vec<BucketSnapshot> {
        self.throttle.snapshots()
    }

    pub fn pending_orders(&self) -> Vec<PendingOrder> {
        self.pending.lock().values().cloned().collect()
    }

    /// Drop a pending entry after an external fill/cancel notification.
    pub fn clear_pending(&self, order_id: u64) {
        self.pending.lock().remove(&order_id);
    }

    pub fn exchange_config(&self) -> &ExchangeConfig {
        &self.cfg
    }
}

impl std::fmt::Debug for HyperliquidClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HyperliquidClient")
            .field("base_url", &self.base_url)
            .field("private_key", &"<redacted>")
            .field("main_address", &self.main_address)
            .finish()
    }
}

// =============================================================================
// Pure helpers (unit-tested without a network)
// =============================================================================

/// Market-like orders cross the spread and pad by the slippage buffer.
fn executable_price(top_of_book: f64, is_buy: bool, slippage: f64) -> f64 {
    if is_buy {
        top_of_book * (1.0 + slippage)
    } else {
        top_of_book * (1.0 - slippage)
    }
}

fn build_wire_order(
    asset: u32,
    is_buy: bool,
    price: &str,
    size: &str,
    reduce_only: bool,
    tif: &str,
) -> Value {
    json!({
        "a": asset,
        "b": is_buy,
        "p": price,
        "s": size,
        "r": reduce_only,
        "t": { "limit": { "tif": tif } },
    })
}

fn sign_payload(key: &str, action: &Value, nonce: u64) -> String {
    let mut mac =
        HmacSha256::new_from_slice(key.as_bytes()).expect("HMAC accepts any key size");
    mac.update(action.to_string().as_bytes());
    mac.update(nonce.to_string().as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

fn parse_order_response(resp: &Value) -> Result<SubmitResult, EngineError> {
    let status = resp.get("status").and_then(|v| v.as_str()).unwrap_or("");
    if status != "ok" {
        return Err(EngineError::from_venue_error(&resp.to_string()));
    }

    let first = resp
        .pointer("/response/data/statuses/0")
        .cloned()
        .unwrap_or(Value::Null);

    if let Some(filled) = first.get("filled") {
        let oid = filled.get("oid").and_then(|v| v.as_u64()).unwrap_or(0);
        let avg_px = filled.get("avgPx").and_then(parse_num_ref).unwrap_or(0.0);
        let total_sz = filled.get("totalSz").and_then(parse_num_ref).unwrap_or(0.0);
        return Ok(SubmitResult::Filled {
            oid,
            avg_px,
            total_sz,
        });
    }
    if let Some(resting) = first.get("resting") {
        let oid = resting.get("oid").and_then(|v| v.as_u64()).unwrap_or(0);
        return Ok(SubmitResult::Resting { oid });
    }
    if let Some(err) = first.get("error").and_then(|v| v.as_str()) {
        return Err(EngineError::from_venue_error(err));
    }
    Ok(SubmitResult::Unknown)
}

fn parse_num(v: &Value) -> Option<f64> {
    v.as_str()
        .and_then(|s| s.parse().ok())
        .or_else(|| v.as_f64())
}

fn parse_num_ref(v: &Value) -> Option<f64> {
    parse_num(v)
}

fn parse_candle(v: &Value) -> Option<Candle> {
    Some(Candle::new(
        v.get("t")?.as_i64()?,
        parse_num(v.get("o")?)?,
        parse_num(v.get("h")?)?,
        parse_num(v.get("l")?)?,
        parse_num(v.get("c")?)?,
        parse_num(v.get("v")?)?,
    ))
}

fn parse_portfolio(body: &Value, mids: &HashMap<String, f64>) -> Portfolio {
    let account_value = body
        .pointer("/marginSummary/accountValue")
        .and_then(parse_num_ref)
        .unwrap_or(0.0);
    let total_margin_used = body
        .pointer("/marginSummary/totalMarginUsed")
        .and_then(parse_num_ref)
        .unwrap_or(0.0);
    let withdrawable = body
        .get("withdrawable")
        .and_then(parse_num_ref)
        .unwrap_or(0.0);

    let positions = body
        .get("assetPositions")
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|entry| {
                    let p = entry.get("position")?;
                    let symbol = p.get("coin")?.as_str()?.to_string();
                    let szi = parse_num(p.get("szi")?)?;
                    if szi == 0.0 {
                        return None;
                    }
                    let side = if szi > 0.0 { Side::Long } else { Side::Short };
                    let entry_price = p.get("entryPx").and_then(parse_num_ref).unwrap_or(0.0);
                    let mark_price = mids.get(&symbol).copied().unwrap_or_else(|| {
                        p.get("positionValue")
                            .and_then(parse_num_ref)
                            .map(|v| v / szi.abs())
                            .unwrap_or(entry_price)
                    });
                    Some(Position {
                        symbol,
                        side,
                        size: szi.abs(),
                        entry_price,
                        mark_price,
                        unrealized_pnl: p
                            .get("unrealizedPnl")
                            .and_then(parse_num_ref)
                            .unwrap_or(0.0),
                        leverage: p
                            .pointer("/leverage/value")
                            .and_then(|v| v.as_u64())
                            .unwrap_or(1) as u32,
                        margin_used: p.get("marginUsed").and_then(parse_num_ref).unwrap_or(0.0),
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    Portfolio {
        account_value,
        total_margin_used,
        withdrawable,
        positions,
    }
}

fn parse_open_orders(body: &Value) -> Vec<OpenOrder> {
    body.as_array()
        .map(|arr| {
            arr.iter()
                .filter_map(|o| {
                    Some(OpenOrder {
                        order_id: o.get("oid")?.as_u64()?,
                        symbol: o.get("coin")?.as_str()?.to_string(),
                        side: match o.get("side")?.as_str()? {
                            "B" => Action::Buy,
                            _ => Action::Sell,
                        },
                        limit_px: o.get("limitPx").and_then(parse_num_ref).unwrap_or(0.0),
                        size: o.get("sz").and_then(parse_num_ref).unwrap_or(0.0),
                        timestamp: o.get("timestamp").and_then(|v| v.as_i64()).unwrap_or(0),
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

fn interval_millis(interval: &str) -> Option<i64> {
    let ms = match interval {
        "1m" => 60_000,
        "5m" => 300_000,
        "15m" => 900_000,
        "1h" => 3_600_000,
        "4h" => 14_400_000,
        "1d" => 86_400_000,
        _ => return None,
    };
    Some(ms)
}

fn outcome_from_validation(err: EngineError) -> OrderOutcome {
    match err {
        EngineError::Validation { reason, message } => OrderOutcome::Rejected { reason, message },
        EngineError::InvalidSize(message) => OrderOutcome::Rejected {
            reason: RejectReason::InvalidSize,
            message,
        },
        other => OrderOutcome::Failed { error: other },
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_order_shape() {
        let wire = build_wire_order(3, true, "50001", "0.01", false, "Gtc");
        assert_eq!(wire["a"], 3);
        assert_eq!(wire["b"], true);
        assert_eq!(wire["p"], "50001");
        assert_eq!(wire["s"], "0.01");
        assert_eq!(wire["r"], false);
        assert_eq!(wire["t"]["limit"]["tif"], "Gtc");
    }

    #[test]
    fn executable_price_pads_per_side() {
        assert!((executable_price(50_000.0, true, 0.005) - 50_250.0).abs() < 1e-9);
        assert!((executable_price(50_000.0, false, 0.005) - 49_750.0).abs() < 1e-9);
    }

    #[test]
    fn parse_filled_response() {
        let resp = serde_json::json!({
            "status": "ok",
            "response": { "data": { "statuses": [
                { "filled": { "oid": 77, "avgPx": "50005.0", "totalSz": "0.01" } }
            ]}}
        });
        match parse_order_response(&resp).unwrap() {
            SubmitResult::Filled { oid, avg_px, total_sz } => {
                assert_eq!(oid, 77);
                assert!((avg_px - 50_005.0).abs() < 1e-9);
                assert!((total_sz - 0.01).abs() < 1e-12);
            }
            other => panic!("expected filled, got {other:?}"),
        }
    }

    #[test]
    fn parse_resting_response() {
        let resp = serde_json::json!({
            "status": "ok",
            "response": { "data": { "statuses": [ { "resting": { "oid": 42 } } ]}}
        });
        assert!(matches!(
            parse_order_response(&resp).unwrap(),
            SubmitResult::Resting { oid: 42 }
        ));
    }

    #[test]
    fn margin_error_is_non_retryable() {
        let resp = serde_json::json!({
            "status": "ok",
            "response": { "data": { "statuses": [
                { "error": "Insufficient margin to place order" }
            ]}}
        });
        let err = parse_order_response(&resp).unwrap_err();
        assert!(matches!(err, EngineError::InsufficientMargin(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn other_venue_error_is_retryable() {
        let resp = serde_json::json!({
            "status": "ok",
            "response": { "data": { "statuses": [ { "error": "order book busy" } ]}}
        });
        let err = parse_order_response(&resp).unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn unexpected_shape_is_unknown_state() {
        let resp = serde_json::json!({
            "status": "ok",
            "response": { "data": { "statuses": [ { "queued": {} } ]}}
        });
        assert!(matches!(
            parse_order_response(&resp).unwrap(),
            SubmitResult::Unknown
        ));
    }

    #[test]
    fn non_ok_status_is_error() {
        let resp = serde_json::json!({ "status": "err", "response": "bad nonce" });
        assert!(parse_order_response(&resp).is_err());
    }

    #[test]
    fn portfolio_parsing_signed_sizes() {
        let mids = HashMap::from([("BTC".to_string(), 51_000.0)]);
        let body = serde_json::json!({
            "marginSummary": { "accountValue": "10000", "totalMarginUsed": "1200" },
            "withdrawable": "8800",
            "assetPositions": [
                { "position": {
                    "coin": "BTC", "szi": "-0.5", "entryPx": "50000",
                    "unrealizedPnl": "-500", "leverage": { "value": 10 },
                    "marginUsed": "1200", "positionValue": "25500"
                }},
                { "position": { "coin": "ETH", "szi": "0" } }
            ]
        });
        let portfolio = parse_portfolio(&body, &mids);
        assert_eq!(portfolio.account_value, 10_000.0);
        assert_eq!(portfolio.positions.len(), 1);

        let pos = &portfolio.positions[0];
        assert_eq!(pos.side, Side::Short);
        assert_eq!(pos.size, 0.5);
        assert_eq!(pos.mark_price, 51_000.0);
        assert_eq!(pos.leverage, 10);
    }

    #[test]
    fn open_orders_parsing() {
        let body = serde_json::json!([
            { "oid": 5, "coin": "ETH", "side": "B", "limitPx": "3000.1", "sz": "0.5", "timestamp": 1700000000000i64 },
            { "oid": 6, "coin": "SOL", "side": "A", "limitPx": "150", "sz": "2", "timestamp": 1700000000001i64 }
        ]);
        let orders = parse_open_orders(&body);
        assert_eq!(orders.len(), 2);
        assert_eq!(orders[0].side, Action::Buy);
        assert_eq!(orders[1].side, Action::Sell);
        assert_eq!(orders[1].symbol, "SOL");
    }

    #[test]
    fn signature_is_deterministic_and_keyed() {
        let action = serde_json::json!({ "type": "order" });
        let a = sign_payload("key-1", &action, 1);
        let b = sign_payload("key-1", &action, 1);
        let c = sign_payload("key-2", &action, 1);
        let d = sign_payload("key-1", &action, 2);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
    }

    #[test]
    fn interval_table() {
        assert_eq!(interval_millis("1m"), Some(60_000));
        assert_eq!(interval_millis("1h"), Some(3_600_000));
        assert_eq!(interval_millis("7w"), None);
    }

    #[tokio::test]
    async fn degenerate_size_is_rejected_not_failed() {
        // Size validation runs before any venue call, so this never touches
        // the network.
        let config = EngineConfig::default();
        let bus = Arc::new(MessageBus::new());
        let ledger = Arc::new(OrderLedger::new(bus.clone()));
        let client = HyperliquidClient::new(&config, ledger.clone(), bus);

        for size in [0.0, -1.0] {
            let outcome = client
                .place_order(OrderRequest {
                    symbol: "BTC".to_string(),
                    action: Action::Buy,
                    size,
                    price: 50_000.0,
                    order_type: OrderType::Limit,
                    reduce_only: false,
                    confidence: 0.9,
                    client_order_id: None,
                })
                .await;
            match outcome {
                OrderOutcome::Rejected { reason, .. } => {
                    assert_eq!(reason, RejectReason::InvalidSize)
                }
                other => panic!("expected rejection for size {size}, got {other}"),
            }
        }

        // Nothing was registered: the order never got past validation.
        assert_eq!(ledger.overfills_rejected(), 0);
        assert!(client.pending_orders().is_empty());
    }
}
