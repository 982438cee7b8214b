// =============================================================================
// REST surface — read endpoints + strategy lifecycle control
// =============================================================================
//
// CORS-enabled and permissive. External-client authentication is out of
// scope here; anything reachable over this router is read-mostly or a
// strategy start/stop/param toggle, never account credentials.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::response::IntoResponse;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tower_http::cors::{Any, CorsLayer};
use tracing::{instrument, warn};

use crate::app_state::AppState;
use crate::broker::OrderStatusFilter;
use crate::error::EngineError;
use crate::persistence::TradeFilter;
use crate::types::{OrderSide, TradeStatus};

pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/api/strategies", get(list_strategies))
        .route("/api/strategies/active", get(active_strategies))
        .route("/api/strategies/:name", get(get_strategy))
        .route("/api/strategies/:name/start", post(start_strategy))
        .route("/api/strategies/:name/stop", post(stop_strategy))
        .route("/api/strategies/:name/params", put(update_strategy_params))
        .route("/api/trades", get(list_trades))
        .route("/api/trades/summary", get(trades_summary))
        .route("/api/trades/:id", get(get_trade))
        .route("/api/performance", get(performance))
        .route("/api/performance/engine-status", get(engine_status))
        .route("/api/performance/strategy/:name", get(performance_for_strategy))
        .route("/api/performance/equity-curve", get(equity_curve))
        .route("/api/performance/equity-curve/:name", get(equity_curve_for_strategy))
        .route("/api/performance/strategy-runs", get(strategy_runs))
        .route("/api/performance/strategy-runs/:name", get(strategy_runs_for_strategy))
        .route("/api/account", get(account))
        .route("/api/positions", get(positions))
        .route("/api/orders", get(orders))
        .route("/api/market", get(market))
        .layer(cors)
        .with_state(state)
}

async fn root() -> &'static str {
    "quantum-trader engine online"
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    engine_state: String,
    uptime_secs: u64,
    timestamp: String,
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        engine_state: format!("{:?}", state.engine.state()),
        uptime_secs: state.uptime_secs(),
        timestamp: Utc::now().to_rfc3339(),
    })
}

// ---------------------------------------------------------------------------
// Strategies
// ---------------------------------------------------------------------------

async fn list_strategies(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let names = state.registry.list_strategies();
    let mut infos = Vec::with_capacity(names.len());
    for name in names {
        match state.registry.get_strategy(&name) {
            Ok(instance) => infos.push(instance.read().await.info()),
            Err(e) => warn!(strategy = %name, error = %e, "failed to load strategy instance for listing"),
        }
    }
    Json(infos)
}

async fn active_strategies(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({ "active": state.engine.active_strategies() }))
}

async fn get_strategy(State(state): State<Arc<AppState>>, Path(name): Path<String>) -> Result<impl IntoResponse, EngineError> {
    let instance = state
        .registry
        .get_strategy(&name)
        .map_err(|_| EngineError::NotFound(format!("strategy '{name}' not found")))?;
    Ok(Json(instance.read().await.info()))
}

/// Maps the engine's string-bailed lifecycle errors onto the right status
/// code without requiring `start_strategy`/`stop_strategy` to return a typed
/// error themselves.
fn classify_lifecycle_error(e: &anyhow::Error) -> EngineError {
    let msg = e.to_string();
    if msg.starts_with("ALREADY_RUNNING") {
        EngineError::AlreadyRunning(msg)
    } else if msg.starts_with("engine is not running") {
        EngineError::EngineNotReady
    } else if msg.contains("is not running") {
        EngineError::NotFound(msg)
    } else {
        EngineError::Internal(msg)
    }
}

#[instrument(skip(state))]
async fn start_strategy(State(state): State<Arc<AppState>>, Path(name): Path<String>) -> Result<impl IntoResponse, EngineError> {
    state.engine.start_strategy(&name).await.map_err(|e| classify_lifecycle_error(&e))?;
    state.increment_version();
    Ok(Json(json!({ "strategy": name, "status": "started" })))
}

#[instrument(skip(state))]
async fn stop_strategy(State(state): State<Arc<AppState>>, Path(name): Path<String>) -> Result<impl IntoResponse, EngineError> {
    state.engine.stop_strategy(&name).await.map_err(|e| classify_lifecycle_error(&e))?;
    state.increment_version();
    Ok(Json(json!({ "strategy": name, "status": "stopped" })))
}

async fn update_strategy_params(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Json(overrides): Json<Value>,
) -> Result<impl IntoResponse, EngineError> {
    let instance = state
        .registry
        .get_strategy(&name)
        .map_err(|_| EngineError::NotFound(format!("strategy '{name}' not found")))?;
    let mut guard = instance.write().await;
    guard.update_parameters(&overrides);
    state.increment_version();
    Ok(Json(guard.info()))
}

// ---------------------------------------------------------------------------
// Trades
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct TradesQuery {
    strategy: Option<String>,
    symbol: Option<String>,
    side: Option<String>,
    status: Option<String>,
    since: Option<DateTime<Utc>>,
    until: Option<DateTime<Utc>>,
    limit: Option<usize>,
    offset: Option<usize>,
}

fn parse_side(s: &str) -> Option<OrderSide> {
    match s.to_lowercase().as_str() {
        "buy" => Some(OrderSide::Buy),
        "sell" => Some(OrderSide::Sell),
        _ => None,
    }
}

fn parse_trade_status(s: &str) -> Option<TradeStatus> {
    match s.to_lowercase().as_str() {
        "pending" => Some(TradeStatus::Pending),
        "submitted" => Some(TradeStatus::Submitted),
        "filled" => Some(TradeStatus::Filled),
        "partiallyfilled" | "partially_filled" => Some(TradeStatus::PartiallyFilled),
        "canceled" | "cancelled" => Some(TradeStatus::Canceled),
        "rejected" => Some(TradeStatus::Rejected),
        "error" => Some(TradeStatus::Error),
        _ => None,
    }
}

impl TradesQuery {
    fn into_filter(self) -> TradeFilter {
        TradeFilter {
            strategy_name: self.strategy,
            symbol: self.symbol,
            side: self.side.as_deref().and_then(parse_side),
            status: self.status.as_deref().and_then(parse_trade_status),
            since: self.since,
            until: self.until,
            limit: self.limit,
            offset: self.offset,
        }
    }
}

async fn list_trades(State(state): State<Arc<AppState>>, Query(q): Query<TradesQuery>) -> Result<impl IntoResponse, EngineError> {
    let filter = q.into_filter();
    let total = state.persistence.count_trades(filter.clone()).await?;
    let trades = state.persistence.list_trades(filter).await?;
    Ok(Json(json!({ "trades": trades, "total": total })))
}

async fn get_trade(State(state): State<Arc<AppState>>, Path(id): Path<i64>) -> Result<impl IntoResponse, EngineError> {
    let trade = state
        .persistence
        .get_trade(id)
        .await?
        .ok_or_else(|| EngineError::NotFound(format!("trade {id} not found")))?;
    Ok(Json(trade))
}

async fn trades_summary(State(state): State<Arc<AppState>>, Query(q): Query<TradesQuery>) -> Result<impl IntoResponse, EngineError> {
    let filter = q.into_filter();
    let trades = state.persistence.list_trades(filter).await?;
    let closed: Vec<_> = trades.iter().filter(|t| t.realized_pnl.is_some()).collect();
    let total_pnl: f64 = closed.iter().filter_map(|t| t.realized_pnl).sum();
    let wins = closed.iter().filter(|t| t.realized_pnl.unwrap_or(0.0) > 0.0).count();
    let win_rate = if closed.is_empty() { None } else { Some(wins as f64 / closed.len() as f64) };

    Ok(Json(json!({
        "total_trades": trades.len(),
        "closed_trades": closed.len(),
        "total_pnl": total_pnl,
        "win_rate": win_rate,
    })))
}

// ---------------------------------------------------------------------------
// Performance
// ---------------------------------------------------------------------------

async fn performance(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, EngineError> {
    let snapshot = state.persistence.latest_performance_snapshot(None).await?;
    Ok(Json(snapshot))
}

async fn performance_for_strategy(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, EngineError> {
    let snapshot = state.persistence.latest_performance_snapshot(Some(&name)).await?;
    Ok(Json(snapshot))
}

async fn engine_status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "state": format!("{:?}", state.engine.state()),
        "active_strategies": state.engine.active_strategies(),
        "total_cycles": state.engine.total_cycles(),
        "total_orders": state.engine.total_orders(),
        "subscriber_count": state.event_bus.subscriber_count(),
        "risk": state.risk.status(),
        "uptime_secs": state.uptime_secs(),
    }))
}

#[derive(Deserialize)]
struct EquityCurveQuery {
    limit: Option<usize>,
}

async fn equity_curve(
    State(state): State<Arc<AppState>>,
    Query(q): Query<EquityCurveQuery>,
) -> Result<impl IntoResponse, EngineError> {
    let snapshots = state.persistence.list_performance_snapshots(None, q.limit.unwrap_or(500)).await?;
    Ok(Json(snapshots))
}

async fn equity_curve_for_strategy(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Query(q): Query<EquityCurveQuery>,
) -> Result<impl IntoResponse, EngineError> {
    let snapshots = state
        .persistence
        .list_performance_snapshots(Some(&name), q.limit.unwrap_or(500))
        .await?;
    Ok(Json(snapshots))
}

async fn strategy_runs(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, EngineError> {
    let runs = state.persistence.list_strategy_runs(None).await?;
    Ok(Json(runs))
}

async fn strategy_runs_for_strategy(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, EngineError> {
    let runs = state.persistence.list_strategy_runs(Some(&name)).await?;
    Ok(Json(runs))
}

// ---------------------------------------------------------------------------
// Account / positions / orders / market
// ---------------------------------------------------------------------------

async fn account(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, EngineError> {
    let account = state.broker.get_account().await?;
    Ok(Json(account))
}

async fn positions(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, EngineError> {
    let positions = state.broker.get_positions().await?;
    Ok(Json(positions))
}

#[derive(Deserialize)]
struct OrdersQuery {
    status: Option<String>,
    limit: Option<usize>,
}

fn parse_order_status_filter(s: &str) -> OrderStatusFilter {
    match s.to_lowercase().as_str() {
        "open" => OrderStatusFilter::Open,
        "closed" => OrderStatusFilter::Closed,
        _ => OrderStatusFilter::All,
    }
}

async fn orders(State(state): State<Arc<AppState>>, Query(q): Query<OrdersQuery>) -> Result<impl IntoResponse, EngineError> {
    let filter = q.status.as_deref().map(parse_order_status_filter);
    let orders = state.broker.get_orders(filter, q.limit.unwrap_or(100)).await?;
    Ok(Json(orders))
}

async fn market(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let symbols = state.runtime_config.read().symbols.clone();
    let prices = state.market_data.get_latest_prices(&symbols, true).await;
    let market_open = state.market_data.is_market_open().await;
    Json(json!({ "prices": prices, "market_open": market_open }))
}
