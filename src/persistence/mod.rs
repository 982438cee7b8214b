// =============================================================================
// Persistence port — narrow write/read surface the engine sees
// =============================================================================
//
// The engine never issues SQL. It talks to whatever implements
// `PersistencePort`; `sqlite_store::SqliteStore` is the only implementation
// today. Keeping the trait narrow means a write failure is just an `Err` the
// caller logs and continues past, never a reason to fail a cycle.

pub mod sqlite_store;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::types::{
    OrderSide, OrderType, PerformanceSnapshot, Signal, StrategyRun, TimeInForce, TradeRecord,
    TradeStatus,
};

/// Fields needed to record a new trade attempt. `id`/`created_at` are
/// assigned by the store.
#[derive(Debug, Clone)]
pub struct NewTradeAttempt {
    pub strategy_name: String,
    pub symbol: String,
    pub side: OrderSide,
    pub qty: f64,
    pub order_type: OrderType,
    pub time_in_force: TimeInForce,
    pub limit_price: Option<f64>,
    pub stop_price: Option<f64>,
    pub status: TradeStatus,
    pub broker_order_id: Option<String>,
    pub signal: Signal,
    pub notes: Option<String>,
}

/// Filter + pagination for `list_trades`. Every field left `None` is
/// unconstrained; `limit`/`offset` default to 100/0 in the store.
#[derive(Debug, Clone, Default)]
pub struct TradeFilter {
    pub strategy_name: Option<String>,
    pub symbol: Option<String>,
    pub side: Option<OrderSide>,
    pub status: Option<TradeStatus>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

#[async_trait]
pub trait PersistencePort: Send + Sync {
    async fn record_trade_attempt(&self, fields: NewTradeAttempt) -> anyhow::Result<i64>;

    async fn open_strategy_run(
        &self,
        strategy: &str,
        symbols: &[String],
        timeframe: crate::types::Timeframe,
        parameters_json: Value,
        started_at: DateTime<Utc>,
    ) -> anyhow::Result<i64>;

    async fn mark_strategy_run_stopped(&self, id: i64, stopped_at: DateTime<Utc>) -> anyhow::Result<()>;

    async fn mark_strategy_run_errored(
        &self,
        id: i64,
        message: &str,
        stopped_at: DateTime<Utc>,
    ) -> anyhow::Result<()>;

    async fn update_strategy_run_signals(
        &self,
        id: i64,
        last_signal_json: Value,
        trade_count_since: u32,
    ) -> anyhow::Result<()>;

    async fn append_performance_snapshot(&self, snapshot: &PerformanceSnapshot) -> anyhow::Result<()>;

    async fn list_trades(&self, filter: TradeFilter) -> anyhow::Result<Vec<TradeRecord>>;

    async fn count_trades(&self, filter: TradeFilter) -> anyhow::Result<u64>;

    async fn get_trade(&self, id: i64) -> anyhow::Result<Option<TradeRecord>>;

    async fn list_strategy_runs(&self, strategy: Option<&str>) -> anyhow::Result<Vec<StrategyRun>>;

    async fn latest_performance_snapshot(
        &self,
        strategy: Option<&str>,
    ) -> anyhow::Result<Option<PerformanceSnapshot>>;

    /// Ascending-by-timestamp snapshot history, the equity-curve data source.
    async fn list_performance_snapshots(
        &self,
        strategy: Option<&str>,
        limit: usize,
    ) -> anyhow::Result<Vec<PerformanceSnapshot>>;
}
