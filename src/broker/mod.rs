// =============================================================================
// Broker adapter — polymorphic capability over the trading venue
// =============================================================================
//
// The engine only ever talks to this trait. No call site outside of
// `broker::alpaca` knows a venue-specific enum name or order request shape.
// Errors bubble as `anyhow::Error`; callers that need to branch on kind wrap
// the result with `EngineError::from` at the boundary where it matters.

pub mod alpaca;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::types::{Account, Bar, NewOrder, Order, Position, Timeframe};

/// Order-status filter accepted by [`Broker::get_orders`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderStatusFilter {
    Open,
    Closed,
    All,
}

#[async_trait]
pub trait Broker: Send + Sync {
    async fn get_account(&self) -> anyhow::Result<Account>;

    async fn submit_order(&self, order: NewOrder) -> anyhow::Result<Order>;

    async fn get_order(&self, order_id: &str) -> anyhow::Result<Order>;

    async fn get_orders(
        &self,
        status: Option<OrderStatusFilter>,
        limit: usize,
    ) -> anyhow::Result<Vec<Order>>;

    async fn cancel_order(&self, order_id: &str) -> anyhow::Result<()>;

    async fn cancel_all_orders(&self) -> anyhow::Result<()>;

    async fn get_positions(&self) -> anyhow::Result<Vec<Position>>;

    /// Returns `Ok(None)` when the venue has no open position for `symbol` —
    /// this is not an error condition.
    async fn get_position(&self, symbol: &str) -> anyhow::Result<Option<Position>>;

    async fn close_position(&self, symbol: &str) -> anyhow::Result<Order>;

    async fn close_all_positions(&self) -> anyhow::Result<Vec<Order>>;

    async fn get_bars(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
        limit: Option<usize>,
    ) -> anyhow::Result<Vec<Bar>>;

    async fn get_latest_price(&self, symbol: &str) -> anyhow::Result<f64>;

    async fn is_market_open(&self) -> anyhow::Result<bool>;
}
