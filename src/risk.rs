// =============================================================================
// Risk Manager — pre-trade gate and position sizing
// =============================================================================
//
// Stands between every signal and the broker. `evaluate_order` runs a fixed
// chain of checks (daily loss, trade count, position size, open positions,
// buying power) in that exact order and short-circuits on the first
// rejection. Daily counters roll over on UTC calendar-day change, refreshed
// lazily whenever an order is evaluated or a trade is recorded.

use chrono::{NaiveDate, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::broker::Broker;
use crate::types::{round2, Account, OrderSide, Position};

// ---------------------------------------------------------------------------
// Limits
// ---------------------------------------------------------------------------

/// All percentages are expressed in percent units (2.0 means 2%), matching
/// the configuration surface. `0` disables the corresponding check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskLimits {
    pub max_daily_loss_pct: f64,
    pub max_position_size_pct: f64,
    pub max_trades_per_day: u32,
    pub max_open_positions: u32,
    pub min_buying_power_pct: f64,
}

impl Default for RiskLimits {
    fn default() -> Self {
        Self {
            max_daily_loss_pct: 3.0,
            max_position_size_pct: 10.0,
            max_trades_per_day: 50,
            max_open_positions: 20,
            min_buying_power_pct: 10.0,
        }
    }
}

// ---------------------------------------------------------------------------
// Result type
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct RiskCheck {
    pub approved: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub details: Value,
}

impl RiskCheck {
    fn ok(details: Value) -> Self {
        Self {
            approved: true,
            reason: None,
            details,
        }
    }

    fn reject(reason: impl Into<String>, details: Value) -> Self {
        Self {
            approved: false,
            reason: Some(reason.into()),
            details,
        }
    }
}

// ---------------------------------------------------------------------------
// Internal daily counters
// ---------------------------------------------------------------------------

struct Inner {
    current_date: NaiveDate,
    daily_pnl: f64,
    trades_today: u32,
    equity_start_of_day: f64,
}

// ---------------------------------------------------------------------------
// Risk Manager
// ---------------------------------------------------------------------------

pub struct RiskManager {
    limits: RwLock<RiskLimits>,
    state: RwLock<Inner>,
}

impl RiskManager {
    pub fn new(limits: RiskLimits) -> Self {
        info!(
            max_daily_loss_pct = limits.max_daily_loss_pct,
            max_position_size_pct = limits.max_position_size_pct,
            max_trades_per_day = limits.max_trades_per_day,
            "RiskManager initialised"
        );
        Self {
            limits: RwLock::new(limits),
            state: RwLock::new(Inner {
                current_date: Utc::now().date_naive(),
                daily_pnl: 0.0,
                trades_today: 0,
                equity_start_of_day: 0.0,
            }),
        }
    }

    // ------------------------------------------------------------------
    // Evaluation
    // ------------------------------------------------------------------

    pub async fn evaluate_order(
        &self,
        symbol: &str,
        side: OrderSide,
        qty: f64,
        price: f64,
        strategy_name: &str,
        broker: &dyn Broker,
    ) -> RiskCheck {
        let order_value = qty * price;
        debug!(symbol, ?side, qty, price, order_value, strategy_name, "evaluating order");

        let (account, positions) = match tokio::try_join!(broker.get_account(), broker.get_positions()) {
            Ok(pair) => pair,
            Err(e) => {
                warn!(symbol, error = %e, "failed to refresh account state for risk check");
                return RiskCheck::reject(format!("failed to fetch account state: {e}"), json!({}));
            }
        };

        self.roll_day_if_needed(&account);

        let checks = [
            Self::check_daily_loss,
            Self::check_trades_limit,
            Self::check_position_size,
            Self::check_open_positions,
            Self::check_buying_power,
        ];

        for check in checks {
            let result = check(self, symbol, side, order_value, &account, &positions);
            if !result.approved {
                warn!(symbol, ?side, qty, reason = ?result.reason, "order rejected by risk manager");
                return result;
            }
        }

        info!(symbol, ?side, qty, price, "order approved by risk manager");
        let state = self.state.read();
        RiskCheck::ok(json!({
            "equity": account.equity,
            "daily_pnl": state.daily_pnl,
            "trades_today": state.trades_today,
            "open_positions": positions.len(),
        }))
    }

    fn check_daily_loss(&self, _symbol: &str, _side: OrderSide, _order_value: f64, _account: &Account, _positions: &[Position]) -> RiskCheck {
        let limits = self.limits.read();
        let state = self.state.read();

        if limits.max_daily_loss_pct <= 0.0 || state.equity_start_of_day <= 0.0 {
            return RiskCheck::ok(json!({}));
        }

        let max_loss = state.equity_start_of_day * (limits.max_daily_loss_pct / 100.0);
        let current_loss = (-state.daily_pnl).max(0.0);

        if current_loss >= max_loss {
            return RiskCheck::reject(
                format!(
                    "Daily loss cap reached: ${current_loss:.2} >= ${max_loss:.2} ({}% of equity)",
                    limits.max_daily_loss_pct
                ),
                json!({
                    "daily_pnl": state.daily_pnl,
                    "max_daily_loss": max_loss,
                    "equity_start_of_day": state.equity_start_of_day,
                }),
            );
        }
        RiskCheck::ok(json!({}))
    }

    fn check_trades_limit(&self, _symbol: &str, _side: OrderSide, _order_value: f64, _account: &Account, _positions: &[Position]) -> RiskCheck {
        let limits = self.limits.read();
        let state = self.state.read();

        if limits.max_trades_per_day == 0 {
            return RiskCheck::ok(json!({}));
        }
        if state.trades_today >= limits.max_trades_per_day {
            return RiskCheck::reject(
                format!(
                    "Daily trade cap reached: {} >= {}",
                    state.trades_today, limits.max_trades_per_day
                ),
                json!({"trades_today": state.trades_today}),
            );
        }
        RiskCheck::ok(json!({}))
    }

    fn check_position_size(&self, symbol: &str, side: OrderSide, order_value: f64, account: &Account, positions: &[Position]) -> RiskCheck {
        let limits = self.limits.read();
        if limits.max_position_size_pct <= 0.0 || side == OrderSide::Sell {
            return RiskCheck::ok(json!({}));
        }

        let max_value = account.equity * (limits.max_position_size_pct / 100.0);
        let existing_value = existing_position_value(symbol, positions);
        let total_exposure = existing_value + order_value;

        if total_exposure > max_value {
            return RiskCheck::reject(
                format!(
                    "Position size cap exceeded: ${total_exposure:.2} > ${max_value:.2} ({}% of equity)",
                    limits.max_position_size_pct
                ),
                json!({
                    "order_value": order_value,
                    "existing_value": existing_value,
                    "total_exposure": total_exposure,
                    "max_position_value": max_value,
                    "equity": account.equity,
                }),
            );
        }
        RiskCheck::ok(json!({}))
    }

    fn check_open_positions(&self, _symbol: &str, side: OrderSide, _order_value: f64, _account: &Account, positions: &[Position]) -> RiskCheck {
        let limits = self.limits.read();
        if limits.max_open_positions == 0 || side == OrderSide::Sell {
            return RiskCheck::ok(json!({}));
        }
        if positions.len() as u32 >= limits.max_open_positions {
            return RiskCheck::reject(
                format!(
                    "Open-positions cap reached: {} >= {}",
                    positions.len(),
                    limits.max_open_positions
                ),
                json!({"open_positions": positions.len()}),
            );
        }
        RiskCheck::ok(json!({}))
    }

    fn check_buying_power(&self, _symbol: &str, side: OrderSide, order_value: f64, account: &Account, _positions: &[Position]) -> RiskCheck {
        if side == OrderSide::Sell {
            return RiskCheck::ok(json!({}));
        }

        if order_value > account.buying_power {
            return RiskCheck::reject(
                format!(
                    "Insufficient buying power: order=${order_value:.2} > available=${:.2}",
                    account.buying_power
                ),
                json!({"order_value": order_value, "buying_power": account.buying_power}),
            );
        }

        let limits = self.limits.read();
        if account.equity > 0.0 {
            let remaining_pct = ((account.buying_power - order_value) / account.equity) * 100.0;
            if remaining_pct < limits.min_buying_power_pct {
                warn!(
                    remaining_pct,
                    min_buying_power_pct = limits.min_buying_power_pct,
                    "buying power residual below recommended minimum"
                );
            }
        }
        RiskCheck::ok(json!({}))
    }

    // ------------------------------------------------------------------
    // Position sizing
    // ------------------------------------------------------------------

    /// Optimal share/unit count for a new position, the minimum of the
    /// equity-percentage budget and 95% of buying power, divided by price.
    pub fn calculate_position_size(
        &self,
        symbol: &str,
        price: f64,
        account: &Account,
        positions: &[Position],
        target_pct: Option<f64>,
    ) -> f64 {
        if price <= 0.0 {
            return 0.0;
        }

        let pct = target_pct.unwrap_or(self.limits.read().max_position_size_pct);
        let max_by_equity = account.equity * (pct / 100.0);
        let max_by_bp = account.buying_power * 0.95;
        let existing_value = existing_position_value(symbol, positions);

        let available = (max_by_equity - existing_value).min(max_by_bp).max(0.0);
        let qty = available / price;

        if qty < 0.01 {
            return 0.0;
        }
        round4(qty)
    }

    // ------------------------------------------------------------------
    // Accounting
    // ------------------------------------------------------------------

    pub fn record_trade(&self, pnl: f64) {
        let mut state = self.state.write();
        state.trades_today += 1;
        state.daily_pnl += pnl;
        debug!(
            trades_today = state.trades_today,
            daily_pnl = state.daily_pnl,
            pnl,
            "trade recorded"
        );
    }

    pub fn update_daily_pnl(&self, pnl: f64) {
        self.state.write().daily_pnl = pnl;
    }

    pub fn update_limits(&self, overrides: &Value) {
        let current = serde_json::to_value(&*self.limits.read()).unwrap_or_else(|_| json!({}));
        let applied = crate::strategy::filter_known_overrides("risk_manager", &current, overrides);

        let mut limits = self.limits.write();
        if let Some(v) = applied.get("max_daily_loss_pct").and_then(Value::as_f64) {
            limits.max_daily_loss_pct = v;
        }
        if let Some(v) = applied.get("max_position_size_pct").and_then(Value::as_f64) {
            limits.max_position_size_pct = v;
        }
        if let Some(v) = applied.get("max_trades_per_day").and_then(Value::as_u64) {
            limits.max_trades_per_day = v as u32;
        }
        if let Some(v) = applied.get("max_open_positions").and_then(Value::as_u64) {
            limits.max_open_positions = v as u32;
        }
        if let Some(v) = applied.get("min_buying_power_pct").and_then(Value::as_f64) {
            limits.min_buying_power_pct = v;
        }
    }

    pub fn limits(&self) -> RiskLimits {
        self.limits.read().clone()
    }

    pub fn status(&self) -> Value {
        let limits = self.limits.read();
        let state = self.state.read();
        json!({
            "limits": {
                "max_daily_loss_pct": limits.max_daily_loss_pct,
                "max_position_size_pct": limits.max_position_size_pct,
                "max_trades_per_day": limits.max_trades_per_day,
                "max_open_positions": limits.max_open_positions,
                "min_buying_power_pct": limits.min_buying_power_pct,
            },
            "daily": {
                "date": state.current_date.to_string(),
                "pnl": state.daily_pnl,
                "trades_count": state.trades_today,
                "equity_start_of_day": state.equity_start_of_day,
            },
        })
    }

    // ------------------------------------------------------------------
    // Day roll
    // ------------------------------------------------------------------

    fn roll_day_if_needed(&self, account: &Account) {
        let today = Utc::now().date_naive();
        let mut state = self.state.write();

        if state.current_date == today {
            if state.equity_start_of_day <= 0.0 && account.equity > 0.0 {
                state.equity_start_of_day = account.equity;
            }
            return;
        }

        info!(
            prior_date = %state.current_date,
            new_date = %today,
            prior_pnl = state.daily_pnl,
            prior_trades = state.trades_today,
            "UTC day rolled, resetting risk counters"
        );
        state.current_date = today;
        state.daily_pnl = 0.0;
        state.trades_today = 0;
        if account.equity > 0.0 {
            state.equity_start_of_day = account.equity;
        }
    }
}

impl std::fmt::Debug for RiskManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RiskManager").field("limits", &*self.limits.read()).finish()
    }
}

fn existing_position_value(symbol: &str, positions: &[Position]) -> f64 {
    positions
        .iter()
        .find(|p| p.symbol == symbol)
        .map(|p| p.market_value)
        .unwrap_or(0.0)
}

fn round4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::OrderStatusFilter;
    use crate::types::{NewOrder, Order, PositionSide, Timeframe};
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct StubBroker {
        account: Account,
        positions: Vec<Position>,
    }

    #[async_trait]
    impl Broker for StubBroker {
        async fn get_account(&self) -> anyhow::Result<Account> {
            Ok(self.account.clone())
        }
        async fn submit_order(&self, _order: NewOrder) -> anyhow::Result<Order> {
            unimplemented!()
        }
        async fn get_order(&self, _order_id: &str) -> anyhow::Result<Order> {
            unimplemented!()
        }
        async fn get_orders(&self, _status: Option<OrderStatusFilter>, _limit: usize) -> anyhow::Result<Vec<Order>> {
            unimplemented!()
        }
        async fn cancel_order(&self, _order_id: &str) -> anyhow::Result<()> {
            unimplemented!()
        }
        async fn cancel_all_orders(&self) -> anyhow::Result<()> {
            unimplemented!()
        }
        async fn get_positions(&self) -> anyhow::Result<Vec<Position>> {
            Ok(self.positions.clone())
        }
        async fn get_position(&self, _symbol: &str) -> anyhow::Result<Option<Position>> {
            unimplemented!()
        }
        async fn close_position(&self, _symbol: &str) -> anyhow::Result<Order> {
            unimplemented!()
        }
        async fn close_all_positions(&self) -> anyhow::Result<Vec<Order>> {
            unimplemented!()
        }
        async fn get_bars(
            &self,
            _symbol: &str,
            _timeframe: Timeframe,
            _start: Option<chrono::DateTime<Utc>>,
            _end: Option<chrono::DateTime<Utc>>,
            _limit: Option<usize>,
        ) -> anyhow::Result<Vec<crate::types::Bar>> {
            unimplemented!()
        }
        async fn get_latest_price(&self, _symbol: &str) -> anyhow::Result<f64> {
            unimplemented!()
        }
        async fn is_market_open(&self) -> anyhow::Result<bool> {
            unimplemented!()
        }
    }

    fn account(equity: f64, buying_power: f64) -> Account {
        Account {
            id: "acct".to_string(),
            equity,
            cash: equity,
            buying_power,
            portfolio_value: equity,
            currency: "USD".to_string(),
            status: "ACTIVE".to_string(),
        }
    }

    fn position(symbol: &str, market_value: f64) -> Position {
        Position {
            symbol: symbol.to_string(),
            qty: 1.0,
            side: PositionSide::Long,
            avg_entry: market_value,
            market_value,
            current_price: market_value,
            unrealized_pnl: 0.0,
            unrealized_pnl_pct: 0.0,
        }
    }

    fn manager() -> RiskManager {
        RiskManager::new(RiskLimits {
            max_daily_loss_pct: 2.0,
            max_position_size_pct: 10.0,
            max_trades_per_day: 3,
            max_open_positions: 2,
            min_buying_power_pct: 10.0,
        })
    }

    #[tokio::test]
    async fn approves_order_within_all_limits() {
        let rm = manager();
        let broker = StubBroker { account: account(10_000.0, 10_000.0), positions: vec![] };
        let check = rm.evaluate_order("AAPL", OrderSide::Buy, 5.0, 100.0, "sma_crossover", &broker).await;
        assert!(check.approved);
    }

    #[tokio::test]
    async fn rejects_when_position_size_cap_exceeded() {
        let rm = manager();
        let broker = StubBroker { account: account(10_000.0, 10_000.0), positions: vec![] };
        // 10% of 10,000 = 1,000 max; this order is 2,000.
        let check = rm.evaluate_order("AAPL", OrderSide::Buy, 20.0, 100.0, "sma_crossover", &broker).await;
        assert!(!check.approved);
        assert!(check.reason.unwrap().contains("Position size"));
    }

    #[tokio::test]
    async fn sell_orders_skip_position_and_open_position_caps() {
        let rm = manager();
        let positions = vec![position("AAPL", 5_000.0), position("MSFT", 5_000.0)];
        let broker = StubBroker { account: account(10_000.0, 10_000.0), positions };
        let check = rm.evaluate_order("AAPL", OrderSide::Sell, 20.0, 100.0, "sma_crossover", &broker).await;
        assert!(check.approved);
    }

    #[tokio::test]
    async fn rejects_when_open_positions_cap_reached() {
        let rm = manager();
        let positions = vec![position("AAPL", 100.0), position("MSFT", 100.0)];
        let broker = StubBroker { account: account(10_000.0, 10_000.0), positions };
        let check = rm.evaluate_order("TSLA", OrderSide::Buy, 1.0, 50.0, "sma_crossover", &broker).await;
        assert!(!check.approved);
        assert!(check.reason.unwrap().contains("Open-positions"));
    }

    #[tokio::test]
    async fn rejects_when_daily_trade_cap_reached() {
        let rm = manager();
        let broker = StubBroker { account: account(10_000.0, 10_000.0), positions: vec![] };
        for _ in 0..3 {
            rm.record_trade(0.0);
        }
        // Force equity_start_of_day to seed without tripping the daily-loss check.
        rm.roll_day_if_needed(&account(10_000.0, 10_000.0));
        let check = rm.evaluate_order("AAPL", OrderSide::Buy, 1.0, 50.0, "sma_crossover", &broker).await;
        assert!(!check.approved);
        assert!(check.reason.unwrap().contains("trade cap"));
    }

    #[tokio::test]
    async fn rejects_when_daily_loss_cap_breached() {
        let rm = manager();
        let broker = StubBroker { account: account(10_000.0, 10_000.0), positions: vec![] };
        rm.roll_day_if_needed(&account(10_000.0, 10_000.0));
        rm.update_daily_pnl(-250.0); // 2.5% loss against a 2% cap
        let check = rm.evaluate_order("AAPL", OrderSide::Buy, 1.0, 50.0, "sma_crossover", &broker).await;
        assert!(!check.approved);
        assert!(check.reason.unwrap().contains("Daily loss"));
    }

    #[test]
    fn position_size_takes_minimum_of_equity_and_buying_power_budget() {
        let rm = manager();
        let acct = account(10_000.0, 500.0);
        // 10% of equity = 1,000, but 95% of buying power = 475 — the binding constraint.
        let qty = rm.calculate_position_size("AAPL", 100.0, &acct, &[], None);
        assert!((qty - 4.75).abs() < 1e-6);
    }

    #[test]
    fn position_size_below_minimum_returns_zero() {
        let rm = manager();
        let acct = account(10.0, 10.0);
        let qty = rm.calculate_position_size("AAPL", 1_000_000.0, &acct, &[], None);
        assert_eq!(qty, 0.0);
    }

    #[test]
    fn update_limits_ignores_unknown_keys() {
        let rm = manager();
        rm.update_limits(&json!({"max_trades_per_day": 7, "bogus": 1}));
        assert_eq!(rm.limits().max_trades_per_day, 7);
    }

    #[allow(dead_code)]
    fn silence_unused(_m: &Mutex<()>) {}
}
