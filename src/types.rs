// =============================================================================
// Shared domain types for the trading engine
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Bar / Timeframe
// ---------------------------------------------------------------------------

/// A single OHLCV bar. `timestamp` marks the bar's open time, UTC.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Bar {
    /// True when the OHLC relationship and non-negative volume hold.
    pub fn is_valid(&self) -> bool {
        let hi_ok = self.high >= self.open.max(self.close);
        let lo_ok = self.low <= self.open.min(self.close);
        hi_ok && lo_ok && self.volume >= 0.0
    }
}

/// A closed set of supported bar spacings, with known spacing and a
/// sensible default lookback window for the engine's per-cycle fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Timeframe {
    #[serde(rename = "1m")]
    M1,
    #[serde(rename = "5m")]
    M5,
    #[serde(rename = "15m")]
    M15,
    #[serde(rename = "30m")]
    M30,
    #[serde(rename = "1h")]
    H1,
    #[serde(rename = "4h")]
    H4,
    #[serde(rename = "1d")]
    D1,
    #[serde(rename = "1w")]
    W1,
    #[serde(rename = "1mo")]
    MO1,
}

impl Timeframe {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::M1 => "1m",
            Self::M5 => "5m",
            Self::M15 => "15m",
            Self::M30 => "30m",
            Self::H1 => "1h",
            Self::H4 => "4h",
            Self::D1 => "1d",
            Self::W1 => "1w",
            Self::MO1 => "1mo",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "1m" => Self::M1,
            "5m" => Self::M5,
            "15m" => Self::M15,
            "30m" => Self::M30,
            "1h" => Self::H1,
            "4h" => Self::H4,
            "1d" => Self::D1,
            "1w" => Self::W1,
            "1mo" => Self::MO1,
            _ => return None,
        })
    }

    /// Nominal bar spacing in seconds.
    pub fn spacing_seconds(&self) -> i64 {
        match self {
            Self::M1 => 60,
            Self::M5 => 300,
            Self::M15 => 900,
            Self::M30 => 1_800,
            Self::H1 => 3_600,
            Self::H4 => 14_400,
            Self::D1 => 86_400,
            Self::W1 => 604_800,
            Self::MO1 => 2_592_000,
        }
    }

    /// Default history window (number of bars) used when no explicit
    /// start/end is given.
    pub fn default_history_bars(&self) -> usize {
        match self {
            Self::M1 => 200,
            Self::M5 => 200,
            Self::M15 => 200,
            Self::M30 => 150,
            Self::H1 => 150,
            Self::H4 => 100,
            Self::D1 => 100,
            Self::W1 => 52,
            Self::MO1 => 24,
        }
    }

    /// Per-cycle scheduling interval for the engine's strategy loop.
    pub fn cycle_interval_secs(&self) -> u64 {
        match self {
            Self::M1 => 15,
            Self::M5 => 60,
            Self::M15 => 180,
            Self::M30 => 300,
            Self::H1 => 600,
            Self::H4 => 1_800,
            Self::D1 => 3_600,
            Self::W1 => 3_600,
            Self::MO1 => 3_600,
        }
    }
}

impl std::fmt::Display for Timeframe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Symbol helpers
// ---------------------------------------------------------------------------

/// True when `symbol` denotes a crypto pair (24/7, GTC, no market-hours gate).
pub fn is_crypto_symbol(symbol: &str) -> bool {
    symbol.contains('/')
}

/// Time-in-force to use for a new order on this symbol.
pub fn time_in_force_for(symbol: &str) -> TimeInForce {
    if is_crypto_symbol(symbol) {
        TimeInForce::Gtc
    } else {
        TimeInForce::Day
    }
}

// ---------------------------------------------------------------------------
// Signal
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Signal {
    Buy,
    Sell,
    Hold,
}

impl Signal {
    pub fn is_actionable(&self) -> bool {
        !matches!(self, Self::Hold)
    }
}

impl std::fmt::Display for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
            Self::Hold => write!(f, "HOLD"),
        }
    }
}

// ---------------------------------------------------------------------------
// Order
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    Market,
    Limit,
    Stop,
    StopLimit,
    TrailingStop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TimeInForce {
    Day,
    Gtc,
}

impl std::fmt::Display for TimeInForce {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Day => write!(f, "DAY"),
            Self::Gtc => write!(f, "GTC"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Submitted,
    Filled,
    PartiallyFilled,
    Canceled,
    Rejected,
    Error,
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Submitted => "submitted",
            Self::Filled => "filled",
            Self::PartiallyFilled => "partially_filled",
            Self::Canceled => "canceled",
            Self::Rejected => "rejected",
            Self::Error => "error",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub qty: f64,
    pub time_in_force: TimeInForce,
    pub status: OrderStatus,
    #[serde(default)]
    pub filled_qty: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filled_avg_price: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit_price: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_price: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub take_profit_price: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_loss_price: Option<f64>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filled_at: Option<DateTime<Utc>>,
}

/// Parameters for submitting a new order. A bracket order is requested by
/// setting `take_profit` and/or `stop_loss`.
#[derive(Debug, Clone)]
pub struct NewOrder {
    pub symbol: String,
    pub side: OrderSide,
    pub qty: f64,
    pub order_type: OrderType,
    pub time_in_force: TimeInForce,
    pub take_profit: Option<f64>,
    pub stop_loss: Option<f64>,
}

impl NewOrder {
    pub fn market(symbol: impl Into<String>, side: OrderSide, qty: f64) -> Self {
        let symbol = symbol.into();
        Self {
            time_in_force: time_in_force_for(&symbol),
            symbol,
            side,
            qty,
            order_type: OrderType::Market,
            take_profit: None,
            stop_loss: None,
        }
    }

    pub fn with_bracket(mut self, take_profit: Option<f64>, stop_loss: Option<f64>) -> Self {
        self.take_profit = take_profit.map(|p| round2(p));
        self.stop_loss = stop_loss.map(|p| round2(p));
        self
    }

    pub fn is_bracket(&self) -> bool {
        self.take_profit.is_some() || self.stop_loss.is_some()
    }
}

/// Round to 2 decimal places, the venue's bracket price precision.
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

// ---------------------------------------------------------------------------
// Position / Account
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionSide {
    Long,
    Short,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub qty: f64,
    pub side: PositionSide,
    pub avg_entry: f64,
    pub market_value: f64,
    pub current_price: f64,
    pub unrealized_pnl: f64,
    pub unrealized_pnl_pct: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    pub equity: f64,
    pub cash: f64,
    pub buying_power: f64,
    pub portfolio_value: f64,
    pub currency: String,
    pub status: String,
}

// ---------------------------------------------------------------------------
// Strategy run
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrategyRunStatus {
    Running,
    Stopped,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyRun {
    pub id: i64,
    pub strategy_name: String,
    pub status: StrategyRunStatus,
    pub symbols: Vec<String>,
    pub timeframe: Timeframe,
    pub parameters_json: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_signal_json: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stopped_at: Option<DateTime<Utc>>,
    pub total_trades: u32,
    pub winning_trades: u32,
    pub losing_trades: u32,
    pub total_pnl: f64,
}

// ---------------------------------------------------------------------------
// Trade record
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeStatus {
    Pending,
    Submitted,
    Filled,
    PartiallyFilled,
    Canceled,
    Rejected,
    Error,
}

impl From<OrderStatus> for TradeStatus {
    fn from(s: OrderStatus) -> Self {
        match s {
            OrderStatus::Pending => Self::Pending,
            OrderStatus::Submitted => Self::Submitted,
            OrderStatus::Filled => Self::Filled,
            OrderStatus::PartiallyFilled => Self::PartiallyFilled,
            OrderStatus::Canceled => Self::Canceled,
            OrderStatus::Rejected => Self::Rejected,
            OrderStatus::Error => Self::Error,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRecord {
    pub id: i64,
    pub strategy_name: String,
    pub symbol: String,
    pub side: OrderSide,
    pub qty: f64,
    pub order_type: OrderType,
    pub time_in_force: TimeInForce,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit_price: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_price: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filled_avg_price: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filled_qty: Option<f64>,
    pub status: TradeStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub broker_order_id: Option<String>,
    pub signal: Signal,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub realized_pnl: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub submitted_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filled_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Performance snapshot
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceSnapshot {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strategy_name: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub equity: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cash: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub buying_power: Option<f64>,
    pub total_pnl: f64,
    pub daily_pnl: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unrealized_pnl: Option<f64>,
    pub total_trades: u32,
    pub winning_trades: u32,
    pub losing_trades: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub win_rate: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sharpe: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_dd: Option<f64>,
}

// ---------------------------------------------------------------------------
// Engine events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EngineEventKind {
    EngineStarted,
    EngineStopped,
    StrategyStarted,
    StrategyStopped,
    StrategyError,
    SignalGenerated,
    OrderSubmitted,
    RiskRejected,
    CycleCompleted,
}

impl EngineEventKind {
    pub const ALL: [EngineEventKind; 9] = [
        Self::EngineStarted,
        Self::EngineStopped,
        Self::StrategyStarted,
        Self::StrategyStopped,
        Self::StrategyError,
        Self::SignalGenerated,
        Self::OrderSubmitted,
        Self::RiskRejected,
        Self::CycleCompleted,
    ];
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineEvent {
    pub event: EngineEventKind,
    pub timestamp: DateTime<Utc>,
    pub payload: serde_json::Value,
}

impl EngineEvent {
    pub fn new(event: EngineEventKind, payload: serde_json::Value) -> Self {
        Self {
            event,
            timestamp: Utc::now(),
            payload,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeframe_roundtrips_through_str() {
        for tf in [
            Timeframe::M1,
            Timeframe::M5,
            Timeframe::M15,
            Timeframe::M30,
            Timeframe::H1,
            Timeframe::H4,
            Timeframe::D1,
            Timeframe::W1,
            Timeframe::MO1,
        ] {
            assert_eq!(Timeframe::parse(tf.as_str()), Some(tf));
        }
    }

    #[test]
    fn crypto_symbol_detection() {
        assert!(is_crypto_symbol("BTC/USD"));
        assert!(!is_crypto_symbol("AAPL"));
        assert_eq!(time_in_force_for("BTC/USD"), TimeInForce::Gtc);
        assert_eq!(time_in_force_for("AAPL"), TimeInForce::Day);
    }

    #[test]
    fn bracket_prices_round_to_two_decimals() {
        let order = NewOrder::market("BTC/USD", OrderSide::Buy, 1.0)
            .with_bracket(Some(70000.004), Some(59999.996));
        assert_eq!(order.take_profit, Some(70000.0));
        assert_eq!(order.stop_loss, Some(60000.0));
        assert!(order.is_bracket());
    }

    #[test]
    fn bar_validity() {
        let good = Bar {
            timestamp: Utc::now(),
            open: 10.0,
            high: 11.0,
            low: 9.0,
            close: 10.5,
            volume: 100.0,
        };
        assert!(good.is_valid());

        let bad = Bar { high: 9.5, ..good };
        assert!(!bad.is_valid());
    }
}
