// =============================================================================
// Alpaca broker adapter — paper/live trading + market data REST client
// =============================================================================
//
// SECURITY: the secret key is never logged or serialized. Every request
// carries APCA-API-KEY-ID / APCA-API-SECRET-KEY as headers, never in the
// query string or body.
// =============================================================================

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::{debug, instrument, warn};

use crate::types::{
    is_crypto_symbol, Account, Bar, NewOrder, Order, OrderSide, OrderStatus, OrderType, Position,
    PositionSide, TimeInForce, Timeframe,
};

use super::{Broker, OrderStatusFilter};

const DATA_BASE_URL: &str = "https://data.alpaca.markets";

/// Alpaca REST adapter. One instance per engine process; cheap to clone
/// (shares the underlying connection pool via `reqwest::Client`).
#[derive(Clone)]
pub struct AlpacaBroker {
    key_id: String,
    secret_key: String,
    trading_base_url: String,
    client: reqwest::Client,
}

impl AlpacaBroker {
    /// `paper` selects Alpaca's paper-trading endpoint over the live one.
    pub fn new(key_id: impl Into<String>, secret_key: impl Into<String>, paper: bool) -> Self {
        let key_id = key_id.into();
        let secret_key = secret_key.into();

        let mut default_headers = HeaderMap::new();
        if let Ok(val) = HeaderValue::from_str(&key_id) {
            default_headers.insert("APCA-API-KEY-ID", val);
        }
        if let Ok(val) = HeaderValue::from_str(&secret_key) {
            default_headers.insert("APCA-API-SECRET-KEY", val);
        }

        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        let trading_base_url = if paper {
            "https://paper-api.alpaca.markets".to_string()
        } else {
            "https://api.alpaca.markets".to_string()
        };

        debug!(
            base_url = %trading_base_url,
            "AlpacaBroker initialised"
        );

        Self {
            key_id,
            secret_key,
            trading_base_url,
            client,
        }
    }

    fn is_crypto(symbol: &str) -> bool {
        is_crypto_symbol(symbol)
    }

    fn alpaca_timeframe(tf: Timeframe) -> &'static str {
        match tf {
            Timeframe::M1 => "1Min",
            Timeframe::M5 => "5Min",
            Timeframe::M15 => "15Min",
            Timeframe::M30 => "30Min",
            Timeframe::H1 => "1Hour",
            Timeframe::H4 => "4Hour",
            Timeframe::D1 => "1Day",
            Timeframe::W1 => "1Week",
            Timeframe::MO1 => "1Month",
        }
    }

    async fn check_status(resp: reqwest::Response, what: &str) -> anyhow::Result<reqwest::Response> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            anyhow::bail!("Alpaca {what} returned {status} (auth): {body}");
        }
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            anyhow::bail!("Alpaca {what} returned {status} (transient): {body}");
        }
        anyhow::bail!("Alpaca {what} returned {status}: {body}");
    }

    // ------------------------------------------------------------------
    // Order request construction
    // ------------------------------------------------------------------

    fn build_order_body(order: &NewOrder) -> serde_json::Value {
        let mut body = serde_json::json!({
            "symbol": order.symbol,
            "qty": format!("{}", order.qty),
            "side": alpaca_side(order.side),
            "type": alpaca_order_type(order.order_type),
            "time_in_force": alpaca_tif(order.time_in_force),
        });

        if order.is_bracket() {
            body["order_class"] = serde_json::json!("bracket");
            body["type"] = serde_json::json!("market");
            if let Some(tp) = order.take_profit {
                body["take_profit"] = serde_json::json!({ "limit_price": crate::types::round2(tp) });
            }
            if let Some(sl) = order.stop_loss {
                body["stop_loss"] = serde_json::json!({ "stop_price": crate::types::round2(sl) });
            }
        }

        body
    }
}

fn alpaca_side(side: OrderSide) -> &'static str {
    match side {
        OrderSide::Buy => "buy",
        OrderSide::Sell => "sell",
    }
}

fn alpaca_order_type(t: OrderType) -> &'static str {
    match t {
        OrderType::Market => "market",
        OrderType::Limit => "limit",
        OrderType::Stop => "stop",
        OrderType::StopLimit => "stop_limit",
        OrderType::TrailingStop => "trailing_stop",
    }
}

fn alpaca_tif(tif: TimeInForce) -> &'static str {
    match tif {
        TimeInForce::Day => "day",
        TimeInForce::Gtc => "gtc",
    }
}

fn parse_order_type(s: &str) -> OrderType {
    match s {
        "limit" => OrderType::Limit,
        "stop" => OrderType::Stop,
        "stop_limit" => OrderType::StopLimit,
        "trailing_stop" => OrderType::TrailingStop,
        _ => OrderType::Market,
    }
}

fn parse_tif(s: &str) -> TimeInForce {
    match s {
        "gtc" => TimeInForce::Gtc,
        _ => TimeInForce::Day,
    }
}

fn parse_order_side(s: &str) -> OrderSide {
    match s {
        "sell" => OrderSide::Sell,
        _ => OrderSide::Buy,
    }
}

fn parse_order_status(s: &str) -> OrderStatus {
    match s {
        "filled" => OrderStatus::Filled,
        "partially_filled" => OrderStatus::PartiallyFilled,
        "canceled" | "expired" | "done_for_day" => OrderStatus::Canceled,
        "rejected" => OrderStatus::Rejected,
        "new" | "accepted" | "pending_new" | "replaced" | "calculated" | "stopped"
        | "pending_cancel" | "suspended" => OrderStatus::Submitted,
        _ => OrderStatus::Pending,
    }
}

// ---------------------------------------------------------------------------
// Raw Alpaca JSON shapes
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawAccount {
    id: String,
    equity: String,
    cash: String,
    buying_power: String,
    portfolio_value: String,
    #[serde(default = "default_currency")]
    currency: String,
    status: String,
}

fn default_currency() -> String {
    "USD".to_string()
}

impl RawAccount {
    fn into_account(self) -> anyhow::Result<Account> {
        Ok(Account {
            id: self.id,
            equity: self.equity.parse()?,
            cash: self.cash.parse()?,
            buying_power: self.buying_power.parse()?,
            portfolio_value: self.portfolio_value.parse()?,
            currency: self.currency,
            status: self.status,
        })
    }
}

#[derive(Debug, Deserialize)]
struct RawOrder {
    id: String,
    symbol: String,
    side: String,
    #[serde(rename = "type")]
    order_type: String,
    qty: Option<String>,
    time_in_force: String,
    status: String,
    #[serde(default)]
    filled_qty: Option<String>,
    filled_avg_price: Option<String>,
    limit_price: Option<String>,
    stop_price: Option<String>,
    created_at: DateTime<Utc>,
    filled_at: Option<DateTime<Utc>>,
}

impl RawOrder {
    fn into_order(self) -> anyhow::Result<Order> {
        Ok(Order {
            id: self.id,
            symbol: self.symbol,
            side: parse_order_side(&self.side),
            order_type: parse_order_type(&self.order_type),
            qty: self.qty.as_deref().unwrap_or("0").parse().unwrap_or(0.0),
            time_in_force: parse_tif(&self.time_in_force),
            status: parse_order_status(&self.status),
            filled_qty: self
                .filled_qty
                .as_deref()
                .and_then(|s| s.parse().ok())
                .unwrap_or(0.0),
            filled_avg_price: self.filled_avg_price.as_deref().and_then(|s| s.parse().ok()),
            limit_price: self.limit_price.as_deref().and_then(|s| s.parse().ok()),
            stop_price: self.stop_price.as_deref().and_then(|s| s.parse().ok()),
            take_profit_price: None,
            stop_loss_price: None,
            created_at: self.created_at,
            filled_at: self.filled_at,
        })
    }
}

#[derive(Debug, Deserialize)]
struct RawCloseResponse {
    #[serde(default)]
    body: Option<RawOrder>,
}

#[derive(Debug, Deserialize)]
struct RawPosition {
    symbol: String,
    qty: String,
    side: String,
    market_value: String,
    avg_entry_price: String,
    current_price: String,
    unrealized_pl: String,
    unrealized_plpc: String,
}

impl RawPosition {
    fn into_position(self) -> anyhow::Result<Position> {
        Ok(Position {
            symbol: self.symbol,
            qty: self.qty.parse()?,
            side: if self.side == "short" {
                PositionSide::Short
            } else {
                PositionSide::Long
            },
            avg_entry: self.avg_entry_price.parse()?,
            market_value: self.market_value.parse()?,
            current_price: self.current_price.parse()?,
            unrealized_pnl: self.unrealized_pl.parse()?,
            unrealized_pnl_pct: self.unrealized_plpc.parse()?,
        })
    }
}

#[derive(Debug, Deserialize)]
struct RawBar {
    t: DateTime<Utc>,
    o: f64,
    h: f64,
    l: f64,
    c: f64,
    v: f64,
}

impl From<RawBar> for Bar {
    fn from(b: RawBar) -> Self {
        Bar {
            timestamp: b.t,
            open: b.o,
            high: b.h,
            low: b.l,
            close: b.c,
            volume: b.v,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawClock {
    is_open: bool,
}

// ---------------------------------------------------------------------------
// Broker impl
// ---------------------------------------------------------------------------

#[async_trait]
impl Broker for AlpacaBroker {
    #[instrument(skip(self), name = "alpaca::get_account")]
    async fn get_account(&self) -> anyhow::Result<Account> {
        let url = format!("{}/v2/account", self.trading_base_url);
        let resp = self.client.get(&url).send().await?;
        let resp = Self::check_status(resp, "GET /v2/account").await?;
        let raw: RawAccount = resp.json().await?;
        raw.into_account()
    }

    #[instrument(skip(self, order), name = "alpaca::submit_order")]
    async fn submit_order(&self, order: NewOrder) -> anyhow::Result<Order> {
        let url = format!("{}/v2/orders", self.trading_base_url);
        let body = Self::build_order_body(&order);

        debug!(
            symbol = %order.symbol,
            side = %order.side,
            bracket = order.is_bracket(),
            "submitting order to Alpaca"
        );

        let resp = self.client.post(&url).json(&body).send().await?;
        let resp = Self::check_status(resp, "POST /v2/orders").await?;
        let raw: RawOrder = resp.json().await?;
        let mut parsed = raw.into_order()?;
        parsed.take_profit_price = order.take_profit;
        parsed.stop_loss_price = order.stop_loss;
        Ok(parsed)
    }

    #[instrument(skip(self), name = "alpaca::get_order")]
    async fn get_order(&self, order_id: &str) -> anyhow::Result<Order> {
        let url = format!("{}/v2/orders/{order_id}", self.trading_base_url);
        let resp = self.client.get(&url).send().await?;
        let resp = Self::check_status(resp, "GET /v2/orders/{id}").await?;
        let raw: RawOrder = resp.json().await?;
        raw.into_order()
    }

    #[instrument(skip(self), name = "alpaca::get_orders")]
    async fn get_orders(
        &self,
        status: Option<OrderStatusFilter>,
        limit: usize,
    ) -> anyhow::Result<Vec<Order>> {
        let status_param = match status {
            Some(OrderStatusFilter::Open) => "open",
            Some(OrderStatusFilter::Closed) => "closed",
            Some(OrderStatusFilter::All) => "all",
            None => "open",
        };
        let url = format!(
            "{}/v2/orders?status={status_param}&limit={limit}",
            self.trading_base_url
        );
        let resp = self.client.get(&url).send().await?;
        let resp = Self::check_status(resp, "GET /v2/orders").await?;
        let raw: Vec<RawOrder> = resp.json().await?;
        raw.into_iter().map(RawOrder::into_order).collect()
    }

    #[instrument(skip(self), name = "alpaca::cancel_order")]
    async fn cancel_order(&self, order_id: &str) -> anyhow::Result<()> {
        let url = format!("{}/v2/orders/{order_id}", self.trading_base_url);
        let resp = self.client.delete(&url).send().await?;
        Self::check_status(resp, "DELETE /v2/orders/{id}").await?;
        Ok(())
    }

    #[instrument(skip(self), name = "alpaca::cancel_all_orders")]
    async fn cancel_all_orders(&self) -> anyhow::Result<()> {
        let url = format!("{}/v2/orders", self.trading_base_url);
        let resp = self.client.delete(&url).send().await?;
        Self::check_status(resp, "DELETE /v2/orders").await?;
        Ok(())
    }

    #[instrument(skip(self), name = "alpaca::get_positions")]
    async fn get_positions(&self) -> anyhow::Result<Vec<Position>> {
        let url = format!("{}/v2/positions", self.trading_base_url);
        let resp = self.client.get(&url).send().await?;
        let resp = Self::check_status(resp, "GET /v2/positions").await?;
        let raw: Vec<RawPosition> = resp.json().await?;
        raw.into_iter().map(RawPosition::into_position).collect()
    }

    #[instrument(skip(self), name = "alpaca::get_position")]
    async fn get_position(&self, symbol: &str) -> anyhow::Result<Option<Position>> {
        let url = format!("{}/v2/positions/{symbol}", self.trading_base_url);
        let resp = self.client.get(&url).send().await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let resp = Self::check_status(resp, "GET /v2/positions/{symbol}").await?;
        let raw: RawPosition = resp.json().await?;
        Ok(Some(raw.into_position()?))
    }

    #[instrument(skip(self), name = "alpaca::close_position")]
    async fn close_position(&self, symbol: &str) -> anyhow::Result<Order> {
        let url = format!("{}/v2/positions/{symbol}", self.trading_base_url);
        let resp = self.client.delete(&url).send().await?;
        let resp = Self::check_status(resp, "DELETE /v2/positions/{symbol}").await?;
        let raw: RawOrder = resp.json().await?;
        raw.into_order()
    }

    #[instrument(skip(self), name = "alpaca::close_all_positions")]
    async fn close_all_positions(&self) -> anyhow::Result<Vec<Order>> {
        let url = format!(
            "{}/v2/positions?cancel_orders=true",
            self.trading_base_url
        );
        let resp = self.client.delete(&url).send().await?;
        let resp = Self::check_status(resp, "DELETE /v2/positions").await?;
        let raw: Vec<RawCloseResponse> = resp.json().await?;

        let mut orders = Vec::new();
        for entry in raw {
            if let Some(body) = entry.body {
                orders.push(body.into_order()?);
            } else {
                warn!("close_all_positions: entry missing order body, skipping");
            }
        }
        Ok(orders)
    }

    #[instrument(skip(self), name = "alpaca::get_bars")]
    async fn get_bars(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
        limit: Option<usize>,
    ) -> anyhow::Result<Vec<Bar>> {
        let tf = Self::alpaca_timeframe(timeframe);

        let mut query = vec![format!("timeframe={tf}")];
        if let Some(s) = start {
            query.push(format!("start={}", s.to_rfc3339()));
        }
        if let Some(e) = end {
            query.push(format!("end={}", e.to_rfc3339()));
        }
        if let Some(l) = limit {
            query.push(format!("limit={l}"));
        }

        let url = if Self::is_crypto(symbol) {
            query.push(format!("symbols={symbol}"));
            format!("{DATA_BASE_URL}/v1beta3/crypto/us/bars?{}", query.join("&"))
        } else {
            format!(
                "{DATA_BASE_URL}/v2/stocks/{symbol}/bars?{}",
                query.join("&")
            )
        };

        debug!(symbol, %timeframe, "fetching bars from Alpaca data API");
        let resp = self.client.get(&url).send().await?;
        let resp = Self::check_status(resp, "GET bars").await?;
        let body: serde_json::Value = resp.json().await?;

        let raw_bars = if Self::is_crypto(symbol) {
            body["bars"][symbol].clone()
        } else {
            body["bars"].clone()
        };

        let raw_bars: Vec<RawBar> = serde_json::from_value(raw_bars).unwrap_or_default();
        let mut bars: Vec<Bar> = raw_bars.into_iter().map(Bar::from).collect();
        bars.sort_by_key(|b| b.timestamp);
        bars.dedup_by_key(|b| b.timestamp);

        debug!(symbol, count = bars.len(), "bars fetched");
        Ok(bars)
    }

    #[instrument(skip(self), name = "alpaca::get_latest_price")]
    async fn get_latest_price(&self, symbol: &str) -> anyhow::Result<f64> {
        if Self::is_crypto(symbol) {
            let url = format!("{DATA_BASE_URL}/v1beta3/crypto/us/latest/quotes?symbols={symbol}");
            let resp = self.client.get(&url).send().await?;
            let resp = Self::check_status(resp, "GET crypto latest quote").await?;
            let body: serde_json::Value = resp.json().await?;

            let quote = &body["quotes"][symbol];
            let bid = quote["bp"].as_f64().unwrap_or(0.0);
            let ask = quote["ap"].as_f64().unwrap_or(0.0);

            if bid > 0.0 && ask > 0.0 {
                return Ok((bid + ask) / 2.0);
            }
            if bid > 0.0 {
                return Ok(bid);
            }
            if ask > 0.0 {
                return Ok(ask);
            }
            anyhow::bail!("UnavailableQuote: no valid bid/ask for {symbol}");
        }

        let url = format!("{DATA_BASE_URL}/v2/stocks/{symbol}/trades/latest");
        let resp = self.client.get(&url).send().await?;
        let resp = Self::check_status(resp, "GET latest trade").await?;
        let body: serde_json::Value = resp.json().await?;

        body["trade"]["p"]
            .as_f64()
            .ok_or_else(|| anyhow::anyhow!("UnavailableQuote: no latest trade for {symbol}"))
    }

    #[instrument(skip(self), name = "alpaca::is_market_open")]
    async fn is_market_open(&self) -> anyhow::Result<bool> {
        let url = format!("{}/v2/clock", self.trading_base_url);
        let resp = self.client.get(&url).send().await?;
        let resp = Self::check_status(resp, "GET /v2/clock").await?;
        let clock: RawClock = resp.json().await?;
        Ok(clock.is_open)
    }
}

impl std::fmt::Debug for AlpacaBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlpacaBroker")
            .field("key_id", &"<redacted>")
            .field("secret_key", &"<redacted>")
            .field("trading_base_url", &self.trading_base_url)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crypto_symbols_detected_for_routing() {
        assert!(AlpacaBroker::is_crypto("BTC/USD"));
        assert!(!AlpacaBroker::is_crypto("AAPL"));
    }

    #[test]
    fn timeframe_maps_to_alpaca_strings() {
        assert_eq!(AlpacaBroker::alpaca_timeframe(Timeframe::M1), "1Min");
        assert_eq!(AlpacaBroker::alpaca_timeframe(Timeframe::H1), "1Hour");
        assert_eq!(AlpacaBroker::alpaca_timeframe(Timeframe::D1), "1Day");
    }

    #[test]
    fn bracket_order_body_sets_order_class_and_rounds_prices() {
        let order = NewOrder::market("AAPL", OrderSide::Buy, 10.0)
            .with_bracket(Some(191.119), Some(179.991));
        let body = AlpacaBroker::build_order_body(&order);
        assert_eq!(body["order_class"], "bracket");
        assert_eq!(body["type"], "market");
        assert_eq!(body["take_profit"]["limit_price"], 191.12);
        assert_eq!(body["stop_loss"]["stop_price"], 179.99);
    }

    #[test]
    fn plain_order_body_has_no_order_class() {
        let order = NewOrder::market("AAPL", OrderSide::Sell, 5.0);
        let body = AlpacaBroker::build_order_body(&order);
        assert!(body.get("order_class").is_none());
        assert_eq!(body["side"], "sell");
        assert_eq!(body["time_in_force"], "day");
    }

    #[test]
    fn status_parsing_buckets_alpaca_enum() {
        assert_eq!(parse_order_status("filled"), OrderStatus::Filled);
        assert_eq!(parse_order_status("partially_filled"), OrderStatus::PartiallyFilled);
        assert_eq!(parse_order_status("canceled"), OrderStatus::Canceled);
        assert_eq!(parse_order_status("rejected"), OrderStatus::Rejected);
        assert_eq!(parse_order_status("new"), OrderStatus::Submitted);
    }
}
