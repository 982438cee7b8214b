// =============================================================================
// SqliteStore — concrete PersistencePort over sqlx's SQLite driver
// =============================================================================

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::sqlite::{SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use tracing::{info, instrument};

use crate::types::{
    OrderSide, OrderType, PerformanceSnapshot, Signal, StrategyRun, StrategyRunStatus,
    TimeInForce, TradeRecord, TradeStatus,
};

use super::{NewTradeAttempt, PersistencePort, TradeFilter};

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS trades (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    strategy_name   TEXT NOT NULL,
    symbol          TEXT NOT NULL,
    side            TEXT NOT NULL,
    qty             REAL NOT NULL,
    order_type      TEXT NOT NULL,
    time_in_force   TEXT NOT NULL,
    limit_price     REAL,
    stop_price      REAL,
    filled_avg_price REAL,
    filled_qty      REAL,
    status          TEXT NOT NULL,
    broker_order_id TEXT,
    signal          TEXT NOT NULL,
    realized_pnl    REAL,
    notes           TEXT,
    created_at      TEXT NOT NULL,
    submitted_at    TEXT,
    filled_at       TEXT
);
CREATE INDEX IF NOT EXISTS ix_trades_strategy_created ON trades(strategy_name, created_at);
CREATE INDEX IF NOT EXISTS ix_trades_symbol_created ON trades(symbol, created_at);
CREATE INDEX IF NOT EXISTS ix_trades_status_created ON trades(status, created_at);

CREATE TABLE IF NOT EXISTS strategy_runs (
    id                  INTEGER PRIMARY KEY AUTOINCREMENT,
    strategy_name       TEXT NOT NULL,
    status              TEXT NOT NULL,
    symbols_json        TEXT NOT NULL,
    timeframe           TEXT NOT NULL,
    parameters_json     TEXT NOT NULL,
    last_signal_json    TEXT,
    error_message       TEXT,
    started_at          TEXT NOT NULL,
    stopped_at           TEXT,
    total_trades        INTEGER NOT NULL DEFAULT 0,
    winning_trades       INTEGER NOT NULL DEFAULT 0,
    losing_trades        INTEGER NOT NULL DEFAULT 0,
    total_pnl            REAL NOT NULL DEFAULT 0.0
);
CREATE INDEX IF NOT EXISTS ix_runs_strategy_started ON strategy_runs(strategy_name, started_at);

CREATE TABLE IF NOT EXISTS performance_snapshots (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    strategy_name   TEXT,
    timestamp       TEXT NOT NULL,
    equity          REAL,
    cash            REAL,
    buying_power    REAL,
    total_pnl       REAL NOT NULL,
    daily_pnl       REAL NOT NULL,
    unrealized_pnl  REAL,
    total_trades    INTEGER NOT NULL,
    winning_trades  INTEGER NOT NULL,
    losing_trades   INTEGER NOT NULL,
    win_rate        REAL,
    sharpe          REAL,
    max_dd          REAL
);
CREATE INDEX IF NOT EXISTS ix_snapshots_strategy_ts ON performance_snapshots(strategy_name, timestamp);
"#;

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    #[instrument(skip_all, fields(url = %database_url))]
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;

        sqlx::query(SCHEMA_SQL).execute(&pool).await?;
        info!("SQLite store migrated and ready");
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn side_str(side: OrderSide) -> &'static str {
    match side {
        OrderSide::Buy => "buy",
        OrderSide::Sell => "sell",
    }
}

fn parse_side(s: &str) -> OrderSide {
    match s {
        "sell" => OrderSide::Sell,
        _ => OrderSide::Buy,
    }
}

fn order_type_str(t: OrderType) -> &'static str {
    match t {
        OrderType::Market => "market",
        OrderType::Limit => "limit",
        OrderType::Stop => "stop",
        OrderType::StopLimit => "stop_limit",
        OrderType::TrailingStop => "trailing_stop",
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

fn tif_str(tif: TimeInForce) -> &'static str {
    match tif {
        TimeInForce::Day => "day",
        TimeInForce::Gtc => "gtc",
    }
}

fn parse_tif(s: &str) -> TimeInForce {
    match s {
        "gtc" => TimeInForce::Gtc,
        _ => TimeInForce::Day,
    }
}

fn status_str(status: TradeStatus) -> &'static str {
    match status {
        TradeStatus::Pending => "pending",
        TradeStatus::Submitted => "submitted",
        TradeStatus::Filled => "filled",
        TradeStatus::PartiallyFilled => "partially_filled",
        TradeStatus::Canceled => "canceled",
        TradeStatus::Rejected => "rejected",
        TradeStatus::Error => "error",
    }
}

fn parse_status(s: &str) -> TradeStatus {
    match s {
        "submitted" => TradeStatus::Submitted,
        "filled" => TradeStatus::Filled,
        "partially_filled" => TradeStatus::PartiallyFilled,
        "canceled" => TradeStatus::Canceled,
        "rejected" => TradeStatus::Rejected,
        "error" => TradeStatus::Error,
        _ => TradeStatus::Pending,
    }
}

fn signal_str(signal: Signal) -> &'static str {
    match signal {
        Signal::Buy => "BUY",
        Signal::Sell => "SELL",
        Signal::Hold => "HOLD",
    }
}

fn parse_signal(s: &str) -> Signal {
    match s {
        "SELL" => Signal::Sell,
        "HOLD" => Signal::Hold,
        _ => Signal::Buy,
    }
}

fn run_status_str(status: StrategyRunStatus) -> &'static str {
    match status {
        StrategyRunStatus::Running => "running",
        StrategyRunStatus::Stopped => "stopped",
        StrategyRunStatus::Error => "error",
    }
}

fn parse_run_status(s: &str) -> StrategyRunStatus {
    match s {
        "stopped" => StrategyRunStatus::Stopped,
        "error" => StrategyRunStatus::Error,
        _ => StrategyRunStatus::Running,
    }
}

fn push_trade_filter_clauses(sql: &mut String, filter: &TradeFilter) {
    if filter.strategy_name.is_some() {
        sql.push_str(" AND strategy_name = ?");
    }
    if filter.symbol.is_some() {
        sql.push_str(" AND symbol = ?");
    }
    if filter.side.is_some() {
        sql.push_str(" AND side = ?");
    }
    if filter.status.is_some() {
        sql.push_str(" AND status = ?");
    }
    if filter.since.is_some() {
        sql.push_str(" AND created_at >= ?");
    }
    if filter.until.is_some() {
        sql.push_str(" AND created_at <= ?");
    }
}

fn bind_trade_filter<'q>(
    mut query: sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>,
    filter: &'q TradeFilter,
) -> sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>> {
    if let Some(s) = &filter.strategy_name {
        query = query.bind(s);
    }
    if let Some(s) = &filter.symbol {
        query = query.bind(s);
    }
    if let Some(s) = filter.side {
        query = query.bind(side_str(s));
    }
    if let Some(s) = filter.status {
        query = query.bind(status_str(s));
    }
    if let Some(t) = filter.since {
        query = query.bind(t.to_rfc3339());
    }
    if let Some(t) = filter.until {
        query = query.bind(t.to_rfc3339());
    }
    query
}

fn row_to_trade(row: SqliteRow) -> anyhow::Result<TradeRecord> {
    Ok(TradeRecord {
        id: row.try_get("id")?,
        strategy_name: row.try_get("strategy_name")?,
        symbol: row.try_get("symbol")?,
        side: parse_side(row.try_get::<String, _>("side")?.as_str()),
        qty: row.try_get("qty")?,
        order_type: parse_order_type(row.try_get::<String, _>("order_type")?.as_str()),
        time_in_force: parse_tif(row.try_get::<String, _>("time_in_force")?.as_str()),
        limit_price: row.try_get("limit_price")?,
        stop_price: row.try_get("stop_price")?,
        filled_avg_price: row.try_get("filled_avg_price")?,
        filled_qty: row.try_get("filled_qty")?,
        status: parse_status(row.try_get::<String, _>("status")?.as_str()),
        broker_order_id: row.try_get("broker_order_id")?,
        signal: parse_signal(row.try_get::<String, _>("signal")?.as_str()),
        realized_pnl: row.try_get("realized_pnl")?,
        notes: row.try_get("notes")?,
        created_at: row.try_get::<String, _>("created_at")?.parse()?,
        submitted_at: row
            .try_get::<Option<String>, _>("submitted_at")?
            .map(|s| s.parse())
            .transpose()?,
        filled_at: row
            .try_get::<Option<String>, _>("filled_at")?
            .map(|s| s.parse())
            .transpose()?,
    })
}

fn row_to_run(row: SqliteRow) -> anyhow::Result<StrategyRun> {
    let symbols_json: String = row.try_get("symbols_json")?;
    let parameters_json: String = row.try_get("parameters_json")?;
    let last_signal_json: Option<String> = row.try_get("last_signal_json")?;

    Ok(StrategyRun {
        id: row.try_get("id")?,
        strategy_name: row.try_get("strategy_name")?,
        status: parse_run_status(row.try_get::<String, _>("status")?.as_str()),
        symbols: serde_json::from_str(&symbols_json)?,
        timeframe: crate::types::Timeframe::parse(row.try_get::<String, _>("timeframe")?.as_str())
            .ok_or_else(|| anyhow::anyhow!("invalid stored timeframe"))?,
        parameters_json: serde_json::from_str(&parameters_json)?,
        last_signal_json: last_signal_json.map(|s| serde_json::from_str(&s)).transpose()?,
        error_message: row.try_get("error_message")?,
        started_at: row.try_get::<String, _>("started_at")?.parse()?,
        stopped_at: row
            .try_get::<Option<String>, _>("stopped_at")?
            .map(|s| s.parse())
            .transpose()?,
        total_trades: row.try_get::<i64, _>("total_trades")? as u32,
        winning_trades: row.try_get::<i64, _>("winning_trades")? as u32,
        losing_trades: row.try_get::<i64, _>("losing_trades")? as u32,
        total_pnl: row.try_get("total_pnl")?,
    })
}

fn row_to_snapshot(row: SqliteRow) -> anyhow::Result<PerformanceSnapshot> {
    Ok(PerformanceSnapshot {
        strategy_name: row.try_get("strategy_name")?,
        timestamp: row.try_get::<String, _>("timestamp")?.parse()?,
        equity: row.try_get("equity")?,
        cash: row.try_get("cash")?,
        buying_power: row.try_get("buying_power")?,
        total_pnl: row.try_get("total_pnl")?,
        daily_pnl: row.try_get("daily_pnl")?,
        unrealized_pnl: row.try_get("unrealized_pnl")?,
        total_trades: row.try_get::<i64, _>("total_trades")? as u32,
        winning_trades: row.try_get::<i64, _>("winning_trades")? as u32,
        losing_trades: row.try_get::<i64, _>("losing_trades")? as u32,
        win_rate: row.try_get("win_rate")?,
        sharpe: row.try_get("sharpe")?,
        max_dd: row.try_get("max_dd")?,
    })
}

#[async_trait]
impl PersistencePort for SqliteStore {
    async fn record_trade_attempt(&self, fields: NewTradeAttempt) -> anyhow::Result<i64> {
        let created_at = Utc::now().to_rfc3339();
        let result = sqlx::query(
            "INSERT INTO trades (strategy_name, symbol, side, qty, order_type, time_in_force, \
             limit_price, stop_price, status, broker_order_id, signal, notes, created_at) \
             VALUES (?,?,?,?,?,?,?,?,?,?,?,?,?)",
        )
        .bind(&fields.strategy_name)
        .bind(&fields.symbol)
        .bind(side_str(fields.side))
        .bind(fields.qty)
        .bind(order_type_str(fields.order_type))
        .bind(tif_str(fields.time_in_force))
        .bind(fields.limit_price)
        .bind(fields.stop_price)
        .bind(status_str(fields.status))
        .bind(&fields.broker_order_id)
        .bind(signal_str(fields.signal))
        .bind(&fields.notes)
        .bind(&created_at)
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    async fn open_strategy_run(
        &self,
        strategy: &str,
        symbols: &[String],
        timeframe: crate::types::Timeframe,
        parameters_json: Value,
        started_at: DateTime<Utc>,
    ) -> anyhow::Result<i64> {
        let symbols_json = serde_json::to_string(symbols)?;
        let parameters_json = serde_json::to_string(&parameters_json)?;

        let result = sqlx::query(
            "INSERT INTO strategy_runs (strategy_name, status, symbols_json, timeframe, \
             parameters_json, started_at, total_trades, winning_trades, losing_trades, total_pnl) \
             VALUES (?,'running',?,?,?,?,0,0,0,0.0)",
        )
        .bind(strategy)
        .bind(&symbols_json)
        .bind(timeframe.as_str())
        .bind(&parameters_json)
        .bind(started_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    async fn mark_strategy_run_stopped(&self, id: i64, stopped_at: DateTime<Utc>) -> anyhow::Result<()> {
        sqlx::query("UPDATE strategy_runs SET status = 'stopped', stopped_at = ? WHERE id = ?")
            .bind(stopped_at.to_rfc3339())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn mark_strategy_run_errored(
        &self,
        id: i64,
        message: &str,
        stopped_at: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        sqlx::query(
            "UPDATE strategy_runs SET status = 'error', error_message = ?, stopped_at = ? WHERE id = ?",
        )
        .bind(message)
        .bind(stopped_at.to_rfc3339())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_strategy_run_signals(
        &self,
        id: i64,
        last_signal_json: Value,
        trade_count_since: u32,
    ) -> anyhow::Result<()> {
        let last_signal_json = serde_json::to_string(&last_signal_json)?;
        sqlx::query("UPDATE strategy_runs SET last_signal_json = ?, total_trades = ? WHERE id = ?")
            .bind(&last_signal_json)
            .bind(trade_count_since as i64)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn append_performance_snapshot(&self, snapshot: &PerformanceSnapshot) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO performance_snapshots (strategy_name, timestamp, equity, cash, \
             buying_power, total_pnl, daily_pnl, unrealized_pnl, total_trades, winning_trades, \
             losing_trades, win_rate, sharpe, max_dd) VALUES (?,?,?,?,?,?,?,?,?,?,?,?,?,?)",
        )
        .bind(&snapshot.strategy_name)
        .bind(snapshot.timestamp.to_rfc3339())
        .bind(snapshot.equity)
        .bind(snapshot.cash)
        .bind(snapshot.buying_power)
        .bind(snapshot.total_pnl)
        .bind(snapshot.daily_pnl)
        .bind(snapshot.unrealized_pnl)
        .bind(snapshot.total_trades as i64)
        .bind(snapshot.winning_trades as i64)
        .bind(snapshot.losing_trades as i64)
        .bind(snapshot.win_rate)
        .bind(snapshot.sharpe)
        .bind(snapshot.max_dd)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_trades(&self, filter: TradeFilter) -> anyhow::Result<Vec<TradeRecord>> {
        let mut sql = String::from("SELECT * FROM trades WHERE 1=1");
        push_trade_filter_clauses(&mut sql, &filter);
        sql.push_str(" ORDER BY created_at DESC LIMIT ? OFFSET ?");

        let mut query = sqlx::query(&sql);
        query = bind_trade_filter(query, &filter);
        query = query.bind(filter.limit.unwrap_or(100) as i64);
        query = query.bind(filter.offset.unwrap_or(0) as i64);

        let rows = query.fetch_all(&self.pool).await?;
        rows.into_iter().map(row_to_trade).collect()
    }

    async fn count_trades(&self, filter: TradeFilter) -> anyhow::Result<u64> {
        let mut sql = String::from("SELECT COUNT(*) AS n FROM trades WHERE 1=1");
        push_trade_filter_clauses(&mut sql, &filter);

        let mut query = sqlx::query(&sql);
        query = bind_trade_filter(query, &filter);

        let row = query.fetch_one(&self.pool).await?;
        Ok(row.try_get::<i64, _>("n")? as u64)
    }

    async fn get_trade(&self, id: i64) -> anyhow::Result<Option<TradeRecord>> {
        let row = sqlx::query("SELECT * FROM trades WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(row_to_trade).transpose()
    }

    async fn list_strategy_runs(&self, strategy: Option<&str>) -> anyhow::Result<Vec<StrategyRun>> {
        let rows = if let Some(name) = strategy {
            sqlx::query("SELECT * FROM strategy_runs WHERE strategy_name = ? ORDER BY started_at DESC")
                .bind(name)
                .fetch_all(&self.pool)
                .await?
        } else {
            sqlx::query("SELECT * FROM strategy_runs ORDER BY started_at DESC")
                .fetch_all(&self.pool)
                .await?
        };
        rows.into_iter().map(row_to_run).collect()
    }

    async fn latest_performance_snapshot(
        &self,
        strategy: Option<&str>,
    ) -> anyhow::Result<Option<PerformanceSnapshot>> {
        let row = if let Some(name) = strategy {
            sqlx::query(
                "SELECT * FROM performance_snapshots WHERE strategy_name = ? ORDER BY timestamp DESC LIMIT 1",
            )
            .bind(name)
            .fetch_optional(&self.pool)
            .await?
        } else {
            sqlx::query(
                "SELECT * FROM performance_snapshots WHERE strategy_name IS NULL ORDER BY timestamp DESC LIMIT 1",
            )
            .fetch_optional(&self.pool)
            .await?
        };
        row.map(row_to_snapshot).transpose()
    }

    async fn list_performance_snapshots(
        &self,
        strategy: Option<&str>,
        limit: usize,
    ) -> anyhow::Result<Vec<PerformanceSnapshot>> {
        let rows = if let Some(name) = strategy {
            sqlx::query(
                "SELECT * FROM performance_snapshots WHERE strategy_name = ? \
                 ORDER BY timestamp ASC LIMIT ?",
            )
            .bind(name)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?
        } else {
            sqlx::query(
                "SELECT * FROM performance_snapshots WHERE strategy_name IS NULL \
                 ORDER BY timestamp ASC LIMIT ?",
            )
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?
        };
        rows.into_iter().map(row_to_snapshot).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::OrderType;

    async fn memory_store() -> SqliteStore {
        SqliteStore::connect("sqlite::memory:").await.unwrap()
    }

    #[tokio::test]
    async fn record_and_fetch_trade_round_trips() {
        let store = memory_store().await;
        let id = store
            .record_trade_attempt(NewTradeAttempt {
                strategy_name: "sma_crossover".to_string(),
                symbol: "AAPL".to_string(),
                side: OrderSide::Buy,
                qty: 10.0,
                order_type: OrderType::Market,
                time_in_force: TimeInForce::Day,
                limit_price: None,
                stop_price: None,
                status: TradeStatus::Submitted,
                broker_order_id: Some("abc123".to_string()),
                signal: Signal::Buy,
                notes: None,
            })
            .await
            .unwrap();

        let fetched = store.get_trade(id).await.unwrap().unwrap();
        assert_eq!(fetched.symbol, "AAPL");
        assert_eq!(fetched.side, OrderSide::Buy);
        assert_eq!(fetched.status, TradeStatus::Submitted);
    }

    #[tokio::test]
    async fn strategy_run_lifecycle_round_trips() {
        let store = memory_store().await;
        let id = store
            .open_strategy_run(
                "rsi_strategy",
                &["AAPL".to_string()],
                crate::types::Timeframe::D1,
                serde_json::json!({"rsi_period": 14}),
                Utc::now(),
            )
            .await
            .unwrap();

        store
            .update_strategy_run_signals(id, serde_json::json!({"AAPL": "HOLD"}), 2)
            .await
            .unwrap();
        store.mark_strategy_run_stopped(id, Utc::now()).await.unwrap();

        let runs = store.list_strategy_runs(Some("rsi_strategy")).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, StrategyRunStatus::Stopped);
        assert_eq!(runs[0].total_trades, 2);
    }

    #[tokio::test]
    async fn list_trades_filters_by_status() {
        let store = memory_store().await;
        for status in [TradeStatus::Filled, TradeStatus::Rejected] {
            store
                .record_trade_attempt(NewTradeAttempt {
                    strategy_name: "sma_crossover".to_string(),
                    symbol: "MSFT".to_string(),
                    side: OrderSide::Buy,
                    qty: 1.0,
                    order_type: OrderType::Market,
                    time_in_force: TimeInForce::Day,
                    limit_price: None,
                    stop_price: None,
                    status,
                    broker_order_id: None,
                    signal: Signal::Buy,
                    notes: None,
                })
                .await
                .unwrap();
        }

        let rejected = store
            .list_trades(TradeFilter {
                status: Some(TradeStatus::Rejected),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(rejected.len(), 1);
        assert_eq!(rejected[0].status, TradeStatus::Rejected);
    }
}
