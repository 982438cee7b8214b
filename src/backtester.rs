// =============================================================================
// Backtester — deterministic bar-level strategy replay
// =============================================================================
//
// Reuses the same `Strategy` contract as the live engine, so a backtest is
// representative of what the engine would have done. Signals computed while
// viewing bars up to `i` execute at OPEN of bar `i+1` — no look-ahead. Equity
// is marked to CLOSE at every bar. The strategy instance should come from
// `StrategyRegistry::create_strategy` (a fresh, unshared instance) rather
// than the live singleton pool.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::market_data_service::{DataSource, MarketDataService};
use crate::strategy::Strategy;
use crate::types::{round2, Bar, Signal, Timeframe};

const PERIOD_KEYWORDS: &[&str] =
    &["period", "length", "window", "slow", "fast", "long", "short", "signal"];
const TRADING_DAYS_PER_YEAR: f64 = 252.0;

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct BacktestConfig {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub initial_capital: f64,
    pub commission_per_trade: f64,
    pub position_size_pct: f64,
    pub max_positions: usize,
    pub allow_short: bool,
    /// Overrides the strategy's own timeframe when set.
    pub timeframe: Option<Timeframe>,
}

impl Default for BacktestConfig {
    fn default() -> Self {
        Self {
            start: Utc::now() - chrono::Duration::days(365),
            end: Utc::now(),
            initial_capital: 100_000.0,
            commission_per_trade: 0.0,
            position_size_pct: 0.10,
            max_positions: 10,
            allow_short: false,
            timeframe: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Trades & positions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeSide {
    Buy,
    Sell,
}

#[derive(Debug, Clone, Serialize)]
pub struct BacktestTrade {
    pub symbol: String,
    pub side: TradeSide,
    pub qty: f64,
    pub entry_price: f64,
    pub entry_date: DateTime<Utc>,
    pub exit_price: f64,
    pub exit_date: DateTime<Utc>,
    pub commission: f64,
    pub pnl: f64,
    pub pnl_pct: f64,
    pub bars_held: usize,
}

#[derive(Debug, Clone)]
struct OpenPosition {
    side: TradeSide,
    qty: f64,
    entry_price: f64,
    entry_date: DateTime<Utc>,
    entry_bar_idx: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct SignalLogEntry {
    pub bar_idx: usize,
    pub timestamp: DateTime<Utc>,
    pub signals: HashMap<String, Signal>,
}

// ---------------------------------------------------------------------------
// Metrics
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct BacktestMetrics {
    pub initial_capital: f64,
    pub final_equity: f64,
    pub total_return_pct: f64,
    pub annualized_return_pct: f64,

    pub sharpe_ratio: f64,
    pub max_drawdown_pct: f64,
    pub annual_volatility_pct: f64,

    pub total_trades: usize,
    pub winning_trades: usize,
    pub losing_trades: usize,
    pub win_rate_pct: f64,
    pub profit_factor: f64,

    pub avg_trade_pnl: f64,
    pub avg_winner: f64,
    pub avg_loser: f64,
    pub best_trade: f64,
    pub worst_trade: f64,
    pub gross_profit: f64,
    pub gross_loss: f64,
    pub total_commissions: f64,

    pub avg_bars_held: f64,
    pub max_win_streak: u32,
    pub max_loss_streak: u32,

    pub trading_days: usize,
    pub trading_years: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct BacktestResult {
    pub equity_curve: Vec<(DateTime<Utc>, f64)>,
    pub trades: Vec<BacktestTrade>,
    pub signals_log: Vec<SignalLogEntry>,
    pub metrics: BacktestMetrics,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct Backtester {
    market_data: std::sync::Arc<MarketDataService>,
    cash: f64,
    positions: HashMap<String, OpenPosition>,
    closed_trades: Vec<BacktestTrade>,
    signals_log: Vec<SignalLogEntry>,
    equity_history: Vec<(DateTime<Utc>, f64)>,
}

impl Backtester {
    pub fn new(market_data: std::sync::Arc<MarketDataService>) -> Self {
        Self {
            market_data,
            cash: 0.0,
            positions: HashMap::new(),
            closed_trades: Vec::new(),
            signals_log: Vec::new(),
            equity_history: Vec::new(),
        }
    }

    pub async fn run(
        &mut self,
        mut strategy: Box<dyn Strategy>,
        config: BacktestConfig,
    ) -> anyhow::Result<BacktestResult> {
        let timeframe = config.timeframe.unwrap_or_else(|| strategy.timeframe());
        let symbols = strategy.symbols().to_vec();

        info!(
            strategy = strategy.name(),
            ?symbols,
            %timeframe,
            start = %config.start,
            end = %config.end,
            capital = config.initial_capital,
            "backtest start"
        );

        let data = self
            .market_data
            .get_historical_data(&symbols, timeframe, Some(config.start), Some(config.end), DataSource::Auto)
            .await;

        if data.is_empty() {
            anyhow::bail!("no historical data available for any symbol; download bars first");
        }

        let mut timeline: Vec<DateTime<Utc>> = data
            .values()
            .flat_map(|bars| bars.iter().map(|b| b.timestamp))
            .collect();
        timeline.sort();
        timeline.dedup();

        if timeline.len() < 2 {
            anyhow::bail!("insufficient data: only {} bars, need at least 2", timeline.len());
        }
        info!(bars = timeline.len(), first = %timeline[0], last = %timeline[timeline.len() - 1], "timeline built");

        self.cash = config.initial_capital;
        self.positions.clear();
        self.closed_trades.clear();
        self.signals_log.clear();
        self.equity_history.clear();

        strategy.start().await;

        let lookback = Self::estimate_lookback(&strategy.get_parameters());
        info!(lookback, "lookback estimated");

        let mut pending_signals: HashMap<String, Signal> = HashMap::new();

        for (i, &current_time) in timeline.iter().enumerate() {
            if !pending_signals.is_empty() {
                self.execute_signals(&pending_signals, &data, current_time, i, &config);
                pending_signals.clear();
            }

            let equity = self.calculate_equity(&data, current_time);
            self.equity_history.push((current_time, equity));

            if i < lookback {
                continue;
            }

            let window = Self::build_data_window(&data, current_time);
            if window.is_empty() {
                continue;
            }

            let signals = match strategy.run(&window).await {
                Ok(signals) => signals,
                Err(e) => {
                    warn!(bar = i, timestamp = %current_time, error = %e, "strategy error during backtest");
                    strategy.state_mut().status = crate::strategy::StrategyStatus::Running;
                    continue;
                }
            };

            let active: HashMap<String, Signal> =
                signals.into_iter().filter(|(_, s)| s.is_actionable()).collect();

            if !active.is_empty() {
                self.signals_log.push(SignalLogEntry {
                    bar_idx: i,
                    timestamp: current_time,
                    signals: active.clone(),
                });
            }

            pending_signals = active;
        }

        let last_idx = timeline.len() - 1;
        let last_time = timeline[last_idx];
        self.close_all_positions(&data, last_time, last_idx, &config);

        let final_equity = self.calculate_equity(&data, last_time);
        self.equity_history.push((last_time, final_equity));

        strategy.stop().await;

        dedup_equity_curve(&mut self.equity_history);
        let metrics = Self::calculate_metrics(&self.equity_history, &self.closed_trades);

        info!(
            return_pct = metrics.total_return_pct,
            sharpe = metrics.sharpe_ratio,
            trades = metrics.total_trades,
            win_rate = metrics.win_rate_pct,
            "backtest end"
        );

        Ok(BacktestResult {
            equity_curve: self.equity_history.clone(),
            trades: self.closed_trades.clone(),
            signals_log: self.signals_log.clone(),
            metrics,
        })
    }

    // ------------------------------------------------------------------
    // Signal execution
    // ------------------------------------------------------------------

    fn execute_signals(
        &mut self,
        signals: &HashMap<String, Signal>,
        data: &HashMap<String, Vec<Bar>>,
        current_time: DateTime<Utc>,
        bar_idx: usize,
        config: &BacktestConfig,
    ) {
        for (symbol, signal) in signals {
            let Some(bars) = data.get(symbol) else { continue };
            let Some(bar) = bar_at_or_before(bars, current_time) else { continue };
            let exec_price = bar.open;

            match signal {
                Signal::Buy => self.open_long(symbol, exec_price, current_time, bar_idx, config),
                Signal::Sell => {
                    if self.positions.contains_key(symbol) {
                        self.close_position(symbol, exec_price, current_time, bar_idx, config);
                    } else if config.allow_short {
                        self.open_short(symbol, exec_price, current_time, bar_idx, config);
                    }
                }
                Signal::Hold => {}
            }
        }
    }

    fn open_long(
        &mut self,
        symbol: &str,
        price: f64,
        time: DateTime<Utc>,
        bar_idx: usize,
        config: &BacktestConfig,
    ) {
        if self.positions.contains_key(symbol) {
            return;
        }
        if self.positions.len() >= config.max_positions {
            debug!(symbol, max = config.max_positions, "max positions reached, ignoring BUY");
            return;
        }

        let equity = self.cash + self.positions.values().map(|p| p.qty * price).sum::<f64>();
        let position_value = equity * config.position_size_pct;
        let qty = position_value / price;

        if qty <= 0.0 || position_value > self.cash {
            debug!(symbol, "insufficient capital for BUY");
            return;
        }

        let cost = qty * price + config.commission_per_trade;
        self.cash -= cost;

        self.positions.insert(
            symbol.to_string(),
            OpenPosition { side: TradeSide::Buy, qty, entry_price: price, entry_date: time, entry_bar_idx: bar_idx },
        );
        debug!(symbol, qty, price, cost, "opened long");
    }

    fn open_short(
        &mut self,
        symbol: &str,
        price: f64,
        time: DateTime<Utc>,
        bar_idx: usize,
        config: &BacktestConfig,
    ) {
        if self.positions.contains_key(symbol) || self.positions.len() >= config.max_positions {
            return;
        }

        let equity = self.cash + self.positions.values().map(|p| p.qty * price).sum::<f64>();
        let position_value = equity * config.position_size_pct;
        let qty = position_value / price;
        if qty <= 0.0 {
            return;
        }

        let proceeds = qty * price - config.commission_per_trade;
        self.cash += proceeds;

        self.positions.insert(
            symbol.to_string(),
            OpenPosition { side: TradeSide::Sell, qty, entry_price: price, entry_date: time, entry_bar_idx: bar_idx },
        );
        debug!(symbol, qty, price, "opened short");
    }

    fn close_position(
        &mut self,
        symbol: &str,
        price: f64,
        time: DateTime<Utc>,
        bar_idx: usize,
        config: &BacktestConfig,
    ) {
        let Some(pos) = self.positions.remove(symbol) else { return };
        let commission = config.commission_per_trade;

        let (pnl, pnl_pct) = match pos.side {
            TradeSide::Buy => {
                let proceeds = pos.qty * price - commission;
                self.cash += proceeds;
                (
                    (price - pos.entry_price) * pos.qty - commission * 2.0,
                    (price - pos.entry_price) / pos.entry_price,
                )
            }
            TradeSide::Sell => {
                let cost = pos.qty * price + commission;
                self.cash -= cost;
                (
                    (pos.entry_price - price) * pos.qty - commission * 2.0,
                    (pos.entry_price - price) / pos.entry_price,
                )
            }
        };

        debug!(symbol, side = ?pos.side, qty = pos.qty, price, pnl, pnl_pct, "closed position");

        self.closed_trades.push(BacktestTrade {
            symbol: symbol.to_string(),
            side: pos.side,
            qty: pos.qty,
            entry_price: pos.entry_price,
            entry_date: pos.entry_date,
            exit_price: price,
            exit_date: time,
            commission: commission * 2.0,
            pnl,
            pnl_pct,
            bars_held: bar_idx.saturating_sub(pos.entry_bar_idx),
        });
    }

    fn close_all_positions(
        &mut self,
        data: &HashMap<String, Vec<Bar>>,
        current_time: DateTime<Utc>,
        bar_idx: usize,
        config: &BacktestConfig,
    ) {
        let symbols: Vec<String> = self.positions.keys().cloned().collect();
        for symbol in symbols {
            if let Some(bars) = data.get(&symbol) {
                if let Some(bar) = bar_at_or_before(bars, current_time) {
                    self.close_position(&symbol, bar.close, current_time, bar_idx, config);
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Equity & data window
    // ------------------------------------------------------------------

    fn calculate_equity(&self, data: &HashMap<String, Vec<Bar>>, current_time: DateTime<Utc>) -> f64 {
        let mut equity = self.cash;
        for (symbol, pos) in &self.positions {
            let price = data
                .get(symbol)
                .and_then(|bars| bar_at_or_before(bars, current_time))
                .map(|b| b.close)
                .unwrap_or(pos.entry_price);
            equity += pos.qty * price;
        }
        equity
    }

    fn build_data_window(data: &HashMap<String, Vec<Bar>>, current_time: DateTime<Utc>) -> HashMap<String, Vec<Bar>> {
        let mut window = HashMap::new();
        for (symbol, bars) in data {
            let slice: Vec<Bar> = bars.iter().filter(|b| b.timestamp <= current_time).cloned().collect();
            if !slice.is_empty() {
                window.insert(symbol.clone(), slice);
            }
        }
        window
    }

    /// Max of any numeric parameter whose key looks like a period, times
    /// 1.5 plus a 5-bar margin. Defaults to 1 (i.e. a 6-bar lookback) if no
    /// period-shaped parameter is found.
    fn estimate_lookback(params: &serde_json::Value) -> usize {
        let mut lookback: f64 = 1.0;
        if let Some(obj) = params.as_object() {
            for (key, value) in obj {
                let Some(n) = value.as_f64() else { continue };
                let key_lower = key.to_lowercase();
                if PERIOD_KEYWORDS.iter().any(|kw| key_lower.contains(kw)) {
                    lookback = lookback.max(n);
                }
            }
        }
        (lookback * 1.5) as usize + 5
    }

    // ------------------------------------------------------------------
    // Metrics
    // ------------------------------------------------------------------

    fn calculate_metrics(equity_curve: &[(DateTime<Utc>, f64)], trades: &[BacktestTrade]) -> BacktestMetrics {
        let initial = equity_curve.first().map(|(_, e)| *e).unwrap_or(0.0);
        let final_equity = equity_curve.last().map(|(_, e)| *e).unwrap_or(0.0);

        let total_return = if initial != 0.0 { (final_equity - initial) / initial } else { 0.0 };

        let daily_returns = pct_change(equity_curve);

        let trading_years = if equity_curve.len() > 1 {
            let total_days = (equity_curve.last().unwrap().0 - equity_curve.first().unwrap().0).num_days() as f64;
            (total_days / 365.25).max(1.0 / 365.25)
        } else {
            1.0 / 365.25
        };

        let annualized_return =
            if total_return > -1.0 { (1.0 + total_return).powf(1.0 / trading_years) - 1.0 } else { -1.0 };

        let (daily_vol, annual_vol) = if daily_returns.len() > 1 {
            let vol = stddev(&daily_returns);
            (vol, vol * TRADING_DAYS_PER_YEAR.sqrt())
        } else {
            (0.0, 0.0)
        };

        let sharpe = if daily_vol > 0.0 && daily_returns.len() > 1 {
            (mean(&daily_returns) / daily_vol) * TRADING_DAYS_PER_YEAR.sqrt()
        } else {
            0.0
        };

        let max_dd = max_drawdown(equity_curve);

        let pnls: Vec<f64> = trades.iter().map(|t| t.pnl).collect();
        let winners: Vec<f64> = pnls.iter().copied().filter(|p| *p > 0.0).collect();
        let losers: Vec<f64> = pnls.iter().copied().filter(|p| *p <= 0.0).collect();

        let total_trades = trades.len();
        let winning_trades = winners.len();
        let losing_trades = losers.len();
        let win_rate = if total_trades > 0 { winning_trades as f64 / total_trades as f64 * 100.0 } else { 0.0 };

        let gross_profit: f64 = winners.iter().sum();
        let gross_loss: f64 = losers.iter().sum::<f64>().abs();
        let profit_factor = if gross_loss > 0.0 {
            gross_profit / gross_loss
        } else if gross_profit > 0.0 {
            f64::INFINITY
        } else {
            0.0
        };

        let avg_trade_pnl = mean(&pnls);
        let avg_winner = mean(&winners);
        let avg_loser = mean(&losers);
        let avg_bars_held =
            if trades.is_empty() { 0.0 } else { trades.iter().map(|t| t.bars_held as f64).sum::<f64>() / total_trades as f64 };
        let total_commissions: f64 = trades.iter().map(|t| t.commission).sum();

        let best_trade = pnls.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let worst_trade = pnls.iter().copied().fold(f64::INFINITY, f64::min);
        let (max_win_streak, max_loss_streak) = streaks(&pnls);

        BacktestMetrics {
            initial_capital: initial,
            final_equity,
            total_return_pct: round2(total_return * 100.0),
            annualized_return_pct: round2(annualized_return * 100.0),
            sharpe_ratio: round3(sharpe),
            max_drawdown_pct: round2(max_dd * 100.0),
            annual_volatility_pct: round2(annual_vol * 100.0),
            total_trades,
            winning_trades,
            losing_trades,
            win_rate_pct: (win_rate * 10.0).round() / 10.0,
            profit_factor: round3(profit_factor),
            avg_trade_pnl: round2(avg_trade_pnl),
            avg_winner: round2(avg_winner),
            avg_loser: round2(avg_loser),
            best_trade: round2(if pnls.is_empty() { 0.0 } else { best_trade }),
            worst_trade: round2(if pnls.is_empty() { 0.0 } else { worst_trade }),
            gross_profit: round2(gross_profit),
            gross_loss: round2(gross_loss),
            total_commissions: round2(total_commissions),
            avg_bars_held: (avg_bars_held * 10.0).round() / 10.0,
            max_win_streak,
            max_loss_streak,
            trading_days: equity_curve.len(),
            trading_years: round2(trading_years),
        }
    }
}

fn bar_at_or_before(bars: &[Bar], timestamp: DateTime<Utc>) -> Option<&Bar> {
    bars.iter().filter(|b| b.timestamp <= timestamp).last()
}

/// Keeps the last value for each timestamp, preserving chronological order.
fn dedup_equity_curve(curve: &mut Vec<(DateTime<Utc>, f64)>) {
    let mut deduped: Vec<(DateTime<Utc>, f64)> = Vec::with_capacity(curve.len());
    for &(t, e) in curve.iter() {
        if deduped.last().is_some_and(|(last_t, _)| *last_t == t) {
            deduped.last_mut().unwrap().1 = e;
        } else {
            deduped.push((t, e));
        }
    }
    *curve = deduped;
}

fn pct_change(curve: &[(DateTime<Utc>, f64)]) -> Vec<f64> {
    curve
        .windows(2)
        .filter_map(|w| {
            let (_, prev) = w[0];
            let (_, cur) = w[1];
            if prev == 0.0 { None } else { Some((cur - prev) / prev) }
        })
        .collect()
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

fn stddev(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let m = mean(values);
    let variance = values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / (values.len() - 1) as f64;
    variance.sqrt()
}

fn max_drawdown(curve: &[(DateTime<Utc>, f64)]) -> f64 {
    let mut cummax = f64::NEG_INFINITY;
    let mut worst = 0.0f64;
    for &(_, equity) in curve {
        cummax = cummax.max(equity);
        if cummax > 0.0 {
            let dd = (equity - cummax) / cummax;
            worst = worst.min(dd);
        }
    }
    worst
}

/// Longest consecutive run of winners and of losers (ties go to whichever
/// sign the streak continues, matching the original's running-counter idiom).
fn streaks(pnls: &[f64]) -> (u32, u32) {
    let mut max_win = 0i32;
    let mut max_loss = 0i32;
    let mut current = 0i32;
    for &p in pnls {
        if p > 0.0 {
            current = if current > 0 { current + 1 } else { 1 };
            max_win = max_win.max(current);
        } else {
            current = if current < 0 { current - 1 } else { -1 };
            max_loss = max_loss.max(current.unsigned_abs() as i32);
        }
    }
    (max_win as u32, max_loss as u32)
}

fn round3(v: f64) -> f64 {
    (v * 1000.0).round() / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trade(pnl: f64, bars_held: usize) -> BacktestTrade {
        BacktestTrade {
            symbol: "AAPL".to_string(),
            side: TradeSide::Buy,
            qty: 1.0,
            entry_price: 100.0,
            entry_date: Utc::now(),
            exit_price: 100.0 + pnl,
            exit_date: Utc::now(),
            commission: 0.0,
            pnl,
            pnl_pct: pnl / 100.0,
            bars_held,
        }
    }

    fn curve(values: &[f64]) -> Vec<(DateTime<Utc>, f64)> {
        let base = Utc::now();
        values
            .iter()
            .enumerate()
            .map(|(i, v)| (base + chrono::Duration::days(i as i64), *v))
            .collect()
    }

    #[test]
    fn estimate_lookback_uses_max_period_like_parameter() {
        let params = serde_json::json!({"fast_period": 10, "slow_period": 20, "unrelated": 5});
        assert_eq!(Backtester::estimate_lookback(&params), (20.0 * 1.5) as usize + 5);
    }

    #[test]
    fn estimate_lookback_defaults_without_period_params() {
        let params = serde_json::json!({"threshold": 0.5});
        assert_eq!(Backtester::estimate_lookback(&params), (1.0 * 1.5) as usize + 5);
    }

    #[test]
    fn max_drawdown_reports_largest_peak_to_trough_decline() {
        let c = curve(&[100.0, 120.0, 90.0, 110.0]);
        let dd = max_drawdown(&c);
        assert!((dd - (-0.25)).abs() < 1e-9);
    }

    #[test]
    fn streaks_counts_longest_consecutive_runs() {
        let pnls = vec![1.0, 2.0, -1.0, -2.0, -3.0, 5.0];
        let (win, loss) = streaks(&pnls);
        assert_eq!(win, 2);
        assert_eq!(loss, 3);
    }

    #[test]
    fn profit_factor_is_infinite_with_no_losses() {
        let trades = vec![trade(10.0, 1), trade(20.0, 2)];
        let curve = curve(&[100_000.0, 100_030.0]);
        let metrics = Backtester::calculate_metrics(&curve, &trades);
        assert!(metrics.profit_factor.is_infinite());
    }

    #[test]
    fn calculate_metrics_reports_win_rate_and_trade_counts() {
        let trades = vec![trade(10.0, 1), trade(-5.0, 2), trade(15.0, 1)];
        let curve = curve(&[100_000.0, 100_010.0, 100_005.0, 100_020.0]);
        let metrics = Backtester::calculate_metrics(&curve, &trades);
        assert_eq!(metrics.total_trades, 3);
        assert_eq!(metrics.winning_trades, 2);
        assert_eq!(metrics.losing_trades, 1);
        assert!((metrics.win_rate_pct - 66.7).abs() < 0.1);
    }

    #[test]
    fn dedup_equity_curve_keeps_last_value_per_timestamp() {
        let t = Utc::now();
        let mut c = vec![(t, 1.0), (t, 2.0)];
        dedup_equity_curve(&mut c);
        assert_eq!(c, vec![(t, 2.0)]);
    }
}
