// =============================================================================
// Strategy contract
// =============================================================================
//
// A strategy turns market data into BUY/SELL/HOLD signals. All strategies
// share the same lifecycle (IDLE -> RUNNING -> {STOPPED, ERROR}) and the same
// bookkeeping (last run, total signals, last error) via `StrategyState`, which
// concrete strategies embed and expose through `state`/`state_mut`.

pub mod registry;
pub mod rsi_strategy;
pub mod sma_crossover;

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{info, warn};

use crate::types::{Bar, Signal, Timeframe};

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StrategyStatus {
    Idle,
    Running,
    Stopped,
    Error,
}

/// Bookkeeping shared by every strategy implementation.
#[derive(Debug, Clone)]
pub struct StrategyState {
    pub status: StrategyStatus,
    pub last_run: Option<DateTime<Utc>>,
    pub total_signals: u64,
    pub last_signals: HashMap<String, Signal>,
    pub error_message: Option<String>,
}

impl Default for StrategyState {
    fn default() -> Self {
        Self {
            status: StrategyStatus::Idle,
            last_run: None,
            total_signals: 0,
            last_signals: HashMap::new(),
            error_message: None,
        }
    }
}

/// Metadata snapshot for the API/dashboard.
#[derive(Debug, Clone, serde::Serialize)]
pub struct StrategyInfo {
    pub name: String,
    pub description: String,
    pub symbols: Vec<String>,
    pub timeframe: Timeframe,
    pub parameters: Value,
    pub status: StrategyStatus,
    pub last_run: Option<DateTime<Utc>>,
    pub total_signals: u64,
}

#[async_trait]
pub trait Strategy: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn symbols(&self) -> &[String];
    fn timeframe(&self) -> Timeframe;

    /// True for 24-hour markets (crypto) where the engine skips the
    /// market-open gate before running a cycle.
    fn skip_market_check(&self) -> bool {
        false
    }

    fn state(&self) -> &StrategyState;
    fn state_mut(&mut self) -> &mut StrategyState;

    /// Produces signals from the bar history supplied by the engine, keyed
    /// by symbol. Implementations should emit `Signal::Hold` for any symbol
    /// with insufficient history rather than omitting it.
    async fn calculate_signals(
        &self,
        data: &HashMap<String, Vec<Bar>>,
    ) -> anyhow::Result<HashMap<String, Signal>>;

    fn get_parameters(&self) -> Value;

    /// Applies `overrides`, ignoring any key not already present in
    /// `get_parameters()`. Concrete strategies implement this since only
    /// they know which struct fields back which parameter names.
    fn update_parameters(&mut self, overrides: &Value);

    async fn on_start(&mut self) {}
    async fn on_stop(&mut self) {}
    async fn on_trade_executed(&mut self, _trade: &Value) {}

    /// One-shot take-profit/stop-loss the strategy wants attached to its
    /// next submitted order, consumed (and cleared) by the engine right
    /// after it reads them. Strategies that never bracket their orders can
    /// leave this at the default.
    fn take_bracket_params(&mut self) -> (Option<f64>, Option<f64>) {
        (None, None)
    }

    fn status(&self) -> StrategyStatus {
        self.state().status
    }

    fn is_running(&self) -> bool {
        self.status() == StrategyStatus::Running
    }

    fn last_signals(&self) -> HashMap<String, Signal> {
        self.state().last_signals.clone()
    }

    fn error_message(&self) -> Option<String> {
        self.state().error_message.clone()
    }

    async fn start(&mut self) {
        self.state_mut().status = StrategyStatus::Running;
        self.state_mut().error_message = None;
        info!(strategy = self.name(), "strategy started");
        self.on_start().await;
    }

    async fn stop(&mut self) {
        self.state_mut().status = StrategyStatus::Stopped;
        info!(strategy = self.name(), "strategy stopped");
        self.on_stop().await;
    }

    fn set_error(&mut self, message: String) {
        self.state_mut().status = StrategyStatus::Error;
        self.state_mut().error_message = Some(message);
    }

    /// Called by the engine once per cycle. Only callable while `RUNNING`;
    /// a `calculate_signals` failure flips the strategy to `ERROR` and is
    /// propagated to the caller.
    async fn run(&mut self, data: &HashMap<String, Vec<Bar>>) -> anyhow::Result<HashMap<String, Signal>> {
        if self.status() != StrategyStatus::Running {
            anyhow::bail!(
                "strategy '{}' is not running (status={:?})",
                self.name(),
                self.status()
            );
        }

        match self.calculate_signals(data).await {
            Ok(signals) => {
                let active: HashMap<String, Signal> = signals
                    .iter()
                    .filter(|(_, s)| s.is_actionable())
                    .map(|(k, v)| (k.clone(), *v))
                    .collect();

                if !active.is_empty() {
                    info!(strategy = self.name(), ?active, "active signals");
                }

                let state = self.state_mut();
                state.last_run = Some(Utc::now());
                state.total_signals += active.len() as u64;
                state.last_signals = signals.clone();

                Ok(signals)
            }
            Err(e) => {
                self.set_error(e.to_string());
                Err(e)
            }
        }
    }

    fn info(&self) -> StrategyInfo {
        StrategyInfo {
            name: self.name().to_string(),
            description: self.description().to_string(),
            symbols: self.symbols().to_vec(),
            timeframe: self.timeframe(),
            parameters: self.get_parameters(),
            status: self.status(),
            last_run: self.state().last_run,
            total_signals: self.state().total_signals,
        }
    }
}

/// Drops symbols with no data or fewer than `min_bars` bars. Shared by every
/// strategy's `calculate_signals`.
pub fn validate_data<'a>(
    data: &'a HashMap<String, Vec<Bar>>,
    min_bars: usize,
) -> HashMap<&'a str, &'a [Bar]> {
    let mut valid = HashMap::new();
    for (symbol, bars) in data {
        if bars.is_empty() {
            warn!(symbol, "empty bar series, skipping");
            continue;
        }
        if bars.len() < min_bars {
            warn!(symbol, have = bars.len(), need = min_bars, "insufficient history, skipping");
            continue;
        }
        valid.insert(symbol.as_str(), bars.as_slice());
    }
    valid
}

/// Applies `overrides` to `current`, returning only the keys that existed in
/// `current`. Unknown keys are logged and dropped; callers still need to
/// assign the returned values back onto their own fields.
pub fn filter_known_overrides(strategy_name: &str, current: &Value, overrides: &Value) -> HashMap<String, Value> {
    let mut applied = HashMap::new();
    let (Some(current_obj), Some(override_obj)) = (current.as_object(), overrides.as_object()) else {
        return applied;
    };

    for (key, value) in override_obj {
        if current_obj.contains_key(key) {
            applied.insert(key.clone(), value.clone());
        } else {
            warn!(strategy = strategy_name, key, "unknown parameter ignored");
        }
    }
    applied
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bar(close: f64) -> Bar {
        Bar {
            timestamp: Utc::now(),
            open: close,
            high: close,
            low: close,
            close,
            volume: 1.0,
        }
    }

    #[test]
    fn validate_data_drops_short_and_empty_series() {
        let mut data = HashMap::new();
        data.insert("AAPL".to_string(), vec![bar(1.0), bar(2.0), bar(3.0)]);
        data.insert("MSFT".to_string(), vec![bar(1.0)]);
        data.insert("TSLA".to_string(), vec![]);

        let valid = validate_data(&data, 2);
        assert_eq!(valid.len(), 1);
        assert!(valid.contains_key("AAPL"));
    }

    #[test]
    fn filter_known_overrides_drops_unknown_keys() {
        let current = serde_json::json!({"fast_period": 10, "slow_period": 20});
        let overrides = serde_json::json!({"fast_period": 5, "bogus": 1});
        let applied = filter_known_overrides("test", &current, &overrides);
        assert_eq!(applied.len(), 1);
        assert_eq!(applied.get("fast_period"), Some(&serde_json::json!(5)));
    }
}
