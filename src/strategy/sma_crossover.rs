// =============================================================================
// SMA Crossover — golden/death cross on closing price
// =============================================================================
//
// BUY when the fast SMA crosses above the slow SMA (golden cross), SELL when
// it crosses below (death cross), HOLD otherwise.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::indicators::crossover::{crossover, crossunder};
use crate::indicators::sma::calculate_sma;
use crate::types::{Bar, Signal, Timeframe};

use super::{filter_known_overrides, validate_data, Strategy, StrategyState};

pub struct SmaCrossover {
    symbols: Vec<String>,
    timeframe: Timeframe,
    fast_period: usize,
    slow_period: usize,
    state: StrategyState,
}

impl SmaCrossover {
    pub const NAME: &'static str = "sma_crossover";

    pub fn new(symbols: Vec<String>, timeframe: Timeframe, fast_period: usize, slow_period: usize) -> anyhow::Result<Self> {
        if symbols.is_empty() {
            anyhow::bail!("strategy '{}' requires at least one symbol", Self::NAME);
        }
        if fast_period >= slow_period {
            anyhow::bail!(
                "fast_period ({fast_period}) must be less than slow_period ({slow_period})"
            );
        }
        Ok(Self {
            symbols,
            timeframe,
            fast_period,
            slow_period,
            state: StrategyState::default(),
        })
    }

    pub fn default_for(symbols: Vec<String>, timeframe: Timeframe) -> anyhow::Result<Self> {
        Self::new(symbols, timeframe, 10, 20)
    }
}

#[async_trait]
impl Strategy for SmaCrossover {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn description(&self) -> &str {
        "Simple moving average crossover. Buys on golden cross, sells on death cross."
    }

    fn symbols(&self) -> &[String] {
        &self.symbols
    }

    fn timeframe(&self) -> Timeframe {
        self.timeframe
    }

    fn state(&self) -> &StrategyState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut StrategyState {
        &mut self.state
    }

    async fn calculate_signals(&self, data: &HashMap<String, Vec<Bar>>) -> anyhow::Result<HashMap<String, Signal>> {
        let mut signals = HashMap::new();
        let valid = validate_data(data, self.slow_period + 1);

        for symbol in &self.symbols {
            let Some(bars) = valid.get(symbol.as_str()) else {
                debug!(strategy = Self::NAME, symbol, "insufficient data, HOLD");
                signals.insert(symbol.clone(), Signal::Hold);
                continue;
            };

            let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();
            let fast = calculate_sma(&closes, self.fast_period);
            let slow = calculate_sma(&closes, self.slow_period);

            if fast.is_empty() || slow.is_empty() {
                signals.insert(symbol.clone(), Signal::Hold);
                continue;
            }

            let signal = if crossover(&fast, &slow) {
                info!(
                    strategy = Self::NAME,
                    symbol,
                    fast = fast.last().copied().unwrap_or(f64::NAN),
                    slow = slow.last().copied().unwrap_or(f64::NAN),
                    "golden cross"
                );
                Signal::Buy
            } else if crossunder(&fast, &slow) {
                info!(
                    strategy = Self::NAME,
                    symbol,
                    fast = fast.last().copied().unwrap_or(f64::NAN),
                    slow = slow.last().copied().unwrap_or(f64::NAN),
                    "death cross"
                );
                Signal::Sell
            } else {
                Signal::Hold
            };

            signals.insert(symbol.clone(), signal);
        }

        Ok(signals)
    }

    fn get_parameters(&self) -> Value {
        json!({
            "fast_period": self.fast_period,
            "slow_period": self.slow_period,
        })
    }

    fn update_parameters(&mut self, overrides: &Value) {
        let current = self.get_parameters();
        let applied = filter_known_overrides(Self::NAME, &current, overrides);

        if let Some(v) = applied.get("fast_period").and_then(Value::as_u64) {
            self.fast_period = v as usize;
        }
        if let Some(v) = applied.get("slow_period").and_then(Value::as_u64) {
            self.slow_period = v as usize;
        }
    }

    async fn on_trade_executed(&mut self, trade: &Value) {
        info!(strategy = Self::NAME, ?trade, "trade executed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    fn series(closes: &[f64]) -> Vec<Bar> {
        let base = Utc::now();
        closes
            .iter()
            .enumerate()
            .map(|(i, &c)| Bar {
                timestamp: base + Duration::days(i as i64),
                open: c,
                high: c,
                low: c,
                close: c,
                volume: 100.0,
            })
            .collect()
    }

    #[tokio::test]
    async fn golden_cross_emits_buy() {
        let strat = SmaCrossover::new(vec!["AAPL".to_string()], Timeframe::D1, 2, 4).unwrap();
        // Fast SMA rises through slow SMA on the final bar.
        let closes: Vec<f64> = vec![10.0, 10.0, 10.0, 10.0, 10.0, 30.0];
        let mut data = HashMap::new();
        data.insert("AAPL".to_string(), series(&closes));

        let signals = strat.calculate_signals(&data).await.unwrap();
        assert_eq!(signals["AAPL"], Signal::Buy);
    }

    #[tokio::test]
    async fn insufficient_history_holds() {
        let strat = SmaCrossover::new(vec!["AAPL".to_string()], Timeframe::D1, 2, 4).unwrap();
        let mut data = HashMap::new();
        data.insert("AAPL".to_string(), series(&[1.0, 2.0]));

        let signals = strat.calculate_signals(&data).await.unwrap();
        assert_eq!(signals["AAPL"], Signal::Hold);
    }

    #[test]
    fn rejects_fast_not_less_than_slow() {
        assert!(SmaCrossover::new(vec!["AAPL".to_string()], Timeframe::D1, 20, 10).is_err());
    }

    #[test]
    fn rejects_empty_symbols() {
        assert!(SmaCrossover::new(vec![], Timeframe::D1, 10, 20).is_err());
    }

    #[tokio::test]
    async fn update_parameters_ignores_unknown_keys() {
        let mut strat = SmaCrossover::new(vec!["AAPL".to_string()], Timeframe::D1, 10, 20).unwrap();
        strat.update_parameters(&json!({"fast_period": 5, "bogus": 1}));
        assert_eq!(strat.fast_period, 5);
        assert_eq!(strat.slow_period, 20);
    }
}
