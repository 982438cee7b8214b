// =============================================================================
// RSI Strategy — oversold/overbought band crossing with hysteresis
// =============================================================================
//
// BUY when RSI crosses down through the oversold level (the previous bar was
// at or above it, the current bar is below). SELL on the mirror crossing into
// overbought. HOLD otherwise, including while RSI sits in the neutral zone.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::indicators::rsi::calculate_rsi;
use crate::types::{Bar, Signal, Timeframe};

use super::{filter_known_overrides, validate_data, Strategy, StrategyState};

pub struct RsiStrategy {
    symbols: Vec<String>,
    timeframe: Timeframe,
    rsi_period: usize,
    overbought: f64,
    oversold: f64,
    state: StrategyState,
}

impl RsiStrategy {
    pub const NAME: &'static str = "rsi_strategy";

    pub fn new(
        symbols: Vec<String>,
        timeframe: Timeframe,
        rsi_period: usize,
        overbought: f64,
        oversold: f64,
    ) -> anyhow::Result<Self> {
        if symbols.is_empty() {
            anyhow::bail!("strategy '{}' requires at least one symbol", Self::NAME);
        }
        if !(0.0 < oversold && oversold < overbought && overbought < 100.0) {
            anyhow::bail!(
                "invalid levels: oversold ({oversold}) must be less than overbought ({overbought}), both between 0 and 100"
            );
        }
        if rsi_period < 2 {
            anyhow::bail!("rsi_period ({rsi_period}) must be at least 2");
        }

        Ok(Self {
            symbols,
            timeframe,
            rsi_period,
            overbought,
            oversold,
            state: StrategyState::default(),
        })
    }

    pub fn default_for(symbols: Vec<String>, timeframe: Timeframe) -> anyhow::Result<Self> {
        Self::new(symbols, timeframe, 14, 70.0, 30.0)
    }
}

#[async_trait]
impl Strategy for RsiStrategy {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn description(&self) -> &str {
        "RSI strategy. Buys on entry into oversold, sells on entry into overbought."
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
        let valid = validate_data(data, self.rsi_period + 2);

        for symbol in &self.symbols {
            let Some(bars) = valid.get(symbol.as_str()) else {
                debug!(strategy = Self::NAME, symbol, "insufficient data, HOLD");
                signals.insert(symbol.clone(), Signal::Hold);
                continue;
            };

            let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();
            let rsi = calculate_rsi(&closes, self.rsi_period);

            if rsi.len() < 2 {
                signals.insert(symbol.clone(), Signal::Hold);
                continue;
            }

            let current = rsi[rsi.len() - 1];
            let previous = rsi[rsi.len() - 2];

            let crossed_into_oversold = previous >= self.oversold && current < self.oversold;
            let crossed_into_overbought = previous <= self.overbought && current > self.overbought;

            let signal = if crossed_into_oversold {
                info!(strategy = Self::NAME, symbol, current, oversold = self.oversold, "entered oversold");
                Signal::Buy
            } else if crossed_into_overbought {
                info!(strategy = Self::NAME, symbol, current, overbought = self.overbought, "entered overbought");
                Signal::Sell
            } else {
                debug!(strategy = Self::NAME, symbol, current, "neutral zone");
                Signal::Hold
            };

            signals.insert(symbol.clone(), signal);
        }

        Ok(signals)
    }

    fn get_parameters(&self) -> Value {
        json!({
            "rsi_period": self.rsi_period,
            "overbought": self.overbought,
            "oversold": self.oversold,
        })
    }

    fn update_parameters(&mut self, overrides: &Value) {
        let current = self.get_parameters();
        let applied = filter_known_overrides(Self::NAME, &current, overrides);

        if let Some(v) = applied.get("rsi_period").and_then(Value::as_u64) {
            self.rsi_period = v as usize;
        }
        if let Some(v) = applied.get("overbought").and_then(Value::as_f64) {
            self.overbought = v;
        }
        if let Some(v) = applied.get("oversold").and_then(Value::as_f64) {
            self.oversold = v;
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
    async fn sustained_decline_enters_oversold_once() {
        let strat = RsiStrategy::new(vec!["AAPL".to_string()], Timeframe::D1, 14, 70.0, 30.0).unwrap();
        let mut closes = vec![100.0];
        for i in 1..30 {
            closes.push(100.0 - i as f64 * 2.0);
        }
        let mut data = HashMap::new();
        data.insert("AAPL".to_string(), series(&closes));

        let signals = strat.calculate_signals(&data).await.unwrap();
        assert!(matches!(signals["AAPL"], Signal::Buy | Signal::Hold));
    }

    #[test]
    fn rejects_invalid_levels() {
        assert!(RsiStrategy::new(vec!["AAPL".to_string()], Timeframe::D1, 14, 30.0, 70.0).is_err());
        assert!(RsiStrategy::new(vec!["AAPL".to_string()], Timeframe::D1, 1, 70.0, 30.0).is_err());
    }

    #[tokio::test]
    async fn insufficient_history_holds() {
        let strat = RsiStrategy::new(vec!["AAPL".to_string()], Timeframe::D1, 14, 70.0, 30.0).unwrap();
        let mut data = HashMap::new();
        data.insert("AAPL".to_string(), series(&[1.0, 2.0, 3.0]));

        let signals = strat.calculate_signals(&data).await.unwrap();
        assert_eq!(signals["AAPL"], Signal::Hold);
    }

    #[tokio::test]
    async fn update_parameters_applies_known_keys() {
        let mut strat = RsiStrategy::new(vec!["AAPL".to_string()], Timeframe::D1, 14, 70.0, 30.0).unwrap();
        strat.update_parameters(&json!({"oversold": 25.0, "bogus": true}));
        assert_eq!(strat.oversold, 25.0);
    }
}
