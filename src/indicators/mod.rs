// =============================================================================
// Technical Indicators Module
// =============================================================================
//
// Pure, side-effect-free implementations of the core technical indicators used
// by the trading engine.  Every public function returns `Option<T>` so callers
// are forced to handle insufficient-data and numerical-edge-case scenarios.

pub mod adx;
pub mod atr;
pub mod bollinger;
pub mod crossover;
pub mod ema;
pub mod macd;
pub mod obv;
pub mod roc;
pub mod rsi;
pub mod sma;
pub mod stochastic;
pub mod vwap;

use crate::types::Bar;
use adx::AdxOutput;
use bollinger::BollingerResult;
use macd::MacdOutput;

/// Bundled snapshot of the indicator set a strategy typically wants on every
/// cycle, computed once per symbol instead of recomputed per-strategy.
#[derive(Debug, Clone)]
pub struct CommonIndicators {
    pub sma20: Option<f64>,
    pub sma50: Option<f64>,
    pub ema9: Option<f64>,
    pub ema21: Option<f64>,
    pub rsi14: Option<f64>,
    pub macd: Option<MacdOutput>,
    pub bollinger: Option<BollingerResult>,
    pub atr14: Option<f64>,
    pub adx14: Option<AdxOutput>,
}

/// Compute the standard indicator bundle from a bar series.
///
/// Any individual indicator that doesn't have enough history is left `None`;
/// callers must not assume the whole struct is populated.
pub fn add_common_indicators(bars: &[Bar]) -> CommonIndicators {
    let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();

    CommonIndicators {
        sma20: sma::current_sma(&closes, 20),
        sma50: sma::current_sma(&closes, 50),
        ema9: ema::calculate_ema(&closes, 9).last().copied(),
        ema21: ema::calculate_ema(&closes, 21).last().copied(),
        rsi14: rsi::current_rsi(&closes, 14).map(|(value, _)| value),
        macd: macd::calculate_macd(&closes, 12, 26, 9),
        bollinger: bollinger::calculate_bollinger(&closes, 20, 2.0),
        atr14: atr::calculate_atr(bars, 14),
        adx14: adx::calculate_adx(bars, 14),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    fn synthetic_bars(n: usize) -> Vec<Bar> {
        let start = Utc::now();
        (0..n)
            .map(|i| {
                let close = 100.0 + i as f64 * 0.5;
                Bar {
                    timestamp: start + Duration::minutes(i as i64),
                    open: close - 0.2,
                    high: close + 0.3,
                    low: close - 0.3,
                    close,
                    volume: 1_000.0,
                }
            })
            .collect()
    }

    #[test]
    fn common_indicators_populate_with_enough_history() {
        let bars = synthetic_bars(120);
        let out = add_common_indicators(&bars);
        assert!(out.sma20.is_some());
        assert!(out.sma50.is_some());
        assert!(out.ema9.is_some());
        assert!(out.ema21.is_some());
        assert!(out.rsi14.is_some());
        assert!(out.macd.is_some());
        assert!(out.bollinger.is_some());
        assert!(out.atr14.is_some());
        assert!(out.adx14.is_some());
    }

    #[test]
    fn common_indicators_degrade_gracefully_with_little_history() {
        let bars = synthetic_bars(5);
        let out = add_common_indicators(&bars);
        assert!(out.sma20.is_none());
        assert!(out.sma50.is_none());
        assert!(out.macd.is_none());
    }
}
