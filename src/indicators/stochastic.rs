// =============================================================================
// Stochastic Oscillator
// =============================================================================
//
// %K = (close - lowest_low(period)) / (highest_high(period) - lowest_low(period)) * 100
// %D = SMA(%K, smooth_period)

use crate::types::Bar;

use super::sma::calculate_sma;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StochasticOutput {
    pub k: f64,
    pub d: f64,
}

/// Compute the most recent %K/%D stochastic reading.
///
/// Returns `None` when there aren't enough bars, or the high-low range over
/// the window is degenerate (zero width).
pub fn calculate_stochastic(bars: &[Bar], period: usize, smooth_period: usize) -> Option<StochasticOutput> {
    if period == 0 || smooth_period == 0 || bars.len() < period + smooth_period {
        return None;
    }

    let mut k_values = Vec::with_capacity(bars.len() - period + 1);
    for i in period - 1..bars.len() {
        let window = &bars[i + 1 - period..=i];
        let highest_high = window.iter().map(|b| b.high).fold(f64::MIN, f64::max);
        let lowest_low = window.iter().map(|b| b.low).fold(f64::MAX, f64::min);
        let range = highest_high - lowest_low;

        let k = if range == 0.0 {
            50.0
        } else {
            (bars[i].close - lowest_low) / range * 100.0
        };
        k_values.push(k);
    }

    let d = *calculate_sma(&k_values, smooth_period).last()?;
    let k = *k_values.last()?;

    if k.is_finite() && d.is_finite() {
        Some(StochasticOutput { k, d })
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn bar(high: f64, low: f64, close: f64) -> Bar {
        Bar {
            timestamp: Utc::now(),
            open: close,
            high,
            low,
            close,
            volume: 1.0,
        }
    }

    #[test]
    fn stochastic_insufficient_data() {
        let bars = vec![bar(10.0, 9.0, 9.5); 5];
        assert!(calculate_stochastic(&bars, 14, 3).is_none());
    }

    #[test]
    fn stochastic_at_high_is_100() {
        let mut bars: Vec<Bar> = (0..20).map(|_| bar(10.0, 9.0, 9.5)).collect();
        bars.push(bar(10.0, 9.0, 10.0));
        let out = calculate_stochastic(&bars, 14, 3).unwrap();
        assert!(out.k > 50.0);
        assert!((0.0..=100.0).contains(&out.d));
    }

    #[test]
    fn stochastic_flat_range_is_neutral() {
        let bars = vec![bar(10.0, 10.0, 10.0); 20];
        let out = calculate_stochastic(&bars, 14, 3).unwrap();
        assert!((out.k - 50.0).abs() < 1e-9);
    }
}
