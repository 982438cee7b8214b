// =============================================================================
// Moving Average Convergence Divergence (MACD)
// =============================================================================
//
// MACD line   = EMA(fast) - EMA(slow)
// Signal line = EMA(signal) of the MACD line
// Histogram   = MACD line - Signal line

use super::ema::calculate_ema;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MacdOutput {
    pub macd: f64,
    pub signal: f64,
    pub histogram: f64,
}

/// Compute the most recent MACD reading with the standard (12, 26, 9) periods
/// or any other combination.
///
/// Returns `None` when there isn't enough data to seed both EMAs and then the
/// signal EMA on top of the resulting MACD series.
pub fn calculate_macd(
    closes: &[f64],
    fast_period: usize,
    slow_period: usize,
    signal_period: usize,
) -> Option<MacdOutput> {
    if fast_period == 0 || slow_period == 0 || signal_period == 0 || fast_period >= slow_period {
        return None;
    }

    let fast = calculate_ema(closes, fast_period);
    let slow = calculate_ema(closes, slow_period);
    if fast.is_empty() || slow.is_empty() {
        return None;
    }

    // Align: `fast` starts `slow_period - fast_period` entries before `slow`.
    let offset = slow_period - fast_period;
    if fast.len() <= offset {
        return None;
    }
    let macd_line: Vec<f64> = fast[offset..]
        .iter()
        .zip(slow.iter())
        .map(|(f, s)| f - s)
        .collect();

    if macd_line.len() < signal_period {
        return None;
    }

    let signal_line = calculate_ema(&macd_line, signal_period);
    let signal = *signal_line.last()?;
    let macd = *macd_line.last()?;
    let histogram = macd - signal;

    if macd.is_finite() && signal.is_finite() {
        Some(MacdOutput {
            macd,
            signal,
            histogram,
        })
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn macd_insufficient_data() {
        let closes: Vec<f64> = (1..=20).map(|x| x as f64).collect();
        assert!(calculate_macd(&closes, 12, 26, 9).is_none());
    }

    #[test]
    fn macd_uptrend_is_positive() {
        let closes: Vec<f64> = (1..=120).map(|x| x as f64).collect();
        let out = calculate_macd(&closes, 12, 26, 9).unwrap();
        assert!(out.macd > 0.0, "expected positive MACD in uptrend, got {}", out.macd);
    }

    #[test]
    fn macd_invalid_periods() {
        let closes: Vec<f64> = (1..=120).map(|x| x as f64).collect();
        assert!(calculate_macd(&closes, 26, 12, 9).is_none());
        assert!(calculate_macd(&closes, 0, 26, 9).is_none());
    }
}
