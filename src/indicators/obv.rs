// =============================================================================
// On-Balance Volume (OBV)
// =============================================================================
//
// OBV_0 = volume_0
// OBV_t = OBV_{t-1} + volume_t   if close_t > close_{t-1}
//       = OBV_{t-1} - volume_t   if close_t < close_{t-1}
//       = OBV_{t-1}              if close_t == close_{t-1}

use crate::types::Bar;

/// Compute the full OBV series. Returns an empty vec for empty input.
pub fn calculate_obv(bars: &[Bar]) -> Vec<f64> {
    if bars.is_empty() {
        return Vec::new();
    }

    let mut result = Vec::with_capacity(bars.len());
    let mut obv = bars[0].volume;
    result.push(obv);

    for w in bars.windows(2) {
        let (prev, cur) = (&w[0], &w[1]);
        if cur.close > prev.close {
            obv += cur.volume;
        } else if cur.close < prev.close {
            obv -= cur.volume;
        }
        result.push(obv);
    }

    result
}

/// Most recent OBV value.
pub fn current_obv(bars: &[Bar]) -> Option<f64> {
    calculate_obv(bars).last().copied()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn bar(close: f64, volume: f64) -> Bar {
        Bar {
            timestamp: Utc::now(),
            open: close,
            high: close,
            low: close,
            close,
            volume,
        }
    }

    #[test]
    fn obv_empty() {
        assert!(calculate_obv(&[]).is_empty());
    }

    #[test]
    fn obv_accumulates_on_up_days() {
        let bars = vec![bar(10.0, 100.0), bar(11.0, 50.0), bar(12.0, 30.0)];
        let obv = calculate_obv(&bars);
        assert_eq!(obv, vec![100.0, 150.0, 180.0]);
    }

    #[test]
    fn obv_subtracts_on_down_days() {
        let bars = vec![bar(10.0, 100.0), bar(9.0, 50.0)];
        assert_eq!(calculate_obv(&bars), vec![100.0, 50.0]);
    }

    #[test]
    fn obv_unchanged_on_flat_close() {
        let bars = vec![bar(10.0, 100.0), bar(10.0, 50.0)];
        assert_eq!(calculate_obv(&bars), vec![100.0, 100.0]);
    }
}
