// =============================================================================
// Volume-Weighted Average Price (VWAP)
// =============================================================================
//
// VWAP = sum(typical_price_i * volume_i) / sum(volume_i), over the supplied
// window (the caller decides the window — typically "since session open").

use crate::types::Bar;

/// Compute VWAP over the full supplied slice.
///
/// Returns `None` for empty input or when total volume is zero.
pub fn calculate_vwap(bars: &[Bar]) -> Option<f64> {
    if bars.is_empty() {
        return None;
    }

    let mut pv_sum = 0.0;
    let mut v_sum = 0.0;
    for bar in bars {
        let typical = (bar.high + bar.low + bar.close) / 3.0;
        pv_sum += typical * bar.volume;
        v_sum += bar.volume;
    }

    if v_sum <= 0.0 {
        return None;
    }

    let vwap = pv_sum / v_sum;
    if vwap.is_finite() {
        Some(vwap)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn bar(high: f64, low: f64, close: f64, volume: f64) -> Bar {
        Bar {
            timestamp: Utc::now(),
            open: close,
            high,
            low,
            close,
            volume,
        }
    }

    #[test]
    fn vwap_empty_is_none() {
        assert!(calculate_vwap(&[]).is_none());
    }

    #[test]
    fn vwap_zero_volume_is_none() {
        let bars = vec![bar(10.0, 9.0, 9.5, 0.0)];
        assert!(calculate_vwap(&bars).is_none());
    }

    #[test]
    fn vwap_single_bar_is_typical_price() {
        let bars = vec![bar(12.0, 10.0, 11.0, 100.0)];
        let vwap = calculate_vwap(&bars).unwrap();
        assert!((vwap - 11.0).abs() < 1e-9);
    }

    #[test]
    fn vwap_weights_by_volume() {
        let bars = vec![bar(10.0, 10.0, 10.0, 1000.0), bar(20.0, 20.0, 20.0, 1.0)];
        let vwap = calculate_vwap(&bars).unwrap();
        assert!(vwap < 11.0, "expected VWAP close to the high-volume bar, got {vwap}");
    }
}
