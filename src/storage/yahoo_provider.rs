// =============================================================================
// Historical provider — Yahoo Finance public chart endpoint
// =============================================================================
//
// No API key required, unlike the broker adapter — the client carries none
// of its auth machinery. Up to decades of daily history; intraday history is
// limited by Yahoo to a handful of days per interval (not enforced here, the
// caller just gets back whatever Yahoo returns).

use std::collections::HashMap;

use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::types::Bar;

const CHART_BASE_URL: &str = "https://query1.finance.yahoo.com/v8/finance/chart";

/// Maps our timeframe keys to Yahoo's `interval` query parameter.
fn resolve_interval(timeframe: &str) -> Result<&'static str> {
    Ok(match timeframe {
        "1m" => "1m",
        "2m" => "2m",
        "5m" => "5m",
        "15m" => "15m",
        "30m" => "30m",
        "1h" => "60m",
        "1d" => "1d",
        "5d" => "5d",
        "1w" => "1wk",
        "1mo" => "1mo",
        "3mo" => "3mo",
        other => anyhow::bail!("timeframe '{other}' not supported by Yahoo Finance"),
    })
}

pub struct YahooProvider {
    client: reqwest::Client,
}

impl Default for YahooProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl YahooProvider {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(15))
            .user_agent("Mozilla/5.0 (compatible; quantum-trader/1.0)")
            .build()
            .expect("failed to build reqwest client");
        Self { client }
    }

    /// Download OHLCV bars for a single symbol. Returns an empty vec (never
    /// an error) when Yahoo has no data for the requested range, matching
    /// the "always returns, logs on failure" idiom used elsewhere for
    /// market-data fetches.
    pub async fn download(
        &self,
        symbol: &str,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
        timeframe: &str,
    ) -> Vec<Bar> {
        match self.download_inner(symbol, start, end, timeframe).await {
            Ok(bars) => {
                info!(
                    symbol,
                    timeframe,
                    count = bars.len(),
                    "Yahoo download complete"
                );
                bars
            }
            Err(e) => {
                warn!(symbol, timeframe, error = %e, "Yahoo download failed");
                Vec::new()
            }
        }
    }

    /// Batch variant. Falls back to per-symbol downloads for any symbol that
    /// fails independently, so one bad ticker doesn't drop the whole batch.
    pub async fn download_multiple(
        &self,
        symbols: &[String],
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
        timeframe: &str,
    ) -> HashMap<String, Vec<Bar>> {
        let mut results = HashMap::new();
        for symbol in symbols {
            let bars = self.download(symbol, start, end, timeframe).await;
            if !bars.is_empty() {
                results.insert(symbol.clone(), bars);
            }
        }
        results
    }

    async fn download_inner(
        &self,
        symbol: &str,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
        timeframe: &str,
    ) -> Result<Vec<Bar>> {
        let interval = resolve_interval(timeframe)?;

        let mut query = vec![format!("interval={interval}")];
        if let Some(s) = start {
            query.push(format!("period1={}", s.timestamp()));
        }
        if let Some(e) = end {
            query.push(format!("period2={}", e.timestamp()));
        } else {
            query.push(format!("period2={}", Utc::now().timestamp()));
        }
        if start.is_none() {
            query.push("range=max".to_string());
        }

        let url = format!("{CHART_BASE_URL}/{symbol}?{}", query.join("&"));
        debug!(symbol, timeframe, %url, "requesting Yahoo chart data");

        let resp = self.client.get(&url).send().await.context("Yahoo chart request failed")?;
        let status = resp.status();
        let body: YahooChartResponse = resp.json().await.context("parsing Yahoo chart response")?;

        if !status.is_success() {
            anyhow::bail!("Yahoo chart endpoint returned {status}");
        }

        if let Some(err) = body.chart.error {
            anyhow::bail!("Yahoo chart error: {} — {}", err.code, err.description);
        }

        let result = body
            .chart
            .result
            .and_then(|mut r| r.pop())
            .context("Yahoo chart response had no result")?;

        Ok(Self::normalize(result))
    }

    /// Normalizes a raw Yahoo chart result into bars: drops rows where any
    /// of open/high/low/close is missing, coerces volume to an integer-like
    /// f64 with `None` treated as zero.
    fn normalize(result: YahooChartResult) -> Vec<Bar> {
        let timestamps = result.timestamp;
        let quote = result.indicators.quote.into_iter().next().unwrap_or_default();

        let mut bars = Vec::with_capacity(timestamps.len());
        for i in 0..timestamps.len() {
            let (Some(Some(open)), Some(Some(high)), Some(Some(low)), Some(Some(close))) = (
                quote.open.get(i).copied(),
                quote.high.get(i).copied(),
                quote.low.get(i).copied(),
                quote.close.get(i).copied(),
            ) else {
                continue;
            };

            let volume = quote
                .volume
                .get(i)
                .copied()
                .flatten()
                .map(|v| v.floor())
                .unwrap_or(0.0);

            let Some(timestamp) = Utc.timestamp_opt(timestamps[i], 0).single() else {
                continue;
            };

            bars.push(Bar {
                timestamp,
                open,
                high,
                low,
                close,
                volume,
            });
        }

        bars.sort_by_key(|b| b.timestamp);
        bars
    }
}

// ---------------------------------------------------------------------------
// Raw Yahoo chart JSON shapes
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct YahooChartResponse {
    chart: YahooChart,
}

#[derive(Debug, Deserialize)]
struct YahooChart {
    result: Option<Vec<YahooChartResult>>,
    error: Option<YahooChartError>,
}

#[derive(Debug, Deserialize)]
struct YahooChartError {
    code: String,
    description: String,
}

#[derive(Debug, Deserialize)]
struct YahooChartResult {
    timestamp: Vec<i64>,
    indicators: YahooIndicators,
}

#[derive(Debug, Deserialize, Default)]
struct YahooIndicators {
    quote: Vec<YahooQuote>,
}

#[derive(Debug, Deserialize, Default)]
struct YahooQuote {
    #[serde(default)]
    open: Vec<Option<f64>>,
    #[serde(default)]
    high: Vec<Option<f64>>,
    #[serde(default)]
    low: Vec<Option<f64>>,
    #[serde(default)]
    close: Vec<Option<f64>>,
    #[serde(default)]
    volume: Vec<Option<f64>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interval_mapping_matches_yahoo_vocabulary() {
        assert_eq!(resolve_interval("1d").unwrap(), "1d");
        assert_eq!(resolve_interval("1h").unwrap(), "60m");
        assert_eq!(resolve_interval("1mo").unwrap(), "1mo");
        assert!(resolve_interval("bogus").is_err());
    }

    #[test]
    fn normalize_drops_rows_with_missing_ohlc() {
        let result = YahooChartResult {
            timestamp: vec![1_700_000_000, 1_700_086_400, 1_700_172_800],
            indicators: YahooIndicators {
                quote: vec![YahooQuote {
                    open: vec![Some(1.0), None, Some(3.0)],
                    high: vec![Some(1.5), Some(2.5), Some(3.5)],
                    low: vec![Some(0.5), Some(1.5), Some(2.5)],
                    close: vec![Some(1.2), Some(2.2), Some(3.2)],
                    volume: vec![Some(100.0), Some(200.0), None],
                }],
            },
        };

        let bars = YahooProvider::normalize(result);
        assert_eq!(bars.len(), 2);
        assert_eq!(bars[0].close, 1.2);
        assert_eq!(bars[1].volume, 0.0);
    }
}
