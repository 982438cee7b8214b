// =============================================================================
// Market-data service — unifies local storage, history provider, and broker
// =============================================================================
//
// "Smart fetch" pattern: look in local storage first; if that doesn't cover
// the requested window, download from the history provider and persist it
// locally for next time.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::broker::Broker;
use crate::storage::bar_store::BarStore;
use crate::storage::yahoo_provider::YahooProvider;
use crate::types::{Bar, Timeframe};

/// Historical-data source selection for [`MarketDataService::get_historical_data`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataSource {
    Local,
    History,
    Auto,
}

#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    pub bars_entries: usize,
    pub price_entries: usize,
    pub ttl_seconds: u64,
}

struct BarsCacheEntry {
    fetched_at: u64,
    bars: Vec<Bar>,
}

struct PriceCacheEntry {
    fetched_at: u64,
    price: f64,
}

pub struct MarketDataService {
    broker: Arc<dyn Broker>,
    store: Arc<BarStore>,
    yahoo: Arc<YahooProvider>,
    cache_ttl_secs: u64,
    bars_cache: RwLock<HashMap<String, BarsCacheEntry>>,
    price_cache: RwLock<HashMap<String, PriceCacheEntry>>,
}

impl MarketDataService {
    pub fn new(
        broker: Arc<dyn Broker>,
        store: Arc<BarStore>,
        yahoo: Arc<YahooProvider>,
        cache_ttl_secs: u64,
    ) -> Self {
        info!(cache_ttl_secs, "MarketDataService initialised");
        Self {
            broker,
            store,
            yahoo,
            cache_ttl_secs,
            bars_cache: RwLock::new(HashMap::new()),
            price_cache: RwLock::new(HashMap::new()),
        }
    }

    fn now_epoch() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before UNIX epoch")
            .as_secs()
    }

    // ------------------------------------------------------------------
    // Live data (async, via broker)
    // ------------------------------------------------------------------

    /// Fetch bars for a single symbol via the broker, cache → broker → cache.
    /// Never fails: broker errors are logged and an empty vec is returned.
    pub async fn get_bars(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
        limit: Option<usize>,
        use_cache: bool,
    ) -> Vec<Bar> {
        let cache_key = Self::bars_cache_key(symbol, timeframe, start, end, limit);

        if use_cache && self.cache_ttl_secs > 0 {
            if let Some(bars) = self.get_from_cache(&cache_key) {
                debug!(symbol, %timeframe, "bars cache hit");
                return bars;
            }
        }

        match self.broker.get_bars(symbol, timeframe, start, end, limit).await {
            Ok(bars) if bars.is_empty() => {
                warn!(symbol, %timeframe, "no bars returned for symbol");
                bars
            }
            Ok(bars) => {
                if use_cache && self.cache_ttl_secs > 0 {
                    self.put_in_cache(cache_key, &bars);
                }
                debug!(symbol, %timeframe, count = bars.len(), "bars fetched");
                bars
            }
            Err(e) => {
                warn!(symbol, %timeframe, error = %e, "failed to fetch bars");
                Vec::new()
            }
        }
    }

    /// Fetch bars for multiple symbols concurrently. Drops symbols with
    /// errors or empty results; logs each.
    pub async fn get_bars_for_symbols(
        &self,
        symbols: &[String],
        timeframe: Timeframe,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
        limit: Option<usize>,
        use_cache: bool,
    ) -> HashMap<String, Vec<Bar>> {
        if symbols.is_empty() {
            warn!("get_bars_for_symbols called with an empty symbol list");
            return HashMap::new();
        }

        info!(count = symbols.len(), %timeframe, ?limit, "fetching bars for symbols");

        let futures = symbols
            .iter()
            .map(|symbol| self.get_bars(symbol, timeframe, start, end, limit, use_cache));
        let gathered = futures_util::future::join_all(futures).await;

        let mut results = HashMap::new();
        for (symbol, bars) in symbols.iter().zip(gathered) {
            if bars.is_empty() {
                warn!(symbol, "empty bars, omitting from result");
            } else {
                results.insert(symbol.clone(), bars);
            }
        }

        info!(fetched = results.len(), requested = symbols.len(), "bars fetch complete");
        results
    }

    pub async fn get_latest_price(&self, symbol: &str, use_cache: bool) -> Option<f64> {
        if use_cache && self.cache_ttl_secs > 0 {
            let cache = self.price_cache.read();
            if let Some(entry) = cache.get(symbol) {
                if Self::now_epoch() - entry.fetched_at < self.cache_ttl_secs {
                    debug!(symbol, "price cache hit");
                    return Some(entry.price);
                }
            }
        }

        match self.broker.get_latest_price(symbol).await {
            Ok(price) => {
                if use_cache && self.cache_ttl_secs > 0 {
                    self.price_cache.write().insert(
                        symbol.to_string(),
                        PriceCacheEntry {
                            fetched_at: Self::now_epoch(),
                            price,
                        },
                    );
                }
                Some(price)
            }
            Err(e) => {
                warn!(symbol, error = %e, "failed to fetch latest price");
                None
            }
        }
    }

    pub async fn get_latest_prices(&self, symbols: &[String], use_cache: bool) -> HashMap<String, f64> {
        if symbols.is_empty() {
            return HashMap::new();
        }

        let futures = symbols.iter().map(|s| self.get_latest_price(s, use_cache));
        let gathered = futures_util::future::join_all(futures).await;

        symbols
            .iter()
            .zip(gathered)
            .filter_map(|(s, price)| price.map(|p| (s.clone(), p)))
            .collect()
    }

    pub async fn is_market_open(&self) -> bool {
        match self.broker.is_market_open().await {
            Ok(open) => open,
            Err(e) => {
                warn!(error = %e, "failed to query market status");
                false
            }
        }
    }

    // ------------------------------------------------------------------
    // Historical data for backtesting (local + history provider)
    // ------------------------------------------------------------------

    pub async fn get_historical_data(
        &self,
        symbols: &[String],
        timeframe: Timeframe,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
        source: DataSource,
    ) -> HashMap<String, Vec<Bar>> {
        if symbols.is_empty() {
            return HashMap::new();
        }

        info!(?symbols, %timeframe, ?start, ?end, ?source, "get_historical_data");

        let mut results = HashMap::new();
        for symbol in symbols {
            let bars = self.fetch_historical_single(symbol, timeframe, start, end, source).await;
            if bars.is_empty() {
                warn!(symbol, "no historical data available");
            } else {
                results.insert(symbol.clone(), bars);
            }
        }

        info!(fetched = results.len(), requested = symbols.len(), "historical data loaded");
        results
    }

    /// Pre-download and persist historical bars in bulk. Returns the number
    /// of bars written per symbol.
    pub async fn download_and_store(
        &self,
        symbols: &[String],
        timeframe: Timeframe,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> HashMap<String, usize> {
        info!(?symbols, %timeframe, "bulk download starting");

        let data = self
            .yahoo
            .download_multiple(symbols, start, end, timeframe.as_str())
            .await;

        let mut result = HashMap::new();
        for symbol in symbols {
            match data.get(symbol) {
                Some(bars) if !bars.is_empty() => {
                    if let Err(e) = self.store.save(symbol, timeframe, bars) {
                        warn!(symbol, error = %e, "failed to persist downloaded bars");
                        result.insert(symbol.clone(), 0);
                        continue;
                    }
                    info!(symbol, %timeframe, count = bars.len(), "stored");
                    result.insert(symbol.clone(), bars.len());
                }
                _ => {
                    result.insert(symbol.clone(), 0);
                }
            }
        }
        result
    }

    async fn fetch_historical_single(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
        source: DataSource,
    ) -> Vec<Bar> {
        match source {
            DataSource::Local => self.store.load(symbol, timeframe, start, end).unwrap_or_default(),
            DataSource::History => {
                let bars = self.yahoo.download(symbol, start, end, timeframe.as_str()).await;
                if !bars.is_empty() {
                    if let Err(e) = self.store.save(symbol, timeframe, &bars) {
                        warn!(symbol, error = %e, "failed to persist downloaded bars");
                    }
                }
                bars
            }
            DataSource::Auto => {
                let local = self.store.load(symbol, timeframe, start, end).unwrap_or_default();
                if Self::range_covers(&local, start, end) {
                    debug!(symbol, %timeframe, "local data sufficient");
                    return local;
                }

                info!(symbol, %timeframe, "local data insufficient, downloading");
                let downloaded = self.yahoo.download(symbol, start, end, timeframe.as_str()).await;

                if downloaded.is_empty() {
                    return local;
                }

                if let Err(e) = self.store.update(symbol, timeframe, &downloaded) {
                    warn!(symbol, error = %e, "failed to merge downloaded bars into store");
                    return downloaded;
                }

                self.store.load(symbol, timeframe, start, end).unwrap_or_default()
            }
        }
    }

    /// Weekend/holiday tolerance: 2 days of slack at the start, 5 at the end.
    fn range_covers(bars: &[Bar], start: Option<DateTime<Utc>>, end: Option<DateTime<Utc>>) -> bool {
        let (Some(first), Some(last)) = (bars.first(), bars.last()) else {
            return false;
        };

        if let Some(s) = start {
            if first.timestamp > s + Duration::days(2) {
                return false;
            }
        }
        if let Some(e) = end {
            if last.timestamp < e - Duration::days(5) {
                return false;
            }
        }
        true
    }

    // ------------------------------------------------------------------
    // Data utilities
    // ------------------------------------------------------------------

    /// Resample ascending bars to a coarser timeframe: open=first, high=max,
    /// low=min, close=last, volume=sum per bucket.
    pub fn resample(bars: &[Bar], target: Timeframe) -> Vec<Bar> {
        if bars.is_empty() {
            return Vec::new();
        }

        let spacing = target.spacing_seconds();
        let mut buckets: Vec<(i64, Vec<&Bar>)> = Vec::new();

        for bar in bars {
            let bucket_start = (bar.timestamp.timestamp() / spacing) * spacing;
            match buckets.last_mut() {
                Some((key, group)) if *key == bucket_start => group.push(bar),
                _ => buckets.push((bucket_start, vec![bar])),
            }
        }

        buckets
            .into_iter()
            .filter_map(|(bucket_start, group)| {
                let open = group.first()?.open;
                let close = group.last()?.close;
                if !open.is_finite() || !close.is_finite() {
                    return None;
                }
                Some(Bar {
                    timestamp: DateTime::from_timestamp(bucket_start, 0)?,
                    open,
                    high: group.iter().map(|b| b.high).fold(f64::MIN, f64::max),
                    low: group.iter().map(|b| b.low).fold(f64::MAX, f64::min),
                    close,
                    volume: group.iter().map(|b| b.volume).sum(),
                })
            })
            .collect()
    }

    /// Percent-change of closes, one shorter than the input.
    pub fn returns(bars: &[Bar], periods: usize) -> Vec<f64> {
        if periods == 0 || bars.len() <= periods {
            return Vec::new();
        }
        bars.windows(periods + 1)
            .map(|w| {
                let prev = w.first().unwrap().close;
                let cur = w.last().unwrap().close;
                (cur - prev) / prev
            })
            .collect()
    }

    // ------------------------------------------------------------------
    // Cache administration
    // ------------------------------------------------------------------

    pub fn clear_cache(&self) {
        let mut bars = self.bars_cache.write();
        let mut prices = self.price_cache.write();
        let count = bars.len() + prices.len();
        bars.clear();
        prices.clear();
        debug!(count, "cache cleared");
    }

    pub fn clear_expired_cache(&self) -> usize {
        let now = Self::now_epoch();
        let mut removed = 0;

        self.bars_cache.write().retain(|_, entry| {
            let keep = now - entry.fetched_at < self.cache_ttl_secs;
            if !keep {
                removed += 1;
            }
            keep
        });
        self.price_cache.write().retain(|_, entry| {
            let keep = now - entry.fetched_at < self.cache_ttl_secs;
            if !keep {
                removed += 1;
            }
            keep
        });

        if removed > 0 {
            debug!(removed, "expired cache entries evicted");
        }
        removed
    }

    pub fn cache_stats(&self) -> CacheStats {
        CacheStats {
            bars_entries: self.bars_cache.read().len(),
            price_entries: self.price_cache.read().len(),
            ttl_seconds: self.cache_ttl_secs,
        }
    }

    fn bars_cache_key(
        symbol: &str,
        timeframe: Timeframe,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
        limit: Option<usize>,
    ) -> String {
        format!(
            "{symbol}|{timeframe}|{}|{}|{}",
            start.map(|s| s.to_rfc3339()).unwrap_or_else(|| "none".to_string()),
            end.map(|e| e.to_rfc3339()).unwrap_or_else(|| "none".to_string()),
            limit.map(|l| l.to_string()).unwrap_or_else(|| "none".to_string()),
        )
    }

    fn get_from_cache(&self, key: &str) -> Option<Vec<Bar>> {
        let cache = self.bars_cache.read();
        let entry = cache.get(key)?;
        if Self::now_epoch() - entry.fetched_at >= self.cache_ttl_secs {
            return None;
        }
        Some(entry.bars.clone())
    }

    fn put_in_cache(&self, key: String, bars: &[Bar]) {
        self.bars_cache.write().insert(
            key,
            BarsCacheEntry {
                fetched_at: Self::now_epoch(),
                bars: bars.to_vec(),
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn bar(ts: DateTime<Utc>, open: f64, high: f64, low: f64, close: f64, volume: f64) -> Bar {
        Bar {
            timestamp: ts,
            open,
            high,
            low,
            close,
            volume,
        }
    }

    #[test]
    fn resample_aggregates_ohlcv_per_bucket() {
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let bars = vec![
            bar(base, 10.0, 12.0, 9.0, 11.0, 100.0),
            bar(base + Duration::minutes(1), 11.0, 13.0, 10.0, 12.0, 50.0),
            bar(base + Duration::minutes(5), 12.0, 14.0, 11.0, 13.0, 70.0),
        ];

        let resampled = MarketDataService::resample(&bars, Timeframe::M5);
        assert_eq!(resampled.len(), 2);
        assert_eq!(resampled[0].open, 10.0);
        assert_eq!(resampled[0].close, 12.0);
        assert_eq!(resampled[0].high, 13.0);
        assert_eq!(resampled[0].low, 9.0);
        assert_eq!(resampled[0].volume, 150.0);
    }

    #[test]
    fn returns_computes_pct_change() {
        let base = Utc::now();
        let bars = vec![
            bar(base, 0.0, 0.0, 0.0, 100.0, 0.0),
            bar(base + Duration::days(1), 0.0, 0.0, 0.0, 110.0, 0.0),
            bar(base + Duration::days(2), 0.0, 0.0, 0.0, 99.0, 0.0),
        ];
        let rets = MarketDataService::returns(&bars, 1);
        assert_eq!(rets.len(), 2);
        assert!((rets[0] - 0.10).abs() < 1e-9);
        assert!((rets[1] - (-0.1)).abs() < 1e-9);
    }

    #[test]
    fn range_covers_tolerates_weekends() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap();
        let bars = vec![
            bar(start + Duration::days(1), 1.0, 1.0, 1.0, 1.0, 1.0),
            bar(end - Duration::days(3), 1.0, 1.0, 1.0, 1.0, 1.0),
        ];
        assert!(MarketDataService::range_covers(&bars, Some(start), Some(end)));
    }

    #[test]
    fn range_covers_rejects_insufficient_start() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let bars = vec![bar(start + Duration::days(10), 1.0, 1.0, 1.0, 1.0, 1.0)];
        assert!(!MarketDataService::range_covers(&bars, Some(start), None));
    }

    #[test]
    fn range_covers_empty_is_false() {
        assert!(!MarketDataService::range_covers(&[], None, None));
    }
}
