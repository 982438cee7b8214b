// =============================================================================
// Local bar store — columnar per-symbol/per-timeframe persistence
// =============================================================================
//
// Layout:
//   <base_dir>/AAPL/1d.bin
//   <base_dir>/AAPL/1h.bin
//   <base_dir>/BTC_USD/1d.bin   (crypto symbols have '/' replaced with '_')
//
// Each file is a bincode-encoded `Vec<Bar>`, ascending by timestamp, no
// duplicate timestamps. Avoids re-downloading historical data and speeds up
// repeated backtests over the same window.

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::types::{Bar, Timeframe};

/// One row of [`BarStore::summary`].
#[derive(Debug, Clone)]
pub struct StorageSummaryEntry {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub bars: usize,
    pub size_mb: f64,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

pub struct BarStore {
    base_dir: PathBuf,
}

impl BarStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Result<Self> {
        let base_dir = base_dir.into();
        fs::create_dir_all(&base_dir)
            .with_context(|| format!("creating bar store directory {}", base_dir.display()))?;
        info!(path = %base_dir.display(), "BarStore initialised");
        Ok(Self { base_dir })
    }

    // ------------------------------------------------------------------
    // Save / load
    // ------------------------------------------------------------------

    /// Overwrites any existing data for `symbol`/`timeframe`.
    pub fn save(&self, symbol: &str, timeframe: Timeframe, bars: &[Bar]) -> Result<()> {
        if bars.is_empty() {
            warn!(symbol, %timeframe, "save: empty bar slice, nothing written");
            return Ok(());
        }

        let path = self.file_path(symbol, timeframe);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating directory {}", parent.display()))?;
        }

        let encoded = bincode::serialize(bars).context("encoding bars")?;
        fs::write(&path, encoded).with_context(|| format!("writing {}", path.display()))?;

        info!(symbol, %timeframe, count = bars.len(), path = %path.display(), "bars saved");
        Ok(())
    }

    /// Loads bars for `symbol`/`timeframe`, optionally bounded by `start`/`end`
    /// (both inclusive). Returns an empty vec if no data exists locally.
    pub fn load(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<Vec<Bar>> {
        let path = self.file_path(symbol, timeframe);
        if !path.exists() {
            debug!(symbol, %timeframe, "no local data");
            return Ok(Vec::new());
        }

        let raw = fs::read(&path).with_context(|| format!("reading {}", path.display()))?;
        let mut bars: Vec<Bar> = bincode::deserialize(&raw).context("decoding bars")?;

        // Stored bars are always UTC; a naive bound would be ambiguous, so
        // the API only accepts `DateTime<Utc>` and there is nothing further
        // to coerce here (unlike the pandas original, which juggled tz-aware
        // vs tz-naive indices).
        if let Some(s) = start {
            bars.retain(|b| b.timestamp >= s);
        }
        if let Some(e) = end {
            bars.retain(|b| b.timestamp <= e);
        }

        debug!(symbol, %timeframe, count = bars.len(), "bars loaded");
        Ok(bars)
    }

    /// Merges `new_bars` into the existing series: concatenate, dedupe by
    /// timestamp keeping the latest value, sort ascending, overwrite on disk.
    /// Returns the number of bars added to the total count.
    pub fn update(&self, symbol: &str, timeframe: Timeframe, new_bars: &[Bar]) -> Result<usize> {
        if new_bars.is_empty() {
            return Ok(0);
        }

        let existing = self.load(symbol, timeframe, None, None)?;
        if existing.is_empty() {
            self.save(symbol, timeframe, new_bars)?;
            return Ok(new_bars.len());
        }

        let before_count = existing.len();
        let mut combined = existing;
        combined.extend_from_slice(new_bars);

        // Keep the latest value per timestamp: sort so the newest write for
        // a given timestamp ends up last, then dedup keeping the last.
        combined.sort_by_key(|b| b.timestamp);
        combined.dedup_by(|a, b| {
            if a.timestamp == b.timestamp {
                *b = *a;
                true
            } else {
                false
            }
        });

        let added = combined.len().saturating_sub(before_count);
        self.save(symbol, timeframe, &combined)?;

        info!(
            symbol,
            %timeframe,
            added,
            total = combined.len(),
            "bars updated"
        );
        Ok(added)
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    pub fn has(&self, symbol: &str, timeframe: Timeframe) -> bool {
        self.file_path(symbol, timeframe).exists()
    }

    pub fn range(&self, symbol: &str, timeframe: Timeframe) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        let bars = self.load(symbol, timeframe, None, None).ok()?;
        let first = bars.first()?.timestamp;
        let last = bars.last()?.timestamp;
        Some((first, last))
    }

    pub fn bar_count(&self, symbol: &str, timeframe: Timeframe) -> usize {
        self.load(symbol, timeframe, None, None)
            .map(|b| b.len())
            .unwrap_or(0)
    }

    pub fn list_symbols(&self) -> Vec<String> {
        let Ok(entries) = fs::read_dir(&self.base_dir) else {
            return Vec::new();
        };

        let mut symbols: Vec<String> = entries
            .filter_map(|e| e.ok())
            .filter(|e| e.path().is_dir())
            .filter_map(|e| e.file_name().into_string().ok())
            .filter(|name| !name.starts_with('.'))
            .collect();
        symbols.sort();
        symbols
    }

    pub fn list_timeframes(&self, symbol: &str) -> Vec<Timeframe> {
        let dir = self.symbol_dir(symbol);
        let Ok(entries) = fs::read_dir(&dir) else {
            return Vec::new();
        };

        let mut timeframes: Vec<Timeframe> = entries
            .filter_map(|e| e.ok())
            .filter_map(|e| e.path().file_stem().and_then(|s| s.to_str().map(str::to_string)))
            .filter_map(|stem| Timeframe::parse(&stem))
            .collect();
        timeframes.sort_by_key(|tf| tf.as_str());
        timeframes
    }

    pub fn summary(&self) -> Vec<StorageSummaryEntry> {
        let mut out = Vec::new();
        for symbol in self.list_symbols() {
            for timeframe in self.list_timeframes(&symbol) {
                let path = self.file_path(&symbol, timeframe);
                let size_mb = fs::metadata(&path)
                    .map(|m| m.len() as f64 / (1024.0 * 1024.0))
                    .unwrap_or(0.0);
                let data_range = self.range(&symbol, timeframe);

                out.push(StorageSummaryEntry {
                    symbol: symbol.clone(),
                    timeframe,
                    bars: self.bar_count(&symbol, timeframe),
                    size_mb: (size_mb * 1000.0).round() / 1000.0,
                    start: data_range.map(|(s, _)| s),
                    end: data_range.map(|(_, e)| e),
                });
            }
        }
        out
    }

    // ------------------------------------------------------------------
    // Cleanup
    // ------------------------------------------------------------------

    pub fn delete(&self, symbol: &str, timeframe: Timeframe) -> Result<bool> {
        let path = self.file_path(symbol, timeframe);
        if !path.exists() {
            return Ok(false);
        }
        fs::remove_file(&path).with_context(|| format!("removing {}", path.display()))?;
        info!(symbol, %timeframe, "bars deleted");

        if let Some(parent) = path.parent() {
            if parent.exists() && fs::read_dir(parent)?.next().is_none() {
                fs::remove_dir(parent).ok();
            }
        }
        Ok(true)
    }

    pub fn delete_symbol(&self, symbol: &str) -> Result<usize> {
        let dir = self.symbol_dir(symbol);
        if !dir.exists() {
            return Ok(0);
        }
        let count = fs::read_dir(&dir)?
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().and_then(|x| x.to_str()) == Some("bin"))
            .count();
        fs::remove_dir_all(&dir).with_context(|| format!("removing {}", dir.display()))?;
        info!(symbol, count, "symbol data deleted");
        Ok(count)
    }

    // ------------------------------------------------------------------
    // Path helpers
    // ------------------------------------------------------------------

    fn symbol_dir(&self, symbol: &str) -> PathBuf {
        self.base_dir.join(Self::sanitize_symbol(symbol))
    }

    fn file_path(&self, symbol: &str, timeframe: Timeframe) -> PathBuf {
        self.symbol_dir(symbol).join(format!("{}.bin", timeframe.as_str()))
    }

    /// Filesystem-safe directory name: uppercase, `/` (crypto pairs) mapped
    /// to `_` since it's not a valid path separator on any target platform.
    fn sanitize_symbol(symbol: &str) -> String {
        symbol.to_uppercase().replace('/', "_")
    }
}

impl std::fmt::Debug for BarStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BarStore")
            .field("base_dir", &self.base_dir)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn bar(ts: DateTime<Utc>, close: f64) -> Bar {
        Bar {
            timestamp: ts,
            open: close,
            high: close + 1.0,
            low: close - 1.0,
            close,
            volume: 100.0,
        }
    }

    fn tmp_store() -> BarStore {
        let dir = std::env::temp_dir().join(format!("bar_store_test_{}", uuid::Uuid::new_v4()));
        BarStore::new(dir).unwrap()
    }

    #[test]
    fn save_and_load_roundtrip() {
        let store = tmp_store();
        let base = Utc::now();
        let bars = vec![bar(base, 1.0), bar(base + Duration::days(1), 2.0)];

        store.save("AAPL", Timeframe::D1, &bars).unwrap();
        let loaded = store.load("AAPL", Timeframe::D1, None, None).unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].close, 1.0);
    }

    #[test]
    fn load_missing_is_empty() {
        let store = tmp_store();
        let loaded = store.load("MSFT", Timeframe::D1, None, None).unwrap();
        assert!(loaded.is_empty());
    }

    #[test]
    fn update_merges_and_dedupes_keeping_latest() {
        let store = tmp_store();
        let base = Utc::now();

        store
            .save("AAPL", Timeframe::D1, &[bar(base, 1.0), bar(base + Duration::days(1), 2.0)])
            .unwrap();

        let added = store
            .update(
                "AAPL",
                Timeframe::D1,
                &[bar(base + Duration::days(1), 99.0), bar(base + Duration::days(2), 3.0)],
            )
            .unwrap();

        let loaded = store.load("AAPL", Timeframe::D1, None, None).unwrap();
        assert_eq!(loaded.len(), 3);
        assert_eq!(added, 1);
        // The duplicated timestamp keeps the newer write.
        assert_eq!(loaded[1].close, 99.0);
    }

    #[test]
    fn crypto_symbol_path_is_sanitized() {
        let store = tmp_store();
        let bars = vec![bar(Utc::now(), 50000.0)];
        store.save("BTC/USD", Timeframe::H1, &bars).unwrap();
        assert!(store.has("BTC/USD", Timeframe::H1));
        assert!(store.symbol_dir("BTC/USD").ends_with("BTC_USD"));
    }

    #[test]
    fn delete_removes_file_and_empty_parent() {
        let store = tmp_store();
        store.save("AAPL", Timeframe::D1, &[bar(Utc::now(), 1.0)]).unwrap();
        assert!(store.delete("AAPL", Timeframe::D1).unwrap());
        assert!(!store.has("AAPL", Timeframe::D1));
        assert!(!store.delete("AAPL", Timeframe::D1).unwrap());
    }

    #[test]
    fn list_symbols_and_timeframes() {
        let store = tmp_store();
        store.save("AAPL", Timeframe::D1, &[bar(Utc::now(), 1.0)]).unwrap();
        store.save("AAPL", Timeframe::H1, &[bar(Utc::now(), 1.0)]).unwrap();
        store.save("MSFT", Timeframe::D1, &[bar(Utc::now(), 1.0)]).unwrap();

        assert_eq!(store.list_symbols(), vec!["AAPL".to_string(), "MSFT".to_string()]);
        let tfs = store.list_timeframes("AAPL");
        assert_eq!(tfs.len(), 2);
    }
}
