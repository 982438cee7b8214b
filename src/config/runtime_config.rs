// =============================================================================
// Runtime Configuration — hot-reloadable engine settings with atomic save
// =============================================================================
//
// Unlike `Settings`, this document can change while the engine is running
// (via the HTTP control surface) and is persisted back to disk with an
// atomic tmp + rename write so a crash mid-save never corrupts it. Every
// field carries `#[serde(default)]` so that loading an older config file
// after a new field is added never fails.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

fn default_symbols() -> Vec<String> {
    vec!["AAPL".to_string(), "MSFT".to_string()]
}

fn default_max_concurrent_positions() -> u32 {
    10
}

fn default_max_daily_loss_pct() -> f64 {
    2.0
}

fn default_max_trades_per_day() -> u32 {
    50
}

fn default_max_position_size_pct() -> f64 {
    5.0
}

fn default_max_open_positions() -> u32 {
    10
}

fn default_min_buying_power_pct() -> f64 {
    10.0
}

/// Symbol universe and risk knobs the engine reloads without a restart.
/// Seeded from `Settings`' risk defaults on first run; overridden from here
/// after that via the HTTP control surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_symbols")]
    pub symbols: Vec<String>,

    #[serde(default = "default_max_concurrent_positions")]
    pub max_concurrent_positions: u32,

    #[serde(default = "default_max_daily_loss_pct")]
    pub max_daily_loss_pct: f64,

    #[serde(default = "default_max_trades_per_day")]
    pub max_trades_per_day: u32,

    #[serde(default = "default_max_position_size_pct")]
    pub max_position_size_pct: f64,

    #[serde(default = "default_max_open_positions")]
    pub max_open_positions: u32,

    #[serde(default = "default_min_buying_power_pct")]
    pub min_buying_power_pct: f64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            symbols: default_symbols(),
            max_concurrent_positions: default_max_concurrent_positions(),
            max_daily_loss_pct: default_max_daily_loss_pct(),
            max_trades_per_day: default_max_trades_per_day(),
            max_position_size_pct: default_max_position_size_pct(),
            max_open_positions: default_max_open_positions(),
            min_buying_power_pct: default_min_buying_power_pct(),
        }
    }
}

impl RuntimeConfig {
    /// Seeds a `RuntimeConfig` from `Settings`' risk defaults, used the
    /// first time the engine runs (before any persisted document exists).
    pub fn from_settings(settings: &super::settings::Settings) -> Self {
        Self {
            max_daily_loss_pct: settings.max_daily_loss_pct,
            max_position_size_pct: settings.max_position_size_pct,
            max_trades_per_day: settings.max_trades_per_day,
            ..Self::default()
        }
    }

    /// Converts this document into the risk gate's own limits type.
    pub fn to_risk_limits(&self) -> crate::risk::RiskLimits {
        crate::risk::RiskLimits {
            max_daily_loss_pct: self.max_daily_loss_pct,
            max_position_size_pct: self.max_position_size_pct,
            max_trades_per_day: self.max_trades_per_day,
            max_open_positions: self.max_open_positions,
            min_buying_power_pct: self.min_buying_power_pct,
        }
    }

    /// Loads configuration from a JSON file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read runtime config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse runtime config from {}", path.display()))?;

        info!(path = %path.display(), symbols = ?config.symbols, "runtime config loaded");
        Ok(config)
    }

    /// Persists the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename) so a crash mid-write never corrupts
    /// the previous, still-valid file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self).context("failed to serialise runtime config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "runtime config saved (atomic)");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.symbols, vec!["AAPL".to_string(), "MSFT".to_string()]);
        assert_eq!(cfg.max_concurrent_positions, 10);
        assert!((cfg.max_daily_loss_pct - 2.0).abs() < f64::EPSILON);
        assert_eq!(cfg.max_trades_per_day, 50);
    }

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let cfg: RuntimeConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.max_open_positions, 10);
        assert!((cfg.min_buying_power_pct - 10.0).abs() < f64::EPSILON);
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{ "symbols": ["TSLA"], "max_trades_per_day": 5 }"#;
        let cfg: RuntimeConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.symbols, vec!["TSLA".to_string()]);
        assert_eq!(cfg.max_trades_per_day, 5);
        assert_eq!(cfg.max_concurrent_positions, 10);
    }

    #[test]
    fn roundtrip_serialisation() {
        let cfg = RuntimeConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let cfg2: RuntimeConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg.symbols, cfg2.symbols);
        assert_eq!(cfg.max_concurrent_positions, cfg2.max_concurrent_positions);
    }

    #[test]
    fn save_then_load_round_trips_via_atomic_write() {
        let dir = std::env::temp_dir().join(format!("runtime_config_test_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("runtime_config.json");

        let mut cfg = RuntimeConfig::default();
        cfg.symbols = vec!["NVDA".to_string()];
        cfg.save(&path).unwrap();

        let loaded = RuntimeConfig::load(&path).unwrap();
        assert_eq!(loaded.symbols, vec!["NVDA".to_string()]);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn to_risk_limits_maps_every_field() {
        let cfg = RuntimeConfig::default();
        let limits = cfg.to_risk_limits();
        assert!((limits.max_daily_loss_pct - cfg.max_daily_loss_pct).abs() < f64::EPSILON);
        assert_eq!(limits.max_open_positions, cfg.max_open_positions);
    }
}
