// =============================================================================
// Settings — process-environment startup configuration
// =============================================================================
//
// Loaded once at process start from `.env` + the environment via `envy`.
// Unlike `RuntimeConfig`, these values never change for the life of the
// process — changing them means restarting with a new environment.

use serde::Deserialize;
use tracing::info;

fn default_alpaca_base_url() -> String {
    "https://paper-api.alpaca.markets".to_string()
}

fn default_database_url() -> String {
    "sqlite://trading_bot.db".to_string()
}

fn default_app_env() -> AppEnv {
    AppEnv::Development
}

fn default_log_level() -> LogLevel {
    LogLevel::Info
}

fn default_max_daily_loss_pct() -> f64 {
    2.0
}

fn default_max_position_size_pct() -> f64 {
    5.0
}

fn default_max_trades_per_day() -> u32 {
    50
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AppEnv {
    Development,
    Staging,
    Production,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, serde::Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl LogLevel {
    /// Maps to the `tracing`/`EnvFilter` directive this level corresponds to.
    pub fn as_filter_str(&self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warning => "warn",
            Self::Error => "error",
            Self::Critical => "error",
        }
    }
}

/// Startup settings loaded once via `envy` from the process environment
/// (after `dotenv::dotenv()` has merged in `.env`). `alpaca_secret_key` is
/// deliberately excluded from the derived `Debug` output.
#[derive(Clone, Deserialize)]
pub struct Settings {
    pub alpaca_api_key: String,
    pub alpaca_secret_key: String,

    #[serde(default = "default_alpaca_base_url")]
    pub alpaca_base_url: String,

    #[serde(default = "default_database_url")]
    pub database_url: String,

    #[serde(default = "default_app_env")]
    pub app_env: AppEnv,

    #[serde(default = "default_log_level")]
    pub log_level: LogLevel,

    #[serde(default = "default_max_daily_loss_pct")]
    pub max_daily_loss_pct: f64,

    #[serde(default = "default_max_position_size_pct")]
    pub max_position_size_pct: f64,

    #[serde(default = "default_max_trades_per_day")]
    pub max_trades_per_day: u32,
}

impl std::fmt::Debug for Settings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Settings")
            .field("alpaca_api_key", &self.alpaca_api_key)
            .field("alpaca_secret_key", &"<redacted>")
            .field("alpaca_base_url", &self.alpaca_base_url)
            .field("database_url", &self.database_url)
            .field("app_env", &self.app_env)
            .field("log_level", &self.log_level)
            .field("max_daily_loss_pct", &self.max_daily_loss_pct)
            .field("max_position_size_pct", &self.max_position_size_pct)
            .field("max_trades_per_day", &self.max_trades_per_day)
            .finish()
    }
}

impl Settings {
    /// Loads `.env` (if present) then parses the environment. Fails if
    /// `ALPACA_API_KEY`/`ALPACA_SECRET_KEY` are missing — there is no
    /// sensible default for credentials.
    pub fn load() -> anyhow::Result<Self> {
        // No `.env` file is not an error — the environment may already carry
        // everything (container deployments, CI).
        let _ = dotenv::dotenv();

        let settings: Self = envy::from_env().map_err(|e| anyhow::anyhow!("failed to load settings from environment: {e}"))?;

        info!(
            app_env = ?settings.app_env,
            is_paper = settings.is_paper(),
            base_url = %settings.base_url_clean(),
            "settings loaded"
        );

        Ok(settings)
    }

    /// True when `alpaca_base_url` is Alpaca's paper-trading host.
    pub fn is_paper(&self) -> bool {
        self.alpaca_base_url.to_lowercase().contains("paper")
    }

    /// `alpaca_base_url` with any trailing slash and `/v2` suffix stripped —
    /// the broker client appends its own versioned path segments.
    pub fn base_url_clean(&self) -> String {
        let mut url = self.alpaca_base_url.trim_end_matches('/').to_string();
        if let Some(stripped) = url.strip_suffix("/v2") {
            url = stripped.to_string();
        }
        url
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(base_url: &str) -> Settings {
        Settings {
            alpaca_api_key: "key".to_string(),
            alpaca_secret_key: "secret".to_string(),
            alpaca_base_url: base_url.to_string(),
            database_url: default_database_url(),
            app_env: AppEnv::Development,
            log_level: LogLevel::Info,
            max_daily_loss_pct: default_max_daily_loss_pct(),
            max_position_size_pct: default_max_position_size_pct(),
            max_trades_per_day: default_max_trades_per_day(),
        }
    }

    #[test]
    fn is_paper_detects_paper_host() {
        assert!(settings("https://paper-api.alpaca.markets").is_paper());
        assert!(!settings("https://api.alpaca.markets").is_paper());
    }

    #[test]
    fn base_url_clean_strips_trailing_slash_and_v2_suffix() {
        assert_eq!(settings("https://api.alpaca.markets/v2/").base_url_clean(), "https://api.alpaca.markets");
        assert_eq!(settings("https://api.alpaca.markets").base_url_clean(), "https://api.alpaca.markets");
    }

    #[test]
    fn debug_impl_redacts_secret_key() {
        let s = settings("https://paper-api.alpaca.markets");
        let debug_str = format!("{s:?}");
        assert!(!debug_str.contains("secret"));
        assert!(debug_str.contains("<redacted>"));
    }
}
