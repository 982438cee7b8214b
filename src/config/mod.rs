// =============================================================================
// Configuration — startup settings + hot-reloadable runtime document
// =============================================================================

pub mod runtime_config;
pub mod settings;

pub use runtime_config::RuntimeConfig;
pub use settings::{AppEnv, LogLevel, Settings};
