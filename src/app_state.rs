// =============================================================================
// Central Application State — composition root for the HTTP/WS shell
// =============================================================================
//
// Ties every subsystem built by `main` into the one object request handlers
// see via axum's `State<Arc<AppState>>`. AppState itself holds no trading
// logic — it is a bag of `Arc`s plus the mutable runtime document and a
// version counter the WebSocket layer watches for change.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;

use crate::broker::Broker;
use crate::config::{RuntimeConfig, Settings};
use crate::engine::TradingEngine;
use crate::event_bus::EventBus;
use crate::market_data_service::MarketDataService;
use crate::persistence::PersistencePort;
use crate::risk::RiskManager;
use crate::strategy::registry::StrategyRegistry;

/// Central application state shared across all request handlers via
/// `Arc<AppState>`. Holds no trading logic of its own — every method here
/// just forwards to the subsystem that owns the behaviour.
pub struct AppState {
    pub engine: Arc<TradingEngine>,
    pub broker: Arc<dyn Broker>,
    pub market_data: Arc<MarketDataService>,
    pub risk: Arc<RiskManager>,
    pub registry: Arc<StrategyRegistry>,
    pub persistence: Arc<dyn PersistencePort>,
    pub event_bus: Arc<EventBus>,
    pub settings: Arc<Settings>,
    pub runtime_config: RwLock<RuntimeConfig>,
    config_path: PathBuf,
    start_time: Instant,
    version: AtomicU64,
}

impl AppState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        engine: Arc<TradingEngine>,
        broker: Arc<dyn Broker>,
        market_data: Arc<MarketDataService>,
        risk: Arc<RiskManager>,
        registry: Arc<StrategyRegistry>,
        persistence: Arc<dyn PersistencePort>,
        event_bus: Arc<EventBus>,
        settings: Arc<Settings>,
        runtime_config: RuntimeConfig,
        config_path: PathBuf,
    ) -> Self {
        Self {
            engine,
            broker,
            market_data,
            risk,
            registry,
            persistence,
            event_bus,
            settings,
            runtime_config: RwLock::new(runtime_config),
            config_path,
            start_time: Instant::now(),
            version: AtomicU64::new(0),
        }
    }

    /// Bumps the version the WS layer polls for "did anything change". Not
    /// every mutation needs this — only ones a dashboard would care about.
    pub fn increment_version(&self) -> u64 {
        self.version.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn current_version(&self) -> u64 {
        self.version.load(Ordering::Relaxed)
    }

    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Persists the current `runtime_config` to disk and re-syncs the risk
    /// manager's limits from it. Called after any control-surface write.
    pub fn persist_runtime_config(&self) -> anyhow::Result<()> {
        let config = self.runtime_config.read().clone();
        self.risk.update_limits(&serde_json::to_value(config.to_risk_limits())?);
        config.save(&self.config_path)
    }
}
