// =============================================================================
// quantum-trader — Main Entry Point
// =============================================================================
//
// Composition root: loads settings, wires every subsystem together, and
// serves the HTTP/WS shell until a shutdown signal arrives. Exits 0 on a
// clean ctrl-c shutdown, non-zero if anything in the init sequence fails.

mod api;
mod app_state;
mod backtester;
mod broker;
mod config;
mod engine;
mod error;
mod event_bus;
mod indicators;
mod market_data_service;
mod persistence;
mod risk;
mod storage;
mod strategy;
mod types;

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::broker::alpaca::AlpacaBroker;
use crate::broker::Broker;
use crate::config::{RuntimeConfig, Settings};
use crate::engine::TradingEngine;
use crate::event_bus::EventBus;
use crate::market_data_service::MarketDataService;
use crate::persistence::sqlite_store::SqliteStore;
use crate::persistence::PersistencePort;
use crate::risk::RiskManager;
use crate::storage::bar_store::BarStore;
use crate::storage::yahoo_provider::YahooProvider;
use crate::strategy::registry::StrategyRegistry;

const RUNTIME_CONFIG_PATH: &str = "runtime_config.json";
const BAR_STORE_DIR: &str = "data/bars";
const MARKET_DATA_CACHE_TTL_SECS: u64 = 30;

fn init_tracing() {
    let filter = std::env::var("LOG_LEVEL")
        .map(|level| EnvFilter::new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn load_runtime_config(settings: &Settings) -> RuntimeConfig {
    match RuntimeConfig::load(RUNTIME_CONFIG_PATH) {
        Ok(config) => config,
        Err(e) => {
            info!(error = %e, "no runtime config on disk yet, seeding from settings");
            RuntimeConfig::from_settings(settings)
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let settings = match Settings::load() {
        Ok(s) => Arc::new(s),
        Err(e) => {
            error!(error = %e, "failed to load settings");
            std::process::exit(1);
        }
    };

    let runtime_config = load_runtime_config(&settings);
    info!(symbols = ?runtime_config.symbols, is_paper = settings.is_paper(), "starting quantum-trader");

    let broker: Arc<dyn Broker> = Arc::new(AlpacaBroker::new(
        settings.alpaca_api_key.clone(),
        settings.alpaca_secret_key.clone(),
        settings.is_paper(),
    ));

    let bar_store = match BarStore::new(BAR_STORE_DIR) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!(error = %e, "failed to initialise local bar store");
            std::process::exit(1);
        }
    };
    let yahoo = Arc::new(YahooProvider::new());
    let market_data = Arc::new(MarketDataService::new(
        broker.clone(),
        bar_store,
        yahoo,
        MARKET_DATA_CACHE_TTL_SECS,
    ));

    let persistence: Arc<dyn PersistencePort> = match SqliteStore::connect(&settings.database_url).await {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!(error = %e, "failed to connect to persistence store");
            std::process::exit(1);
        }
    };

    let registry = Arc::new(StrategyRegistry::with_defaults());
    let risk = Arc::new(RiskManager::new(runtime_config.to_risk_limits()));
    let event_bus = Arc::new(EventBus::new());

    let engine = Arc::new(TradingEngine::new(
        broker.clone(),
        market_data.clone(),
        risk.clone(),
        registry.clone(),
        persistence.clone(),
        event_bus.clone(),
    ));

    if let Err(e) = engine.initialize().await {
        error!(error = %e, "engine initialization failed");
        std::process::exit(1);
    }

    let app_state = Arc::new(AppState::new(
        engine.clone(),
        broker,
        market_data,
        risk,
        registry,
        persistence,
        event_bus,
        settings.clone(),
        runtime_config,
        PathBuf::from(RUNTIME_CONFIG_PATH),
    ));

    let bind_addr = std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3001".to_string());
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!(addr = %bind_addr, "HTTP/WS shell listening");

    let router = api::router(app_state.clone());
    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router).await {
            error!(error = %e, "HTTP server exited unexpectedly");
        }
    });

    info!("quantum-trader running. Press Ctrl+C to stop.");

    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received, stopping gracefully");

    server.abort();
    app_state.engine.stop().await;

    if let Err(e) = app_state.persist_runtime_config() {
        error!(error = %e, "failed to save runtime config on shutdown");
    }

    info!("quantum-trader shut down complete");
    Ok(())
}
