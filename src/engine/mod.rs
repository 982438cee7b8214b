// =============================================================================
// Trading engine — scheduler, lifecycle state machine, event emission
// =============================================================================
//
// One task per running strategy, each on its own clock
// (`Timeframe::cycle_interval_secs`). A cycle fetches bars, asks the
// strategy for signals, sizes and risk-gates any actionable ones, submits
// orders, and persists what happened. Errors in a single cycle never take
// down the engine — they back off and, after five in a row, retire that
// one strategy into ERROR while everything else keeps running.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use parking_lot::RwLock;
use serde_json::{json, Value};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::{debug, error, info, instrument, warn};

use crate::broker::Broker;
use crate::event_bus::EventBus;
use crate::market_data_service::MarketDataService;
use crate::persistence::{NewTradeAttempt, PersistencePort};
use crate::risk::RiskManager;
use crate::strategy::registry::{SharedStrategy, StrategyRegistry};
use crate::strategy::Strategy;
use crate::types::{EngineEvent, EngineEventKind, NewOrder, OrderSide, Signal, TradeStatus};

const MAX_CONSECUTIVE_ERRORS: u32 = 5;
const MAX_BACKOFF_SECS: u64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineState {
    Stopped,
    Initializing,
    Running,
    ShuttingDown,
    Error,
}

struct StrategyTask {
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
    run_id: i64,
}

pub struct TradingEngine {
    broker: Arc<dyn Broker>,
    market_data: Arc<MarketDataService>,
    risk: Arc<RiskManager>,
    registry: Arc<StrategyRegistry>,
    persistence: Arc<dyn PersistencePort>,
    event_bus: Arc<EventBus>,
    state: RwLock<EngineState>,
    tasks: RwLock<HashMap<String, StrategyTask>>,
    total_cycles: Arc<AtomicU64>,
    total_orders: Arc<AtomicU64>,
}

impl TradingEngine {
    pub fn new(
        broker: Arc<dyn Broker>,
        market_data: Arc<MarketDataService>,
        risk: Arc<RiskManager>,
        registry: Arc<StrategyRegistry>,
        persistence: Arc<dyn PersistencePort>,
        event_bus: Arc<EventBus>,
    ) -> Self {
        Self {
            broker,
            market_data,
            risk,
            registry,
            persistence,
            event_bus,
            state: RwLock::new(EngineState::Stopped),
            tasks: RwLock::new(HashMap::new()),
            total_cycles: Arc::new(AtomicU64::new(0)),
            total_orders: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn state(&self) -> EngineState {
        *self.state.read()
    }

    pub fn active_strategies(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tasks.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn total_cycles(&self) -> u64 {
        self.total_cycles.load(Ordering::Relaxed)
    }

    pub fn total_orders(&self) -> u64 {
        self.total_orders.load(Ordering::Relaxed)
    }

    pub fn registry(&self) -> &Arc<StrategyRegistry> {
        &self.registry
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    #[instrument(skip(self))]
    pub async fn initialize(&self) -> anyhow::Result<()> {
        *self.state.write() = EngineState::Initializing;

        let available = self.registry.list_strategies();
        info!(count = available.len(), strategies = ?available, "strategies discovered");

        let account = match self.broker.get_account().await {
            Ok(a) => a,
            Err(e) => {
                *self.state.write() = EngineState::Error;
                return Err(e.context("engine initialize: broker account check failed"));
            }
        };

        let market_open = match self.broker.is_market_open().await {
            Ok(open) => open,
            Err(e) => {
                *self.state.write() = EngineState::Error;
                return Err(e.context("engine initialize: broker clock check failed"));
            }
        };

        *self.state.write() = EngineState::Running;
        self.event_bus.publish(EngineEvent::new(
            EngineEventKind::EngineStarted,
            json!({
                "account_id": account.id,
                "equity": account.equity,
                "strategies_available": available,
                "market_open": market_open,
            }),
        ));
        info!("engine initialized and running");
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn start_strategy(&self, name: &str) -> anyhow::Result<()> {
        if self.state() != EngineState::Running {
            anyhow::bail!("engine is not running (state={:?})", self.state());
        }
        if self.tasks.read().contains_key(name) {
            anyhow::bail!("ALREADY_RUNNING: strategy '{name}' is already running");
        }

        let instance = self.registry.get_strategy(name)?;
        {
            let mut guard = instance.write().await;
            guard.start().await;
        }

        let (symbols, timeframe, parameters_json) = {
            let guard = instance.read().await;
            (guard.symbols().to_vec(), guard.timeframe(), guard.get_parameters())
        };

        let started_at = Utc::now();
        let run_id = self
            .persistence
            .open_strategy_run(name, &symbols, timeframe, parameters_json, started_at)
            .await?;

        let (stop_tx, stop_rx) = watch::channel(false);
        let engine = self.clone_for_task();
        let strategy_name = name.to_string();

        let handle = tokio::spawn(async move {
            engine.strategy_loop(strategy_name, instance, run_id, started_at, stop_rx).await;
        });

        self.tasks.write().insert(name.to_string(), StrategyTask { stop_tx, handle, run_id });

        self.event_bus.publish(EngineEvent::new(
            EngineEventKind::StrategyStarted,
            json!({"strategy": name, "symbols": symbols, "timeframe": timeframe.as_str(), "run_id": run_id}),
        ));
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn stop_strategy(&self, name: &str) -> anyhow::Result<()> {
        let task = self.tasks.write().remove(name);
        let Some(task) = task else {
            anyhow::bail!("strategy '{name}' is not running");
        };

        let _ = task.stop_tx.send(true);
        if let Err(e) = task.handle.await {
            warn!(strategy = name, error = %e, "strategy task panicked while stopping");
        }

        if let Ok(instance) = self.registry.get_strategy(name) {
            instance.write().await.stop().await;
        }
        self.persistence.mark_strategy_run_stopped(task.run_id, Utc::now()).await.ok();

        self.event_bus
            .publish(EngineEvent::new(EngineEventKind::StrategyStopped, json!({"strategy": name})));
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn stop(&self) {
        *self.state.write() = EngineState::ShuttingDown;

        let names: Vec<String> = self.tasks.read().keys().cloned().collect();
        for name in names {
            if let Err(e) = self.stop_strategy(&name).await {
                warn!(strategy = name, error = %e, "error stopping strategy during engine shutdown");
            }
        }

        *self.state.write() = EngineState::Stopped;
        self.event_bus.publish(EngineEvent::new(
            EngineEventKind::EngineStopped,
            json!({
                "total_cycles": self.total_cycles.load(Ordering::Relaxed),
                "total_orders": self.total_orders.load(Ordering::Relaxed),
            }),
        ));
        info!("engine stopped");
    }

    /// Cheap `Arc`-only clone used to hand a task a self-contained handle
    /// back onto the engine's shared state without cloning the state itself.
    fn clone_for_task(&self) -> Arc<EngineHandle> {
        Arc::new(EngineHandle {
            broker: self.broker.clone(),
            market_data: self.market_data.clone(),
            risk: self.risk.clone(),
            persistence: self.persistence.clone(),
            event_bus: self.event_bus.clone(),
            total_cycles: self.total_cycles.clone(),
            total_orders: self.total_orders.clone(),
        })
    }
}

/// The subset of engine state a spawned strategy loop needs. Kept separate
/// from `TradingEngine` so the loop never has to touch the task registry
/// (which would deadlock against `stop_strategy`'s write lock).
struct EngineHandle {
    broker: Arc<dyn Broker>,
    market_data: Arc<MarketDataService>,
    risk: Arc<RiskManager>,
    persistence: Arc<dyn PersistencePort>,
    event_bus: Arc<EventBus>,
    total_cycles: Arc<AtomicU64>,
    total_orders: Arc<AtomicU64>,
}

impl EngineHandle {
    async fn strategy_loop(
        self: Arc<Self>,
        name: String,
        instance: SharedStrategy,
        run_id: i64,
        started_at: chrono::DateTime<Utc>,
        mut stop_rx: watch::Receiver<bool>,
    ) {
        let mut consecutive_errors: u32 = 0;

        loop {
            if *stop_rx.borrow() {
                break;
            }

            let cycle_start = Instant::now();
            let (timeframe, interval_secs) = {
                let guard = instance.read().await;
                let tf = guard.timeframe();
                (tf, tf.cycle_interval_secs())
            };

            match self.run_one_cycle(&name, &instance, run_id, started_at).await {
                Ok(()) => {
                    consecutive_errors = 0;
                    self.total_cycles.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    consecutive_errors += 1;
                    error!(strategy = name, error = %e, consecutive_errors, "strategy cycle failed");

                    if consecutive_errors >= MAX_CONSECUTIVE_ERRORS {
                        let mut guard = instance.write().await;
                        guard.set_error(e.to_string());
                        drop(guard);

                        self.persistence
                            .mark_strategy_run_errored(run_id, &e.to_string(), Utc::now())
                            .await
                            .ok();
                        self.event_bus.publish(EngineEvent::new(
                            EngineEventKind::StrategyError,
                            json!({"strategy": name, "error": e.to_string(), "consecutive_errors": consecutive_errors}),
                        ));
                        return;
                    }

                    let backoff = interval_secs.min(MAX_BACKOFF_SECS) * consecutive_errors as u64;
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_secs(backoff)) => {}
                        _ = stop_rx.changed() => { if *stop_rx.borrow() { break; } }
                    }
                    continue;
                }
            }

            let elapsed = cycle_start.elapsed();
            let sleep_for = Duration::from_secs(interval_secs).saturating_sub(elapsed).max(Duration::from_secs(1));

            tokio::select! {
                _ = tokio::time::sleep(sleep_for) => {}
                _ = stop_rx.changed() => { if *stop_rx.borrow() { break; } }
            }
        }

        debug!(strategy = name, "strategy loop exited cleanly");
    }

    #[instrument(skip(self, instance), fields(strategy = %name))]
    async fn run_one_cycle(
        &self,
        name: &str,
        instance: &SharedStrategy,
        run_id: i64,
        started_at: chrono::DateTime<Utc>,
    ) -> anyhow::Result<()> {
        let (symbols, timeframe, skip_market_check) = {
            let guard = instance.read().await;
            (guard.symbols().to_vec(), guard.timeframe(), guard.skip_market_check())
        };

        if !skip_market_check && !self.market_data.is_market_open().await {
            debug!(strategy = name, "market closed, skipping cycle");
            return Ok(());
        }

        let limit = timeframe.default_history_bars();
        let bars = self
            .market_data
            .get_bars_for_symbols(&symbols, timeframe, None, None, Some(limit), true)
            .await;
        if bars.is_empty() {
            debug!(strategy = name, "no bar data available, skipping cycle");
            return Ok(());
        }

        let signals = {
            let mut guard = instance.write().await;
            guard.run(&bars).await?
        };
        let actionable: Vec<(String, Signal)> = symbols
            .iter()
            .filter_map(|s| signals.get(s).filter(|sig| sig.is_actionable()).map(|sig| (s.clone(), *sig)))
            .collect();

        if !actionable.is_empty() {
            self.event_bus.publish(EngineEvent::new(
                EngineEventKind::SignalGenerated,
                json!({"strategy": name, "signals": actionable.iter().map(|(s, sig)| (s.clone(), sig.to_string())).collect::<HashMap<_, _>>()}),
            ));
        }

        let mut orders_submitted = 0u32;

        for (symbol, signal) in &actionable {
            let side = match signal {
                Signal::Buy => OrderSide::Buy,
                Signal::Sell => OrderSide::Sell,
                Signal::Hold => unreachable!("filtered above"),
            };

            let Some(price) = self.market_data.get_latest_price(symbol, true).await else {
                warn!(strategy = name, symbol, "no latest price, skipping signal");
                continue;
            };

            let qty = match side {
                OrderSide::Buy => {
                    let (account, positions) =
                        match tokio::try_join!(self.broker.get_account(), self.broker.get_positions()) {
                            Ok(pair) => pair,
                            Err(e) => {
                                warn!(strategy = name, symbol, error = %e, "failed to size position, skipping");
                                continue;
                            }
                        };
                    let qty = self.risk.calculate_position_size(symbol, price, &account, &positions, None);
                    if qty <= 0.0 {
                        debug!(strategy = name, symbol, "sizing returned zero, skipping");
                        continue;
                    }
                    qty
                }
                OrderSide::Sell => match self.broker.get_position(symbol).await {
                    Ok(Some(position)) => position.qty.abs(),
                    Ok(None) => {
                        debug!(strategy = name, symbol, "no open position to sell, skipping");
                        continue;
                    }
                    Err(e) => {
                        warn!(strategy = name, symbol, error = %e, "failed to check position, skipping");
                        continue;
                    }
                },
            };

            let check = self
                .risk
                .evaluate_order(symbol, side, qty, price, name, self.broker.as_ref())
                .await;

            if !check.approved {
                let reason = check.reason.clone().unwrap_or_default();
                self.persistence
                    .record_trade_attempt(NewTradeAttempt {
                        strategy_name: name.to_string(),
                        symbol: symbol.clone(),
                        side,
                        qty,
                        order_type: crate::types::OrderType::Market,
                        time_in_force: crate::types::time_in_force_for(symbol),
                        limit_price: None,
                        stop_price: None,
                        status: TradeStatus::Rejected,
                        broker_order_id: None,
                        signal: *signal,
                        notes: Some(format!("Risk rejected: {reason}")),
                    })
                    .await
                    .ok();
                self.event_bus.publish(EngineEvent::new(
                    EngineEventKind::RiskRejected,
                    json!({"strategy": name, "symbol": symbol, "side": side.to_string(), "qty": qty, "reason": reason}),
                ));
                continue;
            }

            let (take_profit, stop_loss) = {
                let mut guard = instance.write().await;
                guard.take_bracket_params()
            };

            let new_order = NewOrder::market(symbol.clone(), side, qty).with_bracket(take_profit, stop_loss);

            let order = match self.broker.submit_order(new_order).await {
                Ok(order) => order,
                Err(e) => {
                    warn!(strategy = name, symbol, error = %e, "order submission failed");
                    self.persistence
                        .record_trade_attempt(NewTradeAttempt {
                            strategy_name: name.to_string(),
                            symbol: symbol.clone(),
                            side,
                            qty,
                            order_type: crate::types::OrderType::Market,
                            time_in_force: crate::types::time_in_force_for(symbol),
                            limit_price: None,
                            stop_price: None,
                            status: TradeStatus::Error,
                            broker_order_id: None,
                            signal: *signal,
                            notes: Some(format!("Broker error: {e}")),
                        })
                        .await
                        .ok();
                    continue;
                }
            };

            self.persistence
                .record_trade_attempt(NewTradeAttempt {
                    strategy_name: name.to_string(),
                    symbol: symbol.clone(),
                    side,
                    qty,
                    order_type: order.order_type,
                    time_in_force: order.time_in_force,
                    limit_price: order.limit_price,
                    stop_price: order.stop_price,
                    status: order.status.into(),
                    broker_order_id: Some(order.id.clone()),
                    signal: *signal,
                    notes: None,
                })
                .await
                .ok();

            {
                let mut guard = instance.write().await;
                guard
                    .on_trade_executed(&json!({
                        "symbol": symbol,
                        "side": side.to_string(),
                        "qty": qty,
                        "price": price,
                        "order_id": order.id,
                        "status": order.status.to_string(),
                    }))
                    .await;
            }

            self.event_bus.publish(EngineEvent::new(
                EngineEventKind::OrderSubmitted,
                json!({
                    "strategy": name, "symbol": symbol, "side": side.to_string(), "qty": qty,
                    "price": price, "order_id": order.id, "status": order.status.to_string(),
                }),
            ));

            self.risk.record_trade(0.0);
            orders_submitted += 1;
            self.total_orders.fetch_add(1, Ordering::Relaxed);
        }

        let last_signal_json: Value = actionable
            .iter()
            .map(|(s, sig)| (s.clone(), json!(sig.to_string())))
            .collect::<serde_json::Map<_, _>>()
            .into();

        let trade_count_since = self
            .persistence
            .count_trades(crate::persistence::TradeFilter {
                strategy_name: Some(name.to_string()),
                since: Some(started_at),
                ..Default::default()
            })
            .await
            .unwrap_or(0) as u32;

        self.persistence
            .update_strategy_run_signals(run_id, last_signal_json.clone(), trade_count_since)
            .await
            .ok();

        self.event_bus.publish(EngineEvent::new(
            EngineEventKind::CycleCompleted,
            json!({"strategy": name, "signals": last_signal_json, "orders_submitted": orders_submitted}),
        ));

        Ok(())
    }
}
