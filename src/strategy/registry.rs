// =============================================================================
// Strategy registry — compile-time constructor list, runtime singleton pool
// =============================================================================
//
// Replaces the distillation's directory-scanning auto-discovery: the set of
// available strategies is fixed at compile time (one closure per strategy),
// so there is nothing to import dynamically and no partially-constructed
// abstract class to filter out. `get_strategy` hands back one shared,
// lock-guarded instance per name (the live engine's view); `create_strategy`
// always builds a fresh one, so a backtest run never shares mutable state
// with a live run of the same strategy.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::RwLock as AsyncRwLock;
use tracing::warn;

use crate::types::Timeframe;

use super::rsi_strategy::RsiStrategy;
use super::sma_crossover::SmaCrossover;
use super::Strategy;

type Constructor = Box<dyn Fn() -> anyhow::Result<Box<dyn Strategy>> + Send + Sync>;

/// Live instances are guarded by a `tokio` lock, not `parking_lot`'s: the
/// engine holds this across `.await` points (strategy methods are async),
/// and `parking_lot` guards are intentionally `!Send` across await by
/// default. The outer instance-pool map itself is only ever touched
/// synchronously, so it stays on `parking_lot`.
pub type SharedStrategy = Arc<AsyncRwLock<Box<dyn Strategy>>>;

pub struct StrategyRegistry {
    constructors: HashMap<String, Constructor>,
    instances: RwLock<HashMap<String, SharedStrategy>>,
}

impl StrategyRegistry {
    pub fn new() -> Self {
        Self {
            constructors: HashMap::new(),
            instances: RwLock::new(HashMap::new()),
        }
    }

    /// Registry pre-loaded with the two reference strategies, each defaulting
    /// to `["AAPL", "MSFT"]` on the daily timeframe — overridden per run via
    /// `create_strategy`'s `overrides` or `update_parameters`.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();

        registry.register(SmaCrossover::NAME, || {
            SmaCrossover::default_for(vec!["AAPL".to_string(), "MSFT".to_string()], Timeframe::D1)
                .map(|s| Box::new(s) as Box<dyn Strategy>)
        });

        registry.register(RsiStrategy::NAME, || {
            RsiStrategy::default_for(vec!["AAPL".to_string(), "MSFT".to_string()], Timeframe::D1)
                .map(|s| Box::new(s) as Box<dyn Strategy>)
        });

        registry
    }

    /// Registers a constructor under `name`. A second registration under the
    /// same name replaces the first (last registration wins), logged as a
    /// warning since it usually indicates a naming collision.
    pub fn register<F>(&mut self, name: &str, constructor: F)
    where
        F: Fn() -> anyhow::Result<Box<dyn Strategy>> + Send + Sync + 'static,
    {
        if self.constructors.contains_key(name) {
            warn!(strategy = name, "duplicate strategy registration, overwriting");
        }
        self.constructors.insert(name.to_string(), Box::new(constructor));
    }

    pub fn list_strategies(&self) -> Vec<String> {
        let mut names: Vec<String> = self.constructors.keys().cloned().collect();
        names.sort();
        names
    }

    /// Returns the shared, lock-guarded live instance for `name`, constructing
    /// it on first access. Every caller sees the same instance.
    pub fn get_strategy(&self, name: &str) -> anyhow::Result<SharedStrategy> {
        if let Some(existing) = self.instances.read().get(name) {
            return Ok(existing.clone());
        }

        let constructor = self
            .constructors
            .get(name)
            .ok_or_else(|| anyhow::anyhow!("unknown strategy '{name}'"))?;
        let instance: SharedStrategy = Arc::new(AsyncRwLock::new(constructor()?));

        self.instances.write().insert(name.to_string(), instance.clone());
        Ok(instance)
    }

    /// Builds a standalone instance for backtesting, never shared with the
    /// live registry. `overrides` (if any) are applied via `update_parameters`
    /// immediately after construction.
    pub fn create_strategy(&self, name: &str, overrides: Option<&Value>) -> anyhow::Result<Box<dyn Strategy>> {
        let constructor = self
            .constructors
            .get(name)
            .ok_or_else(|| anyhow::anyhow!("unknown strategy '{name}'"))?;
        let mut instance = constructor()?;

        if let Some(overrides) = overrides {
            instance.update_parameters(overrides);
        }

        Ok(instance)
    }

    pub fn remove_instance(&self, name: &str) -> bool {
        self.instances.write().remove(name).is_some()
    }
}

impl Default for StrategyRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn with_defaults_registers_both_reference_strategies() {
        let registry = StrategyRegistry::with_defaults();
        let names = registry.list_strategies();
        assert_eq!(names, vec!["rsi_strategy".to_string(), "sma_crossover".to_string()]);
    }

    #[test]
    fn get_strategy_returns_same_instance_on_repeat_calls() {
        let registry = StrategyRegistry::with_defaults();
        let a = registry.get_strategy("sma_crossover").unwrap();
        let b = registry.get_strategy("sma_crossover").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn create_strategy_returns_fresh_instance_each_time() {
        let registry = StrategyRegistry::with_defaults();
        let a = registry.create_strategy("rsi_strategy", None).unwrap();
        let b = registry.create_strategy("rsi_strategy", None).unwrap();
        // Different allocations: mutating one must not affect the other.
        assert_eq!(a.name(), b.name());
    }

    #[test]
    fn create_strategy_applies_overrides() {
        let registry = StrategyRegistry::with_defaults();
        let overrides = serde_json::json!({"fast_period": 3});
        let strat = registry.create_strategy("sma_crossover", Some(&overrides)).unwrap();
        assert_eq!(strat.get_parameters()["fast_period"], serde_json::json!(3));
    }

    #[test]
    fn unknown_strategy_name_errors() {
        let registry = StrategyRegistry::with_defaults();
        assert!(registry.get_strategy("does_not_exist").is_err());
        assert!(registry.create_strategy("does_not_exist", None).is_err());
    }

    #[test]
    fn duplicate_registration_overwrites() {
        let mut registry = StrategyRegistry::new();
        registry.register("x", || {
            SmaCrossover::default_for(vec!["AAPL".to_string()], Timeframe::D1)
                .map(|s| Box::new(s) as Box<dyn Strategy>)
        });
        registry.register("x", || {
            RsiStrategy::default_for(vec!["AAPL".to_string()], Timeframe::D1)
                .map(|s| Box::new(s) as Box<dyn Strategy>)
        });
        assert_eq!(registry.list_strategies(), vec!["x".to_string()]);
        let strat = registry.create_strategy("x", None).unwrap();
        assert_eq!(strat.name(), RsiStrategy::NAME);
    }
}
