use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::breaker::{BreakerConfig, CircuitBreaker};
use crate::monitor::ErrorMonitor;

/// Vends per-name [`CircuitBreaker`] singletons.
///
/// A name resolves to the same breaker for the life of the registry;
/// per-name configs registered before first use override the default.
pub struct BreakerRegistry {
    default_config: BreakerConfig,
    configs: RwLock<HashMap<String, BreakerConfig>>,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
    monitor: Option<Arc<ErrorMonitor>>,
}

impl BreakerRegistry {
    pub fn new(default_config: BreakerConfig, monitor: Option<Arc<ErrorMonitor>>) -> Self {
        Self {
            default_config,
            configs: RwLock::new(HashMap::new()),
            breakers: RwLock::new(HashMap::new()),
            monitor,
        }
    }

    /// Register a config for `name`. Later than first use it has no effect;
    /// the existing singleton keeps its config.
    pub fn set_config(&self, name: impl Into<String>, config: BreakerConfig) {
        self.configs
            .write()
            .expect("config lock poisoned")
            .insert(name.into(), config);
    }

    /// The breaker for `name`, created on first use.
    pub fn get(&self, name: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self
            .breakers
            .read()
            .expect("breaker lock poisoned")
            .get(name)
        {
            return breaker.clone();
        }

        let mut breakers = self.breakers.write().expect("breaker lock poisoned");
        breakers
            .entry(name.to_string())
            .or_insert_with(|| {
                let config = self
                    .configs
                    .read()
                    .expect("config lock poisoned")
                    .get(name)
                    .cloned()
                    .unwrap_or_else(|| self.default_config.clone());
                Arc::new(CircuitBreaker::new(name, config, self.monitor.clone()))
            })
            .clone()
    }

    pub fn names(&self) -> Vec<String> {
        self.breakers
            .read()
            .expect("breaker lock poisoned")
            .keys()
            .cloned()
            .collect()
    }
}
