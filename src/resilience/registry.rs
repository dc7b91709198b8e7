//! Process-wide registry of default per-host circuit breakers.

use std::sync::{Arc, OnceLock};

use dashmap::DashMap;

use crate::config::CircuitBreakerConfig;
use crate::resilience::circuit_breaker::DefaultCircuitBreaker;
use crate::resilience::scheduler::Scheduler;

/// Map of host → default breaker, keyed by lower-cased host name.
///
/// Default breakers judge calls by HTTP status code and count 5xx responses
/// as failures.
pub struct CircuitBreakerRegistry {
    breakers: DashMap<String, DefaultCircuitBreaker<u16>>,
    config: CircuitBreakerConfig,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            breakers: DashMap::new(),
            config,
        }
    }

    /// The registry shared by every client that was not given its own.
    pub fn global() -> Arc<CircuitBreakerRegistry> {
        static GLOBAL: OnceLock<Arc<CircuitBreakerRegistry>> = OnceLock::new();
        GLOBAL
            .get_or_init(|| Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig::default())))
            .clone()
    }

    /// Get the breaker for `host`, creating it on first use.
    ///
    /// The scheduler only applies when this call creates the breaker; an
    /// existing breaker keeps the scheduler it was created with.
    pub fn get_or_create_for_host(&self, host: &str, scheduler: Scheduler) -> DefaultCircuitBreaker<u16> {
        let key = host.to_ascii_lowercase();
        if let Some(existing) = self.breakers.get(&key) {
            return existing.clone();
        }

        self.breakers
            .entry(key.clone())
            .or_insert_with(|| {
                tracing::debug!(host = %key, bound = scheduler.is_bound(), "Creating default circuit breaker");
                DefaultCircuitBreaker::new(key.clone(), &self.config, scheduler, is_server_error)
            })
            .clone()
    }

    pub fn get(&self, host: &str) -> Option<DefaultCircuitBreaker<u16>> {
        self.breakers
            .get(&host.to_ascii_lowercase())
            .map(|entry| entry.clone())
    }

    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

fn is_server_error(status: &u16) -> bool {
    *status >= 500
}
