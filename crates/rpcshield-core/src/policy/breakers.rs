//! One circuit breaker per named dependency.

use std::sync::Arc;

use crate::config::CircuitBreakerConfig;
use crate::policy::circuit_breaker::{CircuitBreaker, CircuitStats};
use crate::registry::KeyedRegistry;

/// Registry of circuit breakers keyed by dependency name.
///
/// Construct one per process (or per test) and share it with the interceptor
/// chain through an `Arc`.
#[derive(Debug, Default)]
pub struct BreakerRegistry {
    default_config: CircuitBreakerConfig,
    breakers: KeyedRegistry<String, CircuitBreaker>,
}

impl BreakerRegistry {
    pub fn new(default_config: CircuitBreakerConfig) -> Self {
        Self {
            default_config,
            breakers: KeyedRegistry::new(),
        }
    }

    /// Breaker for `name`, created with the registry's default config.
    pub fn get(&self, name: &str) -> Arc<CircuitBreaker> {
        self.get_with(name, self.default_config.clone())
    }

    /// Breaker for `name`, created with `config` if it does not exist yet.
    /// An existing breaker keeps the config it was created with.
    pub fn get_with(&self, name: &str, config: CircuitBreakerConfig) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(name) {
            return existing;
        }
        let (breaker, created) = self
            .breakers
            .get_or_create_with_flag(name.to_string(), |key| CircuitBreaker::new(key.clone(), config));
        if created {
            tracing::info!(breaker = %name, "Created new circuit breaker");
        }
        breaker
    }

    /// Breaker for a database, keyed `database_<db_name>`.
    pub fn database(&self, db_name: &str) -> Arc<CircuitBreaker> {
        self.get_with(&format!("database_{db_name}"), CircuitBreakerConfig::database())
    }

    /// Breaker for an external service, keyed `external_service_<service>`.
    pub fn external_service(&self, service: &str) -> Arc<CircuitBreaker> {
        self.get_with(
            &format!("external_service_{service}"),
            CircuitBreakerConfig::external_service(),
        )
    }

    /// Stats for every breaker, sorted by name.
    pub fn stats(&self) -> Vec<CircuitStats> {
        let mut stats: Vec<_> = self
            .breakers
            .entries()
            .into_iter()
            .map(|(_, breaker)| breaker.stats())
            .collect();
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }

    pub fn reset_all(&self) {
        for (_, breaker) in self.breakers.entries() {
            breaker.reset();
        }
        tracing::info!("Reset all circuit breakers");
    }

    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }
}
