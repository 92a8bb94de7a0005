//! Long-lived guards keyed by dependency name.
//!
//! Every component that talks to a dependency gets the same [`DependencyGuard`] from the
//! registry, so rate and circuit guarantees hold per dependency for the whole process rather
//! than per job or per worker.

use super::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerSnapshot};
use super::rate_limiter::{RateLimiter, RateLimiterConfig, RateLimiterSnapshot};
use crate::config::{OrchestratorConfig, ServiceConfig};
use crate::Result;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock};

/// Rate limiter and circuit breaker for one dependency.
pub struct DependencyGuard {
    name: String,
    rate_limiter: RateLimiter,
    breaker: CircuitBreaker,
}

impl DependencyGuard {
    pub fn new(
        name: impl Into<String>,
        rate: RateLimiterConfig,
        breaker: CircuitBreakerConfig,
    ) -> Self {
        let name = name.into();
        Self {
            rate_limiter: RateLimiter::new(rate),
            breaker: CircuitBreaker::new(name.clone(), breaker),
            name,
        }
    }

    pub fn from_service(name: impl Into<String>, cfg: &ServiceConfig) -> Self {
        Self::new(
            name,
            RateLimiterConfig::per_minute(cfg.requests_per_minute),
            CircuitBreakerConfig::new()
                .with_failure_threshold(cfg.failure_threshold)
                .with_cooldown(cfg.cooldown()),
        )
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    /// Breaker first (fail fast without spending a rate slot), then throttle, then call.
    pub async fn run<T, F, Fut>(&self, operation: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.breaker
            .execute(|| async {
                self.rate_limiter.throttle().await;
                operation().await
            })
            .await
    }

    pub async fn snapshot(&self) -> GuardSnapshot {
        GuardSnapshot {
            rate_limiter: self.rate_limiter.snapshot().await,
            circuit_breaker: self.breaker.snapshot(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GuardSnapshot {
    pub rate_limiter: RateLimiterSnapshot,
    pub circuit_breaker: CircuitBreakerSnapshot,
}

/// Registry of guards, created on first use from the service configuration.
#[derive(Default)]
pub struct GuardRegistry {
    services: HashMap<String, ServiceConfig>,
    guards: RwLock<HashMap<String, Arc<DependencyGuard>>>,
}

impl GuardRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &OrchestratorConfig) -> Self {
        Self {
            services: config
                .services
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            guards: RwLock::new(HashMap::new()),
        }
    }

    /// Shared guard for `name`. Unknown names get default limits.
    pub fn guard(&self, name: &str) -> Arc<DependencyGuard> {
        if let Some(g) = self
            .guards
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(name)
        {
            return Arc::clone(g);
        }
        let mut guards = self.guards.write().unwrap_or_else(|p| p.into_inner());
        let guard = guards.entry(name.to_string()).or_insert_with(|| {
            let cfg = self.services.get(name).cloned().unwrap_or_default();
            Arc::new(DependencyGuard::from_service(name, &cfg))
        });
        Arc::clone(guard)
    }

    /// Register an explicitly built guard, replacing any existing one.
    pub fn insert(&self, guard: DependencyGuard) -> Arc<DependencyGuard> {
        let guard = Arc::new(guard);
        self.guards
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert(guard.name().to_string(), Arc::clone(&guard));
        guard
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .guards
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }
}
