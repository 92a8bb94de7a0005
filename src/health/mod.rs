//! 依赖健康缓存：按 TTL 缓存探测结论，探测失败只降级不报错。
//!
//! # Service Health Cache
//!
//! Each dependency gets a tri-state verdict ([`HealthStatus`]) refreshed by a cheap synthetic
//! probe at most once per TTL. The fallback chain consults the cache to skip tiers whose
//! dependencies are known to be down.
//!
//! Probe outcomes map to verdicts as follows:
//!
//! | Probe outcome | Verdict |
//! |---------------|---------|
//! | success within `degraded_latency_ms` | healthy |
//! | success, slower | degraded |
//! | transient failure, quota, malformed reply | degraded |
//! | circuit open, credentials exhausted, request rejected | down |
//! | no probe registered | down |

mod store;

pub use store::{HealthStore, MemoryHealthStore};

use crate::batch::BatchProcessor;
use crate::client::ExtractionService;
use crate::clock::{Clock, SystemClock};
use crate::config::HealthConfig;
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Down,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Down => "down",
        }
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cached verdict for one dependency.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceHealth {
    pub service_name: String,
    pub status: HealthStatus,
    pub last_checked_at: DateTime<Utc>,
    #[serde(default)]
    pub probe_error: Option<String>,
    #[serde(default)]
    pub latency_ms: Option<u64>,
}

/// A minimal-cost synthetic request against one dependency.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    fn name(&self) -> &str;
    async fn probe(&self) -> Result<()>;
}

/// Probes an [`ExtractionService`] through its own `probe` call.
pub struct ServiceProbe(pub Arc<dyn ExtractionService>);

#[async_trait]
impl HealthProbe for ServiceProbe {
    fn name(&self) -> &str {
        self.0.name()
    }
    async fn probe(&self) -> Result<()> {
        self.0.probe().await
    }
}

fn verdict_for_error(err: &Error) -> HealthStatus {
    match err {
        Error::CircuitOpen { .. }
        | Error::AllCredentialsExhausted { .. }
        | Error::HardFailure { .. }
        | Error::Configuration { .. } => HealthStatus::Down,
        _ => HealthStatus::Degraded,
    }
}

pub struct ServiceHealthCache {
    probes: HashMap<String, Arc<dyn HealthProbe>>,
    store: Arc<dyn HealthStore>,
    clock: Arc<dyn Clock>,
    config: HealthConfig,
    // one in-flight probe per service
    probe_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ServiceHealthCache {
    pub fn new(config: HealthConfig) -> Self {
        Self {
            probes: HashMap::new(),
            store: Arc::new(MemoryHealthStore::new()),
            clock: Arc::new(SystemClock),
            config,
            probe_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_store(mut self, store: Arc<dyn HealthStore>) -> Self {
        self.store = store;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_probe(mut self, probe: Arc<dyn HealthProbe>) -> Self {
        self.probes.insert(probe.name().to_string(), probe);
        self
    }

    pub fn with_service(self, service: Arc<dyn ExtractionService>) -> Self {
        self.with_probe(Arc::new(ServiceProbe(service)))
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.config.ttl_ms)
    }

    fn is_fresh(&self, health: &ServiceHealth) -> bool {
        let age = self.clock.now().signed_duration_since(health.last_checked_at);
        age >= chrono::Duration::zero()
            && age < chrono::Duration::milliseconds(self.config.ttl_ms as i64)
    }

    async fn cached(&self, service: &str) -> Option<ServiceHealth> {
        match self.store.load(service).await {
            Ok(h) => h,
            Err(e) => {
                warn!(service, error = %e, "health store read failed");
                None
            }
        }
    }

    async fn probe_lock(&self, service: &str) -> Arc<Mutex<()>> {
        let mut locks = self.probe_locks.lock().await;
        Arc::clone(locks.entry(service.to_string()).or_default())
    }

    /// Cached verdict if younger than the TTL, otherwise a fresh probe. Never fails.
    pub async fn get_health(&self, service: &str) -> ServiceHealth {
        if let Some(h) = self.cached(service).await {
            if self.is_fresh(&h) {
                return h;
            }
        }
        let lock = self.probe_lock(service).await;
        let _held = lock.lock().await;
        // another caller may have refreshed while we waited
        if let Some(h) = self.cached(service).await {
            if self.is_fresh(&h) {
                return h;
            }
        }
        self.probe_and_store(service).await
    }

    /// Whether a tier depending on `service` should be attempted.
    pub async fn is_usable(&self, service: &str, allow_degraded: bool) -> bool {
        match self.get_health(service).await.status {
            HealthStatus::Healthy => true,
            HealthStatus::Degraded => allow_degraded,
            HealthStatus::Down => false,
        }
    }

    /// Drop the cached verdict so the next lookup probes again.
    pub async fn invalidate(&self, service: &str) {
        if let Err(e) = self.store.remove(service).await {
            warn!(service, error = %e, "health store delete failed");
        }
    }

    /// Probe every registered dependency now, in bounded batches.
    pub async fn refresh_all(&self, batches: &BatchProcessor) -> Vec<ServiceHealth> {
        let mut names: Vec<String> = self.probes.keys().cloned().collect();
        names.sort();
        batches
            .process_in_batches(names, |name| async move {
                let lock = self.probe_lock(&name).await;
                let _held = lock.lock().await;
                Ok::<_, Error>(self.probe_and_store(&name).await)
            })
            .await
    }

    /// Every stored verdict, stale ones included.
    pub async fn snapshot(&self) -> Vec<ServiceHealth> {
        self.store.all().await.unwrap_or_default()
    }

    async fn probe_and_store(&self, service: &str) -> ServiceHealth {
        let health = self.run_probe(service).await;
        if let Err(e) = self.store.save(&health).await {
            warn!(service, error = %e, "health store write failed");
        }
        health
    }

    async fn run_probe(&self, service: &str) -> ServiceHealth {
        let Some(probe) = self.probes.get(service) else {
            return ServiceHealth {
                service_name: service.to_string(),
                status: HealthStatus::Down,
                last_checked_at: self.clock.now(),
                probe_error: Some("no health probe registered".to_string()),
                latency_ms: None,
            };
        };

        let started = Instant::now();
        let outcome = probe.probe().await;
        let latency_ms = started.elapsed().as_millis() as u64;
        let (status, probe_error) = match outcome {
            Ok(()) if latency_ms <= self.config.degraded_latency_ms => {
                (HealthStatus::Healthy, None)
            }
            Ok(()) => (
                HealthStatus::Degraded,
                Some(format!("slow probe: {}ms", latency_ms)),
            ),
            Err(e) => (verdict_for_error(&e), Some(e.to_string())),
        };
        if status == HealthStatus::Healthy {
            debug!(service, latency_ms, "probe healthy");
        } else {
            warn!(
                service,
                %status,
                latency_ms,
                error = probe_error.as_deref().unwrap_or(""),
                "probe not healthy"
            );
        }

        ServiceHealth {
            service_name: service.to_string(),
            status,
            last_checked_at: self.clock.now(),
            probe_error,
            latency_ms: Some(latency_ms),
        }
    }
}
