//! Wires every component from one [`OrchestratorConfig`].

use crate::batch::{BatchProcessor, BatchProcessorConfig};
use crate::client::{CredentialRotatingClient, ExtractionService};
use crate::clock::{Clock, SystemClock};
use crate::config::OrchestratorConfig;
use crate::fallback::{
    ExtractionHistory, FallbackChainManager, HybridStrategy, MemoryExtractionHistory,
    MemoryReviewQueue, ReviewQueue, SingleServiceStrategy,
};
use crate::health::{HealthStore, MemoryHealthStore, ServiceHealth, ServiceHealthCache};
use crate::jobs::{
    AsyncProcessor, DocumentStore, EnqueueRequest, Job, JobStatusView, JobStore, LocalJobStore,
    MemoryDocumentStore, ProcessorConfig,
};
use crate::resilience::{GuardRegistry, GuardSnapshot, RetryPolicy};
use crate::{Error, ErrorContext, Result};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

pub struct Orchestrator {
    config: OrchestratorConfig,
    guards: Arc<GuardRegistry>,
    services: BTreeMap<String, Arc<dyn ExtractionService>>,
    health: Arc<ServiceHealthCache>,
    review: Arc<dyn ReviewQueue>,
    chain: Arc<FallbackChainManager>,
    documents: Arc<dyn DocumentStore>,
    processor: Arc<AsyncProcessor>,
    batches: BatchProcessor,
}

pub struct OrchestratorBuilder {
    config: OrchestratorConfig,
    services: BTreeMap<String, Arc<dyn ExtractionService>>,
    job_store: Option<Arc<dyn JobStore>>,
    job_store_path: Option<PathBuf>,
    documents: Option<Arc<dyn DocumentStore>>,
    review: Option<Arc<dyn ReviewQueue>>,
    history: Option<Arc<dyn ExtractionHistory>>,
    health_store: Option<Arc<dyn HealthStore>>,
    clock: Arc<dyn Clock>,
    worker_id: Option<String>,
}

impl OrchestratorBuilder {
    /// Use `service` instead of an HTTP client for the configured service of the same name.
    pub fn service(mut self, service: Arc<dyn ExtractionService>) -> Self {
        self.services.insert(service.name().to_string(), service);
        self
    }

    pub fn job_store(mut self, store: Arc<dyn JobStore>) -> Self {
        self.job_store = Some(store);
        self
    }

    /// Persist jobs to a JSON snapshot at `path`.
    pub fn job_store_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.job_store_path = Some(path.into());
        self
    }

    pub fn document_store(mut self, store: Arc<dyn DocumentStore>) -> Self {
        self.documents = Some(store);
        self
    }

    pub fn review_queue(mut self, queue: Arc<dyn ReviewQueue>) -> Self {
        self.review = Some(queue);
        self
    }

    pub fn history(mut self, history: Arc<dyn ExtractionHistory>) -> Self {
        self.history = Some(history);
        self
    }

    pub fn health_store(mut self, store: Arc<dyn HealthStore>) -> Self {
        self.health_store = Some(store);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn worker_id(mut self, id: impl Into<String>) -> Self {
        self.worker_id = Some(id.into());
        self
    }

    pub async fn build(self) -> Result<Orchestrator> {
        let config = self.config;
        config.validate()?;
        let guards = Arc::new(GuardRegistry::from_config(&config));

        let mut services = self.services;
        for (name, service_cfg) in &config.services {
            if !services.contains_key(name) {
                let client = CredentialRotatingClient::from_config(name, service_cfg, &guards)?;
                services.insert(name.clone(), Arc::new(client));
            }
        }
        let lookup = |name: &str| -> Result<Arc<dyn ExtractionService>> {
            services.get(name).cloned().ok_or_else(|| {
                Error::configuration_with_context(
                    format!("service '{}' is not configured", name),
                    ErrorContext::new()
                        .with_field_path("fallback")
                        .with_source("orchestrator"),
                )
            })
        };

        let mut health = ServiceHealthCache::new(config.health.clone())
            .with_store(
                self.health_store
                    .unwrap_or_else(|| Arc::new(MemoryHealthStore::new())),
            )
            .with_clock(Arc::clone(&self.clock));
        for service in services.values() {
            health = health.with_service(Arc::clone(service));
        }
        let health = Arc::new(health);

        let review: Arc<dyn ReviewQueue> = self
            .review
            .unwrap_or_else(|| Arc::new(MemoryReviewQueue::new()));
        let history: Arc<dyn ExtractionHistory> = self
            .history
            .unwrap_or_else(|| Arc::new(MemoryExtractionHistory::new()));

        let mut chain = FallbackChainManager::builder(Arc::clone(&health), Arc::clone(&review))
            .with_config(&config.fallback)
            .retry_policy(RetryPolicy::from(&config.retry))
            .history(history, config.fallback.template.clone())
            .clock(Arc::clone(&self.clock));
        if let [ocr, structurer] = config.fallback.primary.as_slice() {
            chain = chain.primary(Arc::new(HybridStrategy::new(
                lookup(ocr)?,
                lookup(structurer)?,
            )));
        }
        if let Some(name) = &config.fallback.secondary {
            chain = chain.secondary(Arc::new(SingleServiceStrategy::new(lookup(name)?)));
        }
        let chain = Arc::new(chain.build());

        let jobs: Arc<dyn JobStore> = match (self.job_store, self.job_store_path) {
            (Some(store), _) => store,
            (None, Some(path)) => Arc::new(LocalJobStore::open(path).await?),
            (None, None) => Arc::new(LocalJobStore::in_memory()),
        };
        let documents: Arc<dyn DocumentStore> = self
            .documents
            .unwrap_or_else(|| Arc::new(MemoryDocumentStore::new()));

        let mut processor_config = ProcessorConfig::from(&config.jobs);
        if let Some(id) = self.worker_id {
            processor_config = processor_config.with_worker_id(id);
        }
        let processor = Arc::new(
            AsyncProcessor::new(
                jobs,
                Arc::clone(&documents),
                chain.clone(),
                processor_config,
            )
            .with_clock(Arc::clone(&self.clock)),
        );

        info!(
            services = services.len(),
            primary = !config.fallback.primary.is_empty(),
            secondary = config.fallback.secondary.as_deref().unwrap_or("-"),
            "orchestrator ready"
        );

        Ok(Orchestrator {
            batches: BatchProcessor::with_config(BatchProcessorConfig::from(&config.batch)),
            config,
            guards,
            services,
            health,
            review,
            chain,
            documents,
            processor,
        })
    }
}

impl Orchestrator {
    pub fn builder(config: OrchestratorConfig) -> OrchestratorBuilder {
        OrchestratorBuilder {
            config,
            services: BTreeMap::new(),
            job_store: None,
            job_store_path: None,
            documents: None,
            review: None,
            history: None,
            health_store: None,
            clock: Arc::new(SystemClock),
            worker_id: None,
        }
    }

    pub async fn from_config(config: OrchestratorConfig) -> Result<Self> {
        Self::builder(config).build().await
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn chain(&self) -> &Arc<FallbackChainManager> {
        &self.chain
    }

    pub fn processor(&self) -> &Arc<AsyncProcessor> {
        &self.processor
    }

    pub fn health(&self) -> &Arc<ServiceHealthCache> {
        &self.health
    }

    pub fn review_queue(&self) -> &Arc<dyn ReviewQueue> {
        &self.review
    }

    pub fn documents(&self) -> &Arc<dyn DocumentStore> {
        &self.documents
    }

    pub fn service(&self, name: &str) -> Option<&Arc<dyn ExtractionService>> {
        self.services.get(name)
    }

    pub async fn enqueue(&self, request: EnqueueRequest) -> Result<Job> {
        self.processor.enqueue(request).await
    }

    pub async fn get_job_status(&self, document_id: &str) -> Result<Option<JobStatusView>> {
        self.processor.get_job_status(document_id).await
    }

    /// Probe every dependency now, in configured batches.
    pub async fn refresh_health(&self) -> Vec<ServiceHealth> {
        self.health.refresh_all(&self.batches).await
    }

    /// Rate-limiter and breaker state of every dependency used so far.
    pub async fn guard_snapshots(&self) -> Vec<(String, GuardSnapshot)> {
        let mut out = Vec::new();
        for name in self.guards.names() {
            out.push((name.clone(), self.guards.guard(&name).snapshot().await));
        }
        out
    }
}
