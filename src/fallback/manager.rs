use super::review::{ReviewQueue, ReviewRequest};
use super::strategy::ExtractionStrategy;
use super::template::{normalize_file_name, ExtractionHistory, HistoryEntry, TemplateStrategy};
use super::{ChainFailure, DocumentExtractor};
use crate::clock::{Clock, SystemClock};
use crate::config::{ConfidenceDecay, FallbackConfig, RetryConfig, TemplateConfig};
use crate::health::{HealthStatus, ServiceHealthCache};
use crate::resilience::{RetryHandler, RetryPolicy};
use crate::types::{DocumentRef, ExtractionAttemptResult, ExtractionMethod};
use crate::Error;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{error, info, warn};

pub struct FallbackChainManager {
    primary: Option<Arc<dyn ExtractionStrategy>>,
    secondary: Option<Arc<dyn ExtractionStrategy>>,
    template: Option<Arc<dyn ExtractionStrategy>>,
    history: Option<Arc<dyn ExtractionHistory>>,
    health: Arc<ServiceHealthCache>,
    review: Arc<dyn ReviewQueue>,
    retry: RetryHandler,
    decay: ConfidenceDecay,
    allow_degraded: bool,
    instructions: String,
    clock: Arc<dyn Clock>,
}

pub struct FallbackChainBuilder {
    primary: Option<Arc<dyn ExtractionStrategy>>,
    secondary: Option<Arc<dyn ExtractionStrategy>>,
    template: Option<Arc<dyn ExtractionStrategy>>,
    history: Option<Arc<dyn ExtractionHistory>>,
    health: Arc<ServiceHealthCache>,
    review: Arc<dyn ReviewQueue>,
    retry: RetryPolicy,
    decay: ConfidenceDecay,
    allow_degraded: bool,
    instructions: String,
    clock: Arc<dyn Clock>,
}

impl FallbackChainBuilder {
    pub fn primary(mut self, strategy: Arc<dyn ExtractionStrategy>) -> Self {
        self.primary = Some(strategy);
        self
    }

    pub fn secondary(mut self, strategy: Arc<dyn ExtractionStrategy>) -> Self {
        self.secondary = Some(strategy);
        self
    }

    /// Record successful extractions into `history`, and synthesize from it when enabled.
    pub fn history(mut self, history: Arc<dyn ExtractionHistory>, config: TemplateConfig) -> Self {
        if config.enabled {
            self.template = Some(Arc::new(TemplateStrategy::new(Arc::clone(&history), config)));
        }
        self.history = Some(history);
        self
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    pub fn decay(mut self, decay: ConfidenceDecay) -> Self {
        self.decay = decay;
        self
    }

    pub fn allow_degraded(mut self, allow: bool) -> Self {
        self.allow_degraded = allow;
        self
    }

    pub fn instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = instructions.into();
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Copy the tunables of a `fallback` configuration section.
    pub fn with_config(self, config: &FallbackConfig) -> Self {
        self.decay(config.decay)
            .allow_degraded(config.allow_degraded)
            .instructions(config.instructions.clone())
    }

    pub fn build(self) -> FallbackChainManager {
        FallbackChainManager {
            primary: self.primary,
            secondary: self.secondary,
            template: self.template,
            history: self.history,
            health: self.health,
            review: self.review,
            retry: RetryHandler::new(self.retry),
            decay: self.decay,
            allow_degraded: self.allow_degraded,
            instructions: self.instructions,
            clock: self.clock,
        }
    }
}

impl FallbackChainManager {
    pub fn builder(
        health: Arc<ServiceHealthCache>,
        review: Arc<dyn ReviewQueue>,
    ) -> FallbackChainBuilder {
        FallbackChainBuilder {
            primary: None,
            secondary: None,
            template: None,
            history: None,
            health,
            review,
            retry: RetryPolicy::from(&RetryConfig::default()),
            decay: ConfidenceDecay::default(),
            allow_degraded: false,
            instructions: FallbackConfig::default().instructions,
            clock: Arc::new(SystemClock),
        }
    }

    fn decay_for(&self, method: ExtractionMethod) -> f64 {
        match method {
            ExtractionMethod::Primary => self.decay.primary,
            ExtractionMethod::Fallback1 => self.decay.fallback_1,
            ExtractionMethod::Fallback2 => self.decay.fallback_2,
            ExtractionMethod::ManualReview => 0.0,
        }
    }

    fn instructions_for(&self, doc: &DocumentRef) -> String {
        self.instructions
            .replace("{document_type}", doc.classification.document_type_or_default())
    }

    /// `Err` carries the skip message when a dependency is not usable.
    async fn check_dependencies(&self, strategy: &dyn ExtractionStrategy) -> Result<(), String> {
        for dep in strategy.dependencies() {
            let health = self.health.get_health(&dep).await;
            let usable = match health.status {
                HealthStatus::Healthy => true,
                HealthStatus::Degraded => self.allow_degraded,
                HealthStatus::Down => false,
            };
            if !usable {
                let detail = health
                    .probe_error
                    .map(|e| format!(" ({})", e))
                    .unwrap_or_default();
                return Err(format!(
                    "{}: skipped, {} is {}{}",
                    strategy.method(),
                    dep,
                    health.status,
                    detail
                ));
            }
        }
        Ok(())
    }

    /// Run the automated tiers in order and return the first success.
    pub async fn run_automated(
        &self,
        doc: &DocumentRef,
    ) -> Result<ExtractionAttemptResult, ChainFailure> {
        let started = Instant::now();
        let instructions = self.instructions_for(doc);
        let mut errors: Vec<String> = Vec::new();
        let mut skips_only = true;

        let tiers = [&self.primary, &self.secondary, &self.template];
        for strategy in tiers.into_iter().flatten() {
            let method = strategy.method();
            if let Err(skip) = self.check_dependencies(strategy.as_ref()).await {
                info!(
                    document_id = %doc.document_id,
                    tier = %method,
                    reason = %skip,
                    "tier skipped"
                );
                errors.push(skip);
                continue;
            }

            let outcome = if method == ExtractionMethod::Primary {
                self.retry
                    .with_retry_if(|| strategy.extract(doc, &instructions), Error::is_retryable)
                    .await
            } else {
                strategy.extract(doc, &instructions).await
            };

            match outcome {
                Ok(out) => {
                    let confidence = (out.raw_confidence * self.decay_for(method)).clamp(0.0, 1.0);
                    info!(
                        document_id = %doc.document_id,
                        tier = %method,
                        confidence,
                        cost = out.cost,
                        "extraction succeeded"
                    );
                    return Ok(ExtractionAttemptResult {
                        success: true,
                        method,
                        confidence,
                        cost: out.cost,
                        processing_time_ms: started.elapsed().as_millis() as u64,
                        errors,
                        data: Some(out.fields),
                    });
                }
                Err(e) => {
                    if e.counts_against_retry_budget() {
                        skips_only = false;
                    }
                    warn!(
                        document_id = %doc.document_id,
                        tier = %method,
                        error = %e,
                        "tier failed"
                    );
                    errors.push(format!("{}: {}", method, e));
                }
            }
        }

        Err(ChainFailure {
            dependency_skips_only: skips_only && !errors.is_empty(),
            errors,
        })
    }

    /// Run the whole chain. Always returns a successful result; the last resort is manual review.
    pub async fn execute_with_fallback(&self, doc: &DocumentRef) -> ExtractionAttemptResult {
        let started = Instant::now();
        match self.run_automated(doc).await {
            Ok(result) => {
                self.record_history(doc, &result).await;
                result
            }
            Err(failure) => {
                self.escalate_at(doc, "automated extraction failed", failure.errors, started)
                    .await
            }
        }
    }

    /// Enqueue `doc` for human review with the accumulated error trail.
    ///
    /// The sink write is retried; if it still fails the failure is logged and appended to the
    /// trail, and the result is still a manual-review success.
    pub async fn enqueue_manual_review(
        &self,
        doc: &DocumentRef,
        reason: &str,
        errors: Vec<String>,
    ) -> ExtractionAttemptResult {
        self.escalate_at(doc, reason, errors, Instant::now()).await
    }

    async fn escalate_at(
        &self,
        doc: &DocumentRef,
        reason: &str,
        mut errors: Vec<String>,
        started: Instant,
    ) -> ExtractionAttemptResult {
        let request = ReviewRequest::for_document(doc, reason, errors.clone(), self.clock.now());
        let written = self
            .retry
            .with_retry(|| self.review.enqueue(request.clone()))
            .await;
        match written {
            Ok(()) => info!(
                document_id = %doc.document_id,
                reason,
                errors = errors.len(),
                "queued for manual review"
            ),
            Err(e) => {
                error!(
                    document_id = %doc.document_id,
                    sink = self.review.name(),
                    error = %e,
                    "manual review enqueue failed"
                );
                errors.push(format!("manual_review: sink write failed: {}", e));
            }
        }
        ExtractionAttemptResult::manual_review(errors, started.elapsed().as_millis() as u64)
    }

    /// Feed a service-backed success into the template history.
    pub async fn record_history(&self, doc: &DocumentRef, result: &ExtractionAttemptResult) {
        let Some(history) = &self.history else {
            return;
        };
        if !matches!(
            result.method,
            ExtractionMethod::Primary | ExtractionMethod::Fallback1
        ) {
            return;
        }
        let Some(fields) = &result.data else {
            return;
        };
        let entry = HistoryEntry {
            document_id: doc.document_id.clone(),
            file_pattern: normalize_file_name(&doc.file_name),
            classification: doc.classification.clone(),
            method: result.method,
            confidence: result.confidence,
            fields: fields.clone(),
            extracted_at: self.clock.now(),
        };
        if let Err(e) = history.record(entry).await {
            warn!(document_id = %doc.document_id, error = %e, "history write failed");
        }
    }
}

#[async_trait]
impl DocumentExtractor for FallbackChainManager {
    async fn extract(&self, doc: &DocumentRef) -> Result<ExtractionAttemptResult, ChainFailure> {
        self.run_automated(doc).await
    }

    async fn escalate(
        &self,
        doc: &DocumentRef,
        reason: &str,
        errors: Vec<String>,
    ) -> ExtractionAttemptResult {
        self.enqueue_manual_review(doc, reason, errors).await
    }

    async fn record_success(&self, doc: &DocumentRef, result: &ExtractionAttemptResult) {
        self.record_history(doc, result).await
    }
}
