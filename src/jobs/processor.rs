//! Job processor: claims leased jobs, runs the extraction chain, and finalises outcomes.

use super::documents::DocumentStore;
use super::model::{Job, JobPayload};
use super::status::{get_job_status, JobStatusView};
use super::store::{JobStore, QueueStats};
use crate::clock::{Clock, SystemClock};
use crate::config::JobQueueConfig;
use crate::fallback::DocumentExtractor;
use crate::resilience::apply_jitter;
use crate::types::{ClassificationHints, ExtractionMethod, Priority};
use crate::{Error, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// Lease owner name; unique per processor instance.
    pub worker_id: String,
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: f64,
    pub lease: Duration,
    pub job_timeout: Duration,
    pub poll_interval: Duration,
    pub max_deferrals: u32,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self::from(&JobQueueConfig::default())
    }
}

impl From<&JobQueueConfig> for ProcessorConfig {
    fn from(c: &JobQueueConfig) -> Self {
        Self {
            worker_id: format!("worker-{}", uuid::Uuid::new_v4()),
            max_retries: c.max_retries,
            base_delay: Duration::from_millis(c.base_delay_ms),
            max_delay: Duration::from_millis(c.max_delay_ms),
            jitter: c.jitter,
            lease: Duration::from_millis(c.lease_ms),
            job_timeout: Duration::from_millis(c.job_timeout_ms),
            poll_interval: Duration::from_millis(c.poll_interval_ms),
            max_deferrals: c.max_deferrals,
        }
    }
}

impl ProcessorConfig {
    pub fn with_worker_id(mut self, id: impl Into<String>) -> Self {
        self.worker_id = id.into();
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }

    /// `min(base × 2^attempt, max_delay)`, jittered, never above `max_delay`.
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let factor = 2f64.powi(attempt.min(62) as i32);
        let raw = self.base_delay.as_secs_f64() * factor;
        let capped = Duration::from_secs_f64(raw.min(self.max_delay.as_secs_f64()));
        apply_jitter(capped, self.jitter).min(self.max_delay)
    }
}

/// Submission of one uploaded document.
#[derive(Debug, Clone)]
pub struct EnqueueRequest {
    pub document_id: String,
    pub file_ref: String,
    pub file_name: String,
    pub classification: ClassificationHints,
    pub priority: Priority,
}

/// Events emitted by the processor.
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessorEvent {
    JobEnqueued {
        job_id: String,
        document_id: String,
    },
    JobStarted {
        job_id: String,
        attempt: u32,
    },
    JobCompleted {
        job_id: String,
        method: ExtractionMethod,
        confidence: f64,
    },
    JobRetryScheduled {
        job_id: String,
        attempt: u32,
        delay_ms: u64,
        error: String,
    },
    JobDeferred {
        job_id: String,
        deferrals: u32,
        delay_ms: u64,
    },
    JobFailed {
        job_id: String,
        error: String,
    },
    LeaseReclaimed {
        job_id: String,
    },
    ProcessorStarted,
    ProcessorStopped,
}

/// What one `process_next` call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    Idle,
    Completed,
    RetryScheduled,
    Deferred,
    Failed,
}

pub struct AsyncProcessor {
    jobs: Arc<dyn JobStore>,
    documents: Arc<dyn DocumentStore>,
    extractor: Arc<dyn DocumentExtractor>,
    clock: Arc<dyn Clock>,
    config: ProcessorConfig,
    events: broadcast::Sender<ProcessorEvent>,
}

impl AsyncProcessor {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        documents: Arc<dyn DocumentStore>,
        extractor: Arc<dyn DocumentExtractor>,
        config: ProcessorConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            jobs,
            documents,
            extractor,
            clock: Arc::new(SystemClock),
            config,
            events,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &ProcessorConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProcessorEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: ProcessorEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    pub async fn enqueue(&self, request: EnqueueRequest) -> Result<Job> {
        let now = self.clock.now();
        let job = Job::new(
            request.document_id,
            JobPayload {
                file_ref: request.file_ref,
                file_name: request.file_name,
                classification: request.classification,
            },
            request.priority,
            self.config.max_retries,
            now,
        );
        let job = self.jobs.insert(job).await?;
        self.documents.mark_queued(&job.document_id, now).await?;
        info!(
            job_id = %job.id,
            document_id = %job.document_id,
            priority = %job.priority,
            "job enqueued"
        );
        self.emit(ProcessorEvent::JobEnqueued {
            job_id: job.id.clone(),
            document_id: job.document_id.clone(),
        });
        Ok(job)
    }

    pub async fn get_job_status(&self, document_id: &str) -> Result<Option<JobStatusView>> {
        get_job_status(self.jobs.as_ref(), document_id).await
    }

    pub async fn stats(&self) -> Result<QueueStats> {
        self.jobs.stats().await
    }

    /// Settle expired leases, then claim and process at most one job.
    pub async fn process_next(&self) -> Result<ProcessOutcome> {
        self.recover_expired_leases().await?;

        let now = self.clock.now();
        let Some(job) = self
            .jobs
            .claim_next(now, &self.config.worker_id, self.config.lease)
            .await?
        else {
            return Ok(ProcessOutcome::Idle);
        };
        self.process_job(job).await
    }

    /// Jobs whose worker vanished mid-flight count as a failed attempt.
    pub async fn recover_expired_leases(&self) -> Result<usize> {
        let reclaimed = self
            .jobs
            .reclaim_expired(self.clock.now(), &self.config.worker_id, self.config.lease)
            .await?;
        let count = reclaimed.len();
        for job in reclaimed {
            self.emit(ProcessorEvent::LeaseReclaimed {
                job_id: job.id.clone(),
            });
            if self.already_completed(&job).await? {
                self.finish_completed(job).await?;
                continue;
            }
            let message = "lease expired before the job finished".to_string();
            self.handle_failure(job, vec![message], true).await?;
        }
        Ok(count)
    }

    async fn already_completed(&self, job: &Job) -> Result<bool> {
        Ok(self
            .documents
            .get(&job.document_id)
            .await?
            .and_then(|r| r.completed_job_id)
            .map_or(false, |id| id == job.id))
    }

    async fn finish_completed(&self, mut job: Job) -> Result<ProcessOutcome> {
        let now = self.clock.now();
        self.documents
            .confirm_completed(&job.document_id, &job.id, now)
            .await?;
        job.complete(now)?;
        self.jobs.update_leased(&job, &self.config.worker_id).await?;
        info!(job_id = %job.id, "job finalised from stored result");
        Ok(ProcessOutcome::Completed)
    }

    #[instrument(skip(self, job), fields(job_id = %job.id, document_id = %job.document_id))]
    async fn process_job(&self, job: Job) -> Result<ProcessOutcome> {
        self.emit(ProcessorEvent::JobStarted {
            job_id: job.id.clone(),
            attempt: job.retry_attempt,
        });
        if self.already_completed(&job).await? {
            return self.finish_completed(job).await;
        }
        self.documents
            .mark_processing(&job.document_id, self.clock.now())
            .await?;

        let doc = job.document_ref();
        match tokio::time::timeout(self.config.job_timeout, self.extractor.extract(&doc)).await {
            Ok(Ok(result)) => {
                let now = self.clock.now();
                let applied = self
                    .documents
                    .record_success(&job.document_id, &job.id, &result, now)
                    .await?;
                let mut job = job;
                job.complete(now)?;
                self.jobs.update_leased(&job, &self.config.worker_id).await?;
                if applied {
                    self.extractor.record_success(&doc, &result).await;
                }
                info!(
                    method = %result.method,
                    confidence = result.confidence,
                    cost = result.cost,
                    "job completed"
                );
                self.emit(ProcessorEvent::JobCompleted {
                    job_id: job.id.clone(),
                    method: result.method,
                    confidence: result.confidence,
                });
                Ok(ProcessOutcome::Completed)
            }
            Ok(Err(failure)) => {
                let charged = !failure.dependency_skips_only;
                self.handle_failure(job, failure.errors, charged).await
            }
            Err(_) => {
                let message = format!(
                    "job timed out after {}ms",
                    self.config.job_timeout.as_millis()
                );
                self.handle_failure(job, vec![message], true).await
            }
        }
    }

    /// Defer, reschedule with backoff, or fail permanently and escalate to manual review.
    async fn handle_failure(
        &self,
        mut job: Job,
        errors: Vec<String>,
        charged: bool,
    ) -> Result<ProcessOutcome> {
        let now = self.clock.now();
        let message = errors.join("; ");

        if !charged && job.deferrals < self.config.max_deferrals {
            let delay = self.config.retry_delay(job.deferrals);
            job.defer(message, now + to_chrono(delay), now)?;
            self.jobs.update_leased(&job, &self.config.worker_id).await?;
            debug!(
                job_id = %job.id,
                deferrals = job.deferrals,
                delay_ms = delay.as_millis() as u64,
                "dependencies unavailable, job deferred"
            );
            self.emit(ProcessorEvent::JobDeferred {
                job_id: job.id.clone(),
                deferrals: job.deferrals,
                delay_ms: delay.as_millis() as u64,
            });
            return Ok(ProcessOutcome::Deferred);
        }

        if job.retries_remaining() {
            let delay = self.config.retry_delay(job.retry_attempt);
            job.schedule_retry(message.clone(), now + to_chrono(delay), now)?;
            self.jobs.update_leased(&job, &self.config.worker_id).await?;
            warn!(
                job_id = %job.id,
                attempt = job.retry_attempt,
                max_retries = job.max_retries,
                delay_ms = delay.as_millis() as u64,
                error = %message,
                "job failed, retry scheduled"
            );
            self.emit(ProcessorEvent::JobRetryScheduled {
                job_id: job.id.clone(),
                attempt: job.retry_attempt,
                delay_ms: delay.as_millis() as u64,
                error: message,
            });
            return Ok(ProcessOutcome::RetryScheduled);
        }

        let terminal = Error::RetryBudgetExhausted {
            job_id: job.id.clone(),
            attempts: job.retry_attempt,
            last_error: message,
        }
        .to_string();
        job.fail(terminal.clone(), now)?;
        self.jobs.update_leased(&job, &self.config.worker_id).await?;
        self.documents
            .mark_failed(&job.document_id, &job.id, &terminal, &errors, now)
            .await?;
        error!(
            job_id = %job.id,
            document_id = %job.document_id,
            error = %terminal,
            "job failed permanently"
        );

        let review = self
            .extractor
            .escalate(&job.document_ref(), "retry budget exhausted", errors)
            .await;
        debug!(job_id = %job.id, trail = review.errors.len(), "escalated to manual review");
        self.emit(ProcessorEvent::JobFailed {
            job_id: job.id.clone(),
            error: terminal,
        });
        Ok(ProcessOutcome::Failed)
    }

    /// Process jobs until `shutdown` fires. A job in flight is always finished first.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(worker_id = %self.config.worker_id, "processor started");
        self.emit(ProcessorEvent::ProcessorStarted);
        while !shutdown.is_cancelled() {
            let idle = match self.process_next().await {
                Ok(ProcessOutcome::Idle) => true,
                Ok(_) => false,
                Err(e) => {
                    error!(error = %e, "processing step failed");
                    true
                }
            };
            if idle {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                }
            }
        }
        info!(worker_id = %self.config.worker_id, "processor stopped");
        self.emit(ProcessorEvent::ProcessorStopped);
    }
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::zero())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_delay_doubles_and_caps() {
        let config = ProcessorConfig {
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(30),
            jitter: 0.0,
            ..ProcessorConfig::default()
        };
        assert_eq!(config.retry_delay(0), Duration::from_secs(5));
        assert_eq!(config.retry_delay(1), Duration::from_secs(10));
        assert_eq!(config.retry_delay(2), Duration::from_secs(20));
        assert_eq!(config.retry_delay(3), Duration::from_secs(30));
        assert_eq!(config.retry_delay(40), Duration::from_secs(30));
    }

    #[test]
    fn test_jittered_delay_never_exceeds_cap() {
        let config = ProcessorConfig {
            base_delay: Duration::from_secs(20),
            max_delay: Duration::from_secs(30),
            jitter: 0.5,
            ..ProcessorConfig::default()
        };
        for attempt in 0..5 {
            assert!(config.retry_delay(attempt) <= Duration::from_secs(30));
        }
    }
}
