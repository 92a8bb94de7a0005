//! Durable job storage with atomic lease-based claiming.

use super::model::{Job, JobStatus};
use crate::{Error, ErrorContext, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub queued: usize,
    pub processing: usize,
    pub retry_scheduled: usize,
    pub completed: usize,
    pub failed: usize,
}

impl QueueStats {
    pub fn total(&self) -> usize {
        self.queued + self.processing + self.retry_scheduled + self.completed + self.failed
    }

    /// Jobs not yet in a terminal state.
    pub fn in_flight(&self) -> usize {
        self.queued + self.processing + self.retry_scheduled
    }
}

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn insert(&self, job: Job) -> Result<Job>;

    /// Atomically promote due retries, then lease the best eligible job to `owner`.
    ///
    /// Eligible: `queued`, `scheduled_for <= now`, and no other job of the same document is
    /// `processing`. Best: highest priority, then oldest `created_at`.
    async fn claim_next(&self, now: DateTime<Utc>, owner: &str, lease: Duration)
        -> Result<Option<Job>>;

    /// Persist `job` if `owner` still holds its lease.
    async fn update_leased(&self, job: &Job, owner: &str) -> Result<()>;

    /// Re-lease `processing` jobs whose lease expired to `owner`.
    async fn reclaim_expired(&self, now: DateTime<Utc>, owner: &str, lease: Duration)
        -> Result<Vec<Job>>;

    async fn get(&self, job_id: &str) -> Result<Option<Job>>;

    /// Most recently created job of a document.
    async fn latest_for_document(&self, document_id: &str) -> Result<Option<Job>>;

    async fn stats(&self) -> Result<QueueStats>;

    fn name(&self) -> &'static str;
}

fn lease_deadline(now: DateTime<Utc>, lease: Duration) -> DateTime<Utc> {
    now + chrono::Duration::from_std(lease).unwrap_or_else(|_| chrono::Duration::minutes(10))
}

#[derive(Default, Serialize, Deserialize)]
struct StoreState {
    jobs: HashMap<String, Job>,
    next_sequence: u64,
}

/// In-process job store, optionally mirrored to a JSON snapshot file after every change.
///
/// The mutex serialises claims, so two workers sharing the store can never lease the same job.
/// Workers in separate processes need a shared database behind [`JobStore`] instead.
pub struct LocalJobStore {
    state: Mutex<StoreState>,
    snapshot: Option<PathBuf>,
}

impl LocalJobStore {
    pub fn in_memory() -> Self {
        Self {
            state: Mutex::new(StoreState::default()),
            snapshot: None,
        }
    }

    /// Load `path` if it exists and keep it updated.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let state = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice::<StoreState>(&bytes).map_err(|e| {
                Error::store_with_context(
                    format!("corrupt job snapshot: {}", e),
                    ErrorContext::new()
                        .with_details(path.display().to_string())
                        .with_source("job_store"),
                )
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => StoreState::default(),
            Err(e) => return Err(e.into()),
        };
        info!(path = %path.display(), jobs = state.jobs.len(), "job store opened");
        Ok(Self {
            state: Mutex::new(state),
            snapshot: Some(path),
        })
    }

    async fn persist(&self, state: &StoreState) -> Result<()> {
        let Some(path) = &self.snapshot else {
            return Ok(());
        };
        let bytes = serde_json::to_vec_pretty(state)?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }
}

fn lease_lost(job: &Job, owner: &str) -> Error {
    Error::store_with_context(
        format!("lease on job {} is no longer held", job.id),
        ErrorContext::new()
            .with_details(format!("owner {}", owner))
            .with_source("job_store"),
    )
}

#[async_trait]
impl JobStore for LocalJobStore {
    async fn insert(&self, mut job: Job) -> Result<Job> {
        let mut state = self.state.lock().await;
        if state.jobs.contains_key(&job.id) {
            return Err(Error::store_with_context(
                format!("duplicate job id {}", job.id),
                ErrorContext::new().with_source("job_store"),
            ));
        }
        job.sequence = state.next_sequence;
        state.next_sequence += 1;
        state.jobs.insert(job.id.clone(), job.clone());
        self.persist(&state).await?;
        Ok(job)
    }

    async fn claim_next(
        &self,
        now: DateTime<Utc>,
        owner: &str,
        lease: Duration,
    ) -> Result<Option<Job>> {
        let mut state = self.state.lock().await;

        let mut changed = false;
        for job in state.jobs.values_mut() {
            if job.status == JobStatus::RetryScheduled && job.scheduled_for <= now {
                job.transition(JobStatus::Queued, now)?;
                changed = true;
            }
        }

        let busy: HashSet<&str> = state
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::Processing)
            .map(|j| j.document_id.as_str())
            .collect();
        let chosen = state
            .jobs
            .values()
            .filter(|j| j.is_eligible(now) && !busy.contains(j.document_id.as_str()))
            .max_by_key(|j| (j.priority, Reverse(j.created_at), Reverse(j.sequence)))
            .map(|j| j.id.clone());

        let claimed = match chosen {
            Some(id) => {
                let job = state
                    .jobs
                    .get_mut(&id)
                    .ok_or_else(|| Error::store_with_context("job vanished", ErrorContext::new()))?;
                job.lease(owner, lease_deadline(now, lease), now)?;
                debug!(job_id = %job.id, owner, "job claimed");
                changed = true;
                Some(job.clone())
            }
            None => None,
        };

        if changed {
            self.persist(&state).await?;
        }
        Ok(claimed)
    }

    async fn update_leased(&self, job: &Job, owner: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        let stored = state
            .jobs
            .get_mut(&job.id)
            .ok_or_else(|| lease_lost(job, owner))?;
        if stored.status != JobStatus::Processing || stored.lease_owner.as_deref() != Some(owner) {
            return Err(lease_lost(job, owner));
        }
        *stored = job.clone();
        self.persist(&state).await
    }

    async fn reclaim_expired(
        &self,
        now: DateTime<Utc>,
        owner: &str,
        lease: Duration,
    ) -> Result<Vec<Job>> {
        let mut state = self.state.lock().await;
        let mut reclaimed = Vec::new();
        for job in state.jobs.values_mut() {
            if job.lease_expired(now) {
                let previous = job.lease_owner.clone().unwrap_or_default();
                job.lease(owner, lease_deadline(now, lease), now)?;
                info!(
                    job_id = %job.id,
                    previous_owner = %previous,
                    owner,
                    "expired lease reclaimed"
                );
                reclaimed.push(job.clone());
            }
        }
        if !reclaimed.is_empty() {
            self.persist(&state).await?;
        }
        reclaimed.sort_by_key(|j| j.sequence);
        Ok(reclaimed)
    }

    async fn get(&self, job_id: &str) -> Result<Option<Job>> {
        Ok(self.state.lock().await.jobs.get(job_id).cloned())
    }

    async fn latest_for_document(&self, document_id: &str) -> Result<Option<Job>> {
        let state = self.state.lock().await;
        Ok(state
            .jobs
            .values()
            .filter(|j| j.document_id == document_id)
            .max_by_key(|j| (j.created_at, j.sequence))
            .cloned())
    }

    async fn stats(&self) -> Result<QueueStats> {
        let state = self.state.lock().await;
        let mut stats = QueueStats::default();
        for job in state.jobs.values() {
            match job.status {
                JobStatus::Queued => stats.queued += 1,
                JobStatus::Processing => stats.processing += 1,
                JobStatus::RetryScheduled => stats.retry_scheduled += 1,
                JobStatus::Completed => stats.completed += 1,
                JobStatus::Failed => stats.failed += 1,
            }
        }
        Ok(stats)
    }

    fn name(&self) -> &'static str {
        if self.snapshot.is_some() {
            "local-file"
        } else {
            "memory"
        }
    }
}
