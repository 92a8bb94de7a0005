//! Job record and its lifecycle state machine.

use crate::types::{ClassificationHints, DocumentRef, Priority};
use crate::{Error, ErrorContext, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Processing,
    RetryScheduled,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Processing => "processing",
            JobStatus::RetryScheduled => "retry_scheduled",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Transition table. Terminal states have no exits.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Queued, Processing)
                | (Processing, Completed)
                | (Processing, RetryScheduled)
                | (Processing, Failed)
                // lease handed to another worker after expiry
                | (Processing, Processing)
                | (RetryScheduled, Queued)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "processing" => Ok(JobStatus::Processing),
            "retry_scheduled" => Ok(JobStatus::RetryScheduled),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(format!("Unknown job status: {}", other)),
        }
    }
}

/// What the processor needs to extract a document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobPayload {
    pub file_ref: String,
    pub file_name: String,
    #[serde(default)]
    pub classification: ClassificationHints,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub document_id: String,
    pub payload: JobPayload,
    pub priority: Priority,
    pub status: JobStatus,
    /// Not eligible before this instant.
    pub scheduled_for: DateTime<Utc>,
    pub retry_attempt: u32,
    pub max_retries: u32,
    /// Circuit-open reschedules, which do not consume `retry_attempt`.
    #[serde(default)]
    pub deferrals: u32,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub lease_owner: Option<String>,
    #[serde(default)]
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    /// Insertion order; breaks `created_at` ties.
    #[serde(default)]
    pub sequence: u64,
}

impl Job {
    pub fn new(
        document_id: impl Into<String>,
        payload: JobPayload,
        priority: Priority,
        max_retries: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            document_id: document_id.into(),
            payload,
            priority,
            status: JobStatus::Queued,
            scheduled_for: now,
            retry_attempt: 0,
            max_retries,
            deferrals: 0,
            last_error: None,
            lease_owner: None,
            lease_expires_at: None,
            created_at: now,
            updated_at: now,
            finished_at: None,
            sequence: 0,
        }
    }

    pub fn document_ref(&self) -> DocumentRef {
        DocumentRef {
            document_id: self.document_id.clone(),
            file_ref: self.payload.file_ref.clone(),
            file_name: self.payload.file_name.clone(),
            classification: self.payload.classification.clone(),
        }
    }

    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Queued && self.scheduled_for <= now
    }

    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Processing
            && self.lease_expires_at.map_or(true, |deadline| deadline <= now)
    }

    pub fn retries_remaining(&self) -> bool {
        self.retry_attempt < self.max_retries
    }

    /// The single place where `status` changes.
    pub fn transition(&mut self, next: JobStatus, now: DateTime<Utc>) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(Error::validation_with_context(
                format!("illegal job transition {} -> {}", self.status, next),
                ErrorContext::new()
                    .with_field_path(format!("jobs.{}.status", self.id))
                    .with_source("job_state_machine"),
            ));
        }
        tracing::debug!(job_id = %self.id, from = %self.status, to = %next, "job transition");
        self.status = next;
        self.updated_at = now;
        match next {
            JobStatus::Processing => {}
            JobStatus::Completed | JobStatus::Failed => {
                self.finished_at = Some(now);
                self.lease_owner = None;
                self.lease_expires_at = None;
            }
            JobStatus::RetryScheduled | JobStatus::Queued => {
                self.lease_owner = None;
                self.lease_expires_at = None;
            }
        }
        Ok(())
    }

    /// Queued → processing under a lease held by `owner` until `expires_at`.
    pub fn lease(
        &mut self,
        owner: &str,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.transition(JobStatus::Processing, now)?;
        self.lease_owner = Some(owner.to_string());
        self.lease_expires_at = Some(expires_at);
        Ok(())
    }

    pub fn complete(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.transition(JobStatus::Completed, now)?;
        self.last_error = None;
        Ok(())
    }

    /// Processing → retry_scheduled, consuming one retry.
    pub fn schedule_retry(
        &mut self,
        error: impl Into<String>,
        at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.transition(JobStatus::RetryScheduled, now)?;
        self.retry_attempt += 1;
        self.scheduled_for = at;
        self.last_error = Some(error.into());
        Ok(())
    }

    /// Processing → retry_scheduled without consuming a retry.
    pub fn defer(
        &mut self,
        error: impl Into<String>,
        at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.transition(JobStatus::RetryScheduled, now)?;
        self.deferrals += 1;
        self.scheduled_for = at;
        self.last_error = Some(error.into());
        Ok(())
    }

    pub fn fail(&mut self, error: impl Into<String>, now: DateTime<Utc>) -> Result<()> {
        self.transition(JobStatus::Failed, now)?;
        self.last_error = Some(error.into());
        Ok(())
    }
}
