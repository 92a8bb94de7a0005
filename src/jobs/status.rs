//! User-facing status of a document's most recent job.

use super::model::{Job, JobStatus};
use super::store::JobStore;
use crate::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Coarse progress shown to users.
pub fn progress_percentage(status: JobStatus) -> u8 {
    match status {
        JobStatus::Queued | JobStatus::RetryScheduled => 25,
        JobStatus::Processing => 75,
        JobStatus::Completed => 100,
        JobStatus::Failed => 0,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobStatusView {
    pub job_id: String,
    pub document_id: String,
    pub status: JobStatus,
    pub progress_percentage: u8,
    pub error_message: Option<String>,
    pub retry_attempt: u32,
    pub max_retries: u32,
    pub scheduled_for: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl From<&Job> for JobStatusView {
    fn from(job: &Job) -> Self {
        Self {
            job_id: job.id.clone(),
            document_id: job.document_id.clone(),
            status: job.status,
            progress_percentage: progress_percentage(job.status),
            error_message: job.last_error.clone(),
            retry_attempt: job.retry_attempt,
            max_retries: job.max_retries,
            scheduled_for: job.scheduled_for,
            created_at: job.created_at,
            updated_at: job.updated_at,
            finished_at: job.finished_at,
        }
    }
}

/// Status of the most recent job for `document_id`, if it has any.
pub async fn get_job_status(
    store: &dyn JobStore,
    document_id: &str,
) -> Result<Option<JobStatusView>> {
    Ok(store
        .latest_for_document(document_id)
        .await?
        .as_ref()
        .map(JobStatusView::from))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_mapping() {
        assert_eq!(progress_percentage(JobStatus::Queued), 25);
        assert_eq!(progress_percentage(JobStatus::RetryScheduled), 25);
        assert_eq!(progress_percentage(JobStatus::Processing), 75);
        assert_eq!(progress_percentage(JobStatus::Completed), 100);
        assert_eq!(progress_percentage(JobStatus::Failed), 0);
    }
}
