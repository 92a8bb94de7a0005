//! Per-document extraction record, updated by the processor on terminal job outcomes.

use crate::types::{ExtractedFields, ExtractionAttemptResult, ExtractionMethod};
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub document_id: String,
    pub status: DocumentStatus,
    #[serde(default)]
    pub extracted_data: Option<ExtractedFields>,
    #[serde(default)]
    pub confidence: Option<f64>,
    #[serde(default)]
    pub method: Option<ExtractionMethod>,
    /// Accumulated over distinct jobs; a repeated completion of the same job adds nothing.
    pub total_cost: f64,
    #[serde(default)]
    pub processing_time_ms: Option<u64>,
    /// Job whose result is currently stored.
    #[serde(default)]
    pub completed_job_id: Option<String>,
    #[serde(default)]
    pub failed_job_id: Option<String>,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub errors: Vec<String>,
    pub updated_at: DateTime<Utc>,
}

impl DocumentRecord {
    fn new(document_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            document_id: document_id.to_string(),
            status: DocumentStatus::Queued,
            extracted_data: None,
            confidence: None,
            method: None,
            total_cost: 0.0,
            processing_time_ms: None,
            completed_job_id: None,
            failed_job_id: None,
            last_error: None,
            errors: Vec::new(),
            updated_at: now,
        }
    }
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn mark_queued(&self, document_id: &str, now: DateTime<Utc>) -> Result<()>;

    async fn mark_processing(&self, document_id: &str, now: DateTime<Utc>) -> Result<()>;

    /// Store `result` as produced by `job_id`. Returns `false` when this job's result was
    /// already stored, in which case nothing changes.
    async fn record_success(
        &self,
        document_id: &str,
        job_id: &str,
        result: &ExtractionAttemptResult,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    /// Set the status back to completed when `job_id`'s result is the one stored. Returns
    /// `false` when another job's result (or none) is stored.
    async fn confirm_completed(
        &self,
        document_id: &str,
        job_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    /// Returns `false` when `job_id` already marked the document failed.
    async fn mark_failed(
        &self,
        document_id: &str,
        job_id: &str,
        error: &str,
        errors: &[String],
        now: DateTime<Utc>,
    ) -> Result<bool>;

    async fn get(&self, document_id: &str) -> Result<Option<DocumentRecord>>;
}

#[derive(Default)]
pub struct MemoryDocumentStore {
    records: RwLock<HashMap<String, DocumentRecord>>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_record<T>(
        &self,
        document_id: &str,
        now: DateTime<Utc>,
        f: impl FnOnce(&mut DocumentRecord) -> T,
    ) -> T {
        let mut records = self.records.write().unwrap_or_else(|p| p.into_inner());
        let record = records
            .entry(document_id.to_string())
            .or_insert_with(|| DocumentRecord::new(document_id, now));
        f(record)
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn mark_queued(&self, document_id: &str, now: DateTime<Utc>) -> Result<()> {
        self.with_record(document_id, now, |r| {
            if r.status != DocumentStatus::Completed {
                r.status = DocumentStatus::Queued;
                r.updated_at = now;
            }
        });
        Ok(())
    }

    async fn mark_processing(&self, document_id: &str, now: DateTime<Utc>) -> Result<()> {
        self.with_record(document_id, now, |r| {
            r.status = DocumentStatus::Processing;
            r.updated_at = now;
        });
        Ok(())
    }

    async fn record_success(
        &self,
        document_id: &str,
        job_id: &str,
        result: &ExtractionAttemptResult,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        Ok(self.with_record(document_id, now, |r| {
            if r.completed_job_id.as_deref() == Some(job_id) {
                return false;
            }
            r.status = DocumentStatus::Completed;
            r.extracted_data = result.data.clone();
            r.confidence = Some(result.confidence);
            r.method = Some(result.method);
            r.total_cost += result.cost;
            r.processing_time_ms = Some(result.processing_time_ms);
            r.completed_job_id = Some(job_id.to_string());
            r.last_error = None;
            r.errors = result.errors.clone();
            r.updated_at = now;
            true
        }))
    }

    async fn confirm_completed(
        &self,
        document_id: &str,
        job_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        Ok(self.with_record(document_id, now, |r| {
            if r.completed_job_id.as_deref() != Some(job_id) {
                return false;
            }
            if r.status != DocumentStatus::Completed {
                r.status = DocumentStatus::Completed;
                r.updated_at = now;
            }
            true
        }))
    }

    async fn mark_failed(
        &self,
        document_id: &str,
        job_id: &str,
        error: &str,
        errors: &[String],
        now: DateTime<Utc>,
    ) -> Result<bool> {
        Ok(self.with_record(document_id, now, |r| {
            if r.failed_job_id.as_deref() == Some(job_id) {
                return false;
            }
            r.status = DocumentStatus::Failed;
            r.failed_job_id = Some(job_id.to_string());
            r.last_error = Some(error.to_string());
            r.errors = errors.to_vec();
            r.updated_at = now;
            true
        }))
    }

    async fn get(&self, document_id: &str) -> Result<Option<DocumentRecord>> {
        let records = self.records.read().unwrap_or_else(|p| p.into_inner());
        Ok(records.get(document_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn result(cost: f64) -> ExtractionAttemptResult {
        ExtractionAttemptResult {
            success: true,
            method: ExtractionMethod::Primary,
            confidence: 0.9,
            cost,
            processing_time_ms: 12,
            errors: Vec::new(),
            data: json!({"issuer": "ACME"}).as_object().cloned(),
        }
    }

    #[tokio::test]
    async fn test_duplicate_completion_is_a_no_op() {
        let store = MemoryDocumentStore::new();
        let now = Utc::now();
        assert!(store.record_success("d", "job-1", &result(0.5), now).await.unwrap());
        assert!(!store.record_success("d", "job-1", &result(0.5), now).await.unwrap());
        let rec = store.get("d").await.unwrap().unwrap();
        assert_eq!(rec.total_cost, 0.5);
        assert_eq!(rec.status, DocumentStatus::Completed);

        assert!(store.record_success("d", "job-2", &result(0.25), now).await.unwrap());
        assert_eq!(store.get("d").await.unwrap().unwrap().total_cost, 0.75);
    }

    #[tokio::test]
    async fn test_failure_keeps_error_trail() {
        let store = MemoryDocumentStore::new();
        let now = Utc::now();
        let trail = vec!["primary: down".to_string(), "fallback_1: 503".to_string()];
        assert!(store.mark_failed("d", "j", "budget exhausted", &trail, now).await.unwrap());
        assert!(!store.mark_failed("d", "j", "budget exhausted", &trail, now).await.unwrap());
        let rec = store.get("d").await.unwrap().unwrap();
        assert_eq!(rec.status, DocumentStatus::Failed);
        assert_eq!(rec.errors, trail);
    }

    #[tokio::test]
    async fn test_confirm_completed_restores_status_for_stored_job() {
        let store = MemoryDocumentStore::new();
        let now = Utc::now();
        store.record_success("d", "job-1", &result(0.5), now).await.unwrap();
        store.mark_processing("d", now).await.unwrap();

        assert!(!store.confirm_completed("d", "job-2", now).await.unwrap());
        assert_eq!(store.get("d").await.unwrap().unwrap().status, DocumentStatus::Processing);

        assert!(store.confirm_completed("d", "job-1", now).await.unwrap());
        let rec = store.get("d").await.unwrap().unwrap();
        assert_eq!(rec.status, DocumentStatus::Completed);
        assert_eq!(rec.total_cost, 0.5);
    }
}
