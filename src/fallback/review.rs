//! Human-review queue, the terminal destination of the chain.

use crate::types::{ClassificationHints, DocumentRef, Priority};
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::RwLock;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewRequest {
    pub document_id: String,
    pub file_ref: String,
    pub file_name: String,
    pub classification: ClassificationHints,
    pub priority: Priority,
    pub reason: String,
    /// Failure trail of every automated attempt, oldest first.
    pub errors: Vec<String>,
    pub enqueued_at: DateTime<Utc>,
}

impl ReviewRequest {
    pub fn for_document(
        doc: &DocumentRef,
        reason: impl Into<String>,
        errors: Vec<String>,
        enqueued_at: DateTime<Utc>,
    ) -> Self {
        Self {
            document_id: doc.document_id.clone(),
            file_ref: doc.file_ref.clone(),
            file_name: doc.file_name.clone(),
            classification: doc.classification.clone(),
            priority: Priority::High,
            reason: reason.into(),
            errors,
            enqueued_at,
        }
    }
}

#[async_trait]
pub trait ReviewQueue: Send + Sync {
    async fn enqueue(&self, request: ReviewRequest) -> Result<()>;
    fn name(&self) -> &'static str;
}

#[derive(Default)]
pub struct MemoryReviewQueue {
    items: RwLock<Vec<ReviewRequest>>,
}

impl MemoryReviewQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending(&self) -> Vec<ReviewRequest> {
        self.items.read().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn len(&self) -> usize {
        self.items.read().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ReviewQueue for MemoryReviewQueue {
    async fn enqueue(&self, request: ReviewRequest) -> Result<()> {
        self.items
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .push(request);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
