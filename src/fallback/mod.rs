//! 回退链：混合抽取 → 单服务抽取 → 模板合成 → 人工复核，逐级降级且永不死路。
//!
//! # Fallback Chain Module
//!
//! Given a document, the chain runs its tiers in order and stops at the first success:
//!
//! | Tier | Strategy | Gate | Confidence | Cost |
//! |------|----------|------|------------|------|
//! | `primary` | [`HybridStrategy`] (OCR, then structuring) | both services usable; retried | × `decay.primary` | service-reported |
//! | `fallback_1` | [`SingleServiceStrategy`] | its service usable | × `decay.fallback_1` | service-reported |
//! | `fallback_2` | [`TemplateStrategy`] | none | × `decay.fallback_2` | 0 |
//! | `manual_review` | [`ReviewQueue`] enqueue | none | 0 | 0 |
//!
//! Every tier failure or skip is appended to the result's `errors`, so the review queue receives
//! the full trail.

mod manager;
pub mod review;
pub mod strategy;
pub mod template;

pub use manager::{FallbackChainBuilder, FallbackChainManager};
pub use review::{MemoryReviewQueue, ReviewQueue, ReviewRequest};
pub use strategy::{ExtractionStrategy, HybridStrategy, SingleServiceStrategy, TierOutput};
pub use template::{
    normalize_file_name, synthesize_fields, ExtractionHistory, HistoryEntry,
    MemoryExtractionHistory, TemplateStrategy,
};

use crate::types::{DocumentRef, ExtractionAttemptResult};
use async_trait::async_trait;

/// Every automated tier failed or was skipped.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("all automated tiers failed: {}", .errors.join("; "))]
pub struct ChainFailure {
    pub errors: Vec<String>,
    /// No tier actually failed: each was skipped because its dependency is down or its circuit
    /// is open. Such runs are deferred rather than charged to the job's retry budget.
    pub dependency_skips_only: bool,
}

/// What the job processor needs from an extraction pipeline.
#[async_trait]
pub trait DocumentExtractor: Send + Sync {
    /// Run the automated tiers only.
    async fn extract(&self, doc: &DocumentRef)
        -> std::result::Result<ExtractionAttemptResult, ChainFailure>;

    /// Hand the document to human review. Cannot fail.
    async fn escalate(
        &self,
        doc: &DocumentRef,
        reason: &str,
        errors: Vec<String>,
    ) -> ExtractionAttemptResult;

    /// Called once the result has been persisted.
    async fn record_success(&self, _doc: &DocumentRef, _result: &ExtractionAttemptResult) {}
}
