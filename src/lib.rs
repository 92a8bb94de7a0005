//! # intake-orchestrator
//!
//! 面向不可靠、限流且按次计费的外部抽取服务的文档抽取编排器。
//!
//! Resilient document-extraction orchestrator for unreliable, rate-limited, costed external
//! extraction services.
//!
//! ## Overview
//!
//! An uploaded document becomes a queued job. A processor leases the job and runs it through a
//! fallback chain of extraction tiers; every outbound call is rate limited, circuit broken and
//! retried per dependency, and credentials are rotated on quota exhaustion. Whatever happens,
//! each document ends with extracted data or in a human-review queue with a full error trail.
//!
//! ## Module Organization
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`resilience`] | Rate limiter, circuit breaker, retry handler, per-dependency guard registry |
//! | [`client`] | Credential-rotating HTTP client and defensive response parsing |
//! | [`health`] | TTL-cached tri-state health verdicts per dependency |
//! | [`fallback`] | Hybrid, single-service, template and manual-review tiers |
//! | [`jobs`] | Lease-based job queue, processor, document records, status queries |
//! | [`batch`] | Fixed-width all-settled batch runner with inter-batch pacing |
//! | [`config`] | YAML configuration with environment overrides |
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use intake_orchestrator::jobs::EnqueueRequest;
//! use intake_orchestrator::{ClassificationHints, Orchestrator, OrchestratorConfig, Priority};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> intake_orchestrator::Result<()> {
//!     intake_orchestrator::logging::init_tracing("info");
//!     let config = OrchestratorConfig::from_path("intake.yaml")?;
//!     let orchestrator = Orchestrator::from_config(config).await?;
//!
//!     orchestrator
//!         .enqueue(EnqueueRequest {
//!             document_id: "doc-42".into(),
//!             file_ref: "https://files.example.com/doc-42.pdf".into(),
//!             file_name: "Invoice-2024-03.pdf".into(),
//!             classification: ClassificationHints::new(Some("company"), Some("invoice")),
//!             priority: Priority::Normal,
//!         })
//!         .await?;
//!
//!     orchestrator.processor().run(CancellationToken::new()).await;
//!     Ok(())
//! }
//! ```

pub mod batch;
pub mod client;
pub mod clock;
pub mod config;
pub mod fallback;
pub mod health;
pub mod jobs;
pub mod logging;
pub mod orchestrator;
pub mod resilience;
pub mod transport;
pub mod types;

// Re-export main types for convenience
pub use config::OrchestratorConfig;
pub use fallback::FallbackChainManager;
pub use orchestrator::{Orchestrator, OrchestratorBuilder};
pub use types::{
    ClassificationHints, DocumentRef, ExtractedFields, ExtractionAttemptResult, ExtractionMethod,
    Priority,
};

/// Result type alias for the library
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for the library
pub mod error;
pub use error::{Error, ErrorContext};
