//! 作业队列：租约式领取、指数退避重试与有界重试预算。
//!
//! # Job Queue Module
//!
//! Durable, priority-ordered queue of extraction jobs and the processor that drains it.
//!
//! ```text
//! queued ──claim──▶ processing ──▶ completed
//!   ▲                  │  │
//!   │                  │  └──────▶ failed ──▶ document failed + manual review
//!   └── scheduled_for ◀┘
//!       (retry_scheduled)
//! ```
//!
//! Claiming is a lease: the store moves a job to `processing` under an owner and a deadline in
//! one step, so racing workers never share a job and a crashed worker's job is reclaimed once
//! the deadline passes. Only one job per document is ever `processing`.

pub mod documents;
pub mod model;
pub mod processor;
pub mod status;
pub mod store;

pub use documents::{DocumentRecord, DocumentStatus, DocumentStore, MemoryDocumentStore};
pub use model::{Job, JobPayload, JobStatus};
pub use processor::{
    AsyncProcessor, EnqueueRequest, ProcessOutcome, ProcessorConfig, ProcessorEvent,
};
pub use status::{get_job_status, progress_percentage, JobStatusView};
pub use store::{JobStore, LocalJobStore, QueueStats};
