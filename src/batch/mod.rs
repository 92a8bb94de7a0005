//! 批处理模块：固定宽度分批并发执行，批间限速。
//!
//! # Batch Processing Module
//!
//! Bounded fan-out for sub-tasks that must respect an aggregate throughput limit, such as
//! probing every dependency or extracting a set of candidate documents.
//!
//! Items are split into fixed-size groups. Each group runs concurrently with all-settled
//! semantics (one failure never aborts its siblings), and the processor sleeps between groups.
//!
//! ```rust
//! use intake_orchestrator::batch::process_in_batches;
//! use std::time::Duration;
//!
//! # async fn demo() {
//! let doubled = process_in_batches(
//!     vec![1, 2, 3, 4, 5],
//!     |n| async move {
//!         if n == 3 { Err("skip") } else { Ok(n * 2) }
//!     },
//!     2,
//!     Duration::from_millis(10),
//! )
//! .await;
//! assert_eq!(doubled, vec![2, 4, 8, 10]);
//! # }
//! ```

mod executor;

pub use executor::{
    process_in_batches, BatchError, BatchProcessor, BatchProcessorConfig, BatchResult,
};
