//! Batch executor.

use crate::config::BatchConfig;
use futures::future::join_all;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct BatchResult<T, E> {
    pub successes: Vec<(usize, T)>,
    pub failures: Vec<(usize, E)>,
    pub execution_time: Duration,
    pub total_processed: usize,
    pub batches: usize,
}

impl<T, E> BatchResult<T, E> {
    pub fn new() -> Self {
        Self {
            successes: Vec::new(),
            failures: Vec::new(),
            execution_time: Duration::ZERO,
            total_processed: 0,
            batches: 0,
        }
    }
    pub fn add_success(&mut self, i: usize, r: T) {
        self.successes.push((i, r));
    }
    pub fn add_failure(&mut self, i: usize, e: E) {
        self.failures.push((i, e));
    }
    pub fn success_count(&self) -> usize {
        self.successes.len()
    }
    pub fn failure_count(&self) -> usize {
        self.failures.len()
    }
    /// Fulfilled values in input order.
    pub fn into_values(self) -> Vec<T> {
        self.successes.into_iter().map(|(_, v)| v).collect()
    }
}
impl<T, E> Default for BatchResult<T, E> {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
pub struct BatchError {
    pub message: String,
    pub index: usize,
}
impl BatchError {
    pub fn new(msg: impl Into<String>, idx: usize) -> Self {
        Self {
            message: msg.into(),
            index: idx,
        }
    }
}
impl std::fmt::Display for BatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Batch error at {}: {}", self.index, self.message)
    }
}
impl std::error::Error for BatchError {}

#[derive(Debug, Clone)]
pub struct BatchProcessorConfig {
    pub batch_size: usize,
    pub inter_batch_delay: Duration,
}
impl Default for BatchProcessorConfig {
    fn default() -> Self {
        Self::from(&BatchConfig::default())
    }
}
impl From<&BatchConfig> for BatchProcessorConfig {
    fn from(c: &BatchConfig) -> Self {
        Self {
            batch_size: c.batch_size,
            inter_batch_delay: Duration::from_millis(c.inter_batch_delay_ms),
        }
    }
}
impl BatchProcessorConfig {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn with_batch_size(mut self, n: usize) -> Self {
        self.batch_size = n;
        self
    }
    pub fn with_inter_batch_delay(mut self, d: Duration) -> Self {
        self.inter_batch_delay = d;
        self
    }
}

pub struct BatchProcessor {
    config: BatchProcessorConfig,
}
impl BatchProcessor {
    pub fn new() -> Self {
        Self {
            config: BatchProcessorConfig::default(),
        }
    }
    pub fn with_config(config: BatchProcessorConfig) -> Self {
        Self { config }
    }
    pub fn config(&self) -> &BatchProcessorConfig {
        &self.config
    }

    /// Run `worker` over `items` in groups, returning only the fulfilled results in input order.
    pub async fn process_in_batches<T, R, E, F, Fut>(&self, items: Vec<T>, worker: F) -> Vec<R>
    where
        F: Fn(T) -> Fut,
        Fut: Future<Output = std::result::Result<R, E>>,
        E: std::fmt::Display,
    {
        self.process_in_batches_detailed(items, worker)
            .await
            .into_values()
    }

    /// Like [`process_in_batches`](Self::process_in_batches) but keeps failures and timings.
    pub async fn process_in_batches_detailed<T, R, E, F, Fut>(
        &self,
        items: Vec<T>,
        worker: F,
    ) -> BatchResult<R, BatchError>
    where
        F: Fn(T) -> Fut,
        Fut: Future<Output = std::result::Result<R, E>>,
        E: std::fmt::Display,
    {
        let start = Instant::now();
        let total = items.len();
        let size = self.config.batch_size.max(1);
        let mut result = BatchResult::new();

        let mut pending = items.into_iter().enumerate().peekable();
        while pending.peek().is_some() {
            if result.batches > 0 && !self.config.inter_batch_delay.is_zero() {
                tokio::time::sleep(self.config.inter_batch_delay).await;
            }
            let group: Vec<(usize, T)> = pending.by_ref().take(size).collect();
            debug!(batch = result.batches, items = group.len(), "running batch");
            let outcomes = join_all(
                group
                    .into_iter()
                    .map(|(i, item)| {
                        let fut = worker(item);
                        async move { (i, fut.await) }
                    }),
            )
            .await;
            for (i, outcome) in outcomes {
                match outcome {
                    Ok(r) => result.add_success(i, r),
                    Err(e) => result.add_failure(i, BatchError::new(e.to_string(), i)),
                }
            }
            result.batches += 1;
        }

        result.execution_time = start.elapsed();
        result.total_processed = total;
        debug!(
            batches = result.batches,
            succeeded = result.success_count(),
            failed = result.failure_count(),
            "batch run finished"
        );
        result
    }
}
impl Default for BatchProcessor {
    fn default() -> Self {
        Self::new()
    }
}

/// Convenience form of [`BatchProcessor::process_in_batches`].
pub async fn process_in_batches<T, R, E, F, Fut>(
    items: Vec<T>,
    worker: F,
    batch_size: usize,
    inter_batch_delay: Duration,
) -> Vec<R>
where
    F: Fn(T) -> Fut,
    Fut: Future<Output = std::result::Result<R, E>>,
    E: std::fmt::Display,
{
    BatchProcessor::with_config(
        BatchProcessorConfig::new()
            .with_batch_size(batch_size)
            .with_inter_batch_delay(inter_batch_delay),
    )
    .process_in_batches(items, worker)
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_failures_do_not_abort_siblings() {
        let processor = BatchProcessor::with_config(
            BatchProcessorConfig::new()
                .with_batch_size(3)
                .with_inter_batch_delay(Duration::from_millis(100)),
        );
        let result = processor
            .process_in_batches_detailed((0..7).collect(), |n: u32| async move {
                if n % 3 == 1 {
                    Err(format!("item {} failed", n))
                } else {
                    Ok(n)
                }
            })
            .await;
        assert_eq!(result.batches, 3);
        assert_eq!(result.failure_count(), 2);
        assert_eq!(result.total_processed, 7);
        assert_eq!(result.into_values(), vec![0, 2, 3, 5, 6]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleeps_only_between_batches() {
        let start = Instant::now();
        let out = process_in_batches(
            vec![1, 2, 3, 4],
            |n: i32| async move { Ok::<_, String>(n) },
            2,
            Duration::from_secs(1),
        )
        .await;
        assert_eq!(out, vec![1, 2, 3, 4]);
        assert_eq!(start.elapsed(), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_group_width_bounds_concurrency() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let processor = BatchProcessor::with_config(
            BatchProcessorConfig::new()
                .with_batch_size(2)
                .with_inter_batch_delay(Duration::ZERO),
        );
        let out = processor
            .process_in_batches((0..6).collect(), |n: usize| {
                let running = Arc::clone(&running);
                let peak = Arc::clone(&peak);
                async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok::<_, String>(n)
                }
            })
            .await;
        assert_eq!(out.len(), 6);
        assert_eq!(peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_empty_input() {
        let out: Vec<u8> = process_in_batches(
            Vec::<u8>::new(),
            |n| async move { Ok::<_, String>(n) },
            4,
            Duration::from_secs(5),
        )
        .await;
        assert!(out.is_empty());
    }
}
