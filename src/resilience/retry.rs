//! Retry with exponential backoff for a single operation.

use crate::config::RetryConfig;
use rand::Rng;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Backoff policy: the delay after the n-th failed attempt (1-based) is
/// `base_delay × multiplier^(n-1)`, capped at `max_delay`, then jittered.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Option<Duration>,
    /// Fraction of the delay used as symmetric random jitter.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(cfg: &RetryConfig) -> Self {
        Self {
            max_attempts: cfg.max_attempts.max(1),
            base_delay: Duration::from_millis(cfg.base_delay_ms),
            multiplier: cfg.multiplier,
            max_delay: Some(Duration::from_millis(cfg.max_delay_ms)),
            jitter: cfg.jitter,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, multiplier: f64) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            multiplier,
            max_delay: None,
            jitter: 0.0,
        }
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = Some(max_delay);
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Delay before the next attempt, without jitter.
    pub fn base_delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(63) as i32;
        let factor = self.multiplier.max(1.0).powi(exp);
        let ms = (self.base_delay.as_millis() as f64 * factor).min(u64::MAX as f64) as u64;
        let delay = Duration::from_millis(ms);
        match self.max_delay {
            Some(cap) => delay.min(cap),
            None => delay,
        }
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        apply_jitter(self.base_delay_for(attempt), self.jitter)
    }
}

/// Spread `delay` uniformly over `[delay × (1 - jitter), delay × (1 + jitter)]`.
pub fn apply_jitter(delay: Duration, jitter: f64) -> Duration {
    if jitter <= 0.0 || delay.is_zero() {
        return delay;
    }
    let jitter = jitter.min(1.0);
    let factor = rand::thread_rng().gen_range((1.0 - jitter)..=(1.0 + jitter));
    Duration::from_secs_f64(delay.as_secs_f64() * factor)
}

pub struct RetryHandler {
    policy: RetryPolicy,
}

impl RetryHandler {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `operation` up to `max_attempts` times. The last error is returned unmodified.
    pub async fn with_retry<T, E, F, Fut>(&self, operation: F) -> std::result::Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: Display,
    {
        self.with_retry_if(operation, |_| true).await
    }

    /// Like [`with_retry`](Self::with_retry), but gives up early on errors `should_retry` rejects.
    pub async fn with_retry_if<T, E, F, Fut, P>(
        &self,
        mut operation: F,
        should_retry: P,
    ) -> std::result::Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        P: Fn(&E) -> bool,
        E: Display,
    {
        let mut attempt = 1;
        loop {
            match operation().await {
                Ok(v) => {
                    if attempt > 1 {
                        debug!(attempt, "operation succeeded after retry");
                    }
                    return Ok(v);
                }
                Err(e) => {
                    if attempt >= self.policy.max_attempts || !should_retry(&e) {
                        return Err(e);
                    }
                    let delay = self.policy.delay_for(attempt);
                    warn!(
                        attempt,
                        max_attempts = self.policy.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "attempt failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

/// One-shot form: `max_attempts` total, delays `base_delay × multiplier^(attempt-1)`, no jitter.
pub async fn with_retry<T, E, F, Fut>(
    operation: F,
    max_attempts: u32,
    base_delay: Duration,
    multiplier: f64,
) -> std::result::Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
    E: Display,
{
    RetryHandler::new(RetryPolicy::new(max_attempts, base_delay, multiplier))
        .with_retry(operation)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use std::sync::{Arc, Mutex};
    use tokio::time::Instant;

    #[test]
    fn test_delay_schedule() {
        let policy = RetryPolicy::new(5, Duration::from_millis(100), 3.0);
        assert_eq!(policy.base_delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.base_delay_for(2), Duration::from_millis(300));
        assert_eq!(policy.base_delay_for(3), Duration::from_millis(900));

        let capped = policy.with_max_delay(Duration::from_millis(500));
        assert_eq!(capped.base_delay_for(3), Duration::from_millis(500));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let base = Duration::from_millis(1_000);
        for _ in 0..200 {
            let d = apply_jitter(base, 0.2);
            assert!(d >= Duration::from_millis(800) && d <= Duration::from_millis(1_200));
        }
        assert_eq!(apply_jitter(base, 0.0), base);
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_k_failures_with_expected_delays() {
        let k = 2;
        let calls: Arc<Mutex<Vec<Instant>>> = Arc::new(Mutex::new(Vec::new()));
        let start = Instant::now();

        let recorded = Arc::clone(&calls);
        let out = with_retry(
            move || {
                let recorded = Arc::clone(&recorded);
                async move {
                    let mut v = recorded.lock().unwrap();
                    v.push(Instant::now());
                    if v.len() <= k {
                        Err(Error::transient("ocr", "timeout"))
                    } else {
                        Ok("done")
                    }
                }
            },
            4,
            Duration::from_millis(100),
            2.0,
        )
        .await
        .unwrap();

        assert_eq!(out, "done");
        let stamps = calls.lock().unwrap().clone();
        assert_eq!(stamps.len(), k + 1);
        assert_eq!(stamps[0] - start, Duration::ZERO);
        assert_eq!(stamps[1] - stamps[0], Duration::from_millis(100));
        assert_eq!(stamps[2] - stamps[1], Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn test_final_error_is_returned_unmodified() {
        let calls = Arc::new(Mutex::new(0u32));
        let counter = Arc::clone(&calls);
        let err = with_retry(
            move || {
                let counter = Arc::clone(&counter);
                async move {
                    let mut n = counter.lock().unwrap();
                    *n += 1;
                    Err::<(), _>(Error::transient("ocr", format!("failure {}", *n)))
                }
            },
            3,
            Duration::from_millis(10),
            2.0,
        )
        .await
        .unwrap_err();

        assert_eq!(*calls.lock().unwrap(), 3);
        assert_eq!(err.to_string(), "Transient failure from ocr: failure 3");
    }

    #[tokio::test(start_paused = true)]
    async fn test_predicate_stops_retrying() {
        let calls = Arc::new(Mutex::new(0u32));
        let counter = Arc::clone(&calls);
        let handler = RetryHandler::new(RetryPolicy::new(5, Duration::from_millis(10), 2.0));
        let err = handler
            .with_retry_if(
                move || {
                    let counter = Arc::clone(&counter);
                    async move {
                        *counter.lock().unwrap() += 1;
                        Err::<(), _>(Error::CircuitOpen {
                            service: "ocr".into(),
                            retry_in_ms: 100,
                        })
                    }
                },
                Error::is_retryable,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::CircuitOpen { .. }));
        assert_eq!(*calls.lock().unwrap(), 1);
    }
}
