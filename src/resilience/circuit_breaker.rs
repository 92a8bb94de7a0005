use crate::{Error, Result};
use serde::Serialize;
use std::future::Future;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerSnapshot {
    pub service: String,
    pub state: CircuitState,
    pub failure_threshold: u32,
    pub cooldown_ms: u64,
    pub failure_count: u32,
    /// Remaining open time in ms, if currently open.
    pub open_remaining_ms: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(60),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold.max(1);
        self
    }

    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }
}

/// How a call was let through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Normal,
    /// The single half-open probe.
    Probe,
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    failure_count: u32,
    last_failure_at: Option<Instant>,
    probe_in_flight: bool,
}

/// Per-dependency circuit breaker.
///
/// Transitions: closed→open once `failure_threshold` consecutive failures are recorded;
/// open→half_open once `cooldown` has elapsed since the last failure; half_open→closed when
/// the single probe succeeds, half_open→open when it fails.
pub struct CircuitBreaker {
    service: String,
    cfg: CircuitBreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(service: impl Into<String>, cfg: CircuitBreakerConfig) -> Self {
        Self {
            service: service.into(),
            cfg,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                failure_count: 0,
                last_failure_at: None,
                probe_in_flight: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // plain counters; a panic elsewhere cannot leave them half-written
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    fn open_error(&self, retry_in: Duration) -> Error {
        Error::CircuitOpen {
            service: self.service.clone(),
            retry_in_ms: retry_in.as_millis() as u64,
        }
    }

    /// Decide whether a call may go through right now.
    pub fn allow(&self) -> Result<Admission> {
        let mut st = self.lock();
        match st.state {
            CircuitState::Closed => Ok(Admission::Normal),
            CircuitState::Open => {
                let now = Instant::now();
                let reopen_at = st
                    .last_failure_at
                    .map(|t| t + self.cfg.cooldown)
                    .unwrap_or(now);
                if now >= reopen_at {
                    st.state = CircuitState::HalfOpen;
                    st.probe_in_flight = true;
                    info!(service = %self.service, "circuit half-open, sending probe");
                    Ok(Admission::Probe)
                } else {
                    Err(self.open_error(reopen_at - now))
                }
            }
            CircuitState::HalfOpen => {
                if st.probe_in_flight {
                    Err(self.open_error(Duration::ZERO))
                } else {
                    st.probe_in_flight = true;
                    Ok(Admission::Probe)
                }
            }
        }
    }

    pub fn on_success(&self) {
        let mut st = self.lock();
        if st.state != CircuitState::Closed {
            info!(service = %self.service, "circuit closed");
        }
        st.state = CircuitState::Closed;
        st.failure_count = 0;
        st.probe_in_flight = false;
    }

    pub fn on_failure(&self) {
        let mut st = self.lock();
        st.failure_count = st.failure_count.saturating_add(1);
        match st.state {
            CircuitState::Closed => {
                if st.failure_count >= self.cfg.failure_threshold {
                    st.state = CircuitState::Open;
                    st.last_failure_at = Some(Instant::now());
                    warn!(
                        service = %self.service,
                        failures = st.failure_count,
                        cooldown_ms = self.cfg.cooldown.as_millis() as u64,
                        "circuit opened"
                    );
                }
            }
            CircuitState::HalfOpen => {
                st.state = CircuitState::Open;
                st.last_failure_at = Some(Instant::now());
                st.probe_in_flight = false;
                warn!(service = %self.service, "probe failed, circuit reopened");
            }
            // a call admitted before the circuit opened; the cooldown clock is not extended
            CircuitState::Open => {}
        }
    }

    /// Outcome that says nothing about the dependency's health (e.g. a quota response).
    /// Only frees the probe slot so the next call can probe.
    pub fn on_neutral(&self) {
        let mut st = self.lock();
        st.probe_in_flight = false;
    }

    /// Run `operation` unless the circuit is open.
    ///
    /// Errors for which [`Error::trips_breaker`] is false are passed through without counting.
    pub async fn execute<T, F, Fut>(&self, operation: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.allow()?;
        match operation().await {
            Ok(v) => {
                self.on_success();
                Ok(v)
            }
            Err(e) => {
                if e.trips_breaker() {
                    self.on_failure();
                } else {
                    self.on_neutral();
                }
                Err(e)
            }
        }
    }

    pub fn snapshot(&self) -> CircuitBreakerSnapshot {
        let st = self.lock();
        let now = Instant::now();
        let open_remaining_ms = match (st.state, st.last_failure_at) {
            (CircuitState::Open, Some(at)) => {
                let until = at + self.cfg.cooldown;
                if until > now {
                    Some((until - now).as_millis() as u64)
                } else {
                    None
                }
            }
            _ => None,
        };
        CircuitBreakerSnapshot {
            service: self.service.clone(),
            state: st.state,
            failure_threshold: self.cfg.failure_threshold,
            cooldown_ms: self.cfg.cooldown.as_millis() as u64,
            failure_count: st.failure_count,
            open_remaining_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn breaker(threshold: u32, cooldown_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(
            "ocr",
            CircuitBreakerConfig::new()
                .with_failure_threshold(threshold)
                .with_cooldown(Duration::from_millis(cooldown_ms)),
        )
    }

    async fn failing(calls: &AtomicU32) -> Result<()> {
        calls.fetch_add(1, Ordering::SeqCst);
        Err(Error::transient("ocr", "503"))
    }

    #[test]
    fn test_circuit_breaker_config_defaults() {
        let config = CircuitBreakerConfig::default();
        assert_eq!(config.failure_threshold, 5);
        assert_eq!(config.cooldown, Duration::from_secs(60));
    }

    #[test]
    fn test_success_resets_failures() {
        let cb = breaker(5, 100);
        cb.on_failure();
        cb.on_failure();
        assert_eq!(cb.snapshot().failure_count, 2);

        cb.on_success();
        assert_eq!(cb.snapshot().failure_count, 0);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_circuit_does_not_invoke_operation() {
        let cb = breaker(3, 1_000);
        let calls = AtomicU32::new(0);

        for _ in 0..3 {
            assert!(cb.execute(|| failing(&calls)).await.is_err());
        }
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let err = cb.execute(|| failing(&calls)).await.unwrap_err();
        assert!(matches!(err, Error::CircuitOpen { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(cb.snapshot().open_remaining_ms.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_probe_success_closes() {
        let cb = breaker(2, 500);
        let calls = AtomicU32::new(0);
        let _ = cb.execute(|| failing(&calls)).await;
        let _ = cb.execute(|| failing(&calls)).await;
        assert_eq!(cb.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_millis(499)).await;
        assert!(cb.allow().is_err());

        tokio::time::advance(Duration::from_millis(1)).await;
        let out = cb.execute(|| async { Ok::<_, Error>(42) }).await.unwrap();
        assert_eq!(out, 42);
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.snapshot().failure_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_probe_failure_reopens() {
        let cb = breaker(1, 200);
        let calls = AtomicU32::new(0);
        let _ = cb.execute(|| failing(&calls)).await;
        assert_eq!(cb.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_millis(200)).await;
        let _ = cb.execute(|| failing(&calls)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(cb.state(), CircuitState::Open);

        // cooldown restarted from the probe failure
        tokio::time::advance(Duration::from_millis(100)).await;
        assert!(cb.execute(|| failing(&calls)).await.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_only_one_probe_in_half_open() {
        let cb = breaker(1, 10);
        cb.on_failure();
        tokio::time::advance(Duration::from_millis(10)).await;

        assert_eq!(cb.allow().unwrap(), Admission::Probe);
        assert!(matches!(cb.allow(), Err(Error::CircuitOpen { .. })));
        assert_eq!(cb.state(), CircuitState::HalfOpen);
    }

    #[tokio::test]
    async fn test_non_tripping_errors_are_not_counted() {
        let cb = breaker(1, 1_000);
        let err = cb
            .execute(|| async {
                Err::<(), _>(Error::QuotaExhausted {
                    service: "ocr".into(),
                    credential: "primary".into(),
                    retry_after_ms: None,
                })
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::QuotaExhausted { .. }));
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.snapshot().failure_count, 0);
    }

    #[test]
    fn test_circuit_breaker_thread_safe() {
        let cb = Arc::new(breaker(1_000, 100));
        let mut handles = vec![];
        for _ in 0..10 {
            let cb_clone = Arc::clone(&cb);
            handles.push(std::thread::spawn(move || {
                for _ in 0..5 {
                    cb_clone.on_failure();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(cb.snapshot().failure_count, 50);
    }
}
