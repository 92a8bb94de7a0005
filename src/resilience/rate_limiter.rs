use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

const WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct RateLimiterSnapshot {
    pub requests_per_minute: u32,
    pub min_interval_ms: u64,
    /// Requests issued within the trailing window.
    pub in_window: usize,
    /// Estimated wait time until the next request may be issued (ms), if any.
    pub estimated_wait_ms: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    pub requests_per_minute: u32,
    /// Trailing window the capacity applies to.
    pub window: Duration,
}

impl RateLimiterConfig {
    pub fn per_minute(requests_per_minute: u32) -> Self {
        Self {
            requests_per_minute: requests_per_minute.max(1),
            window: WINDOW,
        }
    }

    /// Minimum spacing between two consecutive requests: `window / requests_per_minute`.
    pub fn min_interval(&self) -> Duration {
        self.window / self.requests_per_minute.max(1)
    }
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self::per_minute(60)
    }
}

#[derive(Debug, Default)]
struct State {
    history: VecDeque<Instant>,
}

/// Sliding-window rate limiter with minimum inter-request spacing.
///
/// Two constraints hold at once: no more than `requests_per_minute` requests in the trailing
/// window, and no two requests closer than [`RateLimiterConfig::min_interval`].
pub struct RateLimiter {
    cfg: RateLimiterConfig,
    state: Mutex<State>,
}

impl RateLimiter {
    pub fn new(cfg: RateLimiterConfig) -> Self {
        Self {
            cfg,
            state: Mutex::new(State::default()),
        }
    }

    pub fn config(&self) -> &RateLimiterConfig {
        &self.cfg
    }

    fn prune(window: Duration, st: &mut State, now: Instant) {
        while let Some(front) = st.history.front() {
            if now.duration_since(*front) >= window {
                st.history.pop_front();
            } else {
                break;
            }
        }
    }

    fn wait_locked(cfg: &RateLimiterConfig, st: &mut State, now: Instant) -> Duration {
        Self::prune(cfg.window, st, now);

        let capacity = cfg.requests_per_minute as usize;
        let mut wait = Duration::ZERO;
        if st.history.len() >= capacity {
            if let Some(oldest) = st.history.front() {
                wait = (*oldest + cfg.window).saturating_duration_since(now);
            }
        }
        if let Some(last) = st.history.back() {
            let spacing = (*last + cfg.min_interval()).saturating_duration_since(now);
            wait = wait.max(spacing);
        }
        wait
    }

    /// Suspend until one more request may be issued, then record it.
    ///
    /// Never fails; it only delays.
    pub async fn throttle(&self) {
        loop {
            let wait = {
                let mut st = self.state.lock().await;
                let now = Instant::now();
                let wait = Self::wait_locked(&self.cfg, &mut st, now);
                if wait.is_zero() {
                    st.history.push_back(now);
                    return;
                }
                wait
            };
            tracing::trace!(wait_ms = wait.as_millis() as u64, "rate limiter sleeping");
            tokio::time::sleep(wait).await;
        }
    }

    pub async fn snapshot(&self) -> RateLimiterSnapshot {
        let mut st = self.state.lock().await;
        let wait = Self::wait_locked(&self.cfg, &mut st, Instant::now());
        RateLimiterSnapshot {
            requests_per_minute: self.cfg.requests_per_minute,
            min_interval_ms: self.cfg.min_interval().as_millis() as u64,
            in_window: st.history.len(),
            estimated_wait_ms: if wait.is_zero() {
                None
            } else {
                Some(wait.as_millis() as u64)
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_min_interval_from_rpm() {
        assert_eq!(
            RateLimiterConfig::per_minute(60).min_interval(),
            Duration::from_secs(1)
        );
        assert_eq!(
            RateLimiterConfig::per_minute(120).min_interval(),
            Duration::from_millis(500)
        );
        // zero is clamped rather than dividing by zero
        assert_eq!(RateLimiterConfig::per_minute(0).requests_per_minute, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_request_is_immediate() {
        let limiter = RateLimiter::new(RateLimiterConfig::per_minute(10));
        let start = Instant::now();
        limiter.throttle().await;
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_consecutive_requests_are_spaced() {
        let limiter = RateLimiter::new(RateLimiterConfig::per_minute(120));
        let start = Instant::now();
        for _ in 0..3 {
            limiter.throttle().await;
        }
        // 3 requests => 2 gaps of 500ms
        assert!(start.elapsed() >= Duration::from_millis(1_000));
        assert!(start.elapsed() < Duration::from_millis(1_100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_capacity_blocks_until_oldest_ages_out() {
        let cfg = RateLimiterConfig {
            requests_per_minute: 2,
            window: Duration::from_secs(60),
        };
        let limiter = RateLimiter::new(cfg);
        let start = Instant::now();
        limiter.throttle().await;
        limiter.throttle().await; // spaced by 30s
        assert!(start.elapsed() >= Duration::from_secs(30));

        limiter.throttle().await; // must wait for the first to leave the window
        assert!(start.elapsed() >= Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_predicts_wait() {
        let limiter = RateLimiter::new(RateLimiterConfig::per_minute(6));
        assert!(limiter.snapshot().await.estimated_wait_ms.is_none());

        limiter.throttle().await;
        let snap = limiter.snapshot().await;
        assert_eq!(snap.in_window, 1);
        assert_eq!(snap.min_interval_ms, 10_000);
        assert_eq!(snap.estimated_wait_ms, Some(10_000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_never_exceed_capacity() {
        use std::sync::Arc;

        let limiter = Arc::new(RateLimiter::new(RateLimiterConfig::per_minute(600)));
        let mut handles = Vec::new();
        for _ in 0..5 {
            let l = Arc::clone(&limiter);
            handles.push(tokio::spawn(async move {
                l.throttle().await;
                Instant::now()
            }));
        }
        let mut stamps = Vec::new();
        for h in handles {
            stamps.push(h.await.unwrap());
        }
        stamps.sort();
        for pair in stamps.windows(2) {
            assert!(pair[1].duration_since(pair[0]) >= Duration::from_millis(100));
        }
    }
}
