//! 弹性模式模块：限流器、熔断器、重试与按依赖名共享的守卫注册表。
//!
//! # Resilience Primitives Module
//!
//! Guards for unreliable, rate-limited, costed dependencies.
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`rate_limiter`] | Sliding-window limiter with minimum inter-request spacing |
//! | [`circuit_breaker`] | Closed / open / half-open breaker with a single probe |
//! | [`retry`] | Exponential backoff with jitter for one operation |
//! | [`registry`] | One guard per dependency name, shared by every caller |
//!
//! ```rust
//! use intake_orchestrator::resilience::{CircuitBreakerConfig, DependencyGuard, RateLimiterConfig};
//! use std::time::Duration;
//!
//! # async fn demo() -> intake_orchestrator::Result<()> {
//! let guard = DependencyGuard::new(
//!     "ocr",
//!     RateLimiterConfig::per_minute(60),
//!     CircuitBreakerConfig::new()
//!         .with_failure_threshold(5)
//!         .with_cooldown(Duration::from_secs(60)),
//! );
//! let text = guard.run(|| async { Ok("scanned".to_string()) }).await?;
//! # let _ = text;
//! # Ok(())
//! # }
//! ```

pub mod circuit_breaker;
pub mod rate_limiter;
pub mod registry;
pub mod retry;

pub use circuit_breaker::{
    Admission, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerSnapshot, CircuitState,
};
pub use rate_limiter::{RateLimiter, RateLimiterConfig, RateLimiterSnapshot};
pub use registry::{DependencyGuard, GuardRegistry, GuardSnapshot};
pub use retry::{apply_jitter, with_retry, RetryHandler, RetryPolicy};
