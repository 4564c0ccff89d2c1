//! Resilience primitives guarding calls to a remote service
//!
//! - [`CircuitBreaker`]: stops calling an upstream that keeps failing and
//!   probes it again after a cooldown.
//! - [`RateLimiter`]: paces calls under a per-second and an in-flight ceiling
//!   with priority queueing and retry.
//! - [`RetryExecutor`]: standalone retry with backoff and jitter.
//!
//! All time-dependent logic reads a [`Clock`] or tokio time, so tests drive
//! it with [`MockClock`] or short real intervals.

pub mod circuit_breaker;
pub mod clock;
pub mod error;
pub mod rate_limiter;
pub mod retry;

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerConfigBuilder, CircuitBreakerMetrics,
    CircuitState,
};
pub use clock::{Clock, MockClock, SystemClock};
pub use error::{ConfigError, ConfigResult, ResilienceError, ResilienceResult};
pub use rate_limiter::{
    HealthStatus, Priority, RateLimiter, RateLimiterConfig, RateLimiterConfigBuilder,
    RateLimiterMetrics,
};
pub use retry::{
    policies, BackoffStrategy, Jitter, RetryConfig, RetryConfigBuilder, RetryDecision,
    RetryError, RetryExecutor, RetryPolicy, RetryResult,
};
