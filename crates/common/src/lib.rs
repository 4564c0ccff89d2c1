//! Shared building blocks for the Ticketline crates.
//!
//! # Feature Tiers
//!
//! Enable cargo features to opt into the tiers you need:
//! - `foundation`: error and configuration types without side effects
//! - `runtime`: async resilience primitives (circuit breaker, rate limiter,
//!   retry)
//! - `test-utils`: async assertions for test suites

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms)]
#![warn(clippy::all, clippy::perf, clippy::complexity, clippy::suspicious)]

// Runtime tier
// --------------------------------------------------------------------
#[cfg(feature = "runtime")]
pub mod resilience;

// Testing utilities
// ---------------------------------------------------------------
#[cfg(any(feature = "test-utils", test))]
pub mod testing;

#[cfg(feature = "runtime")]
pub use resilience::{
    BackoffStrategy, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerMetrics, CircuitState,
    Clock, HealthStatus, Jitter, MockClock, Priority, RateLimiter, RateLimiterConfig,
    RateLimiterMetrics, ResilienceError, ResilienceResult, RetryConfig, RetryDecision,
    RetryError, RetryExecutor, RetryPolicy, RetryResult, SystemClock,
};
