//! Mapping from configuration sections to resilience primitive configs

use std::time::Duration;

use ticketline_common::resilience::{
    CircuitBreakerConfig, CircuitBreakerConfigBuilder, ConfigError, RateLimiterConfig, RetryConfig,
};
use ticketline_domain::{BreakerSettings, RateLimitSettings, Result, TicketlineError};

fn config_error(err: ConfigError) -> TicketlineError {
    TicketlineError::Config(err.to_string())
}

/// Limiter config: `base^retry * unit` backoff, capped, with ±50% jitter and
/// the configured floor.
///
/// # Errors
///
/// Returns [`TicketlineError::Config`] for zero ceilings or a non-positive
/// backoff base.
pub fn limiter_config(settings: &RateLimitSettings) -> Result<RateLimiterConfig> {
    let backoff = RetryConfig::builder()
        .max_attempts(settings.max_retries.saturating_add(1))
        .exponential_backoff(
            Duration::from_millis(settings.backoff_unit_ms),
            settings.backoff_base,
            Duration::from_millis(settings.backoff_cap_ms),
        )
        .proportional_jitter(0.5)
        .min_delay(Duration::from_millis(settings.backoff_floor_ms))
        .build()
        .map_err(config_error)?;

    RateLimiterConfig::builder()
        .requests_per_second(settings.requests_per_second)
        .max_concurrent(settings.max_concurrent)
        .max_retries(settings.max_retries)
        .backoff(backoff)
        .poll_interval(Duration::from_millis(settings.poll_interval_ms))
        .build()
        .map_err(config_error)
}

/// # Errors
///
/// Returns [`TicketlineError::Config`] for zero thresholds.
pub fn breaker_config(settings: &BreakerSettings) -> Result<CircuitBreakerConfig> {
    CircuitBreakerConfigBuilder::new()
        .failure_threshold(u64::from(settings.failure_threshold))
        .success_threshold(u64::from(settings.success_threshold))
        .cooldown(Duration::from_secs(settings.cooldown_secs))
        .half_open_max_calls(u64::from(settings.half_open_max_calls))
        .build()
        .map_err(config_error)
}
