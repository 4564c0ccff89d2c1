//! Retry decisions, backoff and jitter
//!
//! [`RetryPolicy`] lets the caller classify its own errors; the rate limiter
//! and [`RetryExecutor`] turn those decisions into delays computed by
//! [`BackoffStrategy`] and randomized by [`Jitter`].

use std::fmt;
use std::future::Future;
use std::time::Duration;

use rand::Rng;
use thiserror::Error;
use tracing::{debug, instrument, warn};

use super::error::{ConfigError, ConfigResult};

/// Terminal failure of a retried operation
#[derive(Debug, Error)]
pub enum RetryError<E> {
    /// Every permitted attempt failed; carries the last error
    #[error("All retry attempts exhausted after {attempts} tries: {error}")]
    AttemptsExhausted { attempts: u32, error: E },

    /// The policy classified the error as permanent
    #[error("Operation failed with non-retryable error: {error}")]
    NonRetryable { error: E },
}

impl<E> RetryError<E> {
    /// The error returned by the final attempt.
    pub fn into_inner(self) -> E {
        match self {
            Self::AttemptsExhausted { error, .. } | Self::NonRetryable { error } => error,
        }
    }
}

pub type RetryResult<T, E> = Result<T, RetryError<E>>;

/// Classifies a failure into a retry decision
pub trait RetryPolicy<E> {
    fn should_retry(&self, error: &E, attempt: u32) -> RetryDecision;
}

/// Decision for whether to retry an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Transient failure; retry after the default backoff
    Retry,
    /// Upstream throttling; retry after the default backoff and count the
    /// failure as rate limited
    Throttled,
    /// Retry after an explicit delay
    RetryAfter(Duration),
    /// Permanent failure
    Stop,
}

impl RetryDecision {
    pub const fn is_retry(self) -> bool {
        !matches!(self, Self::Stop)
    }
}

/// Delay before the `attempt`-th retry (0-based)
#[derive(Debug, Clone, PartialEq)]
pub enum BackoffStrategy {
    Fixed(Duration),
    /// `unit * base^attempt`, capped at `max_delay`
    Exponential { unit: Duration, base: f64, max_delay: Duration },
}

impl BackoffStrategy {
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        match self {
            Self::Fixed(delay) => *delay,
            Self::Exponential { unit, base, max_delay } => {
                let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
                let millis = unit.as_millis() as f64 * base.powi(exponent);
                let capped = millis.min(max_delay.as_millis() as f64).max(0.0);
                Duration::from_millis(capped as u64)
            }
        }
    }
}

/// Randomization applied to a computed delay
#[derive(Debug, Clone, PartialEq)]
pub enum Jitter {
    None,
    /// Scale by a uniform factor in `[1 - f, 1 + f]`
    Proportional(f64),
    /// Uniform in `[0, delay]`
    Full,
}

impl Jitter {
    pub fn apply(&self, delay: Duration) -> Duration {
        match self {
            Self::None => delay,
            Self::Proportional(fraction) => {
                let fraction = fraction.clamp(0.0, 1.0);
                if fraction == 0.0 {
                    return delay;
                }
                let factor = rand::thread_rng().gen_range((1.0 - fraction)..=(1.0 + fraction));
                delay.mul_f64(factor)
            }
            Self::Full => {
                let max = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
                Duration::from_millis(rand::thread_rng().gen_range(0..=max))
            }
        }
    }
}

/// Retry limits and delay shaping
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Total attempts including the first
    pub max_attempts: u32,
    pub backoff: BackoffStrategy,
    pub jitter: Jitter,
    /// Lower bound applied after jitter
    pub min_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: BackoffStrategy::Exponential {
                unit: Duration::from_millis(500),
                base: 2.0,
                max_delay: Duration::from_secs(30),
            },
            jitter: Jitter::Proportional(0.5),
            min_delay: Duration::ZERO,
        }
    }
}

impl RetryConfig {
    pub fn builder() -> RetryConfigBuilder {
        RetryConfigBuilder::default()
    }

    /// Jittered, floored delay before retry number `attempt` (0-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.jitter.apply(self.backoff.calculate_delay(attempt)).max(self.min_delay)
    }

    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for zero attempts or a non-positive
    /// exponential base.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.max_attempts == 0 {
            return Err(ConfigError::invalid("max_attempts must be greater than 0"));
        }
        if let BackoffStrategy::Exponential { base, .. } = &self.backoff {
            if *base <= 0.0 {
                return Err(ConfigError::invalid("exponential base must be greater than 0"));
            }
        }
        Ok(())
    }
}

/// Builder for [`RetryConfig`]
#[derive(Debug, Default)]
pub struct RetryConfigBuilder {
    config: RetryConfig,
}

impl RetryConfigBuilder {
    pub const fn max_attempts(mut self, attempts: u32) -> Self {
        self.config.max_attempts = attempts;
        self
    }

    pub fn fixed_backoff(mut self, delay: Duration) -> Self {
        self.config.backoff = BackoffStrategy::Fixed(delay);
        self
    }

    pub fn exponential_backoff(mut self, unit: Duration, base: f64, max_delay: Duration) -> Self {
        self.config.backoff = BackoffStrategy::Exponential { unit, base, max_delay };
        self
    }

    pub fn no_jitter(mut self) -> Self {
        self.config.jitter = Jitter::None;
        self
    }

    pub fn proportional_jitter(mut self, fraction: f64) -> Self {
        self.config.jitter = Jitter::Proportional(fraction);
        self
    }

    pub const fn min_delay(mut self, delay: Duration) -> Self {
        self.config.min_delay = delay;
        self
    }

    /// # Errors
    ///
    /// Propagates [`RetryConfig::validate`] failures.
    pub fn build(self) -> ConfigResult<RetryConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Runs an operation until it succeeds, the policy stops it, or attempts run
/// out
#[derive(Debug, Clone)]
pub struct RetryExecutor<P> {
    config: RetryConfig,
    policy: P,
}

impl<P> RetryExecutor<P> {
    pub const fn new(config: RetryConfig, policy: P) -> Self {
        Self { config, policy }
    }

    /// # Errors
    ///
    /// Returns [`RetryError::NonRetryable`] when the policy stops, and
    /// [`RetryError::AttemptsExhausted`] after the last permitted attempt.
    #[instrument(skip(self, operation), fields(max_attempts = self.config.max_attempts))]
    pub async fn execute<F, Fut, T, E>(&self, mut operation: F) -> RetryResult<T, E>
    where
        P: RetryPolicy<E>,
        E: fmt::Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempt: u32 = 0;
        loop {
            let error = match operation().await {
                Ok(value) => {
                    if attempt > 0 {
                        debug!(retries = attempt, "retry_succeeded");
                    }
                    return Ok(value);
                }
                Err(error) => error,
            };

            let decision = self.policy.should_retry(&error, attempt);
            if !decision.is_retry() {
                return Err(RetryError::NonRetryable { error });
            }
            if attempt + 1 >= self.config.max_attempts {
                warn!(attempts = attempt + 1, error = %error, "retry_exhausted");
                return Err(RetryError::AttemptsExhausted { attempts: attempt + 1, error });
            }

            let delay = match decision {
                RetryDecision::RetryAfter(delay) => delay,
                _ => self.config.delay_for(attempt),
            };
            warn!(attempt = attempt + 1, ?delay, error = %error, "retry_scheduled");
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

/// Pre-defined retry policies
pub mod policies {
    use super::{RetryDecision, RetryPolicy};

    /// Never retries
    #[derive(Debug, Clone, Copy)]
    pub struct NeverRetry;

    impl<E> RetryPolicy<E> for NeverRetry {
        fn should_retry(&self, _error: &E, _attempt: u32) -> RetryDecision {
            RetryDecision::Stop
        }
    }

    /// Retries while the predicate holds
    #[derive(Debug, Clone)]
    pub struct PredicateRetry<F> {
        predicate: F,
    }

    impl<F> PredicateRetry<F> {
        pub const fn new(predicate: F) -> Self {
            Self { predicate }
        }
    }

    impl<F, E> RetryPolicy<E> for PredicateRetry<F>
    where
        F: Fn(&E) -> bool,
    {
        fn should_retry(&self, error: &E, _attempt: u32) -> RetryDecision {
            if (self.predicate)(error) {
                RetryDecision::Retry
            } else {
                RetryDecision::Stop
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::policies::{NeverRetry, PredicateRetry};
    use super::*;

    #[derive(Debug, PartialEq, Eq)]
    struct Flaky(&'static str);

    impl fmt::Display for Flaky {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(self.0)
        }
    }

    fn quick(attempts: u32) -> RetryConfig {
        RetryConfig::builder()
            .max_attempts(attempts)
            .fixed_backoff(Duration::from_millis(1))
            .no_jitter()
            .build()
            .unwrap()
    }

    /// Validates `BackoffStrategy::Exponential` behavior for the capped growth
    /// scenario.
    ///
    /// Assertions:
    /// - Confirms delays follow `unit * base^attempt`.
    /// - Ensures large attempts are capped at `max_delay`.
    #[test]
    fn exponential_backoff_grows_and_caps() {
        let strategy = BackoffStrategy::Exponential {
            unit: Duration::from_millis(1_000),
            base: 2.0,
            max_delay: Duration::from_secs(30),
        };
        assert_eq!(strategy.calculate_delay(0), Duration::from_secs(1));
        assert_eq!(strategy.calculate_delay(1), Duration::from_secs(2));
        assert_eq!(strategy.calculate_delay(3), Duration::from_secs(8));
        assert_eq!(strategy.calculate_delay(20), Duration::from_secs(30));
        assert_eq!(strategy.calculate_delay(u32::MAX), Duration::from_secs(30));
    }

    /// Validates `Jitter::Proportional` behavior for the ±50% band scenario.
    ///
    /// Assertions:
    /// - Ensures every sample stays within half to one and a half times the
    ///   delay.
    #[test]
    fn proportional_jitter_stays_in_band() {
        let jitter = Jitter::Proportional(0.5);
        for _ in 0..200 {
            let delay = jitter.apply(Duration::from_secs(4));
            assert!(delay >= Duration::from_secs(2) && delay <= Duration::from_secs(6));
        }
        assert_eq!(Jitter::None.apply(Duration::from_secs(4)), Duration::from_secs(4));
    }

    /// Validates `RetryConfig::delay_for` behavior for the floor scenario.
    ///
    /// Assertions:
    /// - Confirms the floor is applied after jitter.
    #[test]
    fn delay_floor_applies_after_jitter() {
        let config = RetryConfig::builder()
            .exponential_backoff(Duration::from_millis(10), 2.0, Duration::from_secs(1))
            .proportional_jitter(0.5)
            .min_delay(Duration::from_secs(2))
            .build()
            .unwrap();
        assert_eq!(config.delay_for(0), Duration::from_secs(2));
    }

    #[test]
    fn config_rejects_zero_attempts() {
        assert!(RetryConfig::builder().max_attempts(0).build().is_err());
        assert!(RetryConfig::builder()
            .exponential_backoff(Duration::from_millis(1), 0.0, Duration::from_secs(1))
            .build()
            .is_err());
    }

    /// Validates `RetryExecutor::execute` behavior for the transient failure
    /// scenario.
    ///
    /// Assertions:
    /// - Confirms the operation succeeds on the third attempt.
    #[tokio::test]
    async fn executor_retries_until_success() {
        let calls = AtomicU32::new(0);
        let executor = RetryExecutor::new(quick(3), PredicateRetry::new(|_: &Flaky| true));

        let result = executor
            .execute(|| async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(Flaky("reset"))
                } else {
                    Ok(7)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    /// Validates `RetryExecutor::execute` behavior for the exhausted attempts
    /// scenario.
    ///
    /// Assertions:
    /// - Confirms the last error is carried out of the executor.
    #[tokio::test]
    async fn executor_surfaces_last_error() {
        let calls = AtomicU32::new(0);
        let executor = RetryExecutor::new(quick(2), PredicateRetry::new(|_: &Flaky| true));

        let result: RetryResult<(), Flaky> = executor
            .execute(|| async {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                Err(if n == 0 { Flaky("first") } else { Flaky("second") })
            })
            .await;

        let err = result.unwrap_err();
        assert!(matches!(err, RetryError::AttemptsExhausted { attempts: 2, .. }));
        assert_eq!(err.into_inner(), Flaky("second"));
    }

    #[tokio::test]
    async fn never_retry_stops_immediately() {
        let calls = AtomicU32::new(0);
        let executor = RetryExecutor::new(quick(5), NeverRetry);
        let result: RetryResult<(), Flaky> = executor
            .execute(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Flaky("bad request"))
            })
            .await;

        assert!(matches!(result, Err(RetryError::NonRetryable { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
