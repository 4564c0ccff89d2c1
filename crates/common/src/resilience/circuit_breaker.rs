//! Failure-triggered circuit breaker
//!
//! The breaker guards an upstream dependency with three states:
//!
//! - **Closed**: calls pass through; consecutive failures are counted and the
//!   circuit opens once they reach `failure_threshold`.
//! - **Open**: calls are rejected with [`ResilienceError::CircuitOpen`] without
//!   invoking the operation until `cooldown` has elapsed.
//! - **Half-open**: up to `half_open_max_calls` trial calls run concurrently.
//!   Any failure reopens the circuit and restarts the cooldown;
//!   `success_threshold` consecutive successes close it.
//!
//! All state lives behind one mutex so transitions and counters are updated
//! together under concurrent callers.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use super::clock::{Clock, SystemClock};
use super::error::{ConfigError, ConfigResult, ResilienceError, ResilienceResult};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "CLOSED"),
            Self::Open => write!(f, "OPEN"),
            Self::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// Configuration for circuit breaker behavior
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open a closed circuit
    pub failure_threshold: u64,
    /// Consecutive half-open successes that close the circuit
    pub success_threshold: u64,
    /// Time spent open before trial calls are admitted
    pub cooldown: Duration,
    /// Concurrent trial calls admitted while half-open
    pub half_open_max_calls: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 1,
            cooldown: Duration::from_secs(30),
            half_open_max_calls: 1,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn builder() -> CircuitBreakerConfigBuilder {
        CircuitBreakerConfigBuilder::new()
    }

    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] when any threshold is zero.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.failure_threshold == 0 {
            return Err(ConfigError::invalid("failure_threshold must be greater than 0"));
        }
        if self.success_threshold == 0 {
            return Err(ConfigError::invalid("success_threshold must be greater than 0"));
        }
        if self.half_open_max_calls == 0 {
            return Err(ConfigError::invalid("half_open_max_calls must be greater than 0"));
        }
        Ok(())
    }
}

/// Builder for [`CircuitBreakerConfig`]
#[derive(Debug, Default)]
pub struct CircuitBreakerConfigBuilder {
    config: CircuitBreakerConfig,
}

impl CircuitBreakerConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub const fn failure_threshold(mut self, threshold: u64) -> Self {
        self.config.failure_threshold = threshold;
        self
    }

    pub const fn success_threshold(mut self, threshold: u64) -> Self {
        self.config.success_threshold = threshold;
        self
    }

    pub const fn cooldown(mut self, cooldown: Duration) -> Self {
        self.config.cooldown = cooldown;
        self
    }

    pub const fn half_open_max_calls(mut self, max_calls: u64) -> Self {
        self.config.half_open_max_calls = max_calls;
        self
    }

    /// # Errors
    ///
    /// Propagates [`CircuitBreakerConfig::validate`] failures.
    pub fn build(self) -> ConfigResult<CircuitBreakerConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Point-in-time view of breaker state and counters
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CircuitBreakerMetrics {
    pub state: CircuitState,
    pub consecutive_failures: u64,
    pub consecutive_successes: u64,
    pub total_calls: u64,
    pub total_successes: u64,
    pub total_failures: u64,
    /// Calls refused while open or with no half-open permit left
    pub total_rejections: u64,
    pub half_open_in_flight: u64,
    #[serde(with = "duration_millis")]
    pub since_transition: Duration,
}

mod duration_millis {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u64,
    consecutive_successes: u64,
    half_open_in_flight: u64,
    /// Bumped on every transition; trial permits from an earlier phase are stale.
    generation: u64,
    last_transition: Instant,
    total_calls: u64,
    total_successes: u64,
    total_failures: u64,
    total_rejections: u64,
}

impl BreakerState {
    const fn new(now: Instant) -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            half_open_in_flight: 0,
            generation: 0,
            last_transition: now,
            total_calls: 0,
            total_successes: 0,
            total_failures: 0,
            total_rejections: 0,
        }
    }

    fn transition(&mut self, to: CircuitState, now: Instant) {
        self.state = to;
        self.last_transition = now;
        self.consecutive_failures = 0;
        self.consecutive_successes = 0;
        self.half_open_in_flight = 0;
        self.generation = self.generation.wrapping_add(1);
    }

    fn owns_trial(&self, admission: Admission) -> bool {
        matches!(admission, Admission::Trial { generation } if generation == self.generation)
            && self.state == CircuitState::HalfOpen
    }
}

/// Permit returned by admission; records which state admitted the call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    Closed,
    Trial { generation: u64 },
}

/// Returns a half-open trial permit if the call is dropped before it settles.
struct TrialGuard<'a, C: Clock> {
    breaker: &'a CircuitBreaker<C>,
    admission: Admission,
    armed: bool,
}

impl<C: Clock> Drop for TrialGuard<'_, C> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut inner = self.breaker.inner.lock();
        if inner.owns_trial(self.admission) {
            inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
            debug!(in_flight = inner.half_open_in_flight, "trial_abandoned");
        }
    }
}

/// Circuit breaker shared across concurrent callers
///
/// Cloning is cheap and clones share state.
pub struct CircuitBreaker<C: Clock = SystemClock> {
    config: Arc<CircuitBreakerConfig>,
    inner: Arc<Mutex<BreakerState>>,
    clock: Arc<C>,
}

impl<C: Clock> fmt::Debug for CircuitBreaker<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("config", &self.config)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl<C: Clock> Clone for CircuitBreaker<C> {
    fn clone(&self) -> Self {
        Self {
            config: Arc::clone(&self.config),
            inner: Arc::clone(&self.inner),
            clock: Arc::clone(&self.clock),
        }
    }
}

impl CircuitBreaker<SystemClock> {
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for an invalid configuration.
    pub fn new(config: CircuitBreakerConfig) -> ConfigResult<Self> {
        Self::with_clock(config, SystemClock)
    }
}

impl Default for CircuitBreaker<SystemClock> {
    fn default() -> Self {
        let clock = SystemClock;
        Self {
            inner: Arc::new(Mutex::new(BreakerState::new(clock.now()))),
            config: Arc::new(CircuitBreakerConfig::default()),
            clock: Arc::new(clock),
        }
    }
}

impl<C: Clock> CircuitBreaker<C> {
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for an invalid configuration.
    pub fn with_clock(config: CircuitBreakerConfig, clock: C) -> ConfigResult<Self> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(Mutex::new(BreakerState::new(clock.now()))),
            config: Arc::new(config),
            clock: Arc::new(clock),
        })
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Run `operation` if the circuit admits it and record the outcome.
    ///
    /// # Errors
    ///
    /// Returns [`ResilienceError::CircuitOpen`] without invoking `operation`
    /// when the circuit is open (or half-open with no trial permit left), and
    /// [`ResilienceError::OperationFailed`] when the operation fails.
    #[instrument(skip(self, operation), fields(state = %self.state()))]
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> ResilienceResult<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + Send + Sync + 'static,
    {
        let Some(admission) = self.try_admit() else {
            debug!("circuit_rejected");
            return Err(ResilienceError::CircuitOpen);
        };

        let mut guard = TrialGuard { breaker: self, admission, armed: true };
        let outcome = operation().await;
        guard.armed = false;

        match outcome {
            Ok(value) => {
                self.on_success(admission);
                Ok(value)
            }
            Err(source) => {
                self.on_failure(admission);
                Err(ResilienceError::OperationFailed { source })
            }
        }
    }

    /// Whether a call issued now would be admitted. Does not consume a permit.
    pub fn is_call_permitted(&self) -> bool {
        let inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => self.cooldown_elapsed(&inner),
            CircuitState::HalfOpen => inner.half_open_in_flight < self.config.half_open_max_calls,
        }
    }

    fn cooldown_elapsed(&self, inner: &BreakerState) -> bool {
        self.clock.now().duration_since(inner.last_transition) >= self.config.cooldown
    }

    fn try_admit(&self) -> Option<Admission> {
        let mut inner = self.inner.lock();
        let state = inner.state;
        let admission = match state {
            CircuitState::Closed => Some(Admission::Closed),
            CircuitState::Open if self.cooldown_elapsed(&inner) => {
                inner.transition(CircuitState::HalfOpen, self.clock.now());
                inner.half_open_in_flight = 1;
                info!("circuit_half_open");
                Some(Admission::Trial { generation: inner.generation })
            }
            CircuitState::Open => None,
            CircuitState::HalfOpen if inner.half_open_in_flight < self.config.half_open_max_calls => {
                inner.half_open_in_flight += 1;
                Some(Admission::Trial { generation: inner.generation })
            }
            CircuitState::HalfOpen => None,
        };
        match admission {
            Some(_) => inner.total_calls += 1,
            None => inner.total_rejections += 1,
        }
        admission
    }

    fn on_success(&self, admission: Admission) {
        let mut inner = self.inner.lock();
        inner.total_successes += 1;
        inner.consecutive_failures = 0;
        inner.consecutive_successes += 1;

        if inner.owns_trial(admission) {
            inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
            if inner.consecutive_successes >= self.config.success_threshold {
                let successes = inner.consecutive_successes;
                inner.transition(CircuitState::Closed, self.clock.now());
                info!(successes, "circuit_closed");
            }
        }
    }

    fn on_failure(&self, admission: Admission) {
        let mut inner = self.inner.lock();
        inner.total_failures += 1;
        inner.consecutive_successes = 0;
        inner.consecutive_failures += 1;

        let state = inner.state;
        let owns_trial = inner.owns_trial(admission);
        match state {
            CircuitState::Closed if inner.consecutive_failures >= self.config.failure_threshold => {
                let failures = inner.consecutive_failures;
                inner.transition(CircuitState::Open, self.clock.now());
                warn!(failures, cooldown = ?self.config.cooldown, "circuit_opened");
            }
            CircuitState::HalfOpen if owns_trial => {
                inner.transition(CircuitState::Open, self.clock.now());
                warn!("circuit_reopened");
            }
            _ => {}
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    pub fn metrics(&self) -> CircuitBreakerMetrics {
        let inner = self.inner.lock();
        CircuitBreakerMetrics {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            consecutive_successes: inner.consecutive_successes,
            total_calls: inner.total_calls,
            total_successes: inner.total_successes,
            total_failures: inner.total_failures,
            total_rejections: inner.total_rejections,
            half_open_in_flight: inner.half_open_in_flight,
            since_transition: self.clock.now().duration_since(inner.last_transition),
        }
    }

    /// Force the circuit closed and zero every counter.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        *inner = BreakerState::new(self.clock.now());
        info!("circuit_reset");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::resilience::MockClock;

    #[derive(Debug, thiserror::Error)]
    #[error("upstream failure")]
    struct Upstream;

    fn breaker(clock: &MockClock, failures: u64, successes: u64, trials: u64) -> CircuitBreaker<MockClock> {
        let config = CircuitBreakerConfig::builder()
            .failure_threshold(failures)
            .success_threshold(successes)
            .cooldown(Duration::from_secs(30))
            .half_open_max_calls(trials)
            .build()
            .unwrap();
        CircuitBreaker::with_clock(config, clock.clone()).unwrap()
    }

    async fn fail(breaker: &CircuitBreaker<MockClock>) -> ResilienceResult<(), Upstream> {
        breaker.execute(|| async { Err::<(), _>(Upstream) }).await
    }

    async fn succeed(breaker: &CircuitBreaker<MockClock>) -> ResilienceResult<(), Upstream> {
        breaker.execute(|| async { Ok::<_, Upstream>(()) }).await
    }

    /// Validates `CircuitBreakerConfig::validate` behavior for the zero
    /// threshold scenario.
    ///
    /// Assertions:
    /// - Ensures each zero threshold is rejected.
    /// - Confirms the defaults are 5 failures, 30s cooldown and 1 trial call.
    #[test]
    fn config_validation_and_defaults() {
        assert!(CircuitBreakerConfig::builder().failure_threshold(0).build().is_err());
        assert!(CircuitBreakerConfig::builder().success_threshold(0).build().is_err());
        assert!(CircuitBreakerConfig::builder().half_open_max_calls(0).build().is_err());

        let defaults = CircuitBreakerConfig::default();
        assert_eq!(defaults.failure_threshold, 5);
        assert_eq!(defaults.cooldown, Duration::from_secs(30));
        assert_eq!(defaults.half_open_max_calls, 1);
    }

    /// Validates `CircuitBreaker::execute` behavior for the threshold trip
    /// scenario.
    ///
    /// Assertions:
    /// - Confirms the circuit opens after exactly `threshold` failures.
    /// - Ensures the next call is rejected without invoking the operation.
    #[tokio::test]
    async fn opens_after_threshold_and_short_circuits() {
        let clock = MockClock::new();
        let breaker = breaker(&clock, 3, 1, 1);

        for _ in 0..2 {
            assert!(fail(&breaker).await.is_err());
            assert_eq!(breaker.state(), CircuitState::Closed);
        }
        assert!(fail(&breaker).await.is_err());
        assert_eq!(breaker.state(), CircuitState::Open);

        let invoked = AtomicU32::new(0);
        let result = breaker
            .execute(|| async {
                invoked.fetch_add(1, Ordering::SeqCst);
                Ok::<_, Upstream>(())
            })
            .await;

        assert!(matches!(result, Err(ResilienceError::CircuitOpen)));
        assert_eq!(invoked.load(Ordering::SeqCst), 0);
        assert_eq!(breaker.metrics().total_rejections, 1);
    }

    /// Validates consecutive failure counting for the interleaved success
    /// scenario.
    ///
    /// Assertions:
    /// - Ensures a success in closed state clears the consecutive failure run.
    #[tokio::test]
    async fn success_breaks_failure_run() {
        let clock = MockClock::new();
        let breaker = breaker(&clock, 3, 1, 1);

        fail(&breaker).await.ok();
        fail(&breaker).await.ok();
        succeed(&breaker).await.ok();
        fail(&breaker).await.ok();
        fail(&breaker).await.ok();

        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.metrics().consecutive_failures, 2);
    }

    /// Validates half-open recovery for the cooldown elapsed scenario.
    ///
    /// Assertions:
    /// - Confirms the circuit stays open before the cooldown.
    /// - Confirms a successful trial closes the circuit and clears counters.
    #[tokio::test]
    async fn half_open_success_closes() {
        let clock = MockClock::new();
        let breaker = breaker(&clock, 1, 1, 1);

        fail(&breaker).await.ok();
        clock.advance(Duration::from_secs(29));
        assert!(!breaker.is_call_permitted());
        assert!(matches!(succeed(&breaker).await, Err(ResilienceError::CircuitOpen)));

        clock.advance(Duration::from_secs(1));
        assert!(breaker.is_call_permitted());
        assert!(succeed(&breaker).await.is_ok());

        let metrics = breaker.metrics();
        assert_eq!(metrics.state, CircuitState::Closed);
        assert_eq!(metrics.consecutive_failures, 0);
        assert_eq!(metrics.consecutive_successes, 0);
    }

    /// Validates half-open failure handling for the reopen scenario.
    ///
    /// Assertions:
    /// - Confirms a failed trial reopens the circuit.
    /// - Ensures the cooldown restarts from the reopen instant.
    #[tokio::test]
    async fn half_open_failure_reopens_and_restarts_cooldown() {
        let clock = MockClock::new();
        let breaker = breaker(&clock, 1, 1, 1);

        fail(&breaker).await.ok();
        clock.advance(Duration::from_secs(30));
        fail(&breaker).await.ok();
        assert_eq!(breaker.state(), CircuitState::Open);

        clock.advance(Duration::from_secs(29));
        assert!(!breaker.is_call_permitted());
        clock.advance(Duration::from_secs(1));
        assert!(breaker.is_call_permitted());
    }

    /// Validates trial permits for the concurrent half-open scenario.
    ///
    /// Assertions:
    /// - Ensures only `half_open_max_calls` trials run at once.
    /// - Confirms `success_threshold` trial successes are needed to close.
    #[tokio::test]
    async fn half_open_limits_trials() {
        let clock = MockClock::new();
        let breaker = breaker(&clock, 1, 2, 1);
        fail(&breaker).await.ok();
        clock.advance(Duration::from_secs(30));

        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let trial = {
            let breaker = breaker.clone();
            tokio::spawn(async move {
                breaker
                    .execute(|| async {
                        release_rx.await.ok();
                        Ok::<_, Upstream>(())
                    })
                    .await
            })
        };
        tokio::task::yield_now().await;
        while breaker.metrics().half_open_in_flight == 0 {
            tokio::task::yield_now().await;
        }

        assert!(matches!(succeed(&breaker).await, Err(ResilienceError::CircuitOpen)));
        release_tx.send(()).ok();
        assert!(trial.await.unwrap().is_ok());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        assert!(succeed(&breaker).await.is_ok());
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    /// Validates trial permit release for the abandoned trial scenario.
    ///
    /// Assertions:
    /// - Confirms a trial cancelled by a timeout gives its permit back.
    /// - Confirms the next caller is admitted as a trial and closes the circuit.
    /// - Ensures a late drop from an earlier half-open phase leaves the new phase alone.
    #[tokio::test]
    async fn abandoned_trial_releases_permit() {
        let clock = MockClock::new();
        let breaker = breaker(&clock, 1, 1, 1);
        fail(&breaker).await.ok();
        clock.advance(Duration::from_secs(30));

        let abandoned = tokio::time::timeout(
            Duration::from_millis(10),
            breaker.execute(|| async {
                std::future::pending::<()>().await;
                Ok::<_, Upstream>(())
            }),
        )
        .await;
        assert!(abandoned.is_err());

        let metrics = breaker.metrics();
        assert_eq!(metrics.state, CircuitState::HalfOpen);
        assert_eq!(metrics.half_open_in_flight, 0);
        assert!(breaker.is_call_permitted());

        assert!(succeed(&breaker).await.is_ok());
        assert_eq!(breaker.state(), CircuitState::Closed);

        let stale = breaker.inner.lock().generation;
        fail(&breaker).await.ok();
        clock.advance(Duration::from_secs(30));
        let held = TrialGuard {
            breaker: &breaker,
            admission: Admission::Trial { generation: stale },
            armed: true,
        };
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let trial = {
            let breaker = breaker.clone();
            tokio::spawn(async move {
                breaker
                    .execute(|| async {
                        release_rx.await.ok();
                        Ok::<_, Upstream>(())
                    })
                    .await
            })
        };
        while breaker.metrics().half_open_in_flight == 0 {
            tokio::task::yield_now().await;
        }
        drop(held);
        assert_eq!(breaker.metrics().half_open_in_flight, 1);

        release_tx.send(()).ok();
        assert!(trial.await.unwrap().is_ok());
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    /// Validates `CircuitBreaker::reset` behavior for the forced close
    /// scenario.
    ///
    /// Assertions:
    /// - Confirms reset restores pass-through immediately while open.
    /// - Confirms all counters are zeroed.
    #[tokio::test]
    async fn reset_restores_pass_through() {
        let clock = MockClock::new();
        let breaker = breaker(&clock, 2, 1, 1);
        fail(&breaker).await.ok();
        fail(&breaker).await.ok();
        assert_eq!(breaker.state(), CircuitState::Open);

        breaker.reset();

        assert!(succeed(&breaker).await.is_ok());
        let metrics = breaker.metrics();
        assert_eq!(metrics.state, CircuitState::Closed);
        assert_eq!(metrics.total_failures, 0);
        assert_eq!(metrics.total_calls, 1);
    }

    #[test]
    fn state_display_matches_wire_names() {
        assert_eq!(CircuitState::Closed.to_string(), "CLOSED");
        assert_eq!(CircuitState::Open.to_string(), "OPEN");
        assert_eq!(CircuitState::HalfOpen.to_string(), "HALF_OPEN");
    }
}
