//! Priority-aware pacing limiter with retry and backoff
//!
//! Every call passes two gates before it starts:
//!
//! - fewer than `requests_per_second` calls started in the trailing second;
//! - fewer than `max_concurrent` calls are in flight.
//!
//! Waiting calls queue by priority and FIFO within a priority class. Only the
//! head of the queue may take a slot, so a high-priority call overtakes queued
//! normal/low calls but never one already running. Waiters sleep on a
//! [`Notify`] bounded by `poll_interval`, so there is no busy spinning.
//!
//! Failed attempts are classified by the caller's [`RetryPolicy`] and retried
//! with exponential backoff until `max_retries` is spent.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::error::{ConfigError, ConfigResult, ResilienceError, ResilienceResult};
use super::retry::{RetryConfig, RetryDecision, RetryPolicy};

const RATE_WINDOW: Duration = Duration::from_secs(1);
const METRICS_WINDOW: Duration = Duration::from_secs(5);
const EMA_WEIGHT: f64 = 0.1;

/// Scheduling class of a call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

/// Derived limiter health
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Degraded => write!(f, "degraded"),
            Self::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

impl HealthStatus {
    /// Healthy needs a success rate of at least 0.8, at most 20 queued calls
    /// and average latency of at most 5s. Unhealthy is a success rate below
    /// 0.5 or more than 100 queued calls.
    pub fn derive(success_rate: f64, queue_size: usize, average_latency: Duration) -> Self {
        if success_rate < 0.5 || queue_size > 100 {
            Self::Unhealthy
        } else if success_rate >= 0.8
            && queue_size <= 20
            && average_latency <= Duration::from_secs(5)
        {
            Self::Healthy
        } else {
            Self::Degraded
        }
    }
}

/// Configuration for [`RateLimiter`]
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimiterConfig {
    pub requests_per_second: u32,
    pub max_concurrent: u32,
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Backoff shape, jitter and floor between retries
    pub backoff: RetryConfig,
    /// Upper bound on one wait for a free slot
    pub poll_interval: Duration,
    pub health_check_interval: Duration,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            requests_per_second: 20,
            max_concurrent: 10,
            max_retries: 3,
            backoff: RetryConfig::builder()
                .exponential_backoff(Duration::from_secs(1), 2.0, Duration::from_secs(30))
                .proportional_jitter(0.5)
                .min_delay(Duration::from_secs(2))
                .build()
                .unwrap_or_default(),
            poll_interval: Duration::from_millis(50),
            health_check_interval: Duration::from_secs(30),
        }
    }
}

impl RateLimiterConfig {
    pub fn builder() -> RateLimiterConfigBuilder {
        RateLimiterConfigBuilder::default()
    }

    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for zero ceilings or intervals.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.requests_per_second == 0 {
            return Err(ConfigError::invalid("requests_per_second must be greater than 0"));
        }
        if self.max_concurrent == 0 {
            return Err(ConfigError::invalid("max_concurrent must be greater than 0"));
        }
        if self.poll_interval.is_zero() || self.health_check_interval.is_zero() {
            return Err(ConfigError::invalid("intervals must be greater than zero"));
        }
        self.backoff.validate()
    }
}

/// Builder for [`RateLimiterConfig`]
#[derive(Debug, Default)]
pub struct RateLimiterConfigBuilder {
    config: RateLimiterConfig,
}

impl RateLimiterConfigBuilder {
    pub const fn requests_per_second(mut self, limit: u32) -> Self {
        self.config.requests_per_second = limit;
        self
    }

    pub const fn max_concurrent(mut self, limit: u32) -> Self {
        self.config.max_concurrent = limit;
        self
    }

    pub const fn max_retries(mut self, retries: u32) -> Self {
        self.config.max_retries = retries;
        self
    }

    pub fn backoff(mut self, backoff: RetryConfig) -> Self {
        self.config.backoff = backoff;
        self
    }

    pub const fn poll_interval(mut self, interval: Duration) -> Self {
        self.config.poll_interval = interval;
        self
    }

    pub const fn health_check_interval(mut self, interval: Duration) -> Self {
        self.config.health_check_interval = interval;
        self
    }

    /// # Errors
    ///
    /// Propagates [`RateLimiterConfig::validate`] failures.
    pub fn build(self) -> ConfigResult<RateLimiterConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Counters and derived figures at one instant
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RateLimiterMetrics {
    /// `execute` calls submitted
    pub total_requests: u64,
    pub successful_requests: u64,
    /// `execute` calls that ended in an error
    pub failed_requests: u64,
    /// Attempts the policy classified as throttled
    pub rate_limited_requests: u64,
    pub retries: u64,
    pub average_latency_ms: f64,
    pub success_rate: f64,
    pub queue_size: usize,
    pub in_flight: u32,
    pub requests_last_second: usize,
    pub requests_last_5s: usize,
    pub health: HealthStatus,
}

#[derive(Debug, PartialEq, Eq)]
struct Ticket {
    priority: Priority,
    seq: u64,
}

impl Ord for Ticket {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority.cmp(&other.priority).then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Ticket {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Default)]
struct LimiterState {
    starts: VecDeque<Instant>,
    in_flight: u32,
    waiting: BinaryHeap<Ticket>,
    next_seq: u64,
    stopped: bool,
    average_latency_ms: Option<f64>,
    total_requests: u64,
    successful_requests: u64,
    failed_requests: u64,
    rate_limited_requests: u64,
    retries: u64,
}

impl LimiterState {
    fn prune(&mut self, now: Instant) {
        while self.starts.front().is_some_and(|t| now.duration_since(*t) >= METRICS_WINDOW) {
            self.starts.pop_front();
        }
    }

    fn started_within(&self, window: Duration, now: Instant) -> usize {
        self.starts.iter().rev().take_while(|t| now.duration_since(**t) < window).count()
    }

    /// Earliest instant the trailing-second window has room again.
    fn window_reopens_at(&self, limit: usize, now: Instant) -> Option<Instant> {
        let index = self.starts.len().checked_sub(limit)?;
        let boundary = *self.starts.get(index)?;
        (now.duration_since(boundary) < RATE_WINDOW).then(|| boundary + RATE_WINDOW)
    }

    fn record_latency(&mut self, sample: Duration) {
        let sample_ms = sample.as_secs_f64() * 1_000.0;
        self.average_latency_ms = Some(match self.average_latency_ms {
            Some(avg) => avg.mul_add(1.0 - EMA_WEIGHT, sample_ms * EMA_WEIGHT),
            None => sample_ms,
        });
    }

    fn success_rate(&self) -> f64 {
        let completed = self.successful_requests + self.failed_requests;
        if completed == 0 {
            1.0
        } else {
            self.successful_requests as f64 / completed as f64
        }
    }

    fn average_latency(&self) -> Duration {
        Duration::from_secs_f64(self.average_latency_ms.unwrap_or(0.0).max(0.0) / 1_000.0)
    }

    fn health(&self) -> HealthStatus {
        HealthStatus::derive(self.success_rate(), self.waiting.len(), self.average_latency())
    }
}

#[derive(Debug)]
struct Shared {
    config: RateLimiterConfig,
    state: Mutex<LimiterState>,
    notify: Notify,
}

struct Monitor {
    handle: JoinHandle<()>,
    cancel: CancellationToken,
}

/// Shared pacing limiter; clones share queue, window and counters.
#[derive(Clone)]
pub struct RateLimiter {
    shared: Arc<Shared>,
    monitor: Arc<Mutex<Option<Monitor>>>,
}

impl fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimiter")
            .field("config", &self.shared.config)
            .field("queue_size", &self.queue_size())
            .finish_non_exhaustive()
    }
}

/// Removes an unadmitted ticket if the waiting future is dropped.
struct TicketGuard<'a> {
    shared: &'a Shared,
    seq: u64,
    armed: bool,
}

impl Drop for TicketGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.shared.state.lock().waiting.retain(|t| t.seq != self.seq);
            self.shared.notify.notify_waiters();
        }
    }
}

/// Held while a call is in flight; frees the concurrency slot on drop.
struct Slot<'a> {
    shared: &'a Shared,
}

impl Drop for Slot<'_> {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state.lock();
            state.in_flight = state.in_flight.saturating_sub(1);
        }
        self.shared.notify.notify_waiters();
    }
}

impl RateLimiter {
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for an invalid configuration.
    pub fn new(config: RateLimiterConfig) -> ConfigResult<Self> {
        config.validate()?;
        Ok(Self {
            shared: Arc::new(Shared {
                config,
                state: Mutex::new(LimiterState::default()),
                notify: Notify::new(),
            }),
            monitor: Arc::new(Mutex::new(None)),
        })
    }

    pub fn config(&self) -> &RateLimiterConfig {
        &self.shared.config
    }

    /// Accept calls and spawn the periodic health monitor.
    ///
    /// Calling `start` on a running limiter is a no-op.
    pub fn start(&self) {
        self.shared.state.lock().stopped = false;
        let mut monitor = self.monitor.lock();
        if monitor.is_some() {
            return;
        }
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(health_worker(
            Arc::clone(&self.shared),
            self.shared.config.health_check_interval,
            cancel.clone(),
        ));
        *monitor = Some(Monitor { handle, cancel });
        info!(
            requests_per_second = self.shared.config.requests_per_second,
            max_concurrent = self.shared.config.max_concurrent,
            "rate_limiter_started"
        );
    }

    /// Reject queued and new calls and stop the health monitor.
    ///
    /// Calls already in flight run to completion.
    pub async fn stop(&self) {
        self.shared.state.lock().stopped = true;
        self.shared.notify.notify_waiters();

        let monitor = self.monitor.lock().take();
        if let Some(Monitor { handle, cancel }) = monitor {
            cancel.cancel();
            if tokio::time::timeout(Duration::from_secs(5), handle).await.is_err() {
                warn!("rate_limiter_monitor_shutdown_timeout");
            }
        }
        info!("rate_limiter_stopped");
    }

    pub fn is_running(&self) -> bool {
        self.monitor.lock().is_some() && !self.shared.state.lock().stopped
    }

    /// Calls currently waiting for a slot.
    pub fn queue_size(&self) -> usize {
        self.shared.state.lock().waiting.len()
    }

    pub fn health_status(&self) -> HealthStatus {
        self.shared.state.lock().health()
    }

    pub fn metrics(&self) -> RateLimiterMetrics {
        let mut state = self.shared.state.lock();
        let now = Instant::now();
        state.prune(now);
        RateLimiterMetrics {
            total_requests: state.total_requests,
            successful_requests: state.successful_requests,
            failed_requests: state.failed_requests,
            rate_limited_requests: state.rate_limited_requests,
            retries: state.retries,
            average_latency_ms: state.average_latency_ms.unwrap_or(0.0),
            success_rate: state.success_rate(),
            queue_size: state.waiting.len(),
            in_flight: state.in_flight,
            requests_last_second: state.started_within(RATE_WINDOW, now),
            requests_last_5s: state.started_within(METRICS_WINDOW, now),
            health: state.health(),
        }
    }

    /// Run `operation` once a slot is free, retrying classified failures.
    ///
    /// `operation` is invoked once per attempt; each attempt waits for its own
    /// slot, so retries are paced like fresh calls.
    ///
    /// # Errors
    ///
    /// Returns [`ResilienceError::LimiterStopped`] if the limiter is stopped
    /// before the call starts, and [`ResilienceError::OperationFailed`] with
    /// the last error once the policy stops or retries run out.
    #[instrument(skip(self, policy, operation), fields(priority = ?priority))]
    pub async fn execute<F, Fut, T, E, P>(
        &self,
        priority: Priority,
        policy: &P,
        mut operation: F,
    ) -> ResilienceResult<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + Send + Sync + 'static,
        P: RetryPolicy<E> + ?Sized,
    {
        {
            let mut state = self.shared.state.lock();
            if state.stopped {
                return Err(ResilienceError::LimiterStopped);
            }
            state.total_requests += 1;
        }

        let config = &self.shared.config;
        let mut attempt: u32 = 0;
        loop {
            let Some(slot) = self.acquire(priority).await else {
                self.shared.state.lock().failed_requests += 1;
                return Err(ResilienceError::LimiterStopped);
            };
            let started = Instant::now();
            let result = operation().await;
            let latency = started.elapsed();
            drop(slot);

            let error = match result {
                Ok(value) => {
                    let mut state = self.shared.state.lock();
                    state.record_latency(latency);
                    state.successful_requests += 1;
                    return Ok(value);
                }
                Err(error) => error,
            };

            let decision = policy.should_retry(&error, attempt);
            let exhausted = attempt >= config.max_retries;
            {
                let mut state = self.shared.state.lock();
                state.record_latency(latency);
                if decision == RetryDecision::Throttled {
                    state.rate_limited_requests += 1;
                }
                if !decision.is_retry() || exhausted {
                    state.failed_requests += 1;
                } else {
                    state.retries += 1;
                }
            }

            if !decision.is_retry() {
                debug!(error = %error, "non_retryable_failure");
                return Err(ResilienceError::OperationFailed { source: error });
            }
            if exhausted {
                warn!(attempts = attempt + 1, error = %error, "retries_exhausted");
                return Err(ResilienceError::OperationFailed { source: error });
            }

            let delay = match decision {
                RetryDecision::RetryAfter(delay) => delay.max(config.backoff.min_delay),
                _ => config.backoff.delay_for(attempt),
            };
            warn!(attempt = attempt + 1, ?delay, ?decision, error = %error, "retry_scheduled");
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    /// Wait for a slot; `None` once the limiter is stopped.
    async fn acquire(&self, priority: Priority) -> Option<Slot<'_>> {
        let shared = &*self.shared;
        let seq = {
            let mut state = shared.state.lock();
            let seq = state.next_seq;
            state.next_seq += 1;
            state.waiting.push(Ticket { priority, seq });
            seq
        };
        let mut ticket = TicketGuard { shared, seq, armed: true };

        loop {
            let notified = shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let wait = {
                let mut state = shared.state.lock();
                if state.stopped {
                    return None;
                }
                let now = Instant::now();
                state.prune(now);

                let at_head = state.waiting.peek().is_some_and(|t| t.seq == seq);
                let limit = shared.config.requests_per_second as usize;
                let reopens_at = state.window_reopens_at(limit, now);
                let has_capacity = state.in_flight < shared.config.max_concurrent;

                if at_head && reopens_at.is_none() && has_capacity {
                    state.waiting.pop();
                    state.starts.push_back(now);
                    state.in_flight += 1;
                    ticket.armed = false;
                    drop(state);
                    shared.notify.notify_waiters();
                    return Some(Slot { shared });
                }

                match reopens_at {
                    Some(at) if at_head => {
                        at.saturating_duration_since(now).min(shared.config.poll_interval)
                    }
                    _ => shared.config.poll_interval,
                }
            };

            tokio::select! {
                () = &mut notified => {}
                () = tokio::time::sleep(wait) => {}
            }
        }
    }
}

async fn health_worker(shared: Arc<Shared>, interval: Duration, cancel: CancellationToken) {
    let mut current = shared.state.lock().health();
    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                debug!("rate_limiter_monitor_exiting");
                break;
            }
            () = tokio::time::sleep(interval) => {
                let (health, queue_size, success_rate) = {
                    let state = shared.state.lock();
                    (state.health(), state.waiting.len(), state.success_rate())
                };
                if health != current {
                    match health {
                        HealthStatus::Unhealthy => {
                            warn!(previous = %current, %health, queue_size, success_rate, "rate_limiter_health_changed");
                        }
                        _ => info!(previous = %current, %health, queue_size, success_rate, "rate_limiter_health_changed"),
                    }
                    current = health;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering as AtomicOrdering};

    use thiserror::Error;

    use super::*;
    use crate::resilience::retry::policies::NeverRetry;

    #[derive(Debug, Error, PartialEq, Eq)]
    enum Upstream {
        #[error("throttled")]
        Throttled,
        #[error("reset")]
        Reset,
        #[error("bad request")]
        BadRequest,
    }

    struct Classify;

    impl RetryPolicy<Upstream> for Classify {
        fn should_retry(&self, error: &Upstream, _attempt: u32) -> RetryDecision {
            match error {
                Upstream::Throttled => RetryDecision::Throttled,
                Upstream::Reset => RetryDecision::Retry,
                Upstream::BadRequest => RetryDecision::Stop,
            }
        }
    }

    fn limiter(rps: u32, concurrent: u32, retries: u32) -> RateLimiter {
        let backoff = RetryConfig::builder()
            .fixed_backoff(Duration::from_millis(1))
            .no_jitter()
            .build()
            .unwrap();
        let config = RateLimiterConfig::builder()
            .requests_per_second(rps)
            .max_concurrent(concurrent)
            .max_retries(retries)
            .backoff(backoff)
            .poll_interval(Duration::from_millis(5))
            .build()
            .unwrap();
        RateLimiter::new(config).unwrap()
    }

    async fn wait_for_queue(limiter: &RateLimiter, expected: usize) {
        let reached = crate::testing::poll_until(
            Duration::from_millis(400),
            Duration::from_millis(2),
            || async { limiter.queue_size() == expected },
        )
        .await;
        assert!(reached, "queue never reached {expected}");
    }

    /// Validates `RateLimiter::execute` behavior for the per-second ceiling
    /// scenario.
    ///
    /// Assertions:
    /// - Confirms at most `requests_per_second` calls start within the first
    ///   second.
    /// - Confirms the overflow calls start after the window rolls over.
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn per_second_ceiling_spreads_overflow() {
        let limiter = limiter(3, 10, 0);
        let origin = Instant::now();

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let limiter = limiter.clone();
            tasks.push(tokio::spawn(async move {
                limiter
                    .execute(Priority::Normal, &NeverRetry, || async {
                        Ok::<_, Upstream>(Instant::now())
                    })
                    .await
                    .unwrap()
            }));
        }
        let mut starts = Vec::new();
        for task in tasks {
            starts.push(task.await.unwrap().duration_since(origin));
        }
        starts.sort();

        assert!(starts[2] < Duration::from_millis(500));
        assert!(starts[3] >= Duration::from_millis(950));
        assert!(starts[6] >= Duration::from_millis(1_950));
        assert_eq!(limiter.metrics().total_requests, 8);
        assert_eq!(limiter.metrics().successful_requests, 8);
    }

    /// Validates `RateLimiter::execute` behavior for the concurrency ceiling
    /// scenario.
    ///
    /// Assertions:
    /// - Ensures no more than `max_concurrent` calls overlap.
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn in_flight_never_exceeds_ceiling() {
        let limiter = limiter(100, 2, 0);
        let active = Arc::new(AtomicU32::new(0));
        let peak = Arc::new(AtomicU32::new(0));

        let mut tasks = Vec::new();
        for _ in 0..6 {
            let limiter = limiter.clone();
            let active = Arc::clone(&active);
            let peak = Arc::clone(&peak);
            tasks.push(tokio::spawn(async move {
                limiter
                    .execute(Priority::Normal, &NeverRetry, || {
                        let active = Arc::clone(&active);
                        let peak = Arc::clone(&peak);
                        async move {
                            let now = active.fetch_add(1, AtomicOrdering::SeqCst) + 1;
                            peak.fetch_max(now, AtomicOrdering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(30)).await;
                            active.fetch_sub(1, AtomicOrdering::SeqCst);
                            Ok::<_, Upstream>(())
                        }
                    })
                    .await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert!(peak.load(AtomicOrdering::SeqCst) <= 2);
        assert_eq!(limiter.metrics().in_flight, 0);
    }

    /// Validates `RateLimiter::execute` behavior for the priority ordering
    /// scenario.
    ///
    /// Assertions:
    /// - Confirms queued calls start in high, normal, low order once the
    ///   running call finishes.
    #[tokio::test]
    async fn queued_calls_start_by_priority() {
        let limiter = limiter(100, 1, 0);
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let order = Arc::new(Mutex::new(Vec::new()));

        let blocker = {
            let limiter = limiter.clone();
            tokio::spawn(async move {
                let mut release = Some(release_rx);
                limiter
                    .execute(Priority::Normal, &NeverRetry, || {
                        let release = release.take();
                        async move {
                            if let Some(release) = release {
                                let _ = release.await;
                            }
                            Ok::<_, Upstream>(())
                        }
                    })
                    .await
            })
        };
        wait_for_queue(&limiter, 0).await;
        while limiter.metrics().in_flight == 0 {
            tokio::task::yield_now().await;
        }

        let mut waiters = Vec::new();
        for (expected, priority) in [Priority::Low, Priority::Normal, Priority::High].into_iter().enumerate() {
            let limiter_ref = limiter.clone();
            let order = Arc::clone(&order);
            waiters.push(tokio::spawn(async move {
                limiter_ref
                    .execute(priority, &NeverRetry, || {
                        let order = Arc::clone(&order);
                        async move {
                            order.lock().push(priority);
                            Ok::<_, Upstream>(())
                        }
                    })
                    .await
            }));
            wait_for_queue(&limiter, expected + 1).await;
        }

        release_tx.send(()).unwrap();
        blocker.await.unwrap().unwrap();
        for waiter in waiters {
            waiter.await.unwrap().unwrap();
        }

        assert_eq!(*order.lock(), vec![Priority::High, Priority::Normal, Priority::Low]);
    }

    /// Validates `RateLimiter::execute` behavior for the throttled retry
    /// scenario.
    ///
    /// Assertions:
    /// - Confirms throttled attempts are retried and counted as rate limited.
    /// - Confirms one logical request is recorded.
    #[tokio::test]
    async fn throttled_attempts_retry_then_succeed() {
        let limiter = limiter(100, 4, 3);
        let calls = AtomicU32::new(0);

        let value = limiter
            .execute(Priority::Normal, &Classify, || async {
                if calls.fetch_add(1, AtomicOrdering::SeqCst) < 2 {
                    Err(Upstream::Throttled)
                } else {
                    Ok("rows")
                }
            })
            .await
            .unwrap();

        assert_eq!(value, "rows");
        let metrics = limiter.metrics();
        assert_eq!(metrics.total_requests, 1);
        assert_eq!(metrics.successful_requests, 1);
        assert_eq!(metrics.rate_limited_requests, 2);
        assert_eq!(metrics.retries, 2);
        assert_eq!(metrics.failed_requests, 0);
    }

    /// Validates `RateLimiter::execute` behavior for the permanent failure
    /// scenario.
    ///
    /// Assertions:
    /// - Confirms permanent failures are not retried.
    /// - Confirms exhausted retries surface the last error.
    #[tokio::test]
    async fn permanent_and_exhausted_failures_surface() {
        let limiter = limiter(100, 4, 2);

        let calls = AtomicU32::new(0);
        let err = limiter
            .execute(Priority::High, &Classify, || async {
                calls.fetch_add(1, AtomicOrdering::SeqCst);
                Err::<(), _>(Upstream::BadRequest)
            })
            .await
            .unwrap_err();
        assert_eq!(err.into_source(), Some(Upstream::BadRequest));
        assert_eq!(calls.load(AtomicOrdering::SeqCst), 1);

        let calls = AtomicU32::new(0);
        let err = limiter
            .execute(Priority::High, &Classify, || async {
                calls.fetch_add(1, AtomicOrdering::SeqCst);
                Err::<(), _>(Upstream::Reset)
            })
            .await
            .unwrap_err();
        assert_eq!(err.into_source(), Some(Upstream::Reset));
        assert_eq!(calls.load(AtomicOrdering::SeqCst), 3);
        assert_eq!(limiter.metrics().failed_requests, 2);
    }

    /// Validates `RateLimiter::stop` behavior for the queued caller scenario.
    ///
    /// Assertions:
    /// - Confirms queued callers are released with `LimiterStopped`.
    /// - Confirms new calls are rejected until `start`.
    #[tokio::test]
    async fn stop_rejects_queued_and_new_calls() {
        let limiter = limiter(100, 1, 0);
        limiter.start();
        assert!(limiter.is_running());

        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let blocker = {
            let limiter = limiter.clone();
            tokio::spawn(async move {
                let mut release = Some(release_rx);
                limiter
                    .execute(Priority::Normal, &NeverRetry, || {
                        let release = release.take();
                        async move {
                            if let Some(release) = release {
                                let _ = release.await;
                            }
                            Ok::<_, Upstream>(())
                        }
                    })
                    .await
            })
        };
        while limiter.metrics().in_flight == 0 {
            tokio::task::yield_now().await;
        }

        let queued = {
            let limiter = limiter.clone();
            tokio::spawn(async move {
                limiter
                    .execute(Priority::Normal, &NeverRetry, || async { Ok::<_, Upstream>(()) })
                    .await
            })
        };
        wait_for_queue(&limiter, 1).await;

        limiter.stop().await;
        assert!(matches!(queued.await.unwrap(), Err(ResilienceError::LimiterStopped)));
        assert!(!limiter.is_running());

        let rejected = limiter
            .execute(Priority::High, &NeverRetry, || async { Ok::<_, Upstream>(()) })
            .await;
        assert!(matches!(rejected, Err(ResilienceError::LimiterStopped)));

        release_tx.send(()).unwrap();
        blocker.await.unwrap().unwrap();

        limiter.start();
        limiter
            .execute(Priority::Normal, &NeverRetry, || async { Ok::<_, Upstream>(()) })
            .await
            .unwrap();
        limiter.stop().await;
    }

    #[test]
    fn health_thresholds() {
        let fast = Duration::from_millis(200);
        assert_eq!(HealthStatus::derive(1.0, 0, fast), HealthStatus::Healthy);
        assert_eq!(HealthStatus::derive(0.8, 20, Duration::from_secs(5)), HealthStatus::Healthy);
        assert_eq!(HealthStatus::derive(0.7, 0, fast), HealthStatus::Degraded);
        assert_eq!(HealthStatus::derive(0.9, 21, fast), HealthStatus::Degraded);
        assert_eq!(HealthStatus::derive(0.9, 0, Duration::from_secs(6)), HealthStatus::Degraded);
        assert_eq!(HealthStatus::derive(0.49, 0, fast), HealthStatus::Unhealthy);
        assert_eq!(HealthStatus::derive(1.0, 101, fast), HealthStatus::Unhealthy);
    }

    #[test]
    fn latency_is_exponentially_weighted() {
        let mut state = LimiterState::default();
        state.record_latency(Duration::from_millis(100));
        assert!((state.average_latency_ms.unwrap() - 100.0).abs() < f64::EPSILON);
        state.record_latency(Duration::from_millis(200));
        assert!((state.average_latency_ms.unwrap() - 110.0).abs() < 1e-9);
    }

    #[test]
    fn config_rejects_zero_ceilings() {
        assert!(RateLimiterConfig::builder().requests_per_second(0).build().is_err());
        assert!(RateLimiterConfig::builder().max_concurrent(0).build().is_err());
        assert!(RateLimiterConfig::builder().poll_interval(Duration::ZERO).build().is_err());
    }

    #[test]
    fn tickets_order_by_priority_then_arrival() {
        let mut heap = BinaryHeap::new();
        heap.push(Ticket { priority: Priority::Normal, seq: 0 });
        heap.push(Ticket { priority: Priority::High, seq: 2 });
        heap.push(Ticket { priority: Priority::Normal, seq: 1 });
        heap.push(Ticket { priority: Priority::High, seq: 3 });
        let order: Vec<u64> = std::iter::from_fn(|| heap.pop().map(|t| t.seq)).collect();
        assert_eq!(order, vec![2, 3, 0, 1]);
    }
}
