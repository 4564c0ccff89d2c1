//! Async test helpers shared by the workspace test suites.

use std::future::Future;
use std::time::Duration;

/// Assert that an async condition becomes true within `$timeout`.
///
/// ```ignore
/// # async fn demo(limiter: ticketline_common::resilience::RateLimiter) {
/// use std::time::Duration;
///
/// ticketline_common::assert_eventually_async!(Duration::from_secs(1), async {
///     limiter.queue_size() == 0
/// });
/// # }
/// ```
#[macro_export]
macro_rules! assert_eventually_async {
    ($timeout:expr, $fut:expr) => {{
        let timeout_duration = $timeout;
        let result = tokio::time::timeout(timeout_duration, async {
            loop {
                if $fut.await {
                    break;
                }
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
        })
        .await;

        assert!(result.is_ok(), "Condition did not become true within {:?}", timeout_duration);
    }};
}

/// Poll `condition` every `interval` until it holds or `timeout` elapses.
pub async fn poll_until<F, Fut>(timeout: Duration, interval: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition().await {
            return true;
        }
        tokio::time::sleep(interval).await;
    }
    false
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    use super::*;

    /// Validates `poll_until` behavior for the late flag scenario.
    ///
    /// Assertions:
    /// - Confirms the poll observes a flag flipped by another task.
    /// - Confirms a condition that never holds times out.
    #[tokio::test(flavor = "multi_thread")]
    async fn poll_until_observes_flag() {
        let flag = Arc::new(AtomicBool::new(false));
        let setter = Arc::clone(&flag);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            setter.store(true, Ordering::SeqCst);
        });

        let seen = poll_until(Duration::from_secs(1), Duration::from_millis(5), || async {
            flag.load(Ordering::SeqCst)
        })
        .await;
        assert!(seen);

        let never = poll_until(Duration::from_millis(20), Duration::from_millis(5), || async {
            false
        })
        .await;
        assert!(!never);
    }

    #[tokio::test]
    async fn eventually_macro_passes() {
        let flag = AtomicBool::new(true);
        crate::assert_eventually_async!(Duration::from_millis(50), async {
            flag.load(Ordering::SeqCst)
        });
    }
}
