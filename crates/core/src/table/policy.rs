//! Retry classification for table API calls

use ticketline_common::resilience::{RetryDecision, RetryPolicy};
use ticketline_domain::TicketlineError;

/// Throttling retries with backoff, transient failures retry, everything
/// else (4xx, auth, open breaker) stops.
#[derive(Debug, Clone, Copy, Default)]
pub struct TableRetryPolicy;

impl RetryPolicy<TicketlineError> for TableRetryPolicy {
    fn should_retry(&self, error: &TicketlineError, _attempt: u32) -> RetryDecision {
        if error.is_rate_limited() {
            RetryDecision::Throttled
        } else if error.is_retryable() {
            RetryDecision::Retry
        } else {
            RetryDecision::Stop
        }
    }
}
