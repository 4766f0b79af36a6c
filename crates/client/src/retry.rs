//! Request-level retry policy.
//!
//! This policy is internal to the client and nested inside the job-level
//! retry policy: a job attempt that exhausts these retries surfaces one
//! classified error upward.

use std::time::Duration;

/// What to do with a response status.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Accept the response.
    Ok,
    /// Transient (5xx): retry with backoff.
    Retry,
    /// 401: invalidate the token and retry exactly once with a fresh one.
    RefreshToken,
    /// Permanent rejection (other 4xx): fail immediately.
    Fail,
}

/// Classify an HTTP status code.
pub fn classify_status(status: u16) -> RetryDecision {
    match status {
        200..=299 => RetryDecision::Ok,
        401 => RetryDecision::RefreshToken,
        400..=499 => RetryDecision::Fail,
        _ => RetryDecision::Retry,
    }
}

/// Retry budget for transient failures.
#[derive(Debug, Clone)]
pub struct HttpRetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Backoff before attempt n+1 doubles from this base.
    pub base_delay: Duration,
}

impl Default for HttpRetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl HttpRetryPolicy {
    /// Delay after the given (1-based) failed attempt: 1s, 2s, 4s, ...
    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.base_delay * 2u32.saturating_pow(attempt.saturating_sub(1))
    }

    pub fn attempts_left(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        assert_eq!(classify_status(200), RetryDecision::Ok);
        assert_eq!(classify_status(204), RetryDecision::Ok);
        assert_eq!(classify_status(401), RetryDecision::RefreshToken);
        assert_eq!(classify_status(404), RetryDecision::Fail);
        assert_eq!(classify_status(413), RetryDecision::Fail);
        assert_eq!(classify_status(500), RetryDecision::Retry);
        assert_eq!(classify_status(503), RetryDecision::Retry);
    }

    #[test]
    fn backoff_doubles_from_one_second() {
        let policy = HttpRetryPolicy::default();
        assert_eq!(policy.delay_after(1), Duration::from_secs(1));
        assert_eq!(policy.delay_after(2), Duration::from_secs(2));
        assert_eq!(policy.delay_after(3), Duration::from_secs(4));
    }

    #[test]
    fn three_attempts_total() {
        let policy = HttpRetryPolicy::default();
        assert!(policy.attempts_left(1));
        assert!(policy.attempts_left(2));
        assert!(!policy.attempts_left(3));
    }
}
