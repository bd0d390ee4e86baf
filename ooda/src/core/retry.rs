//! Retry policy math and failure classification.
//!
//! The sleeping loop lives in `io::retry`; this module only decides how long
//! to wait and whether a failure is worth waiting for.

use std::time::Duration;

/// Exponential backoff parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Fraction of the delay randomly added or removed, in `0.0..=1.0`.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            jitter: 0.5,
        }
    }
}

impl RetryPolicy {
    /// Policy that never sleeps; used by tests and dry runs.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: 0.0,
        }
    }
}

/// Delay before retrying after failed `attempt` (1-indexed).
///
/// `unit` is a uniform sample in `[0, 1)`; it scales the capped delay by a
/// factor in `[1 - jitter, 1 + jitter)`.
pub fn backoff_delay(policy: &RetryPolicy, attempt: u32, unit: f64) -> Duration {
    let exponent = attempt.saturating_sub(1).min(31);
    let multiplier = 2u32.saturating_pow(exponent);
    let delay = policy
        .base_delay
        .saturating_mul(multiplier)
        .min(policy.max_delay);
    let jitter = policy.jitter.clamp(0.0, 1.0);
    let factor = 1.0 + (unit.clamp(0.0, 1.0) * 2.0 - 1.0) * jitter;
    delay.mul_f64(factor.max(0.0))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Worth retrying: timeouts, rate limits, 5xx, dropped connections.
    Transient,
    /// Never retried: bad credentials, forbidden, permission denied.
    Fatal,
}

const FATAL_MARKERS: &[&str] = &[
    "401",
    "403",
    "unauthorized",
    "forbidden",
    "permission denied",
    "invalid api key",
    "authentication failed",
];

const TRANSIENT_MARKERS: &[&str] = &[
    "429", "500", "502", "503", "504", "timed out", "timeout", "rate limit",
    "connection reset", "connection refused", "temporarily unavailable",
];

/// Classify a failure from its message text.
///
/// Unrecognized failures count as transient.
pub fn classify_failure(message: &str) -> ErrorClass {
    let lower = message.to_lowercase();
    if FATAL_MARKERS.iter().any(|marker| lower.contains(marker)) {
        return ErrorClass::Fatal;
    }
    if TRANSIENT_MARKERS.iter().any(|marker| lower.contains(marker)) {
        return ErrorClass::Transient;
    }
    ErrorClass::Transient
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            jitter: 0.0,
            ..RetryPolicy::default()
        };
        assert_eq!(backoff_delay(&policy, 1, 0.3), Duration::from_secs(1));
        assert_eq!(backoff_delay(&policy, 2, 0.3), Duration::from_secs(2));
        assert_eq!(backoff_delay(&policy, 3, 0.3), Duration::from_secs(4));
        assert_eq!(backoff_delay(&policy, 10, 0.3), Duration::from_secs(60));
        assert_eq!(backoff_delay(&policy, u32::MAX, 0.3), Duration::from_secs(60));
    }

    #[test]
    fn jitter_stays_within_band() {
        let policy = RetryPolicy::default();
        let low = backoff_delay(&policy, 2, 0.0);
        let high = backoff_delay(&policy, 2, 0.999);
        assert_eq!(low, Duration::from_secs(1));
        assert!(high < Duration::from_secs(3));
        assert!(high > Duration::from_millis(2900));
    }

    #[test]
    fn classify_recognizes_fatal_and_transient_markers() {
        assert_eq!(classify_failure("HTTP 401 Unauthorized"), ErrorClass::Fatal);
        assert_eq!(classify_failure("Permission denied (os error 13)"), ErrorClass::Fatal);
        assert_eq!(classify_failure("status 503 from upstream"), ErrorClass::Transient);
        assert_eq!(classify_failure("command timed out after 30s"), ErrorClass::Transient);
        assert_eq!(classify_failure("something odd happened"), ErrorClass::Transient);
    }
}
