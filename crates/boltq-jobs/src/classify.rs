//! Error classification and retry policy.
//!
//! Handler failures are sorted into four categories, each with its own
//! retry budget and backoff curve:
//!
//! | Category  | Max attempts | Backoff |
//! |-----------|--------------|---------|
//! | Transient | 5            | exponential `2^n` s, capped at 5 min |
//! | System    | 10           | linear `5*n` s, capped at 2 min |
//! | Data      | 0            | immediate dead-letter |
//! | Unknown   | configurable (default 3) | exponential `2^n` s, capped at 5 min |
//!
//! Classification honours an explicit category carried on the error before
//! falling back to substring matching on the message. Handlers the operator
//! owns should attach the category; the patterns exist for opaque errors.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Exponential backoff ceiling (transient and unknown errors).
const EXPONENTIAL_BACKOFF_CAP: Duration = Duration::from_secs(300);

/// Linear backoff ceiling (system errors).
const LINEAR_BACKOFF_CAP: Duration = Duration::from_secs(120);

/// Category assigned to a handler failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorCategory {
    /// Temporary conditions: network timeouts, "temporary" markers.
    Transient,
    /// The job data itself is bad; retrying cannot help.
    Data,
    /// Infrastructure trouble: connection refused/reset, broker unreachable.
    System,
    /// Anything that could not be classified.
    Unknown,
}

impl ErrorCategory {
    /// Retry budget for this category. `None` defers to the configured
    /// default (unknown errors only).
    pub fn max_attempts(&self) -> Option<u32> {
        match self {
            Self::Transient => Some(5),
            Self::System => Some(10),
            Self::Data => Some(0),
            Self::Unknown => None,
        }
    }

    /// Backoff before attempt number `attempt` (1-based: the delay scheduled
    /// after the `attempt`-th failure).
    pub fn backoff(&self, attempt: u32) -> Duration {
        match self {
            Self::Transient | Self::Unknown => {
                let exp = attempt.min(31);
                Duration::from_secs(1u64 << exp).min(EXPONENTIAL_BACKOFF_CAP)
            }
            Self::System => Duration::from_secs(5 * u64::from(attempt)).min(LINEAR_BACKOFF_CAP),
            Self::Data => Duration::ZERO,
        }
    }

    /// Uppercase label used in logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transient => "TRANSIENT",
            Self::Data => "DATA",
            Self::System => "SYSTEM",
            Self::Unknown => "UNKNOWN",
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure reported by a handler.
///
/// Handlers that know why they failed should attach the category with
/// [`HandlerError::transient`], [`HandlerError::data`], or
/// [`HandlerError::system`]; plain strings are classified by pattern.
#[derive(Debug, Clone)]
pub struct HandlerError {
    /// Human-readable description, recorded on the job envelope.
    pub message: String,
    /// Explicit category hint; takes precedence over pattern matching.
    pub category: Option<ErrorCategory>,
}

impl HandlerError {
    /// An error with no category hint.
    pub fn new<S: Into<String>>(message: S) -> Self {
        Self {
            message: message.into(),
            category: None,
        }
    }

    /// A temporary failure worth retrying soon.
    pub fn transient<S: Into<String>>(message: S) -> Self {
        Self {
            message: message.into(),
            category: Some(ErrorCategory::Transient),
        }
    }

    /// A failure caused by the job data; goes straight to the dead-letter
    /// list.
    pub fn data<S: Into<String>>(message: S) -> Self {
        Self {
            message: message.into(),
            category: Some(ErrorCategory::Data),
        }
    }

    /// An infrastructure failure.
    pub fn system<S: Into<String>>(message: S) -> Self {
        Self {
            message: message.into(),
            category: Some(ErrorCategory::System),
        }
    }
}

impl std::fmt::Display for HandlerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl std::error::Error for HandlerError {}

/// What the worker should do with a failed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Re-enqueue after the backoff delay.
    Retry {
        /// Delay before the next attempt becomes dequeueable.
        delay: Duration,
    },
    /// Budget exhausted (or data error): move to the dead-letter list.
    DeadLetter,
}

/// Classify a handler failure.
pub fn classify(error: &HandlerError) -> ErrorCategory {
    if let Some(category) = error.category {
        return category;
    }
    classify_message(&error.message)
}

/// Pattern-based classification of an error message.
///
/// Deliberately conservative; system patterns are checked first so that
/// connection-level failures are not swallowed by a broader marker.
/// Timeouts of any kind, network ones included, are transient.
fn classify_message(message: &str) -> ErrorCategory {
    let lower = message.to_lowercase();

    const SYSTEM_PATTERNS: [&str; 3] = [
        "connection refused",
        "connection reset",
        "broker unreachable",
    ];
    if SYSTEM_PATTERNS.iter().any(|p| lower.contains(p)) {
        return ErrorCategory::System;
    }

    const TRANSIENT_PATTERNS: [&str; 3] = ["timeout", "timed out", "temporar"];
    if TRANSIENT_PATTERNS.iter().any(|p| lower.contains(p)) {
        return ErrorCategory::Transient;
    }

    const DATA_PATTERNS: [&str; 4] = ["validation failed", "invalid", "not found", "bad request"];
    if DATA_PATTERNS.iter().any(|p| lower.contains(p)) {
        return ErrorCategory::Data;
    }

    ErrorCategory::Unknown
}

/// Decide retry or dead-letter for a job that has already failed `attempts`
/// times and just failed again.
///
/// `default_max_attempts` is the budget for unclassifiable errors.
pub fn decide(
    attempts: u32,
    error: &HandlerError,
    default_max_attempts: u32,
) -> (ErrorCategory, RetryDecision) {
    let category = classify(error);
    let budget = category.max_attempts().unwrap_or(default_max_attempts);

    let next_attempt = attempts + 1;
    if next_attempt >= budget {
        return (category, RetryDecision::DeadLetter);
    }
    (
        category,
        RetryDecision::Retry {
            delay: category.backoff(next_attempt),
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_hint_wins_over_patterns() {
        // The message alone would classify as transient.
        let err = HandlerError::data("upstream timeout while validating");
        assert_eq!(classify(&err), ErrorCategory::Data);
    }

    #[test]
    fn timeout_messages_are_transient() {
        assert_eq!(
            classify(&HandlerError::new("connection timeout")),
            ErrorCategory::Transient
        );
        assert_eq!(
            classify(&HandlerError::new("operation timed out")),
            ErrorCategory::Transient
        );
        assert_eq!(
            classify(&HandlerError::new("network timeout talking to redis")),
            ErrorCategory::Transient
        );
        assert_eq!(
            classify(&HandlerError::new("temporarily unavailable")),
            ErrorCategory::Transient
        );
    }

    #[test]
    fn connection_errors_are_system() {
        assert_eq!(
            classify(&HandlerError::new("connection refused")),
            ErrorCategory::System
        );
        assert_eq!(
            classify(&HandlerError::new("connection reset by peer")),
            ErrorCategory::System
        );
        assert_eq!(
            classify(&HandlerError::new("broker unreachable")),
            ErrorCategory::System
        );
    }

    #[test]
    fn data_errors_match_validation_patterns() {
        assert_eq!(
            classify(&HandlerError::new("validation failed: missing recipient")),
            ErrorCategory::Data
        );
        assert_eq!(
            classify(&HandlerError::new("user not found")),
            ErrorCategory::Data
        );
        assert_eq!(
            classify(&HandlerError::new("invalid parameter: size")),
            ErrorCategory::Data
        );
    }

    #[test]
    fn unmatched_messages_are_unknown() {
        assert_eq!(
            classify(&HandlerError::new("something odd happened")),
            ErrorCategory::Unknown
        );
    }

    #[test]
    fn exponential_backoff_doubles_and_caps() {
        let cat = ErrorCategory::Transient;
        assert_eq!(cat.backoff(1), Duration::from_secs(2));
        assert_eq!(cat.backoff(2), Duration::from_secs(4));
        assert_eq!(cat.backoff(3), Duration::from_secs(8));
        assert_eq!(cat.backoff(30), Duration::from_secs(300));
    }

    #[test]
    fn linear_backoff_grows_and_caps() {
        let cat = ErrorCategory::System;
        assert_eq!(cat.backoff(1), Duration::from_secs(5));
        assert_eq!(cat.backoff(4), Duration::from_secs(20));
        assert_eq!(cat.backoff(100), Duration::from_secs(120));
    }

    #[test]
    fn data_errors_dead_letter_immediately() {
        let err = HandlerError::new("validation failed: missing recipient");
        let (category, decision) = decide(0, &err, 3);
        assert_eq!(category, ErrorCategory::Data);
        assert_eq!(decision, RetryDecision::DeadLetter);
    }

    #[test]
    fn transient_errors_retry_until_budget() {
        let err = HandlerError::new("connection timeout");

        let (_, first) = decide(0, &err, 3);
        assert_eq!(
            first,
            RetryDecision::Retry {
                delay: Duration::from_secs(2)
            }
        );

        let (_, second) = decide(1, &err, 3);
        assert_eq!(
            second,
            RetryDecision::Retry {
                delay: Duration::from_secs(4)
            }
        );

        // Fifth failure exhausts the transient budget of 5.
        let (_, fifth) = decide(4, &err, 3);
        assert_eq!(fifth, RetryDecision::DeadLetter);
    }

    #[test]
    fn unknown_errors_use_configured_default() {
        let err = HandlerError::new("mystery");
        let (_, decision) = decide(2, &err, 3);
        assert_eq!(decision, RetryDecision::DeadLetter);

        let (_, decision) = decide(2, &err, 10);
        assert!(matches!(decision, RetryDecision::Retry { .. }));
    }
}
