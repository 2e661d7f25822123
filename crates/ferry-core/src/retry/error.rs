//! Error returned by the retry executor

use std::error::Error;
use std::fmt;
use std::time::Duration;

use crate::error::Error as FerryError;

/// Errors that can occur during retry execution
///
/// Generic over `E`, the error type of the operation being retried.
#[derive(Debug)]
pub enum RetryError<E> {
    /// All attempts failed with retryable errors
    Exhausted {
        /// Number of attempts made before giving up
        attempts: u32,
        /// The error from the final attempt
        source: E,
        /// Total duration spent across all attempts
        total_duration: Duration,
    },

    /// The policy allowed no attempts at all
    NoAttempts,

    /// The predicate classified the error as not retryable
    NonRetryable(E),
}

impl<E: fmt::Display> fmt::Display for RetryError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryError::Exhausted {
                attempts,
                source,
                total_duration,
            } => write!(
                f,
                "retry exhausted after {} attempts over {:.2}s: {}",
                attempts,
                total_duration.as_secs_f64(),
                source
            ),
            RetryError::NoAttempts => write!(f, "retry policy allows no attempts"),
            RetryError::NonRetryable(source) => write!(f, "non-retryable error: {}", source),
        }
    }
}

impl<E: Error + 'static> Error for RetryError<E> {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            RetryError::Exhausted { source, .. } => Some(source),
            RetryError::NonRetryable(source) => Some(source),
            RetryError::NoAttempts => None,
        }
    }
}

impl<E> RetryError<E> {
    /// Number of attempts made
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::Exhausted { attempts, .. } => *attempts,
            RetryError::NoAttempts => 0,
            RetryError::NonRetryable(_) => 1,
        }
    }

    /// Check if all retries were exhausted
    pub fn is_exhausted(&self) -> bool {
        matches!(self, RetryError::Exhausted { .. })
    }

    /// Check if the error was not retryable
    pub fn is_non_retryable(&self) -> bool {
        matches!(self, RetryError::NonRetryable(_))
    }

    /// Get the underlying error, consuming this error
    pub fn into_source(self) -> Option<E> {
        match self {
            RetryError::Exhausted { source, .. } => Some(source),
            RetryError::NonRetryable(source) => Some(source),
            RetryError::NoAttempts => None,
        }
    }
}

impl RetryError<FerryError> {
    /// Collapse into the crate error, naming the operation that was retried.
    ///
    /// Non-retryable errors pass through unchanged so their class survives;
    /// an exhausted transient error becomes `RetriesExhausted`.
    pub fn into_error(self, operation: &str) -> FerryError {
        match self {
            RetryError::Exhausted {
                attempts, source, ..
            } => FerryError::RetriesExhausted {
                operation: operation.to_string(),
                attempts,
                message: source.to_string(),
            },
            RetryError::NoAttempts => {
                FerryError::invalid_config(format!("retry policy for {} allows no attempts", operation))
            }
            RetryError::NonRetryable(source) => source,
        }
    }
}
