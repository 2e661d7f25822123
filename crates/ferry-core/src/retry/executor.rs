//! Retry execution engine

use std::fmt;
use std::future::Future;
use std::time::Instant;

use crate::error::Result as FerryResult;
use crate::types::RetryPolicy;

use super::error::RetryError;
use super::observer::{RetryObserver, TracingObserver};
use super::strategies::{calculate_delay, RetryPredicate, TransientOnly};

/// Run a remote store operation under a policy.
///
/// Only transient errors are retried; every attempt is logged through a
/// [`TracingObserver`] named after `operation`.
pub async fn retry_remote<F, Fut, T>(policy: &RetryPolicy, operation: &str, op: F) -> FerryResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = FerryResult<T>>,
{
    RetryExecutor::new(policy.clone(), operation)
        .execute(op)
        .await
        .map_err(|e| e.into_error(operation))
}

/// A retry executor with configurable policy, predicate and observer
///
/// # Example
///
/// ```rust
/// use ferry_core::retry::RetryExecutor;
/// use ferry_core::types::RetryPolicy;
///
/// let executor = RetryExecutor::new(RetryPolicy::default(), "download").with_jitter(false);
/// ```
pub struct RetryExecutor<P = TransientOnly, O = TracingObserver> {
    policy: RetryPolicy,
    predicate: P,
    observer: O,
    jitter: bool,
}

impl RetryExecutor {
    /// Retry transient errors of `operation`, logging through tracing, with jitter enabled
    pub fn new(policy: RetryPolicy, operation: impl Into<String>) -> Self {
        Self {
            policy,
            predicate: TransientOnly,
            observer: TracingObserver::new(operation),
            jitter: true,
        }
    }
}

impl<P, O> RetryExecutor<P, O> {
    /// Set the observer
    pub fn with_observer<O2>(self, observer: O2) -> RetryExecutor<P, O2> {
        RetryExecutor {
            policy: self.policy,
            predicate: self.predicate,
            observer,
            jitter: self.jitter,
        }
    }

    /// Enable or disable jitter
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }
}

impl<P, O> RetryExecutor<P, O>
where
    O: RetryObserver,
{
    /// Execute an operation with retry logic
    pub async fn execute<F, Fut, T, E>(&self, mut op: F) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
        P: RetryPredicate<E>,
    {
        let start = Instant::now();
        let max_attempts = self.policy.max_attempts;

        for attempt in 1..=max_attempts {
            self.observer.on_attempt_start(attempt, max_attempts);

            let err = match op().await {
                Ok(result) => {
                    self.observer.on_success(attempt, start.elapsed());
                    return Ok(result);
                }
                Err(err) => err,
            };

            let message = err.to_string();

            if !self.predicate.should_retry(&err) {
                self.observer.on_cancelled(attempt, &message);
                return Err(RetryError::NonRetryable(err));
            }

            if attempt >= max_attempts {
                self.observer.on_exhausted(attempt, &message);
                return Err(RetryError::Exhausted {
                    attempts: attempt,
                    source: err,
                    total_duration: start.elapsed(),
                });
            }

            let delay = calculate_delay(&self.policy, attempt, self.jitter);
            self.observer.on_attempt_failed(attempt, &message, delay);

            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }

        Err(RetryError::NoAttempts)
    }
}
