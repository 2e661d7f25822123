//! Policy-based retry engine for remote store operations
//!
//! Every remote call the migration core makes (list, download, upload,
//! delete) goes through [`retry_remote`], which retries only
//! [transient](crate::Error::is_transient) failures with the configured
//! backoff and turns an exhausted budget into
//! [`Error::RetriesExhausted`](crate::Error::RetriesExhausted).
//!
//! # Example
//!
//! ```rust,no_run
//! use ferry_core::retry::retry_remote;
//! use ferry_core::types::RetryPolicy;
//!
//! async fn example() -> ferry_core::Result<u64> {
//!     let policy = RetryPolicy::default();
//!
//!     retry_remote(&policy, "list", || async {
//!         // Your fallible remote call here
//!         Ok(42)
//!     })
//!     .await
//! }
//! ```

mod error;
mod executor;
mod observer;
mod strategies;

pub use error::RetryError;
pub use executor::{retry_remote, RetryExecutor};
pub use observer::{RetryObserver, TracingObserver};
pub use strategies::{calculate_delay, RetryPredicate, TransientOnly};

#[cfg(test)]
mod tests;
