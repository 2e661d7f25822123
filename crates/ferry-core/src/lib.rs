//! # ferry-core
//!
//! Core library for Ferry providing:
//! - The error taxonomy shared by every migration stage
//! - Explicit runtime configuration (ferry.yaml) with validation
//! - Retry execution engine with policy-based configuration
//! - Cooperative cancellation

pub mod cancel;
pub mod config;
pub mod error;
pub mod retry;
pub mod types;

pub use cancel::CancellationToken;
pub use config::LoadedConfig;
pub use error::{Error, ErrorClass, Result};
pub use types::FerryConfig;
