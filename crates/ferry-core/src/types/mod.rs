//! Type definitions shared across Ferry crates

mod runtime_config;

pub use runtime_config::*;
