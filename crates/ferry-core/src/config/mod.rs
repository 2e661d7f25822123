//! Configuration loading and validation

mod loader;

pub use loader::{LoadedConfig, CONFIG_FILE_NAMES};
