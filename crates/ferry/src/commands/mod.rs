//! CLI command implementations

pub mod delete;
pub mod info;
pub mod migrate;
pub mod verify;

use anyhow::{anyhow, Context as _, Result};
use camino::Utf8PathBuf;
use ferry_core::types::FerryConfig;
use ferry_core::{CancellationToken, LoadedConfig};
use ferry_migrate::store::{LocalRemoteStore, LocalSourceStore, RemoteStore, SourceStore};
use ferry_migrate::ProgressStore;
use std::sync::Arc;

use crate::cli::GlobalArgs;
use crate::output;

/// Configuration plus the stores and progress it points at
pub struct Context {
    pub config: FerryConfig,
    pub config_path: Option<Utf8PathBuf>,
    pub source: Arc<dyn SourceStore>,
    pub remote: Arc<dyn RemoteStore>,
    pub progress: Arc<ProgressStore>,
}

impl Context {
    /// Load config, apply global overrides and open the stores
    pub fn load(global: &GlobalArgs) -> Result<Self> {
        let loaded = LoadedConfig::load(global.config.as_deref()).context("Failed to load configuration")?;
        let mut config = loaded.config;

        if let Some(dir) = &global.source_dir {
            config.stores.source_dir = Some(dir.clone());
        }
        if let Some(dir) = &global.remote_dir {
            config.stores.remote_dir = Some(dir.clone());
        }
        if let Some(dir) = &global.scratch_dir {
            config.workspace.scratch_dir = dir.clone();
        }
        if let Some(attempts) = global.max_retries {
            config.retry_policies.set_max_attempts(attempts);
        }
        config.validate().context("Invalid configuration after overrides")?;

        let source_dir = config
            .stores
            .source_dir
            .clone()
            .ok_or_else(|| anyhow!("No source store configured: set stores.source-dir or pass --source-dir"))?;
        let remote_dir = config
            .stores
            .remote_dir
            .clone()
            .ok_or_else(|| anyhow!("No remote store configured: set stores.remote-dir or pass --remote-dir"))?;

        let progress = ProgressStore::load(config.workspace.progress_file.as_std_path())
            .with_context(|| format!("Failed to load progress from {}", config.workspace.progress_file))?;

        Ok(Self {
            source: Arc::new(LocalSourceStore::new(source_dir.into_std_path_buf())),
            remote: Arc::new(LocalRemoteStore::new(remote_dir.into_std_path_buf())),
            progress: Arc::new(progress),
            config_path: loaded.config_path,
            config,
        })
    }
}

/// Token cancelled by the first Ctrl-C
pub fn cancel_on_interrupt() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            output::warning("Interrupt received, stopping after the current stage");
            trigger.cancel();
        }
    });
    token
}

/// Split a comma list flag into an optional filter
pub fn unit_filter(units: &[String]) -> Option<Vec<String>> {
    (!units.is_empty()).then(|| units.to_vec())
}
