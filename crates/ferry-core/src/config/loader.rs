//! Configuration file loading and validation

use crate::error::{Error, Result};
use crate::types::FerryConfig;
use camino::{Utf8Path, Utf8PathBuf};
use std::fs;

/// Configuration file names to search for
pub const CONFIG_FILE_NAMES: &[&str] = &["ferry.yaml", "ferry.yml"];

/// Loaded and validated Ferry configuration
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    /// The parsed configuration
    pub config: FerryConfig,

    /// Path to the configuration file, if one was found
    pub config_path: Option<Utf8PathBuf>,
}

impl LoadedConfig {
    /// Load configuration from the specified path or search for it.
    ///
    /// An explicit path must exist. Without one, `ferry.yaml`/`ferry.yml` is
    /// searched in the current directory, its parents and the user config
    /// directory; when nothing is found the defaults are used. Relative
    /// workspace paths are resolved against the file's directory.
    pub fn load(path: Option<&Utf8Path>) -> Result<Self> {
        let found = match path {
            Some(p) => {
                let content = fs::read_to_string(p).map_err(|e| {
                    if e.kind() == std::io::ErrorKind::NotFound {
                        Error::config_not_found(p.as_str())
                    } else {
                        Error::Io(e)
                    }
                })?;
                Some((p.to_owned(), content))
            }
            None => Self::find_config()?,
        };

        let Some((config_path, content)) = found else {
            tracing::debug!("No configuration file found, using defaults");
            let config = FerryConfig::default();
            config.validate()?;
            return Ok(Self {
                config,
                config_path: None,
            });
        };

        let mut config = FerryConfig::from_yaml(&content)?;
        if let Some(base) = config_path.parent() {
            config.resolve_paths(base);
        }
        config.validate()?;

        tracing::debug!("Loaded configuration from {}", config_path);
        Ok(Self {
            config,
            config_path: Some(config_path),
        })
    }

    fn find_config() -> Result<Option<(Utf8PathBuf, String)>> {
        let cwd = std::env::current_dir().map_err(Error::Io)?;
        let cwd = Utf8PathBuf::try_from(cwd)
            .map_err(|_| Error::invalid_config("Current directory path is not valid UTF-8"))?;

        let mut current = cwd.as_path();

        loop {
            if let Some(found) = read_first_existing(current)? {
                return Ok(Some(found));
            }

            match current.parent() {
                Some(parent) => current = parent,
                None => break,
            }
        }

        if let Some(dir) = dirs::config_dir().and_then(|d| Utf8PathBuf::try_from(d).ok()) {
            return read_first_existing(&dir.join("ferry"));
        }

        Ok(None)
    }
}

fn read_first_existing(dir: &Utf8Path) -> Result<Option<(Utf8PathBuf, String)>> {
    for name in CONFIG_FILE_NAMES {
        let path = dir.join(name);
        if path.exists() {
            let content = fs::read_to_string(&path)?;
            return Ok(Some((path, content)));
        }
    }
    Ok(None)
}

impl FerryConfig {
    /// Parse configuration from YAML text
    pub fn from_yaml(content: &str) -> Result<Self> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml_ng::from_str(content)?)
    }

    /// Make relative workspace and store paths absolute against `base`
    pub fn resolve_paths(&mut self, base: &Utf8Path) {
        let resolve = |p: &mut Utf8PathBuf| {
            if p.is_relative() {
                *p = base.join(p.as_path());
            }
        };

        resolve(&mut self.workspace.scratch_dir);
        resolve(&mut self.workspace.progress_file);
        resolve(&mut self.workspace.reports_dir);
        if let Some(dir) = self.stores.source_dir.as_mut() {
            resolve(dir);
        }
        if let Some(dir) = self.stores.remote_dir.as_mut() {
            resolve(dir);
        }
    }

    /// Reject values that would make a run misbehave
    pub fn validate(&self) -> Result<()> {
        if self.archive.split_threshold_bytes == 0 {
            return Err(Error::invalid_config(
                "archive.split-threshold-bytes must be greater than zero",
            ));
        }

        let (min, max) = self.archive.compression.level_range();
        let level = self.archive.compression_level;
        if max > 0 && !(min..=max).contains(&level) {
            return Err(Error::invalid_config(format!(
                "archive.compression-level {} is outside {}..={} for {}",
                level, min, max, self.archive.compression
            )));
        }

        if !self.space.multiplier.is_finite() || self.space.multiplier < 1.0 {
            return Err(Error::invalid_config(
                "space.multiplier must be at least 1.0",
            ));
        }

        if self.concurrency.unit_workers == 0 || self.concurrency.download_workers == 0 {
            return Err(Error::invalid_config(
                "concurrency worker counts must be at least 1",
            ));
        }

        let policies = std::iter::once(("default", &self.retry_policies.default)).chain(
            self.retry_policies
                .operations
                .iter()
                .map(|(name, policy)| (name.as_str(), policy)),
        );
        for (name, policy) in policies {
            if policy.max_attempts == 0 {
                return Err(Error::invalid_config(format!(
                    "retry-policies.{}: max-attempts must be at least 1",
                    name
                )));
            }
            if policy.backoff_multiplier < 1.0 {
                return Err(Error::invalid_config(format!(
                    "retry-policies.{}: backoff-multiplier must be at least 1.0",
                    name
                )));
            }
        }

        if self.remote.root.trim().is_empty() {
            return Err(Error::invalid_config("remote.root must not be empty"));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CompressionFormat;
    use serial_test::serial;
    use tempfile::TempDir;

    #[test]
    fn test_load_explicit_path() {
        let temp = TempDir::new().unwrap();
        let dir = Utf8PathBuf::try_from(temp.path().to_path_buf()).unwrap();
        let path = dir.join("ferry.yaml");
        fs::write(
            &path,
            "archive:\n  compression: tar\nworkspace:\n  scratch-dir: work\n",
        )
        .unwrap();

        let loaded = LoadedConfig::load(Some(&path)).unwrap();
        assert_eq!(loaded.config.archive.compression, CompressionFormat::Tar);
        assert_eq!(loaded.config.workspace.scratch_dir, dir.join("work"));
        assert_eq!(loaded.config_path, Some(path));
    }

    #[test]
    fn test_missing_explicit_path() {
        let err = LoadedConfig::load(Some(Utf8Path::new("/nonexistent/ferry.yaml"))).unwrap_err();
        assert!(matches!(err, Error::ConfigNotFound { .. }));
    }

    #[test]
    #[serial]
    fn test_search_parent_directories() {
        let temp = TempDir::new().unwrap();
        let nested = temp.path().join("a/b");
        fs::create_dir_all(&nested).unwrap();
        fs::write(
            temp.path().join("ferry.yml"),
            "verification:\n  unit-sample-size: 2\n",
        )
        .unwrap();

        let previous = std::env::current_dir().unwrap();
        std::env::set_current_dir(&nested).unwrap();
        let loaded = LoadedConfig::load(None);
        std::env::set_current_dir(previous).unwrap();

        let loaded = loaded.unwrap();
        assert_eq!(loaded.config.verification.unit_sample_size, 2);
        assert!(loaded.config_path.is_some());
    }

    #[test]
    fn test_empty_file_is_default() {
        let config = FerryConfig::from_yaml("  \n").unwrap();
        assert_eq!(config.concurrency.download_workers, 8);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = FerryConfig::default();
        config.archive.split_threshold_bytes = 0;
        assert!(config.validate().is_err());

        let mut config = FerryConfig::default();
        config.space.multiplier = 0.5;
        assert!(config.validate().is_err());

        let mut config = FerryConfig::default();
        config.archive.compression_level = 12;
        assert!(config.validate().is_err());

        config.archive.compression = CompressionFormat::TarZst;
        assert!(config.validate().is_ok());

        let mut config = FerryConfig::default();
        config.retry_policies.default.max_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = FerryConfig::default();
        config.concurrency.unit_workers = 0;
        assert!(config.validate().is_err());
    }
}
