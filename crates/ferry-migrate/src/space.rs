//! Free-space guard for the scratch volume
//!
//! Checks are advisory: concurrent units share the volume, so a check only
//! holds for a limited time and the archive stage repeats it once it has
//! gone stale.

use ferry_core::types::SpaceConfig;
use ferry_core::{Error, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Source of free-space readings
pub trait SpaceQuery: Send + Sync {
    /// Bytes available to unprivileged writers at `path`
    fn available_bytes(&self, path: &Path) -> Result<u64>;
}

/// Reads free space from the filesystem
#[derive(Debug, Default, Clone, Copy)]
pub struct FsSpaceQuery;

impl SpaceQuery for FsSpaceQuery {
    fn available_bytes(&self, path: &Path) -> Result<u64> {
        std::fs::create_dir_all(path)?;
        Ok(fs4::available_space(path)?)
    }
}

/// A passed space check
#[derive(Debug, Clone, Copy)]
pub struct SpaceCheck {
    pub required: u64,
    pub available: u64,
    pub checked_at: Instant,
}

impl SpaceCheck {
    /// Whether the reading is older than `max_age`
    pub fn is_stale(&self, max_age: Duration) -> bool {
        self.checked_at.elapsed() >= max_age
    }
}

/// Guards disk-consuming stages against running out of scratch space
#[derive(Clone)]
pub struct SpaceGuard {
    path: PathBuf,
    multiplier: f64,
    stale_after: Duration,
    query: Arc<dyn SpaceQuery>,
}

impl std::fmt::Debug for SpaceGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpaceGuard")
            .field("path", &self.path)
            .field("multiplier", &self.multiplier)
            .field("stale_after", &self.stale_after)
            .finish()
    }
}

impl SpaceGuard {
    /// Guard the volume holding `path` using the configured multiplier
    pub fn new(path: impl Into<PathBuf>, config: &SpaceConfig) -> Self {
        Self {
            path: path.into(),
            multiplier: config.multiplier,
            stale_after: Duration::from_secs(config.stale_after_secs),
            query: Arc::new(FsSpaceQuery),
        }
    }

    /// Replace the free-space source
    pub fn with_query(mut self, query: Arc<dyn SpaceQuery>) -> Self {
        self.query = query;
        self
    }

    /// Bytes a unit of `unit_size` needs on the scratch volume
    pub fn required_for(&self, unit_size: u64) -> u64 {
        (unit_size as f64 * self.multiplier).ceil() as u64
    }

    /// Fail with `InsufficientSpace` unless `required` bytes are free
    pub fn ensure(&self, required: u64) -> Result<SpaceCheck> {
        let available = self.query.available_bytes(&self.path)?;
        debug!(
            "Space check at {}: need {} bytes, {} available",
            self.path.display(),
            required,
            available
        );
        if available < required {
            return Err(Error::InsufficientSpace {
                path: self.path.display().to_string(),
                required,
                available,
            });
        }
        Ok(SpaceCheck {
            required,
            available,
            checked_at: Instant::now(),
        })
    }

    /// Check space for a unit of `unit_size` bytes
    pub fn ensure_for_unit(&self, unit_size: u64) -> Result<SpaceCheck> {
        self.ensure(self.required_for(unit_size))
    }

    /// Repeat `previous` if it has gone stale, otherwise keep it
    pub fn recheck_if_stale(&self, previous: Option<SpaceCheck>, unit_size: u64) -> Result<SpaceCheck> {
        match previous {
            Some(check) if !check.is_stale(self.stale_after) => Ok(check),
            _ => self.ensure_for_unit(unit_size),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

    struct FixedSpace {
        available: AtomicU64,
        calls: AtomicUsize,
    }

    impl FixedSpace {
        fn new(available: u64) -> Arc<Self> {
            Arc::new(Self {
                available: AtomicU64::new(available),
                calls: AtomicUsize::new(0),
            })
        }
    }

    impl SpaceQuery for FixedSpace {
        fn available_bytes(&self, _path: &Path) -> Result<u64> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.available.load(Ordering::SeqCst))
        }
    }

    fn guard(query: Arc<FixedSpace>, stale_after_secs: u64) -> SpaceGuard {
        let config = SpaceConfig {
            multiplier: 2.0,
            stale_after_secs,
        };
        SpaceGuard::new("/scratch", &config).with_query(query)
    }

    #[test]
    fn test_required_uses_multiplier() {
        let guard = guard(FixedSpace::new(0), 300);
        assert_eq!(guard.required_for(100), 200);
        assert_eq!(guard.required_for(0), 0);
    }

    #[test]
    fn test_ensure_passes_and_fails() {
        let query = FixedSpace::new(1000);
        let guard = guard(Arc::clone(&query), 300);

        let check = guard.ensure_for_unit(500).unwrap();
        assert_eq!(check.required, 1000);

        let err = guard.ensure_for_unit(501).unwrap_err();
        match err {
            Error::InsufficientSpace {
                required,
                available,
                ..
            } => {
                assert_eq!(required, 1002);
                assert_eq!(available, 1000);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_fresh_check_is_reused() {
        let query = FixedSpace::new(1000);
        let guard = guard(Arc::clone(&query), 300);

        let first = guard.ensure_for_unit(10).unwrap();
        guard.recheck_if_stale(Some(first), 10).unwrap();
        assert_eq!(query.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_stale_check_is_repeated() {
        let query = FixedSpace::new(1000);
        let guard = guard(Arc::clone(&query), 0);

        let first = guard.ensure_for_unit(10).unwrap();
        query.available.store(5, Ordering::SeqCst);
        assert!(guard.recheck_if_stale(Some(first), 10).is_err());
        assert_eq!(query.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_filesystem_query() {
        let temp = tempfile::TempDir::new().unwrap();
        let available = FsSpaceQuery.available_bytes(temp.path()).unwrap();
        assert!(available > 0);
    }
}
