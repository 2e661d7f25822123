//! Source and remote store collaborators
//!
//! The migration core never talks to a storage service directly. A
//! [`SourceStore`] enumerates units and their objects and can delete a unit;
//! a [`RemoteStore`] receives archive parts and manifests. Both are injected
//! as trait objects so the pipeline can run against cloud clients, the
//! directory-backed stores in [`local`], or test doubles.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ferry_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::pin::Pin;
use tokio::io::AsyncRead;

pub mod local;

pub use local::{LocalRemoteStore, LocalSourceStore};

/// Streaming body of an object or remote file
pub type ByteStream = Pin<Box<dyn AsyncRead + Send>>;

/// One migratable collection of objects
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Unit {
    /// Identifier, unique within the source store
    pub id: String,

    /// Region or location tag
    pub region: String,

    /// Total byte size of all objects
    pub size_bytes: u64,

    /// Number of objects
    pub object_count: u64,

    /// When the unit was created, if the store reports it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

/// One object as listed by the source store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectEntry {
    /// Key relative to the unit root, `/`-separated
    pub path: String,

    /// Size in bytes
    pub size: u64,

    /// Last modification time, if known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<DateTime<Utc>>,
}

impl ObjectEntry {
    /// Directory markers are zero-content keys ending in `/`
    pub fn is_directory_marker(&self) -> bool {
        self.path.ends_with('/')
    }
}

/// Read access to units plus the one destructive operation
#[async_trait]
pub trait SourceStore: Send + Sync {
    /// Human-readable name for logs
    fn name(&self) -> &str;

    /// List every unit the store holds
    async fn list_units(&self) -> Result<Vec<Unit>>;

    /// List the objects of one unit
    async fn list_objects(&self, unit_id: &str) -> Result<Vec<ObjectEntry>>;

    /// Open one object for reading
    async fn get_object(&self, unit_id: &str, path: &str) -> Result<ByteStream>;

    /// Irreversibly delete a unit and everything in it
    async fn delete_unit(&self, unit_id: &str) -> Result<()>;
}

/// Destination file store
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Human-readable name for logs
    fn name(&self) -> &str;

    /// Write a file, replacing any existing file at `path`
    async fn put_file(&self, path: &str, body: ByteStream) -> Result<()>;

    /// List every file path under `prefix`
    async fn list_files(&self, prefix: &str) -> Result<Vec<String>>;

    /// Open a file for reading
    async fn get_file(&self, path: &str) -> Result<ByteStream>;

    /// Bytes still available to this account
    async fn free_space_bytes(&self) -> Result<u64>;
}

/// Map an object key onto a path relative to a unit directory.
///
/// Leading slashes are dropped. Keys that would escape the unit directory
/// (`..`, drive prefixes) are rejected.
pub fn relative_object_path(key: &str) -> Result<PathBuf> {
    let trimmed = key.trim_start_matches('/');
    if trimmed.is_empty() {
        return Err(Error::download_failed(key, "empty object key"));
    }

    let mut path = PathBuf::new();
    for component in Path::new(trimmed).components() {
        match component {
            Component::Normal(part) => path.push(part),
            Component::CurDir => {}
            _ => return Err(Error::download_failed(key, "object key escapes the unit root")),
        }
    }

    if path.as_os_str().is_empty() {
        return Err(Error::download_failed(key, "empty object key"));
    }
    Ok(path)
}

/// Check that a unit's keys map onto distinct, non-overlapping paths.
///
/// Two keys that normalize to the same path (`a/./b` and `a/b`), or a key
/// that is also the directory of another (`foo` and `foo/bar`), cannot both
/// be staged or archived and fail the unit with `DataIntegrity`.
pub fn check_object_keys(unit_id: &str, objects: &[ObjectEntry]) -> Result<()> {
    let mut paths: BTreeMap<PathBuf, &str> = BTreeMap::new();
    for object in objects.iter().filter(|o| !o.is_directory_marker()) {
        let path = relative_object_path(&object.path)?;
        if let Some(other) = paths.insert(path, &object.path) {
            return Err(Error::data_integrity(
                unit_id,
                format!("object keys {} and {} map to the same path", other, object.path),
            ));
        }
    }

    for (path, key) in &paths {
        if let Some(parent) = path.ancestors().skip(1).find_map(|a| paths.get(a)) {
            return Err(Error::data_integrity(
                unit_id,
                format!("object key {} is also a directory of {}", parent, key),
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relative_object_path() {
        assert_eq!(
            relative_object_path("logs/2024/a.txt").unwrap(),
            PathBuf::from("logs/2024/a.txt")
        );
        assert_eq!(
            relative_object_path("/rooted/./b.bin").unwrap(),
            PathBuf::from("rooted/b.bin")
        );
    }

    #[test]
    fn test_relative_object_path_rejects_escape() {
        assert!(relative_object_path("../etc/passwd").is_err());
        assert!(relative_object_path("a/../../b").is_err());
        assert!(relative_object_path("").is_err());
        assert!(relative_object_path("///").is_err());
    }

    fn entry(path: &str) -> ObjectEntry {
        ObjectEntry {
            path: path.into(),
            size: 1,
            last_modified: None,
        }
    }

    #[test]
    fn test_object_keys_must_not_collide() {
        assert!(check_object_keys("u", &[entry("a/b"), entry("a/c"), entry("a/")]).is_ok());

        let err = check_object_keys("u", &[entry("a/./b"), entry("a/b")]).unwrap_err();
        assert!(matches!(err, Error::DataIntegrity { .. }));
        assert!(err.to_string().contains("a/./b"));

        let err = check_object_keys("u", &[entry("foo"), entry("foo/bar")]).unwrap_err();
        assert!(matches!(err, Error::DataIntegrity { .. }));

        let err = check_object_keys("u", &[entry("x/y/z"), entry("x")]).unwrap_err();
        assert!(matches!(err, Error::DataIntegrity { .. }));
    }

    #[test]
    fn test_directory_marker() {
        let marker = ObjectEntry {
            path: "photos/".into(),
            size: 0,
            last_modified: None,
        };
        assert!(marker.is_directory_marker());
    }
}
