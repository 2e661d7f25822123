//! Directory-backed store implementations
//!
//! `LocalSourceStore` treats every subdirectory of its root as a unit and
//! the files beneath it as objects. `LocalRemoteStore` maps remote paths
//! under a root directory, e.g. a mounted network share or a synced folder.

use super::{relative_object_path, ByteStream, ObjectEntry, RemoteStore, SourceStore, Unit};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ferry_core::{Error, Result};
use std::io;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use walkdir::WalkDir;

/// Suffix of files still being written by [`LocalRemoteStore::put_file`]
const PARTIAL_SUFFIX: &str = ".partial";

fn map_io(what: &str, err: io::Error) -> Error {
    if err.kind() == io::ErrorKind::NotFound {
        Error::not_found(what)
    } else {
        Error::Io(err)
    }
}

async fn blocking<T, F>(operation: &str, f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::store(operation, format!("worker thread failed: {}", e)))?
}

/// Join the `/`-separated components of a relative path
fn slash_path(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Source store over a local directory tree
#[derive(Debug, Clone)]
pub struct LocalSourceStore {
    root: PathBuf,
    name: String,
}

impl LocalSourceStore {
    /// Create a store rooted at `root`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let name = format!("local:{}", root.display());
        Self { root, name }
    }

    fn unit_dir(&self, unit_id: &str) -> Result<PathBuf> {
        let rel = relative_object_path(unit_id)
            .map_err(|_| Error::store("resolve unit", format!("invalid unit id {}", unit_id)))?;
        Ok(self.root.join(rel))
    }

    fn scan(dir: &Path) -> Result<Vec<ObjectEntry>> {
        let mut objects = Vec::new();
        for entry in WalkDir::new(dir).follow_links(false).sort_by_file_name() {
            let entry = entry.map_err(|e| Error::store("list objects", e.to_string()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = entry
                .path()
                .strip_prefix(dir)
                .map_err(|e| Error::store("list objects", e.to_string()))?;
            let metadata = entry
                .metadata()
                .map_err(|e| Error::store("list objects", e.to_string()))?;
            objects.push(ObjectEntry {
                path: slash_path(rel),
                size: metadata.len(),
                last_modified: metadata.modified().ok().map(DateTime::<Utc>::from),
            });
        }
        Ok(objects)
    }
}

#[async_trait]
impl SourceStore for LocalSourceStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn list_units(&self) -> Result<Vec<Unit>> {
        let root = self.root.clone();
        blocking("list units", move || {
            let mut units = Vec::new();
            let entries = std::fs::read_dir(&root).map_err(|e| map_io("source root", e))?;
            for entry in entries {
                let entry = entry?;
                if !entry.file_type()?.is_dir() {
                    continue;
                }
                let id = entry.file_name().to_string_lossy().into_owned();
                let objects = Self::scan(&entry.path())?;
                let metadata = entry.metadata()?;
                units.push(Unit {
                    id,
                    region: "local".to_string(),
                    size_bytes: objects.iter().map(|o| o.size).sum(),
                    object_count: objects.len() as u64,
                    created_at: metadata
                        .created()
                        .or_else(|_| metadata.modified())
                        .ok()
                        .map(DateTime::<Utc>::from),
                });
            }
            units.sort_by(|a, b| a.id.cmp(&b.id));
            Ok(units)
        })
        .await
    }

    async fn list_objects(&self, unit_id: &str) -> Result<Vec<ObjectEntry>> {
        let dir = self.unit_dir(unit_id)?;
        if !dir.is_dir() {
            return Err(Error::not_found(format!("unit {}", unit_id)));
        }
        blocking("list objects", move || Self::scan(&dir)).await
    }

    async fn get_object(&self, unit_id: &str, path: &str) -> Result<ByteStream> {
        let file_path = self.unit_dir(unit_id)?.join(relative_object_path(path)?);
        let file = tokio::fs::File::open(&file_path)
            .await
            .map_err(|e| map_io(&format!("{}/{}", unit_id, path), e))?;
        Ok(Box::pin(file))
    }

    async fn delete_unit(&self, unit_id: &str) -> Result<()> {
        let dir = self.unit_dir(unit_id)?;
        tokio::fs::remove_dir_all(&dir)
            .await
            .map_err(|e| map_io(&format!("unit {}", unit_id), e))
    }
}

/// Remote store over a local directory
#[derive(Debug, Clone)]
pub struct LocalRemoteStore {
    root: PathBuf,
    name: String,
}

impl LocalRemoteStore {
    /// Create a store rooted at `root`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let name = format!("local:{}", root.display());
        Self { root, name }
    }

    fn resolve(&self, path: &str) -> Result<PathBuf> {
        if path.trim_matches('/').is_empty() {
            return Ok(self.root.clone());
        }
        let rel = relative_object_path(path)
            .map_err(|_| Error::store("resolve remote path", format!("invalid path {}", path)))?;
        Ok(self.root.join(rel))
    }
}

#[async_trait]
impl RemoteStore for LocalRemoteStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn put_file(&self, path: &str, mut body: ByteStream) -> Result<()> {
        let target = self.resolve(path)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(Error::from_write)?;
        }

        let mut staging = target.clone().into_os_string();
        staging.push(PARTIAL_SUFFIX);
        let staging = PathBuf::from(staging);

        let mut file = tokio::fs::File::create(&staging)
            .await
            .map_err(Error::from_write)?;
        tokio::io::copy(&mut body, &mut file)
            .await
            .map_err(Error::from_write)?;
        file.flush().await.map_err(Error::from_write)?;
        file.sync_all().await.map_err(Error::from_write)?;
        drop(file);

        tokio::fs::rename(&staging, &target)
            .await
            .map_err(Error::from_write)
    }

    async fn list_files(&self, prefix: &str) -> Result<Vec<String>> {
        let dir = self.resolve(prefix)?;
        let root = self.root.clone();
        blocking("list files", move || {
            if !dir.exists() {
                return Ok(Vec::new());
            }
            let mut files = Vec::new();
            for entry in WalkDir::new(&dir).follow_links(false).sort_by_file_name() {
                let entry = entry.map_err(|e| Error::store("list files", e.to_string()))?;
                if !entry.file_type().is_file() {
                    continue;
                }
                let name = entry.file_name().to_string_lossy();
                if name.ends_with(PARTIAL_SUFFIX) {
                    continue;
                }
                let rel = entry
                    .path()
                    .strip_prefix(&root)
                    .map_err(|e| Error::store("list files", e.to_string()))?;
                files.push(format!("/{}", slash_path(rel)));
            }
            Ok(files)
        })
        .await
    }

    async fn get_file(&self, path: &str) -> Result<ByteStream> {
        let target = self.resolve(path)?;
        let file = tokio::fs::File::open(&target)
            .await
            .map_err(|e| map_io(path, e))?;
        Ok(Box::pin(file))
    }

    async fn free_space_bytes(&self) -> Result<u64> {
        let root = self.root.clone();
        blocking("free space", move || {
            std::fs::create_dir_all(&root)?;
            Ok(fs4::available_space(&root)?)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;
    use tokio::io::AsyncReadExt;

    fn create_source() -> TempDir {
        let temp = TempDir::new().unwrap();
        fs::create_dir_all(temp.path().join("alpha/logs")).unwrap();
        fs::write(temp.path().join("alpha/logs/a.txt"), b"hello").unwrap();
        fs::write(temp.path().join("alpha/b.bin"), vec![7u8; 300]).unwrap();
        fs::create_dir_all(temp.path().join("beta")).unwrap();
        fs::write(temp.path().join("stray-file"), b"not a unit").unwrap();
        temp
    }

    #[tokio::test]
    async fn test_list_units_and_objects() {
        let temp = create_source();
        let store = LocalSourceStore::new(temp.path());

        let units = store.list_units().await.unwrap();
        assert_eq!(units.len(), 2);
        assert_eq!(units[0].id, "alpha");
        assert_eq!(units[0].size_bytes, 305);
        assert_eq!(units[0].object_count, 2);
        assert_eq!(units[1].object_count, 0);

        let objects = store.list_objects("alpha").await.unwrap();
        let paths: Vec<_> = objects.iter().map(|o| o.path.as_str()).collect();
        assert_eq!(paths, vec!["b.bin", "logs/a.txt"]);
    }

    #[tokio::test]
    async fn test_get_and_delete() {
        let temp = create_source();
        let store = LocalSourceStore::new(temp.path());

        let mut body = store.get_object("alpha", "logs/a.txt").await.unwrap();
        let mut content = Vec::new();
        body.read_to_end(&mut content).await.unwrap();
        assert_eq!(content, b"hello");

        store.delete_unit("alpha").await.unwrap();
        assert!(!temp.path().join("alpha").exists());
        assert!(matches!(
            store.list_objects("alpha").await,
            Err(Error::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_remote_put_list_get() {
        let temp = TempDir::new().unwrap();
        let store = LocalRemoteStore::new(temp.path().join("remote"));

        let body: ByteStream = Box::pin(std::io::Cursor::new(b"part-one".to_vec()));
        store
            .put_file("/root/alpha/archive.tar.gz.001", body)
            .await
            .unwrap();

        let files = store.list_files("/root/alpha").await.unwrap();
        assert_eq!(files, vec!["/root/alpha/archive.tar.gz.001".to_string()]);
        assert!(store.list_files("/root/missing").await.unwrap().is_empty());

        let mut body = store.get_file("/root/alpha/archive.tar.gz.001").await.unwrap();
        let mut content = String::new();
        body.read_to_string(&mut content).await.unwrap();
        assert_eq!(content, "part-one");

        assert!(store.free_space_bytes().await.unwrap() > 0);
    }

    #[tokio::test]
    async fn test_remote_rejects_escaping_paths() {
        let temp = TempDir::new().unwrap();
        let store = LocalRemoteStore::new(temp.path());
        let body: ByteStream = Box::pin(std::io::Cursor::new(Vec::new()));
        assert!(store.put_file("/../outside", body).await.is_err());
    }
}
