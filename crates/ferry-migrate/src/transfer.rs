//! Moving archive parts and manifests to and from the remote store
//!
//! Remote layout, one folder per unit:
//!
//! ```text
//! {remote.root}/{unit}/archive.tar.gz            single-part archive
//! {remote.root}/{unit}/archive.tar.gz.001 ...    or numbered parts
//! {remote.root}/{unit}/manifest.json             written last
//! ```
//!
//! The manifest is uploaded after every part, so its presence marks a
//! complete remote copy.

use crate::manifest::{ArchivePart, UnitManifest, MANIFEST_FILENAME};
use crate::progress_store::SealedArchive;
use crate::store::{ByteStream, RemoteStore};
use ferry_core::retry::retry_remote;
use ferry_core::types::RetryPolicy;
use ferry_core::{CancellationToken, Error, Result};
use std::collections::BTreeSet;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tracing::{debug, info};

/// Paths of the remote unit folders
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteLayout {
    root: String,
}

impl RemoteLayout {
    pub fn new(root: impl Into<String>) -> Self {
        let root = root.into();
        let trimmed = root.trim_end_matches('/');
        let root = if trimmed.starts_with('/') {
            trimmed.to_string()
        } else {
            format!("/{}", trimmed)
        };
        Self { root }
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn unit_dir(&self, unit_id: &str) -> String {
        format!("{}/{}", self.root, unit_id)
    }

    pub fn file_path(&self, unit_id: &str, name: &str) -> String {
        format!("{}/{}/{}", self.root, unit_id, name)
    }

    pub fn manifest_path(&self, unit_id: &str) -> String {
        self.file_path(unit_id, MANIFEST_FILENAME)
    }

    /// Unit folder a listed path belongs to
    pub fn unit_of<'a>(&self, path: &'a str) -> Option<&'a str> {
        let rest = path.strip_prefix(self.root.as_str())?.strip_prefix('/')?;
        let (unit, file) = rest.split_once('/')?;
        (!unit.is_empty() && !file.is_empty()).then_some(unit)
    }
}

/// Remote copy found for a unit
#[derive(Debug, Clone)]
pub struct RemoteUnit {
    /// File names present in the unit folder
    pub files: BTreeSet<String>,

    /// Parsed manifest, when one was uploaded
    pub manifest: Option<UnitManifest>,
}

impl RemoteUnit {
    /// Manifest present and every part it names uploaded
    pub fn is_complete(&self) -> bool {
        match self.manifest.as_ref().and_then(|m| m.archive.as_ref()) {
            Some(archive) => archive.parts.iter().all(|p| self.files.contains(&p.name)),
            None => false,
        }
    }

    /// Archive described by the remote manifest
    pub fn sealed_archive(&self) -> Option<SealedArchive> {
        let archive = self.manifest.as_ref()?.archive.as_ref()?;
        Some(SealedArchive {
            parts: archive.parts.clone(),
            total_bytes: archive.total_bytes,
            sha256: archive.sha256.clone(),
        })
    }
}

fn file_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

async fn read_all(mut body: ByteStream) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    body.read_to_end(&mut bytes).await?;
    Ok(bytes)
}

/// Pushes sealed parts and the manifest to the remote store
pub struct TransferUploader {
    remote: Arc<dyn RemoteStore>,
    layout: RemoteLayout,
    policy: RetryPolicy,
    cancel: CancellationToken,
}

impl TransferUploader {
    pub fn new(remote: Arc<dyn RemoteStore>, layout: RemoteLayout, policy: RetryPolicy) -> Self {
        Self {
            remote,
            layout,
            policy,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn layout(&self) -> &RemoteLayout {
        &self.layout
    }

    /// Fail with `QuotaExceeded` unless `required` bytes are free remotely
    pub async fn check_quota(&self, required: u64) -> Result<u64> {
        let available = retry_remote(&self.policy, "quota", || self.remote.free_space_bytes()).await?;
        if available < required {
            return Err(Error::QuotaExceeded {
                required,
                available,
            });
        }
        Ok(available)
    }

    /// Upload every part not listed in `already_uploaded`, in sequence order.
    ///
    /// `on_uploaded` runs after each confirmed part so the caller can record
    /// it durably before the next part starts. Returns the number of parts
    /// sent.
    pub async fn upload_parts<F>(
        &self,
        unit_id: &str,
        parts_dir: &Path,
        parts: &[ArchivePart],
        already_uploaded: &[String],
        mut on_uploaded: F,
    ) -> Result<usize>
    where
        F: FnMut(&ArchivePart) -> Result<()>,
    {
        let mut ordered: Vec<&ArchivePart> = parts.iter().collect();
        ordered.sort_by_key(|p| p.sequence);

        let mut sent = 0;
        for part in ordered {
            if already_uploaded.contains(&part.name) {
                debug!(unit = %unit_id, part = %part.name, "Part already uploaded");
                continue;
            }
            self.cancel.check()?;

            let local = parts_dir.join(&part.name);
            let remote_path = self.layout.file_path(unit_id, &part.name);
            retry_remote(&self.policy, "upload", || async {
                let file = tokio::fs::File::open(&local).await?;
                self.remote.put_file(&remote_path, Box::pin(file)).await
            })
            .await?;

            on_uploaded(part)?;
            sent += 1;
            info!(
                unit = %unit_id,
                part = %part.name,
                bytes = part.size,
                "Uploaded part {}/{}",
                part.sequence,
                parts.len()
            );
        }
        Ok(sent)
    }

    /// Upload the manifest, marking the remote copy complete
    pub async fn upload_manifest(&self, unit_id: &str, manifest: &UnitManifest) -> Result<()> {
        self.cancel.check()?;
        let bytes = manifest.to_json()?;
        let path = self.layout.manifest_path(unit_id);
        retry_remote(&self.policy, "upload", || {
            let body: ByteStream = Box::pin(Cursor::new(bytes.clone()));
            self.remote.put_file(&path, body)
        })
        .await?;
        debug!(unit = %unit_id, "Uploaded manifest");
        Ok(())
    }
}

/// Fetches parts and manifests back from the remote store
pub struct TransferDownloader {
    remote: Arc<dyn RemoteStore>,
    layout: RemoteLayout,
    policy: RetryPolicy,
    cancel: CancellationToken,
}

impl TransferDownloader {
    pub fn new(remote: Arc<dyn RemoteStore>, layout: RemoteLayout, policy: RetryPolicy) -> Self {
        Self {
            remote,
            layout,
            policy,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn layout(&self) -> &RemoteLayout {
        &self.layout
    }

    /// Download one part into `dest_dir`, checking its length.
    ///
    /// A length mismatch is an integrity failure and is not retried.
    pub async fn fetch_part(&self, unit_id: &str, part: &ArchivePart, dest_dir: &Path) -> Result<PathBuf> {
        self.cancel.check()?;
        tokio::fs::create_dir_all(dest_dir)
            .await
            .map_err(Error::from_write)?;

        let target = dest_dir.join(&part.name);
        let remote_path = self.layout.file_path(unit_id, &part.name);
        let received = retry_remote(&self.policy, "download", || async {
            let mut body = self.remote.get_file(&remote_path).await?;
            let mut file = tokio::fs::File::create(&target)
                .await
                .map_err(Error::from_write)?;
            let copied = tokio::io::copy(&mut body, &mut file)
                .await
                .map_err(Error::from_write)?;
            file.sync_all().await.map_err(Error::from_write)?;
            Ok::<_, Error>(copied)
        })
        .await?;

        if received != part.size {
            return Err(Error::data_integrity(
                remote_path,
                format!("received {} bytes, expected {}", received, part.size),
            ));
        }
        debug!(unit = %unit_id, part = %part.name, bytes = received, "Fetched part");
        Ok(target)
    }

    /// Download parts in sequence order
    pub async fn fetch_parts(&self, unit_id: &str, parts: &[ArchivePart], dest_dir: &Path) -> Result<Vec<PathBuf>> {
        let mut ordered: Vec<&ArchivePart> = parts.iter().collect();
        ordered.sort_by_key(|p| p.sequence);

        let mut paths = Vec::with_capacity(ordered.len());
        for part in ordered {
            paths.push(self.fetch_part(unit_id, part, dest_dir).await?);
        }
        Ok(paths)
    }

    /// Download and parse a unit's manifest
    pub async fn fetch_manifest(&self, unit_id: &str) -> Result<UnitManifest> {
        let path = self.layout.manifest_path(unit_id);
        let bytes = retry_remote(&self.policy, "download", || async {
            read_all(self.remote.get_file(&path).await?).await
        })
        .await?;
        UnitManifest::from_json(&bytes)
    }

    /// What the remote folder of a unit holds
    pub async fn inspect_unit(&self, unit_id: &str) -> Result<RemoteUnit> {
        let dir = self.layout.unit_dir(unit_id);
        let listed = retry_remote(&self.policy, "list", || self.remote.list_files(&dir)).await?;
        let files: BTreeSet<String> = listed.iter().map(|p| file_name(p).to_string()).collect();

        let manifest = if files.contains(MANIFEST_FILENAME) {
            Some(self.fetch_manifest(unit_id).await?)
        } else {
            None
        };
        Ok(RemoteUnit { files, manifest })
    }

    /// Names of every unit folder under the remote root
    pub async fn list_unit_folders(&self) -> Result<BTreeSet<String>> {
        let root = self.layout.root().to_string();
        let listed = retry_remote(&self.policy, "list", || self.remote.list_files(&root)).await?;
        Ok(listed
            .iter()
            .filter_map(|p| self.layout.unit_of(p))
            .map(str::to_string)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::LocalRemoteStore;
    use tempfile::TempDir;

    fn part(name: &str, size: u64, sequence: u32) -> ArchivePart {
        ArchivePart {
            sequence,
            name: name.into(),
            size,
            sha256: String::new(),
            unit_id: "u".into(),
        }
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 2,
            initial_delay_ms: 1,
            max_delay_ms: 2,
            ..RetryPolicy::default()
        }
    }

    #[test]
    fn test_layout_paths() {
        let layout = RemoteLayout::new("ferry-migration/");
        assert_eq!(layout.root(), "/ferry-migration");
        assert_eq!(layout.unit_dir("a"), "/ferry-migration/a");
        assert_eq!(
            layout.file_path("a", "archive.tar.gz.001"),
            "/ferry-migration/a/archive.tar.gz.001"
        );
        assert_eq!(layout.unit_of("/ferry-migration/a/manifest.json"), Some("a"));
        assert_eq!(layout.unit_of("/ferry-migration/stray.txt"), None);
        assert_eq!(layout.unit_of("/other/a/manifest.json"), None);
    }

    #[tokio::test]
    async fn test_upload_then_download_parts() {
        let remote_dir = TempDir::new().unwrap();
        let local = TempDir::new().unwrap();
        std::fs::write(local.path().join("archive.tar.001"), b"abcd").unwrap();
        std::fs::write(local.path().join("archive.tar.002"), b"ef").unwrap();
        let parts = vec![part("archive.tar.002", 2, 2), part("archive.tar.001", 4, 1)];

        let remote: Arc<dyn RemoteStore> = Arc::new(LocalRemoteStore::new(remote_dir.path()));
        let layout = RemoteLayout::new("/root");
        let uploader = TransferUploader::new(remote.clone(), layout.clone(), fast_policy());

        let mut order = Vec::new();
        let sent = uploader
            .upload_parts("u", local.path(), &parts, &["archive.tar.002".to_string()], |p| {
                order.push(p.name.clone());
                Ok(())
            })
            .await
            .unwrap();
        assert_eq!(sent, 1);
        assert_eq!(order, vec!["archive.tar.001".to_string()]);

        let downloader = TransferDownloader::new(remote, layout, fast_policy());
        let scratch = TempDir::new().unwrap();
        let fetched = downloader
            .fetch_part("u", &parts[1], scratch.path())
            .await
            .unwrap();
        assert_eq!(std::fs::read(fetched).unwrap(), b"abcd");

        // Part 2 was never uploaded
        assert!(downloader.fetch_part("u", &parts[0], scratch.path()).await.is_err());
    }

    #[tokio::test]
    async fn test_length_mismatch_is_integrity_failure() {
        let remote_dir = TempDir::new().unwrap();
        std::fs::create_dir_all(remote_dir.path().join("root/u")).unwrap();
        std::fs::write(remote_dir.path().join("root/u/archive.tar"), b"short").unwrap();

        let remote: Arc<dyn RemoteStore> = Arc::new(LocalRemoteStore::new(remote_dir.path()));
        let downloader = TransferDownloader::new(remote, RemoteLayout::new("/root"), fast_policy());
        let scratch = TempDir::new().unwrap();

        let err = downloader
            .fetch_part("u", &part("archive.tar", 100, 1), scratch.path())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DataIntegrity { .. }));
    }

    #[tokio::test]
    async fn test_quota_check() {
        let remote_dir = TempDir::new().unwrap();
        let remote: Arc<dyn RemoteStore> = Arc::new(LocalRemoteStore::new(remote_dir.path()));
        let uploader = TransferUploader::new(remote, RemoteLayout::new("/root"), fast_policy());

        assert!(uploader.check_quota(1).await.is_ok());
        assert!(matches!(
            uploader.check_quota(u64::MAX).await,
            Err(Error::QuotaExceeded { .. })
        ));
    }

    #[tokio::test]
    async fn test_list_unit_folders() {
        let remote_dir = TempDir::new().unwrap();
        for unit in ["a", "b"] {
            let dir = remote_dir.path().join("root").join(unit);
            std::fs::create_dir_all(&dir).unwrap();
            std::fs::write(dir.join("manifest.json"), b"{}").unwrap();
        }
        let remote: Arc<dyn RemoteStore> = Arc::new(LocalRemoteStore::new(remote_dir.path()));
        let downloader = TransferDownloader::new(remote, RemoteLayout::new("/root"), fast_policy());

        let folders: Vec<_> = downloader.list_unit_folders().await.unwrap().into_iter().collect();
        assert_eq!(folders, vec!["a".to_string(), "b".to_string()]);
    }
}
