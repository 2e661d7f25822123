//! Bounded-parallel object download into a unit's scratch directory

use crate::compression::{checksum_and_size, hex_digest};
use crate::manifest::ManifestObject;
use crate::store::{relative_object_path, SourceStore};
use ferry_core::retry::retry_remote;
use ferry_core::types::RetryPolicy;
use ferry_core::{CancellationToken, Error, ErrorClass, Result};
use futures::stream::{self, StreamExt, TryStreamExt};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;

const COPY_BUFFER: usize = 64 * 1024;

/// One object present on local disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedObject {
    pub path: String,
    pub size: u64,
    pub sha256: String,

    /// Already on disk from an earlier attempt
    pub reused: bool,
}

/// Downloads the objects of one unit
pub struct ObjectFetcher<'a> {
    pub source: &'a Arc<dyn SourceStore>,
    pub unit_id: &'a str,
    pub dest: &'a Path,
    pub workers: usize,
    pub policy: &'a RetryPolicy,
    pub cancel: &'a CancellationToken,
}

impl ObjectFetcher<'_> {
    /// Fetch every object, reusing complete files from an earlier attempt.
    ///
    /// `on_object` is called with the byte size of each object once it is
    /// on disk.
    pub async fn fetch_all<F>(&self, objects: &[ManifestObject], on_object: F) -> Result<Vec<FetchedObject>>
    where
        F: Fn(u64) + Sync,
    {
        let on_object = &on_object;
        stream::iter(objects.iter().map(Ok::<_, Error>))
            .map_ok(|object| async move {
                self.cancel.check()?;
                let fetched = self.fetch_one(object).await?;
                on_object(fetched.size);
                Ok::<_, Error>(fetched)
            })
            .try_buffer_unordered(self.workers.max(1))
            .try_collect()
            .await
    }

    async fn fetch_one(&self, object: &ManifestObject) -> Result<FetchedObject> {
        let rel = relative_object_path(&object.path)?;
        let target = self.dest.join(rel);

        if let Some(existing) = reuse_existing(&target, object).await? {
            debug!(unit = %self.unit_id, object = %object.path, "Reusing downloaded object");
            return Ok(existing);
        }

        let result = retry_remote(self.policy, "download", || self.download(object, &target)).await;
        match result {
            Ok(sha256) => Ok(FetchedObject {
                path: object.path.clone(),
                size: object.size,
                sha256,
                reused: false,
            }),
            Err(err) => Err(escalate(&object.path, err)),
        }
    }

    async fn download(&self, object: &ManifestObject, target: &Path) -> Result<String> {
        let mut body = self.source.get_object(self.unit_id, &object.path).await?;

        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(Error::from_write)?;
        }
        let staging = staging_path(target);
        let mut file = tokio::fs::File::create(&staging)
            .await
            .map_err(Error::from_write)?;

        let mut hasher = Sha256::new();
        let mut written = 0u64;
        let mut buf = vec![0u8; COPY_BUFFER];
        loop {
            let n = body.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            file.write_all(&buf[..n]).await.map_err(Error::from_write)?;
            written += n as u64;
        }
        file.flush().await.map_err(Error::from_write)?;
        drop(file);

        if written != object.size {
            let _ = tokio::fs::remove_file(&staging).await;
            return Err(Error::data_integrity(
                format!("{}/{}", self.unit_id, object.path),
                format!(
                    "listed at {} bytes but {} bytes were read; the object changed since enumeration",
                    object.size, written
                ),
            ));
        }

        tokio::fs::rename(&staging, target).await?;
        debug!(unit = %self.unit_id, object = %object.path, bytes = written, "Downloaded object");
        Ok(hex_digest(hasher))
    }
}

async fn reuse_existing(target: &Path, object: &ManifestObject) -> Result<Option<FetchedObject>> {
    match tokio::fs::metadata(target).await {
        Ok(meta) if meta.is_file() && meta.len() == object.size => {
            let path = target.to_path_buf();
            let (sha256, size) = tokio::task::spawn_blocking(move || checksum_and_size(&path))
                .await
                .map_err(|e| Error::store("hash object", e.to_string()))??;
            Ok(Some(FetchedObject {
                path: object.path.clone(),
                size,
                sha256,
                reused: true,
            }))
        }
        _ => Ok(None),
    }
}

/// Anything that is not already classified becomes a download failure
/// attributed to the object.
fn escalate(object: &str, err: Error) -> Error {
    match err.class() {
        ErrorClass::ResourceExhausted | ErrorClass::DataIntegrity => err,
        _ if matches!(err, Error::Cancelled) => err,
        _ => Error::download_failed(object, err.to_string()),
    }
}

fn staging_path(target: &Path) -> PathBuf {
    let mut name = target.as_os_str().to_os_string();
    name.push(".download");
    PathBuf::from(name)
}
