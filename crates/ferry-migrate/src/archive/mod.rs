//! Archive construction for one unit.
//!
//! A unit is archived in three steps, each restartable on its own:
//! 1. download every object into the unit's scratch directory,
//! 2. seal a tar stream or zip container (manifest first, then the objects)
//!    through the configured encoder into size-bounded parts,
//! 3. re-read the sealed parts and check them before anything is uploaded.

mod fetch;
pub mod split;

pub use fetch::{FetchedObject, ObjectFetcher};
pub use split::{archive_file_name, part_file_name, PartWriter, PartsReader, SplitOutput, MAX_PARTS};

use crate::compression::{checksum_and_size, decoder, ArchiveEncoder, CompressionStats};
use crate::manifest::{ArchiveInfo, ArchivePart, UnitManifest, MANIFEST_FILENAME};
use crate::progress_store::SealedArchive;
use crate::store::{check_object_keys, relative_object_path, ObjectEntry, SourceStore, Unit};
use ferry_core::retry::retry_remote;
use ferry_core::types::{ArchiveSettings, CompressionFormat, FerryConfig, RetryPolicy};
use ferry_core::{CancellationToken, Error, Result};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tar::{Archive, Builder as TarBuilder, Header};
use tracing::{debug, info};
use zip::result::ZipError;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

/// Configuration for archive construction.
#[derive(Debug, Clone)]
pub struct ArchiveConfig {
    /// Split threshold, format and level
    pub settings: ArchiveSettings,

    /// Objects downloaded concurrently
    pub download_workers: usize,

    /// Retry policy for object listing
    pub list_policy: RetryPolicy,

    /// Retry policy for object downloads
    pub download_policy: RetryPolicy,
}

impl ArchiveConfig {
    /// Take every archive option from the runtime configuration.
    pub fn from_config(config: &FerryConfig) -> Self {
        Self {
            settings: config.archive.clone(),
            download_workers: config.concurrency.download_workers,
            list_policy: config.retry_policies.policy_for("list").clone(),
            download_policy: config.retry_policies.policy_for("download").clone(),
        }
    }

    /// Sets the split threshold.
    pub fn with_threshold(mut self, bytes: u64) -> Self {
        self.settings.split_threshold_bytes = bytes;
        self
    }

    /// Sets the format and clamps the level into its range.
    pub fn with_format(mut self, format: CompressionFormat, level: u32) -> Self {
        let (min, max) = format.level_range();
        self.settings.compression = format;
        self.settings.compression_level = level.clamp(min, max);
        self
    }
}

/// Scratch directory layout of one unit
#[derive(Debug, Clone)]
pub struct UnitWorkspace {
    root: PathBuf,
}

impl UnitWorkspace {
    /// Workspace for `unit_id` under `scratch_dir`
    pub fn new(scratch_dir: &Path, unit_id: &str) -> Self {
        let dir_name: String = unit_id
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        Self {
            root: scratch_dir.join(dir_name),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Downloaded objects, laid out by relative path
    pub fn objects_dir(&self) -> PathBuf {
        self.root.join("objects")
    }

    /// Sealed archive parts
    pub fn parts_dir(&self) -> PathBuf {
        self.root.join("parts")
    }

    /// Extraction target used by verification
    pub fn extract_dir(&self) -> PathBuf {
        self.root.join("extract")
    }

    /// Working copy of the unit manifest
    pub fn manifest_path(&self) -> PathBuf {
        self.root.join(MANIFEST_FILENAME)
    }

    /// Manifest saved by an earlier stage, if any
    pub fn load_manifest(&self) -> Result<Option<UnitManifest>> {
        let path = self.manifest_path();
        if !path.exists() {
            return Ok(None);
        }
        UnitManifest::read_from(&path).map(Some)
    }

    pub fn save_manifest(&self, manifest: &UnitManifest) -> Result<()> {
        fs::create_dir_all(&self.root).map_err(Error::from_write)?;
        manifest.write_to(&self.manifest_path())
    }

    /// Drop any sealed or half-sealed parts
    pub fn discard_parts(&self) -> Result<()> {
        remove_dir_if_exists(&self.parts_dir())
    }

    /// Drop raw downloaded objects
    pub fn remove_objects(&self) -> Result<()> {
        remove_dir_if_exists(&self.objects_dir())
    }

    /// Drop the whole workspace
    pub fn remove(&self) -> Result<()> {
        remove_dir_if_exists(&self.root)
    }
}

fn remove_dir_if_exists(path: &Path) -> Result<()> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// A sealed, locally checked archive
#[derive(Debug, Clone)]
pub struct BuiltArchive {
    /// Manifest including the archive description
    pub manifest: UnitManifest,

    /// Parts in sequence order
    pub parts: Vec<ArchivePart>,

    /// Length of the concatenated stream
    pub total_bytes: u64,

    /// Hex SHA-256 of the concatenated stream
    pub sha256: String,

    pub stats: CompressionStats,
}

impl BuiltArchive {
    /// Fields the progress store keeps for the upload stage
    pub fn sealed(&self) -> SealedArchive {
        SealedArchive {
            parts: self.parts.clone(),
            total_bytes: self.total_bytes,
            sha256: self.sha256.clone(),
        }
    }
}

/// Archive builder for unit migrations.
pub struct ArchiveBuilder {
    source: Arc<dyn SourceStore>,
    config: ArchiveConfig,
    cancel: CancellationToken,
}

impl ArchiveBuilder {
    /// Creates a new archive builder.
    pub fn new(source: Arc<dyn SourceStore>, config: ArchiveConfig) -> Self {
        Self {
            source,
            config,
            cancel: CancellationToken::new(),
        }
    }

    /// Observe `cancel` between objects and while sealing.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn config(&self) -> &ArchiveConfig {
        &self.config
    }

    /// List the unit's objects and save the snapshot as its manifest.
    pub async fn enumerate(&self, unit: &Unit, workspace: &UnitWorkspace) -> Result<UnitManifest> {
        let objects = retry_remote(&self.config.list_policy, "list", || {
            self.source.list_objects(&unit.id)
        })
        .await?;
        check_object_keys(&unit.id, &objects)?;

        let manifest = UnitManifest::new(unit, &objects);
        workspace.save_manifest(&manifest)?;
        debug!(
            unit = %unit.id,
            objects = manifest.objects.len(),
            "Enumerated unit"
        );
        Ok(manifest)
    }

    /// Download every object of the manifest, recording content hashes.
    ///
    /// Safe to repeat: objects already on disk with the listed size are
    /// hashed in place instead of fetched again.
    pub async fn download<F>(
        &self,
        manifest: &mut UnitManifest,
        workspace: &UnitWorkspace,
        on_object: F,
    ) -> Result<Vec<FetchedObject>>
    where
        F: Fn(u64) + Sync,
    {
        let objects_dir = workspace.objects_dir();
        fs::create_dir_all(&objects_dir).map_err(Error::from_write)?;

        let fetcher = ObjectFetcher {
            source: &self.source,
            unit_id: &manifest.unit.id,
            dest: &objects_dir,
            workers: self.config.download_workers,
            policy: &self.config.download_policy,
            cancel: &self.cancel,
        };
        let fetched = fetcher.fetch_all(&manifest.objects, on_object).await?;

        let hashes: HashMap<&str, &str> = fetched
            .iter()
            .map(|f| (f.path.as_str(), f.sha256.as_str()))
            .collect();
        for object in &mut manifest.objects {
            if let Some(sha) = hashes.get(object.path.as_str()) {
                object.sha256 = Some(sha.to_string());
            }
        }
        workspace.save_manifest(manifest)?;

        let reused = fetched.iter().filter(|f| f.reused).count();
        info!(
            unit = %manifest.unit.id,
            objects = fetched.len(),
            reused,
            "Downloaded unit objects"
        );
        Ok(fetched)
    }

    /// Seal the downloaded objects into parts.
    ///
    /// Any parts left by an interrupted seal are discarded first.
    pub async fn seal(&self, manifest: &UnitManifest, workspace: &UnitWorkspace) -> Result<BuiltArchive> {
        workspace.discard_parts()?;

        let start = Instant::now();
        let manifest_copy = manifest.clone();
        let objects_dir = workspace.objects_dir();
        let parts_dir = workspace.parts_dir();
        let settings = self.config.settings.clone();
        let cancel = self.cancel.clone();

        let output = tokio::task::spawn_blocking(move || {
            write_archive(&manifest_copy, &objects_dir, &parts_dir, &settings, &cancel)
        })
        .await
        .map_err(|e| Error::compression_failed(format!("archive worker failed: {}", e)))?;

        let output = match output {
            Ok(output) => output,
            Err(err) => {
                let _ = workspace.discard_parts();
                return Err(err);
            }
        };

        let mut manifest = manifest.clone();
        manifest.archive = Some(ArchiveInfo {
            format: self.config.settings.compression,
            parts: output.parts.clone(),
            total_bytes: output.total_bytes,
            sha256: output.sha256.clone(),
        });
        workspace.save_manifest(&manifest)?;

        let stats = CompressionStats::new(manifest.total_object_bytes(), output.total_bytes);
        info!(
            unit = %manifest.unit.id,
            parts = output.parts.len(),
            bytes = output.total_bytes,
            saved = stats.compression_percentage(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Sealed archive"
        );

        Ok(BuiltArchive {
            manifest,
            parts: output.parts,
            total_bytes: output.total_bytes,
            sha256: output.sha256,
            stats,
        })
    }

    /// Re-read the sealed parts and check them against what was written.
    ///
    /// Every part's checksum and size must match, and the decoded stream
    /// must hold the manifest plus one entry per object.
    pub async fn verify_local(
        &self,
        manifest: &UnitManifest,
        parts: &[ArchivePart],
        workspace: &UnitWorkspace,
    ) -> Result<()> {
        let parts_dir = workspace.parts_dir();
        let parts = parts.to_vec();
        let expected_entries = manifest.objects.len() + 1;
        let format = self.config.settings.compression;
        let unit_id = manifest.unit.id.clone();

        tokio::task::spawn_blocking(move || {
            verify_parts(&parts_dir, &parts)?;

            let entries = count_entries(format, &parts_dir, &parts, &unit_id)?;
            if entries != expected_entries {
                return Err(Error::data_integrity(
                    &unit_id,
                    format!("archive holds {} entries, expected {}", entries, expected_entries),
                ));
            }
            Ok(())
        })
        .await
        .map_err(|e| Error::store("verify archive", e.to_string()))?
    }

    /// Enumerate, download, seal and check one unit.
    pub async fn build(&self, unit: &Unit, objects: &[ObjectEntry], workspace: &UnitWorkspace) -> Result<BuiltArchive> {
        check_object_keys(&unit.id, objects)?;
        let mut manifest = UnitManifest::new(unit, objects);
        workspace.save_manifest(&manifest)?;

        self.download(&mut manifest, workspace, |_| {}).await?;
        let built = self.seal(&manifest, workspace).await?;
        self.verify_local(&built.manifest, &built.parts, workspace).await?;
        Ok(built)
    }
}

/// Check every part's size and checksum on disk.
pub fn verify_parts(dir: &Path, parts: &[ArchivePart]) -> Result<()> {
    for part in parts {
        let path = dir.join(&part.name);
        let (sha256, size) = checksum_and_size(&path).map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                Error::not_found(format!("archive part {}", part.name))
            } else {
                Error::Io(e)
            }
        })?;
        if size != part.size {
            return Err(Error::data_integrity(
                &part.name,
                format!("size {} differs from sealed size {}", size, part.size),
            ));
        }
        if sha256 != part.sha256 {
            return Err(Error::data_integrity(&part.name, "checksum differs from sealed checksum"));
        }
    }
    Ok(())
}

/// Decode the parts in `dir` and unpack them into `dest`.
pub fn extract_parts(format: CompressionFormat, dir: &Path, parts: &[ArchivePart], dest: &Path) -> Result<()> {
    fs::create_dir_all(dest).map_err(Error::from_write)?;
    let subject = dir.display().to_string();
    if !format.is_tar() {
        return with_joined_zip(dir, parts, &scratch_file(dest, ".joined.zip"), &subject, |archive| {
            archive
                .extract(dest)
                .map_err(|e| Error::data_integrity(&subject, format!("extraction failed: {}", e)))
        });
    }
    let reader = decoder(format, PartsReader::for_parts(dir, parts))?;
    Archive::new(reader)
        .unpack(dest)
        .map_err(|e| Error::data_integrity(&subject, format!("extraction failed: {}", e)))
}

/// Number of entries in the sealed stream, reading each zip entry through
/// so its CRC is checked.
fn count_entries(format: CompressionFormat, dir: &Path, parts: &[ArchivePart], unit_id: &str) -> Result<usize> {
    if !format.is_tar() {
        return with_joined_zip(dir, parts, &scratch_file(dir, ".joined.zip"), unit_id, |archive| {
            for index in 0..archive.len() {
                let mut entry = archive.by_index(index).map_err(|e| corrupt_entry(unit_id, e))?;
                io::copy(&mut entry, &mut io::sink()).map_err(|e| corrupt_entry(unit_id, e))?;
            }
            Ok(archive.len())
        });
    }

    let reader = decoder(format, PartsReader::for_parts(dir, parts))?;
    let mut archive = Archive::new(reader);
    let mut entries = 0usize;
    for entry in archive
        .entries()
        .map_err(|e| Error::data_integrity(unit_id, format!("unreadable archive: {}", e)))?
    {
        entry.map_err(|e| corrupt_entry(unit_id, e))?;
        entries += 1;
    }
    Ok(entries)
}

fn corrupt_entry(unit_id: &str, err: impl std::fmt::Display) -> Error {
    Error::data_integrity(unit_id, format!("corrupt entry: {}", err))
}

/// Path next to `beside` for a short-lived working file
fn scratch_file(beside: &Path, suffix: &str) -> PathBuf {
    let mut name = beside.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

/// Join the parts into one seekable file at `scratch` and open it as a zip.
///
/// The central directory sits at the end of the container, so zip parts
/// cannot be read as a stream. `scratch` is removed afterwards.
fn with_joined_zip<T>(
    dir: &Path,
    parts: &[ArchivePart],
    scratch: &Path,
    subject: &str,
    f: impl FnOnce(&mut ZipArchive<File>) -> Result<T>,
) -> Result<T> {
    let result = open_joined_zip(dir, parts, scratch, subject).and_then(|mut archive| f(&mut archive));
    let _ = fs::remove_file(scratch);
    result
}

fn open_joined_zip(dir: &Path, parts: &[ArchivePart], scratch: &Path, subject: &str) -> Result<ZipArchive<File>> {
    let mut file = File::options()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(scratch)
        .map_err(Error::from_write)?;
    io::copy(&mut PartsReader::for_parts(dir, parts), &mut file)?;
    file.seek(SeekFrom::Start(0))?;
    ZipArchive::new(file).map_err(|e| Error::data_integrity(subject, format!("unreadable archive: {}", e)))
}

fn seal_error(err: io::Error) -> Error {
    match Error::from_write(err) {
        Error::Io(err) => Error::compression_failed(err.to_string()),
        other => other,
    }
}

fn zip_error(err: ZipError) -> Error {
    match err {
        ZipError::Io(err) => seal_error(err),
        other => Error::compression_failed(other.to_string()),
    }
}

fn write_archive(
    manifest: &UnitManifest,
    objects_dir: &Path,
    parts_dir: &Path,
    settings: &ArchiveSettings,
    cancel: &CancellationToken,
) -> Result<SplitOutput> {
    if !settings.compression.is_tar() {
        return write_zip(manifest, objects_dir, parts_dir, settings, cancel);
    }

    let writer = PartWriter::new(
        parts_dir,
        settings.compression.extension(),
        &manifest.unit.id,
        settings.split_threshold_bytes,
    )
    .map_err(seal_error)?;
    let encoder = ArchiveEncoder::new(settings.compression, settings.compression_level, writer)
        .map_err(seal_error)?;
    let mut tar = TarBuilder::new(encoder);

    // Manifest is always the first entry
    let manifest_bytes = manifest.to_json()?;
    let mut header = Header::new_gnu();
    header.set_size(manifest_bytes.len() as u64);
    header.set_mode(0o644);
    header.set_mtime(manifest.enumerated_at.timestamp().max(0) as u64);
    tar.append_data(&mut header, MANIFEST_FILENAME, manifest_bytes.as_slice())
        .map_err(seal_error)?;

    for object in &manifest.objects {
        cancel.check()?;
        let rel = relative_object_path(&object.path)?;
        tar.append_path_with_name(objects_dir.join(&rel), &rel)
            .map_err(seal_error)?;
    }

    let encoder = tar.into_inner().map_err(seal_error)?;
    let writer = encoder.finish().map_err(seal_error)?;
    writer.finish().map_err(seal_error)
}

/// Build the zip in a staging file, then split it into parts.
///
/// Zip writes its central directory last and needs to seek back over the
/// local headers, so it cannot stream straight into the part writer.
fn write_zip(
    manifest: &UnitManifest,
    objects_dir: &Path,
    parts_dir: &Path,
    settings: &ArchiveSettings,
    cancel: &CancellationToken,
) -> Result<SplitOutput> {
    let staging = scratch_file(parts_dir, ".staging.zip");
    let result = stage_zip(manifest, objects_dir, &staging, settings, cancel).and_then(|mut file| {
        let mut writer = PartWriter::new(
            parts_dir,
            settings.compression.extension(),
            &manifest.unit.id,
            settings.split_threshold_bytes,
        )
        .map_err(seal_error)?;
        io::copy(&mut file, &mut writer).map_err(seal_error)?;
        writer.finish().map_err(seal_error)
    });
    let _ = fs::remove_file(&staging);
    result
}

fn stage_zip(
    manifest: &UnitManifest,
    objects_dir: &Path,
    staging: &Path,
    settings: &ArchiveSettings,
    cancel: &CancellationToken,
) -> Result<File> {
    if let Some(parent) = staging.parent() {
        fs::create_dir_all(parent).map_err(seal_error)?;
    }
    let file = File::options()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(staging)
        .map_err(seal_error)?;
    let mut zip = ZipWriter::new(file);
    let options = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .compression_level(Some(i64::from(settings.compression_level)));

    // Manifest is always the first entry
    let manifest_bytes = manifest.to_json()?;
    zip.start_file(MANIFEST_FILENAME, options).map_err(zip_error)?;
    zip.write_all(&manifest_bytes).map_err(seal_error)?;

    for object in &manifest.objects {
        cancel.check()?;
        let rel = relative_object_path(&object.path)?;
        let name = rel
            .iter()
            .map(|c| c.to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        let mut source = File::open(objects_dir.join(&rel)).map_err(seal_error)?;
        let size = source.metadata().map_err(seal_error)?.len();
        zip.start_file(name, options.large_file(size >= u64::from(u32::MAX)))
            .map_err(zip_error)?;
        io::copy(&mut source, &mut zip).map_err(seal_error)?;
    }

    let mut file = zip.finish().map_err(zip_error)?;
    file.seek(SeekFrom::Start(0)).map_err(seal_error)?;
    Ok(file)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::LocalSourceStore;
    use rand::{Rng, SeedableRng};
    use std::io::Read;
    use tempfile::TempDir;

    fn random_bytes(len: usize, seed: u64) -> Vec<u8> {
        let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
        let mut data = vec![0u8; len];
        rng.fill(&mut data[..]);
        data
    }

    fn create_source() -> TempDir {
        let temp = TempDir::new().unwrap();
        let unit = temp.path().join("media");
        fs::create_dir_all(unit.join("raw")).unwrap();
        fs::write(unit.join("raw/a.bin"), random_bytes(20_000, 1)).unwrap();
        fs::write(unit.join("raw/b.bin"), random_bytes(15_000, 2)).unwrap();
        fs::write(unit.join("notes.txt"), b"hello archive").unwrap();
        temp
    }

    fn builder(source_root: &Path, format: CompressionFormat, threshold: u64) -> ArchiveBuilder {
        let source: Arc<dyn SourceStore> = Arc::new(LocalSourceStore::new(source_root));
        let config = ArchiveConfig::from_config(&FerryConfig::default())
            .with_threshold(threshold)
            .with_format(format, 6);
        ArchiveBuilder::new(source, config)
    }

    async fn build_media(builder: &ArchiveBuilder, scratch: &Path) -> (BuiltArchive, UnitWorkspace) {
        let source = builder.source.clone();
        let unit = source
            .list_units()
            .await
            .unwrap()
            .into_iter()
            .find(|u| u.id == "media")
            .unwrap();
        let objects = source.list_objects("media").await.unwrap();
        let workspace = UnitWorkspace::new(scratch, "media");
        let built = builder.build(&unit, &objects, &workspace).await.unwrap();
        (built, workspace)
    }

    #[tokio::test]
    async fn test_build_split_tar_part_count() {
        let source = create_source();
        let scratch = TempDir::new().unwrap();
        let builder = builder(source.path(), CompressionFormat::Tar, 8_192);

        let (built, workspace) = build_media(&builder, scratch.path()).await;

        // Uncompressed stream: part count is exactly ceil(S / T)
        let expected = built.total_bytes.div_ceil(8_192) as usize;
        assert_eq!(built.parts.len(), expected);
        assert!(built.parts.len() > 1);
        assert_eq!(built.parts[0].name, "archive.tar.001");
        for part in &built.parts[..built.parts.len() - 1] {
            assert_eq!(part.size, 8_192);
        }

        let mut stream = Vec::new();
        PartsReader::for_parts(&workspace.parts_dir(), &built.parts)
            .read_to_end(&mut stream)
            .unwrap();
        assert_eq!(stream.len() as u64, built.total_bytes);
    }

    #[tokio::test]
    async fn test_build_records_hashes_and_archive_info() {
        let source = create_source();
        let scratch = TempDir::new().unwrap();
        let builder = builder(source.path(), CompressionFormat::TarGz, 1024 * 1024);

        let (built, workspace) = build_media(&builder, scratch.path()).await;
        assert_eq!(built.parts.len(), 1);
        assert_eq!(built.parts[0].name, "archive.tar.gz");
        assert!(built.manifest.objects.iter().all(|o| o.sha256.is_some()));

        let saved = workspace.load_manifest().unwrap().unwrap();
        assert_eq!(saved.archive.unwrap().sha256, built.sha256);
    }

    #[tokio::test]
    async fn test_extract_roundtrip_with_zstd() {
        let source = create_source();
        let scratch = TempDir::new().unwrap();
        let builder = builder(source.path(), CompressionFormat::TarZst, 4_096);

        let (built, workspace) = build_media(&builder, scratch.path()).await;
        let dest = workspace.extract_dir();
        extract_parts(CompressionFormat::TarZst, &workspace.parts_dir(), &built.parts, &dest).unwrap();

        assert_eq!(
            fs::read(dest.join("raw/a.bin")).unwrap(),
            fs::read(source.path().join("media/raw/a.bin")).unwrap()
        );
        assert!(dest.join(MANIFEST_FILENAME).exists());
    }

    #[tokio::test]
    async fn test_zip_parts_extract_and_leave_no_staging() {
        let source = create_source();
        let scratch = TempDir::new().unwrap();
        let builder = builder(source.path(), CompressionFormat::Zip, 4_096);

        let (built, workspace) = build_media(&builder, scratch.path()).await;
        assert!(built.parts.len() > 1);
        assert_eq!(built.parts[0].name, "archive.zip.001");
        assert!(!scratch_file(&workspace.parts_dir(), ".staging.zip").exists());
        assert!(!scratch_file(&workspace.parts_dir(), ".joined.zip").exists());

        let dest = workspace.extract_dir();
        extract_parts(CompressionFormat::Zip, &workspace.parts_dir(), &built.parts, &dest).unwrap();
        assert_eq!(
            fs::read(dest.join("raw/b.bin")).unwrap(),
            fs::read(source.path().join("media/raw/b.bin")).unwrap()
        );
        assert_eq!(fs::read(dest.join("notes.txt")).unwrap(), b"hello archive");
        let manifest = UnitManifest::read_from(&dest.join(MANIFEST_FILENAME)).unwrap();
        assert_eq!(manifest.objects.len(), 3);
    }

    #[tokio::test]
    async fn test_zip_entry_count_is_checked() {
        let source = create_source();
        let scratch = TempDir::new().unwrap();
        let builder = builder(source.path(), CompressionFormat::Zip, 1024 * 1024);

        let (built, workspace) = build_media(&builder, scratch.path()).await;
        let mut manifest = built.manifest.clone();
        manifest.objects.pop();

        let err = builder
            .verify_local(&manifest, &built.parts, &workspace)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DataIntegrity { .. }));
    }

    #[tokio::test]
    async fn test_verify_local_detects_corrupt_part() {
        let source = create_source();
        let scratch = TempDir::new().unwrap();
        let builder = builder(source.path(), CompressionFormat::Tar, 8_192);

        let (built, workspace) = build_media(&builder, scratch.path()).await;
        let victim = workspace.parts_dir().join(&built.parts[1].name);
        let mut bytes = fs::read(&victim).unwrap();
        bytes[10] ^= 0xff;
        fs::write(&victim, bytes).unwrap();

        let err = builder
            .verify_local(&built.manifest, &built.parts, &workspace)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DataIntegrity { .. }));
    }

    #[tokio::test]
    async fn test_download_is_idempotent() {
        let source = create_source();
        let scratch = TempDir::new().unwrap();
        let builder = builder(source.path(), CompressionFormat::TarGz, 1024 * 1024);
        let unit = builder.source.list_units().await.unwrap().remove(0);
        let workspace = UnitWorkspace::new(scratch.path(), &unit.id);

        let mut manifest = builder.enumerate(&unit, &workspace).await.unwrap();
        let first = builder.download(&mut manifest, &workspace, |_| {}).await.unwrap();
        assert!(first.iter().all(|f| !f.reused));

        let second = builder.download(&mut manifest, &workspace, |_| {}).await.unwrap();
        assert!(second.iter().all(|f| f.reused));
        assert_eq!(first.len(), second.len());
    }

    #[tokio::test]
    async fn test_seal_respects_cancellation() {
        let source = create_source();
        let scratch = TempDir::new().unwrap();
        let cancel = CancellationToken::new();
        let builder = builder(source.path(), CompressionFormat::Tar, 8_192)
            .with_cancellation(cancel.clone());
        let unit = builder.source.list_units().await.unwrap().remove(0);
        let workspace = UnitWorkspace::new(scratch.path(), &unit.id);

        let mut manifest = builder.enumerate(&unit, &workspace).await.unwrap();
        builder.download(&mut manifest, &workspace, |_| {}).await.unwrap();

        cancel.cancel();
        let err = builder.seal(&manifest, &workspace).await.unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert!(!workspace.parts_dir().exists());
    }

    #[test]
    fn test_workspace_sanitizes_unit_ids() {
        let workspace = UnitWorkspace::new(Path::new("/scratch"), "team/bucket one");
        assert_eq!(workspace.root(), Path::new("/scratch/team_bucket_one"));
    }

    #[test]
    fn test_format_level_is_clamped() {
        let config = ArchiveConfig::from_config(&FerryConfig::default())
            .with_format(CompressionFormat::TarGz, 15);
        assert_eq!(config.settings.compression_level, 9);
    }
}
