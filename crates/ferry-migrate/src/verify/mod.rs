//! Post-migration verification
//!
//! A verification run samples migrated units by size, fetches each sampled
//! unit's parts back from the remote store, checks the concatenated stream
//! against the length and checksum recorded at seal time, extracts it and
//! compares a size-stratified sample of files with the manifest taken at
//! enumeration. The run ends with an inventory cross-check and yields one
//! [`VerificationReport`].

pub mod report;

pub use report::{
    ArchiveOutcome, FileOutcome, InventoryCheck, ReportStore, UnitVerdict, UnitVerification,
    VerificationFinding, VerificationReport,
};

use crate::archive::{extract_parts, PartsReader, UnitWorkspace};
use crate::compression::ChecksumReader;
use crate::manifest::{ManifestObject, UnitManifest};
use crate::progress_store::{ProgressRecord, ProgressStore};
use crate::sampler::{StratifiedSampler, Stratum};
use crate::store::{relative_object_path, SourceStore};
use crate::transfer::TransferDownloader;
use ferry_core::retry::retry_remote;
use ferry_core::types::{RetryPolicy, VerificationConfig};
use ferry_core::{CancellationToken, Error, Result};
use std::collections::{BTreeSet, HashMap};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

/// Sample sizes and unit selection for one run
#[derive(Debug, Clone)]
pub struct VerificationOptions {
    /// Units drawn from the completed population
    pub unit_sample_size: usize,

    /// Files drawn per unit
    pub file_sample_size: usize,

    /// Verify exactly these units instead of sampling
    pub units: Option<Vec<String>>,
}

impl VerificationOptions {
    pub fn from_config(config: &VerificationConfig) -> Self {
        Self {
            unit_sample_size: config.unit_sample_size,
            file_sample_size: config.file_sample_size,
            units: None,
        }
    }
}

/// Verifies migrated units against their remote copies
pub struct VerificationEngine {
    source: Arc<dyn SourceStore>,
    downloader: TransferDownloader,
    progress: Arc<ProgressStore>,
    sampler: StratifiedSampler,
    scratch_dir: PathBuf,
    list_policy: RetryPolicy,
    cancel: CancellationToken,
}

impl VerificationEngine {
    pub fn new(
        source: Arc<dyn SourceStore>,
        downloader: TransferDownloader,
        progress: Arc<ProgressStore>,
        scratch_dir: impl Into<PathBuf>,
        list_policy: RetryPolicy,
    ) -> Self {
        Self {
            source,
            downloader,
            progress,
            sampler: StratifiedSampler::default(),
            scratch_dir: scratch_dir.into(),
            list_policy,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_sampler(mut self, sampler: StratifiedSampler) -> Self {
        self.sampler = sampler;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Run a verification pass
    pub async fn run(&self, options: &VerificationOptions) -> Result<VerificationReport> {
        let records = self.progress.records();
        let migrated: Vec<ProgressRecord> = records
            .iter()
            .filter(|r| r.is_migrated())
            .cloned()
            .collect();

        info!("Stage 1/3: Selecting units from {} migrated", migrated.len());
        let selection = self.select_units(&records, &migrated, options);

        info!("Stage 2/3: Verifying {} units", selection.len());
        let mut units = Vec::with_capacity(selection.len());
        for (index, selected) in selection.iter().enumerate() {
            self.cancel.check()?;
            let verification = match selected {
                Selected::Record(record, stratum) => {
                    info!(
                        unit = %record.unit_id,
                        "Verifying unit {}/{}",
                        index + 1,
                        selection.len()
                    );
                    self.verify_unit(record, *stratum, options.file_sample_size)
                        .await?
                }
                Selected::NotMigrated(unit_id, status) => {
                    warn!(unit = %unit_id, "Requested unit has not been migrated");
                    not_verifiable(unit_id, status)
                }
            };
            units.push(verification);
        }

        info!("Stage 3/3: Checking inventory");
        let inventory = self.inventory(&records).await?;

        let report = VerificationReport::new(migrated.len(), units, inventory);
        info!(
            passed = report.passed,
            units_passed = report.passed_count(),
            units_failed = report.failed_count(),
            "Verification finished"
        );
        Ok(report)
    }

    fn select_units(
        &self,
        records: &[ProgressRecord],
        migrated: &[ProgressRecord],
        options: &VerificationOptions,
    ) -> Vec<Selected> {
        match &options.units {
            Some(ids) => ids
                .iter()
                .map(|id| match migrated.iter().find(|r| &r.unit_id == id) {
                    Some(record) => Selected::Record(record.clone(), None),
                    None => {
                        let status = records
                            .iter()
                            .find(|r| &r.unit_id == id)
                            .map(|r| r.status.to_string());
                        Selected::NotMigrated(id.clone(), status)
                    }
                })
                .collect(),
            None => {
                let sample = self.sampler.sample(migrated, options.unit_sample_size);
                sample
                    .strata
                    .into_iter()
                    .flat_map(|s| {
                        let stratum = s.stratum;
                        s.selected
                            .into_iter()
                            .map(move |r| Selected::Record(r, Some(stratum)))
                    })
                    .collect()
            }
        }
    }

    /// Verify one migrated unit.
    ///
    /// Failures other than cancellation are recorded in the returned
    /// verification rather than propagated.
    pub async fn verify_unit(
        &self,
        record: &ProgressRecord,
        stratum: Option<Stratum>,
        file_sample_size: usize,
    ) -> Result<UnitVerification> {
        let mut result = UnitVerification {
            unit_id: record.unit_id.clone(),
            stratum,
            passed: false,
            archive_outcome: ArchiveOutcome::Unavailable,
            expected_bytes: record.archive_bytes,
            observed_bytes: None,
            expected_sha256: record.archive_checksum.clone(),
            observed_sha256: None,
            files_total: 0,
            findings: Vec::new(),
            error: None,
        };

        let workspace = UnitWorkspace::new(&self.scratch_dir.join("verify"), &record.unit_id);
        let outcome = self
            .check_unit(record, file_sample_size, &workspace, &mut result)
            .await;
        if let Err(e) = workspace.remove() {
            warn!(unit = %record.unit_id, "Failed to clean verification scratch: {}", e);
        }

        match outcome {
            Ok(()) => {}
            Err(Error::Cancelled) => return Err(Error::Cancelled),
            Err(e) => {
                warn!(unit = %record.unit_id, stage = "verify", "Verification failed: {}", e);
                result.error = Some(e.to_string());
            }
        }

        result.passed = result.error.is_none()
            && result.archive_outcome == ArchiveOutcome::Match
            && result.mismatches().next().is_none();
        if !result.passed {
            warn!(
                unit = %record.unit_id,
                archive = ?result.archive_outcome,
                mismatched_files = result.mismatches().count(),
                "Unit failed verification"
            );
        }
        Ok(result)
    }

    async fn check_unit(
        &self,
        record: &ProgressRecord,
        file_sample_size: usize,
        workspace: &UnitWorkspace,
        result: &mut UnitVerification,
    ) -> Result<()> {
        let manifest = self.downloader.fetch_manifest(&record.unit_id).await?;
        result.files_total = manifest.objects.len();
        let format = manifest
            .archive
            .as_ref()
            .map(|a| a.format)
            .ok_or_else(|| Error::data_integrity(&record.unit_id, "remote manifest has no archive description"))?;

        let parts_dir = workspace.parts_dir();
        match self
            .downloader
            .fetch_parts(&record.unit_id, &record.parts, &parts_dir)
            .await
        {
            Ok(_) => {}
            Err(Error::DataIntegrity { message, .. }) => {
                result.archive_outcome = ArchiveOutcome::LengthMismatch;
                warn!(unit = %record.unit_id, "Remote part length differs: {}", message);
                return Ok(());
            }
            Err(e) => return Err(e),
        }

        let (sha256, length) = hash_stream(&parts_dir, record).await?;
        result.observed_bytes = Some(length);
        result.observed_sha256 = Some(sha256.clone());
        if length != record.archive_bytes {
            result.archive_outcome = ArchiveOutcome::LengthMismatch;
            return Ok(());
        }
        if record.archive_checksum.as_deref() != Some(sha256.as_str()) {
            result.archive_outcome = ArchiveOutcome::ChecksumMismatch;
            return Ok(());
        }
        result.archive_outcome = ArchiveOutcome::Match;

        let extract_dir = workspace.extract_dir();
        {
            let parts_dir = parts_dir.clone();
            let extract_dir = extract_dir.clone();
            let parts = record.parts.clone();
            tokio::task::spawn_blocking(move || extract_parts(format, &parts_dir, &parts, &extract_dir))
                .await
                .map_err(|e| Error::store("extract archive", e.to_string()))??;
        }

        let live = self.live_sizes(&record.unit_id).await;
        let sampled: Vec<ManifestObject> = self
            .sampler
            .sample(&manifest.objects, file_sample_size)
            .into_items();
        result.findings = compare_files(&extract_dir, &manifest, sampled, live).await?;
        Ok(())
    }

    async fn live_sizes(&self, unit_id: &str) -> Option<HashMap<String, u64>> {
        match retry_remote(&self.list_policy, "list", || self.source.list_objects(unit_id)).await {
            Ok(objects) => Some(objects.into_iter().map(|o| (o.path, o.size)).collect()),
            Err(e) => {
                warn!(unit = %unit_id, "Cannot list source objects for drift check: {}", e);
                None
            }
        }
    }

    /// Cross-check source units, records and remote folders
    pub async fn inventory(&self, records: &[ProgressRecord]) -> Result<InventoryCheck> {
        let source_units: BTreeSet<String> =
            retry_remote(&self.list_policy, "list", || self.source.list_units())
                .await?
                .into_iter()
                .map(|u| u.id)
                .collect();
        let folders = self.downloader.list_unit_folders().await?;

        let migrated: BTreeSet<&str> = records
            .iter()
            .filter(|r| r.status.is_terminal())
            .map(|r| r.unit_id.as_str())
            .collect();

        Ok(InventoryCheck {
            missing_in_remote: records
                .iter()
                .filter(|r| r.is_migrated() && !folders.contains(&r.unit_id))
                .map(|r| r.unit_id.clone())
                .collect(),
            unmigrated: source_units
                .iter()
                .filter(|id| !migrated.contains(id.as_str()))
                .cloned()
                .collect(),
            extra_in_remote: folders
                .iter()
                .filter(|f| !source_units.contains(*f))
                .cloned()
                .collect(),
        })
    }
}

enum Selected {
    Record(ProgressRecord, Option<Stratum>),
    NotMigrated(String, Option<String>),
}

fn not_verifiable(unit_id: &str, status: &Option<String>) -> UnitVerification {
    let reason = match status {
        Some(status) => format!("unit is {} with no archive on record", status),
        None => "unit has no progress record".to_string(),
    };
    UnitVerification {
        unit_id: unit_id.to_string(),
        stratum: None,
        passed: false,
        archive_outcome: ArchiveOutcome::Unavailable,
        expected_bytes: 0,
        observed_bytes: None,
        expected_sha256: None,
        observed_sha256: None,
        files_total: 0,
        findings: Vec::new(),
        error: Some(reason),
    }
}

async fn hash_stream(parts_dir: &Path, record: &ProgressRecord) -> Result<(String, u64)> {
    let reader = PartsReader::for_parts(parts_dir, &record.parts);
    tokio::task::spawn_blocking(move || {
        let mut reader = ChecksumReader::new(reader);
        io::copy(&mut reader, &mut io::sink())?;
        Ok::<_, Error>(reader.finish())
    })
    .await
    .map_err(|e| Error::store("hash archive", e.to_string()))?
}

async fn compare_files(
    extract_dir: &Path,
    manifest: &UnitManifest,
    sampled: Vec<ManifestObject>,
    live: Option<HashMap<String, u64>>,
) -> Result<Vec<VerificationFinding>> {
    let extract_dir = extract_dir.to_path_buf();
    let unit_id = manifest.unit.id.clone();
    tokio::task::spawn_blocking(move || {
        sampled
            .into_iter()
            .map(|object| {
                let live_size = live.as_ref().and_then(|l| l.get(&object.path).copied());
                let finding = compare_file(&extract_dir, &object, live_size);
                if finding.source_drift {
                    warn!(unit = %unit_id, object = %object.path, "Source object changed since migration");
                }
                finding
            })
            .collect()
    })
    .await
    .map_err(|e| Error::store("compare files", e.to_string()))
}

fn compare_file(extract_dir: &Path, object: &ManifestObject, live_size: Option<u64>) -> VerificationFinding {
    let observed = relative_object_path(&object.path)
        .ok()
        .map(|rel| extract_dir.join(rel))
        .filter(|path| path.is_file())
        .and_then(|path| crate::compression::checksum_and_size(&path).ok());

    let outcome = match &observed {
        None => FileOutcome::MissingInArchive,
        Some((_, size)) if *size != object.size => FileOutcome::SizeMismatch,
        Some((sha, _)) if object.sha256.as_deref().is_some_and(|expected| expected != sha) => {
            FileOutcome::ChecksumMismatch
        }
        Some(_) => FileOutcome::Match,
    };

    VerificationFinding {
        path: object.path.clone(),
        expected_size: object.size,
        expected_sha256: object.sha256.clone(),
        observed_size: observed.as_ref().map(|(_, size)| *size),
        observed_sha256: observed.map(|(sha, _)| sha),
        outcome,
        live_source_size: live_size,
        source_drift: live_size.is_some_and(|size| size != object.size),
    }
}
