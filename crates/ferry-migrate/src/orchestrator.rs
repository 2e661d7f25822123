//! Migration orchestration
//!
//! Each unit is driven through the progress state machine one stage at a
//! time, resuming from whatever state a previous run left it in. Units run
//! concurrently up to the configured worker count and never depend on one
//! another: a stage failure marks only that unit `FAILED`. Errors that make
//! further progress meaningless (progress cannot be persisted, a state
//! machine violation, an unreachable remote at start) end the run.

use crate::archive::{verify_parts, ArchiveBuilder, ArchiveConfig, UnitWorkspace};
use crate::manifest::{ArchivePart, UnitManifest};
use crate::progress_store::{ProgressRecord, ProgressStore, TransitionDetails, UnitStatus};
use crate::reporter::MigrationProgress;
use crate::space::{SpaceCheck, SpaceGuard};
use crate::store::{RemoteStore, SourceStore, Unit};
use crate::transfer::{RemoteLayout, TransferDownloader, TransferUploader};
use ferry_core::retry::retry_remote;
use ferry_core::types::{FerryConfig, RetryPolicy};
use ferry_core::{CancellationToken, Error, ErrorClass, Result};
use futures::stream::{self, StreamExt, TryStreamExt};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Units to migrate in one run
#[derive(Debug, Clone, Default)]
pub struct MigrationOptions {
    /// Restrict the run to these unit ids
    pub units: Option<Vec<String>>,
}

/// Why a unit ended `FAILED`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnitFailure {
    pub unit_id: String,
    pub stage: String,
    pub class: ErrorClass,
    pub message: String,
}

/// How one unit ended this run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum UnitOutcome {
    /// Uploaded and finalized in this run
    Completed { parts: u32, archive_bytes: u64 },
    /// Already terminal before the run started
    AlreadyComplete,
    /// Remote copy found and adopted without transfer
    Adopted,
    Failed(UnitFailure),
    /// Cancelled mid-pipeline; resumes from `status` next run
    Interrupted { status: UnitStatus },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnitReport {
    pub unit_id: String,
    pub outcome: UnitOutcome,
}

/// Counts of a finished run
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    pub completed: usize,
    pub already_complete: usize,
    pub adopted: usize,
    pub failures: Vec<UnitFailure>,
    pub interrupted: Vec<String>,
    pub units: Vec<UnitReport>,
    #[serde(skip)]
    pub elapsed: Duration,
}

impl RunSummary {
    fn from_reports(mut units: Vec<UnitReport>, elapsed: Duration) -> Self {
        units.sort_by(|a, b| a.unit_id.cmp(&b.unit_id));
        let mut summary = RunSummary {
            elapsed,
            ..RunSummary::default()
        };
        for report in &units {
            match &report.outcome {
                UnitOutcome::Completed { .. } => summary.completed += 1,
                UnitOutcome::AlreadyComplete => summary.already_complete += 1,
                UnitOutcome::Adopted => summary.adopted += 1,
                UnitOutcome::Failed(failure) => summary.failures.push(failure.clone()),
                UnitOutcome::Interrupted { .. } => summary.interrupted.push(report.unit_id.clone()),
            }
        }
        summary.units = units;
        summary
    }

    pub fn failed(&self) -> usize {
        self.failures.len()
    }

    pub fn skipped(&self) -> usize {
        self.already_complete + self.adopted
    }

    /// Every unit reached a terminal, non-failed state
    pub fn is_success(&self) -> bool {
        self.failures.is_empty() && self.interrupted.is_empty()
    }

    pub fn outcome(&self, unit_id: &str) -> Option<&UnitOutcome> {
        self.units
            .iter()
            .find(|r| r.unit_id == unit_id)
            .map(|r| &r.outcome)
    }
}

/// Why a unit's pipeline stopped early
enum Halt {
    /// A stage failed; only this unit is affected
    Stage { stage: &'static str, error: Error },
    /// The run cannot continue
    Fatal(Error),
}

trait AtStage<T> {
    fn at(self, stage: &'static str) -> std::result::Result<T, Halt>;
}

impl<T> AtStage<T> for Result<T> {
    fn at(self, stage: &'static str) -> std::result::Result<T, Halt> {
        self.map_err(|error| Halt::Stage { stage, error })
    }
}

type StageResult<T> = std::result::Result<T, Halt>;

/// Drives units from the source store to the remote store
pub struct MigrationOrchestrator {
    source: Arc<dyn SourceStore>,
    remote: Arc<dyn RemoteStore>,
    progress: Arc<ProgressStore>,
    builder: ArchiveBuilder,
    uploader: TransferUploader,
    inspector: TransferDownloader,
    space: SpaceGuard,
    scratch_dir: PathBuf,
    unit_workers: usize,
    list_policy: RetryPolicy,
    quota_policy: RetryPolicy,
    reporter: MigrationProgress,
    cancel: CancellationToken,
}

impl MigrationOrchestrator {
    pub fn new(
        config: &FerryConfig,
        source: Arc<dyn SourceStore>,
        remote: Arc<dyn RemoteStore>,
        progress: Arc<ProgressStore>,
    ) -> Self {
        let policies = &config.retry_policies;
        let layout = RemoteLayout::new(config.remote.root.clone());
        let scratch_dir = PathBuf::from(config.workspace.scratch_dir.as_std_path());

        Self {
            builder: ArchiveBuilder::new(source.clone(), ArchiveConfig::from_config(config)),
            uploader: TransferUploader::new(
                remote.clone(),
                layout.clone(),
                policies.policy_for("upload").clone(),
            ),
            inspector: TransferDownloader::new(
                remote.clone(),
                layout,
                policies.policy_for("list").clone(),
            ),
            space: SpaceGuard::new(scratch_dir.clone(), &config.space),
            scratch_dir,
            unit_workers: config.concurrency.unit_workers.max(1),
            list_policy: policies.policy_for("list").clone(),
            quota_policy: policies.policy_for("quota").clone(),
            reporter: MigrationProgress::new(),
            cancel: CancellationToken::new(),
            source,
            remote,
            progress,
        }
    }

    /// Replace the free-space guard
    pub fn with_space_guard(mut self, space: SpaceGuard) -> Self {
        self.space = space;
        self
    }

    /// Show or hide terminal progress
    pub fn with_progress(mut self, enabled: bool) -> Self {
        self.reporter = MigrationProgress::with_progress(enabled);
        self
    }

    /// Stop between stages, objects and parts once `cancel` fires
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.builder = self.builder.with_cancellation(cancel.clone());
        self.uploader = self.uploader.with_cancellation(cancel.clone());
        self.inspector = self.inspector.with_cancellation(cancel.clone());
        self.cancel = cancel;
        self
    }

    /// Migrate every selected unit, returning per-unit outcomes.
    pub async fn run(&self, options: &MigrationOptions) -> Result<RunSummary> {
        let started = Instant::now();

        info!("Stage 1/3: Listing units from {}", self.source.name());
        let free = retry_remote(&self.quota_policy, "quota", || self.remote.free_space_bytes()).await?;
        debug!(remote = %self.remote.name(), free_bytes = free, "Remote store reachable");

        let units = self.select_units(options).await?;
        for unit in &units {
            self.progress.ensure_unit(unit)?;
        }
        for unit in &units {
            if let Some(record) = self.progress.get(&unit.id) {
                if record.status == UnitStatus::Failed {
                    info!(
                        unit = %unit.id,
                        stage = record.failed_stage.as_deref().unwrap_or("unknown"),
                        "Retrying unit that failed previously"
                    );
                    self.progress.reset(&unit.id)?;
                }
            }
        }

        let interrupted = self.progress.interrupted_units();
        if !interrupted.is_empty() {
            info!("Resuming {} interrupted units", interrupted.len());
        }

        info!(
            "Stage 2/3: Migrating {} units with {} workers",
            units.len(),
            self.unit_workers
        );
        self.reporter.start(units.len() as u64, "Migrating");
        let reports: Vec<UnitReport> = stream::iter(units)
            .map(|unit| self.migrate_unit(unit))
            .buffer_unordered(self.unit_workers)
            .try_collect()
            .await
            .inspect_err(|_| self.reporter.finish_all("Aborted"))?;
        self.reporter.finish_all("Done");

        info!("Stage 3/3: Summarizing run");
        let summary = RunSummary::from_reports(reports, started.elapsed());
        info!(
            completed = summary.completed,
            skipped = summary.skipped(),
            failed = summary.failed(),
            interrupted = summary.interrupted.len(),
            elapsed_ms = summary.elapsed.as_millis() as u64,
            "Migration run finished"
        );
        for failure in &summary.failures {
            warn!(
                unit = %failure.unit_id,
                stage = %failure.stage,
                class = %failure.class,
                "{}",
                failure.message
            );
        }
        Ok(summary)
    }

    async fn select_units(&self, options: &MigrationOptions) -> Result<Vec<Unit>> {
        let mut units = retry_remote(&self.list_policy, "list", || self.source.list_units()).await?;
        if let Some(wanted) = &options.units {
            for id in wanted {
                if !units.iter().any(|u| &u.id == id) {
                    warn!(unit = %id, "Unit not found in {}", self.source.name());
                }
            }
            units.retain(|u| wanted.contains(&u.id));
        }
        debug!("Selected {} units", units.len());
        Ok(units)
    }

    async fn migrate_unit(&self, unit: Unit) -> Result<UnitReport> {
        let workspace = UnitWorkspace::new(&self.scratch_dir, &unit.id);
        let outcome = match self.drive(&unit, &workspace).await {
            Ok(outcome) => outcome,
            Err(Halt::Fatal(error)) => return Err(error),
            Err(Halt::Stage {
                error: Error::Cancelled,
                stage,
            }) => {
                let status = self
                    .progress
                    .get(&unit.id)
                    .map(|r| r.status)
                    .unwrap_or(UnitStatus::Pending);
                info!(unit = %unit.id, stage, "Interrupted; resumes from {} next run", status);
                UnitOutcome::Interrupted { status }
            }
            Err(Halt::Stage { error, .. }) if error.is_fatal() => return Err(error),
            Err(Halt::Stage { stage, error }) => self.fail_unit(&unit, &workspace, stage, error)?,
        };
        self.reporter.finish_unit(&unit.id);
        Ok(UnitReport {
            unit_id: unit.id,
            outcome,
        })
    }

    fn fail_unit(
        &self,
        unit: &Unit,
        workspace: &UnitWorkspace,
        stage: &'static str,
        error: Error,
    ) -> Result<UnitOutcome> {
        warn!(unit = %unit.id, stage, class = %error.class(), "Unit failed: {}", error);
        if let Some(hint) = error.remediation() {
            warn!(unit = %unit.id, "{}", hint);
        }
        self.progress
            .transition(&unit.id, UnitStatus::Failed, TransitionDetails::failure(stage, &error))?;
        if let Err(e) = workspace.remove() {
            warn!(unit = %unit.id, "Could not clean workspace: {}", e);
        }
        Ok(UnitOutcome::Failed(UnitFailure {
            unit_id: unit.id.clone(),
            stage: stage.to_string(),
            class: error.class(),
            message: error.to_string(),
        }))
    }

    fn advance(
        &self,
        unit_id: &str,
        next: UnitStatus,
        details: TransitionDetails,
    ) -> StageResult<ProgressRecord> {
        let record = self
            .progress
            .transition(unit_id, next, details)
            .map_err(Halt::Fatal)?;
        debug!(unit = %unit_id, status = %next, "Unit advanced");
        Ok(record)
    }

    /// Run the unit's remaining stages in order.
    async fn drive(&self, unit: &Unit, workspace: &UnitWorkspace) -> StageResult<UnitOutcome> {
        let mut record = self
            .progress
            .get(&unit.id)
            .ok_or_else(|| Halt::Fatal(Error::unknown_unit(&unit.id)))?;
        let mut space: Option<SpaceCheck> = None;
        let mut manifest: Option<UnitManifest> = None;

        loop {
            let stage = stage_name(record.status);
            if record.status.is_in_flight() || record.status == UnitStatus::Pending {
                self.cancel.check().at(stage)?;
                self.reporter.stage(&unit.id, stage);
            }

            record = match record.status {
                UnitStatus::Completed | UnitStatus::SkippedAlreadyComplete => {
                    debug!(unit = %unit.id, status = %record.status, "Nothing to do");
                    return Ok(UnitOutcome::AlreadyComplete);
                }
                UnitStatus::Failed => {
                    return Ok(UnitOutcome::Failed(UnitFailure {
                        unit_id: unit.id.clone(),
                        stage: record.failed_stage.clone().unwrap_or_default(),
                        class: ErrorClass::Other,
                        message: record.error.clone().unwrap_or_default(),
                    }));
                }
                UnitStatus::Pending => {
                    let remote = self.inspector.inspect_unit(&unit.id).await.at("inspect")?;
                    if remote.is_complete() {
                        self.advance(
                            &unit.id,
                            UnitStatus::SkippedAlreadyComplete,
                            TransitionDetails::snapshot(unit.clone())
                                .with_archive(remote.sealed_archive()),
                        )?;
                        info!(unit = %unit.id, "Remote copy already complete, adopted");
                        return Ok(UnitOutcome::Adopted);
                    }

                    manifest = Some(self.builder.enumerate(unit, workspace).await.at("enumerate")?);
                    self.advance(
                        &unit.id,
                        UnitStatus::Enumerated,
                        TransitionDetails::snapshot(unit.clone()),
                    )?
                }
                UnitStatus::Enumerated => {
                    space = Some(
                        self.space
                            .recheck_if_stale(space, unit.size_bytes)
                            .at("space")?,
                    );
                    self.advance(&unit.id, UnitStatus::Downloading, TransitionDetails::none())?
                }
                UnitStatus::Downloading => {
                    let mut current = self
                        .manifest_for(unit, workspace, manifest.take())
                        .await
                        .at("download")?;
                    let reporter = &self.reporter;
                    let fetched = AtomicU64::new(0);
                    self.builder
                        .download(&mut current, workspace, |bytes| {
                            let total = fetched.fetch_add(bytes, Ordering::Relaxed) + bytes;
                            reporter.stage(
                                &unit.id,
                                &format!("download {}/{} bytes", total, unit.size_bytes),
                            );
                        })
                        .await
                        .at("download")?;
                    manifest = Some(current);
                    self.advance(&unit.id, UnitStatus::Archiving, TransitionDetails::none())?
                }
                UnitStatus::Archiving => {
                    space = Some(
                        self.space
                            .recheck_if_stale(space, unit.size_bytes)
                            .at("space")?,
                    );
                    let current = self
                        .manifest_for(unit, workspace, manifest.take())
                        .await
                        .at("archive")?;
                    let built = self.builder.seal(&current, workspace).await.at("archive")?;
                    self.builder
                        .verify_local(&built.manifest, &built.parts, workspace)
                        .await
                        .at("verify-local")?;

                    let next = self.advance(
                        &unit.id,
                        UnitStatus::Uploading,
                        TransitionDetails::archive(built.sealed()),
                    )?;
                    workspace.remove_objects().at("verify-local")?;
                    manifest = Some(built.manifest);
                    next
                }
                UnitStatus::Uploading => {
                    return self.upload(unit, workspace, &record, manifest.take()).await;
                }
            };
        }
    }

    async fn manifest_for(
        &self,
        unit: &Unit,
        workspace: &UnitWorkspace,
        cached: Option<UnitManifest>,
    ) -> Result<UnitManifest> {
        if let Some(manifest) = cached {
            return Ok(manifest);
        }
        if let Some(manifest) = workspace.load_manifest()? {
            return Ok(manifest);
        }
        debug!(unit = %unit.id, "Workspace manifest missing, enumerating again");
        self.builder.enumerate(unit, workspace).await
    }

    /// Push the parts not yet confirmed, then the manifest.
    async fn upload(
        &self,
        unit: &Unit,
        workspace: &UnitWorkspace,
        record: &ProgressRecord,
        manifest: Option<UnitManifest>,
    ) -> StageResult<UnitOutcome> {
        let manifest = match manifest {
            Some(manifest) => manifest,
            None => workspace.load_manifest().at("upload")?.ok_or_else(|| Halt::Stage {
                stage: "upload",
                error: Error::not_found(format!("workspace manifest for {}", unit.id)),
            })?,
        };

        let pending: Vec<ArchivePart> = record.pending_parts().into_iter().cloned().collect();
        let parts_dir = workspace.parts_dir();
        verify_parts(&parts_dir, &pending).at("upload")?;

        let required: u64 = pending.iter().map(|p| p.size).sum();
        self.uploader.check_quota(required).await.at("upload")?;

        let mut persist_error: Option<Error> = None;
        let sent = self
            .uploader
            .upload_parts(&unit.id, &parts_dir, &record.parts, &record.uploaded_parts, |part| {
                self.progress
                    .record_part_uploaded(&unit.id, &part.name)
                    .map_err(|e| {
                        let message = e.to_string();
                        persist_error = Some(e);
                        Error::store("record upload", message)
                    })
            })
            .await;
        if let Some(error) = persist_error {
            return Err(Halt::Fatal(error));
        }
        let sent = sent.at("upload")?;
        self.reporter.stage(&unit.id, "finalizing");

        self.uploader
            .upload_manifest(&unit.id, &manifest)
            .await
            .at("finalize")?;
        let done = self.advance(&unit.id, UnitStatus::Completed, TransitionDetails::none())?;
        if let Err(e) = workspace.remove() {
            warn!(unit = %unit.id, "Could not clean workspace: {}", e);
        }

        info!(
            unit = %unit.id,
            parts = done.part_count,
            uploaded = sent,
            bytes = done.archive_bytes,
            "Unit migrated"
        );
        Ok(UnitOutcome::Completed {
            parts: done.part_count,
            archive_bytes: done.archive_bytes,
        })
    }
}

fn stage_name(status: UnitStatus) -> &'static str {
    match status {
        UnitStatus::Pending => "enumerate",
        UnitStatus::Enumerated => "space",
        UnitStatus::Downloading => "download",
        UnitStatus::Archiving => "archive",
        UnitStatus::Uploading => "upload",
        UnitStatus::Completed | UnitStatus::SkippedAlreadyComplete => "done",
        UnitStatus::Failed => "failed",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failure(unit: &str) -> UnitFailure {
        UnitFailure {
            unit_id: unit.into(),
            stage: "download".into(),
            class: ErrorClass::Other,
            message: "boom".into(),
        }
    }

    #[test]
    fn test_summary_counts() {
        let summary = RunSummary::from_reports(
            vec![
                UnitReport {
                    unit_id: "c".into(),
                    outcome: UnitOutcome::Completed {
                        parts: 2,
                        archive_bytes: 10,
                    },
                },
                UnitReport {
                    unit_id: "a".into(),
                    outcome: UnitOutcome::AlreadyComplete,
                },
                UnitReport {
                    unit_id: "b".into(),
                    outcome: UnitOutcome::Failed(failure("b")),
                },
                UnitReport {
                    unit_id: "d".into(),
                    outcome: UnitOutcome::Adopted,
                },
            ],
            Duration::from_secs(1),
        );

        assert_eq!(summary.completed, 1);
        assert_eq!(summary.skipped(), 2);
        assert_eq!(summary.failed(), 1);
        assert!(!summary.is_success());
        assert_eq!(summary.units[0].unit_id, "a");
        assert_eq!(summary.outcome("b"), Some(&UnitOutcome::Failed(failure("b"))));
    }

    #[test]
    fn test_interrupted_is_not_success() {
        let summary = RunSummary::from_reports(
            vec![UnitReport {
                unit_id: "a".into(),
                outcome: UnitOutcome::Interrupted {
                    status: UnitStatus::Uploading,
                },
            }],
            Duration::ZERO,
        );
        assert!(!summary.is_success());
        assert_eq!(summary.interrupted, vec!["a".to_string()]);
    }

    #[test]
    fn test_stage_names() {
        assert_eq!(stage_name(UnitStatus::Downloading), "download");
        assert_eq!(stage_name(UnitStatus::Uploading), "upload");
    }
}
