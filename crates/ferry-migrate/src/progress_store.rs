//! Durable per-unit migration state
//!
//! Every unit moves through
//! `PENDING -> ENUMERATED -> DOWNLOADING -> ARCHIVING -> UPLOADING -> COMPLETED`.
//! `FAILED` is reachable from every non-terminal state and
//! `SKIPPED_ALREADY_COMPLETE` short-cuts a `PENDING` unit whose remote copy
//! already exists. The only backward move is `FAILED -> PENDING` through
//! [`ProgressStore::reset`].
//!
//! The whole document is rewritten after every transition: the new content
//! goes to a temporary sibling, is synced, and then renamed over the old
//! file while an exclusive lock is held on a sidecar lock file.

use crate::manifest::ArchivePart;
use crate::store::Unit;
use chrono::{DateTime, Utc};
use ferry_core::{Error, Result};
use fs4::fs_std::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tokio::runtime::{Handle, RuntimeFlavor};
use tracing::debug;

/// Version of the progress document format
pub const PROGRESS_VERSION: u32 = 1;

/// Migration state of one unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UnitStatus {
    Pending,
    Enumerated,
    Downloading,
    Archiving,
    Uploading,
    Completed,
    Failed,
    SkippedAlreadyComplete,
}

impl UnitStatus {
    /// Every status in pipeline order
    pub const ALL: [UnitStatus; 8] = [
        UnitStatus::Pending,
        UnitStatus::Enumerated,
        UnitStatus::Downloading,
        UnitStatus::Archiving,
        UnitStatus::Uploading,
        UnitStatus::Completed,
        UnitStatus::Failed,
        UnitStatus::SkippedAlreadyComplete,
    ];

    /// No further transition is possible
    pub fn is_terminal(&self) -> bool {
        matches!(self, UnitStatus::Completed | UnitStatus::SkippedAlreadyComplete)
    }

    /// A unit left here by a previous run was interrupted mid-pipeline
    pub fn is_in_flight(&self) -> bool {
        matches!(
            self,
            UnitStatus::Enumerated
                | UnitStatus::Downloading
                | UnitStatus::Archiving
                | UnitStatus::Uploading
        )
    }

    /// Whether `next` may follow `self`
    pub fn can_transition_to(&self, next: UnitStatus) -> bool {
        use UnitStatus::*;
        match (self, next) {
            (Pending, Enumerated)
            | (Enumerated, Downloading)
            | (Downloading, Archiving)
            | (Archiving, Uploading)
            | (Uploading, Completed)
            | (Pending, SkippedAlreadyComplete) => true,
            (from, Failed) => !from.is_terminal() && *from != Failed,
            _ => false,
        }
    }

    /// Wire name, e.g. `DOWNLOADING`
    pub fn as_str(&self) -> &'static str {
        match self {
            UnitStatus::Pending => "PENDING",
            UnitStatus::Enumerated => "ENUMERATED",
            UnitStatus::Downloading => "DOWNLOADING",
            UnitStatus::Archiving => "ARCHIVING",
            UnitStatus::Uploading => "UPLOADING",
            UnitStatus::Completed => "COMPLETED",
            UnitStatus::Failed => "FAILED",
            UnitStatus::SkippedAlreadyComplete => "SKIPPED_ALREADY_COMPLETE",
        }
    }
}

impl fmt::Display for UnitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Durable record of one unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressRecord {
    pub unit_id: String,
    pub status: UnitStatus,

    /// Unit metadata as last enumerated
    pub snapshot: Unit,

    #[serde(default)]
    pub part_count: u32,

    /// Length of the concatenated archive stream
    #[serde(default)]
    pub archive_bytes: u64,

    /// Hex SHA-256 of the concatenated archive stream
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archive_checksum: Option<String>,

    /// Sealed parts in sequence order
    #[serde(default)]
    pub parts: Vec<ArchivePart>,

    /// Part names confirmed on the remote store
    #[serde(default)]
    pub uploaded_parts: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Stage that was running when the unit failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_stage: Option<String>,

    pub updated_at: DateTime<Utc>,
}

impl ProgressRecord {
    fn new(unit: &Unit) -> Self {
        Self {
            unit_id: unit.id.clone(),
            status: UnitStatus::Pending,
            snapshot: unit.clone(),
            part_count: 0,
            archive_bytes: 0,
            archive_checksum: None,
            parts: Vec::new(),
            uploaded_parts: Vec::new(),
            error: None,
            failed_stage: None,
            updated_at: Utc::now(),
        }
    }

    /// Migrated with archive details on record.
    ///
    /// True for `COMPLETED` units and for units adopted from a complete
    /// remote copy whose manifest described the archive.
    pub fn is_migrated(&self) -> bool {
        self.status.is_terminal() && self.archive_checksum.is_some() && !self.parts.is_empty()
    }

    /// Parts not yet confirmed on the remote store
    pub fn pending_parts(&self) -> Vec<&ArchivePart> {
        self.parts
            .iter()
            .filter(|p| !self.uploaded_parts.contains(&p.name))
            .collect()
    }

    fn clear_archive(&mut self) {
        self.part_count = 0;
        self.archive_bytes = 0;
        self.archive_checksum = None;
        self.parts.clear();
        self.uploaded_parts.clear();
    }
}

/// Optional fields carried by a transition
#[derive(Debug, Clone, Default)]
pub struct TransitionDetails {
    /// Refreshed unit metadata (enumeration)
    pub snapshot: Option<Unit>,

    /// Sealed archive description (archive stage)
    pub archive: Option<SealedArchive>,

    /// Failure message
    pub error: Option<String>,

    /// Stage that failed
    pub stage: Option<String>,
}

/// Archive fields recorded when a unit leaves the archive stage
#[derive(Debug, Clone)]
pub struct SealedArchive {
    pub parts: Vec<ArchivePart>,
    pub total_bytes: u64,
    pub sha256: String,
}

impl TransitionDetails {
    /// No extra fields
    pub fn none() -> Self {
        Self::default()
    }

    /// Attach a failure
    pub fn failure(stage: impl Into<String>, error: impl fmt::Display) -> Self {
        Self {
            error: Some(error.to_string()),
            stage: Some(stage.into()),
            ..Self::default()
        }
    }

    /// Attach a fresh unit snapshot
    pub fn snapshot(unit: Unit) -> Self {
        Self {
            snapshot: Some(unit),
            ..Self::default()
        }
    }

    /// Attach a sealed archive
    pub fn archive(archive: SealedArchive) -> Self {
        Self {
            archive: Some(archive),
            ..Self::default()
        }
    }

    /// Also attach an archive, when one is known
    pub fn with_archive(mut self, archive: Option<SealedArchive>) -> Self {
        self.archive = archive;
        self
    }
}

/// Counts and totals across all records
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProgressSummary {
    pub by_status: BTreeMap<String, usize>,
    pub total_units: usize,
    pub total_objects: u64,
    pub original_bytes: u64,
    pub archived_bytes: u64,
}

impl ProgressSummary {
    /// Number of units with `status`
    pub fn count(&self, status: UnitStatus) -> usize {
        self.by_status.get(status.as_str()).copied().unwrap_or(0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ProgressDocument {
    version: u32,
    updated_at: DateTime<Utc>,
    units: BTreeMap<String, ProgressRecord>,
}

impl Default for ProgressDocument {
    fn default() -> Self {
        Self {
            version: PROGRESS_VERSION,
            updated_at: Utc::now(),
            units: BTreeMap::new(),
        }
    }
}

/// Durable store of every unit's progress
///
/// Shared by unit workers through an `Arc`. Each mutation clones the
/// document, persists the clone and only then publishes it, so readers
/// never see state that is not on disk.
///
/// Mutations block on an fsync while holding the document lock. On a
/// multi-threaded runtime they run inside [`tokio::task::block_in_place`],
/// so the worker thread hands its other tasks off for that time.
#[derive(Debug)]
pub struct ProgressStore {
    path: PathBuf,
    document: Mutex<ProgressDocument>,
}

impl ProgressStore {
    /// Load the store at `path`, empty if no previous run left a file
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let document = if path.exists() {
            let content = fs::read_to_string(&path)?;
            if content.trim().is_empty() {
                ProgressDocument::default()
            } else {
                serde_json::from_str(&content)?
            }
        } else {
            ProgressDocument::default()
        };

        debug!("Loaded {} progress records from {}", document.units.len(), path.display());
        Ok(Self {
            path,
            document: Mutex::new(document),
        })
    }

    /// Location of the progress file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// All records, ordered by unit id
    pub fn records(&self) -> Vec<ProgressRecord> {
        self.read(|doc| doc.units.values().cloned().collect())
    }

    /// Record of one unit
    pub fn get(&self, unit_id: &str) -> Option<ProgressRecord> {
        self.read(|doc| doc.units.get(unit_id).cloned())
    }

    /// True only when the unit is `COMPLETED`
    pub fn is_complete(&self, unit_id: &str) -> bool {
        self.get(unit_id)
            .map(|r| r.status == UnitStatus::Completed)
            .unwrap_or(false)
    }

    /// Create a `PENDING` record on first sighting of a unit
    pub fn ensure_unit(&self, unit: &Unit) -> Result<ProgressRecord> {
        if let Some(existing) = self.get(&unit.id) {
            return Ok(existing);
        }
        self.mutate(|doc| {
            let record = doc
                .units
                .entry(unit.id.clone())
                .or_insert_with(|| ProgressRecord::new(unit));
            Ok(record.clone())
        })
    }

    /// Move a unit to `next`, persisting before returning
    pub fn transition(
        &self,
        unit_id: &str,
        next: UnitStatus,
        details: TransitionDetails,
    ) -> Result<ProgressRecord> {
        self.mutate(|doc| {
            let record = doc
                .units
                .get_mut(unit_id)
                .ok_or_else(|| Error::unknown_unit(unit_id))?;

            if !record.status.can_transition_to(next) {
                return Err(Error::invalid_transition(unit_id, record.status, next));
            }

            record.status = next;
            record.updated_at = Utc::now();
            if let Some(snapshot) = details.snapshot {
                record.snapshot = snapshot;
            }
            if let Some(archive) = details.archive {
                record.part_count = archive.parts.len() as u32;
                record.archive_bytes = archive.total_bytes;
                record.archive_checksum = Some(archive.sha256);
                record.parts = archive.parts;
                record.uploaded_parts.clear();
                if next == UnitStatus::SkippedAlreadyComplete {
                    // Adopted parts are already on the remote store
                    record.uploaded_parts = record.parts.iter().map(|p| p.name.clone()).collect();
                }
            }
            if next == UnitStatus::Failed {
                record.error = details.error;
                record.failed_stage = details.stage;
            } else {
                record.error = None;
                record.failed_stage = None;
            }
            Ok(record.clone())
        })
    }

    /// Mark one part as confirmed on the remote store
    pub fn record_part_uploaded(&self, unit_id: &str, part_name: &str) -> Result<()> {
        self.mutate(|doc| {
            let record = doc
                .units
                .get_mut(unit_id)
                .ok_or_else(|| Error::unknown_unit(unit_id))?;
            if record.status != UnitStatus::Uploading {
                return Err(Error::invalid_transition(
                    unit_id,
                    record.status,
                    format!("{} (part {})", UnitStatus::Uploading, part_name),
                ));
            }
            if !record.uploaded_parts.iter().any(|p| p == part_name) {
                record.uploaded_parts.push(part_name.to_string());
                record.updated_at = Utc::now();
            }
            Ok(())
        })
    }

    /// Send a `FAILED` unit back to `PENDING`, discarding archive details
    pub fn reset(&self, unit_id: &str) -> Result<ProgressRecord> {
        self.mutate(|doc| {
            let record = doc
                .units
                .get_mut(unit_id)
                .ok_or_else(|| Error::unknown_unit(unit_id))?;
            if record.status != UnitStatus::Failed {
                return Err(Error::invalid_transition(
                    unit_id,
                    record.status,
                    UnitStatus::Pending,
                ));
            }
            record.status = UnitStatus::Pending;
            record.error = None;
            record.failed_stage = None;
            record.clear_archive();
            record.updated_at = Utc::now();
            Ok(record.clone())
        })
    }

    /// Discard every record
    pub fn clear(&self) -> Result<()> {
        self.mutate(|doc| {
            doc.units.clear();
            Ok(())
        })
    }

    /// Units a previous run left mid-pipeline
    pub fn interrupted_units(&self) -> Vec<ProgressRecord> {
        self.read(|doc| {
            doc.units
                .values()
                .filter(|r| r.status.is_in_flight())
                .cloned()
                .collect()
        })
    }

    /// Counts per status and byte totals
    pub fn summary(&self) -> ProgressSummary {
        self.read(|doc| {
            let mut summary = ProgressSummary {
                total_units: doc.units.len(),
                ..ProgressSummary::default()
            };
            for status in UnitStatus::ALL {
                summary.by_status.insert(status.as_str().to_string(), 0);
            }
            for record in doc.units.values() {
                *summary
                    .by_status
                    .entry(record.status.as_str().to_string())
                    .or_insert(0) += 1;
                summary.total_objects += record.snapshot.object_count;
                summary.original_bytes += record.snapshot.size_bytes;
                summary.archived_bytes += record.archive_bytes;
            }
            summary
        })
    }

    fn read<T>(&self, f: impl FnOnce(&ProgressDocument) -> T) -> T {
        let guard = self.document.lock().unwrap_or_else(|e| e.into_inner());
        f(&guard)
    }

    fn mutate<T>(&self, f: impl FnOnce(&mut ProgressDocument) -> Result<T>) -> Result<T> {
        blocking_section(|| {
            let mut guard = self.document.lock().unwrap_or_else(|e| e.into_inner());
            let mut next = guard.clone();
            let value = f(&mut next)?;
            next.updated_at = Utc::now();
            self.persist(&next)?;
            *guard = next;
            Ok(value)
        })
    }

    fn persist(&self, document: &ProgressDocument) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let lock_path = sibling(&self.path, ".lock");
        let lock_file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)?;
        // Released when `lock_file` is dropped
        lock_file.lock_exclusive()?;

        let temp_path = sibling(&self.path, ".tmp");
        let content = serde_json::to_vec_pretty(document)?;
        {
            let mut temp = fs::File::create(&temp_path).map_err(Error::from_write)?;
            temp.write_all(&content).map_err(Error::from_write)?;
            temp.sync_all().map_err(Error::from_write)?;
        }
        fs::rename(&temp_path, &self.path)?;
        Ok(())
    }
}

/// Run blocking work, yielding the runtime worker when there is one to yield
fn blocking_section<T>(f: impl FnOnce() -> T) -> T {
    match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(f)
        }
        _ => f(),
    }
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}
