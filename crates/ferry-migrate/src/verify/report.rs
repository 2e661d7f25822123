//! Verification reports and their on-disk store
//!
//! A report is written once, with create-new semantics, and never touched
//! again. The deletion guard reads the latest verdict per unit across every
//! report in the directory.

use crate::progress_store::ProgressRecord;
use crate::sampler::Stratum;
use chrono::{DateTime, Utc};
use ferry_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::warn;
use uuid::Uuid;

const REPORT_PREFIX: &str = "verification_";

/// Result of comparing one extracted file with its manifest entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileOutcome {
    Match,
    SizeMismatch,
    ChecksumMismatch,
    MissingInArchive,
}

/// Result of comparing the remote part stream with the progress record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArchiveOutcome {
    Match,
    LengthMismatch,
    ChecksumMismatch,
    /// Parts or manifest could not be fetched
    Unavailable,
}

/// One sampled file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationFinding {
    pub path: String,
    pub expected_size: u64,
    pub expected_sha256: Option<String>,
    pub observed_size: Option<u64>,
    pub observed_sha256: Option<String>,
    pub outcome: FileOutcome,

    /// Size the source lists today, if it still lists the object
    pub live_source_size: Option<u64>,

    /// The source object changed since enumeration
    pub source_drift: bool,
}

/// Verification of one unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitVerification {
    pub unit_id: String,

    /// Size stratum the unit was drawn from, absent for explicit selection
    pub stratum: Option<Stratum>,

    pub passed: bool,
    pub archive_outcome: ArchiveOutcome,
    pub expected_bytes: u64,
    pub observed_bytes: Option<u64>,
    pub expected_sha256: Option<String>,
    pub observed_sha256: Option<String>,

    /// Objects in the unit manifest
    pub files_total: usize,
    pub findings: Vec<VerificationFinding>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl UnitVerification {
    /// Findings whose outcome is not `match`
    pub fn mismatches(&self) -> impl Iterator<Item = &VerificationFinding> {
        self.findings.iter().filter(|f| f.outcome != FileOutcome::Match)
    }
}

/// Cross-check of source units, progress records and remote folders
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InventoryCheck {
    /// Migrated units with no remote folder
    pub missing_in_remote: Vec<String>,

    /// Source units without a completed record
    pub unmigrated: Vec<String>,

    /// Remote folders with no matching source unit
    pub extra_in_remote: Vec<String>,
}

/// Outcome of one verification run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationReport {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,

    /// Every verified unit passed and no migrated unit is missing remotely
    pub passed: bool,

    /// Migrated units the sample was drawn from
    pub population: usize,

    pub units: Vec<UnitVerification>,
    pub inventory: InventoryCheck,
}

impl VerificationReport {
    pub fn new(population: usize, units: Vec<UnitVerification>, inventory: InventoryCheck) -> Self {
        let passed = units.iter().all(|u| u.passed) && inventory.missing_in_remote.is_empty();
        Self {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            passed,
            population,
            units,
            inventory,
        }
    }

    pub fn passed_count(&self) -> usize {
        self.units.iter().filter(|u| u.passed).count()
    }

    pub fn failed_count(&self) -> usize {
        self.units.len() - self.passed_count()
    }

    /// File name the report is stored under
    pub fn file_name(&self) -> String {
        format!(
            "{}{}_{}.json",
            REPORT_PREFIX,
            self.created_at.format("%Y%m%dT%H%M%S%.3fZ"),
            self.id
        )
    }
}

/// Most recent verdict for a unit
#[derive(Debug, Clone, PartialEq)]
pub struct UnitVerdict {
    pub passed: bool,
    pub report_id: Uuid,
    pub verified_at: DateTime<Utc>,

    /// Archive checksum the verification compared against
    pub expected_sha256: Option<String>,
}

impl UnitVerdict {
    /// Whether the verdict was reached on the archive `record` describes now.
    ///
    /// Checksums decide when both sides have one. Otherwise the verdict must
    /// postdate the record's last change.
    pub fn covers(&self, record: &ProgressRecord) -> bool {
        match (&self.expected_sha256, &record.archive_checksum) {
            (Some(verified), Some(current)) => verified == current,
            _ => self.verified_at > record.updated_at,
        }
    }
}

/// Directory of verification reports
#[derive(Debug, Clone)]
pub struct ReportStore {
    dir: PathBuf,
}

impl ReportStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Persist a report; fails if a file of that name already exists
    pub fn write(&self, report: &VerificationReport) -> Result<PathBuf> {
        fs::create_dir_all(&self.dir).map_err(Error::from_write)?;
        let path = self.dir.join(report.file_name());
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(Error::from_write)?;
        file.write_all(&serde_json::to_vec_pretty(report)?)
            .map_err(Error::from_write)?;
        file.sync_all().map_err(Error::from_write)?;
        Ok(path)
    }

    /// Every readable report, oldest first
    pub fn load_all(&self) -> Result<Vec<VerificationReport>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }

        let mut reports = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let is_report = path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with(REPORT_PREFIX) && n.ends_with(".json"))
                .unwrap_or(false);
            if !is_report {
                continue;
            }
            match fs::read(&path)
                .map_err(Error::from)
                .and_then(|bytes| serde_json::from_slice::<VerificationReport>(&bytes).map_err(Error::from))
            {
                Ok(report) => reports.push(report),
                Err(e) => warn!("Skipping unreadable report {}: {}", path.display(), e),
            }
        }
        reports.sort_by_key(|r| r.created_at);
        Ok(reports)
    }

    /// Newest report
    pub fn latest(&self) -> Result<Option<VerificationReport>> {
        Ok(self.load_all()?.pop())
    }

    /// Latest verdict per unit across all reports
    pub fn latest_verdicts(&self) -> Result<HashMap<String, UnitVerdict>> {
        let mut verdicts = HashMap::new();
        for report in self.load_all()? {
            for unit in &report.units {
                verdicts.insert(
                    unit.unit_id.clone(),
                    UnitVerdict {
                        passed: unit.passed,
                        report_id: report.id,
                        verified_at: report.created_at,
                        expected_sha256: unit.expected_sha256.clone(),
                    },
                );
            }
        }
        Ok(verdicts)
    }
}
