//! Guarded deletion of migrated units from the source store
//!
//! A unit may be deleted only when it is migrated, either `COMPLETED` or
//! adopted from a complete remote copy, and the latest verification of its
//! current archive passed. Destructive runs
//! need two confirmations with distinct literal tokens; any other input
//! aborts before a single delete is issued.

use crate::progress_store::{ProgressStore, UnitStatus};
use crate::store::SourceStore;
use crate::verify::ReportStore;
use chrono::{DateTime, Utc};
use ferry_core::retry::retry_remote;
use ferry_core::types::RetryPolicy;
use ferry_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// First confirmation token
pub const AFFIRMATIVE_TOKEN: &str = "yes";

/// Second, stronger confirmation token
pub const STRONG_TOKEN: &str = "DELETE";

/// Source of operator confirmations
pub trait Confirmer: Send + Sync {
    /// Show `prompt` and return what the operator typed
    fn confirm(&self, prompt: &str) -> Result<String>;
}

/// Why a unit is not deletable
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum ExclusionReason {
    NotCompleted { status: UnitStatus },
    NeverVerified,
    VerificationFailed { report_id: Uuid },
    /// The latest verdict was reached on an earlier archive of the unit
    VerificationStale { report_id: Uuid },
}

impl fmt::Display for ExclusionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExclusionReason::NotCompleted { status } => write!(f, "migration is {}", status),
            ExclusionReason::NeverVerified => f.write_str("never verified"),
            ExclusionReason::VerificationFailed { report_id } => {
                write!(f, "last verification failed (report {})", report_id)
            }
            ExclusionReason::VerificationStale { report_id } => {
                write!(f, "last verification covered an earlier archive (report {})", report_id)
            }
        }
    }
}

/// A unit eligible for deletion
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeletionCandidate {
    pub unit_id: String,
    pub size_bytes: u64,
    pub object_count: u64,
    pub verified_at: DateTime<Utc>,
}

/// A unit held back from deletion
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExcludedUnit {
    pub unit_id: String,
    pub reason: ExclusionReason,
}

/// Deletable and excluded units
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeletionPlan {
    pub deletable: Vec<DeletionCandidate>,
    pub excluded: Vec<ExcludedUnit>,
}

impl DeletionPlan {
    pub fn total_bytes(&self) -> u64 {
        self.deletable.iter().map(|c| c.size_bytes).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeletedUnit {
    pub unit_id: String,
    pub deleted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedDeletion {
    pub unit_id: String,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}

/// Record of a destructive run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeletionLog {
    pub id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub deleted: Vec<DeletedUnit>,
    pub failed: Vec<FailedDeletion>,
}

/// Result of a deletion run
#[derive(Debug, Clone)]
pub struct DeletionRun {
    pub plan: DeletionPlan,

    /// Absent for dry runs and for runs with nothing to delete
    pub log: Option<DeletionLog>,
    pub log_path: Option<PathBuf>,
}

impl DeletionRun {
    pub fn failed_count(&self) -> usize {
        self.log.as_ref().map(|l| l.failed.len()).unwrap_or(0)
    }
}

/// Enforces eligibility and confirmation before deleting source units
pub struct DeletionGuard {
    source: Arc<dyn SourceStore>,
    progress: Arc<ProgressStore>,
    reports: ReportStore,
    policy: RetryPolicy,
    confirmer: Arc<dyn Confirmer>,
}

impl DeletionGuard {
    pub fn new(
        source: Arc<dyn SourceStore>,
        progress: Arc<ProgressStore>,
        reports: ReportStore,
        policy: RetryPolicy,
        confirmer: Arc<dyn Confirmer>,
    ) -> Self {
        Self {
            source,
            progress,
            reports,
            policy,
            confirmer,
        }
    }

    /// Compute the deletable set
    pub fn plan(&self) -> Result<DeletionPlan> {
        let verdicts = self.reports.latest_verdicts()?;
        let mut plan = DeletionPlan::default();

        for record in self.progress.records() {
            let reason = if !record.is_migrated() {
                Some(ExclusionReason::NotCompleted {
                    status: record.status,
                })
            } else {
                match verdicts.get(&record.unit_id) {
                    None => Some(ExclusionReason::NeverVerified),
                    Some(verdict) if !verdict.covers(&record) => {
                        Some(ExclusionReason::VerificationStale {
                            report_id: verdict.report_id,
                        })
                    }
                    Some(verdict) if !verdict.passed => Some(ExclusionReason::VerificationFailed {
                        report_id: verdict.report_id,
                    }),
                    Some(verdict) => {
                        plan.deletable.push(DeletionCandidate {
                            unit_id: record.unit_id.clone(),
                            size_bytes: record.snapshot.size_bytes,
                            object_count: record.snapshot.object_count,
                            verified_at: verdict.verified_at,
                        });
                        None
                    }
                }
            };
            if let Some(reason) = reason {
                plan.excluded.push(ExcludedUnit {
                    unit_id: record.unit_id,
                    reason,
                });
            }
        }
        Ok(plan)
    }

    /// List the deletable set without deleting anything
    pub fn dry_run(&self) -> Result<DeletionRun> {
        Ok(DeletionRun {
            plan: self.plan()?,
            log: None,
            log_path: None,
        })
    }

    /// Confirm twice, then delete every deletable unit.
    ///
    /// Fails with `OperatorAborted`, having deleted nothing, unless the
    /// operator types exactly [`AFFIRMATIVE_TOKEN`] and then
    /// [`STRONG_TOKEN`]. A failed delete is logged and the run moves on to
    /// the next unit.
    pub async fn execute(&self) -> Result<DeletionRun> {
        let plan = self.plan()?;
        if plan.deletable.is_empty() {
            info!("No units are eligible for deletion");
            return Ok(DeletionRun {
                plan,
                log: None,
                log_path: None,
            });
        }

        self.confirm(&plan)?;

        let started_at = Utc::now();
        let mut deleted = Vec::new();
        let mut failed = Vec::new();
        for candidate in &plan.deletable {
            let unit_id = candidate.unit_id.as_str();
            match retry_remote(&self.policy, "delete", || self.source.delete_unit(unit_id)).await {
                Ok(()) => {
                    let deleted_at = Utc::now();
                    info!(
                        unit = %unit_id,
                        deleted_at = %deleted_at.to_rfc3339(),
                        "Deleted unit from source"
                    );
                    deleted.push(DeletedUnit {
                        unit_id: unit_id.to_string(),
                        deleted_at,
                    });
                }
                Err(e) => {
                    warn!(unit = %unit_id, stage = "delete", "Deletion failed: {}", e);
                    failed.push(FailedDeletion {
                        unit_id: unit_id.to_string(),
                        error: e.to_string(),
                        failed_at: Utc::now(),
                    });
                }
            }
        }

        let log = DeletionLog {
            id: Uuid::new_v4(),
            started_at,
            finished_at: Utc::now(),
            deleted,
            failed,
        };
        let log_path = self.write_log(&log)?;
        Ok(DeletionRun {
            plan,
            log: Some(log),
            log_path: Some(log_path),
        })
    }

    fn confirm(&self, plan: &DeletionPlan) -> Result<()> {
        let first = self.confirmer.confirm(&format!(
            "Permanently delete {} units ({} bytes) from {}? Type '{}' to continue",
            plan.deletable.len(),
            plan.total_bytes(),
            self.source.name(),
            AFFIRMATIVE_TOKEN
        ))?;
        if first != AFFIRMATIVE_TOKEN {
            warn!("Deletion aborted at first confirmation");
            return Err(Error::operator_aborted(format!(
                "expected '{}' at the first confirmation",
                AFFIRMATIVE_TOKEN
            )));
        }

        let second = self.confirmer.confirm(&format!(
            "This cannot be undone. Type '{}' to delete {} units",
            STRONG_TOKEN,
            plan.deletable.len()
        ))?;
        if second != STRONG_TOKEN {
            warn!("Deletion aborted at second confirmation");
            return Err(Error::operator_aborted(format!(
                "expected '{}' at the second confirmation",
                STRONG_TOKEN
            )));
        }
        Ok(())
    }

    fn write_log(&self, log: &DeletionLog) -> Result<PathBuf> {
        let dir = self.reports.dir();
        std::fs::create_dir_all(dir).map_err(Error::from_write)?;
        let path = dir.join(format!(
            "deletion_log_{}_{}.json",
            log.started_at.format("%Y%m%dT%H%M%S%.3fZ"),
            log.id
        ));
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(Error::from_write)?;
        file.write_all(&serde_json::to_vec_pretty(log)?)
            .map_err(Error::from_write)?;
        file.sync_all().map_err(Error::from_write)?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exclusion_reason_display() {
        assert_eq!(
            ExclusionReason::NotCompleted {
                status: UnitStatus::Uploading
            }
            .to_string(),
            "migration is UPLOADING"
        );
        assert_eq!(ExclusionReason::NeverVerified.to_string(), "never verified");
    }

    #[test]
    fn test_plan_total_bytes() {
        let plan = DeletionPlan {
            deletable: vec![
                DeletionCandidate {
                    unit_id: "a".into(),
                    size_bytes: 10,
                    object_count: 1,
                    verified_at: Utc::now(),
                },
                DeletionCandidate {
                    unit_id: "b".into(),
                    size_bytes: 32,
                    object_count: 4,
                    verified_at: Utc::now(),
                },
            ],
            excluded: Vec::new(),
        };
        assert_eq!(plan.total_bytes(), 42);
    }
}
