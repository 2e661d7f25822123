//! Verify command

use anyhow::{Context as _, Result};
use clap::Args;
use ferry_migrate::verify::{ArchiveOutcome, UnitVerification};
use ferry_migrate::{
    RemoteLayout, ReportStore, StratifiedSampler, TransferDownloader, VerificationEngine,
    VerificationOptions,
};
use tabled::{settings::Style, Table, Tabled};

use super::{cancel_on_interrupt, unit_filter, Context};
use crate::cli::GlobalArgs;
use crate::output;

#[derive(Args, Debug)]
pub struct VerifyArgs {
    /// Verify exactly these units instead of sampling (comma separated)
    #[arg(long, value_delimiter = ',')]
    pub units: Vec<String>,

    /// Number of units to sample
    #[arg(long)]
    pub unit_count: Option<usize>,

    /// Number of files to sample per unit
    #[arg(long)]
    pub file_count: Option<usize>,

    /// Seed for random selection
    #[arg(long)]
    pub seed: Option<u64>,

    /// Print the report as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Tabled)]
struct UnitRow {
    unit: String,
    stratum: String,
    archive: String,
    files: String,
    result: String,
}

impl UnitRow {
    fn from_verification(unit: &UnitVerification) -> Self {
        let archive = match unit.archive_outcome {
            ArchiveOutcome::Match => "match",
            ArchiveOutcome::LengthMismatch => "length mismatch",
            ArchiveOutcome::ChecksumMismatch => "checksum mismatch",
            ArchiveOutcome::Unavailable => "unavailable",
        };
        let mismatched = unit.mismatches().count();
        Self {
            unit: unit.unit_id.clone(),
            stratum: unit
                .stratum
                .map(|s| s.to_string())
                .unwrap_or_else(|| "-".to_string()),
            archive: archive.to_string(),
            files: format!(
                "{}/{} sampled, {} mismatched",
                unit.findings.len(),
                unit.files_total,
                mismatched
            ),
            result: match (&unit.error, unit.passed) {
                (_, true) => "PASS".to_string(),
                (Some(error), false) => format!("FAIL: {}", error),
                (None, false) => "FAIL".to_string(),
            },
        }
    }
}

pub async fn run(args: VerifyArgs, global: &GlobalArgs) -> Result<bool> {
    let mut ctx = Context::load(global)?;
    if let Some(seed) = args.seed {
        ctx.config.verification.seed = Some(seed);
    }

    let mut options = VerificationOptions::from_config(&ctx.config.verification);
    if let Some(count) = args.unit_count {
        options.unit_sample_size = count;
    }
    if let Some(count) = args.file_count {
        options.file_sample_size = count;
    }
    options.units = unit_filter(&args.units);

    let policies = &ctx.config.retry_policies;
    let downloader = TransferDownloader::new(
        ctx.remote.clone(),
        RemoteLayout::new(ctx.config.remote.root.clone()),
        policies.policy_for("download").clone(),
    );
    let engine = VerificationEngine::new(
        ctx.source.clone(),
        downloader,
        ctx.progress.clone(),
        ctx.config.workspace.scratch_dir.as_std_path(),
        policies.policy_for("list").clone(),
    )
    .with_sampler(StratifiedSampler::from_config(&ctx.config.verification))
    .with_cancellation(cancel_on_interrupt());

    if !args.json {
        output::header("Verify Migration");
        match &options.units {
            Some(units) => output::kv("Units", &units.join(", ")),
            None => output::kv(
                "Sample",
                &format!(
                    "{} units, {} files each",
                    options.unit_sample_size, options.file_sample_size
                ),
            ),
        }
        println!();
    }

    let report = engine.run(&options).await.context("Verification aborted")?;
    let store = ReportStore::new(ctx.config.workspace.reports_dir.as_std_path());
    let path = store.write(&report).context("Failed to write verification report")?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(report.passed);
    }

    if report.units.is_empty() {
        output::info("No migrated units to verify");
    } else {
        let rows: Vec<UnitRow> = report.units.iter().map(UnitRow::from_verification).collect();
        let mut table = Table::new(rows);
        table.with(Style::sharp());
        println!("{}", table);
    }

    let inventory = &report.inventory;
    if !inventory.missing_in_remote.is_empty() {
        output::warning(&format!(
            "Migrated but missing in remote: {}",
            inventory.missing_in_remote.join(", ")
        ));
    }
    if !inventory.unmigrated.is_empty() {
        output::warning(&format!(
            "Not yet migrated: {}",
            inventory.unmigrated.join(", ")
        ));
    }
    if !inventory.extra_in_remote.is_empty() {
        output::warning(&format!(
            "Remote folders without a source unit: {}",
            inventory.extra_in_remote.join(", ")
        ));
    }

    output::kv("Report", &path.display().to_string());
    if report.passed {
        output::success(&format!(
            "Verification passed ({} of {} migrated units checked)",
            report.passed_count(),
            report.population
        ));
    } else {
        output::error(&format!(
            "Verification failed for {} units",
            report.failed_count()
        ));
    }
    Ok(report.passed)
}
