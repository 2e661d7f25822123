//! Migrate command

use anyhow::{Context as _, Result};
use clap::Args;
use ferry_migrate::{MigrationOptions, MigrationOrchestrator, UnitOutcome};
use tabled::{settings::Style, Table, Tabled};

use super::{cancel_on_interrupt, unit_filter, Context};
use crate::cli::GlobalArgs;
use crate::output;

#[derive(Args, Debug)]
pub struct MigrateArgs {
    /// Only migrate these units (comma separated)
    #[arg(long, value_delimiter = ',')]
    pub units: Vec<String>,

    /// Discard all recorded progress before starting
    #[arg(long)]
    pub reset: bool,

    /// Archive split threshold in bytes
    #[arg(long)]
    pub threshold: Option<u64>,

    /// Units migrated concurrently
    #[arg(long)]
    pub workers: Option<usize>,
}

#[derive(Tabled)]
struct FailureRow {
    unit: String,
    stage: String,
    class: String,
    error: String,
}

pub async fn run(args: MigrateArgs, global: &GlobalArgs, quiet: bool) -> Result<bool> {
    let mut ctx = Context::load(global)?;
    if let Some(threshold) = args.threshold {
        ctx.config.archive.split_threshold_bytes = threshold;
    }
    if let Some(workers) = args.workers {
        ctx.config.concurrency.unit_workers = workers;
    }
    ctx.config.validate().context("Invalid migration options")?;

    output::header("Migrate Units");
    output::kv("Source", ctx.source.name());
    output::kv("Remote", &format!("{} under {}", ctx.remote.name(), ctx.config.remote.root));
    output::kv("Split threshold", &output::bytes(ctx.config.archive.split_threshold_bytes));
    output::kv("Workers", &ctx.config.concurrency.unit_workers.to_string());
    if !args.units.is_empty() {
        output::kv("Units", &args.units.join(", "));
    }

    if args.reset {
        output::warning("Discarding all recorded progress");
        ctx.progress.clear().context("Failed to reset progress")?;
    }
    println!();

    let orchestrator = MigrationOrchestrator::new(
        &ctx.config,
        ctx.source.clone(),
        ctx.remote.clone(),
        ctx.progress.clone(),
    )
    .with_progress(!quiet)
    .with_cancellation(cancel_on_interrupt());

    let summary = orchestrator
        .run(&MigrationOptions {
            units: unit_filter(&args.units),
        })
        .await
        .context("Migration run aborted")?;

    output::header("Summary");
    output::kv("Completed", &summary.completed.to_string());
    output::kv("Skipped", &summary.skipped().to_string());
    output::kv("Failed", &summary.failed().to_string());
    if !summary.interrupted.is_empty() {
        output::kv("Interrupted", &summary.interrupted.len().to_string());
    }
    output::kv("Elapsed", &format!("{:.1}s", summary.elapsed.as_secs_f64()));

    let archived: u64 = summary
        .units
        .iter()
        .filter_map(|r| match r.outcome {
            UnitOutcome::Completed { archive_bytes, .. } => Some(archive_bytes),
            _ => None,
        })
        .sum();
    if archived > 0 {
        output::kv("Uploaded", &output::bytes(archived));
    }

    if !summary.failures.is_empty() {
        let rows: Vec<FailureRow> = summary
            .failures
            .iter()
            .map(|f| FailureRow {
                unit: f.unit_id.clone(),
                stage: f.stage.clone(),
                class: f.class.to_string(),
                error: f.message.clone(),
            })
            .collect();
        let mut table = Table::new(rows);
        table.with(Style::sharp());
        println!("\n{}", table);
        output::error(&format!("{} units failed; re-run to retry them", summary.failed()));
    }

    if !summary.interrupted.is_empty() {
        output::warning("Run interrupted; re-run to resume where it stopped");
    }

    if summary.is_success() {
        output::success("Migration complete");
    }
    Ok(summary.is_success())
}
