//! Delete command

use anyhow::{Context as _, Result};
use clap::Args;
use dialoguer::Input;
use ferry_core::{Error, ErrorClass};
use ferry_migrate::deletion::{DeletionPlan, DeletionRun};
use ferry_migrate::{Confirmer, DeletionGuard, ReportStore};
use std::sync::Arc;
use tabled::{settings::Style, Table, Tabled};

use super::Context;
use crate::cli::GlobalArgs;
use crate::output;

#[derive(Args, Debug)]
pub struct DeleteArgs {
    /// Delete for real; without this only the deletable set is listed
    #[arg(long)]
    pub execute: bool,
}

/// Reads confirmation tokens from the terminal
struct TerminalConfirmer;

impl Confirmer for TerminalConfirmer {
    fn confirm(&self, prompt: &str) -> ferry_core::Result<String> {
        Input::<String>::new()
            .with_prompt(prompt)
            .allow_empty(true)
            .interact_text()
            .map_err(|e| Error::operator_aborted(format!("confirmation prompt failed: {}", e)))
    }
}

#[derive(Tabled)]
struct DeletableRow {
    unit: String,
    objects: u64,
    size: String,
    verified: String,
}

#[derive(Tabled)]
struct ExcludedRow {
    unit: String,
    reason: String,
}

fn print_plan(plan: &DeletionPlan) {
    if plan.deletable.is_empty() {
        output::info("No units are eligible for deletion");
    } else {
        let rows: Vec<DeletableRow> = plan
            .deletable
            .iter()
            .map(|c| DeletableRow {
                unit: c.unit_id.clone(),
                objects: c.object_count,
                size: output::bytes(c.size_bytes),
                verified: c.verified_at.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
            })
            .collect();
        let mut table = Table::new(rows);
        table.with(Style::sharp());
        println!("{}", table);
        output::kv("Deletable", &format!(
            "{} units, {}",
            plan.deletable.len(),
            output::bytes(plan.total_bytes())
        ));
    }

    if !plan.excluded.is_empty() {
        let rows: Vec<ExcludedRow> = plan
            .excluded
            .iter()
            .map(|e| ExcludedRow {
                unit: e.unit_id.clone(),
                reason: e.reason.to_string(),
            })
            .collect();
        let mut table = Table::new(rows);
        table.with(Style::sharp());
        println!("\nExcluded:\n{}", table);
    }
}

fn print_run(run: &DeletionRun) {
    let Some(log) = &run.log else {
        return;
    };
    output::kv("Deleted", &log.deleted.len().to_string());
    for failure in &log.failed {
        output::error(&format!("{}: {}", failure.unit_id, failure.error));
    }
    if let Some(path) = &run.log_path {
        output::kv("Log", &path.display().to_string());
    }
}

pub async fn run(args: DeleteArgs, global: &GlobalArgs) -> Result<bool> {
    let ctx = Context::load(global)?;
    let guard = DeletionGuard::new(
        ctx.source.clone(),
        ctx.progress.clone(),
        ReportStore::new(ctx.config.workspace.reports_dir.as_std_path()),
        ctx.config.retry_policies.policy_for("delete").clone(),
        Arc::new(TerminalConfirmer),
    );

    if !args.execute {
        output::header("Deletion Plan (dry run)");
        let run = guard.dry_run().context("Failed to compute the deletable set")?;
        print_plan(&run.plan);
        if !run.plan.deletable.is_empty() {
            output::info("Re-run with --execute to delete these units from the source");
        }
        return Ok(true);
    }

    output::header("Delete Source Units");
    let plan = guard.plan().context("Failed to compute the deletable set")?;
    print_plan(&plan);
    println!();

    let run = match guard.execute().await {
        Ok(run) => run,
        Err(e) if e.class() == ErrorClass::OperatorAborted => {
            output::error(&format!("Deletion aborted, nothing was deleted: {}", e));
            return Ok(false);
        }
        Err(e) => return Err(e).context("Deletion failed"),
    };

    print_run(&run);
    let failed = run.failed_count();
    if failed > 0 {
        output::error(&format!("{} units could not be deleted", failed));
        return Ok(false);
    }
    if run.log.is_some() {
        output::success("Source units deleted");
    }
    Ok(true)
}
