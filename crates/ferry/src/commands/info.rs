//! Info command

use anyhow::Result;
use clap::Args;
use ferry_migrate::{ProgressRecord, ProgressSummary, UnitStatus};
use serde::Serialize;
use tabled::{settings::Style, Table, Tabled};

use super::Context;
use crate::cli::GlobalArgs;
use crate::output;

#[derive(Args, Debug)]
pub struct InfoArgs {
    /// Output as JSON
    #[arg(long)]
    pub json: bool,

    /// List every unit, not only the summary
    #[arg(long)]
    pub units: bool,
}

#[derive(Tabled)]
struct StatusRow {
    status: String,
    units: usize,
}

#[derive(Tabled)]
struct UnitRow {
    unit: String,
    status: String,
    parts: String,
    size: String,
    archived: String,
    #[tabled(rename = "last error")]
    error: String,
}

impl UnitRow {
    fn from_record(record: &ProgressRecord) -> Self {
        let error = match (&record.failed_stage, &record.error) {
            (Some(stage), Some(error)) => format!("[{}] {}", stage, error),
            (None, Some(error)) => error.clone(),
            _ => String::new(),
        };
        Self {
            unit: record.unit_id.clone(),
            status: record.status.to_string(),
            parts: if record.part_count > 0 {
                format!("{}/{}", record.uploaded_parts.len(), record.part_count)
            } else {
                "-".to_string()
            },
            size: output::bytes(record.snapshot.size_bytes),
            archived: if record.archive_bytes > 0 {
                output::bytes(record.archive_bytes)
            } else {
                "-".to_string()
            },
            error,
        }
    }
}

#[derive(Serialize)]
struct InfoJson<'a> {
    config_path: Option<&'a str>,
    source: &'a str,
    remote: &'a str,
    remote_root: &'a str,
    summary: &'a ProgressSummary,
    units: Option<Vec<ProgressRecord>>,
}

pub async fn run(args: InfoArgs, global: &GlobalArgs) -> Result<bool> {
    let ctx = Context::load(global)?;
    let summary = ctx.progress.summary();

    if args.json {
        let info = InfoJson {
            config_path: ctx.config_path.as_ref().map(|p| p.as_str()),
            source: ctx.source.name(),
            remote: ctx.remote.name(),
            remote_root: &ctx.config.remote.root,
            summary: &summary,
            units: args.units.then(|| ctx.progress.records()),
        };
        println!("{}", serde_json::to_string_pretty(&info)?);
        return Ok(true);
    }

    output::header("Ferry");
    output::kv(
        "Config",
        ctx.config_path
            .as_ref()
            .map(|p| p.as_str())
            .unwrap_or("(defaults)"),
    );
    output::kv("Source", ctx.source.name());
    output::kv("Remote", &format!("{} under {}", ctx.remote.name(), ctx.config.remote.root));
    output::kv("Progress file", ctx.config.workspace.progress_file.as_str());
    output::kv("Scratch", ctx.config.workspace.scratch_dir.as_str());
    output::kv(
        "Archive",
        &format!(
            "{} level {}, split at {}",
            ctx.config.archive.compression,
            ctx.config.archive.compression_level,
            output::bytes(ctx.config.archive.split_threshold_bytes)
        ),
    );

    output::header("Progress");
    if summary.total_units == 0 {
        output::info("No units recorded yet. Run 'ferry migrate' to start.");
        return Ok(true);
    }

    let rows: Vec<StatusRow> = UnitStatus::ALL
        .iter()
        .map(|status| StatusRow {
            status: status.to_string(),
            units: summary.count(*status),
        })
        .filter(|row| row.units > 0)
        .collect();
    let mut table = Table::new(rows);
    table.with(Style::sharp());
    println!("{}", table);

    output::kv("Units", &summary.total_units.to_string());
    output::kv("Objects", &summary.total_objects.to_string());
    output::kv("Original size", &output::bytes(summary.original_bytes));
    output::kv("Archived size", &output::bytes(summary.archived_bytes));

    if args.units {
        let rows: Vec<UnitRow> = ctx.progress.records().iter().map(UnitRow::from_record).collect();
        let mut table = Table::new(rows);
        table.with(Style::sharp());
        println!("\n{}", table);
    }

    let failed = summary.count(UnitStatus::Failed);
    if failed > 0 {
        output::warning(&format!("{} units failed; 'ferry migrate' retries them", failed));
    }
    Ok(true)
}
