//! Generation run presentation: summary table, json, and progress lines.

use super::section_title;
use crate::error::ApiError;
use crate::generation::{JobStatus, RunSummary};
use crate::progress::{ProgressEvent, ProgressPhase};
use comfy_table::Table;
use owo_colors::OwoColorize;
use serde_json::json;
use std::path::Path;

pub fn format_run_summary_text(summary: &RunSummary, out_dir: &Path) -> String {
    let mut table = Table::new();
    table.load_preset(comfy_table::presets::UTF8_FULL);
    table.set_header(vec!["Job", "Document type", "Status", "Detail"]);
    for job in &summary.jobs {
        let (status, detail) = match &job.status {
            JobStatus::Succeeded => ("generated".to_string(), String::new()),
            JobStatus::Failed { reason } => ("failed".to_string(), reason.clone()),
            JobStatus::Pending => ("pending".to_string(), String::new()),
        };
        table.add_row(vec![
            job.id.to_string(),
            job.inputs.document_type.clone(),
            status,
            detail,
        ]);
    }

    let totals = format!(
        "{} generated, {} failed",
        summary.total_generated, summary.total_failed
    );
    let totals = if summary.total_failed == 0 {
        format!("{}", totals.green())
    } else if summary.total_generated == 0 {
        format!("{}", totals.red())
    } else {
        format!("{}", totals.yellow())
    };

    format!(
        "{}\n{}\n{}\nOutput: {}",
        section_title("Generation summary"),
        table,
        totals,
        out_dir.display()
    )
}

pub fn format_run_summary_json(summary: &RunSummary, out_dir: &Path) -> Result<String, ApiError> {
    let value = json!({
        "output_dir": out_dir.display().to_string(),
        "total_generated": summary.total_generated,
        "total_failed": summary.total_failed,
        "succeeded": summary.succeeded,
        "failed": summary.failed,
    });
    Ok(serde_json::to_string_pretty(&value)?)
}

/// One stderr line per progress event.
pub fn format_progress_line(event: &ProgressEvent) -> String {
    let counter = format!("[{}/{}]", event.completed, event.total);
    let message = match event.phase {
        ProgressPhase::RateLimitWait | ProgressPhase::Splitting => {
            format!("{}", event.message.yellow())
        }
        ProgressPhase::Aborted => format!("{}", event.message.red()),
        ProgressPhase::Completed => format!("{}", event.message.green()),
        _ => event.message.clone(),
    };
    if event.batch_index > 0 {
        format!(
            "{} batch {}/{}: {}",
            counter.dimmed(),
            event.batch_index,
            event.total_batches,
            message
        )
    } else {
        format!("{} {}", counter.dimmed(), message)
    }
}
