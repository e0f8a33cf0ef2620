//! CLI presentation: text and json formatters per command family.

mod context;
mod run;

pub use context::{format_context_json_output, format_context_text_output};
pub use run::{format_progress_line, format_run_summary_json, format_run_summary_text};

use owo_colors::OwoColorize;

fn section_title(title: &str) -> String {
    format!("{}", title.bold().underline())
}
