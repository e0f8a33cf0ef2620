//! CLI domain: parse, route, help, output, and presentation only.
//! No domain orchestration; single route table dispatches to domain services.

mod help;
mod output;
mod parse;
mod presentation;
mod route;

pub use help::{command_name, command_project};
pub use output::map_error;
pub use parse::{Cli, Commands};
pub use presentation::{
    format_context_json_output, format_context_text_output, format_progress_line,
    format_run_summary_json, format_run_summary_text,
};
pub use route::RunContext;
