//! CLI parse: clap types for scribe. No behavior; definitions only.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Scribe CLI - Batched document generation against a language-model backend
#[derive(Parser)]
#[command(name = "scribe")]
#[command(about = "Generate project documents in rate-limited, token-bounded batches")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Workspace root directory
    #[arg(long, default_value = ".")]
    pub workspace: PathBuf,

    /// Configuration file path (overrides default config loading)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Project manifests directory (default: <workspace>/projects)
    #[arg(long)]
    pub projects_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error, off)
    #[arg(long)]
    pub log_level: Option<String>,

    /// Log format (json, text)
    #[arg(long)]
    pub log_format: Option<String>,

    /// Log output (stdout, stderr, file)
    #[arg(long)]
    pub log_output: Option<String>,

    /// Log file path (if output is "file")
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Assemble a project's context and report its token estimate
    Context {
        /// Project identifier
        project: String,
        /// Output format (text or json)
        #[arg(long, default_value = "text")]
        format: String,
        /// Include the rendered context text
        #[arg(long)]
        show_text: bool,
    },
    /// Generate documents for a list of jobs
    Generate {
        /// Project identifier
        project: String,
        /// JSON file holding an array of jobs
        #[arg(long)]
        jobs: PathBuf,
        /// Directory receiving one JSON document per job
        #[arg(long)]
        out: PathBuf,
        /// Override the configured maximum batch size
        #[arg(long)]
        batch_size: Option<usize>,
        /// Output format (text or json)
        #[arg(long, default_value = "text")]
        format: String,
    },
    /// Stream a single completion to stdout
    Stream {
        /// Project identifier
        project: String,
        /// Prompt appended after the project context
        #[arg(long)]
        prompt: String,
        /// Send the prompt without the project context
        #[arg(long)]
        no_context: bool,
    },
    /// Print the resolved configuration as TOML
    Config,
}
