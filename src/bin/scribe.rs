//! Scribe CLI Binary
//!
//! Command-line interface for batched document generation.

use anyhow::{anyhow, Context};
use clap::Parser;
use scribe::cli::{map_error, Cli, RunContext};
use scribe::config::ConfigLoader;
use scribe::logging::{init_logging, LoggingConfig};
use std::process;
use tracing::{error, info};

fn main() {
    let cli = Cli::parse();

    match run(&cli) {
        Ok(output) => {
            if !output.is_empty() {
                println!("{}", output);
            }
        }
        Err(e) => {
            eprintln!("{:#}", e);
            process::exit(1);
        }
    }
}

fn run(cli: &Cli) -> anyhow::Result<String> {
    let logging_config = build_logging_config(cli);
    init_logging(Some(&logging_config)).context("Failed to initialize logging")?;

    info!("Scribe CLI starting");

    let context = RunContext::new(
        cli.workspace.clone(),
        cli.config.clone(),
        cli.projects_dir.clone(),
    )
    .map_err(|e| {
        error!("Error initializing run context: {}", e);
        anyhow!(map_error(&e))
    })?;

    context.execute(&cli.command).map_err(|e| {
        error!("Command failed: {}", e);
        anyhow!(map_error(&e))
    })
}

/// Build logging configuration from the config file, then CLI args on top.
fn build_logging_config(cli: &Cli) -> LoggingConfig {
    let mut config = if let Some(ref config_path) = cli.config {
        ConfigLoader::load_from_file(config_path)
            .ok()
            .map(|c| c.logging)
            .unwrap_or_default()
    } else {
        ConfigLoader::load(&cli.workspace)
            .ok()
            .map(|c| c.logging)
            .unwrap_or_default()
    };

    if let Some(ref level) = cli.log_level {
        config.level = level.clone();
    }
    if let Some(ref format) = cli.log_format {
        config.format = format.clone();
    }
    if let Some(ref output) = cli.log_output {
        config.output = output.clone();
    }
    if let Some(ref file) = cli.log_file {
        config.file = file.clone();
    } else if config.file.is_relative() {
        config.file = cli.workspace.join(&config.file);
    }

    config
}
