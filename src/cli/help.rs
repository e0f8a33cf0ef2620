//! CLI help and command-name contract for logging and routing.

use crate::cli::parse::Commands;

/// Command name used in log spans (e.g. "generate").
pub fn command_name(command: &Commands) -> &'static str {
    match command {
        Commands::Context { .. } => "context",
        Commands::Generate { .. } => "generate",
        Commands::Stream { .. } => "stream",
        Commands::Config => "config",
    }
}

/// Project targeted by a command, if any.
pub fn command_project(command: &Commands) -> Option<&str> {
    match command {
        Commands::Context { project, .. }
        | Commands::Generate { project, .. }
        | Commands::Stream { project, .. } => Some(project),
        Commands::Config => None,
    }
}
