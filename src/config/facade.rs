//! Config loading entry points.

use super::merge::merge_policy;
use super::sources::{environment, global_file, workspace_file};
use super::ScribeConfig;
use crate::error::ApiError;
use config::File;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Loads [`ScribeConfig`] from its layered sources.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration for a workspace.
    ///
    /// Precedence, lowest to highest: defaults, global file, `config/config.toml`,
    /// `config/{SCRIBE_ENV}.toml`, `SCRIBE__SECTION__FIELD` environment variables.
    pub fn load(workspace_root: &Path) -> Result<ScribeConfig, ApiError> {
        let builder = merge_policy::builder_with_defaults()?;
        let builder = global_file::add_to_builder(builder)?;
        let builder = workspace_file::add_to_builder(builder, workspace_root)?;
        let builder = environment::add_to_builder(builder);

        let config: ScribeConfig = builder.build()?.try_deserialize()?;
        debug!(
            workspace_root = %workspace_root.display(),
            model = %config.backend.model,
            "Loaded configuration"
        );
        Ok(config)
    }

    /// Load a single TOML file over the defaults. No other layers apply.
    pub fn load_from_file(path: &Path) -> Result<ScribeConfig, ApiError> {
        if !path.exists() {
            return Err(ApiError::ConfigError(format!(
                "Config file not found: {}",
                path.display()
            )));
        }
        let builder = merge_policy::builder_with_defaults()?
            .add_source(File::from(path.to_path_buf()).required(true));
        Ok(builder.build()?.try_deserialize()?)
    }

    /// Location of the user's global config file, if one can be determined.
    pub fn xdg_config_path() -> Option<PathBuf> {
        global_file::global_config_path()
    }
}
