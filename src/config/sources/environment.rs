//! Environment source: `SCRIBE__SECTION__FIELD=value`

use config::builder::DefaultState;
use config::{ConfigBuilder, Environment};

/// Add the environment layer. `SCRIBE__BATCH__MAX_BATCH_SIZE=5` sets `batch.max_batch_size`.
///
/// The double-underscore prefix keeps logging variables such as `SCRIBE_LOG` and the
/// API key variable out of this layer.
pub fn add_to_builder(builder: ConfigBuilder<DefaultState>) -> ConfigBuilder<DefaultState> {
    builder.add_source(
        Environment::with_prefix("SCRIBE")
            .prefix_separator("__")
            .separator("__")
            .try_parsing(true),
    )
}
