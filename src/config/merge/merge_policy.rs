//! Merge rules: defaults first, later sources override earlier ones key by key.

use config::Config;
use config::ConfigBuilder;
use config::ConfigError;

/// Create a Config builder with the engine's defaults applied.
///
/// Struct-level serde defaults cover every field as well; these keys are the ones
/// operators most often override, listed so the effective baseline is visible here.
pub fn builder_with_defaults() -> Result<ConfigBuilder<config::builder::DefaultState>, ConfigError>
{
    Config::builder()
        .set_default("backend.model", "gpt-4o-mini")?
        .set_default("backend.base_url", "https://api.openai.com/v1")?
        .set_default("backend.api_key_env", "SCRIBE_API_KEY")?
        .set_default("limits.token_ceiling", 64_000i64)?
        .set_default("limits.soft_ratio", 0.8f64)?
        .set_default("batch.max_batch_size", 3i64)?
        .set_default("batch.inter_batch_delay_ms", 5_000i64)?
        .set_default("queue.min_spacing_ms", 2_000i64)?
        .set_default("cache.ttl_secs", 300i64)
}
