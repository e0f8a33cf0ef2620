//! Configuration System
//!
//! Layered configuration: built-in defaults, the user's global file, workspace files,
//! then `SCRIBE__SECTION__FIELD` environment variables. Every field has a default, so
//! an empty configuration is valid.

use crate::context::DEFAULT_CONTEXT_TTL;
use crate::error::ApiError;
use crate::executor::{ExecutorConfig, DEFAULT_MAX_RETRIES};
use crate::generation::OrchestratorConfig;
use crate::logging::{validate_logging_config, LoggingConfig};
use crate::queue::QueueConfig;
use crate::tokens::{TokenBudget, DEFAULT_SOFT_RATIO, DEFAULT_TOKEN_CEILING};
use serde::{Deserialize, Serialize};
use std::time::Duration;

mod facade;
mod merge;
mod sources;

pub use facade::ConfigLoader;

/// Root configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScribeConfig {
    #[serde(default)]
    pub backend: BackendConfig,

    #[serde(default)]
    pub limits: LimitsConfig,

    #[serde(default)]
    pub executor: ExecutorConfig,

    #[serde(default)]
    pub queue: QueueConfig,

    #[serde(default)]
    pub batch: OrchestratorConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Generation backend settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    #[serde(default = "default_model")]
    pub model: String,

    /// Base URL of an OpenAI-compatible API (without `/chat/completions`)
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Inline API key; prefer `api_key_env`
    #[serde(default)]
    pub api_key: Option<String>,

    /// Environment variable holding the API key when `api_key` is unset
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Retries per backend call after the first attempt
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_api_key_env() -> String {
    "SCRIBE_API_KEY".to_string()
}

fn default_temperature() -> f32 {
    0.7
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            base_url: default_base_url(),
            api_key: None,
            api_key_env: default_api_key_env(),
            temperature: default_temperature(),
            max_retries: default_max_retries(),
        }
    }
}

impl BackendConfig {
    /// Inline key, else the value of `api_key_env`.
    pub fn resolve_api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .filter(|key| !key.trim().is_empty())
            .or_else(|| {
                std::env::var(&self.api_key_env)
                    .ok()
                    .filter(|key| !key.trim().is_empty())
            })
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.model.trim().is_empty() {
            return Err("Model name cannot be empty".to_string());
        }
        if !self.base_url.starts_with("http://") && !self.base_url.starts_with("https://") {
            return Err(format!(
                "Invalid base_url '{}': must start with http:// or https://",
                self.base_url
            ));
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(format!(
                "Temperature {} out of range [0.0, 2.0]",
                self.temperature
            ));
        }
        Ok(())
    }
}

/// Token limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    #[serde(default = "default_token_ceiling")]
    pub token_ceiling: usize,

    /// Fraction of the ceiling that triggers a warning
    #[serde(default = "default_soft_ratio")]
    pub soft_ratio: f64,
}

fn default_token_ceiling() -> usize {
    DEFAULT_TOKEN_CEILING
}

fn default_soft_ratio() -> f64 {
    DEFAULT_SOFT_RATIO
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            token_ceiling: default_token_ceiling(),
            soft_ratio: default_soft_ratio(),
        }
    }
}

impl LimitsConfig {
    pub fn budget(&self) -> TokenBudget {
        TokenBudget::new(self.token_ceiling, self.soft_ratio)
    }
}

/// Context cache settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
}

fn default_ttl_secs() -> u64 {
    DEFAULT_CONTEXT_TTL.as_secs()
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_ttl_secs(),
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

/// Configuration validation errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    Backend(String),
    Limits(String),
    Executor(String),
    Batch(String),
    Logging(String),
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationError::Backend(msg) => write!(f, "Backend: {}", msg),
            ValidationError::Limits(msg) => write!(f, "Limits: {}", msg),
            ValidationError::Executor(msg) => write!(f, "Executor: {}", msg),
            ValidationError::Batch(msg) => write!(f, "Batch: {}", msg),
            ValidationError::Logging(msg) => write!(f, "Logging: {}", msg),
        }
    }
}

impl std::error::Error for ValidationError {}

impl ScribeConfig {
    /// Validate the entire configuration, collecting every violation.
    pub fn validate(&self) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();

        if let Err(e) = self.backend.validate() {
            errors.push(ValidationError::Backend(e));
        }

        if self.limits.token_ceiling == 0 {
            errors.push(ValidationError::Limits(
                "token_ceiling must be greater than zero".to_string(),
            ));
        }
        if !(self.limits.soft_ratio > 0.0 && self.limits.soft_ratio <= 1.0) {
            errors.push(ValidationError::Limits(format!(
                "soft_ratio {} must be in (0, 1]",
                self.limits.soft_ratio
            )));
        }

        if self.executor.request_timeout_ms == 0 {
            errors.push(ValidationError::Executor(
                "request_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.executor.initial_backoff_ms == 0 {
            errors.push(ValidationError::Executor(
                "initial_backoff_ms must be greater than zero".to_string(),
            ));
        }

        if self.batch.max_batch_size == 0 {
            errors.push(ValidationError::Batch(
                "max_batch_size must be at least 1".to_string(),
            ));
        }

        if let Err(e) = validate_logging_config(&self.logging) {
            errors.push(ValidationError::Logging(e));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    pub fn token_budget(&self) -> TokenBudget {
        self.limits.budget()
    }

    /// Render as TOML with any inline API key redacted.
    pub fn to_toml_string(&self) -> Result<String, ApiError> {
        let mut redacted = self.clone();
        if redacted.backend.api_key.is_some() {
            redacted.backend.api_key = Some("<redacted>".to_string());
        }
        toml::to_string_pretty(&redacted).map_err(|e| ApiError::Serialization(e.to_string()))
    }
}
