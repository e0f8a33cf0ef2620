//! Generation Backend Abstraction
//!
//! The engine talks to exactly one generative backend through [`GenerationBackend`].
//! Backends report failures as [`BackendError`] values carrying an HTTP-like status and
//! optional machine-readable details (quota failures, suggested retry delays); the
//! request executor turns those into tagged outcomes.

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::pin::Pin;

pub mod http;

pub use http::OpenAiCompatibleBackend;

/// One generation call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendRequest {
    pub prompt: String,
    pub system_instruction: Option<String>,
    pub temperature: f32,
}

impl BackendRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            system_instruction: None,
            temperature: 0.7,
        }
    }

    pub fn with_system_instruction(mut self, instruction: impl Into<String>) -> Self {
        self.system_instruction = Some(instruction.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }
}

/// Token usage information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// Full-text completion returned by a backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Completion {
    pub text: String,
    pub model: String,
    pub finish_reason: Option<String>,
    pub usage: Option<TokenUsage>,
}

impl Completion {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            model: String::new(),
            finish_reason: Some("stop".to_string()),
            usage: None,
        }
    }

    /// True when the backend stopped because it ran out of output tokens.
    pub fn is_truncated(&self) -> bool {
        matches!(
            self.finish_reason
                .as_deref()
                .map(str::to_ascii_lowercase)
                .as_deref(),
            Some("length") | Some("max_tokens")
        )
    }
}

/// Machine-readable detail attached to a backend error
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorDetail {
    /// The caller exhausted a quota.
    QuotaFailure { description: Option<String> },
    /// Suggested wait before retrying, formatted as `"<number>s"`.
    RetryInfo { retry_delay: String },
    Other { type_url: String },
}

/// Failure reported by a backend call
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct BackendError {
    pub status: Option<u16>,
    pub message: String,
    pub details: Vec<ErrorDetail>,
    pub timed_out: bool,
}

impl BackendError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            status: None,
            message: message.into(),
            details: Vec::new(),
            timed_out: false,
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_detail(mut self, detail: ErrorDetail) -> Self {
        self.details.push(detail);
        self
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self {
            timed_out: true,
            ..Self::new(message)
        }
    }

    /// Convenience constructor for a 429 with a `RetryInfo` delay.
    pub fn rate_limited(retry_delay: impl Into<String>) -> Self {
        Self::new("Resource has been exhausted (e.g. check quota).")
            .with_status(429)
            .with_detail(ErrorDetail::RetryInfo {
                retry_delay: retry_delay.into(),
            })
    }

    pub fn has_quota_failure(&self) -> bool {
        self.details
            .iter()
            .any(|d| matches!(d, ErrorDetail::QuotaFailure { .. }))
    }

    /// First `RetryInfo` delay string, if any.
    pub fn retry_delay_hint(&self) -> Option<&str> {
        self.details.iter().find_map(|d| match d {
            ErrorDetail::RetryInfo { retry_delay } => Some(retry_delay.as_str()),
            _ => None,
        })
    }
}

/// Streaming completion: a finite, non-restartable sequence of text chunks.
pub type CompletionStream = Pin<Box<dyn Stream<Item = Result<String, BackendError>> + Send>>;

/// Generation backend contract
#[async_trait]
pub trait GenerationBackend: Send + Sync {
    /// Generate the full completion text for a request.
    async fn complete(&self, request: &BackendRequest) -> Result<Completion, BackendError>;

    /// Start a streaming completion.
    async fn stream(&self, request: &BackendRequest) -> Result<CompletionStream, BackendError>;

    fn backend_name(&self) -> &str;

    fn model_name(&self) -> &str;
}

// Scripted backend for unit tests
#[cfg(test)]
pub struct ScriptedBackend {
    responses: parking_lot::Mutex<std::collections::VecDeque<Result<Completion, BackendError>>>,
    calls: std::sync::atomic::AtomicUsize,
}

#[cfg(test)]
impl ScriptedBackend {
    pub fn new(responses: Vec<Result<Completion, BackendError>>) -> Self {
        Self {
            responses: parking_lot::Mutex::new(responses.into()),
            calls: std::sync::atomic::AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[cfg(test)]
#[async_trait]
impl GenerationBackend for ScriptedBackend {
    async fn complete(&self, _request: &BackendRequest) -> Result<Completion, BackendError> {
        self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        self.responses
            .lock()
            .pop_front()
            .unwrap_or_else(|| Ok(Completion::new("Scripted response")))
    }

    async fn stream(&self, request: &BackendRequest) -> Result<CompletionStream, BackendError> {
        let completion = self.complete(request).await?;
        let chunks: Vec<Result<String, BackendError>> = completion
            .text
            .split_inclusive(' ')
            .map(|c| Ok(c.to_string()))
            .collect();
        Ok(Box::pin(futures::stream::iter(chunks)))
    }

    fn backend_name(&self) -> &str {
        "scripted"
    }

    fn model_name(&self) -> &str {
        "scripted-model"
    }
}
