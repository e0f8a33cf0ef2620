//! OpenAI-compatible HTTP backend.
//!
//! Speaks the `/chat/completions` protocol, both buffered and as server-sent events.
//! Error bodies in the Google RPC shape (`{"error":{"code","message","status","details"}}`)
//! and the OpenAI shape (`{"error":{"message","type"}}`) are both understood, and a
//! `Retry-After` header is surfaced as a `RetryInfo` detail.

use super::{
    BackendError, BackendRequest, Completion, CompletionStream, ErrorDetail, GenerationBackend,
    TokenUsage,
};
use crate::error::ApiError;
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use reqwest::header::RETRY_AFTER;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::pin::Pin;
use std::time::Duration;
use tracing::debug;

const BACKEND_HTTP_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const BACKEND_HTTP_REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

// Whole-request timeout. Streams stay open as long as the server keeps sending.
fn request_timeout(stream: bool) -> Option<Duration> {
    (!stream).then_some(BACKEND_HTTP_REQUEST_TIMEOUT)
}

#[derive(Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    stream: bool,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    model: String,
    choices: Vec<Choice>,
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct Choice {
    message: ResponseMessage,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct Usage {
    prompt_tokens: u32,
    completion_tokens: u32,
    total_tokens: u32,
}

fn build_backend_http_client() -> Result<Client, ApiError> {
    Client::builder()
        .connect_timeout(BACKEND_HTTP_CONNECT_TIMEOUT)
        .build()
        .map_err(|e| ApiError::Backend(format!("Failed to create HTTP client: {}", e)))
}

// Map transport-level failures to BackendError
fn map_http_error(error: reqwest::Error) -> BackendError {
    if error.is_timeout() {
        BackendError::timeout(format!("Request timeout: {}", error))
    } else if let Some(status) = error.status() {
        BackendError::new(format!("Request failed with status {}: {}", status, error))
            .with_status(status.as_u16())
    } else if error.is_connect() {
        BackendError::new(format!("Connection error: {}", error))
    } else {
        BackendError::new(format!("HTTP error: {}", error))
    }
}

/// Parse an error response body into a [`BackendError`].
pub fn parse_error_body(status: u16, body: &str, retry_after: Option<&str>) -> BackendError {
    let mut err = BackendError::new(format!("Request failed with status {}", status)).with_status(status);

    if let Ok(value) = serde_json::from_str::<Value>(body) {
        let error = value.get("error").unwrap_or(&value);
        if let Some(message) = error.get("message").and_then(Value::as_str) {
            err.message = message.to_string();
        }
        if let Some(kind) = error
            .get("status")
            .or_else(|| error.get("type"))
            .and_then(Value::as_str)
        {
            let kind_lower = kind.to_ascii_lowercase();
            if kind_lower.contains("resource_exhausted") || kind_lower.contains("rate_limit") {
                err.details.push(ErrorDetail::QuotaFailure {
                    description: Some(kind.to_string()),
                });
            }
        }
        if let Some(details) = error.get("details").and_then(Value::as_array) {
            for detail in details {
                err.details.push(parse_error_detail(detail));
            }
        }
    } else if !body.trim().is_empty() {
        err.message = body.trim().to_string();
    }

    if err.retry_delay_hint().is_none() {
        if let Some(seconds) = retry_after.and_then(|h| h.trim().parse::<u64>().ok()) {
            err.details.push(ErrorDetail::RetryInfo {
                retry_delay: format!("{}s", seconds),
            });
        }
    }

    err
}

fn parse_error_detail(detail: &Value) -> ErrorDetail {
    let type_url = detail
        .get("@type")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    if type_url.ends_with("RetryInfo") {
        if let Some(delay) = detail.get("retryDelay").and_then(Value::as_str) {
            return ErrorDetail::RetryInfo {
                retry_delay: delay.to_string(),
            };
        }
    }
    if type_url.ends_with("QuotaFailure") {
        let description = detail
            .get("violations")
            .and_then(Value::as_array)
            .and_then(|v| v.first())
            .and_then(|v| v.get("description").or_else(|| v.get("quotaMetric")))
            .and_then(Value::as_str)
            .map(str::to_string);
        return ErrorDetail::QuotaFailure { description };
    }
    ErrorDetail::Other { type_url }
}

/// One parsed server-sent-event line
#[derive(Debug, PartialEq)]
enum SseLine {
    Delta(String),
    Done,
    Skip,
}

fn parse_sse_line(line: &str) -> Result<SseLine, BackendError> {
    let Some(data) = line.strip_prefix("data:") else {
        return Ok(SseLine::Skip);
    };
    let data = data.trim();
    if data == "[DONE]" {
        return Ok(SseLine::Done);
    }
    if data.is_empty() {
        return Ok(SseLine::Skip);
    }

    let value: Value = serde_json::from_str(data)
        .map_err(|e| BackendError::new(format!("Malformed stream chunk: {}", e)))?;
    if let Some(error) = value.get("error") {
        let status = error.get("code").and_then(Value::as_u64).unwrap_or(500) as u16;
        return Err(parse_error_body(status, &value.to_string(), None));
    }
    let delta = value
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|c| c.first())
        .and_then(|c| c.get("delta"))
        .and_then(|d| d.get("content"))
        .and_then(Value::as_str)
        .unwrap_or_default();
    if delta.is_empty() {
        Ok(SseLine::Skip)
    } else {
        Ok(SseLine::Delta(delta.to_string()))
    }
}

type ByteStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>, BackendError>> + Send>>;

struct SseState {
    inner: ByteStream,
    buffer: Vec<u8>,
    pending: VecDeque<String>,
    done: bool,
}

impl SseState {
    // Drain complete lines out of the buffer; returns Err on a malformed or error chunk.
    fn drain_lines(&mut self, flush: bool) -> Result<(), BackendError> {
        loop {
            let line_bytes: Vec<u8> = match self.buffer.iter().position(|b| *b == b'\n') {
                Some(pos) => self.buffer.drain(..=pos).collect(),
                None if flush && !self.buffer.is_empty() => std::mem::take(&mut self.buffer),
                None => return Ok(()),
            };
            let line = String::from_utf8_lossy(&line_bytes);
            match parse_sse_line(line.trim())? {
                SseLine::Delta(text) => self.pending.push_back(text),
                SseLine::Done => {
                    self.done = true;
                    self.buffer.clear();
                    return Ok(());
                }
                SseLine::Skip => {}
            }
        }
    }
}

/// Turn a raw SSE byte stream into a stream of text deltas.
fn sse_text_stream(inner: ByteStream) -> CompletionStream {
    let state = SseState {
        inner,
        buffer: Vec::new(),
        pending: VecDeque::new(),
        done: false,
    };

    Box::pin(futures::stream::unfold(state, |mut state| async move {
        loop {
            if let Some(text) = state.pending.pop_front() {
                return Some((Ok(text), state));
            }
            if state.done {
                return None;
            }
            match state.inner.next().await {
                Some(Ok(bytes)) => {
                    state.buffer.extend_from_slice(&bytes);
                    if let Err(e) = state.drain_lines(false) {
                        state.done = true;
                        state.pending.clear();
                        return Some((Err(e), state));
                    }
                }
                Some(Err(e)) => {
                    state.done = true;
                    return Some((Err(e), state));
                }
                None => {
                    let flushed = state.drain_lines(true);
                    state.done = true;
                    if let Err(e) = flushed {
                        state.pending.clear();
                        return Some((Err(e), state));
                    }
                }
            }
        }
    }))
}

/// Backend speaking the OpenAI chat-completions protocol
pub struct OpenAiCompatibleBackend {
    client: Client,
    model: String,
    api_key: Option<String>,
    base_url: String,
}

impl OpenAiCompatibleBackend {
    pub fn new(
        model: impl Into<String>,
        api_key: Option<String>,
        base_url: impl Into<String>,
    ) -> Result<Self, ApiError> {
        let model = model.into();
        if model.trim().is_empty() {
            return Err(ApiError::BackendNotConfigured(
                "Model name cannot be empty".to_string(),
            ));
        }
        Ok(Self {
            client: build_backend_http_client()?,
            model,
            api_key,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn body<'a>(&'a self, request: &'a BackendRequest, stream: bool) -> ChatCompletionRequest<'a> {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = request.system_instruction.as_deref() {
            messages.push(ChatMessage {
                role: "system",
                content: system,
            });
        }
        messages.push(ChatMessage {
            role: "user",
            content: &request.prompt,
        });
        ChatCompletionRequest {
            model: &self.model,
            messages,
            temperature: request.temperature,
            stream,
        }
    }

    async fn send(
        &self,
        request: &BackendRequest,
        stream: bool,
    ) -> Result<reqwest::Response, BackendError> {
        let url = format!("{}/chat/completions", self.base_url);
        let mut builder = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .json(&self.body(request, stream));
        if let Some(key) = &self.api_key {
            builder = builder.header("Authorization", format!("Bearer {}", key));
        }
        if let Some(timeout) = request_timeout(stream) {
            builder = builder.timeout(timeout);
        }

        debug!(url = %url, model = %self.model, stream, "Sending backend request");
        let response = builder.send().await.map_err(map_http_error)?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(parse_error_body(status, &body, retry_after.as_deref()));
        }
        Ok(response)
    }
}

#[async_trait]
impl GenerationBackend for OpenAiCompatibleBackend {
    async fn complete(&self, request: &BackendRequest) -> Result<Completion, BackendError> {
        let response = self.send(request, false).await?;
        let completion: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| BackendError::new(format!("Failed to parse response: {}", e)))?;

        let choice = completion
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| BackendError::new("No choices in response"))?;

        Ok(Completion {
            text: choice.message.content.unwrap_or_default(),
            model: completion.model,
            finish_reason: choice.finish_reason,
            usage: completion.usage.map(|u| TokenUsage {
                prompt_tokens: u.prompt_tokens,
                completion_tokens: u.completion_tokens,
                total_tokens: u.total_tokens,
            }),
        })
    }

    async fn stream(&self, request: &BackendRequest) -> Result<CompletionStream, BackendError> {
        let response = self.send(request, true).await?;
        let bytes: ByteStream = Box::pin(
            response
                .bytes_stream()
                .map(|chunk| chunk.map(|b| b.to_vec()).map_err(map_http_error)),
        );
        Ok(sse_text_stream(bytes))
    }

    fn backend_name(&self) -> &str {
        "openai-compatible"
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}
