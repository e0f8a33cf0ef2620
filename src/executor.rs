//! Request Executor
//!
//! Performs one resilient call to the generation backend. Every call resolves to an
//! [`ExecutionResult`]; backend failures are classified as rate limits or transient
//! errors and retried here, so callers branch on outcomes instead of catching errors.
//!
//! Retry policy:
//! - rate limited: sleep the server-suggested delay (default 60s, at most one hour),
//!   retry without advancing the exponential backoff. With a [`RateLimitBudget`]
//!   attached, a wait the budget cannot cover ends the call as rate limited instead.
//! - transient: sleep `initial_backoff * 2^n`, retry
//! - over the token ceiling: refused before any network call

use crate::progress::{AbortSignal, RateLimitBudget};
use crate::provider::{BackendError, BackendRequest, Completion, CompletionStream, GenerationBackend};
use crate::tokens::{BudgetCheck, TokenBudget, TokenEstimator};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Default number of retries after the first attempt.
pub const DEFAULT_MAX_RETRIES: u32 = 4;

/// Wait used when a rate-limit error carries no parsable delay.
pub const DEFAULT_RATE_LIMIT_WAIT: Duration = Duration::from_secs(60);

/// Longest server-suggested wait honoured; larger hints are clamped to it.
pub const MAX_RATE_LIMIT_WAIT: Duration = Duration::from_secs(3600);

const RATE_LIMIT_TERMS: &[&str] = &[
    "quota",
    "rate limit",
    "rate-limit",
    "ratelimit",
    "rate_limit",
    "resource_exhausted",
    "resource has been exhausted",
    "too many requests",
];

/// Executor timing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Wall-clock timeout for each backend call (milliseconds)
    pub request_timeout_ms: u64,
    /// First transient backoff (milliseconds); doubles per transient failure
    pub initial_backoff_ms: u64,
    /// Rate-limit wait when the backend gives no hint (milliseconds)
    pub default_rate_limit_wait_ms: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 30_000,
            initial_backoff_ms: 1_000,
            default_rate_limit_wait_ms: DEFAULT_RATE_LIMIT_WAIT.as_millis() as u64,
        }
    }
}

impl ExecutorConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn default_rate_limit_wait(&self) -> Duration {
        Duration::from_millis(self.default_rate_limit_wait_ms)
    }
}

/// One generation call to execute
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub prompt: String,
    pub system_instruction: Option<String>,
    pub temperature: f32,
    pub max_retries: u32,
    /// Free-form label used in logs (e.g. "batch", "stream", "section").
    pub request_type: String,
}

impl ExecutionRequest {
    pub fn new(prompt: impl Into<String>, request_type: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            system_instruction: None,
            temperature: 0.7,
            max_retries: DEFAULT_MAX_RETRIES,
            request_type: request_type.into(),
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

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    fn backend_request(&self) -> BackendRequest {
        let request = BackendRequest::new(self.prompt.clone()).with_temperature(self.temperature);
        match &self.system_instruction {
            Some(instruction) => request.with_system_instruction(instruction.clone()),
            None => request,
        }
    }
}

/// Tagged outcome of one executor call
#[derive(Debug, Clone)]
pub enum ExecutionResult {
    Success(Completion),
    /// The prompt exceeds the hard token ceiling; nothing was sent.
    TokenLimitExceeded { estimated: usize, limit: usize },
    /// Rate-limit retries exhausted.
    RateLimited { retry_delay: Duration, message: String },
    /// Any other failure, after retries were exhausted.
    Transient { message: String },
}

impl ExecutionResult {
    pub fn is_success(&self) -> bool {
        matches!(self, ExecutionResult::Success(_))
    }

    pub fn is_rate_limit_error(&self) -> bool {
        matches!(self, ExecutionResult::RateLimited { .. })
    }

    /// Suggested wait in whole seconds (rounded up) for a rate-limited result.
    pub fn retry_delay_seconds(&self) -> Option<u64> {
        match self {
            ExecutionResult::RateLimited { retry_delay, .. } => {
                let millis = retry_delay.as_millis() as u64;
                Some(millis.div_ceil(1000))
            }
            _ => None,
        }
    }

    pub fn completion(&self) -> Option<&Completion> {
        match self {
            ExecutionResult::Success(completion) => Some(completion),
            _ => None,
        }
    }

    /// Human-readable reason for a non-success outcome.
    pub fn failure_reason(&self) -> Option<String> {
        match self {
            ExecutionResult::Success(_) => None,
            ExecutionResult::TokenLimitExceeded { estimated, limit } => Some(format!(
                "Request is ~{} tokens, above the {} token limit",
                estimated, limit
            )),
            ExecutionResult::RateLimited { retry_delay, .. } => Some(format!(
                "Rate limit reached, try again in {} seconds",
                retry_delay.as_millis().div_ceil(1000)
            )),
            ExecutionResult::Transient { message } => Some(message.clone()),
        }
    }
}

/// Classification of a single backend failure
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureKind {
    RateLimited { retry_delay: Duration },
    Transient,
}

/// Parse a `"<number>s"` delay such as `"12s"` or `"1.5s"`, clamped to
/// [`MAX_RATE_LIMIT_WAIT`].
pub fn parse_retry_delay(value: &str) -> Option<Duration> {
    let seconds: f64 = value.trim().strip_suffix('s')?.trim().parse().ok()?;
    if !seconds.is_finite() || seconds < 0.0 {
        return None;
    }
    let delay = Duration::try_from_secs_f64(seconds).unwrap_or(MAX_RATE_LIMIT_WAIT);
    Some(delay.min(MAX_RATE_LIMIT_WAIT))
}

/// Classify a backend failure as a rate limit or a transient error.
pub fn classify_error(error: &BackendError, default_wait: Duration) -> FailureKind {
    let message = error.message.to_ascii_lowercase();
    let rate_limited = error.status == Some(429)
        || error.has_quota_failure()
        || RATE_LIMIT_TERMS.iter().any(|term| message.contains(term));

    if rate_limited {
        let retry_delay = error
            .retry_delay_hint()
            .and_then(parse_retry_delay)
            .unwrap_or(default_wait);
        FailureKind::RateLimited { retry_delay }
    } else {
        FailureKind::Transient
    }
}

/// Result of draining a completion stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamOutcome {
    Complete(String),
    /// The caller aborted; partial output was discarded.
    Incomplete,
    Failed(String),
}

/// Collect a stream to completion, honouring an abort signal between chunks.
pub async fn drain_stream(stream: CompletionStream, abort: &AbortSignal) -> StreamOutcome {
    drain_stream_with(stream, abort, |_| {}).await
}

/// Like [`drain_stream`], handing each chunk to `on_chunk` as it arrives.
pub async fn drain_stream_with<F>(
    mut stream: CompletionStream,
    abort: &AbortSignal,
    mut on_chunk: F,
) -> StreamOutcome
where
    F: FnMut(&str),
{
    let mut text = String::new();
    loop {
        if abort.is_aborted() {
            debug!(discarded_chars = text.len(), "Stream aborted by caller");
            return StreamOutcome::Incomplete;
        }
        match stream.next().await {
            Some(Ok(chunk)) => {
                on_chunk(&chunk);
                text.push_str(&chunk);
            }
            Some(Err(e)) => return StreamOutcome::Failed(e.message),
            None => break,
        }
    }
    if abort.is_aborted() {
        return StreamOutcome::Incomplete;
    }
    StreamOutcome::Complete(text)
}

/// Resilient single-call executor
pub struct RequestExecutor {
    backend: Arc<dyn GenerationBackend>,
    estimator: TokenEstimator,
    budget: TokenBudget,
    config: ExecutorConfig,
    rate_limit_budget: Option<RateLimitBudget>,
}

impl RequestExecutor {
    pub fn new(backend: Arc<dyn GenerationBackend>) -> Self {
        Self {
            backend,
            estimator: TokenEstimator::new(),
            budget: TokenBudget::default(),
            config: ExecutorConfig::default(),
            rate_limit_budget: None,
        }
    }

    pub fn with_budget(mut self, budget: TokenBudget) -> Self {
        self.budget = budget;
        self
    }

    pub fn with_estimator(mut self, estimator: TokenEstimator) -> Self {
        self.estimator = estimator;
        self
    }

    pub fn with_config(mut self, config: ExecutorConfig) -> Self {
        self.config = config;
        self
    }

    /// Charge rate-limit sleeps to a run-wide wait budget.
    pub fn with_rate_limit_budget(mut self, budget: RateLimitBudget) -> Self {
        self.rate_limit_budget = Some(budget);
        self
    }

    pub fn budget(&self) -> TokenBudget {
        self.budget
    }

    pub fn estimator(&self) -> TokenEstimator {
        self.estimator
    }

    pub fn backend(&self) -> &Arc<dyn GenerationBackend> {
        &self.backend
    }

    // Ok(()) to proceed, Err with the refusal otherwise
    fn preflight(&self, request: &ExecutionRequest) -> Result<(), ExecutionResult> {
        let estimated = self.estimator.estimate(&request.prompt);
        match self.budget.check(estimated) {
            BudgetCheck::OverLimit { tokens, ceiling } => {
                warn!(
                    request_type = %request.request_type,
                    tokens,
                    ceiling,
                    "Prompt exceeds token ceiling, refusing request"
                );
                Err(ExecutionResult::TokenLimitExceeded {
                    estimated: tokens,
                    limit: ceiling,
                })
            }
            BudgetCheck::NearLimit { tokens, threshold } => {
                warn!(
                    request_type = %request.request_type,
                    tokens,
                    threshold,
                    ceiling = self.budget.ceiling,
                    "Prompt is close to the token ceiling"
                );
                Ok(())
            }
            BudgetCheck::WithinBudget => Ok(()),
        }
    }

    async fn call_backend(&self, request: &BackendRequest) -> Result<Completion, BackendError> {
        let timeout = self.config.request_timeout();
        match tokio::time::timeout(timeout, self.backend.complete(request)).await {
            Ok(result) => result,
            Err(_) => Err(BackendError::timeout(format!(
                "Backend call timed out after {}ms",
                timeout.as_millis()
            ))),
        }
    }

    /// Execute one generation call with retry and backoff.
    pub async fn execute(&self, request: &ExecutionRequest) -> ExecutionResult {
        if let Err(refusal) = self.preflight(request) {
            return refusal;
        }

        let backend_request = request.backend_request();
        let mut transient_failures: u32 = 0;

        for attempt in 0..=request.max_retries {
            let error = match self.call_backend(&backend_request).await {
                Ok(completion) => {
                    debug!(
                        request_type = %request.request_type,
                        attempt,
                        finish_reason = ?completion.finish_reason,
                        "Backend call succeeded"
                    );
                    return ExecutionResult::Success(completion);
                }
                Err(error) => error,
            };

            let retries_left = attempt < request.max_retries;
            match classify_error(&error, self.config.default_rate_limit_wait()) {
                FailureKind::RateLimited { retry_delay } => {
                    if !retries_left {
                        warn!(
                            request_type = %request.request_type,
                            attempts = attempt + 1,
                            retry_delay_ms = retry_delay.as_millis() as u64,
                            "Rate limit retries exhausted"
                        );
                        return ExecutionResult::RateLimited {
                            retry_delay,
                            message: error.message,
                        };
                    }
                    if let Some(budget) = &self.rate_limit_budget {
                        if !budget.try_spend(retry_delay) {
                            warn!(
                                request_type = %request.request_type,
                                attempts = attempt + 1,
                                retry_delay_ms = retry_delay.as_millis() as u64,
                                spent_ms = budget.spent().as_millis() as u64,
                                limit_ms = budget.limit().as_millis() as u64,
                                "Rate limit wait budget exhausted"
                            );
                            return ExecutionResult::RateLimited {
                                retry_delay,
                                message: error.message,
                            };
                        }
                    }
                    info!(
                        request_type = %request.request_type,
                        attempt,
                        delay_ms = retry_delay.as_millis() as u64,
                        error = %error,
                        "Rate limited, waiting before retry"
                    );
                    sleep(retry_delay).await;
                }
                FailureKind::Transient => {
                    if !retries_left {
                        warn!(
                            request_type = %request.request_type,
                            attempts = attempt + 1,
                            error = %error,
                            "Transient retries exhausted"
                        );
                        return ExecutionResult::Transient {
                            message: error.message,
                        };
                    }
                    let backoff = self
                        .config
                        .initial_backoff()
                        .saturating_mul(2u32.saturating_pow(transient_failures));
                    transient_failures += 1;
                    warn!(
                        request_type = %request.request_type,
                        attempt,
                        delay_ms = backoff.as_millis() as u64,
                        timed_out = error.timed_out,
                        error = %error,
                        "Transient backend failure, backing off"
                    );
                    sleep(backoff).await;
                }
            }
        }

        // The loop always returns on its last iteration.
        ExecutionResult::Transient {
            message: "No attempts were made".to_string(),
        }
    }

    /// Start a streaming call after the same pre-flight check as [`execute`](Self::execute).
    ///
    /// There is no retry: a failure to open the stream is returned classified, and
    /// mid-stream errors surface as stream items.
    pub async fn execute_stream(
        &self,
        request: &ExecutionRequest,
    ) -> Result<CompletionStream, ExecutionResult> {
        self.preflight(request)?;

        let backend_request = request.backend_request();
        let timeout = self.config.request_timeout();
        let opened = match tokio::time::timeout(timeout, self.backend.stream(&backend_request)).await
        {
            Ok(result) => result,
            Err(_) => Err(BackendError::timeout(format!(
                "Opening stream timed out after {}ms",
                timeout.as_millis()
            ))),
        };

        opened.map_err(
            |error| match classify_error(&error, self.config.default_rate_limit_wait()) {
                FailureKind::RateLimited { retry_delay } => ExecutionResult::RateLimited {
                    retry_delay,
                    message: error.message,
                },
                FailureKind::Transient => ExecutionResult::Transient {
                    message: error.message,
                },
            },
        )
    }
}
