//! CLI route: single route table and run context. Dispatches to domain services and presentation.

use crate::config::{ConfigLoader, ScribeConfig};
use crate::context::{AssembleOptions, ContextAssembler, ContextCache, FsDocumentStore};
use crate::error::ApiError;
use crate::executor::{drain_stream_with, ExecutionRequest, RequestExecutor, StreamOutcome};
use crate::generation::{
    BatchOrchestrator, GenerationJob, JsonDirPersistence, PromptBatchGenerator,
};
use crate::progress::{AbortSignal, ProgressEvent};
use crate::provider::http::OpenAiCompatibleBackend;
use crate::provider::GenerationBackend;
use crate::queue::RequestQueue;
use crate::types::ProjectId;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, info_span, warn};

use crate::cli::parse::Commands;
use crate::cli::presentation::{
    format_context_json_output, format_context_text_output, format_progress_line,
    format_run_summary_json, format_run_summary_text,
};
use crate::cli::{command_name, command_project};

/// Runtime context for CLI execution: resolved config and the shared context assembler.
/// The assembler (and its cache) lives for the whole process.
pub struct RunContext {
    config: ScribeConfig,
    projects_dir: PathBuf,
    assembler: Arc<ContextAssembler>,
}

impl RunContext {
    /// Create run context from workspace root and optional config path.
    ///
    /// Project manifests are read from `projects_dir`, defaulting to `<workspace>/projects`.
    pub fn new(
        workspace_root: PathBuf,
        config_path: Option<PathBuf>,
        projects_dir: Option<PathBuf>,
    ) -> Result<Self, ApiError> {
        let config = if let Some(ref cfg_path) = config_path {
            ConfigLoader::load_from_file(cfg_path)?
        } else {
            ConfigLoader::load(&workspace_root)?
        };

        if let Err(errors) = config.validate() {
            let joined = errors
                .iter()
                .map(|e| e.to_string())
                .collect::<Vec<_>>()
                .join("; ");
            return Err(ApiError::ConfigError(joined));
        }

        let projects_dir = projects_dir.unwrap_or_else(|| workspace_root.join("projects"));
        let store = Arc::new(FsDocumentStore::new(projects_dir.clone()));
        let cache = Arc::new(ContextCache::new(config.cache.ttl()));
        let assembler =
            Arc::new(ContextAssembler::new(store, cache).with_budget(config.token_budget()));

        Ok(Self {
            config,
            projects_dir,
            assembler,
        })
    }

    pub fn config(&self) -> &ScribeConfig {
        &self.config
    }

    pub fn projects_dir(&self) -> &Path {
        &self.projects_dir
    }

    /// Execute a command on a fresh tokio runtime.
    pub fn execute(&self, command: &Commands) -> Result<String, ApiError> {
        let span = info_span!(
            "command",
            name = command_name(command),
            project = command_project(command).unwrap_or("-")
        );
        let _entered = span.enter();
        let started = Instant::now();

        let rt = tokio::runtime::Runtime::new()
            .map_err(|e| ApiError::Io(format!("Failed to create tokio runtime: {}", e)))?;
        let result = rt.block_on(self.dispatch(command));

        info!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            ok = result.is_ok(),
            "Command finished"
        );
        result
    }

    async fn dispatch(&self, command: &Commands) -> Result<String, ApiError> {
        match command {
            Commands::Context {
                project,
                format,
                show_text,
            } => self.handle_context(project, format, *show_text).await,
            Commands::Generate {
                project,
                jobs,
                out,
                batch_size,
                format,
            } => {
                self.handle_generate(project, jobs, out, *batch_size, format)
                    .await
            }
            Commands::Stream {
                project,
                prompt,
                no_context,
            } => self.handle_stream(project, prompt, *no_context).await,
            Commands::Config => self.config.to_toml_string(),
        }
    }

    async fn handle_context(
        &self,
        project: &str,
        format: &str,
        show_text: bool,
    ) -> Result<String, ApiError> {
        let project_id = ProjectId::new(project);
        let context = self
            .assembler
            .assemble(&project_id, AssembleOptions::default())
            .await?;
        let validation = self.assembler.validate(&context);
        match format {
            "json" => format_context_json_output(&context, &validation, show_text),
            _ => Ok(format_context_text_output(&context, &validation, show_text)),
        }
    }

    async fn handle_generate(
        &self,
        project: &str,
        jobs_path: &Path,
        out_dir: &Path,
        batch_size: Option<usize>,
        format: &str,
    ) -> Result<String, ApiError> {
        let raw = std::fs::read_to_string(jobs_path).map_err(|e| {
            ApiError::Io(format!("Failed to read jobs file {}: {}", jobs_path.display(), e))
        })?;
        let jobs: Vec<GenerationJob> = serde_json::from_str(&raw)?;

        let mut batch_config = self.config.batch.clone();
        if let Some(size) = batch_size {
            if size == 0 {
                return Err(ApiError::ConfigError(
                    "--batch-size must be at least 1".to_string(),
                ));
            }
            batch_config.max_batch_size = size;
        }

        // One wait ceiling for the run, covering executor and orchestrator sleeps alike.
        let wait_budget = batch_config.rate_limit_budget();
        let executor = Arc::new(self.executor()?.with_rate_limit_budget(wait_budget.clone()));
        let queue = RequestQueue::start(self.config.queue.clone());
        let generator = Arc::new(
            PromptBatchGenerator::new(executor, Arc::clone(&queue))
                .with_temperature(self.config.backend.temperature)
                .with_max_retries(self.config.backend.max_retries),
        );
        let persistence = Arc::new(JsonDirPersistence::new(out_dir)?);
        let orchestrator =
            BatchOrchestrator::new(Arc::clone(&self.assembler), generator, persistence)
                .with_config(batch_config)
                .with_rate_limit_budget(wait_budget);

        let abort = AbortSignal::new();
        let interrupt = watch_interrupt(abort.clone());
        let on_progress = |event: &ProgressEvent| eprintln!("{}", format_progress_line(event));

        let result = orchestrator
            .run(&ProjectId::new(project), jobs, &on_progress, &abort)
            .await;

        interrupt.abort();
        queue.shutdown().await;

        let summary = result?;
        match format {
            "json" => format_run_summary_json(&summary, out_dir),
            _ => Ok(format_run_summary_text(&summary, out_dir)),
        }
    }

    async fn handle_stream(
        &self,
        project: &str,
        prompt: &str,
        no_context: bool,
    ) -> Result<String, ApiError> {
        let full_prompt = if no_context {
            prompt.to_string()
        } else {
            let context = self
                .assembler
                .assemble(&ProjectId::new(project), AssembleOptions::default())
                .await?;
            format!("{}\n# Request\n{}", context.render(), prompt)
        };

        let executor = self.executor()?;
        let request = ExecutionRequest::new(full_prompt, "stream")
            .with_temperature(self.config.backend.temperature);
        let stream = executor.execute_stream(&request).await.map_err(|result| {
            ApiError::GenerationFailed(
                result
                    .failure_reason()
                    .unwrap_or_else(|| "stream could not be opened".to_string()),
            )
        })?;

        let abort = AbortSignal::new();
        let interrupt = watch_interrupt(abort.clone());
        let stdout = std::io::stdout();
        let outcome = drain_stream_with(stream, &abort, |chunk| {
            let mut handle = stdout.lock();
            // A closed stdout only loses output; the stream itself keeps draining.
            let _ = handle.write_all(chunk.as_bytes());
            let _ = handle.flush();
        })
        .await;
        interrupt.abort();

        match outcome {
            StreamOutcome::Complete(text) => {
                info!(chars = text.len(), "Stream complete");
                Ok(String::new())
            }
            StreamOutcome::Incomplete => Err(ApiError::GenerationFailed(
                "stream interrupted before completion".to_string(),
            )),
            StreamOutcome::Failed(message) => Err(ApiError::Backend(message)),
        }
    }

    fn backend(&self) -> Result<Arc<dyn GenerationBackend>, ApiError> {
        let backend = &self.config.backend;
        let api_key = backend.resolve_api_key();
        if api_key.is_none() {
            warn!(
                env = %backend.api_key_env,
                "No API key configured, sending unauthenticated requests"
            );
        }
        Ok(Arc::new(OpenAiCompatibleBackend::new(
            &backend.model,
            api_key,
            &backend.base_url,
        )?))
    }

    fn executor(&self) -> Result<RequestExecutor, ApiError> {
        Ok(RequestExecutor::new(self.backend()?)
            .with_budget(self.config.token_budget())
            .with_config(self.config.executor.clone()))
    }
}

/// Abort the signal on Ctrl-C. The returned handle is aborted once the work is done.
fn watch_interrupt(abort: AbortSignal) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, finishing in-flight work and stopping");
            abort.abort();
        }
    })
}
