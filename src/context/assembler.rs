//! Context Assembler
//!
//! Builds a [`ProjectContext`] from the document store on cache miss and serves it from
//! the shared [`ContextCache`] on hit. Validation checks the combined token estimate
//! against the hard ceiling and the soft warning threshold.

use super::cache::ContextCache;
use super::store::{DocumentStore, SourceDocument};
use super::{ContextValidation, ProjectContext};
use crate::error::ApiError;
use crate::tokens::{BudgetCheck, TokenBudget, TokenEstimator};
use crate::types::ProjectId;
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Options for [`ContextAssembler::assemble`]
#[derive(Debug, Clone, Copy, Default)]
pub struct AssembleOptions {
    /// Bypass the cache and rebuild from the store.
    pub skip_cache: bool,
}

pub struct ContextAssembler {
    store: Arc<dyn DocumentStore>,
    cache: Arc<ContextCache>,
    estimator: TokenEstimator,
    budget: TokenBudget,
}

impl ContextAssembler {
    pub fn new(store: Arc<dyn DocumentStore>, cache: Arc<ContextCache>) -> Self {
        Self {
            store,
            cache,
            estimator: TokenEstimator::new(),
            budget: TokenBudget::default(),
        }
    }

    pub fn with_estimator(mut self, estimator: TokenEstimator) -> Self {
        self.estimator = estimator;
        self
    }

    pub fn with_budget(mut self, budget: TokenBudget) -> Self {
        self.budget = budget;
        self
    }

    pub fn cache(&self) -> &Arc<ContextCache> {
        &self.cache
    }

    pub async fn assemble(
        &self,
        project_id: &ProjectId,
        options: AssembleOptions,
    ) -> Result<ProjectContext, ApiError> {
        if !options.skip_cache {
            if let Some(cached) = self.cache.get(project_id) {
                debug!(project_id = %project_id, tokens = cached.token_estimate, "Context cache hit");
                return Ok(cached);
            }
        }

        let metadata = self.store.fetch_project(project_id).await?;
        let capabilities = self.store.fetch_capability_docs(project_id).await?;
        let requirements = self.store.fetch_requirement_docs(project_id).await?;

        let capability_text = concatenate(&capabilities);
        let requirement_text = concatenate(&requirements);
        let metadata_json = serde_json::to_string(&metadata)?;

        let token_estimate = self.estimator.estimate(&capability_text)
            + self.estimator.estimate(&requirement_text)
            + self.estimator.estimate(&metadata_json);

        let context = ProjectContext {
            project_id: project_id.clone(),
            metadata,
            capability_text: Arc::from(capability_text),
            requirement_text: Arc::from(requirement_text),
            token_estimate,
            assembled_at: Utc::now(),
            from_cache: false,
        };

        info!(
            project_id = %project_id,
            capability_docs = capabilities.len(),
            requirement_docs = requirements.len(),
            tokens = token_estimate,
            "Assembled project context"
        );

        self.cache.insert(context.clone());
        Ok(context)
    }

    /// Drop cached contexts. Call after mutating a project's documents.
    pub fn invalidate(&self, project_id: Option<&ProjectId>) {
        self.cache.invalidate(project_id);
    }

    pub fn validate(&self, context: &ProjectContext) -> ContextValidation {
        let tokens = context.token_estimate;
        match self.budget.check(tokens) {
            BudgetCheck::OverLimit { tokens, ceiling } => ContextValidation {
                valid: false,
                token_estimate: tokens,
                warning: Some(format!(
                    "Context is ~{} tokens, which exceeds the {} token limit. \
                     Remove or shorten documents before generating.",
                    format_thousands(tokens),
                    format_thousands(ceiling)
                )),
            },
            BudgetCheck::NearLimit { tokens, threshold } => {
                warn!(
                    project_id = %context.project_id,
                    tokens,
                    threshold,
                    "Context is approaching the token limit"
                );
                ContextValidation {
                    valid: true,
                    token_estimate: tokens,
                    warning: Some(format!(
                        "Context is ~{} tokens, close to the {} token limit.",
                        format_thousands(tokens),
                        format_thousands(self.budget.ceiling)
                    )),
                }
            }
            BudgetCheck::WithinBudget => ContextValidation {
                valid: true,
                token_estimate: tokens,
                warning: None,
            },
        }
    }
}

fn concatenate(docs: &[SourceDocument]) -> String {
    docs.iter()
        .filter_map(|doc| doc.usable_text().map(|text| format!("{}\n{}\n", doc.header(), text)))
        .collect::<Vec<_>>()
        .join("\n")
}

// 64000 -> "64,000"
fn format_thousands(value: usize) -> String {
    let digits = value.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out
}
