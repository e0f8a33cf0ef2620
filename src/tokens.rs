//! Token Budget Estimation
//!
//! Estimates how many backend tokens a piece of text will cost and checks counts against
//! the per-request ceiling. The primary path runs the `cl100k_base` BPE tokenizer; when the
//! tokenizer cannot be loaded or fails while encoding, the estimate degrades to
//! `ceil(chars / 4)`. Estimation never fails.

use serde::{Deserialize, Serialize};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::OnceLock;
use tiktoken_rs::CoreBPE;
use tracing::warn;

/// Hard per-request token ceiling.
pub const DEFAULT_TOKEN_CEILING: usize = 64_000;

/// Fraction of the ceiling above which a non-fatal warning is raised.
pub const DEFAULT_SOFT_RATIO: f64 = 0.8;

/// Characters per token used by the fallback heuristic.
const CHARS_PER_TOKEN: usize = 4;

static SHARED_TOKENIZER: OnceLock<Option<CoreBPE>> = OnceLock::new();

fn shared_tokenizer() -> Option<&'static CoreBPE> {
    SHARED_TOKENIZER
        .get_or_init(|| match tiktoken_rs::cl100k_base() {
            Ok(bpe) => Some(bpe),
            Err(e) => {
                warn!(error = %e, "Failed to load cl100k_base tokenizer, using character heuristic");
                None
            }
        })
        .as_ref()
}

/// Character heuristic: `ceil(chars / 4)`, zero for empty text.
pub fn heuristic_tokens(text: &str) -> usize {
    let chars = text.chars().count();
    chars.div_ceil(CHARS_PER_TOKEN)
}

/// Token estimator with graceful degradation.
#[derive(Clone, Copy)]
pub struct TokenEstimator {
    tokenizer: Option<&'static CoreBPE>,
}

impl TokenEstimator {
    /// Estimator backed by the process-wide BPE tokenizer (loaded once, lazily).
    pub fn new() -> Self {
        Self {
            tokenizer: shared_tokenizer(),
        }
    }

    /// Estimator that always uses the character heuristic.
    pub fn heuristic() -> Self {
        Self { tokenizer: None }
    }

    /// Whether the accurate tokenizer path is available.
    pub fn has_tokenizer(&self) -> bool {
        self.tokenizer.is_some()
    }

    /// Estimate the token count of `text`.
    ///
    /// Returns 0 for empty text and at least 1 otherwise.
    pub fn estimate(&self, text: &str) -> usize {
        if text.is_empty() {
            return 0;
        }

        let counted = self.tokenizer.and_then(|bpe| {
            catch_unwind(AssertUnwindSafe(|| bpe.encode_ordinary(text).len())).ok()
        });

        match counted {
            Some(count) => count.max(1),
            None => heuristic_tokens(text).max(1),
        }
    }
}

impl Default for TokenEstimator {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TokenEstimator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenEstimator")
            .field("tokenizer", &self.has_tokenizer())
            .finish()
    }
}

/// Result of checking a token count against a [`TokenBudget`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetCheck {
    WithinBudget,
    /// Above the soft threshold but still under the ceiling.
    NearLimit { tokens: usize, threshold: usize },
    /// Above the hard ceiling.
    OverLimit { tokens: usize, ceiling: usize },
}

/// Per-request token ceiling with a soft warning threshold.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TokenBudget {
    pub ceiling: usize,
    pub soft_ratio: f64,
}

impl TokenBudget {
    pub fn new(ceiling: usize, soft_ratio: f64) -> Self {
        Self {
            ceiling,
            soft_ratio,
        }
    }

    /// Token count above which a warning is raised (51,200 for the defaults).
    pub fn soft_threshold(&self) -> usize {
        (self.ceiling as f64 * self.soft_ratio).floor() as usize
    }

    pub fn check(&self, tokens: usize) -> BudgetCheck {
        if tokens > self.ceiling {
            BudgetCheck::OverLimit {
                tokens,
                ceiling: self.ceiling,
            }
        } else if tokens > self.soft_threshold() {
            BudgetCheck::NearLimit {
                tokens,
                threshold: self.soft_threshold(),
            }
        } else {
            BudgetCheck::WithinBudget
        }
    }
}

impl Default for TokenBudget {
    fn default() -> Self {
        Self::new(DEFAULT_TOKEN_CEILING, DEFAULT_SOFT_RATIO)
    }
}
