//! Context window management: estimation, budgets, truncation, and
//! summarization.
//!
//! Everything here runs inside the pre-completion hook,
//! [`SummarizationEngine::prepare`](engine::SummarizationEngine::prepare):
//!
//! 1. **[`tokens`]** — [`TokenEstimator`] turns text and messages into an
//!    approximate token count. [`CharRatioEstimator`] uses a fixed
//!    characters-per-token ratio.
//!
//! 2. **[`budget`]** — resolves the effective context window (session
//!    override, model table, default) and the trigger threshold.
//!
//! 3. **[`truncation`]** — optional pre-stage that shortens oversized
//!    arguments of write-type tool calls outside the keep window.
//!
//! 4. **[`engine`]** — partitions the conversation, offloads the older span
//!    through [`offload`], summarizes it with [`summarizer`] and splices the
//!    summary in front of the kept tail.
//!
//! [`transcript`] renders messages as readable text for both the offload log
//! and the summary prompt.

pub mod budget;
pub mod engine;
pub mod offload;
pub mod summarizer;
pub mod tokens;
pub mod transcript;
pub mod truncation;

// Re-export commonly used items at the module level.
pub use budget::{ContextBudget, ContextUsage, DEFAULT_CONTEXT_WINDOW, context_window_for_model};
pub use engine::{Prepared, SummarizationEngine, SummarizationState, SummaryReport};
pub use summarizer::SummarizationConfig;
pub use tokens::{CharRatioEstimator, DEFAULT_CHARS_PER_TOKEN, TokenEstimator};
pub use truncation::TruncateArgsConfig;
