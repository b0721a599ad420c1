//! Context budget: window resolution and trigger thresholds.
//!
//! The effective context window for a session is resolved in order from a
//! session-scoped override, an explicit configuration value, a built-in table
//! keyed by model name, and finally [`DEFAULT_CONTEXT_WINDOW`]. The
//! [`ContextBudget`] turns that window plus a trigger fraction into the token
//! threshold the summarization engine compares against.

use crate::Message;
use crate::context::tokens::TokenEstimator;
use serde::Serialize;

/// Context window used when nothing else is known about the model.
pub const DEFAULT_CONTEXT_WINDOW: usize = 200_000;

/// Known context windows, keyed by model name without provider prefix.
const MODEL_CONTEXT_WINDOWS: &[(&str, usize)] = &[
    ("gemini-2.5-flash", 1_048_576),
    ("gemini-2.5-pro", 1_048_576),
    ("gemini-2.0-flash", 1_048_576),
    ("gemini-1.5-flash", 1_048_576),
    ("gemini-1.5-pro", 2_097_152),
    ("gpt-4o", 128_000),
    ("gpt-4o-mini", 128_000),
    ("gpt-4-turbo", 128_000),
    ("claude-3-opus", 200_000),
    ("claude-3-sonnet", 200_000),
    ("claude-3-haiku", 200_000),
    ("claude-3.5-sonnet", 200_000),
];

/// Look up the context window for a model identifier.
///
/// Provider prefixes (`"openai/gpt-4o"`) are stripped and matching is case
/// insensitive. Dated or suffixed variants (`"gpt-4o-2024-08-06"`) resolve to
/// the longest table entry they start with.
pub fn context_window_for_model(model: &str) -> Option<usize> {
    let name = model.rsplit('/').next().unwrap_or(model).to_lowercase();
    if name.is_empty() {
        return None;
    }
    MODEL_CONTEXT_WINDOWS
        .iter()
        .filter(|(key, _)| name.starts_with(key))
        .max_by_key(|(key, _)| key.len())
        .map(|&(_, window)| window)
}

/// Resolve the effective context window.
///
/// Precedence: session override, configured value, model table, default.
pub fn resolve_context_window(
    session_override: Option<usize>,
    configured: Option<usize>,
    model: &str,
) -> usize {
    session_override
        .filter(|&w| w > 0)
        .or(configured.filter(|&w| w > 0))
        .or_else(|| context_window_for_model(model))
        .unwrap_or(DEFAULT_CONTEXT_WINDOW)
}

/// A resolved context window plus the fraction of it that triggers action.
///
/// # Example
///
/// ```
/// use baton_rs::context::budget::ContextBudget;
///
/// let budget = ContextBudget::new(1_000).with_trigger_fraction(0.5);
/// assert_eq!(budget.threshold(), 500);
/// assert!(budget.exceeded_by(600));
/// ```
#[derive(Debug, Clone, Copy)]
pub struct ContextBudget {
    context_window: usize,
    trigger_fraction: f64,
}

impl ContextBudget {
    pub fn new(context_window: usize) -> Self {
        Self {
            context_window,
            trigger_fraction: 1.0,
        }
    }

    pub fn with_trigger_fraction(mut self, fraction: f64) -> Self {
        self.trigger_fraction = fraction.clamp(0.0, 1.0);
        self
    }

    pub fn context_window(&self) -> usize {
        self.context_window
    }

    /// Token count at which the budget is considered exceeded.
    pub fn threshold(&self) -> usize {
        (self.context_window as f64 * self.trigger_fraction) as usize
    }

    pub fn exceeded_by(&self, tokens: usize) -> bool {
        tokens >= self.threshold()
    }

    /// Estimate how much of the window a conversation occupies.
    pub fn estimate_usage(
        &self,
        messages: &[Message],
        estimator: &dyn TokenEstimator,
    ) -> ContextUsage {
        let estimated_tokens = estimator.estimate_conversation(messages);
        let usage_pct = if self.context_window > 0 {
            estimated_tokens as f64 / self.context_window as f64
        } else {
            1.0
        };
        ContextUsage {
            estimated_tokens,
            context_window: self.context_window,
            usage_pct,
        }
    }
}

/// Snapshot of context usage at a point in time.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ContextUsage {
    pub estimated_tokens: usize,
    pub context_window: usize,
    /// Usage as a fraction (0.0 to 1.0+).
    pub usage_pct: f64,
}

impl ContextUsage {
    /// Format as a short log-friendly string.
    pub fn to_log_string(&self) -> String {
        format!(
            "context: ~{} tokens ({:.0}% of {})",
            self.estimated_tokens,
            self.usage_pct * 100.0,
            self.context_window,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::tokens::CharRatioEstimator;

    #[test]
    fn table_lookup_strips_provider_prefix() {
        assert_eq!(context_window_for_model("gpt-4o"), Some(128_000));
        assert_eq!(context_window_for_model("openai/gpt-4o"), Some(128_000));
        assert_eq!(context_window_for_model("google/gemini-1.5-pro"), Some(2_097_152));
        assert_eq!(context_window_for_model("Claude-3-Opus"), Some(200_000));
    }

    #[test]
    fn table_lookup_prefers_longest_entry() {
        assert_eq!(context_window_for_model("gpt-4o-mini"), Some(128_000));
        assert_eq!(context_window_for_model("gpt-4o-2024-08-06"), Some(128_000));
        assert_eq!(context_window_for_model("gemini-2.5-flash-lite"), Some(1_048_576));
    }

    #[test]
    fn unknown_model_has_no_window() {
        assert_eq!(context_window_for_model("my-local-model"), None);
        assert_eq!(context_window_for_model(""), None);
    }

    #[test]
    fn resolution_precedence() {
        assert_eq!(resolve_context_window(Some(1_000), Some(5_000), "gpt-4o"), 1_000);
        assert_eq!(resolve_context_window(None, Some(5_000), "gpt-4o"), 5_000);
        assert_eq!(resolve_context_window(None, None, "gpt-4o"), 128_000);
        assert_eq!(
            resolve_context_window(None, None, "unknown"),
            DEFAULT_CONTEXT_WINDOW
        );
    }

    #[test]
    fn zero_overrides_are_ignored() {
        assert_eq!(resolve_context_window(Some(0), Some(0), "gpt-4o"), 128_000);
    }

    #[test]
    fn threshold_scales_window() {
        let budget = ContextBudget::new(1_000).with_trigger_fraction(0.85);
        assert!((849..=850).contains(&budget.threshold()));
        assert!(budget.exceeded_by(1_200));
        assert!(!budget.exceeded_by(100));
    }

    #[test]
    fn trigger_fraction_is_clamped() {
        assert_eq!(ContextBudget::new(100).with_trigger_fraction(3.0).threshold(), 100);
        assert_eq!(ContextBudget::new(100).with_trigger_fraction(-1.0).threshold(), 0);
    }

    #[test]
    fn usage_log_string_format() {
        let budget = ContextBudget::new(1_000);
        let messages = vec![Message::user("x".repeat(400))];
        let usage = budget.estimate_usage(&messages, &CharRatioEstimator::default());
        assert_eq!(usage.estimated_tokens, 100);
        assert_eq!(usage.to_log_string(), "context: ~100 tokens (10% of 1000)");
    }

    #[test]
    fn zero_window_reports_full_usage() {
        let usage =
            ContextBudget::new(0).estimate_usage(&[], &CharRatioEstimator::default());
        assert_eq!(usage.usage_pct, 1.0);
    }
}
