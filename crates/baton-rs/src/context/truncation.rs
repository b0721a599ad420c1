//! Argument truncation: shorten oversized string arguments of old file-write
//! tool calls.
//!
//! A `write_file` call carries the whole file body as an argument and stays
//! in the conversation long after the file exists on the backend. This pass
//! runs before summarization and replaces long string arguments of selected
//! tools with a short prefix plus a marker, leaving the most recent messages
//! untouched. No LLM call is involved.

use crate::Message;
use crate::Part;
use crate::context::budget::ContextBudget;
use crate::context::tokens::TokenEstimator;
use crate::context::transcript::head_chars;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Marker appended to a truncated argument.
pub const DEFAULT_TRUNCATION_TEXT: &str = "...(argument truncated)";

/// Configuration for argument truncation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TruncateArgsConfig {
    /// Fraction of the context window at which truncation runs.
    pub trigger_fraction: f64,
    /// Most recent messages left untouched.
    pub keep_messages: usize,
    /// String arguments longer than this many characters are truncated.
    pub max_length: usize,
    /// Characters of the original value kept before the marker.
    pub prefix_chars: usize,
    pub truncation_text: String,
    /// Tool names whose arguments are eligible.
    pub tools: BTreeSet<String>,
}

impl Default for TruncateArgsConfig {
    fn default() -> Self {
        Self {
            trigger_fraction: 0.70,
            keep_messages: 20,
            max_length: 2_000,
            prefix_chars: 20,
            truncation_text: DEFAULT_TRUNCATION_TEXT.to_string(),
            tools: ["write_file", "edit_file"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }
}

impl TruncateArgsConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make another tool's arguments eligible for truncation.
    pub fn with_tool(mut self, name: impl Into<String>) -> Self {
        self.tools.insert(name.into());
        self
    }

    pub fn with_keep_messages(mut self, keep: usize) -> Self {
        self.keep_messages = keep;
        self
    }

    pub fn with_max_length(mut self, max: usize) -> Self {
        self.max_length = max;
        self
    }

    pub fn with_trigger_fraction(mut self, fraction: f64) -> Self {
        self.trigger_fraction = fraction;
        self
    }
}

/// Truncate long string arguments of eligible tool calls outside the recent
/// window. Returns the number of arguments shortened.
///
/// Does nothing while the conversation is below the trigger threshold or
/// holds no more than `keep_messages` messages. Already-truncated values are
/// below `max_length`, so repeated runs are no-ops.
pub fn truncate_tool_arguments(
    messages: &mut [Message],
    config: &TruncateArgsConfig,
    context_window: usize,
    estimator: &dyn TokenEstimator,
) -> usize {
    if messages.len() <= config.keep_messages {
        return 0;
    }
    let budget = ContextBudget::new(context_window).with_trigger_fraction(config.trigger_fraction);
    if !budget.exceeded_by(estimator.estimate_conversation(messages)) {
        return 0;
    }

    let cutoff = messages.len() - config.keep_messages;
    let mut truncated = 0;
    for message in &mut messages[..cutoff] {
        for part in &mut message.parts {
            let Part::ToolCall { name, arguments } = part else {
                continue;
            };
            if !config.tools.contains(name.as_str()) {
                continue;
            }
            let Some(args) = arguments.as_object_mut() else {
                continue;
            };
            for value in args.values_mut() {
                if let serde_json::Value::String(s) = value
                    && s.chars().count() > config.max_length
                {
                    *s = format!(
                        "{}{}",
                        head_chars(s, config.prefix_chars),
                        config.truncation_text
                    );
                    truncated += 1;
                }
            }
        }
    }

    if truncated > 0 {
        tracing::debug!(truncated, cutoff, "Truncated old tool-call arguments");
    }
    truncated
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::tokens::CharRatioEstimator;
    use serde_json::json;

    fn conversation(body_len: usize, recent: usize) -> Vec<Message> {
        let mut messages = vec![
            Message::user("write the report"),
            Message::tool_call(
                "c1",
                "write_file",
                json!({"path": "/report.md", "content": "r".repeat(body_len)}),
            ),
            Message::tool_result("c1", "write_file", "ok"),
        ];
        for i in 0..recent {
            messages.push(Message::agent(format!("step {i}")));
        }
        messages
    }

    fn config() -> TruncateArgsConfig {
        TruncateArgsConfig::new()
            .with_keep_messages(2)
            .with_trigger_fraction(0.5)
    }

    fn content_of(message: &Message) -> &str {
        match &message.parts[0] {
            Part::ToolCall { arguments, .. } => arguments["content"].as_str().unwrap(),
            _ => panic!("expected tool call"),
        }
    }

    #[test]
    fn truncates_old_write_arguments() {
        let mut messages = conversation(5_000, 2);
        let n = truncate_tool_arguments(
            &mut messages,
            &config(),
            1_000,
            &CharRatioEstimator::default(),
        );
        assert_eq!(n, 1);
        let content = content_of(&messages[1]);
        assert_eq!(content, format!("{}{DEFAULT_TRUNCATION_TEXT}", "r".repeat(20)));
        // Short arguments are left alone.
        match &messages[1].parts[0] {
            Part::ToolCall { arguments, .. } => assert_eq!(arguments["path"], "/report.md"),
            _ => unreachable!(),
        }
    }

    #[test]
    fn repeated_runs_are_no_ops() {
        let mut messages = conversation(5_000, 2);
        let est = CharRatioEstimator::default();
        truncate_tool_arguments(&mut messages, &config(), 1_000, &est);
        let once = messages.clone();
        assert_eq!(truncate_tool_arguments(&mut messages, &config(), 1_000, &est), 0);
        assert_eq!(messages, once);
    }

    #[test]
    fn recent_window_is_untouched() {
        let mut messages = conversation(5_000, 0);
        let cfg = config().with_keep_messages(2);
        let n = truncate_tool_arguments(&mut messages, &cfg, 1_000, &CharRatioEstimator::default());
        assert_eq!(n, 0);
        assert_eq!(content_of(&messages[1]).len(), 5_000);
    }

    #[test]
    fn below_threshold_is_a_no_op() {
        let mut messages = conversation(5_000, 2);
        let n = truncate_tool_arguments(
            &mut messages,
            &config(),
            1_000_000,
            &CharRatioEstimator::default(),
        );
        assert_eq!(n, 0);
    }

    #[test]
    fn other_tools_are_ignored() {
        let mut messages = vec![
            Message::tool_call("c1", "grep", json!({"pattern": "p".repeat(5_000)})),
            Message::agent("a"),
            Message::agent("b"),
        ];
        let n = truncate_tool_arguments(
            &mut messages,
            &config(),
            1_000,
            &CharRatioEstimator::default(),
        );
        assert_eq!(n, 0);
    }

    #[test]
    fn extra_tools_can_be_enabled() {
        let mut messages = vec![
            Message::tool_call("c1", "grep", json!({"pattern": "p".repeat(5_000)})),
            Message::agent("a"),
            Message::agent("b"),
        ];
        let cfg = config().with_tool("grep");
        let n = truncate_tool_arguments(&mut messages, &cfg, 1_000, &CharRatioEstimator::default());
        assert_eq!(n, 1);
    }

    #[test]
    fn defaults() {
        let cfg = TruncateArgsConfig::default();
        assert!(cfg.tools.contains("write_file"));
        assert!(cfg.tools.contains("edit_file"));
        assert_eq!(cfg.keep_messages, 20);
        assert_eq!(cfg.max_length, 2_000);
    }
}
