//! Summary generation for compacted conversation spans.
//!
//! The preferred path asks a model for a structured summary of the span being
//! replaced. When no model is configured, or the call fails, an inline
//! fallback summary is built from the transcript itself. Either way the
//! result is wrapped in a single user-role message that takes the span's
//! place in the conversation.

use crate::api::Completion;
use crate::context::transcript::{Rendering, render_transcript, tail_chars};
use crate::{Message, MessageRole, Part};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// System prompt for model-generated summaries.
pub const SUMMARY_PROMPT: &str = "\
You are compacting the earlier part of an agent conversation so the agent can keep \
working with a smaller context. Read the messages and write a summary with exactly \
these sections:

## SESSION INTENT
What the user is trying to achieve, in one or two sentences.

## SUMMARY
What has been done so far: decisions made, findings, tools used and what they \
returned, approaches that failed and why.

## ARTIFACTS
Every file path, identifier, URL, or other concrete artifact that was created, \
modified, or referenced, with one line on each.

## NEXT STEPS
What remains to be done, in order.

Rules:
- Only state facts present in the messages. Do not speculate.
- Copy paths, names, and error messages verbatim.
- Keep it short. The summary replaces the messages entirely.";

/// Marker appended to an inline summary that was cut short.
pub const INLINE_TRUNCATION_MARKER: &str = "... (earlier context truncated)\n\n";

/// Configuration for the summarization engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SummarizationConfig {
    /// Model identifier used for context-window lookup.
    pub model: String,
    /// Explicit context window; overrides the model table when set.
    pub context_window: Option<usize>,
    /// Fraction of the context window at which summarization runs.
    pub trigger_fraction: f64,
    /// Most recent messages kept verbatim.
    pub keep_messages: usize,
    /// Directory on the session backend that receives offloaded history.
    pub history_path_prefix: String,
    /// Ask the completion capability for a summary before falling back.
    pub use_model_summary: bool,
    /// Token budget for the transcript sent to the summary model.
    pub max_summary_input_tokens: usize,
    /// Fraction of the context window an inline summary may occupy.
    pub inline_summary_fraction: f64,
    /// Characters of the latest summary kept in session state.
    pub summary_excerpt_chars: usize,
}

impl Default for SummarizationConfig {
    fn default() -> Self {
        Self {
            model: crate::DEFAULT_MODEL.to_string(),
            context_window: None,
            trigger_fraction: 0.85,
            keep_messages: 6,
            history_path_prefix: "/conversation_history".to_string(),
            use_model_summary: true,
            max_summary_input_tokens: 4_000,
            inline_summary_fraction: 0.15,
            summary_excerpt_chars: 500,
        }
    }
}

impl SummarizationConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_context_window(mut self, window: usize) -> Self {
        self.context_window = Some(window);
        self
    }

    pub fn with_trigger_fraction(mut self, fraction: f64) -> Self {
        self.trigger_fraction = fraction;
        self
    }

    pub fn with_keep_messages(mut self, keep: usize) -> Self {
        self.keep_messages = keep;
        self
    }

    pub fn with_history_path_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.history_path_prefix = prefix.into();
        self
    }

    pub fn with_model_summary(mut self, enabled: bool) -> Self {
        self.use_model_summary = enabled;
        self
    }
}

#[derive(Debug, Error)]
pub enum SummaryError {
    #[error("summary model call failed: {0}")]
    Completion(String),
    #[error("summary model returned an empty summary")]
    Empty,
    #[error("summary model panicked")]
    Panicked,
}

/// Build the (system, conversation) pair for a model summary of `span`.
///
/// The rendered transcript is cut to its last `max_input_chars` characters so
/// the most recent part of the span survives.
pub fn build_summary_request(span: &[Message], max_input_chars: usize) -> (String, Vec<Message>) {
    let transcript = render_transcript(span, Rendering::Trimmed);
    let transcript = if transcript.chars().count() > max_input_chars {
        tail_chars(&transcript, max_input_chars)
    } else {
        transcript
    };
    let request = format!(
        "Summarize the following conversation.\n\n<messages>\n{transcript}\n</messages>"
    );
    (SUMMARY_PROMPT.to_string(), vec![Message::user(request)])
}

/// Ask `completion` for a summary of `span`.
pub async fn generate_model_summary(
    completion: &dyn Completion,
    span: &[Message],
    max_input_chars: usize,
) -> Result<String, SummaryError> {
    let (system, conversation) = build_summary_request(span, max_input_chars);
    let summary = completion
        .complete(&system, &conversation)
        .await
        .map_err(SummaryError::Completion)?;
    let summary = summary.trim();
    if summary.is_empty() {
        return Err(SummaryError::Empty);
    }
    Ok(summary.to_string())
}

/// Build a summary from the transcript itself, keeping at most
/// `max_chars` of its most recent text.
pub fn inline_summary(span: &[Message], max_chars: usize) -> String {
    let transcript = render_transcript(span, Rendering::Trimmed);
    if transcript.chars().count() <= max_chars {
        return transcript;
    }
    format!(
        "{INLINE_TRUNCATION_MARKER}{}",
        tail_chars(&transcript, max_chars)
    )
}

/// Wrap a summary in the user-role message that replaces the summarized span.
pub fn summary_message(summary: &str, offload_path: Option<&str>) -> Message {
    let text = match offload_path {
        Some(path) => format!(
            "You are in the middle of a conversation that has been summarized.\n\n\
             The full conversation history has been saved to {path} should you need \
             to refer back to it for details.\n\n\
             A condensed summary follows:\n\n\
             <summary>\n{summary}\n</summary>"
        ),
        None => format!(
            "<conversation_summary>\n\
             The following is a summary of the earlier conversation:\n\n\
             {summary}\n\
             </conversation_summary>"
        ),
    };
    Message::new(MessageRole::User, vec![Part::text(text)])
}
