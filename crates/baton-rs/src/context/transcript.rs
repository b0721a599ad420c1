//! Plain-text rendering of conversation spans.
//!
//! Two renderings share one format (`[role]: text`, blank line between
//! messages): [`Rendering::Full`] keeps every byte and is what the offload
//! log stores; [`Rendering::Trimmed`] shortens oversized tool results and is
//! what the summarizer reads.

use crate::context::tokens::value_text;
use crate::{Message, Part};

/// Tool results longer than this many characters are shortened in trimmed
/// rendering.
pub const TOOL_RESULT_TRIM_THRESHOLD: usize = 2_000;
const TOOL_RESULT_HEAD_CHARS: usize = 1_000;
const TOOL_RESULT_TAIL_CHARS: usize = 500;
const TRIM_MARKER: &str = "\n... (truncated) ...\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rendering {
    Full,
    Trimmed,
}

/// Render one message as `[role]: text`.
pub fn render_message(message: &Message, rendering: Rendering) -> String {
    let body: Vec<String> = message
        .parts
        .iter()
        .map(|part| render_part(part, rendering))
        .filter(|s| !s.is_empty())
        .collect();
    let body = if body.is_empty() {
        "(empty)".to_string()
    } else {
        body.join("\n")
    };
    format!("[{}]: {body}", message.role)
}

/// Render a span of messages separated by blank lines.
pub fn render_transcript(messages: &[Message], rendering: Rendering) -> String {
    messages
        .iter()
        .map(|m| render_message(m, rendering))
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn render_part(part: &Part, rendering: Rendering) -> String {
    match part {
        Part::Text { text } => text.clone(),
        Part::ToolCall { name, arguments } => {
            format!("[Tool Call: {name}({})]", value_text(arguments))
        }
        Part::ToolResult { name, content } => {
            let content = value_text(content);
            let content = match rendering {
                Rendering::Full => content,
                Rendering::Trimmed => trim_middle(&content),
            };
            format!("[Tool Result: {name} -> {content}]")
        }
    }
}

fn trim_middle(text: &str) -> String {
    if text.chars().count() <= TOOL_RESULT_TRIM_THRESHOLD {
        return text.to_string();
    }
    format!(
        "{}{TRIM_MARKER}{}",
        head_chars(text, TOOL_RESULT_HEAD_CHARS),
        tail_chars(text, TOOL_RESULT_TAIL_CHARS)
    )
}

/// First `n` characters of `text`.
pub(crate) fn head_chars(text: &str, n: usize) -> String {
    text.chars().take(n).collect()
}

/// Last `n` characters of `text`.
pub(crate) fn tail_chars(text: &str, n: usize) -> String {
    let count = text.chars().count();
    text.chars().skip(count.saturating_sub(n)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MessageRole;
    use serde_json::json;

    #[test]
    fn renders_role_and_text() {
        assert_eq!(
            render_message(&Message::user("hello"), Rendering::Full),
            "[user]: hello"
        );
        assert_eq!(
            render_message(&Message::agent("done"), Rendering::Trimmed),
            "[agent]: done"
        );
    }

    #[test]
    fn renders_tool_parts() {
        let call = Message::tool_call("c1", "read_file", json!({"path": "/a.md"}));
        assert_eq!(
            render_message(&call, Rendering::Full),
            r#"[agent]: [Tool Call: read_file({"path":"/a.md"})]"#
        );

        let result = Message::tool_result("c1", "read_file", "contents");
        assert_eq!(
            render_message(&result, Rendering::Full),
            "[tool-result]: [Tool Result: read_file -> contents]"
        );
    }

    #[test]
    fn empty_message_renders_placeholder() {
        let empty = Message::new(MessageRole::Agent, vec![]);
        assert_eq!(render_message(&empty, Rendering::Full), "[agent]: (empty)");
    }

    #[test]
    fn transcript_separates_with_blank_line() {
        let text = render_transcript(
            &[Message::user("a"), Message::agent("b")],
            Rendering::Full,
        );
        assert_eq!(text, "[user]: a\n\n[agent]: b");
    }

    #[test]
    fn trimmed_shortens_large_tool_results() {
        let big = format!("{}{}{}", "h".repeat(1_500), "m".repeat(1_000), "t".repeat(600));
        let msg = Message::tool_result("c1", "grep", big.clone());

        let trimmed = render_message(&msg, Rendering::Trimmed);
        assert!(trimmed.contains("... (truncated) ..."));
        assert!(!trimmed.contains('m'));
        assert!(trimmed.len() < big.len());

        let full = render_message(&msg, Rendering::Full);
        assert!(full.contains(&big));
    }

    #[test]
    fn trimmed_keeps_small_tool_results() {
        let msg = Message::tool_result("c1", "grep", "x".repeat(TOOL_RESULT_TRIM_THRESHOLD));
        assert!(!render_message(&msg, Rendering::Trimmed).contains("truncated"));
    }

    #[test]
    fn char_helpers_respect_boundaries() {
        assert_eq!(head_chars("héllo", 2), "hé");
        assert_eq!(tail_chars("héllo", 4), "éllo");
        assert_eq!(tail_chars("ab", 10), "ab");
    }
}
