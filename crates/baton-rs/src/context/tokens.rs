//! Token estimation.
//!
//! The summarization engine never needs exact counts, only a cheap estimate
//! that grows with the size of the input. [`TokenEstimator`] is the seam; the
//! default [`CharRatioEstimator`] divides character length by a fixed ratio.
//! Hosts with a real tokenizer can plug their own implementation into the
//! engine without touching anything else.

use crate::{Message, Part};

/// Default characters per token.
pub const DEFAULT_CHARS_PER_TOKEN: f64 = 4.0;

/// Estimates token counts for text and messages.
///
/// Implementations must be monotonic (longer input never yields a smaller
/// estimate), must return 0 for empty text, and must be linear in the length
/// of their input.
pub trait TokenEstimator: Send + Sync {
    /// Estimate the tokens in a piece of text.
    fn estimate(&self, text: &str) -> usize;

    /// Characters per token this estimator assumes. Used to turn token
    /// budgets back into character budgets when trimming text.
    fn chars_per_token(&self) -> f64 {
        DEFAULT_CHARS_PER_TOKEN
    }

    fn estimate_part(&self, part: &Part) -> usize {
        match part {
            Part::Text { text } => self.estimate(text),
            Part::ToolCall { name, arguments } => {
                self.estimate(name) + self.estimate(&value_text(arguments))
            }
            Part::ToolResult { name, content } => {
                self.estimate(name) + self.estimate(&value_text(content))
            }
        }
    }

    fn estimate_message(&self, message: &Message) -> usize {
        message.parts.iter().map(|p| self.estimate_part(p)).sum()
    }

    fn estimate_conversation(&self, messages: &[Message]) -> usize {
        messages.iter().map(|m| self.estimate_message(m)).sum()
    }
}

/// String form of a JSON value. Bare strings are taken as-is so quoting does
/// not inflate the count.
pub(crate) fn value_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Null => String::new(),
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Estimates tokens as `max(1, chars / ratio)` for non-empty text.
#[derive(Debug, Clone, Copy)]
pub struct CharRatioEstimator {
    chars_per_token: f64,
}

impl CharRatioEstimator {
    /// Non-positive or non-finite ratios fall back to
    /// [`DEFAULT_CHARS_PER_TOKEN`].
    pub fn new(chars_per_token: f64) -> Self {
        let chars_per_token = if chars_per_token.is_finite() && chars_per_token > 0.0 {
            chars_per_token
        } else {
            DEFAULT_CHARS_PER_TOKEN
        };
        Self { chars_per_token }
    }
}

impl Default for CharRatioEstimator {
    fn default() -> Self {
        Self::new(DEFAULT_CHARS_PER_TOKEN)
    }
}

impl TokenEstimator for CharRatioEstimator {
    fn estimate(&self, text: &str) -> usize {
        if text.is_empty() {
            return 0;
        }
        ((text.len() as f64 / self.chars_per_token) as usize).max(1)
    }

    fn chars_per_token(&self) -> f64 {
        self.chars_per_token
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn empty_text_is_zero() {
        assert_eq!(CharRatioEstimator::default().estimate(""), 0);
    }

    #[test]
    fn short_text_is_at_least_one() {
        let est = CharRatioEstimator::default();
        assert_eq!(est.estimate("a"), 1);
        assert_eq!(est.estimate("abc"), 1);
    }

    #[test]
    fn divides_by_ratio() {
        let est = CharRatioEstimator::default();
        assert_eq!(est.estimate(&"x".repeat(600)), 150);
        assert_eq!(CharRatioEstimator::new(2.0).estimate(&"x".repeat(600)), 300);
    }

    #[test]
    fn monotonic_in_length() {
        let est = CharRatioEstimator::default();
        let mut previous = 0;
        for len in 0..200 {
            let n = est.estimate(&"y".repeat(len));
            assert!(n >= previous, "estimate dropped at length {len}");
            previous = n;
        }
    }

    #[test]
    fn invalid_ratio_falls_back_to_default() {
        assert_eq!(CharRatioEstimator::new(0.0).chars_per_token(), DEFAULT_CHARS_PER_TOKEN);
        assert_eq!(CharRatioEstimator::new(-3.0).chars_per_token(), DEFAULT_CHARS_PER_TOKEN);
        assert_eq!(
            CharRatioEstimator::new(f64::NAN).chars_per_token(),
            DEFAULT_CHARS_PER_TOKEN
        );
    }

    #[test]
    fn conversation_sums_messages() {
        let est = CharRatioEstimator::default();
        let messages = vec![
            Message::user("x".repeat(400)),
            Message::agent("y".repeat(200)),
        ];
        assert_eq!(est.estimate_conversation(&messages), 150);
    }

    #[test]
    fn tool_parts_count_name_and_payload() {
        let est = CharRatioEstimator::default();
        let call = Message::tool_call("c1", "grep", json!({"pattern": "x".repeat(80)}));
        assert!(est.estimate_message(&call) > est.estimate("grep"));

        let result = Message::tool_result("c1", "grep", "z".repeat(40));
        assert_eq!(est.estimate_message(&result), 1 + 10);
    }

    #[test]
    fn dangling_tool_call_is_estimated() {
        let est = CharRatioEstimator::default();
        let messages = vec![
            Message::user("start"),
            Message::tool_call("c9", "write_file", json!({"path": "/a.md"})),
        ];
        assert!(est.estimate_conversation(&messages) > 0);
    }

    #[test]
    fn string_values_are_not_quoted() {
        assert_eq!(value_text(&json!("abc")), "abc");
        assert_eq!(value_text(&json!(null)), "");
        assert_eq!(value_text(&json!({"a": 1})), r#"{"a":1}"#);
    }
}
