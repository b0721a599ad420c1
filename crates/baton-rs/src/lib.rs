//! Context-window summarization and sub-agent delegation runtime for LLM agents.
//!
//! `baton-rs` is the part of an agent host that keeps a long-running,
//! tool-using conversation inside its context budget and lets the top-level
//! agent hand bounded pieces of work to isolated child agents. Two engines
//! share one [`SessionState`](agent::session::SessionState) model:
//!
//! - The [`SummarizationEngine`](context::engine::SummarizationEngine) runs
//!   before every completion request. When the estimated token count crosses
//!   the trigger threshold it offloads older turns to the session's storage
//!   backend, replaces them with one summary message, and keeps the most
//!   recent turns verbatim.
//! - The [`Delegator`](agent::sub_agent::Delegator) spawns or resumes child
//!   agents under depth, parallelism and wall-clock limits, propagates the
//!   parent's storage backend to the child, and merges designated state keys
//!   back into the parent when the child finishes.
//!
//! Most hosts only need [`AgentRuntime`](agent::runtime::AgentRuntime), which
//! wires both engines to the process-local registries:
//!
//! ```ignore
//! use baton_rs::prelude::*;
//!
//! let backend = MemoryBackend::new();
//! let runtime = AgentRuntime::builder(RuntimeConfig::default())
//!     .with_completion(completion)
//!     .build();
//!
//! let session = runtime.start_session(Some(backend.factory()));
//!
//! // Before every model call:
//! let prepared = {
//!     let mut state = session.lock().await;
//!     runtime.prepare_completion(&mut state, messages).await
//! };
//!
//! // When the model asks for delegation:
//! let response = runtime
//!     .run_subtask(&session, SubtaskRequest::new("survey", "List the open TODOs"))
//!     .await;
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`context`] | token estimation, context budget, argument truncation, summarization, offload |
//! | [`agent`] | session state, registries, delegation scheduler, runtime facade, configuration |
//! | [`backend`] | storage backend contract plus in-memory and filesystem implementations |
//! | [`api`] | completion capability, retry, OpenRouter adapter |
//! | [`tools`] | function-calling tool trait and argument validation |

pub mod agent;
pub mod api;
pub mod backend;
pub mod context;
pub mod prelude;
pub mod tools;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

// Re-export schemars for downstream crates.
pub use schemars;

// ── Constants ──────────────────────────────────────────────────────

/// Default model identifier, used for context-window lookup and by the CLI.
pub const DEFAULT_MODEL: &str = "google/gemini-2.5-flash";

// ── Schema generation ──────────────────────────────────────────────

/// Generate a JSON Schema `serde_json::Value` from a type that implements
/// `schemars::JsonSchema`.
///
/// # Example
///
/// ```
/// use baton_rs::json_schema_for;
/// use schemars::JsonSchema;
/// use serde::Deserialize;
///
/// #[derive(Deserialize, JsonSchema)]
/// struct ReadArgs {
///     path: String,
///     #[serde(default)]
///     offset: Option<u32>,
/// }
///
/// let schema = json_schema_for::<ReadArgs>();
/// assert_eq!(schema["type"], "object");
/// assert!(schema["required"].as_array().unwrap().contains(&"path".into()));
/// ```
pub fn json_schema_for<T: JsonSchema>() -> serde_json::Value {
    let schema = schemars::schema_for!(T);
    serde_json::to_value(schema)
        .unwrap_or_else(|_| serde_json::json!({"type": "object", "properties": {}}))
}

// ── Message types ──────────────────────────────────────────────────

/// Role of a message in the conversation.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum MessageRole {
    User,
    Agent,
    ToolResult,
}

impl std::fmt::Display for MessageRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageRole::User => write!(f, "user"),
            MessageRole::Agent => write!(f, "agent"),
            MessageRole::ToolResult => write!(f, "tool-result"),
        }
    }
}

/// One block inside a message.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Part {
    /// Plain text.
    Text { text: String },
    /// A tool invocation issued by the agent.
    ToolCall {
        name: String,
        #[serde(default)]
        arguments: serde_json::Value,
    },
    /// The output of a tool invocation.
    ToolResult {
        name: String,
        #[serde(default)]
        content: serde_json::Value,
    },
}

impl Part {
    pub fn text(text: impl Into<String>) -> Self {
        Part::Text { text: text.into() }
    }
}

/// One conversation turn.
///
/// `call_id` links a tool invocation to its result. A conversation may hold
/// invocations whose result has not arrived yet; nothing in this crate
/// requires the pairs to be complete.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Message {
    pub role: MessageRole,
    #[serde(default)]
    pub parts: Vec<Part>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,
}

impl Message {
    pub fn new(role: MessageRole, parts: Vec<Part>) -> Self {
        Self {
            role,
            parts,
            call_id: None,
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(MessageRole::User, vec![Part::text(text)])
    }

    pub fn agent(text: impl Into<String>) -> Self {
        Self::new(MessageRole::Agent, vec![Part::text(text)])
    }

    /// An agent turn invoking one tool.
    pub fn tool_call(
        call_id: impl Into<String>,
        name: impl Into<String>,
        arguments: serde_json::Value,
    ) -> Self {
        Self {
            role: MessageRole::Agent,
            parts: vec![Part::ToolCall {
                name: name.into(),
                arguments,
            }],
            call_id: Some(call_id.into()),
        }
    }

    pub fn tool_result(
        call_id: impl Into<String>,
        name: impl Into<String>,
        content: impl Into<serde_json::Value>,
    ) -> Self {
        Self {
            role: MessageRole::ToolResult,
            parts: vec![Part::ToolResult {
                name: name.into(),
                content: content.into(),
            }],
            call_id: Some(call_id.into()),
        }
    }

    /// Concatenated text parts, newline separated.
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|p| match p {
                Part::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Names of the tools this message invokes, in order.
    pub fn tool_call_names(&self) -> impl Iterator<Item = &str> {
        self.parts.iter().filter_map(|p| match p {
            Part::ToolCall { name, .. } => Some(name.as_str()),
            _ => None,
        })
    }
}

// ── Tool definitions ───────────────────────────────────────────────

/// The type of a tool definition. Currently always `Function`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub enum ToolType {
    #[serde(rename = "function")]
    Function,
}

/// Tool definition handed to the model layer (OpenAI function-calling format).
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ToolDef {
    #[serde(rename = "type")]
    pub tool_type: ToolType,
    pub function: FunctionDef,
}

impl ToolDef {
    /// Create a function-calling tool definition.
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: serde_json::Value,
    ) -> Self {
        Self {
            tool_type: ToolType::Function,
            function: FunctionDef {
                name: name.into(),
                description: description.into(),
                parameters,
            },
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct FunctionDef {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn message_constructors() {
        let user = Message::user("hello");
        assert_eq!(user.role, MessageRole::User);
        assert_eq!(user.text(), "hello");
        assert!(user.call_id.is_none());

        let agent = Message::agent("hi there");
        assert_eq!(agent.role, MessageRole::Agent);

        let call = Message::tool_call("c1", "write_file", json!({"path": "/a.md"}));
        assert_eq!(call.role, MessageRole::Agent);
        assert_eq!(call.call_id.as_deref(), Some("c1"));
        assert_eq!(call.tool_call_names().collect::<Vec<_>>(), vec!["write_file"]);

        let result = Message::tool_result("c1", "write_file", "ok");
        assert_eq!(result.role, MessageRole::ToolResult);
        assert_eq!(result.text(), "");
    }

    #[test]
    fn role_serializes_kebab_case() {
        let json = serde_json::to_value(Message::tool_result("c1", "grep", "x")).unwrap();
        assert_eq!(json["role"], "tool-result");
        assert_eq!(json["parts"][0]["type"], "tool_result");
        assert_eq!(json["call_id"], "c1");
    }

    #[test]
    fn message_without_call_id_omits_field() {
        let json = serde_json::to_value(Message::user("x")).unwrap();
        assert!(json.get("call_id").is_none());
    }

    #[test]
    fn message_deserializes_with_defaults() {
        let msg: Message = serde_json::from_str(r#"{"role": "agent"}"#).unwrap();
        assert_eq!(msg.role, MessageRole::Agent);
        assert!(msg.parts.is_empty());
    }

    #[test]
    fn text_joins_text_parts_only() {
        let msg = Message::new(
            MessageRole::Agent,
            vec![
                Part::text("first"),
                Part::ToolCall {
                    name: "grep".into(),
                    arguments: json!({}),
                },
                Part::text("second"),
            ],
        );
        assert_eq!(msg.text(), "first\nsecond");
    }

    #[test]
    fn role_display() {
        assert_eq!(MessageRole::ToolResult.to_string(), "tool-result");
        assert_eq!(MessageRole::Agent.to_string(), "agent");
    }
}
