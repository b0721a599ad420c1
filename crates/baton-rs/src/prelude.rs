//! Convenience re-exports for common `baton-rs` types.
//!
//! Meant to be glob-imported by agent hosts:
//!
//! ```ignore
//! use baton_rs::prelude::*;
//! ```
//!
//! This pulls in the runtime, its configuration, the message and session
//! types, the storage backends, and the capability traits a host implements.
//! Lower-level pieces (transcript rendering, offload helpers, registry
//! internals) are left out; import those from their modules directly.

// ── Core types ──────────────────────────────────────────────────────
pub use crate::{Message, MessageRole, Part, ToolDef, json_schema_for};

// ── Agent runtime ───────────────────────────────────────────────────
pub use crate::agent::{
    AgentBuilder, AgentRuntime, ChildAgent, DelegationConfig, RunSubtaskTool, RuntimeConfig,
    SessionState, SessionStore, SharedSession, SubAgentRegistry, SubAgentSpec, SubtaskRequest,
    SubtaskResponse, TaskStatus, Toggle, TurnFuture, TurnRecorder,
};

// ── Completion ──────────────────────────────────────────────────────
pub use crate::api::{
    Completion, CompletionFuture, OpenRouterCompletion, RetryConfig, RetryingCompletion,
};

// ── Context management ──────────────────────────────────────────────
pub use crate::context::{
    CharRatioEstimator, ContextBudget, Prepared, SummarizationConfig, TokenEstimator,
    TruncateArgsConfig,
};

// ── Storage ─────────────────────────────────────────────────────────
pub use crate::backend::{Backend, BackendFactory, FilesystemBackend, MemoryBackend};

// ── Tools ───────────────────────────────────────────────────────────
pub use crate::tools::{Tool, ToolFuture, parse_tool_args};
