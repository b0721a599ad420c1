//! Agent runtime: sessions, registries, delegation, and the runtime facade.
//!
//! - [`runtime::AgentRuntime`] — owns both engines and the registries. Start
//!   here.
//! - [`config::RuntimeConfig`] — summarization, truncation and delegation
//!   settings, loadable from JSON.
//! - [`session`] — [`SessionState`], the reserved state keys, and
//!   [`SessionStore`] for saving sessions to disk.
//! - [`registry`] — process-local [`BackendRegistry`] and [`TaskRegistry`].
//! - [`sub_agent`] — sub-agent specs, child agents, the [`Delegator`] and
//!   the `run_subtask` tool.

pub mod config;
pub mod registry;
pub mod runtime;
pub mod session;
pub mod sub_agent;

// Re-export commonly used items at the module level.
pub use config::{DelegationConfig, RuntimeConfig, Toggle};
pub use registry::{BackendRegistry, TaskKey, TaskRegistry};
pub use runtime::{AgentRuntime, AgentRuntimeBuilder};
pub use session::{SessionState, SessionStore, SharedSession};
pub use sub_agent::{
    AgentBuilder, ChildAgent, CompletionAgent, CompletionAgentBuilder, DelegatedTask,
    DelegationError, Delegator, RunSubtaskTool, SubAgentRegistry, SubAgentSpec, SubtaskRequest,
    SubtaskResponse, TaskStatus, TurnFuture, TurnRecorder,
};
