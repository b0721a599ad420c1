//! Sub-agent delegation.
//!
//! The parent agent hands a bounded unit of work to an isolated child through
//! one operation, `run_subtask` ([`Delegator::run_subtask`], also exposed to
//! the model as [`RunSubtaskTool`]). Each child has:
//!
//! - its own [`SessionState`], seeded with the parent's shared keys
//!   (`files`, `todos`) and `depth = parent depth + 1`,
//! - the parent's storage backend, propagated through the
//!   [`BackendRegistry`] under the child's session id,
//! - an entry in the [`TaskRegistry`] so a later call with the same
//!   `task_id` resumes the same child instead of starting a fresh one.
//!
//! A call runs in three phases:
//!
//! 1. **Admit**, under the parent session lock: validate the request, enforce
//!    depth and parallelism limits, then resume or create the child and
//!    reserve its running slot.
//! 2. **Execute**, with the parent unlocked: the child turn runs on its own
//!    tokio task under the wall-clock timeout. On expiry the task's
//!    cancellation token fires and the turn is dropped at its next await.
//! 3. **Finish**, under the parent lock again: release the running slot,
//!    merge the child's changed shared keys into the parent, and update the
//!    task record.
//!
//! Every failure comes back as a [`SubtaskResponse`] with `status: "error"`;
//! nothing propagates into the caller's turn.

use crate::agent::config::DelegationConfig;
use crate::agent::registry::{BackendRegistry, ChildHandle, TaskKey, TaskRegistry};
use crate::agent::session::{SessionState, SharedSession, keys};
use crate::api::Completion;
use crate::context::engine::SummarizationEngine;
use crate::tools::core::{
    Tool, ToolFuture, log_tool_call, parse_tool_args, truncate_result, validate_tool_arguments,
};
use crate::{DEFAULT_MODEL, Message, ToolDef, json_schema_for};
use futures::future::join_all;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

// ── Sub-agent specifications ───────────────────────────────────────

/// Name of the built-in sub-agent, always registered.
pub const GENERAL_PURPOSE: &str = "general_purpose";

const GENERAL_PURPOSE_PROMPT: &str = "\
You are a general-purpose assistant working on a task delegated to you by \
another agent. Complete the task with the information given and reply with a \
concise, self-contained result. Do not ask clarifying questions.";

/// Declarative description of a sub-agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubAgentSpec {
    pub name: String,
    pub description: String,
    pub system_prompt: String,
    /// Model for this sub-agent; the runtime default when unset.
    #[serde(default)]
    pub model: Option<String>,
    /// Tool names the sub-agent may use.
    #[serde(default)]
    pub tools: Vec<String>,
}

impl SubAgentSpec {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        system_prompt: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            system_prompt: system_prompt.into(),
            model: None,
            tools: Vec::new(),
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_tools(mut self, tools: Vec<String>) -> Self {
        self.tools = tools;
        self
    }
}

pub fn general_purpose_spec() -> SubAgentSpec {
    SubAgentSpec::new(
        GENERAL_PURPOSE,
        "General-purpose agent for multi-step research and execution tasks.",
        GENERAL_PURPOSE_PROMPT,
    )
}

/// Canonical form of a sub-agent type name: lowercase, every
/// non-alphanumeric character replaced by `_`. Spellings of "general
/// purpose" all map to [`GENERAL_PURPOSE`].
pub fn normalize_subagent_type(name: &str) -> String {
    let normalized: String = name
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect();
    let normalized = normalized.trim_matches('_');
    match normalized {
        "" | "general" | "generalpurpose" | "general_purpose" => GENERAL_PURPOSE.to_string(),
        other => other.to_string(),
    }
}

/// A sub-agent definition after name normalization and model selection.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedSpec {
    pub name: String,
    pub instruction: String,
    pub model: String,
    pub tools: Vec<String>,
}

/// Builds a fresh child agent for a resolved definition.
pub trait AgentBuilder: Send + Sync {
    fn build(&self, spec: &ResolvedSpec) -> Result<Box<dyn ChildAgent>, String>;
}

impl<F> AgentBuilder for F
where
    F: Fn(&ResolvedSpec) -> Result<Box<dyn ChildAgent>, String> + Send + Sync,
{
    fn build(&self, spec: &ResolvedSpec) -> Result<Box<dyn ChildAgent>, String> {
        self(spec)
    }
}

/// A registry entry: either a spec built by the runtime's default builder,
/// or a ready-made agent type with its own builder.
#[derive(Clone)]
pub enum SubAgentDef {
    Spec(SubAgentSpec),
    Agent {
        description: String,
        builder: Arc<dyn AgentBuilder>,
    },
}

impl SubAgentDef {
    pub fn description(&self) -> &str {
        match self {
            Self::Spec(spec) => &spec.description,
            Self::Agent { description, .. } => description,
        }
    }
}

impl fmt::Debug for SubAgentDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Spec(spec) => f.debug_tuple("Spec").field(spec).finish(),
            Self::Agent { description, .. } => f
                .debug_struct("Agent")
                .field("description", description)
                .finish_non_exhaustive(),
        }
    }
}

/// Known sub-agent types, keyed by normalized name.
#[derive(Debug, Clone)]
pub struct SubAgentRegistry {
    defs: BTreeMap<String, SubAgentDef>,
}

impl Default for SubAgentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SubAgentRegistry {
    /// A registry holding only the general-purpose spec.
    pub fn new() -> Self {
        let mut registry = Self {
            defs: BTreeMap::new(),
        };
        registry.register_spec(general_purpose_spec());
        registry
    }

    /// Register a spec. A spec named like an existing entry replaces it.
    pub fn register_spec(&mut self, spec: SubAgentSpec) {
        self.defs
            .insert(normalize_subagent_type(&spec.name), SubAgentDef::Spec(spec));
    }

    pub fn register_agent(
        &mut self,
        name: &str,
        description: impl Into<String>,
        builder: Arc<dyn AgentBuilder>,
    ) {
        self.defs.insert(
            normalize_subagent_type(name),
            SubAgentDef::Agent {
                description: description.into(),
                builder,
            },
        );
    }

    pub fn with_spec(mut self, spec: SubAgentSpec) -> Self {
        self.register_spec(spec);
        self
    }

    pub fn with_agent(
        mut self,
        name: &str,
        description: impl Into<String>,
        builder: Arc<dyn AgentBuilder>,
    ) -> Self {
        self.register_agent(name, description, builder);
        self
    }

    /// Look a type up by any spelling of its name.
    pub fn get(&self, subagent_type: &str) -> Option<(String, &SubAgentDef)> {
        let name = normalize_subagent_type(subagent_type);
        let def = self.defs.get(&name)?;
        Some((name, def))
    }

    pub fn names(&self) -> Vec<&str> {
        self.defs.keys().map(String::as_str).collect()
    }

    /// One `- name: description` line per type.
    pub fn describe(&self) -> String {
        self.defs
            .iter()
            .map(|(name, def)| format!("- {name}: {}", def.description()))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

// ── Child execution ────────────────────────────────────────────────

/// Boxed future returned by [`ChildAgent::run_turn`].
pub type TurnFuture<'a> = Pin<Box<dyn Future<Output = Result<(), String>> + Send + 'a>>;

/// A child agent that can run one turn at a time.
///
/// Output is reported to the [`TurnRecorder`] as it is produced, so a turn
/// that is cancelled by the timeout still leaves its partial output behind.
/// State the parent should see goes into `session` under the shared keys.
pub trait ChildAgent: Send {
    fn run_turn<'a>(
        &'a mut self,
        session: &'a mut SessionState,
        prompt: &'a str,
        recorder: &'a TurnRecorder,
    ) -> TurnFuture<'a>;
}

/// Output collected from one child turn.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TurnOutput {
    pub texts: Vec<String>,
    /// Tool names in call order. Arguments and results are not kept.
    pub tool_call_names: Vec<String>,
}

impl TurnOutput {
    /// All text output, one chunk per line.
    pub fn text(&self) -> String {
        self.texts.join("\n").trim().to_string()
    }
}

/// Collects a child's output while its turn runs. Clones share one buffer.
#[derive(Debug, Clone, Default)]
pub struct TurnRecorder {
    output: Arc<Mutex<TurnOutput>>,
}

impl TurnRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    fn output(&self) -> MutexGuard<'_, TurnOutput> {
        // A panicking child can only have left a partially pushed Vec behind.
        self.output.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn push_text(&self, text: impl Into<String>) {
        let text = text.into();
        if !text.trim().is_empty() {
            self.output().texts.push(text);
        }
    }

    pub fn push_tool_call(&self, name: impl Into<String>) {
        self.output().tool_call_names.push(name.into());
    }

    pub fn snapshot(&self) -> TurnOutput {
        self.output().clone()
    }
}

/// A live child: its agent, its session, and the shared-key values last
/// synchronized with the parent.
pub struct ChildRuntime {
    agent: Box<dyn ChildAgent>,
    session: SessionState,
    subagent_type: String,
    synced: Map<String, Value>,
    turns: u32,
}

impl ChildRuntime {
    pub fn new(
        agent: Box<dyn ChildAgent>,
        session: SessionState,
        subagent_type: impl Into<String>,
    ) -> Self {
        let synced = session.values().clone();
        Self {
            agent,
            session,
            subagent_type: subagent_type.into(),
            synced,
            turns: 0,
        }
    }

    pub fn session(&self) -> &SessionState {
        &self.session
    }

    pub fn subagent_type(&self) -> &str {
        &self.subagent_type
    }

    /// Turns started so far.
    pub fn turns(&self) -> u32 {
        self.turns
    }

    fn run_turn<'a>(&'a mut self, prompt: &'a str, recorder: &'a TurnRecorder) -> TurnFuture<'a> {
        self.turns += 1;
        self.agent.run_turn(&mut self.session, prompt, recorder)
    }

    /// Shared-key changes since the last call, then mark them synchronized.
    fn take_changes(&mut self, keys: &[String]) -> Map<String, Value> {
        let current = self.session.subset(keys);
        let synced: Map<String, Value> = keys
            .iter()
            .filter_map(|k| self.synced.get(k).map(|v| (k.clone(), v.clone())))
            .collect();
        let changes = changes_since(&synced, &current);
        for key in keys {
            match current.get(key) {
                Some(value) => self.synced.insert(key.clone(), value.clone()),
                None => self.synced.remove(key),
            };
        }
        changes
    }
}

impl fmt::Debug for ChildRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChildRuntime")
            .field("session", &self.session.id())
            .field("subagent_type", &self.subagent_type)
            .field("turns", &self.turns)
            .finish_non_exhaustive()
    }
}

/// Values in `current` that differ from `synced`. Objects are compared entry
/// by entry, so only the changed entries of a map are reported. Entries and
/// keys that disappeared are reported as `null`, which
/// [`SessionState::merge`] applies as a removal.
fn changes_since(synced: &Map<String, Value>, current: &Map<String, Value>) -> Map<String, Value> {
    let mut changes = Map::new();
    for (key, value) in current {
        match (synced.get(key), value) {
            (Some(Value::Object(before)), Value::Object(after)) => {
                let mut changed: Map<String, Value> = after
                    .iter()
                    .filter(|(k, v)| before.get(*k) != Some(*v))
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();
                for removed in before.keys().filter(|k| !after.contains_key(*k)) {
                    changed.insert(removed.clone(), Value::Null);
                }
                if !changed.is_empty() {
                    changes.insert(key.clone(), Value::Object(changed));
                }
            }
            (Some(before), after) if before == after => {}
            _ => {
                changes.insert(key.clone(), value.clone());
            }
        }
    }
    for removed in synced.keys().filter(|k| !current.contains_key(*k)) {
        changes.insert(removed.clone(), Value::Null);
    }
    changes
}

// ── Completion-backed child ────────────────────────────────────────

/// Picks the completion for a model name.
pub type CompletionFactory = Arc<dyn Fn(&str) -> Arc<dyn Completion> + Send + Sync>;

/// A child that answers each prompt with one completion call over its own
/// conversation. When an engine is attached the conversation goes through
/// the summarization hook before every call, and the compacted form becomes
/// the child's history.
pub struct CompletionAgent {
    instruction: String,
    completion: Arc<dyn Completion>,
    engine: Option<Arc<SummarizationEngine>>,
    conversation: Vec<Message>,
}

impl CompletionAgent {
    pub fn new(instruction: impl Into<String>, completion: Arc<dyn Completion>) -> Self {
        Self {
            instruction: instruction.into(),
            completion,
            engine: None,
            conversation: Vec::new(),
        }
    }

    pub fn with_engine(mut self, engine: Arc<SummarizationEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    pub fn conversation(&self) -> &[Message] {
        &self.conversation
    }
}

impl ChildAgent for CompletionAgent {
    fn run_turn<'a>(
        &'a mut self,
        session: &'a mut SessionState,
        prompt: &'a str,
        recorder: &'a TurnRecorder,
    ) -> TurnFuture<'a> {
        Box::pin(async move {
            self.conversation.push(Message::user(prompt));
            if let Some(engine) = &self.engine {
                let outgoing = std::mem::take(&mut self.conversation);
                self.conversation = engine.prepare(session, outgoing).await.messages;
            }
            let reply = self
                .completion
                .complete(&self.instruction, &self.conversation)
                .await?;
            recorder.push_text(reply.clone());
            self.conversation.push(Message::agent(reply));
            Ok(())
        })
    }
}

/// Builds a [`CompletionAgent`] per task.
///
/// The agent makes plain completion calls: `ResolvedSpec::tools` is not
/// consulted and no tool calls are recorded, so `tool_call_names` stays
/// empty. Hosts that give sub-agents tools supply their own
/// [`AgentBuilder`].
#[derive(Clone)]
pub struct CompletionAgentBuilder {
    completion: Arc<dyn Completion>,
    for_model: Option<CompletionFactory>,
    engine: Option<Arc<SummarizationEngine>>,
}

impl CompletionAgentBuilder {
    pub fn new(completion: Arc<dyn Completion>) -> Self {
        Self {
            completion,
            for_model: None,
            engine: None,
        }
    }

    /// Use `factory` to pick a completion by the resolved model name.
    pub fn with_model_completion(mut self, factory: CompletionFactory) -> Self {
        self.for_model = Some(factory);
        self
    }

    pub fn with_engine(mut self, engine: Arc<SummarizationEngine>) -> Self {
        self.engine = Some(engine);
        self
    }
}

impl AgentBuilder for CompletionAgentBuilder {
    fn build(&self, spec: &ResolvedSpec) -> Result<Box<dyn ChildAgent>, String> {
        let completion = match &self.for_model {
            Some(factory) => factory(&spec.model),
            None => Arc::clone(&self.completion),
        };
        let mut agent = CompletionAgent::new(spec.instruction.clone(), completion);
        if let Some(engine) = &self.engine {
            agent = agent.with_engine(Arc::clone(engine));
        }
        Ok(Box::new(agent))
    }
}

// ── Requests, responses, records ───────────────────────────────────

fn default_subagent_type() -> String {
    GENERAL_PURPOSE.to_string()
}

/// Arguments of `run_subtask`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct SubtaskRequest {
    /// Short description of the task. Used as the prompt when `prompt` is empty.
    pub description: String,
    /// Full instructions for the sub-agent.
    #[serde(default)]
    pub prompt: String,
    /// Sub-agent type to run. Defaults to "general_purpose".
    #[serde(default = "default_subagent_type")]
    pub subagent_type: String,
    /// Id returned by an earlier call, to continue that task. Omit to start a new task.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    /// Model for a new sub-agent. Ignored unless the host allows overrides.
    #[serde(default, alias = "model", skip_serializing_if = "Option::is_none")]
    pub model_override: Option<String>,
}

impl SubtaskRequest {
    pub fn new(description: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            prompt: prompt.into(),
            subagent_type: default_subagent_type(),
            task_id: None,
            model_override: None,
        }
    }

    pub fn with_subagent_type(mut self, subagent_type: impl Into<String>) -> Self {
        self.subagent_type = subagent_type.into();
        self
    }

    pub fn with_task_id(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    pub fn with_model_override(mut self, model: impl Into<String>) -> Self {
        self.model_override = Some(model.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Running,
    Completed,
    Error,
}

/// Result of `run_subtask`, returned to the calling turn as JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubtaskResponse {
    pub status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subagent_type: Option<String>,
    /// Final text, or the partial text of a failed turn.
    #[serde(default)]
    pub result: String,
    #[serde(default)]
    pub tool_call_names: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// `validation`, `policy`, `timeout` or `failed`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
}

impl SubtaskResponse {
    /// A request turned away before any child ran.
    pub fn rejected(error: &DelegationError, task_id: Option<String>) -> Self {
        Self {
            status: TaskStatus::Error,
            task_id,
            subagent_type: None,
            result: String::new(),
            tool_call_names: Vec::new(),
            error: Some(error.to_string()),
            error_kind: Some(error.kind().to_string()),
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status == TaskStatus::Completed
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self)
            .unwrap_or_else(|e| format!("{{\"status\":\"error\",\"error\":\"{e}\"}}"))
    }
}

/// Persisted record of one delegated task, kept in the parent's state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DelegatedTask {
    pub task_id: String,
    pub subagent_type: String,
    pub status: TaskStatus,
    pub depth: u32,
    pub parent_session_id: String,
    pub child_session_id: String,
    #[serde(default)]
    pub turns: u32,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum DelegationError {
    /// Unknown sub-agent type or malformed request. Not retried.
    #[error("{0}")]
    Validation(String),
    /// Depth or parallelism limit hit. The caller may retry later.
    #[error("{0}")]
    Policy(String),
    #[error("task timed out after {seconds} seconds")]
    Timeout { seconds: u64 },
    #[error("task failed: {0}")]
    Failed(String),
}

impl DelegationError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::Policy(_) => "policy",
            Self::Timeout { .. } => "timeout",
            Self::Failed(_) => "failed",
        }
    }
}

// ── Delegator ──────────────────────────────────────────────────────

/// A request that passed admission.
struct Admitted {
    key: TaskKey,
    handle: ChildHandle,
    subagent_type: String,
    child_session_id: String,
    prompt: String,
}

struct Rejection {
    error: DelegationError,
    task_id: Option<String>,
}

impl Rejection {
    fn new(error: DelegationError, task_id: Option<&str>) -> Self {
        Self {
            error,
            task_id: task_id.map(String::from),
        }
    }
}

enum TurnEnd {
    Finished,
    Failed(String),
    TimedOut,
}

struct ChildOutcome {
    end: TurnEnd,
    changes: Map<String, Value>,
    turns: u32,
}

/// The delegation scheduler.
pub struct Delegator {
    config: DelegationConfig,
    subagents: SubAgentRegistry,
    spec_builder: Option<Arc<dyn AgentBuilder>>,
    default_model: String,
    tasks: Arc<TaskRegistry>,
    backends: Arc<BackendRegistry>,
}

impl Delegator {
    pub fn new(
        config: DelegationConfig,
        subagents: SubAgentRegistry,
        tasks: Arc<TaskRegistry>,
        backends: Arc<BackendRegistry>,
    ) -> Self {
        Self {
            config,
            subagents,
            spec_builder: None,
            default_model: DEFAULT_MODEL.to_string(),
            tasks,
            backends,
        }
    }

    /// Builder used for [`SubAgentDef::Spec`] entries.
    pub fn with_spec_builder(mut self, builder: Arc<dyn AgentBuilder>) -> Self {
        self.spec_builder = Some(builder);
        self
    }

    /// Model for specs that do not name one.
    pub fn with_default_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = model.into();
        self
    }

    pub fn config(&self) -> &DelegationConfig {
        &self.config
    }

    pub fn subagents(&self) -> &SubAgentRegistry {
        &self.subagents
    }

    /// Run one delegated turn for the parent `session`.
    pub async fn run_subtask(
        &self,
        session: &SharedSession,
        request: SubtaskRequest,
    ) -> SubtaskResponse {
        let admitted = {
            let mut parent = session.lock().await;
            match self.admit(&mut parent, request) {
                Ok(admitted) => admitted,
                Err(rejection) => {
                    warn!(
                        "Session {}: delegation rejected ({}): {}",
                        parent.id(),
                        rejection.error.kind(),
                        rejection.error
                    );
                    return SubtaskResponse::rejected(&rejection.error, rejection.task_id);
                }
            }
        };

        let recorder = TurnRecorder::new();
        let outcome = self.execute(&admitted, &recorder).await;

        let mut parent = session.lock().await;
        self.finish(&mut parent, admitted, outcome, recorder.snapshot())
    }

    /// Run several delegations concurrently. Responses come back in request
    /// order; match them to calls by `task_id`.
    pub async fn run_subtasks(
        &self,
        session: &SharedSession,
        requests: Vec<SubtaskRequest>,
    ) -> Vec<SubtaskResponse> {
        join_all(requests.into_iter().map(|r| self.run_subtask(session, r))).await
    }

    fn admit(
        &self,
        parent: &mut SessionState,
        request: SubtaskRequest,
    ) -> Result<Admitted, Rejection> {
        let requested_id = request
            .task_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty());

        let prompt = match (request.prompt.trim(), request.description.trim()) {
            ("", "") => {
                return Err(Rejection::new(
                    DelegationError::Validation(
                        "either prompt or description must be provided".into(),
                    ),
                    requested_id,
                ));
            }
            ("", description) => description.to_string(),
            (prompt, _) => prompt.to_string(),
        };

        let Some((subagent_type, def)) = self.subagents.get(&request.subagent_type) else {
            return Err(Rejection::new(
                DelegationError::Validation(format!(
                    "unknown subagent_type '{}'; available: {}",
                    request.subagent_type,
                    self.subagents.names().join(", ")
                )),
                requested_id,
            ));
        };

        let depth = parent.delegation_depth();
        if depth + 1 > self.config.max_depth {
            return Err(Rejection::new(
                DelegationError::Policy(format!(
                    "delegation depth limit exceeded: current depth {depth}, max_depth {}",
                    self.config.max_depth
                )),
                requested_id,
            ));
        }

        let mut running: Vec<String> = parent.get(keys::RUNNING_TASKS).unwrap_or_default();
        if running.len() >= self.config.max_parallel {
            return Err(Rejection::new(
                DelegationError::Policy(format!(
                    "concurrency limit exceeded: {} running, max_parallel {}",
                    running.len(),
                    self.config.max_parallel
                )),
                requested_id,
            ));
        }

        let parent_key = logical_parent_id(parent);
        let mut records: BTreeMap<String, DelegatedTask> =
            parent.get(keys::DELEGATION_TASKS).unwrap_or_default();

        // Resume.
        if let Some(task_id) = requested_id {
            let key = TaskKey::new(&parent_key, task_id);
            if let Some(handle) = self.tasks.get(&key) {
                if running.iter().any(|id| id == task_id) {
                    return Err(Rejection::new(
                        DelegationError::Policy(format!("task {task_id} is already running")),
                        requested_id,
                    ));
                }
                let Some(record) = records.get_mut(task_id) else {
                    return Err(Rejection::new(
                        DelegationError::Validation(format!(
                            "task {task_id} is not recorded in this session"
                        )),
                        requested_id,
                    ));
                };
                if request.model_override.is_some() {
                    debug!("Task {key}: model override ignored on resume");
                }
                record.status = TaskStatus::Running;
                let admitted = Admitted {
                    key,
                    handle,
                    subagent_type: record.subagent_type.clone(),
                    child_session_id: record.child_session_id.clone(),
                    prompt,
                };
                running.push(task_id.to_string());
                store_task_state(parent, &records, &running)
                    .map_err(|e| Rejection::new(DelegationError::Failed(e), requested_id))?;
                info!(
                    "Resuming task {} (type={}, child session {})",
                    admitted.key, admitted.subagent_type, admitted.child_session_id
                );
                return Ok(admitted);
            }
            if records.contains_key(task_id) {
                return Err(Rejection::new(
                    DelegationError::Validation(format!(
                        "runtime for task {task_id} is unavailable in this process; start a new task"
                    )),
                    requested_id,
                ));
            }
        }

        // Spawn.
        let (task_id, counter) = match requested_id {
            Some(id) => (id.to_string(), None),
            None => {
                let (id, counter) = self.next_task_id(parent, &parent_key, &records);
                (id, Some(counter))
            }
        };
        let resolved = self.resolve(&subagent_type, def, request.model_override.as_deref());
        let agent = self
            .build_agent(def, &resolved)
            .map_err(|e| Rejection::new(e, Some(task_id.as_str())))?;

        let mut child = SessionState::new();
        child.merge(parent.subset(&self.config.copy_back_keys));
        child.set_raw(keys::DELEGATION_DEPTH, Value::from(depth + 1));
        let child_session_id = child.id().to_string();

        records.insert(
            task_id.clone(),
            DelegatedTask {
                task_id: task_id.clone(),
                subagent_type: subagent_type.clone(),
                status: TaskStatus::Running,
                depth: depth + 1,
                parent_session_id: parent.id().to_string(),
                child_session_id: child_session_id.clone(),
                turns: 0,
            },
        );
        running.push(task_id.clone());
        if let Some(counter) = counter {
            parent.set_raw(keys::TASK_COUNTER, Value::from(counter));
        }
        store_task_state(parent, &records, &running)
            .map_err(|e| Rejection::new(DelegationError::Failed(e), Some(task_id.as_str())))?;

        let key = TaskKey::new(&parent_key, &task_id);
        let handle: ChildHandle = Arc::new(tokio::sync::Mutex::new(ChildRuntime::new(
            agent,
            child,
            &subagent_type,
        )));
        self.tasks.insert(key.clone(), Arc::clone(&handle));
        match self.backends.factory_for(parent.id()) {
            Some(factory) => self.backends.register(&child_session_id, factory),
            None => debug!("Session {}: no backend to propagate to {key}", parent.id()),
        }

        info!(
            "Spawned task {key} (type={subagent_type}, depth={}, model={}, child session {child_session_id})",
            depth + 1,
            resolved.model
        );
        Ok(Admitted {
            key,
            handle,
            subagent_type,
            child_session_id,
            prompt,
        })
    }

    fn next_task_id(
        &self,
        parent: &SessionState,
        parent_key: &str,
        records: &BTreeMap<String, DelegatedTask>,
    ) -> (String, u64) {
        let mut counter: u64 = parent.get(keys::TASK_COUNTER).unwrap_or(0);
        loop {
            counter += 1;
            let id = format!("task_{counter}");
            if !records.contains_key(&id) && !self.tasks.contains(&TaskKey::new(parent_key, &id)) {
                return (id, counter);
            }
        }
    }

    fn resolve(&self, name: &str, def: &SubAgentDef, model_override: Option<&str>) -> ResolvedSpec {
        let (instruction, model, tools) = match def {
            SubAgentDef::Spec(spec) => (
                spec.system_prompt.clone(),
                spec.model.clone(),
                spec.tools.clone(),
            ),
            SubAgentDef::Agent { .. } => (String::new(), None, Vec::new()),
        };
        let model = match model_override {
            Some(m) if self.config.allow_model_override => m.to_string(),
            Some(m) => {
                warn!("Model override '{m}' ignored: overrides are disabled");
                model.unwrap_or_else(|| self.default_model.clone())
            }
            None => model.unwrap_or_else(|| self.default_model.clone()),
        };
        ResolvedSpec {
            name: name.to_string(),
            instruction,
            model,
            tools,
        }
    }

    fn build_agent(
        &self,
        def: &SubAgentDef,
        spec: &ResolvedSpec,
    ) -> Result<Box<dyn ChildAgent>, DelegationError> {
        let builder = match def {
            SubAgentDef::Agent { builder, .. } => builder,
            SubAgentDef::Spec(_) => self.spec_builder.as_ref().ok_or_else(|| {
                DelegationError::Validation(format!(
                    "no agent builder is configured for sub-agent '{}'",
                    spec.name
                ))
            })?,
        };
        builder
            .build(spec)
            .map_err(|e| DelegationError::Failed(format!("could not build '{}': {e}", spec.name)))
    }

    async fn execute(&self, admitted: &Admitted, recorder: &TurnRecorder) -> ChildOutcome {
        let token = CancellationToken::new();
        let limit = Duration::from_secs(self.config.timeout_seconds);
        let mut task = tokio::spawn(run_child(
            Arc::clone(&admitted.handle),
            admitted.prompt.clone(),
            recorder.clone(),
            token.clone(),
            self.config.copy_back_keys.clone(),
        ));

        match tokio::time::timeout(limit, &mut task).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => ChildOutcome::aborted(format!("child task aborted: {e}")),
            Err(_) => {
                warn!(
                    "Task {} exceeded {}s; cancelling",
                    admitted.key, self.config.timeout_seconds
                );
                token.cancel();
                let mut outcome = match task.await {
                    Ok(outcome) => outcome,
                    Err(e) => ChildOutcome::aborted(format!("child task aborted: {e}")),
                };
                outcome.end = TurnEnd::TimedOut;
                outcome
            }
        }
    }

    fn finish(
        &self,
        parent: &mut SessionState,
        admitted: Admitted,
        outcome: ChildOutcome,
        output: TurnOutput,
    ) -> SubtaskResponse {
        let task_id = admitted.key.task_id.clone();
        let mut running: Vec<String> = parent.get(keys::RUNNING_TASKS).unwrap_or_default();
        running.retain(|id| *id != task_id);

        let touched = parent.merge(outcome.changes);
        if !touched.is_empty() {
            debug!("Task {}: copied back {}", admitted.key, touched.join(", "));
        }

        let error = match outcome.end {
            TurnEnd::Finished => None,
            TurnEnd::Failed(e) => Some(DelegationError::Failed(e)),
            TurnEnd::TimedOut => Some(DelegationError::Timeout {
                seconds: self.config.timeout_seconds,
            }),
        };
        if matches!(error, Some(DelegationError::Timeout { .. })) {
            self.release_runtime(&admitted.key, &admitted.child_session_id);
        }

        let status = if error.is_some() {
            TaskStatus::Error
        } else {
            TaskStatus::Completed
        };
        let mut records: BTreeMap<String, DelegatedTask> =
            parent.get(keys::DELEGATION_TASKS).unwrap_or_default();
        if let Some(record) = records.get_mut(&task_id) {
            record.status = status;
            record.turns = outcome.turns;
        }
        if let Err(e) = store_task_state(parent, &records, &running) {
            warn!("Task {}: failed to record task state: {e}", admitted.key);
        }

        match &error {
            None => info!(
                "Task {} completed ({} tool calls)",
                admitted.key,
                output.tool_call_names.len()
            ),
            Some(e) => warn!("Task {} ended with error: {e}", admitted.key),
        }

        SubtaskResponse {
            status,
            task_id: Some(task_id),
            subagent_type: Some(admitted.subagent_type),
            result: truncate_result(output.text(), self.config.max_result_chars),
            tool_call_names: output.tool_call_names,
            error_kind: error.as_ref().map(|e| e.kind().to_string()),
            error: error.map(|e| e.to_string()),
        }
    }

    fn release_runtime(&self, key: &TaskKey, child_session_id: &str) {
        self.tasks.remove(key);
        self.backends.clear(child_session_id);
        debug!("Released task {key} (child session {child_session_id})");
    }

    /// Reconcile a session's running tasks with the live children of this
    /// process. Running ids without a live child (a session saved mid-run and
    /// restored elsewhere) lose their slot and their records are marked
    /// `error`. Returns the ids recovered.
    pub fn recover_orphaned(&self, parent: &mut SessionState) -> Vec<String> {
        let running: Vec<String> = parent.get(keys::RUNNING_TASKS).unwrap_or_default();
        let mut records: BTreeMap<String, DelegatedTask> =
            parent.get(keys::DELEGATION_TASKS).unwrap_or_default();
        if running.is_empty() && records.values().all(|r| r.status != TaskStatus::Running) {
            return Vec::new();
        }

        let parent_key = logical_parent_id(parent);
        let is_live = |id: &str| self.tasks.contains(&TaskKey::new(&parent_key, id));
        let mut orphaned: Vec<String> = running
            .iter()
            .filter(|id| !is_live(id.as_str()))
            .cloned()
            .collect();
        for record in records.values() {
            if record.status == TaskStatus::Running
                && !is_live(&record.task_id)
                && !orphaned.contains(&record.task_id)
            {
                orphaned.push(record.task_id.clone());
            }
        }
        if orphaned.is_empty() {
            return orphaned;
        }

        let running: Vec<String> = running
            .into_iter()
            .filter(|id| !orphaned.contains(id))
            .collect();
        for id in &orphaned {
            if let Some(record) = records.get_mut(id) {
                record.status = TaskStatus::Error;
            }
        }
        if let Err(e) = store_task_state(parent, &records, &running) {
            warn!("Session {}: failed to record task state: {e}", parent.id());
        }
        warn!(
            "Session {}: runtime unavailable in this process for running tasks {}; marked as error",
            parent.id(),
            orphaned.join(", ")
        );
        orphaned
    }

    // ── Cleanup ────────────────────────────────────────────────────

    /// Drop a finished task: its record, live child and backend
    /// registration. Running tasks are left alone.
    pub fn release_task(&self, parent: &mut SessionState, task_id: &str) -> bool {
        let running: Vec<String> = parent.get(keys::RUNNING_TASKS).unwrap_or_default();
        if running.iter().any(|id| id == task_id) {
            warn!("Session {}: not releasing running task {task_id}", parent.id());
            return false;
        }
        let mut records: BTreeMap<String, DelegatedTask> =
            parent.get(keys::DELEGATION_TASKS).unwrap_or_default();
        let Some(record) = records.remove(task_id) else {
            return false;
        };
        if let Some(parent_key) = parent.get::<String>(keys::LOGICAL_PARENT_ID) {
            self.release_runtime(&TaskKey::new(parent_key, task_id), &record.child_session_id);
        }
        if let Err(e) = store_task_state(parent, &records, &running) {
            warn!("Session {}: failed to record task state: {e}", parent.id());
        }
        true
    }

    /// Release every task that is not running. Returns the released ids.
    pub fn prune_finished(&self, parent: &mut SessionState) -> Vec<String> {
        let records: BTreeMap<String, DelegatedTask> =
            parent.get(keys::DELEGATION_TASKS).unwrap_or_default();
        records
            .into_values()
            .filter(|r| r.status != TaskStatus::Running)
            .map(|r| r.task_id)
            .filter(|id| self.release_task(parent, id))
            .collect()
    }

    /// Release every child of `parent` and forget its task records.
    /// Returns the number of live children dropped.
    pub fn end_session(&self, parent: &mut SessionState) -> usize {
        let records: BTreeMap<String, DelegatedTask> =
            parent.get(keys::DELEGATION_TASKS).unwrap_or_default();
        for record in records.values() {
            self.backends.clear(&record.child_session_id);
        }
        let dropped = match parent.get::<String>(keys::LOGICAL_PARENT_ID) {
            Some(parent_key) => self.tasks.remove_parent(&parent_key).len(),
            None => 0,
        };
        parent.remove(keys::DELEGATION_TASKS);
        parent.remove(keys::RUNNING_TASKS);
        info!("Session {}: released {dropped} delegated tasks", parent.id());
        dropped
    }
}

impl fmt::Debug for Delegator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delegator")
            .field("config", &self.config)
            .field("subagents", &self.subagents.names())
            .field("default_model", &self.default_model)
            .finish_non_exhaustive()
    }
}

impl ChildOutcome {
    fn aborted(message: String) -> Self {
        Self {
            end: TurnEnd::Failed(message),
            changes: Map::new(),
            turns: 0,
        }
    }
}

/// Body of the spawned child task. Holds the child's lock for the whole turn.
async fn run_child(
    handle: ChildHandle,
    prompt: String,
    recorder: TurnRecorder,
    token: CancellationToken,
    copy_back_keys: Vec<String>,
) -> ChildOutcome {
    let mut child = handle.lock_owned().await;
    let end = tokio::select! {
        biased;
        _ = token.cancelled() => TurnEnd::TimedOut,
        result = child.run_turn(&prompt, &recorder) => match result {
            Ok(()) => TurnEnd::Finished,
            Err(e) => TurnEnd::Failed(e),
        },
    };
    ChildOutcome {
        end,
        changes: child.take_changes(&copy_back_keys),
        turns: child.turns(),
    }
}

/// Stable id under which this session's children are registered.
fn logical_parent_id(parent: &mut SessionState) -> String {
    if let Some(id) = parent.get::<String>(keys::LOGICAL_PARENT_ID) {
        return id;
    }
    let id = parent.id().to_string();
    parent.set_raw(keys::LOGICAL_PARENT_ID, Value::from(id.clone()));
    id
}

fn store_task_state(
    parent: &mut SessionState,
    records: &BTreeMap<String, DelegatedTask>,
    running: &[String],
) -> Result<(), String> {
    parent.set(keys::DELEGATION_TASKS, records)?;
    parent.set(keys::RUNNING_TASKS, &running)
}

// ── RunSubtaskTool ─────────────────────────────────────────────────

/// `run_subtask` as a function-calling tool bound to one parent session.
///
/// Several calls in one model round may be executed concurrently; the
/// scheduler enforces `max_parallel` for the session.
pub struct RunSubtaskTool {
    delegator: Arc<Delegator>,
    session: SharedSession,
}

impl RunSubtaskTool {
    pub fn new(delegator: Arc<Delegator>, session: SharedSession) -> Self {
        Self { delegator, session }
    }
}

impl Tool for RunSubtaskTool {
    fn definition(&self) -> ToolDef {
        ToolDef::new(
            "run_subtask",
            format!(
                "Delegate a task to an isolated sub-agent and wait for its result. \
                 Pass the returned task_id to continue the same sub-agent later. \
                 Independent calls in one round run concurrently.\n\
                 Available sub-agent types:\n{}",
                self.delegator.subagents().describe()
            ),
            json_schema_for::<SubtaskRequest>(),
        )
    }

    fn execute(&self, arguments: &str) -> ToolFuture<'_> {
        let arguments = arguments.to_string();
        Box::pin(async move {
            log_tool_call("run_subtask", &arguments);
            if let Some(err) = validate_tool_arguments(self, &arguments) {
                return SubtaskResponse::rejected(&DelegationError::Validation(err), None)
                    .to_json();
            }
            let request: SubtaskRequest = match parse_tool_args(&arguments) {
                Ok(r) => r,
                Err(e) => {
                    return SubtaskResponse::rejected(&DelegationError::Validation(e), None)
                        .to_json();
                }
            };
            self.delegator
                .run_subtask(&self.session, request)
                .await
                .to_json()
        })
    }
}
