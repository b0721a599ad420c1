//! [`AgentRuntime`]: one object that owns the registries and both engines.
//!
//! The runtime is the host's entry point. It hands out sessions, runs the
//! pre-completion hook, executes delegations, and performs explicit cleanup.
//! The registries it owns are process-local arenas; nothing in them is ever
//! written into session state.

use crate::Message;
use crate::agent::config::RuntimeConfig;
use crate::agent::registry::{BackendRegistry, TaskRegistry};
use crate::agent::session::{SessionState, SharedSession};
use crate::agent::sub_agent::{
    AgentBuilder, CompletionAgentBuilder, CompletionFactory, Delegator, RunSubtaskTool,
    SubAgentRegistry, SubtaskRequest, SubtaskResponse,
};
use crate::api::Completion;
use crate::backend::BackendFactory;
use crate::context::engine::{Prepared, SummarizationEngine};
use crate::context::tokens::TokenEstimator;
use std::sync::Arc;
use tracing::{debug, info};

pub struct AgentRuntime {
    config: RuntimeConfig,
    backends: Arc<BackendRegistry>,
    tasks: Arc<TaskRegistry>,
    engine: Arc<SummarizationEngine>,
    delegator: Arc<Delegator>,
}

/// Builder for [`AgentRuntime`].
pub struct AgentRuntimeBuilder {
    config: RuntimeConfig,
    completion: Option<Arc<dyn Completion>>,
    model_completion: Option<CompletionFactory>,
    agent_builder: Option<Arc<dyn AgentBuilder>>,
    estimator: Option<Arc<dyn TokenEstimator>>,
    subagents: SubAgentRegistry,
}

impl AgentRuntimeBuilder {
    /// Completion used for model summaries and, unless an agent builder is
    /// set, for spec-defined sub-agents.
    pub fn with_completion(mut self, completion: Arc<dyn Completion>) -> Self {
        self.completion = Some(completion);
        self
    }

    /// Pick the sub-agent completion by model name.
    pub fn with_model_completion(mut self, factory: CompletionFactory) -> Self {
        self.model_completion = Some(factory);
        self
    }

    /// Builder for spec-defined sub-agents. Replaces the completion-backed
    /// default.
    pub fn with_agent_builder(mut self, builder: Arc<dyn AgentBuilder>) -> Self {
        self.agent_builder = Some(builder);
        self
    }

    pub fn with_estimator(mut self, estimator: Arc<dyn TokenEstimator>) -> Self {
        self.estimator = Some(estimator);
        self
    }

    pub fn with_subagents(mut self, subagents: SubAgentRegistry) -> Self {
        self.subagents = subagents;
        self
    }

    pub fn build(self) -> AgentRuntime {
        let config = self.config;
        let backends = Arc::new(BackendRegistry::new());
        let tasks = Arc::new(TaskRegistry::new());

        let summarization = &config.summarization;
        let mut engine =
            SummarizationEngine::new(summarization.config.clone(), Arc::clone(&backends))
                .with_summarization(summarization.enabled);
        if let Some(truncation) = config.truncate_args.active() {
            engine = engine.with_truncation(truncation.clone());
        }
        if let Some(estimator) = self.estimator {
            engine = engine.with_estimator(estimator);
        }
        if let Some(completion) = &self.completion {
            engine = engine.with_completion(Arc::clone(completion));
        }
        let engine = Arc::new(engine);

        let spec_builder = self.agent_builder.or_else(|| {
            let completion = self.completion?;
            let mut builder =
                CompletionAgentBuilder::new(completion).with_engine(Arc::clone(&engine));
            if let Some(factory) = self.model_completion {
                builder = builder.with_model_completion(factory);
            }
            Some(Arc::new(builder) as Arc<dyn AgentBuilder>)
        });

        let mut delegator = Delegator::new(
            config.delegation.clone(),
            self.subagents,
            Arc::clone(&tasks),
            Arc::clone(&backends),
        )
        .with_default_model(config.summarization.config.model.clone());
        if let Some(builder) = spec_builder {
            delegator = delegator.with_spec_builder(builder);
        }

        debug!(
            "Runtime built: summarization={}, truncation={}, max_depth={}, max_parallel={}",
            config.summarization.enabled,
            config.truncate_args.enabled,
            config.delegation.max_depth,
            config.delegation.max_parallel,
        );
        AgentRuntime {
            config,
            backends,
            tasks,
            engine,
            delegator: Arc::new(delegator),
        }
    }
}

impl AgentRuntime {
    pub fn builder(config: RuntimeConfig) -> AgentRuntimeBuilder {
        AgentRuntimeBuilder {
            config,
            completion: None,
            model_completion: None,
            agent_builder: None,
            estimator: None,
            subagents: SubAgentRegistry::new(),
        }
    }

    // ── Sessions ───────────────────────────────────────────────────

    /// Start a fresh session, registering its backend factory if given.
    pub fn start_session(&self, backend: Option<BackendFactory>) -> SharedSession {
        self.attach_session(SessionState::new(), backend)
    }

    /// Adopt an existing (e.g. restored) session. Tasks recorded as running
    /// whose children do not live in this process are marked as failed so
    /// their slots are freed.
    pub fn attach_session(
        &self,
        mut state: SessionState,
        backend: Option<BackendFactory>,
    ) -> SharedSession {
        if let Some(factory) = backend {
            self.backends.register(state.id(), factory);
        }
        let recovered = self.delegator.recover_orphaned(&mut state);
        info!(
            "Session {} attached ({} orphaned tasks recovered)",
            state.id(),
            recovered.len()
        );
        state.into_shared()
    }

    // ── Hook and delegation ────────────────────────────────────────

    /// The pre-completion hook. Call before every completion request.
    pub async fn prepare_completion(
        &self,
        session: &mut SessionState,
        messages: Vec<Message>,
    ) -> Prepared {
        self.engine.prepare(session, messages).await
    }

    pub async fn run_subtask(
        &self,
        session: &SharedSession,
        request: SubtaskRequest,
    ) -> SubtaskResponse {
        self.delegator.run_subtask(session, request).await
    }

    pub async fn run_subtasks(
        &self,
        session: &SharedSession,
        requests: Vec<SubtaskRequest>,
    ) -> Vec<SubtaskResponse> {
        self.delegator.run_subtasks(session, requests).await
    }

    /// `run_subtask` as a tool bound to `session`.
    pub fn run_subtask_tool(&self, session: &SharedSession) -> RunSubtaskTool {
        RunSubtaskTool::new(Arc::clone(&self.delegator), Arc::clone(session))
    }

    // ── Cleanup ────────────────────────────────────────────────────

    pub async fn release_task(&self, session: &SharedSession, task_id: &str) -> bool {
        let mut state = session.lock().await;
        self.delegator.release_task(&mut state, task_id)
    }

    pub async fn prune_finished_tasks(&self, session: &SharedSession) -> Vec<String> {
        let mut state = session.lock().await;
        self.delegator.prune_finished(&mut state)
    }

    /// Release every child of `session` and its own backend registration.
    /// Returns the number of live children dropped.
    pub async fn end_session(&self, session: &SharedSession) -> usize {
        let mut state = session.lock().await;
        let dropped = self.delegator.end_session(&mut state);
        self.backends.clear(state.id());
        dropped
    }

    // ── Accessors ──────────────────────────────────────────────────

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn backends(&self) -> &Arc<BackendRegistry> {
        &self.backends
    }

    pub fn tasks(&self) -> &Arc<TaskRegistry> {
        &self.tasks
    }

    pub fn engine(&self) -> &Arc<SummarizationEngine> {
        &self.engine
    }

    pub fn delegator(&self) -> &Arc<Delegator> {
        &self.delegator
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::CompletionFuture;
    use crate::backend::{Backend, MemoryBackend};
    use crate::context::summarizer::SummarizationConfig;
    use crate::tools::Tool;

    struct Fixed(&'static str);

    impl Completion for Fixed {
        fn complete<'a>(
            &'a self,
            _system: &'a str,
            _conversation: &'a [Message],
        ) -> CompletionFuture<'a> {
            let reply = self.0.to_string();
            Box::pin(async move { Ok(reply) })
        }
    }

    #[tokio::test]
    async fn completion_backed_subagents_by_default() {
        let runtime = AgentRuntime::builder(RuntimeConfig::default())
            .with_completion(Arc::new(Fixed("done")))
            .build();
        let session = runtime.start_session(None);
        let response = runtime
            .run_subtask(&session, SubtaskRequest::new("d", "do it"))
            .await;
        assert!(response.is_completed(), "{response:?}");
        assert_eq!(response.result, "done");
    }

    #[tokio::test]
    async fn without_completion_specs_cannot_run() {
        let runtime = AgentRuntime::builder(RuntimeConfig::default()).build();
        let session = runtime.start_session(None);
        let response = runtime
            .run_subtask(&session, SubtaskRequest::new("d", "do it"))
            .await;
        assert_eq!(response.error_kind.as_deref(), Some("validation"));
    }

    #[tokio::test]
    async fn hook_summarizes_with_registered_backend() {
        let config = RuntimeConfig::default().with_summarization(
            SummarizationConfig::default()
                .with_context_window(1000)
                .with_model_summary(false),
        );
        let runtime = AgentRuntime::builder(config).build();
        let backend = MemoryBackend::new();
        let session = runtime.start_session(Some(backend.factory()));

        let messages: Vec<Message> = (0..8)
            .map(|i| Message::user(format!("{i}{}", "x".repeat(600))))
            .collect();
        let prepared = {
            let mut state = session.lock().await;
            runtime.prepare_completion(&mut state, messages).await
        };
        let report = prepared.summary.unwrap();
        assert_eq!(report.summarized_messages, 2);
        assert_eq!(prepared.messages.len(), 7);
        let log = backend.read(report.offload_path.as_deref().unwrap()).unwrap();
        assert!(log.contains(&format!("0{}", "x".repeat(600))));
    }

    #[tokio::test]
    async fn end_session_clears_registrations() {
        let runtime = AgentRuntime::builder(RuntimeConfig::default())
            .with_completion(Arc::new(Fixed("ok")))
            .build();
        let session = runtime.start_session(Some(MemoryBackend::new().factory()));
        runtime
            .run_subtask(&session, SubtaskRequest::new("d", "p"))
            .await;
        assert_eq!(runtime.tasks().len(), 1);
        assert_eq!(runtime.backends().len(), 2);

        assert_eq!(runtime.end_session(&session).await, 1);
        assert!(runtime.tasks().is_empty());
        assert!(runtime.backends().is_empty());
    }

    #[tokio::test]
    async fn tool_is_bound_to_session() {
        let runtime = AgentRuntime::builder(RuntimeConfig::default())
            .with_completion(Arc::new(Fixed("ok")))
            .build();
        let session = runtime.start_session(None);
        let tool = runtime.run_subtask_tool(&session);
        let out = tool.execute(r#"{"description": "d"}"#).await;
        assert!(out.contains(r#""status":"completed""#), "{out}");
        assert!(runtime.prune_finished_tasks(&session).await.contains(&"task_1".to_string()));
        assert!(!runtime.release_task(&session, "task_1").await);
    }
}
