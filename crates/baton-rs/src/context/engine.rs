//! The summarization engine: the hook that runs before every completion.
//!
//! [`SummarizationEngine::prepare`] takes the outgoing conversation and
//! returns the one that should actually be sent. In order, it:
//!
//! 1. resolves the session's context window,
//! 2. runs the argument truncation pass (when enabled),
//! 3. compares the estimated token count against the trigger threshold,
//! 4. splits off all but the most recent `keep_messages` messages,
//! 5. appends that span to the history log on the session backend,
//! 6. summarizes it, by model when possible and inline otherwise,
//! 7. replaces it with one summary message and records the event in
//!    session state.
//!
//! The hook is async and is awaited inline before the completion request;
//! no step is deferred to a background task. None of its failures abort the
//! turn: offload errors drop the path from the summary message, and summary
//! model errors fall back to the inline summary.

use crate::Message;
use crate::agent::registry::BackendRegistry;
use crate::agent::session::{SessionState, keys};
use crate::api::Completion;
use crate::context::budget::{ContextBudget, resolve_context_window};
use crate::context::offload::offload_history;
use crate::context::summarizer::{
    SummarizationConfig, SummaryError, generate_model_summary, inline_summary, summary_message,
};
use crate::context::tokens::{CharRatioEstimator, TokenEstimator};
use crate::context::transcript::head_chars;
use crate::context::truncation::{TruncateArgsConfig, truncate_tool_arguments};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

// ── Persisted state ────────────────────────────────────────────────

/// Summarization bookkeeping kept in session state.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(default)]
pub struct SummarizationState {
    pub summaries_performed: u64,
    pub total_tokens_summarized: u64,
    /// Leading excerpt of the most recent summary.
    pub last_summary_excerpt: Option<String>,
    /// Where each offload landed, oldest first.
    pub offload_paths: Vec<String>,
}

impl SummarizationState {
    /// Read from session state; absent or malformed state reads as default.
    pub fn load(session: &SessionState) -> Self {
        session.get(keys::SUMMARIZATION).unwrap_or_default()
    }

    pub fn store(&self, session: &mut SessionState) -> Result<(), String> {
        session.set(keys::SUMMARIZATION, self)
    }
}

// ── Outcome ────────────────────────────────────────────────────────

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SummaryStrategy {
    Model,
    Inline,
}

/// What one summarization did.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct SummaryReport {
    pub summarized_messages: usize,
    pub kept_messages: usize,
    pub summarized_tokens: usize,
    pub offload_path: Option<String>,
    pub strategy: SummaryStrategy,
}

/// The conversation to send, plus what was done to it.
#[derive(Debug, Clone)]
pub struct Prepared {
    pub messages: Vec<Message>,
    /// Arguments shortened by the truncation pass.
    pub truncated_arguments: usize,
    pub summary: Option<SummaryReport>,
}

impl Prepared {
    fn unchanged(messages: Vec<Message>) -> Self {
        Self {
            messages,
            truncated_arguments: 0,
            summary: None,
        }
    }

    pub fn is_unchanged(&self) -> bool {
        self.truncated_arguments == 0 && self.summary.is_none()
    }
}

/// Split `messages` into the span to summarize and the `keep` most recent
/// messages. Nothing is summarized when `messages.len() <= keep`.
pub fn partition(mut messages: Vec<Message>, keep: usize) -> (Vec<Message>, Vec<Message>) {
    if messages.len() <= keep {
        return (Vec::new(), messages);
    }
    let recent = messages.split_off(messages.len() - keep);
    (messages, recent)
}

// ── Engine ─────────────────────────────────────────────────────────

pub struct SummarizationEngine {
    config: SummarizationConfig,
    summarize: bool,
    truncation: Option<TruncateArgsConfig>,
    estimator: Arc<dyn TokenEstimator>,
    completion: Option<Arc<dyn Completion>>,
    backends: Arc<BackendRegistry>,
}

impl SummarizationEngine {
    /// An engine that summarizes inline and offloads through `backends`.
    pub fn new(config: SummarizationConfig, backends: Arc<BackendRegistry>) -> Self {
        Self {
            config,
            summarize: true,
            truncation: None,
            estimator: Arc::new(CharRatioEstimator::default()),
            completion: None,
            backends,
        }
    }

    /// Enable the argument truncation pass.
    pub fn with_truncation(mut self, config: TruncateArgsConfig) -> Self {
        self.truncation = Some(config);
        self
    }

    pub fn with_estimator(mut self, estimator: Arc<dyn TokenEstimator>) -> Self {
        self.estimator = estimator;
        self
    }

    /// Completion used for model summaries.
    pub fn with_completion(mut self, completion: Arc<dyn Completion>) -> Self {
        self.completion = Some(completion);
        self
    }

    /// Turn summarization off, keeping only the truncation pass.
    pub fn with_summarization(mut self, enabled: bool) -> Self {
        self.summarize = enabled;
        self
    }

    pub fn config(&self) -> &SummarizationConfig {
        &self.config
    }

    pub fn estimator(&self) -> &dyn TokenEstimator {
        self.estimator.as_ref()
    }

    /// Effective context window for `session`.
    pub fn context_window(&self, session: &SessionState) -> usize {
        resolve_context_window(
            session.context_window_override(),
            self.config.context_window,
            &self.config.model,
        )
    }

    /// Prepare `messages` for the next completion request.
    pub async fn prepare(&self, session: &mut SessionState, mut messages: Vec<Message>) -> Prepared {
        if messages.is_empty() {
            return Prepared::unchanged(messages);
        }
        let window = self.context_window(session);

        let truncated_arguments = match &self.truncation {
            Some(cfg) => truncate_tool_arguments(&mut messages, cfg, window, self.estimator()),
            None => 0,
        };
        if !self.summarize {
            return Prepared {
                messages,
                truncated_arguments,
                summary: None,
            };
        }

        let budget = ContextBudget::new(window).with_trigger_fraction(self.config.trigger_fraction);
        let usage = budget.estimate_usage(&messages, self.estimator());
        if !budget.exceeded_by(usage.estimated_tokens) {
            trace!("Session {}: {}", session.id(), usage.to_log_string());
            return Prepared {
                messages,
                truncated_arguments,
                summary: None,
            };
        }

        let (span, recent) = partition(messages, self.config.keep_messages);
        if span.is_empty() {
            debug!(
                "Session {}: over threshold ({}) but only {} messages; nothing to summarize",
                session.id(),
                usage.to_log_string(),
                recent.len(),
            );
            return Prepared {
                messages: recent,
                truncated_arguments,
                summary: None,
            };
        }

        info!(
            "Session {}: summarizing {} messages, keeping {} ({})",
            session.id(),
            span.len(),
            recent.len(),
            usage.to_log_string(),
        );

        let mut state = SummarizationState::load(session);
        let offload_path = self.offload(session, &span, state.summaries_performed);
        let (summary, strategy) = self.summarize_span(&span, window).await;

        let summarized_tokens = self.estimator.estimate_conversation(&span);
        let report = SummaryReport {
            summarized_messages: span.len(),
            kept_messages: recent.len(),
            summarized_tokens,
            offload_path: offload_path.clone(),
            strategy,
        };

        state.summaries_performed += 1;
        state.total_tokens_summarized += summarized_tokens as u64;
        state.last_summary_excerpt = Some(head_chars(&summary, self.config.summary_excerpt_chars));
        if let Some(ref path) = offload_path
            && !state.offload_paths.contains(path)
        {
            state.offload_paths.push(path.clone());
        }
        if let Err(e) = state.store(session) {
            warn!("Session {}: failed to record summarization state: {e}", session.id());
        }

        let mut out = Vec::with_capacity(recent.len() + 1);
        out.push(summary_message(&summary, offload_path.as_deref()));
        out.extend(recent);
        Prepared {
            messages: out,
            truncated_arguments,
            summary: Some(report),
        }
    }

    fn offload(&self, session: &SessionState, span: &[Message], index: u64) -> Option<String> {
        let Some(backend) = self.backends.backend_for(session) else {
            debug!("Session {}: no backend registered; skipping offload", session.id());
            return None;
        };
        match offload_history(
            backend.as_ref(),
            span,
            &self.config.history_path_prefix,
            index,
        ) {
            Ok(path) => Some(path),
            Err(e) => {
                warn!("Session {}: failed to offload history: {e}", session.id());
                None
            }
        }
    }

    async fn summarize_span(&self, span: &[Message], window: usize) -> (String, SummaryStrategy) {
        let cpt = self.estimator.chars_per_token();
        if self.config.use_model_summary
            && let Some(completion) = &self.completion
        {
            let max_input = (self.config.max_summary_input_tokens as f64 * cpt) as usize;
            let attempt =
                AssertUnwindSafe(generate_model_summary(completion.as_ref(), span, max_input))
                    .catch_unwind()
                    .await;
            let error = match attempt {
                Ok(Ok(summary)) => return (summary, SummaryStrategy::Model),
                Ok(Err(e)) => e,
                Err(_) => SummaryError::Panicked,
            };
            warn!("{error}; using inline summary");
        }
        let max_chars = (window as f64 * self.config.inline_summary_fraction * cpt) as usize;
        (inline_summary(span, max_chars), SummaryStrategy::Inline)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::CompletionFuture;
    use crate::backend::{Backend, MemoryBackend};
    use serde_json::json;
    use std::sync::Mutex;

    struct Scripted {
        reply: Result<String, String>,
        seen: Mutex<Vec<String>>,
    }

    impl Scripted {
        fn new(reply: Result<&str, &str>) -> Arc<Self> {
            Arc::new(Self {
                reply: reply.map(String::from).map_err(String::from),
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    impl Completion for Scripted {
        fn complete<'a>(&'a self, _: &'a str, conversation: &'a [Message]) -> CompletionFuture<'a> {
            self.seen
                .lock()
                .unwrap()
                .extend(conversation.iter().map(|m| m.text()));
            let reply = self.reply.clone();
            Box::pin(async move { reply })
        }
    }

    struct Panicking;

    impl Completion for Panicking {
        fn complete<'a>(&'a self, _: &'a str, _: &'a [Message]) -> CompletionFuture<'a> {
            panic!("provider exploded")
        }
    }

    fn eight_messages() -> Vec<Message> {
        (0..8)
            .map(|i| {
                if i % 2 == 0 {
                    Message::user(format!("{i}{}", "u".repeat(599)))
                } else {
                    Message::agent(format!("{i}{}", "a".repeat(599)))
                }
            })
            .collect()
    }

    fn engine(backends: Arc<BackendRegistry>) -> SummarizationEngine {
        SummarizationEngine::new(
            SummarizationConfig::new()
                .with_context_window(1_000)
                .with_keep_messages(2),
            backends,
        )
    }

    fn session_with_backend(backends: &BackendRegistry) -> (SessionState, MemoryBackend) {
        let session = SessionState::with_id("s1");
        let backend = MemoryBackend::new();
        backends.register("s1", backend.factory());
        (session, backend)
    }

    #[test]
    fn partition_keeps_tail() {
        let (span, recent) = partition(eight_messages(), 2);
        assert_eq!(span.len(), 6);
        assert_eq!(recent.len(), 2);
        assert!(recent[0].text().starts_with('6'));

        let (span, recent) = partition(eight_messages(), 8);
        assert!(span.is_empty());
        assert_eq!(recent.len(), 8);
    }

    #[tokio::test]
    async fn below_threshold_is_unchanged() {
        let backends = Arc::new(BackendRegistry::new());
        let (mut session, backend) = session_with_backend(&backends);
        let messages = vec![Message::user("hi"), Message::agent("hello")];
        let prepared = engine(backends).prepare(&mut session, messages.clone()).await;
        assert!(prepared.is_unchanged());
        assert_eq!(prepared.messages, messages);
        assert!(backend.snapshot().is_empty());
        assert!(!session.contains_key(keys::SUMMARIZATION));
    }

    #[tokio::test]
    async fn empty_conversation_is_unchanged() {
        let backends = Arc::new(BackendRegistry::new());
        let mut session = SessionState::with_id("s1");
        let prepared = engine(backends).prepare(&mut session, vec![]).await;
        assert!(prepared.messages.is_empty());
        assert!(prepared.is_unchanged());
    }

    #[tokio::test]
    async fn over_threshold_summarizes_and_offloads() {
        let backends = Arc::new(BackendRegistry::new());
        let (mut session, backend) = session_with_backend(&backends);
        let messages = eight_messages();

        let prepared = engine(backends).prepare(&mut session, messages.clone()).await;

        assert_eq!(prepared.messages.len(), 3);
        assert_eq!(prepared.messages[1..], messages[6..]);
        let report = prepared.summary.unwrap();
        assert_eq!(report.summarized_messages, 6);
        assert_eq!(report.kept_messages, 2);
        assert_eq!(report.summarized_tokens, 900);
        assert_eq!(report.strategy, SummaryStrategy::Inline);

        let path = "/conversation_history/session_history.md";
        assert_eq!(report.offload_path.as_deref(), Some(path));
        assert!(prepared.messages[0].text().contains(path));
        let log = backend.read(path).unwrap();
        for m in &messages[..6] {
            assert!(log.contains(&m.text()));
        }

        let state = SummarizationState::load(&session);
        assert_eq!(state.summaries_performed, 1);
        assert_eq!(state.total_tokens_summarized, 900);
        assert_eq!(state.offload_paths, vec![path.to_string()]);
        assert!(state.last_summary_excerpt.unwrap().chars().count() <= 500);
    }

    #[tokio::test]
    async fn model_summary_is_used_when_available() {
        let backends = Arc::new(BackendRegistry::new());
        let (mut session, _backend) = session_with_backend(&backends);
        let completion = Scripted::new(Ok("## SUMMARY\nearlier work"));
        let engine = engine(backends).with_completion(completion.clone());

        let prepared = engine.prepare(&mut session, eight_messages()).await;
        let report = prepared.summary.unwrap();
        assert_eq!(report.strategy, SummaryStrategy::Model);
        assert!(prepared.messages[0].text().contains("earlier work"));

        // The summarizer saw the summarized span, not the kept messages.
        let seen = completion.seen.lock().unwrap().join("\n");
        assert!(seen.contains(&format!("0{}", "u".repeat(599))));
        assert!(!seen.contains(&format!("7{}", "a".repeat(599))));
    }

    #[tokio::test]
    async fn model_failure_falls_back_inline() {
        let backends = Arc::new(BackendRegistry::new());
        let (mut session, _backend) = session_with_backend(&backends);
        let engine = engine(backends).with_completion(Scripted::new(Err("HTTP 500")));
        let prepared = engine.prepare(&mut session, eight_messages()).await;
        assert_eq!(prepared.summary.unwrap().strategy, SummaryStrategy::Inline);
        assert_eq!(prepared.messages.len(), 3);
    }

    #[tokio::test]
    async fn model_panic_falls_back_inline() {
        let backends = Arc::new(BackendRegistry::new());
        let (mut session, _backend) = session_with_backend(&backends);
        let engine = engine(backends).with_completion(Arc::new(Panicking));
        let prepared = engine.prepare(&mut session, eight_messages()).await;
        assert_eq!(prepared.summary.unwrap().strategy, SummaryStrategy::Inline);
    }

    #[tokio::test]
    async fn model_summary_can_be_disabled() {
        let backends = Arc::new(BackendRegistry::new());
        let (mut session, _backend) = session_with_backend(&backends);
        let completion = Scripted::new(Ok("unused"));
        let engine = SummarizationEngine::new(
            SummarizationConfig::new()
                .with_context_window(1_000)
                .with_keep_messages(2)
                .with_model_summary(false),
            backends,
        )
        .with_completion(completion.clone());
        let prepared = engine.prepare(&mut session, eight_messages()).await;
        assert_eq!(prepared.summary.unwrap().strategy, SummaryStrategy::Inline);
        assert!(completion.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_backend_still_summarizes() {
        let backends = Arc::new(BackendRegistry::new());
        let mut session = SessionState::with_id("unregistered");
        let prepared = engine(backends).prepare(&mut session, eight_messages()).await;
        let report = prepared.summary.unwrap();
        assert!(report.offload_path.is_none());
        assert!(prepared.messages[0].text().starts_with("<conversation_summary>"));
    }

    #[tokio::test]
    async fn keep_window_larger_than_conversation() {
        let backends = Arc::new(BackendRegistry::new());
        let (mut session, _backend) = session_with_backend(&backends);
        let engine = SummarizationEngine::new(
            SummarizationConfig::new()
                .with_context_window(1_000)
                .with_keep_messages(20),
            backends,
        );
        let messages = eight_messages();
        let prepared = engine.prepare(&mut session, messages.clone()).await;
        assert!(prepared.summary.is_none());
        assert_eq!(prepared.messages, messages);
    }

    #[tokio::test]
    async fn session_override_changes_window() {
        let backends = Arc::new(BackendRegistry::new());
        let (mut session, _backend) = session_with_backend(&backends);
        session.set_context_window_override(Some(1_000_000));
        let prepared = engine(backends).prepare(&mut session, eight_messages()).await;
        assert!(prepared.is_unchanged());
    }

    #[tokio::test]
    async fn repeated_summaries_accumulate() {
        let backends = Arc::new(BackendRegistry::new());
        let (mut session, backend) = session_with_backend(&backends);
        let engine = engine(backends);

        let first = engine.prepare(&mut session, eight_messages()).await;
        let mut next = first.messages;
        next.extend(eight_messages());
        let second = engine.prepare(&mut session, next).await;
        assert!(second.summary.is_some());

        let state = SummarizationState::load(&session);
        assert_eq!(state.summaries_performed, 2);
        assert_eq!(state.offload_paths.len(), 1);
        let log = backend.read("/conversation_history/session_history.md").unwrap();
        assert_eq!(log.matches("## Summarized at ").count(), 2);
    }

    #[tokio::test]
    async fn truncation_runs_without_summarization() {
        let backends = Arc::new(BackendRegistry::new());
        let mut session = SessionState::with_id("s1");
        let engine = engine(backends)
            .with_summarization(false)
            .with_truncation(TruncateArgsConfig::new().with_keep_messages(1));
        let messages = vec![
            Message::tool_call("c1", "write_file", json!({"content": "x".repeat(5_000)})),
            Message::agent("done"),
        ];
        let prepared = engine.prepare(&mut session, messages).await;
        assert_eq!(prepared.truncated_arguments, 1);
        assert!(prepared.summary.is_none());
        assert_eq!(prepared.messages.len(), 2);
    }
}
