//! `baton`: inspect and exercise the summarization engine and the
//! delegation scheduler from the command line.
//!
//! Conversations are JSON arrays of messages:
//!
//! ```json
//! [{"role": "user", "parts": [{"type": "text", "text": "hello"}]}]
//! ```
//!
//! # Examples
//!
//! ```sh
//! # How much of the window does a conversation use?
//! baton estimate conversation.json --model openai/gpt-4o
//!
//! # Run the pre-completion hook offline; history is offloaded under ./history
//! baton compact conversation.json --history-dir ./history > compacted.json
//!
//! # Keep session state across runs
//! baton compact conversation.json --sessions-dir .baton --session ss-18c2f0a1-0000
//!
//! # Delegate one task through OpenRouter (reads OPENROUTER_KEY)
//! baton delegate --prompt "List the TODO comments in src/" --workdir .
//! ```
//!
//! Logs go to stderr (filter with `RUST_LOG`); results go to stdout as JSON.

use baton_rs::agent::config::RuntimeConfig;
use baton_rs::agent::runtime::AgentRuntime;
use baton_rs::agent::session::{SessionState, SessionStore};
use baton_rs::agent::sub_agent::{CompletionFactory, SubtaskRequest};
use baton_rs::api::{Completion, OpenRouterCompletion, RetryConfig, RetryingCompletion};
use baton_rs::backend::{Backend, FilesystemBackend, shared_factory};
use baton_rs::context::budget::{ContextBudget, resolve_context_window};
use baton_rs::context::tokens::{CharRatioEstimator, TokenEstimator};
use baton_rs::{DEFAULT_MODEL, Message};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser)]
#[command(name = "baton", version, about)]
struct Cli {
    /// JSON runtime config; missing keys take their defaults
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Estimate token usage of a conversation file
    Estimate {
        /// Conversation JSON file
        conversation: PathBuf,

        /// Model used for the context-window lookup
        #[arg(long)]
        model: Option<String>,

        /// Explicit context window in tokens
        #[arg(long)]
        context_window: Option<usize>,
    },

    /// Run the pre-completion hook over a conversation file and print the
    /// conversation that would be sent
    Compact {
        /// Conversation JSON file
        conversation: PathBuf,

        /// Directory used as the session's storage backend
        #[arg(long, default_value = ".")]
        history_dir: PathBuf,

        /// Directory holding saved sessions
        #[arg(long)]
        sessions_dir: Option<PathBuf>,

        /// Session id to load and save (with --sessions-dir)
        #[arg(long)]
        session: Option<String>,

        /// Explicit context window in tokens
        #[arg(long)]
        context_window: Option<usize>,

        /// Ask OpenRouter for the summary instead of summarizing inline
        #[arg(long)]
        model_summary: bool,
    },

    /// Run one delegated task through OpenRouter and print the response
    Delegate {
        /// Instructions for the sub-agent
        #[arg(long)]
        prompt: String,

        /// Short task description
        #[arg(long, default_value = "")]
        description: String,

        /// Sub-agent type
        #[arg(long, default_value = "general_purpose")]
        subagent_type: String,

        /// Model for the sub-agent (needs allow_model_override in the config)
        #[arg(long)]
        model: Option<String>,

        /// Directory used as the parent session's storage backend
        #[arg(long, default_value = ".")]
        workdir: PathBuf,
    },
}

fn main() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => RuntimeConfig::from_json_file(path),
        None => Ok(RuntimeConfig::default()),
    };
    let config = match config {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error: {e}");
            process::exit(1);
        }
    };

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Error: failed to start tokio runtime: {e}");
            process::exit(1);
        }
    };

    let result = runtime.block_on(async {
        match cli.command {
            Command::Estimate {
                conversation,
                model,
                context_window,
            } => estimate(&config, &conversation, model, context_window),
            Command::Compact {
                conversation,
                history_dir,
                sessions_dir,
                session,
                context_window,
                model_summary,
            } => {
                compact(
                    config,
                    &conversation,
                    &history_dir,
                    sessions_dir.zip(session),
                    context_window,
                    model_summary,
                )
                .await
            }
            Command::Delegate {
                prompt,
                description,
                subagent_type,
                model,
                workdir,
            } => {
                let mut request =
                    SubtaskRequest::new(description, prompt).with_subagent_type(subagent_type);
                request.model_override = model;
                delegate(config, request, &workdir).await
            }
        }
    });

    match result {
        Ok(output) => println!("{output}"),
        Err(e) => {
            eprintln!("Error: {e}");
            process::exit(1);
        }
    }
}

// ── Subcommands ────────────────────────────────────────────────────

fn estimate(
    config: &RuntimeConfig,
    path: &Path,
    model: Option<String>,
    context_window: Option<usize>,
) -> Result<String, String> {
    let messages = load_conversation(path)?;
    let summarization = &config.summarization.config;
    let model = model.unwrap_or_else(|| summarization.model.clone());
    let window = resolve_context_window(context_window, summarization.context_window, &model);
    let budget = ContextBudget::new(window).with_trigger_fraction(summarization.trigger_fraction);
    let estimator = CharRatioEstimator::default();
    let usage = budget.estimate_usage(&messages, &estimator);
    info!("{}", usage.to_log_string());

    let report = serde_json::json!({
        "model": model,
        "messages": messages.len(),
        "usage": usage,
        "per_message": messages.iter().map(|m| estimator.estimate_message(m)).collect::<Vec<_>>(),
        "trigger_threshold": budget.threshold(),
        "would_summarize": budget.exceeded_by(usage.estimated_tokens)
            && messages.len() > summarization.keep_messages,
    });
    to_json(&report)
}

async fn compact(
    mut config: RuntimeConfig,
    path: &Path,
    history_dir: &Path,
    stored_session: Option<(PathBuf, String)>,
    context_window: Option<usize>,
    model_summary: bool,
) -> Result<String, String> {
    let messages = load_conversation(path)?;
    config.summarization.config.use_model_summary = model_summary;

    let mut builder = AgentRuntime::builder(config.clone());
    if model_summary {
        builder = builder.with_completion(openrouter(&config.summarization.config.model)?);
    }
    let runtime = builder.build();

    let store = match &stored_session {
        Some((dir, _)) => Some(
            SessionStore::new(dir)
                .map_err(|e| format!("Failed to open sessions dir {}: {e}", dir.display()))?,
        ),
        None => None,
    };
    let mut state = match (&store, &stored_session) {
        (Some(store), Some((_, id))) => store
            .load(id)?
            .unwrap_or_else(|| SessionState::with_id(id.as_str())),
        _ => SessionState::new(),
    };
    if context_window.is_some() {
        state.set_context_window_override(context_window);
    }

    let backend = FilesystemBackend::new(history_dir).map_err(|e| e.to_string())?;
    let session = runtime.attach_session(state, Some(shared_factory(Arc::new(backend))));
    let prepared = {
        let mut state = session.lock().await;
        runtime.prepare_completion(&mut state, messages).await
    };
    match &prepared.summary {
        Some(report) => info!(
            "Summarized {} messages ({} tokens, {:?}); offloaded to {}",
            report.summarized_messages,
            report.summarized_tokens,
            report.strategy,
            report.offload_path.as_deref().unwrap_or("(nowhere)"),
        ),
        None => info!("Below threshold; conversation unchanged"),
    }

    if let Some(store) = &store {
        let state = session.lock().await;
        let saved = store.save(&state)?;
        info!("Session saved to {}", saved.display());
    }
    runtime.end_session(&session).await;
    to_json(&prepared.messages)
}

async fn delegate(
    config: RuntimeConfig,
    request: SubtaskRequest,
    workdir: &Path,
) -> Result<String, String> {
    let base = Arc::new(OpenRouterCompletion::from_env(
        config.summarization.config.model.clone(),
    )?);
    let for_model: CompletionFactory = {
        let base = Arc::clone(&base);
        Arc::new(move |model: &str| -> Arc<dyn Completion> {
            Arc::new(RetryingCompletion::new(
                base.for_model(model),
                RetryConfig::default(),
            ))
        })
    };
    let runtime = AgentRuntime::builder(config)
        .with_completion(Arc::new(RetryingCompletion::new(
            base.for_model(base.model()),
            RetryConfig::default(),
        )))
        .with_model_completion(for_model)
        .build();

    let backend: Arc<dyn Backend> =
        Arc::new(FilesystemBackend::new(workdir).map_err(|e| e.to_string())?);
    let session = runtime.start_session(Some(shared_factory(backend)));
    let response = runtime.run_subtask(&session, request).await;
    runtime.end_session(&session).await;
    to_json(&response)
}

// ── Helpers ────────────────────────────────────────────────────────

fn load_conversation(path: &Path) -> Result<Vec<Message>, String> {
    let json = std::fs::read_to_string(path)
        .map_err(|e| format!("failed to read conversation '{}': {e}", path.display()))?;
    serde_json::from_str(&json)
        .map_err(|e| format!("failed to parse conversation '{}': {e}", path.display()))
}

fn openrouter(model: &str) -> Result<Arc<dyn Completion>, String> {
    let model = if model.is_empty() { DEFAULT_MODEL } else { model };
    let completion = OpenRouterCompletion::from_env(model)?;
    Ok(Arc::new(RetryingCompletion::new(
        completion,
        RetryConfig::default(),
    )))
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, String> {
    serde_json::to_string_pretty(value).map_err(|e| format!("failed to encode output: {e}"))
}
