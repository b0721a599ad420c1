//! Runtime configuration.
//!
//! Every optional stage is wrapped in a [`Toggle`] so hosts can switch it off
//! without losing its settings. All structs deserialize with
//! `#[serde(default)]`, so a config file only needs the keys it changes:
//!
//! ```json
//! {
//!   "summarization": { "config": { "keep_messages": 10 } },
//!   "truncate_args": { "enabled": true },
//!   "delegation": { "max_parallel": 2, "timeout_seconds": 60 }
//! }
//! ```

use crate::agent::session::keys;
use crate::context::summarizer::SummarizationConfig;
use crate::context::truncation::TruncateArgsConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;

// ── Toggle ─────────────────────────────────────────────────────────

/// An optional stage: an `enabled` flag plus the stage's configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Toggle<T: Default> {
    /// Whether this stage is active.
    pub enabled: bool,
    /// Stage-specific configuration.
    pub config: T,
}

impl<T: Default> Toggle<T> {
    /// An enabled stage with the given configuration.
    pub fn enabled(config: T) -> Self {
        Self {
            enabled: true,
            config,
        }
    }

    /// Create a disabled instance with default inner config.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            config: T::default(),
        }
    }

    /// The configuration, if the stage is enabled.
    pub fn active(&self) -> Option<&T> {
        self.enabled.then_some(&self.config)
    }
}

impl<T: Default> Default for Toggle<T> {
    fn default() -> Self {
        Self {
            enabled: true,
            config: T::default(),
        }
    }
}

// ── Delegation ─────────────────────────────────────────────────────

/// Limits applied to the `run_subtask` operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DelegationConfig {
    /// Deepest allowed child; a top-level session is depth 0.
    pub max_depth: u32,
    /// Tasks one parent may have running at once.
    pub max_parallel: usize,
    /// Wall-clock limit for one child turn.
    pub timeout_seconds: u64,
    /// Honor `model_override` on requests.
    pub allow_model_override: bool,
    /// State keys copied from child to parent after every turn.
    pub copy_back_keys: Vec<String>,
    /// Longest `result` text returned to the parent.
    pub max_result_chars: usize,
}

impl Default for DelegationConfig {
    fn default() -> Self {
        Self {
            max_depth: 2,
            max_parallel: 4,
            timeout_seconds: 120,
            allow_model_override: false,
            copy_back_keys: vec![keys::FILES.into(), keys::TODOS.into()],
            max_result_chars: 8000,
        }
    }
}

impl DelegationConfig {
    pub fn with_max_depth(mut self, depth: u32) -> Self {
        self.max_depth = depth;
        self
    }

    pub fn with_max_parallel(mut self, parallel: usize) -> Self {
        self.max_parallel = parallel;
        self
    }

    pub fn with_timeout_seconds(mut self, seconds: u64) -> Self {
        self.timeout_seconds = seconds;
        self
    }

    pub fn with_model_override(mut self, allowed: bool) -> Self {
        self.allow_model_override = allowed;
        self
    }

    pub fn with_copy_back_keys(mut self, keys: Vec<String>) -> Self {
        self.copy_back_keys = keys;
        self
    }
}

// ── RuntimeConfig ──────────────────────────────────────────────────

/// Top-level configuration for an [`AgentRuntime`](crate::agent::runtime::AgentRuntime).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Summarization engine. Enabled by default.
    pub summarization: Toggle<SummarizationConfig>,
    /// Write-tool argument truncation. Disabled by default.
    pub truncate_args: Toggle<TruncateArgsConfig>,
    pub delegation: DelegationConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            summarization: Toggle::default(),
            truncate_args: Toggle::disabled(),
            delegation: DelegationConfig::default(),
        }
    }
}

impl RuntimeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_summarization(mut self, config: SummarizationConfig) -> Self {
        self.summarization = Toggle::enabled(config);
        self
    }

    pub fn without_summarization(mut self) -> Self {
        self.summarization.enabled = false;
        self
    }

    pub fn with_truncate_args(mut self, config: TruncateArgsConfig) -> Self {
        self.truncate_args = Toggle::enabled(config);
        self
    }

    pub fn with_delegation(mut self, config: DelegationConfig) -> Self {
        self.delegation = config;
        self
    }

    /// Parse a JSON config. Missing keys take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self, String> {
        serde_json::from_str(json).map_err(|e| format!("Invalid runtime config: {e}"))
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, String> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read config {}: {e}", path.display()))?;
        Self::from_json_str(&json)
    }
}
