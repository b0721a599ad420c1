//! Tool abstraction for LLM function-calling agents.
//!
//! The [`Tool`] trait defines the interface that every tool must implement:
//! a static API definition (name, description, JSON schema) and an async
//! `execute` method returning the result text the model will see.

use crate::ToolDef;
use std::future::Future;
use std::pin::Pin;
use tracing::{debug, info, trace};

/// Boxed future returned by [`Tool::execute`].
pub type ToolFuture<'a> = Pin<Box<dyn Future<Output = String> + Send + 'a>>;

/// A tool that an LLM agent can invoke via function-calling.
///
/// # Example
///
/// ```ignore
/// struct Echo;
///
/// impl Tool for Echo {
///     fn definition(&self) -> ToolDef {
///         ToolDef::new("echo", "Echo the input.", json_schema_for::<EchoArgs>())
///     }
///
///     fn execute(&self, arguments: &str) -> ToolFuture<'_> {
///         let arguments = arguments.to_string();
///         Box::pin(async move { arguments })
///     }
/// }
/// ```
pub trait Tool: Send + Sync {
    /// The tool definition sent to the LLM API.
    fn definition(&self) -> ToolDef;

    /// Execute the tool with the given raw JSON arguments string.
    ///
    /// Errors are returned as result text rather than panicking; the host
    /// passes the string back to the model either way.
    fn execute(&self, arguments: &str) -> ToolFuture<'_>;

    /// The tool's name (delegates to definition).
    fn name(&self) -> String {
        self.definition().function.name.clone()
    }
}

/// Validate tool arguments against the tool's declared JSON Schema.
///
/// Returns `None` if valid, or `Some(error_string)` if validation fails.
/// The error string is formatted for the LLM to understand and self-correct.
pub fn validate_tool_arguments(tool: &dyn Tool, arguments: &str) -> Option<String> {
    let args_value: serde_json::Value = match serde_json::from_str(arguments) {
        Ok(v) => v,
        Err(e) => {
            return Some(format!(
                "Error: invalid JSON arguments for tool '{}': {e}. \
                 Please provide valid JSON matching the tool's parameter schema.",
                tool.name()
            ));
        }
    };

    let schema = tool.definition().function.parameters;
    let Ok(validator) = jsonschema::validator_for(&schema) else {
        // Unvalidatable schema; let the typed parse catch problems.
        return None;
    };

    let errors: Vec<String> = validator
        .iter_errors(&args_value)
        .map(|e| format!("  - {}: {e}", e.instance_path()))
        .collect();

    if errors.is_empty() {
        None
    } else {
        Some(format!(
            "Error: argument validation failed for tool '{}':\n{}\n\
             Please fix the arguments and try again.",
            tool.name(),
            errors.join("\n")
        ))
    }
}

/// Parse raw JSON arguments into a typed struct.
///
/// Returns a formatted error string suitable for returning directly from
/// [`Tool::execute`].
pub fn parse_tool_args<T: serde::de::DeserializeOwned>(arguments: &str) -> Result<T, String> {
    serde_json::from_str(arguments).map_err(|e| {
        format!(
            "Error: invalid tool arguments: {e}. \
             Please provide valid JSON matching the tool's parameter schema."
        )
    })
}

/// Log a tool call at INFO level with a truncated preview of arguments.
pub fn log_tool_call(name: &str, arguments: &str) {
    let args_preview: String = arguments.chars().take(120).collect();
    info!(
        "[tool] {}({args_preview}{})",
        name,
        if arguments.chars().count() > 120 { "..." } else { "" }
    );
    debug!("[tool] {name} full args ({} bytes)", arguments.len());
    trace!("[tool] {name} arguments: {arguments}");
}

/// Truncate text to at most `max` characters, appending a notice if trimmed.
pub fn truncate_result(s: String, max: usize) -> String {
    let total = s.chars().count();
    if total > max {
        let head: String = s.chars().take(max).collect();
        format!("{head}...\n[truncated: {total} chars total]")
    } else {
        s
    }
}
