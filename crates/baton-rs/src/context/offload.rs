//! Offloading summarized history to the session backend.
//!
//! Every summarization appends a timestamped section holding the full,
//! untrimmed transcript of the replaced span to one ever-growing log at
//! `{prefix}/session_history.md`. If that log cannot be written, the section
//! goes to a numbered chunk file beside it instead. Earlier sections are
//! never rewritten.

use crate::Message;
use crate::backend::{Backend, FileOpError};
use crate::context::transcript::{Rendering, render_transcript};
use tracing::warn;

pub const HISTORY_FILE_NAME: &str = "session_history.md";

/// Path of the history log under `prefix`.
pub fn history_path(prefix: &str) -> String {
    format!("{}/{HISTORY_FILE_NAME}", prefix.trim_end_matches('/'))
}

/// Path of the fallback chunk file for the `index`-th summarization.
pub fn chunk_path(prefix: &str, index: u64) -> String {
    format!("{}/chunk_{index:04}.txt", prefix.trim_end_matches('/'))
}

/// One log section for `messages`.
pub fn history_section(messages: &[Message]) -> String {
    format!(
        "## Summarized at {}\n\n{}\n\n",
        chrono::Utc::now().to_rfc3339(),
        render_transcript(messages, Rendering::Full)
    )
}

/// Append `messages` to the history log, falling back to a chunk file.
/// Returns the path written.
pub fn offload_history(
    backend: &dyn Backend,
    messages: &[Message],
    prefix: &str,
    chunk_index: u64,
) -> Result<String, FileOpError> {
    let section = history_section(messages);
    let path = history_path(prefix);

    let appended = match backend.read(&path) {
        Ok(existing) => backend.write(&path, &format!("{existing}{section}")),
        Err(FileOpError::NotFound(_)) => backend.write(&path, &section),
        Err(e) => Err(e),
    };
    match appended {
        Ok(()) => Ok(path),
        Err(e) => {
            let fallback = chunk_path(prefix, chunk_index);
            warn!("Failed to append history to {path} ({e}); writing {fallback}");
            backend.write(&fallback, &section)?;
            Ok(fallback)
        }
    }
}
