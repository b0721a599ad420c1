//! Storage backends.
//!
//! A backend is a small virtual filesystem scoped to a session: the
//! summarization engine writes offloaded history to it and delegated
//! children share their parent's. Paths are always absolute and
//! `/`-separated (`/conversation_history/session_history.md`); every
//! implementation normalizes them with [`normalize_path`] and rejects `..`.
//!
//! - [`memory`] — [`MemoryBackend`], an in-process map that clones share.
//! - [`filesystem`] — [`FilesystemBackend`], rooted at a host directory.
//!
//! Backends are not stored in session state. The
//! [`BackendRegistry`](crate::agent::registry::BackendRegistry) maps session
//! ids to a [`BackendFactory`] that builds one on demand.

pub mod filesystem;
pub mod memory;

use crate::agent::session::SessionState;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

pub use filesystem::FilesystemBackend;
pub use memory::MemoryBackend;

/// Errors from backend file operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FileOpError {
    #[error("file not found: {0}")]
    NotFound(String),
    #[error("is a directory: {0}")]
    IsDirectory(String),
    #[error("invalid path: {0}")]
    InvalidPath(String),
    #[error("invalid pattern '{pattern}': {message}")]
    InvalidPattern { pattern: String, message: String },
    #[error("edit target must not be empty")]
    EmptyEdit,
    #[error("string not found in {0}")]
    NoMatch(String),
    #[error(
        "string occurs {count} times in {path}; pass replace_all or a more specific string"
    )]
    AmbiguousMatch { path: String, count: usize },
    #[error("I/O error on {path}: {message}")]
    Io { path: String, message: String },
}

/// One entry returned by [`Backend::list`] or [`Backend::search_by_pattern`].
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    pub path: String,
    pub is_dir: bool,
    /// Size in bytes; 0 for directories.
    pub size: u64,
}

/// One line matched by [`Backend::search`].
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SearchMatch {
    pub path: String,
    /// 1-based line number.
    pub line: usize,
    pub text: String,
}

/// File operations a session's storage must support.
pub trait Backend: Send + Sync {
    /// Entries directly under `path`. A file path lists just that file.
    fn list(&self, path: &str) -> Result<Vec<FileInfo>, FileOpError>;

    fn read(&self, path: &str) -> Result<String, FileOpError>;

    /// Create or replace the file at `path`, creating parents as needed.
    fn write(&self, path: &str, content: &str) -> Result<(), FileOpError>;

    /// Replace `old` with `new` in the file at `path`. Without `replace_all`
    /// the string must occur exactly once. Returns the replacement count.
    fn edit(&self, path: &str, old: &str, new: &str, replace_all: bool)
    -> Result<usize, FileOpError>;

    /// Lines containing `text` in files at or below `path`.
    fn search(&self, text: &str, path: &str) -> Result<Vec<SearchMatch>, FileOpError>;

    /// Files at or below `path` whose path relative to `path` matches the glob
    /// `pattern` (`*` does not cross `/`, `**` does).
    fn search_by_pattern(&self, pattern: &str, path: &str) -> Result<Vec<FileInfo>, FileOpError>;
}

/// Builds the backend for a session on demand.
pub type BackendFactory = Arc<dyn Fn(&SessionState) -> Arc<dyn Backend> + Send + Sync>;

/// Wrap a shared backend instance in a factory that always returns it.
pub fn shared_factory(backend: Arc<dyn Backend>) -> BackendFactory {
    Arc::new(move |_: &SessionState| Arc::clone(&backend))
}

/// Normalize a virtual path to `/a/b` form.
///
/// Empty input and `/` yield `/`. Backslashes are treated as separators,
/// `.` segments and repeated separators are dropped, and `..` is rejected.
pub fn normalize_path(path: &str) -> Result<String, FileOpError> {
    let unified = path.trim().replace('\\', "/");
    let mut segments = Vec::new();
    for segment in unified.split('/') {
        match segment {
            "" | "." => {}
            ".." => return Err(FileOpError::InvalidPath(path.to_string())),
            s => segments.push(s),
        }
    }
    Ok(format!("/{}", segments.join("/")))
}

/// Path of `path` relative to the directory `base`, or `None` when it is not
/// below `base`. Both must already be normalized.
pub(crate) fn relative_to<'a>(path: &'a str, base: &str) -> Option<&'a str> {
    if base == "/" {
        return path.strip_prefix('/');
    }
    path.strip_prefix(base)?.strip_prefix('/')
}

/// Apply an edit to file content. Shared by all backends.
pub(crate) fn apply_edit(
    path: &str,
    content: &str,
    old: &str,
    new: &str,
    replace_all: bool,
) -> Result<(String, usize), FileOpError> {
    if old.is_empty() {
        return Err(FileOpError::EmptyEdit);
    }
    let count = content.matches(old).count();
    match count {
        0 => Err(FileOpError::NoMatch(path.to_string())),
        1 => Ok((content.replacen(old, new, 1), 1)),
        n if replace_all => Ok((content.replace(old, new), n)),
        n => Err(FileOpError::AmbiguousMatch {
            path: path.to_string(),
            count: n,
        }),
    }
}

pub(crate) fn compile_pattern(pattern: &str) -> Result<glob::Pattern, FileOpError> {
    glob::Pattern::new(pattern).map_err(|e| FileOpError::InvalidPattern {
        pattern: pattern.to_string(),
        message: e.to_string(),
    })
}

pub(crate) const PATTERN_OPTIONS: glob::MatchOptions = glob::MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

/// Matching lines of `content`, 1-based.
pub(crate) fn search_lines(path: &str, content: &str, text: &str) -> Vec<SearchMatch> {
    content
        .lines()
        .enumerate()
        .filter(|(_, line)| line.contains(text))
        .map(|(i, line)| SearchMatch {
            path: path.to_string(),
            line: i + 1,
            text: line.to_string(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_basic_paths() {
        assert_eq!(normalize_path("").unwrap(), "/");
        assert_eq!(normalize_path("/").unwrap(), "/");
        assert_eq!(normalize_path("a/b").unwrap(), "/a/b");
        assert_eq!(normalize_path("//a/./b/").unwrap(), "/a/b");
        assert_eq!(normalize_path("\\a\\b").unwrap(), "/a/b");
    }

    #[test]
    fn normalize_rejects_parent_segments() {
        assert!(matches!(
            normalize_path("/a/../b"),
            Err(FileOpError::InvalidPath(_))
        ));
    }

    #[test]
    fn relative_paths() {
        assert_eq!(relative_to("/a/b.md", "/"), Some("a/b.md"));
        assert_eq!(relative_to("/a/b.md", "/a"), Some("b.md"));
        assert_eq!(relative_to("/ab/c.md", "/a"), None);
        assert_eq!(relative_to("/a", "/a"), None);
    }

    #[test]
    fn edit_single_and_all() {
        assert_eq!(apply_edit("/f", "a b a", "b", "c", false).unwrap(), ("a c a".into(), 1));
        assert_eq!(apply_edit("/f", "a b a", "a", "x", true).unwrap(), ("x b x".into(), 2));
    }

    #[test]
    fn edit_errors() {
        assert_eq!(apply_edit("/f", "abc", "", "x", false), Err(FileOpError::EmptyEdit));
        assert_eq!(
            apply_edit("/f", "abc", "z", "x", false),
            Err(FileOpError::NoMatch("/f".into()))
        );
        assert_eq!(
            apply_edit("/f", "a a", "a", "x", false),
            Err(FileOpError::AmbiguousMatch { path: "/f".into(), count: 2 })
        );
    }

    #[test]
    fn search_lines_are_one_based() {
        let hits = search_lines("/f", "alpha\nbeta\nalphabet", "alpha");
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].line, 1);
        assert_eq!(hits[1].line, 3);
        assert_eq!(hits[1].text, "alphabet");
    }

    #[test]
    fn bad_pattern_is_reported() {
        assert!(matches!(
            compile_pattern("[unclosed"),
            Err(FileOpError::InvalidPattern { .. })
        ));
    }
}
