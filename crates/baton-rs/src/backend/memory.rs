//! In-process backend. Clones share the same file map, so a parent and its
//! delegated children see each other's writes.

use super::{
    Backend, BackendFactory, FileInfo, FileOpError, PATTERN_OPTIONS, SearchMatch, apply_edit,
    compile_pattern, normalize_path, relative_to, search_lines,
};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Clone, Default)]
pub struct MemoryBackend {
    files: Arc<Mutex<BTreeMap<String, String>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Factory handing every session this same store.
    pub fn factory(&self) -> BackendFactory {
        super::shared_factory(Arc::new(self.clone()))
    }

    /// Copy of all files, keyed by normalized path.
    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.files().clone()
    }

    fn files(&self) -> MutexGuard<'_, BTreeMap<String, String>> {
        self.files.lock().expect("memory backend lock poisoned")
    }

    fn is_dir(files: &BTreeMap<String, String>, path: &str) -> bool {
        path == "/" || files.keys().any(|k| relative_to(k, path).is_some())
    }
}

impl std::fmt::Debug for MemoryBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBackend")
            .field("files", &self.files().len())
            .finish()
    }
}

impl Backend for MemoryBackend {
    fn list(&self, path: &str) -> Result<Vec<FileInfo>, FileOpError> {
        let path = normalize_path(path)?;
        let files = self.files();
        if let Some(content) = files.get(&path) {
            return Ok(vec![FileInfo {
                path,
                is_dir: false,
                size: content.len() as u64,
            }]);
        }

        let mut entries: BTreeMap<String, FileInfo> = BTreeMap::new();
        for (key, content) in files.iter() {
            let Some(rel) = relative_to(key, &path) else {
                continue;
            };
            let base = if path == "/" { "" } else { path.as_str() };
            match rel.split_once('/') {
                Some((dir, _)) => {
                    let dir_path = format!("{base}/{dir}");
                    entries.entry(dir_path.clone()).or_insert(FileInfo {
                        path: dir_path,
                        is_dir: true,
                        size: 0,
                    });
                }
                None => {
                    entries.insert(
                        key.clone(),
                        FileInfo {
                            path: key.clone(),
                            is_dir: false,
                            size: content.len() as u64,
                        },
                    );
                }
            }
        }
        Ok(entries.into_values().collect())
    }

    fn read(&self, path: &str) -> Result<String, FileOpError> {
        let path = normalize_path(path)?;
        let files = self.files();
        match files.get(&path) {
            Some(content) => Ok(content.clone()),
            None if Self::is_dir(&files, &path) => Err(FileOpError::IsDirectory(path)),
            None => Err(FileOpError::NotFound(path)),
        }
    }

    fn write(&self, path: &str, content: &str) -> Result<(), FileOpError> {
        let path = normalize_path(path)?;
        let mut files = self.files();
        if Self::is_dir(&files, &path) {
            return Err(FileOpError::IsDirectory(path));
        }
        files.insert(path, content.to_string());
        Ok(())
    }

    fn edit(
        &self,
        path: &str,
        old: &str,
        new: &str,
        replace_all: bool,
    ) -> Result<usize, FileOpError> {
        let path = normalize_path(path)?;
        let mut files = self.files();
        let content = files
            .get(&path)
            .ok_or_else(|| FileOpError::NotFound(path.clone()))?;
        let (updated, count) = apply_edit(&path, content, old, new, replace_all)?;
        files.insert(path, updated);
        Ok(count)
    }

    fn search(&self, text: &str, path: &str) -> Result<Vec<SearchMatch>, FileOpError> {
        let path = normalize_path(path)?;
        let files = self.files();
        Ok(files
            .iter()
            .filter(|(key, _)| **key == path || relative_to(key, &path).is_some())
            .flat_map(|(key, content)| search_lines(key, content, text))
            .collect())
    }

    fn search_by_pattern(&self, pattern: &str, path: &str) -> Result<Vec<FileInfo>, FileOpError> {
        let path = normalize_path(path)?;
        let compiled = compile_pattern(pattern)?;
        let files = self.files();
        Ok(files
            .iter()
            .filter(|(key, _)| {
                relative_to(key, &path)
                    .is_some_and(|rel| compiled.matches_with(rel, PATTERN_OPTIONS))
            })
            .map(|(key, content)| FileInfo {
                path: key.clone(),
                is_dir: false,
                size: content.len() as u64,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::session::SessionState;

    fn seeded() -> MemoryBackend {
        let backend = MemoryBackend::new();
        backend.write("/notes.md", "alpha\nbeta").unwrap();
        backend.write("/docs/a.md", "TODO: one").unwrap();
        backend.write("/docs/deep/b.md", "nothing\nTODO: two").unwrap();
        backend.write("/docs/c.txt", "plain").unwrap();
        backend
    }

    #[test]
    fn write_then_read() {
        let backend = MemoryBackend::new();
        backend.write("reports/q1.md", "numbers").unwrap();
        assert_eq!(backend.read("/reports/q1.md").unwrap(), "numbers");
        backend.write("/reports/q1.md", "revised").unwrap();
        assert_eq!(backend.read("/reports/q1.md").unwrap(), "revised");
    }

    #[test]
    fn read_errors() {
        let backend = seeded();
        assert_eq!(
            backend.read("/missing.md"),
            Err(FileOpError::NotFound("/missing.md".into()))
        );
        assert_eq!(backend.read("/docs"), Err(FileOpError::IsDirectory("/docs".into())));
        assert!(matches!(backend.read("/../etc"), Err(FileOpError::InvalidPath(_))));
    }

    #[test]
    fn write_over_directory_fails() {
        let backend = seeded();
        assert!(matches!(backend.write("/docs", "x"), Err(FileOpError::IsDirectory(_))));
    }

    #[test]
    fn list_directory_entries() {
        let backend = seeded();
        let root: Vec<_> = backend.list("/").unwrap();
        assert_eq!(
            root.iter().map(|e| (e.path.as_str(), e.is_dir)).collect::<Vec<_>>(),
            vec![("/docs", true), ("/notes.md", false)]
        );

        let docs = backend.list("/docs").unwrap();
        assert_eq!(
            docs.iter().map(|e| e.path.as_str()).collect::<Vec<_>>(),
            vec!["/docs/a.md", "/docs/c.txt", "/docs/deep"]
        );

        let file = backend.list("/notes.md").unwrap();
        assert_eq!(file.len(), 1);
        assert_eq!(file[0].size, 10);

        assert!(backend.list("/nowhere").unwrap().is_empty());
    }

    #[test]
    fn edit_replaces() {
        let backend = seeded();
        assert_eq!(backend.edit("/notes.md", "beta", "gamma", false).unwrap(), 1);
        assert_eq!(backend.read("/notes.md").unwrap(), "alpha\ngamma");
        assert!(matches!(
            backend.edit("/nope.md", "a", "b", false),
            Err(FileOpError::NotFound(_))
        ));
    }

    #[test]
    fn search_finds_lines_below_path() {
        let backend = seeded();
        let hits = backend.search("TODO", "/docs").unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].path, "/docs/a.md");
        assert_eq!(hits[1].path, "/docs/deep/b.md");
        assert_eq!(hits[1].line, 2);

        assert!(backend.search("TODO", "/notes.md").unwrap().is_empty());
        assert_eq!(backend.search("alpha", "/notes.md").unwrap().len(), 1);
    }

    #[test]
    fn pattern_search() {
        let backend = seeded();
        let top: Vec<_> = backend
            .search_by_pattern("*.md", "/docs")
            .unwrap()
            .into_iter()
            .map(|f| f.path)
            .collect();
        assert_eq!(top, vec!["/docs/a.md"]);

        let deep: Vec<_> = backend
            .search_by_pattern("**/*.md", "/docs")
            .unwrap()
            .into_iter()
            .map(|f| f.path)
            .collect();
        assert!(deep.contains(&"/docs/deep/b.md".to_string()));
    }

    #[test]
    fn clones_share_files() {
        let backend = MemoryBackend::new();
        let factory = backend.factory();
        let other = factory(&SessionState::with_id("s1"));
        other.write("/shared.md", "from child").unwrap();
        assert_eq!(backend.read("/shared.md").unwrap(), "from child");
        assert_eq!(backend.snapshot().len(), 1);
    }
}
