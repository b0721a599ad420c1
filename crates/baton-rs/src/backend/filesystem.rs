//! Backend rooted at a host directory. Virtual path `/a/b.md` maps to
//! `<root>/a/b.md`; nothing outside the root is reachable.

use super::{
    Backend, FileInfo, FileOpError, PATTERN_OPTIONS, SearchMatch, apply_edit, compile_pattern,
    normalize_path, search_lines,
};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::trace;

#[derive(Debug, Clone)]
pub struct FilesystemBackend {
    root: PathBuf,
}

impl FilesystemBackend {
    /// The root directory is created if missing.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, FileOpError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| io_error(&root.display().to_string(), &e))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Normalized virtual path plus the host path it maps to.
    fn resolve(&self, path: &str) -> Result<(String, PathBuf), FileOpError> {
        let virtual_path = normalize_path(path)?;
        let host = virtual_path
            .split('/')
            .filter(|s| !s.is_empty())
            .fold(self.root.clone(), |acc, segment| acc.join(segment));
        Ok((virtual_path, host))
    }

    fn virtual_path(&self, host: &Path) -> Option<String> {
        let rel = host.strip_prefix(&self.root).ok()?;
        let segments: Vec<String> = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        Some(format!("/{}", segments.join("/")))
    }

    fn info(&self, host: &Path) -> Option<FileInfo> {
        let meta = fs::metadata(host).ok()?;
        Some(FileInfo {
            path: self.virtual_path(host)?,
            is_dir: meta.is_dir(),
            size: if meta.is_dir() { 0 } else { meta.len() },
        })
    }

    /// All regular files at or below `host`, sorted.
    fn walk_files(&self, host: &Path) -> Vec<PathBuf> {
        let mut out = Vec::new();
        if host.is_file() {
            out.push(host.to_path_buf());
            return out;
        }
        let mut stack = vec![host.to_path_buf()];
        while let Some(dir) = stack.pop() {
            let Ok(entries) = fs::read_dir(&dir) else {
                trace!("Skipping unreadable directory {}", dir.display());
                continue;
            };
            for entry in entries.flatten() {
                let path = entry.path();
                match entry.file_type() {
                    Ok(t) if t.is_dir() => stack.push(path),
                    Ok(t) if t.is_file() => out.push(path),
                    _ => {}
                }
            }
        }
        out.sort();
        out
    }
}

fn io_error(path: &str, e: &io::Error) -> FileOpError {
    match e.kind() {
        io::ErrorKind::NotFound => FileOpError::NotFound(path.to_string()),
        _ => FileOpError::Io {
            path: path.to_string(),
            message: e.to_string(),
        },
    }
}

impl Backend for FilesystemBackend {
    fn list(&self, path: &str) -> Result<Vec<FileInfo>, FileOpError> {
        let (_, host) = self.resolve(path)?;
        if host.is_file() {
            return Ok(self.info(&host).into_iter().collect());
        }
        let Ok(entries) = fs::read_dir(&host) else {
            return Ok(Vec::new());
        };
        let mut infos: Vec<FileInfo> = entries
            .flatten()
            .filter_map(|entry| self.info(&entry.path()))
            .collect();
        infos.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(infos)
    }

    fn read(&self, path: &str) -> Result<String, FileOpError> {
        let (virtual_path, host) = self.resolve(path)?;
        if host.is_dir() {
            return Err(FileOpError::IsDirectory(virtual_path));
        }
        fs::read_to_string(&host).map_err(|e| io_error(&virtual_path, &e))
    }

    fn write(&self, path: &str, content: &str) -> Result<(), FileOpError> {
        let (virtual_path, host) = self.resolve(path)?;
        if virtual_path == "/" || host.is_dir() {
            return Err(FileOpError::IsDirectory(virtual_path));
        }
        if let Some(parent) = host.parent() {
            fs::create_dir_all(parent).map_err(|e| io_error(&virtual_path, &e))?;
        }
        fs::write(&host, content).map_err(|e| io_error(&virtual_path, &e))
    }

    fn edit(
        &self,
        path: &str,
        old: &str,
        new: &str,
        replace_all: bool,
    ) -> Result<usize, FileOpError> {
        let content = self.read(path)?;
        let (virtual_path, host) = self.resolve(path)?;
        let (updated, count) = apply_edit(&virtual_path, &content, old, new, replace_all)?;
        fs::write(&host, updated).map_err(|e| io_error(&virtual_path, &e))?;
        Ok(count)
    }

    fn search(&self, text: &str, path: &str) -> Result<Vec<SearchMatch>, FileOpError> {
        let (_, host) = self.resolve(path)?;
        let mut matches = Vec::new();
        for file in self.walk_files(&host) {
            // Binary or unreadable files are skipped.
            let Ok(content) = fs::read_to_string(&file) else {
                continue;
            };
            if let Some(vpath) = self.virtual_path(&file) {
                matches.extend(search_lines(&vpath, &content, text));
            }
        }
        Ok(matches)
    }

    fn search_by_pattern(&self, pattern: &str, path: &str) -> Result<Vec<FileInfo>, FileOpError> {
        let (_, host) = self.resolve(path)?;
        let compiled = compile_pattern(pattern)?;
        Ok(self
            .walk_files(&host)
            .into_iter()
            .filter(|file| {
                file.strip_prefix(&host).is_ok_and(|rel| {
                    let rel = rel
                        .components()
                        .map(|c| c.as_os_str().to_string_lossy().into_owned())
                        .collect::<Vec<_>>()
                        .join("/");
                    compiled.matches_with(&rel, PATTERN_OPTIONS)
                })
            })
            .filter_map(|file| self.info(&file))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded() -> (tempfile::TempDir, FilesystemBackend) {
        let dir = tempfile::tempdir().unwrap();
        let backend = FilesystemBackend::new(dir.path()).unwrap();
        backend.write("/notes.md", "alpha\nbeta").unwrap();
        backend.write("/docs/a.md", "TODO: one").unwrap();
        backend.write("/docs/deep/b.md", "nothing\nTODO: two").unwrap();
        (dir, backend)
    }

    #[test]
    fn write_creates_parents() {
        let (dir, backend) = seeded();
        assert!(dir.path().join("docs/deep/b.md").is_file());
        assert_eq!(backend.read("docs/deep/b.md").unwrap(), "nothing\nTODO: two");
    }

    #[test]
    fn read_errors() {
        let (_dir, backend) = seeded();
        assert_eq!(
            backend.read("/missing.md"),
            Err(FileOpError::NotFound("/missing.md".into()))
        );
        assert_eq!(backend.read("/docs"), Err(FileOpError::IsDirectory("/docs".into())));
        assert!(matches!(
            backend.read("/../outside"),
            Err(FileOpError::InvalidPath(_))
        ));
    }

    #[test]
    fn list_entries() {
        let (_dir, backend) = seeded();
        let root = backend.list("/").unwrap();
        assert_eq!(
            root.iter().map(|e| (e.path.as_str(), e.is_dir)).collect::<Vec<_>>(),
            vec![("/docs", true), ("/notes.md", false)]
        );
        assert!(backend.list("/nowhere").unwrap().is_empty());
    }

    #[test]
    fn edit_and_search() {
        let (_dir, backend) = seeded();
        assert_eq!(backend.edit("/notes.md", "beta", "TODO: three", false).unwrap(), 1);
        let hits = backend.search("TODO", "/").unwrap();
        let paths: Vec<_> = hits.iter().map(|h| h.path.as_str()).collect();
        assert_eq!(paths, vec!["/docs/a.md", "/docs/deep/b.md", "/notes.md"]);
    }

    #[test]
    fn pattern_search_is_relative() {
        let (_dir, backend) = seeded();
        let top: Vec<_> = backend
            .search_by_pattern("*.md", "/docs")
            .unwrap()
            .into_iter()
            .map(|f| f.path)
            .collect();
        assert_eq!(top, vec!["/docs/a.md"]);
    }
}
