//! Path-sandboxed file access for the workspace root.
//!
//! Every operation takes a path relative to the sandbox root and resolves it
//! with [`SandboxedFiles::resolve`] before any filesystem syscall. Resolution
//! is the sole containment boundary: parent-directory components, absolute
//! components and NUL bytes are rejected outright rather than normalized.

use std::path::{Component, Path, PathBuf};

use cubby_protocol::{FileKind, FileNode};
use tracing::warn;

use crate::error::{AgentError, AgentResult};

/// Directories skipped during recursive listings: build caches and
/// version-control metadata that would swamp the tree.
const NOISE_DIRS: &[&str] = &[
    ".git",
    "node_modules",
    "target",
    "__pycache__",
    ".cache",
    ".venv",
    "venv",
];

/// Sandboxed file service rooted at the workspace directory.
#[derive(Debug, Clone)]
pub struct SandboxedFiles {
    root: PathBuf,
}

impl SandboxedFiles {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a relative path against the sandbox root.
    ///
    /// The path is rebuilt component-by-component so resolution never depends
    /// on filesystem state. Leading slashes are stripped (clients sometimes
    /// send workspace-absolute paths); `..` anywhere is rejected even when it
    /// would stay inside the root.
    pub fn resolve(&self, relative: &str) -> AgentResult<PathBuf> {
        if relative.contains('\0') {
            return Err(AgentError::InvalidPath(relative.replace('\0', "")));
        }

        let relative = relative.trim_start_matches('/');
        if relative.is_empty() || relative == "." {
            return Ok(self.root.clone());
        }

        let mut resolved = self.root.clone();
        for component in Path::new(relative).components() {
            match component {
                Component::Normal(name) => resolved.push(name),
                Component::CurDir => continue,
                Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                    warn!(path = relative, "rejected path escaping sandbox root");
                    return Err(AgentError::InvalidPath(relative.to_string()));
                }
            }
        }

        if !resolved.starts_with(&self.root) {
            return Err(AgentError::InvalidPath(relative.to_string()));
        }

        Ok(resolved)
    }

    /// Recursively list files and directories under `dir`.
    ///
    /// Noise directories are skipped entirely. Unreadable subdirectories
    /// produce empty children instead of failing the whole listing. Sizes are
    /// best-effort and omitted when stat fails.
    pub async fn list(&self, dir: &str) -> AgentResult<Vec<FileNode>> {
        let full = self.resolve(dir)?;
        if !full.exists() {
            return Err(AgentError::NotFound(dir.to_string()));
        }
        if !full.is_dir() {
            return Err(AgentError::NotADirectory(dir.to_string()));
        }

        let root = self.root.clone();
        tokio::task::spawn_blocking(move || Ok(list_dir(&root, &full)))
            .await
            .map_err(|e| AgentError::Io(std::io::Error::other(e)))?
    }

    /// Read a file's full text content.
    pub async fn read(&self, path: &str) -> AgentResult<String> {
        let full = self.resolve(path)?;
        match tokio::fs::read_to_string(&full).await {
            Ok(content) => Ok(content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(AgentError::NotFound(path.to_string()))
            }
            Err(e) => Err(AgentError::Io(e)),
        }
    }

    /// Write `content` to a file, creating intermediate directories and
    /// replacing any existing file.
    pub async fn write(&self, path: &str, content: &str) -> AgentResult<()> {
        let full = self.resolve(path)?;
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&full, content).await?;
        Ok(())
    }
}

/// Build the nested listing for one directory level.
fn list_dir(root: &Path, dir: &Path) -> Vec<FileNode> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return Vec::new(),
    };

    let mut nodes = Vec::new();
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().to_string();
        let entry_path = entry.path();
        let is_dir = entry_path.is_dir();

        if is_dir && NOISE_DIRS.contains(&name.as_str()) {
            continue;
        }

        let relative = entry_path
            .strip_prefix(root)
            .map(|p| p.to_string_lossy().replace('\\', "/"))
            .unwrap_or_default();

        let size = if is_dir {
            None
        } else {
            entry.metadata().ok().map(|m| m.len())
        };

        nodes.push(FileNode {
            name,
            kind: if is_dir { FileKind::Folder } else { FileKind::File },
            path: relative,
            size,
            children: is_dir.then(|| list_dir(root, &entry_path)),
        });
    }

    // Directories first, then case-insensitive by name.
    nodes.sort_by(|a, b| match (a.kind, b.kind) {
        (FileKind::Folder, FileKind::File) => std::cmp::Ordering::Less,
        (FileKind::File, FileKind::Folder) => std::cmp::Ordering::Greater,
        _ => a.name.to_lowercase().cmp(&b.name.to_lowercase()),
    });

    nodes
}
