use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

use serde::Serialize;
use walkdir::WalkDir;

use crate::errors::ToolError;

/// Path-sandboxed view of one build's working directory.
///
/// Every tool operation takes a relative path and resolves it here. The
/// invariant: after normalization and symlink resolution, the result is a
/// descendant of the root or the operation fails with a `ScopeError`.
#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
}

/// File counts by language plus total size, for audit snapshots and the UI.
#[derive(Debug, Clone, Default, Serialize)]
pub struct WorkspaceSummary {
    pub files_by_language: BTreeMap<String, u64>,
    pub total_files: u64,
    pub total_bytes: u64,
}

impl Workspace {
    /// Wrap an existing directory. The root is canonicalized up front so
    /// later containment checks compare like with like.
    pub fn new(root: &Path) -> std::io::Result<Self> {
        let root = root.canonicalize()?;
        Ok(Self { root })
    }

    /// Create the directory if needed, then wrap it.
    pub fn create(root: &Path) -> std::io::Result<Self> {
        std::fs::create_dir_all(root)?;
        Self::new(root)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a relative path to an absolute one inside the root.
    ///
    /// Rejects absolute inputs, any `..` traversal above the root, and
    /// symlinks whose target lies outside the root. The returned path may not
    /// exist yet (write_file creates parents).
    pub fn resolve(&self, relpath: &str) -> Result<PathBuf, ToolError> {
        let scope_err = || ToolError::Scope {
            path: relpath.to_string(),
        };

        let candidate = Path::new(relpath);
        if candidate.is_absolute() {
            return Err(scope_err());
        }

        // Lexical normalization: '..' pops, '.' is dropped, anything that
        // would climb above the root is an escape.
        let mut normalized = PathBuf::new();
        for component in candidate.components() {
            match component {
                Component::Normal(part) => normalized.push(part),
                Component::CurDir => {}
                Component::ParentDir => {
                    if !normalized.pop() {
                        return Err(scope_err());
                    }
                }
                Component::RootDir | Component::Prefix(_) => return Err(scope_err()),
            }
        }

        let joined = self.root.join(&normalized);

        // Symlink check: canonicalize the deepest existing ancestor and make
        // sure it still lives under the root, then re-append the rest.
        let mut existing = joined.clone();
        let mut remainder: Vec<std::ffi::OsString> = Vec::new();
        while !existing.exists() {
            match (existing.file_name(), existing.parent()) {
                (Some(name), Some(parent)) => {
                    remainder.push(name.to_os_string());
                    existing = parent.to_path_buf();
                }
                _ => return Err(scope_err()),
            }
        }
        let canonical = existing.canonicalize().map_err(|_| scope_err())?;
        if !canonical.starts_with(&self.root) {
            return Err(scope_err());
        }

        let mut resolved = canonical;
        for part in remainder.iter().rev() {
            resolved.push(part);
        }
        Ok(resolved)
    }

    /// Render the directory tree to `depth` levels, one entry per line,
    /// directories suffixed with `/`. Hidden entries and `.git` are skipped.
    pub fn tree(&self, depth: usize) -> String {
        let mut lines = Vec::new();
        for entry in WalkDir::new(&self.root)
            .min_depth(1)
            .max_depth(depth)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| e.depth() == 0 || !is_hidden(e.file_name()))
            .filter_map(|e| e.ok())
        {
            let rel = entry
                .path()
                .strip_prefix(&self.root)
                .unwrap_or(entry.path());
            let indent = "  ".repeat(entry.depth().saturating_sub(1));
            let name = rel
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            if entry.file_type().is_dir() {
                lines.push(format!("{}{}/", indent, name));
            } else {
                lines.push(format!("{}{}", indent, name));
            }
        }
        lines.join("\n")
    }

    /// File counts by language (extension-mapped) and total bytes.
    pub fn summary(&self) -> WorkspaceSummary {
        let mut summary = WorkspaceSummary::default();
        for entry in WalkDir::new(&self.root)
            .min_depth(1)
            .into_iter()
            .filter_entry(|e| e.depth() == 0 || !is_hidden(e.file_name()))
            .filter_map(|e| e.ok())
        {
            if !entry.file_type().is_file() {
                continue;
            }
            summary.total_files += 1;
            if let Ok(meta) = entry.metadata() {
                summary.total_bytes += meta.len();
            }
            let lang = entry
                .path()
                .extension()
                .and_then(|e| e.to_str())
                .map(language_for_extension)
                .unwrap_or("other");
            *summary.files_by_language.entry(lang.to_string()).or_insert(0) += 1;
        }
        summary
    }
}

fn is_hidden(name: &std::ffi::OsStr) -> bool {
    name.to_str().map(|s| s.starts_with('.')).unwrap_or(false)
}

fn language_for_extension(ext: &str) -> &'static str {
    match ext {
        "py" => "python",
        "rs" => "rust",
        "js" | "jsx" => "javascript",
        "ts" | "tsx" => "typescript",
        "go" => "go",
        "java" => "java",
        "rb" => "ruby",
        "c" | "h" => "c",
        "cpp" | "cc" | "hpp" => "cpp",
        "html" => "html",
        "css" => "css",
        "json" => "json",
        "yaml" | "yml" => "yaml",
        "toml" => "toml",
        "md" => "markdown",
        "sh" => "shell",
        "sql" => "sql",
        _ => "other",
    }
}
