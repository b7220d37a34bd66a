//! Filesystem tools: read, list, search, write — all paths resolved through
//! the workspace sandbox.

use regex::Regex;
use serde_json::json;
use walkdir::WalkDir;

use super::{ToolOutcome, ToolSideEffect};
use crate::workspace::Workspace;

/// read_file content cap.
const READ_CAP_BYTES: usize = 50 * 1024;
/// search_code match cap.
const MAX_SEARCH_MATCHES: usize = 50;
/// Files larger than this are skipped by search_code.
const MAX_SEARCH_FILE_BYTES: u64 = 1024 * 1024;

pub async fn read_file(workspace: &Workspace, path: &str) -> ToolOutcome {
    let resolved = match workspace.resolve(path) {
        Ok(p) => p,
        Err(e) => return e.into(),
    };
    let bytes = match tokio::fs::read(&resolved).await {
        Ok(b) => b,
        Err(e) => return ToolOutcome::error(format!("Failed to read '{}': {}", path, e)),
    };
    let size = bytes.len() as u64;
    let content = String::from_utf8_lossy(&bytes);
    let line_count = content.lines().count();
    let (content, truncated) = if content.len() > READ_CAP_BYTES {
        let mut cut = READ_CAP_BYTES;
        while cut > 0 && !content.is_char_boundary(cut) {
            cut -= 1;
        }
        (format!("{}\n[...truncated at 50 KB...]", &content[..cut]), true)
    } else {
        (content.into_owned(), false)
    };
    ToolOutcome::success(json!({
        "path": path,
        "content": content,
        "line_count": line_count,
        "bytes": size,
        "truncated": truncated,
    }))
}

pub async fn list_directory(workspace: &Workspace, path: &str) -> ToolOutcome {
    let resolved = match workspace.resolve(path) {
        Ok(p) => p,
        Err(e) => return e.into(),
    };
    let mut read_dir = match tokio::fs::read_dir(&resolved).await {
        Ok(rd) => rd,
        Err(e) => return ToolOutcome::error(format!("Failed to list '{}': {}", path, e)),
    };
    let mut entries = Vec::new();
    while let Ok(Some(entry)) = read_dir.next_entry().await {
        let name = entry.file_name().to_string_lossy().to_string();
        let is_dir = entry
            .file_type()
            .await
            .map(|t| t.is_dir())
            .unwrap_or(false);
        entries.push(if is_dir { format!("{}/", name) } else { name });
    }
    entries.sort();
    ToolOutcome::success(json!({ "path": path, "entries": entries }))
}

pub async fn search_code(
    workspace: &Workspace,
    pattern: &str,
    scope: Option<&str>,
) -> ToolOutcome {
    // Regex first; a pattern that fails to compile is treated as a literal.
    let regex = match Regex::new(pattern) {
        Ok(r) => r,
        Err(_) => match Regex::new(&regex::escape(pattern)) {
            Ok(r) => r,
            Err(e) => return ToolOutcome::error(format!("Invalid pattern: {}", e)),
        },
    };

    let root = match scope {
        Some(s) => match workspace.resolve(s) {
            Ok(p) => p,
            Err(e) => return e.into(),
        },
        None => workspace.root().to_path_buf(),
    };

    let ws_root = workspace.root().to_path_buf();
    let result = tokio::task::spawn_blocking(move || {
        let mut matches = Vec::new();
        'files: for entry in WalkDir::new(&root)
            .into_iter()
            .filter_entry(|e| {
                e.depth() == 0
                    || !e
                        .file_name()
                        .to_str()
                        .map(|s| s.starts_with('.'))
                        .unwrap_or(false)
            })
            .filter_map(|e| e.ok())
        {
            if !entry.file_type().is_file() {
                continue;
            }
            if entry.metadata().map(|m| m.len()).unwrap_or(0) > MAX_SEARCH_FILE_BYTES {
                continue;
            }
            let Ok(content) = std::fs::read_to_string(entry.path()) else {
                continue; // binary or unreadable
            };
            let rel = entry
                .path()
                .strip_prefix(&ws_root)
                .unwrap_or(entry.path())
                .to_string_lossy()
                .to_string();
            for (idx, line) in content.lines().enumerate() {
                if regex.is_match(line) {
                    matches.push(json!({
                        "path": rel,
                        "line": idx + 1,
                        "snippet": line.trim_end().chars().take(200).collect::<String>(),
                    }));
                    if matches.len() >= MAX_SEARCH_MATCHES {
                        break 'files;
                    }
                }
            }
        }
        matches
    })
    .await;

    match result {
        Ok(matches) => {
            let capped = matches.len() >= MAX_SEARCH_MATCHES;
            ToolOutcome::success(json!({
                "pattern": pattern,
                "matches": matches,
                "capped": capped,
            }))
        }
        Err(e) => ToolOutcome::error(format!("Search task failed: {}", e)),
    }
}

pub async fn write_file(workspace: &Workspace, path: &str, content: &str) -> ToolOutcome {
    let resolved = match workspace.resolve(path) {
        Ok(p) => p,
        Err(e) => return e.into(),
    };
    let existed = resolved.exists();
    if let Some(parent) = resolved.parent() {
        if let Err(e) = tokio::fs::create_dir_all(parent).await {
            return ToolOutcome::error(format!("Failed to create parents for '{}': {}", path, e));
        }
    }
    if let Err(e) = tokio::fs::write(&resolved, content).await {
        return ToolOutcome::error(format!("Failed to write '{}': {}", path, e));
    }
    let bytes = content.len() as u64;
    ToolOutcome::success_with(
        json!({ "path": path, "bytes_written": bytes }),
        ToolSideEffect::FileWritten {
            path: path.to_string(),
            bytes,
            created: !existed,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn ws() -> (Workspace, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        (Workspace::new(dir.path()).unwrap(), dir)
    }

    #[tokio::test]
    async fn read_file_returns_content_and_counts() {
        let (ws, dir) = ws();
        fs::write(dir.path().join("a.txt"), "one\ntwo\nthree").unwrap();
        let out = read_file(&ws, "a.txt").await;
        assert!(out.ok);
        assert_eq!(out.data["line_count"], 3);
        assert_eq!(out.data["bytes"], 13);
        assert_eq!(out.data["truncated"], false);
        assert!(out.data["content"].as_str().unwrap().contains("two"));
    }

    #[tokio::test]
    async fn read_file_truncates_large_content() {
        let (ws, dir) = ws();
        let big = "x".repeat(200 * 1024);
        fs::write(dir.path().join("big.txt"), &big).unwrap();
        let out = read_file(&ws, "big.txt").await;
        assert!(out.ok);
        assert_eq!(out.data["truncated"], true);
        let content = out.data["content"].as_str().unwrap();
        assert!(content.len() < big.len());
        assert!(content.ends_with("[...truncated at 50 KB...]"));
    }

    #[tokio::test]
    async fn read_file_missing_is_error_outcome() {
        let (ws, _dir) = ws();
        let out = read_file(&ws, "nope.txt").await;
        assert!(!out.ok);
        assert!(out.render().contains("nope.txt"));
    }

    #[tokio::test]
    async fn list_directory_suffixes_dirs() {
        let (ws, dir) = ws();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("file.txt"), "x").unwrap();
        let out = list_directory(&ws, ".").await;
        assert!(out.ok);
        let entries: Vec<String> = out.data["entries"]
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_str().unwrap().to_string())
            .collect();
        assert!(entries.contains(&"sub/".to_string()));
        assert!(entries.contains(&"file.txt".to_string()));
    }

    #[tokio::test]
    async fn search_code_finds_matches_with_lines() {
        let (ws, dir) = ws();
        fs::write(dir.path().join("a.py"), "import os\ndef main():\n    pass\n").unwrap();
        fs::write(dir.path().join("b.py"), "def helper():\n    return 1\n").unwrap();
        let out = search_code(&ws, r"def \w+", None).await;
        assert!(out.ok);
        let matches = out.data["matches"].as_array().unwrap();
        assert_eq!(matches.len(), 2);
        assert_eq!(matches[0]["line"], 2);
    }

    #[tokio::test]
    async fn search_code_treats_bad_regex_as_literal() {
        let (ws, dir) = ws();
        fs::write(dir.path().join("a.txt"), "weird (unclosed\n").unwrap();
        let out = search_code(&ws, "(unclosed", None).await;
        assert!(out.ok);
        assert_eq!(out.data["matches"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn search_code_caps_at_fifty() {
        let (ws, dir) = ws();
        let many = "match\n".repeat(80);
        fs::write(dir.path().join("many.txt"), many).unwrap();
        let out = search_code(&ws, "match", None).await;
        assert_eq!(out.data["matches"].as_array().unwrap().len(), 50);
        assert_eq!(out.data["capped"], true);
    }

    #[tokio::test]
    async fn search_code_scoped_to_subdir() {
        let (ws, dir) = ws();
        fs::create_dir(dir.path().join("src")).unwrap();
        fs::write(dir.path().join("src/in.py"), "target\n").unwrap();
        fs::write(dir.path().join("out.py"), "target\n").unwrap();
        let out = search_code(&ws, "target", Some("src")).await;
        let matches = out.data["matches"].as_array().unwrap();
        assert_eq!(matches.len(), 1);
        assert!(matches[0]["path"].as_str().unwrap().contains("in.py"));
    }

    #[tokio::test]
    async fn write_file_creates_parents_and_reports_side_effect() {
        let (ws, dir) = ws();
        let out = write_file(&ws, "nested/deep/f.txt", "hello").await;
        assert!(out.ok);
        assert_eq!(out.data["bytes_written"], 5);
        assert_eq!(
            out.side_effect,
            Some(ToolSideEffect::FileWritten {
                path: "nested/deep/f.txt".into(),
                bytes: 5,
                created: true,
            })
        );
        assert_eq!(
            fs::read_to_string(dir.path().join("nested/deep/f.txt")).unwrap(),
            "hello"
        );
    }

    #[tokio::test]
    async fn write_file_overwrites_as_modified() {
        let (ws, dir) = ws();
        fs::write(dir.path().join("f.txt"), "old").unwrap();
        let out = write_file(&ws, "f.txt", "new").await;
        match out.side_effect {
            Some(ToolSideEffect::FileWritten { created, .. }) => assert!(!created),
            other => panic!("unexpected side effect: {:?}", other),
        }
        assert_eq!(fs::read_to_string(dir.path().join("f.txt")).unwrap(), "new");
    }

    #[tokio::test]
    async fn write_file_escape_rejected_and_nothing_written() {
        let (ws, _dir) = ws();
        let out = write_file(&ws, "../../etc/passwd", "pwned").await;
        assert!(!out.ok);
        assert!(out.render().contains("ScopeError"));
        assert!(out.side_effect.is_none());
    }
}
