//! Subprocess tools: run_tests, run_command, check_syntax.
//!
//! Security contract: only allow-listed command prefixes run, shell
//! metacharacters are rejected outright, subprocesses inherit PATH only,
//! the working directory is pinned to the workspace root, and timeouts end
//! in a hard kill.

use std::process::Stdio;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use serde_json::json;
use tokio::process::Command;

use super::{ToolOutcome, ToolSideEffect};
use crate::errors::ToolError;
use crate::workspace::Workspace;

pub const DEFAULT_TEST_TIMEOUT_SECS: u64 = 120;
pub const DEFAULT_SYNTAX_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 60;

const STDOUT_CAP: usize = 50 * 1024;
const STDERR_CAP: usize = 10 * 1024;

/// Commands may only start with one of these prefixes. Multi-word prefixes
/// cover the interpreter-runner forms; bare `python` stays disallowed.
const ALLOWED_PREFIXES: &[&str] = &[
    "pytest",
    "python -m pytest",
    "python -m",
    "npm test",
    "npm install",
    "npx vitest",
    "npx",
    "pip install",
    // read-only inspection
    "cat",
    "head",
    "tail",
    "wc",
    "find",
    "ls",
];

/// Anything here means the command wanted a shell; we never give it one.
const SHELL_METACHARACTERS: &[&str] = &[";", "|", "`", "$(", "&", ">", "<", "\n"];

static PASSED_REGEX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(\d+) passed").unwrap());
static FAILED_REGEX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(\d+) failed").unwrap());
static PY_LINE_REGEX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"line (\d+)").unwrap());

#[derive(Debug, Clone)]
pub struct CommandTimeouts {
    pub tests_secs: u64,
    pub syntax_secs: u64,
    pub shell_secs: u64,
}

impl Default for CommandTimeouts {
    fn default() -> Self {
        Self {
            tests_secs: DEFAULT_TEST_TIMEOUT_SECS,
            syntax_secs: DEFAULT_SYNTAX_TIMEOUT_SECS,
            shell_secs: DEFAULT_COMMAND_TIMEOUT_SECS,
        }
    }
}

/// Validate a command line against the allow-list and metacharacter rules.
/// Returns the normalized token vector ready for exec.
pub fn validate_command(command: &str) -> Result<Vec<String>, ToolError> {
    let trimmed = command.trim();
    if trimmed.is_empty() {
        return Err(ToolError::InvalidInput("empty command".to_string()));
    }

    for meta in SHELL_METACHARACTERS {
        if trimmed.contains(meta) {
            return Err(ToolError::ShellMetacharacter {
                command: trimmed.to_string(),
            });
        }
    }

    let tokens: Vec<String> = trimmed.split_whitespace().map(|s| s.to_string()).collect();
    let normalized = tokens.join(" ");

    let allowed = ALLOWED_PREFIXES.iter().any(|prefix| {
        normalized == *prefix || normalized.starts_with(&format!("{} ", prefix))
    });
    if !allowed {
        return Err(ToolError::CommandNotAllowed {
            command: normalized,
        });
    }

    Ok(tokens)
}

struct ExecResult {
    exit_code: i32,
    stdout: String,
    stderr: String,
}

/// Spawn the tokenized command with a cleared environment (PATH only) and a
/// hard-kill timeout. The child dies with the dropped future on expiry.
async fn spawn_confined(
    workspace: &Workspace,
    tokens: &[String],
    timeout_secs: u64,
) -> Result<ExecResult, ToolError> {
    let mut cmd = Command::new(&tokens[0]);
    cmd.args(&tokens[1..])
        .current_dir(workspace.root())
        .env_clear()
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Ok(path) = std::env::var("PATH") {
        cmd.env("PATH", path);
    }

    let child = cmd.spawn()?;
    let output = tokio::time::timeout(Duration::from_secs(timeout_secs), child.wait_with_output())
        .await
        .map_err(|_| ToolError::Timeout {
            command: tokens.join(" "),
            timeout_secs,
        })??;

    Ok(ExecResult {
        exit_code: output.status.code().unwrap_or(-1),
        stdout: truncate_utf8(&String::from_utf8_lossy(&output.stdout), STDOUT_CAP),
        stderr: truncate_utf8(&String::from_utf8_lossy(&output.stderr), STDERR_CAP),
    })
}

fn truncate_utf8(s: &str, cap: usize) -> String {
    if s.len() <= cap {
        return s.to_string();
    }
    let mut cut = cap;
    while cut > 0 && !s.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}\n[...output truncated...]", &s[..cut])
}

/// Parse `N passed` / `N failed` totals out of pytest/vitest-style output.
fn parse_test_counts(output: &str) -> (u64, u64) {
    let passed = PASSED_REGEX
        .captures_iter(output)
        .filter_map(|c| c.get(1)?.as_str().parse::<u64>().ok())
        .last()
        .unwrap_or(0);
    let failed = FAILED_REGEX
        .captures_iter(output)
        .filter_map(|c| c.get(1)?.as_str().parse::<u64>().ok())
        .last()
        .unwrap_or(0);
    (passed, failed)
}

pub async fn run_tests(workspace: &Workspace, command: &str, timeout_secs: u64) -> ToolOutcome {
    let tokens = match validate_command(command) {
        Ok(t) => t,
        Err(e) => return e.into(),
    };
    match spawn_confined(workspace, &tokens, timeout_secs).await {
        Ok(result) => {
            let combined = format!("{}\n{}", result.stdout, result.stderr);
            let (passed, failed) = parse_test_counts(&combined);
            ToolOutcome::success_with(
                json!({
                    "command": command,
                    "exit_code": result.exit_code,
                    "stdout": result.stdout,
                    "stderr": result.stderr,
                    "passed": passed,
                    "failed": failed,
                }),
                ToolSideEffect::TestRun {
                    command: command.to_string(),
                    exit_code: result.exit_code,
                    passed,
                    failed,
                },
            )
        }
        Err(e) => e.into(),
    }
}

pub async fn run_command(workspace: &Workspace, command: &str, timeout_secs: u64) -> ToolOutcome {
    let tokens = match validate_command(command) {
        Ok(t) => t,
        Err(e) => return e.into(),
    };
    match spawn_confined(workspace, &tokens, timeout_secs).await {
        Ok(result) => ToolOutcome::success(json!({
            "command": command,
            "exit_code": result.exit_code,
            "stdout": result.stdout,
            "stderr": result.stderr,
        })),
        Err(e) => e.into(),
    }
}

pub async fn check_syntax(workspace: &Workspace, path: &str, timeout_secs: u64) -> ToolOutcome {
    let resolved = match workspace.resolve(path) {
        Ok(p) => p,
        Err(e) => return e.into(),
    };
    if !resolved.exists() {
        return ToolOutcome::error(format!("File not found: {}", path));
    }

    let ext = resolved
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_string();
    let tokens: Vec<String> = match ext.as_str() {
        "py" => vec![
            "python".into(),
            "-m".into(),
            "py_compile".into(),
            resolved.to_string_lossy().to_string(),
        ],
        "js" | "mjs" | "cjs" => vec![
            "node".into(),
            "--check".into(),
            resolved.to_string_lossy().to_string(),
        ],
        other => {
            return ToolOutcome::error(format!(
                "Syntax check not supported for .{} files",
                other
            ));
        }
    };

    match spawn_confined(workspace, &tokens, timeout_secs).await {
        Ok(result) if result.exit_code == 0 => {
            ToolOutcome::success(json!({ "path": path, "result": "no errors" }))
        }
        Ok(result) => {
            let mut errors = Vec::new();
            for line in result.stderr.lines().chain(result.stdout.lines()) {
                if let Some(cap) = PY_LINE_REGEX.captures(line) {
                    let lineno: u64 = cap[1].parse().unwrap_or(0);
                    errors.push(json!({ "line": lineno, "message": line.trim() }));
                }
            }
            if errors.is_empty() {
                errors.push(json!({
                    "line": 0,
                    "message": result.stderr.lines().next().unwrap_or("syntax error").trim(),
                }));
            }
            ToolOutcome::success(json!({ "path": path, "errors": errors }))
        }
        Err(e) => e.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ws() -> (Workspace, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        (Workspace::new(dir.path()).unwrap(), dir)
    }

    #[test]
    fn allowlist_accepts_test_runners() {
        assert!(validate_command("pytest -q").is_ok());
        assert!(validate_command("python -m pytest tests/").is_ok());
        assert!(validate_command("npm test").is_ok());
        assert!(validate_command("npx vitest run").is_ok());
        assert!(validate_command("pip install requests").is_ok());
    }

    #[test]
    fn allowlist_accepts_inspection_commands() {
        assert!(validate_command("ls -la").is_ok());
        assert!(validate_command("cat main.py").is_ok());
        assert!(validate_command("wc -l src/app.py").is_ok());
        assert!(validate_command("head -20 README.md").is_ok());
    }

    #[test]
    fn allowlist_rejects_everything_else() {
        for cmd in ["rm -rf /", "curl http://x", "bash -c ls", "python script.py", "sh"] {
            let err = validate_command(cmd).unwrap_err();
            assert!(
                matches!(err, ToolError::CommandNotAllowed { .. }),
                "expected rejection for {}",
                cmd
            );
        }
    }

    #[test]
    fn bare_python_is_not_allowed_but_dash_m_is() {
        assert!(validate_command("python").is_err());
        assert!(validate_command("python -m http.server").is_ok());
    }

    #[test]
    fn metacharacters_rejected_before_allowlist() {
        for cmd in [
            "ls ; rm -rf /",
            "cat a | tee /etc/passwd",
            "ls `whoami`",
            "ls $(whoami)",
            "pytest && curl evil",
            "cat a > /etc/passwd",
            "head < /etc/shadow",
        ] {
            let err = validate_command(cmd).unwrap_err();
            assert!(
                matches!(err, ToolError::ShellMetacharacter { .. }),
                "expected metacharacter rejection for {}",
                cmd
            );
        }
    }

    #[test]
    fn empty_command_rejected() {
        assert!(matches!(
            validate_command("   "),
            Err(ToolError::InvalidInput(_))
        ));
    }

    #[test]
    fn parse_test_counts_pytest_summary() {
        let out = "collected 5 items\n\n=== 4 passed, 1 failed in 0.32s ===";
        assert_eq!(parse_test_counts(out), (4, 1));
    }

    #[test]
    fn parse_test_counts_vitest_summary() {
        let out = "Tests  2 failed | 7 passed (9)";
        assert_eq!(parse_test_counts(out), (7, 2));
    }

    #[test]
    fn parse_test_counts_absent() {
        assert_eq!(parse_test_counts("no summary here"), (0, 0));
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        let s = "é".repeat(100);
        let t = truncate_utf8(&s, 33);
        assert!(t.contains("[...output truncated...]"));
        // must not panic and must be valid UTF-8 by construction
    }

    #[tokio::test]
    async fn run_command_executes_ls() {
        let (ws, dir) = ws();
        std::fs::write(dir.path().join("marker.txt"), "x").unwrap();
        let out = run_command(&ws, "ls", 10).await;
        assert!(out.ok);
        assert_eq!(out.data["exit_code"], 0);
        assert!(out.data["stdout"].as_str().unwrap().contains("marker.txt"));
    }

    #[tokio::test]
    async fn run_command_disallowed_runs_nothing() {
        let (ws, dir) = ws();
        std::fs::write(dir.path().join("marker.txt"), "x").unwrap();
        let out = run_command(&ws, "rm marker.txt", 10).await;
        assert!(!out.ok);
        assert!(out.render().contains("not allowed"));
        assert!(dir.path().join("marker.txt").exists());
    }

    #[tokio::test]
    async fn run_command_times_out_with_hard_kill() {
        let (ws, dir) = ws();
        // `find` against an enormous tree would be slow to force a timeout
        // portably; instead point tail -f at a file so it never exits.
        std::fs::write(dir.path().join("f.txt"), "x").unwrap();
        let start = std::time::Instant::now();
        let out = run_command(&ws, "tail -f f.txt", 1).await;
        assert!(!out.ok);
        assert!(out.render().contains("ToolTimeout"));
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn run_tests_reports_counts_for_fake_runner() {
        let (ws, dir) = ws();
        // `cat` of a canned pytest summary exercises the parse path without
        // needing pytest on the host; run_tests only cares about output text.
        std::fs::write(dir.path().join("summary.txt"), "=== 3 passed, 2 failed in 1s ===")
            .unwrap();
        let out = run_tests(&ws, "cat summary.txt", 10).await;
        assert!(out.ok);
        assert_eq!(out.data["passed"], 3);
        assert_eq!(out.data["failed"], 2);
        match out.side_effect {
            Some(ToolSideEffect::TestRun { passed, failed, .. }) => {
                assert_eq!((passed, failed), (3, 2));
            }
            other => panic!("unexpected side effect: {:?}", other),
        }
    }

    #[tokio::test]
    async fn check_syntax_unsupported_extension() {
        let (ws, dir) = ws();
        std::fs::write(dir.path().join("main.rs"), "fn main() {}").unwrap();
        let out = check_syntax(&ws, "main.rs", 10).await;
        assert!(!out.ok);
        assert!(out.render().contains("not supported"));
    }

    #[tokio::test]
    async fn check_syntax_missing_file() {
        let (ws, _dir) = ws();
        let out = check_syntax(&ws, "ghost.py", 10).await;
        assert!(!out.ok);
        assert!(out.render().contains("not found"));
    }
}
