//! The tool surface exposed to the building agent.
//!
//! Tools form a closed set: requests deserialize into the `ToolRequest`
//! tagged enum and dispatch through one switch. Failures never propagate out
//! of the executor; they become error strings the agent reads.

mod exec;
mod fs;

use serde::Deserialize;
use serde_json::{Value, json};

use crate::errors::ToolError;
use crate::workspace::Workspace;

pub use exec::{CommandTimeouts, DEFAULT_COMMAND_TIMEOUT_SECS, DEFAULT_TEST_TIMEOUT_SECS};

/// A validated tool call. The set of tools is closed by construction.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "tool", rename_all = "snake_case")]
pub enum ToolRequest {
    ReadFile {
        path: String,
    },
    ListDirectory {
        path: String,
    },
    SearchCode {
        pattern: String,
        #[serde(default)]
        scope: Option<String>,
    },
    WriteFile {
        path: String,
        content: String,
    },
    RunTests {
        command: String,
        #[serde(default)]
        timeout_secs: Option<u64>,
    },
    CheckSyntax {
        path: String,
    },
    RunCommand {
        command: String,
        #[serde(default)]
        timeout_secs: Option<u64>,
    },
}

impl ToolRequest {
    /// Build a request from a tool name and its raw JSON input, as they
    /// arrive from the provider stream.
    pub fn parse(name: &str, input: &Value) -> Result<Self, ToolError> {
        let known = [
            "read_file",
            "list_directory",
            "search_code",
            "write_file",
            "run_tests",
            "check_syntax",
            "run_command",
        ];
        if !known.contains(&name) {
            return Err(ToolError::UnknownTool(name.to_string()));
        }
        let mut tagged = input.clone();
        match tagged.as_object_mut() {
            Some(obj) => {
                obj.insert("tool".to_string(), Value::String(name.to_string()));
            }
            None => {
                return Err(ToolError::InvalidInput(format!(
                    "input for {} must be a JSON object",
                    name
                )));
            }
        }
        serde_json::from_value(tagged).map_err(|e| ToolError::InvalidInput(e.to_string()))
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::ReadFile { .. } => "read_file",
            Self::ListDirectory { .. } => "list_directory",
            Self::SearchCode { .. } => "search_code",
            Self::WriteFile { .. } => "write_file",
            Self::RunTests { .. } => "run_tests",
            Self::CheckSyntax { .. } => "check_syntax",
            Self::RunCommand { .. } => "run_command",
        }
    }

    /// One-line description of the call for tool_use events.
    pub fn summary(&self) -> String {
        match self {
            Self::ReadFile { path } => path.clone(),
            Self::ListDirectory { path } => path.clone(),
            Self::SearchCode { pattern, .. } => pattern.clone(),
            Self::WriteFile { path, .. } => path.clone(),
            Self::RunTests { command, .. } => command.clone(),
            Self::CheckSyntax { path } => path.clone(),
            Self::RunCommand { command, .. } => command.clone(),
        }
    }
}

/// Observable side effects the orchestrator turns into events.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolSideEffect {
    FileWritten {
        path: String,
        bytes: u64,
        created: bool,
    },
    TestRun {
        command: String,
        exit_code: i32,
        passed: u64,
        failed: u64,
    },
}

/// Result of one tool dispatch. Either way, `render()` is what the agent
/// sees; `side_effect` is for the event stream only.
#[derive(Debug, Clone)]
pub struct ToolOutcome {
    pub ok: bool,
    pub data: Value,
    pub side_effect: Option<ToolSideEffect>,
}

impl ToolOutcome {
    pub fn success(data: Value) -> Self {
        Self {
            ok: true,
            data,
            side_effect: None,
        }
    }

    pub fn success_with(data: Value, side_effect: ToolSideEffect) -> Self {
        Self {
            ok: true,
            data,
            side_effect: Some(side_effect),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: json!({ "error": message.into() }),
            side_effect: None,
        }
    }

    /// Render the result as conversation text for the agent.
    pub fn render(&self) -> String {
        if self.ok {
            serde_json::to_string_pretty(&self.data).unwrap_or_else(|_| self.data.to_string())
        } else {
            self.data
                .get("error")
                .and_then(|e| e.as_str())
                .unwrap_or("tool error")
                .to_string()
        }
    }
}

impl From<ToolError> for ToolOutcome {
    fn from(err: ToolError) -> Self {
        Self::error(err.to_string())
    }
}

/// Executes validated tool calls inside one build's workspace.
pub struct ToolExecutor {
    workspace: Workspace,
    timeouts: CommandTimeouts,
}

impl ToolExecutor {
    pub fn new(workspace: Workspace) -> Self {
        Self {
            workspace,
            timeouts: CommandTimeouts::default(),
        }
    }

    pub fn with_timeouts(workspace: Workspace, timeouts: CommandTimeouts) -> Self {
        Self { workspace, timeouts }
    }

    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    /// Dispatch a raw (name, input) pair. Never returns Err: all failures
    /// become error outcomes the agent can read and react to.
    pub async fn dispatch_raw(&self, name: &str, input: &Value) -> ToolOutcome {
        match ToolRequest::parse(name, input) {
            Ok(req) => self.dispatch(req).await,
            Err(err) => err.into(),
        }
    }

    /// The single switch over the closed tool set.
    pub async fn dispatch(&self, request: ToolRequest) -> ToolOutcome {
        match request {
            ToolRequest::ReadFile { path } => fs::read_file(&self.workspace, &path).await,
            ToolRequest::ListDirectory { path } => {
                fs::list_directory(&self.workspace, &path).await
            }
            ToolRequest::SearchCode { pattern, scope } => {
                fs::search_code(&self.workspace, &pattern, scope.as_deref()).await
            }
            ToolRequest::WriteFile { path, content } => {
                fs::write_file(&self.workspace, &path, &content).await
            }
            ToolRequest::RunTests {
                command,
                timeout_secs,
            } => {
                exec::run_tests(
                    &self.workspace,
                    &command,
                    timeout_secs.unwrap_or(self.timeouts.tests_secs),
                )
                .await
            }
            ToolRequest::CheckSyntax { path } => {
                exec::check_syntax(&self.workspace, &path, self.timeouts.syntax_secs).await
            }
            ToolRequest::RunCommand {
                command,
                timeout_secs,
            } => {
                exec::run_command(
                    &self.workspace,
                    &command,
                    timeout_secs.unwrap_or(self.timeouts.shell_secs),
                )
                .await
            }
        }
    }
}

/// Declared shape of one tool, sent to the provider with each turn.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// The full registry, in the order the agent sees it.
pub fn tool_specs() -> Vec<ToolSpec> {
    vec![
        ToolSpec {
            name: "read_file".into(),
            description: "Read a file from the workspace. Content is truncated at 50 KB.".into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "path": { "type": "string", "description": "Relative path within the workspace" }
                },
                "required": ["path"]
            }),
        },
        ToolSpec {
            name: "list_directory".into(),
            description: "List entries of a workspace directory. Directories carry a trailing '/'.".into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "path": { "type": "string", "description": "Relative directory path; '.' for the root" }
                },
                "required": ["path"]
            }),
        },
        ToolSpec {
            name: "search_code".into(),
            description: "Search file contents by regex or literal. Returns up to 50 matches with path, line and snippet.".into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "pattern": { "type": "string" },
                    "scope": { "type": "string", "description": "Optional subdirectory to limit the search" }
                },
                "required": ["pattern"]
            }),
        },
        ToolSpec {
            name: "write_file".into(),
            description: "Create or overwrite a file with full content (no diffs). Parent directories are created.".into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "path": { "type": "string" },
                    "content": { "type": "string" }
                },
                "required": ["path", "content"]
            }),
        },
        ToolSpec {
            name: "run_tests".into(),
            description: "Run the test command (pytest, npm test, npx vitest). Returns exit code, truncated output and parsed pass/fail counts.".into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "command": { "type": "string" },
                    "timeout_secs": { "type": "integer" }
                },
                "required": ["command"]
            }),
        },
        ToolSpec {
            name: "check_syntax".into(),
            description: "Check one file for syntax errors. Returns a list of (line, message) or 'no errors'.".into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "path": { "type": "string" }
                },
                "required": ["path"]
            }),
        },
        ToolSpec {
            name: "run_command".into(),
            description: "Run an allow-listed command (package installs, read-only inspection). Shell metacharacters are rejected.".into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "command": { "type": "string" },
                    "timeout_secs": { "type": "integer" }
                },
                "required": ["command"]
            }),
        },
    ]
}
