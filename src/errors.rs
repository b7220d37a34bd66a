//! Typed error hierarchy for the ForgeGuard orchestrator.
//!
//! Three top-level enums cover the three layers:
//! - `ToolError` — tool-call failures; never escape the executor, they become
//!   error strings in the conversation
//! - `LlmError` — provider stream/API failures
//! - `BuildError` — orchestrator-level failures that drive state transitions

use thiserror::Error;

/// Errors from the tool execution layer. Every variant renders to the error
/// string the agent sees; none of these abort the build.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("ScopeError: path '{path}' escapes the workspace")]
    Scope { path: String },

    #[error("ScopeError: command not allowed: {command}")]
    CommandNotAllowed { command: String },

    #[error("ScopeError: shell metacharacters are not permitted: {command}")]
    ShellMetacharacter { command: String },

    #[error("ToolTimeout: '{command}' exceeded {timeout_secs}s and was killed")]
    Timeout { command: String, timeout_secs: u64 },

    #[error("Invalid tool input: {0}")]
    InvalidInput(String),

    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from the LLM provider layer.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("ProviderError: HTTP {status}: {message}")]
    Api { status: u16, message: String },

    #[error("ProviderError: authentication failed")]
    Auth,

    #[error("ProviderError: quota or rate limit exhausted")]
    Quota,

    #[error("ProviderError: malformed stream event: {0}")]
    MalformedEvent(String),

    #[error("ProviderError: stream ended without a stop chunk")]
    TruncatedStream,

    #[error("No API key available for this call")]
    NoKey,

    #[error("ProviderError: transport: {0}")]
    Transport(#[from] reqwest::Error),
}

impl LlmError {
    /// Auth and quota failures rotate the key pool instead of being retried
    /// on the same credential.
    pub fn rotates_key(&self) -> bool {
        matches!(self, Self::Auth | Self::Quota)
    }

    /// 5xx, 429 and transport errors are retryable with backoff; other 4xx are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Api { status, .. } => *status >= 500 || *status == 429,
            Self::Transport(_) | Self::TruncatedStream => true,
            _ => false,
        }
    }
}

/// Errors that surface from the orchestrator into build state.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("BuildTimeout: phase {phase} exceeded {budget_secs}s")]
    PhaseTimeout { phase: u32, budget_secs: u64 },

    #[error("BuildTimeout: pause gate expired after {minutes} minutes")]
    PauseTimeout { minutes: u64 },

    #[error("CostCapExceeded: projected ${projected:.4} exceeds cap ${cap:.2}")]
    CostCapExceeded { projected: f64, cap: f64 },

    #[error("GitError: {0}")]
    Git(String),

    #[error("OrphanBuild: {0}")]
    Orphan(String),

    #[error("Build was cancelled")]
    Cancelled,

    #[error("Build {0} not found")]
    NotFound(String),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error(transparent)]
    Llm(#[from] LlmError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl BuildError {
    /// Short machine-readable kind, surfaced verbatim in logs and the UI.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::PhaseTimeout { .. } | Self::PauseTimeout { .. } => "BuildTimeout",
            Self::CostCapExceeded { .. } => "CostCapExceeded",
            Self::Git(_) => "GitError",
            Self::Orphan(_) => "OrphanBuild",
            Self::Cancelled => "Cancelled",
            Self::NotFound(_) => "NotFound",
            Self::BadRequest(_) => "BadRequest",
            Self::RateLimited(_) => "RateLimited",
            Self::Llm(_) => "ProviderError",
            Self::Other(_) => "Internal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scope_error_renders_with_path() {
        let err = ToolError::Scope {
            path: "../../etc/passwd".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.starts_with("ScopeError"));
        assert!(msg.contains("../../etc/passwd"));
    }

    #[test]
    fn timeout_error_carries_budget() {
        let err = ToolError::Timeout {
            command: "pytest".to_string(),
            timeout_secs: 120,
        };
        assert!(err.to_string().contains("120"));
        assert!(err.to_string().starts_with("ToolTimeout"));
    }

    #[test]
    fn llm_auth_and_quota_rotate_key() {
        assert!(LlmError::Auth.rotates_key());
        assert!(LlmError::Quota.rotates_key());
        assert!(
            !LlmError::Api {
                status: 500,
                message: "boom".into()
            }
            .rotates_key()
        );
    }

    #[test]
    fn llm_retryability_by_status() {
        assert!(
            LlmError::Api {
                status: 503,
                message: "overloaded".into()
            }
            .is_retryable()
        );
        assert!(
            LlmError::Api {
                status: 429,
                message: "slow down".into()
            }
            .is_retryable()
        );
        assert!(
            !LlmError::Api {
                status: 400,
                message: "bad request".into()
            }
            .is_retryable()
        );
    }

    #[test]
    fn build_error_kinds_are_stable() {
        assert_eq!(
            BuildError::CostCapExceeded {
                projected: 1.5,
                cap: 1.0
            }
            .kind(),
            "CostCapExceeded"
        );
        assert_eq!(BuildError::Git("push failed".into()).kind(), "GitError");
        assert_eq!(BuildError::Cancelled.kind(), "Cancelled");
        assert_eq!(
            BuildError::Orphan("orphaned by restart".into()).kind(),
            "OrphanBuild"
        );
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&ToolError::UnknownTool("x".into()));
        assert_std_error(&LlmError::Auth);
        assert_std_error(&BuildError::Cancelled);
    }
}
