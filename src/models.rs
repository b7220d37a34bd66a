use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BuildStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl BuildStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("Invalid build status: {}", s)),
        }
    }

    /// Terminal states cannot transition anywhere else.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Validate that a build status transition is allowed.
/// Lifecycle: pending -> running -> (paused <-> running)* -> terminal.
pub fn is_valid_transition(from: &BuildStatus, to: &BuildStatus) -> bool {
    use BuildStatus::*;
    matches!(
        (from, to),
        (Pending, Running)
            | (Pending, Cancelled)
            | (Pending, Failed)
            | (Running, Paused)
            | (Running, Completed)
            | (Running, Failed)
            | (Running, Cancelled)
            | (Paused, Running)
            | (Paused, Failed)
            | (Paused, Cancelled)
    )
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    NewRemote,
    ExistingRemote,
    Local,
}

impl TargetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NewRemote => "new_remote",
            Self::ExistingRemote => "existing_remote",
            Self::Local => "local",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "new_remote" => Ok(Self::NewRemote),
            "existing_remote" => Ok(Self::ExistingRemote),
            "local" => Ok(Self::Local),
            _ => Err(format!("Invalid target kind: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum GateKind {
    PhaseReview,
    IdeReady,
    Clarification,
    PlanReview,
    CostCap,
}

impl GateKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PhaseReview => "phase_review",
            Self::IdeReady => "ide_ready",
            Self::Clarification => "clarification",
            Self::PlanReview => "plan_review",
            Self::CostCap => "cost_cap",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "phase_review" => Ok(Self::PhaseReview),
            "ide_ready" => Ok(Self::IdeReady),
            "clarification" => Ok(Self::Clarification),
            "plan_review" => Ok(Self::PlanReview),
            "cost_cap" => Ok(Self::CostCap),
            _ => Err(format!("Invalid gate kind: {}", s)),
        }
    }
}

/// Persisted await-state of a paused build. Survives process restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingGate {
    pub kind: GateKind,
    pub payload: serde_json::Value,
    pub registered_at: DateTime<Utc>,
}

/// Where a user's resume request sends a paused build.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ResumeAction {
    Retry,
    RetryWithMessage,
    SkipPhase,
    Abort,
}

impl ResumeAction {
    pub fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "retry" => Ok(Self::Retry),
            "retry_with_message" => Ok(Self::RetryWithMessage),
            "skip_phase" => Ok(Self::SkipPhase),
            "abort" => Ok(Self::Abort),
            _ => Err(format!("Invalid resume action: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Build {
    pub id: String,
    pub project_id: i64,
    pub user_id: i64,
    pub status: BuildStatus,
    pub target_kind: TargetKind,
    /// Repo name for remote targets, absolute path for local ones.
    pub target_ref: String,
    pub working_dir: String,
    /// Index into the phase plan; the phase currently being driven.
    pub current_phase: u32,
    /// Highest phase index sealed by a passing audit. -1 until the first pass.
    pub completed_phases: i64,
    /// Consecutive audit failures on the current phase.
    pub loop_count: u32,
    /// sha256 digest of the pinned contract batch.
    pub contract_batch: Option<String>,
    /// The user's spend cap at start time, frozen for the build's lifetime.
    pub spend_cap_usd: f64,
    pub pending_gate: Option<PendingGate>,
    pub paused_at: Option<DateTime<Utc>>,
    pub error_detail: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogSource {
    Builder,
    Audit,
    Planner,
    Tool,
    Test,
    Git,
    System,
    User,
}

impl LogSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Builder => "builder",
            Self::Audit => "audit",
            Self::Planner => "planner",
            Self::Tool => "tool",
            Self::Test => "test",
            Self::Git => "git",
            Self::System => "system",
            Self::User => "user",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "builder" => Ok(Self::Builder),
            "audit" => Ok(Self::Audit),
            "planner" => Ok(Self::Planner),
            "tool" => Ok(Self::Tool),
            "test" => Ok(Self::Test),
            "git" => Ok(Self::Git),
            "system" => Ok(Self::System),
            "user" => Ok(Self::User),
            _ => Err(format!("Invalid log source: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            _ => Err(format!("Invalid log level: {}", s)),
        }
    }
}

/// One append-only timeline entry for a build. The WebSocket stream is a
/// derived view of these rows; clients replay them on reconnect.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildLogRow {
    pub id: i64,
    pub build_id: String,
    pub ts: DateTime<Utc>,
    pub source: LogSource,
    pub level: LogLevel,
    pub message: String,
    /// Event kind when this row mirrors a broadcast event, e.g. "tool_use".
    pub event_kind: Option<String>,
}

/// One LLM call's ledger entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildCostRow {
    pub id: i64,
    pub build_id: String,
    /// Phase label; planner calls append " (planner)".
    pub phase: String,
    pub model: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub usd: f64,
    pub ts: DateTime<Utc>,
}

/// Aggregated view of a build for the `summary` query.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BuildSummary {
    pub build_id: String,
    pub status: String,
    pub phases_completed: i64,
    pub elapsed_secs: i64,
    pub loop_count: u32,
    pub tool_calls: std::collections::BTreeMap<String, u64>,
    pub tests_passed: u64,
    pub tests_failed: u64,
    pub files_written: u64,
    pub commits: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_cost_usd: f64,
}
