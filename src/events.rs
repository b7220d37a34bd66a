use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::auditor::AuditFinding;

/// Events fanned out to connected observers. Every variant is also persisted
/// as a BuildLog row before delivery, so the stream can be replayed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum BuildEvent {
    BuildStarted {
        build_id: String,
        project_id: i64,
        target_kind: String,
        target_ref: String,
    },
    WorkspaceReady {
        build_id: String,
        working_dir: String,
    },
    BuildOverview {
        build_id: String,
        phase_count: u32,
        contract_batch: Option<String>,
    },
    PhaseStart {
        build_id: String,
        phase: u32,
        name: String,
    },
    PhasePlan {
        build_id: String,
        phase: u32,
        tasks: Vec<String>,
    },
    TaskComplete {
        build_id: String,
        phase: u32,
        task_index: usize,
    },
    BuildLog {
        build_id: String,
        source: String,
        level: String,
        message: String,
    },
    ToolUse {
        build_id: String,
        tool: String,
        summary: String,
        ok: bool,
    },
    FileCreated {
        build_id: String,
        path: String,
        bytes: u64,
    },
    FileModified {
        build_id: String,
        path: String,
        bytes: u64,
    },
    TestRun {
        build_id: String,
        command: String,
        exit_code: i32,
        passed: u64,
        failed: u64,
    },
    AuditPass {
        build_id: String,
        phase: u32,
    },
    AuditFail {
        build_id: String,
        phase: u32,
        loop_count: u32,
        findings: Vec<AuditFinding>,
    },
    RecoveryPlan {
        build_id: String,
        phase: u32,
        steps: Vec<String>,
    },
    BuildPaused {
        build_id: String,
        gate: String,
        payload: serde_json::Value,
        options: Vec<String>,
    },
    BuildInterjection {
        build_id: String,
        message: String,
    },
    BuildResumed {
        build_id: String,
        action: String,
    },
    BuildCancelled {
        build_id: String,
    },
    BuildCompleted {
        build_id: String,
        phases: u32,
        total_cost_usd: f64,
    },
    Heartbeat {
        ts: DateTime<Utc>,
    },
    Compacted {
        build_id: String,
        dropped_turns: usize,
        summary_bytes: usize,
    },
}

impl BuildEvent {
    /// The wire `type` tag for this event. Matches the serde rename exactly.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::BuildStarted { .. } => "build_started",
            Self::WorkspaceReady { .. } => "workspace_ready",
            Self::BuildOverview { .. } => "build_overview",
            Self::PhaseStart { .. } => "phase_start",
            Self::PhasePlan { .. } => "phase_plan",
            Self::TaskComplete { .. } => "task_complete",
            Self::BuildLog { .. } => "build_log",
            Self::ToolUse { .. } => "tool_use",
            Self::FileCreated { .. } => "file_created",
            Self::FileModified { .. } => "file_modified",
            Self::TestRun { .. } => "test_run",
            Self::AuditPass { .. } => "audit_pass",
            Self::AuditFail { .. } => "audit_fail",
            Self::RecoveryPlan { .. } => "recovery_plan",
            Self::BuildPaused { .. } => "build_paused",
            Self::BuildInterjection { .. } => "build_interjection",
            Self::BuildResumed { .. } => "build_resumed",
            Self::BuildCancelled { .. } => "build_cancelled",
            Self::BuildCompleted { .. } => "build_completed",
            Self::Heartbeat { .. } => "heartbeat",
            Self::Compacted { .. } => "compacted",
        }
    }

    /// A one-line rendering for the BuildLog row that mirrors this event.
    pub fn log_message(&self) -> String {
        match self {
            Self::BuildStarted { target_ref, .. } => format!("build started for {}", target_ref),
            Self::WorkspaceReady { working_dir, .. } => {
                format!("workspace ready at {}", working_dir)
            }
            Self::BuildOverview { phase_count, .. } => {
                format!("{} phases planned", phase_count)
            }
            Self::PhaseStart { phase, name, .. } => format!("phase {} ({}) started", phase, name),
            Self::PhasePlan { tasks, .. } => format!("plan with {} tasks", tasks.len()),
            Self::TaskComplete { task_index, .. } => format!("task {} complete", task_index),
            Self::BuildLog { message, .. } => message.clone(),
            Self::ToolUse { tool, summary, ok, .. } => {
                if *ok {
                    format!("{} {}", tool, summary)
                } else {
                    format!("{} {} [rejected]", tool, summary)
                }
            }
            Self::FileCreated { path, bytes, .. } => format!("created {} ({} bytes)", path, bytes),
            Self::FileModified { path, bytes, .. } => {
                format!("modified {} ({} bytes)", path, bytes)
            }
            Self::TestRun {
                command,
                exit_code,
                passed,
                failed,
                ..
            } => format!(
                "{} exited {} ({} passed, {} failed)",
                command, exit_code, passed, failed
            ),
            Self::AuditPass { phase, .. } => format!("phase {} audit passed", phase),
            Self::AuditFail {
                phase,
                loop_count,
                findings,
                ..
            } => format!(
                "phase {} audit failed ({} findings, loop {})",
                phase,
                findings.len(),
                loop_count
            ),
            Self::RecoveryPlan { steps, .. } => format!("recovery plan with {} steps", steps.len()),
            Self::BuildPaused { gate, .. } => format!("paused awaiting {}", gate),
            Self::BuildInterjection { message, .. } => format!("interjection: {}", message),
            Self::BuildResumed { action, .. } => format!("resumed with {}", action),
            Self::BuildCancelled { .. } => "build cancelled".to_string(),
            Self::BuildCompleted {
                phases,
                total_cost_usd,
                ..
            } => format!("completed {} phases (${:.4})", phases, total_cost_usd),
            Self::Heartbeat { .. } => "heartbeat".to_string(),
            Self::Compacted {
                dropped_turns,
                summary_bytes,
                ..
            } => format!(
                "conversation compacted ({} turns folded into {} bytes)",
                dropped_turns, summary_bytes
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_serializes_with_snake_case_type_tag() {
        let ev = BuildEvent::PhaseStart {
            build_id: "b1".into(),
            phase: 2,
            name: "api".into(),
        };
        let json = serde_json::to_string(&ev).unwrap();
        assert!(json.contains("\"type\":\"phase_start\""));
        assert!(json.contains("\"data\""));
        assert!(json.contains("\"phase\":2"));
    }

    #[test]
    fn event_round_trips() {
        let ev = BuildEvent::AuditFail {
            build_id: "b1".into(),
            phase: 0,
            loop_count: 1,
            findings: vec![AuditFinding {
                kind: "missing".into(),
                location: "main.py".into(),
                message: "missing docstring".into(),
                blocking: true,
            }],
        };
        let json = serde_json::to_string(&ev).unwrap();
        let back: BuildEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ev);
    }

    #[test]
    fn kind_matches_wire_tag() {
        let ev = BuildEvent::BuildCancelled {
            build_id: "b1".into(),
        };
        let json = serde_json::to_string(&ev).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed["type"], ev.kind());
    }

    #[test]
    fn tool_use_log_message_marks_rejections() {
        let ev = BuildEvent::ToolUse {
            build_id: "b1".into(),
            tool: "write_file".into(),
            summary: "../../etc/passwd".into(),
            ok: false,
        };
        assert!(ev.log_message().contains("[rejected]"));
    }

    #[test]
    fn heartbeat_serializes() {
        let ev = BuildEvent::Heartbeat { ts: Utc::now() };
        let json = serde_json::to_string(&ev).unwrap();
        assert!(json.contains("\"type\":\"heartbeat\""));
    }
}
