//! Recovery planning after a failed audit.
//!
//! The planner turns blocking findings into a short, file-specific
//! remediation plan. It never proposes renames, restructures, or starting
//! over. When the planner itself fails, the orchestrator falls back to a
//! generic retry message.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::auditor::AuditFinding;
use crate::errors::LlmError;
use crate::llm::{ChatMessage, LlmClient, TurnOutput, TurnRequest, collect_turn, extract_json_object};

/// Hard cap on plan length.
const MAX_PLAN_STEPS: usize = 5;

const PLANNER_SYSTEM_PROMPT: &str = r#"You are a remediation planner for an automated build. An audit has failed; produce the shortest plan that addresses the blocking findings.

You MUST respond with valid JSON only (no markdown, no explanation) matching this schema:
{
  "steps": ["Fix X in path/to/file.py", "..."]
}

Rules:
- At most 5 steps.
- Address ONLY the blocking findings.
- Every step must reference a specific file.
- Never propose renaming files or restructuring directories.
- Never propose starting over.
- Respect the project contracts."#;

/// Fallback injected when the planner errors or times out.
pub const GENERIC_RECOVERY_MESSAGE: &str =
    "The audit failed. Retry the phase and address each finding directly in the files it names.";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecoveryPlan {
    pub steps: Vec<String>,
}

impl RecoveryPlan {
    pub fn parse(text: &str) -> Option<Self> {
        let candidate = extract_json_object(text)?;
        let mut plan: RecoveryPlan = serde_json::from_str(candidate).ok()?;
        if plan.steps.is_empty() {
            return None;
        }
        plan.steps.truncate(MAX_PLAN_STEPS);
        Some(plan)
    }

    /// Render the plan as the user-role turn injected into the conversation.
    pub fn as_message(&self) -> String {
        let mut msg = String::from("The audit failed. Apply this remediation plan:\n");
        for (i, step) in self.steps.iter().enumerate() {
            msg.push_str(&format!("{}. {}\n", i + 1, step));
        }
        msg
    }
}

pub struct RecoveryPlanner {
    llm: Arc<dyn LlmClient>,
    model: String,
}

impl RecoveryPlanner {
    pub fn new(llm: Arc<dyn LlmClient>, model: String) -> Self {
        Self { llm, model }
    }

    /// Produce a plan from the blocking findings. Errors propagate so the
    /// orchestrator can log them and fall back.
    pub async fn plan(
        &self,
        phase_name: &str,
        contracts: &str,
        project_state: &str,
        findings: &[AuditFinding],
        builder_output: &str,
    ) -> Result<(Option<RecoveryPlan>, TurnOutput), LlmError> {
        let findings_text = findings
            .iter()
            .filter(|f| f.blocking)
            .map(|f| format!("- [{}] {}: {}", f.kind, f.location, f.message))
            .collect::<Vec<_>>()
            .join("\n");

        let prompt = format!(
            "## Phase\n{}\n\n## Blocking findings\n{}\n\n## Contracts\n{}\n\n## Project state\n{}\n\n## Builder's report\n{}\n\nRespond with JSON only.",
            phase_name,
            findings_text,
            contracts,
            project_state,
            builder_output.chars().take(8000).collect::<String>(),
        );

        let rx = self
            .llm
            .stream_turn(TurnRequest {
                system: PLANNER_SYSTEM_PROMPT.to_string(),
                messages: vec![ChatMessage::user(prompt)],
                tools: vec![],
                model: self.model.clone(),
                max_tokens: 1024,
            })
            .await?;
        let output = collect_turn(rx).await?;
        Ok((RecoveryPlan::parse(&output.text), output))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLlm;

    #[test]
    fn parse_plan_from_json() {
        let plan = RecoveryPlan::parse(r#"{"steps": ["Add a docstring to main.py"]}"#).unwrap();
        assert_eq!(plan.steps.len(), 1);
    }

    #[test]
    fn parse_truncates_to_five_steps() {
        let plan = RecoveryPlan::parse(
            r#"{"steps": ["a", "b", "c", "d", "e", "f", "g"]}"#,
        )
        .unwrap();
        assert_eq!(plan.steps.len(), 5);
    }

    #[test]
    fn parse_rejects_empty_and_garbage() {
        assert!(RecoveryPlan::parse(r#"{"steps": []}"#).is_none());
        assert!(RecoveryPlan::parse("just do better").is_none());
    }

    #[test]
    fn plan_message_is_numbered() {
        let plan = RecoveryPlan {
            steps: vec!["Fix a.py".into(), "Fix b.py".into()],
        };
        let msg = plan.as_message();
        assert!(msg.contains("1. Fix a.py"));
        assert!(msg.contains("2. Fix b.py"));
    }

    #[tokio::test]
    async fn planner_sends_only_blocking_findings() {
        let mock = Arc::new(MockLlm::new(vec![MockLlm::text_turn(
            r#"{"steps": ["Add the missing docstring to main.py"]}"#,
            200,
            30,
        )]));
        let planner = RecoveryPlanner::new(mock.clone(), "plan-model".into());
        let findings = vec![
            AuditFinding {
                kind: "missing".into(),
                location: "main.py".into(),
                message: "missing docstring".into(),
                blocking: true,
            },
            AuditFinding {
                kind: "quality".into(),
                location: "style".into(),
                message: "could be prettier".into(),
                blocking: false,
            },
        ];
        let (plan, usage) = planner
            .plan("phase 0", "contracts", "state", &findings, "output")
            .await
            .unwrap();
        assert_eq!(plan.unwrap().steps.len(), 1);
        assert_eq!(usage.output_tokens, 30);

        let prompt = &mock.requests().await[0].messages[0].content;
        assert!(prompt.contains("missing docstring"));
        assert!(!prompt.contains("could be prettier"));
    }

    #[tokio::test]
    async fn planner_unparseable_reply_yields_none() {
        let mock = Arc::new(MockLlm::new(vec![MockLlm::text_turn(
            "let me think about this...",
            10,
            10,
        )]));
        let planner = RecoveryPlanner::new(mock, "plan-model".into());
        let (plan, _) = planner
            .plan("phase 0", "c", "s", &[], "o")
            .await
            .unwrap();
        assert!(plan.is_none());
    }
}
