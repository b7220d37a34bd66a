//! Inline LLM audit that gates phase progression.
//!
//! The auditor sees the pinned contracts, a capped snapshot of the working
//! tree, and the builder's phase output, and answers with a PASS/FAIL
//! verdict plus structured findings. It is the sole arbiter of advancement.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use crate::errors::LlmError;
use crate::llm::{ChatMessage, LlmClient, TurnOutput, TurnRequest, collect_turn, extract_json_object};
use crate::workspace::Workspace;

/// Snapshot budget across all file contents.
const SNAPSHOT_CAP_BYTES: usize = 200 * 1024;
/// Per-file truncation within the snapshot.
const SNAPSHOT_FILE_CAP_BYTES: usize = 8 * 1024;

const AUDITOR_SYSTEM_PROMPT: &str = r#"You are a build auditor. You are shown the project contracts, the current working tree, and the builder's report for one phase. Decide whether the phase's deliverables are actually present and correct.

You MUST respond with valid JSON only (no markdown, no explanation) matching this schema:
{
  "verdict": "PASS" | "FAIL",
  "findings": [
    {
      "kind": "missing" | "incorrect" | "contract_violation" | "quality",
      "location": "path or area",
      "message": "what is wrong",
      "blocking": true
    }
  ]
}

Rules:
- PASS only when every deliverable for the phase exists and matches the contracts.
- Every FAIL must carry at least one blocking finding.
- Findings must reference specific files or areas, not the project in general.
- Do not fail a phase for work that belongs to a later phase."#;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum AuditVerdict {
    #[serde(rename = "PASS")]
    Pass,
    #[serde(rename = "FAIL")]
    Fail,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditFinding {
    pub kind: String,
    pub location: String,
    pub message: String,
    #[serde(default = "default_blocking")]
    pub blocking: bool,
}

fn default_blocking() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditReport {
    pub verdict: AuditVerdict,
    #[serde(default)]
    pub findings: Vec<AuditFinding>,
}

impl AuditReport {
    pub fn passed(&self) -> bool {
        self.verdict == AuditVerdict::Pass
    }

    pub fn blocking_findings(&self) -> Vec<&AuditFinding> {
        self.findings.iter().filter(|f| f.blocking).collect()
    }

    /// Parse the auditor's reply, salvaging a JSON object out of any prose
    /// around it. An unparseable reply fails closed.
    pub fn parse(text: &str) -> Self {
        let candidate = extract_json_object(text).unwrap_or(text);
        match serde_json::from_str::<AuditReport>(candidate) {
            Ok(mut report) => {
                if !report.passed() && report.findings.is_empty() {
                    report.findings.push(AuditFinding {
                        kind: "incorrect".into(),
                        location: "audit".into(),
                        message: "audit failed without findings".into(),
                        blocking: true,
                    });
                }
                report
            }
            Err(e) => AuditReport {
                verdict: AuditVerdict::Fail,
                findings: vec![AuditFinding {
                    kind: "auditor_error".into(),
                    location: "audit".into(),
                    message: format!("unparseable audit reply: {}", e),
                    blocking: true,
                }],
            },
        }
    }
}

pub struct InlineAuditor {
    llm: Arc<dyn LlmClient>,
    model: String,
}

impl InlineAuditor {
    pub fn new(llm: Arc<dyn LlmClient>, model: String) -> Self {
        Self { llm, model }
    }

    /// Run the audit for one phase. Returns the report and the turn's token
    /// usage for the cost ledger.
    pub async fn audit(
        &self,
        phase_name: &str,
        contracts: &str,
        workspace: &Workspace,
        builder_output: &str,
    ) -> Result<(AuditReport, TurnOutput), LlmError> {
        let snapshot = workspace_snapshot(workspace);
        let prompt = format!(
            "## Phase under audit\n{}\n\n## Contracts\n{}\n\n## Working tree\n{}\n\n## Builder's report\n{}\n\nRespond with JSON only.",
            phase_name,
            contracts,
            snapshot,
            truncate(builder_output, 20 * 1024),
        );

        let rx = self
            .llm
            .stream_turn(TurnRequest {
                system: AUDITOR_SYSTEM_PROMPT.to_string(),
                messages: vec![ChatMessage::user(prompt)],
                tools: vec![],
                model: self.model.clone(),
                max_tokens: 2048,
            })
            .await?;
        let output = collect_turn(rx).await?;
        let report = AuditReport::parse(&output.text);
        Ok((report, output))
    }
}

/// Tree plus key file contents, capped at ~200 KB total with per-file
/// truncation. Hidden entries and obvious binaries are skipped.
pub fn workspace_snapshot(workspace: &Workspace) -> String {
    let mut out = String::new();
    out.push_str("### Tree\n");
    out.push_str(&workspace.tree(4));
    out.push_str("\n\n### Files\n");

    let mut budget = SNAPSHOT_CAP_BYTES;
    for entry in WalkDir::new(workspace.root())
        .min_depth(1)
        .sort_by_file_name()
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
        if budget == 0 {
            out.push_str("\n[snapshot budget exhausted; remaining files omitted]\n");
            break;
        }
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(content) = std::fs::read_to_string(entry.path()) else {
            continue;
        };
        let rel = entry
            .path()
            .strip_prefix(workspace.root())
            .unwrap_or(entry.path())
            .to_string_lossy()
            .to_string();
        let take = budget.min(SNAPSHOT_FILE_CAP_BYTES);
        let body = truncate(&content, take);
        budget = budget.saturating_sub(body.len());
        out.push_str(&format!("--- {} ---\n{}\n", rel, body));
    }
    out
}

fn truncate(s: &str, cap: usize) -> String {
    if s.len() <= cap {
        return s.to_string();
    }
    let mut cut = cap;
    while cut > 0 && !s.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}\n[...truncated...]", &s[..cut])
}
