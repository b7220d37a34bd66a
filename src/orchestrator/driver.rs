//! The build driver: one task per build, owning the phase loop, the
//! conversation loop, tool-call plumbing, audit gating, loopback, pause
//! gates, git commits, and terminal state.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;

use super::BuildRuntime;
use super::gate::{CancelFlag, DriverChannels, GateResolution, drain_interjections};
use crate::auditor::{AuditFinding, workspace_snapshot};
use crate::compaction;
use crate::conversation::{Conversation, Turn, TurnKind};
use crate::cost::{CapCheck, CostAccountant};
use crate::errors::{BuildError, LlmError};
use crate::events::BuildEvent;
use crate::git::{GitClient, GitTarget};
use crate::llm::{ChatMessage, ChunkReceiver, StreamChunk, TurnRequest};
use crate::models::{
    Build, BuildStatus, GateKind, LogLevel, LogSource, PendingGate, ResumeAction, TargetKind,
};
use crate::phases::{ContractBatch, PhaseSpec};
use crate::signals;
use crate::tools::{ToolExecutor, ToolSideEffect, tool_specs};
use crate::workspace::Workspace;

/// Turns kept in the persisted gate payload for restart rehydration.
const GATE_TAIL_TURNS: usize = 8;
/// Connection-level provider retries per turn.
const LLM_CONNECT_RETRIES: u32 = 3;
/// Builder turn output ceiling.
const BUILDER_MAX_TOKENS: u32 = 8192;

const DIRECTIVE_PREAMBLE: &str = r#"You are the builder agent for an automated, phase-gated build.

Work through the current phase using the tools provided. Structure your work with these markers:
- Start with a plan:
  === PLAN ===
  1. first task
  2. second task
- After finishing task N, emit: === TASK DONE: N ===
- Prefer the write_file tool. As a fallback you may emit full files inline:
  === FILE: path/to/file.ext ===
  <full content>
  === END FILE ===
- When every deliverable of the phase exists and is verified, emit exactly:
  === PHASE SIGN-OFF: PASS ===

Rules: stay within the workspace, full file contents only (never diffs), run the tests before signing off, and do not touch work that belongs to later phases."#;

/// Resume options offered on every pause gate.
fn gate_options() -> Vec<String> {
    vec![
        "retry".to_string(),
        "retry_with_message".to_string(),
        "skip_phase".to_string(),
        "abort".to_string(),
    ]
}

/// Outcome of one phase's conversation loop.
enum ConvOutcome {
    SignedOff,
    TimedOut,
    Cancelled,
    CostCap { projected: f64, cap: f64 },
}

/// Outcome of waiting on a pause gate.
enum GateWait {
    Resume,
    Skip,
    Abort,
    TimedOut,
    Cancelled,
}

/// How the whole build ended.
enum Terminal {
    Completed { phases: u32 },
    Cancelled,
    Failed(String),
}

pub(super) struct BuildDriver {
    runtime: Arc<BuildRuntime>,
    build_id: String,
    user_id: i64,
    project_id: i64,
    target_kind: TargetKind,
    target_ref: String,
    workspace: Workspace,
    executor: ToolExecutor,
    git: GitClient,
    contracts: ContractBatch,
    conversation: Conversation,
    accountant: CostAccountant,
    cancel: Arc<CancelFlag>,
    channels: DriverChannels,
    current_phase: u32,
    completed_phases: i64,
    loop_count: u32,
    /// Gate carried over from a previous process, resolved before driving.
    resume_gate: Option<PendingGate>,
}

impl BuildDriver {
    pub(super) fn new(
        runtime: Arc<BuildRuntime>,
        build: &Build,
        workspace: Workspace,
        cancel: Arc<CancelFlag>,
        channels: DriverChannels,
    ) -> Self {
        let git = GitClient::new(
            workspace.root(),
            runtime.settings.github_token.clone(),
            runtime.http.clone(),
        );
        let executor = ToolExecutor::new(workspace.clone());
        let mut conversation = Conversation::new(DIRECTIVE_PREAMBLE.to_string());

        // Rehydrate the persisted tail when resuming across a restart.
        if let Some(gate) = &build.pending_gate {
            if let Some(tail) = gate.payload.get("conversation_tail") {
                if let Ok(turns) = serde_json::from_value::<Vec<Turn>>(tail.clone()) {
                    conversation.turns = turns;
                }
            }
        }

        Self {
            accountant: CostAccountant::new(build.spend_cap_usd, runtime.settings.max_cost_usd),
            build_id: build.id.clone(),
            user_id: build.user_id,
            project_id: build.project_id,
            target_kind: build.target_kind,
            target_ref: build.target_ref.clone(),
            workspace,
            executor,
            git,
            contracts: ContractBatch::empty(),
            conversation,
            cancel,
            channels,
            current_phase: build.current_phase,
            completed_phases: build.completed_phases,
            loop_count: build.loop_count,
            resume_gate: build.pending_gate.clone(),
            runtime,
        }
    }

    // ── Event helpers ────────────────────────────────────────────────

    async fn emit(&self, source: LogSource, level: LogLevel, event: BuildEvent) {
        self.runtime
            .broadcaster
            .emit(self.user_id, &self.build_id, source, level, &event)
            .await;
    }

    async fn log(&self, source: LogSource, level: LogLevel, message: &str) {
        self.runtime
            .broadcaster
            .emit_line(self.user_id, &self.build_id, source, level, message)
            .await;
    }

    fn set_status(&self, status: BuildStatus, error_detail: Option<&str>) {
        if let Err(e) = self
            .runtime
            .store
            .update_status(&self.build_id, status, error_detail)
        {
            tracing::error!(build_id = %self.build_id, error = %e, "status update failed");
        }
    }

    // ── Entry point ──────────────────────────────────────────────────

    pub(super) async fn run(mut self) {
        let terminal = match self.run_inner().await {
            Ok(terminal) => terminal,
            Err(BuildError::Cancelled) => Terminal::Cancelled,
            Err(err) => Terminal::Failed(format!("{}: {}", err.kind(), err)),
        };
        match terminal {
            Terminal::Completed { phases } => {
                self.set_status(BuildStatus::Completed, None);
                self.emit(
                    LogSource::System,
                    LogLevel::Info,
                    BuildEvent::BuildCompleted {
                        build_id: self.build_id.clone(),
                        phases,
                        total_cost_usd: self.accountant.total_usd(),
                    },
                )
                .await;
            }
            Terminal::Cancelled => {
                self.set_status(BuildStatus::Cancelled, None);
                self.emit(
                    LogSource::System,
                    LogLevel::Info,
                    BuildEvent::BuildCancelled {
                        build_id: self.build_id.clone(),
                    },
                )
                .await;
            }
            Terminal::Failed(detail) => {
                self.set_status(BuildStatus::Failed, Some(&detail));
                self.log(LogSource::System, LogLevel::Error, &detail).await;
            }
        }
        self.runtime.release_handle(&self.build_id).await;
    }

    async fn run_inner(&mut self) -> Result<Terminal, BuildError> {
        // A gate persisted by a previous process blocks before any driving.
        if let Some(gate) = self.resume_gate.take() {
            self.set_status(BuildStatus::Paused, None);
            match self.wait_on_gate(gate).await? {
                GateWait::Resume => {}
                GateWait::Skip => self.advance_past_current_phase().await?,
                GateWait::Abort | GateWait::Cancelled => return Ok(Terminal::Cancelled),
                GateWait::TimedOut => {
                    return Ok(Terminal::Failed(
                        BuildError::PauseTimeout {
                            minutes: self.runtime.settings.pause_timeout_minutes,
                        }
                        .to_string(),
                    ));
                }
            }
        }

        self.set_status(BuildStatus::Running, None);
        self.emit(
            LogSource::System,
            LogLevel::Info,
            BuildEvent::BuildStarted {
                build_id: self.build_id.clone(),
                project_id: self.project_id,
                target_kind: self.target_kind.as_str().to_string(),
                target_ref: self.target_ref.clone(),
            },
        )
        .await;

        // Workspace + repository.
        let target = GitTarget {
            kind: self.target_kind,
            repo: self.target_ref.clone(),
            private: true,
        };
        self.git.init_or_clone(&target).await?;
        if self.target_kind == TargetKind::NewRemote {
            let url = self.git.create_remote_repo(&self.target_ref, true).await?;
            self.log(LogSource::Git, LogLevel::Info, &format!("remote ready at {}", url))
                .await;
        }
        self.emit(
            LogSource::System,
            LogLevel::Info,
            BuildEvent::WorkspaceReady {
                build_id: self.build_id.clone(),
                working_dir: self.workspace.root().display().to_string(),
            },
        )
        .await;
        let ws = self.workspace.summary();
        self.log(
            LogSource::System,
            LogLevel::Info,
            &format!("workspace holds {} files ({} bytes)", ws.total_files, ws.total_bytes),
        )
        .await;

        // Contracts are read from the prepared checkout, then pinned.
        self.contracts = ContractBatch::load(self.workspace.root())?;
        self.runtime.store.snapshot_contracts(
            &self.build_id,
            &self.contracts.digest,
            &self.contracts.files,
        )?;
        self.emit(
            LogSource::System,
            LogLevel::Info,
            BuildEvent::BuildOverview {
                build_id: self.build_id.clone(),
                phase_count: self.contracts.plan.len(),
                contract_batch: Some(self.contracts.digest.clone()),
            },
        )
        .await;

        // ── Phase loop ───────────────────────────────────────────────
        while self.current_phase < self.contracts.plan.len() {
            if self.cancel.is_cancelled() {
                return Ok(Terminal::Cancelled);
            }
            let Some(phase) = self.contracts.plan.get(self.current_phase).cloned() else {
                break;
            };

            self.runtime.store.set_phase(&self.build_id, phase.index)?;
            self.start_phase(&phase).await;

            let mut findings_history: Vec<Vec<AuditFinding>> = Vec::new();
            loop {
                let outcome = self.run_phase_conversation(&phase).await?;
                let report = match outcome {
                    ConvOutcome::Cancelled => return Ok(Terminal::Cancelled),
                    ConvOutcome::CostCap { projected, cap } => {
                        match self.pause_cost_cap(projected, cap).await? {
                            GateWait::Resume => continue,
                            GateWait::Skip => {
                                self.advance_past_current_phase().await?;
                                break;
                            }
                            GateWait::Abort | GateWait::Cancelled => {
                                return Ok(Terminal::Cancelled);
                            }
                            GateWait::TimedOut => {
                                return Ok(Terminal::Failed(
                                    BuildError::PauseTimeout {
                                        minutes: self.runtime.settings.pause_timeout_minutes,
                                    }
                                    .to_string(),
                                ));
                            }
                        }
                    }
                    ConvOutcome::TimedOut => {
                        // Synthesized failure: the auditor is not consulted.
                        crate::auditor::AuditReport {
                            verdict: crate::auditor::AuditVerdict::Fail,
                            findings: vec![AuditFinding {
                                kind: "timeout".into(),
                                location: format!("phase {}", phase.index),
                                message: format!(
                                    "phase exceeded its {}-minute budget without sign-off",
                                    self.runtime.settings.phase_timeout_minutes
                                ),
                                blocking: true,
                            }],
                        }
                    }
                    ConvOutcome::SignedOff => {
                        let (report, usage) = self
                            .runtime
                            .auditor()
                            .audit(
                                &format!("{}: {}", phase.index, phase.name),
                                &self.contracts.summary(),
                                &self.workspace,
                                &self.conversation.accumulated_text,
                            )
                            .await?;
                        self.record_cost(
                            &format!("{} (audit)", phase.index),
                            &self.runtime.models.auditor.clone(),
                            usage.input_tokens,
                            usage.output_tokens,
                        );
                        report
                    }
                };

                if report.passed() {
                    self.emit(
                        LogSource::Audit,
                        LogLevel::Info,
                        BuildEvent::AuditPass {
                            build_id: self.build_id.clone(),
                            phase: phase.index,
                        },
                    )
                    .await;
                    self.seal_phase(&phase).await?;
                    break;
                }

                // ── FAIL path ────────────────────────────────────────
                self.loop_count += 1;
                findings_history.push(report.findings.clone());
                self.runtime
                    .store
                    .set_progress(&self.build_id, self.completed_phases, self.loop_count)?;
                self.emit(
                    LogSource::Audit,
                    LogLevel::Warn,
                    BuildEvent::AuditFail {
                        build_id: self.build_id.clone(),
                        phase: phase.index,
                        loop_count: self.loop_count,
                        findings: report.findings.clone(),
                    },
                )
                .await;

                if self.loop_count < self.runtime.settings.pause_threshold {
                    self.inject_recovery(&phase, &report.findings).await?;
                    continue;
                }

                // Threshold hit: pause on a phase_review gate.
                let payload = json!({
                    "phase": phase.index,
                    "rounds": findings_history,
                    "findings": report.findings,
                    "conversation_tail": self.tail_for_gate(),
                    "options": gate_options(),
                });
                match self.pause(GateKind::PhaseReview, payload).await? {
                    GateWait::Resume => {
                        self.loop_count = 0;
                        findings_history.clear();
                        self.runtime.store.set_progress(
                            &self.build_id,
                            self.completed_phases,
                            0,
                        )?;
                        continue;
                    }
                    GateWait::Skip => {
                        self.advance_past_current_phase().await?;
                        break;
                    }
                    GateWait::Abort | GateWait::Cancelled => return Ok(Terminal::Cancelled),
                    GateWait::TimedOut => {
                        return Ok(Terminal::Failed(
                            BuildError::PauseTimeout {
                                minutes: self.runtime.settings.pause_timeout_minutes,
                            }
                            .to_string(),
                        ));
                    }
                }
            }
        }

        // Remote targets push once, after the final phase.
        if matches!(self.target_kind, TargetKind::NewRemote | TargetKind::ExistingRemote) {
            self.push_with_gate().await?;
        }

        Ok(Terminal::Completed {
            phases: self.contracts.plan.len(),
        })
    }

    // ── Phase plumbing ───────────────────────────────────────────────

    async fn start_phase(&mut self, phase: &PhaseSpec) {
        self.conversation.reset_for_phase();
        self.conversation.push_user(format!(
            "## Phase {}: {}\n\n{}\n\nBegin with a `=== PLAN ===` block.",
            phase.index, phase.name, phase.instruction
        ));
        self.emit(
            LogSource::System,
            LogLevel::Info,
            BuildEvent::PhaseStart {
                build_id: self.build_id.clone(),
                phase: phase.index,
                name: phase.name.clone(),
            },
        )
        .await;
    }

    /// Audit passed: commit, bump progress, move on.
    async fn seal_phase(&mut self, phase: &PhaseSpec) -> Result<(), BuildError> {
        self.git.stage_all().await?;
        let message = format!("forge: Phase {} complete", phase.index);
        if self.git.commit(&message).await? {
            self.log(LogSource::Git, LogLevel::Info, &format!("committed {}", message))
                .await;
        }
        self.completed_phases = phase.index as i64;
        self.loop_count = 0;
        self.runtime
            .store
            .set_progress(&self.build_id, self.completed_phases, 0)?;
        self.current_phase += 1;
        Ok(())
    }

    /// A user-directed skip: advancement without a passing audit event.
    async fn advance_past_current_phase(&mut self) -> Result<(), BuildError> {
        self.log(
            LogSource::System,
            LogLevel::Warn,
            &format!("phase {} skipped by user", self.current_phase),
        )
        .await;
        self.completed_phases = self.current_phase as i64;
        self.loop_count = 0;
        self.runtime
            .store
            .set_progress(&self.build_id, self.completed_phases, 0)?;
        self.current_phase += 1;
        Ok(())
    }

    async fn inject_recovery(
        &mut self,
        phase: &PhaseSpec,
        findings: &[AuditFinding],
    ) -> Result<(), BuildError> {
        let state = workspace_snapshot(&self.workspace);
        let planned = self
            .runtime
            .planner()
            .plan(
                &phase.name,
                &self.contracts.summary(),
                &state,
                findings,
                &self.conversation.accumulated_text,
            )
            .await;

        let message = match planned {
            Ok((maybe_plan, usage)) => {
                self.record_cost(
                    &format!("{} (planner)", phase.index),
                    &self.runtime.models.planner.clone(),
                    usage.input_tokens,
                    usage.output_tokens,
                );
                match maybe_plan {
                    Some(plan) => {
                        self.emit(
                            LogSource::Planner,
                            LogLevel::Info,
                            BuildEvent::RecoveryPlan {
                                build_id: self.build_id.clone(),
                                phase: phase.index,
                                steps: plan.steps.clone(),
                            },
                        )
                        .await;
                        plan.as_message()
                    }
                    None => crate::planner::GENERIC_RECOVERY_MESSAGE.to_string(),
                }
            }
            Err(e) => {
                self.log(
                    LogSource::Planner,
                    LogLevel::Warn,
                    &format!("recovery planner failed: {}", e),
                )
                .await;
                crate::planner::GENERIC_RECOVERY_MESSAGE.to_string()
            }
        };

        let findings_text = findings
            .iter()
            .map(|f| format!("- [{}] {}: {}", f.kind, f.location, f.message))
            .collect::<Vec<_>>()
            .join("\n");
        self.conversation.push(Turn {
            message: ChatMessage::user(format!(
                "The phase audit FAILED.\n\nFindings:\n{}\n\n{}",
                findings_text, message
            )),
            kind: TurnKind::AuditFinding,
        });
        Ok(())
    }

    // ── Conversation loop ────────────────────────────────────────────

    async fn run_phase_conversation(
        &mut self,
        phase: &PhaseSpec,
    ) -> Result<ConvOutcome, BuildError> {
        let deadline = Instant::now() + self.runtime.settings.phase_timeout();

        loop {
            if self.cancel.is_cancelled() {
                return Ok(ConvOutcome::Cancelled);
            }

            if let Some(interjection) = drain_interjections(&mut self.channels.interject_rx) {
                self.emit(
                    LogSource::User,
                    LogLevel::Info,
                    BuildEvent::BuildInterjection {
                        build_id: self.build_id.clone(),
                        message: interjection.clone(),
                    },
                )
                .await;
                self.conversation.push_user(interjection);
            }

            let builder_model = self.runtime.models.builder.clone();
            if compaction::should_compact(&self.conversation, &builder_model) {
                if let Some(stats) = compaction::compact(&mut self.conversation) {
                    self.emit(
                        LogSource::System,
                        LogLevel::Info,
                        BuildEvent::Compacted {
                            build_id: self.build_id.clone(),
                            dropped_turns: stats.dropped_turns,
                            summary_bytes: stats.summary_bytes,
                        },
                    )
                    .await;
                }
            }

            match self.accountant.check_before_turn() {
                CapCheck::Exceeded { projected, cap } => {
                    return Ok(ConvOutcome::CostCap { projected, cap });
                }
                CapCheck::Warn { spent, cap } => {
                    self.log(
                        LogSource::System,
                        LogLevel::Warn,
                        &format!("spend at ${:.4} of ${:.2} cap", spent, cap),
                    )
                    .await;
                }
                CapCheck::Proceed => {}
            }

            let request = TurnRequest {
                system: format!(
                    "{}\n\n## Pinned contracts\n{}",
                    self.conversation.preamble,
                    self.contracts.summary()
                ),
                messages: self.conversation.messages(),
                tools: tool_specs(),
                model: builder_model.clone(),
                max_tokens: BUILDER_MAX_TOKENS,
            };
            let rx = self.stream_with_retry(request).await?;

            let turn = self.consume_turn(rx, phase).await?;
            match turn {
                TurnEnd::Cancelled => return Ok(ConvOutcome::Cancelled),
                TurnEnd::Finished {
                    text,
                    had_tool_calls,
                } => {
                    let parsed = signals::parse(&text);
                    self.apply_signals(&parsed, phase).await;
                    self.conversation.accumulated_text.push_str(&text);

                    if parsed.sign_off {
                        return Ok(ConvOutcome::SignedOff);
                    }
                    if Instant::now() > deadline {
                        return Ok(ConvOutcome::TimedOut);
                    }
                    if !had_tool_calls {
                        self.conversation.push_user(
                            "Continue working. When every deliverable exists and tests pass, \
                             output `=== PHASE SIGN-OFF: PASS ===`.",
                        );
                    }
                }
            }
        }
    }

    /// Act on plan/task/file signals parsed out of one turn's text.
    async fn apply_signals(&mut self, parsed: &signals::ParsedSignals, phase: &PhaseSpec) {
        if !parsed.plan.is_empty() {
            self.conversation.task_plan.set(parsed.plan.clone());
            self.emit(
                LogSource::Builder,
                LogLevel::Info,
                BuildEvent::PhasePlan {
                    build_id: self.build_id.clone(),
                    phase: phase.index,
                    tasks: parsed.plan.clone(),
                },
            )
            .await;
        }
        for &n in &parsed.tasks_done {
            if self.conversation.task_plan.mark_done(n) {
                self.emit(
                    LogSource::Builder,
                    LogLevel::Info,
                    BuildEvent::TaskComplete {
                        build_id: self.build_id.clone(),
                        phase: phase.index,
                        task_index: n,
                    },
                )
                .await;
            }
        }
        for warning in &parsed.warnings {
            self.log(LogSource::Builder, LogLevel::Warn, warning).await;
        }
        // Inline file blocks ride the same write path as the tool.
        for block in &parsed.files {
            let outcome = self
                .executor
                .dispatch(crate::tools::ToolRequest::WriteFile {
                    path: block.path.clone(),
                    content: block.content.clone(),
                })
                .await;
            self.emit_tool_events("write_file", &block.path, &outcome).await;
        }
    }

    async fn emit_tool_events(
        &mut self,
        tool: &str,
        summary: &str,
        outcome: &crate::tools::ToolOutcome,
    ) {
        self.emit(
            LogSource::Tool,
            if outcome.ok { LogLevel::Info } else { LogLevel::Warn },
            BuildEvent::ToolUse {
                build_id: self.build_id.clone(),
                tool: tool.to_string(),
                summary: summary.to_string(),
                ok: outcome.ok,
            },
        )
        .await;

        match &outcome.side_effect {
            Some(ToolSideEffect::FileWritten { path, bytes, created }) => {
                self.conversation.files_written.insert(path.clone());
                if *bytes > self.runtime.settings.large_file_warn_bytes {
                    self.log(
                        LogSource::Tool,
                        LogLevel::Warn,
                        &format!("large file written: {} ({} bytes)", path, bytes),
                    )
                    .await;
                }
                let event = if *created {
                    BuildEvent::FileCreated {
                        build_id: self.build_id.clone(),
                        path: path.clone(),
                        bytes: *bytes,
                    }
                } else {
                    BuildEvent::FileModified {
                        build_id: self.build_id.clone(),
                        path: path.clone(),
                        bytes: *bytes,
                    }
                };
                self.emit(LogSource::Tool, LogLevel::Info, event).await;
            }
            Some(ToolSideEffect::TestRun {
                command,
                exit_code,
                passed,
                failed,
            }) => {
                self.emit(
                    LogSource::Test,
                    LogLevel::Info,
                    BuildEvent::TestRun {
                        build_id: self.build_id.clone(),
                        command: command.clone(),
                        exit_code: *exit_code,
                        passed: *passed,
                        failed: *failed,
                    },
                )
                .await;
            }
            None => {}
        }
    }

    // ── Stream consumption ───────────────────────────────────────────

    async fn stream_with_retry(&self, request: TurnRequest) -> Result<ChunkReceiver, BuildError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.runtime.llm.stream_turn(request.clone()).await {
                Ok(rx) => return Ok(rx),
                Err(err) if err.is_retryable() && attempt < LLM_CONNECT_RETRIES => {
                    self.log(
                        LogSource::System,
                        LogLevel::Warn,
                        &format!("provider error (attempt {}): {}", attempt, err),
                    )
                    .await;
                    tokio::time::sleep(Duration::from_secs(1 << attempt.min(4))).await;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    async fn consume_turn(
        &mut self,
        mut rx: ChunkReceiver,
        phase: &PhaseSpec,
    ) -> Result<TurnEnd, BuildError> {
        let mut turn_text = String::new();
        let mut pending_text = String::new();
        let mut open_tools: std::collections::HashMap<String, (String, String)> =
            std::collections::HashMap::new();
        let mut had_tool_calls = false;

        loop {
            let chunk = tokio::select! {
                chunk = rx.recv() => chunk,
                _ = self.cancel.cancelled() => return Ok(TurnEnd::Cancelled),
            };
            let Some(chunk) = chunk else {
                // Channel closed without a stop: treat as provider truncation.
                return Err(LlmError::TruncatedStream.into());
            };
            match chunk? {
                StreamChunk::Text { delta } => {
                    turn_text.push_str(&delta);
                    pending_text.push_str(&delta);
                }
                StreamChunk::ToolUseStart { id, name } => {
                    open_tools.insert(id, (name, String::new()));
                }
                StreamChunk::ToolUseInputDelta { id, json } => {
                    if let Some((_, buf)) = open_tools.get_mut(&id) {
                        buf.push_str(&json);
                    }
                }
                StreamChunk::ToolUseStop { id } => {
                    let Some((name, input_json)) = open_tools.remove(&id) else {
                        continue;
                    };
                    had_tool_calls = true;
                    let input: serde_json::Value = if input_json.trim().is_empty() {
                        json!({})
                    } else {
                        serde_json::from_str(&input_json).unwrap_or(json!({}))
                    };

                    // Text streamed so far becomes the assistant turn that
                    // carries this call.
                    self.conversation.push(Turn::normal(ChatMessage {
                        role: crate::llm::MsgRole::Assistant,
                        content: std::mem::take(&mut pending_text),
                        tool_use_id: Some(id.clone()),
                        tool_name: Some(name.clone()),
                        tool_input: Some(input.clone()),
                    }));

                    // Dispatch under the cancel flag: a cancel here drops the
                    // future and kills the subprocess.
                    let outcome = tokio::select! {
                        outcome = self.executor.dispatch_raw(&name, &input) => outcome,
                        _ = self.cancel.cancelled() => return Ok(TurnEnd::Cancelled),
                    };
                    let summary = crate::tools::ToolRequest::parse(&name, &input)
                        .map(|r| r.summary())
                        .unwrap_or_else(|_| input.to_string());
                    self.emit_tool_events(&name, &summary, &outcome).await;
                    self.conversation.push(Turn::normal(ChatMessage::tool_result(
                        id,
                        outcome.render(),
                    )));
                }
                StreamChunk::Usage {
                    input_tokens,
                    output_tokens,
                } => {
                    let model = self.runtime.models.builder.clone();
                    self.record_cost(&phase.index.to_string(), &model, input_tokens, output_tokens);
                }
                StreamChunk::Stop { .. } => break,
            }
        }

        if !pending_text.trim().is_empty() {
            let kind = if signals::parse(&pending_text).sign_off {
                TurnKind::SignOff
            } else {
                TurnKind::Normal
            };
            self.conversation.push(Turn {
                message: ChatMessage::assistant(std::mem::take(&mut pending_text)),
                kind,
            });
        }
        if !turn_text.trim().is_empty() {
            let mut preview = turn_text.trim().to_string();
            if preview.len() > 500 {
                preview.truncate(500);
                preview.push_str("...");
            }
            self.log(LogSource::Builder, LogLevel::Info, &preview).await;
        }

        Ok(TurnEnd::Finished {
            text: turn_text,
            had_tool_calls,
        })
    }

    fn record_cost(&mut self, phase: &str, model: &str, input_tokens: u64, output_tokens: u64) {
        let entry = self.accountant.record(phase, model, input_tokens, output_tokens);
        if let Err(e) = self.runtime.store.append_cost(
            &self.build_id,
            &entry.phase,
            &entry.model,
            entry.input_tokens,
            entry.output_tokens,
            entry.usd,
        ) {
            tracing::error!(build_id = %self.build_id, error = %e, "cost row append failed");
        }
    }

    // ── Pause gates ──────────────────────────────────────────────────

    fn tail_for_gate(&self) -> serde_json::Value {
        let turns = &self.conversation.turns;
        let start = turns.len().saturating_sub(GATE_TAIL_TURNS);
        serde_json::to_value(&turns[start..]).unwrap_or(serde_json::Value::Null)
    }

    async fn pause_cost_cap(&mut self, projected: f64, cap: f64) -> Result<GateWait, BuildError> {
        let payload = json!({
            "projected_usd": projected,
            "cap_usd": cap,
            "spent_usd": self.accountant.total_usd(),
            "conversation_tail": self.tail_for_gate(),
            "options": gate_options(),
        });
        self.pause(GateKind::CostCap, payload).await
    }

    /// Persist the gate, broadcast the pause, and block until the user
    /// resolves it, the pause window expires, or the build is cancelled.
    async fn pause(
        &mut self,
        kind: GateKind,
        payload: serde_json::Value,
    ) -> Result<GateWait, BuildError> {
        let gate = PendingGate {
            kind,
            payload: payload.clone(),
            registered_at: chrono::Utc::now(),
        };
        self.runtime.store.set_gate(&self.build_id, &gate)?;
        self.set_status(BuildStatus::Paused, None);
        self.emit(
            LogSource::System,
            LogLevel::Warn,
            BuildEvent::BuildPaused {
                build_id: self.build_id.clone(),
                gate: kind.as_str().to_string(),
                payload,
                options: gate_options(),
            },
        )
        .await;
        self.wait_on_gate(gate).await
    }

    async fn wait_on_gate(&mut self, gate: PendingGate) -> Result<GateWait, BuildError> {
        // The watchdog window counts from registration, surviving restarts.
        let elapsed = (chrono::Utc::now() - gate.registered_at)
            .to_std()
            .unwrap_or_default();
        let window = self.runtime.settings.pause_timeout();
        let remaining = window.saturating_sub(elapsed);

        let resolution = tokio::select! {
            res = tokio::time::timeout(remaining, self.channels.gate_rx.recv()) => res,
            _ = self.cancel.cancelled() => return Ok(GateWait::Cancelled),
        };

        let resolution: GateResolution = match resolution {
            Err(_) => return Ok(GateWait::TimedOut),
            Ok(None) => return Ok(GateWait::Cancelled),
            Ok(Some(res)) => res,
        };

        self.runtime.store.clear_gate(&self.build_id)?;
        self.set_status(BuildStatus::Running, None);
        self.emit(
            LogSource::User,
            LogLevel::Info,
            BuildEvent::BuildResumed {
                build_id: self.build_id.clone(),
                action: match resolution.action {
                    ResumeAction::Retry => "retry",
                    ResumeAction::RetryWithMessage => "retry_with_message",
                    ResumeAction::SkipPhase => "skip_phase",
                    ResumeAction::Abort => "abort",
                }
                .to_string(),
            },
        )
        .await;

        match resolution.action {
            ResumeAction::Retry => {
                self.conversation
                    .push_user("Retry the phase and address the audit findings.");
                Ok(GateWait::Resume)
            }
            ResumeAction::RetryWithMessage => {
                let guidance = resolution.message.unwrap_or_default();
                self.conversation.push_user(format!(
                    "Retry the phase. Additional guidance from the user:\n{}",
                    guidance
                ));
                Ok(GateWait::Resume)
            }
            ResumeAction::SkipPhase => Ok(GateWait::Skip),
            ResumeAction::Abort => Ok(GateWait::Abort),
        }
    }

    /// Push after the final phase; failures pause on a clarification gate.
    async fn push_with_gate(&mut self) -> Result<(), BuildError> {
        loop {
            match self
                .git
                .push("origin", "main", self.runtime.settings.git_push_max_retries)
                .await
            {
                Ok(()) => {
                    self.log(LogSource::Git, LogLevel::Info, "pushed to origin/main")
                        .await;
                    return Ok(());
                }
                Err(err) => {
                    let payload = json!({
                        "error": err.to_string(),
                        "conversation_tail": self.tail_for_gate(),
                        "options": gate_options(),
                    });
                    match self.pause(GateKind::Clarification, payload).await? {
                        GateWait::Resume => continue,
                        GateWait::Skip => {
                            self.log(
                                LogSource::Git,
                                LogLevel::Warn,
                                "push skipped by user; commits remain local",
                            )
                            .await;
                            return Ok(());
                        }
                        GateWait::Abort | GateWait::Cancelled => {
                            return Err(BuildError::Cancelled);
                        }
                        GateWait::TimedOut => {
                            return Err(BuildError::PauseTimeout {
                                minutes: self.runtime.settings.pause_timeout_minutes,
                            });
                        }
                    }
                }
            }
        }
    }
}

enum TurnEnd {
    Finished { text: String, had_tool_calls: bool },
    Cancelled,
}
