//! The build runtime: owns every running driver task, the shared clients,
//! and the startup scan that recovers builds a dead process left behind.
//!
//! The orchestrator is the single owner of build state; the control surface
//! and HTTP collaborators only ever talk to it through [`BuildRuntime`].

mod driver;
pub mod gate;

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::auditor::InlineAuditor;
use crate::broadcast::Broadcaster;
use crate::config::Settings;
use crate::errors::BuildError;
use crate::events::BuildEvent;
use crate::llm::{LlmClient, ModelRoles};
use crate::models::{Build, BuildStatus, LogLevel, LogSource, ResumeAction};
use crate::planner::RecoveryPlanner;
use crate::store::BuildStore;
use crate::workspace::Workspace;

use driver::BuildDriver;
use gate::{BuildControls, GateResolution, build_channels};

struct RunningBuild {
    controls: BuildControls,
    user_id: i64,
    task: JoinHandle<()>,
}

pub struct BuildRuntime {
    pub settings: Settings,
    pub store: Arc<BuildStore>,
    pub broadcaster: Arc<Broadcaster>,
    pub llm: Arc<dyn LlmClient>,
    pub models: ModelRoles,
    pub http: reqwest::Client,
    handles: Mutex<HashMap<String, RunningBuild>>,
}

impl BuildRuntime {
    pub fn new(settings: Settings, store: Arc<BuildStore>, llm: Arc<dyn LlmClient>) -> Arc<Self> {
        let broadcaster = Arc::new(Broadcaster::new(store.clone()));
        let models = ModelRoles {
            builder: settings.llm_builder_model.clone(),
            planner: settings.llm_planner_model.clone(),
            auditor: settings.llm_auditor_model.clone(),
        };
        Arc::new(Self {
            settings,
            store,
            broadcaster,
            llm,
            models,
            http: reqwest::Client::new(),
            handles: Mutex::new(HashMap::new()),
        })
    }

    pub(crate) fn auditor(&self) -> InlineAuditor {
        InlineAuditor::new(self.llm.clone(), self.models.auditor.clone())
    }

    pub(crate) fn planner(&self) -> RecoveryPlanner {
        RecoveryPlanner::new(self.llm.clone(), self.models.planner.clone())
    }

    /// Spawn the driver task for a build row that already exists in the
    /// store. The workspace directory must exist.
    pub async fn spawn_build(self: &Arc<Self>, build: Build) -> Result<(), BuildError> {
        let workspace = Workspace::create(std::path::Path::new(&build.working_dir))
            .map_err(|e| BuildError::Other(anyhow::anyhow!("workspace setup failed: {}", e)))?;

        let (controls, channels) = build_channels();
        let driver = BuildDriver::new(
            self.clone(),
            &build,
            workspace,
            controls.cancel.clone(),
            channels,
        );

        let task = tokio::spawn(driver.run());
        self.handles.lock().await.insert(
            build.id.clone(),
            RunningBuild {
                controls,
                user_id: build.user_id,
                task,
            },
        );
        Ok(())
    }

    pub(crate) async fn release_handle(&self, build_id: &str) {
        self.handles.lock().await.remove(build_id);
    }

    pub async fn is_live(&self, build_id: &str) -> bool {
        self.handles.lock().await.contains_key(build_id)
    }

    /// Cancel a build. Cooperative by default: the driver observes the flag
    /// at its next safe point. Force aborts the driver task outright, which
    /// drops any in-flight tool subprocess (they die with the future) and
    /// skips cleanup hooks.
    pub async fn cancel_build(&self, build_id: &str, force: bool) -> Result<(), BuildError> {
        let build = self
            .store
            .get(build_id)?
            .ok_or_else(|| BuildError::NotFound(build_id.to_string()))?;
        if build.status.is_terminal() {
            return Err(BuildError::BadRequest(format!(
                "build is already {}",
                build.status.as_str()
            )));
        }
        let handle = self.handles.lock().await.remove(build_id);
        match handle {
            Some(running) => {
                running.controls.cancel.cancel(force);
                if force {
                    running.task.abort();
                    self.store
                        .update_status(build_id, BuildStatus::Cancelled, None)?;
                    self.broadcaster
                        .emit(
                            running.user_id,
                            build_id,
                            LogSource::System,
                            LogLevel::Info,
                            &BuildEvent::BuildCancelled {
                                build_id: build_id.to_string(),
                            },
                        )
                        .await;
                } else {
                    // The driver still owns the transition; keep the handle
                    // so resume/interject error cleanly until it exits.
                    self.handles
                        .lock()
                        .await
                        .insert(build_id.to_string(), running);
                }
                Ok(())
            }
            None => {
                // No live driver (e.g. pre-rehydration): the runtime owns it.
                self.store
                    .update_status(build_id, BuildStatus::Cancelled, None)?;
                Ok(())
            }
        }
    }

    /// Resolve a pause gate. Only paused builds accept a resume.
    pub async fn resume_build(
        &self,
        build_id: &str,
        action: ResumeAction,
        message: Option<String>,
    ) -> Result<(), BuildError> {
        let build = self
            .store
            .get(build_id)?
            .ok_or_else(|| BuildError::NotFound(build_id.to_string()))?;
        if build.status != BuildStatus::Paused {
            return Err(BuildError::BadRequest(format!(
                "build is {}, not paused",
                build.status.as_str()
            )));
        }
        if action == ResumeAction::RetryWithMessage && message.is_none() {
            return Err(BuildError::BadRequest(
                "retry_with_message requires a message".to_string(),
            ));
        }
        let handles = self.handles.lock().await;
        let running = handles
            .get(build_id)
            .ok_or_else(|| BuildError::NotFound(format!("no live driver for {}", build_id)))?;
        running
            .controls
            .gate_tx
            .send(GateResolution { action, message })
            .await
            .map_err(|_| BuildError::BadRequest("driver is shutting down".to_string()))?;
        Ok(())
    }

    /// Queue a live interjection. Paused builds reject it (the gate is the
    /// channel for paused builds).
    pub async fn interject(&self, build_id: &str, message: String) -> Result<(), BuildError> {
        let build = self
            .store
            .get(build_id)?
            .ok_or_else(|| BuildError::NotFound(build_id.to_string()))?;
        if build.status != BuildStatus::Running {
            return Err(BuildError::BadRequest(format!(
                "interjection requires a running build (status is {})",
                build.status.as_str()
            )));
        }
        let handles = self.handles.lock().await;
        let running = handles
            .get(build_id)
            .ok_or_else(|| BuildError::NotFound(format!("no live driver for {}", build_id)))?;
        running
            .controls
            .interject_tx
            .send(message)
            .await
            .map_err(|_| BuildError::BadRequest("driver is shutting down".to_string()))?;
        Ok(())
    }

    /// Recover builds a previous process left behind: paused builds with a
    /// persisted gate get a fresh driver blocked on that gate; anything else
    /// non-terminal is orphaned.
    pub async fn startup_scan(self: &Arc<Self>) -> Result<(), BuildError> {
        for build in self.store.find_unfinished()? {
            if self.is_live(&build.id).await {
                continue;
            }
            if build.status == BuildStatus::Paused && build.pending_gate.is_some() {
                tracing::info!(build_id = %build.id, "rehydrating paused build");
                self.spawn_build(build).await?;
            } else {
                tracing::warn!(build_id = %build.id, "orphaned by restart");
                self.store.update_status(
                    &build.id,
                    BuildStatus::Failed,
                    Some("orphaned by restart"),
                )?;
                self.broadcaster
                    .emit_line(
                        build.user_id,
                        &build.id,
                        LogSource::System,
                        LogLevel::Error,
                        "OrphanBuild: orphaned by restart",
                    )
                    .await;
            }
        }
        Ok(())
    }
}
