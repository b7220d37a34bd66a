//! The control surface HTTP collaborators call into: start, cancel, resume,
//! interject, and the status/log/summary queries. Rate limits are enforced
//! here, before any build row exists.

use std::sync::Arc;

use chrono::{Duration, Utc};
use serde::Deserialize;
use uuid::Uuid;

use crate::errors::BuildError;
use crate::models::{
    Build, BuildLogRow, BuildStatus, BuildSummary, ResumeAction, TargetKind,
};
use crate::orchestrator::BuildRuntime;

#[derive(Debug, Clone, Deserialize)]
pub struct StartBuildRequest {
    pub project_id: i64,
    pub user_id: i64,
    pub target_kind: TargetKind,
    /// Repo name for remote targets, absolute path for local ones.
    pub target_ref: String,
    /// Which stored credential pair the build should draw on.
    #[serde(default)]
    pub api_key_ref: Option<String>,
    #[serde(default)]
    pub build_mode: Option<String>,
    /// Overrides the default user spend cap when set.
    #[serde(default)]
    pub spend_cap_usd: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResumeRequest {
    pub action: String,
    #[serde(default)]
    pub message: Option<String>,
}

pub struct BuildService {
    runtime: Arc<BuildRuntime>,
}

impl BuildService {
    pub fn new(runtime: Arc<BuildRuntime>) -> Self {
        Self { runtime }
    }

    pub fn runtime(&self) -> &Arc<BuildRuntime> {
        &self.runtime
    }

    /// Validate, rate-limit, create the build row, and hand it to the
    /// orchestrator. Returns the new build id.
    pub async fn start_build(&self, req: StartBuildRequest) -> Result<String, BuildError> {
        let settings = &self.runtime.settings;
        let store = &self.runtime.store;

        if req.target_ref.trim().is_empty() {
            return Err(BuildError::BadRequest("target_ref must not be empty".into()));
        }
        if req.target_kind == TargetKind::Local && !req.target_ref.starts_with('/') {
            return Err(BuildError::BadRequest(
                "local targets require an absolute path".into(),
            ));
        }

        let hour_ago = Utc::now() - Duration::hours(1);
        if store.count_builds_since(req.user_id, hour_ago)? >= settings.hourly_builds_per_user {
            return Err(BuildError::RateLimited(format!(
                "at most {} builds per hour",
                settings.hourly_builds_per_user
            )));
        }
        if store.count_active_for_user(req.user_id)? >= settings.concurrent_builds_per_user {
            return Err(BuildError::RateLimited(
                "a build is already active for this user".into(),
            ));
        }
        if store.count_active_for_project(req.project_id)? > 0 {
            return Err(BuildError::RateLimited(
                "a build is already active for this project".into(),
            ));
        }

        let build_id = Uuid::new_v4().to_string();
        let working_dir = match req.target_kind {
            TargetKind::Local => req.target_ref.clone(),
            _ => settings
                .workspace_root
                .join(&build_id)
                .to_string_lossy()
                .to_string(),
        };

        let build = Build {
            id: build_id.clone(),
            project_id: req.project_id,
            user_id: req.user_id,
            status: BuildStatus::Pending,
            target_kind: req.target_kind,
            target_ref: req.target_ref,
            working_dir,
            current_phase: 0,
            completed_phases: -1,
            loop_count: 0,
            contract_batch: None,
            spend_cap_usd: req
                .spend_cap_usd
                .unwrap_or(settings.default_spend_cap_usd),
            pending_gate: None,
            paused_at: None,
            error_detail: None,
            created_at: Utc::now(),
            completed_at: None,
        };
        store.create(&build)?;
        self.runtime.spawn_build(build).await?;
        Ok(build_id)
    }

    pub async fn cancel_build(&self, build_id: &str, force: bool) -> Result<(), BuildError> {
        self.runtime.cancel_build(build_id, force).await
    }

    pub async fn resume_build(&self, build_id: &str, req: ResumeRequest) -> Result<(), BuildError> {
        let action = ResumeAction::from_str(&req.action).map_err(BuildError::BadRequest)?;
        self.runtime
            .resume_build(build_id, action, req.message)
            .await
    }

    pub async fn interject(&self, build_id: &str, message: String) -> Result<(), BuildError> {
        if message.trim().is_empty() {
            return Err(BuildError::BadRequest("interjection must not be empty".into()));
        }
        self.runtime.interject(build_id, message).await
    }

    pub fn status(&self, build_id: &str) -> Result<Build, BuildError> {
        self.runtime
            .store
            .get(build_id)?
            .ok_or_else(|| BuildError::NotFound(build_id.to_string()))
    }

    pub fn logs(
        &self,
        build_id: &str,
        after_ts: Option<chrono::DateTime<Utc>>,
        limit: u32,
    ) -> Result<Vec<BuildLogRow>, BuildError> {
        Ok(self.runtime.store.list_logs(build_id, after_ts, limit)?)
    }

    pub fn summary(&self, build_id: &str) -> Result<BuildSummary, BuildError> {
        self.runtime
            .store
            .summary(build_id)?
            .ok_or_else(|| BuildError::NotFound(build_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::llm::MockLlm;
    use crate::store::BuildStore;

    fn service(settings: Settings) -> (BuildService, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = settings;
        settings.workspace_root = dir.path().join("workspaces");
        let store = Arc::new(BuildStore::open_in_memory().unwrap());
        let llm = Arc::new(MockLlm::new(vec![]));
        let runtime = BuildRuntime::new(settings, store, llm);
        (BuildService::new(runtime), dir)
    }

    fn local_request(dir: &std::path::Path, project_id: i64, user_id: i64) -> StartBuildRequest {
        StartBuildRequest {
            project_id,
            user_id,
            target_kind: TargetKind::Local,
            target_ref: dir.display().to_string(),
            api_key_ref: None,
            build_mode: None,
            spend_cap_usd: None,
        }
    }

    #[tokio::test]
    async fn start_build_rejects_empty_target() {
        let (svc, _dir) = service(Settings::default());
        let mut req = local_request(std::path::Path::new("/tmp/x"), 1, 1);
        req.target_ref = "".into();
        let err = svc.start_build(req).await.unwrap_err();
        assert_eq!(err.kind(), "BadRequest");
    }

    #[tokio::test]
    async fn start_build_rejects_relative_local_path() {
        let (svc, _dir) = service(Settings::default());
        let mut req = local_request(std::path::Path::new("/tmp/x"), 1, 1);
        req.target_ref = "relative/path".into();
        let err = svc.start_build(req).await.unwrap_err();
        assert_eq!(err.kind(), "BadRequest");
    }

    #[tokio::test]
    async fn one_concurrent_build_per_project() {
        let (svc, dir) = service(Settings::default());
        let target = dir.path().join("t1");
        std::fs::create_dir_all(&target).unwrap();

        let id = svc
            .start_build(local_request(&target, 1, 1))
            .await
            .unwrap();
        assert!(!id.is_empty());

        // Second start on the same project while the first is active.
        let err = svc
            .start_build(local_request(&target, 1, 2))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "RateLimited");
    }

    #[tokio::test]
    async fn hourly_limit_enforced() {
        let (svc, dir) = service(Settings::default());
        // Seed 5 builds this hour for user 9 directly in the store; all
        // terminal so the concurrency limits stay out of the way.
        for i in 0..5 {
            let b = Build {
                id: format!("seed-{}", i),
                project_id: 100 + i,
                user_id: 9,
                status: BuildStatus::Completed,
                target_kind: TargetKind::Local,
                target_ref: "/tmp/seed".into(),
                working_dir: "/tmp/seed".into(),
                current_phase: 0,
                completed_phases: 0,
                loop_count: 0,
                contract_batch: None,
                spend_cap_usd: 10.0,
                pending_gate: None,
                paused_at: None,
                error_detail: None,
                created_at: Utc::now(),
                completed_at: Some(Utc::now()),
            };
            svc.runtime.store.create(&b).unwrap();
        }
        let target = dir.path().join("t2");
        std::fs::create_dir_all(&target).unwrap();
        let err = svc
            .start_build(local_request(&target, 200, 9))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "RateLimited");
    }

    #[tokio::test]
    async fn status_unknown_build_is_not_found() {
        let (svc, _dir) = service(Settings::default());
        assert_eq!(svc.status("nope").unwrap_err().kind(), "NotFound");
        assert_eq!(svc.summary("nope").unwrap_err().kind(), "NotFound");
    }

    #[tokio::test]
    async fn resume_requires_paused() {
        let (svc, _dir) = service(Settings::default());
        let b = Build {
            id: "running-1".into(),
            project_id: 3,
            user_id: 3,
            status: BuildStatus::Pending,
            target_kind: TargetKind::Local,
            target_ref: "/tmp/t3".into(),
            working_dir: "/tmp/t3".into(),
            current_phase: 0,
            completed_phases: -1,
            loop_count: 0,
            contract_batch: None,
            spend_cap_usd: 10.0,
            pending_gate: None,
            paused_at: None,
            error_detail: None,
            created_at: Utc::now(),
            completed_at: None,
        };
        svc.runtime.store.create(&b).unwrap();
        svc.runtime
            .store
            .update_status("running-1", BuildStatus::Running, None)
            .unwrap();

        let err = svc
            .resume_build(
                "running-1",
                ResumeRequest {
                    action: "retry".into(),
                    message: None,
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "BadRequest");
    }

    #[tokio::test]
    async fn resume_rejects_unknown_action() {
        let (svc, _dir) = service(Settings::default());
        let err = svc
            .resume_build(
                "any",
                ResumeRequest {
                    action: "try_harder".into(),
                    message: None,
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "BadRequest");
    }

    #[tokio::test]
    async fn interject_rejects_empty_message() {
        let (svc, _dir) = service(Settings::default());
        let err = svc.interject("any", "   ".into()).await.unwrap_err();
        assert_eq!(err.kind(), "BadRequest");
    }
}
