use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

/// Runtime settings for ForgeGuard.
///
/// Values come from `forgeguard.toml` (if present), overridden by
/// `FORGEGUARD_*` environment variables. Provider credentials only ever come
/// from the environment.
#[derive(Debug, Clone)]
pub struct Settings {
    pub bind_addr: String,
    pub database_path: PathBuf,
    /// Parent directory under which per-build working directories are created.
    pub workspace_root: PathBuf,

    pub llm_builder_model: String,
    pub llm_planner_model: String,
    pub llm_auditor_model: String,

    /// Consecutive audit failures on one phase before the build pauses.
    pub pause_threshold: u32,
    pub pause_timeout_minutes: u64,
    pub phase_timeout_minutes: u64,

    /// Server-wide hard spend ceiling per build.
    pub max_cost_usd: f64,
    /// Default per-user spend cap when the user has not set one.
    pub default_spend_cap_usd: f64,

    pub concurrent_builds_per_user: u32,
    pub hourly_builds_per_user: u32,

    pub git_push_max_retries: u32,
    pub large_file_warn_bytes: u64,

    pub github_token: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8600".to_string(),
            database_path: PathBuf::from("forgeguard.db"),
            workspace_root: PathBuf::from("workspaces"),
            llm_builder_model: "claude-sonnet-4-5".to_string(),
            llm_planner_model: "claude-sonnet-4-5".to_string(),
            llm_auditor_model: "claude-sonnet-4-5".to_string(),
            pause_threshold: 3,
            pause_timeout_minutes: 30,
            phase_timeout_minutes: 10,
            max_cost_usd: 25.0,
            default_spend_cap_usd: 10.0,
            concurrent_builds_per_user: 1,
            hourly_builds_per_user: 5,
            git_push_max_retries: 3,
            large_file_warn_bytes: 512 * 1024,
            github_token: None,
        }
    }
}

/// Raw TOML structure for `forgeguard.toml`.
#[derive(Debug, Deserialize)]
struct SettingsToml {
    server: Option<ServerSection>,
    llm: Option<LlmSection>,
    build: Option<BuildSection>,
    limits: Option<LimitsSection>,
    git: Option<GitSection>,
}

#[derive(Debug, Deserialize)]
struct ServerSection {
    bind_addr: Option<String>,
    database_path: Option<PathBuf>,
    workspace_root: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
struct LlmSection {
    builder_model: Option<String>,
    planner_model: Option<String>,
    auditor_model: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BuildSection {
    pause_threshold: Option<u32>,
    pause_timeout_minutes: Option<u64>,
    phase_timeout_minutes: Option<u64>,
    max_cost_usd: Option<f64>,
    default_spend_cap_usd: Option<f64>,
    large_file_warn_bytes: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct LimitsSection {
    concurrent_builds_per_user: Option<u32>,
    hourly_builds_per_user: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct GitSection {
    push_max_retries: Option<u32>,
}

impl Settings {
    /// Load settings from `forgeguard.toml` under `dir`, then apply
    /// environment overrides. A missing file yields the defaults.
    pub fn load(dir: &Path) -> Result<Self> {
        let mut settings = Self::default();

        let config_path = dir.join("forgeguard.toml");
        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)
                .with_context(|| format!("Failed to read {}", config_path.display()))?;
            let toml: SettingsToml = toml::from_str(&content)
                .with_context(|| format!("Failed to parse {}", config_path.display()))?;
            settings.apply_toml(toml);
        }

        settings.apply_env(&std::env::vars().collect());
        settings.validate()?;
        Ok(settings)
    }

    fn apply_toml(&mut self, toml: SettingsToml) {
        if let Some(server) = toml.server {
            if let Some(v) = server.bind_addr {
                self.bind_addr = v;
            }
            if let Some(v) = server.database_path {
                self.database_path = v;
            }
            if let Some(v) = server.workspace_root {
                self.workspace_root = v;
            }
        }
        if let Some(llm) = toml.llm {
            if let Some(v) = llm.builder_model {
                self.llm_builder_model = v;
            }
            if let Some(v) = llm.planner_model {
                self.llm_planner_model = v;
            }
            if let Some(v) = llm.auditor_model {
                self.llm_auditor_model = v;
            }
        }
        if let Some(build) = toml.build {
            if let Some(v) = build.pause_threshold {
                self.pause_threshold = v;
            }
            if let Some(v) = build.pause_timeout_minutes {
                self.pause_timeout_minutes = v;
            }
            if let Some(v) = build.phase_timeout_minutes {
                self.phase_timeout_minutes = v;
            }
            if let Some(v) = build.max_cost_usd {
                self.max_cost_usd = v;
            }
            if let Some(v) = build.default_spend_cap_usd {
                self.default_spend_cap_usd = v;
            }
            if let Some(v) = build.large_file_warn_bytes {
                self.large_file_warn_bytes = v;
            }
        }
        if let Some(limits) = toml.limits {
            if let Some(v) = limits.concurrent_builds_per_user {
                self.concurrent_builds_per_user = v;
            }
            if let Some(v) = limits.hourly_builds_per_user {
                self.hourly_builds_per_user = v;
            }
        }
        if let Some(git) = toml.git {
            if let Some(v) = git.push_max_retries {
                self.git_push_max_retries = v;
            }
        }
    }

    /// Apply `FORGEGUARD_*` overrides from an environment map. Unparseable
    /// numeric values are ignored rather than failing startup.
    fn apply_env(&mut self, env: &HashMap<String, String>) {
        if let Some(v) = env.get("FORGEGUARD_BIND_ADDR") {
            self.bind_addr = v.clone();
        }
        if let Some(v) = env.get("FORGEGUARD_DATABASE_PATH") {
            self.database_path = PathBuf::from(v);
        }
        if let Some(v) = env.get("FORGEGUARD_WORKSPACE_ROOT") {
            self.workspace_root = PathBuf::from(v);
        }
        if let Some(v) = env.get("FORGEGUARD_BUILDER_MODEL") {
            self.llm_builder_model = v.clone();
        }
        if let Some(v) = env.get("FORGEGUARD_PLANNER_MODEL") {
            self.llm_planner_model = v.clone();
        }
        if let Some(v) = env.get("FORGEGUARD_AUDITOR_MODEL") {
            self.llm_auditor_model = v.clone();
        }
        if let Some(v) = env.get("FORGEGUARD_PAUSE_THRESHOLD").and_then(|v| v.parse().ok()) {
            self.pause_threshold = v;
        }
        if let Some(v) = env
            .get("FORGEGUARD_PAUSE_TIMEOUT_MINUTES")
            .and_then(|v| v.parse().ok())
        {
            self.pause_timeout_minutes = v;
        }
        if let Some(v) = env
            .get("FORGEGUARD_PHASE_TIMEOUT_MINUTES")
            .and_then(|v| v.parse().ok())
        {
            self.phase_timeout_minutes = v;
        }
        if let Some(v) = env.get("FORGEGUARD_MAX_COST_USD").and_then(|v| v.parse().ok()) {
            self.max_cost_usd = v;
        }
        if let Some(v) = env
            .get("FORGEGUARD_DEFAULT_SPEND_CAP_USD")
            .and_then(|v| v.parse().ok())
        {
            self.default_spend_cap_usd = v;
        }
        if let Some(v) = env.get("GITHUB_TOKEN") {
            self.github_token = Some(v.clone());
        }
    }

    fn validate(&self) -> Result<()> {
        if self.pause_threshold < 1 {
            anyhow::bail!("pause_threshold must be >= 1");
        }
        if self.max_cost_usd <= 0.0 {
            anyhow::bail!("max_cost_usd must be positive");
        }
        Ok(())
    }

    pub fn phase_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.phase_timeout_minutes * 60)
    }

    pub fn pause_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.pause_timeout_minutes * 60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn defaults_are_sane() {
        let s = Settings::default();
        assert_eq!(s.pause_threshold, 3);
        assert_eq!(s.pause_timeout_minutes, 30);
        assert_eq!(s.phase_timeout_minutes, 10);
        assert_eq!(s.hourly_builds_per_user, 5);
        assert_eq!(s.concurrent_builds_per_user, 1);
        assert_eq!(s.git_push_max_retries, 3);
    }

    #[test]
    fn load_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let s = Settings::load(dir.path()).unwrap();
        assert_eq!(s.pause_threshold, Settings::default().pause_threshold);
    }

    #[test]
    fn load_full_toml() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("forgeguard.toml"),
            r#"
[server]
bind_addr = "0.0.0.0:9000"

[llm]
builder_model = "gpt-4o"
auditor_model = "claude-opus-4-1"

[build]
pause_threshold = 5
max_cost_usd = 50.0

[limits]
hourly_builds_per_user = 10

[git]
push_max_retries = 6
"#,
        )
        .unwrap();

        let s = Settings::load(dir.path()).unwrap();
        assert_eq!(s.bind_addr, "0.0.0.0:9000");
        assert_eq!(s.llm_builder_model, "gpt-4o");
        assert_eq!(s.llm_auditor_model, "claude-opus-4-1");
        // planner untouched
        assert_eq!(s.llm_planner_model, Settings::default().llm_planner_model);
        assert_eq!(s.pause_threshold, 5);
        assert_eq!(s.max_cost_usd, 50.0);
        assert_eq!(s.hourly_builds_per_user, 10);
        assert_eq!(s.git_push_max_retries, 6);
    }

    #[test]
    fn load_partial_toml_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("forgeguard.toml"), "[build]\npause_threshold = 2\n").unwrap();
        let s = Settings::load(dir.path()).unwrap();
        assert_eq!(s.pause_threshold, 2);
        assert_eq!(s.max_cost_usd, Settings::default().max_cost_usd);
    }

    #[test]
    fn load_invalid_toml_errors() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("forgeguard.toml"), "not valid {{{{").unwrap();
        assert!(Settings::load(dir.path()).is_err());
    }

    #[test]
    fn env_overrides_apply() {
        let mut s = Settings::default();
        let mut env = HashMap::new();
        env.insert("FORGEGUARD_PAUSE_THRESHOLD".to_string(), "7".to_string());
        env.insert("FORGEGUARD_BUILDER_MODEL".to_string(), "gpt-4o-mini".to_string());
        env.insert("FORGEGUARD_MAX_COST_USD".to_string(), "3.5".to_string());
        s.apply_env(&env);
        assert_eq!(s.pause_threshold, 7);
        assert_eq!(s.llm_builder_model, "gpt-4o-mini");
        assert_eq!(s.max_cost_usd, 3.5);
    }

    #[test]
    fn env_override_ignores_garbage_numbers() {
        let mut s = Settings::default();
        let mut env = HashMap::new();
        env.insert("FORGEGUARD_PAUSE_THRESHOLD".to_string(), "lots".to_string());
        s.apply_env(&env);
        assert_eq!(s.pause_threshold, 3);
    }

    #[test]
    fn zero_pause_threshold_rejected() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("forgeguard.toml"), "[build]\npause_threshold = 0\n").unwrap();
        assert!(Settings::load(dir.path()).is_err());
    }
}
