//! Git operations for a build's workspace.
//!
//! Everything shells out to `git` in the workspace root. Pushes retry with
//! exponential backoff and jitter; auth failures and invalid refs fail fast.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use serde_json::json;
use tokio::process::Command;

use crate::errors::BuildError;
use crate::models::TargetKind;

/// Push backoff base delay.
const PUSH_BASE_DELAY: Duration = Duration::from_secs(1);
/// Push backoff ceiling.
const PUSH_MAX_DELAY: Duration = Duration::from_secs(30);
/// Jitter factor: delay * (0.5 .. 1.5).
const PUSH_JITTER: f64 = 0.5;

/// Where a build's commits go.
#[derive(Debug, Clone)]
pub struct GitTarget {
    pub kind: TargetKind,
    /// Repo name (`owner/name` or bare name) for remote targets; unused for
    /// local ones.
    pub repo: String,
    pub private: bool,
}

pub struct GitClient {
    workdir: std::path::PathBuf,
    github_token: Option<String>,
    http: reqwest::Client,
}

impl GitClient {
    pub fn new(workdir: &Path, github_token: Option<String>, http: reqwest::Client) -> Self {
        Self {
            workdir: workdir.to_path_buf(),
            github_token,
            http,
        }
    }

    async fn git(&self, args: &[&str]) -> Result<String, BuildError> {
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| BuildError::Git(format!("failed to spawn git: {}", e)))?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            Err(BuildError::Git(format!(
                "git {} failed: {}",
                args.first().unwrap_or(&""),
                stderr
            )))
        }
    }

    /// Prepare the workspace for the target: clone an existing remote, or
    /// `git init` for new-remote and local targets. Identity is set locally
    /// so commits work on bare CI hosts.
    pub async fn init_or_clone(&self, target: &GitTarget) -> Result<(), BuildError> {
        match target.kind {
            TargetKind::ExistingRemote => {
                let url = self.remote_url(&target.repo);
                self.git(&["clone", &url, "."]).await?;
            }
            TargetKind::NewRemote | TargetKind::Local => {
                if !self.workdir.join(".git").exists() {
                    self.git(&["init", "--initial-branch", "main"]).await?;
                }
            }
        }
        self.git(&["config", "user.name", "forgeguard"]).await?;
        self.git(&["config", "user.email", "forgeguard@localhost"])
            .await?;
        Ok(())
    }

    pub async fn stage_all(&self) -> Result<(), BuildError> {
        self.git(&["add", "-A"]).await?;
        Ok(())
    }

    /// Commit staged changes. A clean tree is not an error; returns false
    /// when there was nothing to commit.
    pub async fn commit(&self, message: &str) -> Result<bool, BuildError> {
        let status = self.git(&["status", "--porcelain"]).await?;
        if status.is_empty() {
            return Ok(false);
        }
        self.git(&["commit", "-m", message]).await?;
        Ok(true)
    }

    pub async fn head_sha(&self) -> Result<Option<String>, BuildError> {
        match self.git(&["rev-parse", "HEAD"]).await {
            Ok(sha) => Ok(Some(sha)),
            Err(_) => Ok(None), // unborn branch
        }
    }

    /// Push with retries. Exponential backoff (base 1 s, cap 30 s) with
    /// jitter; auth and ref errors are not retried.
    pub async fn push(&self, remote: &str, branch: &str, retries: u32) -> Result<(), BuildError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.git(&["push", "-u", remote, branch]).await {
                Ok(_) => return Ok(()),
                Err(err) => {
                    let msg = err.to_string();
                    if is_non_retryable_push_error(&msg) {
                        return Err(err);
                    }
                    if attempt >= retries {
                        return Err(BuildError::Git(format!(
                            "push failed after {} attempts: {}",
                            attempt, msg
                        )));
                    }
                    tokio::time::sleep(push_backoff_delay(attempt)).await;
                }
            }
        }
    }

    /// Create a GitHub repository (or reuse it if it already exists) and
    /// register it as `origin`.
    pub async fn create_remote_repo(&self, name: &str, private: bool) -> Result<String, BuildError> {
        let token = self
            .github_token
            .as_deref()
            .ok_or_else(|| BuildError::Git("no GitHub token configured".to_string()))?;

        let response = self
            .http
            .post("https://api.github.com/user/repos")
            .bearer_auth(token)
            .header("User-Agent", "forgeguard")
            .header("Accept", "application/vnd.github+json")
            .json(&json!({ "name": name, "private": private, "auto_init": false }))
            .send()
            .await
            .map_err(|e| BuildError::Git(format!("GitHub API error: {}", e)))?;

        let status = response.status();
        // 422 means the repo already exists for this user; reuse it.
        if !status.is_success() && status.as_u16() != 422 {
            let body = response.text().await.unwrap_or_default();
            return Err(BuildError::Git(format!(
                "GitHub repo creation failed ({}): {}",
                status, body
            )));
        }

        let clone_url = if status.is_success() {
            response
                .json::<serde_json::Value>()
                .await
                .ok()
                .and_then(|v| v.get("clone_url").and_then(|u| u.as_str()).map(String::from))
                .unwrap_or_else(|| format!("https://github.com/{}.git", name))
        } else {
            format!("https://github.com/{}.git", name)
        };

        // (Re)point origin at the repo.
        let _ = self.git(&["remote", "remove", "origin"]).await;
        self.git(&["remote", "add", "origin", &clone_url]).await?;
        Ok(clone_url)
    }

    fn remote_url(&self, repo: &str) -> String {
        match &self.github_token {
            Some(token) => format!("https://x-access-token:{}@github.com/{}.git", token, repo),
            None => format!("https://github.com/{}.git", repo),
        }
    }
}

/// Backoff for push attempt N (1-indexed): base * 2^(N-1), capped, jittered.
fn push_backoff_delay(attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(16);
    let raw = PUSH_BASE_DELAY.saturating_mul(2_u32.saturating_pow(exp));
    apply_jitter(raw.min(PUSH_MAX_DELAY), PUSH_JITTER)
}

fn apply_jitter(delay: Duration, jitter: f64) -> Duration {
    use rand::Rng;
    let factor = 1.0 - jitter + rand::thread_rng().gen_range(0.0..(2.0 * jitter));
    delay.mul_f64(factor)
}

fn is_non_retryable_push_error(message: &str) -> bool {
    let lowered = message.to_lowercase();
    lowered.contains("authentication failed")
        || lowered.contains("permission denied")
        || lowered.contains("could not read username")
        || lowered.contains("invalid refspec")
        || lowered.contains("src refspec")
        || lowered.contains("repository not found")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(dir: &Path) -> GitClient {
        GitClient::new(dir, None, reqwest::Client::new())
    }

    #[tokio::test]
    async fn init_creates_repo_and_identity() {
        let dir = tempfile::tempdir().unwrap();
        let git = client(dir.path());
        let target = GitTarget {
            kind: TargetKind::Local,
            repo: String::new(),
            private: true,
        };
        git.init_or_clone(&target).await.unwrap();
        assert!(dir.path().join(".git").exists());
        let name = git.git(&["config", "user.name"]).await.unwrap();
        assert_eq!(name, "forgeguard");
    }

    #[tokio::test]
    async fn init_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let git = client(dir.path());
        let target = GitTarget {
            kind: TargetKind::Local,
            repo: String::new(),
            private: true,
        };
        git.init_or_clone(&target).await.unwrap();
        git.init_or_clone(&target).await.unwrap();
        assert!(dir.path().join(".git").exists());
    }

    #[tokio::test]
    async fn commit_snapshot_and_head() {
        let dir = tempfile::tempdir().unwrap();
        let git = client(dir.path());
        let target = GitTarget {
            kind: TargetKind::Local,
            repo: String::new(),
            private: true,
        };
        git.init_or_clone(&target).await.unwrap();
        assert!(git.head_sha().await.unwrap().is_none());

        std::fs::write(dir.path().join("main.txt"), "ok").unwrap();
        git.stage_all().await.unwrap();
        let committed = git.commit("forge: Phase 0 complete").await.unwrap();
        assert!(committed);

        let sha = git.head_sha().await.unwrap().unwrap();
        assert_eq!(sha.len(), 40);

        let log = git.git(&["log", "--oneline"]).await.unwrap();
        assert!(log.contains("forge: Phase 0 complete"));
    }

    #[tokio::test]
    async fn commit_clean_tree_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let git = client(dir.path());
        let target = GitTarget {
            kind: TargetKind::Local,
            repo: String::new(),
            private: true,
        };
        git.init_or_clone(&target).await.unwrap();
        let committed = git.commit("nothing").await.unwrap();
        assert!(!committed);
    }

    #[tokio::test]
    async fn push_to_missing_remote_exhausts_retries_quickly() {
        let dir = tempfile::tempdir().unwrap();
        let git = client(dir.path());
        let target = GitTarget {
            kind: TargetKind::Local,
            repo: String::new(),
            private: true,
        };
        git.init_or_clone(&target).await.unwrap();
        std::fs::write(dir.path().join("f"), "x").unwrap();
        git.stage_all().await.unwrap();
        git.commit("c").await.unwrap();
        // No origin configured: "fatal: 'origin' does not appear to be a git
        // repository" is retryable by classification, so cap retries at 1.
        let err = git.push("origin", "main", 1).await.unwrap_err();
        assert_eq!(err.kind(), "GitError");
    }

    #[test]
    fn backoff_grows_and_caps() {
        // Jitter is ±50%, so compare against the bounds.
        let d1 = push_backoff_delay(1);
        assert!(d1 >= Duration::from_millis(500) && d1 <= Duration::from_millis(1500));
        let d3 = push_backoff_delay(3);
        assert!(d3 >= Duration::from_secs(2) && d3 <= Duration::from_secs(6));
        let d10 = push_backoff_delay(10);
        assert!(d10 <= Duration::from_secs(45));
    }

    #[test]
    fn non_retryable_classification() {
        assert!(is_non_retryable_push_error("fatal: Authentication failed for repo"));
        assert!(is_non_retryable_push_error("ERROR: Permission denied (publickey)"));
        assert!(is_non_retryable_push_error("error: src refspec main does not match any"));
        assert!(!is_non_retryable_push_error("fatal: unable to access: timed out"));
        assert!(!is_non_retryable_push_error("remote hung up unexpectedly"));
    }
}
