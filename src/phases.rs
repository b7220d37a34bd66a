//! Phase plans and pinned contracts.
//!
//! Governance files live under `Forge/Contracts/` in the build's working
//! directory. `phases.json` there defines the ordered phase plan; without
//! one the build runs a single catch-all phase. The full contract batch is
//! digested (sha256) and snapshotted so the build is pinned to what it read.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub const CONTRACTS_DIR: &str = "Forge/Contracts";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PhaseSpec {
    pub index: u32,
    pub name: String,
    pub instruction: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PhasePlan {
    pub phases: Vec<PhaseSpec>,
}

impl PhasePlan {
    pub fn len(&self) -> u32 {
        self.phases.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.phases.is_empty()
    }

    pub fn get(&self, index: u32) -> Option<&PhaseSpec> {
        self.phases.get(index as usize)
    }

    /// Single catch-all phase used when the contracts don't declare a plan.
    pub fn default_plan() -> Self {
        Self {
            phases: vec![PhaseSpec {
                index: 0,
                name: "build".to_string(),
                instruction: "Implement the project described by the contracts.".to_string(),
            }],
        }
    }

    fn parse(content: &str) -> Result<Self> {
        let mut plan: PhasePlan =
            serde_json::from_str(content).context("Failed to parse phases.json")?;
        if plan.phases.is_empty() {
            anyhow::bail!("phases.json declares no phases");
        }
        // Indices follow declaration order regardless of what the file says.
        for (i, phase) in plan.phases.iter_mut().enumerate() {
            phase.index = i as u32;
        }
        Ok(plan)
    }
}

/// Everything read from `Forge/Contracts/` at build start.
#[derive(Debug, Clone)]
pub struct ContractBatch {
    pub files: Vec<(String, String)>,
    pub digest: String,
    pub plan: PhasePlan,
}

impl ContractBatch {
    /// Placeholder used before the target checkout exists. Replaced by
    /// `load` once the workspace holds the target's tree.
    pub fn empty() -> Self {
        Self {
            files: Vec::new(),
            digest: String::new(),
            plan: PhasePlan::default_plan(),
        }
    }

    /// Load and pin the contracts under the working directory. Missing
    /// contracts are not an error: the batch is empty and the plan defaults.
    pub fn load(working_dir: &Path) -> Result<Self> {
        let dir = working_dir.join(CONTRACTS_DIR);
        let mut files: Vec<(String, String)> = Vec::new();
        if dir.is_dir() {
            for entry in walkdir::WalkDir::new(&dir)
                .sort_by_file_name()
                .into_iter()
                .filter_map(|e| e.ok())
            {
                if !entry.file_type().is_file() {
                    continue;
                }
                let rel = entry
                    .path()
                    .strip_prefix(working_dir)
                    .unwrap_or(entry.path())
                    .to_string_lossy()
                    .to_string();
                let content = std::fs::read_to_string(entry.path())
                    .with_context(|| format!("Failed to read contract {}", rel))?;
                files.push((rel, content));
            }
        }

        let mut hasher = Sha256::new();
        for (path, content) in &files {
            hasher.update(path.as_bytes());
            hasher.update([0]);
            hasher.update(content.as_bytes());
        }
        let digest = hex_digest(hasher.finalize().as_slice());

        let plan = files
            .iter()
            .find(|(path, _)| path.ends_with("phases.json"))
            .map(|(_, content)| PhasePlan::parse(content))
            .transpose()?
            .unwrap_or_else(PhasePlan::default_plan);

        Ok(Self {
            files,
            digest,
            plan,
        })
    }

    /// Contracts rendered for prompts, with a stable header per file.
    pub fn summary(&self) -> String {
        if self.files.is_empty() {
            return "(no contracts pinned)".to_string();
        }
        let mut out = String::new();
        for (path, content) in &self.files {
            out.push_str(&format!("--- {} ---\n{}\n", path, content));
        }
        out
    }
}

fn hex_digest(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn default_plan_is_single_phase() {
        let plan = PhasePlan::default_plan();
        assert_eq!(plan.len(), 1);
        assert_eq!(plan.get(0).unwrap().name, "build");
        assert!(plan.get(1).is_none());
    }

    #[test]
    fn load_without_contracts_dir() {
        let dir = tempfile::tempdir().unwrap();
        let batch = ContractBatch::load(dir.path()).unwrap();
        assert!(batch.files.is_empty());
        assert_eq!(batch.plan, PhasePlan::default_plan());
        assert_eq!(batch.summary(), "(no contracts pinned)");
        assert_eq!(batch.digest.len(), 64);
    }

    #[test]
    fn load_reads_files_and_plan() {
        let dir = tempfile::tempdir().unwrap();
        let contracts = dir.path().join(CONTRACTS_DIR);
        fs::create_dir_all(&contracts).unwrap();
        fs::write(contracts.join("rules.md"), "# no frameworks").unwrap();
        fs::write(
            contracts.join("phases.json"),
            r#"{"phases": [
                {"index": 9, "name": "scaffold", "instruction": "Set up the project."},
                {"index": 9, "name": "api", "instruction": "Build the API."}
            ]}"#,
        )
        .unwrap();

        let batch = ContractBatch::load(dir.path()).unwrap();
        assert_eq!(batch.files.len(), 2);
        assert_eq!(batch.plan.len(), 2);
        // declared indices are normalized to position
        assert_eq!(batch.plan.get(0).unwrap().index, 0);
        assert_eq!(batch.plan.get(1).unwrap().name, "api");
        assert!(batch.summary().contains("no frameworks"));
    }

    #[test]
    fn digest_is_stable_and_content_sensitive() {
        let dir = tempfile::tempdir().unwrap();
        let contracts = dir.path().join(CONTRACTS_DIR);
        fs::create_dir_all(&contracts).unwrap();
        fs::write(contracts.join("a.md"), "one").unwrap();

        let d1 = ContractBatch::load(dir.path()).unwrap().digest;
        let d2 = ContractBatch::load(dir.path()).unwrap().digest;
        assert_eq!(d1, d2);

        fs::write(contracts.join("a.md"), "two").unwrap();
        let d3 = ContractBatch::load(dir.path()).unwrap().digest;
        assert_ne!(d1, d3);
    }

    #[test]
    fn empty_phases_json_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let contracts = dir.path().join(CONTRACTS_DIR);
        fs::create_dir_all(&contracts).unwrap();
        fs::write(contracts.join("phases.json"), r#"{"phases": []}"#).unwrap();
        assert!(ContractBatch::load(dir.path()).is_err());
    }
}
