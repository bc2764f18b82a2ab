//! Engine configuration.

use crate::retry::BackoffPolicy;
use conveyor_core::approval::ApprovalPolicy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Settings shared by every run of an engine. Immutable once the engine starts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum jobs executing at once across all runs.
    #[serde(default = "default_max_parallel_jobs")]
    pub max_parallel_jobs: usize,
    /// Job timeout when neither the job nor the pipeline sets one.
    #[serde(default = "default_job_timeout")]
    pub default_job_timeout_minutes: u32,
    /// Delay between retry attempts.
    #[serde(default)]
    pub backoff: BackoffPolicy,
    /// Root directory for per-job workspaces.
    #[serde(default = "default_workspace_root")]
    pub workspace_root: PathBuf,
    /// Lines of output kept on failed jobs.
    #[serde(default = "default_log_tail")]
    pub log_tail_lines: usize,
    /// How long to wait for a quality gate verdict.
    #[serde(default = "default_quality_gate_timeout")]
    pub quality_gate_timeout_secs: u64,
    /// Approval policy for manual jobs without an environment policy.
    #[serde(default)]
    pub approval: ApprovalPolicy,
}

fn default_max_parallel_jobs() -> usize {
    4
}

fn default_job_timeout() -> u32 {
    60
}

fn default_workspace_root() -> PathBuf {
    std::env::temp_dir().join("conveyor")
}

fn default_log_tail() -> usize {
    50
}

fn default_quality_gate_timeout() -> u64 {
    600
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_parallel_jobs: default_max_parallel_jobs(),
            default_job_timeout_minutes: default_job_timeout(),
            backoff: BackoffPolicy::default(),
            workspace_root: default_workspace_root(),
            log_tail_lines: default_log_tail(),
            quality_gate_timeout_secs: default_quality_gate_timeout(),
            approval: ApprovalPolicy::default(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a YAML file.
    pub fn from_file(path: &Path) -> conveyor_core::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&contents)?)
    }

    pub fn with_workspace_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.workspace_root = root.into();
        self
    }

    pub fn with_max_parallel_jobs(mut self, max: usize) -> Self {
        self.max_parallel_jobs = max;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn quality_gate_timeout(&self) -> Duration {
        Duration::from_secs(self.quality_gate_timeout_secs)
    }
}
