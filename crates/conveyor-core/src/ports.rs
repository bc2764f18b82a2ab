//! Port traits (hexagonal architecture).
//!
//! These traits define the interfaces between the engine and its external
//! collaborators: job runtimes, artifact storage, notification channels,
//! quality gates and the event bus.

use crate::events::Event;
use crate::ids::{ArtifactHandle, NotificationId, RunId};
use crate::pipeline::{CacheSpec, ResourceRequirements};
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::Stream;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::time::Duration;

/// Stream of events.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<Event>> + Send>>;

/// Event bus for publishing and subscribing to events.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Publish an event.
    async fn publish(&self, event: Event) -> Result<()>;

    /// Subscribe to events matching a pattern.
    /// Pattern supports wildcards: `run.*.job.*.failed`, `deployment.>`
    async fn subscribe(&self, pattern: &str) -> Result<EventStream>;
}

/// What a runtime needs to execute one attempt of a job.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub run_id: RunId,
    pub job: String,
    pub attempt: u32,
    pub image: Option<String>,
    pub commands: Vec<String>,
    pub env: HashMap<String, String>,
    pub workspace: PathBuf,
    pub cache: Option<CacheSpec>,
    pub resources: Option<ResourceRequirements>,
    pub timeout: Duration,
}

/// Result of a script that ran to completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionOutcome {
    pub exit_code: i32,
    pub duration: Duration,
    pub log: Vec<String>,
}

impl ExecutionOutcome {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// The last `lines` lines of output.
    pub fn tail(&self, lines: usize) -> Vec<String> {
        let start = self.log.len().saturating_sub(lines);
        self.log[start..].to_vec()
    }
}

/// Executes job scripts.
///
/// A runtime returns `Ok` whenever the script ran, whatever its exit code.
/// Failing to provision the environment is `Error::RuntimeProvision`.
#[async_trait]
pub trait JobRuntime: Send + Sync {
    fn name(&self) -> &str;

    async fn execute(&self, request: &ExecutionRequest) -> Result<ExecutionOutcome>;
}

/// Files a job hands to later jobs.
#[derive(Debug, Clone)]
pub struct ArtifactUpload {
    pub run_id: RunId,
    pub job: String,
    pub name: Option<String>,
    pub paths: Vec<String>,
    pub workspace: PathBuf,
    pub expire_in: Duration,
}

/// Stores job artifacts between jobs of a run.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    async fn put(&self, upload: &ArtifactUpload) -> Result<ArtifactHandle>;

    /// Extract an artifact into `dest` and return the extracted files.
    async fn get(&self, handle: ArtifactHandle, dest: &Path) -> Result<Vec<PathBuf>>;

    /// False once the artifact expired or was never stored.
    async fn exists(&self, handle: ArtifactHandle) -> Result<bool>;

    /// Remove expired artifacts, returning how many were removed.
    async fn purge_expired(&self) -> Result<usize>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Normal,
    High,
    Critical,
}

/// Payload handed to notification channels.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Notification {
    pub id: NotificationId,
    pub run_id: RunId,
    pub pipeline: String,
    pub project: String,
    pub ref_name: String,
    pub job: Option<String>,
    pub environment: Option<String>,
    pub url: Option<String>,
    /// Outcome keyword (`failed`, `blocked`, `succeeded`, ...).
    pub outcome: String,
    pub title: String,
    pub message: String,
    pub priority: Priority,
    #[serde(default)]
    pub fields: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
}

/// An external alert sink.
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    fn name(&self) -> &str;

    async fn send(&self, notification: &Notification) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QualityGateRequest {
    pub run_id: RunId,
    pub job: String,
    pub project: String,
    pub sha: String,
    pub sources: Vec<String>,
    pub coverage_report: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum QualityVerdict {
    Pass,
    Fail { reason: String },
    Timeout,
}

/// External static analysis / coverage gate.
#[async_trait]
pub trait QualityGate: Send + Sync {
    async fn submit(&self, request: &QualityGateRequest) -> Result<QualityVerdict>;
}
