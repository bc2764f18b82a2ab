//! Run and job state.

use crate::context::CommitContext;
use crate::environment::ResolvedEnvironment;
use crate::error::FailureClass;
use crate::ids::{ApprovalToken, ArtifactHandle, RunId};
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    WaitingForApproval,
    Approved,
    WaitingForResource,
    Running,
    Succeeded,
    Failed,
    Skipped,
    Canceled,
    /// A dependency ended in a blocking state, so this job never started.
    Blocked,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded
                | JobStatus::Failed
                | JobStatus::Skipped
                | JobStatus::Canceled
                | JobStatus::Blocked
        )
    }

    /// Legal forward transitions of the job state machine.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        match (self, next) {
            (current, _) if current.is_terminal() => false,
            (_, Canceled) => true,
            (Pending, WaitingForApproval | WaitingForResource | Running | Skipped | Blocked) => {
                true
            }
            (WaitingForApproval, Approved) => true,
            (Approved, WaitingForResource | Running) => true,
            (WaitingForResource, Running) => true,
            (Running, Succeeded | Failed | Running) => true,
            // A quality-gate or resource failure before start fails the job.
            (Pending | Approved | WaitingForResource, Failed) => true,
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::WaitingForApproval => "waiting_for_approval",
            JobStatus::Approved => "approved",
            JobStatus::WaitingForResource => "waiting_for_resource",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Skipped => "skipped",
            JobStatus::Canceled => "canceled",
            JobStatus::Blocked => "blocked",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Created,
    Running,
    Success,
    Failed,
    Canceled,
    Skipped,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Success | RunStatus::Failed | RunStatus::Canceled | RunStatus::Skipped
        )
    }

    pub fn is_success(&self) -> bool {
        matches!(self, RunStatus::Success | RunStatus::Skipped)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Created => "created",
            RunStatus::Running => "running",
            RunStatus::Success => "success",
            RunStatus::Failed => "failed",
            RunStatus::Canceled => "canceled",
            RunStatus::Skipped => "skipped",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One execution of a job script.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct AttemptRecord {
    pub number: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub failure: Option<FailureClass>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct JobRecord {
    pub name: String,
    pub stage: String,
    pub status: JobStatus,
    pub allow_failure: bool,
    pub variables: HashMap<String, String>,
    pub environment: Option<ResolvedEnvironment>,
    pub approval: Option<ApprovalToken>,
    pub attempts: Vec<AttemptRecord>,
    pub failure: Option<FailureClass>,
    /// Why the job was skipped, blocked or canceled.
    pub reason: Option<String>,
    pub artifacts: Option<ArtifactHandle>,
    /// Last lines of output from the final attempt.
    pub log_tail: Vec<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl JobRecord {
    pub fn new(name: impl Into<String>, stage: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            stage: stage.into(),
            status: JobStatus::Pending,
            allow_failure: false,
            variables: HashMap::new(),
            environment: None,
            approval: None,
            attempts: Vec::new(),
            failure: None,
            reason: None,
            artifacts: None,
            log_tail: Vec::new(),
            started_at: None,
            finished_at: None,
        }
    }

    /// Failed and not allowed to fail, or blocked on an unsatisfied dependency.
    pub fn is_blocking_failure(&self) -> bool {
        match self.status {
            JobStatus::Failed => !self.allow_failure,
            JobStatus::Blocked => self.failure == Some(FailureClass::DependencyUnsatisfied),
            _ => false,
        }
    }

    pub fn duration_ms(&self) -> Option<u64> {
        let started = self.started_at?;
        let finished = self.finished_at?;
        u64::try_from((finished - started).num_milliseconds()).ok()
    }
}

/// A pipeline instantiated for one commit.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct PipelineRun {
    pub id: RunId,
    pub pipeline: String,
    pub context: CommitContext,
    pub status: RunStatus,
    pub variables: HashMap<String, String>,
    pub stages: Vec<String>,
    pub jobs: Vec<JobRecord>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl PipelineRun {
    pub fn new(pipeline: impl Into<String>, context: CommitContext, stages: Vec<String>) -> Self {
        Self {
            id: RunId::new(),
            pipeline: pipeline.into(),
            context,
            status: RunStatus::Created,
            variables: HashMap::new(),
            stages,
            jobs: Vec::new(),
            created_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn job(&self, name: &str) -> Option<&JobRecord> {
        self.jobs.iter().find(|j| j.name == name)
    }

    pub fn job_mut(&mut self, name: &str) -> Option<&mut JobRecord> {
        self.jobs.iter_mut().find(|j| j.name == name)
    }

    /// Aggregate status once every job is terminal.
    ///
    /// Failed if a required job failed, else canceled if anything was
    /// canceled, else skipped if nothing ran, else success.
    pub fn aggregate_status(&self, canceled: bool) -> RunStatus {
        if self.jobs.iter().any(JobRecord::is_blocking_failure) {
            return RunStatus::Failed;
        }
        if canceled || self.jobs.iter().any(|j| j.status == JobStatus::Canceled) {
            return RunStatus::Canceled;
        }
        let anything_ran = self
            .jobs
            .iter()
            .any(|j| matches!(j.status, JobStatus::Succeeded | JobStatus::Failed));
        if !anything_ran {
            return RunStatus::Skipped;
        }
        RunStatus::Success
    }

    pub fn result(&self) -> PipelineResult {
        PipelineResult {
            run_id: self.id,
            status: self.status,
            jobs: self
                .jobs
                .iter()
                .map(|j| (j.name.clone(), j.status))
                .collect(),
            failed_jobs: self
                .jobs
                .iter()
                .filter(|j| j.status == JobStatus::Failed)
                .map(|j| j.name.clone())
                .collect(),
        }
    }
}

/// Summary returned when a run finishes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct PipelineResult {
    pub run_id: RunId,
    pub status: RunStatus,
    pub jobs: HashMap<String, JobStatus>,
    pub failed_jobs: Vec<String>,
}

impl PipelineResult {
    pub fn status_of(&self, job: &str) -> Option<JobStatus> {
        self.jobs.get(job).copied()
    }
}
