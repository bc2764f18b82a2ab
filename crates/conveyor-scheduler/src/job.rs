//! Execution of a single job inside a run.
//!
//! A job task waits for its approval gate, then its environment token, then
//! an executor permit, and only then runs attempts. Tokens and permits are
//! guards owned by the task, so aborting the task releases them.

use crate::approval::wait_for_decision;
use crate::engine::Services;
use crate::environments::TokenHolder;
use crate::plan::PlannedJob;
use chrono::Utc;
use conveyor_core::approval::{ApprovalGate, ApprovalStatus};
use conveyor_core::context::slugify;
use conveyor_core::events::{Event, JobRetryingPayload};
use conveyor_core::ids::{ApprovalToken, ArtifactHandle, RunId};
use conveyor_core::interpolation::InterpolationContext;
use conveyor_core::ports::{
    ArtifactUpload, ExecutionOutcome, ExecutionRequest, QualityGateRequest, QualityVerdict,
};
use conveyor_core::run::{AttemptRecord, JobStatus};
use conveyor_core::{Error, FailureClass, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Progress reported by a job task to its run loop.
#[derive(Debug, Clone)]
pub(crate) enum JobUpdate {
    WaitingForApproval(ApprovalToken),
    Approved,
    WaitingForResource,
    Running { attempt: u32 },
    AttemptFinished(AttemptRecord),
}

#[derive(Debug, Clone)]
pub(crate) struct JobMessage {
    pub job: String,
    pub update: JobUpdate,
}

/// Terminal result of a job task.
#[derive(Debug, Clone)]
pub(crate) struct JobOutcome {
    pub job: String,
    pub status: JobStatus,
    pub failure: Option<FailureClass>,
    pub reason: Option<String>,
    pub artifacts: Option<ArtifactHandle>,
    pub log_tail: Vec<String>,
}

impl JobOutcome {
    fn succeeded(job: String, artifacts: Option<ArtifactHandle>, log_tail: Vec<String>) -> Self {
        Self {
            job,
            status: JobStatus::Succeeded,
            failure: None,
            reason: None,
            artifacts,
            log_tail,
        }
    }

    fn failed(job: String, failure: FailureClass, reason: String, log_tail: Vec<String>) -> Self {
        Self {
            job,
            status: JobStatus::Failed,
            failure: Some(failure),
            reason: Some(reason),
            artifacts: None,
            log_tail,
        }
    }

    fn canceled(job: String, reason: String) -> Self {
        Self {
            job,
            status: JobStatus::Canceled,
            failure: None,
            reason: Some(reason),
            artifacts: None,
            log_tail: Vec::new(),
        }
    }
}

/// Everything a job task owns.
pub(crate) struct JobTask {
    pub run_id: RunId,
    pub project: String,
    pub sha: String,
    pub actor: Option<String>,
    pub planned: PlannedJob,
    pub timeout: Duration,
    /// Artifacts of dependencies to extract before the first attempt.
    pub inputs: Vec<ArtifactHandle>,
    pub services: Arc<Services>,
    pub updates: mpsc::UnboundedSender<JobMessage>,
}

impl JobTask {
    fn name(&self) -> &str {
        &self.planned.job.name
    }

    fn send(&self, update: JobUpdate) {
        // The run loop outlives every job task it spawned.
        let _ = self.updates.send(JobMessage {
            job: self.name().to_string(),
            update,
        });
    }

    pub async fn run(self) -> JobOutcome {
        let name = self.name().to_string();

        if self.planned.is_manual()
            && let Err(reason) = self.await_approval().await
        {
            return JobOutcome::canceled(name, reason);
        }

        let _token = match &self.planned.resource_key {
            Some(key) => {
                self.send(JobUpdate::WaitingForResource);
                let holder = TokenHolder {
                    run_id: self.run_id,
                    job: name.clone(),
                };
                Some(self.services.locks.acquire(key, holder).await)
            }
            None => None,
        };

        let Ok(_permit) = self.services.permits.clone().acquire_owned().await else {
            return JobOutcome::canceled(name, "executor shut down".to_string());
        };

        let workspace = self.workspace();
        let outcome = match self.run_attempts(&workspace).await {
            Ok(outcome) => outcome,
            Err(failed) => return failed,
        };
        let log_tail = outcome.tail(self.services.config.log_tail_lines);

        if let Err(e) = self.check_quality_gate(&workspace).await {
            let class = e.failure_class().unwrap_or(FailureClass::QualityGateFailure);
            warn!(job = %name, error = %e, "Quality gate did not pass");
            return JobOutcome::failed(name, class, e.to_string(), log_tail);
        }

        let artifacts = self.store_artifacts(&workspace).await;
        JobOutcome::succeeded(name, artifacts, log_tail)
    }

    /// Wait for a decision on this job's gate. There is no timeout.
    async fn await_approval(&self) -> std::result::Result<(), String> {
        let gate = ApprovalGate::new(self.run_id, self.name(), self.planned.approval.clone())
            .with_environment(self.planned.environment.as_ref().map(|e| e.name.clone()))
            .with_triggered_by(self.actor.clone());
        let (token, decision) = self.services.approvals.request(gate).await;
        self.send(JobUpdate::WaitingForApproval(token));

        match wait_for_decision(decision).await {
            ApprovalStatus::Approved => {
                self.send(JobUpdate::Approved);
                Ok(())
            }
            ApprovalStatus::Rejected => {
                let who = self
                    .services
                    .approvals
                    .get(token)
                    .and_then(|g| g.decision)
                    .map(|d| d.user)
                    .unwrap_or_default();
                Err(format!("approval rejected by {who}"))
            }
            ApprovalStatus::Canceled | ApprovalStatus::Pending => {
                Err("approval gate canceled".to_string())
            }
        }
    }

    fn workspace(&self) -> PathBuf {
        self.services
            .config
            .workspace_root
            .join(self.run_id.to_string())
            .join(slugify(self.name()))
    }

    /// Recreate the workspace from scratch and extract input artifacts.
    async fn prepare_workspace(&self, workspace: &Path) -> Result<()> {
        match tokio::fs::remove_dir_all(workspace).await {
            Ok(()) => debug!(job = %self.name(), "Cleared previous attempt workspace"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        tokio::fs::create_dir_all(workspace).await?;
        for handle in &self.inputs {
            let files = self
                .services
                .artifacts
                .get(*handle, workspace)
                .await
                .map_err(|e| Error::DependencyUnsatisfied(format!("artifact {handle}: {e}")))?;
            debug!(job = %self.name(), artifact = %handle, files = files.len(), "Artifacts extracted");
        }
        Ok(())
    }

    fn request(&self, attempt: u32, workspace: &Path) -> ExecutionRequest {
        let interpolation = InterpolationContext::with_variables(self.planned.variables.clone());
        let job = &self.planned.job;
        ExecutionRequest {
            run_id: self.run_id,
            job: job.name.clone(),
            attempt,
            image: job.image.as_deref().map(|image| interpolation.interpolate(image)),
            commands: job.commands(),
            env: self.planned.variables.clone(),
            workspace: workspace.to_path_buf(),
            cache: job.cache.clone(),
            resources: job.resources.clone(),
            timeout: self.timeout,
        }
    }

    async fn attempt(&self, request: &ExecutionRequest) -> Result<ExecutionOutcome> {
        match tokio::time::timeout(request.timeout, self.services.runtime.execute(request)).await {
            Ok(result) => result,
            Err(_) => Err(Error::JobTimeout {
                seconds: request.timeout.as_secs(),
            }),
        }
    }

    /// Run attempts until one succeeds or the retry policy gives up.
    async fn run_attempts(&self, workspace: &Path) -> std::result::Result<ExecutionOutcome, JobOutcome> {
        let policy = &self.planned.job.retry;
        let tail_lines = self.services.config.log_tail_lines;
        let mut attempt = 0;

        loop {
            attempt += 1;
            // Every attempt starts from a fresh workspace.
            if let Err(e) = self.prepare_workspace(workspace).await {
                error!(job = %self.name(), attempt, error = %e, "Failed to prepare workspace");
                let class = e.failure_class().unwrap_or(FailureClass::RunnerSystemFailure);
                return Err(JobOutcome::failed(
                    self.name().to_string(),
                    class,
                    e.to_string(),
                    Vec::new(),
                ));
            }
            self.send(JobUpdate::Running { attempt });
            info!(run_id = %self.run_id, job = %self.name(), attempt, "Starting attempt");

            let request = self.request(attempt, workspace);
            let started_at = Utc::now();
            let result = self.attempt(&request).await;

            let (err, exit_code, log_tail) = match result {
                Ok(outcome) if outcome.success() => {
                    self.send(JobUpdate::AttemptFinished(AttemptRecord {
                        number: attempt,
                        started_at,
                        finished_at: Some(Utc::now()),
                        exit_code: Some(outcome.exit_code),
                        failure: None,
                        error: None,
                    }));
                    return Ok(outcome);
                }
                Ok(outcome) => (
                    Error::ScriptFailed {
                        exit_code: outcome.exit_code,
                    },
                    Some(outcome.exit_code),
                    outcome.tail(tail_lines),
                ),
                Err(e) => (e, None, Vec::new()),
            };

            let class = err.failure_class().unwrap_or(FailureClass::RunnerSystemFailure);
            self.send(JobUpdate::AttemptFinished(AttemptRecord {
                number: attempt,
                started_at,
                finished_at: Some(Utc::now()),
                exit_code,
                failure: Some(class),
                error: Some(err.to_string()),
            }));

            if !policy.should_retry(class, attempt) {
                warn!(job = %self.name(), attempt, failure = ?class, error = %err, "Job failed");
                return Err(JobOutcome::failed(
                    self.name().to_string(),
                    class,
                    err.to_string(),
                    log_tail,
                ));
            }

            let delay = self.services.config.backoff.delay_for_retry(attempt - 1);
            info!(
                job = %self.name(),
                attempt,
                failure = ?class,
                delay_ms = delay.as_millis() as u64,
                "Retrying job"
            );
            let event = Event::JobRetrying(JobRetryingPayload {
                run_id: self.run_id,
                job: self.name().to_string(),
                failed_attempt: attempt,
                failure: class,
                delay_ms: delay.as_millis() as u64,
            });
            if let Err(e) = self.services.event_bus.publish(event).await {
                warn!(error = %e, "Failed to publish retry event");
            }
            tokio::time::sleep(delay).await;
        }
    }

    async fn check_quality_gate(&self, workspace: &Path) -> Result<()> {
        let Some(spec) = &self.planned.job.quality_gate else {
            return Ok(());
        };
        let Some(gate) = &self.services.quality_gate else {
            warn!(job = %self.name(), "Job declares a quality gate but none is configured");
            return Ok(());
        };

        let request = QualityGateRequest {
            run_id: self.run_id,
            job: self.name().to_string(),
            project: self.project.clone(),
            sha: self.sha.clone(),
            sources: spec.sources.clone(),
            coverage_report: spec.coverage_report.as_ref().map(|r| workspace.join(r)),
        };
        let timeout = self.services.config.quality_gate_timeout();
        match tokio::time::timeout(timeout, gate.submit(&request)).await {
            Ok(Ok(QualityVerdict::Pass)) => Ok(()),
            Ok(Ok(QualityVerdict::Fail { reason })) => Err(Error::QualityGateFailed(reason)),
            Ok(Ok(QualityVerdict::Timeout)) | Err(_) => Err(Error::QualityGateTimeout),
            Ok(Err(e)) => Err(Error::QualityGateFailed(e.to_string())),
        }
    }

    /// Store declared artifacts. A storage failure does not fail the job;
    /// dependents that need the archive are blocked instead.
    async fn store_artifacts(&self, workspace: &Path) -> Option<ArtifactHandle> {
        let spec = self.planned.job.artifacts.as_ref()?;
        let upload = ArtifactUpload {
            run_id: self.run_id,
            job: self.name().to_string(),
            name: spec.name.clone(),
            paths: spec.paths.clone(),
            workspace: workspace.to_path_buf(),
            expire_in: Duration::from_secs(u64::from(spec.expire_in_days) * 24 * 60 * 60),
        };
        match self.services.artifacts.put(&upload).await {
            Ok(handle) => {
                info!(job = %self.name(), artifact = %handle, "Artifacts stored");
                Some(handle)
            }
            Err(e) => {
                warn!(job = %self.name(), error = %e, "Failed to store artifacts");
                None
            }
        }
    }
}
