//! The per-run scheduler task.
//!
//! One task owns the [`PipelineRun`] record. Job tasks report progress over
//! a channel and their final outcome through a `JoinSet`; the loop applies
//! both, publishes events and starts whatever became ready.

use crate::approval::ApprovalRegistry;
use crate::dag::EdgeKind;
use crate::engine::Services;
use crate::job::{JobMessage, JobOutcome, JobTask, JobUpdate};
use crate::plan::RunPlan;
use chrono::Utc;
use conveyor_core::approval::ApprovalGate;
use conveyor_core::events::{
    DeploymentFinishedPayload, Event, JobStatusChangedPayload, RunCanceledPayload,
    RunCompletedPayload, RunCreatedPayload, StageCompletedPayload,
};
use conveyor_core::ids::{ArtifactHandle, RunId};
use conveyor_core::run::{JobRecord, JobStatus, PipelineResult, PipelineRun, RunStatus};
use conveyor_core::{Error, FailureClass, Result};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

/// Handle to a run started by the engine.
pub struct RunHandle {
    id: RunId,
    snapshot: watch::Receiver<PipelineRun>,
    cancel: watch::Sender<Option<String>>,
    approvals: Arc<ApprovalRegistry>,
    task: JoinHandle<PipelineRun>,
}

impl RunHandle {
    pub fn id(&self) -> RunId {
        self.id
    }

    /// Current state of the run.
    pub fn snapshot(&self) -> PipelineRun {
        self.snapshot.borrow().clone()
    }

    pub fn job_status(&self, job: &str) -> Option<JobStatus> {
        self.snapshot.borrow().job(job).map(|j| j.status)
    }

    /// Wait until the run state satisfies `condition`.
    pub async fn wait_for(&self, condition: impl FnMut(&PipelineRun) -> bool) -> Result<PipelineRun> {
        let mut snapshot = self.snapshot.clone();
        let run = snapshot
            .wait_for(condition)
            .await
            .map_err(|_| Error::Internal("run finished before the condition held".into()))?;
        Ok(run.clone())
    }

    /// Wait until `job` reaches `status`.
    pub async fn wait_for_job(&self, job: &str, status: JobStatus) -> Result<PipelineRun> {
        self.wait_for(|run| run.job(job).is_some_and(|j| j.status == status))
            .await
    }

    /// The pending gate of a manual job.
    pub fn approval_gate(&self, job: &str) -> Option<ApprovalGate> {
        let token = self.snapshot.borrow().job(job)?.approval?;
        self.approvals.get(token)
    }

    pub async fn approve(&self, job: &str, user: &str) -> Result<ApprovalGate> {
        let gate = self.gate_for(job)?;
        self.approvals.approve(gate.token, user, None).await
    }

    pub async fn reject(&self, job: &str, user: &str, comment: Option<String>) -> Result<ApprovalGate> {
        let gate = self.gate_for(job)?;
        self.approvals.reject(gate.token, user, comment).await
    }

    fn gate_for(&self, job: &str) -> Result<ApprovalGate> {
        self.approval_gate(job)
            .ok_or_else(|| Error::ApprovalNotFound(format!("no approval requested for job '{job}'")))
    }

    /// Cancel the run. Running jobs are aborted and held tokens released.
    pub fn cancel(&self, reason: impl Into<String>) {
        self.cancel.send_replace(Some(reason.into()));
    }

    /// Wait for the run to finish.
    pub async fn wait(self) -> Result<PipelineRun> {
        self.task
            .await
            .map_err(|e| Error::Internal(format!("run task failed: {e}")))
    }

    pub async fn result(self) -> Result<PipelineResult> {
        Ok(self.wait().await?.result())
    }
}

pub(crate) fn spawn_run(plan: RunPlan, services: Arc<Services>) -> RunHandle {
    let run = initial_record(&plan);
    let id = run.id;
    let (snapshot_tx, snapshot_rx) = watch::channel(run.clone());
    let (cancel_tx, cancel_rx) = watch::channel(None);
    let (updates_tx, updates_rx) = mpsc::unbounded_channel();

    let approvals = services.approvals.clone();
    let driver = RunDriver {
        plan,
        services,
        run,
        snapshot: snapshot_tx,
        updates_tx,
        updates_rx,
        tasks: JoinSet::new(),
        task_jobs: HashMap::new(),
        started: HashSet::new(),
        completed_stages: HashSet::new(),
        canceled: false,
    };
    let task = tokio::spawn(driver.drive(cancel_rx));

    RunHandle {
        id,
        snapshot: snapshot_rx,
        cancel: cancel_tx,
        approvals,
        task,
    }
}

fn initial_record(plan: &RunPlan) -> PipelineRun {
    let mut run = PipelineRun::new(&plan.pipeline, plan.context.clone(), plan.graph.stages().to_vec());
    run.id = plan.run_id;
    run.variables = plan.variables.clone();
    run.jobs = plan
        .jobs
        .iter()
        .map(|planned| {
            let mut record = JobRecord::new(&planned.job.name, &planned.job.stage);
            record.allow_failure = planned.allow_failure;
            record.variables = planned.variables.clone();
            record.environment = planned.environment.clone();
            record
        })
        .collect();
    run
}

enum Readiness {
    /// A dependency is not terminal yet.
    Waiting,
    Ready(Vec<ArtifactHandle>),
    Skipped(String),
    Blocked {
        failure: Option<FailureClass>,
        reason: String,
    },
}

struct RunDriver {
    plan: RunPlan,
    services: Arc<Services>,
    run: PipelineRun,
    snapshot: watch::Sender<PipelineRun>,
    updates_tx: mpsc::UnboundedSender<JobMessage>,
    updates_rx: mpsc::UnboundedReceiver<JobMessage>,
    tasks: JoinSet<JobOutcome>,
    task_jobs: HashMap<tokio::task::Id, String>,
    started: HashSet<String>,
    completed_stages: HashSet<String>,
    canceled: bool,
}

impl RunDriver {
    async fn drive(mut self, mut cancel: watch::Receiver<Option<String>>) -> PipelineRun {
        self.begin().await;

        loop {
            self.advance().await;
            if self.tasks.is_empty() {
                break;
            }

            tokio::select! {
                biased;
                Ok(()) = cancel.changed() => {
                    let reason = cancel
                        .borrow()
                        .clone()
                        .unwrap_or_else(|| "canceled".to_string());
                    self.cancel(reason).await;
                    break;
                }
                Some(message) = self.updates_rx.recv() => self.apply_update(message).await,
                Some(joined) = self.tasks.join_next_with_id() => self.on_joined(joined).await,
            }
        }

        self.finish().await
    }

    async fn begin(&mut self) {
        self.run.status = RunStatus::Running;
        info!(
            run_id = %self.run.id,
            pipeline = %self.run.pipeline,
            ref_name = %self.run.context.ref_name(),
            jobs = self.run.jobs.len(),
            "Run started"
        );
        self.publish(Event::RunCreated(RunCreatedPayload {
            run_id: self.run.id,
            pipeline: self.run.pipeline.clone(),
            ref_name: self.run.context.ref_name().to_string(),
            sha: self.run.context.sha().to_string(),
            triggered_by: self.run.context.actor().map(str::to_string),
            created_at: self.run.created_at,
        }))
        .await;

        let skipped: Vec<(String, String)> = self
            .plan
            .jobs
            .iter()
            .filter_map(|p| p.skip_reason.clone().map(|r| (p.job.name.clone(), r)))
            .collect();
        for (name, reason) in skipped {
            self.finish_job(&name, JobStatus::Skipped, None, Some(reason)).await;
        }
        self.announce_stages().await;
        self.snapshot.send_replace(self.run.clone());
    }

    /// Decide every pending job whose dependencies are terminal.
    async fn advance(&mut self) {
        let order: Vec<String> = self
            .plan
            .graph
            .topological_order()
            .into_iter()
            .map(|job| job.name.clone())
            .collect();

        for name in order {
            if self.started.contains(&name) || self.status(&name).is_none_or(|s| s.is_terminal()) {
                continue;
            }
            match self.readiness(&name).await {
                Readiness::Waiting => {}
                Readiness::Ready(inputs) => self.start_job(&name, inputs),
                Readiness::Skipped(reason) => {
                    self.finish_job(&name, JobStatus::Skipped, None, Some(reason)).await;
                }
                Readiness::Blocked { failure, reason } => {
                    self.finish_job(&name, JobStatus::Blocked, failure, Some(reason)).await;
                }
            }
        }
    }

    fn status(&self, job: &str) -> Option<JobStatus> {
        self.run.job(job).map(|j| j.status)
    }

    async fn readiness(&self, name: &str) -> Readiness {
        let dependencies = self.plan.graph.dependencies(name);
        let mut records = Vec::with_capacity(dependencies.len());
        for dep in &dependencies {
            match self.run.job(&dep.job.name) {
                Some(record) if record.status.is_terminal() => records.push(record),
                _ => return Readiness::Waiting,
            }
        }

        let mut skip = None;
        let mut inputs = Vec::new();
        for (dep, record) in dependencies.iter().zip(records) {
            let (needs_artifacts, optional) = match dep.kind {
                EdgeKind::Stage => (false, true),
                EdgeKind::Need {
                    artifacts,
                    optional,
                } => (artifacts, optional),
            };

            match record.status {
                JobStatus::Succeeded => {}
                JobStatus::Failed if record.allow_failure => continue,
                JobStatus::Skipped => {
                    if !optional && skip.is_none() {
                        skip = Some(format!("needed job '{}' was skipped", record.name));
                    }
                    continue;
                }
                status => {
                    return Readiness::Blocked {
                        failure: None,
                        reason: format!("dependency '{}' {status}", record.name),
                    };
                }
            }

            if dep.job.artifacts.is_none() {
                continue;
            }
            let stored = match record.artifacts {
                Some(handle) => match self.services.artifacts.exists(handle).await {
                    Ok(true) => Some(handle),
                    Ok(false) => None,
                    Err(e) => {
                        warn!(job = name, artifact = %handle, error = %e, "Artifact lookup failed");
                        None
                    }
                },
                None => None,
            };
            match stored {
                Some(handle) => inputs.push(handle),
                None if needs_artifacts => {
                    return Readiness::Blocked {
                        failure: Some(FailureClass::DependencyUnsatisfied),
                        reason: format!("artifacts of '{}' are not available", record.name),
                    };
                }
                None => {}
            }
        }

        match skip {
            Some(reason) => Readiness::Skipped(reason),
            None => Readiness::Ready(inputs),
        }
    }

    fn start_job(&mut self, name: &str, inputs: Vec<ArtifactHandle>) {
        let Some(planned) = self.plan.job(name).cloned() else {
            return;
        };
        let minutes = planned
            .job
            .timeout_minutes
            .unwrap_or(self.plan.default_timeout_minutes);
        let task = JobTask {
            run_id: self.run.id,
            project: self.run.context.project().to_string(),
            sha: self.run.context.sha().to_string(),
            actor: self.run.context.actor().map(str::to_string),
            planned,
            timeout: Duration::from_secs(u64::from(minutes) * 60),
            inputs,
            services: self.services.clone(),
            updates: self.updates_tx.clone(),
        };

        debug!(run_id = %self.run.id, job = name, "Dispatching job");
        let handle = self.tasks.spawn(task.run());
        self.task_jobs.insert(handle.id(), name.to_string());
        self.started.insert(name.to_string());
    }

    async fn apply_update(&mut self, message: JobMessage) {
        let JobMessage { job, update } = message;
        match update {
            JobUpdate::WaitingForApproval(token) => {
                if let Some(record) = self.run.job_mut(&job) {
                    record.approval = Some(token);
                }
                self.transition(&job, JobStatus::WaitingForApproval).await;
            }
            JobUpdate::Approved => self.transition(&job, JobStatus::Approved).await,
            JobUpdate::WaitingForResource => {
                self.transition(&job, JobStatus::WaitingForResource).await
            }
            JobUpdate::Running { attempt } => {
                debug!(job = %job, attempt, "Attempt running");
                self.transition(&job, JobStatus::Running).await;
            }
            JobUpdate::AttemptFinished(attempt) => {
                if let Some(record) = self.run.job_mut(&job) {
                    record.attempts.push(attempt);
                }
                self.snapshot.send_replace(self.run.clone());
            }
        }
    }

    async fn drain_updates(&mut self) {
        while let Ok(message) = self.updates_rx.try_recv() {
            self.apply_update(message).await;
        }
    }

    async fn on_joined(&mut self, joined: std::result::Result<(tokio::task::Id, JobOutcome), JoinError>) {
        self.drain_updates().await;
        match joined {
            Ok((id, outcome)) => {
                self.task_jobs.remove(&id);
                self.complete(outcome).await;
            }
            Err(e) => {
                let Some(job) = self.task_jobs.remove(&e.id()) else {
                    return;
                };
                if e.is_cancelled() {
                    return;
                }
                error!(job = %job, error = %e, "Job task panicked");
                self.finish_job(
                    &job,
                    JobStatus::Failed,
                    Some(FailureClass::RunnerSystemFailure),
                    Some("job task panicked".to_string()),
                )
                .await;
            }
        }
    }

    async fn complete(&mut self, outcome: JobOutcome) {
        if let Some(record) = self.run.job_mut(&outcome.job) {
            record.artifacts = outcome.artifacts;
            record.log_tail = outcome.log_tail;
        }
        self.finish_job(&outcome.job, outcome.status, outcome.failure, outcome.reason)
            .await;
    }

    async fn finish_job(
        &mut self,
        job: &str,
        status: JobStatus,
        failure: Option<FailureClass>,
        reason: Option<String>,
    ) {
        if let Some(record) = self.run.job_mut(job) {
            record.failure = failure;
            record.reason = reason;
        }
        self.transition(job, status).await;
    }

    async fn transition(&mut self, job: &str, status: JobStatus) {
        let Some(record) = self.run.job_mut(job) else {
            return;
        };
        if !record.status.can_transition_to(status) {
            warn!(job, from = %record.status, to = %status, "Ignoring illegal job transition");
            return;
        }

        let now = Utc::now();
        if status == JobStatus::Running && record.started_at.is_none() {
            record.started_at = Some(now);
        }
        if status.is_terminal() {
            record.finished_at = Some(now);
        }
        record.status = status;
        let record = record.clone();

        info!(run_id = %self.run.id, job, status = %status, "Job status changed");
        self.publish(Event::JobStatusChanged(self.status_payload(&record)))
            .await;

        if status.is_terminal() {
            self.announce_deployment(&record).await;
            self.announce_stages().await;
        }
        self.snapshot.send_replace(self.run.clone());
    }

    fn status_payload(&self, record: &JobRecord) -> JobStatusChangedPayload {
        let attempt = match record.status {
            JobStatus::Running => record.attempts.len() as u32 + 1,
            _ => record.attempts.len() as u32,
        };
        JobStatusChangedPayload {
            run_id: self.run.id,
            pipeline: self.run.pipeline.clone(),
            project: self.run.context.project().to_string(),
            ref_name: self.run.context.ref_name().to_string(),
            job: record.name.clone(),
            stage: record.stage.clone(),
            status: record.status,
            attempt,
            failure: record.failure,
            reason: record.reason.clone(),
            environment: record.environment.as_ref().map(|e| e.name.clone()),
            notify: self.plan.job(&record.name).is_none_or(|p| p.job.notify),
            allow_failure: record.allow_failure,
            log_tail: record.log_tail.clone(),
            changed_at: Utc::now(),
        }
    }

    async fn announce_deployment(&self, record: &JobRecord) {
        let Some(environment) = &record.environment else {
            return;
        };
        let succeeded = match record.status {
            JobStatus::Succeeded => true,
            JobStatus::Failed => false,
            _ => return,
        };
        info!(job = %record.name, environment = %environment.name, succeeded, "Deployment finished");
        self.publish(Event::DeploymentFinished(DeploymentFinishedPayload {
            run_id: self.run.id,
            pipeline: self.run.pipeline.clone(),
            project: self.run.context.project().to_string(),
            job: record.name.clone(),
            environment: environment.name.clone(),
            url: environment.url.clone(),
            protected: environment.protected,
            succeeded,
            ref_name: self.run.context.ref_name().to_string(),
            sha: self.run.context.sha().to_string(),
            finished_at: Utc::now(),
        }))
        .await;
    }

    async fn announce_stages(&mut self) {
        let stages: Vec<String> = self.run.stages.clone();
        for stage in stages {
            if self.completed_stages.contains(&stage) {
                continue;
            }
            let (empty, done, passed) = {
                let jobs: Vec<&JobRecord> = self.run.jobs.iter().filter(|j| j.stage == stage).collect();
                (
                    jobs.is_empty(),
                    jobs.iter().all(|j| j.status.is_terminal()),
                    !jobs.iter().any(|j| j.is_blocking_failure()),
                )
            };
            if empty {
                self.completed_stages.insert(stage);
                continue;
            }
            if !done {
                continue;
            }
            self.completed_stages.insert(stage.clone());
            info!(run_id = %self.run.id, stage = %stage, passed, "Stage completed");
            self.publish(Event::StageCompleted(StageCompletedPayload {
                run_id: self.run.id,
                stage,
                passed,
                completed_at: Utc::now(),
            }))
            .await;
        }
    }

    async fn cancel(&mut self, reason: String) {
        warn!(run_id = %self.run.id, reason = %reason, "Canceling run");
        self.canceled = true;
        self.services.approvals.cancel_run(self.run.id);

        // Aborted tasks drop their tokens and permits before join_next returns.
        self.tasks.abort_all();
        while let Some(joined) = self.tasks.join_next_with_id().await {
            self.on_joined(joined).await;
        }
        self.drain_updates().await;

        let open: Vec<String> = self
            .run
            .jobs
            .iter()
            .filter(|j| !j.status.is_terminal())
            .map(|j| j.name.clone())
            .collect();
        for job in open {
            self.finish_job(&job, JobStatus::Canceled, None, Some(reason.clone()))
                .await;
        }

        self.publish(Event::RunCanceled(RunCanceledPayload {
            run_id: self.run.id,
            pipeline: self.run.pipeline.clone(),
            reason,
            canceled_at: Utc::now(),
        }))
        .await;
    }

    async fn finish(mut self) -> PipelineRun {
        let now = Utc::now();
        self.run.status = self.run.aggregate_status(self.canceled);
        self.run.finished_at = Some(now);
        self.services.approvals.forget_run(self.run.id);
        self.remove_workspaces().await;

        let failed_jobs: Vec<String> = self
            .run
            .jobs
            .iter()
            .filter(|j| j.is_blocking_failure())
            .map(|j| j.name.clone())
            .collect();
        let duration_ms = u64::try_from((now - self.run.created_at).num_milliseconds()).unwrap_or(0);
        info!(
            run_id = %self.run.id,
            status = %self.run.status,
            failed = failed_jobs.len(),
            duration_ms,
            "Run completed"
        );

        self.publish(Event::RunCompleted(RunCompletedPayload {
            run_id: self.run.id,
            pipeline: self.run.pipeline.clone(),
            project: self.run.context.project().to_string(),
            ref_name: self.run.context.ref_name().to_string(),
            sha: self.run.context.sha().to_string(),
            status: self.run.status,
            failed_jobs,
            duration_ms,
            completed_at: now,
        }))
        .await;

        self.snapshot.send_replace(self.run.clone());
        self.run
    }

    /// Job workspaces live only as long as their run; artifacts are kept by the store.
    async fn remove_workspaces(&self) {
        let root = self.services.config.workspace_root.join(self.run.id.to_string());
        match tokio::fs::remove_dir_all(&root).await {
            Ok(()) => debug!(run_id = %self.run.id, path = %root.display(), "Removed run workspaces"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(run_id = %self.run.id, path = %root.display(), error = %e, "Failed to remove run workspaces"),
        }
    }

    async fn publish(&self, event: Event) {
        if let Err(e) = self.services.event_bus.publish(event).await {
            warn!(error = %e, "Failed to publish event");
        }
    }
}
