//! Events published while a run executes.
//!
//! Every event maps to a dot-separated subject so subscribers can filter
//! with wildcards (`run.*.job.*.failed`, `deployment.>`).

use crate::error::FailureClass;
use crate::ids::{ApprovalToken, RunId};
use crate::run::{JobStatus, RunStatus};
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    // Run lifecycle
    RunCreated(RunCreatedPayload),
    RunCompleted(RunCompletedPayload),
    RunCanceled(RunCanceledPayload),

    // Jobs
    JobStatusChanged(JobStatusChangedPayload),
    JobRetrying(JobRetryingPayload),
    StageCompleted(StageCompletedPayload),

    // Approval
    ApprovalRequested(ApprovalRequestedPayload),
    ApprovalGranted(ApprovalDecidedPayload),
    ApprovalRejected(ApprovalDecidedPayload),

    // Deployments
    DeploymentFinished(DeploymentFinishedPayload),
}

/// Subject tokens may not contain the separator.
fn token(s: &str) -> String {
    s.replace(['.', ' ', '*', '>'], "_")
}

impl Event {
    /// Returns the subject for this event.
    pub fn subject(&self) -> String {
        match self {
            Event::RunCreated(p) => format!("run.created.{}.{}", token(&p.pipeline), p.run_id),
            Event::RunCompleted(p) => {
                format!("run.completed.{}.{}", token(&p.pipeline), p.run_id)
            }
            Event::RunCanceled(p) => format!("run.canceled.{}.{}", token(&p.pipeline), p.run_id),
            Event::JobStatusChanged(p) => {
                format!("run.{}.job.{}.{}", p.run_id, token(&p.job), p.status)
            }
            Event::JobRetrying(p) => format!("run.{}.job.{}.retrying", p.run_id, token(&p.job)),
            Event::StageCompleted(p) => {
                format!("run.{}.stage.{}.completed", p.run_id, token(&p.stage))
            }
            Event::ApprovalRequested(p) => format!("approval.requested.{}", p.token),
            Event::ApprovalGranted(p) => format!("approval.granted.{}", p.token),
            Event::ApprovalRejected(p) => format!("approval.rejected.{}", p.token),
            Event::DeploymentFinished(p) => format!(
                "deployment.{}.{}",
                if p.succeeded { "succeeded" } else { "failed" },
                token(&p.environment)
            ),
        }
    }

    pub fn run_id(&self) -> RunId {
        match self {
            Event::RunCreated(p) => p.run_id,
            Event::RunCompleted(p) => p.run_id,
            Event::RunCanceled(p) => p.run_id,
            Event::JobStatusChanged(p) => p.run_id,
            Event::JobRetrying(p) => p.run_id,
            Event::StageCompleted(p) => p.run_id,
            Event::ApprovalRequested(p) => p.run_id,
            Event::ApprovalGranted(p) | Event::ApprovalRejected(p) => p.run_id,
            Event::DeploymentFinished(p) => p.run_id,
        }
    }
}

// === Run Payloads ===

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RunCreatedPayload {
    pub run_id: RunId,
    pub pipeline: String,
    pub ref_name: String,
    pub sha: String,
    pub triggered_by: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RunCompletedPayload {
    pub run_id: RunId,
    pub pipeline: String,
    pub project: String,
    pub ref_name: String,
    pub sha: String,
    pub status: RunStatus,
    pub failed_jobs: Vec<String>,
    pub duration_ms: u64,
    pub completed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RunCanceledPayload {
    pub run_id: RunId,
    pub pipeline: String,
    pub reason: String,
    pub canceled_at: DateTime<Utc>,
}

// === Job Payloads ===

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct JobStatusChangedPayload {
    pub run_id: RunId,
    pub pipeline: String,
    pub project: String,
    pub ref_name: String,
    pub job: String,
    pub stage: String,
    pub status: JobStatus,
    pub attempt: u32,
    pub failure: Option<FailureClass>,
    pub reason: Option<String>,
    pub environment: Option<String>,
    /// Whether the job asked for notifications.
    pub notify: bool,
    pub allow_failure: bool,
    pub log_tail: Vec<String>,
    pub changed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct JobRetryingPayload {
    pub run_id: RunId,
    pub job: String,
    pub failed_attempt: u32,
    pub failure: FailureClass,
    pub delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct StageCompletedPayload {
    pub run_id: RunId,
    pub stage: String,
    /// True when no job in the stage failed without `allow_failure`.
    pub passed: bool,
    pub completed_at: DateTime<Utc>,
}

// === Approval Payloads ===

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ApprovalRequestedPayload {
    pub run_id: RunId,
    pub token: ApprovalToken,
    pub job: String,
    pub environment: Option<String>,
    pub requested_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ApprovalDecidedPayload {
    pub run_id: RunId,
    pub token: ApprovalToken,
    pub job: String,
    pub user: String,
    pub comment: Option<String>,
    pub decided_at: DateTime<Utc>,
}

// === Deployment Payloads ===

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct DeploymentFinishedPayload {
    pub run_id: RunId,
    pub pipeline: String,
    pub project: String,
    pub job: String,
    pub environment: String,
    pub url: Option<String>,
    pub protected: bool,
    pub succeeded: bool,
    pub ref_name: String,
    pub sha: String,
    pub finished_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subjects() {
        let run_id = RunId::new();
        let event = Event::StageCompleted(StageCompletedPayload {
            run_id,
            stage: "deploy".into(),
            passed: true,
            completed_at: Utc::now(),
        });
        assert_eq!(event.subject(), format!("run.{run_id}.stage.deploy.completed"));

        let event = Event::DeploymentFinished(DeploymentFinishedPayload {
            run_id,
            pipeline: "webapp".into(),
            project: "group/app".into(),
            job: "deploy_production".into(),
            environment: "production".into(),
            url: None,
            protected: true,
            succeeded: false,
            ref_name: "1.2.3".into(),
            sha: "abc".into(),
            finished_at: Utc::now(),
        });
        assert_eq!(event.subject(), "deployment.failed.production");
        assert_eq!(event.run_id(), run_id);
    }

    #[test]
    fn test_subject_tokens_sanitized() {
        let event = Event::RunCanceled(RunCanceledPayload {
            run_id: RunId::new(),
            pipeline: "web.app v2".into(),
            reason: "user".into(),
            canceled_at: Utc::now(),
        });
        assert!(event.subject().starts_with("run.canceled.web_app_v2."));
    }

    #[test]
    fn test_serialized_tag() {
        let event = Event::ApprovalRequested(ApprovalRequestedPayload {
            run_id: RunId::new(),
            token: ApprovalToken::new(),
            job: "deploy_production".into(),
            environment: Some("production".into()),
            requested_at: Utc::now(),
        });
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "approval_requested");
    }
}
