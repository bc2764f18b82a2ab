//! Error types for Conveyor.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    // Definition errors
    #[error("Invalid pipeline definition: {0}")]
    InvalidPipeline(String),

    #[error("Pipeline validation failed: {0}")]
    PipelineValidation(String),

    #[error("Invalid rule: {0}")]
    InvalidRule(String),

    #[error("Invalid commit context: {0}")]
    InvalidContext(String),

    // Run errors
    #[error("Run not found: {0}")]
    RunNotFound(String),

    #[error("Run cancelled: {reason}")]
    RunCancelled { reason: String },

    #[error("Unknown job: {0}")]
    UnknownJob(String),

    // Job execution errors
    #[error("Runtime failed to provision: {0}")]
    RuntimeProvision(String),

    #[error("Script failed with exit code {exit_code}")]
    ScriptFailed { exit_code: i32 },

    #[error("Job timeout after {seconds} seconds")]
    JobTimeout { seconds: u64 },

    #[error("API failure: {0}")]
    Api(String),

    #[error("Quality gate failed: {0}")]
    QualityGateFailed(String),

    #[error("Quality gate timed out")]
    QualityGateTimeout,

    #[error("Dependency unsatisfied: {0}")]
    DependencyUnsatisfied(String),

    // Approval errors
    #[error("Approval not found: {0}")]
    ApprovalNotFound(String),

    #[error("Approval already decided: {0}")]
    ApprovalAlreadyDecided(String),

    #[error("Approval denied for {user}: {reason}")]
    ApprovalDenied { user: String, reason: String },

    #[error("Approval rejected: {0}")]
    ApprovalRejected(String),

    // Artifact errors
    #[error("Artifact not found: {0}")]
    ArtifactNotFound(String),

    #[error("Artifact error: {0}")]
    Artifact(String),

    // Notification errors
    #[error("Notification delivery failed: {0}")]
    NotificationDelivery(String),

    // Infrastructure errors
    #[error("Event bus error: {0}")]
    EventBus(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl Error {
    /// Classify a job execution error for retry decisions.
    ///
    /// Errors that are not about a job attempt (definition, lookup, IO on the
    /// engine side) have no failure class.
    pub fn failure_class(&self) -> Option<FailureClass> {
        match self {
            Error::RuntimeProvision(_) => Some(FailureClass::RunnerSystemFailure),
            Error::Api(_) => Some(FailureClass::ApiFailure),
            Error::JobTimeout { .. } => Some(FailureClass::JobExecutionTimeout),
            Error::ScriptFailed { .. } => Some(FailureClass::ScriptFailure),
            Error::QualityGateFailed(_) => Some(FailureClass::QualityGateFailure),
            Error::QualityGateTimeout => Some(FailureClass::QualityGateTimeout),
            Error::DependencyUnsatisfied(_) => Some(FailureClass::DependencyUnsatisfied),
            _ => None,
        }
    }
}

/// Classes of job failure used by retry policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    RunnerSystemFailure,
    ApiFailure,
    JobExecutionTimeout,
    ScriptFailure,
    QualityGateFailure,
    QualityGateTimeout,
    DependencyUnsatisfied,
}

impl FailureClass {
    /// Infrastructure-level failures, always eligible for retry.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            FailureClass::RunnerSystemFailure
                | FailureClass::ApiFailure
                | FailureClass::JobExecutionTimeout
        )
    }

    /// Failures that no retry policy may override.
    pub fn is_never_retryable(&self) -> bool {
        matches!(
            self,
            FailureClass::QualityGateFailure
                | FailureClass::QualityGateTimeout
                | FailureClass::DependencyUnsatisfied
        )
    }
}
