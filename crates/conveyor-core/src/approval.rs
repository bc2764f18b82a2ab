//! Manual approval gates.
//!
//! A gate has no expiry: it stays pending until an authorized actor decides
//! or the run is canceled.

use crate::ids::{ApprovalToken, RunId};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
    /// The run was canceled while the gate was pending.
    Canceled,
}

impl ApprovalStatus {
    pub fn is_decided(&self) -> bool {
        !matches!(self, ApprovalStatus::Pending)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ApproverAction {
    Approved,
    Rejected,
}

/// Who decided a gate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Approver {
    pub user: String,
    pub action: ApproverAction,
    pub comment: Option<String>,
    pub acted_at: DateTime<Utc>,
}

impl Approver {
    pub fn new(user: impl Into<String>, action: ApproverAction) -> Self {
        Self {
            user: user.into(),
            action,
            comment: None,
            acted_at: Utc::now(),
        }
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }
}

/// Who may decide a gate.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
pub struct ApprovalPolicy {
    /// Allowed approvers. Empty means anyone.
    #[serde(default)]
    pub approvers: Vec<String>,
    /// The actor that triggered the run may not approve it.
    #[serde(default)]
    pub prevent_self_approval: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ApprovalGate {
    pub token: ApprovalToken,
    pub run_id: RunId,
    pub job: String,
    pub environment: Option<String>,
    pub status: ApprovalStatus,
    pub policy: ApprovalPolicy,
    pub triggered_by: Option<String>,
    pub decision: Option<Approver>,
    pub created_at: DateTime<Utc>,
}

impl ApprovalGate {
    pub fn new(run_id: RunId, job: impl Into<String>, policy: ApprovalPolicy) -> Self {
        Self {
            token: ApprovalToken::new(),
            run_id,
            job: job.into(),
            environment: None,
            status: ApprovalStatus::Pending,
            policy,
            triggered_by: None,
            decision: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_environment(mut self, environment: Option<String>) -> Self {
        self.environment = environment;
        self
    }

    pub fn with_triggered_by(mut self, actor: Option<String>) -> Self {
        self.triggered_by = actor;
        self
    }

    pub fn is_pending(&self) -> bool {
        self.status == ApprovalStatus::Pending
    }

    /// Check whether `user` may decide this gate.
    pub fn check_approver(&self, user: &str) -> Result<()> {
        if self.status.is_decided() {
            return Err(Error::ApprovalAlreadyDecided(self.token.to_string()));
        }

        if !self.policy.approvers.is_empty() && !self.policy.approvers.iter().any(|a| a == user) {
            return Err(Error::ApprovalDenied {
                user: user.to_string(),
                reason: "not an allowed approver".to_string(),
            });
        }

        if self.policy.prevent_self_approval && self.triggered_by.as_deref() == Some(user) {
            return Err(Error::ApprovalDenied {
                user: user.to_string(),
                reason: "self-approval is not allowed".to_string(),
            });
        }

        Ok(())
    }

    pub fn approve(&mut self, approver: Approver) -> Result<()> {
        self.check_approver(&approver.user)?;
        self.status = ApprovalStatus::Approved;
        self.decision = Some(approver);
        Ok(())
    }

    pub fn reject(&mut self, approver: Approver) -> Result<()> {
        self.check_approver(&approver.user)?;
        self.status = ApprovalStatus::Rejected;
        self.decision = Some(approver);
        Ok(())
    }

    /// Close a pending gate because its run went away.
    pub fn cancel(&mut self) {
        if self.is_pending() {
            self.status = ApprovalStatus::Canceled;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gate(policy: ApprovalPolicy) -> ApprovalGate {
        ApprovalGate::new(RunId::new(), "deploy_production", policy)
            .with_environment(Some("production".into()))
            .with_triggered_by(Some("alice".into()))
    }

    #[test]
    fn test_approve() {
        let mut gate = gate(ApprovalPolicy::default());
        gate.approve(Approver::new("bob", ApproverAction::Approved).with_comment("ship it"))
            .unwrap();
        assert_eq!(gate.status, ApprovalStatus::Approved);
        assert_eq!(gate.decision.as_ref().map(|d| d.user.as_str()), Some("bob"));
    }

    #[test]
    fn test_decided_gate_is_final() {
        let mut gate = gate(ApprovalPolicy::default());
        gate.reject(Approver::new("bob", ApproverAction::Rejected)).unwrap();
        let again = gate.approve(Approver::new("carol", ApproverAction::Approved));
        assert!(matches!(again, Err(Error::ApprovalAlreadyDecided(_))));
        assert_eq!(gate.status, ApprovalStatus::Rejected);
    }

    #[test]
    fn test_allow_list_and_self_approval() {
        let mut gate = gate(ApprovalPolicy {
            approvers: vec!["alice".into(), "bob".into()],
            prevent_self_approval: true,
        });

        assert!(matches!(
            gate.approve(Approver::new("mallory", ApproverAction::Approved)),
            Err(Error::ApprovalDenied { .. })
        ));
        assert!(matches!(
            gate.approve(Approver::new("alice", ApproverAction::Approved)),
            Err(Error::ApprovalDenied { .. })
        ));
        assert!(gate.is_pending());

        gate.approve(Approver::new("bob", ApproverAction::Approved)).unwrap();
        assert_eq!(gate.status, ApprovalStatus::Approved);
    }

    #[test]
    fn test_cancel_only_pending() {
        let mut gate = gate(ApprovalPolicy::default());
        gate.approve(Approver::new("bob", ApproverAction::Approved)).unwrap();
        gate.cancel();
        assert_eq!(gate.status, ApprovalStatus::Approved);
    }
}
