//! Manual gates: they wait forever, honor approver policies and cancel on
//! rejection.

use conveyor_core::Error;
use conveyor_core::approval::ApprovalStatus;
use conveyor_core::ids::ApprovalToken;
use conveyor_core::run::{JobStatus, RunStatus};
use conveyor_tests::{EventLog, TestEngine, fixtures};
use pretty_assertions::assert_eq;
use std::time::Duration;

const RELEASE: &str = r#"
name: release
stages: [deploy, verify]
environments:
  - name: production
    protected: true
    approval: { approvers: [release-manager, sre], prevent_self_approval: true }
jobs:
  - name: deploy_production
    stage: deploy
    when: manual
    script: [./deploy.sh]
    environment: { name: production }
  - name: health_checks
    stage: verify
    needs: [deploy_production]
    script: [./health.sh]
"#;

#[tokio::test(start_paused = true)]
async fn test_gate_waits_through_long_idle() {
    let t = TestEngine::new();
    let handle = t
        .engine
        .start(&fixtures::parse(RELEASE), &fixtures::tag("2.0.0"))
        .unwrap();
    handle
        .wait_for_job("deploy_production", JobStatus::WaitingForApproval)
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_secs(30 * 24 * 60 * 60)).await;

    assert_eq!(
        handle.job_status("deploy_production"),
        Some(JobStatus::WaitingForApproval)
    );
    assert_eq!(handle.job_status("health_checks"), Some(JobStatus::Pending));
    assert_eq!(handle.snapshot().status, RunStatus::Running);
    assert_eq!(t.engine.pending_approvals().len(), 1);
    assert!(!t.runtime.ran("deploy_production"));

    handle.approve("deploy_production", "sre").await.unwrap();
    let run = handle.wait().await.unwrap();
    assert_eq!(run.status, RunStatus::Success);
}

#[tokio::test]
async fn test_policy_rejects_unlisted_and_self_approval() {
    let t = TestEngine::new();
    let handle = t
        .engine
        .start(&fixtures::parse(RELEASE), &fixtures::tag("2.0.0"))
        .unwrap();
    handle
        .wait_for_job("deploy_production", JobStatus::WaitingForApproval)
        .await
        .unwrap();

    let err = handle.approve("deploy_production", "intern").await.unwrap_err();
    assert!(matches!(err, Error::ApprovalDenied { .. }));

    let mut definition = fixtures::parse(RELEASE);
    definition.environments[0]
        .approval
        .as_mut()
        .unwrap()
        .approvers
        .push("dana".into());
    let own = t.engine.start(&definition, &fixtures::tag("2.0.1")).unwrap();
    own.wait_for_job("deploy_production", JobStatus::WaitingForApproval)
        .await
        .unwrap();
    let err = own.approve("deploy_production", "dana").await.unwrap_err();
    assert!(matches!(err, Error::ApprovalDenied { .. }));

    // Denied attempts leave both gates pending.
    assert_eq!(t.engine.pending_approvals().len(), 2);
    own.cancel("cleanup");
    handle.cancel("cleanup");
}

#[tokio::test]
async fn test_rejection_cancels_the_job() {
    let t = TestEngine::new();
    let bus = t.bus();
    let events = EventLog::capture(&bus, "approval.>").await;

    let handle = t
        .engine
        .start(&fixtures::parse(RELEASE), &fixtures::tag("2.0.0"))
        .unwrap();
    let run = handle
        .wait_for_job("deploy_production", JobStatus::WaitingForApproval)
        .await
        .unwrap();
    let token = run.job("deploy_production").unwrap().approval.unwrap();

    let gate = t
        .engine
        .reject(token, "release-manager", Some("freeze week".into()))
        .await
        .unwrap();
    assert_eq!(gate.status, ApprovalStatus::Rejected);

    let run = handle.wait().await.unwrap();
    let deploy = run.job("deploy_production").unwrap();
    assert_eq!(deploy.status, JobStatus::Canceled);
    assert!(deploy.reason.as_deref().unwrap().contains("release-manager"));
    assert_eq!(run.job("health_checks").unwrap().status, JobStatus::Blocked);
    assert_eq!(run.status, RunStatus::Canceled);
    assert!(!t.runtime.ran("deploy_production"));

    let subjects = events
        .wait_until(|e| e.len() == 2)
        .await
        .iter()
        .map(|e| e.subject())
        .collect::<Vec<_>>();
    assert!(subjects[0].starts_with("approval.requested."));
    assert!(subjects[1].starts_with("approval.rejected."));
}

#[tokio::test]
async fn test_decisions_are_final() {
    let t = TestEngine::new();
    t.runtime.hold("deploy_production");
    let handle = t
        .engine
        .start(&fixtures::parse(RELEASE), &fixtures::tag("2.0.0"))
        .unwrap();
    let run = handle
        .wait_for_job("deploy_production", JobStatus::WaitingForApproval)
        .await
        .unwrap();
    let token = run.job("deploy_production").unwrap().approval.unwrap();

    t.engine.approve(token, "sre", None).await.unwrap();
    let err = t.engine.reject(token, "release-manager", None).await.unwrap_err();
    assert!(matches!(err, Error::ApprovalAlreadyDecided(_)));

    t.runtime.release("deploy_production");
    handle.wait().await.unwrap();
    let err = t.engine.approve(ApprovalToken::new(), "sre", None).await.unwrap_err();
    assert!(matches!(err, Error::ApprovalNotFound(_)));
}
