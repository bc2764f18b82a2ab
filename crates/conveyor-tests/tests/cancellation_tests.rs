//! Canceling a run aborts its jobs and gives back what they held.

use conveyor_core::events::Event;
use conveyor_core::run::{JobStatus, RunStatus};
use conveyor_tests::{EventLog, Step, TestEngine, fixtures};
use pretty_assertions::assert_eq;
use std::time::Duration;

const DEPLOY: &str = r#"
name: deploy
stages: [deploy, verify]
environments:
  - { name: production, protected: true }
jobs:
  - name: deploy_production
    stage: deploy
    script: [./deploy.sh]
    environment: { name: production }
  - name: health_checks
    stage: verify
    script: [./health.sh]
"#;

#[tokio::test]
async fn test_cancel_releases_environment_token() {
    let t = TestEngine::new();
    t.runtime.script("deploy_production", [Step::Hang]);
    let bus = t.bus();
    let events = EventLog::capture(&bus, "run.canceled.>").await;

    let definition = fixtures::parse(DEPLOY);
    let handle = t.engine.start(&definition, &fixtures::tag("3.0.0")).unwrap();
    handle
        .wait_for_job("deploy_production", JobStatus::Running)
        .await
        .unwrap();
    assert!(t.engine.environment_holder("production").is_some());

    handle.cancel("superseded by 3.0.1");
    let run = handle.wait().await.unwrap();

    assert_eq!(run.status, RunStatus::Canceled);
    let deploy = run.job("deploy_production").unwrap();
    assert_eq!(deploy.status, JobStatus::Canceled);
    assert_eq!(deploy.reason.as_deref(), Some("superseded by 3.0.1"));
    assert_eq!(run.job("health_checks").unwrap().status, JobStatus::Canceled);
    assert_eq!(t.engine.environment_holder("production"), None);

    let canceled = events.wait_until(|e| !e.is_empty()).await;
    assert!(matches!(&canceled[0], Event::RunCanceled(p) if p.reason == "superseded by 3.0.1"));

    // The token is free for the next run.
    let next = t.engine.start(&definition, &fixtures::tag("3.0.1")).unwrap();
    let run = tokio::time::timeout(Duration::from_secs(5), next.wait())
        .await
        .expect("next run acquires the token")
        .unwrap();
    assert_eq!(run.status, RunStatus::Success);
}

#[tokio::test]
async fn test_cancel_dequeues_waiting_job() {
    let t = TestEngine::new();
    t.runtime.hold("deploy_production");
    let definition = fixtures::parse(DEPLOY);

    let first = t.engine.start(&definition, &fixtures::tag("3.0.0")).unwrap();
    first
        .wait_for_job("deploy_production", JobStatus::Running)
        .await
        .unwrap();
    let second = t.engine.start(&definition, &fixtures::tag("3.0.1")).unwrap();
    second
        .wait_for_job("deploy_production", JobStatus::WaitingForResource)
        .await
        .unwrap();
    assert_eq!(t.engine.environment_waiting("production"), 1);

    second.cancel("not needed");
    let run = second.wait().await.unwrap();
    assert_eq!(run.status, RunStatus::Canceled);
    assert_eq!(t.engine.environment_waiting("production"), 0);

    t.runtime.release("deploy_production");
    assert_eq!(first.wait().await.unwrap().status, RunStatus::Success);
    assert_eq!(t.runtime.attempts("deploy_production"), 1);
}

#[tokio::test]
async fn test_cancel_closes_pending_gate() {
    let t = TestEngine::new();
    t.runtime.writes("build", "dist/app.js", "bundle");
    let handle = t
        .engine
        .start(&fixtures::webapp(), &fixtures::tag("1.2.3"))
        .unwrap();
    let run = handle
        .wait_for_job("deploy_production", JobStatus::WaitingForApproval)
        .await
        .unwrap();
    let token = run.job("deploy_production").unwrap().approval.unwrap();

    handle.cancel("release abandoned");
    let run = handle.wait().await.unwrap();

    assert_eq!(run.status, RunStatus::Canceled);
    assert_eq!(run.job("deploy_production").unwrap().status, JobStatus::Canceled);
    assert_eq!(run.job("health_checks").unwrap().status, JobStatus::Canceled);
    assert!(t.engine.pending_approvals().is_empty());
    assert!(t.engine.approve(token, "release-manager", None).await.is_err());
}
