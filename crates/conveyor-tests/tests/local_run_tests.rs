//! Runs through the shell runtime and the filesystem artifact store.

use conveyor_artifacts::FilesystemArtifactStore;
use conveyor_core::FailureClass;
use conveyor_core::ports::ArtifactStore;
use conveyor_core::run::{JobStatus, RunStatus};
use conveyor_runner::{RunnerConfig, ShellRuntime};
use conveyor_scheduler::{BackoffPolicy, Engine, EngineConfig};
use conveyor_tests::fixtures;
use pretty_assertions::assert_eq;
use std::path::Path;
use std::sync::Arc;

const LOCAL: &str = r#"
name: local
variables: { GREETING: hello }
stages: [build, test]
jobs:
  - name: build
    stage: build
    script:
      - mkdir -p dist
      - echo "$GREETING from $CI_COMMIT_REF_NAME" > dist/out.txt
    artifacts: { paths: [dist/] }
  - name: check
    stage: test
    needs: [build]
    script:
      - test "$(cat dist/out.txt)" = "hello from main"
  - name: broken
    stage: test
    needs: []
    allow_failure: true
    retry: { max: 1, when: [script_failure] }
    script:
      - echo "about to fail"
      - exit 3
"#;

fn local_engine(root: &Path) -> Engine {
    Engine::builder()
        .config(
            EngineConfig::default()
                .with_workspace_root(root.join("workspaces"))
                .with_backoff(BackoffPolicy::None),
        )
        .runtime(Arc::new(ShellRuntime::new(RunnerConfig {
            cache_root: root.join("cache"),
            ..Default::default()
        })))
        .artifact_store(Arc::new(FilesystemArtifactStore::new(root.join("artifacts"))))
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_shell_run_with_filesystem_artifacts() {
    conveyor_tests::init_test_logging();
    let dir = tempfile::tempdir().unwrap();
    let engine = local_engine(dir.path());

    let run = engine
        .start(&fixtures::parse(LOCAL), &fixtures::branch("main"))
        .unwrap()
        .wait()
        .await
        .unwrap();

    assert_eq!(run.job("build").unwrap().status, JobStatus::Succeeded);
    assert!(run.job("build").unwrap().artifacts.is_some());
    assert_eq!(run.job("check").unwrap().status, JobStatus::Succeeded);

    let broken = run.job("broken").unwrap();
    assert_eq!(broken.status, JobStatus::Failed);
    assert_eq!(broken.failure, Some(FailureClass::ScriptFailure));
    assert_eq!(broken.attempts.len(), 2);
    assert_eq!(broken.attempts[1].exit_code, Some(3));
    assert_eq!(broken.log_tail, vec!["about to fail".to_string()]);

    assert_eq!(run.status, RunStatus::Success);
}

const LEFTOVERS: &str = r#"
name: leftovers
stages: [build, test]
jobs:
  - name: build
    stage: build
    script:
      - echo bundle > app.js
    artifacts: { paths: [app.js] }
  - name: flaky
    stage: test
    needs: [build]
    retry: { max: 1, when: [script_failure] }
    script:
      - test -f app.js
      - if [ -e marker ]; then echo "state from attempt 1 carried over"; exit 0; fi
      - touch marker
      - echo "first attempt"
      - exit 1
"#;

#[tokio::test]
async fn test_retry_starts_from_clean_workspace() {
    conveyor_tests::init_test_logging();
    let dir = tempfile::tempdir().unwrap();
    let engine = local_engine(dir.path());

    let run = engine
        .start(&fixtures::parse(LEFTOVERS), &fixtures::branch("main"))
        .unwrap()
        .wait()
        .await
        .unwrap();

    // Input artifacts are extracted again for the retry, the marker is not.
    let flaky = run.job("flaky").unwrap();
    assert_eq!(flaky.status, JobStatus::Failed);
    assert_eq!(flaky.attempts.len(), 2);
    assert_eq!(flaky.attempts[1].exit_code, Some(1));
    assert_eq!(flaky.log_tail, vec!["first attempt".to_string()]);
    assert_eq!(run.status, RunStatus::Failed);
}

#[tokio::test]
async fn test_workspaces_removed_when_run_finishes() {
    let dir = tempfile::tempdir().unwrap();
    let engine = local_engine(dir.path());

    let run = engine
        .start(&fixtures::parse(LOCAL), &fixtures::branch("main"))
        .unwrap()
        .wait()
        .await
        .unwrap();

    assert_eq!(run.status, RunStatus::Success);
    assert!(!dir.path().join("workspaces").join(run.id.to_string()).exists());
    // Artifacts outlive the workspace.
    let handle = run.job("build").unwrap().artifacts.unwrap();
    let store = FilesystemArtifactStore::new(dir.path().join("artifacts"));
    assert!(store.exists(handle).await.unwrap());
}
