//! Host shell runtime.

use crate::config::RunnerConfig;
use crate::output::{LogCollector, LogSink, OutputStream, pump_lines};
use async_trait::async_trait;
use conveyor_core::ports::{ExecutionOutcome, ExecutionRequest, JobRuntime};
use conveyor_core::{Error, Result};
use std::process::Stdio;
use std::time::Instant;
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Runs job scripts with the host shell in the job workspace.
///
/// The child is killed when the execution future is dropped, so an engine
/// timeout or cancellation never leaves the script running.
pub struct ShellRuntime {
    config: RunnerConfig,
    sink: Option<LogSink>,
}

impl ShellRuntime {
    pub fn new(config: RunnerConfig) -> Self {
        Self { config, sink: None }
    }

    pub fn with_sink(mut self, sink: LogSink) -> Self {
        self.sink = Some(sink);
        self
    }
}

impl Default for ShellRuntime {
    fn default() -> Self {
        Self::new(RunnerConfig::default())
    }
}

/// Join commands into one script that stops at the first failure.
pub(crate) fn script(commands: &[String]) -> String {
    let mut script = String::from("set -e\n");
    for command in commands {
        script.push_str(command);
        script.push('\n');
    }
    script
}

#[async_trait]
impl JobRuntime for ShellRuntime {
    fn name(&self) -> &str {
        "shell"
    }

    async fn execute(&self, request: &ExecutionRequest) -> Result<ExecutionOutcome> {
        let start = Instant::now();
        if let Some(image) = &request.image {
            debug!(job = %request.job, image = %image, "Shell runtime ignores the job image");
        }
        info!(
            job = %request.job,
            attempt = request.attempt,
            workspace = %request.workspace.display(),
            "Executing job script"
        );

        let mut command = Command::new(&self.config.shell);
        command
            .arg("-c")
            .arg(script(&request.commands))
            .current_dir(&request.workspace)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if !self.config.inherit_env {
            command.env_clear();
            if let Ok(path) = std::env::var("PATH") {
                command.env("PATH", path);
            }
        }
        command.envs(&request.env);

        if let Some(cache) = &request.cache {
            let dir = self.config.cache_dir(cache, &request.job);
            tokio::fs::create_dir_all(&dir)
                .await
                .map_err(|e| Error::RuntimeProvision(format!("cache directory {}: {e}", dir.display())))?;
            command.env("CI_CACHE_DIR", &dir);
        }

        let mut child = command
            .spawn()
            .map_err(|e| Error::RuntimeProvision(format!("failed to spawn {}: {e}", self.config.shell)))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::RuntimeProvision("stdout was not captured".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::RuntimeProvision("stderr was not captured".into()))?;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut collector = LogCollector::new(&request.job, request.attempt, self.sink.clone());
        let pumps = futures::future::join(
            pump_lines(stdout, OutputStream::Stdout, tx.clone()),
            pump_lines(stderr, OutputStream::Stderr, tx),
        );
        let collect = async {
            while let Some((stream, line)) = rx.recv().await {
                collector.push(stream, line);
            }
        };
        let (status, _, _) = tokio::join!(child.wait(), pumps, collect);

        let status = status.map_err(|e| Error::RuntimeProvision(format!("failed to wait for script: {e}")))?;
        // Killed by a signal.
        let exit_code = status.code().unwrap_or(-1);
        let duration = start.elapsed();
        debug!(job = %request.job, exit_code, duration_ms = duration.as_millis() as u64, "Script finished");

        Ok(ExecutionOutcome {
            exit_code,
            duration,
            log: collector.into_lines(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conveyor_core::ids::RunId;
    use std::collections::HashMap;
    use std::path::Path;
    use std::time::Duration;

    fn request(workspace: &Path, commands: &[&str]) -> ExecutionRequest {
        ExecutionRequest {
            run_id: RunId::new(),
            job: "test".to_string(),
            attempt: 1,
            image: None,
            commands: commands.iter().map(|c| c.to_string()).collect(),
            env: HashMap::from([("GREETING".to_string(), "hello".to_string())]),
            workspace: workspace.to_path_buf(),
            cache: None,
            resources: None,
            timeout: Duration::from_secs(30),
        }
    }

    #[test]
    fn test_script_stops_on_failure() {
        let script = script(&["make".to_string(), "make test".to_string()]);
        assert_eq!(script, "set -e\nmake\nmake test\n");
    }

    #[tokio::test]
    async fn test_success_captures_output() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = ShellRuntime::default();
        let outcome = runtime
            .execute(&request(dir.path(), &["echo $GREETING", "pwd"]))
            .await
            .unwrap();
        assert!(outcome.success());
        assert_eq!(outcome.log[0], "hello");
        assert!(outcome.log[1].ends_with(&*dir.path().file_name().unwrap().to_string_lossy()));
    }

    #[tokio::test]
    async fn test_failure_stops_script() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = ShellRuntime::default();
        let outcome = runtime
            .execute(&request(dir.path(), &["echo before", "exit 3", "echo after"]))
            .await
            .unwrap();
        assert_eq!(outcome.exit_code, 3);
        assert_eq!(outcome.log, vec!["before".to_string()]);
    }

    #[tokio::test]
    async fn test_missing_shell_is_provision_failure() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = ShellRuntime::new(RunnerConfig {
            shell: "/nonexistent/shell".to_string(),
            ..Default::default()
        });
        let err = runtime.execute(&request(dir.path(), &["true"])).await.unwrap_err();
        assert!(matches!(err, Error::RuntimeProvision(_)));
    }

    #[tokio::test]
    async fn test_sink_receives_lines() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let runtime = ShellRuntime::default().with_sink(tx);
        runtime.execute(&request(dir.path(), &["echo live"])).await.unwrap();
        let line = rx.recv().await.unwrap();
        assert_eq!(line.content, "live");
        assert_eq!(line.job, "test");
    }
}
