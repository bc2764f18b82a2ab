//! Runtime selection.

use crate::config::{RunnerConfig, RuntimeKind};
use crate::container::DockerRuntime;
use crate::output::LogSink;
use crate::shell::ShellRuntime;
use async_trait::async_trait;
use conveyor_core::Result;
use conveyor_core::ports::{ExecutionOutcome, ExecutionRequest, JobRuntime};
use std::sync::Arc;
use tracing::{debug, warn};

/// Sends jobs with an image to Docker and everything else to the shell.
pub struct RuntimeRouter {
    shell: Arc<dyn JobRuntime>,
    docker: Option<Arc<dyn JobRuntime>>,
}

impl RuntimeRouter {
    pub fn new(shell: Arc<dyn JobRuntime>, docker: Option<Arc<dyn JobRuntime>>) -> Self {
        Self { shell, docker }
    }

    fn select(&self, request: &ExecutionRequest) -> &Arc<dyn JobRuntime> {
        match (&request.image, &self.docker) {
            (Some(_), Some(docker)) => docker,
            (Some(image), None) => {
                warn!(job = %request.job, image = %image, "Docker unavailable, running on the host shell");
                &self.shell
            }
            (None, _) => &self.shell,
        }
    }
}

#[async_trait]
impl JobRuntime for RuntimeRouter {
    fn name(&self) -> &str {
        "auto"
    }

    async fn execute(&self, request: &ExecutionRequest) -> Result<ExecutionOutcome> {
        let runtime = self.select(request);
        debug!(job = %request.job, runtime = runtime.name(), "Selected runtime");
        runtime.execute(request).await
    }
}

/// Build the runtime described by `config`.
///
/// `Auto` tolerates a missing Docker daemon; `Docker` does not.
pub fn build_runtime(config: &RunnerConfig, sink: Option<LogSink>) -> Result<Arc<dyn JobRuntime>> {
    let shell = {
        let runtime = ShellRuntime::new(config.clone());
        match sink.clone() {
            Some(sink) => runtime.with_sink(sink),
            None => runtime,
        }
    };
    let docker = || -> Result<DockerRuntime> {
        let runtime = DockerRuntime::connect(config.clone())?;
        Ok(match sink.clone() {
            Some(sink) => runtime.with_sink(sink),
            None => runtime,
        })
    };

    let runtime: Arc<dyn JobRuntime> = match config.kind {
        RuntimeKind::Shell => Arc::new(shell),
        RuntimeKind::Docker => Arc::new(docker()?),
        RuntimeKind::Auto => {
            let docker: Option<Arc<dyn JobRuntime>> = match docker() {
                Ok(runtime) => Some(Arc::new(runtime)),
                Err(e) => {
                    warn!(error = %e, "Docker unavailable, image jobs will use the host shell");
                    None
                }
            };
            Arc::new(RuntimeRouter::new(Arc::new(shell), docker))
        }
    };
    Ok(runtime)
}

#[cfg(test)]
mod tests {
    use super::*;
    use conveyor_core::ids::RunId;
    use std::collections::HashMap;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct Counting {
        name: &'static str,
        calls: AtomicUsize,
    }

    impl Counting {
        fn new(name: &'static str) -> Arc<Self> {
            Arc::new(Self {
                name,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl JobRuntime for Counting {
        fn name(&self) -> &str {
            self.name
        }

        async fn execute(&self, _request: &ExecutionRequest) -> Result<ExecutionOutcome> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(ExecutionOutcome {
                exit_code: 0,
                duration: Duration::ZERO,
                log: vec![self.name.to_string()],
            })
        }
    }

    fn request(image: Option<&str>) -> ExecutionRequest {
        ExecutionRequest {
            run_id: RunId::new(),
            job: "job".to_string(),
            attempt: 1,
            image: image.map(String::from),
            commands: vec!["true".to_string()],
            env: HashMap::new(),
            workspace: PathBuf::from("/tmp"),
            cache: None,
            resources: None,
            timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn test_image_jobs_go_to_docker() {
        let shell = Counting::new("shell");
        let docker = Counting::new("docker");
        let router = RuntimeRouter::new(shell.clone(), Some(docker.clone()));

        let outcome = router.execute(&request(Some("node:20"))).await.unwrap();
        assert_eq!(outcome.log, vec!["docker"]);
        router.execute(&request(None)).await.unwrap();
        assert_eq!(docker.calls.load(Ordering::SeqCst), 1);
        assert_eq!(shell.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_falls_back_to_shell_without_docker() {
        let shell = Counting::new("shell");
        let router = RuntimeRouter::new(shell.clone(), None);
        let outcome = router.execute(&request(Some("node:20"))).await.unwrap();
        assert_eq!(outcome.log, vec!["shell"]);
    }

    #[test]
    fn test_build_shell_runtime() {
        let config = RunnerConfig {
            kind: RuntimeKind::Shell,
            ..Default::default()
        };
        let runtime = build_runtime(&config, None).unwrap();
        assert_eq!(runtime.name(), "shell");
    }
}
