//! Docker job runtime.

use crate::config::RunnerConfig;
use crate::output::{LogCollector, LogSink, OutputStream};
use crate::shell::script;
use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    Config, CreateContainerOptions, LogOutput, LogsOptions, RemoveContainerOptions,
    StartContainerOptions, WaitContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use conveyor_core::pipeline::ResourceRequirements;
use conveyor_core::ports::{ExecutionOutcome, ExecutionRequest, JobRuntime};
use conveyor_core::{Error, Result};
use futures::StreamExt;
use std::time::Instant;
use tracing::{debug, info, warn};

const WORKSPACE: &str = "/workspace";
const CACHE: &str = "/cache";

/// Runs each job attempt in a fresh container.
pub struct DockerRuntime {
    docker: Docker,
    config: RunnerConfig,
    sink: Option<LogSink>,
}

impl DockerRuntime {
    /// Connect to the local Docker daemon.
    pub fn connect(config: RunnerConfig) -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| Error::RuntimeProvision(format!("failed to connect to Docker: {e}")))?;
        Ok(Self::with_docker(docker, config))
    }

    pub fn with_docker(docker: Docker, config: RunnerConfig) -> Self {
        Self {
            docker,
            config,
            sink: None,
        }
    }

    pub fn with_sink(mut self, sink: LogSink) -> Self {
        self.sink = Some(sink);
        self
    }

    async fn pull(&self, image: &str) -> Result<()> {
        debug!(image, "Pulling image");
        let options = CreateImageOptions {
            from_image: image,
            ..Default::default()
        };
        let mut stream = self.docker.create_image(Some(options), None, None);
        while let Some(progress) = stream.next().await {
            progress.map_err(|e| Error::RuntimeProvision(format!("failed to pull {image}: {e}")))?;
        }
        Ok(())
    }

    async fn stream_logs(&self, container: &str, collector: &mut LogCollector) {
        let options = LogsOptions::<String> {
            follow: true,
            stdout: true,
            stderr: true,
            ..Default::default()
        };
        let mut logs = self.docker.logs(container, Some(options));
        while let Some(entry) = logs.next().await {
            let (stream, message) = match entry {
                Ok(LogOutput::StdOut { message }) => (OutputStream::Stdout, message),
                Ok(LogOutput::StdErr { message }) => (OutputStream::Stderr, message),
                Ok(_) => continue,
                Err(e) => {
                    warn!(container, error = %e, "Error reading container logs");
                    break;
                }
            };
            for line in String::from_utf8_lossy(&message).lines() {
                collector.push(stream, line.to_string());
            }
        }
    }

    async fn wait(&self, container: &str) -> Result<i32> {
        let options = WaitContainerOptions {
            condition: "not-running",
        };
        match self.docker.wait_container(container, Some(options)).next().await {
            Some(Ok(response)) => Ok(response.status_code as i32),
            // Non-zero exits surface as a wait error carrying the code.
            Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => Ok(code as i32),
            Some(Err(e)) => Err(Error::Api(format!("container wait failed: {e}"))),
            None => Err(Error::Api("container wait returned no result".into())),
        }
    }
}

#[async_trait]
impl JobRuntime for DockerRuntime {
    fn name(&self) -> &str {
        "docker"
    }

    async fn execute(&self, request: &ExecutionRequest) -> Result<ExecutionOutcome> {
        let start = Instant::now();
        let image = request.image.as_deref().unwrap_or(&self.config.default_image);
        let name = format!("conveyor-{}", uuid::Uuid::new_v4());
        info!(job = %request.job, attempt = request.attempt, image, container = %name, "Starting container");

        if self.config.pull_images {
            self.pull(image).await?;
        }
        if let Some(cache) = &request.cache {
            let dir = self.config.cache_dir(cache, &request.job);
            tokio::fs::create_dir_all(&dir)
                .await
                .map_err(|e| Error::RuntimeProvision(format!("cache directory {}: {e}", dir.display())))?;
        }

        let config = container_config(&self.config, image, request)?;
        let options = CreateContainerOptions {
            name: name.as_str(),
            platform: None,
        };
        self.docker
            .create_container(Some(options), config)
            .await
            .map_err(|e| Error::RuntimeProvision(format!("failed to create container: {e}")))?;
        let _guard = ContainerGuard {
            docker: self.docker.clone(),
            name: name.clone(),
        };

        self.docker
            .start_container(&name, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| Error::RuntimeProvision(format!("failed to start container: {e}")))?;

        let mut collector = LogCollector::new(&request.job, request.attempt, self.sink.clone());
        self.stream_logs(&name, &mut collector).await;
        let exit_code = self.wait(&name).await?;

        let duration = start.elapsed();
        debug!(container = %name, exit_code, duration_ms = duration.as_millis() as u64, "Container finished");
        Ok(ExecutionOutcome {
            exit_code,
            duration,
            log: collector.into_lines(),
        })
    }
}

/// Force-removes the container when the attempt ends or is dropped.
struct ContainerGuard {
    docker: Docker,
    name: String,
}

impl Drop for ContainerGuard {
    fn drop(&mut self) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(container = %self.name, "No runtime to remove container");
            return;
        };
        let docker = self.docker.clone();
        let name = std::mem::take(&mut self.name);
        handle.spawn(async move {
            let options = RemoveContainerOptions {
                force: true,
                ..Default::default()
            };
            if let Err(e) = docker.remove_container(&name, Some(options)).await {
                warn!(container = %name, error = %e, "Failed to remove container");
            }
        });
    }
}

fn container_config(config: &RunnerConfig, image: &str, request: &ExecutionRequest) -> Result<Config<String>> {
    let mut env: Vec<String> = request.env.iter().map(|(k, v)| format!("{k}={v}")).collect();
    let mut binds = vec![format!("{}:{WORKSPACE}", request.workspace.display())];
    if let Some(cache) = &request.cache {
        let dir = config.cache_dir(cache, &request.job);
        binds.push(format!("{}:{CACHE}", dir.display()));
        env.push(format!("CI_CACHE_DIR={CACHE}"));
    }

    let mut host = HostConfig {
        binds: Some(binds),
        auto_remove: Some(false),
        ..Default::default()
    };
    if let Some(resources) = &request.resources {
        apply_resources(&mut host, resources)?;
    }

    Ok(Config {
        image: Some(image.to_string()),
        cmd: Some(vec!["sh".to_string(), "-c".to_string(), script(&request.commands)]),
        env: Some(env),
        working_dir: Some(WORKSPACE.to_string()),
        host_config: Some(host),
        ..Default::default()
    })
}

fn apply_resources(host: &mut HostConfig, resources: &ResourceRequirements) -> Result<()> {
    if let Some(memory) = &resources.memory {
        host.memory = Some(parse_memory(memory)?);
    }
    if let Some(cpu) = &resources.cpu {
        host.nano_cpus = Some(parse_cpus(cpu)?);
    }
    Ok(())
}

/// Parse sizes like `512m`, `2g` or `1048576` into bytes.
pub fn parse_memory(value: &str) -> Result<i64> {
    let value = value.trim().to_ascii_lowercase();
    let value = value.strip_suffix('b').unwrap_or(&value);
    let (digits, multiplier) = match value.chars().last() {
        Some('k') => (&value[..value.len() - 1], 1024),
        Some('m') => (&value[..value.len() - 1], 1024 * 1024),
        Some('g') => (&value[..value.len() - 1], 1024 * 1024 * 1024),
        _ => (value, 1),
    };
    digits
        .parse::<i64>()
        .ok()
        .filter(|n| *n > 0)
        .map(|n| n * multiplier)
        .ok_or_else(|| Error::RuntimeProvision(format!("invalid memory limit: {value}")))
}

/// Parse a CPU count like `2` or `0.5` into nano-CPUs.
pub fn parse_cpus(value: &str) -> Result<i64> {
    value
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|n| *n > 0.0)
        .map(|n| (n * 1e9) as i64)
        .ok_or_else(|| Error::RuntimeProvision(format!("invalid cpu limit: {value}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use conveyor_core::ids::RunId;
    use conveyor_core::pipeline::CacheSpec;
    use std::collections::HashMap;
    use std::path::PathBuf;
    use std::time::Duration;

    #[test]
    fn test_parse_memory() {
        assert_eq!(parse_memory("512m").unwrap(), 512 * 1024 * 1024);
        assert_eq!(parse_memory("2G").unwrap(), 2 * 1024 * 1024 * 1024);
        assert_eq!(parse_memory("64kb").unwrap(), 64 * 1024);
        assert_eq!(parse_memory("1048576").unwrap(), 1_048_576);
        assert!(parse_memory("lots").is_err());
        assert!(parse_memory("0m").is_err());
    }

    #[test]
    fn test_parse_cpus() {
        assert_eq!(parse_cpus("2").unwrap(), 2_000_000_000);
        assert_eq!(parse_cpus("0.5").unwrap(), 500_000_000);
        assert!(parse_cpus("-1").is_err());
    }

    #[test]
    fn test_container_config_mounts_and_limits() {
        let runner = RunnerConfig {
            cache_root: PathBuf::from("/var/cache/conveyor"),
            ..Default::default()
        };
        let request = ExecutionRequest {
            run_id: RunId::new(),
            job: "build".to_string(),
            attempt: 1,
            image: Some("rust:1.83".to_string()),
            commands: vec!["cargo build".to_string()],
            env: HashMap::from([("CI".to_string(), "true".to_string())]),
            workspace: PathBuf::from("/tmp/run/build"),
            cache: Some(CacheSpec {
                key: Some("cargo".into()),
                paths: vec!["target/".into()],
            }),
            resources: Some(ResourceRequirements {
                cpu: Some("2".into()),
                memory: Some("1g".into()),
            }),
            timeout: Duration::from_secs(60),
        };

        let config = container_config(&runner, "rust:1.83", &request).unwrap();
        let host = config.host_config.unwrap();
        assert_eq!(
            host.binds.unwrap(),
            vec![
                "/tmp/run/build:/workspace".to_string(),
                "/var/cache/conveyor/cargo:/cache".to_string()
            ]
        );
        assert_eq!(host.memory, Some(1024 * 1024 * 1024));
        assert_eq!(host.nano_cpus, Some(2_000_000_000));
        let env = config.env.unwrap();
        assert!(env.contains(&"CI=true".to_string()));
        assert!(env.contains(&"CI_CACHE_DIR=/cache".to_string()));
        assert_eq!(config.cmd.unwrap()[2], "set -e\ncargo build\n");
    }
}
