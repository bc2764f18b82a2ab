//! CLI settings.

use anyhow::{Context, Result, bail};
use conveyor_notify::{
    ChannelConfig, ChannelSettings, DiscordConfig, NotificationFilter, NotifierConfig, SlackConfig,
    WebhookConfig,
};
use conveyor_runner::{RunnerConfig, RuntimeKind};
use conveyor_scheduler::EngineConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Settings stored in the user's config directory.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CliSettings {
    /// Default project path for runs.
    #[serde(default)]
    pub project: Option<String>,
    /// Runtime used for jobs.
    #[serde(default)]
    pub runtime: RuntimeKind,
    #[serde(default)]
    pub max_parallel_jobs: Option<usize>,
    #[serde(default)]
    pub workspace_root: Option<PathBuf>,
    #[serde(default)]
    pub artifacts_dir: Option<PathBuf>,
    /// Engine configuration file applied before these overrides.
    #[serde(default)]
    pub engine_config: Option<PathBuf>,
    /// Notification channels file (YAML).
    #[serde(default)]
    pub notifications: Option<PathBuf>,
    /// Quality gate endpoint.
    #[serde(default)]
    pub quality_gate_url: Option<String>,
}

const KEYS: &[&str] = &[
    "project",
    "runtime",
    "max_parallel_jobs",
    "workspace_root",
    "artifacts_dir",
    "engine_config",
    "notifications",
    "quality_gate_url",
];

impl CliSettings {
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&content).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_yaml::to_string(self)?)
            .with_context(|| format!("writing {}", path.display()))
    }

    pub fn config_path() -> Result<PathBuf> {
        let dirs = directories::ProjectDirs::from("dev", "conveyor", "conveyor")
            .context("could not determine the config directory")?;
        Ok(dirs.config_dir().join("config.yaml"))
    }

    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        let path = || Some(PathBuf::from(value));
        match key {
            "project" => self.project = Some(value.to_string()),
            "runtime" => {
                self.runtime = match value {
                    "auto" => RuntimeKind::Auto,
                    "shell" => RuntimeKind::Shell,
                    "docker" => RuntimeKind::Docker,
                    _ => bail!("invalid runtime '{value}' (expected auto, shell or docker)"),
                }
            }
            "max_parallel_jobs" => {
                let max: usize = value
                    .parse()
                    .with_context(|| format!("max_parallel_jobs must be a number, got '{value}'"))?;
                self.max_parallel_jobs = Some(max);
            }
            "workspace_root" => self.workspace_root = path(),
            "artifacts_dir" => self.artifacts_dir = path(),
            "engine_config" => self.engine_config = path(),
            "notifications" => self.notifications = path(),
            "quality_gate_url" => self.quality_gate_url = Some(value.to_string()),
            _ => bail!("unknown config key '{key}' (known keys: {})", KEYS.join(", ")),
        }
        Ok(())
    }

    /// Engine configuration: file first, then these settings.
    pub fn engine_config(&self, file: Option<&Path>) -> Result<EngineConfig> {
        let mut config = match file.or(self.engine_config.as_deref()) {
            Some(path) => EngineConfig::from_file(path)
                .with_context(|| format!("loading engine config {}", path.display()))?,
            None => EngineConfig::default(),
        };
        if let Some(max) = self.max_parallel_jobs {
            config = config.with_max_parallel_jobs(max);
        }
        if let Some(root) = &self.workspace_root {
            config = config.with_workspace_root(root);
        }
        Ok(config)
    }

    pub fn runner_config(&self) -> RunnerConfig {
        RunnerConfig {
            kind: self.runtime,
            ..Default::default()
        }
    }

    /// Channels from the notifications file plus webhook URLs from the environment.
    pub fn notifier_config(&self) -> Result<NotifierConfig> {
        let mut config = match &self.notifications {
            Some(path) => {
                let content = std::fs::read_to_string(path)
                    .with_context(|| format!("reading {}", path.display()))?;
                serde_yaml::from_str(&content)
                    .with_context(|| format!("parsing {}", path.display()))?
            }
            None => NotifierConfig::default(),
        };
        config.channels.extend(channels_from_env(|key| std::env::var(key).ok()));
        Ok(config)
    }
}

fn env_channel(name: &str, config: ChannelConfig) -> ChannelSettings {
    ChannelSettings {
        name: name.to_string(),
        enabled: true,
        config,
        triggers: Vec::new(),
        filters: NotificationFilter::default(),
    }
}

/// `CONVEYOR_SLACK_WEBHOOK`, `CONVEYOR_DISCORD_WEBHOOK` and `CONVEYOR_WEBHOOK_URL`.
fn channels_from_env(var: impl Fn(&str) -> Option<String>) -> Vec<ChannelSettings> {
    let mut channels = Vec::new();
    if let Some(url) = var("CONVEYOR_SLACK_WEBHOOK") {
        channels.push(env_channel(
            "slack",
            ChannelConfig::Slack(SlackConfig {
                webhook_url: url,
                ..Default::default()
            }),
        ));
    }
    if let Some(url) = var("CONVEYOR_DISCORD_WEBHOOK") {
        channels.push(env_channel(
            "discord",
            ChannelConfig::Discord(DiscordConfig {
                webhook_url: url,
                ..Default::default()
            }),
        ));
    }
    if let Some(url) = var("CONVEYOR_WEBHOOK_URL") {
        channels.push(env_channel(
            "webhook",
            ChannelConfig::Webhook(WebhookConfig {
                url,
                ..Default::default()
            }),
        ));
    }
    channels
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_set_and_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");

        let mut settings = CliSettings::default();
        settings.set("runtime", "shell").unwrap();
        settings.set("max_parallel_jobs", "8").unwrap();
        settings.set("project", "acme/webapp").unwrap();
        settings.save_to(&path).unwrap();

        let loaded = CliSettings::load_from(&path).unwrap();
        assert_eq!(loaded.runtime, RuntimeKind::Shell);
        assert_eq!(loaded.max_parallel_jobs, Some(8));
        assert_eq!(loaded.project.as_deref(), Some("acme/webapp"));
    }

    #[test]
    fn test_invalid_values() {
        let mut settings = CliSettings::default();
        assert!(settings.set("runtime", "vm").is_err());
        assert!(settings.set("max_parallel_jobs", "many").is_err());
        let err = settings.set("colour", "blue").unwrap_err();
        assert!(err.to_string().contains("known keys"));
    }

    #[test]
    fn test_engine_config_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("engine.yaml");
        std::fs::write(&file, "max_parallel_jobs: 2\ndefault_job_timeout_minutes: 15\n").unwrap();

        let settings = CliSettings {
            max_parallel_jobs: Some(6),
            ..Default::default()
        };
        let config = settings.engine_config(Some(&file)).unwrap();
        assert_eq!(config.max_parallel_jobs, 6);
        assert_eq!(config.default_job_timeout_minutes, 15);
    }

    #[test]
    fn test_channels_from_env() {
        let channels = channels_from_env(|key| match key {
            "CONVEYOR_SLACK_WEBHOOK" => Some("https://hooks.slack.test/x".to_string()),
            "CONVEYOR_WEBHOOK_URL" => Some("https://ops.test/hook".to_string()),
            _ => None,
        });
        let names: Vec<_> = channels.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["slack", "webhook"]);
    }
}
