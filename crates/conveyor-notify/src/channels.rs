//! Notification channel configuration.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Channels configured at engine start.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotifierConfig {
    #[serde(default)]
    pub channels: Vec<ChannelSettings>,
}

/// One configured channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelSettings {
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub config: ChannelConfig,
    /// Events this channel receives. Empty means every trigger.
    #[serde(default)]
    pub triggers: Vec<NotificationTrigger>,
    #[serde(default)]
    pub filters: NotificationFilter,
}

fn default_true() -> bool {
    true
}

/// Channel-specific configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChannelConfig {
    Slack(SlackConfig),
    Discord(DiscordConfig),
    Webhook(WebhookConfig),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlackConfig {
    pub webhook_url: String,
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default = "default_username")]
    pub username: String,
    #[serde(default = "default_icon")]
    pub icon_emoji: String,
}

fn default_username() -> String {
    "Conveyor".to_string()
}

fn default_icon() -> String {
    ":package:".to_string()
}

impl Default for SlackConfig {
    fn default() -> Self {
        Self {
            webhook_url: String::new(),
            channel: None,
            username: default_username(),
            icon_emoji: default_icon(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscordConfig {
    pub webhook_url: String,
    #[serde(default = "default_username")]
    pub username: String,
    #[serde(default)]
    pub avatar_url: Option<String>,
}

impl Default for DiscordConfig {
    fn default() -> Self {
        Self {
            webhook_url: String::new(),
            username: default_username(),
            avatar_url: None,
        }
    }
}

/// Generic JSON webhook receiving the [`Notification`](conveyor_core::ports::Notification) as is.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    pub url: String,
    #[serde(default)]
    pub method: HttpMethod,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub bearer_token: Option<String>,
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,
}

fn default_timeout() -> u64 {
    10
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    #[default]
    Post,
    Put,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            method: HttpMethod::Post,
            headers: HashMap::new(),
            bearer_token: None,
            timeout_seconds: default_timeout(),
        }
    }
}

/// What caused a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationTrigger {
    JobFailed,
    JobCanceled,
    JobBlocked,
    PipelineFailed,
    DeploymentSucceeded,
    DeploymentFailed,
}

/// Restricts a channel to some pipelines, branches or environments.
///
/// Empty lists match everything. Branch entries ending in `*` match by prefix.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotificationFilter {
    #[serde(default)]
    pub pipelines: Vec<String>,
    #[serde(default)]
    pub branches: Vec<String>,
    #[serde(default)]
    pub environments: Vec<String>,
}

impl NotificationFilter {
    pub fn matches(&self, pipeline: &str, ref_name: &str, environment: Option<&str>) -> bool {
        let pipeline_match = self.pipelines.is_empty() || self.pipelines.iter().any(|p| p == pipeline);
        let branch_match = self.branches.is_empty()
            || self.branches.iter().any(|f| match f.strip_suffix('*') {
                Some(prefix) => ref_name.starts_with(prefix),
                None => ref_name == f,
            });
        // Notifications without an environment are not restricted by it.
        let env_match = self.environments.is_empty()
            || environment.is_none_or(|e| self.environments.iter().any(|f| f == e));

        pipeline_match && branch_match && env_match
    }
}
