//! HTTP channel implementations.

use crate::channels::{ChannelConfig, DiscordConfig, HttpMethod, SlackConfig, WebhookConfig};
use async_trait::async_trait;
use conveyor_core::ports::{Notification, NotificationChannel, Priority};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Channel not configured: {0}")]
    NotConfigured(String),
    #[error("Delivery failed: {0}")]
    DeliveryFailed(String),
}

impl From<NotifyError> for conveyor_core::Error {
    fn from(err: NotifyError) -> Self {
        conveyor_core::Error::NotificationDelivery(err.to_string())
    }
}

fn client(timeout_seconds: u64) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_seconds))
        .build()
        .unwrap_or_default()
}

async fn check(channel: &str, response: reqwest::Response) -> Result<(), NotifyError> {
    let status = response.status();
    if status.is_success() {
        return Ok(());
    }
    let body = response.text().await.unwrap_or_default();
    Err(NotifyError::DeliveryFailed(format!("{channel} returned {status}: {body}")))
}

fn outcome_color(notification: &Notification) -> u32 {
    match (notification.outcome.as_str(), notification.priority) {
        (_, Priority::Critical) => 0x8b0000,
        ("succeeded" | "success", _) => 0x36a64f,
        ("failed", _) => 0xdc3545,
        ("canceled" | "blocked", _) => 0x6c757d,
        _ => 0x0366d6,
    }
}

fn short_fields(notification: &Notification) -> Vec<(&str, String)> {
    let mut fields = vec![
        ("Pipeline", notification.pipeline.clone()),
        ("Ref", notification.ref_name.clone()),
    ];
    if let Some(job) = &notification.job {
        fields.push(("Job", job.clone()));
    }
    if let Some(env) = &notification.environment {
        fields.push(("Environment", env.clone()));
    }
    let mut extra: Vec<_> = notification.fields.iter().collect();
    extra.sort();
    fields.extend(extra.into_iter().map(|(k, v)| (k.as_str(), v.clone())));
    fields
}

/// Slack incoming webhook.
pub struct SlackChannel {
    name: String,
    config: SlackConfig,
    client: reqwest::Client,
}

impl SlackChannel {
    pub fn new(name: impl Into<String>, config: SlackConfig) -> Self {
        Self {
            name: name.into(),
            config,
            client: client(10),
        }
    }

    fn build_message(&self, notification: &Notification) -> serde_json::Value {
        let fields: Vec<_> = short_fields(notification)
            .into_iter()
            .map(|(title, value)| serde_json::json!({"title": title, "value": value, "short": true}))
            .collect();
        let mut message = serde_json::json!({
            "username": self.config.username,
            "icon_emoji": self.config.icon_emoji,
            "attachments": [{
                "color": format!("#{:06x}", outcome_color(notification)),
                "title": notification.title,
                "title_link": notification.url,
                "text": notification.message,
                "fields": fields,
                "ts": notification.created_at.timestamp()
            }]
        });
        if let Some(channel) = &self.config.channel {
            message["channel"] = serde_json::json!(channel);
        }
        message
    }
}

#[async_trait]
impl NotificationChannel for SlackChannel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, notification: &Notification) -> conveyor_core::Result<()> {
        if self.config.webhook_url.is_empty() {
            return Err(NotifyError::NotConfigured(self.name.clone()).into());
        }
        debug!(channel = %self.name, "Sending Slack notification");
        let response = self
            .client
            .post(&self.config.webhook_url)
            .json(&self.build_message(notification))
            .send()
            .await
            .map_err(NotifyError::from)?;
        Ok(check("Slack", response).await?)
    }
}

/// Discord webhook.
pub struct DiscordChannel {
    name: String,
    config: DiscordConfig,
    client: reqwest::Client,
}

impl DiscordChannel {
    pub fn new(name: impl Into<String>, config: DiscordConfig) -> Self {
        Self {
            name: name.into(),
            config,
            client: client(10),
        }
    }

    fn build_embed(&self, notification: &Notification) -> serde_json::Value {
        let fields: Vec<_> = short_fields(notification)
            .into_iter()
            .map(|(name, value)| serde_json::json!({"name": name, "value": value, "inline": true}))
            .collect();
        serde_json::json!({
            "username": self.config.username,
            "avatar_url": self.config.avatar_url,
            "embeds": [{
                "title": notification.title,
                "url": notification.url,
                "description": notification.message,
                "color": outcome_color(notification),
                "fields": fields,
                "timestamp": notification.created_at.to_rfc3339()
            }]
        })
    }
}

#[async_trait]
impl NotificationChannel for DiscordChannel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, notification: &Notification) -> conveyor_core::Result<()> {
        if self.config.webhook_url.is_empty() {
            return Err(NotifyError::NotConfigured(self.name.clone()).into());
        }
        debug!(channel = %self.name, "Sending Discord notification");
        let response = self
            .client
            .post(&self.config.webhook_url)
            .json(&self.build_embed(notification))
            .send()
            .await
            .map_err(NotifyError::from)?;
        Ok(check("Discord", response).await?)
    }
}

/// Posts the notification JSON to an arbitrary endpoint.
pub struct WebhookChannel {
    name: String,
    config: WebhookConfig,
    client: reqwest::Client,
}

impl WebhookChannel {
    pub fn new(name: impl Into<String>, config: WebhookConfig) -> Self {
        let client = client(config.timeout_seconds);
        Self {
            name: name.into(),
            config,
            client,
        }
    }
}

#[async_trait]
impl NotificationChannel for WebhookChannel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, notification: &Notification) -> conveyor_core::Result<()> {
        if self.config.url.is_empty() {
            return Err(NotifyError::NotConfigured(self.name.clone()).into());
        }
        debug!(channel = %self.name, url = %self.config.url, "Sending webhook notification");

        let mut request = match self.config.method {
            HttpMethod::Post => self.client.post(&self.config.url),
            HttpMethod::Put => self.client.put(&self.config.url),
        };
        for (key, value) in &self.config.headers {
            request = request.header(key, value);
        }
        if let Some(token) = &self.config.bearer_token {
            request = request.bearer_auth(token);
        }

        let response = request.json(notification).send().await.map_err(NotifyError::from)?;
        Ok(check("Webhook", response).await?)
    }
}

/// Build the channel described by `config`.
pub fn create_channel(name: &str, config: &ChannelConfig) -> Arc<dyn NotificationChannel> {
    match config {
        ChannelConfig::Slack(c) => Arc::new(SlackChannel::new(name, c.clone())),
        ChannelConfig::Discord(c) => Arc::new(DiscordChannel::new(name, c.clone())),
        ChannelConfig::Webhook(c) => Arc::new(WebhookChannel::new(name, c.clone())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use conveyor_core::ids::{NotificationId, RunId};
    use std::collections::HashMap;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn notification(priority: Priority) -> Notification {
        Notification {
            id: NotificationId::new(),
            run_id: RunId::new(),
            pipeline: "webapp".into(),
            project: "acme/webapp".into(),
            ref_name: "1.2.3".into(),
            job: Some("deploy_production".into()),
            environment: Some("production".into()),
            url: Some("https://example.com".into()),
            outcome: "failed".into(),
            title: "Deployment to production failed".into(),
            message: "deploy_production failed".into(),
            priority,
            fields: HashMap::from([("Attempt".to_string(), "3".to_string())]),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_slack_message_shape() {
        let channel = SlackChannel::new(
            "slack",
            SlackConfig {
                channel: Some("#deploys".into()),
                ..Default::default()
            },
        );
        let message = channel.build_message(&notification(Priority::High));
        assert_eq!(message["channel"], "#deploys");
        assert_eq!(message["attachments"][0]["color"], "#dc3545");
        assert_eq!(message["attachments"][0]["title_link"], "https://example.com");
        let critical = channel.build_message(&notification(Priority::Critical));
        assert_eq!(critical["attachments"][0]["color"], "#8b0000");
    }

    #[test]
    fn test_discord_embed_fields() {
        let channel = DiscordChannel::new("discord", DiscordConfig::default());
        let embed = channel.build_embed(&notification(Priority::High));
        let fields = embed["embeds"][0]["fields"].as_array().unwrap();
        let names: Vec<_> = fields.iter().map(|f| f["name"].as_str().unwrap()).collect();
        assert_eq!(names, vec!["Pipeline", "Ref", "Job", "Environment", "Attempt"]);
    }

    #[tokio::test]
    async fn test_webhook_posts_notification() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/hook"))
            .and(header("authorization", "Bearer t0k"))
            .and(header("x-source", "conveyor"))
            .and(body_partial_json(serde_json::json!({
                "pipeline": "webapp",
                "priority": "critical",
                "environment": "production"
            })))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let channel = WebhookChannel::new(
            "ops",
            WebhookConfig {
                url: format!("{}/hook", server.uri()),
                method: HttpMethod::Put,
                headers: HashMap::from([("x-source".to_string(), "conveyor".to_string())]),
                bearer_token: Some("t0k".into()),
                ..Default::default()
            },
        );
        channel.send(&notification(Priority::Critical)).await.unwrap();
    }

    #[tokio::test]
    async fn test_rejected_delivery_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let channel = SlackChannel::new(
            "slack",
            SlackConfig {
                webhook_url: server.uri(),
                ..Default::default()
            },
        );
        let err = channel.send(&notification(Priority::High)).await.unwrap_err();
        assert!(matches!(err, conveyor_core::Error::NotificationDelivery(_)));
        assert!(err.to_string().contains("boom"));
    }

    #[tokio::test]
    async fn test_unconfigured_channel() {
        let channel = create_channel("empty", &ChannelConfig::Discord(DiscordConfig::default()));
        assert_eq!(channel.name(), "empty");
        assert!(channel.send(&notification(Priority::Low)).await.is_err());
    }
}
