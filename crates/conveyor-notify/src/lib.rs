//! Notification channels for Conveyor.
//!
//! [`Notifier`] subscribes to the engine's event bus and delivers job
//! failures, pipeline failures and protected deployments to Slack, Discord
//! or generic webhooks.

pub mod channels;
pub mod notifier;
pub mod sender;

pub use channels::{
    ChannelConfig, ChannelSettings, DiscordConfig, HttpMethod, NotificationFilter,
    NotificationTrigger, NotifierConfig, SlackConfig, WebhookConfig,
};
pub use notifier::{Notifier, NotifierHandle, notification_for};
pub use sender::{DiscordChannel, NotifyError, SlackChannel, WebhookChannel, create_channel};
