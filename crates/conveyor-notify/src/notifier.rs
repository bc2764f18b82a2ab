//! Turns engine events into notifications.
//!
//! The notifier only observes the event bus. Delivery is best-effort:
//! failures are logged and never reach the run that produced the event.

use crate::channels::{NotificationFilter, NotificationTrigger, NotifierConfig};
use crate::sender::create_channel;
use chrono::Utc;
use conveyor_core::events::{
    DeploymentFinishedPayload, Event, JobStatusChangedPayload, RunCompletedPayload,
};
use conveyor_core::ids::NotificationId;
use conveyor_core::ports::{EventBus, Notification, NotificationChannel, Priority};
use conveyor_core::run::{JobStatus, RunStatus};
use conveyor_core::Result;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Log lines included in job failure messages.
const LOG_TAIL_LINES: usize = 10;

struct Route {
    channel: Arc<dyn NotificationChannel>,
    triggers: Vec<NotificationTrigger>,
    filter: NotificationFilter,
}

impl Route {
    fn accepts(&self, trigger: NotificationTrigger, notification: &Notification) -> bool {
        (self.triggers.is_empty() || self.triggers.contains(&trigger))
            && self.filter.matches(
                &notification.pipeline,
                &notification.ref_name,
                notification.environment.as_deref(),
            )
    }
}

/// Dispatches notifications to the configured channels.
#[derive(Default)]
pub struct Notifier {
    routes: Vec<Route>,
}

impl Notifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &NotifierConfig) -> Self {
        config
            .channels
            .iter()
            .filter(|c| c.enabled)
            .fold(Self::new(), |notifier, c| {
                notifier.with_channel(
                    create_channel(&c.name, &c.config),
                    c.triggers.clone(),
                    c.filters.clone(),
                )
            })
    }

    pub fn with_channel(
        mut self,
        channel: Arc<dyn NotificationChannel>,
        triggers: Vec<NotificationTrigger>,
        filter: NotificationFilter,
    ) -> Self {
        self.routes.push(Route {
            channel,
            triggers,
            filter,
        });
        self
    }

    pub fn channel_count(&self) -> usize {
        self.routes.len()
    }

    /// Deliver the notification for `event`, if it warrants one.
    ///
    /// Returns how many channels accepted it.
    pub async fn notify(&self, event: &Event) -> usize {
        let Some((trigger, notification)) = notification_for(event) else {
            return 0;
        };
        let routes: Vec<_> = self
            .routes
            .iter()
            .filter(|r| r.accepts(trigger, &notification))
            .collect();
        if routes.is_empty() {
            debug!(?trigger, "No channel accepts notification");
            return 0;
        }

        let deliveries = routes.iter().map(|route| {
            let notification = &notification;
            async move {
                match route.channel.send(notification).await {
                    Ok(()) => {
                        debug!(channel = route.channel.name(), id = %notification.id, "Notification delivered");
                        true
                    }
                    Err(e) => {
                        warn!(
                            channel = route.channel.name(),
                            run_id = %notification.run_id,
                            error = %e,
                            "Notification delivery failed"
                        );
                        false
                    }
                }
            }
        });
        let delivered = futures::future::join_all(deliveries)
            .await
            .into_iter()
            .filter(|ok| *ok)
            .count();
        info!(?trigger, run_id = %notification.run_id, delivered, "Notification dispatched");
        delivered
    }

    /// Subscribe to every event on `bus` and notify in the background.
    pub async fn spawn(self: Arc<Self>, bus: Arc<dyn EventBus>) -> Result<NotifierHandle> {
        let mut events = bus.subscribe(">").await?;
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    // Drain queued events before honoring shutdown.
                    biased;
                    next = events.next() => match next {
                        Some(Ok(event)) => {
                            self.notify(&event).await;
                        }
                        Some(Err(e)) => warn!(error = %e, "Event stream error"),
                        None => break,
                    },
                    _ = shutdown_rx.changed() => break,
                }
            }
        });
        Ok(NotifierHandle {
            shutdown: shutdown_tx,
            task,
        })
    }
}

/// Background notifier task.
pub struct NotifierHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl NotifierHandle {
    /// Deliver already published events, then stop. Gives up after `grace`.
    pub async fn shutdown(self, grace: Duration) {
        let _ = self.shutdown.send(true);
        let mut task = self.task;
        if tokio::time::timeout(grace, &mut task).await.is_err() {
            warn!("Notifier did not finish in time, abandoning pending notifications");
            task.abort();
        }
    }
}

/// Build the notification an event calls for.
pub fn notification_for(event: &Event) -> Option<(NotificationTrigger, Notification)> {
    match event {
        Event::JobStatusChanged(p) if p.notify => job_notification(p),
        Event::RunCompleted(p) if p.status == RunStatus::Failed => Some((
            NotificationTrigger::PipelineFailed,
            pipeline_failed(p),
        )),
        Event::DeploymentFinished(p) if p.protected => Some(deployment_notification(p)),
        _ => None,
    }
}

fn job_notification(p: &JobStatusChangedPayload) -> Option<(NotificationTrigger, Notification)> {
    let (trigger, priority) = match p.status {
        JobStatus::Failed if p.allow_failure => (NotificationTrigger::JobFailed, Priority::Normal),
        JobStatus::Failed => (NotificationTrigger::JobFailed, Priority::High),
        JobStatus::Canceled => (NotificationTrigger::JobCanceled, Priority::Normal),
        JobStatus::Blocked => (NotificationTrigger::JobBlocked, Priority::Normal),
        _ => return None,
    };

    let mut message = format!("Job {} in stage {} {}", p.job, p.stage, p.status);
    if let Some(reason) = &p.reason {
        message.push_str(&format!(": {reason}"));
    }
    let tail_start = p.log_tail.len().saturating_sub(LOG_TAIL_LINES);
    let tail = &p.log_tail[tail_start..];
    if !tail.is_empty() {
        message.push_str(&format!("\n```\n{}\n```", tail.join("\n")));
    }

    let mut fields = HashMap::from([
        ("Stage".to_string(), p.stage.clone()),
        ("Attempt".to_string(), p.attempt.to_string()),
    ]);
    if let Some(class) = p.failure {
        // FailureClass serializes as its snake_case name.
        if let Ok(serde_json::Value::String(name)) = serde_json::to_value(class) {
            fields.insert("Failure".to_string(), name);
        }
    }

    Some((
        trigger,
        Notification {
            id: NotificationId::new(),
            run_id: p.run_id,
            pipeline: p.pipeline.clone(),
            project: p.project.clone(),
            ref_name: p.ref_name.clone(),
            job: Some(p.job.clone()),
            environment: p.environment.clone(),
            url: None,
            outcome: p.status.to_string(),
            title: format!("{}: job {} {}", p.pipeline, p.job, p.status),
            message,
            priority,
            fields,
            created_at: Utc::now(),
        },
    ))
}

fn pipeline_failed(p: &RunCompletedPayload) -> Notification {
    let message = if p.failed_jobs.is_empty() {
        format!("Pipeline {} failed on {}", p.pipeline, p.ref_name)
    } else {
        format!(
            "Pipeline {} failed on {}. Failed jobs: {}",
            p.pipeline,
            p.ref_name,
            p.failed_jobs.join(", ")
        )
    };
    Notification {
        id: NotificationId::new(),
        run_id: p.run_id,
        pipeline: p.pipeline.clone(),
        project: p.project.clone(),
        ref_name: p.ref_name.clone(),
        job: None,
        environment: None,
        url: None,
        outcome: p.status.to_string(),
        title: format!("{}: pipeline failed", p.pipeline),
        message,
        priority: Priority::High,
        fields: HashMap::from([
            ("Commit".to_string(), p.sha.chars().take(8).collect()),
            ("Duration".to_string(), format!("{}s", p.duration_ms / 1000)),
        ]),
        created_at: Utc::now(),
    }
}

fn deployment_notification(p: &DeploymentFinishedPayload) -> (NotificationTrigger, Notification) {
    let (trigger, priority, outcome) = if p.succeeded {
        (NotificationTrigger::DeploymentSucceeded, Priority::Normal, "succeeded")
    } else {
        (NotificationTrigger::DeploymentFailed, Priority::Critical, "failed")
    };
    let mut message = format!("{} deployed {} to {}", p.job, p.ref_name, p.environment);
    if !p.succeeded {
        message = format!("{} failed to deploy {} to {}", p.job, p.ref_name, p.environment);
    }
    if let Some(url) = &p.url {
        message.push_str(&format!(" ({url})"));
    }

    (
        trigger,
        Notification {
            id: NotificationId::new(),
            run_id: p.run_id,
            pipeline: p.pipeline.clone(),
            project: p.project.clone(),
            ref_name: p.ref_name.clone(),
            job: Some(p.job.clone()),
            environment: Some(p.environment.clone()),
            url: p.url.clone(),
            outcome: outcome.to_string(),
            title: format!("Deployment to {} {outcome}", p.environment),
            message,
            priority,
            fields: HashMap::from([("Commit".to_string(), p.sha.chars().take(8).collect())]),
            created_at: Utc::now(),
        },
    )
}
