//! In-process event bus with subject wildcards.

use async_trait::async_trait;
use conveyor_core::Result;
use conveyor_core::events::Event;
use conveyor_core::ports::{EventBus, EventStream};
use futures::stream;
use tokio::sync::broadcast;
use tracing::{debug, warn};

const DEFAULT_CAPACITY: usize = 1024;

/// Match a subject against a pattern.
///
/// `*` matches exactly one token, `>` matches one or more trailing tokens.
pub fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut pattern_tokens = pattern.split('.');
    let mut subject_tokens = subject.split('.');

    loop {
        match (pattern_tokens.next(), subject_tokens.next()) {
            (Some(">"), Some(_)) => return true,
            (Some("*"), Some(_)) => continue,
            (Some(p), Some(s)) if p == s => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Event bus backed by a tokio broadcast channel.
///
/// Publishing never fails; events published with no subscriber are dropped.
#[derive(Clone)]
pub struct InMemoryEventBus {
    sender: broadcast::Sender<Event>,
}

impl InMemoryEventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for InMemoryEventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventBus for InMemoryEventBus {
    async fn publish(&self, event: Event) -> Result<()> {
        debug!(subject = %event.subject(), "Publishing event");
        let _ = self.sender.send(event);
        Ok(())
    }

    async fn subscribe(&self, pattern: &str) -> Result<EventStream> {
        debug!(pattern, "Subscribing");
        let receiver = self.sender.subscribe();
        let pattern = pattern.to_string();

        let events = stream::unfold((receiver, pattern), |(mut receiver, pattern)| async move {
            loop {
                match receiver.recv().await {
                    Ok(event) => {
                        if subject_matches(&pattern, &event.subject()) {
                            return Some((Ok(event), (receiver, pattern)));
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(pattern = %pattern, skipped, "Subscriber lagged, events dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });

        Ok(Box::pin(events))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use conveyor_core::events::StageCompletedPayload;
    use conveyor_core::ids::RunId;
    use futures::StreamExt;

    #[test]
    fn test_subject_matching() {
        assert!(subject_matches("run.*.job.*.failed", "run.run_1.job.build.failed"));
        assert!(!subject_matches("run.*.job.*.failed", "run.run_1.job.build.succeeded"));
        assert!(subject_matches("deployment.>", "deployment.failed.production"));
        assert!(!subject_matches("deployment.>", "deployment"));
        assert!(subject_matches("approval.requested.apr_1", "approval.requested.apr_1"));
        assert!(!subject_matches("approval.*", "approval.requested.apr_1"));
        assert!(!subject_matches("run.*.stage", "run.x"));
    }

    fn stage_event(stage: &str) -> Event {
        Event::StageCompleted(StageCompletedPayload {
            run_id: RunId::new(),
            stage: stage.to_string(),
            passed: true,
            completed_at: Utc::now(),
        })
    }

    #[tokio::test]
    async fn test_subscribe_filters() {
        let bus = InMemoryEventBus::new();
        let mut stream = bus.subscribe("run.*.stage.deploy.>").await.unwrap();

        bus.publish(stage_event("build")).await.unwrap();
        bus.publish(stage_event("deploy")).await.unwrap();

        let event = stream.next().await.unwrap().unwrap();
        match event {
            Event::StageCompleted(p) => assert_eq!(p.stage, "deploy"),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let bus = InMemoryEventBus::new();
        assert_eq!(bus.subscriber_count(), 0);
        bus.publish(stage_event("build")).await.unwrap();
    }
}
