//! Pending approval gates.
//!
//! Waiting on a gate is event driven through a `watch` channel. There is no
//! timeout path: a gate only leaves `pending` when someone decides it or its
//! run is canceled.

use chrono::Utc;
use conveyor_core::approval::{ApprovalGate, ApprovalStatus, Approver, ApproverAction};
use conveyor_core::events::{ApprovalDecidedPayload, ApprovalRequestedPayload, Event};
use conveyor_core::ids::{ApprovalToken, RunId};
use conveyor_core::ports::EventBus;
use conveyor_core::{Error, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tracing::{info, warn};

struct Entry {
    gate: ApprovalGate,
    decision: watch::Sender<ApprovalStatus>,
}

/// Registry of approval gates for every run of an engine.
pub struct ApprovalRegistry {
    gates: Mutex<HashMap<ApprovalToken, Entry>>,
    event_bus: Arc<dyn EventBus>,
}

impl ApprovalRegistry {
    pub fn new(event_bus: Arc<dyn EventBus>) -> Self {
        Self {
            gates: Mutex::new(HashMap::new()),
            event_bus,
        }
    }

    fn gates(&self) -> MutexGuard<'_, HashMap<ApprovalToken, Entry>> {
        self.gates.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a gate and announce it.
    pub async fn request(&self, gate: ApprovalGate) -> (ApprovalToken, watch::Receiver<ApprovalStatus>) {
        let token = gate.token;
        let (tx, rx) = watch::channel(ApprovalStatus::Pending);
        let payload = ApprovalRequestedPayload {
            run_id: gate.run_id,
            token,
            job: gate.job.clone(),
            environment: gate.environment.clone(),
            requested_at: Utc::now(),
        };

        info!(token = %token, job = %gate.job, "Approval requested");
        self.gates().insert(token, Entry { gate, decision: tx });
        self.publish(Event::ApprovalRequested(payload)).await;
        (token, rx)
    }

    pub fn get(&self, token: ApprovalToken) -> Option<ApprovalGate> {
        self.gates().get(&token).map(|e| e.gate.clone())
    }

    /// Gates still waiting for a decision, oldest first.
    pub fn pending(&self) -> Vec<ApprovalGate> {
        let mut gates: Vec<_> = self
            .gates()
            .values()
            .filter(|e| e.gate.is_pending())
            .map(|e| e.gate.clone())
            .collect();
        gates.sort_by_key(|g| g.created_at);
        gates
    }

    pub async fn approve(
        &self,
        token: ApprovalToken,
        user: &str,
        comment: Option<String>,
    ) -> Result<ApprovalGate> {
        self.decide(token, user, comment, ApproverAction::Approved).await
    }

    pub async fn reject(
        &self,
        token: ApprovalToken,
        user: &str,
        comment: Option<String>,
    ) -> Result<ApprovalGate> {
        self.decide(token, user, comment, ApproverAction::Rejected).await
    }

    async fn decide(
        &self,
        token: ApprovalToken,
        user: &str,
        comment: Option<String>,
        action: ApproverAction,
    ) -> Result<ApprovalGate> {
        let mut approver = Approver::new(user, action);
        approver.comment = comment.clone();

        let gate = {
            let mut gates = self.gates();
            let entry = gates
                .get_mut(&token)
                .ok_or_else(|| Error::ApprovalNotFound(token.to_string()))?;
            match action {
                ApproverAction::Approved => entry.gate.approve(approver)?,
                ApproverAction::Rejected => entry.gate.reject(approver)?,
            }
            entry.decision.send_replace(entry.gate.status);
            entry.gate.clone()
        };

        info!(token = %token, job = %gate.job, user, status = ?gate.status, "Approval decided");
        let payload = ApprovalDecidedPayload {
            run_id: gate.run_id,
            token,
            job: gate.job.clone(),
            user: user.to_string(),
            comment,
            decided_at: Utc::now(),
        };
        let event = match action {
            ApproverAction::Approved => Event::ApprovalGranted(payload),
            ApproverAction::Rejected => Event::ApprovalRejected(payload),
        };
        self.publish(event).await;
        Ok(gate)
    }

    /// Close every pending gate of a run.
    pub fn cancel_run(&self, run_id: RunId) -> usize {
        let mut gates = self.gates();
        let mut canceled = 0;
        for entry in gates.values_mut().filter(|e| e.gate.run_id == run_id) {
            if entry.gate.is_pending() {
                entry.gate.cancel();
                entry.decision.send_replace(entry.gate.status);
                canceled += 1;
            }
        }
        canceled
    }

    /// Drop the gates of a finished run.
    pub fn forget_run(&self, run_id: RunId) {
        self.gates().retain(|_, e| e.gate.run_id != run_id);
    }

    async fn publish(&self, event: Event) {
        if let Err(e) = self.event_bus.publish(event).await {
            warn!(error = %e, "Failed to publish approval event");
        }
    }
}

/// Wait until a gate leaves `pending`.
pub async fn wait_for_decision(mut decision: watch::Receiver<ApprovalStatus>) -> ApprovalStatus {
    match decision.wait_for(|status| *status != ApprovalStatus::Pending).await {
        Ok(status) => *status,
        // The registry dropped the gate, which only happens when its run ends.
        Err(_) => ApprovalStatus::Canceled,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::InMemoryEventBus;
    use conveyor_core::approval::ApprovalPolicy;
    use futures::StreamExt;

    fn registry() -> (ApprovalRegistry, Arc<InMemoryEventBus>) {
        let bus = Arc::new(InMemoryEventBus::new());
        (ApprovalRegistry::new(bus.clone()), bus)
    }

    #[tokio::test]
    async fn test_approve_wakes_waiter() {
        let (registry, bus) = registry();
        let mut events = bus.subscribe("approval.>").await.unwrap();
        let gate = ApprovalGate::new(RunId::new(), "deploy_production", ApprovalPolicy::default());
        let (token, rx) = registry.request(gate).await;

        let waiter = tokio::spawn(wait_for_decision(rx));
        registry.approve(token, "bob", Some("ship it".into())).await.unwrap();
        assert_eq!(waiter.await.unwrap(), ApprovalStatus::Approved);

        let requested = events.next().await.unwrap().unwrap();
        assert!(matches!(requested, Event::ApprovalRequested(_)));
        let granted = events.next().await.unwrap().unwrap();
        assert!(matches!(granted, Event::ApprovalGranted(p) if p.user == "bob"));
        assert!(registry.pending().is_empty());
    }

    #[tokio::test]
    async fn test_unauthorized_leaves_gate_pending() {
        let (registry, _bus) = registry();
        let policy = ApprovalPolicy {
            approvers: vec!["ops".into()],
            prevent_self_approval: false,
        };
        let gate = ApprovalGate::new(RunId::new(), "deploy", policy);
        let (token, rx) = registry.request(gate).await;

        let err = registry.approve(token, "intern", None).await.unwrap_err();
        assert!(matches!(err, Error::ApprovalDenied { .. }));
        assert_eq!(*rx.borrow(), ApprovalStatus::Pending);
        assert_eq!(registry.pending().len(), 1);
    }

    #[tokio::test]
    async fn test_cancel_run() {
        let (registry, _bus) = registry();
        let run_id = RunId::new();
        let (_, rx) = registry
            .request(ApprovalGate::new(run_id, "deploy", ApprovalPolicy::default()))
            .await;
        assert_eq!(registry.cancel_run(run_id), 1);
        assert_eq!(wait_for_decision(rx).await, ApprovalStatus::Canceled);
    }

    #[tokio::test]
    async fn test_unknown_token() {
        let (registry, _bus) = registry();
        let err = registry.approve(ApprovalToken::new(), "bob", None).await.unwrap_err();
        assert!(matches!(err, Error::ApprovalNotFound(_)));
    }
}
