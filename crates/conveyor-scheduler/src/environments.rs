//! Exclusive deploy tokens for protected environments.
//!
//! One token exists per concurrency-group key. Waiters queue in FIFO order
//! (tokio's mutex is fair) and the token is released when the holder drops
//! it, including when the holding task is aborted.

use conveyor_core::ids::RunId;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info};

/// Who holds a token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenHolder {
    pub run_id: RunId,
    pub job: String,
}

#[derive(Default)]
struct Slot {
    lock: Arc<tokio::sync::Mutex<()>>,
    holder: Option<TokenHolder>,
    waiting: usize,
}

/// Registry of environment tokens, shared by every run of an engine.
#[derive(Default)]
pub struct EnvironmentLocks {
    slots: Mutex<HashMap<String, Slot>>,
}

impl EnvironmentLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<String, Slot>> {
        // A poisoned map still holds consistent bookkeeping.
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Wait for the token of `key`.
    pub async fn acquire(self: &Arc<Self>, key: &str, holder: TokenHolder) -> EnvironmentToken {
        let lock = {
            let mut slots = self.slots();
            let slot = slots.entry(key.to_string()).or_default();
            slot.waiting += 1;
            slot.lock.clone()
        };

        let waiter = WaitGuard {
            registry: self.clone(),
            key: key.to_string(),
        };
        debug!(key, job = %holder.job, "Waiting for environment token");
        let guard = lock.lock_owned().await;
        drop(waiter);

        info!(key, run_id = %holder.run_id, job = %holder.job, "Environment token acquired");
        if let Some(slot) = self.slots().get_mut(key) {
            slot.holder = Some(holder.clone());
        }

        EnvironmentToken {
            key: key.to_string(),
            holder,
            registry: self.clone(),
            _guard: guard,
        }
    }

    /// Current holder of `key`, if any.
    pub fn holder(&self, key: &str) -> Option<TokenHolder> {
        self.slots().get(key).and_then(|s| s.holder.clone())
    }

    /// Number of jobs queued for `key`.
    pub fn waiting(&self, key: &str) -> usize {
        self.slots().get(key).map_or(0, |s| s.waiting)
    }
}

struct WaitGuard {
    registry: Arc<EnvironmentLocks>,
    key: String,
}

impl Drop for WaitGuard {
    fn drop(&mut self) {
        if let Some(slot) = self.registry.slots().get_mut(&self.key) {
            slot.waiting = slot.waiting.saturating_sub(1);
        }
    }
}

/// Exclusive right to deploy to one concurrency group.
pub struct EnvironmentToken {
    key: String,
    holder: TokenHolder,
    registry: Arc<EnvironmentLocks>,
    _guard: OwnedMutexGuard<()>,
}

impl EnvironmentToken {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for EnvironmentToken {
    fn drop(&mut self) {
        if let Some(slot) = self.registry.slots().get_mut(&self.key)
            && slot.holder.as_ref() == Some(&self.holder)
        {
            slot.holder = None;
        }
        info!(key = %self.key, job = %self.holder.job, "Environment token released");
    }
}

impl std::fmt::Debug for EnvironmentToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnvironmentToken")
            .field("key", &self.key)
            .field("holder", &self.holder)
            .finish()
    }
}
