//! Backoff between job retry attempts.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Backoff policy controlling the delay between retry attempts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackoffPolicy {
    /// No delay between retries.
    None,
    /// Fixed delay between retries.
    Fixed { delay_ms: u64 },
    /// Exponential backoff: base * 2^retry, capped at max.
    Exponential { base_ms: u64, max_ms: u64 },
}

impl BackoffPolicy {
    /// Compute the delay before retry number `retry` (0-indexed).
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        match self {
            BackoffPolicy::None => Duration::ZERO,
            BackoffPolicy::Fixed { delay_ms } => Duration::from_millis(*delay_ms),
            BackoffPolicy::Exponential { base_ms, max_ms } => {
                let millis = base_ms.saturating_mul(2u64.saturating_pow(retry));
                Duration::from_millis(millis.min(*max_ms))
            }
        }
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy::Exponential {
            base_ms: 1_000,
            max_ms: 60_000,
        }
    }
}
