// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Node retry with exponential backoff.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::definition::{NodeDefinition, RetryPolicy};
use crate::error::{EngineError, Result};

/// Upper bound for a single backoff sleep.
const MAX_BACKOFF_MS: u64 = 60_000;

/// Effective retry settings for one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryConfig {
    /// Retries after the first attempt (0 = one attempt only).
    pub max_retries: u32,
    /// Delay before the first retry in milliseconds.
    pub delay_ms: u64,
}

impl RetryConfig {
    /// Node config `retryCount`/`retryDelay` override the workflow policy.
    pub fn for_node(node: &NodeDefinition, policy: &RetryPolicy) -> Self {
        match node.config_u64("retryCount").filter(|n| *n > 0) {
            Some(count) => Self {
                max_retries: u32::try_from(count).unwrap_or(u32::MAX),
                delay_ms: node.config_u64("retryDelay").unwrap_or(1000),
            },
            None => Self {
                max_retries: policy.max_retries,
                delay_ms: policy.backoff_ms,
            },
        }
    }

    /// Delay before retry `attempt` (1-indexed): `delay * 2^(attempt-1)`, capped.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let multiplier = 2u64.saturating_pow(attempt.saturating_sub(1));
        Duration::from_millis(self.delay_ms.saturating_mul(multiplier).min(MAX_BACKOFF_MS))
    }
}

/// Sleeps for `delay` unless the token fires first.
pub async fn cancellable_sleep(delay: Duration, cancel: &CancellationToken) -> Result<()> {
    tokio::select! {
        _ = cancel.cancelled() => Err(EngineError::Cancelled),
        _ = tokio::time::sleep(delay) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_exponential_delays() {
        let cfg = RetryConfig {
            max_retries: 4,
            delay_ms: 100,
        };
        assert_eq!(cfg.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(cfg.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(cfg.delay_for_attempt(4), Duration::from_millis(800));
        assert_eq!(cfg.delay_for_attempt(40), Duration::from_millis(MAX_BACKOFF_MS));
    }

    #[test]
    fn test_node_overrides_policy() {
        let policy = RetryPolicy {
            max_retries: 1,
            backoff_ms: 10,
        };
        let plain: NodeDefinition =
            serde_json::from_value(json!({"id": "a", "type": "http"})).unwrap();
        assert_eq!(
            RetryConfig::for_node(&plain, &policy),
            RetryConfig {
                max_retries: 1,
                delay_ms: 10
            }
        );

        let tuned: NodeDefinition = serde_json::from_value(
            json!({"id": "b", "type": "http", "config": {"retryCount": 3, "retryDelay": 250}}),
        )
        .unwrap();
        assert_eq!(
            RetryConfig::for_node(&tuned, &policy),
            RetryConfig {
                max_retries: 3,
                delay_ms: 250
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_observes_cancel() {
        let token = CancellationToken::new();
        token.cancel();
        let err = cancellable_sleep(Duration::from_secs(30), &token)
            .await
            .unwrap_err();
        assert_eq!(err, EngineError::Cancelled);
    }
}
