use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::ExecutorError;

/// Backoff between caller-driven retries. `max_attempts <= 0` means the
/// attempt budget comes from the task (`max_retries + 1`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub interval_ms: u64,
    pub max_interval_ms: u64,
    pub max_attempts: i32,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            interval_ms: 1_000,
            max_interval_ms: 30_000,
            max_attempts: -1,
            multiplier: 2.0,
        }
    }
}

pub struct RetryExecutor {
    policy: RetryPolicy,
}

impl RetryExecutor {
    pub fn new(policy: Option<RetryPolicy>) -> Self {
        let mut policy = policy.unwrap_or_default();

        if policy.interval_ms == 0 {
            policy.interval_ms = 1_000;
        }
        if policy.max_interval_ms == 0 {
            policy.max_interval_ms = 30_000;
        }
        if policy.multiplier <= 0.0 {
            policy.multiplier = 2.0;
        }
        if policy.max_interval_ms > 150_000 {
            policy.max_interval_ms = 150_000;
        }

        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Runs `operation` up to `max_attempts` times, sleeping the backoff
    /// between failures. `should_retry` sees each error and may stop early;
    /// the last error is returned when the budget runs out.
    pub async fn execute_with_retry<F, Fut, T, R>(
        &self,
        ctx: CancellationToken,
        task_id: &str,
        max_attempts: u32,
        mut should_retry: R,
        mut operation: F,
    ) -> Result<T, ExecutorError>
    where
        F: FnMut(u32) -> Fut,
        Fut: std::future::Future<Output = Result<T, ExecutorError>>,
        R: FnMut(&ExecutorError) -> bool,
    {
        let max_attempts = max_attempts.max(1);
        let mut last_error = None;

        for attempt in 1..=max_attempts {
            if ctx.is_cancelled() {
                return Err(ExecutorError::TaskCancelled {
                    task_id: task_id.to_string(),
                    message: format!("retry loop cancelled before attempt {}", attempt),
                });
            }

            let err = match operation(attempt).await {
                Ok(result) => return Ok(result),
                Err(e) => e,
            };
            let retryable = should_retry(&err);

            if attempt == max_attempts || !retryable {
                last_error = Some(err);
                break;
            }

            let wait_time = self.calculate_backoff(attempt);
            debug!(
                event = "task_retry_scheduled",
                task_id,
                attempt,
                backoff_ms = wait_time.as_millis() as u64,
                "retrying after failure: {}",
                err
            );
            last_error = Some(err);

            tokio::select! {
                _ = ctx.cancelled() => {
                    return Err(ExecutorError::TaskCancelled {
                        task_id: task_id.to_string(),
                        message: "retry loop cancelled during backoff".to_string(),
                    });
                }
                _ = sleep(wait_time) => {}
            }
        }

        Err(last_error.unwrap_or_else(|| ExecutorError::TaskExecution {
            task_id: task_id.to_string(),
            message: format!("task failed after {} attempts", max_attempts),
        }))
    }

    pub fn calculate_backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let backoff_ms = self.policy.interval_ms as f64 * self.policy.multiplier.powi(exponent);
        let capped = backoff_ms.min(self.policy.max_interval_ms as f64);
        Duration::from_millis(capped as u64)
    }
}
