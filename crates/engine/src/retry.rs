//! Retry with exponential back-off and a per-attempt timeout.
//!
//! Only transport failures (`NodeError::Retryable`) and timeouts are retried;
//! everything else is returned as-is on the first attempt.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::models::NodeConfig;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub timeout: Option<Duration>,
}

impl RetryPolicy {
    pub fn for_node(node: &NodeConfig, config: &EngineConfig) -> Self {
        Self {
            max_retries: node.retries.unwrap_or(config.max_retries),
            base_delay: config.retry_base_delay(),
            max_delay: config.retry_max_delay(),
            timeout: node.timeout().or_else(|| config.default_timeout()),
        }
    }

    /// No retries and no timeout.
    pub fn once() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            timeout: None,
        }
    }

    /// `base * 2^(attempt - 1)`, capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Runs `op` until it succeeds, fails with a non-retryable error, or runs
/// out of retries. `op` receives the 1-based attempt number. Returns the
/// value and the number of attempts made.
pub async fn with_retry<T, F, Fut>(
    node_id: &str,
    policy: &RetryPolicy,
    mut op: F,
) -> Result<(T, u32), EngineError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, EngineError>>,
{
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        let outcome = match policy.timeout {
            Some(limit) => match tokio::time::timeout(limit, op(attempt)).await {
                Ok(outcome) => outcome,
                Err(_) => Err(EngineError::Timeout {
                    node_id: node_id.to_owned(),
                    timeout_ms: limit.as_millis() as u64,
                }),
            },
            None => op(attempt).await,
        };

        match outcome {
            Ok(value) => return Ok((value, attempt)),

            Err(err) if !err.is_retryable() => return Err(err),

            Err(err) => {
                let retries = attempt - 1;
                if retries >= policy.max_retries {
                    // A lone timeout keeps its own kind; exhausted retries are reported as such.
                    if policy.max_retries == 0 {
                        return Err(err);
                    }
                    return Err(EngineError::NodeRetryExhausted {
                        node_id: node_id.to_owned(),
                        attempts: attempt,
                        message: err.to_string(),
                    });
                }

                let delay = policy.delay_for(attempt);
                warn!(
                    node_id,
                    attempt,
                    max_retries = policy.max_retries,
                    ?delay,
                    error = %err,
                    "retryable error, backing off"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}
