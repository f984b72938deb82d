//! Classified retry with exponential backoff and provider failover

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::errors::classifier::{classify, ErrorContext, ErrorKind, ErrorLog};
use crate::providers::ProviderPool;

/// Backoff parameters for one retried operation.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub backoff_multiplier: f64,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Delay before retrying after the given zero-based attempt:
    /// `min(base * multiplier^attempt, max)`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let scaled = self.base_delay.as_millis() as f64 * self.backoff_multiplier.powi(attempt as i32);
        let capped = scaled.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }
}

/// Runs fallible operations with classification-aware retries.
///
/// Network-classified failures rotate the active provider before the next
/// attempt; non-retryable classifications abort immediately. Every
/// classified failure lands in the shared error log.
#[derive(Clone)]
pub struct RetryCoordinator {
    providers: Arc<ProviderPool>,
    error_log: Arc<ErrorLog>,
}

impl RetryCoordinator {
    pub fn new(providers: Arc<ProviderPool>, error_log: Arc<ErrorLog>) -> Self {
        Self {
            providers,
            error_log,
        }
    }

    pub fn error_log(&self) -> &Arc<ErrorLog> {
        &self.error_log
    }

    pub fn providers(&self) -> &Arc<ProviderPool> {
        &self.providers
    }

    /// Execute `op` with retries per `policy`.
    ///
    /// `op` is invoked at most `max_retries + 1` times. After exhausting
    /// retries the original (final) failure is re-raised; classification
    /// and logging have already happened by then.
    pub async fn retry_operation<T, F, Fut>(
        &self,
        mut op: F,
        context: ErrorContext,
        policy: &RetryPolicy,
    ) -> anyhow::Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let mut attempt: u32 = 0;
        loop {
            match op().await {
                Ok(value) => {
                    if attempt > 0 {
                        info!(
                            operation = %context.operation,
                            "operation succeeded after {} retries",
                            attempt
                        );
                    }
                    return Ok(value);
                }
                Err(err) => {
                    let details = classify(&err, context.clone());
                    let kind = details.kind;
                    let should_retry = details.should_retry;
                    self.error_log.record(details);

                    if !should_retry {
                        debug!(
                            operation = %context.operation,
                            kind = kind.as_str(),
                            "non-retryable failure, aborting"
                        );
                        return Err(err);
                    }
                    if attempt >= policy.max_retries {
                        warn!(
                            operation = %context.operation,
                            "retries exhausted after {} attempts",
                            attempt + 1
                        );
                        return Err(err);
                    }

                    if kind == ErrorKind::Network {
                        if let Some(url) = self.providers.switch_provider() {
                            info!(operation = %context.operation, "switched provider to {}", url);
                        }
                    }

                    let delay = policy.delay_for_attempt(attempt);
                    debug!(
                        operation = %context.operation,
                        "attempt {} failed ({}), retrying in {:?}",
                        attempt + 1,
                        kind.as_str(),
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}
