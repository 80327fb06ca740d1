use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use thiserror::Error;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::RetrySection;

use super::error::{BrowserError, BrowserResult};
use super::error_handler::{
    telemetry_failure, AutomationTelemetry, ErrorCategorizer, FailureCategory, RemediationAction,
};
use super::metrics::{record, SharedMetrics};

/// Re-establishes an authenticated session after a `SessionLost` failure.
#[async_trait]
pub trait SessionRecovery: Send + Sync {
    async fn recover(&self) -> BrowserResult<()>;
}

/// Shared plumbing every retried call reports into.
#[derive(Clone)]
pub struct RetryContext {
    pub telemetry: Option<Arc<AutomationTelemetry>>,
    pub metrics: SharedMetrics,
    pub cancel: CancellationToken,
}

#[derive(Debug, Clone)]
pub struct RetryOutcome<T> {
    pub result: T,
    pub attempts: usize,
    pub delays: Vec<Duration>,
}

/// The last classified failure after the policy gave up.
#[derive(Debug, Error)]
#[error("{error} (category {category}, {attempts} attempt(s))")]
pub struct RetryExhausted {
    pub error: BrowserError,
    pub category: FailureCategory,
    pub attempts: usize,
    pub delays: Vec<Duration>,
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: usize,
    base_delay: Duration,
    multiplier: f64,
    max_delay: Duration,
    jitter_ms: u64,
}

impl RetryPolicy {
    pub fn new(config: &RetrySection) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            multiplier: config.multiplier.max(1.0),
            max_delay: Duration::from_millis(config.max_delay_ms.max(config.base_delay_ms)),
            jitter_ms: config.jitter_ms,
        }
    }

    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    /// Delay before attempt `failed + 1`, without jitter.
    pub fn backoff(&self, failed: usize) -> Duration {
        if failed == 0 {
            return Duration::ZERO;
        }
        let exponent = i32::try_from(failed - 1).unwrap_or(i32::MAX);
        let millis = self.base_delay.as_millis() as f64 * self.multiplier.powi(exponent);
        let capped = millis.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }

    fn jitter(&self) -> Duration {
        if self.jitter_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=self.jitter_ms))
    }

    /// Runs `operation` until it succeeds, fails with a non-retryable category,
    /// or `max_attempts` is reached. `operation` receives the 1-based attempt.
    pub async fn run<F, Fut, T>(
        &self,
        label: &str,
        ctx: &RetryContext,
        recovery: Option<&dyn SessionRecovery>,
        mut operation: F,
    ) -> Result<RetryOutcome<T>, RetryExhausted>
    where
        F: FnMut(usize) -> Fut,
        Fut: Future<Output = BrowserResult<T>>,
    {
        let mut delays: Vec<Duration> = Vec::new();
        let mut previous = Duration::ZERO;
        let mut attempt = 0usize;
        loop {
            attempt += 1;
            if ctx.cancel.is_cancelled() {
                return Err(exhausted(BrowserError::Cancelled, attempt - 1, delays));
            }
            let result = tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => Err(BrowserError::Cancelled),
                result = operation(attempt) => result,
            };
            let error = match result {
                Ok(result) => {
                    return Ok(RetryOutcome {
                        result,
                        attempts: attempt,
                        delays,
                    })
                }
                Err(error) => error,
            };

            record(&ctx.metrics, |m| m.record_failed_attempt());
            let category = ErrorCategorizer::categorize(&error);
            if attempt >= self.max_attempts || !category.retryable() {
                self.report(ctx, label, &error, attempt, RemediationAction::Abort);
                warn!(
                    operation = label,
                    attempt,
                    category = %category,
                    error = %error,
                    "giving up"
                );
                return Err(exhausted(error, attempt, delays));
            }

            let delay = (self.backoff(attempt) + self.jitter()).max(previous);
            previous = delay;
            delays.push(delay);
            let delay_ms = delay.as_millis() as u64;
            let action = if category == FailureCategory::SessionLost {
                RemediationAction::Reauthenticate { delay_ms }
            } else {
                RemediationAction::RetryScheduled { delay_ms }
            };
            self.report(ctx, label, &error, attempt, action);
            warn!(
                operation = label,
                attempt,
                category = %category,
                delay_ms,
                error = %error,
                "attempt failed, retrying"
            );

            if !delay.is_zero() {
                tokio::select! {
                    biased;
                    _ = ctx.cancel.cancelled() => {
                        return Err(exhausted(BrowserError::Cancelled, attempt, delays));
                    }
                    _ = sleep(delay) => {}
                }
            }

            if category == FailureCategory::SessionLost {
                if let Some(recovery) = recovery {
                    record(&ctx.metrics, |m| m.record_session_recovery());
                    if let Err(recover_error) = recovery.recover().await {
                        let recover_category = ErrorCategorizer::categorize(&recover_error);
                        if !recover_category.retryable() {
                            self.report(
                                ctx,
                                label,
                                &recover_error,
                                attempt,
                                RemediationAction::Abort,
                            );
                            return Err(exhausted(recover_error, attempt, delays));
                        }
                        debug!(operation = label, error = %recover_error, "re-authentication failed, next attempt will retry");
                    }
                }
            }
            record(&ctx.metrics, |m| m.record_retry());
        }
    }

    fn report(
        &self,
        ctx: &RetryContext,
        label: &str,
        error: &BrowserError,
        attempt: usize,
        action: RemediationAction,
    ) {
        if let Some(telemetry) = ctx.telemetry.as_deref() {
            if let Err(err) = telemetry_failure(telemetry, label, error, attempt, action) {
                warn!(operation = label, error = %err, "failed to record failure telemetry");
            }
        }
    }
}

fn exhausted(error: BrowserError, attempts: usize, delays: Vec<Duration>) -> RetryExhausted {
    RetryExhausted {
        category: ErrorCategorizer::categorize(&error),
        error,
        attempts,
        delays,
    }
}
