//! Retry state machine around one logical request
//!
//! `INIT -> SEND -> { SUCCESS | AUTH_RETRY -> SEND (once) | RATE_LIMIT_WAIT -> SEND
//! | TRANSIENT_RETRY -> SEND | FATAL }`

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use fhir_core::OperationOutcomeIssue;
use rand::Rng;
use tracing::warn;

use super::classify::ClassifiedOutcome;
use crate::config::ClientConfig;
use crate::error::{FhirClientError, Result};
use crate::telemetry::MetricsRegistry;

/// Randomization applied to exponential backoff delays
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Jitter {
    /// Exact `base * 2^n`
    None,
    /// Uniform in `0..=delay`
    Full,
    /// Uniform in `delay/2..=delay`
    Equal,
}

impl Jitter {
    fn apply(self, delay: Duration) -> Duration {
        let millis = delay.as_millis() as u64;
        if millis == 0 {
            return delay;
        }
        let mut rng = rand::thread_rng();
        match self {
            Jitter::None => delay,
            Jitter::Full => Duration::from_millis(rng.gen_range(0..=millis)),
            Jitter::Equal => {
                let half = millis / 2;
                Duration::from_millis(half + rng.gen_range(0..=millis - half))
            }
        }
    }
}

/// What the policy hands the operation for each send
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attempt {
    /// 1-based count of sends in this call chain
    pub number: u32,
    /// The previous send came back 401; get a fresh token first
    pub force_refresh: bool,
}

/// Why a single send did not produce a value
#[derive(Debug)]
pub enum AttemptError {
    /// The response was classified; the policy decides what happens next
    Outcome(ClassifiedOutcome),
    /// Terminal client-side failure (no token, malformed payload)
    Abort(FhirClientError),
}

impl From<ClassifiedOutcome> for AttemptError {
    fn from(outcome: ClassifiedOutcome) -> Self {
        AttemptError::Outcome(outcome)
    }
}

impl From<FhirClientError> for AttemptError {
    fn from(err: FhirClientError) -> Self {
        AttemptError::Abort(err)
    }
}

/// Backoff and retry rules applied to one logical call
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    jitter: Jitter,
    metrics: Arc<MetricsRegistry>,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay: Duration::from_secs(30),
            jitter: Jitter::None,
            metrics: MetricsRegistry::global(),
        }
    }

    pub fn from_config(config: &ClientConfig, metrics: Arc<MetricsRegistry>) -> Self {
        Self::new(config.max_attempts, config.retry_base_delay)
            .with_max_delay(config.retry_max_delay)
            .with_jitter(config.jitter)
            .with_metrics(metrics)
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    pub fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsRegistry>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay before the `retry`-th transient retry (0-based): `base * 2^retry`,
    /// capped at `max_delay`, then jittered
    pub fn backoff_delay(&self, retry: u32) -> Duration {
        let factor = 1u32.checked_shl(retry.min(31)).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor).min(self.max_delay);
        self.jitter.apply(delay)
    }

    /// Drive `operation` until it succeeds or a terminal outcome is reached.
    ///
    /// Every send except the post-401 re-send consumes one slot of the
    /// attempt budget; a rate-limit wait therefore costs exactly one slot.
    pub async fn execute<T, F, Fut>(&self, mut operation: F) -> Result<T>
    where
        F: FnMut(Attempt) -> Fut,
        Fut: Future<Output = std::result::Result<T, AttemptError>>,
    {
        let mut sends = 0u32;
        let mut slots_used = 0u32;
        let mut transient_retries = 0u32;
        let mut auth_retry_used = false;
        let mut force_refresh = false;

        loop {
            sends += 1;
            if !force_refresh {
                slots_used += 1;
            }
            let attempt = Attempt {
                number: sends,
                force_refresh,
            };
            force_refresh = false;

            let outcome = match operation(attempt).await {
                Ok(value) => return Ok(value),
                Err(AttemptError::Abort(err)) => return Err(err),
                Err(AttemptError::Outcome(outcome)) => outcome,
            };
            let slots_left = slots_used < self.max_attempts;

            match outcome {
                ClassifiedOutcome::AuthExpired if !auth_retry_used => {
                    auth_retry_used = true;
                    self.metrics.record_retry();
                    self.metrics.record_auth_error();
                    warn!(attempt = sends, "Bearer token rejected, refreshing once");
                    force_refresh = true;
                }
                ClassifiedOutcome::RateLimited { retry_after_secs } if slots_left => {
                    self.metrics.record_retry();
                    self.metrics.record_rate_limit();
                    warn!(attempt = sends, retry_after_secs, "Rate limited, waiting");
                    tokio::time::sleep(Duration::from_secs(retry_after_secs)).await;
                }
                ClassifiedOutcome::RetriableOperationOutcome { .. }
                | ClassifiedOutcome::ConnectionError(_)
                    if slots_left =>
                {
                    self.metrics.record_retry();
                    if matches!(outcome, ClassifiedOutcome::RetriableOperationOutcome { .. }) {
                        self.metrics.record_outcome_error();
                    }
                    let delay = self.backoff_delay(transient_retries);
                    transient_retries += 1;
                    warn!(
                        attempt = sends,
                        kind = outcome.kind(),
                        delay_ms = delay.as_millis() as u64,
                        "Transient failure, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                terminal => return Err(terminal_error(terminal)),
            }
        }
    }
}

/// Error surfaced once an outcome will not be retried (any more)
pub fn terminal_error(outcome: ClassifiedOutcome) -> FhirClientError {
    match outcome {
        ClassifiedOutcome::RateLimited { retry_after_secs } => {
            FhirClientError::RateLimited { retry_after_secs }
        }
        ClassifiedOutcome::AuthExpired => FhirClientError::Fatal {
            status: 401,
            message: "Unauthorized after token refresh".to_string(),
            issues: vec![],
        },
        ClassifiedOutcome::RetriableOperationOutcome { status, issues } => {
            FhirClientError::Retriable {
                status: Some(status),
                message: issues_summary(&issues),
                issues,
            }
        }
        ClassifiedOutcome::ConnectionError(message) => FhirClientError::Retriable {
            status: None,
            message,
            issues: vec![],
        },
        ClassifiedOutcome::FatalOperationOutcome { status, issues } => FhirClientError::Fatal {
            status,
            message: issues_summary(&issues),
            issues,
        },
        ClassifiedOutcome::FatalHttpError { status, detail } => FhirClientError::Fatal {
            status,
            message: detail,
            issues: vec![],
        },
        ClassifiedOutcome::Success => {
            FhirClientError::Parse("success reported as a failed attempt".to_string())
        }
    }
}

fn issues_summary(issues: &[OperationOutcomeIssue]) -> String {
    issues
        .iter()
        .map(|i| match &i.diagnostics {
            Some(d) => format!("{}: {}", i.code, d),
            None => i.code.clone(),
        })
        .collect::<Vec<_>>()
        .join("; ")
}
