//! Retry manager: error classification, exponential backoff, and the circuit
//! breaker gate around every attempt.
//!
//! `RetryManager::execute` runs an attempt closure until it succeeds, fails
//! fatally, exhausts `max_attempts`, hits an open breaker, or is cancelled.
//! The delay after failed attempt `n` (1-based) is
//! `initial_delay_ms * multiplier^(n - 1)`, capped at `max_delay_ms`, plus up
//! to `jitter * delay` of random extra wait. Backoff sleeps use `tokio::time`
//! and wake early on cancellation.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use weft_types::workflow::{BreakerConfig, RetryPolicy};

use super::circuit::{Admission, CircuitBreakers, CircuitOpenError, FailureEffect};
use crate::operation::OperationError;

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

/// Whether a failure is worth retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Transient,
    Fatal,
}

/// Pluggable policy deciding which operation errors are transient.
pub trait ErrorClassifier: Send + Sync {
    fn classify(&self, error: &OperationError) -> ErrorClass;
}

/// Classifies by the operation's reported error kind.
#[derive(Debug, Clone)]
pub struct KindClassifier {
    transient: HashSet<String>,
}

impl KindClassifier {
    pub fn new<I, S>(kinds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            transient: kinds.into_iter().map(Into::into).collect(),
        }
    }
}

impl ErrorClassifier for KindClassifier {
    fn classify(&self, error: &OperationError) -> ErrorClass {
        if error.is_cancelled() {
            return ErrorClass::Fatal;
        }
        if self.transient.contains(&error.kind) {
            ErrorClass::Transient
        } else {
            ErrorClass::Fatal
        }
    }
}

// ---------------------------------------------------------------------------
// Backoff
// ---------------------------------------------------------------------------

/// Deterministic backoff after failed attempt `attempt` (1-based), before jitter.
pub fn backoff_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
    let raw = policy.initial_delay_ms as f64 * policy.multiplier.powi(exponent);
    let capped = raw.min(policy.max_delay_ms as f64).max(0.0);
    Duration::from_millis(capped as u64)
}

/// Backoff with the policy's random jitter applied.
pub fn jittered_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
    let base = backoff_delay(policy, attempt);
    if policy.jitter <= 0.0 {
        return base;
    }
    let extra = rand::random::<f64>() * base.as_millis() as f64 * policy.jitter;
    base + Duration::from_millis(extra as u64)
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// Why the retry loop gave up.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RetryError {
    #[error("fatal error: {0}")]
    Fatal(OperationError),

    #[error("attempts exhausted: {0}")]
    Exhausted(OperationError),

    #[error(transparent)]
    CircuitOpen(#[from] CircuitOpenError),

    #[error("cancelled")]
    Cancelled,
}

/// A failed retry sequence together with the attempts it consumed.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryFailure {
    pub error: RetryError,
    pub attempts: u32,
}

/// A successful retry sequence.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryOutcome<T> {
    pub value: T,
    pub attempts: u32,
}

/// Progress notifications for the caller (logging, events, state).
#[derive(Debug, Clone, PartialEq)]
pub enum RetryEvent<'a> {
    AttemptStarted {
        attempt: u32,
    },
    Retrying {
        attempt: u32,
        delay: Duration,
        error: &'a OperationError,
    },
    CircuitOpened {
        operation: &'a str,
    },
}

// ---------------------------------------------------------------------------
// RetryManager
// ---------------------------------------------------------------------------

/// Wraps step attempts with classification, backoff, and circuit breaking.
pub struct RetryManager {
    classifier: Arc<dyn ErrorClassifier>,
    breakers: CircuitBreakers,
}

impl std::fmt::Debug for RetryManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryManager")
            .field("breakers", &self.breakers)
            .finish()
    }
}

impl RetryManager {
    pub fn new(classifier: Arc<dyn ErrorClassifier>, breaker: &BreakerConfig) -> Self {
        Self {
            classifier,
            breakers: CircuitBreakers::new(breaker),
        }
    }

    pub fn breakers(&self) -> &CircuitBreakers {
        &self.breakers
    }

    /// Run `attempt_fn(attempt)` under `policy` for `operation`.
    pub async fn execute<T, F, Fut, E>(
        &self,
        operation: &str,
        policy: &RetryPolicy,
        cancel: &CancellationToken,
        mut attempt_fn: F,
        mut on_event: E,
    ) -> Result<RetryOutcome<T>, RetryFailure>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, OperationError>>,
        E: FnMut(RetryEvent<'_>),
    {
        let max_attempts = policy.max_attempts.max(1);
        let mut attempts = 0u32;

        loop {
            if cancel.is_cancelled() {
                return Err(RetryFailure {
                    error: RetryError::Cancelled,
                    attempts,
                });
            }

            let permit = match self.breakers.acquire(operation) {
                Ok(permit) => permit,
                Err(open) => {
                    tracing::warn!(operation, attempts, "circuit open, failing fast");
                    return Err(RetryFailure {
                        error: RetryError::CircuitOpen(open),
                        attempts,
                    });
                }
            };

            attempts += 1;
            if permit.admission() == Admission::Trial {
                tracing::info!(operation, attempt = attempts, "trial call through half-open circuit");
            }
            on_event(RetryEvent::AttemptStarted { attempt: attempts });

            let error = match attempt_fn(attempts).await {
                Ok(value) => {
                    permit.succeed();
                    return Ok(RetryOutcome {
                        value,
                        attempts,
                    });
                }
                Err(error) => error,
            };

            if error.is_cancelled() {
                drop(permit);
                return Err(RetryFailure {
                    error: RetryError::Cancelled,
                    attempts,
                });
            }

            if permit.fail() == FailureEffect::Opened {
                on_event(RetryEvent::CircuitOpened { operation });
            }

            if self.classifier.classify(&error) == ErrorClass::Fatal {
                tracing::debug!(operation, attempt = attempts, %error, "fatal error, not retrying");
                return Err(RetryFailure {
                    error: RetryError::Fatal(error),
                    attempts,
                });
            }

            if attempts >= max_attempts {
                tracing::debug!(operation, attempts, %error, "retry attempts exhausted");
                return Err(RetryFailure {
                    error: RetryError::Exhausted(error),
                    attempts,
                });
            }

            let delay = jittered_delay(policy, attempts);
            tracing::info!(
                operation,
                attempt = attempts,
                delay_ms = delay.as_millis() as u64,
                %error,
                "transient failure, backing off"
            );
            on_event(RetryEvent::Retrying {
                attempt: attempts,
                delay,
                error: &error,
            });

            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(RetryFailure {
                        error: RetryError::Cancelled,
                        attempts,
                    });
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
