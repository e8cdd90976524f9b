//! Per-operation circuit breakers.
//!
//! One breaker exists per operation name within a run. Consecutive failures
//! of that operation, across every step that invokes it, trip the breaker
//! open; while open, calls fail fast with [`CircuitOpenError`]. After the
//! cool-down a single trial call is admitted (half-open). Its success closes
//! the breaker and its failure reopens it.
//!
//! Timing uses `tokio::time::Instant` so tests can drive it with paused time.

use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;
use weft_types::workflow::BreakerConfig;

/// Circuit breaker state for one operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation. Tracks consecutive failures toward the threshold.
    Closed { consecutive_failures: u32 },
    /// Calls are rejected until `wait_duration` has elapsed since `opened_at`.
    Open {
        opened_at: Instant,
        wait_duration: Duration,
    },
    /// Probing: one trial call allowed to test whether the operation recovered.
    HalfOpen { trial_in_flight: bool },
}

/// Fast-fail returned while an operation's breaker is open.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("circuit open for operation '{operation}' (retry in {retry_after_ms}ms)")]
pub struct CircuitOpenError {
    pub operation: String,
    pub retry_after_ms: u64,
}

/// How a call was admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Normal,
    /// The half-open trial call.
    Trial,
}

/// Outcome of recording a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureEffect {
    Counted,
    /// This failure tripped (or re-tripped) the breaker.
    Opened,
}

/// All breakers of one run, keyed by operation name.
#[derive(Debug)]
pub struct CircuitBreakers {
    states: DashMap<String, CircuitState>,
    failure_threshold: u32,
    cooldown: Duration,
}

impl CircuitBreakers {
    pub fn new(config: &BreakerConfig) -> Self {
        Self {
            states: DashMap::new(),
            failure_threshold: config.failure_threshold.max(1),
            cooldown: Duration::from_millis(config.cooldown_ms),
        }
    }

    /// Ask to call `operation`. Moves Open -> HalfOpen once the cool-down elapsed.
    pub fn acquire(&self, operation: &str) -> Result<CallPermit<'_>, CircuitOpenError> {
        let admission = self.admit(operation)?;
        Ok(CallPermit {
            breakers: self,
            operation: operation.to_string(),
            admission,
            settled: false,
        })
    }

    fn admit(&self, operation: &str) -> Result<Admission, CircuitOpenError> {
        let mut state = self
            .states
            .entry(operation.to_string())
            .or_insert(CircuitState::Closed {
                consecutive_failures: 0,
            });

        match *state {
            CircuitState::Closed { .. } => Ok(Admission::Normal),
            CircuitState::Open {
                opened_at,
                wait_duration,
            } => {
                let elapsed = opened_at.elapsed();
                if elapsed >= wait_duration {
                    *state = CircuitState::HalfOpen {
                        trial_in_flight: true,
                    };
                    tracing::info!(operation, "circuit half-open, admitting trial call");
                    Ok(Admission::Trial)
                } else {
                    Err(CircuitOpenError {
                        operation: operation.to_string(),
                        retry_after_ms: (wait_duration - elapsed).as_millis() as u64,
                    })
                }
            }
            CircuitState::HalfOpen { trial_in_flight } => {
                if trial_in_flight {
                    Err(CircuitOpenError {
                        operation: operation.to_string(),
                        retry_after_ms: 0,
                    })
                } else {
                    *state = CircuitState::HalfOpen {
                        trial_in_flight: true,
                    };
                    Ok(Admission::Trial)
                }
            }
        }
    }

    pub fn record_success(&self, operation: &str) {
        let previous = self.states.insert(
            operation.to_string(),
            CircuitState::Closed {
                consecutive_failures: 0,
            },
        );
        if matches!(previous, Some(CircuitState::HalfOpen { .. })) {
            tracing::info!(operation, "circuit closed after successful trial");
        }
    }

    pub fn record_failure(&self, operation: &str) -> FailureEffect {
        let mut state = self
            .states
            .entry(operation.to_string())
            .or_insert(CircuitState::Closed {
                consecutive_failures: 0,
            });

        let open = CircuitState::Open {
            opened_at: Instant::now(),
            wait_duration: self.cooldown,
        };

        match *state {
            CircuitState::Closed {
                consecutive_failures,
            } => {
                let failures = consecutive_failures + 1;
                if failures >= self.failure_threshold {
                    *state = open;
                    tracing::warn!(operation, failures, "circuit opened");
                    FailureEffect::Opened
                } else {
                    *state = CircuitState::Closed {
                        consecutive_failures: failures,
                    };
                    FailureEffect::Counted
                }
            }
            CircuitState::HalfOpen { .. } => {
                *state = open;
                tracing::warn!(operation, "trial call failed, circuit reopened");
                FailureEffect::Opened
            }
            // A call admitted before the breaker opened; the breaker is already open.
            CircuitState::Open { .. } => FailureEffect::Counted,
        }
    }

    /// Give back an unused trial slot.
    fn release(&self, operation: &str, admission: Admission) {
        if admission != Admission::Trial {
            return;
        }
        if let Some(mut state) = self.states.get_mut(operation) {
            if *state == (CircuitState::HalfOpen { trial_in_flight: true }) {
                *state = CircuitState::HalfOpen {
                    trial_in_flight: false,
                };
                tracing::debug!(operation, "trial call abandoned, slot released");
            }
        }
    }

    pub fn state(&self, operation: &str) -> CircuitState {
        self.states
            .get(operation)
            .map(|s| *s.value())
            .unwrap_or(CircuitState::Closed {
                consecutive_failures: 0,
            })
    }
}

// ---------------------------------------------------------------------------
// CallPermit
// ---------------------------------------------------------------------------

/// One admitted call. Settle it with the call's result; an unsettled permit
/// releases its trial slot on drop.
#[derive(Debug)]
#[must_use = "an unsettled permit releases its slot immediately"]
pub struct CallPermit<'a> {
    breakers: &'a CircuitBreakers,
    operation: String,
    admission: Admission,
    settled: bool,
}

impl CallPermit<'_> {
    pub fn admission(&self) -> Admission {
        self.admission
    }

    pub fn succeed(mut self) {
        self.settled = true;
        self.breakers.record_success(&self.operation);
    }

    pub fn fail(mut self) -> FailureEffect {
        self.settled = true;
        self.breakers.record_failure(&self.operation)
    }
}

impl Drop for CallPermit<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.breakers.release(&self.operation, self.admission);
        }
    }
}
