//! Loop controller for steps with a `loop` policy.
//!
//! Each iteration runs the step body once, then evaluates the loop expression
//! against a context where `steps.<self>` reflects the latest iteration and
//! `loop.iteration` is the 1-based count. Termination checks, in order:
//!
//! 1. `max_iterations` reached -> [`LoopError::BudgetExceeded`]
//! 2. wall-clock `timeout_ms` elapsed -> [`LoopError::Timeout`]
//! 3. `until` holds (or `while` no longer holds) -> normal exit
//! 4. the progress metric has not improved for more than
//!    `allow_plateau_iterations` iterations -> [`LoopError::Stalled`]
//!
//! The body itself is also bounded by whatever remains of the wall-clock budget.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use weft_types::run::StepStatus;
use weft_types::workflow::{LoopPolicy, ProgressDirection, ProgressGuard};

use super::context::{EvalContext, StepFacts};
use super::expression::{Expression, ExpressionError};
use crate::operation::OperationOutcome;

/// Why a loop ended without its exit condition holding.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LoopError<E> {
    #[error("loop ran {max} iterations without its exit condition holding")]
    BudgetExceeded { max: u32 },

    #[error("loop exceeded its {timeout_ms}ms time budget")]
    Timeout { timeout_ms: u64 },

    #[error("no progress on metric '{metric}' for {stagnant} consecutive iterations")]
    Stalled { metric: String, stagnant: u32 },

    #[error("loop expression failed: {0}")]
    Eval(ExpressionError),

    #[error("loop body failed: {0}")]
    Body(E),
}

/// A loop that ended in error, with how far it got.
#[derive(Debug, Clone, PartialEq)]
pub struct LoopFailure<E> {
    pub error: LoopError<E>,
    pub iterations: u32,
    /// Outcome of the last completed iteration, if any.
    pub last: Option<OperationOutcome>,
}

/// A loop that exited normally.
#[derive(Debug, Clone, PartialEq)]
pub struct LoopOutcome {
    /// Outcome of the final iteration.
    pub last: OperationOutcome,
    pub iterations: u32,
}

/// Tracks the best progress metric seen and how long it has been stuck.
#[derive(Debug)]
struct ProgressTracker<'a> {
    guard: &'a ProgressGuard,
    best: Option<f64>,
    stagnant: u32,
}

impl<'a> ProgressTracker<'a> {
    fn new(guard: &'a ProgressGuard) -> Self {
        Self {
            guard,
            best: None,
            stagnant: 0,
        }
    }

    /// Feed one observation. Returns true once the plateau allowance is exceeded.
    fn observe(&mut self, value: f64) -> bool {
        let Some(best) = self.best else {
            self.best = Some(value);
            return false;
        };

        let improvement = match self.guard.direction {
            ProgressDirection::Increase => value - best,
            ProgressDirection::Decrease => best - value,
        };

        if improvement > 0.0 && improvement >= self.guard.min_delta {
            self.best = Some(value);
            self.stagnant = 0;
            false
        } else {
            self.stagnant += 1;
            self.stagnant > self.guard.allow_plateau_iterations
        }
    }
}

/// Drives one looping step.
#[derive(Debug)]
pub struct LoopController<'a> {
    step_id: &'a str,
    policy: &'a LoopPolicy,
    expression: &'a Expression,
}

impl<'a> LoopController<'a> {
    pub fn new(step_id: &'a str, policy: &'a LoopPolicy, expression: &'a Expression) -> Self {
        Self {
            step_id,
            policy,
            expression,
        }
    }

    /// Whether the loop should stop after this context's iteration.
    fn exit_condition_met(&self, ctx: &EvalContext) -> Result<bool, ExpressionError> {
        let holds = self.expression.eval_bool(ctx)?;
        Ok(if self.policy.until.is_some() {
            holds
        } else {
            !holds
        })
    }

    /// Run the loop. `ctx` is the run context at dispatch time; `body` is
    /// called with the 1-based iteration number.
    pub async fn run<F, Fut, E>(
        &self,
        mut ctx: EvalContext,
        mut body: F,
    ) -> Result<LoopOutcome, LoopFailure<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<OperationOutcome, E>>,
    {
        let started = Instant::now();
        let budget = self.policy.timeout_ms.map(Duration::from_millis);
        let mut tracker = self.policy.progress.as_ref().map(ProgressTracker::new);
        let mut iterations = 0u32;
        let mut last: Option<OperationOutcome> = None;

        let fail = |error, iterations, last| LoopFailure {
            error,
            iterations,
            last,
        };

        loop {
            if iterations >= self.policy.max_iterations {
                tracing::warn!(step_id = self.step_id, iterations, "loop budget exceeded");
                return Err(fail(
                    LoopError::BudgetExceeded {
                        max: self.policy.max_iterations,
                    },
                    iterations,
                    last,
                ));
            }

            let remaining = match budget {
                Some(limit) => {
                    let elapsed = started.elapsed();
                    if elapsed >= limit {
                        return Err(fail(
                            LoopError::Timeout {
                                timeout_ms: limit.as_millis() as u64,
                            },
                            iterations,
                            last,
                        ));
                    }
                    Some(limit - elapsed)
                }
                None => None,
            };

            let iteration = iterations + 1;
            tracing::debug!(step_id = self.step_id, iteration, "loop iteration");

            let result = match remaining {
                Some(remaining) => match tokio::time::timeout(remaining, body(iteration)).await {
                    Ok(result) => result,
                    Err(_) => {
                        return Err(fail(
                            LoopError::Timeout {
                                timeout_ms: budget.map_or(0, |b| b.as_millis() as u64),
                            },
                            iterations,
                            last,
                        ));
                    }
                },
                None => body(iteration).await,
            };

            let outcome = match result {
                Ok(outcome) => outcome,
                Err(error) => return Err(fail(LoopError::Body(error), iterations, last)),
            };
            iterations = iteration;

            ctx.set_step(
                self.step_id,
                StepFacts {
                    status: StepStatus::Running,
                    exit_status: Some(outcome.exit_status),
                    attempts: 0,
                    iterations,
                    metrics: outcome.metrics.clone(),
                },
            );
            ctx.set_loop_iteration(iterations);

            match self.exit_condition_met(&ctx) {
                Ok(true) => {
                    tracing::info!(step_id = self.step_id, iterations, "loop exit condition met");
                    return Ok(LoopOutcome {
                        last: outcome,
                        iterations,
                    });
                }
                Ok(false) => {}
                Err(error) => return Err(fail(LoopError::Eval(error), iterations, Some(outcome))),
            }

            if let Some(tracker) = tracker.as_mut() {
                let guard = tracker.guard;
                let metric = &guard.metric;
                let Some(&value) = outcome.metrics.get(metric) else {
                    let error = ExpressionError::UnknownIdentifier(format!(
                        "steps.{}.metrics.{metric}",
                        self.step_id
                    ));
                    return Err(fail(LoopError::Eval(error), iterations, Some(outcome)));
                };
                if tracker.observe(value) {
                    tracing::warn!(
                        step_id = self.step_id,
                        metric = %metric,
                        value,
                        iterations,
                        "loop stalled"
                    );
                    return Err(fail(
                        LoopError::Stalled {
                            metric: metric.clone(),
                            stagnant: tracker.stagnant,
                        },
                        iterations,
                        Some(outcome),
                    ));
                }
            }

            last = Some(outcome);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;
    use std::cell::Cell;

    fn policy(expr: &str, max: u32) -> LoopPolicy {
        LoopPolicy {
            while_expr: None,
            until: Some(expr.to_string()),
            max_iterations: max,
            timeout_ms: None,
            progress: None,
        }
    }

    fn score(value: f64) -> OperationOutcome {
        OperationOutcome::success().with_metric("score", value)
    }

    async fn run_loop(
        policy: &LoopPolicy,
        scores: impl Fn(u32) -> f64,
    ) -> (Result<LoopOutcome, LoopFailure<String>>, u32) {
        let expr = Expression::parse(policy.expression().unwrap()).unwrap();
        let controller = LoopController::new("improve", policy, &expr);
        let calls = Cell::new(0);
        let result = controller
            .run(EvalContext::new(Map::new()), |i| {
                calls.set(calls.get() + 1);
                let value = scores(i);
                async move { Ok::<_, String>(score(value)) }
            })
            .await;
        (result, calls.get())
    }

    #[tokio::test]
    async fn test_until_exits_when_condition_holds() {
        let p = policy("steps.improve.metrics.score >= 0.9", 10);
        let (result, calls) = run_loop(&p, |i| f64::from(i) * 0.35).await;
        let outcome = result.unwrap();
        assert_eq!(outcome.iterations, 3);
        assert_eq!(calls, 3);
    }

    #[tokio::test]
    async fn test_while_exits_when_condition_stops_holding() {
        let mut p = policy("", 10);
        p.until = None;
        p.while_expr = Some("loop.iteration < 4".to_string());
        let (result, calls) = run_loop(&p, |_| 0.0).await;
        assert_eq!(result.unwrap().iterations, 4);
        assert_eq!(calls, 4);
    }

    #[tokio::test]
    async fn test_budget_exceeded_after_exactly_max_iterations() {
        let p = policy("steps.improve.metrics.score > 100", 5);
        let (result, calls) = run_loop(&p, f64::from).await;
        let failure = result.unwrap_err();
        assert_eq!(failure.error, LoopError::BudgetExceeded { max: 5 });
        assert_eq!(failure.iterations, 5);
        assert_eq!(calls, 5);
    }

    #[tokio::test]
    async fn test_stalls_on_third_stagnant_iteration() {
        let mut p = policy("steps.improve.metrics.score > 100", 50);
        p.progress = Some(ProgressGuard {
            metric: "score".to_string(),
            min_delta: 0.01,
            allow_plateau_iterations: 2,
            direction: ProgressDirection::Increase,
        });
        let (result, calls) = run_loop(&p, |_| 0.5).await;
        let failure = result.unwrap_err();
        assert_eq!(
            failure.error,
            LoopError::Stalled {
                metric: "score".to_string(),
                stagnant: 3
            }
        );
        // One baseline iteration plus three stagnant ones.
        assert_eq!(calls, 4);
    }

    #[tokio::test]
    async fn test_oscillating_metric_stalls() {
        let mut p = policy("steps.improve.metrics.score > 100", 50);
        p.progress = Some(ProgressGuard {
            metric: "score".to_string(),
            min_delta: 0.0,
            allow_plateau_iterations: 1,
            direction: ProgressDirection::Increase,
        });
        let (result, calls) = run_loop(&p, |i| if i % 2 == 0 { 2.0 } else { 1.0 }).await;
        assert!(matches!(result.unwrap_err().error, LoopError::Stalled { .. }));
        assert_eq!(calls, 4);
    }

    #[tokio::test]
    async fn test_decreasing_progress_is_tracked() {
        let mut p = policy("steps.improve.metrics.score <= 0.1", 50);
        p.progress = Some(ProgressGuard {
            metric: "score".to_string(),
            min_delta: 0.05,
            allow_plateau_iterations: 0,
            direction: ProgressDirection::Decrease,
        });
        let (result, _) = run_loop(&p, |i| 1.0 - f64::from(i) * 0.2).await;
        assert_eq!(result.unwrap().iterations, 5);
    }

    #[tokio::test]
    async fn test_unknown_identifier_fails_closed() {
        let p = policy("steps.improve.metrics.missing > 1", 5);
        let (result, calls) = run_loop(&p, |_| 1.0).await;
        assert!(matches!(result.unwrap_err().error, LoopError::Eval(_)));
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn test_body_error_stops_loop() {
        let p = policy("loop.iteration > 10", 20);
        let expr = Expression::parse(p.expression().unwrap()).unwrap();
        let controller = LoopController::new("improve", &p, &expr);
        let failure = controller
            .run(EvalContext::new(Map::new()), |i| async move {
                if i == 2 {
                    Err("boom".to_string())
                } else {
                    Ok(score(0.0))
                }
            })
            .await
            .unwrap_err();
        assert_eq!(failure.error, LoopError::Body("boom".to_string()));
        assert_eq!(failure.iterations, 1);
        assert!(failure.last.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wall_clock_budget() {
        let mut p = policy("loop.iteration > 100", 1000);
        p.timeout_ms = Some(250);
        let expr = Expression::parse(p.expression().unwrap()).unwrap();
        let controller = LoopController::new("improve", &p, &expr);
        let failure = controller
            .run(EvalContext::new(Map::new()), |_| async {
                tokio::time::sleep(Duration::from_millis(100)).await;
                Ok::<_, String>(score(0.0))
            })
            .await
            .unwrap_err();
        assert_eq!(failure.error, LoopError::Timeout { timeout_ms: 250 });
        assert_eq!(failure.iterations, 2);
    }
}
