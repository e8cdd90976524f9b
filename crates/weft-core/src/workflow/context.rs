//! Evaluation context for conditions, loop predicates, and workflow outputs.
//!
//! `EvalContext` is a read-only snapshot of the facts an expression may see:
//!
//! - `steps.<id>.status` / `exit_status` / `attempts` / `iterations`
//! - `steps.<id>.succeeded` / `failed` / `skipped` (booleans)
//! - `steps.<id>.metrics.<name>`
//! - `inputs.<name>[.<field>...]` (must end at a boolean, number, or string)
//! - `loop.iteration` (inside a loop body)
//!
//! Anything else is an unknown identifier.

use std::collections::{BTreeMap, HashMap};

use serde_json::{Map, Value as JsonValue};
use weft_types::run::{RunState, StepState, StepStatus};

use super::expression::{ExpressionError, Scope, Value};

// ---------------------------------------------------------------------------
// StepFacts
// ---------------------------------------------------------------------------

/// What expressions can observe about one step.
#[derive(Debug, Clone, PartialEq)]
pub struct StepFacts {
    pub status: StepStatus,
    pub exit_status: Option<i32>,
    pub attempts: u32,
    pub iterations: u32,
    pub metrics: BTreeMap<String, f64>,
}

impl StepFacts {
    pub fn from_state(state: &StepState) -> Self {
        let (exit_status, metrics) = match &state.outputs {
            Some(out) => (Some(out.exit_status), out.metrics.clone()),
            None => (None, BTreeMap::new()),
        };
        Self {
            status: state.status,
            exit_status,
            attempts: state.attempts,
            iterations: state.iterations,
            metrics,
        }
    }
}

// ---------------------------------------------------------------------------
// EvalContext
// ---------------------------------------------------------------------------

/// Snapshot of run facts handed to the expression evaluator.
#[derive(Debug, Clone, Default)]
pub struct EvalContext {
    steps: HashMap<String, StepFacts>,
    inputs: Map<String, JsonValue>,
    loop_iteration: Option<u32>,
}

impl EvalContext {
    pub fn new(inputs: Map<String, JsonValue>) -> Self {
        Self {
            steps: HashMap::new(),
            inputs,
            loop_iteration: None,
        }
    }

    /// Snapshot every step of a run.
    pub fn from_run(run: &RunState) -> Self {
        let mut ctx = Self::new(run.inputs.clone());
        for (id, state) in &run.steps {
            ctx.steps.insert(id.clone(), StepFacts::from_state(state));
        }
        ctx
    }

    /// Add or replace one step's facts.
    pub fn set_step(&mut self, id: impl Into<String>, facts: StepFacts) {
        self.steps.insert(id.into(), facts);
    }

    pub fn set_loop_iteration(&mut self, iteration: u32) {
        self.loop_iteration = Some(iteration);
    }

    fn lookup_step(&self, id: &str, field: &[String]) -> Result<Value, ExpressionError> {
        let unknown = || {
            let mut path = format!("steps.{id}");
            for seg in field {
                path.push('.');
                path.push_str(seg);
            }
            ExpressionError::UnknownIdentifier(path)
        };

        let facts = self.steps.get(id).ok_or_else(unknown)?;
        let value = match field {
            [f] if f == "status" => Value::Str(facts.status.as_str().to_string()),
            [f] if f == "exit_status" => {
                Value::Number(f64::from(facts.exit_status.ok_or_else(unknown)?))
            }
            [f] if f == "attempts" => Value::Number(f64::from(facts.attempts)),
            [f] if f == "iterations" => Value::Number(f64::from(facts.iterations)),
            [f] if f == "succeeded" => Value::Bool(facts.status == StepStatus::Succeeded),
            [f] if f == "failed" => Value::Bool(facts.status == StepStatus::Failed),
            [f] if f == "skipped" => Value::Bool(facts.status == StepStatus::Skipped),
            [m, name] if m == "metrics" => {
                Value::Number(*facts.metrics.get(name).ok_or_else(unknown)?)
            }
            _ => return Err(unknown()),
        };
        Ok(value)
    }

    fn lookup_input(&self, name: &str, fields: &[String]) -> Result<Value, ExpressionError> {
        let unknown = || {
            let mut path = format!("inputs.{name}");
            for seg in fields {
                path.push('.');
                path.push_str(seg);
            }
            ExpressionError::UnknownIdentifier(path)
        };

        let mut current = self.inputs.get(name).ok_or_else(unknown)?;
        for field in fields {
            current = current.get(field.as_str()).ok_or_else(unknown)?;
        }

        match current {
            JsonValue::Bool(b) => Ok(Value::Bool(*b)),
            JsonValue::String(s) => Ok(Value::Str(s.clone())),
            JsonValue::Number(n) => n.as_f64().map(Value::Number).ok_or_else(|| {
                ExpressionError::TypeMismatch(format!("inputs.{name} is not representable"))
            }),
            other => Err(ExpressionError::TypeMismatch(format!(
                "inputs.{name} is not a scalar: {other}"
            ))),
        }
    }
}

impl Scope for EvalContext {
    fn lookup(&self, path: &[String]) -> Result<Value, ExpressionError> {
        match path {
            [root, id, field @ ..] if root == "steps" && !field.is_empty() => {
                self.lookup_step(id, field)
            }
            [root, name, fields @ ..] if root == "inputs" => self.lookup_input(name, fields),
            [root, field] if root == "loop" && field == "iteration" => self
                .loop_iteration
                .map(|n| Value::Number(f64::from(n)))
                .ok_or_else(|| ExpressionError::UnknownIdentifier("loop.iteration".to_string())),
            _ => Err(ExpressionError::UnknownIdentifier(path.join("."))),
        }
    }
}

/// Convert an expression value into JSON for workflow outputs.
pub fn to_json(value: Value) -> JsonValue {
    match value {
        Value::Bool(b) => JsonValue::Bool(b),
        Value::Number(n) => serde_json::Number::from_f64(n)
            .map(JsonValue::Number)
            .unwrap_or(JsonValue::Null),
        Value::Str(s) => JsonValue::String(s),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::expression::Expression;
    use serde_json::json;

    fn facts(status: StepStatus, exit: Option<i32>) -> StepFacts {
        StepFacts {
            status,
            exit_status: exit,
            attempts: 2,
            iterations: 0,
            metrics: BTreeMap::from([("coverage".to_string(), 0.91)]),
        }
    }

    fn ctx() -> EvalContext {
        let mut inputs = Map::new();
        inputs.insert("env".to_string(), json!("prod"));
        inputs.insert("replicas".to_string(), json!(3));
        inputs.insert("tags".to_string(), json!(["a"]));
        inputs.insert("target".to_string(), json!({"region": "eu", "zones": 3}));
        let mut ctx = EvalContext::new(inputs);
        ctx.set_step("build", facts(StepStatus::Succeeded, Some(0)));
        ctx.set_step("lint", facts(StepStatus::Skipped, None));
        ctx
    }

    fn eval(src: &str) -> Result<bool, ExpressionError> {
        Expression::parse(src).unwrap().eval_bool(&ctx())
    }

    #[test]
    fn test_step_fields_resolve() {
        assert!(eval("steps.build.status == 'succeeded'").unwrap());
        assert!(eval("steps.build.exit_status == 0").unwrap());
        assert!(eval("steps.build.attempts == 2").unwrap());
        assert!(eval("steps.build.succeeded && !steps.build.failed").unwrap());
        assert!(eval("steps.lint.skipped").unwrap());
        assert!(eval("steps.build.metrics.coverage > 0.9").unwrap());
    }

    #[test]
    fn test_exit_status_of_step_without_outputs_is_unknown() {
        let err = eval("steps.lint.exit_status == 0").unwrap_err();
        assert_eq!(
            err,
            ExpressionError::UnknownIdentifier("steps.lint.exit_status".to_string())
        );
    }

    #[test]
    fn test_unknown_metric_and_field() {
        assert!(matches!(
            eval("steps.build.metrics.latency < 5"),
            Err(ExpressionError::UnknownIdentifier(_))
        ));
        assert!(matches!(
            eval("steps.build.output == 'x'"),
            Err(ExpressionError::UnknownIdentifier(_))
        ));
    }

    #[test]
    fn test_inputs_resolve_scalars_only() {
        assert!(eval("inputs.env == 'prod'").unwrap());
        assert!(eval("inputs.replicas >= 3").unwrap());
        assert!(eval("inputs.target.region == 'eu' && inputs.target.zones == 3").unwrap());
        assert!(matches!(
            eval("inputs.target == 'eu'"),
            Err(ExpressionError::TypeMismatch(_))
        ));
        assert!(matches!(
            eval("inputs.target.missing == 'eu'"),
            Err(ExpressionError::UnknownIdentifier(_))
        ));
        assert!(matches!(
            eval("inputs.tags == 'a'"),
            Err(ExpressionError::TypeMismatch(_))
        ));
        assert!(matches!(
            eval("inputs.missing == 'a'"),
            Err(ExpressionError::UnknownIdentifier(_))
        ));
    }

    #[test]
    fn test_loop_iteration_only_inside_loops() {
        assert!(matches!(
            eval("loop.iteration > 1"),
            Err(ExpressionError::UnknownIdentifier(_))
        ));
        let mut ctx = ctx();
        ctx.set_loop_iteration(2);
        let expr = Expression::parse("loop.iteration == 2").unwrap();
        assert!(expr.eval_bool(&ctx).unwrap());
    }

    #[test]
    fn test_to_json() {
        assert_eq!(to_json(Value::Number(1.5)), json!(1.5));
        assert_eq!(to_json(Value::Str("x".into())), json!("x"));
        assert_eq!(to_json(Value::Bool(true)), json!(true));
    }
}
