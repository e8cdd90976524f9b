//! `emit`: returns whatever its args describe.
//!
//! ```yaml
//! args:
//!   metrics: { score: 0.8 }
//!   exit_status: 0
//!   artifacts:
//!     - { name: report, type: coverage, version: 1.0.0, value: { percent: 91 } }
//!   fail: { kind: unavailable, message: "backend down" }
//! ```
//!
//! With `metric_step`, each metric grows by `iteration * metric_step`, which
//! makes loop demos converge.

use serde_json::Value;
use weft_core::operation::{Operation, OperationContext, OperationError, OperationOutcome};
use weft_types::artifact::{ArtifactContent, ProducedArtifact};

use super::{artifact_version, invalid_args, required_str};

#[derive(Debug, Clone, Default)]
pub struct EmitOperation;

impl EmitOperation {
    pub fn new() -> Self {
        Self
    }
}

impl Operation for EmitOperation {
    fn name(&self) -> &str {
        "emit"
    }

    async fn execute(
        &self,
        args: &Value,
        ctx: &OperationContext,
    ) -> Result<OperationOutcome, OperationError> {
        if let Some(fail) = args.get("fail") {
            let kind = fail.get("kind").and_then(Value::as_str).unwrap_or("emitted");
            let message = fail
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("emitted failure");
            return Err(OperationError::new(kind, message));
        }

        let mut outcome = OperationOutcome::success();
        if let Some(status) = args.get("exit_status") {
            let status = status
                .as_i64()
                .and_then(|s| i32::try_from(s).ok())
                .ok_or_else(|| invalid_args("exit_status must be an integer"))?;
            outcome.exit_status = status;
        }

        let step = args.get("metric_step").and_then(Value::as_f64).unwrap_or(0.0);
        let iteration = f64::from(ctx.iteration.unwrap_or(0));
        if let Some(metrics) = args.get("metrics") {
            let metrics = metrics
                .as_object()
                .ok_or_else(|| invalid_args("metrics must be an object"))?;
            for (name, value) in metrics {
                let value = value
                    .as_f64()
                    .ok_or_else(|| invalid_args(format!("metric '{name}' is not a number")))?;
                outcome = outcome.with_metric(name.clone(), value + step * iteration);
            }
        }

        if let Some(artifacts) = args.get("artifacts") {
            let artifacts = artifacts
                .as_array()
                .ok_or_else(|| invalid_args("artifacts must be a list"))?;
            for item in artifacts {
                outcome = outcome.with_artifact(ProducedArtifact {
                    name: required_str(item, "name")?.to_string(),
                    artifact_type: required_str(item, "type")?.to_string(),
                    version: artifact_version(item)?,
                    content: ArtifactContent::Inline(item.get("value").cloned().unwrap_or(Value::Null)),
                });
            }
        }

        tracing::debug!(
            step_id = %ctx.step_id,
            metrics = outcome.metrics.len(),
            artifacts = outcome.produced_artifacts.len(),
            "emit"
        );
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Map, json};
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    fn ctx(iteration: Option<u32>) -> OperationContext {
        OperationContext {
            run_id: Uuid::now_v7(),
            step_id: "emit".to_string(),
            attempt: 1,
            iteration,
            inputs: Arc::new(Map::new()),
            consumed: Vec::new(),
            cancel: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn test_emits_metrics_and_artifacts() {
        let args = json!({
            "metrics": { "coverage": 91.5 },
            "artifacts": [{ "name": "report", "type": "coverage", "version": "1.2.0", "value": { "percent": 91 } }]
        });
        let outcome = EmitOperation::new().execute(&args, &ctx(None)).await.unwrap();
        assert_eq!(outcome.metrics["coverage"], 91.5);
        assert_eq!(outcome.produced_artifacts[0].version.to_string(), "1.2.0");
        assert_eq!(
            outcome.produced_artifacts[0].content,
            ArtifactContent::Inline(json!({ "percent": 91 }))
        );
    }

    #[tokio::test]
    async fn test_metric_step_scales_with_iteration() {
        let args = json!({ "metrics": { "score": 0.1 }, "metric_step": 0.2 });
        let outcome = EmitOperation::new().execute(&args, &ctx(Some(3))).await.unwrap();
        assert!((outcome.metrics["score"] - 0.7).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_fail_and_invalid_args() {
        let err = EmitOperation::new()
            .execute(&json!({ "fail": { "kind": "unavailable" } }), &ctx(None))
            .await
            .unwrap_err();
        assert_eq!(err.kind, "unavailable");

        let err = EmitOperation::new()
            .execute(&json!({ "metrics": { "x": "high" } }), &ctx(None))
            .await
            .unwrap_err();
        assert_eq!(err.kind, super::super::KIND_INVALID_ARGS);
    }
}
