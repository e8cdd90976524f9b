//! `sleep`: wait `ms` milliseconds.

use std::time::Duration;

use serde_json::Value;
use weft_core::operation::{Operation, OperationContext, OperationError, OperationOutcome};

use super::invalid_args;

#[derive(Debug, Clone, Default)]
pub struct SleepOperation;

impl SleepOperation {
    pub fn new() -> Self {
        Self
    }
}

impl Operation for SleepOperation {
    fn name(&self) -> &str {
        "sleep"
    }

    async fn execute(
        &self,
        args: &Value,
        ctx: &OperationContext,
    ) -> Result<OperationOutcome, OperationError> {
        let ms = args
            .get("ms")
            .and_then(Value::as_u64)
            .ok_or_else(|| invalid_args("sleep needs an integer 'ms'"))?;

        tokio::select! {
            _ = ctx.cancel.cancelled() => Err(OperationError::cancelled()),
            _ = tokio::time::sleep(Duration::from_millis(ms)) => {
                Ok(OperationOutcome::success().with_metric("slept_ms", ms as f64))
            }
        }
    }
}
