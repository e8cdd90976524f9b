//! Name -> operation lookup.

use std::collections::HashMap;
use std::sync::Arc;

use super::{BoxOperation, Operation};

/// Operations available to a run, keyed by name.
#[derive(Debug, Default, Clone)]
pub struct OperationRegistry {
    operations: HashMap<String, Arc<BoxOperation>>,
}

impl OperationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an operation under its own name, replacing any previous one.
    pub fn register<T: Operation + 'static>(&mut self, operation: T) {
        let boxed = BoxOperation::new(operation);
        self.operations
            .insert(boxed.name().to_string(), Arc::new(boxed));
    }

    /// Builder-style [`register`](Self::register).
    pub fn with<T: Operation + 'static>(mut self, operation: T) -> Self {
        self.register(operation);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<BoxOperation>> {
        self.operations.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.operations.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.operations.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::{OperationContext, OperationError, OperationOutcome};
    use serde_json::{Map, Value, json};
    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    struct Echo;

    impl Operation for Echo {
        fn name(&self) -> &str {
            "echo"
        }

        async fn execute(
            &self,
            args: &Value,
            _ctx: &OperationContext,
        ) -> Result<OperationOutcome, OperationError> {
            let score = args["score"].as_f64().unwrap_or(0.0);
            Ok(OperationOutcome::success().with_metric("score", score))
        }
    }

    #[tokio::test]
    async fn test_register_and_dispatch_through_box() {
        let registry = OperationRegistry::new().with(Echo);
        assert!(registry.contains("echo"));
        assert_eq!(registry.names(), vec!["echo".to_string()]);

        let op = registry.get("echo").unwrap();
        let ctx = OperationContext {
            run_id: Uuid::now_v7(),
            step_id: "s".to_string(),
            attempt: 1,
            iteration: None,
            inputs: Arc::new(Map::new()),
            consumed: Vec::new(),
            cancel: CancellationToken::new(),
        };
        let outcome = op.execute(&json!({"score": 0.5}), &ctx).await.unwrap();
        assert_eq!(outcome.metrics.get("score"), Some(&0.5));
        assert!(registry.get("missing").is_none());
    }
}
