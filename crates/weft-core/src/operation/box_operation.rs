//! BoxOperation -- object-safe dynamic dispatch wrapper for Operation.
//!
//! 1. `OperationDyn` is an object-safe mirror of `Operation` with boxed futures
//! 2. Blanket-impl `OperationDyn` for all `T: Operation`
//! 3. `BoxOperation` wraps `Box<dyn OperationDyn>` and delegates

use std::future::Future;
use std::pin::Pin;

use serde_json::Value;

use super::{Operation, OperationContext, OperationError, OperationOutcome};

/// Object-safe version of [`Operation`] with boxed futures.
pub trait OperationDyn: Send + Sync {
    fn name(&self) -> &str;

    fn execute_boxed<'a>(
        &'a self,
        args: &'a Value,
        ctx: &'a OperationContext,
    ) -> Pin<Box<dyn Future<Output = Result<OperationOutcome, OperationError>> + Send + 'a>>;
}

/// Blanket implementation: any `Operation` automatically implements `OperationDyn`.
impl<T: Operation> OperationDyn for T {
    fn name(&self) -> &str {
        Operation::name(self)
    }

    fn execute_boxed<'a>(
        &'a self,
        args: &'a Value,
        ctx: &'a OperationContext,
    ) -> Pin<Box<dyn Future<Output = Result<OperationOutcome, OperationError>> + Send + 'a>> {
        Box::pin(self.execute(args, ctx))
    }
}

/// Type-erased operation for the runtime registry.
pub struct BoxOperation {
    inner: Box<dyn OperationDyn + Send + Sync>,
}

impl BoxOperation {
    pub fn new<T: Operation + 'static>(operation: T) -> Self {
        Self {
            inner: Box::new(operation),
        }
    }

    pub fn name(&self) -> &str {
        self.inner.name()
    }

    pub async fn execute(
        &self,
        args: &Value,
        ctx: &OperationContext,
    ) -> Result<OperationOutcome, OperationError> {
        self.inner.execute_boxed(args, ctx).await
    }
}

impl std::fmt::Debug for BoxOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxOperation")
            .field("name", &self.name())
            .finish()
    }
}
