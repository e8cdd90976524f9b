//! The opaque operation port.
//!
//! Steps name an operation; the executor looks it up in an
//! [`OperationRegistry`] and calls it with the step's arguments. What an
//! operation actually does (spawn a process, call a service) is outside the
//! engine. Implementations live in weft-infra and in tests.

pub mod box_operation;
pub mod registry;

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use weft_types::artifact::{Artifact, ProducedArtifact};

pub use box_operation::{BoxOperation, OperationDyn};
pub use registry::OperationRegistry;

/// Error kind reported when an attempt was cancelled.
pub const KIND_CANCELLED: &str = "cancelled";
/// Error kind reported when the worker's timeout fired.
pub const KIND_TIMEOUT: &str = "timeout";
/// Error kind the engine uses when an operation returned a nonzero exit status.
pub const KIND_NONZERO_EXIT: &str = "nonzero_exit";

// ---------------------------------------------------------------------------
// Operation trait
// ---------------------------------------------------------------------------

/// An executable unit of work named by steps.
///
/// Uses native async fn in traits (RPITIT, Rust 2024 edition). For dynamic
/// dispatch wrap implementations in [`BoxOperation`].
pub trait Operation: Send + Sync {
    /// Registry name (e.g. "shell").
    fn name(&self) -> &str;

    /// Run once with the step's arguments.
    ///
    /// Implementations should watch `ctx.cancel` and return promptly with a
    /// `cancelled` error when it fires.
    fn execute(
        &self,
        args: &Value,
        ctx: &OperationContext,
    ) -> impl std::future::Future<Output = Result<OperationOutcome, OperationError>> + Send;
}

/// Everything an operation may know about the invocation.
#[derive(Debug, Clone)]
pub struct OperationContext {
    pub run_id: Uuid,
    pub step_id: String,
    /// 1-based attempt number within the current retry sequence.
    pub attempt: u32,
    /// 1-based loop iteration, for looping steps.
    pub iteration: Option<u32>,
    pub inputs: Arc<Map<String, Value>>,
    /// Artifacts this step consumes, already checked against its contracts.
    pub consumed: Vec<Artifact>,
    pub cancel: CancellationToken,
}

/// What a successful invocation reports.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OperationOutcome {
    pub exit_status: i32,
    pub metrics: BTreeMap<String, f64>,
    pub produced_artifacts: Vec<ProducedArtifact>,
}

impl OperationOutcome {
    pub fn success() -> Self {
        Self::default()
    }

    pub fn with_metric(mut self, name: impl Into<String>, value: f64) -> Self {
        self.metrics.insert(name.into(), value);
        self
    }

    pub fn with_artifact(mut self, artifact: ProducedArtifact) -> Self {
        self.produced_artifacts.push(artifact);
        self
    }
}

/// Failure reported by an operation, classified by its `kind`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct OperationError {
    pub kind: String,
    pub message: String,
}

impl OperationError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }

    pub fn cancelled() -> Self {
        Self::new(KIND_CANCELLED, "operation cancelled")
    }

    pub fn timeout(limit_ms: u64) -> Self {
        Self::new(KIND_TIMEOUT, format!("attempt exceeded {limit_ms}ms"))
    }

    pub fn nonzero_exit(status: i32) -> Self {
        Self::new(KIND_NONZERO_EXIT, format!("exited with status {status}"))
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind == KIND_CANCELLED
    }
}
