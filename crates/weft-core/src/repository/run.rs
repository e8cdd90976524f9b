//! Run repository trait definition.

use uuid::Uuid;
use weft_types::error::RepositoryError;
use weft_types::run::{RunState, RunSummary};
use weft_types::workflow::WorkflowDefinition;

/// Repository trait for run state persistence.
///
/// A run is stored as two documents: the frozen definition it executes
/// (written once, when the run starts) and its latest state (rewritten on
/// every checkpoint). Implementations must make each `save_run` atomic so a
/// crash never leaves a torn state document behind.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait RunRepository: Send + Sync {
    /// Replace the stored state of `run.run_id`.
    fn save_run(
        &self,
        run: &RunState,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Load a run's latest state. `Ok(None)` if the run does not exist;
    /// `Err(Corrupt)` if it exists but cannot be read back.
    fn load_run(
        &self,
        run_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<RunState>, RepositoryError>> + Send;

    /// Summaries of stored runs, most recently updated first.
    fn list_runs(
        &self,
        limit: Option<usize>,
    ) -> impl std::future::Future<Output = Result<Vec<RunSummary>, RepositoryError>> + Send;

    /// Store the definition snapshot a run executes.
    fn save_definition(
        &self,
        run_id: &Uuid,
        definition: &WorkflowDefinition,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Load a run's definition snapshot.
    fn load_definition(
        &self,
        run_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowDefinition>, RepositoryError>> + Send;
}
