//! Durable checkpoint manager for run state.
//!
//! Wraps a `RunRepository` and is the only component that writes the durable
//! representation of a run. Every write bumps `checkpoint_seq` and
//! `updated_at`, so the stored sequence is strictly increasing. On resume the
//! stored state is checked against the definition snapshot it claims to
//! execute; any mismatch is reported as corruption instead of being repaired.

use std::collections::BTreeSet;

use chrono::Utc;
use uuid::Uuid;
use weft_types::error::RepositoryError;
use weft_types::run::{RunState, RunSummary, WorkflowRef};
use weft_types::workflow::WorkflowDefinition;

use super::definition::canonical_bytes;
use crate::repository::RunRepository;
use crate::service::ContentHasher;

// ---------------------------------------------------------------------------
// CheckpointManager
// ---------------------------------------------------------------------------

/// Manages durable checkpoints for workflow runs.
///
/// Generic over `R: RunRepository` so it works with any storage backend (JSON
/// files, in-memory mock, etc.). The executor persists every state
/// transition through here before acting on it.
pub struct CheckpointManager<R: RunRepository> {
    repo: R,
}

impl<R: RunRepository> CheckpointManager<R> {
    pub fn new(repo: R) -> Self {
        Self { repo }
    }

    /// Access the underlying repository.
    pub fn repo(&self) -> &R {
        &self.repo
    }

    /// Fingerprint a definition: name, version and digest of its canonical form.
    pub fn workflow_ref<H: ContentHasher>(
        definition: &WorkflowDefinition,
        hasher: &H,
    ) -> Result<WorkflowRef, CheckpointError> {
        let bytes = canonical_bytes(definition)
            .map_err(|e| CheckpointError::Serialize(e.to_string()))?;
        Ok(WorkflowRef {
            name: definition.name.clone(),
            version: definition.version.clone(),
            digest: hasher.compute_hash(&bytes),
        })
    }

    /// Persist the definition snapshot and the first checkpoint of a new run.
    pub async fn begin(
        &self,
        run: &mut RunState,
        definition: &WorkflowDefinition,
    ) -> Result<u64, CheckpointError> {
        self.repo
            .save_definition(&run.run_id, definition)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))?;
        self.checkpoint(run).await
    }

    /// Write the current run state as the next checkpoint.
    pub async fn checkpoint(&self, run: &mut RunState) -> Result<u64, CheckpointError> {
        run.checkpoint_seq += 1;
        run.updated_at = Utc::now();

        self.repo
            .save_run(run)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))?;

        tracing::debug!(
            run_id = %run.run_id,
            seq = run.checkpoint_seq,
            status = %run.status,
            "checkpoint saved"
        );
        Ok(run.checkpoint_seq)
    }

    /// Load a run without verifying it against its definition.
    pub async fn load_state(&self, run_id: Uuid) -> Result<RunState, CheckpointError> {
        match self.repo.load_run(&run_id).await {
            Ok(Some(run)) => Ok(run),
            Ok(None) => Err(CheckpointError::RunNotFound(run_id)),
            Err(RepositoryError::Corrupt(msg)) => Err(CheckpointError::Corruption {
                run_id,
                message: msg,
            }),
            Err(e) => Err(CheckpointError::Repository(e.to_string())),
        }
    }

    /// Load a run and its definition snapshot, checking that they agree.
    pub async fn load_verified<H: ContentHasher>(
        &self,
        run_id: Uuid,
        hasher: &H,
    ) -> Result<(RunState, WorkflowDefinition), CheckpointError> {
        let run = self.load_state(run_id).await?;
        let corrupt = |message: String| CheckpointError::Corruption { run_id, message };

        let definition = match self.repo.load_definition(&run_id).await {
            Ok(Some(def)) => def,
            Ok(None) => return Err(corrupt("definition snapshot is missing".to_string())),
            Err(RepositoryError::Corrupt(msg)) => return Err(corrupt(msg)),
            Err(e) => return Err(CheckpointError::Repository(e.to_string())),
        };

        if run.run_id != run_id {
            return Err(corrupt(format!("state belongs to run {}", run.run_id)));
        }

        let expected = Self::workflow_ref(&definition, hasher)?;
        if run.workflow.digest != expected.digest {
            return Err(corrupt(format!(
                "definition digest mismatch (state {}, snapshot {})",
                run.workflow.digest, expected.digest
            )));
        }

        let declared: BTreeSet<&str> = definition.steps.iter().map(|s| s.id.as_str()).collect();
        let recorded: BTreeSet<&str> = run.steps.keys().map(String::as_str).collect();
        if declared != recorded {
            return Err(corrupt(
                "step records do not match the definition".to_string(),
            ));
        }

        Ok((run, definition))
    }

    pub async fn list(&self, limit: Option<usize>) -> Result<Vec<RunSummary>, CheckpointError> {
        self.repo
            .list_runs(limit)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))
    }
}

impl<R: RunRepository> std::fmt::Debug for CheckpointManager<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckpointManager").finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur during checkpoint operations.
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    /// Underlying repository operation failed.
    #[error("checkpoint repository error: {0}")]
    Repository(String),

    #[error("run not found: {0}")]
    RunNotFound(Uuid),

    /// Stored state is unreadable or inconsistent. Never repaired automatically.
    #[error("checkpoint for run {run_id} is corrupt: {message}")]
    Corruption { run_id: Uuid, message: String },

    #[error("cannot serialize definition: {0}")]
    Serialize(String),
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::definition::parse_workflow_yaml;
    use crate::workflow::testing::{ChecksumHasher, MemoryRunRepository};
    use serde_json::Map;

    fn definition() -> WorkflowDefinition {
        parse_workflow_yaml(
            r#"
name: ci
version: "1.0.0"
steps:
  - { id: build, operation: op }
  - { id: test, operation: op, depends_on: [build] }
"#,
        )
        .unwrap()
    }

    fn new_run(def: &WorkflowDefinition) -> RunState {
        let wf = CheckpointManager::<MemoryRunRepository>::workflow_ref(def, &ChecksumHasher)
            .unwrap();
        RunState::new(
            Uuid::now_v7(),
            wf,
            def.steps.iter().map(|s| s.id.clone()),
            Map::new(),
        )
    }

    #[tokio::test]
    async fn test_sequence_increases_on_every_checkpoint() {
        let repo = MemoryRunRepository::new();
        let mgr = CheckpointManager::new(repo.clone());
        let def = definition();
        let mut run = new_run(&def);

        assert_eq!(mgr.begin(&mut run, &def).await.unwrap(), 1);
        assert_eq!(mgr.checkpoint(&mut run).await.unwrap(), 2);
        assert_eq!(mgr.checkpoint(&mut run).await.unwrap(), 3);
        assert_eq!(repo.run(&run.run_id).unwrap().checkpoint_seq, 3);
        assert_eq!(repo.save_count(), 3);
    }

    #[tokio::test]
    async fn test_load_verified_round_trip() {
        let mgr = CheckpointManager::new(MemoryRunRepository::new());
        let def = definition();
        let mut run = new_run(&def);
        mgr.begin(&mut run, &def).await.unwrap();

        let (loaded, snapshot) = mgr.load_verified(run.run_id, &ChecksumHasher).await.unwrap();
        assert_eq!(loaded, run);
        assert_eq!(snapshot.name, "ci");
    }

    #[tokio::test]
    async fn test_unknown_run_is_not_found() {
        let mgr = CheckpointManager::new(MemoryRunRepository::new());
        let err = mgr.load_state(Uuid::now_v7()).await.unwrap_err();
        assert!(matches!(err, CheckpointError::RunNotFound(_)));
    }

    #[tokio::test]
    async fn test_digest_mismatch_is_corruption() {
        let repo = MemoryRunRepository::new();
        let mgr = CheckpointManager::new(repo.clone());
        let def = definition();
        let mut run = new_run(&def);
        mgr.begin(&mut run, &def).await.unwrap();

        let mut tampered = run.clone();
        tampered.workflow.digest = "deadbeef".to_string();
        repo.tamper(tampered);

        let err = mgr.load_verified(run.run_id, &ChecksumHasher).await.unwrap_err();
        assert!(matches!(err, CheckpointError::Corruption { .. }));
        assert!(err.to_string().contains("digest mismatch"));
    }

    #[tokio::test]
    async fn test_step_mismatch_is_corruption() {
        let repo = MemoryRunRepository::new();
        let mgr = CheckpointManager::new(repo.clone());
        let def = definition();
        let mut run = new_run(&def);
        mgr.begin(&mut run, &def).await.unwrap();

        let mut tampered = run.clone();
        tampered.steps.remove("test");
        repo.tamper(tampered);

        let err = mgr.load_verified(run.run_id, &ChecksumHasher).await.unwrap_err();
        assert!(err.to_string().contains("step records"));
    }

    #[test]
    fn test_digest_changes_with_definition() {
        let def = definition();
        let mut edited = def.clone();
        edited.steps[1].depends_on.clear();
        let a = CheckpointManager::<MemoryRunRepository>::workflow_ref(&def, &ChecksumHasher)
            .unwrap();
        let b = CheckpointManager::<MemoryRunRepository>::workflow_ref(&edited, &ChecksumHasher)
            .unwrap();
        assert_ne!(a.digest, b.digest);
        assert_eq!(a.name, "ci");
    }
}
