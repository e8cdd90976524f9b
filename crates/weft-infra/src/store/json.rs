//! JSON-file implementation of `RunRepository`.
//!
//! Each run owns a directory under `{data_dir}/runs/{run_id}/` holding
//! `state.json` (rewritten on every checkpoint) and `workflow.json` (the
//! frozen definition, written once). Writes go to a temp file in the same
//! directory and are renamed into place, so readers never see a torn file.

use std::io::Write;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;
use uuid::Uuid;
use weft_core::repository::RunRepository;
use weft_types::error::RepositoryError;
use weft_types::run::{RunState, RunSummary};
use weft_types::workflow::WorkflowDefinition;

use crate::filesystem::runs_dir;

const STATE_FILE: &str = "state.json";
const DEFINITION_FILE: &str = "workflow.json";

/// File-backed run repository rooted at `{data_dir}/runs`.
#[derive(Debug, Clone)]
pub struct JsonRunRepository {
    root: PathBuf,
}

impl JsonRunRepository {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            root: runs_dir(data_dir),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn run_dir(&self, run_id: &Uuid) -> PathBuf {
        self.root.join(run_id.to_string())
    }

    fn state_path(&self, run_id: &Uuid) -> PathBuf {
        self.run_dir(run_id).join(STATE_FILE)
    }

    fn definition_path(&self, run_id: &Uuid) -> PathBuf {
        self.run_dir(run_id).join(DEFINITION_FILE)
    }
}

fn io_error(err: std::io::Error) -> RepositoryError {
    RepositoryError::Io(err.to_string())
}

/// Serialize `value` and atomically replace `path` with it.
async fn write_json_atomic<T: Serialize>(path: PathBuf, value: &T) -> Result<(), RepositoryError> {
    let bytes = serde_json::to_vec_pretty(value)
        .map_err(|e| RepositoryError::Io(format!("serialize {}: {e}", path.display())))?;

    tokio::task::spawn_blocking(move || {
        let dir = path
            .parent()
            .ok_or_else(|| RepositoryError::Io(format!("{} has no parent", path.display())))?;
        std::fs::create_dir_all(dir).map_err(io_error)?;

        let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(io_error)?;
        tmp.write_all(&bytes).map_err(io_error)?;
        tmp.as_file().sync_all().map_err(io_error)?;
        tmp.persist(&path).map_err(|e| io_error(e.error))?;
        Ok(())
    })
    .await
    .map_err(|e| RepositoryError::Io(format!("write task failed: {e}")))?
}

/// Read and parse a JSON document. `Ok(None)` if the file does not exist.
async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, RepositoryError> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(io_error(err)),
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|e| RepositoryError::Corrupt(format!("{}: {e}", path.display())))
}

impl RunRepository for JsonRunRepository {
    async fn save_run(&self, run: &RunState) -> Result<(), RepositoryError> {
        write_json_atomic(self.state_path(&run.run_id), run).await
    }

    async fn load_run(&self, run_id: &Uuid) -> Result<Option<RunState>, RepositoryError> {
        read_json(&self.state_path(run_id)).await
    }

    async fn list_runs(&self, limit: Option<usize>) -> Result<Vec<RunSummary>, RepositoryError> {
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(io_error(err)),
        };

        let mut runs = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(io_error)? {
            let Some(run_id) = entry
                .file_name()
                .to_str()
                .and_then(|name| Uuid::parse_str(name).ok())
            else {
                continue;
            };
            match read_json::<RunState>(&self.state_path(&run_id)).await {
                Ok(Some(run)) => runs.push(run.summary()),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(run_id = %run_id, error = %e, "skipping unreadable run");
                }
            }
        }

        runs.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        if let Some(limit) = limit {
            runs.truncate(limit);
        }
        Ok(runs)
    }

    async fn save_definition(
        &self,
        run_id: &Uuid,
        definition: &WorkflowDefinition,
    ) -> Result<(), RepositoryError> {
        write_json_atomic(self.definition_path(run_id), definition).await
    }

    async fn load_definition(
        &self,
        run_id: &Uuid,
    ) -> Result<Option<WorkflowDefinition>, RepositoryError> {
        read_json(&self.definition_path(run_id)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use serde_json::Map;
    use tempfile::TempDir;
    use weft_types::run::{RunStatus, WorkflowRef};

    fn sample_run(name: &str) -> RunState {
        RunState::new(
            Uuid::now_v7(),
            WorkflowRef {
                name: name.to_string(),
                version: "1".to_string(),
                digest: "abc".to_string(),
            },
            ["build".to_string(), "test".to_string()],
            Map::new(),
        )
    }

    fn sample_definition() -> WorkflowDefinition {
        serde_json::from_value(serde_json::json!({
            "name": "ci",
            "version": "1",
            "steps": [
                { "id": "build", "operation": "shell", "args": { "command": "true" } },
                { "id": "test", "operation": "shell", "depends_on": ["build"],
                  "consumes": [{ "artifact": "bin", "type": "executable", "version": "^1" }] }
            ]
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_save_and_load_run() {
        let tmp = TempDir::new().unwrap();
        let repo = JsonRunRepository::new(tmp.path());
        let mut run = sample_run("ci");
        run.status = RunStatus::Running;
        run.checkpoint_seq = 4;

        repo.save_run(&run).await.unwrap();
        let loaded = repo.load_run(&run.run_id).await.unwrap().unwrap();
        assert_eq!(loaded, run);
        assert!(tmp
            .path()
            .join("runs")
            .join(run.run_id.to_string())
            .join(STATE_FILE)
            .exists());
    }

    #[tokio::test]
    async fn test_save_replaces_previous_state() {
        let tmp = TempDir::new().unwrap();
        let repo = JsonRunRepository::new(tmp.path());
        let mut run = sample_run("ci");
        repo.save_run(&run).await.unwrap();
        run.checkpoint_seq = 9;
        repo.save_run(&run).await.unwrap();

        assert_eq!(repo.load_run(&run.run_id).await.unwrap().unwrap().checkpoint_seq, 9);
        // Only the final document remains; temp files were renamed away.
        let files: Vec<_> = std::fs::read_dir(repo.run_dir(&run.run_id)).unwrap().collect();
        assert_eq!(files.len(), 1);
    }

    #[tokio::test]
    async fn test_missing_run_is_none() {
        let tmp = TempDir::new().unwrap();
        let repo = JsonRunRepository::new(tmp.path());
        assert!(repo.load_run(&Uuid::now_v7()).await.unwrap().is_none());
        assert!(repo.load_definition(&Uuid::now_v7()).await.unwrap().is_none());
        assert!(repo.list_runs(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unparseable_state_is_corrupt() {
        let tmp = TempDir::new().unwrap();
        let repo = JsonRunRepository::new(tmp.path());
        let run = sample_run("ci");
        repo.save_run(&run).await.unwrap();
        std::fs::write(repo.state_path(&run.run_id), b"{\"run_id\": ").unwrap();

        let err = repo.load_run(&run.run_id).await.unwrap_err();
        assert!(matches!(err, RepositoryError::Corrupt(_)));
    }

    #[tokio::test]
    async fn test_definition_round_trip() {
        let tmp = TempDir::new().unwrap();
        let repo = JsonRunRepository::new(tmp.path());
        let run_id = Uuid::now_v7();
        repo.save_definition(&run_id, &sample_definition()).await.unwrap();

        let loaded = repo.load_definition(&run_id).await.unwrap().unwrap();
        assert_eq!(loaded.name, "ci");
        assert_eq!(loaded.steps[1].consumes[0].artifact, "bin");
        assert_eq!(loaded.steps[1].depends_on, vec!["build"]);
    }

    #[tokio::test]
    async fn test_list_runs_newest_first_with_limit() {
        let tmp = TempDir::new().unwrap();
        let repo = JsonRunRepository::new(tmp.path());
        let now = Utc::now();
        for (i, name) in ["old", "mid", "new"].iter().enumerate() {
            let mut run = sample_run(name);
            run.updated_at = now + Duration::seconds(i as i64);
            repo.save_run(&run).await.unwrap();
        }
        std::fs::create_dir_all(repo.root().join("not-a-run")).unwrap();

        let all = repo.list_runs(None).await.unwrap();
        let names: Vec<&str> = all.iter().map(|r| r.workflow_name.as_str()).collect();
        assert_eq!(names, vec!["new", "mid", "old"]);

        let limited = repo.list_runs(Some(2)).await.unwrap();
        assert_eq!(limited.len(), 2);
        assert_eq!(limited[0].workflow_name, "new");
    }
}
