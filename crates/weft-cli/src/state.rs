//! Application state wiring the executor to its infrastructure.
//!
//! The executor is generic over the run repository and content hasher;
//! AppState pins it to the JSON file store and SHA-256 hasher.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use weft_core::workflow::executor::Executor;
use weft_infra::config::load_global_config;
use weft_infra::crypto::hash::Sha256ContentHasher;
use weft_infra::filesystem::resolve_data_dir;
use weft_infra::operation::builtin_operations;
use weft_infra::store::json::JsonRunRepository;

/// Executor pinned to the concrete infra implementations.
pub type ConcreteExecutor = Executor<JsonRunRepository, Sha256ContentHasher>;

/// Shared application state used by every command.
#[derive(Clone)]
pub struct AppState {
    pub executor: Arc<ConcreteExecutor>,
    pub data_dir: PathBuf,
}

impl AppState {
    /// Resolve the data directory, load config and build the executor.
    pub async fn init(data_dir: Option<&Path>) -> anyhow::Result<Self> {
        let data_dir = resolve_data_dir(data_dir);

        tokio::fs::create_dir_all(&data_dir)
            .await
            .with_context(|| format!("creating data directory {}", data_dir.display()))?;

        let config = load_global_config(&data_dir).await;
        tracing::debug!(
            data_dir = %data_dir.display(),
            max_concurrent = config.max_concurrent,
            "application state initialized"
        );

        let executor = Executor::new(
            JsonRunRepository::new(&data_dir),
            Sha256ContentHasher::new(),
            builtin_operations(),
            config,
        );

        Ok(Self {
            executor: Arc::new(executor),
            data_dir,
        })
    }
}
