//! Artifact registry: write-once storage and compatibility checks.
//!
//! The registry is backed by `DashMap`, so any number of workers may read
//! concurrently. Reads return cloned artifacts and never hold a guard after
//! returning. Each artifact id may be registered exactly once; a new value
//! needs a new version.
//!
//! Compatibility checks are async because path-backed content is read from
//! disk with `tokio::fs`.
//!
//! Compatibility is checked in three layers: semantic type, semver range, and
//! required fields in the structured content. When a check fails and a
//! transform is registered for `(source_type, target_type)`, the registry
//! applies it, re-validates the result, and registers the derived artifact.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use dashmap::DashMap;
use semver::{Version, VersionReq};
use serde_json::Value;
use weft_types::artifact::{
    Artifact, ArtifactContent, ArtifactStatus, ConsumerContract, ProducedArtifact,
};
use weft_types::workflow::ARTIFACT_REF_PREFIX;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Why an artifact failed a consumer's contract.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum IncompatibilityReason {
    #[error("type mismatch: expected '{expected}', found '{actual}'")]
    TypeMismatch { expected: String, actual: String },

    #[error("version {actual} does not satisfy '{required}'")]
    VersionUnsatisfied { required: VersionReq, actual: Version },

    #[error("missing required fields: {}", .0.join(", "))]
    MissingFields(Vec<String>),

    #[error("content could not be inspected: {0}")]
    UnreadableContent(String),

    #[error("transform failed: {0}")]
    TransformFailed(String),
}

/// An artifact does not satisfy a consumer contract and no transform fixed it.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("artifact '{artifact_id}' is incompatible: {reason}")]
pub struct IncompatibilityError {
    pub artifact_id: String,
    pub reason: IncompatibilityReason,
}

/// Errors returned by registry operations.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ArtifactError {
    #[error("artifact '{0}' is already registered")]
    AlreadyRegistered(String),

    #[error("artifact '{0}' not found")]
    NotFound(String),

    #[error(transparent)]
    Incompatible(#[from] IncompatibilityError),
}

// ---------------------------------------------------------------------------
// Transforms
// ---------------------------------------------------------------------------

/// Converts an artifact of one semantic type into another.
pub trait ArtifactTransform: Send + Sync {
    fn source_type(&self) -> &str;

    fn target_type(&self) -> &str;

    /// Produce the converted artifact. The returned type should be `target_type`.
    fn apply(&self, source: &Artifact) -> Result<ProducedArtifact, String>;
}

// ---------------------------------------------------------------------------
// ArtifactRegistry
// ---------------------------------------------------------------------------

/// Per-run artifact store.
#[derive(Default)]
pub struct ArtifactRegistry {
    by_id: DashMap<String, Artifact>,
    /// name -> id of the active (newest) version.
    active: DashMap<String, String>,
    transforms: DashMap<(String, String), Arc<dyn ArtifactTransform>>,
}

impl std::fmt::Debug for ArtifactRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArtifactRegistry")
            .field("artifacts", &self.by_id.len())
            .field("transforms", &self.transforms.len())
            .finish()
    }
}

impl ArtifactRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a transform for its `(source_type, target_type)` pair.
    pub fn register_transform(&self, transform: Arc<dyn ArtifactTransform>) {
        let key = (
            transform.source_type().to_string(),
            transform.target_type().to_string(),
        );
        self.transforms.insert(key, transform);
    }

    /// Register an artifact. Rejects a second registration of the same id.
    ///
    /// The highest version of a name is the active one; registering a newer
    /// version supersedes the previous active artifact.
    pub fn register(&self, mut artifact: Artifact) -> Result<Artifact, ArtifactError> {
        if self.by_id.contains_key(&artifact.id) {
            return Err(ArtifactError::AlreadyRegistered(artifact.id));
        }

        let mut superseded = None;
        {
            let mut active = self
                .active
                .entry(artifact.name.clone())
                .or_insert_with(|| artifact.id.clone());
            if *active != artifact.id {
                let current_version = self.by_id.get(active.as_str()).map(|a| a.version.clone());
                match current_version {
                    Some(v) if v >= artifact.version => {
                        artifact.status = ArtifactStatus::Superseded;
                    }
                    _ => {
                        superseded = Some(std::mem::replace(&mut *active, artifact.id.clone()));
                    }
                }
            }

            match self.by_id.entry(artifact.id.clone()) {
                dashmap::mapref::entry::Entry::Occupied(_) => {
                    return Err(ArtifactError::AlreadyRegistered(artifact.id));
                }
                dashmap::mapref::entry::Entry::Vacant(slot) => {
                    slot.insert(artifact.clone());
                }
            }
        }

        if let Some(old_id) = superseded {
            if let Some(mut old) = self.by_id.get_mut(&old_id) {
                if old.status == ArtifactStatus::Active {
                    old.status = ArtifactStatus::Superseded;
                }
            }
        }

        tracing::debug!(
            artifact_id = %artifact.id,
            artifact_type = %artifact.artifact_type,
            producer = %artifact.producer,
            status = ?artifact.status,
            "artifact registered"
        );
        Ok(artifact)
    }

    /// Register the artifacts a step reported, keeping only declared names.
    ///
    /// All or nothing: every id is checked before the first one is written,
    /// so a rejected batch leaves the registry untouched.
    pub fn register_outputs(
        &self,
        producer: &str,
        declared: &[String],
        produced: Vec<ProducedArtifact>,
    ) -> Result<Vec<Artifact>, ArtifactError> {
        let mut batch = Vec::with_capacity(produced.len());
        let mut ids = HashSet::new();
        for item in produced {
            if !declared.iter().any(|d| d == &item.name) {
                tracing::warn!(
                    step_id = producer,
                    artifact = %item.name,
                    "dropping undeclared artifact"
                );
                continue;
            }
            let artifact = Artifact::new(item, producer);
            if self.by_id.contains_key(&artifact.id) || !ids.insert(artifact.id.clone()) {
                return Err(ArtifactError::AlreadyRegistered(artifact.id));
            }
            batch.push(artifact);
        }

        batch
            .into_iter()
            .map(|artifact| self.register(artifact))
            .collect()
    }

    /// Resolve `name@version` by id, or a bare name to its active version.
    /// An `artifact:` prefix is accepted.
    pub fn resolve(&self, reference: &str) -> Result<Artifact, ArtifactError> {
        let reference = reference
            .strip_prefix(ARTIFACT_REF_PREFIX)
            .unwrap_or(reference)
            .trim();
        if reference.contains('@') {
            return self
                .by_id
                .get(reference)
                .map(|a| a.value().clone())
                .ok_or_else(|| ArtifactError::NotFound(reference.to_string()));
        }
        let id = self
            .active
            .get(reference)
            .map(|id| id.value().clone())
            .ok_or_else(|| ArtifactError::NotFound(reference.to_string()))?;
        self.by_id
            .get(&id)
            .map(|a| a.value().clone())
            .ok_or(ArtifactError::NotFound(id))
    }

    /// Mark an artifact deprecated. A deprecated artifact no longer resolves by name.
    pub fn deprecate(&self, id: &str) -> Result<(), ArtifactError> {
        let name = {
            let mut artifact = self
                .by_id
                .get_mut(id)
                .ok_or_else(|| ArtifactError::NotFound(id.to_string()))?;
            artifact.status = ArtifactStatus::Deprecated;
            artifact.name.clone()
        };
        self.active.remove_if(&name, |_, active_id| active_id == id);
        tracing::info!(artifact_id = id, "artifact deprecated");
        Ok(())
    }

    /// Record that `step_id` consumed the artifact.
    pub fn record_consumer(&self, id: &str, step_id: &str) {
        if let Some(mut artifact) = self.by_id.get_mut(id) {
            if !artifact.consumers.iter().any(|c| c == step_id) {
                artifact.consumers.push(step_id.to_string());
            }
        }
    }

    /// Check an artifact against a contract, transforming it when possible.
    ///
    /// Returns the artifact the consumer should read: the original on
    /// success, or the registered transformed artifact.
    pub async fn check_compatible(
        &self,
        artifact: &Artifact,
        contract: &ConsumerContract,
    ) -> Result<Artifact, ArtifactError> {
        let reason = match validate(artifact, contract).await {
            Ok(()) => return Ok(artifact.clone()),
            Err(reason) => reason,
        };

        let key = (artifact.artifact_type.clone(), contract.artifact_type.clone());
        let Some(transform) = self.transforms.get(&key).map(|t| Arc::clone(t.value())) else {
            return Err(IncompatibilityError {
                artifact_id: artifact.id.clone(),
                reason,
            }
            .into());
        };

        let produced = transform.apply(artifact).map_err(|e| IncompatibilityError {
            artifact_id: artifact.id.clone(),
            reason: IncompatibilityReason::TransformFailed(e),
        })?;

        let mut derived = Artifact::new(produced, artifact.producer.clone());
        derived.id = format!(
            "{}~{}@{}",
            artifact.name, derived.artifact_type, derived.version
        );
        // The derived artifact is bookkeeping for this consumer, not a new
        // version of the source name.
        derived.name = format!("{}~{}", artifact.name, derived.artifact_type);

        validate(&derived, contract).await.map_err(|reason| IncompatibilityError {
            artifact_id: derived.id.clone(),
            reason,
        })?;

        tracing::info!(
            source = %artifact.id,
            derived = %derived.id,
            "artifact transformed to satisfy consumer contract"
        );

        match self.register(derived.clone()) {
            Ok(registered) => Ok(registered),
            Err(ArtifactError::AlreadyRegistered(id)) => self.resolve(&id),
            Err(e) => Err(e),
        }
    }

    /// Resolve the active artifact named by `contract` and check it.
    pub async fn resolve_for(&self, contract: &ConsumerContract) -> Result<Artifact, ArtifactError> {
        let artifact = self.resolve(&contract.artifact)?;
        self.check_compatible(&artifact, contract).await
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

async fn validate(
    artifact: &Artifact,
    contract: &ConsumerContract,
) -> Result<(), IncompatibilityReason> {
    if artifact.artifact_type != contract.artifact_type {
        return Err(IncompatibilityReason::TypeMismatch {
            expected: contract.artifact_type.clone(),
            actual: artifact.artifact_type.clone(),
        });
    }

    if !contract.version.matches(&artifact.version) {
        return Err(IncompatibilityReason::VersionUnsatisfied {
            required: contract.version.clone(),
            actual: artifact.version.clone(),
        });
    }

    if contract.required_fields.is_empty() {
        return Ok(());
    }

    let content = match &artifact.content {
        ArtifactContent::Inline(value) => value.clone(),
        ArtifactContent::Path(path) => read_json(path).await?,
    };

    let missing: Vec<String> = contract
        .required_fields
        .iter()
        .filter(|field| lookup_field(&content, field).is_none())
        .cloned()
        .collect();

    if missing.is_empty() {
        Ok(())
    } else {
        Err(IncompatibilityReason::MissingFields(missing))
    }
}

async fn read_json(path: &Path) -> Result<Value, IncompatibilityReason> {
    let text = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| IncompatibilityReason::UnreadableContent(format!("{}: {e}", path.display())))?;
    serde_json::from_str(&text)
        .map_err(|e| IncompatibilityReason::UnreadableContent(format!("{}: {e}", path.display())))
}

/// Dotted field lookup (`a.b.c`) into a JSON object.
fn lookup_field<'a>(value: &'a Value, field: &str) -> Option<&'a Value> {
    field.split('.').try_fold(value, |current, key| current.get(key))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
