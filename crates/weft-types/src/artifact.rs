//! Artifact types: immutable, versioned data produced by one step and
//! consumed by others.

use std::path::PathBuf;

use semver::{Version, VersionReq};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Lifecycle status of a registered artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactStatus {
    Active,
    Superseded,
    Deprecated,
}

/// Where an artifact's data lives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ArtifactContent {
    /// Structured value carried in the run state.
    Inline(Value),
    /// File on the local artifact store. JSON files can be field-checked.
    Path(PathBuf),
}

/// A registered artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    /// `<name>@<version>`; unique within a run.
    pub id: String,
    pub name: String,
    /// Semantic type (e.g. "coverage-report").
    #[serde(rename = "type")]
    pub artifact_type: String,
    pub version: Version,
    /// Step id that produced this artifact.
    pub producer: String,
    /// Step ids that consumed it so far.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub consumers: Vec<String>,
    pub content: ArtifactContent,
    pub status: ArtifactStatus,
}

impl Artifact {
    /// Build the canonical artifact id.
    pub fn make_id(name: &str, version: &Version) -> String {
        format!("{name}@{version}")
    }

    /// Create an active artifact produced by `producer`.
    pub fn new(produced: ProducedArtifact, producer: impl Into<String>) -> Self {
        Self {
            id: Self::make_id(&produced.name, &produced.version),
            name: produced.name,
            artifact_type: produced.artifact_type,
            version: produced.version,
            producer: producer.into(),
            consumers: Vec::new(),
            content: produced.content,
            status: ArtifactStatus::Active,
        }
    }
}

/// What an operation reports for each artifact it produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProducedArtifact {
    pub name: String,
    #[serde(rename = "type")]
    pub artifact_type: String,
    pub version: Version,
    pub content: ArtifactContent,
}

/// The contract a consuming step places on an artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsumerContract {
    /// Artifact name.
    pub artifact: String,
    /// Required semantic type.
    #[serde(rename = "type")]
    pub artifact_type: String,
    /// Accepted version range (default: any).
    #[serde(default = "any_version")]
    pub version: VersionReq,
    /// Top-level fields that must be present in the artifact content.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required_fields: Vec<String>,
}

fn any_version() -> VersionReq {
    VersionReq::STAR
}
