//! Workflow definition parsing and filesystem loading.
//!
//! Converts between YAML/JSON documents and the canonical `WorkflowDefinition`.
//! Structural validation (ids, references, cycles, expressions, policies) is
//! the graph builder's job; this module only deals with document syntax.

use std::path::Path;

use thiserror::Error;
use weft_types::workflow::WorkflowDefinition;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur while reading a definition document.
#[derive(Debug, Error)]
pub enum DefinitionError {
    /// YAML/JSON parse failure.
    #[error("parse error: {0}")]
    Parse(String),

    /// Filesystem I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse a YAML document.
pub fn parse_workflow_yaml(yaml: &str) -> Result<WorkflowDefinition, DefinitionError> {
    serde_yaml_ng::from_str(yaml).map_err(|e| DefinitionError::Parse(e.to_string()))
}

/// Parse a JSON document.
pub fn parse_workflow_json(json: &str) -> Result<WorkflowDefinition, DefinitionError> {
    serde_json::from_str(json).map_err(|e| DefinitionError::Parse(e.to_string()))
}

/// Canonical byte form of a definition, used for digests and snapshots.
///
/// serde_json emits struct fields in declaration order, so two equal
/// definitions always produce identical bytes.
pub fn canonical_bytes(def: &WorkflowDefinition) -> Result<Vec<u8>, DefinitionError> {
    serde_json::to_vec(def).map_err(|e| DefinitionError::Parse(e.to_string()))
}

// ---------------------------------------------------------------------------
// Filesystem operations
// ---------------------------------------------------------------------------

/// Load a definition from disk. `.json` files are parsed as JSON, anything
/// else as YAML.
pub fn load_workflow_file(path: &Path) -> Result<WorkflowDefinition, DefinitionError> {
    let content = std::fs::read_to_string(path)?;
    let is_json = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
    if is_json {
        parse_workflow_json(&content)
    } else {
        parse_workflow_yaml(&content)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
