//! Built-in operations.
//!
//! - `shell`: run a process; `weft:metric <name> <value>` stdout lines become metrics
//! - `emit`: report the metrics, artifacts or failure given in its args
//! - `sleep`: wait, honouring cancellation

pub mod emit;
pub mod shell;
pub mod sleep;

use semver::Version;
use serde_json::Value;
use weft_core::operation::{OperationError, OperationRegistry};

pub use emit::EmitOperation;
pub use shell::ShellOperation;
pub use sleep::SleepOperation;

/// Error kind for malformed step arguments. Never retried by default.
pub const KIND_INVALID_ARGS: &str = "invalid_args";

/// Registry holding every built-in operation.
pub fn builtin_operations() -> OperationRegistry {
    OperationRegistry::new()
        .with(ShellOperation::new())
        .with(EmitOperation::new())
        .with(SleepOperation::new())
}

fn invalid_args(message: impl Into<String>) -> OperationError {
    OperationError::new(KIND_INVALID_ARGS, message)
}

/// Parse an optional `version` field, defaulting to 1.0.0.
fn artifact_version(item: &Value) -> Result<Version, OperationError> {
    match item.get("version").and_then(Value::as_str) {
        Some(raw) => Version::parse(raw)
            .map_err(|e| invalid_args(format!("artifact version '{raw}': {e}"))),
        None => Ok(Version::new(1, 0, 0)),
    }
}

/// Required string field of an args object.
fn required_str<'a>(item: &'a Value, field: &str) -> Result<&'a str, OperationError> {
    item.get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| invalid_args(format!("missing string field '{field}'")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_builtin_registry_names() {
        assert_eq!(builtin_operations().names(), vec!["emit", "shell", "sleep"]);
    }

    #[test]
    fn test_artifact_version_default_and_invalid() {
        assert_eq!(artifact_version(&json!({})).unwrap(), Version::new(1, 0, 0));
        assert_eq!(
            artifact_version(&json!({ "version": "2.1.0" })).unwrap(),
            Version::new(2, 1, 0)
        );
        let err = artifact_version(&json!({ "version": "two" })).unwrap_err();
        assert_eq!(err.kind, KIND_INVALID_ARGS);
    }
}
