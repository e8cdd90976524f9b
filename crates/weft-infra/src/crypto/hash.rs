//! SHA-256 fingerprints of frozen workflow definitions.
//!
//! The checkpoint manager stores the digest in `workflow_ref.digest` when a
//! run starts and recomputes it on resume; any edit to the snapshot shows up
//! as a mismatch.

use std::fmt::Write;

use sha2::{Digest, Sha256};
use weft_core::service::hash::ContentHasher;

/// `ContentHasher` producing 64 lowercase hex characters.
#[derive(Debug, Default, Clone, Copy)]
pub struct Sha256ContentHasher;

impl Sha256ContentHasher {
    pub fn new() -> Self {
        Self
    }
}

impl ContentHasher for Sha256ContentHasher {
    fn compute_hash(&self, content: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(content);
        hasher
            .finalize()
            .iter()
            .fold(String::with_capacity(64), |mut hex, byte| {
                let _ = write!(hex, "{byte:02x}");
                hex
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_core::workflow::definition::{canonical_bytes, parse_workflow_yaml};

    #[test]
    fn test_empty_input_digest() {
        assert_eq!(
            Sha256ContentHasher.compute_hash(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_definition_edit_changes_digest() {
        let yaml = r#"
name: ci
version: "1"
steps:
  - { id: build, operation: shell }
  - { id: test, operation: shell, depends_on: [build] }
"#;
        let def = parse_workflow_yaml(yaml).unwrap();
        let mut edited = def.clone();
        edited.steps[1].depends_on.clear();

        let hasher = Sha256ContentHasher::new();
        let original = hasher.compute_hash(&canonical_bytes(&def).unwrap());
        assert_eq!(original.len(), 64);
        assert!(original.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b)));
        assert_eq!(original, hasher.compute_hash(&canonical_bytes(&def).unwrap()));
        assert_ne!(original, hasher.compute_hash(&canonical_bytes(&edited).unwrap()));
    }
}
