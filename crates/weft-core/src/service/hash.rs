//! ContentHasher trait for computing integrity hashes.
//!
//! Defined in weft-core so the checkpoint manager can fingerprint workflow
//! definitions without coupling to a specific hashing algorithm. The
//! `Sha256ContentHasher` adapter lives in weft-infra.

/// Abstraction over content hashing for integrity verification.
///
/// Used to compute the digest of a run's frozen definition when the run
/// starts and to verify it again on resume.
pub trait ContentHasher: Send + Sync {
    /// Compute a hex-encoded hash of the given content.
    fn compute_hash(&self, content: &[u8]) -> String;
}
