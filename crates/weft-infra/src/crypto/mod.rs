//! Cryptographic operations for weft.
//!
//! - `hash`: SHA-256 digests of frozen workflow definitions

pub mod hash;
