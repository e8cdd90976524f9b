//! Service ports used by the engine.
//!
//! Like the repository traits, these are implemented in weft-infra.

pub mod hash;

pub use hash::ContentHasher;
