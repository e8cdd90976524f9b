//! Infrastructure layer for weft.
//!
//! Contains implementations of the ports defined in `weft-core`: the
//! JSON-file run repository, SHA-256 definition hashing, the TOML config
//! loader, data directory resolution and the built-in operations.

pub mod config;
pub mod crypto;
pub mod filesystem;
pub mod operation;
pub mod store;
