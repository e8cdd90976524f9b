//! Shared domain types for weft.
//!
//! This crate contains the serde-facing shapes used across the engine:
//! workflow definitions, run state, artifacts, events, configuration, and
//! the repository error type.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, semver, thiserror.

pub mod artifact;
pub mod config;
pub mod error;
pub mod event;
pub mod run;
pub mod workflow;
