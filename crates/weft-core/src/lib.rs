//! Engine logic and port definitions for weft.
//!
//! This crate defines the "ports" (repository, hasher and operation traits)
//! that the infrastructure layer implements, plus the workflow engine that
//! drives them. It depends only on `weft-types` -- never on `weft-infra` or
//! any filesystem/process crate.

pub mod event;
pub mod operation;
pub mod repository;
pub mod service;
pub mod workflow;
