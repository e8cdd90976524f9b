//! Workflow engine core: definition parsing, DAG scheduling, and durable checkpointing.
//!
//! - `definition` -- YAML/JSON parsing and the canonical snapshot form
//! - `graph` -- validation, cycle detection, layers and critical path
//! - `expression` -- condition and loop expression language
//! - `context` -- run facts visible to expressions
//! - `artifact` -- versioned artifact registry, contracts and transforms
//! - `circuit` -- per-operation circuit breakers
//! - `retry` -- error classification and exponential backoff
//! - `loop_controller` -- bounded loops with progress guards
//! - `scheduler` -- ready queue and dependency readiness
//! - `checkpoint` -- durable checkpoint manager for crash recovery
//! - `executor` -- the control loop driving a run

pub mod artifact;
pub mod checkpoint;
pub mod circuit;
pub mod context;
pub mod definition;
pub mod executor;
pub mod expression;
pub mod graph;
pub mod loop_controller;
pub mod retry;
pub mod scheduler;

#[cfg(test)]
pub mod testing;
