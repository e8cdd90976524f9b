//! Observability setup for weft: structured logging with optional
//! OpenTelemetry trace export.

pub mod tracing_setup;

pub use tracing_setup::{LogFormat, init_tracing, level_for, shutdown_tracing};
