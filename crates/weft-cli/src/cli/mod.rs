//! CLI command definitions and dispatch for the `weft` binary.
//!
//! Uses clap derive macros for argument parsing. Each subcommand lives in its
//! own module and returns an [`Outcome`]; errors are mapped to exit codes by
//! [`exit_code_for`].

pub mod list;
pub mod progress;
pub mod report;
pub mod resume;
pub mod run;
pub mod status;
pub mod validate;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use clap_complete::Shell;
use uuid::Uuid;
use weft_core::workflow::checkpoint::CheckpointError;
use weft_core::workflow::definition::DefinitionError;
use weft_core::workflow::executor::ExecutorError;
use weft_core::workflow::graph::GraphErrors;

/// The run failed, was cancelled or was paused.
pub const EXIT_FAILURE: u8 = 1;
/// The definition or its inputs are invalid.
pub const EXIT_VALIDATION: u8 = 2;
/// The run id is unknown or its stored state is corrupt.
pub const EXIT_STATE: u8 = 3;

/// Run declarative workflows as dependency graphs.
#[derive(Parser)]
#[command(name = "weft", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress all output except errors.
    #[arg(long, short, global = true)]
    pub quiet: bool,

    /// Detailed output (-v for info, -vv for debug, -vvv for trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Data directory holding config.toml and run state.
    #[arg(long, global = true, env = "WEFT_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Emit logs as JSON lines on stderr.
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Export spans through the OpenTelemetry stdout exporter.
    #[arg(long, global = true)]
    pub otel: bool,

    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    pub fn output(&self) -> Output {
        Output {
            json: self.json,
            quiet: self.quiet,
        }
    }
}

#[derive(Subcommand)]
pub enum Commands {
    /// Execute a workflow definition (YAML or JSON).
    Run {
        /// Path to the workflow file.
        file: PathBuf,

        /// Workflow input as key=value (repeatable). Values that parse as JSON
        /// are passed as JSON, anything else as a string.
        #[arg(long = "input", short = 'i', value_name = "KEY=VALUE")]
        input: Vec<String>,

        /// JSON file holding an object of inputs. `--input` values win.
        #[arg(long, value_name = "FILE")]
        inputs_file: Option<PathBuf>,
    },

    /// Continue a paused, cancelled, failed or interrupted run.
    Resume {
        /// Run UUID.
        run_id: String,
    },

    /// Show the stored state of a run.
    Status {
        /// Run UUID.
        run_id: String,
    },

    /// Check a workflow definition without running it.
    Validate {
        /// Path to the workflow file.
        file: PathBuf,
    },

    /// List recent runs.
    #[command(alias = "ls")]
    List {
        /// Maximum number of runs to display.
        #[arg(long, default_value = "20")]
        limit: usize,
    },

    /// Generate shell completions.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
}

/// Output mode shared by every command.
#[derive(Debug, Clone, Copy)]
pub struct Output {
    pub json: bool,
    pub quiet: bool,
}

impl Output {
    /// Whether styled text should be printed.
    pub fn styled(&self) -> bool {
        !self.json && !self.quiet
    }
}

/// Result of a command that completed without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    /// The command ran but the run did not complete.
    Failed,
    /// The definition was checked and rejected.
    Invalid,
}

impl Outcome {
    pub fn exit_code(self) -> u8 {
        match self {
            Self::Success => 0,
            Self::Failed => EXIT_FAILURE,
            Self::Invalid => EXIT_VALIDATION,
        }
    }
}

/// Argument errors detected by the CLI before the engine is involved.
#[derive(Debug, thiserror::Error)]
pub enum ArgError {
    #[error("invalid input '{0}': expected KEY=VALUE")]
    InvalidInput(String),

    #[error("inputs file must hold a JSON object")]
    InputsNotObject,

    #[error("'{0}' is not a valid run id")]
    InvalidRunId(String),
}

/// Map an error to the process exit code by walking its cause chain.
pub fn exit_code_for(err: &anyhow::Error) -> u8 {
    for cause in err.chain() {
        if let Some(e) = cause.downcast_ref::<ExecutorError>() {
            if e.is_validation() {
                return EXIT_VALIDATION;
            }
            if e.is_state() {
                return EXIT_STATE;
            }
            return EXIT_FAILURE;
        }
        if let Some(e) = cause.downcast_ref::<CheckpointError>() {
            return match e {
                CheckpointError::RunNotFound(_) | CheckpointError::Corruption { .. } => EXIT_STATE,
                _ => EXIT_FAILURE,
            };
        }
        if cause.is::<DefinitionError>() || cause.is::<GraphErrors>() {
            return EXIT_VALIDATION;
        }
        if let Some(e) = cause.downcast_ref::<ArgError>() {
            return match e {
                ArgError::InvalidRunId(_) => EXIT_STATE,
                _ => EXIT_VALIDATION,
            };
        }
    }
    EXIT_FAILURE
}

pub fn parse_run_id(raw: &str) -> Result<Uuid, ArgError> {
    Uuid::parse_str(raw.trim()).map_err(|_| ArgError::InvalidRunId(raw.to_string()))
}
