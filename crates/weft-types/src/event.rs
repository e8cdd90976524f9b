//! Run lifecycle events.
//!
//! `RunEvent` is published on the executor's event bus as steps move through
//! their lifecycle. The CLI renders these as progress lines; other consumers
//! may serialize them as JSON lines.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::run::{ErrorKind, RunStatus, SkipReason};

/// A single observable transition in a workflow run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    RunStarted {
        run_id: Uuid,
        workflow: String,
        resumed: bool,
    },
    StepStarted {
        run_id: Uuid,
        step_id: String,
        attempt: u32,
    },
    StepRetrying {
        run_id: Uuid,
        step_id: String,
        attempt: u32,
        delay_ms: u64,
        error: String,
    },
    StepIteration {
        run_id: Uuid,
        step_id: String,
        iteration: u32,
    },
    StepSucceeded {
        run_id: Uuid,
        step_id: String,
        attempts: u32,
        duration_ms: u64,
    },
    StepFailed {
        run_id: Uuid,
        step_id: String,
        kind: ErrorKind,
        message: String,
    },
    StepSkipped {
        run_id: Uuid,
        step_id: String,
        reason: SkipReason,
    },
    CircuitOpened {
        run_id: Uuid,
        operation: String,
    },
    CheckpointSaved {
        run_id: Uuid,
        seq: u64,
    },
    RunFinished {
        run_id: Uuid,
        status: RunStatus,
    },
}

impl RunEvent {
    /// The run this event belongs to.
    pub fn run_id(&self) -> Uuid {
        match self {
            Self::RunStarted { run_id, .. }
            | Self::StepStarted { run_id, .. }
            | Self::StepRetrying { run_id, .. }
            | Self::StepIteration { run_id, .. }
            | Self::StepSucceeded { run_id, .. }
            | Self::StepFailed { run_id, .. }
            | Self::StepSkipped { run_id, .. }
            | Self::CircuitOpened { run_id, .. }
            | Self::CheckpointSaved { run_id, .. }
            | Self::RunFinished { run_id, .. } => *run_id,
        }
    }
}
