//! Run state types.
//!
//! `RunState` is the persisted record of one workflow execution. It is owned
//! exclusively by the executor's control loop and written to disk after every
//! step transition, so it is always a consistent prefix of the run.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::artifact::Artifact;

// ---------------------------------------------------------------------------
// Statuses
// ---------------------------------------------------------------------------

/// Overall status of a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    /// Whether the run can no longer make progress without a resume.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::Paused
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a single step within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Ready,
    Running,
    Retrying,
    Succeeded,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Skipped)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Retrying => "retrying",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a step was skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// Its condition evaluated to false.
    Condition,
    /// An upstream step failed and the error policy skipped dependents.
    UpstreamFailed,
    /// The run was stopped by a `stop` error policy before the step started.
    Aborted,
}

/// Classification of a step failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Condition or loop expression failed to evaluate.
    Eval,
    /// A consumed artifact failed its contract and no transform applied.
    Incompatibility,
    /// The operation itself failed (after retries, if any).
    Operation,
    /// An attempt exceeded its timeout.
    Timeout,
    /// The operation's circuit breaker was open and no fallback succeeded.
    CircuitOpen,
    LoopBudgetExceeded,
    LoopTimeout,
    LoopStalled,
    Cancelled,
    /// A produced artifact could not be registered.
    Artifact,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Eval => "eval",
            Self::Incompatibility => "incompatibility",
            Self::Operation => "operation",
            Self::Timeout => "timeout",
            Self::CircuitOpen => "circuit_open",
            Self::LoopBudgetExceeded => "loop_budget_exceeded",
            Self::LoopTimeout => "loop_timeout",
            Self::LoopStalled => "loop_stalled",
            Self::Cancelled => "cancelled",
            Self::Artifact => "artifact",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Step State
// ---------------------------------------------------------------------------

/// A recorded step failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepError {
    pub kind: ErrorKind,
    /// The operation's own error kind (e.g. "timeout", "nonzero_exit").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation_kind: Option<String>,
    pub message: String,
}

impl StepError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            operation_kind: None,
            message: message.into(),
        }
    }
}

impl fmt::Display for StepError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// What a succeeded step left behind.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepOutputs {
    pub exit_status: i32,
    #[serde(default)]
    pub metrics: BTreeMap<String, f64>,
    /// Artifacts registered from this step's results.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<Artifact>,
}

/// Persisted state of one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepState {
    pub status: StepStatus,
    /// Attempts made by the most recent execution.
    #[serde(default)]
    pub attempts: u32,
    /// Loop iterations executed (0 for non-looping steps).
    #[serde(default)]
    pub iterations: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs: Option<StepOutputs>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StepError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<SkipReason>,
    /// A failed non-critical step whose failure was accepted by `continue`.
    #[serde(default)]
    pub tolerated: bool,
    /// The step succeeded through its fallback operation.
    #[serde(default)]
    pub used_fallback: bool,
}

impl StepState {
    pub fn pending() -> Self {
        Self {
            status: StepStatus::Pending,
            attempts: 0,
            iterations: 0,
            started_at: None,
            ended_at: None,
            outputs: None,
            error: None,
            skip_reason: None,
            tolerated: false,
            used_fallback: false,
        }
    }

    /// Whether dependents may treat this step as satisfied.
    pub fn satisfies_dependents(&self) -> bool {
        match self.status {
            StepStatus::Succeeded => true,
            StepStatus::Skipped => self.skip_reason == Some(SkipReason::Condition),
            StepStatus::Failed => self.tolerated,
            _ => false,
        }
    }
}

impl Default for StepState {
    fn default() -> Self {
        Self::pending()
    }
}

// ---------------------------------------------------------------------------
// Run State
// ---------------------------------------------------------------------------

/// Identifies the frozen definition a run executes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowRef {
    pub name: String,
    pub version: String,
    /// Hex SHA-256 of the canonical definition snapshot.
    pub digest: String,
}

/// The first fatal failure of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunError {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    pub kind: ErrorKind,
    pub message: String,
}

/// Persisted state of a workflow run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    pub run_id: Uuid,
    pub workflow: WorkflowRef,
    pub status: RunStatus,
    pub steps: BTreeMap<String, StepState>,
    /// Resolved inputs (declared defaults applied).
    #[serde(default)]
    pub inputs: Map<String, Value>,
    /// Evaluated workflow outputs, filled in on completion.
    #[serde(default)]
    pub outputs: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RunError>,
    /// Step ids skipped in this run, in the order they were skipped.
    #[serde(default)]
    pub skipped: Vec<String>,
    /// Monotonically increasing checkpoint counter.
    pub checkpoint_seq: u64,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl RunState {
    /// A fresh pending run with every step in `Pending`.
    pub fn new<I>(run_id: Uuid, workflow: WorkflowRef, step_ids: I, inputs: Map<String, Value>) -> Self
    where
        I: IntoIterator<Item = String>,
    {
        let now = Utc::now();
        Self {
            run_id,
            workflow,
            status: RunStatus::Pending,
            steps: step_ids
                .into_iter()
                .map(|id| (id, StepState::pending()))
                .collect(),
            inputs,
            outputs: Map::new(),
            error: None,
            skipped: Vec::new(),
            checkpoint_seq: 0,
            started_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    pub fn step(&self, id: &str) -> Option<&StepState> {
        self.steps.get(id)
    }

    /// Count of steps per status, for progress displays.
    pub fn status_counts(&self) -> BTreeMap<StepStatus, usize> {
        let mut counts = BTreeMap::new();
        for state in self.steps.values() {
            *counts.entry(state.status).or_insert(0) += 1;
        }
        counts
    }

    pub fn summary(&self) -> RunSummary {
        RunSummary {
            run_id: self.run_id,
            workflow_name: self.workflow.name.clone(),
            status: self.status,
            checkpoint_seq: self.checkpoint_seq,
            started_at: self.started_at,
            updated_at: self.updated_at,
        }
    }
}

/// A one-line view of a run, used by listings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub workflow_name: String,
    pub status: RunStatus,
    pub checkpoint_seq: u64,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_run() -> RunState {
        RunState::new(
            Uuid::now_v7(),
            WorkflowRef {
                name: "ci".to_string(),
                version: "1.0.0".to_string(),
                digest: "abc".to_string(),
            },
            ["build".to_string(), "test".to_string()],
            Map::new(),
        )
    }

    #[test]
    fn test_new_run_has_pending_steps() {
        let run = sample_run();
        assert_eq!(run.status, RunStatus::Pending);
        assert_eq!(run.checkpoint_seq, 0);
        assert!(run.steps.values().all(|s| s.status == StepStatus::Pending));
    }

    #[test]
    fn test_satisfies_dependents() {
        let mut state = StepState::pending();
        assert!(!state.satisfies_dependents());

        state.status = StepStatus::Succeeded;
        assert!(state.satisfies_dependents());

        state.status = StepStatus::Skipped;
        state.skip_reason = Some(SkipReason::Condition);
        assert!(state.satisfies_dependents());

        state.skip_reason = Some(SkipReason::UpstreamFailed);
        assert!(!state.satisfies_dependents());

        state.status = StepStatus::Failed;
        state.skip_reason = None;
        assert!(!state.satisfies_dependents());
        state.tolerated = true;
        assert!(state.satisfies_dependents());
    }

    #[test]
    fn test_run_state_json_roundtrip_preserves_steps() {
        let mut run = sample_run();
        run.steps.get_mut("build").unwrap().status = StepStatus::Succeeded;
        run.steps.get_mut("build").unwrap().outputs = Some(StepOutputs {
            exit_status: 0,
            metrics: BTreeMap::from([("duration_ms".to_string(), 12.0)]),
            artifacts: Vec::new(),
        });
        let json = serde_json::to_string(&run).unwrap();
        let back: RunState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, run);
    }

    #[test]
    fn test_status_display() {
        assert_eq!(RunStatus::Cancelled.to_string(), "cancelled");
        assert_eq!(StepStatus::Retrying.to_string(), "retrying");
        assert_eq!(ErrorKind::LoopStalled.to_string(), "loop_stalled");
        assert!(RunStatus::Paused.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
    }

    #[test]
    fn test_status_counts() {
        let mut run = sample_run();
        run.steps.get_mut("test").unwrap().status = StepStatus::Running;
        let counts = run.status_counts();
        assert_eq!(counts.get(&StepStatus::Pending), Some(&1));
        assert_eq!(counts.get(&StepStatus::Running), Some(&1));
        assert_eq!(counts.get(&StepStatus::Failed), None);
    }
}
