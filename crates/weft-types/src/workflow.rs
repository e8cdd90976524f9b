//! Workflow definition types.
//!
//! `WorkflowDefinition` is the declarative document a user writes (YAML or
//! JSON). It is parsed once, validated by the graph builder, and frozen for
//! the lifetime of a run.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::artifact::ConsumerContract;

/// Prefix marking a `depends_on` entry as an artifact reference rather than a step id.
pub const ARTIFACT_REF_PREFIX: &str = "artifact:";

// ---------------------------------------------------------------------------
// Workflow Definition
// ---------------------------------------------------------------------------

/// The declarative workflow document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Workflow name.
    pub name: String,
    /// Version string of the definition (informational, e.g. "1.0.0").
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Inputs a run must (or may) be given.
    #[serde(default)]
    pub inputs: Vec<InputDeclaration>,
    /// Named expressions evaluated over step results when a run completes.
    #[serde(default)]
    pub outputs: Vec<OutputDeclaration>,
    /// Workflow-level overrides of the global execution defaults.
    #[serde(default)]
    pub config: WorkflowConfig,
    /// Steps in declaration order. Declaration order is the scheduling tie-break.
    pub steps: Vec<StepDefinition>,
}

/// A declared workflow input.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputDeclaration {
    pub name: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// A declared workflow output: an expression over the final run context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputDeclaration {
    pub name: String,
    pub expr: String,
}

/// Workflow-level execution overrides. Unset fields fall back to `GlobalConfig`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrent: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_retry: Option<RetryPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_error_in_sequential: Option<ErrorPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_error_in_parallel: Option<ErrorPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub breaker: Option<BreakerConfig>,
}

/// What the scheduler does after a step fails terminally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorPolicy {
    /// Abort unstarted steps; in-flight steps finish.
    Stop,
    /// Skip everything downstream of the failed step; continue the rest.
    Skip,
    /// Treat the failure as satisfied for dependents (non-critical steps only).
    Continue,
}

// ---------------------------------------------------------------------------
// Step Definition
// ---------------------------------------------------------------------------

/// A single schedulable unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDefinition {
    /// Unique within the workflow.
    pub id: String,
    /// Opaque operation name resolved through the operation registry.
    pub operation: String,
    /// Arguments handed to the operation verbatim.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub args: Value,
    /// Step ids, or `artifact:<name>` references resolved to the producing step.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Boolean condition gating the step. Absent means always run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    /// Higher values dispatch first among ready steps.
    #[serde(default)]
    pub priority: i32,
    /// Non-critical steps may be tolerated by the `continue` policy.
    #[serde(default = "default_true")]
    pub critical: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
    #[serde(rename = "loop", default, skip_serializing_if = "Option::is_none")]
    pub loop_policy: Option<LoopPolicy>,
    /// Per-attempt timeout in milliseconds. Every retry gets a fresh window,
    /// so a step may run up to `max_attempts * timeout_ms` plus backoff.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Artifact names this step declares it produces.
    #[serde(default)]
    pub outputs: Vec<String>,
    /// Artifacts this step consumes, with their compatibility contracts.
    #[serde(default)]
    pub consumes: Vec<ConsumerContract>,
    /// Per-step override of the workflow error policy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_error: Option<ErrorPolicy>,
    /// Alternate operation used once when the primary's circuit is open.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback: Option<OperationRef>,
}

fn default_true() -> bool {
    true
}

/// A reference to an operation plus its arguments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationRef {
    pub operation: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub args: Value,
}

/// A parsed `depends_on` entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DependencyRef<'a> {
    Step(&'a str),
    Artifact(&'a str),
}

impl<'a> DependencyRef<'a> {
    /// Classify a raw `depends_on` entry.
    pub fn parse(raw: &'a str) -> Self {
        match raw.strip_prefix(ARTIFACT_REF_PREFIX) {
            Some(name) => DependencyRef::Artifact(name.trim()),
            None => DependencyRef::Step(raw),
        }
    }
}

// ---------------------------------------------------------------------------
// Retry Policy
// ---------------------------------------------------------------------------

/// Retry and backoff parameters for a step.
///
/// `delay(attempt) = initial_delay_ms * multiplier^(attempt - 1)`, capped at
/// `max_delay_ms`, plus up to `jitter * delay` of random extra wait.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts (default 3).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Fraction of the computed delay added as random jitter (0.0 disables).
    #[serde(default)]
    pub jitter: f64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay_ms() -> u64 {
    100
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_max_delay_ms() -> u64 {
    30_000
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            multiplier: default_multiplier(),
            max_delay_ms: default_max_delay_ms(),
            jitter: 0.0,
        }
    }
}

/// Circuit breaker thresholds, shared by all steps invoking the same operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failures of one operation before the breaker opens.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// How long the breaker stays open before allowing a half-open trial.
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_cooldown_ms() -> u64 {
    30_000
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            cooldown_ms: default_cooldown_ms(),
        }
    }
}

// ---------------------------------------------------------------------------
// Loop Policy
// ---------------------------------------------------------------------------

/// Iteration policy for a looping step. Exactly one of `while`/`until` is set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopPolicy {
    /// Keep iterating while this holds.
    #[serde(rename = "while", default, skip_serializing_if = "Option::is_none")]
    pub while_expr: Option<String>,
    /// Stop iterating once this holds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub until: Option<String>,
    /// Hard iteration budget.
    pub max_iterations: u32,
    /// Wall-clock budget for the whole loop.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// No-progress guard.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<ProgressGuard>,
}

impl LoopPolicy {
    /// The loop expression text, whichever form was given.
    pub fn expression(&self) -> Option<&str> {
        self.until.as_deref().or(self.while_expr.as_deref())
    }
}

/// Exits a loop whose progress metric stops improving.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressGuard {
    /// Metric reported by the step body on each iteration.
    pub metric: String,
    /// Minimum improvement over the best value seen so far.
    #[serde(default)]
    pub min_delta: f64,
    /// Stagnant iterations tolerated before the loop is declared stalled.
    #[serde(default = "default_allow_plateau")]
    pub allow_plateau_iterations: u32,
    #[serde(default)]
    pub direction: ProgressDirection,
}

fn default_allow_plateau() -> u32 {
    2
}

/// Which direction counts as progress.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressDirection {
    #[default]
    Increase,
    Decrease,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
