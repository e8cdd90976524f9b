//! Test support: in-memory repository, a trivial hasher, and a scripted
//! operation that records when each step starts and finishes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use uuid::Uuid;
use weft_types::artifact::{ArtifactContent, ProducedArtifact};
use weft_types::error::RepositoryError;
use weft_types::run::{RunState, RunSummary};
use weft_types::workflow::WorkflowDefinition;

use crate::operation::{Operation, OperationContext, OperationError, OperationOutcome};
use crate::repository::RunRepository;
use crate::service::ContentHasher;

// ---------------------------------------------------------------------------
// MemoryRunRepository
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct Stored {
    runs: HashMap<Uuid, RunState>,
    definitions: HashMap<Uuid, WorkflowDefinition>,
    saves: usize,
}

/// Shared in-memory repository; clones see the same data.
#[derive(Debug, Clone, Default)]
pub struct MemoryRunRepository {
    inner: Arc<Mutex<Stored>>,
}

impl MemoryRunRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn save_count(&self) -> usize {
        self.inner.lock().unwrap().saves
    }

    pub fn run(&self, run_id: &Uuid) -> Option<RunState> {
        self.inner.lock().unwrap().runs.get(run_id).cloned()
    }

    /// Overwrite stored state directly, bypassing the checkpoint manager.
    pub fn tamper(&self, run: RunState) {
        self.inner.lock().unwrap().runs.insert(run.run_id, run);
    }
}

impl RunRepository for MemoryRunRepository {
    async fn save_run(&self, run: &RunState) -> Result<(), RepositoryError> {
        let mut inner = self.inner.lock().unwrap();
        inner.saves += 1;
        inner.runs.insert(run.run_id, run.clone());
        Ok(())
    }

    async fn load_run(&self, run_id: &Uuid) -> Result<Option<RunState>, RepositoryError> {
        Ok(self.inner.lock().unwrap().runs.get(run_id).cloned())
    }

    async fn list_runs(&self, limit: Option<usize>) -> Result<Vec<RunSummary>, RepositoryError> {
        let inner = self.inner.lock().unwrap();
        let mut runs: Vec<RunSummary> = inner.runs.values().map(RunState::summary).collect();
        runs.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        if let Some(limit) = limit {
            runs.truncate(limit);
        }
        Ok(runs)
    }

    async fn save_definition(
        &self,
        run_id: &Uuid,
        definition: &WorkflowDefinition,
    ) -> Result<(), RepositoryError> {
        self.inner
            .lock()
            .unwrap()
            .definitions
            .insert(*run_id, definition.clone());
        Ok(())
    }

    async fn load_definition(
        &self,
        run_id: &Uuid,
    ) -> Result<Option<WorkflowDefinition>, RepositoryError> {
        Ok(self.inner.lock().unwrap().definitions.get(run_id).cloned())
    }
}

// ---------------------------------------------------------------------------
// ChecksumHasher
// ---------------------------------------------------------------------------

/// Order-sensitive checksum; good enough to detect edits in tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct ChecksumHasher;

impl ContentHasher for ChecksumHasher {
    fn compute_hash(&self, content: &[u8]) -> String {
        let sum = content.iter().fold(17u64, |acc, b| {
            acc.wrapping_mul(31).wrapping_add(u64::from(*b))
        });
        format!("{sum:016x}")
    }
}

// ---------------------------------------------------------------------------
// ScriptedOperation
// ---------------------------------------------------------------------------

/// Start/finish log shared by scripted operations.
#[derive(Debug, Default)]
pub struct Trace {
    inner: Mutex<TraceInner>,
}

#[derive(Debug, Default)]
struct TraceInner {
    running: usize,
    max_running: usize,
    events: Vec<(String, bool)>,
    calls: HashMap<String, u32>,
}

impl Trace {
    fn start(&self, step_id: &str) -> u32 {
        let mut inner = self.inner.lock().unwrap();
        inner.running += 1;
        inner.max_running = inner.max_running.max(inner.running);
        inner.events.push((step_id.to_string(), true));
        let calls = inner.calls.entry(step_id.to_string()).or_insert(0);
        *calls += 1;
        *calls
    }

    fn finish(&self, step_id: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.running -= 1;
        inner.events.push((step_id.to_string(), false));
    }

    pub fn max_running(&self) -> usize {
        self.inner.lock().unwrap().max_running
    }

    /// Step ids in the order they started.
    pub fn starts(&self) -> Vec<String> {
        self.inner
            .lock()
            .unwrap()
            .events
            .iter()
            .filter(|(_, start)| *start)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Position of an event in the log.
    pub fn position(&self, step_id: &str, start: bool) -> Option<usize> {
        self.inner
            .lock()
            .unwrap()
            .events
            .iter()
            .position(|(id, s)| id == step_id && *s == start)
    }

    pub fn calls(&self, step_id: &str) -> u32 {
        self.inner
            .lock()
            .unwrap()
            .calls
            .get(step_id)
            .copied()
            .unwrap_or(0)
    }
}

/// Behaviour is driven by the step args:
///
/// - `delay_ms`: sleep before finishing (cancellable); with `delay_from_call`
///   only calls from that number on sleep
/// - `fail_kind` + `fail_times`: fail the first N calls with that kind
///   (`fail_times` absent means always fail)
/// - `exit_status`: reported exit status
/// - `metrics`: object of numbers; `metric_step` adds `call * step` to each
/// - `artifacts`: list of `{name, type, version, value}`
#[derive(Debug, Clone)]
pub struct ScriptedOperation {
    name: String,
    trace: Arc<Trace>,
}

impl ScriptedOperation {
    pub fn new(name: &str, trace: Arc<Trace>) -> Self {
        Self {
            name: name.to_string(),
            trace,
        }
    }
}

impl Operation for ScriptedOperation {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(
        &self,
        args: &Value,
        ctx: &OperationContext,
    ) -> Result<OperationOutcome, OperationError> {
        let call = self.trace.start(&ctx.step_id);
        let result = run_script(args, ctx, call).await;
        self.trace.finish(&ctx.step_id);
        result
    }
}

async fn run_script(
    args: &Value,
    ctx: &OperationContext,
    call: u32,
) -> Result<OperationOutcome, OperationError> {
    let delay_from = args.get("delay_from_call").and_then(Value::as_u64).unwrap_or(1);
    if let Some(ms) = args
        .get("delay_ms")
        .and_then(Value::as_u64)
        .filter(|_| u64::from(call) >= delay_from)
    {
        tokio::select! {
            _ = ctx.cancel.cancelled() => return Err(OperationError::cancelled()),
            _ = tokio::time::sleep(Duration::from_millis(ms)) => {}
        }
    }

    if let Some(kind) = args.get("fail_kind").and_then(Value::as_str) {
        let times = args.get("fail_times").and_then(Value::as_u64);
        if times.is_none_or(|t| u64::from(call) <= t) {
            return Err(OperationError::new(kind, format!("scripted failure #{call}")));
        }
    }

    let mut outcome = OperationOutcome::success();
    if let Some(status) = args.get("exit_status").and_then(Value::as_i64) {
        outcome.exit_status = status as i32;
    }
    let step = args.get("metric_step").and_then(Value::as_f64).unwrap_or(0.0);
    if let Some(metrics) = args.get("metrics").and_then(Value::as_object) {
        for (name, value) in metrics {
            if let Some(v) = value.as_f64() {
                outcome = outcome.with_metric(name.clone(), v + step * f64::from(call));
            }
        }
    }
    if let Some(list) = args.get("artifacts").and_then(Value::as_array) {
        for item in list {
            let version = item["version"]
                .as_str()
                .and_then(|v| semver::Version::parse(v).ok())
                .unwrap_or_else(|| semver::Version::new(1, 0, 0));
            outcome = outcome.with_artifact(ProducedArtifact {
                name: item["name"].as_str().unwrap_or_default().to_string(),
                artifact_type: item["type"].as_str().unwrap_or_default().to_string(),
                version,
                content: ArtifactContent::Inline(item["value"].clone()),
            });
        }
    }
    Ok(outcome)
}
