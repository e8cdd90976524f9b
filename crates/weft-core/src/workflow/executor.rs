//! Workflow executor: a single control loop over a bounded worker pool.
//!
//! The `Executor` validates a definition, freezes it into a run, and then
//! drives the run with one coordinating loop that owns the `RunState`:
//!
//! 1. Recompute readiness of pending steps (dependencies terminal and
//!    satisfied, condition true). Unsatisfiable steps are skipped; steps whose
//!    condition fails to evaluate are failed closed.
//! 2. Dispatch ready steps from the priority queue while fewer than
//!    `max_concurrent` workers are in flight.
//! 3. Wait for a worker message (attempt started, retrying, loop iteration,
//!    breaker opened), a worker completion, or a pause/cancel signal.
//!
//! Workers run on a `JoinSet`; each wraps its operation in the retry manager,
//! the per-attempt timeout and (for looping steps) the loop controller. Every
//! state transition is checkpointed before the loop moves on, so the durable
//! state never runs ahead of what actually happened.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use weft_types::artifact::{Artifact, ArtifactStatus};
use weft_types::config::{ExecutionSettings, GlobalConfig};
use weft_types::event::RunEvent;
use weft_types::run::{
    ErrorKind, RunError, RunState, RunStatus, RunSummary, SkipReason, StepError, StepOutputs,
    StepState, StepStatus,
};
use weft_types::workflow::{
    ErrorPolicy, LoopPolicy, RetryPolicy, StepDefinition, WorkflowDefinition,
};

use super::artifact::{ArtifactRegistry, ArtifactTransform};
use super::checkpoint::{CheckpointError, CheckpointManager};
use super::context::{EvalContext, to_json};
use super::expression::Expression;
use super::graph::{Graph, GraphBuilder, GraphErrors};
use super::loop_controller::{LoopController, LoopError};
use super::retry::{
    ErrorClassifier, KindClassifier, RetryError, RetryEvent, RetryFailure, RetryManager,
};
use super::scheduler::{ReadyQueue, Readiness, readiness};
use crate::event::EventBus;
use crate::operation::{
    BoxOperation, KIND_CANCELLED, KIND_TIMEOUT, OperationContext, OperationError,
    OperationOutcome, OperationRegistry,
};
use crate::repository::RunRepository;
use crate::service::ContentHasher;

/// Metric added to every finished step.
pub const DURATION_METRIC: &str = "duration_ms";

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that stop the executor from running or resuming a workflow.
///
/// Step failures are not errors here; they are recorded in the run state.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("workflow is invalid: {0}")]
    Validation(GraphErrors),

    #[error("missing required inputs: {}", .0.join(", "))]
    MissingInputs(Vec<String>),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error("run {0} is already executing")]
    AlreadyActive(Uuid),

    #[error("worker task failed: {0}")]
    Worker(String),
}

impl ExecutorError {
    /// Errors caused by the definition or its inputs.
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_) | Self::MissingInputs(_))
    }

    /// Errors caused by stored state (unknown or corrupt runs).
    pub fn is_state(&self) -> bool {
        matches!(
            self,
            Self::Checkpoint(CheckpointError::RunNotFound(_))
                | Self::Checkpoint(CheckpointError::Corruption { .. })
        )
    }
}

// ---------------------------------------------------------------------------
// RunResult
// ---------------------------------------------------------------------------

/// Outcome of `run`/`resume`.
#[derive(Debug, Clone)]
pub struct RunResult {
    pub run_id: Uuid,
    pub status: RunStatus,
    pub outputs: Map<String, Value>,
    /// The first fatal step failure, if any.
    pub error: Option<RunError>,
    /// Steps skipped in this run, in the order they were skipped.
    pub skipped: Vec<String>,
    pub state: RunState,
}

impl RunResult {
    fn from_state(state: RunState) -> Self {
        Self {
            run_id: state.run_id,
            status: state.status,
            outputs: state.outputs.clone(),
            error: state.error.clone(),
            skipped: state.skipped.clone(),
            state,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.status == RunStatus::Completed
    }
}

// ---------------------------------------------------------------------------
// Run control
// ---------------------------------------------------------------------------

/// Pause and cancel signals for one executing run.
#[derive(Debug, Clone, Default)]
struct RunControl {
    /// Stops dispatch and signals in-flight workers.
    cancel: CancellationToken,
    /// Stops dispatch; in-flight workers finish normally.
    pause: CancellationToken,
}

impl RunControl {
    fn halted(&self) -> bool {
        self.cancel.is_cancelled() || self.pause.is_cancelled()
    }

    async fn wait_halt(&self) {
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            _ = self.pause.cancelled() => {}
        }
    }
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

/// Runs workflows against a run repository and an operation catalog.
///
/// Generic over `R: RunRepository` for storage and `H: ContentHasher` for
/// definition digests.
pub struct Executor<R: RunRepository, H: ContentHasher> {
    checkpoint: CheckpointManager<R>,
    hasher: H,
    operations: OperationRegistry,
    config: GlobalConfig,
    classifier: Arc<dyn ErrorClassifier>,
    transforms: Vec<Arc<dyn ArtifactTransform>>,
    event_bus: EventBus,
    /// Pause/cancel signals keyed by run_id, present while a run executes.
    controls: DashMap<Uuid, RunControl>,
}

impl<R: RunRepository, H: ContentHasher> Executor<R, H> {
    pub fn new(repo: R, hasher: H, operations: OperationRegistry, config: GlobalConfig) -> Self {
        let classifier = Arc::new(KindClassifier::new(
            config.transient_error_kinds.iter().cloned(),
        ));
        Self {
            checkpoint: CheckpointManager::new(repo),
            hasher,
            operations,
            config,
            classifier,
            transforms: Vec::new(),
            event_bus: EventBus::default(),
            controls: DashMap::new(),
        }
    }

    pub fn with_event_bus(mut self, event_bus: EventBus) -> Self {
        self.event_bus = event_bus;
        self
    }

    /// Replace the default kind-based error classifier.
    pub fn with_classifier(mut self, classifier: Arc<dyn ErrorClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    /// Make a transform available to every run's artifact registry.
    pub fn with_transform(mut self, transform: Arc<dyn ArtifactTransform>) -> Self {
        self.transforms.push(transform);
        self
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    pub fn operations(&self) -> &OperationRegistry {
        &self.operations
    }

    pub fn config(&self) -> &GlobalConfig {
        &self.config
    }

    /// Build the graph, checking operations against the catalog.
    pub fn validate(&self, definition: &WorkflowDefinition) -> Result<Graph, GraphErrors> {
        GraphBuilder::new()
            .with_operations(self.operations.names())
            .build(definition)
    }

    /// Start a new run of `definition` and drive it to a final state.
    pub async fn run(
        &self,
        definition: &WorkflowDefinition,
        inputs: Map<String, Value>,
    ) -> Result<RunResult, ExecutorError> {
        let graph = self.validate(definition).map_err(ExecutorError::Validation)?;
        let inputs = resolve_inputs(definition, inputs)?;

        let workflow = CheckpointManager::<R>::workflow_ref(definition, &self.hasher)?;
        let mut run = RunState::new(
            Uuid::now_v7(),
            workflow,
            definition.steps.iter().map(|s| s.id.clone()),
            inputs,
        );
        run.status = RunStatus::Running;

        tracing::info!(
            run_id = %run.run_id,
            workflow = %definition.name,
            steps = graph.len(),
            critical_path = graph.critical_path_length(),
            "starting workflow run"
        );

        let seq = self.checkpoint.begin(&mut run, definition).await?;
        self.event_bus.publish(RunEvent::CheckpointSaved {
            run_id: run.run_id,
            seq,
        });
        self.event_bus.publish(RunEvent::RunStarted {
            run_id: run.run_id,
            workflow: definition.name.clone(),
            resumed: false,
        });

        let registry = self.new_registry();
        self.drive(graph, run, registry).await
    }

    /// Continue a stored run from its last checkpoint.
    ///
    /// A completed run is returned unchanged. Otherwise every step that did not
    /// reach a final outcome (succeeded, skipped by its condition, or a
    /// tolerated failure) is reset to pending and the run continues.
    pub async fn resume(&self, run_id: Uuid) -> Result<RunResult, ExecutorError> {
        if self.controls.contains_key(&run_id) {
            return Err(ExecutorError::AlreadyActive(run_id));
        }

        let (mut run, definition) = self.checkpoint.load_verified(run_id, &self.hasher).await?;
        if run.status == RunStatus::Completed {
            tracing::info!(run_id = %run_id, "run already completed, nothing to resume");
            return Ok(RunResult::from_state(run));
        }

        let graph = self.validate(&definition).map_err(ExecutorError::Validation)?;
        prepare_resume(&mut run);
        let registry = self.new_registry();
        restore_artifacts(&registry, &graph, &run);

        run.status = RunStatus::Running;
        let seq = self.checkpoint.checkpoint(&mut run).await?;
        self.event_bus.publish(RunEvent::CheckpointSaved { run_id, seq });
        self.event_bus.publish(RunEvent::RunStarted {
            run_id,
            workflow: definition.name.clone(),
            resumed: true,
        });
        tracing::info!(run_id = %run_id, seq, "resuming workflow run");

        self.drive(graph, run, registry).await
    }

    /// Current stored state of a run.
    pub async fn status(&self, run_id: Uuid) -> Result<RunState, ExecutorError> {
        Ok(self.checkpoint.load_state(run_id).await?)
    }

    /// Recent runs, most recently updated first.
    pub async fn list(&self, limit: Option<usize>) -> Result<Vec<RunSummary>, ExecutorError> {
        Ok(self.checkpoint.list(limit).await?)
    }

    /// Stop dispatch and signal in-flight workers. Returns false for unknown runs.
    pub fn cancel(&self, run_id: Uuid) -> bool {
        match self.controls.get(&run_id) {
            Some(control) => {
                tracing::info!(run_id = %run_id, "cancelling run");
                control.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Stop dispatch and let in-flight steps finish. Returns false for unknown runs.
    pub fn pause(&self, run_id: Uuid) -> bool {
        match self.controls.get(&run_id) {
            Some(control) => {
                tracing::info!(run_id = %run_id, "pausing run");
                control.pause.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel every executing run.
    pub fn cancel_all(&self) {
        for entry in self.controls.iter() {
            entry.value().cancel.cancel();
        }
    }

    /// Ids of runs currently executing in this process.
    pub fn active_runs(&self) -> Vec<Uuid> {
        self.controls.iter().map(|e| *e.key()).collect()
    }

    fn new_registry(&self) -> ArtifactRegistry {
        let registry = ArtifactRegistry::new();
        for transform in &self.transforms {
            registry.register_transform(Arc::clone(transform));
        }
        registry
    }

    async fn drive(
        &self,
        graph: Graph,
        run: RunState,
        registry: ArtifactRegistry,
    ) -> Result<RunResult, ExecutorError> {
        let run_id = run.run_id;
        let control = RunControl::default();
        self.controls.insert(run_id, control.clone());

        let settings = self.config.settings_for(&graph.definition().config);
        let (tx, rx) = mpsc::unbounded_channel();
        let driver = RunDriver {
            executor: self,
            retry: Arc::new(RetryManager::new(Arc::clone(&self.classifier), &settings.breaker)),
            inputs: Arc::new(run.inputs.clone()),
            graph: Arc::new(graph),
            settings,
            run,
            registry,
            control: control.clone(),
            queue: ReadyQueue::new(),
            workers: JoinSet::new(),
            tx,
            rx,
            aborting: false,
        };

        let result = driver.drive().await;
        if result.is_err() {
            // Workers must not outlive a loop that can no longer record them.
            control.cancel.cancel();
        }
        self.controls.remove(&run_id);
        result.map(RunResult::from_state)
    }
}

impl<R: RunRepository, H: ContentHasher> std::fmt::Debug for Executor<R, H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("operations", &self.operations.names())
            .field("active_runs", &self.controls.len())
            .finish()
    }
}

/// Apply declared defaults and reject missing required inputs.
fn resolve_inputs(
    definition: &WorkflowDefinition,
    mut provided: Map<String, Value>,
) -> Result<Map<String, Value>, ExecutorError> {
    let mut missing = Vec::new();
    for input in &definition.inputs {
        if provided.contains_key(&input.name) {
            continue;
        }
        match &input.default {
            Some(default) => {
                provided.insert(input.name.clone(), default.clone());
            }
            None if input.required => missing.push(input.name.clone()),
            None => {}
        }
    }
    if !missing.is_empty() {
        return Err(ExecutorError::MissingInputs(missing));
    }

    for name in provided.keys() {
        if !definition.inputs.iter().any(|i| &i.name == name) {
            tracing::warn!(input = %name, "input is not declared by the workflow");
        }
    }
    Ok(provided)
}

/// Reset every step without a final outcome so it runs again.
fn prepare_resume(run: &mut RunState) {
    for state in run.steps.values_mut() {
        let keep = match state.status {
            StepStatus::Succeeded => true,
            StepStatus::Skipped => state.skip_reason == Some(SkipReason::Condition),
            StepStatus::Failed => state.tolerated,
            _ => false,
        };
        if !keep {
            *state = StepState::pending();
        }
    }
    run.skipped
        .retain(|id| run.steps.get(id).is_some_and(|s| s.status == StepStatus::Skipped));
    run.error = None;
    run.outputs.clear();
    run.completed_at = None;
}

/// Re-register the artifacts of succeeded steps into a fresh registry.
fn restore_artifacts(registry: &ArtifactRegistry, graph: &Graph, run: &RunState) {
    let stored = graph
        .nodes()
        .iter()
        .filter_map(|node| run.step(&node.def.id))
        .filter(|state| state.status == StepStatus::Succeeded)
        .filter_map(|state| state.outputs.as_ref())
        .flat_map(|outputs| outputs.artifacts.iter());

    for artifact in stored {
        let deprecated = artifact.status == ArtifactStatus::Deprecated;
        let mut fresh = artifact.clone();
        fresh.status = ArtifactStatus::Active;
        match registry.register(fresh) {
            Ok(registered) if deprecated => {
                let _ = registry.deprecate(&registered.id);
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(artifact_id = %artifact.id, error = %e, "cannot restore artifact");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Control loop
// ---------------------------------------------------------------------------

type StepResult = Result<StepSuccess, StepFailure>;

#[derive(Debug)]
enum WorkerMessage {
    AttemptStarted {
        index: usize,
        attempt: u32,
    },
    Retrying {
        index: usize,
        attempt: u32,
        delay_ms: u64,
        error: OperationError,
    },
    Iteration {
        index: usize,
        iteration: u32,
    },
    CircuitOpened {
        operation: String,
    },
}

/// The single writer of one run's state while it executes.
struct RunDriver<'a, R: RunRepository, H: ContentHasher> {
    executor: &'a Executor<R, H>,
    graph: Arc<Graph>,
    settings: ExecutionSettings,
    run: RunState,
    registry: ArtifactRegistry,
    retry: Arc<RetryManager>,
    inputs: Arc<Map<String, Value>>,
    control: RunControl,
    queue: ReadyQueue,
    workers: JoinSet<(usize, StepResult)>,
    tx: mpsc::UnboundedSender<WorkerMessage>,
    rx: mpsc::UnboundedReceiver<WorkerMessage>,
    /// Set by a `stop` policy: no new dispatch, unstarted steps get aborted.
    aborting: bool,
}

impl<R: RunRepository, H: ContentHasher> RunDriver<'_, R, H> {
    async fn drive(mut self) -> Result<RunState, ExecutorError> {
        loop {
            self.advance().await?;
            if self.dispatch_ready().await? {
                // A step failed before it could start; readiness may have changed.
                continue;
            }
            if self.workers.is_empty() {
                break;
            }

            let halt_seen = self.control.halted();
            tokio::select! {
                biased;
                Some(message) = self.rx.recv() => self.on_message(message).await?,
                Some(joined) = self.workers.join_next() => self.on_complete(joined).await?,
                _ = self.control.wait_halt(), if !halt_seen => {
                    tracing::info!(run_id = %self.run.run_id, in_flight = self.workers.len(), "run halted, draining workers");
                }
            }
        }

        self.finish().await?;
        Ok(self.run)
    }

    fn run_id(&self) -> Uuid {
        self.run.run_id
    }

    fn publish(&self, event: RunEvent) {
        self.executor.event_bus.publish(event);
    }

    async fn checkpoint(&mut self) -> Result<(), ExecutorError> {
        let seq = self.executor.checkpoint.checkpoint(&mut self.run).await?;
        self.publish(RunEvent::CheckpointSaved {
            run_id: self.run_id(),
            seq,
        });
        Ok(())
    }

    fn stopped(&self) -> bool {
        self.aborting || self.control.halted()
    }

    fn state_mut(&mut self, index: usize) -> Option<&mut StepState> {
        let id = &self.graph.node(index).def.id;
        self.run.steps.get_mut(id)
    }

    fn status_of(&self, index: usize) -> Option<StepStatus> {
        self.run
            .step(&self.graph.node(index).def.id)
            .map(|s| s.status)
    }

    // -----------------------------------------------------------------------
    // Readiness
    // -----------------------------------------------------------------------

    /// Settle every pending step that can be decided now. Checkpoints once if
    /// anything changed.
    async fn advance(&mut self) -> Result<(), ExecutorError> {
        let graph = Arc::clone(&self.graph);
        let mut dirty = false;
        loop {
            let mut cascaded = false;
            for index in 0..graph.len() {
                if self.status_of(index) != Some(StepStatus::Pending) {
                    continue;
                }
                match readiness(&graph, index, &self.run.steps) {
                    Readiness::Blocked => {}
                    Readiness::Unsatisfiable { dependency } => {
                        tracing::debug!(
                            run_id = %self.run_id(),
                            step_id = %graph.node(index).def.id,
                            dependency = %dependency,
                            "dependency cannot be satisfied"
                        );
                        self.skip(index, SkipReason::UpstreamFailed);
                        cascaded = true;
                    }
                    Readiness::Satisfied => {
                        if self.stopped() {
                            continue;
                        }
                        match self.condition_holds(index) {
                            Ok(true) => {
                                if let Some(state) = self.state_mut(index) {
                                    state.status = StepStatus::Ready;
                                }
                                self.queue.push(index, graph.node(index).def.priority);
                                dirty = true;
                            }
                            Ok(false) => {
                                self.skip(index, SkipReason::Condition);
                                cascaded = true;
                            }
                            Err(error) => {
                                self.fail(index, error, 0, 0, None);
                                cascaded = true;
                            }
                        }
                    }
                }
            }
            if !cascaded {
                break;
            }
            dirty = true;
        }
        if dirty {
            self.checkpoint().await?;
        }
        Ok(())
    }

    fn condition_holds(&self, index: usize) -> Result<bool, StepError> {
        let Some(condition) = &self.graph.node(index).condition else {
            return Ok(true);
        };
        condition
            .eval_bool(&EvalContext::from_run(&self.run))
            .map_err(|e| {
                StepError::new(
                    ErrorKind::Eval,
                    format!("condition `{}`: {e}", condition.source()),
                )
            })
    }

    fn skip(&mut self, index: usize, reason: SkipReason) {
        let step_id = self.graph.node(index).def.id.clone();
        if let Some(state) = self.state_mut(index) {
            state.status = StepStatus::Skipped;
            state.skip_reason = Some(reason);
            state.ended_at = Some(Utc::now());
        }
        self.run.skipped.push(step_id.clone());
        tracing::info!(run_id = %self.run_id(), step_id = %step_id, reason = ?reason, "step skipped");
        self.publish(RunEvent::StepSkipped {
            run_id: self.run_id(),
            step_id,
            reason,
        });
    }

    // -----------------------------------------------------------------------
    // Dispatch
    // -----------------------------------------------------------------------

    /// Dispatch queued steps up to the concurrency limit. Returns true when a
    /// step failed during dispatch.
    async fn dispatch_ready(&mut self) -> Result<bool, ExecutorError> {
        let limit = self.settings.max_concurrent as usize;
        let mut failed = false;
        let mut dispatched = false;
        while self.workers.len() < limit && !self.stopped() {
            let Some(index) = self.queue.pop() else {
                break;
            };
            if self.dispatch(index).await {
                dispatched = true;
            } else {
                failed = true;
            }
        }
        if dispatched || failed {
            self.checkpoint().await?;
        }
        Ok(failed)
    }

    /// Start a worker for `index`. Returns false if the step failed before starting.
    async fn dispatch(&mut self, index: usize) -> bool {
        let graph = Arc::clone(&self.graph);
        let def = &graph.node(index).def;

        let consumed = match self.resolve_consumed(def).await {
            Ok(consumed) => consumed,
            Err(error) => {
                self.fail(index, error, 0, 0, None);
                return false;
            }
        };

        let Some(operation) = self.executor.operations.get(&def.operation) else {
            let error = StepError::new(
                ErrorKind::Operation,
                format!("unknown operation '{}'", def.operation),
            );
            self.fail(index, error, 0, 0, None);
            return false;
        };
        let fallback = def
            .fallback
            .as_ref()
            .and_then(|f| self.executor.operations.get(&f.operation));

        if let Some(state) = self.state_mut(index) {
            state.status = StepStatus::Running;
            state.started_at = Some(Utc::now());
            state.ended_at = None;
            state.attempts = 0;
            state.iterations = 0;
            state.error = None;
        }

        tracing::debug!(
            run_id = %self.run_id(),
            step_id = %def.id,
            operation = %def.operation,
            in_flight = self.workers.len() + 1,
            "dispatching step"
        );

        let worker = Worker {
            run_id: self.run_id(),
            index,
            graph: Arc::clone(&graph),
            operation,
            fallback,
            retry: Arc::clone(&self.retry),
            policy: def
                .retry
                .clone()
                .unwrap_or_else(|| self.settings.default_retry.clone()),
            timeout: Duration::from_millis(
                def.timeout_ms.unwrap_or(self.settings.default_timeout_ms),
            ),
            inputs: Arc::clone(&self.inputs),
            consumed,
            cancel: self.control.cancel.child_token(),
            events: self.tx.clone(),
            eval: EvalContext::from_run(&self.run),
            attempts: AtomicU32::new(0),
            last_nonzero: Mutex::new(None),
        };

        self.workers.spawn(async move {
            // Run the step on its own task so a panicking operation is
            // reported against this step instead of tearing down the loop.
            let result = match tokio::spawn(worker.run()).await {
                Ok(result) => result,
                Err(e) => Err(StepFailure::panicked(e)),
            };
            (index, result)
        });
        true
    }

    /// Resolve and check every artifact the step consumes.
    async fn resolve_consumed(&self, def: &StepDefinition) -> Result<Vec<Artifact>, StepError> {
        let mut consumed = Vec::with_capacity(def.consumes.len());
        for contract in &def.consumes {
            let artifact = self.registry.resolve_for(contract).await.map_err(|e| {
                let kind = match e {
                    super::artifact::ArtifactError::Incompatible(_) => ErrorKind::Incompatibility,
                    _ => ErrorKind::Artifact,
                };
                StepError::new(kind, e.to_string())
            })?;
            self.registry.record_consumer(&artifact.id, &def.id);
            consumed.push(artifact);
        }
        Ok(consumed)
    }

    // -----------------------------------------------------------------------
    // Worker feedback
    // -----------------------------------------------------------------------

    async fn on_message(&mut self, message: WorkerMessage) -> Result<(), ExecutorError> {
        let run_id = self.run_id();
        match message {
            WorkerMessage::AttemptStarted { index, attempt } => {
                let step_id = self.graph.node(index).def.id.clone();
                let Some(state) = self.state_mut(index) else {
                    return Ok(());
                };
                if state.status.is_terminal() {
                    return Ok(());
                }
                let was_retrying = state.status == StepStatus::Retrying;
                state.status = StepStatus::Running;
                state.attempts += 1;
                tracing::debug!(run_id = %run_id, step_id = %step_id, attempt, "attempt started");
                self.publish(RunEvent::StepStarted {
                    run_id,
                    step_id,
                    attempt,
                });
                if was_retrying {
                    self.checkpoint().await?;
                }
            }
            WorkerMessage::Retrying {
                index,
                attempt,
                delay_ms,
                error,
            } => {
                let step_id = self.graph.node(index).def.id.clone();
                let Some(state) = self.state_mut(index) else {
                    return Ok(());
                };
                if state.status.is_terminal() {
                    return Ok(());
                }
                state.status = StepStatus::Retrying;
                state.error = Some(operation_failure(&error));
                self.publish(RunEvent::StepRetrying {
                    run_id,
                    step_id,
                    attempt,
                    delay_ms,
                    error: error.to_string(),
                });
                self.checkpoint().await?;
            }
            WorkerMessage::Iteration { index, iteration } => {
                let step_id = self.graph.node(index).def.id.clone();
                if let Some(state) = self.state_mut(index) {
                    state.iterations = iteration.saturating_sub(1);
                }
                self.publish(RunEvent::StepIteration {
                    run_id,
                    step_id,
                    iteration,
                });
            }
            WorkerMessage::CircuitOpened { operation } => {
                tracing::warn!(run_id = %run_id, operation = %operation, "circuit breaker opened");
                self.publish(RunEvent::CircuitOpened { run_id, operation });
            }
        }
        Ok(())
    }

    async fn on_complete(
        &mut self,
        joined: Result<(usize, StepResult), JoinError>,
    ) -> Result<(), ExecutorError> {
        let (index, result) = joined.map_err(|e| ExecutorError::Worker(e.to_string()))?;
        match result {
            Ok(success) => self.succeed(index, success),
            Err(failure)
                if failure.error.kind == ErrorKind::Cancelled && self.control.cancel.is_cancelled() =>
            {
                // Interrupted by a run-level cancel: not a step outcome.
                let step_id = self.graph.node(index).def.id.clone();
                if let Some(state) = self.state_mut(index) {
                    state.status = StepStatus::Pending;
                    state.started_at = None;
                }
                tracing::info!(run_id = %self.run_id(), step_id = %step_id, "step interrupted by cancel");
            }
            Err(failure) => {
                self.fail(
                    index,
                    failure.error,
                    failure.attempts,
                    failure.iterations,
                    failure.last.map(|o| (o, failure.duration_ms)),
                );
            }
        }
        self.checkpoint().await
    }

    fn succeed(&mut self, index: usize, success: StepSuccess) {
        let graph = Arc::clone(&self.graph);
        let def = &graph.node(index).def;
        let StepSuccess {
            mut outcome,
            attempts,
            iterations,
            duration_ms,
            used_fallback,
        } = success;

        let produced = std::mem::take(&mut outcome.produced_artifacts);
        let artifacts = match self.registry.register_outputs(&def.id, &def.outputs, produced) {
            Ok(artifacts) => artifacts,
            Err(e) => {
                let error = StepError::new(ErrorKind::Artifact, e.to_string());
                self.fail(index, error, attempts, iterations, Some((outcome, duration_ms)));
                return;
            }
        };

        let mut metrics = outcome.metrics;
        metrics.insert(DURATION_METRIC.to_string(), duration_ms as f64);

        if let Some(state) = self.state_mut(index) {
            state.status = StepStatus::Succeeded;
            state.attempts = attempts;
            state.iterations = iterations;
            state.ended_at = Some(Utc::now());
            state.error = None;
            state.used_fallback = used_fallback;
            state.outputs = Some(StepOutputs {
                exit_status: outcome.exit_status,
                metrics,
                artifacts,
            });
        }

        tracing::info!(
            run_id = %self.run_id(),
            step_id = %def.id,
            attempts,
            iterations,
            duration_ms,
            used_fallback,
            "step succeeded"
        );
        self.publish(RunEvent::StepSucceeded {
            run_id: self.run_id(),
            step_id: def.id.clone(),
            attempts,
            duration_ms,
        });
    }

    /// Record a terminal failure and apply the error policy.
    fn fail(
        &mut self,
        index: usize,
        error: StepError,
        attempts: u32,
        iterations: u32,
        last: Option<(OperationOutcome, u64)>,
    ) {
        let graph = Arc::clone(&self.graph);
        let def = &graph.node(index).def;
        let policy = def.on_error.unwrap_or(if graph.is_parallel(index) {
            self.settings.on_error_in_parallel
        } else {
            self.settings.on_error_in_sequential
        });
        let tolerated = policy == ErrorPolicy::Continue && !def.critical;

        if let Some(state) = self.state_mut(index) {
            state.status = StepStatus::Failed;
            state.attempts = state.attempts.max(attempts);
            state.iterations = iterations;
            state.ended_at = Some(Utc::now());
            state.error = Some(error.clone());
            state.tolerated = tolerated;
            state.outputs = last.map(|(outcome, duration_ms)| {
                let mut metrics = outcome.metrics;
                metrics.insert(DURATION_METRIC.to_string(), duration_ms as f64);
                StepOutputs {
                    exit_status: outcome.exit_status,
                    metrics,
                    artifacts: Vec::new(),
                }
            });
        }

        tracing::warn!(
            run_id = %self.run_id(),
            step_id = %def.id,
            kind = %error.kind,
            error = %error.message,
            policy = ?policy,
            "step failed"
        );
        self.publish(RunEvent::StepFailed {
            run_id: self.run_id(),
            step_id: def.id.clone(),
            kind: error.kind,
            message: error.message.clone(),
        });

        match policy {
            ErrorPolicy::Continue if tolerated => {
                tracing::info!(step_id = %def.id, "non-critical failure tolerated");
            }
            ErrorPolicy::Continue => {
                tracing::warn!(
                    step_id = %def.id,
                    "continue policy does not apply to critical steps; dependents will be skipped"
                );
            }
            ErrorPolicy::Skip => {}
            ErrorPolicy::Stop => {
                if !self.aborting {
                    tracing::warn!(run_id = %self.run_id(), step_id = %def.id, "stopping run");
                }
                self.aborting = true;
            }
        }

        let fatal = !tolerated && (def.critical || policy == ErrorPolicy::Stop);
        if fatal && self.run.error.is_none() {
            self.run.error = Some(RunError {
                step_id: Some(def.id.clone()),
                kind: error.kind,
                message: error.message,
            });
        }
    }

    // -----------------------------------------------------------------------
    // Completion
    // -----------------------------------------------------------------------

    async fn finish(&mut self) -> Result<(), ExecutorError> {
        let cancelled = self.control.cancel.is_cancelled();
        let paused = !cancelled && self.control.pause.is_cancelled();

        // Queued but never started.
        for state in self.run.steps.values_mut() {
            if state.status == StepStatus::Ready {
                state.status = StepStatus::Pending;
            }
        }
        self.queue.clear();

        if cancelled {
            self.run.status = RunStatus::Cancelled;
            if self.run.error.is_none() {
                self.run.error = Some(RunError {
                    step_id: None,
                    kind: ErrorKind::Cancelled,
                    message: "run cancelled".to_string(),
                });
            }
        } else if paused {
            self.run.status = RunStatus::Paused;
        } else {
            let unstarted: Vec<usize> = (0..self.graph.len())
                .filter(|&i| self.status_of(i) == Some(StepStatus::Pending))
                .collect();
            for index in unstarted {
                self.skip(index, SkipReason::Aborted);
            }

            let graph = Arc::clone(&self.graph);
            let required_failed = graph.nodes().iter().any(|node| {
                node.def.critical
                    && self
                        .run
                        .step(&node.def.id)
                        .is_some_and(|s| s.status == StepStatus::Failed && !s.tolerated)
            });

            if self.aborting || required_failed {
                self.run.status = RunStatus::Failed;
            } else {
                self.run.status = RunStatus::Completed;
                self.run.outputs = self.evaluate_outputs();
            }
            self.run.completed_at = Some(Utc::now());
        }

        self.checkpoint().await?;
        tracing::info!(
            run_id = %self.run_id(),
            status = %self.run.status,
            skipped = self.run.skipped.len(),
            "run finished"
        );
        self.publish(RunEvent::RunFinished {
            run_id: self.run_id(),
            status: self.run.status,
        });
        Ok(())
    }

    fn evaluate_outputs(&self) -> Map<String, Value> {
        let ctx = EvalContext::from_run(&self.run);
        let mut outputs = Map::new();
        for (name, expr) in self.graph.outputs() {
            let value = match expr.eval(&ctx) {
                Ok(value) => to_json(value),
                Err(e) => {
                    tracing::warn!(output = %name, error = %e, "output could not be evaluated");
                    Value::Null
                }
            };
            outputs.insert(name.clone(), value);
        }
        outputs
    }
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct StepSuccess {
    outcome: OperationOutcome,
    attempts: u32,
    iterations: u32,
    duration_ms: u64,
    used_fallback: bool,
}

#[derive(Debug)]
struct StepFailure {
    error: StepError,
    attempts: u32,
    iterations: u32,
    last: Option<OperationOutcome>,
    duration_ms: u64,
}

impl StepFailure {
    fn panicked(error: JoinError) -> Self {
        Self {
            error: StepError::new(ErrorKind::Operation, format!("step worker panicked: {error}")),
            attempts: 0,
            iterations: 0,
            last: None,
            duration_ms: 0,
        }
    }
}

#[derive(Debug)]
struct Invocation {
    outcome: OperationOutcome,
    used_fallback: bool,
}

/// Executes one dispatched step.
struct Worker {
    run_id: Uuid,
    index: usize,
    graph: Arc<Graph>,
    operation: Arc<BoxOperation>,
    fallback: Option<Arc<BoxOperation>>,
    retry: Arc<RetryManager>,
    policy: RetryPolicy,
    /// Per-attempt limit, enforced here rather than trusted to the operation.
    /// Each retry gets a fresh window.
    timeout: Duration,
    inputs: Arc<Map<String, Value>>,
    consumed: Vec<Artifact>,
    cancel: CancellationToken,
    events: mpsc::UnboundedSender<WorkerMessage>,
    /// Run facts at dispatch time, for loop expressions.
    eval: EvalContext,
    attempts: AtomicU32,
    /// Outcome of the latest attempt, if that attempt reported a nonzero
    /// exit status. Cleared when the next attempt starts.
    last_nonzero: Mutex<Option<OperationOutcome>>,
}

impl Worker {
    fn def(&self) -> &StepDefinition {
        &self.graph.node(self.index).def
    }

    async fn run(self) -> StepResult {
        let started = Instant::now();
        let node = self.graph.node(self.index);

        let result = match (&node.def.loop_policy, &node.loop_expr) {
            (Some(policy), Some(expr)) => self.run_loop(policy, expr).await,
            _ => self
                .invoke(None)
                .await
                .map(|invocation| (invocation, 0))
                .map_err(|error| (error, 0, None)),
        };

        let duration_ms = started.elapsed().as_millis() as u64;
        let attempts = self.attempts.load(Ordering::Relaxed);
        match result {
            Ok((invocation, iterations)) => Ok(StepSuccess {
                outcome: invocation.outcome,
                attempts,
                iterations,
                duration_ms,
                used_fallback: invocation.used_fallback,
            }),
            Err((error, iterations, last)) => {
                let last = last.or_else(|| self.last_nonzero.lock().ok().and_then(|mut l| l.take()));
                Err(StepFailure {
                    error,
                    attempts,
                    iterations,
                    last,
                    duration_ms,
                })
            }
        }
    }

    async fn run_loop(
        &self,
        policy: &LoopPolicy,
        expr: &Expression,
    ) -> Result<(Invocation, u32), (StepError, u32, Option<OperationOutcome>)> {
        let controller = LoopController::new(&self.def().id, policy, expr);
        let fallback_flag = AtomicBool::new(false);
        let used_fallback = &fallback_flag;

        let result = controller
            .run(self.eval.clone(), move |iteration| {
                let _ = self.events.send(WorkerMessage::Iteration {
                    index: self.index,
                    iteration,
                });
                async move {
                    match self.invoke(Some(iteration)).await {
                        Ok(invocation) => {
                            if invocation.used_fallback {
                                used_fallback.store(true, Ordering::Relaxed);
                            }
                            Ok(invocation.outcome)
                        }
                        Err(error) => Err(error),
                    }
                }
            })
            .await;

        match result {
            Ok(outcome) => Ok((
                Invocation {
                    outcome: outcome.last,
                    used_fallback: fallback_flag.load(Ordering::Relaxed),
                },
                outcome.iterations,
            )),
            Err(failure) => Err((loop_failure(failure.error), failure.iterations, failure.last)),
        }
    }

    /// One retried invocation of the step's operation, with fallback.
    async fn invoke(&self, iteration: Option<u32>) -> Result<Invocation, StepError> {
        let def = self.def();
        let primary = self
            .retry
            .execute(
                self.operation.name(),
                &self.policy,
                &self.cancel,
                |attempt| self.attempt(&self.operation, &def.args, attempt, iteration),
                |event| self.report(event),
            )
            .await;

        match primary {
            Ok(outcome) => Ok(Invocation {
                outcome: outcome.value,
                used_fallback: false,
            }),
            Err(RetryFailure {
                error: RetryError::CircuitOpen(open),
                ..
            }) => {
                let (Some(fallback), Some(fallback_ref)) = (&self.fallback, &def.fallback) else {
                    return Err(StepError::new(ErrorKind::CircuitOpen, open.to_string()));
                };
                tracing::warn!(
                    step_id = %def.id,
                    operation = %open.operation,
                    fallback = %fallback_ref.operation,
                    "circuit open, invoking fallback operation"
                );
                self.report(RetryEvent::AttemptStarted { attempt: 1 });
                self.attempt(fallback, &fallback_ref.args, 1, iteration)
                    .await
                    .map(|outcome| Invocation {
                        outcome,
                        used_fallback: true,
                    })
                    .map_err(|e| operation_failure(&e))
            }
            Err(failure) => Err(retry_failure(failure.error)),
        }
    }

    /// A single attempt under the step timeout and the run's cancel signal.
    async fn attempt(
        &self,
        operation: &BoxOperation,
        args: &Value,
        attempt: u32,
        iteration: Option<u32>,
    ) -> Result<OperationOutcome, OperationError> {
        if let Ok(mut slot) = self.last_nonzero.lock() {
            *slot = None;
        }
        let ctx = OperationContext {
            run_id: self.run_id,
            step_id: self.def().id.clone(),
            attempt,
            iteration,
            inputs: Arc::clone(&self.inputs),
            consumed: self.consumed.clone(),
            cancel: self.cancel.child_token(),
        };

        let outcome = tokio::select! {
            _ = self.cancel.cancelled() => return Err(OperationError::cancelled()),
            result = tokio::time::timeout(self.timeout, operation.execute(args, &ctx)) => match result {
                Ok(result) => result?,
                Err(_) => return Err(OperationError::timeout(self.timeout.as_millis() as u64)),
            },
        };

        if outcome.exit_status != 0 {
            let status = outcome.exit_status;
            if let Ok(mut slot) = self.last_nonzero.lock() {
                *slot = Some(outcome);
            }
            return Err(OperationError::nonzero_exit(status));
        }
        Ok(outcome)
    }

    fn report(&self, event: RetryEvent<'_>) {
        let index = self.index;
        let message = match event {
            RetryEvent::AttemptStarted { attempt } => {
                self.attempts.fetch_add(1, Ordering::Relaxed);
                WorkerMessage::AttemptStarted { index, attempt }
            }
            RetryEvent::Retrying {
                attempt,
                delay,
                error,
            } => WorkerMessage::Retrying {
                index,
                attempt,
                delay_ms: delay.as_millis() as u64,
                error: error.clone(),
            },
            RetryEvent::CircuitOpened { operation } => WorkerMessage::CircuitOpened {
                operation: operation.to_string(),
            },
        };
        let _ = self.events.send(message);
    }
}

fn operation_failure(error: &OperationError) -> StepError {
    let kind = match error.kind.as_str() {
        KIND_TIMEOUT => ErrorKind::Timeout,
        KIND_CANCELLED => ErrorKind::Cancelled,
        _ => ErrorKind::Operation,
    };
    StepError {
        kind,
        operation_kind: Some(error.kind.clone()),
        message: error.message.clone(),
    }
}

fn retry_failure(error: RetryError) -> StepError {
    match error {
        RetryError::Fatal(e) | RetryError::Exhausted(e) => operation_failure(&e),
        RetryError::CircuitOpen(e) => StepError::new(ErrorKind::CircuitOpen, e.to_string()),
        RetryError::Cancelled => StepError::new(ErrorKind::Cancelled, "cancelled"),
    }
}

fn loop_failure(error: LoopError<StepError>) -> StepError {
    let message = error.to_string();
    match error {
        LoopError::BudgetExceeded { .. } => StepError::new(ErrorKind::LoopBudgetExceeded, message),
        LoopError::Timeout { .. } => StepError::new(ErrorKind::LoopTimeout, message),
        LoopError::Stalled { .. } => StepError::new(ErrorKind::LoopStalled, message),
        LoopError::Eval(_) => StepError::new(ErrorKind::Eval, message),
        LoopError::Body(error) => error,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::definition::parse_workflow_yaml;
    use crate::workflow::testing::{ChecksumHasher, MemoryRunRepository, ScriptedOperation, Trace};
    use serde_json::json;

    struct Harness {
        executor: Arc<Executor<MemoryRunRepository, ChecksumHasher>>,
        repo: MemoryRunRepository,
        trace: Arc<Trace>,
    }

    fn harness() -> Harness {
        let trace = Arc::new(Trace::default());
        let repo = MemoryRunRepository::new();
        let operations = OperationRegistry::new()
            .with(ScriptedOperation::new("work", Arc::clone(&trace)))
            .with(ScriptedOperation::new("flaky", Arc::clone(&trace)));
        let executor = Executor::new(repo.clone(), ChecksumHasher, operations, GlobalConfig::default());
        Harness {
            executor: Arc::new(executor),
            repo,
            trace,
        }
    }

    fn def(yaml: &str) -> WorkflowDefinition {
        parse_workflow_yaml(yaml).unwrap()
    }

    fn step<'a>(result: &'a RunResult, id: &str) -> &'a StepState {
        result.state.step(id).unwrap()
    }

    const DIAMOND: &str = r#"
name: diamond
version: "1"
config: { max_concurrent: 2 }
steps:
  - { id: a, operation: work, args: { delay_ms: 10 } }
  - { id: b, operation: work, depends_on: [a], args: { delay_ms: 30 } }
  - { id: c, operation: work, depends_on: [a], args: { delay_ms: 20 } }
  - { id: d, operation: work, depends_on: [b, c], args: { delay_ms: 10 } }
"#;

    #[tokio::test(start_paused = true)]
    async fn test_diamond_runs_a_first_and_d_last() {
        let h = harness();
        let result = h.executor.run(&def(DIAMOND), Map::new()).await.unwrap();

        assert_eq!(result.status, RunStatus::Completed);
        let starts = h.trace.starts();
        assert_eq!(starts.first().map(String::as_str), Some("a"));
        assert_eq!(starts.last().map(String::as_str), Some("d"));

        let a_done = h.trace.position("a", false).unwrap();
        for id in ["b", "c"] {
            assert!(h.trace.position(id, true).unwrap() > a_done);
            assert!(h.trace.position(id, false).unwrap() < h.trace.position("d", true).unwrap());
        }
        // b and c overlap.
        assert_eq!(h.trace.max_running(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_bound_is_never_exceeded() {
        let h = harness();
        let steps: String = (0..8)
            .map(|i| format!("  - {{ id: s{i}, operation: work, args: {{ delay_ms: {} }} }}\n", 10 + i * 5))
            .collect();
        let yaml = format!("name: wide\nversion: \"1\"\nconfig: {{ max_concurrent: 3 }}\nsteps:\n{steps}");
        let result = h.executor.run(&def(&yaml), Map::new()).await.unwrap();

        assert_eq!(result.status, RunStatus::Completed);
        assert_eq!(h.trace.max_running(), 3);
        assert_eq!(h.trace.starts().len(), 8);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_step_starts_before_its_dependencies_finish() {
        let h = harness();
        let yaml = r#"
name: layered
version: "1"
config: { max_concurrent: 4 }
steps:
  - { id: fetch, operation: work, args: { delay_ms: 15 } }
  - { id: lint, operation: work, args: { delay_ms: 5 } }
  - { id: build, operation: work, depends_on: [fetch], args: { delay_ms: 20 } }
  - { id: unit, operation: work, depends_on: [build, lint], args: { delay_ms: 10 } }
  - { id: docs, operation: work, depends_on: [fetch], args: { delay_ms: 1 } }
  - { id: ship, operation: work, depends_on: [unit, docs] }
"#;
        let definition = def(yaml);
        h.executor.run(&definition, Map::new()).await.unwrap();

        for s in &definition.steps {
            let started = h.trace.position(&s.id, true).unwrap();
            for dep in &s.depends_on {
                assert!(
                    h.trace.position(dep, false).unwrap() < started,
                    "{} started before {dep} finished",
                    s.id
                );
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_priority_orders_dispatch() {
        let h = harness();
        let yaml = r#"
name: prio
version: "1"
config: { max_concurrent: 1 }
steps:
  - { id: low, operation: work }
  - { id: high, operation: work, priority: 10 }
  - { id: mid, operation: work, priority: 5 }
  - { id: also_mid, operation: work, priority: 5 }
"#;
        h.executor.run(&def(yaml), Map::new()).await.unwrap();
        assert_eq!(h.trace.starts(), vec!["high", "mid", "also_mid", "low"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_records_three_attempts_with_backoff() {
        let h = harness();
        let mut events = h.executor.event_bus().subscribe();
        let yaml = r#"
name: retry
version: "1"
steps:
  - id: flaky
    operation: flaky
    args: { fail_kind: transient }
    retry: { max_attempts: 3, initial_delay_ms: 100, multiplier: 2 }
"#;
        let result = h.executor.run(&def(yaml), Map::new()).await.unwrap();

        assert_eq!(result.status, RunStatus::Failed);
        let state = step(&result, "flaky");
        assert_eq!(state.status, StepStatus::Failed);
        assert_eq!(state.attempts, 3);
        let error = state.error.as_ref().unwrap();
        assert_eq!(error.kind, ErrorKind::Operation);
        assert_eq!(error.operation_kind.as_deref(), Some("transient"));
        assert_eq!(h.trace.calls("flaky"), 3);

        let mut delays = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let RunEvent::StepRetrying { delay_ms, .. } = event {
                delays.push(delay_ms);
            }
        }
        assert_eq!(delays, vec![100, 200]);
        assert_eq!(result.error.unwrap().step_id.as_deref(), Some("flaky"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_policy_lets_in_flight_finish_and_aborts_the_rest() {
        let h = harness();
        let yaml = r#"
name: stop
version: "1"
config: { on_error_in_parallel: stop }
steps:
  - { id: bad, operation: work, args: { fail_kind: fatal } }
  - { id: slow, operation: work, args: { delay_ms: 100 } }
  - { id: after_bad, operation: work, depends_on: [bad] }
  - { id: after_slow, operation: work, depends_on: [slow] }
"#;
        let result = h.executor.run(&def(yaml), Map::new()).await.unwrap();

        assert_eq!(result.status, RunStatus::Failed);
        assert_eq!(step(&result, "slow").status, StepStatus::Succeeded);
        assert_eq!(
            step(&result, "after_slow").skip_reason,
            Some(SkipReason::Aborted)
        );
        assert_eq!(
            step(&result, "after_bad").skip_reason,
            Some(SkipReason::UpstreamFailed)
        );
        assert_eq!(h.trace.calls("after_slow"), 0);
        assert!(result.skipped.contains(&"after_slow".to_string()));
        assert_eq!(result.error.unwrap().step_id.as_deref(), Some("bad"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_skip_policy_skips_only_the_failed_subtree() {
        let h = harness();
        let yaml = r#"
name: skip
version: "1"
config: { on_error_in_parallel: skip }
steps:
  - { id: bad, operation: work, critical: false, args: { fail_kind: fatal } }
  - { id: good, operation: work }
  - { id: child, operation: work, depends_on: [bad] }
  - { id: grandchild, operation: work, depends_on: [child] }
  - { id: other, operation: work, depends_on: [good] }
"#;
        let result = h.executor.run(&def(yaml), Map::new()).await.unwrap();

        assert_eq!(result.status, RunStatus::Completed);
        assert_eq!(step(&result, "other").status, StepStatus::Succeeded);
        assert_eq!(result.skipped, vec!["child", "grandchild"]);
        assert!(result.error.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_critical_failure_fails_run_under_skip() {
        let h = harness();
        let yaml = r#"
name: skip
version: "1"
steps:
  - { id: bad, operation: work, on_error: skip, args: { fail_kind: fatal } }
  - { id: child, operation: work, depends_on: [bad] }
"#;
        let result = h.executor.run(&def(yaml), Map::new()).await.unwrap();
        assert_eq!(result.status, RunStatus::Failed);
        assert_eq!(step(&result, "child").status, StepStatus::Skipped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_continue_policy_tolerates_non_critical_failure() {
        let h = harness();
        let yaml = r#"
name: continue
version: "1"
steps:
  - { id: lint, operation: work, critical: false, on_error: continue, args: { fail_kind: fatal } }
  - { id: build, operation: work, depends_on: [lint] }
"#;
        let result = h.executor.run(&def(yaml), Map::new()).await.unwrap();

        assert_eq!(result.status, RunStatus::Completed);
        let lint = step(&result, "lint");
        assert_eq!(lint.status, StepStatus::Failed);
        assert!(lint.tolerated);
        assert_eq!(step(&result, "build").status, StepStatus::Succeeded);
    }

    #[tokio::test(start_paused = true)]
    async fn test_condition_skip_still_satisfies_dependents() {
        let h = harness();
        let yaml = r#"
name: cond
version: "1"
inputs:
  - { name: env, default: dev }
steps:
  - { id: deploy, operation: work, condition: "inputs.env == 'prod'" }
  - { id: notify, operation: work, depends_on: [deploy], condition: "steps.deploy.skipped" }
"#;
        let result = h.executor.run(&def(yaml), Map::new()).await.unwrap();

        assert_eq!(result.status, RunStatus::Completed);
        assert_eq!(step(&result, "deploy").skip_reason, Some(SkipReason::Condition));
        assert_eq!(step(&result, "notify").status, StepStatus::Succeeded);
        assert_eq!(h.trace.calls("deploy"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_condition_eval_error_fails_step_closed() {
        let h = harness();
        let yaml = r#"
name: cond
version: "1"
steps:
  - { id: test, operation: work }
  - { id: gate, operation: work, depends_on: [test], condition: "steps.test.metrics.coverage > 80" }
"#;
        let result = h.executor.run(&def(yaml), Map::new()).await.unwrap();

        let gate = step(&result, "gate");
        assert_eq!(gate.status, StepStatus::Failed);
        assert_eq!(gate.error.as_ref().unwrap().kind, ErrorKind::Eval);
        assert_eq!(h.trace.calls("gate"), 0);
        assert_eq!(result.status, RunStatus::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_artifact_version_ranges() {
        let h = harness();
        let yaml = r#"
name: artifacts
version: "1"
config: { on_error_in_parallel: skip }
steps:
  - id: produce
    operation: work
    outputs: [report]
    args:
      artifacts: [{ name: report, type: coverage, version: "1.0.0", value: { percent: 91 } }]
  - id: v1
    operation: work
    depends_on: ["artifact:report"]
    consumes: [{ artifact: report, type: coverage, version: "^1.0.0", required_fields: [percent] }]
  - id: v2
    operation: work
    critical: false
    depends_on: ["artifact:report"]
    consumes: [{ artifact: report, type: coverage, version: "^2.0.0" }]
"#;
        let result = h.executor.run(&def(yaml), Map::new()).await.unwrap();

        assert_eq!(step(&result, "v1").status, StepStatus::Succeeded);
        let v2 = step(&result, "v2");
        assert_eq!(v2.status, StepStatus::Failed);
        assert_eq!(v2.error.as_ref().unwrap().kind, ErrorKind::Incompatibility);
        assert_eq!(h.trace.calls("v2"), 0);

        let produced = &step(&result, "produce").outputs.as_ref().unwrap().artifacts;
        assert_eq!(produced[0].id, "report@1.0.0");
    }

    #[tokio::test(start_paused = true)]
    async fn test_outputs_and_duration_metric() {
        let h = harness();
        let yaml = r#"
name: outputs
version: "1"
outputs:
  - { name: coverage, expr: "steps.test.metrics.coverage" }
  - { name: passed, expr: "steps.test.succeeded" }
steps:
  - { id: test, operation: work, args: { delay_ms: 40, metrics: { coverage: 87.5 } } }
"#;
        let result = h.executor.run(&def(yaml), Map::new()).await.unwrap();

        assert_eq!(result.outputs["coverage"], json!(87.5));
        assert_eq!(result.outputs["passed"], json!(true));
        let metrics = &step(&result, "test").outputs.as_ref().unwrap().metrics;
        assert!(metrics[DURATION_METRIC] >= 40.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resume_of_completed_run_is_idempotent() {
        let h = harness();
        let first = h.executor.run(&def(DIAMOND), Map::new()).await.unwrap();
        let saves = h.repo.save_count();
        let calls = h.trace.starts().len();

        let again = h.executor.resume(first.run_id).await.unwrap();
        assert_eq!(again.status, RunStatus::Completed);
        assert_eq!(again.outputs, first.outputs);
        assert_eq!(again.state, first.state);
        assert_eq!(h.repo.save_count(), saves);
        assert_eq!(h.trace.starts().len(), calls);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_then_resume_completes() {
        let h = harness();
        let yaml = r#"
name: long
version: "1"
steps:
  - { id: quick, operation: work }
  - { id: slow, operation: work, depends_on: [quick], args: { delay_ms: 10000 } }
  - { id: last, operation: work, depends_on: [slow] }
"#;
        let executor = Arc::clone(&h.executor);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            executor.cancel_all();
        });

        let result = h.executor.run(&def(yaml), Map::new()).await.unwrap();
        assert_eq!(result.status, RunStatus::Cancelled);
        assert_eq!(step(&result, "quick").status, StepStatus::Succeeded);
        assert_eq!(step(&result, "slow").status, StepStatus::Pending);
        assert_eq!(result.error.as_ref().unwrap().kind, ErrorKind::Cancelled);
        assert!(h.executor.active_runs().is_empty());

        let resumed = h.executor.resume(result.run_id).await.unwrap();
        assert_eq!(resumed.status, RunStatus::Completed);
        assert_eq!(h.trace.calls("quick"), 1);
        assert_eq!(h.trace.calls("slow"), 2);
        assert!(resumed.error.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_lets_in_flight_finish() {
        let h = harness();
        let yaml = r#"
name: pause
version: "1"
steps:
  - { id: a, operation: work, args: { delay_ms: 100 } }
  - { id: b, operation: work, depends_on: [a] }
"#;
        let executor = Arc::clone(&h.executor);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            for run_id in executor.active_runs() {
                assert!(executor.pause(run_id));
            }
        });

        let result = h.executor.run(&def(yaml), Map::new()).await.unwrap();
        assert_eq!(result.status, RunStatus::Paused);
        assert_eq!(step(&result, "a").status, StepStatus::Succeeded);
        assert_eq!(step(&result, "b").status, StepStatus::Pending);

        let resumed = h.executor.resume(result.run_id).await.unwrap();
        assert_eq!(resumed.status, RunStatus::Completed);
        assert_eq!(h.trace.calls("a"), 1);
        assert_eq!(h.trace.calls("b"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resume_reruns_failed_steps() {
        let h = harness();
        let yaml = r#"
name: rerun
version: "1"
steps:
  - { id: ok, operation: work }
  - { id: flaky, operation: flaky, depends_on: [ok], args: { fail_kind: fatal, fail_times: 1 } }
"#;
        let first = h.executor.run(&def(yaml), Map::new()).await.unwrap();
        assert_eq!(first.status, RunStatus::Failed);

        let resumed = h.executor.resume(first.run_id).await.unwrap();
        assert_eq!(resumed.status, RunStatus::Completed);
        assert_eq!(h.trace.calls("ok"), 1);
        assert_eq!(h.trace.calls("flaky"), 2);
        assert!(resumed.state.checkpoint_seq > first.state.checkpoint_seq);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resume_detects_corruption() {
        let h = harness();
        let first = h.executor.run(&def(DIAMOND), Map::new()).await.unwrap();
        let mut tampered = first.state.clone();
        tampered.status = RunStatus::Failed;
        tampered.workflow.digest = "0".repeat(16);
        h.repo.tamper(tampered);

        let err = h.executor.resume(first.run_id).await.unwrap_err();
        assert!(err.is_state());
        assert!(h.executor.resume(Uuid::now_v7()).await.unwrap_err().is_state());
    }

    #[tokio::test]
    async fn test_validation_and_input_errors_start_nothing() {
        let h = harness();
        let unknown = r#"
name: bad
version: "1"
steps:
  - { id: a, operation: teleport }
"#;
        let err = h.executor.run(&def(unknown), Map::new()).await.unwrap_err();
        assert!(err.is_validation());

        let needs_input = r#"
name: inputs
version: "1"
inputs:
  - { name: branch, required: true }
steps:
  - { id: a, operation: work }
"#;
        let err = h.executor.run(&def(needs_input), Map::new()).await.unwrap_err();
        assert!(matches!(err, ExecutorError::MissingInputs(ref m) if m == &vec!["branch".to_string()]));
        assert_eq!(h.repo.save_count(), 0);
        assert!(h.trace.starts().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_step_until_condition() {
        let h = harness();
        let yaml = r#"
name: loop
version: "1"
steps:
  - id: improve
    operation: work
    args: { metrics: { score: 0.0 }, metric_step: 0.35 }
    loop:
      until: "steps.improve.metrics.score >= 0.9"
      max_iterations: 10
"#;
        let result = h.executor.run(&def(yaml), Map::new()).await.unwrap();
        assert_eq!(result.status, RunStatus::Completed);
        let state = step(&result, "improve");
        assert_eq!(state.iterations, 3);
        assert_eq!(state.attempts, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_budget_exceeded_is_recorded() {
        let h = harness();
        let yaml = r#"
name: loop
version: "1"
steps:
  - id: improve
    operation: work
    args: { metrics: { score: 0.0 } }
    loop:
      until: "steps.improve.metrics.score > 1"
      max_iterations: 5
"#;
        let result = h.executor.run(&def(yaml), Map::new()).await.unwrap();
        let state = step(&result, "improve");
        assert_eq!(state.status, StepStatus::Failed);
        assert_eq!(state.error.as_ref().unwrap().kind, ErrorKind::LoopBudgetExceeded);
        assert_eq!(state.iterations, 5);
        assert_eq!(h.trace.calls("improve"), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_step_timeout_enforced_by_worker() {
        let h = harness();
        let yaml = r#"
name: timeout
version: "1"
steps:
  - { id: hang, operation: work, timeout_ms: 50, args: { delay_ms: 60000 } }
"#;
        let result = h.executor.run(&def(yaml), Map::new()).await.unwrap();
        let state = step(&result, "hang");
        assert_eq!(state.error.as_ref().unwrap().kind, ErrorKind::Timeout);
        assert_eq!(result.status, RunStatus::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_breaker_uses_fallback() {
        let h = harness();
        let yaml = r#"
name: fallback
version: "1"
config:
  breaker: { failure_threshold: 1, cooldown_ms: 60000 }
steps:
  - { id: first, operation: flaky, critical: false, on_error: continue, args: { fail_kind: transient } }
  - id: second
    operation: flaky
    depends_on: [first]
    fallback: { operation: work, args: { metrics: { degraded: 1 } } }
"#;
        let result = h.executor.run(&def(yaml), Map::new()).await.unwrap();

        assert_eq!(result.status, RunStatus::Completed);
        let second = step(&result, "second");
        assert_eq!(second.status, StepStatus::Succeeded);
        assert!(second.used_fallback);
        assert_eq!(second.outputs.as_ref().unwrap().metrics["degraded"], 1.0);
        assert_eq!(h.trace.calls("second"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_nonzero_exit_fails_with_exit_status_visible() {
        let h = harness();
        let yaml = r#"
name: exit
version: "1"
steps:
  - { id: check, operation: work, critical: false, on_error: continue, args: { exit_status: 3 } }
  - { id: report, operation: work, depends_on: [check], condition: "steps.check.exit_status == 3" }
"#;
        let result = h.executor.run(&def(yaml), Map::new()).await.unwrap();
        let check = step(&result, "check");
        assert_eq!(check.error.as_ref().unwrap().operation_kind.as_deref(), Some("nonzero_exit"));
        assert_eq!(check.outputs.as_ref().unwrap().exit_status, 3);
        assert_eq!(step(&result, "report").status, StepStatus::Succeeded);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exit_status_not_carried_into_later_timeout() {
        let h = harness();
        let executor = Executor::new(
            h.repo.clone(),
            ChecksumHasher,
            OperationRegistry::new().with(ScriptedOperation::new("work", Arc::clone(&h.trace))),
            GlobalConfig::default(),
        )
        .with_classifier(Arc::new(KindClassifier::new(["nonzero_exit", "timeout"])));
        let yaml = r#"
name: exit-then-hang
version: "1"
steps:
  - id: check
    operation: work
    timeout_ms: 50
    retry: { max_attempts: 2, initial_delay_ms: 10 }
    args: { exit_status: 3, delay_ms: 60000, delay_from_call: 2 }
"#;
        let result = executor.run(&def(yaml), Map::new()).await.unwrap();
        let check = step(&result, "check");
        assert_eq!(check.attempts, 2);
        assert_eq!(check.error.as_ref().unwrap().kind, ErrorKind::Timeout);
        assert!(check.outputs.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_applies_to_each_attempt() {
        let h = harness();
        let yaml = r#"
name: slow
version: "1"
steps:
  - id: hang
    operation: work
    timeout_ms: 50
    retry: { max_attempts: 3, initial_delay_ms: 10, multiplier: 1 }
    args: { delay_ms: 60000 }
"#;
        let begin = tokio::time::Instant::now();
        let result = h.executor.run(&def(yaml), Map::new()).await.unwrap();
        let hang = step(&result, "hang");
        assert_eq!(hang.attempts, 3);
        assert_eq!(h.trace.calls("hang"), 3);
        assert_eq!(hang.error.as_ref().unwrap().kind, ErrorKind::Timeout);
        // Three 50ms windows plus two 10ms backoffs.
        assert!(begin.elapsed() >= Duration::from_millis(170));
        assert!(begin.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_checkpoint_sequence_strictly_increases() {
        let h = harness();
        let mut events = h.executor.event_bus().subscribe();
        let result = h.executor.run(&def(DIAMOND), Map::new()).await.unwrap();

        let mut seqs = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let RunEvent::CheckpointSaved { seq, .. } = event {
                seqs.push(seq);
            }
        }
        assert!(seqs.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(seqs.last().copied(), Some(result.state.checkpoint_seq));
        assert_eq!(h.repo.run(&result.run_id).unwrap(), result.state);

        let listed = h.executor.list(None).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].status, RunStatus::Completed);
    }
}
