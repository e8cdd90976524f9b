//! Graph builder: validation, cycle detection, and layer computation.
//!
//! `GraphBuilder::build` turns a `WorkflowDefinition` into an immutable
//! [`Graph`]. Steps live in an index arena (a `petgraph::DiGraph` whose node
//! indices match declaration order) and every dependency is an edge from the
//! dependency to its dependent. Validation collects every problem it can find
//! instead of stopping at the first, so `weft validate` can report them all.
//!
//! Cycle detection is an explicit depth-first walk with a recursion stack.
//! On a back-edge the walk reports the exact cycle as an ordered list of step
//! ids, e.g. `a -> c -> b -> a`.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;

use petgraph::algo::{has_path_connecting, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use weft_types::workflow::{DependencyRef, StepDefinition, WorkflowDefinition};

use super::expression::{Expression, ExpressionError};

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// A single structural problem with a workflow definition.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GraphError {
    #[error("invalid definition: {0}")]
    InvalidDefinition(String),

    #[error("duplicate step id '{0}'")]
    DuplicateStepId(String),

    #[error("step '{step}' depends on unknown step '{dependency}'")]
    UnknownDependency { step: String, dependency: String },

    #[error("step '{step}' references artifact '{artifact}' which {}", describe_candidates(.candidates))]
    UnresolvedReference {
        step: String,
        artifact: String,
        candidates: Vec<String>,
    },

    #[error("cycle detected: {}", format_cycle(.path))]
    Cycle { path: Vec<String> },

    #[error("step '{step}' has an invalid {field}: {error}")]
    InvalidCondition {
        step: String,
        field: &'static str,
        error: ExpressionError,
    },

    #[error("{owner} references '{reference}', which is not an upstream dependency")]
    UndeclaredReference { owner: String, reference: String },

    #[error("step '{step}' uses unknown operation '{operation}'")]
    UnknownOperation { step: String, operation: String },

    #[error("{owner} has an invalid policy: {message}")]
    InvalidPolicy { owner: String, message: String },

    #[error("output '{name}' is invalid: {message}")]
    InvalidOutput { name: String, message: String },
}

fn describe_candidates(candidates: &[String]) -> String {
    if candidates.is_empty() {
        "no step produces".to_string()
    } else {
        format!(
            "is produced by more than one step ({})",
            candidates.join(", ")
        )
    }
}

/// Render a cycle path closed back onto its first step.
pub fn format_cycle(path: &[String]) -> String {
    let mut out = path.join(" -> ");
    if let Some(first) = path.first() {
        out.push_str(" -> ");
        out.push_str(first);
    }
    out
}

/// Every problem found while building a graph.
#[derive(Debug, Clone, PartialEq)]
pub struct GraphErrors(pub Vec<GraphError>);

impl GraphErrors {
    pub fn iter(&self) -> impl Iterator<Item = &GraphError> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The first reported cycle, if any.
    pub fn cycle(&self) -> Option<&[String]> {
        self.0.iter().find_map(|e| match e {
            GraphError::Cycle { path } => Some(path.as_slice()),
            _ => None,
        })
    }
}

impl fmt::Display for GraphErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} validation error(s)", self.0.len())?;
        for err in &self.0 {
            write!(f, "\n  - {err}")?;
        }
        Ok(())
    }
}

impl std::error::Error for GraphErrors {}

// ---------------------------------------------------------------------------
// Graph
// ---------------------------------------------------------------------------

/// One step in the arena, with its parsed expressions and resolved edges.
#[derive(Debug, Clone)]
pub struct StepNode {
    pub def: StepDefinition,
    /// Resolved dependencies (step indices), deduplicated, in declaration order.
    pub deps: Vec<usize>,
    /// Steps that depend directly on this one.
    pub dependents: Vec<usize>,
    /// 1 + max(layer of deps); steps without dependencies are layer 0.
    pub layer: usize,
    pub condition: Option<Expression>,
    pub loop_expr: Option<Expression>,
}

/// A validated, immutable workflow graph.
#[derive(Debug, Clone)]
pub struct Graph {
    definition: WorkflowDefinition,
    nodes: Vec<StepNode>,
    index: HashMap<String, usize>,
    dag: DiGraph<usize, ()>,
    outputs: Vec<(String, Expression)>,
    layer_sizes: Vec<usize>,
}

impl Graph {
    pub fn definition(&self) -> &WorkflowDefinition {
        &self.definition
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn nodes(&self) -> &[StepNode] {
        &self.nodes
    }

    pub fn node(&self, idx: usize) -> &StepNode {
        &self.nodes[idx]
    }

    pub fn index_of(&self, id: &str) -> Option<usize> {
        self.index.get(id).copied()
    }

    pub fn step(&self, id: &str) -> Option<&StepNode> {
        self.index_of(id).map(|idx| &self.nodes[idx])
    }

    pub fn step_ids(&self) -> impl Iterator<Item = &str> {
        self.nodes.iter().map(|n| n.def.id.as_str())
    }

    /// Parsed workflow output expressions.
    pub fn outputs(&self) -> &[(String, Expression)] {
        &self.outputs
    }

    pub fn layer(&self, id: &str) -> Option<usize> {
        self.step(id).map(|n| n.layer)
    }

    /// Step ids grouped by layer, each group in declaration order.
    pub fn layers(&self) -> Vec<Vec<&str>> {
        let mut layers = vec![Vec::new(); self.layer_sizes.len()];
        for node in &self.nodes {
            layers[node.layer].push(node.def.id.as_str());
        }
        layers
    }

    /// The highest layer value: edges along the longest dependency chain.
    /// A graph of independent steps has length 0.
    pub fn critical_path_length(&self) -> usize {
        self.layer_sizes.len().saturating_sub(1)
    }

    /// One concrete longest chain, from its root to its last step.
    pub fn critical_path(&self) -> Vec<&str> {
        let Some(mut current) = self
            .nodes
            .iter()
            .enumerate()
            .max_by(|(ia, a), (ib, b)| a.layer.cmp(&b.layer).then(ib.cmp(ia)))
            .map(|(idx, _)| idx)
        else {
            return Vec::new();
        };

        let mut chain = vec![self.nodes[current].def.id.as_str()];
        while self.nodes[current].layer > 0 {
            let want = self.nodes[current].layer - 1;
            let Some(&prev) = self.nodes[current]
                .deps
                .iter()
                .find(|&&d| self.nodes[d].layer == want)
            else {
                break;
            };
            chain.push(self.nodes[prev].def.id.as_str());
            current = prev;
        }
        chain.reverse();
        chain
    }

    /// `step_count / critical_path_length`, with a length of 0 counted as 1
    /// so a flat graph reports its full width.
    pub fn estimated_parallelism(&self) -> f64 {
        if self.nodes.is_empty() {
            return 0.0;
        }
        self.nodes.len() as f64 / self.critical_path_length().max(1) as f64
    }

    /// Whether the step shares its layer with at least one other step.
    pub fn is_parallel(&self, idx: usize) -> bool {
        self.layer_sizes[self.nodes[idx].layer] > 1
    }

    /// Whether `ancestor` is a transitive dependency of `idx`.
    pub fn is_ancestor(&self, ancestor: usize, idx: usize) -> bool {
        ancestor != idx
            && has_path_connecting(&self.dag, NodeIndex::new(ancestor), NodeIndex::new(idx), None)
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Builds and validates graphs, optionally against a catalog of known operations.
#[derive(Debug, Default, Clone)]
pub struct GraphBuilder {
    operations: Option<HashSet<String>>,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject steps whose operation (or fallback operation) is not in `names`.
    pub fn with_operations<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.operations = Some(names.into_iter().map(Into::into).collect());
        self
    }

    pub fn build(&self, def: &WorkflowDefinition) -> Result<Graph, GraphErrors> {
        let mut errors = Vec::new();

        check_definition(def, &mut errors);

        // Index steps; duplicates keep their first position.
        let mut index: HashMap<String, usize> = HashMap::new();
        for (i, step) in def.steps.iter().enumerate() {
            if step.id.trim().is_empty() {
                errors.push(GraphError::InvalidDefinition(format!(
                    "step #{} has an empty id",
                    i + 1
                )));
            }
            if index.contains_key(&step.id) {
                errors.push(GraphError::DuplicateStepId(step.id.clone()));
            } else {
                index.insert(step.id.clone(), i);
            }
        }

        // Artifact name -> producing step indices.
        let mut producers: HashMap<&str, Vec<usize>> = HashMap::new();
        for (i, step) in def.steps.iter().enumerate() {
            for name in &step.outputs {
                producers.entry(name.as_str()).or_default().push(i);
            }
        }

        let resolve_artifact = |step: &StepDefinition, name: &str| -> Result<usize, GraphError> {
            match producers.get(name).map(Vec::as_slice) {
                Some([only]) => Ok(*only),
                other => Err(GraphError::UnresolvedReference {
                    step: step.id.clone(),
                    artifact: name.to_string(),
                    candidates: other
                        .unwrap_or_default()
                        .iter()
                        .map(|&i| def.steps[i].id.clone())
                        .collect(),
                }),
            }
        };

        // Resolve dependency edges.
        let mut deps: Vec<Vec<usize>> = vec![Vec::new(); def.steps.len()];
        for (i, step) in def.steps.iter().enumerate() {
            for raw in &step.depends_on {
                let resolved = match DependencyRef::parse(raw) {
                    DependencyRef::Step(id) => index.get(id).copied().ok_or_else(|| {
                        GraphError::UnknownDependency {
                            step: step.id.clone(),
                            dependency: id.to_string(),
                        }
                    }),
                    DependencyRef::Artifact(name) => resolve_artifact(step, name),
                };
                match resolved {
                    Ok(dep) if !deps[i].contains(&dep) => deps[i].push(dep),
                    Ok(_) => {}
                    Err(e) => errors.push(e),
                }
            }
        }

        self.check_operations(def, &mut errors);
        for step in &def.steps {
            check_step_policies(step, &mut errors);
        }

        // Parse expressions.
        let mut conditions = Vec::with_capacity(def.steps.len());
        let mut loop_exprs = Vec::with_capacity(def.steps.len());
        for step in &def.steps {
            conditions.push(parse_field(step, "condition", step.condition.as_deref(), &mut errors));
            let loop_src = step.loop_policy.as_ref().and_then(|lp| lp.expression());
            loop_exprs.push(parse_field(step, "loop expression", loop_src, &mut errors));
        }
        let mut outputs = Vec::with_capacity(def.outputs.len());
        for out in &def.outputs {
            match Expression::parse(&out.expr) {
                Ok(expr) => outputs.push((out.name.clone(), expr)),
                Err(e) => errors.push(GraphError::InvalidOutput {
                    name: out.name.clone(),
                    message: e.to_string(),
                }),
            }
        }

        // Cycles are searched over the edges that did resolve, so a bad
        // reference elsewhere never hides one.
        let cycles = find_cycles(&deps);
        for cycle in &cycles {
            errors.push(GraphError::Cycle {
                path: cycle.iter().map(|&i| def.steps[i].id.clone()).collect(),
            });
        }

        // Arena: node index == declaration index.
        let mut dag = DiGraph::<usize, ()>::with_capacity(def.steps.len(), 0);
        for i in 0..def.steps.len() {
            dag.add_node(i);
        }
        for (i, ds) in deps.iter().enumerate() {
            for &d in ds {
                dag.add_edge(NodeIndex::new(d), NodeIndex::new(i), ());
            }
        }

        let mut layers = vec![0usize; def.steps.len()];
        match toposort(&dag, None) {
            Ok(sorted) => {
                for node in sorted {
                    let i = dag[node];
                    layers[i] = deps[i].iter().map(|&d| layers[d] + 1).max().unwrap_or(0);
                }
            }
            // Layers stay flat; the graph is only kept for the reference checks.
            Err(cycle) if cycles.is_empty() => errors.push(GraphError::Cycle {
                path: vec![def.steps[dag[cycle.node_id()]].id.clone()],
            }),
            Err(_) => {}
        }

        let layer_count = layers.iter().copied().max().map_or(0, |m| m + 1);
        let mut layer_sizes = vec![0usize; layer_count];
        for &l in &layers {
            layer_sizes[l] += 1;
        }

        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); def.steps.len()];
        for (i, ds) in deps.iter().enumerate() {
            for &d in ds {
                dependents[d].push(i);
            }
        }

        let nodes: Vec<StepNode> = def
            .steps
            .iter()
            .enumerate()
            .map(|(i, step)| StepNode {
                def: step.clone(),
                deps: std::mem::take(&mut deps[i]),
                dependents: std::mem::take(&mut dependents[i]),
                layer: layers[i],
                condition: conditions[i].take(),
                loop_expr: loop_exprs[i].take(),
            })
            .collect();

        let graph = Graph {
            definition: def.clone(),
            nodes,
            index,
            dag,
            outputs,
            layer_sizes,
        };

        check_references(&graph, &producers, &mut errors);

        if errors.is_empty() {
            tracing::debug!(
                workflow = %def.name,
                steps = graph.len(),
                critical_path_length = graph.critical_path_length(),
                "workflow graph built"
            );
            Ok(graph)
        } else {
            Err(GraphErrors(errors))
        }
    }

    fn check_operations(&self, def: &WorkflowDefinition, errors: &mut Vec<GraphError>) {
        let Some(known) = &self.operations else {
            return;
        };
        for step in &def.steps {
            let fallback = step.fallback.as_ref().map(|f| f.operation.as_str());
            for operation in std::iter::once(step.operation.as_str()).chain(fallback) {
                if !known.contains(operation) {
                    errors.push(GraphError::UnknownOperation {
                        step: step.id.clone(),
                        operation: operation.to_string(),
                    });
                }
            }
        }
    }
}

/// Build with no operation catalog.
pub fn build(def: &WorkflowDefinition) -> Result<Graph, GraphErrors> {
    GraphBuilder::new().build(def)
}

// ---------------------------------------------------------------------------
// Validation helpers
// ---------------------------------------------------------------------------

fn check_definition(def: &WorkflowDefinition, errors: &mut Vec<GraphError>) {
    if def.name.trim().is_empty() {
        errors.push(GraphError::InvalidDefinition(
            "workflow name must not be empty".to_string(),
        ));
    }
    if def.steps.is_empty() {
        errors.push(GraphError::InvalidDefinition(
            "workflow must have at least one step".to_string(),
        ));
    }

    let mut seen = HashSet::new();
    for input in &def.inputs {
        if !seen.insert(input.name.as_str()) {
            errors.push(GraphError::InvalidDefinition(format!(
                "duplicate input '{}'",
                input.name
            )));
        }
    }
    let mut seen = HashSet::new();
    for output in &def.outputs {
        if !seen.insert(output.name.as_str()) {
            errors.push(GraphError::InvalidOutput {
                name: output.name.clone(),
                message: "duplicate output name".to_string(),
            });
        }
    }

    let owner = "workflow config".to_string();
    if def.config.max_concurrent == Some(0) {
        errors.push(GraphError::InvalidPolicy {
            owner: owner.clone(),
            message: "max_concurrent must be at least 1".to_string(),
        });
    }
    if let Some(retry) = &def.config.default_retry {
        check_retry(&owner, retry, errors);
    }
    if def.config.breaker.as_ref().is_some_and(|b| b.failure_threshold == 0) {
        errors.push(GraphError::InvalidPolicy {
            owner,
            message: "breaker.failure_threshold must be at least 1".to_string(),
        });
    }
}

fn check_retry(
    owner: &str,
    retry: &weft_types::workflow::RetryPolicy,
    errors: &mut Vec<GraphError>,
) {
    let mut fail = |message: &str| {
        errors.push(GraphError::InvalidPolicy {
            owner: owner.to_string(),
            message: message.to_string(),
        })
    };
    if retry.max_attempts == 0 {
        fail("retry.max_attempts must be at least 1");
    }
    if !(retry.multiplier >= 1.0) {
        fail("retry.multiplier must be at least 1.0");
    }
    if !(0.0..=1.0).contains(&retry.jitter) {
        fail("retry.jitter must be between 0.0 and 1.0");
    }
}

fn check_step_policies(step: &StepDefinition, errors: &mut Vec<GraphError>) {
    let owner = format!("step '{}'", step.id);
    if let Some(retry) = &step.retry {
        check_retry(&owner, retry, errors);
    }
    if step.timeout_ms == Some(0) {
        errors.push(GraphError::InvalidPolicy {
            owner: owner.clone(),
            message: "timeout_ms must be greater than 0".to_string(),
        });
    }
    if let Some(lp) = &step.loop_policy {
        if lp.max_iterations == 0 {
            errors.push(GraphError::InvalidPolicy {
                owner: owner.clone(),
                message: "loop.max_iterations must be at least 1".to_string(),
            });
        }
        if lp.while_expr.is_some() == lp.until.is_some() {
            errors.push(GraphError::InvalidPolicy {
                owner: owner.clone(),
                message: "loop must set exactly one of 'while' or 'until'".to_string(),
            });
        }
        if let Some(guard) = &lp.progress {
            if guard.min_delta < 0.0 {
                errors.push(GraphError::InvalidPolicy {
                    owner,
                    message: "loop.progress.min_delta must not be negative".to_string(),
                });
            }
        }
    }
}

fn parse_field(
    step: &StepDefinition,
    field: &'static str,
    source: Option<&str>,
    errors: &mut Vec<GraphError>,
) -> Option<Expression> {
    let source = source?;
    match Expression::parse(source) {
        Ok(expr) => Some(expr),
        Err(error) => {
            errors.push(GraphError::InvalidCondition {
                step: step.id.clone(),
                field,
                error,
            });
            None
        }
    }
}

/// Every `steps.<id>` reference must name an upstream step, and every consumed
/// artifact must come from one. Loop expressions may also see their own step;
/// workflow outputs may reference any step.
fn check_references(
    graph: &Graph,
    producers: &HashMap<&str, Vec<usize>>,
    errors: &mut Vec<GraphError>,
) {
    for (idx, node) in graph.nodes.iter().enumerate() {
        let owner = format!("step '{}'", node.def.id);

        let check = |expr: &Expression, allow_self: bool, errors: &mut Vec<GraphError>| {
            for referenced in expr.referenced_steps() {
                let ok = match graph.index_of(referenced) {
                    Some(r) if r == idx => allow_self,
                    Some(r) => graph.is_ancestor(r, idx),
                    None => false,
                };
                if !ok {
                    errors.push(GraphError::UndeclaredReference {
                        owner: owner.clone(),
                        reference: format!("steps.{referenced}"),
                    });
                }
            }
        };

        if let Some(expr) = &node.condition {
            check(expr, false, errors);
        }
        if let Some(expr) = &node.loop_expr {
            check(expr, true, errors);
        }

        for contract in &node.def.consumes {
            match producers.get(contract.artifact.as_str()).map(Vec::as_slice) {
                Some([producer]) if graph.is_ancestor(*producer, idx) => {}
                Some([_]) => errors.push(GraphError::UndeclaredReference {
                    owner: owner.clone(),
                    reference: format!("artifact:{}", contract.artifact),
                }),
                other => errors.push(GraphError::UnresolvedReference {
                    step: node.def.id.clone(),
                    artifact: contract.artifact.clone(),
                    candidates: other
                        .unwrap_or_default()
                        .iter()
                        .map(|&i| graph.nodes[i].def.id.clone())
                        .collect(),
                }),
            }
        }
    }

    for (name, expr) in &graph.outputs {
        let unknown: BTreeSet<&str> = expr
            .referenced_steps()
            .into_iter()
            .filter(|id| graph.index_of(id).is_none())
            .collect();
        for id in unknown {
            errors.push(GraphError::UndeclaredReference {
                owner: format!("output '{name}'"),
                reference: format!("steps.{id}"),
            });
        }
    }
}

/// Depth-first search with an explicit recursion stack over `deps`.
///
/// Returns one cycle per back-edge found, each as the ordered list of step
/// indices from the re-entered step along the dependency chain.
fn find_cycles(deps: &[Vec<usize>]) -> Vec<Vec<usize>> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Unvisited,
        OnStack,
        Done,
    }

    let mut marks = vec![Mark::Unvisited; deps.len()];
    let mut cycles = Vec::new();

    for root in 0..deps.len() {
        if marks[root] != Mark::Unvisited {
            continue;
        }
        // (node, next dependency position)
        let mut stack: Vec<(usize, usize)> = vec![(root, 0)];
        marks[root] = Mark::OnStack;

        while let Some(top) = stack.len().checked_sub(1) {
            let (node, pos) = stack[top];
            if let Some(&dep) = deps[node].get(pos) {
                stack[top].1 += 1;
                match marks[dep] {
                    Mark::Unvisited => {
                        marks[dep] = Mark::OnStack;
                        stack.push((dep, 0));
                    }
                    Mark::OnStack => {
                        let start = stack
                            .iter()
                            .position(|&(n, _)| n == dep)
                            .unwrap_or(0);
                        cycles.push(stack[start..].iter().map(|&(n, _)| n).collect());
                    }
                    Mark::Done => {}
                }
            } else {
                marks[node] = Mark::Done;
                stack.pop();
            }
        }
    }

    cycles
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
