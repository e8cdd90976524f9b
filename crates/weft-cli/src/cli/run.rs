//! `weft run`: execute a workflow file.

use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use console::style;
use serde_json::{Map, Value};
use uuid::Uuid;
use weft_core::workflow::definition::load_workflow_file;
use weft_core::workflow::executor::{ExecutorError, RunResult};

use super::progress::spawn_progress;
use super::report::print_run;
use super::{ArgError, Outcome, Output};
use crate::state::{AppState, ConcreteExecutor};

/// How long to let the progress printer drain after the run returns.
const PROGRESS_DRAIN: Duration = Duration::from_millis(500);

pub async fn run_workflow(
    state: &AppState,
    file: &Path,
    input: &[String],
    inputs_file: Option<&Path>,
    out: Output,
) -> Result<Outcome> {
    let definition = load_workflow_file(file)
        .with_context(|| format!("loading workflow {}", file.display()))?;
    let inputs = collect_inputs(input, inputs_file).await?;

    tracing::info!(
        workflow = %definition.name,
        steps = definition.steps.len(),
        inputs = inputs.len(),
        "running workflow"
    );

    let executor = Arc::clone(&state.executor);
    let result = supervise(&executor, None, out, executor.run(&definition, inputs))
        .await
        .with_context(|| format!("running workflow '{}'", definition.name))?;

    print_result(&result, out)
}

/// Drive a run with live progress, cancelling every active run on Ctrl+C.
pub async fn supervise<F>(
    executor: &Arc<ConcreteExecutor>,
    run_id: Option<Uuid>,
    out: Output,
    run: F,
) -> Result<RunResult, ExecutorError>
where
    F: Future<Output = Result<RunResult, ExecutorError>>,
{
    let progress = spawn_progress(executor.event_bus(), run_id, out);

    let interrupt = {
        let executor = Arc::clone(executor);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("interrupt received, cancelling active runs");
                executor.cancel_all();
            }
        })
    };

    let result = run.await;
    interrupt.abort();

    if let Some(handle) = progress {
        if result.is_ok() {
            if tokio::time::timeout(PROGRESS_DRAIN, handle).await.is_err() {
                tracing::debug!("progress printer did not finish in time");
            }
        } else {
            handle.abort();
        }
    }
    result
}

pub fn print_result(result: &RunResult, out: Output) -> Result<Outcome> {
    let outcome = print_run(&result.state, out)?;
    if outcome == Outcome::Failed && out.styled() {
        println!(
            "  {} resume with: weft resume {}",
            style("hint:").yellow(),
            result.run_id
        );
        println!();
    }
    Ok(outcome)
}

/// Merge the inputs file (if any) with `--input` pairs; pairs win.
async fn collect_inputs(pairs: &[String], file: Option<&Path>) -> Result<Map<String, Value>> {
    let mut inputs = match file {
        Some(path) => {
            let raw = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("reading inputs file {}", path.display()))?;
            let value: Value = serde_json::from_str(&raw)
                .with_context(|| format!("parsing inputs file {}", path.display()))?;
            match value {
                Value::Object(map) => map,
                _ => return Err(ArgError::InputsNotObject.into()),
            }
        }
        None => Map::new(),
    };
    for pair in pairs {
        let (key, value) = parse_input(pair)?;
        inputs.insert(key, value);
    }
    Ok(inputs)
}

/// Split `KEY=VALUE`; the value is JSON when it parses as JSON, else a string.
fn parse_input(pair: &str) -> Result<(String, Value), ArgError> {
    let Some((key, raw)) = pair.split_once('=') else {
        return Err(ArgError::InvalidInput(pair.to_string()));
    };
    let key = key.trim();
    if key.is_empty() {
        return Err(ArgError::InvalidInput(pair.to_string()));
    }
    let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
    Ok((key.to_string(), value))
}
