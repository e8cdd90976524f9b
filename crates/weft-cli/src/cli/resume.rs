//! `weft resume`: continue a stored run from its last checkpoint.

use std::sync::Arc;

use anyhow::{Context, Result};

use super::run::{print_result, supervise};
use super::{Outcome, Output, parse_run_id};
use crate::state::AppState;

pub async fn resume_run(state: &AppState, run_id: &str, out: Output) -> Result<Outcome> {
    let run_id = parse_run_id(run_id)?;
    tracing::info!(%run_id, "resuming run");

    let executor = Arc::clone(&state.executor);
    let result = supervise(&executor, Some(run_id), out, executor.resume(run_id))
        .await
        .with_context(|| format!("resuming run {run_id}"))?;

    print_result(&result, out)
}
