//! `weft status`: show the stored state of a run.

use anyhow::{Context, Result};

use super::report::print_run;
use super::{Outcome, Output, parse_run_id};
use crate::state::AppState;

/// Print a run's state. The exit status follows the run: only a completed
/// run reports success.
pub async fn show_status(state: &AppState, run_id: &str, out: Output) -> Result<Outcome> {
    let run_id = parse_run_id(run_id)?;
    let run = state
        .executor
        .status(run_id)
        .await
        .with_context(|| format!("loading run {run_id}"))?;
    print_run(&run, out)
}
