//! `weft list`: recent runs from the run store.

use anyhow::{Context, Result};
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use weft_types::run::{RunStatus, RunSummary};

use super::{Outcome, Output};
use crate::state::AppState;

pub async fn list_runs(state: &AppState, limit: usize, out: Output) -> Result<Outcome> {
    let runs = state
        .executor
        .list(Some(limit))
        .await
        .context("listing runs")?;

    if out.json {
        println!("{}", serde_json::to_string_pretty(&runs)?);
        return Ok(Outcome::Success);
    }
    if out.quiet {
        return Ok(Outcome::Success);
    }

    if runs.is_empty() {
        println!();
        println!(
            "  No runs in {}. Start one with: {}",
            style(state.data_dir.display()).dim(),
            style("weft run <workflow.yaml>").cyan()
        );
        println!();
        return Ok(Outcome::Success);
    }

    println!();
    println!("{}", runs_table(&runs));
    println!();
    println!("  {} run(s)", runs.len());
    println!();
    Ok(Outcome::Success)
}

fn runs_table(runs: &[RunSummary]) -> Table {
    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Run ID").fg(Color::Cyan),
            Cell::new("Workflow").fg(Color::Cyan),
            Cell::new("Status").fg(Color::Cyan),
            Cell::new("Checkpoint").fg(Color::Cyan),
            Cell::new("Started").fg(Color::Cyan),
            Cell::new("Updated").fg(Color::Cyan),
        ]);

    for run in runs {
        let status_color = match run.status {
            RunStatus::Completed => Color::Green,
            RunStatus::Failed | RunStatus::Cancelled => Color::Red,
            RunStatus::Paused | RunStatus::Running => Color::Yellow,
            RunStatus::Pending => Color::Reset,
        };
        table.add_row(vec![
            Cell::new(run.run_id),
            Cell::new(&run.workflow_name),
            Cell::new(run.status.as_str()).fg(status_color),
            Cell::new(run.checkpoint_seq),
            Cell::new(run.started_at.format("%Y-%m-%d %H:%M:%S")),
            Cell::new(run.updated_at.format("%Y-%m-%d %H:%M:%S")),
        ]);
    }
    table
}
