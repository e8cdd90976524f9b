//! Rendering of run state as styled tables or JSON.

use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use weft_core::workflow::executor::DURATION_METRIC;
use weft_types::run::{RunState, RunStatus, StepState, StepStatus};

use super::progress::{skip_label, status_label};
use super::{Output, Outcome};

/// Print a run, returning `Success` only when it completed.
pub fn print_run(run: &RunState, out: Output) -> anyhow::Result<Outcome> {
    if out.json {
        println!("{}", serde_json::to_string_pretty(run)?);
    } else if !out.quiet {
        println!();
        println!("{}", step_table(run));
        print_summary(run);
    }
    Ok(if run.status == RunStatus::Completed {
        Outcome::Success
    } else {
        Outcome::Failed
    })
}

/// Steps in the order they started; never-started steps last, by id.
fn ordered_steps(run: &RunState) -> Vec<(&str, &StepState)> {
    let mut steps: Vec<(&str, &StepState)> =
        run.steps.iter().map(|(id, s)| (id.as_str(), s)).collect();
    steps.sort_by(|(a_id, a), (b_id, b)| match (a.started_at, b.started_at) {
        (Some(x), Some(y)) => x.cmp(&y).then_with(|| a_id.cmp(b_id)),
        (Some(_), None) => std::cmp::Ordering::Less,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (None, None) => a_id.cmp(b_id),
    });
    steps
}

pub fn step_table(run: &RunState) -> Table {
    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Step").fg(Color::Cyan),
            Cell::new("Status").fg(Color::Cyan),
            Cell::new("Attempts").fg(Color::Cyan),
            Cell::new("Duration").fg(Color::Cyan),
            Cell::new("Detail").fg(Color::Cyan),
        ]);

    for (id, step) in ordered_steps(run) {
        let duration = step
            .outputs
            .as_ref()
            .and_then(|o| o.metrics.get(DURATION_METRIC))
            .map(|ms| format!("{ms:.0}ms"))
            .unwrap_or_else(|| "-".to_string());
        table.add_row(vec![
            Cell::new(id),
            Cell::new(step.status.as_str()).fg(status_color(step.status)),
            Cell::new(step.attempts),
            Cell::new(duration),
            Cell::new(detail(step)),
        ]);
    }
    table
}

fn status_color(status: StepStatus) -> Color {
    match status {
        StepStatus::Succeeded => Color::Green,
        StepStatus::Failed => Color::Red,
        StepStatus::Skipped => Color::DarkGrey,
        StepStatus::Running | StepStatus::Retrying => Color::Yellow,
        _ => Color::Reset,
    }
}

/// Short free-text column: error, skip reason, loop or fallback notes.
fn detail(step: &StepState) -> String {
    let mut notes = Vec::new();
    if let Some(err) = &step.error {
        notes.push(format!("[{}] {}", err.kind, err.message));
    }
    if let Some(reason) = step.skip_reason {
        notes.push(skip_label(reason).to_string());
    }
    if step.iterations > 0 {
        notes.push(format!("{} iterations", step.iterations));
    }
    if step.used_fallback {
        notes.push("via fallback".to_string());
    }
    if step.tolerated {
        notes.push("tolerated".to_string());
    }
    notes.join("; ")
}

/// e.g. `3 succeeded, 1 failed, 1 skipped`.
fn step_counts(run: &RunState) -> String {
    run.status_counts()
        .into_iter()
        .map(|(status, n)| format!("{n} {status}"))
        .collect::<Vec<_>>()
        .join(", ")
}

fn print_summary(run: &RunState) {
    println!();
    println!(
        "  {} {} ({})",
        style("Run").bold(),
        style(run.run_id).cyan(),
        status_label(run.status)
    );
    println!(
        "  Workflow:   {} {}",
        run.workflow.name,
        style(&run.workflow.version).dim()
    );
    println!("  Steps:      {}", step_counts(run));
    println!("  Checkpoint: {}", run.checkpoint_seq);
    println!(
        "  Updated:    {}",
        run.updated_at.format("%Y-%m-%d %H:%M:%S UTC")
    );

    if let Some(err) = &run.error {
        let step = err.step_id.as_deref().unwrap_or("-");
        println!(
            "  {}      {} [{}] {}",
            style("Error").red().bold(),
            step,
            err.kind,
            err.message
        );
    }
    if !run.skipped.is_empty() {
        println!("  Skipped:    {}", run.skipped.join(", "));
    }
    if !run.outputs.is_empty() {
        println!();
        println!("  {}", style("Outputs").bold());
        for (name, value) in &run.outputs {
            println!("    {name} = {value}");
        }
    }
    println!();
}
