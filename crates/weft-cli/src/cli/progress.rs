//! Live progress lines rendered from the executor's event bus.

use console::style;
use tokio::task::JoinHandle;
use uuid::Uuid;
use weft_core::event::EventBus;
use weft_types::event::RunEvent;
use weft_types::run::{RunStatus, SkipReason};

use super::Output;

/// Print one line per event until the run finishes.
///
/// With `run_id` the lines are limited to that run; without it they follow
/// whichever run starts next. Returns `None` when output is JSON or quiet.
pub fn spawn_progress(bus: &EventBus, run_id: Option<Uuid>, out: Output) -> Option<JoinHandle<()>> {
    if !out.styled() {
        return None;
    }
    let mut stream = match run_id {
        Some(id) => bus.stream_run(id),
        None => bus.stream(),
    };
    Some(tokio::spawn(async move {
        while let Some(event) = stream.next().await {
            if let Some(line) = describe(&event) {
                println!("  {line}");
            }
        }
        if stream.missed() > 0 {
            println!(
                "  {}",
                style(format!("({} progress events not shown)", stream.missed())).dim()
            );
        }
    }))
}

/// One styled progress line, or `None` for events not worth showing.
pub fn describe(event: &RunEvent) -> Option<String> {
    let line = match event {
        RunEvent::RunStarted {
            run_id,
            workflow,
            resumed,
        } => {
            let verb = if *resumed { "Resuming" } else { "Starting" };
            format!(
                "{} {verb} '{}' (run {})",
                style("▶").cyan().bold(),
                style(workflow).cyan(),
                style(run_id).dim()
            )
        }
        RunEvent::StepStarted {
            step_id, attempt, ..
        } => {
            if *attempt > 1 {
                format!("{} {step_id} (attempt {attempt})", style("→").blue())
            } else {
                format!("{} {step_id}", style("→").blue())
            }
        }
        RunEvent::StepRetrying {
            step_id,
            attempt,
            delay_ms,
            error,
            ..
        } => format!(
            "{} {step_id} attempt {attempt} failed, retrying in {delay_ms}ms: {}",
            style("↻").yellow(),
            style(error).dim()
        ),
        RunEvent::StepIteration {
            step_id, iteration, ..
        } => format!("{} {step_id} iteration {iteration}", style("·").dim()),
        RunEvent::StepSucceeded {
            step_id,
            attempts,
            duration_ms,
            ..
        } => {
            let retries = if *attempts > 1 {
                format!(", {attempts} attempts")
            } else {
                String::new()
            };
            format!(
                "{} {step_id} {}",
                style("✓").green(),
                style(format!("({duration_ms}ms{retries})")).dim()
            )
        }
        RunEvent::StepFailed {
            step_id,
            kind,
            message,
            ..
        } => format!(
            "{} {step_id} [{kind}] {}",
            style("✗").red(),
            style(message).red()
        ),
        RunEvent::StepSkipped {
            step_id, reason, ..
        } => format!(
            "{} {step_id} skipped ({})",
            style("○").dim(),
            skip_label(*reason)
        ),
        RunEvent::CircuitOpened { operation, .. } => format!(
            "{} circuit opened for operation '{operation}'",
            style("⚡").yellow()
        ),
        RunEvent::CheckpointSaved { .. } => return None,
        RunEvent::RunFinished { status, .. } => {
            format!("{} run {}", status_mark(*status), status_label(*status))
        }
    };
    Some(line)
}

pub fn skip_label(reason: SkipReason) -> &'static str {
    match reason {
        SkipReason::Condition => "condition false",
        SkipReason::UpstreamFailed => "upstream failed",
        SkipReason::Aborted => "run stopped",
    }
}

fn status_mark(status: RunStatus) -> String {
    match status {
        RunStatus::Completed => style("✓").green().bold().to_string(),
        RunStatus::Paused => style("‖").yellow().bold().to_string(),
        _ => style("✗").red().bold().to_string(),
    }
}

/// Run status colored by outcome.
pub fn status_label(status: RunStatus) -> String {
    match status {
        RunStatus::Completed => style(status.as_str()).green().to_string(),
        RunStatus::Failed | RunStatus::Cancelled => style(status.as_str()).red().to_string(),
        RunStatus::Paused => style(status.as_str()).yellow().to_string(),
        _ => status.as_str().to_string(),
    }
}
