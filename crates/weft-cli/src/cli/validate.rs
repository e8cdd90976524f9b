//! `weft validate`: check a workflow file and describe its execution plan.

use std::path::Path;

use anyhow::{Context, Result};
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use serde::Serialize;
use weft_core::workflow::definition::load_workflow_file;
use weft_core::workflow::graph::{Graph, GraphErrors};

use super::{Outcome, Output};
use crate::state::AppState;

/// Machine-readable validation result.
#[derive(Debug, Serialize)]
struct ValidationReport<'a> {
    valid: bool,
    workflow: &'a str,
    version: &'a str,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    errors: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    plan: Option<Plan<'a>>,
}

#[derive(Debug, Serialize)]
struct Plan<'a> {
    steps: usize,
    layers: Vec<Vec<&'a str>>,
    critical_path: Vec<&'a str>,
    critical_path_length: usize,
    estimated_parallelism: f64,
}

impl<'a> Plan<'a> {
    fn of(graph: &'a Graph) -> Self {
        Self {
            steps: graph.len(),
            layers: graph.layers(),
            critical_path: graph.critical_path(),
            critical_path_length: graph.critical_path_length(),
            estimated_parallelism: graph.estimated_parallelism(),
        }
    }
}

pub fn validate_workflow(state: &AppState, file: &Path, out: Output) -> Result<Outcome> {
    let definition = load_workflow_file(file)
        .with_context(|| format!("loading workflow {}", file.display()))?;

    let result = state.executor.validate(&definition);
    let report = ValidationReport {
        valid: result.is_ok(),
        workflow: &definition.name,
        version: &definition.version,
        errors: match &result {
            Ok(_) => Vec::new(),
            Err(errors) => errors.iter().map(ToString::to_string).collect(),
        },
        plan: result.as_ref().ok().map(Plan::of),
    };

    if out.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else if !out.quiet {
        match &result {
            Ok(graph) => print_plan(&report, graph),
            Err(errors) => print_errors(&report, errors),
        }
    }

    Ok(if report.valid {
        Outcome::Success
    } else {
        Outcome::Invalid
    })
}

fn print_plan(report: &ValidationReport<'_>, graph: &Graph) {
    println!();
    println!(
        "  {} Workflow '{}' {} is valid",
        style("✓").green().bold(),
        style(report.workflow).cyan(),
        style(report.version).dim()
    );
    println!();

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Layer").fg(Color::Cyan),
            Cell::new("Steps").fg(Color::Cyan),
        ]);
    for (idx, layer) in graph.layers().iter().enumerate() {
        table.add_row(vec![Cell::new(idx), Cell::new(layer.join(", "))]);
    }
    println!("{table}");
    println!();

    if let Some(plan) = &report.plan {
        println!("  Steps:                 {}", plan.steps);
        println!(
            "  Critical path (length {}): {}",
            plan.critical_path_length,
            plan.critical_path.join(" → ")
        );
        println!(
            "  Estimated parallelism: {:.2}",
            plan.estimated_parallelism
        );
    }
    println!();
}

fn print_errors(report: &ValidationReport<'_>, errors: &GraphErrors) {
    println!();
    println!(
        "  {} Workflow '{}' has {} problem(s)",
        style("✗").red().bold(),
        style(report.workflow).cyan(),
        errors.len()
    );
    println!();
    for message in &report.errors {
        println!("  {} {message}", style("•").red());
    }
    println!();
}
