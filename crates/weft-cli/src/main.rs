//! Weft command-line entry point.
//!
//! Binary name: `weft`
//!
//! Parses CLI arguments, sets up tracing, wires the executor against the
//! on-disk run store, then dispatches to the command handler. The process exit
//! code distinguishes execution failures (1), validation errors (2) and state
//! errors (3).

mod cli;
mod state;

use std::process::ExitCode;

use clap::Parser;
use clap_complete::generate;
use weft_observe::{LogFormat, init_tracing, level_for, shutdown_tracing};

use cli::{Cli, Commands, Outcome};
use state::AppState;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let format = if cli.log_json {
        LogFormat::Json
    } else {
        LogFormat::Pretty
    };
    if let Err(e) = init_tracing(level_for(cli.verbose, cli.quiet), format, cli.otel) {
        eprintln!("failed to initialize tracing: {e}");
    }

    // Shell completions don't need app state
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = <Cli as clap::CommandFactory>::command();
        generate(*shell, &mut cmd, "weft", &mut std::io::stdout());
        return ExitCode::SUCCESS;
    }

    let result = dispatch(&cli).await;
    shutdown_tracing();

    match result {
        Ok(outcome) => ExitCode::from(outcome.exit_code()),
        Err(e) => {
            if cli.json {
                let body = serde_json::json!({ "error": format!("{e:#}") });
                println!("{}", serde_json::to_string_pretty(&body).unwrap_or_default());
            } else {
                eprintln!();
                eprintln!("  {} {e:#}", console::style("error:").red().bold());
                eprintln!();
            }
            ExitCode::from(cli::exit_code_for(&e))
        }
    }
}

async fn dispatch(cli: &Cli) -> anyhow::Result<Outcome> {
    let state = AppState::init(cli.data_dir.as_deref()).await?;
    let out = cli.output();

    match &cli.command {
        Commands::Run {
            file,
            input,
            inputs_file,
        } => cli::run::run_workflow(&state, file, input, inputs_file.as_deref(), out).await,

        Commands::Resume { run_id } => cli::resume::resume_run(&state, run_id, out).await,

        Commands::Status { run_id } => cli::status::show_status(&state, run_id, out).await,

        Commands::Validate { file } => cli::validate::validate_workflow(&state, file, out),

        Commands::List { limit } => cli::list::list_runs(&state, *limit, out).await,

        Commands::Completions { .. } => unreachable!("handled above"),
    }
}
