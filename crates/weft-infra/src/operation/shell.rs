//! `shell`: run a process and report its exit status.
//!
//! ```yaml
//! args:
//!   command: cargo
//!   args: [test, --quiet]
//!   cwd: ./service            # optional
//!   env: { RUST_LOG: info }   # optional
//!   artifacts:                # files the process leaves behind
//!     - { name: binary, type: executable, version: 1.0.0, path: target/release/app }
//! ```
//!
//! Lines on stdout of the form `weft:metric <name> <value>` become metrics.
//! The process sees `WEFT_RUN_ID`, `WEFT_STEP_ID`, `WEFT_ATTEMPT`,
//! `WEFT_ITERATION`, one `WEFT_INPUT_<NAME>` per scalar input and one
//! `WEFT_ARTIFACT_<NAME>` per consumed artifact (a path, or inline JSON).
//! A nonzero exit is reported through `exit_status`; the executor decides
//! what that means. Cancellation kills the child.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use weft_core::operation::{Operation, OperationContext, OperationError, OperationOutcome};
use weft_types::artifact::{ArtifactContent, ProducedArtifact};

use super::{artifact_version, invalid_args, required_str};

/// Stdout prefix for metric lines.
pub const METRIC_PREFIX: &str = "weft:metric";

/// Error kind when the program cannot be started at all.
pub const KIND_SPAWN_FAILED: &str = "spawn_failed";

/// Error kind when a declared artifact file is missing after a clean exit.
pub const KIND_ARTIFACT_MISSING: &str = "artifact_missing";

/// Bytes of stderr kept for diagnostics.
const STDERR_TAIL_BYTES: usize = 4096;

#[derive(Debug, Clone, Default)]
pub struct ShellOperation;

impl ShellOperation {
    pub fn new() -> Self {
        Self
    }
}

/// Parse `weft:metric <name> <value>`.
pub fn parse_metric_line(line: &str) -> Option<(String, f64)> {
    let rest = line.trim().strip_prefix(METRIC_PREFIX)?;
    let mut parts = rest.split_whitespace();
    let name = parts.next()?;
    let value = parts.next()?.parse::<f64>().ok()?;
    if parts.next().is_some() || !value.is_finite() {
        return None;
    }
    Some((name.to_string(), value))
}

/// Environment variable name for an input or artifact: upper-case, `_` for
/// anything that is not alphanumeric.
fn env_name(prefix: &str, name: &str) -> String {
    let suffix: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
        .collect();
    format!("{prefix}{suffix}")
}

fn io_failure(err: std::io::Error) -> OperationError {
    OperationError::new("io", err.to_string())
}

impl ShellOperation {
    fn build_command(args: &Value, ctx: &OperationContext) -> Result<Command, OperationError> {
        let program = required_str(args, "command")?;
        let mut cmd = Command::new(program);

        if let Some(list) = args.get("args") {
            let list = list
                .as_array()
                .ok_or_else(|| invalid_args("args must be a list of strings"))?;
            for arg in list {
                let arg = arg
                    .as_str()
                    .ok_or_else(|| invalid_args("args must be a list of strings"))?;
                cmd.arg(arg);
            }
        }

        if let Some(cwd) = args.get("cwd").and_then(Value::as_str) {
            cmd.current_dir(cwd);
        }

        cmd.env("WEFT_RUN_ID", ctx.run_id.to_string())
            .env("WEFT_STEP_ID", &ctx.step_id)
            .env("WEFT_ATTEMPT", ctx.attempt.to_string());
        if let Some(iteration) = ctx.iteration {
            cmd.env("WEFT_ITERATION", iteration.to_string());
        }
        for (name, value) in ctx.inputs.iter() {
            let rendered = match value {
                Value::String(s) => s.clone(),
                Value::Number(_) | Value::Bool(_) => value.to_string(),
                _ => continue,
            };
            cmd.env(env_name("WEFT_INPUT_", name), rendered);
        }
        for artifact in &ctx.consumed {
            let rendered = match &artifact.content {
                ArtifactContent::Path(path) => path.display().to_string(),
                ArtifactContent::Inline(value) => value.to_string(),
            };
            cmd.env(env_name("WEFT_ARTIFACT_", &artifact.name), rendered);
        }

        if let Some(env) = args.get("env") {
            let env = env
                .as_object()
                .ok_or_else(|| invalid_args("env must be an object"))?;
            for (key, value) in env {
                match value {
                    Value::String(s) => cmd.env(key, s),
                    other => cmd.env(key, other.to_string()),
                };
            }
        }

        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        Ok(cmd)
    }

    /// Declared artifact files, resolved against `cwd`.
    fn collect_artifacts(
        args: &Value,
        cwd: Option<&Path>,
    ) -> Result<Vec<ProducedArtifact>, OperationError> {
        let Some(list) = args.get("artifacts") else {
            return Ok(Vec::new());
        };
        let list = list
            .as_array()
            .ok_or_else(|| invalid_args("artifacts must be a list"))?;

        let mut produced = Vec::with_capacity(list.len());
        for item in list {
            let raw = PathBuf::from(required_str(item, "path")?);
            let path = match cwd {
                Some(cwd) if raw.is_relative() => cwd.join(raw),
                _ => raw,
            };
            if !path.exists() {
                return Err(OperationError::new(
                    KIND_ARTIFACT_MISSING,
                    format!("declared artifact file {} does not exist", path.display()),
                ));
            }
            produced.push(ProducedArtifact {
                name: required_str(item, "name")?.to_string(),
                artifact_type: required_str(item, "type")?.to_string(),
                version: artifact_version(item)?,
                content: ArtifactContent::Path(path),
            });
        }
        Ok(produced)
    }
}

/// Read stdout to the end, collecting metric lines, then wait for exit.
async fn collect_metrics(
    child: &mut Child,
    step_id: &str,
) -> Result<(std::process::ExitStatus, BTreeMap<String, f64>), OperationError> {
    let mut metrics = BTreeMap::new();
    if let Some(stdout) = child.stdout.take() {
        let mut lines = BufReader::new(stdout).lines();
        while let Some(line) = lines.next_line().await.map_err(io_failure)? {
            match parse_metric_line(&line) {
                Some((name, value)) => {
                    metrics.insert(name, value);
                }
                None => tracing::trace!(step_id, line = %line, "stdout"),
            }
        }
    }
    let status = child.wait().await.map_err(io_failure)?;
    Ok((status, metrics))
}

/// Keep the last few KiB of a stream.
async fn read_tail<R: AsyncRead + Unpin>(mut reader: R) -> String {
    let mut buf = Vec::new();
    if reader.read_to_end(&mut buf).await.is_err() {
        return String::new();
    }
    let start = buf.len().saturating_sub(STDERR_TAIL_BYTES);
    String::from_utf8_lossy(&buf[start..]).trim().to_string()
}

impl Operation for ShellOperation {
    fn name(&self) -> &str {
        "shell"
    }

    async fn execute(
        &self,
        args: &Value,
        ctx: &OperationContext,
    ) -> Result<OperationOutcome, OperationError> {
        let mut cmd = Self::build_command(args, ctx)?;
        let program = required_str(args, "command")?;

        let mut child = cmd.spawn().map_err(|e| {
            let kind = if e.kind() == std::io::ErrorKind::NotFound {
                KIND_SPAWN_FAILED
            } else {
                "io"
            };
            OperationError::new(kind, format!("failed to start '{program}': {e}"))
        })?;
        tracing::debug!(step_id = %ctx.step_id, program, pid = ?child.id(), "process started");

        let stderr = child.stderr.take().map(|s| tokio::spawn(read_tail(s)));

        let finished = tokio::select! {
            _ = ctx.cancel.cancelled() => None,
            result = collect_metrics(&mut child, &ctx.step_id) => Some(result),
        };
        let Some(result) = finished else {
            if let Err(e) = child.kill().await {
                tracing::warn!(step_id = %ctx.step_id, error = %e, "failed to kill cancelled process");
            }
            return Err(OperationError::cancelled());
        };
        let (status, metrics) = result?;

        let stderr_tail = match stderr {
            Some(handle) => handle.await.unwrap_or_default(),
            None => String::new(),
        };

        // Killed by a signal: no exit code to report.
        let Some(code) = status.code() else {
            return Err(OperationError::new(
                "terminated",
                format!("'{program}' was terminated by a signal: {stderr_tail}"),
            ));
        };

        let mut outcome = OperationOutcome::success();
        outcome.exit_status = code;
        outcome.metrics = metrics;

        if code == 0 {
            let cwd = args.get("cwd").and_then(Value::as_str).map(Path::new);
            outcome.produced_artifacts = Self::collect_artifacts(args, cwd)?;
        } else {
            tracing::info!(
                step_id = %ctx.step_id,
                program,
                exit_status = code,
                stderr = %stderr_tail,
                "process exited with nonzero status"
            );
        }
        Ok(outcome)
    }
}
