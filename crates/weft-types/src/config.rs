//! Global configuration types for weft.
//!
//! `GlobalConfig` represents the `config.toml` in the data directory. It
//! supplies execution defaults that each workflow's `config` block may
//! override; `GlobalConfig::settings_for` merges the two.

use serde::{Deserialize, Serialize};

use crate::workflow::{BreakerConfig, ErrorPolicy, RetryPolicy, WorkflowConfig};

/// Top-level configuration.
///
/// Loaded from `<data_dir>/config.toml`. All fields have sensible defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalConfig {
    /// Maximum steps executing at once within a run.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: u32,

    /// Per-attempt timeout applied when a step sets none.
    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,

    /// Retry policy applied when a step sets none. Defaults to a single attempt.
    #[serde(default = "RetryPolicy::no_retry")]
    pub default_retry: RetryPolicy,

    /// Policy after a failure in a step whose layer has no siblings.
    #[serde(default = "default_sequential_policy")]
    pub on_error_in_sequential: ErrorPolicy,

    /// Policy after a failure in a step that runs alongside siblings.
    #[serde(default = "default_parallel_policy")]
    pub on_error_in_parallel: ErrorPolicy,

    #[serde(default)]
    pub breaker: BreakerConfig,

    /// Operation error kinds considered transient and therefore retried.
    #[serde(default = "default_transient_kinds")]
    pub transient_error_kinds: Vec<String>,
}

fn default_max_concurrent() -> u32 {
    4
}

fn default_timeout_ms() -> u64 {
    300_000
}

fn default_sequential_policy() -> ErrorPolicy {
    ErrorPolicy::Stop
}

fn default_parallel_policy() -> ErrorPolicy {
    ErrorPolicy::Skip
}

fn default_transient_kinds() -> Vec<String> {
    ["timeout", "unavailable", "rate_limited", "io", "transient"]
        .into_iter()
        .map(String::from)
        .collect()
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            default_timeout_ms: default_timeout_ms(),
            default_retry: RetryPolicy::no_retry(),
            on_error_in_sequential: default_sequential_policy(),
            on_error_in_parallel: default_parallel_policy(),
            breaker: BreakerConfig::default(),
            transient_error_kinds: default_transient_kinds(),
        }
    }
}

impl GlobalConfig {
    /// Effective settings for a workflow: its `config` block over these defaults.
    pub fn settings_for(&self, workflow: &WorkflowConfig) -> ExecutionSettings {
        ExecutionSettings {
            max_concurrent: workflow
                .max_concurrent
                .unwrap_or(self.max_concurrent)
                .max(1),
            default_timeout_ms: workflow
                .default_timeout_ms
                .unwrap_or(self.default_timeout_ms),
            default_retry: workflow
                .default_retry
                .clone()
                .unwrap_or_else(|| self.default_retry.clone()),
            on_error_in_sequential: workflow
                .on_error_in_sequential
                .unwrap_or(self.on_error_in_sequential),
            on_error_in_parallel: workflow
                .on_error_in_parallel
                .unwrap_or(self.on_error_in_parallel),
            breaker: workflow
                .breaker
                .clone()
                .unwrap_or_else(|| self.breaker.clone()),
            transient_error_kinds: self.transient_error_kinds.clone(),
        }
    }
}

/// Fully resolved execution settings for one run.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionSettings {
    pub max_concurrent: u32,
    pub default_timeout_ms: u64,
    pub default_retry: RetryPolicy,
    pub on_error_in_sequential: ErrorPolicy,
    pub on_error_in_parallel: ErrorPolicy,
    pub breaker: BreakerConfig,
    pub transient_error_kinds: Vec<String>,
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        GlobalConfig::default().settings_for(&WorkflowConfig::default())
    }
}
