//! Data directory layout for weft.
//!
//! ```text
//! {data_dir}/
//!   config.toml
//!   runs/
//!     {run_id}/
//!       state.json
//!       workflow.json
//! ```

use std::ffi::OsString;
use std::path::{Path, PathBuf};

/// Environment variable overriding the data directory.
pub const DATA_DIR_ENV: &str = "WEFT_DATA_DIR";

/// Directory holding one subdirectory per run.
pub fn runs_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("runs")
}

/// Resolve the data directory.
///
/// Priority:
/// 1. An explicit path (the `--data-dir` flag)
/// 2. `WEFT_DATA_DIR` environment variable
/// 3. `~/.weft`
pub fn resolve_data_dir(explicit: Option<&Path>) -> PathBuf {
    data_dir_from(explicit, std::env::var_os(DATA_DIR_ENV), dirs::home_dir())
}

fn data_dir_from(explicit: Option<&Path>, env: Option<OsString>, home: Option<PathBuf>) -> PathBuf {
    if let Some(dir) = explicit {
        return dir.to_path_buf();
    }
    if let Some(dir) = env.filter(|d| !d.is_empty()) {
        return PathBuf::from(dir);
    }
    match home {
        Some(home) => home.join(".weft"),
        // Last resort: current directory
        None => PathBuf::from(".weft"),
    }
}
