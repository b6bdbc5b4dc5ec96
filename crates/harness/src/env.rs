// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Captured-environment handling.
//!
//! The submitting shell's environment is captured once into
//! `environment.json` and re-applied by every worker, so user commands see
//! the environment the tree was submitted from, wherever they run.

use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;

/// Variables never re-applied: they describe the worker's own host.
pub const ENVIRONMENT_BLACKLIST: [&str; 4] = ["TMPDIR", "TMP", "HOSTNAME", "HOSTTYPE"];

/// Errors from environment capture or application.
#[derive(Debug, Error)]
pub enum EnvError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed environment file: {0}")]
    Json(#[from] serde_json::Error),
}

/// Capture the current process environment to `path`.
pub fn capture_to(path: &Path) -> Result<(), EnvError> {
    let vars: BTreeMap<String, String> = std::env::vars().collect();
    let text = serde_json::to_string_pretty(&vars)?;
    std::fs::write(path, text)?;
    Ok(())
}

/// Load a captured environment.
pub fn load(path: &Path) -> Result<BTreeMap<String, String>, EnvError> {
    let text = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&text)?)
}

/// Apply every captured variable except the blacklist.
pub fn apply(vars: &BTreeMap<String, String>) {
    for (key, value) in vars {
        if !ENVIRONMENT_BLACKLIST.contains(&key.as_str()) {
            std::env::set_var(key, value);
        }
    }
}

#[cfg(test)]
#[path = "env_tests.rs"]
mod tests;
