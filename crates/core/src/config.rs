// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Tree-wide configuration, persisted as `config.toml` in the tree root.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors from loading or saving the configuration document.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
}

fn default_job_time() -> f64 {
    30.0
}

fn default_max_job_duration() -> f64 {
    1.0e9
}

fn default_rescue_jobs_frequency() -> f64 {
    3600.0
}

fn default_missing_job_rescue_delay() -> f64 {
    60.0
}

fn default_max_jobs() -> usize {
    8
}

fn default_retry_count() -> u32 {
    1
}

fn default_memory() -> u64 {
    4 * 1024 * 1024 * 1024
}

fn default_cpu() -> u32 {
    1
}

fn default_max_log_file_size() -> u64 {
    50_000
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Configuration for one job tree.
///
/// Written once on submission and re-read by every controller restart and
/// by each worker harness invocation. Per-job copies of the scheduling
/// knobs are baked into each record at creation time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreeConfig {
    /// Directory holding one subdirectory per job record.
    pub job_dir: PathBuf,
    /// Directory holding per-job user and worker logs.
    pub log_dir: PathBuf,
    /// Captured shell environment applied by the worker harness.
    pub environment_file: PathBuf,
    /// Ideal wall-clock seconds a single dispatch should run for; the
    /// worker chains follow-ons until this budget is exceeded.
    #[serde(default = "default_job_time")]
    pub job_time: f64,
    /// Wall-clock bound beyond which a running job is killed and retried.
    #[serde(default = "default_max_job_duration")]
    pub max_job_duration: f64,
    /// Seconds between rescue sweeps.
    #[serde(default = "default_rescue_jobs_frequency")]
    pub rescue_jobs_frequency: f64,
    /// Back-off before the next sweep while jobs are missing from the
    /// backend.
    #[serde(default = "default_missing_job_rescue_delay")]
    pub missing_job_rescue_delay: f64,
    /// Bound on concurrently running jobs in the local backend.
    #[serde(default = "default_max_jobs")]
    pub max_jobs: usize,
    /// Retries granted to a fresh record (and restored on recovery).
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,
    #[serde(default = "default_memory")]
    pub default_memory: u64,
    #[serde(default = "default_cpu")]
    pub default_cpu: u32,
    /// Logs larger than this are truncated to their trailing bytes.
    #[serde(default = "default_max_log_file_size")]
    pub max_log_file_size: u64,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Report every job's logs, not just failing ones.
    #[serde(default)]
    pub report_all_job_logs: bool,
    /// Aggregate stats file; per-job stats collection is on when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stats: Option<PathBuf>,
    /// Explicit path to the worker harness binary. When unset the
    /// controller looks for `arborw` beside its own executable, then on
    /// `PATH`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_binary: Option<PathBuf>,
}

impl TreeConfig {
    /// Default configuration rooted at `root`.
    pub fn new(root: &Path) -> Self {
        Self {
            job_dir: root.join("jobs"),
            log_dir: root.join("logs"),
            environment_file: root.join("environment.json"),
            job_time: default_job_time(),
            max_job_duration: default_max_job_duration(),
            rescue_jobs_frequency: default_rescue_jobs_frequency(),
            missing_job_rescue_delay: default_missing_job_rescue_delay(),
            max_jobs: default_max_jobs(),
            retry_count: default_retry_count(),
            default_memory: default_memory(),
            default_cpu: default_cpu(),
            max_log_file_size: default_max_log_file_size(),
            log_level: default_log_level(),
            report_all_job_logs: false,
            stats: None,
            worker_binary: None,
        }
    }

    /// Canonical location of the config document inside a tree root.
    pub fn path_in(root: &Path) -> PathBuf {
        root.join("config.toml")
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&text)?)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let text = toml::to_string_pretty(self)?;
        std::fs::write(path, text)?;
        Ok(())
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
