// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Directory layout of one job tree.
//!
//! Every job owns a directory `jobs/<id>/` that doubles as its global temp
//! dir: the canonical record lives at `jobs/<id>/job.json` (with
//! `.updating` / `.new` siblings during commits), the optional stats file
//! beside it, and the numbered layer subdirectories underneath. Logs live
//! under `logs/` and are tied to the record's lifetime.

use arbor_core::{Colour, JobRecord, TaskSpec, TreeConfig};
use chrono::Utc;
use std::io;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// File name of the canonical record inside a job directory.
pub const RECORD_FILE_NAME: &str = "job.json";

/// File name of the per-job stats file inside a job directory.
pub const STATS_FILE_NAME: &str = "stats.json";

/// Path helpers for a tree's job and log directories.
#[derive(Debug, Clone)]
pub struct TreeLayout {
    job_dir: PathBuf,
    log_dir: PathBuf,
}

impl TreeLayout {
    pub fn from_config(config: &TreeConfig) -> Self {
        Self {
            job_dir: config.job_dir.clone(),
            log_dir: config.log_dir.clone(),
        }
    }

    pub fn job_dir(&self) -> &Path {
        &self.job_dir
    }

    /// Create the tree's directories if they do not exist yet.
    pub fn ensure(&self) -> io::Result<()> {
        std::fs::create_dir_all(&self.job_dir)?;
        std::fs::create_dir_all(&self.log_dir)?;
        Ok(())
    }

    /// Allocate a new job record for `task`.
    ///
    /// Creates the job directory and empty log files; the record itself is
    /// not written; callers commit it through the store, together with
    /// any sibling records, so a crash voids the whole creation.
    pub fn create_record(
        &self,
        config: &TreeConfig,
        task: TaskSpec,
        parent: Option<PathBuf>,
    ) -> io::Result<JobRecord> {
        let id = Uuid::new_v4().to_string();
        let global_temp_dir = self.job_dir.join(&id);
        std::fs::create_dir_all(&global_temp_dir)?;

        let log_file = self.log_dir.join(format!("{id}.log"));
        let worker_log_file = self.log_dir.join(format!("{id}.worker.log"));
        std::fs::write(&log_file, b"")?;
        std::fs::write(&worker_log_file, b"")?;

        let stats_file = if config.stats.is_some() {
            let path = global_temp_dir.join(STATS_FILE_NAME);
            std::fs::write(&path, b"")?;
            Some(path)
        } else {
            None
        };

        Ok(JobRecord {
            file: global_temp_dir.join(RECORD_FILE_NAME),
            parent,
            colour: Colour::Grey,
            remaining_retry_count: config.retry_count,
            child_count: 0,
            black_child_count: 0,
            follow_ons: vec![task],
            children: Vec::new(),
            log_file,
            worker_log_file,
            global_temp_dir,
            job_creation_time: Utc::now(),
            job_time: config.job_time,
            max_log_file_size: config.max_log_file_size,
            default_memory: config.default_memory,
            default_cpu: config.default_cpu,
            environment_file: config.environment_file.clone(),
            log_level: config.log_level.clone(),
            stats_file,
            report_all_job_logs: config.report_all_job_logs,
        })
    }

    /// Remove a dead record and every file tied to it: both logs, the
    /// stats file, and the whole job directory (record included).
    pub fn delete_record(&self, record: &JobRecord) -> io::Result<()> {
        remove_file_if_present(&record.log_file)?;
        remove_file_if_present(&record.worker_log_file)?;
        if record.global_temp_dir.is_dir() {
            std::fs::remove_dir_all(&record.global_temp_dir)?;
        }
        Ok(())
    }

    /// Paths of every canonical record file currently in the tree.
    pub fn record_files(&self) -> io::Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        if !self.job_dir.is_dir() {
            return Ok(files);
        }
        for entry in std::fs::read_dir(&self.job_dir)? {
            let path = entry?.path();
            let record = path.join(RECORD_FILE_NAME);
            if record.is_file() {
                files.push(record);
            }
        }
        files.sort();
        Ok(files)
    }
}

fn remove_file_if_present(path: &Path) -> io::Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
#[path = "layout_tests.rs"]
mod tests;
