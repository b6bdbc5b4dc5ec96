// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The job batcher: the controller's sole interface to the batch backend.
//!
//! Keeps the table mapping backend-issued job ids to the record file (and
//! cpu request) they were issued for. The table is guarded by a single
//! mutex because the rescue sweeps consult it between controller ticks; no
//! lock is held across a blocking call other than the issue that produced
//! the id.

use crate::error::EngineError;
use arbor_batch::BatchSystem;
use arbor_core::{JobRecord, TreeConfig};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Builds the command line dispatching the worker harness at a record.
#[derive(Debug, Clone)]
pub struct WorkerCommand {
    binary: PathBuf,
    tree_root: PathBuf,
}

impl WorkerCommand {
    pub fn new(binary: PathBuf, tree_root: PathBuf) -> Self {
        Self { binary, tree_root }
    }

    /// Locate the harness binary: the configured override, then `arborw`
    /// beside the running executable, then `arborw` on PATH.
    pub fn resolve(config: &TreeConfig, tree_root: &Path) -> Self {
        let binary = config.worker_binary.clone().unwrap_or_else(|| {
            std::env::current_exe()
                .ok()
                .and_then(|exe| exe.parent().map(|dir| dir.join("arborw")))
                .filter(|candidate| candidate.is_file())
                .unwrap_or_else(|| PathBuf::from("arborw"))
        });
        Self::new(binary, tree_root.to_path_buf())
    }

    /// Render the invocation `arborw <treeRoot> --job <jobFile>`.
    pub fn render(&self, job_file: &Path) -> String {
        format!(
            "{} {} --job {}",
            shell_quote(&self.binary.display().to_string()),
            shell_quote(&self.tree_root.display().to_string()),
            shell_quote(&job_file.display().to_string()),
        )
    }
}

/// Single-quote a string for `sh -c`.
fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

#[derive(Default)]
struct BatcherTable {
    jobs: HashMap<u64, (PathBuf, u32)>,
    jobs_issued: usize,
}

/// In-memory registry of issued jobs keyed by backend id.
pub struct JobBatcher<'a> {
    backend: &'a dyn BatchSystem,
    worker: WorkerCommand,
    table: Mutex<BatcherTable>,
}

impl<'a> JobBatcher<'a> {
    pub fn new(backend: &'a dyn BatchSystem, worker: WorkerCommand) -> Self {
        Self {
            backend,
            worker,
            table: Mutex::new(BatcherTable::default()),
        }
    }

    /// Issue a record's top follow-on to the backend and register the id.
    pub fn issue_job(&self, record: &JobRecord) -> Result<u64, EngineError> {
        let task = record.next_follow_on().ok_or_else(|| {
            EngineError::Invariant(format!(
                "record {} issued with an empty follow-on stack",
                record.file.display()
            ))
        })?;
        let command = self.worker.render(&record.file);
        let job_id =
            self.backend
                .issue_job(&command, task.memory, task.cpu, &record.worker_log_file)?;

        let mut table = self.table.lock();
        table.jobs.insert(job_id, (record.file.clone(), task.cpu));
        table.jobs_issued += 1;
        debug!(
            job_id,
            file = %record.file.display(),
            cpu = task.cpu,
            memory = task.memory,
            "issued job"
        );
        Ok(job_id)
    }

    /// Issue a batch of records; order within the batch is unspecified.
    pub fn issue_jobs(&self, records: &[JobRecord]) -> Result<(), EngineError> {
        for record in records {
            self.issue_job(record)?;
        }
        Ok(())
    }

    /// Pop a finished id, returning the record file it was issued for.
    /// Calling this for an unknown id is an invariant violation.
    pub fn remove_job_id(&self, job_id: u64) -> Result<PathBuf, EngineError> {
        let mut table = self.table.lock();
        let (file, _cpu) = table
            .jobs
            .remove(&job_id)
            .ok_or_else(|| EngineError::Invariant(format!("unknown job id {job_id} reaped")))?;
        table.jobs_issued -= 1;
        Ok(file)
    }

    pub fn has_job(&self, job_id: u64) -> bool {
        self.table.lock().jobs.contains_key(&job_id)
    }

    /// The record file a known id was issued for.
    pub fn get_job(&self, job_id: u64) -> Option<PathBuf> {
        self.table.lock().jobs.get(&job_id).map(|(f, _)| f.clone())
    }

    /// Every id currently issued and not yet reaped.
    pub fn job_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.table.lock().jobs.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Number of jobs issued and not yet removed.
    pub fn jobs_issued(&self) -> usize {
        self.table.lock().jobs_issued
    }
}

#[cfg(test)]
#[path = "batcher_tests.rs"]
mod tests;
