// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The controller main loop.
//!
//! Owns the work set of record files needing attention and advances each
//! record by its colour: grey records are issued, black ones materialise
//! children / re-dispatch follow-ons / die into their parent, red ones
//! are retried while their budget lasts. When the work set drains, the
//! loop blocks (bounded) on the next backend completion; when both the
//! work set and the issued table are empty, the tree is done. Every disk
//! mutation goes through the durable store, so the controller can be
//! killed at any point and re-run.

use crate::batcher::{JobBatcher, WorkerCommand};
use crate::error::EngineError;
use crate::finish::process_finished_job;
use crate::rescue::{self, RescueState};
use arbor_batch::BatchSystem;
use arbor_core::{Colour, JobRecord, TreeConfig};
use arbor_storage::{recovery, store, TreeLayout};
use std::collections::BTreeSet;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Bounded wait for the next backend completion.
const REAP_TIMEOUT: Duration = Duration::from_secs(10);

/// Run the controller over the tree at `tree_root` until nothing is left
/// to do. Returns the number of records left behind: zero on full
/// success, otherwise the permanently failed records and their abandoned
/// ancestors.
pub fn main_loop(
    tree_root: &Path,
    config: &TreeConfig,
    backend: &dyn BatchSystem,
) -> Result<usize, EngineError> {
    if !backend.issued_job_ids()?.is_empty() {
        return Err(EngineError::Invariant(
            "backend must start with no issued jobs".to_string(),
        ));
    }

    let layout = TreeLayout::from_config(config);
    layout.ensure()?;

    let recovered = recovery::recover(&layout, config.retry_count)?;
    info!(
        records = recovered.records.len(),
        active = recovered.work_set.len(),
        "recovered job tree"
    );

    let worker = WorkerCommand::resolve(config, tree_root);
    let batcher = JobBatcher::new(backend, worker);
    let started = Instant::now();

    let mut controller = Controller {
        config,
        layout,
        backend,
        batcher,
        work_set: recovered.work_set.into_iter().collect(),
        total_records: recovered.records.len(),
        rescue_state: RescueState::new(),
        next_rescue: Instant::now() + sweep_delay(config.rescue_jobs_frequency),
    };

    loop {
        controller.process_work_set()?;

        if controller.work_set.is_empty() {
            if controller.batcher.jobs_issued() == 0 {
                info!(
                    remaining = controller.total_records,
                    "only failed records and their dependents remain, exiting"
                );
                break;
            }
            controller.reap()?;
        }

        controller.maybe_rescue()?;
    }

    if let Some(stats_path) = &config.stats {
        let total = serde_json::json!({ "total_wall_seconds": started.elapsed().as_secs_f64() });
        append_line(stats_path, &total.to_string())?;
    }

    Ok(controller.total_records)
}

fn sweep_delay(seconds: f64) -> Duration {
    if seconds.is_finite() && seconds >= 0.0 {
        Duration::from_secs_f64(seconds)
    } else {
        Duration::from_secs(3600)
    }
}

struct Controller<'a> {
    config: &'a TreeConfig,
    layout: TreeLayout,
    backend: &'a dyn BatchSystem,
    batcher: JobBatcher<'a>,
    work_set: BTreeSet<PathBuf>,
    total_records: usize,
    rescue_state: RescueState,
    next_rescue: Instant,
}

impl Controller<'_> {
    fn process_work_set(&mut self) -> Result<(), EngineError> {
        let snapshot: Vec<PathBuf> = self.work_set.iter().cloned().collect();
        if !snapshot.is_empty() {
            debug!(
                records = self.total_records,
                active = snapshot.len(),
                issued = self.batcher.jobs_issued(),
                "processing work set"
            );
        }
        for file in snapshot {
            let record = store::read_record(&file)?;
            self.ensure_support_files(&record)?;
            match record.colour {
                Colour::Grey => self.reissue(record)?,
                Colour::Black => self.finish_black(record)?,
                Colour::Red => self.retry_or_abandon(record)?,
                Colour::Dead => {
                    // Seen only after recovery: the parent was notified in
                    // the same commit that coloured it dead.
                    debug!(file = %file.display(), "deleting dead record");
                    self.delete(record)?;
                }
                Colour::Blue => {
                    return Err(EngineError::Invariant(format!(
                        "blue record {} in the work set",
                        file.display()
                    )));
                }
            }
        }
        Ok(())
    }

    /// The per-job files must exist through a record's whole life for the
    /// tree's bookkeeping to stay consistent; recreate any that vanished.
    fn ensure_support_files(&self, record: &JobRecord) -> Result<(), EngineError> {
        let mut files = vec![&record.log_file, &record.worker_log_file];
        if let Some(stats_file) = &record.stats_file {
            files.push(stats_file);
        }
        for file in files {
            if !file.is_file() {
                warn!(
                    file = %file.display(),
                    record = %record.file.display(),
                    "support file had disappeared, recreating it"
                );
                std::fs::write(file, b"")?;
            }
        }
        Ok(())
    }

    /// Dispatch a grey record and drop it from the work set until a
    /// completion or rescue brings it back.
    fn reissue(&mut self, record: JobRecord) -> Result<(), EngineError> {
        if record.colour != Colour::Grey {
            return Err(EngineError::Invariant(format!(
                "reissuing record {} with colour {}",
                record.file.display(),
                record.colour
            )));
        }
        // Fresh logs for the fresh attempt.
        std::fs::write(&record.log_file, b"")?;
        std::fs::write(&record.worker_log_file, b"")?;
        self.batcher.issue_job(&record)?;
        self.work_set.remove(&record.file);
        Ok(())
    }

    fn finish_black(&mut self, mut record: JobRecord) -> Result<(), EngineError> {
        debug!(file = %record.file.display(), "job finished okay");
        if record.report_all_job_logs {
            self.report_job_logs(&record);
        }
        if self.config.stats.is_some() {
            self.fold_stats(&record)?;
        }
        if record.child_count != record.black_child_count {
            return Err(EngineError::Invariant(format!(
                "black record {} has running children ({} of {})",
                record.file.display(),
                record.black_child_count,
                record.child_count
            )));
        }

        let children = record.take_children();
        if !children.is_empty() {
            // Materialise the whole batch in one commit: the parent's
            // blue transition and every child record stand or fall
            // together.
            debug!(
                file = %record.file.display(),
                children = children.len(),
                "materialising children"
            );
            let mut child_records = Vec::with_capacity(children.len());
            for task in children {
                child_records.push(self.layout.create_record(
                    self.config,
                    task,
                    Some(record.file.clone()),
                )?);
            }
            record.child_count += child_records.len() as u32;
            record.colour = Colour::Blue;
            let mut batch: Vec<&JobRecord> = vec![&record];
            batch.extend(child_records.iter());
            store::write_records(&batch)?;
            self.total_records += child_records.len();
            self.work_set.remove(&record.file);
            self.batcher.issue_jobs(&child_records)?;
        } else if !record.follow_ons.is_empty() {
            debug!(file = %record.file.display(), "dispatching the next follow-on");
            record.remaining_retry_count = self.config.retry_count;
            record.colour = Colour::Grey;
            store::write_record(&record)?;
            self.reissue(record)?;
        } else {
            debug!(file = %record.file.display(), "record is dead");
            record.colour = Colour::Dead;
            if let Some(parent_file) = record.parent.clone() {
                if parent_file == record.file {
                    return Err(EngineError::Invariant(format!(
                        "record {} is its own parent",
                        record.file.display()
                    )));
                }
                let mut parent = store::read_record(&parent_file)?;
                if parent.colour != Colour::Blue {
                    return Err(EngineError::Invariant(format!(
                        "parent {} of a dying child is {}, not blue",
                        parent_file.display(),
                        parent.colour
                    )));
                }
                if parent.black_child_count >= parent.child_count {
                    return Err(EngineError::Invariant(format!(
                        "parent {} already has all children accounted for",
                        parent_file.display()
                    )));
                }
                parent.black_child_count += 1;
                if parent.black_child_count == parent.child_count {
                    parent.colour = Colour::Black;
                    if !self.work_set.insert(parent_file.clone()) {
                        return Err(EngineError::Invariant(format!(
                            "parent {} was already in the work set",
                            parent_file.display()
                        )));
                    }
                }
                store::write_records(&[&record, &parent])?;
            }
            self.delete(record)?;
        }
        Ok(())
    }

    fn retry_or_abandon(&mut self, mut record: JobRecord) -> Result<(), EngineError> {
        warn!(file = %record.file.display(), "job failed");
        if !record.children.is_empty() || record.child_count != record.black_child_count {
            return Err(EngineError::Invariant(format!(
                "failed record {} has child bookkeeping in flight",
                record.file.display()
            )));
        }

        if record.remaining_retry_count > 0 {
            record.remaining_retry_count -= 1;
            record.colour = Colour::Grey;
            store::write_record(&record)?;
            warn!(
                file = %record.file.display(),
                retries_left = record.remaining_retry_count,
                "restarting failed job"
            );
            self.reissue(record)?;
        } else {
            // Permanent failure: surface both logs once, keep the record,
            // stop touching it.
            self.report_job_logs(&record);
            self.work_set.remove(&record.file);
            warn!(file = %record.file.display(), "job completely failed");
        }
        Ok(())
    }

    fn delete(&mut self, record: JobRecord) -> Result<(), EngineError> {
        self.work_set.remove(&record.file);
        self.total_records -= 1;
        self.layout.delete_record(&record)?;
        Ok(())
    }

    fn reap(&mut self) -> Result<(), EngineError> {
        if let Some((job_id, exit_status)) = self.backend.updated_job(REAP_TIMEOUT)? {
            if self.batcher.has_job(job_id) {
                if exit_status == 0 {
                    debug!(job_id, "backend reports success");
                } else {
                    warn!(job_id, exit_status, "backend reports failure");
                }
                process_finished_job(&self.batcher, &mut self.work_set, job_id, exit_status)?;
            } else {
                info!(job_id, "completion for an already processed job");
            }
        }
        Ok(())
    }

    fn maybe_rescue(&mut self) -> Result<(), EngineError> {
        if Instant::now() < self.next_rescue {
            return Ok(());
        }

        rescue::rescue_over_long_jobs(&self.batcher, &mut self.work_set, self.backend, self.config)?;
        let none_missing = rescue::rescue_missing_jobs(
            &mut self.rescue_state,
            &self.batcher,
            &mut self.work_set,
            self.backend,
        )?;

        // While jobs are unaccounted for, sweep again soon instead of
        // waiting out the full period.
        let delay = if none_missing {
            self.config.rescue_jobs_frequency
        } else {
            self.config.missing_job_rescue_delay
        };
        self.next_rescue = Instant::now() + sweep_delay(delay);
        Ok(())
    }

    /// Surface a record's logs through the controller's own log.
    fn report_job_logs(&self, record: &JobRecord) {
        for (label, path) in [
            ("job log", &record.log_file),
            ("worker log", &record.worker_log_file),
        ] {
            match std::fs::read_to_string(path) {
                Ok(text) if !text.trim().is_empty() => {
                    warn!(file = %path.display(), "{label}:\n{}", text.trim_end());
                }
                Ok(_) => {}
                Err(e) => warn!(file = %path.display(), error = %e, "{label} unreadable"),
            }
        }
    }

    /// Append the job's stats entries to the aggregate file and reset the
    /// per-job stats file.
    fn fold_stats(&self, record: &JobRecord) -> Result<(), EngineError> {
        let (Some(aggregate), Some(stats_file)) = (&self.config.stats, &record.stats_file) else {
            return Ok(());
        };
        if stats_file.is_file() {
            let text = std::fs::read_to_string(stats_file)?;
            if !text.trim().is_empty() {
                append_line(aggregate, text.trim())?;
            }
            std::fs::write(stats_file, b"")?;
        }
        Ok(())
    }
}

fn append_line(path: &Path, line: &str) -> Result<(), EngineError> {
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    writeln!(file, "{line}")?;
    Ok(())
}

#[cfg(test)]
#[path = "controller_tests.rs"]
mod tests;
