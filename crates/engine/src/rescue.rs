// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Rescue sweeps: reclaiming runaway and backend-lost jobs.
//!
//! Two periodic checks. Over-long jobs are killed once their elapsed time
//! passes `max(max_job_duration, 10 * job_time)`, unless that threshold
//! is so large the sweep is pointless. Missing jobs are ids the batcher
//! knows but the backend no longer reports; after three consecutive
//! sweeps missing they are presumed lost, killed, and finished as
//! failures.

use crate::batcher::JobBatcher;
use crate::error::EngineError;
use crate::finish::process_finished_job;
use arbor_batch::BatchSystem;
use arbor_core::TreeConfig;
use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use tracing::{info, warn};

/// Consecutive sweeps an id may be missing before it is given up on.
pub const KILL_AFTER_N_TIMES_MISSING: u32 = 3;

/// Thresholds at or above this (~16 weeks) disable the over-long sweep.
const OVERLONG_SWEEP_CUTOFF: f64 = 10_000_000.0;

/// Per-id miss counters carried between sweeps.
#[derive(Debug, Default)]
pub struct RescueState {
    missing: HashMap<u64, u32>,
}

impl RescueState {
    pub fn new() -> Self {
        Self::default()
    }

    /// True while some known id is still unaccounted for.
    pub fn has_missing(&self) -> bool {
        !self.missing.is_empty()
    }
}

/// Kill and finish every running job past the duration threshold.
pub fn rescue_over_long_jobs(
    batcher: &JobBatcher<'_>,
    work_set: &mut BTreeSet<PathBuf>,
    backend: &dyn BatchSystem,
    config: &TreeConfig,
) -> Result<(), EngineError> {
    let mut threshold = config.max_job_duration;
    let floor = config.job_time * 10.0;
    if threshold < floor {
        info!(
            max_job_duration = config.max_job_duration,
            floor, "max job duration below 10x the job time, using the floor"
        );
        threshold = floor;
    }
    if threshold >= OVERLONG_SWEEP_CUTOFF {
        return Ok(());
    }

    for (job_id, elapsed) in backend.running_job_ids()? {
        if elapsed > threshold {
            warn!(
                job_id,
                elapsed, threshold, "job ran past the duration bound, killing it"
            );
            backend.kill_jobs(&[job_id])?;
            process_finished_job(batcher, work_set, job_id, 1)?;
        }
    }
    Ok(())
}

/// Track ids the backend has stopped reporting; give up on ids missing
/// for [`KILL_AFTER_N_TIMES_MISSING`] consecutive sweeps. Returns true
/// when no id is currently missing.
pub fn rescue_missing_jobs(
    state: &mut RescueState,
    batcher: &JobBatcher<'_>,
    work_set: &mut BTreeSet<PathBuf>,
    backend: &dyn BatchSystem,
) -> Result<bool, EngineError> {
    let issued: BTreeSet<u64> = backend.issued_job_ids()?.into_iter().collect();
    let known: BTreeSet<u64> = batcher.job_ids().into_iter().collect();

    // Forget counters for ids no longer ours.
    state.missing.retain(|id, _| known.contains(id));

    if !issued.is_subset(&known) {
        let strays: Vec<u64> = issued.difference(&known).copied().collect();
        return Err(EngineError::Invariant(format!(
            "backend reports jobs the batcher never issued: {strays:?}"
        )));
    }

    let missing_now: Vec<u64> = known.difference(&issued).copied().collect();
    for job_id in missing_now {
        let times = state.missing.entry(job_id).or_insert(0);
        *times += 1;
        warn!(
            job_id,
            times,
            file = ?batcher.get_job(job_id),
            "issued job is missing from the backend"
        );
        if *times == KILL_AFTER_N_TIMES_MISSING {
            state.missing.remove(&job_id);
            backend.kill_jobs(&[job_id])?;
            process_finished_job(batcher, work_set, job_id, 1)?;
        }
    }

    Ok(!state.has_missing())
}

#[cfg(test)]
#[path = "rescue_tests.rs"]
mod tests;
