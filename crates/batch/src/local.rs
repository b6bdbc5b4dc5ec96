// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Local process-pool backend.
//!
//! Jobs run as `sh -c` children with stdout and stderr appended to their
//! worker log. At most `max_jobs` children run at once; the rest queue.
//! Each running child has a reaper thread polling `try_wait`, feeding the
//! completion channel that `updated_job` drains.

use crate::{BatchError, BatchSystem};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Reaper poll interval.
const REAP_POLL: Duration = Duration::from_millis(25);

struct RunningJob {
    child: Child,
    started: Instant,
}

struct PendingJob {
    id: u64,
    command: String,
    worker_log: PathBuf,
}

#[derive(Default)]
struct PoolState {
    running: HashMap<u64, RunningJob>,
    pending: VecDeque<PendingJob>,
}

/// Bounded local process pool implementing [`BatchSystem`].
pub struct LocalBatch {
    state: Arc<Mutex<PoolState>>,
    completions_rx: Mutex<mpsc::Receiver<(u64, i32)>>,
    completions_tx: mpsc::Sender<(u64, i32)>,
    max_jobs: usize,
    next_id: AtomicU64,
}

impl LocalBatch {
    pub fn new(max_jobs: usize) -> Self {
        let (tx, rx) = mpsc::channel();
        Self {
            state: Arc::new(Mutex::new(PoolState::default())),
            completions_rx: Mutex::new(rx),
            completions_tx: tx,
            max_jobs: max_jobs.max(1),
            next_id: AtomicU64::new(1),
        }
    }
}

impl BatchSystem for LocalBatch {
    fn issue_job(
        &self,
        command: &str,
        _memory: u64,
        _cpu: u32,
        worker_log: &Path,
    ) -> Result<u64, BatchError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let job = PendingJob {
            id,
            command: command.to_string(),
            worker_log: worker_log.to_path_buf(),
        };
        let mut state = self.state.lock();
        if state.running.len() < self.max_jobs {
            start_job(&self.state, &self.completions_tx, &mut state, job)?;
        } else {
            state.pending.push_back(job);
        }
        debug!(id, command, "issued local job");
        Ok(id)
    }

    fn kill_jobs(&self, ids: &[u64]) -> Result<(), BatchError> {
        let mut state = self.state.lock();
        for id in ids {
            if let Some(job) = state.running.get_mut(id) {
                // The reaper thread observes the death and reports it.
                if let Err(e) = job.child.kill() {
                    warn!(id, error = %e, "failed to kill local job");
                }
            } else if let Some(pos) = state.pending.iter().position(|p| p.id == *id) {
                state.pending.remove(pos);
                let _ = self.completions_tx.send((*id, 1));
            }
        }
        Ok(())
    }

    fn issued_job_ids(&self) -> Result<Vec<u64>, BatchError> {
        let state = self.state.lock();
        let mut ids: Vec<u64> = state.running.keys().copied().collect();
        ids.extend(state.pending.iter().map(|p| p.id));
        ids.sort_unstable();
        Ok(ids)
    }

    fn running_job_ids(&self) -> Result<HashMap<u64, f64>, BatchError> {
        let state = self.state.lock();
        Ok(state
            .running
            .iter()
            .map(|(id, job)| (*id, job.started.elapsed().as_secs_f64()))
            .collect())
    }

    fn updated_job(&self, timeout: Duration) -> Result<Option<(u64, i32)>, BatchError> {
        let rx = self.completions_rx.lock();
        match rx.recv_timeout(timeout) {
            Ok(update) => Ok(Some(update)),
            Err(mpsc::RecvTimeoutError::Timeout) => Ok(None),
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(BatchError::Closed),
        }
    }
}

/// Spawn the child for `job` and its reaper thread. Callers hold the pool
/// lock via `state`.
fn start_job(
    pool: &Arc<Mutex<PoolState>>,
    tx: &mpsc::Sender<(u64, i32)>,
    state: &mut PoolState,
    job: PendingJob,
) -> Result<(), BatchError> {
    let log = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&job.worker_log)?;
    let err_log = log.try_clone()?;
    let child = Command::new("sh")
        .arg("-c")
        .arg(&job.command)
        .stdin(Stdio::null())
        .stdout(Stdio::from(log))
        .stderr(Stdio::from(err_log))
        .spawn()?;

    let id = job.id;
    state.running.insert(
        id,
        RunningJob {
            child,
            started: Instant::now(),
        },
    );
    spawn_reaper(Arc::clone(pool), tx.clone(), id);
    Ok(())
}

fn spawn_reaper(pool: Arc<Mutex<PoolState>>, tx: mpsc::Sender<(u64, i32)>, id: u64) {
    std::thread::spawn(move || loop {
        let code = {
            let mut state = pool.lock();
            let Some(job) = state.running.get_mut(&id) else {
                return;
            };
            match job.child.try_wait() {
                Ok(Some(status)) => Some(status.code().unwrap_or(1)),
                Ok(None) => None,
                Err(e) => {
                    warn!(id, error = %e, "failed to reap local job");
                    Some(1)
                }
            }
        };

        if let Some(code) = code {
            // Free the slot, then start the next queued job if any.
            let next = {
                let mut state = pool.lock();
                state.running.remove(&id);
                state.pending.pop_front()
            };
            if let Some(job) = next {
                let next_id = job.id;
                let mut state = pool.lock();
                if let Err(e) = start_job(&pool, &tx, &mut state, job) {
                    warn!(id = next_id, error = %e, "failed to start queued job");
                    let _ = tx.send((next_id, 1));
                }
            }
            let _ = tx.send((id, code));
            return;
        }
        std::thread::sleep(REAP_POLL);
    });
}

#[cfg(test)]
#[path = "local_tests.rs"]
mod tests;
