// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Fake batch backend for deterministic testing.
#![cfg_attr(coverage_nightly, coverage(off))]

use crate::{BatchError, BatchSystem};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Recorded call to [`FakeBatch`].
#[derive(Debug, Clone)]
pub enum BatchCall {
    Issue {
        id: u64,
        command: String,
        memory: u64,
        cpu: u32,
    },
    Kill {
        ids: Vec<u64>,
    },
}

/// Runs an issued command in-process and returns its exit status.
pub type JobRunner = Arc<dyn Fn(&str) -> i32 + Send + Sync>;

#[derive(Default)]
struct FakeState {
    next_id: u64,
    issued: BTreeSet<u64>,
    lost: BTreeSet<u64>,
    lose_next: bool,
    completions: VecDeque<(u64, i32)>,
    calls: Vec<BatchCall>,
    runner: Option<JobRunner>,
    elapsed: HashMap<u64, f64>,
    killed: Vec<u64>,
}

/// Scriptable [`BatchSystem`] that records every call.
///
/// With a runner installed, each issued command executes synchronously and
/// its exit status is queued as a completion, so a controller loop under
/// test drives real work without processes. `lose_next_job` makes the next
/// issued id vanish from `issued_job_ids`, exercising the missing-job
/// rescue path.
#[derive(Clone, Default)]
pub struct FakeBatch {
    inner: Arc<Mutex<FakeState>>,
}

impl FakeBatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install an in-process runner for issued commands.
    pub fn with_runner<F>(self, runner: F) -> Self
    where
        F: Fn(&str) -> i32 + Send + Sync + 'static,
    {
        self.inner.lock().runner = Some(Arc::new(runner));
        self
    }

    /// Queue a completion directly.
    pub fn push_completion(&self, id: u64, status: i32) {
        self.inner.lock().completions.push_back((id, status));
    }

    /// The next issued job is silently dropped by the "backend": it never
    /// runs, never completes, and is absent from `issued_job_ids`.
    pub fn lose_next_job(&self) {
        self.inner.lock().lose_next = true;
    }

    /// Report an elapsed runtime for an id (for over-long rescue tests).
    pub fn set_elapsed(&self, id: u64, seconds: f64) {
        self.inner.lock().elapsed.insert(id, seconds);
    }

    pub fn calls(&self) -> Vec<BatchCall> {
        self.inner.lock().calls.clone()
    }

    pub fn killed(&self) -> Vec<u64> {
        self.inner.lock().killed.clone()
    }

    /// Commands of every `issue_job` call, in order.
    pub fn issued_commands(&self) -> Vec<String> {
        self.inner
            .lock()
            .calls
            .iter()
            .filter_map(|c| match c {
                BatchCall::Issue { command, .. } => Some(command.clone()),
                BatchCall::Kill { .. } => None,
            })
            .collect()
    }
}

impl BatchSystem for FakeBatch {
    fn issue_job(
        &self,
        command: &str,
        memory: u64,
        cpu: u32,
        _worker_log: &Path,
    ) -> Result<u64, BatchError> {
        let (id, runner) = {
            let mut state = self.inner.lock();
            state.next_id += 1;
            let id = state.next_id;
            state.calls.push(BatchCall::Issue {
                id,
                command: command.to_string(),
                memory,
                cpu,
            });
            state.issued.insert(id);
            if state.lose_next {
                state.lose_next = false;
                state.lost.insert(id);
                (id, None)
            } else {
                (id, state.runner.clone())
            }
        };

        // Run outside the lock: the runner may re-enter the fake.
        if let Some(runner) = runner {
            let status = runner(command);
            self.inner.lock().completions.push_back((id, status));
        }
        Ok(id)
    }

    fn kill_jobs(&self, ids: &[u64]) -> Result<(), BatchError> {
        let mut state = self.inner.lock();
        state.calls.push(BatchCall::Kill { ids: ids.to_vec() });
        for id in ids {
            state.issued.remove(id);
            state.lost.remove(id);
            state.killed.push(*id);
        }
        Ok(())
    }

    fn issued_job_ids(&self) -> Result<Vec<u64>, BatchError> {
        let state = self.inner.lock();
        Ok(state
            .issued
            .iter()
            .filter(|id| !state.lost.contains(id))
            .copied()
            .collect())
    }

    fn running_job_ids(&self) -> Result<HashMap<u64, f64>, BatchError> {
        let state = self.inner.lock();
        Ok(state
            .elapsed
            .iter()
            .filter(|(id, _)| state.issued.contains(*id))
            .map(|(id, secs)| (*id, *secs))
            .collect())
    }

    fn updated_job(&self, _timeout: Duration) -> Result<Option<(u64, i32)>, BatchError> {
        let mut state = self.inner.lock();
        if let Some((id, status)) = state.completions.pop_front() {
            state.issued.remove(&id);
            return Ok(Some((id, status)));
        }
        Ok(None)
    }
}

#[cfg(test)]
#[path = "fake_tests.rs"]
mod tests;
