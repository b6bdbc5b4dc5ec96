// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! arbor-batch: the batch-execution seam.
//!
//! The controller talks to whatever actually runs jobs (a cluster
//! scheduler, a grid engine, a local process pool) through the
//! [`BatchSystem`] trait. This crate ships the local pool and, behind the
//! `test-support` feature, a scriptable fake.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

pub mod local;

#[cfg(any(test, feature = "test-support"))]
pub mod fake;

pub use local::LocalBatch;

#[cfg(any(test, feature = "test-support"))]
pub use fake::{BatchCall, FakeBatch};

/// Errors surfaced by a batch backend.
#[derive(Debug, Error)]
pub enum BatchError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("batch backend error: {0}")]
    Backend(String),
    #[error("batch backend shut down")]
    Closed,
}

/// A batch-execution backend.
///
/// Implementations hand out integer job ids; the controller never
/// interprets them beyond equality. `updated_job` is the controller's only
/// blocking call and must honour its timeout.
pub trait BatchSystem: Send + Sync {
    /// Submit `command` with the given resource request; process output
    /// goes to `worker_log`. Returns the backend's id for the job.
    fn issue_job(
        &self,
        command: &str,
        memory: u64,
        cpu: u32,
        worker_log: &Path,
    ) -> Result<u64, BatchError>;

    /// Best-effort kill. Killed jobs surface like failed ones.
    fn kill_jobs(&self, ids: &[u64]) -> Result<(), BatchError>;

    /// Ids of every job the backend still knows about.
    fn issued_job_ids(&self) -> Result<Vec<u64>, BatchError>;

    /// Currently running ids mapped to elapsed wall-clock seconds.
    fn running_job_ids(&self) -> Result<HashMap<u64, f64>, BatchError>;

    /// Wait up to `timeout` for the next completion, as
    /// `(job id, exit status)`.
    fn updated_job(&self, timeout: Duration) -> Result<Option<(u64, i32)>, BatchError>;
}
