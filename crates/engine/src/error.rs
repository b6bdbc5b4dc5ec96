// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Controller error type.

use arbor_batch::BatchError;
use arbor_core::ConfigError;
use arbor_storage::{RecoveryError, StoreError};
use thiserror::Error;

/// Errors that abort the controller.
///
/// `Invariant` marks a broken internal assumption (unknown id reaped,
/// child counts disagreeing, an illegal colour transition). The loop stops
/// and leaves the tree on disk for the recovery pass of the next run,
/// which succeeds, because every mutation went through the durable store.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Recovery(#[from] RecoveryError),
    #[error(transparent)]
    Batch(#[from] BatchError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invariant violated: {0}")]
    Invariant(String),
}
