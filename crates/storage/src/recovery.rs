// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Start-up repair of the record directory.
//!
//! Runs once before the controller's first iteration and restores the
//! invariant that every record file is canonical-only: interrupted commits
//! (marker still present) are voided, committed ones (shadows without a
//! marker) are promoted. Idempotent: running it twice is the same as
//! running it once.

use crate::store::{self, StoreError};
use crate::TreeLayout;
use arbor_core::{Colour, JobRecord};
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

/// Errors from the recovery pass.
#[derive(Debug, Error)]
pub enum RecoveryError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Result of the recovery pass.
#[derive(Debug)]
pub struct RecoveredTree {
    /// Every surviving record, loaded and repaired.
    pub records: Vec<JobRecord>,
    /// Files of the records needing controller attention (colour is not
    /// blue; blue records are driven to black by their children).
    pub work_set: Vec<PathBuf>,
}

/// Repair the tree and seed the controller's work set.
///
/// `retry_count` is the configured budget restored to every record.
pub fn recover(layout: &TreeLayout, retry_count: u32) -> Result<RecoveredTree, RecoveryError> {
    let (markers, mut shadows) = scan(layout.job_dir())?;

    // Void interrupted commits: the marker lists the shadows that were
    // being written; the canonical files remain authoritative.
    for marker in &markers {
        let payload = String::from_utf8_lossy(&std::fs::read(marker)?).into_owned();
        for referenced in payload.split_whitespace() {
            let shadow = Path::new(referenced);
            if shadow.is_file() {
                warn!(shadow = %shadow.display(), "discarding interrupted shadow");
                std::fs::remove_file(shadow)?;
            }
            shadows.retain(|p| p != shadow);
        }
        std::fs::remove_file(marker)?;
        info!(marker = %marker.display(), "voided interrupted commit");
    }

    // Promote committed shadows that never got renamed.
    for shadow in &shadows {
        let canonical = strip_suffix(shadow, ".new");
        warn!(
            file = %canonical.display(),
            "promoting committed shadow over canonical file"
        );
        if canonical.is_file() {
            std::fs::remove_file(&canonical)?;
        }
        std::fs::rename(shadow, &canonical)?;
    }

    // Reload every surviving record, restore its retry budget, and demote
    // failures so they are retried.
    let mut records = Vec::new();
    let mut work_set = Vec::new();
    for file in layout.record_files()? {
        let mut record = store::read_record(&file)?;
        let mut mutated = false;
        if record.remaining_retry_count != retry_count {
            record.remaining_retry_count = retry_count;
            mutated = true;
        }
        if record.colour == Colour::Red {
            info!(file = %file.display(), "resuming failed record");
            record.colour = Colour::Grey;
            mutated = true;
        }
        if mutated {
            store::write_record(&record)?;
        }
        if record.colour != Colour::Blue {
            work_set.push(file);
        }
        records.push(record);
    }

    Ok(RecoveredTree { records, work_set })
}

/// Collect every `.updating` marker and `.new` shadow under the job
/// directory.
fn scan(job_dir: &Path) -> io::Result<(Vec<PathBuf>, Vec<PathBuf>)> {
    let mut markers = Vec::new();
    let mut shadows = Vec::new();
    if !job_dir.is_dir() {
        return Ok((markers, shadows));
    }
    for entry in std::fs::read_dir(job_dir)? {
        let dir = entry?.path();
        if !dir.is_dir() {
            continue;
        }
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            let name = path.to_string_lossy().into_owned();
            if name.ends_with(".updating") {
                markers.push(path);
            } else if name.ends_with(".new") {
                shadows.push(path);
            }
        }
    }
    markers.sort();
    shadows.sort();
    Ok((markers, shadows))
}

fn strip_suffix(path: &Path, suffix: &str) -> PathBuf {
    let s = path.to_string_lossy();
    PathBuf::from(s.strip_suffix(suffix).unwrap_or(&s).to_string())
}

#[cfg(test)]
#[path = "recovery_tests.rs"]
mod tests;
