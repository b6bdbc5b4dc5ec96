// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The finish protocol: reconciling a reaped `(job id, exit status)` with
//! whatever the worker left on disk.
//!
//! The worker writes its record through the durable store, so the marker
//! and shadow files beside the canonical record tell the controller
//! exactly how far a crashed worker got. A partial write is downgraded to
//! an ordinary transient failure: the record is forced red and retried.

use crate::batcher::JobBatcher;
use crate::error::EngineError;
use arbor_core::{Colour, JobRecord};
use arbor_storage::store;
use std::collections::BTreeSet;
use std::path::PathBuf;
use tracing::{debug, warn};

/// Process one completion and add the record to the work set.
pub fn process_finished_job(
    batcher: &JobBatcher<'_>,
    work_set: &mut BTreeSet<PathBuf>,
    job_id: u64,
    exit_status: i32,
) -> Result<(), EngineError> {
    let file = batcher.remove_job_id(job_id)?;

    let marker = store::updating_path(&file);
    let shadow = store::new_path(&file);
    let marker_present = marker.is_file();
    let shadow_present = shadow.is_file();

    if exit_status == 0 && marker_present {
        warn!(file = %file.display(), "backend claims success but an .updating marker is present");
    }
    if exit_status == 0 && shadow_present {
        warn!(file = %file.display(), "backend claims success but a .new shadow is present");
    }

    if exit_status != 0 || marker_present || shadow_present {
        if marker_present {
            // The worker died mid-commit: discard the incomplete shadow,
            // then the marker, and fail the surviving canonical record.
            warn!(file = %file.display(), "worker crashed while updating its record");
            if shadow_present {
                std::fs::remove_file(&shadow)?;
            }
            std::fs::remove_file(&marker)?;
            let mut record = store::read_record(&file)?;
            check_quiescent(&record)?;
            record.colour = Colour::Red;
            store::write_record(&record)?;
        } else if shadow_present {
            // Committed but never renamed: promote the shadow, then judge
            // the colour it carries.
            warn!(file = %file.display(), "promoting the worker's committed record");
            if file.is_file() {
                std::fs::remove_file(&file)?;
            }
            std::fs::rename(&shadow, &file)?;
            let mut record = store::read_record(&file)?;
            if record.colour == Colour::Grey {
                // The worker died preparing its next chained follow-on;
                // nothing completed since the last checkpoint.
                check_quiescent(&record)?;
                record.colour = Colour::Red;
                store::write_record(&record)?;
            } else if record.colour != Colour::Black && record.colour != Colour::Red {
                return Err(EngineError::Invariant(format!(
                    "record {} promoted to unexpected colour {}",
                    file.display(),
                    record.colour
                )));
            }
        } else {
            let mut record = store::read_record(&file)?;
            if record.colour == Colour::Black {
                warn!(
                    file = %file.display(),
                    "backend reports failure but the job completed; keeping the result"
                );
            } else {
                if record.colour != Colour::Grey && record.colour != Colour::Red {
                    return Err(EngineError::Invariant(format!(
                        "failed record {} has illegal colour {}",
                        file.display(),
                        record.colour
                    )));
                }
                check_quiescent(&record)?;
                if record.colour == Colour::Grey {
                    record.colour = Colour::Red;
                    store::write_record(&record)?;
                }
                warn!(file = %file.display(), "job failed, record marked red");
            }
        }
    }

    if !work_set.insert(file.clone()) {
        return Err(EngineError::Invariant(format!(
            "record {} finished twice in one pass",
            file.display()
        )));
    }
    debug!(file = %file.display(), "added finished job to the work set");
    Ok(())
}

/// A record recovered from a crashed worker must not reflect an end state:
/// no pending children, all spawned children accounted for.
fn check_quiescent(record: &JobRecord) -> Result<(), EngineError> {
    if !record.children.is_empty() {
        return Err(EngineError::Invariant(format!(
            "crashed record {} has pending children",
            record.file.display()
        )));
    }
    if record.child_count != record.black_child_count {
        return Err(EngineError::Invariant(format!(
            "crashed record {} has unaccounted children ({} of {})",
            record.file.display(),
            record.black_child_count,
            record.child_count
        )));
    }
    Ok(())
}

#[cfg(test)]
#[path = "finish_tests.rs"]
mod tests;
