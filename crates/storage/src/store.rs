// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Atomic multi-record commits via an `.updating` marker and `.new`
//! shadow files.
//!
//! The protocol for writing a set of records:
//!
//! 1. Create `first.file + ".updating"` holding the space-separated list
//!    of every shadow path. Its existence marks an update in flight.
//! 2. Write each record's full serialization to `record.file + ".new"`.
//! 3. Remove the marker; the shadows now represent the valid state.
//! 4. Rename each shadow over its canonical file.
//!
//! A crash before step 3 leaves the originals authoritative (the shadows
//! are garbage); a crash after it is a committed update whose remaining
//! shadows the recovery pass promotes. All transitions for a single record
//! are totally ordered by the rename in step 4.

use arbor_core::JobRecord;
use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors from the durable store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("update already in flight: marker {0} exists")]
    MarkerExists(PathBuf),
    #[error("stale shadow file {0} exists")]
    ShadowExists(PathBuf),
    #[error("record {0} appears twice in one commit")]
    DuplicateRecord(PathBuf),
}

/// Path of the in-flight marker for a record file.
pub fn updating_path(file: &Path) -> PathBuf {
    append_suffix(file, ".updating")
}

/// Path of the shadow file for a record file.
pub fn new_path(file: &Path) -> PathBuf {
    append_suffix(file, ".new")
}

fn append_suffix(file: &Path, suffix: &str) -> PathBuf {
    let mut s = OsString::from(file.as_os_str());
    s.push(suffix);
    PathBuf::from(s)
}

/// Filesystem operations used by the commit protocol.
///
/// Abstracted so tests can inject a crash at any protocol step and verify
/// that recovery restores either the pre- or post-update state.
pub trait StoreIo {
    fn write(&self, path: &Path, data: &[u8]) -> io::Result<()>;
    fn read(&self, path: &Path) -> io::Result<Vec<u8>>;
    fn remove(&self, path: &Path) -> io::Result<()>;
    fn rename(&self, from: &Path, to: &Path) -> io::Result<()>;
    fn exists(&self, path: &Path) -> bool;
}

/// Production store I/O over the real filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct FsStoreIo;

impl StoreIo for FsStoreIo {
    fn write(&self, path: &Path, data: &[u8]) -> io::Result<()> {
        std::fs::write(path, data)
    }

    fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        std::fs::read(path)
    }

    fn remove(&self, path: &Path) -> io::Result<()> {
        std::fs::remove_file(path)
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        std::fs::rename(from, to)
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }
}

/// Durably write a set of records as one atomic transition.
///
/// Either every record in the set reaches its new state or, after the
/// recovery pass, none of them do.
pub fn write_records_with<I: StoreIo>(io: &I, records: &[&JobRecord]) -> Result<(), StoreError> {
    if records.is_empty() {
        return Ok(());
    }
    for (i, record) in records.iter().enumerate() {
        if records[..i].iter().any(|r| r.file == record.file) {
            return Err(StoreError::DuplicateRecord(record.file.clone()));
        }
    }

    let marker = updating_path(&records[0].file);
    if io.exists(&marker) {
        return Err(StoreError::MarkerExists(marker));
    }

    let shadows: Vec<PathBuf> = records.iter().map(|r| new_path(&r.file)).collect();
    let payload = shadows
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(" ");
    io.write(&marker, payload.as_bytes())?;

    for (record, shadow) in records.iter().zip(&shadows) {
        if io.exists(shadow) {
            return Err(StoreError::ShadowExists(shadow.clone()));
        }
        let data = serde_json::to_vec_pretty(record)?;
        io.write(shadow, &data)?;
    }

    // The marker's removal is the commit point: from here the shadows are
    // the valid state.
    io.remove(&marker)?;

    for (record, shadow) in records.iter().zip(&shadows) {
        if io.exists(&record.file) {
            io.remove(&record.file)?;
        }
        io.rename(shadow, &record.file)?;
    }

    Ok(())
}

/// [`write_records_with`] over the real filesystem.
pub fn write_records(records: &[&JobRecord]) -> Result<(), StoreError> {
    write_records_with(&FsStoreIo, records)
}

/// Durably write a single record (same protocol, marker included).
pub fn write_record(record: &JobRecord) -> Result<(), StoreError> {
    write_records(&[record])
}

/// Read the canonical serialization of a record.
pub fn read_record_with<I: StoreIo>(io: &I, path: &Path) -> Result<JobRecord, StoreError> {
    let data = io.read(path)?;
    Ok(serde_json::from_slice(&data)?)
}

/// [`read_record_with`] over the real filesystem.
pub fn read_record(path: &Path) -> Result<JobRecord, StoreError> {
    read_record_with(&FsStoreIo, path)
}

#[cfg(test)]
#[path = "store_tests.rs"]
mod tests;
