// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Worker log maintenance.

use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

/// Truncate a file larger than `max_bytes` to its trailing `max_bytes`.
/// Shorter files are untouched.
pub fn truncate_to_tail(path: &Path, max_bytes: u64) -> io::Result<()> {
    let len = std::fs::metadata(path)?.len();
    if len <= max_bytes {
        return Ok(());
    }

    let mut file = std::fs::OpenOptions::new().read(true).write(true).open(path)?;
    let offset = i64::try_from(max_bytes).unwrap_or(i64::MAX);
    file.seek(SeekFrom::End(-offset))?;
    let mut tail = Vec::with_capacity(max_bytes as usize);
    file.read_to_end(&mut tail)?;
    file.seek(SeekFrom::Start(0))?;
    file.write_all(&tail)?;
    file.set_len(tail.len() as u64)?;
    Ok(())
}

#[cfg(test)]
#[path = "logs_tests.rs"]
mod tests;
