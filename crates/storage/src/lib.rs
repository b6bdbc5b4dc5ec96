// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::unwrap_used))]

//! arbor-storage: the on-disk job tree.
//!
//! Three pieces: the directory layout of a tree (`layout`), the atomic
//! multi-record commit protocol (`store`), and the start-up repair pass
//! that makes the whole system crash-only (`recovery`).

pub mod layout;
pub mod recovery;
pub mod store;

pub use layout::{TreeLayout, RECORD_FILE_NAME, STATS_FILE_NAME};
pub use recovery::{recover, RecoveredTree, RecoveryError};
pub use store::{
    new_path, read_record, read_record_with, updating_path, write_record, write_records,
    write_records_with, FsStoreIo, StoreError, StoreIo,
};
