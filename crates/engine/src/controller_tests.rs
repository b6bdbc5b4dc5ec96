// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Controller loop tests against the fake backend, with a runner that
//! stands in for the worker harness: it pops the dispatched follow-on and
//! advances the record the way a worker would.

use super::*;
use arbor_batch::FakeBatch;
use arbor_core::TaskSpec;
use arbor_storage::TreeLayout;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tempfile::tempdir;

struct Fixture {
    _dir: tempfile::TempDir,
    root: PathBuf,
    config: TreeConfig,
    layout: TreeLayout,
}

fn fixture() -> Fixture {
    let dir = tempdir().unwrap();
    let root = dir.path().to_path_buf();
    let mut config = TreeConfig::new(&root);
    // Sweep every iteration so rescue paths are exercised promptly.
    config.rescue_jobs_frequency = 0.0;
    config.missing_job_rescue_delay = 0.0;
    let layout = TreeLayout::from_config(&config);
    layout.ensure().unwrap();
    Fixture {
        _dir: dir,
        root,
        config,
        layout,
    }
}

fn submit_root(fx: &Fixture, task: TaskSpec) -> JobRecord {
    let record = fx.layout.create_record(&fx.config, task, None).unwrap();
    store::write_record(&record).unwrap();
    record
}

/// Pull the record file out of a rendered worker invocation.
fn job_file(command: &str) -> PathBuf {
    let tail = command
        .split("--job")
        .nth(1)
        .unwrap_or_default()
        .trim()
        .trim_matches('\'');
    PathBuf::from(tail)
}

/// A worker stand-in that pops the top follow-on and goes black.
fn completing_runner(command: &str) -> i32 {
    let file = job_file(command);
    let mut record = store::read_record(&file).unwrap();
    let depth = record.follow_on_depth();
    record.remove_follow_on(depth - 1);
    record.colour = Colour::Black;
    store::write_record(&record).unwrap();
    0
}

#[test]
fn single_job_runs_to_completion() {
    let fx = fixture();
    let record = submit_root(&fx, TaskSpec::new("run", 1, 1));
    let fake = FakeBatch::new().with_runner(completing_runner);

    let remaining = main_loop(&fx.root, &fx.config, &fake).unwrap();
    assert_eq!(remaining, 0);
    assert_eq!(fake.issued_commands().len(), 1);
    // The record and its files are gone.
    assert!(!record.file.exists());
    assert!(!record.global_temp_dir.exists());
    assert!(!record.log_file.exists());
}

#[test]
fn failing_job_is_retried_until_it_succeeds() {
    let fx = fixture();
    let mut config = fx.config.clone();
    config.retry_count = 2;
    let record = fx
        .layout
        .create_record(&config, TaskSpec::new("flaky", 1, 1), None)
        .unwrap();
    store::write_record(&record).unwrap();

    let attempts = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&attempts);
    let fake = FakeBatch::new().with_runner(move |command| {
        if counter.fetch_add(1, Ordering::SeqCst) == 0 {
            // First attempt fails the way a worker would: record red.
            let file = job_file(command);
            let mut record = store::read_record(&file).unwrap();
            record.colour = Colour::Red;
            store::write_record(&record).unwrap();
            1
        } else {
            completing_runner(command)
        }
    });

    let remaining = main_loop(&fx.root, &config, &fake).unwrap();
    assert_eq!(remaining, 0);
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
}

#[test]
fn exhausted_retries_leave_the_red_record_behind() {
    let fx = fixture();
    let mut config = fx.config.clone();
    config.retry_count = 1;
    let record = fx
        .layout
        .create_record(&config, TaskSpec::new("doomed", 1, 1), None)
        .unwrap();
    store::write_record(&record).unwrap();

    let fake = FakeBatch::new().with_runner(|command| {
        let file = job_file(command);
        let mut record = store::read_record(&file).unwrap();
        record.colour = Colour::Red;
        store::write_record(&record).unwrap();
        1
    });

    let remaining = main_loop(&fx.root, &config, &fake).unwrap();
    assert_eq!(remaining, 1);
    // Two dispatches: the original and the one retry.
    assert_eq!(fake.issued_commands().len(), 2);
    let abandoned = store::read_record(&record.file).unwrap();
    assert_eq!(abandoned.colour, Colour::Red);
    assert_eq!(abandoned.remaining_retry_count, 0);
}

#[test]
fn branching_parent_waits_for_its_children() {
    let fx = fixture();
    submit_root(&fx, TaskSpec::new("spawn", 1, 1));

    let fake = FakeBatch::new().with_runner(|command| {
        let file = job_file(command);
        let mut record = store::read_record(&file).unwrap();
        let depth = record.follow_on_depth();
        let spawning = record
            .next_follow_on()
            .map(|t| t.command == "spawn")
            .unwrap_or(false);
        if spawning {
            record.add_child(TaskSpec::new("child-a", 1, 1));
            record.add_child(TaskSpec::new("child-b", 1, 1));
            record.push_follow_on(TaskSpec::stub(1, 1));
        }
        record.remove_follow_on(depth - 1);
        record.colour = Colour::Black;
        store::write_record(&record).unwrap();
        0
    });

    let remaining = main_loop(&fx.root, &fx.config, &fake).unwrap();
    assert_eq!(remaining, 0);
    // Root, two children, and the stub re-dispatch of the root.
    assert_eq!(fake.issued_commands().len(), 4);
    assert!(fx
        .layout
        .record_files()
        .unwrap()
        .is_empty());
}

#[test]
fn lost_job_is_rescued_and_retried() {
    let fx = fixture();
    submit_root(&fx, TaskSpec::new("run", 1, 1));

    let fake = FakeBatch::new().with_runner(completing_runner);
    fake.lose_next_job();

    let remaining = main_loop(&fx.root, &fx.config, &fake).unwrap();
    assert_eq!(remaining, 0);
    // The lost dispatch plus the successful retry.
    assert_eq!(fake.issued_commands().len(), 2);
    assert_eq!(fake.killed().len(), 1);
}

#[test]
fn dirty_backend_at_startup_is_an_invariant_violation() {
    let fx = fixture();
    let fake = FakeBatch::new();
    fake.issue_job("leftover", 1, 1, &fx.root.join("x.log"))
        .unwrap();
    let result = main_loop(&fx.root, &fx.config, &fake);
    assert!(matches!(result, Err(EngineError::Invariant(_))));
}

#[test]
fn interrupted_materialisation_is_replayed_without_duplicates() {
    let fx = fixture();

    // A parent that finished its dispatch and declared two children.
    let mut parent = fx
        .layout
        .create_record(&fx.config, TaskSpec::new("spawn", 1, 1), None)
        .unwrap();
    parent.colour = Colour::Black;
    parent.follow_ons.clear();
    parent.add_child(TaskSpec::new("child-a", 1, 1));
    parent.add_child(TaskSpec::new("child-b", 1, 1));
    store::write_record(&parent).unwrap();

    // Stage the crash: a half-finished materialisation commit, voided on
    // recovery. The parent's pending children survive in its canonical
    // record.
    let half_child = fx
        .layout
        .create_record(
            &fx.config,
            TaskSpec::new("child-a", 1, 1),
            Some(parent.file.clone()),
        )
        .unwrap();
    let marker = store::updating_path(&parent.file);
    let parent_shadow = store::new_path(&parent.file);
    let child_shadow = store::new_path(&half_child.file);
    std::fs::write(
        &marker,
        format!("{} {}", parent_shadow.display(), child_shadow.display()),
    )
    .unwrap();
    std::fs::write(&parent_shadow, b"half").unwrap();
    std::fs::write(&child_shadow, b"half").unwrap();

    let fake = FakeBatch::new().with_runner(completing_runner);
    let remaining = main_loop(&fx.root, &fx.config, &fake).unwrap();
    assert_eq!(remaining, 0);

    // Exactly one materialisation happened: two children, no duplicates.
    let commands = fake.issued_commands();
    assert_eq!(commands.len(), 2);
    assert!(fx.layout.record_files().unwrap().is_empty());
}
