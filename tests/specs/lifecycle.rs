//! Full-tree lifecycle: success, branching, retries, permanent failure.

use crate::prelude::*;
use arbor_core::{Colour, Target, TargetContext, TargetError, TargetRegistry, TaskSpec};
use arbor_engine::main_loop;
use arbor_storage::store;
use serde_json::json;
use std::path::PathBuf;

struct Noop;

impl Target for Noop {
    fn execute(&self, _ctx: &mut TargetContext<'_>) -> Result<(), TargetError> {
        Ok(())
    }
}

struct Brancher {
    children: Vec<String>,
}

impl Target for Brancher {
    fn execute(&self, ctx: &mut TargetContext<'_>) -> Result<(), TargetError> {
        for command in &self.children {
            ctx.record.add_child(TaskSpec::new(
                command.clone(),
                ctx.default_memory,
                ctx.default_cpu,
            ));
        }
        Ok(())
    }
}

/// Fails until its marker file exists, then succeeds.
struct FlakyOnce {
    marker: PathBuf,
}

impl Target for FlakyOnce {
    fn execute(&self, _ctx: &mut TargetContext<'_>) -> Result<(), TargetError> {
        if self.marker.exists() {
            Ok(())
        } else {
            std::fs::write(&self.marker, b"").map_err(TargetError::Io)?;
            Err(TargetError::Failed("first invocation fails".to_string()))
        }
    }
}

struct Doomed;

impl Target for Doomed {
    fn execute(&self, _ctx: &mut TargetContext<'_>) -> Result<(), TargetError> {
        Err(TargetError::Failed("always fails".to_string()))
    }
}

fn registry() -> TargetRegistry {
    let mut registry = TargetRegistry::new();
    registry.register("noop", |_| Ok(Box::new(Noop) as Box<dyn Target>));
    registry.register("brancher", |config| {
        let children = config["children"]
            .as_array()
            .map(|a| {
                a.iter()
                    .filter_map(|v| v.as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default();
        Ok(Box::new(Brancher { children }) as Box<dyn Target>)
    });
    registry.register("flaky-once", |config| {
        let marker = PathBuf::from(config["marker"].as_str().unwrap_or_default());
        Ok(Box::new(FlakyOnce { marker }) as Box<dyn Target>)
    });
    registry.register("doomed", |_| Ok(Box::new(Doomed) as Box<dyn Target>));
    registry
}

#[test]
fn single_target_runs_and_the_tree_drains() {
    let tree = tree();
    let record = submit(&tree, target_task(&tree, "noop", json!({})));
    let backend = harness_backend(registry());

    let remaining = main_loop(&tree.root, &tree.config, &backend).unwrap();

    assert_eq!(remaining, 0);
    assert_eq!(backend.issued_commands().len(), 1);
    assert!(!record.file.exists());
    assert!(!record.global_temp_dir.exists());
    assert!(tree.layout.record_files().unwrap().is_empty());
}

#[test]
fn branching_target_fans_out_and_joins() {
    let tree = tree();
    let children: Vec<String> = (0..3)
        .map(|i| format!("touch {}", tree.root.join(format!("child-{i}")).display()))
        .collect();
    submit(
        &tree,
        target_task(&tree, "brancher", json!({ "children": children })),
    );
    let backend = harness_backend(registry());

    let remaining = main_loop(&tree.root, &tree.config, &backend).unwrap();

    assert_eq!(remaining, 0);
    for i in 0..3 {
        assert!(tree.root.join(format!("child-{i}")).is_file());
    }
    // Root, three children, and the stub dispatch that returns control to
    // the parent after the children join.
    assert_eq!(backend.issued_commands().len(), 5);
    assert!(tree.layout.record_files().unwrap().is_empty());
}

#[test]
fn transient_failure_is_retried_to_success() {
    let mut tree = tree();
    tree.config.retry_count = 2;
    tree.config
        .save(&arbor_core::TreeConfig::path_in(&tree.root))
        .unwrap();

    let marker = tree.root.join("already-failed");
    submit(
        &tree,
        target_task(
            &tree,
            "flaky-once",
            json!({ "marker": marker.display().to_string() }),
        ),
    );
    let backend = harness_backend(registry());

    let remaining = main_loop(&tree.root, &tree.config, &backend).unwrap();

    assert_eq!(remaining, 0);
    assert_eq!(backend.issued_commands().len(), 2);
    assert!(tree.layout.record_files().unwrap().is_empty());
}

#[test]
fn exhausted_retries_leave_a_red_record_and_a_nonzero_count() {
    let mut tree = tree();
    tree.config.retry_count = 1;
    tree.config
        .save(&arbor_core::TreeConfig::path_in(&tree.root))
        .unwrap();

    let record = submit(&tree, target_task(&tree, "doomed", json!({})));
    let backend = harness_backend(registry());

    let remaining = main_loop(&tree.root, &tree.config, &backend).unwrap();

    assert_eq!(remaining, 1);
    // The original dispatch and one retry.
    assert_eq!(backend.issued_commands().len(), 2);
    let abandoned = store::read_record(&record.file).unwrap();
    assert_eq!(abandoned.colour, Colour::Red);
    assert_eq!(abandoned.remaining_retry_count, 0);
    // The failing worker's log was copied back for the operator.
    let log = std::fs::read_to_string(&record.worker_log_file).unwrap();
    assert!(log.contains("always fails"), "log should carry the cause: {log}");
}

#[test]
fn shell_command_trees_need_no_registry() {
    let tree = tree();
    let marker = tree.root.join("plain-shell");
    submit(
        &tree,
        TaskSpec::new(format!("touch {}", marker.display()), 1024, 1),
    );
    let backend = harness_backend(TargetRegistry::new());

    let remaining = main_loop(&tree.root, &tree.config, &backend).unwrap();
    assert_eq!(remaining, 0);
    assert!(marker.is_file());
}
