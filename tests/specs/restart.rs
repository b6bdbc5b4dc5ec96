//! Crash-only behaviour: interrupted commits, lost jobs, and controller
//! restarts.

use crate::prelude::*;
use arbor_core::{Colour, Target, TargetContext, TargetError, TargetRegistry, TaskSpec};
use arbor_engine::main_loop;
use arbor_storage::store;
use std::path::PathBuf;

#[test]
fn interrupted_materialisation_restarts_without_duplicate_children() {
    let tree = tree();

    // A parent that came back black having declared two children.
    let mut parent = tree
        .layout
        .create_record(&tree.config, TaskSpec::new("true", 1024, 1), None)
        .unwrap();
    parent.colour = Colour::Black;
    parent.follow_ons.clear();
    for i in 0..2 {
        let marker = tree.root.join(format!("child-{i}"));
        parent.add_child(TaskSpec::new(
            format!("touch {}", marker.display()),
            1024,
            1,
        ));
    }
    store::write_record(&parent).unwrap();

    // The controller crashed mid-materialisation: marker and shadows are
    // on disk, one child half-created.
    let half_child = tree
        .layout
        .create_record(
            &tree.config,
            TaskSpec::new("never-runs", 1024, 1),
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
    std::fs::write(&parent_shadow, b"interrupted").unwrap();
    std::fs::write(&child_shadow, b"interrupted").unwrap();

    // Restart: recovery voids the commit, the loop re-materialises.
    let backend = harness_backend(TargetRegistry::new());
    let remaining = main_loop(&tree.root, &tree.config, &backend).unwrap();

    assert_eq!(remaining, 0);
    // Exactly the two declared children ran: no duplicates, and never
    // the half-created child's command.
    let commands = backend.issued_commands();
    assert_eq!(commands.len(), 2);
    assert!(tree.root.join("child-0").is_file());
    assert!(tree.root.join("child-1").is_file());
    assert!(tree.layout.record_files().unwrap().is_empty());
}

#[test]
fn backend_lost_job_is_rescued_and_completes() {
    let tree = tree();
    let marker = tree.root.join("eventually");
    submit(
        &tree,
        TaskSpec::new(format!("touch {}", marker.display()), 1024, 1),
    );

    let backend = harness_backend(TargetRegistry::new());
    backend.lose_next_job();

    let remaining = main_loop(&tree.root, &tree.config, &backend).unwrap();

    assert_eq!(remaining, 0);
    assert!(marker.is_file());
    // The vanished dispatch was killed after three missing sweeps, then
    // the record was retried.
    assert_eq!(backend.killed().len(), 1);
    assert_eq!(backend.issued_commands().len(), 2);
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

#[test]
fn rerunning_the_controller_resumes_a_failed_tree() {
    let mut tree = tree();
    tree.config.retry_count = 0;
    tree.config
        .save(&arbor_core::TreeConfig::path_in(&tree.root))
        .unwrap();

    let mut registry = TargetRegistry::new();
    let marker = tree.root.join("already-failed");
    let marker_for_loader = marker.clone();
    registry.register("flaky-once", move |_| {
        Ok(Box::new(FlakyOnce {
            marker: marker_for_loader.clone(),
        }) as Box<dyn Target>)
    });

    let record = submit(&tree, target_task(&tree, "flaky-once", serde_json::json!({})));

    // First run: no retries, so the tree ends with a red record.
    let backend = harness_backend(registry);
    let remaining = main_loop(&tree.root, &tree.config, &backend).unwrap();
    assert_eq!(remaining, 1);
    assert_eq!(
        store::read_record(&record.file).unwrap().colour,
        Colour::Red
    );

    // Second run: recovery demotes the red record to grey and the target
    // now succeeds.
    let remaining = main_loop(&tree.root, &tree.config, &backend).unwrap();
    assert_eq!(remaining, 0);
    assert!(tree.layout.record_files().unwrap().is_empty());
}
