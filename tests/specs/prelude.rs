//! Shared fixtures for the behavioural specs.

use arbor_batch::FakeBatch;
use arbor_core::{JobRecord, TargetRegistry, TaskSpec, TreeConfig};
use arbor_storage::{store, TreeLayout};
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;

pub struct Tree {
    /// Keeps the temp directory alive for the fixture's lifetime.
    pub _dir: TempDir,
    pub root: PathBuf,
    pub config: TreeConfig,
    pub layout: TreeLayout,
}

/// A fresh tree with fast rescue cadence and a generous chain budget.
pub fn tree() -> Tree {
    let dir = TempDir::new().unwrap();
    let root = dir.path().to_path_buf();
    let mut config = TreeConfig::new(&root);
    config.job_time = 3600.0;
    config.rescue_jobs_frequency = 0.0;
    config.missing_job_rescue_delay = 0.0;
    let layout = TreeLayout::from_config(&config);
    layout.ensure().unwrap();
    config.save(&TreeConfig::path_in(&root)).unwrap();
    arbor_harness::env::capture_to(&config.environment_file).unwrap();
    Tree {
        _dir: dir,
        root,
        config,
        layout,
    }
}

/// Create and durably write the root record for `task`.
pub fn submit(tree: &Tree, task: TaskSpec) -> JobRecord {
    let record = tree
        .layout
        .create_record(&tree.config, task, None)
        .unwrap();
    store::write_record(&record).unwrap();
    record
}

/// A fake backend whose issued commands run the real worker harness
/// in-process against the given target registry.
pub fn harness_backend(registry: TargetRegistry) -> FakeBatch {
    let registry = Arc::new(registry);
    FakeBatch::new().with_runner(move |command| {
        let (root, job_file) = parse_worker_command(command);
        match arbor_harness::run(&root, &job_file, &registry) {
            Ok(status) => status,
            Err(_) => 1,
        }
    })
}

/// Split a rendered worker invocation `'bin' 'root' --job 'file'` back
/// into its tree root and record file.
pub fn parse_worker_command(command: &str) -> (PathBuf, PathBuf) {
    let quoted: Vec<&str> = command.split('\'').skip(1).step_by(2).collect();
    assert_eq!(quoted.len(), 3, "unexpected worker invocation: {command}");
    (PathBuf::from(quoted[1]), PathBuf::from(quoted[2]))
}

/// Build a `target` follow-on task whose payload lives in the tree root.
pub fn target_task(tree: &Tree, kind: &str, config: serde_json::Value) -> TaskSpec {
    use arbor_core::TargetPayload;
    let payload_path = tree.root.join(format!("{kind}.payload.json"));
    TargetPayload::new(kind, config).save(&payload_path).unwrap();
    TaskSpec::new(
        TargetPayload::command(&payload_path),
        tree.config.default_memory,
        tree.config.default_cpu,
    )
}
