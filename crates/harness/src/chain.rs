// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Chain execution of one dispatched job record.
//!
//! The loop mirrors the record's follow-on stack: each iteration prepares
//! the layer directory for the current stack depth, runs the top follow-on
//! (shell command, registered target, or stub), and pops the executed
//! entry. While the wall-clock budget holds and resources suffice, further
//! follow-ons (and a singleton declared child) run in the same process,
//! saving backend round-trips. Every step that can fail funnels into one
//! sink: the record is reloaded from disk, marked red, and the process
//! exits non-zero.

use crate::{env, logs};
use arbor_core::config::ConfigError;
use arbor_core::{
    parse_target_command, Colour, JobRecord, TargetContext, TargetError, TargetPayload,
    TargetRegistry, TaskSpec, TreeConfig,
};
use arbor_storage::store::{self, StoreError};
use arbor_storage::{RECORD_FILE_NAME, STATS_FILE_NAME};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

/// Errors from one harness invocation.
#[derive(Debug, Error)]
pub enum HarnessError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Environment(#[from] env::EnvError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Target(#[from] TargetError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("command '{command}' exited with status {status}")]
    CommandFailed { command: String, status: i32 },
    #[error("record {0} has an empty follow-on stack")]
    EmptyFollowOnStack(PathBuf),
    #[error("record {0} was dispatched with pending children")]
    InconsistentRecord(PathBuf),
    #[error("job_time must be positive, got {0}")]
    InvalidJobTime(f64),
    #[error("stale layer directory {0} below the current depth")]
    LayerResidue(PathBuf),
    #[error("unexpected file {0} left in the job directory")]
    ResidualFile(PathBuf),
}

/// Execute the record at `job_file` within the tree at `tree_root`.
///
/// Returns the process exit status: 0 when the chain succeeded, 1 when a
/// follow-on failed (the record has been marked red). Errors are
/// harness-level failures where not even the record could be updated; the
/// controller downgrades those to an ordinary job failure on reap.
pub fn run(
    tree_root: &Path,
    job_file: &Path,
    registry: &TargetRegistry,
) -> Result<i32, HarnessError> {
    let config = TreeConfig::load(&TreeConfig::path_in(tree_root))?;

    let vars = env::load(&config.environment_file)?;
    env::apply(&vars);

    let work_root = std::env::temp_dir().join(format!("arborw-{}", Uuid::new_v4()));
    let local_temp_dir = work_root.join("work");
    std::fs::create_dir_all(&local_temp_dir)?;
    make_world_writable(&local_temp_dir)?;

    // Everything from here on, harness logging and child output alike,
    // lands in the worker log; the standard streams stay silent. Append
    // mode keeps the subscriber's writes interleaving cleanly with child
    // process output.
    let worker_log = work_root.join("worker.log");
    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&worker_log)?;
    let filter =
        EnvFilter::try_new(config.log_level.clone()).unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(false)
        .with_writer(std::sync::Arc::new(log_file))
        .finish();

    let result = tracing::subscriber::with_default(subscriber, || {
        chain(job_file, registry, &local_temp_dir, &worker_log)
    });

    let failed = match &result {
        Ok(report) => report.failed,
        Err(_) => true,
    };
    if let Err(e) = &result {
        append_error(&worker_log, e);
    }

    copy_back_worker_log(job_file, &worker_log, failed);
    let _ = std::fs::remove_dir_all(&work_root);

    result.map(|report| i32::from(report.failed))
}

struct ChainReport {
    failed: bool,
}

fn chain(
    job_file: &Path,
    registry: &TargetRegistry,
    local_temp_dir: &Path,
    worker_log: &Path,
) -> Result<ChainReport, HarnessError> {
    let mut record = store::read_record(job_file)?;
    info!(file = %job_file.display(), colour = %record.colour, "loaded job record");

    if !record.children.is_empty() || record.child_count != record.black_child_count {
        return Err(HarnessError::InconsistentRecord(job_file.to_path_buf()));
    }
    let max_time = record.job_time;
    if max_time <= 0.0 {
        return Err(HarnessError::InvalidJobTime(max_time));
    }

    // The dispatch's resource allowance is the top follow-on's request.
    let first = record
        .next_follow_on()
        .ok_or_else(|| HarnessError::EmptyFollowOnStack(job_file.to_path_buf()))?;
    let memory_available = first.memory;
    let cpu_available = first.cpu;
    let default_memory = record.default_memory;
    let default_cpu = record.default_cpu;

    let start = Instant::now();
    let mut executed = 0u32;
    let mut failed = false;

    loop {
        let depth = record.follow_on_depth();
        let task = match record.next_follow_on() {
            Some(task) => task.clone(),
            None => return Err(HarnessError::EmptyFollowOnStack(job_file.to_path_buf())),
        };
        let layer = prepare_layer(&record.global_temp_dir, depth)?;

        match execute_task(
            &task,
            &mut record,
            registry,
            local_temp_dir,
            &layer,
            memory_available,
            cpu_available,
            worker_log,
        ) {
            Ok(()) => {
                // Keep the stack consistent: a target that declared
                // children without queueing its own continuation gets a
                // stub, so the controller regains control once the
                // children finish.
                if !record.children.is_empty() && record.follow_on_depth() == depth {
                    info!("appending stub follow-on");
                    record.push_follow_on(TaskSpec::stub(default_memory, default_cpu));
                }
            }
            Err(e) => {
                error!(command = %task.command, error = %e, "follow-on failed");
                record = store::read_record(job_file)?;
                record.colour = Colour::Red;
                failed = true;
                break;
            }
        }

        record.remove_follow_on(depth - 1);
        record.colour = Colour::Black;
        executed += 1;
        purge_dir(local_temp_dir)?;

        if start.elapsed().as_secs_f64() > max_time {
            info!("wall-clock budget exceeded, returning to the controller");
            break;
        }
        if record.children.len() > 1 {
            info!(
                children = record.children.len(),
                "multiple children declared, they dispatch in parallel"
            );
            break;
        }
        if record.children.len() == 1 {
            if let Some(only) = record.take_children().pop() {
                info!(command = %only.command, "chaining the single declared child");
                record.push_follow_on(only);
            }
        }
        if record.follow_on_depth() == 0 {
            info!("follow-on stack exhausted");
            break;
        }
        let (next_memory, next_cpu) = match record.next_follow_on() {
            Some(next) => (next.memory, next.cpu),
            None => break,
        };
        if next_memory > memory_available {
            info!(
                requested = next_memory,
                available = memory_available,
                "next follow-on needs more memory"
            );
            break;
        }
        if next_cpu > cpu_available {
            info!(
                requested = next_cpu,
                available = cpu_available,
                "next follow-on needs more cpus"
            );
            break;
        }

        record.colour = Colour::Grey;
        store::write_record(&record)?;
        debug!("checkpointed, continuing the chain");
    }

    store::write_record(&record)?;

    if let Some(stats_file) = &record.stats_file {
        let stats = serde_json::json!({
            "wall_seconds": start.elapsed().as_secs_f64(),
            "follow_ons_run": executed,
        });
        std::fs::write(stats_file, stats.to_string())?;
    }

    if !failed && record.colour == Colour::Black && record.follow_ons.is_empty() {
        finish_job_directory(&record)?;
    }

    info!(
        executed,
        seconds = start.elapsed().as_secs_f64(),
        failed,
        "chain finished"
    );
    Ok(ChainReport { failed })
}

#[allow(clippy::too_many_arguments)]
fn execute_task(
    task: &TaskSpec,
    record: &mut JobRecord,
    registry: &TargetRegistry,
    local_temp_dir: &Path,
    layer: &Path,
    memory_available: u64,
    cpu_available: u32,
    worker_log: &Path,
) -> Result<(), HarnessError> {
    if task.is_stub() {
        debug!("stub follow-on, nothing to run");
        return Ok(());
    }
    if let Some(payload_path) = parse_target_command(&task.command) {
        let payload = TargetPayload::load(Path::new(payload_path))?;
        info!(kind = %payload.kind, "executing target");
        let target = registry.load(&payload)?;
        let (default_memory, default_cpu) = (record.default_memory, record.default_cpu);
        let mut ctx = TargetContext {
            record,
            local_temp_dir,
            global_temp_dir: layer,
            memory_available,
            cpu_available,
            default_memory,
            default_cpu,
        };
        target.execute(&mut ctx)?;
        Ok(())
    } else {
        run_shell(&task.command, worker_log)
    }
}

fn run_shell(command: &str, worker_log: &Path) -> Result<(), HarnessError> {
    info!(command, "running shell command");
    let log = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(worker_log)?;
    let err_log = log.try_clone()?;
    let status = Command::new("sh")
        .arg("-c")
        .arg(command)
        .stdin(Stdio::null())
        .stdout(Stdio::from(log))
        .stderr(Stdio::from(err_log))
        .status()?;
    if !status.success() {
        return Err(HarnessError::CommandFailed {
            command: command.to_string(),
            status: status.code().unwrap_or(1),
        });
    }
    Ok(())
}

/// Make sure the layer directory for `depth` exists and that deeper layers
/// from a previous, more nested execution are reclaimed as the stack
/// unwinds. A layer two levels down must never survive.
fn prepare_layer(global_temp_dir: &Path, depth: usize) -> Result<PathBuf, HarnessError> {
    let layer = global_temp_dir.join(depth.to_string());
    if !layer.is_dir() {
        std::fs::create_dir_all(&layer)?;
        make_world_writable(&layer)?;
    }
    let unwound = global_temp_dir.join((depth + 1).to_string());
    if unwound.is_dir() {
        std::fs::remove_dir_all(&unwound)?;
    }
    let deeper = global_temp_dir.join((depth + 2).to_string());
    if deeper.exists() {
        return Err(HarnessError::LayerResidue(deeper));
    }
    Ok(layer)
}

/// Terminal cleanup once the whole chain is done: reclaim the first layer,
/// drop the user log, and verify nothing but the record (and stats file)
/// remains in the job directory.
fn finish_job_directory(record: &JobRecord) -> Result<(), HarnessError> {
    let first_layer = record.global_temp_dir.join("1");
    if first_layer.is_dir() {
        std::fs::remove_dir_all(&first_layer)?;
    }
    if record.log_file.is_file() {
        std::fs::remove_file(&record.log_file)?;
    }
    for entry in std::fs::read_dir(&record.global_temp_dir)? {
        let path = entry?.path();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        if name != RECORD_FILE_NAME && name != STATS_FILE_NAME {
            return Err(HarnessError::ResidualFile(path));
        }
    }
    Ok(())
}

fn purge_dir(dir: &Path) -> std::io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            std::fs::remove_dir_all(&path)?;
        } else {
            std::fs::remove_file(&path)?;
        }
    }
    Ok(())
}

#[cfg(unix)]
fn make_world_writable(dir: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o777))
}

#[cfg(not(unix))]
fn make_world_writable(_dir: &Path) -> std::io::Result<()> {
    Ok(())
}

/// Leave the error chain at the tail of the worker log so the controller
/// can surface it.
fn append_error(worker_log: &Path, error: &HarnessError) {
    let Ok(mut file) = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(worker_log)
    else {
        return;
    };
    let _ = writeln!(file, "harness failed: {error}");
    let mut source = std::error::Error::source(error);
    while let Some(cause) = source {
        let _ = writeln!(file, "  caused by: {cause}");
        source = std::error::Error::source(cause);
    }
}

/// Copy the worker log back beside the record when requested or on
/// failure, truncated to the record's log size bound. Best-effort: the
/// record may not even be readable if the harness failed early.
fn copy_back_worker_log(job_file: &Path, worker_log: &Path, failed: bool) {
    let Ok(record) = store::read_record(job_file) else {
        return;
    };
    if record.report_all_job_logs || failed {
        let _ = logs::truncate_to_tail(worker_log, record.max_log_file_size);
        let _ = std::fs::copy(worker_log, &record.worker_log_file);
    }
}

#[cfg(test)]
#[path = "chain_tests.rs"]
mod tests;
