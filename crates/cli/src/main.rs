// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! arbor: submit and drive a tree of batch jobs.
//!
//! `arbor run <dir> --command CMD` starts a fresh tree: it writes the
//! configuration, captures the shell environment, creates the root record,
//! and runs the controller over the local process pool until the tree
//! drains. Re-running `arbor run <dir>` on an existing tree resumes it
//! from its last committed state.

use anyhow::{bail, Context};
use arbor_batch::LocalBatch;
use arbor_core::{TaskSpec, TreeConfig};
use arbor_engine::main_loop;
use arbor_storage::{store, TreeLayout};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;

#[derive(Parser)]
#[command(name = "arbor", version, about = "Crash-safe hierarchical job orchestrator")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a job tree to completion, resuming it if it already exists
    Run(RunArgs),
}

#[derive(Args)]
struct RunArgs {
    /// Directory holding the tree's state
    tree_root: PathBuf,

    /// Root job command; required when starting a fresh tree
    #[arg(long)]
    command: Option<String>,

    /// Retries granted to each job
    #[arg(long)]
    retry_count: Option<u32>,

    /// Bound on concurrently running jobs
    #[arg(long)]
    max_jobs: Option<usize>,

    /// Ideal wall-clock seconds per dispatch
    #[arg(long)]
    job_time: Option<f64>,

    /// Kill jobs running longer than this many seconds
    #[arg(long)]
    max_job_duration: Option<f64>,

    /// Seconds between rescue sweeps
    #[arg(long)]
    rescue_frequency: Option<f64>,

    /// Default memory request in bytes
    #[arg(long)]
    default_memory: Option<u64>,

    /// Default cpu request
    #[arg(long)]
    default_cpu: Option<u32>,

    /// Logs larger than this many bytes are truncated to their tail
    #[arg(long)]
    max_log_file_size: Option<u64>,

    /// Controller and worker log level
    #[arg(long)]
    log_level: Option<String>,

    /// Report every job's logs, not just failing ones
    #[arg(long)]
    report_all_job_logs: bool,

    /// Collect per-job stats into <treeRoot>/stats.jsonl
    #[arg(long)]
    stats: bool,

    /// Explicit path to the arborw worker binary
    #[arg(long)]
    worker_binary: Option<PathBuf>,
}

fn main() {
    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Run(args) => run(args),
    };
    match result {
        Ok(0) => {}
        Ok(remaining) => {
            eprintln!("arbor: {remaining} record(s) left behind after failures");
            std::process::exit(i32::try_from(remaining.min(100)).unwrap_or(100));
        }
        Err(e) => {
            eprintln!("arbor: {e:#}");
            std::process::exit(1);
        }
    }
}

fn run(args: RunArgs) -> anyhow::Result<usize> {
    let root = args.tree_root.clone();
    let config_path = TreeConfig::path_in(&root);

    let config = if config_path.is_file() {
        if args.command.is_some() {
            bail!(
                "{} already holds a tree; --command is only valid on first submission",
                root.display()
            );
        }
        let mut config = TreeConfig::load(&config_path)
            .with_context(|| format!("loading {}", config_path.display()))?;
        let changed = apply_overrides(&mut config, &args);
        if changed {
            config.save(&config_path)?;
        }
        setup_logging(&config.log_level);
        info!(root = %root.display(), "resuming existing job tree");
        config
    } else {
        let command = args
            .command
            .clone()
            .context("--command is required to start a new tree")?;
        std::fs::create_dir_all(&root)?;
        let mut config = TreeConfig::new(&root);
        apply_overrides(&mut config, &args);
        if args.stats {
            config.stats = Some(root.join("stats.jsonl"));
        }
        let layout = TreeLayout::from_config(&config);
        layout.ensure()?;
        config.save(&config_path)?;
        arbor_harness::env::capture_to(&config.environment_file)?;

        setup_logging(&config.log_level);
        info!(root = %root.display(), command, "submitting new job tree");
        let record = layout.create_record(
            &config,
            TaskSpec::new(command, config.default_memory, config.default_cpu),
            None,
        )?;
        store::write_record(&record)?;
        config
    };

    let backend = LocalBatch::new(config.max_jobs);
    let remaining = main_loop(&root, &config, &backend)?;
    if remaining == 0 {
        info!("job tree completed");
    }
    Ok(remaining)
}

/// Fold command-line overrides into the configuration. Returns true when
/// anything changed.
fn apply_overrides(config: &mut TreeConfig, args: &RunArgs) -> bool {
    let mut changed = false;
    macro_rules! set {
        ($field:ident) => {
            if let Some(value) = args.$field.clone() {
                config.$field = value;
                changed = true;
            }
        };
    }
    set!(retry_count);
    set!(max_jobs);
    set!(job_time);
    set!(max_job_duration);
    set!(default_memory);
    set!(default_cpu);
    set!(max_log_file_size);
    set!(log_level);
    if let Some(binary) = args.worker_binary.clone() {
        config.worker_binary = Some(binary);
        changed = true;
    }
    if let Some(frequency) = args.rescue_frequency {
        config.rescue_jobs_frequency = frequency;
        changed = true;
    }
    if args.report_all_job_logs {
        config.report_all_job_logs = true;
        changed = true;
    }
    changed
}

fn setup_logging(log_level: &str) {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

#[cfg(test)]
#[path = "main_tests.rs"]
mod tests;
