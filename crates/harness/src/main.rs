// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! arborw, the arbor worker harness.
//!
//! Invoked by the controller (through the batch backend) against one job
//! record: `arborw <treeRoot> --job <jobFile>`. Exits 0 on success,
//! non-zero on failure, with the error chain at the tail of the worker
//! log. Not meant to be run by hand.

use arbor_core::TargetRegistry;
use std::path::PathBuf;

fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();

    if let [arg] = args.as_slice() {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("arborw {}", env!("CARGO_PKG_VERSION"));
                return;
            }
            "--help" | "-h" => {
                println!("arborw {}", env!("CARGO_PKG_VERSION"));
                println!("arbor worker harness - executes one dispatched job record");
                println!();
                println!("USAGE:");
                println!("    arborw <treeRoot> --job <jobFile>");
                println!();
                println!("The harness is issued by the arbor controller through the");
                println!("batch backend and should not be invoked directly.");
                return;
            }
            _ => {}
        }
    }

    let (tree_root, job_file) = match parse_args(&args) {
        Ok(paths) => paths,
        Err(message) => {
            eprintln!("error: {message}");
            eprintln!("Usage: arborw <treeRoot> --job <jobFile>");
            std::process::exit(2);
        }
    };

    // The binary runs shell-command trees; targets are registered by
    // embedding applications that link the harness as a library.
    let registry = TargetRegistry::new();

    match arbor_harness::run(&tree_root, &job_file, &registry) {
        Ok(status) => std::process::exit(status),
        Err(e) => {
            eprintln!("arborw: {e}");
            std::process::exit(1);
        }
    }
}

fn parse_args(args: &[String]) -> Result<(PathBuf, PathBuf), String> {
    match args {
        [root, flag, job] if flag == "--job" => Ok((PathBuf::from(root), PathBuf::from(job))),
        _ => Err(format!("expected 3 arguments, got {}", args.len())),
    }
}
