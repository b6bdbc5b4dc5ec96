// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The persistent job record: one node of the job tree.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Scheduling state of a job record.
///
/// `Grey` is ready to run, `Blue` has living children, `Black` finished its
/// last dispatch, `Red` failed it, and `Dead` records exist only between the
/// parent notification and deletion (or as a finished root).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Colour {
    Grey,
    Blue,
    Black,
    Red,
    Dead,
}

impl fmt::Display for Colour {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Colour::Grey => write!(f, "grey"),
            Colour::Blue => write!(f, "blue"),
            Colour::Black => write!(f, "black"),
            Colour::Red => write!(f, "red"),
            Colour::Dead => write!(f, "dead"),
        }
    }
}

/// One unit of work: a command plus its resource request.
///
/// Used both for follow-ons (sequential continuations of a job) and for
/// children (independent sub-jobs dispatched through the backend).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub command: String,
    pub memory: u64,
    pub cpu: u32,
}

impl TaskSpec {
    pub fn new(command: impl Into<String>, memory: u64, cpu: u32) -> Self {
        Self {
            command: command.into(),
            memory,
            cpu,
        }
    }

    /// A stub entry: empty command, executed as a no-op by the worker.
    /// Appended to force the controller to regain control between batches
    /// of children.
    pub fn stub(memory: u64, cpu: u32) -> Self {
        Self::new("", memory, cpu)
    }

    pub fn is_stub(&self) -> bool {
        self.command.is_empty()
    }
}

/// A job record: the on-disk document describing one node of the job tree.
///
/// The canonical file path (`file`) is the record's identity and never
/// changes. Both the controller and the worker harness mutate records, but
/// never concurrently: the controller does not touch a record it has
/// issued until a completion or rescue delivers the id back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub file: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<PathBuf>,
    pub colour: Colour,
    pub remaining_retry_count: u32,
    pub child_count: u32,
    pub black_child_count: u32,
    /// Pending follow-on stack; the last element is the next to execute.
    pub follow_ons: Vec<TaskSpec>,
    /// Children declared by the most recent execution, not yet materialised
    /// as records of their own.
    #[serde(default)]
    pub children: Vec<TaskSpec>,
    pub log_file: PathBuf,
    pub worker_log_file: PathBuf,
    pub global_temp_dir: PathBuf,
    pub job_creation_time: DateTime<Utc>,
    pub job_time: f64,
    pub max_log_file_size: u64,
    pub default_memory: u64,
    pub default_cpu: u32,
    pub environment_file: PathBuf,
    pub log_level: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stats_file: Option<PathBuf>,
    #[serde(default)]
    pub report_all_job_logs: bool,
}

impl JobRecord {
    /// Peek the top of the follow-on stack.
    pub fn next_follow_on(&self) -> Option<&TaskSpec> {
        self.follow_ons.last()
    }

    /// Current depth of the follow-on stack.
    pub fn follow_on_depth(&self) -> usize {
        self.follow_ons.len()
    }

    /// Push a new follow-on onto the top of the stack.
    pub fn push_follow_on(&mut self, task: TaskSpec) {
        self.follow_ons.push(task);
    }

    /// Remove the follow-on at `index`.
    ///
    /// The worker removes the entry it executed by its pre-execution index,
    /// so follow-ons the target pushed during execution stay on top.
    pub fn remove_follow_on(&mut self, index: usize) -> Option<TaskSpec> {
        if index < self.follow_ons.len() {
            Some(self.follow_ons.remove(index))
        } else {
            None
        }
    }

    /// Declare a child sub-job.
    pub fn add_child(&mut self, task: TaskSpec) {
        self.children.push(task);
    }

    /// Take all declared children, leaving the set empty.
    pub fn take_children(&mut self) -> Vec<TaskSpec> {
        std::mem::take(&mut self.children)
    }

    /// True when nothing remains to run: no follow-ons and no pending
    /// children. Such a record transitions to `Dead`.
    pub fn is_exhausted(&self) -> bool {
        self.follow_ons.is_empty() && self.children.is_empty()
    }
}

#[cfg(test)]
#[path = "record_tests.rs"]
mod tests;
