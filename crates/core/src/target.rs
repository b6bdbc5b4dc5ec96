// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! User-target interface: compiled-in work units dispatched by name.
//!
//! A follow-on command whose first token is [`TARGET_SENTINEL`] names a
//! payload document on disk; the payload's `kind` selects a constructor
//! from the [`TargetRegistry`] and its `config` is handed to that
//! constructor. Every other command string is an opaque shell command.

use crate::record::JobRecord;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;

/// First whitespace-delimited token marking a user-target command.
pub const TARGET_SENTINEL: &str = "target";

/// Errors from loading or executing a user target.
#[derive(Debug, Error)]
pub enum TargetError {
    #[error("no target registered under kind '{0}'")]
    UnknownKind(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed target payload: {0}")]
    Payload(#[from] serde_json::Error),
    #[error("target failed: {0}")]
    Failed(String),
}

/// Execution context handed to a target.
///
/// The target may mutate the record by pushing follow-ons and declaring
/// children; the worker harness persists the result.
pub struct TargetContext<'a> {
    pub record: &'a mut JobRecord,
    /// Scratch directory wiped after each follow-on.
    pub local_temp_dir: &'a Path,
    /// Layer directory shared by re-executions at the same stack depth.
    pub global_temp_dir: &'a Path,
    pub memory_available: u64,
    pub cpu_available: u32,
    pub default_memory: u64,
    pub default_cpu: u32,
}

/// A unit of user code runnable by the worker harness.
pub trait Target {
    fn execute(&self, ctx: &mut TargetContext<'_>) -> Result<(), TargetError>;
}

/// On-disk form of a target command's payload: a tagged document whose
/// `kind` is the registry key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetPayload {
    pub kind: String,
    #[serde(default)]
    pub config: serde_json::Value,
}

impl TargetPayload {
    pub fn new(kind: impl Into<String>, config: serde_json::Value) -> Self {
        Self {
            kind: kind.into(),
            config,
        }
    }

    pub fn load(path: &Path) -> Result<Self, TargetError> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn save(&self, path: &Path) -> Result<(), TargetError> {
        let text = serde_json::to_string(self)?;
        std::fs::write(path, text)?;
        Ok(())
    }

    /// The command string that dispatches this payload.
    pub fn command(path: &Path) -> String {
        format!("{} {}", TARGET_SENTINEL, path.display())
    }
}

/// If `command` is a target command, returns the payload path.
pub fn parse_target_command(command: &str) -> Option<&str> {
    let mut tokens = command.split_whitespace();
    match (tokens.next(), tokens.next()) {
        (Some(TARGET_SENTINEL), Some(path)) => Some(path),
        _ => None,
    }
}

type TargetLoader =
    Box<dyn Fn(serde_json::Value) -> Result<Box<dyn Target>, TargetError> + Send + Sync>;

/// Registry of target constructors keyed by payload kind.
#[derive(Default)]
pub struct TargetRegistry {
    loaders: HashMap<String, TargetLoader>,
}

impl TargetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a constructor under `kind`. Re-registering replaces the
    /// previous constructor.
    pub fn register<F>(&mut self, kind: impl Into<String>, loader: F)
    where
        F: Fn(serde_json::Value) -> Result<Box<dyn Target>, TargetError> + Send + Sync + 'static,
    {
        self.loaders.insert(kind.into(), Box::new(loader));
    }

    /// Materialise the target described by `payload`.
    pub fn load(&self, payload: &TargetPayload) -> Result<Box<dyn Target>, TargetError> {
        let loader = self
            .loaders
            .get(&payload.kind)
            .ok_or_else(|| TargetError::UnknownKind(payload.kind.clone()))?;
        loader(payload.config.clone())
    }
}

#[cfg(test)]
#[path = "target_tests.rs"]
mod tests;
