//! External mutation targets (ticket trackers, knowledge bases, ...).
//!
//! The engine never knows the target's wire format. It hands over a
//! [`Change`]: a kind, a stable key for deduplication, and a JSON body.

use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, instrument};

use crate::errors::{MutationRejected, MutationTimedOut};
use crate::io::config::MutationConfig;
use crate::io::process::run_command_with_timeout;
use crate::retry::is_transient_io;

/// One mutation of an external system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Change {
    /// What kind of mutation this is (e.g. `ticket.update`).
    pub kind: String,
    /// Stable identifier; re-applying the same key must not duplicate the effect.
    pub key: String,
    pub body: Value,
}

impl Change {
    pub fn new(kind: impl Into<String>, key: impl Into<String>, body: Value) -> Self {
        Self {
            kind: kind.into(),
            key: key.into(),
            body,
        }
    }

    pub fn label(&self) -> String {
        format!("{}:{}", self.kind, self.key)
    }
}

pub trait MutationTarget {
    fn apply(&self, change: &Change) -> Result<()>;
}

/// Retry classifier for mutations: timeouts and transient I/O, never rejections.
pub fn is_transient_mutation(err: &anyhow::Error) -> bool {
    err.downcast_ref::<MutationTimedOut>().is_some() || is_transient_io(err)
}

/// Target that pipes each change as JSON into a configured command.
///
/// Exit status 0 means accepted; anything else is a [`MutationRejected`].
/// Running past the timeout is a [`MutationTimedOut`].
#[derive(Debug, Clone)]
pub struct CommandTarget {
    command: Vec<String>,
    timeout: Duration,
}

impl CommandTarget {
    pub fn new(command: Vec<String>, timeout: Duration) -> Self {
        Self { command, timeout }
    }

    /// `None` when no command is configured.
    pub fn from_config(config: &MutationConfig) -> Option<Self> {
        if config.command.is_empty() {
            return None;
        }
        Some(Self::new(
            config.command.clone(),
            Duration::from_secs(config.timeout_secs),
        ))
    }
}

impl MutationTarget for CommandTarget {
    #[instrument(skip_all, fields(change = %change.label()))]
    fn apply(&self, change: &Change) -> Result<()> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| anyhow!("mutation command is empty"))?;
        let mut cmd = Command::new(program);
        cmd.args(args);
        let payload = serde_json::to_vec(change).context("serialize change")?;

        let output = run_command_with_timeout(cmd, Some(&payload), self.timeout, 64 * 1024)
            .with_context(|| format!("run mutation command {program}"))?;
        if output.timed_out {
            return Err(MutationTimedOut {
                change: change.label(),
                timeout: self.timeout,
            }
            .into());
        }
        if !output.status.success() {
            return Err(MutationRejected {
                change: change.label(),
                reason: format!(
                    "exit status {:?}: {}",
                    output.status.code(),
                    output.stderr_lossy().trim()
                ),
            }
            .into());
        }
        info!("mutation applied");
        Ok(())
    }
}

/// Stand-in used when no mutation command is configured.
///
/// Only reached when the write gate is enabled, so failing loudly is correct.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnconfiguredTarget;

impl MutationTarget for UnconfiguredTarget {
    fn apply(&self, change: &Change) -> Result<()> {
        Err(MutationRejected {
            change: change.label(),
            reason: "write gate is enabled but no mutation.command is configured".to_string(),
        }
        .into())
    }
}
