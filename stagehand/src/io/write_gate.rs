//! Policy boundary in front of every external mutation.
//!
//! The gate is re-evaluated on every call so a policy flipped between runs (or
//! during one) takes effect at the next side effect. With no policy source the
//! gate is closed: changes are logged, not applied.

use std::env;
use std::fs;
use std::io;
use std::path::PathBuf;

use anyhow::Result;
use serde::Serialize;
use tracing::{info, warn};

use crate::io::config::WriteGateConfig;
use crate::io::mutation::{Change, MutationTarget};

/// Where the gate reads its decision from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum GatePolicy {
    #[default]
    Disabled,
    Fixed(bool),
    /// Open while the variable holds a truthy value (`1`, `true`, `yes`, `on`, `enabled`).
    Env(String),
    /// Open while the file exists and holds a truthy value.
    File(PathBuf),
}

/// Result of [`WriteGate::commit`], identical in shape whether or not the change was pushed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MutationReceipt {
    pub change: String,
    pub applied: bool,
}

#[derive(Debug, Clone, Default)]
pub struct WriteGate {
    policy: GatePolicy,
}

impl WriteGate {
    pub fn new(policy: GatePolicy) -> Self {
        Self { policy }
    }

    pub fn disabled() -> Self {
        Self::new(GatePolicy::Disabled)
    }

    pub fn from_config(config: &WriteGateConfig) -> Self {
        if let Some(path) = &config.file {
            return Self::new(GatePolicy::File(path.clone()));
        }
        if let Some(var) = &config.env {
            return Self::new(GatePolicy::Env(var.clone()));
        }
        Self::disabled()
    }

    pub fn policy(&self) -> &GatePolicy {
        &self.policy
    }

    pub fn is_enabled(&self) -> bool {
        match &self.policy {
            GatePolicy::Disabled => false,
            GatePolicy::Fixed(enabled) => *enabled,
            GatePolicy::Env(var) => env::var(var).is_ok_and(|value| is_truthy(&value)),
            GatePolicy::File(path) => match fs::read_to_string(path) {
                Ok(contents) => is_truthy(&contents),
                Err(err) if err.kind() == io::ErrorKind::NotFound => false,
                Err(err) => {
                    warn!(path = %path.display(), err = %err, "unreadable write policy, keeping gate closed");
                    false
                }
            },
        }
    }

    /// Apply `change` through `target` if the gate is open, otherwise log it.
    pub fn commit<T: MutationTarget + ?Sized>(
        &self,
        target: &T,
        change: &Change,
    ) -> Result<MutationReceipt> {
        let label = change.label();
        if !self.is_enabled() {
            info!(change = %label, body = %change.body, "write gate closed, not applying change");
            return Ok(MutationReceipt {
                change: label,
                applied: false,
            });
        }
        target.apply(change)?;
        Ok(MutationReceipt {
            change: label,
            applied: true,
        })
    }
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on" | "enabled"
    )
}
