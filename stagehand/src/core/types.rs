//! Durable pipeline state shared by the engine, the store, and the CLI.
//!
//! Everything in this module is plain data. Field names are part of the
//! on-disk format; new fields must be optional (`#[serde(default)]`) so older
//! state files stay readable.

use std::collections::BTreeMap;

use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Terminal sentinel written to [`PipelineState::stage`] once every stage completed.
pub const DONE_STAGE: &str = "done";
/// Terminal sentinel written to [`PipelineState::stage`] after an unrecoverable stage error.
pub const FAILED_STAGE: &str = "failed";

/// Identifiers double as file names, so keep them to `[A-Za-z0-9._-]`.
pub fn validate_id(kind: &str, id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(anyhow!("{kind} must not be empty"));
    }
    if id.starts_with('.') {
        return Err(anyhow!("{kind} must not start with '.' (got '{id}')"));
    }
    if id
        .chars()
        .any(|c| !(c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-'))
    {
        return Err(anyhow!("{kind} must be [A-Za-z0-9._-] only (got '{id}')"));
    }
    Ok(())
}

/// Returns true for identifiers that cannot be used as stage names.
pub fn is_reserved_stage(id: &str) -> bool {
    id == DONE_STAGE || id == FAILED_STAGE
}

/// The single durable record for one pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PipelineState {
    pub session_id: String,
    /// Declared stage identifiers, in execution order, at the time the run started.
    pub stages: Vec<String>,
    /// Iterative section name to the stages it repeats, at the time the run started.
    #[serde(default)]
    pub sections: BTreeMap<String, Vec<String>>,
    /// Next stage to execute, or one of the terminal sentinels.
    pub stage: String,
    /// 1-based pass number inside the active iterative section (0 before any section).
    #[serde(default)]
    pub iteration: u32,
    pub max_iterations: u32,
    /// Iterative section the run is currently inside, if any.
    #[serde(default)]
    pub active_section: Option<String>,
    #[serde(default)]
    pub stage_outputs: BTreeMap<String, Value>,
    #[serde(default)]
    pub history: Vec<IterationRecord>,
    /// Per-section convergence marker, written when a section finishes.
    #[serde(default)]
    pub convergence: BTreeMap<String, bool>,
    #[serde(default)]
    pub failure: Option<StageFailure>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PipelineState {
    /// Fresh state positioned at `first_stage`.
    pub fn new(
        session_id: &str,
        stages: Vec<String>,
        first_stage: &str,
        max_iterations: u32,
    ) -> Self {
        let now = Utc::now();
        Self {
            session_id: session_id.to_string(),
            stages,
            sections: BTreeMap::new(),
            stage: first_stage.to_string(),
            iteration: 0,
            max_iterations,
            active_section: None,
            stage_outputs: BTreeMap::new(),
            history: Vec::new(),
            convergence: BTreeMap::new(),
            failure: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_done(&self) -> bool {
        self.stage == DONE_STAGE
    }

    pub fn is_failed(&self) -> bool {
        self.stage == FAILED_STAGE
    }

    /// Stage a resumed run restarts from, or `None` once the run is done.
    ///
    /// A failed run restarts the stage that failed; it never completed, so its
    /// output is not in `stage_outputs`.
    pub fn resume_stage(&self) -> Option<&str> {
        if self.is_done() {
            return None;
        }
        if self.is_failed() {
            return self.failure.as_ref().map(|f| f.stage.as_str());
        }
        Some(self.stage.as_str())
    }

    /// Number of iteration passes recorded for `section`.
    pub fn passes_for(&self, section: &str) -> usize {
        self.history
            .iter()
            .filter(|record| record.section == section)
            .count()
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Whether an iterative section keeps going after a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PassSignal {
    /// Not converged and passes remain.
    Continue,
    /// The convergence predicate accepted this pass.
    Converged,
    /// `max_iterations` reached without convergence.
    CapReached,
}

impl PassSignal {
    pub fn stops(self) -> bool {
        !matches!(self, PassSignal::Continue)
    }
}

/// Snapshot of one completed pass of an iterative section (append-only).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IterationRecord {
    pub section: String,
    pub iteration: u32,
    /// Outputs of the section's stages as of the end of this pass.
    pub outputs: BTreeMap<String, Value>,
    pub signal: PassSignal,
    pub completed_at: DateTime<Utc>,
}

/// Why a run stopped in the `failed` state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StageFailure {
    pub stage: String,
    pub summary: String,
    pub elapsed_ms: u64,
    pub failed_at: DateTime<Utc>,
}
