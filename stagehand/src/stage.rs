//! Stage handlers and the view of the run they execute against.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::thread;

use anyhow::{Context, Result, anyhow};
use serde_json::Value;
use tracing::debug;

use crate::core::types::{IterationRecord, validate_id};
use crate::io::artifacts::ArtifactStore;
use crate::io::mutation::{Change, MutationTarget, is_transient_mutation};
use crate::io::write_gate::{MutationReceipt, WriteGate};
use crate::retry::{Idempotency, RetryExecutor};

/// One unit of work: read prior outputs, return this stage's payload or fail.
///
/// Handlers may run again after a crash (the stage restarts from scratch), so
/// external side effects must go through [`StageContext::commit`] or be
/// otherwise idempotent.
pub trait Stage {
    fn execute(&self, ctx: &StageContext<'_>) -> Result<Value>;
}

impl<F> Stage for F
where
    F: Fn(&StageContext<'_>) -> Result<Value>,
{
    fn execute(&self, ctx: &StageContext<'_>) -> Result<Value> {
        self(ctx)
    }
}

/// Pin a closure to the [`Stage`] signature so its argument type is inferred.
pub fn from_fn<F>(f: F) -> F
where
    F: Fn(&StageContext<'_>) -> Result<Value>,
{
    f
}

/// Read-only view of the run handed to a [`Stage`], plus the gated side-effect path.
pub struct StageContext<'a> {
    pub(crate) session_id: &'a str,
    pub(crate) stage: &'a str,
    pub(crate) section: Option<&'a str>,
    pub(crate) iteration: u32,
    pub(crate) max_iterations: u32,
    pub(crate) outputs: &'a BTreeMap<String, Value>,
    pub(crate) convergence: &'a BTreeMap<String, bool>,
    pub(crate) history: &'a [IterationRecord],
    pub(crate) artifacts: &'a ArtifactStore,
    pub(crate) gate: &'a WriteGate,
    pub(crate) mutation_retry: &'a RetryExecutor,
}

impl<'a> StageContext<'a> {
    pub fn session_id(&self) -> &str {
        self.session_id
    }

    pub fn stage(&self) -> &str {
        self.stage
    }

    /// Iterative section this stage belongs to, if any.
    pub fn section(&self) -> Option<&str> {
        self.section
    }

    /// 1-based pass number inside the current section.
    pub fn iteration(&self) -> u32 {
        self.iteration
    }

    pub fn max_iterations(&self) -> u32 {
        self.max_iterations
    }

    /// Output of a completed stage (from this pass or an earlier one).
    pub fn output(&self, stage: &str) -> Option<&'a Value> {
        self.outputs.get(stage)
    }

    /// Like [`output`](Self::output), but a missing dependency is an error.
    pub fn require(&self, stage: &str) -> Result<&'a Value> {
        self.output(stage)
            .ok_or_else(|| anyhow!("stage '{}' needs output of '{stage}', which has not completed", self.stage))
    }

    /// Convergence marker of a finished iterative section.
    pub fn converged(&self, section: &str) -> Option<bool> {
        self.convergence.get(section).copied()
    }

    pub fn history(&self) -> &'a [IterationRecord] {
        self.history
    }

    /// Previously persisted artifact, e.g. a result computed before a crash.
    pub fn artifact(&self, name: &str) -> Result<Option<Value>> {
        self.artifacts.read(name)
    }

    pub fn persist(&self, name: &str, value: &Value) -> Result<PathBuf> {
        self.artifacts.write(name, value)
    }

    pub fn gate_enabled(&self) -> bool {
        self.gate.is_enabled()
    }

    /// Persist `change` locally, then apply it through the write gate.
    ///
    /// The local copy (`<stage>.<key>.json`) is written whatever the gate
    /// decides. A closed gate returns a receipt with `applied: false`.
    pub fn commit<T: MutationTarget + ?Sized>(
        &self,
        target: &T,
        change: &Change,
        idempotency: Idempotency,
    ) -> Result<MutationReceipt> {
        let name = format!("{}.{}", self.stage, change.key);
        validate_id("artifact name", &name)?;
        self.artifacts
            .write(&name, change)
            .with_context(|| format!("persist change for stage '{}'", self.stage))?;
        debug!(stage = self.stage, change = %change.label(), "change persisted locally");

        self.mutation_retry
            .run(
                "apply change",
                idempotency,
                |_| self.gate.commit(target, change),
                is_transient_mutation,
            )
            .into_result()
    }

    /// See [`fan_out`].
    pub fn fan_out<T: Send>(&self, jobs: Vec<Job<'_, T>>) -> Result<Vec<T>> {
        debug!(stage = self.stage, jobs = jobs.len(), "fanning out");
        fan_out(jobs)
    }
}

/// A boxed sub-operation for [`fan_out`].
pub type Job<'a, T> = Box<dyn FnOnce() -> Result<T> + Send + 'a>;

/// Run independent jobs on scoped threads and wait for every one of them.
///
/// Results come back in job order. If any job fails (or panics) the first
/// failure is returned, but only after all jobs have finished, so nothing
/// from a half-finished fan-out escapes.
pub fn fan_out<T: Send>(jobs: Vec<Job<'_, T>>) -> Result<Vec<T>> {
    let results: Vec<Result<T>> = thread::scope(|scope| {
        let handles: Vec<_> = jobs.into_iter().map(|job| scope.spawn(job)).collect();
        handles
            .into_iter()
            .map(|handle| {
                handle
                    .join()
                    .unwrap_or_else(|_| Err(anyhow!("fan-out job panicked")))
            })
            .collect()
    });
    results.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn fan_out_preserves_job_order() {
        let jobs: Vec<Job<'_, u32>> = vec![
            Box::new(|| {
                thread::sleep(Duration::from_millis(30));
                Ok(1)
            }),
            Box::new(|| Ok(2)),
            Box::new(|| Ok(3)),
        ];
        assert_eq!(fan_out(jobs).expect("fan out"), vec![1, 2, 3]);
    }

    #[test]
    fn fan_out_waits_for_all_jobs_before_failing() {
        let finished = AtomicUsize::new(0);
        let jobs: Vec<Job<'_, ()>> = vec![
            Box::new(|| Err(anyhow!("first job failed"))),
            Box::new(|| {
                thread::sleep(Duration::from_millis(50));
                finished.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        ];
        let err = fan_out(jobs).unwrap_err();
        assert!(err.to_string().contains("first job failed"));
        assert_eq!(finished.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn fan_out_reports_panics() {
        let jobs: Vec<Job<'_, ()>> = vec![Box::new(|| panic!("boom"))];
        let err = fan_out(jobs).unwrap_err();
        assert!(err.to_string().contains("panicked"));
    }
}
