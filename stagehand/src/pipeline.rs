//! Resumable execution of a [`PipelineDefinition`].
//!
//! A run is a sequence of stage executions. After every completed stage the
//! whole [`PipelineState`] is checkpointed through the [`StateStore`], so a
//! crash at any point loses at most the stage that was in flight. Reopening
//! the same session resumes at the first stage without a persisted result.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Instant;

use anyhow::{Context, Result, anyhow, bail};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::{error, info, instrument, warn};

use crate::core::backoff::RetryPolicy;
use crate::core::types::{
    FAILED_STAGE, PassSignal, PipelineState, StageFailure, validate_id,
};
use crate::definition::PipelineDefinition;
use crate::errors::{ConfigurationMismatch, StageFailed};
use crate::io::artifacts::ArtifactStore;
use crate::io::state_store::StateStore;
use crate::io::write_gate::WriteGate;
use crate::iteration::IterationController;
use crate::retry::RetryExecutor;
use crate::stage::StageContext;

/// Result of one [`StagePipeline::step`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepOutcome {
    /// Stage that just completed.
    pub stage: String,
    /// Pass number the stage ran in (0 outside iterative sections).
    pub iteration: u32,
    /// Stage the run will execute next, or `done`.
    pub next: String,
    /// Set when this stage closed a pass of an iterative section.
    pub pass: Option<PassSignal>,
}

/// Summary of a [`StagePipeline::run`] invocation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunOutcome {
    pub session_id: String,
    /// Whether this invocation picked up persisted state.
    pub resumed: bool,
    /// Stages executed by this invocation, in order (repeats for iterative passes).
    pub executed: Vec<String>,
    pub stage_outputs: BTreeMap<String, Value>,
    pub convergence: BTreeMap<String, bool>,
}

impl RunOutcome {
    pub fn output(&self, stage: &str) -> Option<&Value> {
        self.stage_outputs.get(stage)
    }

    pub fn converged(&self, section: &str) -> Option<bool> {
        self.convergence.get(section).copied()
    }
}

/// Drives one session of one pipeline definition.
pub struct StagePipeline<S: StateStore> {
    definition: PipelineDefinition,
    store: S,
    artifacts: ArtifactStore,
    gate: WriteGate,
    mutation_retry: RetryExecutor,
    state: PipelineState,
    resumed: bool,
}

impl<S: StateStore> StagePipeline<S> {
    /// Load `session_id` from `store`, or start it fresh.
    ///
    /// Nothing is written until the first stage completes. Persisted state
    /// from a different definition fails with [`ConfigurationMismatch`].
    #[instrument(skip_all, fields(session = session_id))]
    pub fn open(
        definition: PipelineDefinition,
        session_id: &str,
        store: S,
        artifacts: ArtifactStore,
        gate: WriteGate,
    ) -> Result<Self> {
        validate_id("session id", session_id)?;

        let (state, resumed) = match store.load(session_id)? {
            Some(state) => {
                ensure_matches(&definition, &state)?;
                if let Some(failure) = &state.failure {
                    warn!(
                        stage = %failure.stage,
                        summary = %failure.summary,
                        "resuming after failed stage"
                    );
                } else if !state.is_done() {
                    info!(stage = %state.stage, iteration = state.iteration, "resuming session");
                }
                (state, true)
            }
            None => {
                info!("starting new session");
                let mut state = PipelineState::new(
                    session_id,
                    definition.stage_ids(),
                    definition.first_stage(),
                    definition.max_iterations(),
                );
                state.sections = definition.sections();
                (state, false)
            }
        };

        Ok(Self {
            definition,
            store,
            artifacts,
            gate,
            mutation_retry: RetryExecutor::new(RetryPolicy::default()),
            state,
            resumed,
        })
    }

    /// Retry policy for [`StageContext::commit`] calls marked idempotent.
    pub fn with_mutation_retry(mut self, policy: RetryPolicy) -> Self {
        self.mutation_retry = RetryExecutor::new(policy);
        self
    }

    pub fn state(&self) -> &PipelineState {
        &self.state
    }

    pub fn resumed(&self) -> bool {
        self.resumed
    }

    pub fn is_done(&self) -> bool {
        self.state.is_done()
    }

    pub fn status(&self) -> PipelineStatus {
        PipelineStatus::from_state(&self.state)
    }

    pub fn into_state(self) -> PipelineState {
        self.state
    }

    /// Execute exactly one stage and checkpoint.
    ///
    /// Returns `Ok(None)` when the run is already done. A handler error moves
    /// the run to `failed`, persists a [`StageFailure`], and comes back
    /// annotated with [`StageFailed`]; reopening the session retries that stage.
    pub fn step(&mut self) -> Result<Option<StepOutcome>> {
        if self.state.is_failed() && self.state.failure.is_none() {
            bail!(
                "session '{}' is marked failed but has no failure record",
                self.state.session_id
            );
        }
        let Some(stage_id) = self.state.resume_stage().map(str::to_string) else {
            return Ok(None);
        };
        let index = self.definition.position(&stage_id).ok_or_else(|| {
            anyhow!("persisted stage '{stage_id}' is not declared by the pipeline")
        })?;

        let planned = self.definition.planned(index);
        let controller = planned.section.map(|section| {
            IterationController::new(
                self.definition.section(section),
                self.definition.max_iterations(),
            )
        });
        match &controller {
            Some(controller) => controller.enter(&mut self.state),
            None => self.state.active_section = None,
        }
        let iteration = if controller.is_some() {
            self.state.iteration
        } else {
            0
        };

        info!(stage = %stage_id, iteration, "running stage");
        let started = Instant::now();
        let result = {
            let ctx = StageContext {
                session_id: &self.state.session_id,
                stage: &stage_id,
                section: controller.as_ref().map(|c| c.name()),
                iteration,
                max_iterations: self.definition.max_iterations(),
                outputs: &self.state.stage_outputs,
                convergence: &self.state.convergence,
                history: &self.state.history,
                artifacts: &self.artifacts,
                gate: &self.gate,
                mutation_retry: &self.mutation_retry,
            };
            planned.handler.execute(&ctx)
        };

        let payload = match result {
            Ok(payload) => payload,
            Err(err) => return Err(self.record_failure(&stage_id, started, err)),
        };

        self.state.stage_outputs.insert(stage_id.clone(), payload);
        let mut pass = None;
        let next = match &controller {
            Some(controller) if controller.is_last_stage(index) => {
                let signal = controller.complete_pass(&mut self.state);
                pass = Some(signal);
                if signal.stops() {
                    self.definition.next_after(index)
                } else {
                    controller.first_stage().to_string()
                }
            }
            _ => self.definition.next_after(index),
        };

        self.state.stage = next.clone();
        self.state.failure = None;
        self.state.touch();
        self.store
            .save(&self.state)
            .with_context(|| format!("checkpoint after stage '{stage_id}'"))?;
        info!(
            stage = %stage_id,
            elapsed_ms = started.elapsed().as_millis() as u64,
            next = %next,
            "stage completed"
        );

        Ok(Some(StepOutcome {
            stage: stage_id,
            iteration,
            next,
            pass,
        }))
    }

    /// Step until the run is done or a stage fails.
    pub fn run(&mut self) -> Result<RunOutcome> {
        self.run_with(|_| {})
    }

    /// Like [`run`](Self::run), calling `on_step` after every checkpoint.
    pub fn run_with<F: FnMut(&StepOutcome)>(&mut self, mut on_step: F) -> Result<RunOutcome> {
        let mut executed = Vec::new();
        while let Some(step) = self.step()? {
            on_step(&step);
            executed.push(step.stage);
        }
        Ok(RunOutcome {
            session_id: self.state.session_id.clone(),
            resumed: self.resumed,
            executed,
            stage_outputs: self.state.stage_outputs.clone(),
            convergence: self.state.convergence.clone(),
        })
    }

    fn record_failure(&mut self, stage: &str, started: Instant, err: anyhow::Error) -> anyhow::Error {
        let elapsed_ms = started.elapsed().as_millis() as u64;
        let summary = format!("{err:#}");
        error!(stage, elapsed_ms, err = %summary, "stage failed");

        self.state.failure = Some(StageFailure {
            stage: stage.to_string(),
            summary,
            elapsed_ms,
            failed_at: Utc::now(),
        });
        self.state.stage = FAILED_STAGE.to_string();
        self.state.touch();

        let err = err.context(StageFailed {
            session_id: self.state.session_id.clone(),
            stage: stage.to_string(),
            elapsed_ms,
        });
        match self.store.save(&self.state) {
            Ok(()) => err,
            Err(save_err) => {
                error!(err = %format!("{save_err:#}"), "could not persist stage failure");
                err.context(format!("failure record not persisted: {save_err:#}"))
            }
        }
    }
}

fn ensure_matches(definition: &PipelineDefinition, state: &PipelineState) -> Result<()> {
    let declared = definition.stage_ids();
    let declared_sections = definition.sections();
    if state.stages == declared
        && state.sections == declared_sections
        && state.max_iterations == definition.max_iterations()
    {
        return Ok(());
    }
    Err(ConfigurationMismatch {
        session_id: state.session_id.clone(),
        persisted: layout(&state.stages, &state.sections),
        declared: layout(&declared, &declared_sections),
        persisted_max_iterations: state.max_iterations,
        declared_max_iterations: definition.max_iterations(),
    }
    .into())
}

/// Stage list with iterative sections bracketed, e.g. `plan, refine[draft, review], publish`.
fn layout(stages: &[String], sections: &BTreeMap<String, Vec<String>>) -> String {
    let mut parts = Vec::new();
    let mut rest = stages;
    while let Some(first) = rest.first() {
        let section = sections
            .iter()
            .find(|(_, ids)| ids.first() == Some(first) && rest.starts_with(ids));
        match section {
            Some((name, ids)) => {
                parts.push(format!("{name}[{}]", ids.join(", ")));
                rest = &rest[ids.len()..];
            }
            None => {
                parts.push(first.clone());
                rest = &rest[1..];
            }
        }
    }
    parts.join(", ")
}

/// Human-facing summary of a persisted run.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PipelineStatus {
    pub session_id: String,
    /// `running`, `done` or `failed`.
    pub status: &'static str,
    pub stage: String,
    pub iteration: u32,
    pub max_iterations: u32,
    pub completed: Vec<String>,
    pub passes: usize,
    pub convergence: BTreeMap<String, bool>,
    pub failure: Option<StageFailure>,
    pub updated_at: DateTime<Utc>,
}

impl PipelineStatus {
    pub fn from_state(state: &PipelineState) -> Self {
        let status = if state.is_done() {
            "done"
        } else if state.is_failed() {
            "failed"
        } else {
            "running"
        };
        let completed = state
            .stages
            .iter()
            .filter(|id| state.stage_outputs.contains_key(*id))
            .cloned()
            .collect();
        Self {
            session_id: state.session_id.clone(),
            status,
            stage: state.stage.clone(),
            iteration: state.iteration,
            max_iterations: state.max_iterations,
            completed,
            passes: state.history.len(),
            convergence: state.convergence.clone(),
            failure: state.failure.clone(),
            updated_at: state.updated_at,
        }
    }

    pub fn render(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "session:    {}", self.session_id)?;
        writeln!(f, "status:     {}", self.status)?;
        writeln!(f, "stage:      {}", self.stage)?;
        if self.iteration > 0 {
            writeln!(f, "iteration:  {}/{}", self.iteration, self.max_iterations)?;
        }
        writeln!(f, "completed:  {}", self.completed.join(", "))?;
        for (section, converged) in &self.convergence {
            let marker = if *converged { "converged" } else { "did not converge" };
            writeln!(f, "section:    {section} ({marker})")?;
        }
        if let Some(failure) = &self.failure {
            writeln!(
                f,
                "failure:    stage '{}' after {}ms: {}",
                failure.stage, failure.elapsed_ms, failure.summary
            )?;
            writeln!(
                f,
                "resume:     stagehand run <workflow> --session {}",
                self.session_id
            )?;
        }
        writeln!(f, "updated:    {}", self.updated_at.to_rfc3339())
    }
}
