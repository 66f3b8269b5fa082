//! Pass accounting for iterative sections.
//!
//! A section's pass ends when its last stage completes. The controller then
//! snapshots the section's outputs into history, evaluates the convergence
//! predicate, and decides whether to loop back or move on.

use std::collections::BTreeMap;

use chrono::Utc;
use serde_json::Value;
use tracing::{info, warn};

use crate::core::types::{IterationRecord, PassSignal, PipelineState};
use crate::definition::SectionPlan;

pub(crate) struct IterationController<'a> {
    section: &'a SectionPlan,
    max_iterations: u32,
}

impl<'a> IterationController<'a> {
    pub(crate) fn new(section: &'a SectionPlan, max_iterations: u32) -> Self {
        Self {
            section,
            max_iterations,
        }
    }

    pub(crate) fn name(&self) -> &'a str {
        &self.section.name
    }

    pub(crate) fn first_stage(&self) -> &'a str {
        &self.section.stage_ids[0]
    }

    pub(crate) fn is_last_stage(&self, plan_index: usize) -> bool {
        plan_index == self.section.last
    }

    /// Start pass 1 when the run moves into this section.
    ///
    /// Re-entering after a crash keeps the persisted pass number.
    pub(crate) fn enter(&self, state: &mut PipelineState) {
        if state.active_section.as_deref() != Some(self.name()) || state.iteration == 0 {
            state.active_section = Some(self.section.name.clone());
            state.iteration = 1;
        }
    }

    /// Close the current pass and record it.
    pub(crate) fn complete_pass(&self, state: &mut PipelineState) -> PassSignal {
        let outputs: BTreeMap<String, Value> = self
            .section
            .stage_ids
            .iter()
            .filter_map(|id| {
                state
                    .stage_outputs
                    .get(id)
                    .map(|value| (id.clone(), value.clone()))
            })
            .collect();

        let signal = if (self.section.converged)(&outputs) {
            PassSignal::Converged
        } else if state.iteration >= self.max_iterations {
            PassSignal::CapReached
        } else {
            PassSignal::Continue
        };

        state.history.push(IterationRecord {
            section: self.section.name.clone(),
            iteration: state.iteration,
            outputs,
            signal,
            completed_at: Utc::now(),
        });

        match signal {
            PassSignal::Continue => {
                info!(section = self.name(), pass = state.iteration, "section not converged, looping");
                state.iteration += 1;
            }
            PassSignal::Converged => {
                info!(section = self.name(), pass = state.iteration, "section converged");
                state.convergence.insert(self.section.name.clone(), true);
                state.active_section = None;
            }
            PassSignal::CapReached => {
                warn!(
                    section = self.name(),
                    max_iterations = self.max_iterations,
                    "section did not converge"
                );
                state.convergence.insert(self.section.name.clone(), false);
                state.active_section = None;
            }
        }
        signal
    }
}
