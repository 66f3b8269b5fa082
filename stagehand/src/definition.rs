//! Declared shape of a pipeline: ordered stages, iterative sections, and the pass cap.

use std::collections::{BTreeMap, HashSet};

use anyhow::{Result, anyhow, bail};
use serde_json::Value;

use crate::core::types::{DONE_STAGE, is_reserved_stage, validate_id};
use crate::stage::Stage;

/// Decides, from the outputs of a section's stages, whether the section is finished.
pub type ConvergencePredicate = Box<dyn Fn(&BTreeMap<String, Value>) -> bool>;

/// A contiguous group of stages repeated until convergence or the pass cap.
pub struct IterativeSection {
    name: String,
    stages: Vec<(String, Box<dyn Stage>)>,
    converged: ConvergencePredicate,
}

impl IterativeSection {
    /// A section with no convergence predicate runs until the cap.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            stages: Vec::new(),
            converged: Box::new(|_| false),
        }
    }

    pub fn stage(mut self, id: impl Into<String>, handler: impl Stage + 'static) -> Self {
        self.stages.push((id.into(), Box::new(handler)));
        self
    }

    pub fn converge_when(
        mut self,
        predicate: impl Fn(&BTreeMap<String, Value>) -> bool + 'static,
    ) -> Self {
        self.converged = Box::new(predicate);
        self
    }
}

pub(crate) struct PlannedStage {
    pub(crate) id: String,
    pub(crate) handler: Box<dyn Stage>,
    /// Index into [`PipelineDefinition::sections`].
    pub(crate) section: Option<usize>,
}

pub(crate) struct SectionPlan {
    pub(crate) name: String,
    /// Plan index of the section's last stage.
    pub(crate) last: usize,
    pub(crate) stage_ids: Vec<String>,
    pub(crate) converged: ConvergencePredicate,
}

/// Validated, immutable pipeline definition. Build one with [`PipelineDefinition::builder`].
pub struct PipelineDefinition {
    plan: Vec<PlannedStage>,
    sections: Vec<SectionPlan>,
    max_iterations: u32,
}

impl PipelineDefinition {
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::default()
    }

    /// Stage identifiers in execution order, sections flattened.
    pub fn stage_ids(&self) -> Vec<String> {
        self.plan.iter().map(|stage| stage.id.clone()).collect()
    }

    pub fn max_iterations(&self) -> u32 {
        self.max_iterations
    }

    pub fn section_names(&self) -> Vec<String> {
        self.sections.iter().map(|s| s.name.clone()).collect()
    }

    /// Section name to the stage identifiers it repeats.
    pub fn sections(&self) -> BTreeMap<String, Vec<String>> {
        self.sections
            .iter()
            .map(|s| (s.name.clone(), s.stage_ids.clone()))
            .collect()
    }

    pub(crate) fn first_stage(&self) -> &str {
        &self.plan[0].id
    }

    pub(crate) fn position(&self, id: &str) -> Option<usize> {
        self.plan.iter().position(|stage| stage.id == id)
    }

    pub(crate) fn planned(&self, index: usize) -> &PlannedStage {
        &self.plan[index]
    }

    pub(crate) fn section(&self, index: usize) -> &SectionPlan {
        &self.sections[index]
    }

    /// Identifier of the stage after `index`, or [`DONE_STAGE`].
    pub(crate) fn next_after(&self, index: usize) -> String {
        self.plan
            .get(index + 1)
            .map(|stage| stage.id.clone())
            .unwrap_or_else(|| DONE_STAGE.to_string())
    }
}

enum Entry {
    Stage(String, Box<dyn Stage>),
    Section(IterativeSection),
}

pub struct PipelineBuilder {
    entries: Vec<Entry>,
    max_iterations: u32,
}

impl Default for PipelineBuilder {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            max_iterations: 1,
        }
    }
}

impl PipelineBuilder {
    pub fn stage(mut self, id: impl Into<String>, handler: impl Stage + 'static) -> Self {
        self.entries.push(Entry::Stage(id.into(), Box::new(handler)));
        self
    }

    pub fn iterative(mut self, section: IterativeSection) -> Self {
        self.entries.push(Entry::Section(section));
        self
    }

    /// Upper bound on passes of every iterative section.
    pub fn max_iterations(mut self, max_iterations: u32) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn build(self) -> Result<PipelineDefinition> {
        if self.max_iterations == 0 {
            bail!("max_iterations must be at least 1");
        }

        let mut plan = Vec::new();
        let mut sections = Vec::new();
        let mut seen = HashSet::new();
        let mut check_id = |id: &str| -> Result<()> {
            validate_id("stage id", id)?;
            if is_reserved_stage(id) {
                bail!("stage id '{id}' is reserved");
            }
            if !seen.insert(id.to_string()) {
                bail!("duplicate stage id '{id}'");
            }
            Ok(())
        };

        for entry in self.entries {
            match entry {
                Entry::Stage(id, handler) => {
                    check_id(&id)?;
                    plan.push(PlannedStage {
                        id,
                        handler,
                        section: None,
                    });
                }
                Entry::Section(section) => {
                    validate_id("section name", &section.name)?;
                    if sections.iter().any(|s: &SectionPlan| s.name == section.name) {
                        bail!("duplicate section name '{}'", section.name);
                    }
                    if section.stages.is_empty() {
                        bail!("section '{}' has no stages", section.name);
                    }
                    let index = sections.len();
                    let mut stage_ids = Vec::with_capacity(section.stages.len());
                    for (id, handler) in section.stages {
                        check_id(&id)?;
                        stage_ids.push(id.clone());
                        plan.push(PlannedStage {
                            id,
                            handler,
                            section: Some(index),
                        });
                    }
                    sections.push(SectionPlan {
                        name: section.name,
                        last: plan.len() - 1,
                        stage_ids,
                        converged: section.converged,
                    });
                }
            }
        }

        if plan.is_empty() {
            return Err(anyhow!("pipeline declares no stages"));
        }

        Ok(PipelineDefinition {
            plan,
            sections,
            max_iterations: self.max_iterations,
        })
    }
}
