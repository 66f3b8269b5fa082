//! Concrete workflows expressed through [`PipelineDefinition`].
//!
//! Each workflow turns a JSON input document into a sequence of stages that
//! call the generator, extract a structured payload from the free-form reply,
//! and validate it against a per-stage schema before it becomes a stage output.

pub mod drafting;
pub mod triage;

use std::sync::{Arc, LazyLock};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use minijinja::Environment;
use serde_json::Value;
use tracing::{debug, warn};

use crate::core::extract::extract;
use crate::core::schema::validate_payload;
use crate::definition::PipelineDefinition;
use crate::io::generator::{Generator, generate_with_retry};
use crate::io::mutation::MutationTarget;
use crate::retry::RetryExecutor;

/// Names accepted by [`build`].
pub const WORKFLOWS: &[&str] = &["drafting", "triage"];

/// Collaborators shared by every stage of a workflow.
pub struct WorkflowEnv {
    pub generator: Box<dyn Generator + Send + Sync>,
    pub retry: RetryExecutor,
    /// Per generator call.
    pub timeout: Duration,
    pub target: Box<dyn MutationTarget + Send + Sync>,
}

/// Build the named workflow for `input`.
pub fn build(
    name: &str,
    input: Value,
    env: Arc<WorkflowEnv>,
    max_iterations: u32,
) -> Result<PipelineDefinition> {
    match name {
        "drafting" => drafting::definition(input, env, max_iterations),
        "triage" => triage::definition(input, env),
        other => bail!(
            "unknown workflow '{other}' (expected one of: {})",
            WORKFLOWS.join(", ")
        ),
    }
}

static PROMPTS: LazyLock<Environment<'static>> = LazyLock::new(|| {
    let mut env = Environment::new();
    for (name, source) in [
        ("outline", include_str!("prompts/outline.md")),
        ("draft", include_str!("prompts/draft.md")),
        ("review", include_str!("prompts/review.md")),
        ("classify", include_str!("prompts/classify.md")),
        ("propose", include_str!("prompts/propose.md")),
    ] {
        env.add_template(name, source)
            .expect("workflow prompt templates are valid");
    }
    env
});

pub(crate) fn render_prompt(name: &str, ctx: minijinja::Value) -> Result<String> {
    let template = PROMPTS
        .get_template(name)
        .with_context(|| format!("load prompt template '{name}'"))?;
    template
        .render(ctx)
        .with_context(|| format!("render prompt template '{name}'"))
}

/// Validate `payload` against an embedded schema document.
pub(crate) fn check_schema(label: &str, schema: &str, payload: &Value) -> Result<()> {
    let schema: Value = serde_json::from_str(schema)
        .with_context(|| format!("parse {label} schema"))?;
    validate_payload(&schema, payload).with_context(|| format!("{label} payload"))
}

/// Prompt the generator and return the validated structured payload.
///
/// A reply without a structured value, or one that fails the schema, is an
/// error; the caller's stage fails and a resumed run asks again.
pub(crate) fn generate_structured(
    env: &WorkflowEnv,
    label: &str,
    prompt: &str,
    schema: &str,
) -> Result<Value> {
    let text = generate_with_retry(env.generator.as_ref(), &env.retry, prompt, env.timeout)
        .with_context(|| format!("generate {label}"))?;
    let extraction = extract(&text);
    debug!(label, method = ?extraction.method, "extracted generator reply");

    let Some(payload) = extraction.payload else {
        let preview = extraction.preview.unwrap_or_default();
        warn!(label, preview = %preview, "generator reply had no structured payload");
        return Err(anyhow!("{label}: generator reply had no structured payload: {preview}"));
    };
    check_schema(label, schema, &payload)?;
    Ok(payload)
}

/// Pretty JSON for embedding in prompts.
pub(crate) fn pretty(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}
