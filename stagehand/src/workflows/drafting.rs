//! Document drafting: `intake -> outline -> [draft -> review]* -> publish`.
//!
//! The `revise` section repeats until a review approves the draft or the pass
//! cap is hit. `publish` always runs; it records whether the section
//! converged and hands the document to the mutation target through the gate.

use std::sync::Arc;

use anyhow::Result;
use minijinja::context;
use serde_json::{Value, json};
use tracing::info;

use crate::definition::{IterativeSection, PipelineDefinition};
use crate::io::mutation::Change;
use crate::retry::Idempotency;
use crate::stage::{StageContext, from_fn};
use crate::workflows::{WorkflowEnv, check_schema, generate_structured, pretty, render_prompt};

pub const REVISE_SECTION: &str = "revise";

const INTAKE_SCHEMA: &str = include_str!("schemas/intake_drafting.schema.json");
const OUTLINE_SCHEMA: &str = include_str!("schemas/outline.schema.json");
const DRAFT_SCHEMA: &str = include_str!("schemas/draft.schema.json");
const REVIEW_SCHEMA: &str = include_str!("schemas/review.schema.json");

/// True when the latest review approved the draft.
pub fn approved(outputs: &std::collections::BTreeMap<String, Value>) -> bool {
    outputs
        .get("review")
        .and_then(|review| review.get("approved"))
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

pub fn definition(
    input: Value,
    env: Arc<WorkflowEnv>,
    max_iterations: u32,
) -> Result<PipelineDefinition> {
    let outline_env = Arc::clone(&env);
    let draft_env = Arc::clone(&env);
    let review_env = Arc::clone(&env);
    let publish_env = env;

    PipelineDefinition::builder()
        .stage(
            "intake",
            from_fn(move |_| {
                check_schema("drafting input", INTAKE_SCHEMA, &input)?;
                Ok(json!({
                    "topic": input["topic"],
                    "audience": input.get("audience").cloned().unwrap_or(Value::Null),
                    "notes": input.get("notes").cloned().unwrap_or(Value::Null),
                }))
            }),
        )
        .stage("outline", from_fn(move |ctx| outline(&outline_env, ctx)))
        .iterative(
            IterativeSection::new(REVISE_SECTION)
                .stage("draft", from_fn(move |ctx| draft(&draft_env, ctx)))
                .stage("review", from_fn(move |ctx| review(&review_env, ctx)))
                .converge_when(approved),
        )
        .stage("publish", from_fn(move |ctx| publish(&publish_env, ctx)))
        .max_iterations(max_iterations)
        .build()
}

fn outline(env: &WorkflowEnv, ctx: &StageContext<'_>) -> Result<Value> {
    let intake = ctx.require("intake")?;
    let prompt = render_prompt(
        "outline",
        context! {
            topic => intake["topic"].as_str(),
            audience => intake["audience"].as_str(),
            notes => intake["notes"].as_str(),
        },
    )?;
    generate_structured(env, "outline", &prompt, OUTLINE_SCHEMA)
}

fn draft(env: &WorkflowEnv, ctx: &StageContext<'_>) -> Result<Value> {
    let outline = ctx.require("outline")?;
    // Outputs from the previous pass are still present on later passes.
    let revising = ctx.iteration() > 1;
    let previous_draft = ctx
        .output("draft")
        .filter(|_| revising)
        .and_then(|d| d["body"].as_str());
    let feedback: Vec<&str> = ctx
        .output("review")
        .filter(|_| revising)
        .and_then(|r| r["feedback"].as_array())
        .map(|items| items.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default();

    let prompt = render_prompt(
        "draft",
        context! {
            pass => ctx.iteration(),
            max_passes => ctx.max_iterations(),
            outline => pretty(outline),
            previous_draft => previous_draft,
            feedback => feedback,
        },
    )?;
    generate_structured(env, "draft", &prompt, DRAFT_SCHEMA)
}

fn review(env: &WorkflowEnv, ctx: &StageContext<'_>) -> Result<Value> {
    let outline = ctx.require("outline")?;
    let draft = ctx.require("draft")?;
    let prompt = render_prompt(
        "review",
        context! {
            outline => pretty(outline),
            draft => draft["body"].as_str(),
        },
    )?;
    generate_structured(env, "review", &prompt, REVIEW_SCHEMA)
}

fn publish(env: &WorkflowEnv, ctx: &StageContext<'_>) -> Result<Value> {
    let draft = ctx.require("draft")?;
    let converged = ctx.converged(REVISE_SECTION).unwrap_or(false);
    let document = json!({
        "title": draft["title"],
        "body": draft["body"],
        "approved": converged,
    });
    let path = ctx.persist("document", &document)?;

    let change = Change::new("document.publish", ctx.session_id(), document);
    let receipt = ctx.commit(env.target.as_ref(), &change, Idempotency::Idempotent)?;
    info!(applied = receipt.applied, converged, "document published");

    Ok(json!({
        "document": path.display().to_string(),
        "approved": converged,
        "applied": receipt.applied,
    }))
}
