//! Ticket triage: `intake -> classify -> propose -> apply`.
//!
//! `classify` asks the generator about every ticket concurrently. `apply`
//! pushes one tracker update per proposed change, keyed by ticket id, through
//! the write gate; with the gate closed the changes are only stored locally.

use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::{Result, bail};
use minijinja::context;
use serde_json::{Value, json};
use tracing::{info, warn};

use crate::core::types::validate_id;
use crate::definition::PipelineDefinition;
use crate::io::mutation::Change;
use crate::retry::Idempotency;
use crate::stage::{Job, StageContext, from_fn};
use crate::workflows::{WorkflowEnv, check_schema, generate_structured, render_prompt};

const INTAKE_SCHEMA: &str = include_str!("schemas/intake_triage.schema.json");
const CLASSIFY_SCHEMA: &str = include_str!("schemas/classify.schema.json");
const PROPOSE_SCHEMA: &str = include_str!("schemas/propose.schema.json");

pub fn definition(input: Value, env: Arc<WorkflowEnv>) -> Result<PipelineDefinition> {
    let classify_env = Arc::clone(&env);
    let propose_env = Arc::clone(&env);
    let apply_env = env;

    PipelineDefinition::builder()
        .stage("intake", from_fn(move |_| intake(&input)))
        .stage("classify", from_fn(move |ctx| classify(&classify_env, ctx)))
        .stage("propose", from_fn(move |ctx| propose(&propose_env, ctx)))
        .stage("apply", from_fn(move |ctx| apply(&apply_env, ctx)))
        .build()
}

fn intake(input: &Value) -> Result<Value> {
    check_schema("triage input", INTAKE_SCHEMA, input)?;
    let mut seen = BTreeSet::new();
    let mut tickets = Vec::new();
    for ticket in input["tickets"].as_array().into_iter().flatten() {
        let id = ticket["id"].as_str().unwrap_or_default();
        validate_id("ticket id", id)?;
        if !seen.insert(id.to_string()) {
            bail!("duplicate ticket id '{id}'");
        }
        tickets.push(json!({
            "id": id,
            "title": ticket["title"],
            "body": ticket.get("body").and_then(Value::as_str).unwrap_or_default(),
        }));
    }
    Ok(json!({ "tickets": tickets }))
}

fn classify(env: &WorkflowEnv, ctx: &StageContext<'_>) -> Result<Value> {
    let tickets = ctx.require("intake")?["tickets"]
        .as_array()
        .cloned()
        .unwrap_or_default();

    let jobs: Vec<Job<'_, Value>> = tickets
        .into_iter()
        .map(|ticket| {
            let job: Job<'_, Value> = Box::new(move || {
                let id = ticket["id"].as_str().unwrap_or_default().to_string();
                let prompt = render_prompt("classify", context! { ticket => ticket })?;
                let label = format!("classify {id}");
                let mut payload = generate_structured(env, &label, &prompt, CLASSIFY_SCHEMA)?;
                // The ticket id comes from intake, not from the generator.
                payload["ticket"] = Value::String(id);
                Ok(payload)
            });
            job
        })
        .collect();

    let classifications = ctx.fan_out(jobs)?;
    info!(tickets = classifications.len(), "tickets classified");
    Ok(json!({ "classifications": classifications }))
}

fn propose(env: &WorkflowEnv, ctx: &StageContext<'_>) -> Result<Value> {
    let classify = ctx.require("classify")?;
    let prompt = render_prompt(
        "propose",
        context! { classifications => &classify["classifications"] },
    )?;
    let mut proposal = generate_structured(env, "propose", &prompt, PROPOSE_SCHEMA)?;

    let known: BTreeSet<&str> = ctx.require("intake")?["tickets"]
        .as_array()
        .into_iter()
        .flatten()
        .filter_map(|t| t["id"].as_str())
        .collect();
    if let Some(changes) = proposal["changes"].as_array_mut() {
        changes.retain(|change| {
            let ticket = change["ticket"].as_str().unwrap_or_default();
            let keep = known.contains(ticket);
            if !keep {
                warn!(ticket, "dropping change for unknown ticket");
            }
            keep
        });
    }
    Ok(proposal)
}

fn apply(env: &WorkflowEnv, ctx: &StageContext<'_>) -> Result<Value> {
    let proposal = ctx.require("propose")?;
    let mut receipts = Vec::new();
    for proposed in proposal["changes"].as_array().into_iter().flatten() {
        let ticket = proposed["ticket"].as_str().unwrap_or_default();
        let mut body = proposed.clone();
        if let Some(fields) = body.as_object_mut() {
            fields.remove("ticket");
        }
        let change = Change::new("ticket.update", ticket, body);
        receipts.push(ctx.commit(env.target.as_ref(), &change, Idempotency::Idempotent)?);
    }

    let applied = receipts.iter().filter(|r| r.applied).count();
    info!(changes = receipts.len(), applied, "tracker updates processed");
    Ok(json!({
        "changes": receipts.len(),
        "applied": applied,
        "receipts": receipts,
    }))
}
