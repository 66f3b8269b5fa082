//! Side-effecting stages behind the write gate.
//!
//! The gate is consulted on every commit, the computed change is always
//! stored locally first, and a rejected push fails the stage without losing
//! that local copy.

use std::fs;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde_json::json;

use stagehand::core::backoff::RetryPolicy;
use stagehand::core::types::FAILED_STAGE;
use stagehand::definition::PipelineDefinition;
use stagehand::errors::{MutationRejected, MutationTimedOut, RetriesExhausted, StageFailed};
use stagehand::io::mutation::{Change, CommandTarget, MutationTarget};
use stagehand::io::write_gate::{GatePolicy, WriteGate};
use stagehand::pipeline::StagePipeline;
use stagehand::retry::Idempotency;
use stagehand::stage::from_fn;
use stagehand::test_support::{RecordingTarget, TestSessions};

/// `compute -> push`; `compute` counts how often the expensive work runs.
fn publish_pipeline(
    target: Arc<dyn MutationTarget + Send + Sync>,
    computed: Arc<AtomicUsize>,
) -> PipelineDefinition {
    PipelineDefinition::builder()
        .stage(
            "compute",
            from_fn(move |_| {
                computed.fetch_add(1, Ordering::SeqCst);
                Ok(json!({"summary": "expensive result"}))
            }),
        )
        .stage(
            "push",
            from_fn(move |ctx| {
                let summary = ctx.require("compute")?.clone();
                let change = Change::new("note.create", "n-1", summary);
                let receipt = ctx.commit(target.as_ref(), &change, Idempotency::NonIdempotent)?;
                Ok(json!({"applied": receipt.applied}))
            }),
        )
        .build()
        .expect("definition")
}

/// With no policy configured the gate is closed, the target is never called,
/// and the change still lands in the session's artifacts.
#[test]
fn default_gate_keeps_changes_local() {
    let sessions = TestSessions::new().expect("sessions");
    let target = Arc::new(RecordingTarget::default());
    let outcome = StagePipeline::open(
        publish_pipeline(target.clone(), Arc::new(AtomicUsize::new(0))),
        "local",
        sessions.store(),
        sessions.artifacts("local"),
        WriteGate::new(GatePolicy::default()),
    )
    .expect("open")
    .run()
    .expect("run");

    assert_eq!(outcome.output("push"), Some(&json!({"applied": false})));
    assert!(target.applied().is_empty());
    let stored = sessions
        .artifacts("local")
        .read("push.n-1")
        .expect("read")
        .expect("local copy");
    assert_eq!(stored["body"], json!({"summary": "expensive result"}));
}

#[test]
fn open_gate_applies_change() {
    let sessions = TestSessions::new().expect("sessions");
    let target = Arc::new(RecordingTarget::default());
    StagePipeline::open(
        publish_pipeline(target.clone(), Arc::new(AtomicUsize::new(0))),
        "live",
        sessions.store(),
        sessions.artifacts("live"),
        WriteGate::new(GatePolicy::Fixed(true)),
    )
    .expect("open")
    .run()
    .expect("run");

    let applied = target.applied();
    assert_eq!(applied.len(), 1);
    assert_eq!(applied[0].label(), "note.create:n-1");
}

/// A rejected push fails the run after the local copy is written. Resuming
/// reruns only the push stage, never the expensive compute stage.
#[test]
fn rejected_push_fails_stage_but_keeps_computed_result() {
    let sessions = TestSessions::new().expect("sessions");
    let computed = Arc::new(AtomicUsize::new(0));
    let rejecting = Arc::new(RecordingTarget::rejecting("permission denied"));

    let err = StagePipeline::open(
        publish_pipeline(rejecting.clone(), Arc::clone(&computed)),
        "reject",
        sessions.store(),
        sessions.artifacts("reject"),
        WriteGate::new(GatePolicy::Fixed(true)),
    )
    .expect("open")
    .run()
    .unwrap_err();

    assert_eq!(err.downcast_ref::<StageFailed>().expect("stage failed").stage, "push");
    assert!(err.downcast_ref::<MutationRejected>().is_some());
    let state = sessions.persisted("reject").expect("load").expect("state");
    assert_eq!(state.stage, FAILED_STAGE);
    assert!(state.stage_outputs.contains_key("compute"));
    assert!(
        sessions
            .artifacts("reject")
            .read("push.n-1")
            .expect("read")
            .is_some()
    );

    let accepting = Arc::new(RecordingTarget::default());
    let outcome = StagePipeline::open(
        publish_pipeline(accepting.clone(), Arc::clone(&computed)),
        "reject",
        sessions.store(),
        sessions.artifacts("reject"),
        WriteGate::new(GatePolicy::Fixed(true)),
    )
    .expect("reopen")
    .run()
    .expect("resume");

    assert_eq!(outcome.executed, vec!["push"]);
    assert_eq!(computed.load(Ordering::SeqCst), 1);
    assert_eq!(accepting.applied().len(), 1);
}

/// The policy file is re-read on every check, so flipping it mid-run takes
/// effect for the next side-effecting stage.
#[test]
fn file_policy_is_requeried_per_commit() {
    let sessions = TestSessions::new().expect("sessions");
    let policy = sessions.dir().join("write-policy");
    fs::write(&policy, "off\n").expect("write policy");

    let target = Arc::new(RecordingTarget::default());
    let definition = PipelineDefinition::builder()
        .stage("first", {
            let target = target.clone();
            from_fn(move |ctx| {
                let change = Change::new("note.create", "first", json!({}));
                let receipt = ctx.commit(target.as_ref(), &change, Idempotency::NonIdempotent)?;
                Ok(json!({"applied": receipt.applied}))
            })
        })
        .stage("second", {
            let target = target.clone();
            from_fn(move |ctx| {
                let change = Change::new("note.create", "second", json!({}));
                let receipt = ctx.commit(target.as_ref(), &change, Idempotency::NonIdempotent)?;
                Ok(json!({"applied": receipt.applied}))
            })
        })
        .build()
        .expect("definition");

    let mut pipeline = StagePipeline::open(
        definition,
        "toggle",
        sessions.store(),
        sessions.artifacts("toggle"),
        WriteGate::new(GatePolicy::File(policy.clone())),
    )
    .expect("open");

    pipeline.step().expect("first");
    fs::write(&policy, "on\n").expect("flip policy");
    pipeline.step().expect("second");

    let outputs = &pipeline.state().stage_outputs;
    assert_eq!(outputs["first"], json!({"applied": false}));
    assert_eq!(outputs["second"], json!({"applied": true}));
    let applied: Vec<String> = target.applied().iter().map(|c| c.key.clone()).collect();
    assert_eq!(applied, vec!["second"]);
}

/// Runs a single `push` stage against a target that never answers in time and
/// returns the stage error plus how many times the target was invoked.
#[cfg(unix)]
fn push_to_slow_target(idempotency: Idempotency) -> (anyhow::Error, usize) {
    let sessions = TestSessions::new().expect("sessions");
    let calls = sessions.dir().join("calls");
    let script = format!("echo call >> '{}'; exec sleep 5", calls.display());
    let target = CommandTarget::new(
        vec!["sh".to_string(), "-c".to_string(), script],
        Duration::from_millis(200),
    );
    let definition = PipelineDefinition::builder()
        .stage(
            "push",
            from_fn(move |ctx| {
                let change = Change::new("note.create", "n-1", json!({"text": "hi"}));
                let receipt = ctx.commit(&target, &change, idempotency)?;
                Ok(json!({"applied": receipt.applied}))
            }),
        )
        .build()
        .expect("definition");

    let err = StagePipeline::open(
        definition,
        "slow",
        sessions.store(),
        sessions.artifacts("slow"),
        WriteGate::new(GatePolicy::Fixed(true)),
    )
    .expect("open")
    .with_mutation_retry(RetryPolicy::immediate(3))
    .run()
    .unwrap_err();
    let invoked = fs::read_to_string(&calls)
        .map(|text| text.lines().count())
        .unwrap_or(0);
    (err, invoked)
}

/// A timed-out mutation is transient: an idempotent change is retried up to the cap.
#[cfg(unix)]
#[test]
fn timed_out_idempotent_mutation_is_retried() {
    let (err, invoked) = push_to_slow_target(Idempotency::Idempotent);
    assert_eq!(invoked, 3);
    assert_eq!(
        err.downcast_ref::<RetriesExhausted>().expect("exhausted").attempts,
        3
    );
    assert!(err.downcast_ref::<MutationTimedOut>().is_some());
    assert!(err.downcast_ref::<StageFailed>().is_some());
}

#[cfg(unix)]
#[test]
fn timed_out_non_idempotent_mutation_runs_once() {
    let (err, invoked) = push_to_slow_target(Idempotency::NonIdempotent);
    assert_eq!(invoked, 1);
    assert!(err.downcast_ref::<MutationTimedOut>().is_some());
}
