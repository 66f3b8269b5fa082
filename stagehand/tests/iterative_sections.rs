//! Iterative section behavior across whole runs: pass cap, convergence, and
//! resuming in the middle of a pass.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use serde_json::json;

use stagehand::core::types::{DONE_STAGE, PassSignal};
use stagehand::definition::{IterativeSection, PipelineDefinition};
use stagehand::io::write_gate::WriteGate;
use stagehand::pipeline::StagePipeline;
use stagehand::stage::from_fn;
use stagehand::test_support::{CountingStore, TestSessions};

/// `prepare -> [work -> judge]* -> finish`; `judge` approves from pass `approve_on`.
fn looping(max_iterations: u32, approve_on: Option<u32>) -> PipelineDefinition {
    PipelineDefinition::builder()
        .stage("prepare", from_fn(|_| Ok(json!({"ready": true}))))
        .iterative(
            IterativeSection::new("refine")
                .stage("work", from_fn(|ctx| Ok(json!({"pass": ctx.iteration()}))))
                .stage(
                    "judge",
                    from_fn(move |ctx| {
                        let ok = approve_on.is_some_and(|n| ctx.iteration() >= n);
                        Ok(json!({"ok": ok}))
                    }),
                )
                .converge_when(|outputs| outputs["judge"]["ok"] == json!(true)),
        )
        .stage(
            "finish",
            from_fn(|ctx| Ok(json!({"converged": ctx.converged("refine")}))),
        )
        .max_iterations(max_iterations)
        .build()
        .expect("definition")
}

/// With a predicate that never holds and a cap of 3, the section runs exactly
/// three passes, records three history entries, and the run still finishes
/// with the section marked as not converged.
#[test]
fn never_converging_section_stops_at_cap() {
    let sessions = TestSessions::new().expect("sessions");
    let store = CountingStore::new(sessions.store());
    let outcome = StagePipeline::open(
        looping(3, None),
        "cap",
        &store,
        sessions.artifacts("cap"),
        WriteGate::disabled(),
    )
    .expect("open")
    .run()
    .expect("run");

    assert_eq!(
        outcome.executed,
        vec!["prepare", "work", "judge", "work", "judge", "work", "judge", "finish"]
    );
    assert_eq!(outcome.converged("refine"), Some(false));
    assert_eq!(outcome.output("finish"), Some(&json!({"converged": false})));
    // One checkpoint per stage execution, iteration passes included.
    assert_eq!(store.saves(), outcome.executed.len());

    let state = sessions.persisted("cap").expect("load").expect("state");
    assert_eq!(state.stage, DONE_STAGE);
    assert_eq!(state.history.len(), 3);
    let passes: Vec<u32> = state.history.iter().map(|r| r.iteration).collect();
    assert_eq!(passes, vec![1, 2, 3]);
    assert_eq!(state.history[2].signal, PassSignal::CapReached);
    assert_eq!(state.history[1].outputs["work"], json!({"pass": 2}));
}

#[test]
fn converging_section_stops_early() {
    let sessions = TestSessions::new().expect("sessions");
    let outcome = StagePipeline::open(
        looping(5, Some(2)),
        "early",
        sessions.store(),
        sessions.artifacts("early"),
        WriteGate::disabled(),
    )
    .expect("open")
    .run()
    .expect("run");

    assert_eq!(outcome.converged("refine"), Some(true));
    let state = sessions.persisted("early").expect("load").expect("state");
    assert_eq!(state.history.len(), 2);
    assert_eq!(state.history[0].signal, PassSignal::Continue);
    assert_eq!(state.history[1].signal, PassSignal::Converged);
}

/// A crash between `work` and `judge` on pass 2 resumes at `judge`, still on pass 2.
#[test]
fn resume_mid_pass_keeps_pass_number() {
    let sessions = TestSessions::new().expect("sessions");
    {
        let mut pipeline = StagePipeline::open(
            looping(3, None),
            "mid",
            sessions.store(),
            sessions.artifacts("mid"),
            WriteGate::disabled(),
        )
        .expect("open");
        // prepare, work(1), judge(1), work(2)
        for _ in 0..4 {
            pipeline.step().expect("step");
        }
    }

    let state = sessions.persisted("mid").expect("load").expect("state");
    assert_eq!(state.stage, "judge");
    assert_eq!(state.iteration, 2);
    assert_eq!(state.history.len(), 1);

    let mut resumed = StagePipeline::open(
        looping(3, None),
        "mid",
        sessions.store(),
        sessions.artifacts("mid"),
        WriteGate::disabled(),
    )
    .expect("reopen");
    let next = resumed.step().expect("step").expect("outcome");
    assert_eq!(next.stage, "judge");
    assert_eq!(next.iteration, 2);
    assert_eq!(next.pass, Some(PassSignal::Continue));

    let outcome = resumed.run().expect("run");
    assert_eq!(outcome.executed, vec!["work", "judge", "finish"]);
    let state = sessions.persisted("mid").expect("load").expect("state");
    assert_eq!(state.history.len(), 3);
}

/// Handlers inside a section see the pass number and the previous pass's outputs.
#[test]
fn later_passes_see_previous_outputs() {
    let sessions = TestSessions::new().expect("sessions");
    let seen = Arc::new(AtomicU32::new(0));
    let seen_in_stage = Arc::clone(&seen);
    let definition = PipelineDefinition::builder()
        .iterative(IterativeSection::new("loop").stage(
            "count",
            from_fn(move |ctx| {
                let previous = ctx
                    .output("count")
                    .and_then(|v| v["n"].as_u64())
                    .unwrap_or(0);
                seen_in_stage.store(previous as u32, Ordering::SeqCst);
                Ok(json!({"n": previous + 1}))
            }),
        ))
        .max_iterations(4)
        .build()
        .expect("definition");

    let outcome = StagePipeline::open(
        definition,
        "count",
        sessions.store(),
        sessions.artifacts("count"),
        WriteGate::disabled(),
    )
    .expect("open")
    .run()
    .expect("run");

    assert_eq!(outcome.output("count"), Some(&json!({"n": 4})));
    assert_eq!(seen.load(Ordering::SeqCst), 3);
}
