//! Resumable multi-stage execution over an unreliable generative backend.
//!
//! A pipeline is an ordered list of named stages, some grouped into iterative
//! sections that repeat until a convergence predicate holds or a pass cap is
//! reached. Every completed stage is checkpointed, so a crashed or failed run
//! resumes at the first stage without a persisted result.
//!
//! - **[`core`]**: Pure logic (state types, response extraction, backoff
//!   schedule, payload schema checks). No I/O.
//! - **[`io`]**: Side-effecting adapters (state store, artifacts, config,
//!   generator and mutation processes, write gate).
//!
//! [`pipeline`] drives a [`definition`] through [`stage`] handlers, using
//! [`iteration`] for pass accounting and [`retry`] around external calls.
//! [`workflows`] holds the concrete pipelines exposed by the CLI.

pub mod core;
pub mod definition;
pub mod errors;
pub mod exit_codes;
pub mod io;
pub mod iteration;
pub mod logging;
pub mod pipeline;
pub mod retry;
pub mod stage;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod workflows;
