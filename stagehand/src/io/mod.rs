//! Side-effecting adapters for the engine.

pub mod artifacts;
pub mod config;
pub mod fs;
pub mod generator;
pub mod mutation;
pub mod process;
pub mod state_store;
pub mod write_gate;
