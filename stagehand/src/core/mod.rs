//! Pure logic shared by the engine.
//!
//! Nothing here touches the filesystem or spawns processes. Modules operate
//! on in-memory values and are tested in isolation.

pub mod backoff;
pub mod extract;
pub mod schema;
pub mod types;
