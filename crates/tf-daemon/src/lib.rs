//! Orchestration layer of taskforge.
//!
//! - `scheduler`: pure wave planning over a task graph snapshot
//! - `orchestrator`: the control loop that owns task status and drives
//!   sessions, validation and retries
//! - `control`: store-level operations behind the control surface
//! - `daemon`: process host with ctrl-c shutdown

pub mod control;
pub mod daemon;
pub mod orchestrator;
pub mod scheduler;
