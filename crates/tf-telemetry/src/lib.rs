//! Logging and span helpers shared by the taskforge binaries.
//!
//! - **Logging**: human-readable or JSON lines via `tracing-subscriber`, always
//!   on stderr so command output on stdout stays machine-readable.
//! - **Spans**: trace-id carrying spans for one orchestrator run, each wave and
//!   each agent session.

pub mod logging;
pub mod tracing_setup;
