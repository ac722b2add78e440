//! Graduated validation of worker output.
//!
//! - **Checks**: the [`checks::CheckExecutor`] seam plus the default executor
//!   for commands and file assertions.
//! - **Engine**: level selection, check planning and ordered reporting.

pub mod checks;
pub mod engine;
