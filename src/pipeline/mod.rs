//! Import pipeline.
//!
//! A job flows through:
//! 1. `registry::resolve_steps()` — enabled steps in declared order
//! 2. `Orchestrator::run()` — probe, execute, apply the failure policy
//! 3. `hooks` — best-effort finalization
//!
//! **Steps never run in parallel.** Later steps read artifacts of earlier ones.

pub mod hooks;
pub mod orchestrator;
pub mod registry;

pub use orchestrator::{Orchestrator, PipelineOutcome, RunControl, StepResult};
