//! Dream cycle orchestration.
//!
//! `cycle` runs the external engine without blocking the caller and owns the observable
//! cycle state. `controller` is the command surface presentation layers drive, and
//! `post_process` refreshes the store and builds notifications once a cycle ends.

mod controller;
mod cycle;
mod post_process;

pub(crate) use controller::{run_controller, Core, CoreEvent, UiCommand};
pub use cycle::{CycleResult, CycleState, DreamOrchestrator, OrchestratorConfig};
