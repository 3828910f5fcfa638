//! Clinical run graph.
//!
//! A run alternates between the orchestrator and one capability step until the
//! orchestrator answers `end`. The state is checkpointed after every step. The
//! only suspend point is the confirmation gate in front of the emergency
//! protocol: the run is persisted there and returned as
//! `RunOutcome::Interrupted` until `ClinicalGraph::resume` supplies a decision.

pub mod gate;
pub mod runtime;

pub use runtime::{ClinicalGraph, RunOutcome};
