pub mod capabilities;
pub mod checkpoint;
pub mod executor;
pub mod graph;
pub mod orchestrator;
pub mod registry;
pub mod run_log;

pub use capabilities::{Capability, CapabilityContext};
pub use checkpoint::{MemoryCheckpointer, SqliteCheckpointer};
pub use executor::{Executor, StepOutcome};
pub use graph::{ClinicalGraph, RunOutcome};
pub use orchestrator::{Orchestrator, RoutingDecision};
pub use registry::CapabilityRegistry;
pub use run_log::RunLogger;
