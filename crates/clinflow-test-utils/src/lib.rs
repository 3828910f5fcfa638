//! Mock model backends and encounter fixtures shared by Clinflow tests.

pub mod backend;
pub mod fixtures;

pub use backend::{FailingBackend, ScriptedBackend};
pub use fixtures::*;
