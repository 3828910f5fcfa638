pub mod config;
pub mod error;
pub mod event;
pub mod state;
pub mod traits;
pub mod types;

pub use config::AppConfig;
pub use error::{ClinflowError, Result};
pub use event::ProgressBus;
pub use state::{EncounterInput, StatePatch, WorkflowState};
pub use types::*;
