use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClinflowError {
    // Model backend errors
    #[error("Model request failed: {0}")]
    LlmRequest(String),

    #[error("Model provider not supported: {0}")]
    UnsupportedProvider(String),

    #[error("Model response parse error: {0}")]
    LlmParse(String),

    // Capability errors
    #[error("Capability not found: {0}")]
    CapabilityNotFound(String),

    #[error("Capability failed: {capability}: {message}")]
    CapabilityFailed { capability: String, message: String },

    // Run errors
    #[error("Invalid encounter input: {0}")]
    InvalidInput(String),

    #[error("No checkpoint for run: {0}")]
    CheckpointNotFound(String),

    #[error("Run {run_id} is not awaiting confirmation (position: {position})")]
    NotAwaitingConfirmation { run_id: String, position: String },

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Storage errors
    #[error("Database error: {0}")]
    Database(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ClinflowError>;
