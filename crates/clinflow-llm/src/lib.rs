pub mod providers;
pub mod recovery;
pub mod retry;

use clinflow_core::config::ModelConfig;
use clinflow_core::error::{ClinflowError, Result};
use clinflow_core::traits::ModelBackend;

pub use providers::ollama::OllamaClient;
pub use providers::openai::OpenAiClient;
pub use recovery::OutputRecoveryParser;
pub use retry::RetryPolicy;

/// Create a model backend based on the provider name.
pub fn create_client(config: &ModelConfig) -> Result<Box<dyn ModelBackend>> {
    match config.provider.as_str() {
        "ollama" => Ok(Box::new(OllamaClient::new())),
        "openai" | "openai-compatible" | "vllm" | "llama-cpp" | "lmstudio" => {
            Ok(Box::new(OpenAiClient::new()))
        }
        other => Err(ClinflowError::UnsupportedProvider(other.to_string())),
    }
}
