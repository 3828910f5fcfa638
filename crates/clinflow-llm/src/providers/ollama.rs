use std::time::Duration;

use futures::future::BoxFuture;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use clinflow_core::config::ModelConfig;
use clinflow_core::error::{ClinflowError, Result};
use clinflow_core::traits::ModelBackend;
use clinflow_core::types::CompletionRequest;

const OLLAMA_BASE_URL: &str = "http://localhost:11434";

/// Native Ollama client using the non-streaming `/api/generate` endpoint.
pub struct OllamaClient {
    http: Client,
}

impl OllamaClient {
    pub fn new() -> Self {
        Self {
            http: Client::new(),
        }
    }
}

impl Default for OllamaClient {
    fn default() -> Self {
        Self::new()
    }
}

// Request types
#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    images: Vec<String>,
    options: GenerateOptions<'a>,
}

#[derive(Serialize)]
struct GenerateOptions<'a> {
    temperature: f32,
    num_ctx: u32,
    num_predict: u32,
    #[serde(skip_serializing_if = "<[String]>::is_empty")]
    stop: &'a [String],
}

// Response types
#[derive(Deserialize, Debug)]
struct GenerateResponse {
    #[serde(default)]
    response: String,
    #[serde(default)]
    error: Option<String>,
}

fn generate_url(config: &ModelConfig) -> String {
    let base = config.base_url.as_deref().unwrap_or(OLLAMA_BASE_URL);
    format!("{}/api/generate", base.trim_end_matches('/'))
}

impl ModelBackend for OllamaClient {
    fn complete(
        &self,
        config: &ModelConfig,
        request: CompletionRequest,
    ) -> BoxFuture<'_, Result<String>> {
        let config = config.clone();

        Box::pin(async move {
            let body = GenerateRequest {
                model: &config.model_id,
                prompt: &request.prompt,
                stream: false,
                images: request.images,
                options: GenerateOptions {
                    temperature: config.temperature,
                    num_ctx: config.context_length,
                    num_predict: config.max_tokens,
                    stop: &config.stop,
                },
            };

            let response = self
                .http
                .post(generate_url(&config))
                .timeout(Duration::from_secs(config.request_timeout_secs))
                .json(&body)
                .send()
                .await
                .map_err(|e| ClinflowError::LlmRequest(e.to_string()))?;

            if !response.status().is_success() {
                let status = response.status();
                let body = response
                    .text()
                    .await
                    .unwrap_or_else(|_| "unknown".to_string());
                return Err(ClinflowError::LlmRequest(format!("HTTP {}: {}", status, body)));
            }

            let parsed: GenerateResponse = response
                .json()
                .await
                .map_err(|e| ClinflowError::LlmParse(e.to_string()))?;

            if let Some(err) = parsed.error {
                return Err(ClinflowError::LlmRequest(err));
            }

            debug!(
                model = %config.model_id,
                chars = parsed.response.len(),
                "Ollama completion received"
            );
            Ok(parsed.response)
        })
    }

    fn name(&self) -> &str {
        "ollama"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_url() {
        let mut config = ModelConfig::ollama("medgemma-chw");
        assert_eq!(generate_url(&config), "http://localhost:11434/api/generate");
        config.base_url = Some("http://gpu-box:11434/".into());
        assert_eq!(generate_url(&config), "http://gpu-box:11434/api/generate");
    }

    #[test]
    fn test_request_body_shape() {
        let config = ModelConfig::ollama("medgemma-chw");
        let body = GenerateRequest {
            model: &config.model_id,
            prompt: "JSON:",
            stream: false,
            images: vec![],
            options: GenerateOptions {
                temperature: config.temperature,
                num_ctx: config.context_length,
                num_predict: config.max_tokens,
                stop: &config.stop,
            },
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["stream"], false);
        assert_eq!(json["options"]["num_ctx"], 4096);
        assert_eq!(json["options"]["stop"][0], "<end_of_turn>");
        assert!(json.get("images").is_none());
    }
}
