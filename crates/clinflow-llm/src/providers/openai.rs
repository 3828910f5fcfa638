use std::time::Duration;

use futures::future::BoxFuture;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;

use clinflow_core::config::ModelConfig;
use clinflow_core::error::{ClinflowError, Result};
use clinflow_core::traits::ModelBackend;
use clinflow_core::types::CompletionRequest;

const OPENAI_API_URL: &str = "https://api.openai.com/v1/chat/completions";

/// OpenAI-compatible chat client. Works with vLLM, llama.cpp server, LM Studio, etc.
pub struct OpenAiClient {
    http: Client,
}

impl OpenAiClient {
    pub fn new() -> Self {
        Self {
            http: Client::new(),
        }
    }
}

impl Default for OpenAiClient {
    fn default() -> Self {
        Self::new()
    }
}

// Request types
#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<OaiMessage>,
    max_tokens: u32,
    temperature: f32,
    stream: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    stop: Vec<String>,
}

#[derive(Serialize)]
struct OaiMessage {
    role: String,
    content: serde_json::Value,
}

// Response types
#[derive(Deserialize, Debug)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Deserialize, Debug)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize, Debug)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Plain string content, or text + `image_url` parts when images are attached.
fn user_content(request: &CompletionRequest) -> serde_json::Value {
    if request.images.is_empty() {
        return serde_json::Value::String(request.prompt.clone());
    }
    let mut parts = vec![json!({"type": "text", "text": request.prompt})];
    for image in &request.images {
        parts.push(json!({
            "type": "image_url",
            "image_url": {"url": format!("data:image/jpeg;base64,{}", image)},
        }));
    }
    serde_json::Value::Array(parts)
}

impl ModelBackend for OpenAiClient {
    fn complete(
        &self,
        config: &ModelConfig,
        request: CompletionRequest,
    ) -> BoxFuture<'_, Result<String>> {
        let config = config.clone();

        Box::pin(async move {
            let base_url = config.base_url.as_deref().unwrap_or(OPENAI_API_URL);

            let body = ChatRequest {
                model: config.model_id.clone(),
                messages: vec![OaiMessage {
                    role: "user".to_string(),
                    content: user_content(&request),
                }],
                max_tokens: config.max_tokens,
                temperature: config.temperature,
                stream: false,
                stop: config.stop.clone(),
            };

            let mut req = self
                .http
                .post(base_url)
                .timeout(Duration::from_secs(config.request_timeout_secs))
                .json(&body);

            if let Some(api_key) = &config.api_key {
                req = req.header("Authorization", format!("Bearer {}", api_key));
            }

            let response = req
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

            let parsed: ChatResponse = response
                .json()
                .await
                .map_err(|e| ClinflowError::LlmParse(e.to_string()))?;

            parsed
                .choices
                .into_iter()
                .next()
                .and_then(|c| c.message.content)
                .ok_or_else(|| ClinflowError::LlmParse("response has no choices".into()))
        })
    }

    fn name(&self) -> &str {
        "openai"
    }
}
