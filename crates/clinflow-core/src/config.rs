use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{ClinflowError, Result};

/// Top-level Clinflow configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub model: ModelConfig,
    /// Model used for image analysis. Falls back to `model` when absent.
    #[serde(default)]
    pub vision_model: Option<ModelConfig>,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub workflow: WorkflowConfig,
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
    #[serde(default)]
    pub log: Option<LogConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    pub model_id: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// Context window passed to backends that accept one (Ollama `num_ctx`).
    #[serde(default = "default_context_length")]
    pub context_length: u32,
    #[serde(default = "default_stop")]
    pub stop: Vec<String>,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl ModelConfig {
    /// Ollama model with default sampling settings.
    pub fn ollama(model_id: impl Into<String>) -> Self {
        Self {
            provider: default_provider(),
            model_id: model_id.into(),
            api_key: None,
            base_url: None,
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            context_length: default_context_length(),
            stop: default_stop(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

fn default_provider() -> String { "ollama".to_string() }
fn default_max_tokens() -> u32 { 2048 }
fn default_temperature() -> f32 { 0.3 }
fn default_context_length() -> u32 { 4096 }
fn default_stop() -> Vec<String> { vec!["<end_of_turn>".to_string()] }
fn default_request_timeout() -> u64 { 120 }

/// Bounded retry for capability model calls. No backoff.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
        }
    }
}

fn default_max_retries() -> u32 { 2 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowConfig {
    /// Upper bound on orchestrator decisions per run.
    #[serde(default = "default_max_transitions")]
    pub max_transitions: usize,
    /// Buffered events per progress channel.
    #[serde(default = "default_progress_capacity")]
    pub progress_capacity: usize,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            max_transitions: default_max_transitions(),
            progress_capacity: default_progress_capacity(),
        }
    }
}

fn default_max_transitions() -> usize { 24 }
fn default_progress_capacity() -> usize { 256 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// SQLite database file for run checkpoints.
    #[serde(default = "default_checkpoint_path")]
    pub path: String,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            path: default_checkpoint_path(),
        }
    }
}

fn default_checkpoint_path() -> String { "clinflow_checkpoints.db".to_string() }

/// JSONL progress logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Enable progress logging (default: true when section is present).
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// Directory for log files.
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_log_enabled(),
            log_dir: default_log_dir(),
        }
    }
}

fn default_log_enabled() -> bool { true }
fn default_log_dir() -> String { "logs".to_string() }

impl AppConfig {
    /// Config with a single Ollama model and every other section defaulted.
    pub fn for_model(model: ModelConfig) -> Self {
        Self {
            model,
            vision_model: None,
            retry: RetryConfig::default(),
            workflow: WorkflowConfig::default(),
            checkpoint: CheckpointConfig::default(),
            log: None,
        }
    }

    /// Load config from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| ClinflowError::ConfigNotFound(path.display().to_string()))?;

        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(&content);

        toml::from_str(&expanded).map_err(|e| ClinflowError::Config(e.to_string()))
    }

    pub fn vision_model(&self) -> &ModelConfig {
        self.vision_model.as_ref().unwrap_or(&self.model)
    }

    pub fn checkpoint_path(&self) -> PathBuf {
        expand_home(&self.checkpoint.path)
    }

    /// Log directory when JSONL logging is enabled.
    pub fn log_dir(&self) -> Option<PathBuf> {
        self.log
            .as_ref()
            .filter(|l| l.enabled)
            .map(|l| expand_home(&l.log_dir))
    }
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs_home() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                Err(_) => {
                    // Keep original if env var not set
                    result.push_str(&format!("${{{}}}", var_name));
                }
            }
        } else {
            result.push(c);
        }
    }
    result
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_env_vars() {
        std::env::set_var("TEST_CLINFLOW_VAR", "hello");
        let result = expand_env_vars("key = \"${TEST_CLINFLOW_VAR}\"");
        assert_eq!(result, "key = \"hello\"");
        std::env::remove_var("TEST_CLINFLOW_VAR");
    }

    #[test]
    fn test_expand_env_vars_missing() {
        let result = expand_env_vars("key = \"${NONEXISTENT_CLINFLOW_VAR}\"");
        assert_eq!(result, "key = \"${NONEXISTENT_CLINFLOW_VAR}\"");
    }

    #[test]
    fn test_defaults_from_minimal_toml() {
        let toml_str = r#"
[model]
model_id = "medgemma-chw"
"#;
        let config: AppConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.model.provider, "ollama");
        assert_eq!(config.model.temperature, 0.3);
        assert_eq!(config.model.context_length, 4096);
        assert_eq!(config.model.max_tokens, 2048);
        assert_eq!(config.model.stop, vec!["<end_of_turn>"]);
        assert_eq!(config.retry.max_retries, 2);
        assert_eq!(config.workflow.max_transitions, 24);
        assert!(config.log_dir().is_none());
        assert_eq!(config.vision_model().model_id, "medgemma-chw");
    }

    #[test]
    fn test_vision_model_override() {
        let toml_str = r#"
[model]
model_id = "medgemma-chw"

[vision_model]
model_id = "isic-medgemma"
temperature = 0.1
context_length = 512
"#;
        let config: AppConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.vision_model().model_id, "isic-medgemma");
        assert_eq!(config.vision_model().context_length, 512);
    }
}
