use std::future::Future;

use tracing::warn;

use clinflow_core::config::RetryConfig;
use clinflow_core::error::Result;

/// Bounded retry around a single model call.
///
/// No backoff: each attempt is already tens of seconds long. The last error
/// is returned unchanged; callers route it to their fallback.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    max_retries: u32,
}

impl RetryPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self { max_retries }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(config.max_retries)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_retries + 1
    }

    pub async fn invoke<T, F, Fut>(&self, name: &str, mut f: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            match f().await {
                Ok(value) => return Ok(value),
                Err(e) if attempt < self.max_retries => {
                    attempt += 1;
                    warn!(
                        capability = name,
                        attempt,
                        max_retries = self.max_retries,
                        error = %e,
                        "Retrying capability call"
                    );
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}
