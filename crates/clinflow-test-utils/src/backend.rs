use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use futures::future::BoxFuture;

use clinflow_core::config::ModelConfig;
use clinflow_core::error::{ClinflowError, Result};
use clinflow_core::traits::ModelBackend;
use clinflow_core::types::CompletionRequest;

#[derive(Clone)]
enum Reply {
    Text(String),
    Fail(String),
}

struct Rule {
    needle: String,
    replies: VecDeque<Reply>,
}

/// Backend answering from a script keyed by prompt substrings.
///
/// The first rule whose needle occurs in the prompt answers. Its replies are
/// consumed in order and the last one repeats. Unmatched prompts fail.
pub struct ScriptedBackend {
    rules: Mutex<Vec<Rule>>,
    prompts: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self {
            rules: Mutex::new(Vec::new()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    fn push(self, needle: &str, reply: Reply) -> Self {
        {
            let mut rules = self.rules.lock().unwrap();
            match rules.iter_mut().find(|r| r.needle == needle) {
                Some(rule) => rule.replies.push_back(reply),
                None => rules.push(Rule {
                    needle: needle.to_string(),
                    replies: VecDeque::from([reply]),
                }),
            }
        }
        self
    }

    /// Queue a text reply for prompts containing `needle`.
    pub fn reply(self, needle: &str, text: impl Into<String>) -> Self {
        self.push(needle, Reply::Text(text.into()))
    }

    /// Queue a request failure for prompts containing `needle`.
    pub fn fail(self, needle: &str, message: &str) -> Self {
        self.push(needle, Reply::Fail(message.to_string()))
    }

    /// Every request received, in order.
    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.prompts.lock().unwrap().clone()
    }

    pub fn calls_matching(&self, needle: &str) -> usize {
        self.prompts
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.prompt.contains(needle))
            .count()
    }
}

impl Default for ScriptedBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl ModelBackend for ScriptedBackend {
    fn complete(
        &self,
        _config: &ModelConfig,
        request: CompletionRequest,
    ) -> BoxFuture<'_, Result<String>> {
        let reply = {
            let mut rules = self.rules.lock().unwrap();
            rules
                .iter_mut()
                .find(|r| request.prompt.contains(&r.needle))
                .and_then(|rule| {
                    if rule.replies.len() > 1 {
                        rule.replies.pop_front()
                    } else {
                        rule.replies.front().cloned()
                    }
                })
        };
        self.prompts.lock().unwrap().push(request);

        Box::pin(async move {
            match reply {
                Some(Reply::Text(text)) => Ok(text),
                Some(Reply::Fail(message)) => Err(ClinflowError::LlmRequest(message)),
                None => Err(ClinflowError::LlmRequest("no scripted reply".into())),
            }
        })
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

/// Backend that is always unreachable.
#[derive(Default)]
pub struct FailingBackend {
    calls: AtomicUsize,
}

impl FailingBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl ModelBackend for FailingBackend {
    fn complete(
        &self,
        _config: &ModelConfig,
        _request: CompletionRequest,
    ) -> BoxFuture<'_, Result<String>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Box::pin(async { Err(ClinflowError::LlmRequest("connection refused".into())) })
    }

    fn name(&self) -> &str {
        "failing"
    }
}
