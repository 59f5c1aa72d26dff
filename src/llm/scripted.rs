//! Scripted provider for tests and offline runs.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::LlmError;
use crate::llm::provider::{GenerateReply, GenerateRequest, ModelProvider};

const PROVIDER_NAME: &str = "scripted";

/// Replays a queue of canned replies, optionally after a delay.
///
/// Structured generation goes through the default trait implementation, so a
/// scripted prose reply exercises the same parse/validation paths a real
/// model would.
#[derive(Debug)]
pub struct ScriptedProvider {
    replies: Mutex<VecDeque<Result<String, LlmError>>>,
    delay: Option<Duration>,
    requests: Mutex<Vec<GenerateRequest>>,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self {
            replies: Mutex::new(VecDeque::new()),
            delay: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Provider that answers calls with the given replies, in order.
    pub fn with_replies<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let queue: VecDeque<_> = replies.into_iter().map(|r| Ok(r.into())).collect();
        Self {
            replies: Mutex::new(queue),
            delay: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Sleep this long before answering; combined with an engine deadline
    /// shorter than the delay it simulates a provider timeout.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub async fn push_reply(&self, reply: impl Into<String>) {
        self.replies.lock().await.push_back(Ok(reply.into()));
    }

    pub async fn push_error(&self, error: LlmError) {
        self.replies.lock().await.push_back(Err(error));
    }

    /// Requests seen so far, for assertions.
    pub async fn requests(&self) -> Vec<GenerateRequest> {
        self.requests.lock().await.clone()
    }
}

impl Default for ScriptedProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ModelProvider for ScriptedProvider {
    fn name(&self) -> &str {
        PROVIDER_NAME
    }

    async fn generate(&self, req: GenerateRequest) -> Result<GenerateReply, LlmError> {
        self.requests.lock().await.push(req);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        match self.replies.lock().await.pop_front() {
            Some(Ok(text)) => Ok(GenerateReply { text }),
            Some(Err(error)) => Err(error),
            None => Err(LlmError::RequestFailed {
                provider: PROVIDER_NAME.to_string(),
                reason: "no scripted reply queued".to_string(),
            }),
        }
    }
}
