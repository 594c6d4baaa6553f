use crate::error::{NormalizationError, Result};
use crate::llm::provider::TemplateProvider;
use crate::llm::types::{ModelRequest, ModelResponse, TokenUsage};
use crate::schema::InferredTemplate;
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

#[derive(Debug, Clone)]
enum StubReply {
    Content(String),
    Fail(String),
}

/// Deterministic provider for tests and offline runs. Always answers with the same
/// configured reply and counts how often it was called.
#[derive(Debug)]
pub struct StubProvider {
    model: String,
    reply: StubReply,
    usage: Option<TokenUsage>,
    delay: Option<Duration>,
    credential_ok: bool,
    calls: AtomicUsize,
}

impl StubProvider {
    pub fn new(template: &InferredTemplate) -> Self {
        let content = serde_json::to_string(template).unwrap_or_default();
        Self::from_raw(content)
    }

    /// Replies with `content` verbatim, e.g. prose around JSON or something unparseable.
    pub fn from_raw(content: impl Into<String>) -> Self {
        Self {
            model: "stub".to_string(),
            reply: StubReply::Content(content.into()),
            usage: None,
            delay: None,
            credential_ok: true,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            reply: StubReply::Fail(message.into()),
            ..Self::from_raw(String::new())
        }
    }

    pub fn with_usage(mut self, prompt_tokens: u64, completion_tokens: u64) -> Self {
        self.usage = Some(TokenUsage {
            prompt_tokens,
            completion_tokens,
        });
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_invalid_credential(mut self) -> Self {
        self.credential_ok = false;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TemplateProvider for StubProvider {
    fn model(&self) -> &str {
        &self.model
    }

    fn has_well_formed_credential(&self) -> bool {
        self.credential_ok
    }

    async fn generate(&self, _request: &ModelRequest) -> Result<ModelResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        match &self.reply {
            StubReply::Content(content) => Ok(ModelResponse {
                content: content.clone(),
                usage: self.usage,
            }),
            StubReply::Fail(message) => Err(NormalizationError::AiProvider(message.clone())),
        }
    }

    async fn validate_credential(&self, _api_key: &str) -> bool {
        self.credential_ok
    }
}
