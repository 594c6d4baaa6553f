use crate::config::AiConfig;
use crate::error::{NormalizationError, Result};
use crate::llm::provider::{is_well_formed_key, TemplateProvider};
use crate::llm::types::*;
use async_trait::async_trait;
use log::{debug, error, warn};
use reqwest::Client;
use std::time::Duration;

/// Chat-completions client for OpenAI and compatible endpoints.
#[derive(Clone)]
pub struct OpenAiClient {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
}

impl OpenAiClient {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            api_key: api_key.into(),
            base_url: crate::config::DEFAULT_BASE_URL.to_string(),
            model: model.into(),
        }
    }

    /// A missing key is accepted here and reported by `has_well_formed_credential`,
    /// so a pipeline can still start and serve everything except generation.
    pub fn from_config(ai: &AiConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(ai.request_timeout_secs))
            .build()
            .map_err(|e| {
                error!("Failed to build HTTP client: {}", e);
                NormalizationError::AiProvider("could not initialize the AI client".to_string())
            })?;

        Ok(Self {
            client,
            api_key: ai.api_key.clone().unwrap_or_default(),
            base_url: ai.base_url.trim_end_matches('/').to_string(),
            model: ai.model.clone(),
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }
}

fn transport_error(e: reqwest::Error) -> NormalizationError {
    error!("AI request failed: {}", e);
    if e.is_timeout() {
        NormalizationError::AiProvider("the AI provider did not respond in time".to_string())
    } else {
        NormalizationError::AiProvider("could not reach the AI provider".to_string())
    }
}

#[async_trait]
impl TemplateProvider for OpenAiClient {
    fn model(&self) -> &str {
        &self.model
    }

    fn has_well_formed_credential(&self) -> bool {
        is_well_formed_key(&self.api_key)
    }

    async fn generate(&self, request: &ModelRequest) -> Result<ModelResponse> {
        let url = format!("{}/chat/completions", self.base_url);
        let payload = ChatCompletionRequest::json_object(&self.model, request);

        let res = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .await
            .map_err(transport_error)?;
        let status = res.status();

        if !status.is_success() {
            let err_text = res.text().await.unwrap_or_default();
            error!("AI provider returned status {}: {}", status, err_text);
            return Err(NormalizationError::AiProvider(format!(
                "AI provider rejected the request (status {})",
                status.as_u16()
            )));
        }

        let body: ChatCompletionResponse = res.json().await.map_err(transport_error)?;
        debug!("Received completion from {}", self.model);

        body.into_model_response().ok_or_else(|| {
            NormalizationError::AiProvider("AI provider returned an empty completion".to_string())
        })
    }

    async fn validate_credential(&self, api_key: &str) -> bool {
        if !is_well_formed_key(api_key) {
            return false;
        }

        let url = format!("{}/models", self.base_url);
        match self.client.get(&url).bearer_auth(api_key).send().await {
            Ok(res) => res.status().is_success(),
            Err(e) => {
                warn!("Credential check could not reach the provider: {}", e);
                false
            }
        }
    }
}
