use crate::error::Result;
use crate::llm::types::{ModelRequest, ModelResponse};
use async_trait::async_trait;

/// A model backend able to turn a document sample into a template proposal.
#[async_trait]
pub trait TemplateProvider: Send + Sync {
    fn model(&self) -> &str;

    /// Cheap local check of the configured credential, done before any spend is reserved.
    fn has_well_formed_credential(&self) -> bool;

    async fn generate(&self, request: &ModelRequest) -> Result<ModelResponse>;

    /// Checks `api_key` against the provider without generating anything.
    async fn validate_credential(&self, api_key: &str) -> bool;
}

/// OpenAI-style secret keys: `sk-` prefix, no whitespace, plausible length.
pub fn is_well_formed_key(key: &str) -> bool {
    key.starts_with("sk-")
        && key.len() >= 20
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}
