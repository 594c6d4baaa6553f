use crate::error::{NormalizationError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;

pub const DEFAULT_CHUNK_SIZE: usize = 800;
pub const DEFAULT_MODEL: &str = "gpt-4-turbo-preview";
pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Top-level configuration for a [`crate::Pipeline`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// SQLite database file. `None` keeps everything in memory.
    pub database_path: Option<PathBuf>,
    /// Directory for raw uploads. `None` uses the in-memory blob store.
    pub blob_dir: Option<PathBuf>,
    /// Chunk size in estimated tokens.
    pub chunk_size: usize,
    /// Number of data rows included in the sample sent to the model for delimited documents.
    pub sample_rows: usize,
    pub max_upload_bytes: u64,
    pub ai: AiConfig,
    pub guardrail: GuardrailConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AiConfig {
    pub model: String,
    pub api_key: Option<String>,
    pub base_url: String,
    pub request_timeout_secs: u64,
    /// Output budget used both for the request and for pre-flight cost estimates.
    pub max_output_tokens: u64,
    pub input_cost_per_1k: f64,
    pub output_cost_per_1k: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardrailConfig {
    /// Reservations that would push cumulative cost above this fail with `QuotaExceeded`.
    pub hard_cap_usd: f64,
    /// Usage stats carry a warning once cumulative cost reaches this amount.
    pub advisory_limit_usd: f64,
    pub max_calls_per_document: Option<u32>,
    pub max_calls_per_hour: Option<u32>,
    pub max_tokens_per_request: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            database_path: None,
            blob_dir: None,
            chunk_size: DEFAULT_CHUNK_SIZE,
            sample_rows: 25,
            max_upload_bytes: 50 * 1024 * 1024,
            ai: AiConfig::default(),
            guardrail: GuardrailConfig::default(),
        }
    }
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            api_key: None,
            base_url: DEFAULT_BASE_URL.to_string(),
            request_timeout_secs: 30,
            max_output_tokens: 500,
            input_cost_per_1k: 0.01,
            output_cost_per_1k: 0.03,
        }
    }
}

impl Default for GuardrailConfig {
    fn default() -> Self {
        Self {
            hard_cap_usd: 5.0,
            advisory_limit_usd: 1.0,
            max_calls_per_document: Some(20),
            max_calls_per_hour: Some(30),
            max_tokens_per_request: 10_000,
        }
    }
}

impl GuardrailConfig {
    /// Only the hard cap applies; used when a caller wants pure budget semantics.
    pub fn with_cap(hard_cap_usd: f64) -> Self {
        Self {
            hard_cap_usd,
            advisory_limit_usd: hard_cap_usd,
            max_calls_per_document: None,
            max_calls_per_hour: None,
            max_tokens_per_request: u64::MAX,
        }
    }
}

impl PipelineConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overlaid with `FSB_*` environment variables and `OPENAI_API_KEY`.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(path) = std::env::var("FSB_DATABASE_PATH") {
            config.database_path = Some(PathBuf::from(path));
        }
        if let Ok(dir) = std::env::var("FSB_BLOB_DIR") {
            config.blob_dir = Some(PathBuf::from(dir));
        }
        if let Some(size) = env_parse("FSB_CHUNK_SIZE")? {
            config.chunk_size = size;
        }
        if let Some(rows) = env_parse("FSB_SAMPLE_ROWS")? {
            config.sample_rows = rows;
        }
        if let Some(bytes) = env_parse("FSB_MAX_UPLOAD_BYTES")? {
            config.max_upload_bytes = bytes;
        }

        if let Ok(key) = std::env::var("OPENAI_API_KEY") {
            config.ai.api_key = Some(key);
        }
        if let Ok(model) = std::env::var("FSB_MODEL") {
            config.ai.model = model;
        }
        if let Ok(url) = std::env::var("FSB_AI_BASE_URL") {
            config.ai.base_url = url;
        }
        if let Some(secs) = env_parse("FSB_AI_TIMEOUT_SECS")? {
            config.ai.request_timeout_secs = secs;
        }

        if let Some(cap) = env_parse("FSB_HARD_CAP_USD")? {
            config.guardrail.hard_cap_usd = cap;
        }
        if let Some(limit) = env_parse("FSB_ADVISORY_LIMIT_USD")? {
            config.guardrail.advisory_limit_usd = limit;
        }
        if let Some(calls) = env_parse("FSB_MAX_CALLS_PER_DOCUMENT")? {
            config.guardrail.max_calls_per_document = Some(calls);
        }
        if let Some(calls) = env_parse("FSB_MAX_CALLS_PER_HOUR")? {
            config.guardrail.max_calls_per_hour = Some(calls);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(NormalizationError::ValidationError(
                "chunk_size must be greater than zero".to_string(),
            ));
        }
        if self.sample_rows == 0 {
            return Err(NormalizationError::ValidationError(
                "sample_rows must be greater than zero".to_string(),
            ));
        }
        if !(self.guardrail.hard_cap_usd > 0.0) {
            return Err(NormalizationError::ValidationError(format!(
                "hard cap must be positive, got {}",
                self.guardrail.hard_cap_usd
            )));
        }
        if self.guardrail.advisory_limit_usd < 0.0 {
            return Err(NormalizationError::ValidationError(
                "advisory limit cannot be negative".to_string(),
            ));
        }
        if self.ai.request_timeout_secs == 0 {
            return Err(NormalizationError::ValidationError(
                "AI request timeout must be at least one second".to_string(),
            ));
        }
        Ok(())
    }
}

fn env_parse<T: FromStr>(name: &str) -> Result<Option<T>> {
    match std::env::var(name) {
        Ok(raw) => raw.trim().parse::<T>().map(Some).map_err(|_| {
            NormalizationError::ValidationError(format!("{} has an invalid value: {}", name, raw))
        }),
        Err(_) => Ok(None),
    }
}
