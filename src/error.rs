use thiserror::Error;

#[derive(Error, Debug)]
pub enum NormalizationError {
    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Malformed document: {0}")]
    MalformedDocument(String),

    #[error("Quota exceeded: {0}")]
    QuotaExceeded(String),

    /// The message is safe to show to callers; upstream detail is logged where the failure occurs.
    #[error("AI provider error: {0}")]
    AiProvider(String),

    #[error("Invalid transition for template {template_id}: cannot {action} a template in state '{from}'")]
    InvalidTransition {
        template_id: String,
        from: String,
        action: String,
    },

    #[error("Table '{table_name}' already exists in organization '{org_scope}'")]
    DuplicateTable {
        table_name: String,
        org_scope: String,
    },

    #[error("Failed to create table '{table_name}'; the transaction was rolled back")]
    TransactionFailure { table_name: String },

    #[error("Document {document_id} already has an active template ({template_id})")]
    ActiveTemplateExists {
        document_id: String,
        template_id: String,
    },

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl NormalizationError {
    /// Whether resubmitting the same request may succeed without caller changes.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            NormalizationError::AiProvider(_)
                | NormalizationError::TransactionFailure { .. }
                | NormalizationError::Task(_)
        )
    }

    /// Errors caused by the request itself rather than by the system.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            NormalizationError::ValidationError(_)
                | NormalizationError::Unauthorized(_)
                | NormalizationError::MalformedDocument(_)
                | NormalizationError::QuotaExceeded(_)
                | NormalizationError::InvalidTransition { .. }
                | NormalizationError::DuplicateTable { .. }
                | NormalizationError::ActiveTemplateExists { .. }
                | NormalizationError::NotFound { .. }
        )
    }

    pub(crate) fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        NormalizationError::NotFound {
            entity,
            id: id.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, NormalizationError>;
