use crate::chunker::{estimate_tokens, Chunk};
use crate::config::AiConfig;
use crate::error::{NormalizationError, Result};
use crate::guardrail::{ModelPricing, ReservationRequest, UsageGuardrail, UsageRecord};
use crate::keyed_lock::KeyedLocks;
use crate::lifecycle::TemplateStatus;
use crate::llm::prompts::{build_user_prompt, SYSTEM_PROMPT_TEMPLATE_INFERENCE};
use crate::llm::provider::TemplateProvider;
use crate::llm::types::{ModelRequest, ModelResponse};
use crate::materializer::{is_reserved_column, MAX_COLUMNS, MAX_TABLE_NAME_LEN};
use crate::schema::{Document, InferredTemplate, LogicalType, NormalizationTemplate, TemplateColumn};
use crate::store::{self, Store};
use crate::utils::{clean_json_output, sanitize_identifier, short_id};
use chrono::Utc;
use log::{error, info, warn};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

const DEFAULT_CONFIDENCE: f64 = 0.85;
// Room left in the table name for "_" plus the eight-character document suffix.
const MAX_BASE_NAME_LEN: usize = 40;

/// Turns a document sample into a draft template, with every model call gated by the
/// usage guardrail and recorded in the usage log.
#[derive(Clone)]
pub struct TemplateGenerator {
    provider: Arc<dyn TemplateProvider>,
    guardrail: UsageGuardrail,
    store: Store,
    pricing: ModelPricing,
    timeout: Duration,
    max_output_tokens: u64,
    generating: KeyedLocks<Uuid>,
}

impl TemplateGenerator {
    pub fn new(
        provider: Arc<dyn TemplateProvider>,
        guardrail: UsageGuardrail,
        store: Store,
        ai: &AiConfig,
    ) -> Self {
        Self {
            provider,
            guardrail,
            store,
            pricing: ModelPricing::from_config(ai),
            timeout: Duration::from_secs(ai.request_timeout_secs),
            max_output_tokens: ai.max_output_tokens,
            generating: KeyedLocks::new(),
        }
    }

    pub fn provider(&self) -> &Arc<dyn TemplateProvider> {
        &self.provider
    }

    pub async fn validate_credential(&self, api_key: &str) -> bool {
        self.provider.validate_credential(api_key).await
    }

    pub async fn generate_template(
        &self,
        document_id: Uuid,
        sample: &Chunk,
    ) -> Result<NormalizationTemplate> {
        let document = self
            .store
            .call(move |conn| store::get_document(conn, document_id))
            .await
            .map_err(|e| match e {
                NormalizationError::NotFound { .. } => {
                    NormalizationError::ValidationError(format!("unknown document {}", document_id))
                }
                other => other,
            })?;

        // One generation per document at a time, from the active check to the insert.
        let _slot = self.generating.lock(document_id).await;

        // Fail before spending anything if a new draft could not be stored anyway.
        let active = self
            .store
            .call(move |conn| store::active_template(conn, document_id))
            .await?;
        if let Some(active) = active {
            return Err(NormalizationError::ActiveTemplateExists {
                document_id: document_id.to_string(),
                template_id: active.id.to_string(),
            });
        }

        if !self.provider.has_well_formed_credential() {
            error!(
                "Template generation for document {} refused: AI credential missing or malformed",
                document_id
            );
            return Err(NormalizationError::AiProvider(
                "the AI provider credential is missing or malformed".to_string(),
            ));
        }

        let request = ModelRequest {
            system_prompt: SYSTEM_PROMPT_TEMPLATE_INFERENCE.to_string(),
            user_prompt: build_user_prompt(&document, &sample.content),
            max_output_tokens: self.max_output_tokens,
        };
        let input_tokens =
            (estimate_tokens(&request.system_prompt) + estimate_tokens(&request.user_prompt)) as u64;
        let estimated_cost = self.pricing.estimate_cost(input_tokens, self.max_output_tokens);

        let reservation = self.guardrail.reserve(ReservationRequest {
            estimated_tokens: input_tokens + self.max_output_tokens,
            estimated_cost,
            model: self.provider.model().to_string(),
            document_id: Some(document_id.to_string()),
        })?;
        self.persist_usage(reservation.record().clone()).await?;

        let outcome = match tokio::time::timeout(self.timeout, self.provider.generate(&request)).await
        {
            Ok(Ok(response)) => parse_response(&response).map(|inferred| (inferred, response)),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(NormalizationError::AiProvider(format!(
                "the AI provider did not respond within {}s",
                self.timeout.as_secs()
            ))),
        };

        let (inferred, response) = match outcome {
            Ok(parsed) => parsed,
            Err(e) => {
                let released = self.guardrail.record_actual(reservation, 0, 0.0);
                self.persist_usage(released).await?;
                error!("Template generation for document {} failed: {}", document_id, e);
                return Err(as_provider_error(e));
            }
        };

        let (actual_tokens, actual_cost) = match response.usage {
            Some(usage) => (
                usage.total(),
                self.pricing
                    .estimate_cost(usage.prompt_tokens, usage.completion_tokens),
            ),
            None => (reservation.estimated_tokens(), reservation.estimated_cost()),
        };
        let reconciled = self
            .guardrail
            .record_actual(reservation, actual_tokens, actual_cost);
        self.persist_usage(reconciled).await?;

        let mut template = match template_from_inference(&document, inferred, self.provider.model()) {
            Ok(template) => template,
            Err(e) => {
                error!("Template generation for document {} failed: {}", document_id, e);
                return Err(e);
            }
        };

        let template = self
            .store
            .call(move |conn| {
                template.version = store::next_template_version(conn, template.document_id)?;
                store::insert_template(conn, &template)?;
                Ok(template)
            })
            .await?;

        info!(
            "Generated draft template {} (v{}) for document {} with {} columns",
            template.id,
            template.version,
            document_id,
            template.columns.len()
        );
        Ok(template)
    }

    async fn persist_usage(&self, record: UsageRecord) -> Result<()> {
        self.store
            .call(move |conn| store::insert_usage_record(conn, &record))
            .await
    }
}

fn parse_response(response: &ModelResponse) -> Result<InferredTemplate> {
    let cleaned = clean_json_output(&response.content);
    serde_json::from_str(&cleaned).map_err(|e| {
        warn!("Unparseable model reply: {}", e);
        NormalizationError::AiProvider("the AI provider returned a malformed template".to_string())
    })
}

fn as_provider_error(e: NormalizationError) -> NormalizationError {
    match e {
        NormalizationError::AiProvider(_) => e,
        other => NormalizationError::AiProvider(format!("template generation failed: {}", other)),
    }
}

/// Table names get a document-derived suffix so two documents proposing the same name
/// never collide in an organization.
pub fn derive_table_name(proposed: &str, document_id: Uuid) -> String {
    let mut base = sanitize_identifier(proposed);
    if base == "field" {
        base = "document".to_string();
    }
    if base.starts_with("sqlite_") || base.starts_with("pg_") {
        base = format!("t_{}", base);
    }
    base.truncate(MAX_BASE_NAME_LEN);
    let base = base.trim_end_matches('_');

    format!("{}_{}", base, short_id(&document_id.simple().to_string()))
}

/// Target names are sanitized, deduplicated and moved off the system column names.
pub fn normalize_columns(columns: Vec<crate::schema::InferredColumn>) -> Vec<TemplateColumn> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();

    for column in columns {
        if out.len() == MAX_COLUMNS {
            warn!("Model proposed more than {} columns; extra columns dropped", MAX_COLUMNS);
            break;
        }

        let raw = if column.target_field.trim().is_empty() {
            &column.source_field
        } else {
            &column.target_field
        };
        let mut name = sanitize_identifier(raw);
        name.truncate(MAX_TABLE_NAME_LEN - 6);
        if is_reserved_column(&name) {
            name = format!("{}_field", name);
        }

        let mut candidate = name.clone();
        let mut n = 2;
        while !seen.insert(candidate.clone()) {
            candidate = format!("{}_{}", name, n);
            n += 1;
        }

        out.push(TemplateColumn {
            source_field: column.source_field,
            target_field: candidate,
            logical_type: LogicalType::from_inferred(&column.logical_type),
            transform: column.transform.filter(|t| !t.trim().is_empty()),
        });
    }
    out
}

pub fn template_from_inference(
    document: &Document,
    inferred: InferredTemplate,
    model: &str,
) -> Result<NormalizationTemplate> {
    let columns = normalize_columns(inferred.columns);
    if columns.is_empty() {
        return Err(NormalizationError::AiProvider(
            "the AI provider proposed a template with no columns".to_string(),
        ));
    }

    let confidence = inferred
        .confidence
        .filter(|c| c.is_finite() && (0.0..=1.0).contains(c))
        .unwrap_or(DEFAULT_CONFIDENCE);
    let now = Utc::now();

    Ok(NormalizationTemplate {
        id: Uuid::new_v4(),
        document_id: document.id,
        table_name: derive_table_name(&inferred.table_name, document.id),
        columns,
        status: TemplateStatus::Draft,
        version: 1,
        model: model.to_string(),
        confidence: Some(confidence),
        created_at: now,
        updated_at: now,
    })
}
