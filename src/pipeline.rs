use crate::blob_store::{BlobId, BlobStore, InMemoryBlobStore, StoredBlob};
use crate::chunker::{chunk_text, estimate_tokens, Chunk};
use crate::config::PipelineConfig;
use crate::error::{NormalizationError, Result};
use crate::guardrail::{UsageGuardrail, UsageStats};
use crate::identity::CallerIdentity;
use crate::ingestion::{ledger_rows, LedgerColumns};
use crate::keyed_lock::KeyedLocks;
use crate::lifecycle::{ApprovalOutcome, DraftLifecycle};
use crate::llm::{TemplateGenerator, TemplateProvider};
use crate::materializer::{PhysicalTable, ProposedColumn, SchemaMaterializer, SchemaValidationReport};
use crate::parser::{decode_text, scan, ParseOptions, RowIter, SourceType};
use crate::schema::{Document, NormalizationTemplate};
use crate::statements::{self, ExtractionOptions, FinancialStatements};
use crate::store::{self, Store};
use crate::utils::DecimalMark;
use chrono::Utc;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::io::Read;
use std::sync::Arc;
use tokio::io::AsyncRead;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadResult {
    pub document_id: Uuid,
    pub content_hash: String,
    pub row_count: u64,
    /// The bytes matched an earlier upload and were not parsed again.
    pub deduplicated: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateTableResult {
    pub table_name: String,
    pub physical_name: String,
    /// `false` when the template was already materialized in this organization.
    pub created: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialCheck {
    pub valid: bool,
}

/// Entry point wiring parsing, generation, review and materialization over one store.
#[derive(Clone)]
pub struct Pipeline {
    config: Arc<PipelineConfig>,
    store: Store,
    blobs: Arc<dyn BlobStore>,
    guardrail: UsageGuardrail,
    generator: TemplateGenerator,
    lifecycle: DraftLifecycle,
    materializer: SchemaMaterializer,
    uploads: KeyedLocks<BlobId>,
}

impl Pipeline {
    /// Opens the store and replays the persisted usage log into the guardrail, so the
    /// spending cap survives restarts.
    pub async fn new(
        config: PipelineConfig,
        provider: Arc<dyn TemplateProvider>,
        blobs: Arc<dyn BlobStore>,
    ) -> Result<Self> {
        config.validate()?;

        let store = match &config.database_path {
            Some(path) => Store::open(path)?,
            None => Store::open_in_memory()?,
        };

        let guardrail =
            UsageGuardrail::new(config.guardrail.clone()).with_sink(Arc::new(store.clone()));
        let records = store.call(|conn| store::list_usage_records(conn)).await?;
        if !records.is_empty() {
            guardrail.restore(&records);
        }

        let generator = TemplateGenerator::new(provider, guardrail.clone(), store.clone(), &config.ai);

        Ok(Self {
            lifecycle: DraftLifecycle::new(store.clone()),
            materializer: SchemaMaterializer::new(store.clone()),
            config: Arc::new(config),
            store,
            blobs,
            guardrail,
            generator,
            uploads: KeyedLocks::new(),
        })
    }

    pub async fn in_memory(config: PipelineConfig, provider: Arc<dyn TemplateProvider>) -> Result<Self> {
        Self::new(config, provider, Arc::new(InMemoryBlobStore::new())).await
    }

    /// Production wiring: the OpenAI-compatible client and, when `blob_dir` is set,
    /// blobs on disk.
    #[cfg(feature = "openai")]
    pub async fn from_config(config: PipelineConfig) -> Result<Self> {
        let provider = Arc::new(crate::llm::OpenAiClient::from_config(&config.ai)?);
        let blobs: Arc<dyn BlobStore> = match &config.blob_dir {
            Some(dir) => Arc::new(crate::blob_store::FsBlobStore::open(dir.clone()).await?),
            None => Arc::new(InMemoryBlobStore::new()),
        };
        Self::new(config, provider, blobs).await
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn guardrail(&self) -> &UsageGuardrail {
        &self.guardrail
    }

    pub async fn upload(&self, file_name: Option<&str>, bytes: Vec<u8>) -> Result<UploadResult> {
        self.upload_stream(file_name, bytes.as_slice()).await
    }

    /// Streams the upload into the blob store while hashing it, then parses it back from
    /// the stored blob. Concurrent uploads of the same bytes serialize on the hash, so
    /// exactly one of them creates the document.
    pub async fn upload_stream<R>(&self, file_name: Option<&str>, mut reader: R) -> Result<UploadResult>
    where
        R: AsyncRead + Unpin + Send,
    {
        let blob = self
            .blobs
            .put_stream(&mut reader, self.config.max_upload_bytes)
            .await?;
        let _slot = self.uploads.lock(blob.id.clone()).await;
        self.register(file_name, blob).await
    }

    async fn register(&self, file_name: Option<&str>, blob: StoredBlob) -> Result<UploadResult> {
        let lookup = blob.id.clone();
        let existing = self
            .store
            .call(move |conn| store::find_document_by_hash(conn, &lookup))
            .await?;
        if let Some(document) = existing {
            debug!("Upload matches document {} ({})", document.id, blob.id);
            return Ok(UploadResult {
                document_id: document.id,
                content_hash: document.content_hash,
                row_count: document.row_count,
                deduplicated: true,
            });
        }

        let options = ParseOptions {
            source_hint: file_name.and_then(SourceType::from_file_name),
        };
        let blobs = self.blobs.clone();
        let id = blob.id.clone();
        let summary =
            tokio::task::spawn_blocking(move || scan(blobs.reader(&id)?, &options)).await??;

        let document = Document {
            id: Uuid::new_v4(),
            content_hash: blob.id,
            source_type: summary.source_type,
            file_name: file_name.map(str::to_string),
            encoding: summary.encoding,
            delimiter: summary.delimiter,
            headers: summary.headers,
            row_count: summary.row_count,
            byte_len: blob.byte_len,
            created_at: Utc::now(),
        };
        let document = self
            .store
            .call(move |conn| store::insert_document(conn, &document))
            .await?;

        info!(
            "Stored document {} ({} rows, {}, {})",
            document.id,
            document.row_count,
            document.source_type.as_str(),
            document.encoding
        );
        Ok(UploadResult {
            document_id: document.id,
            content_hash: document.content_hash,
            row_count: document.row_count,
            deduplicated: false,
        })
    }

    pub async fn document(&self, document_id: Uuid) -> Result<Document> {
        self.store
            .call(move |conn| store::get_document(conn, document_id))
            .await
    }

    async fn known_document(&self, document_id: Uuid) -> Result<Document> {
        self.document(document_id).await.map_err(|e| match e {
            NormalizationError::NotFound { .. } => {
                NormalizationError::ValidationError(format!("unknown document {}", document_id))
            }
            other => other,
        })
    }

    /// Header plus the first `sample_rows` records for delimited documents, the first
    /// chunk for text.
    async fn sample_chunk(&self, document: &Document) -> Result<Chunk> {
        let source_type = document.source_type;
        let delimiter = document.delimiter.unwrap_or(',');
        let sample_rows = self.config.sample_rows;
        let chunk_size = self.config.chunk_size;
        let blobs = self.blobs.clone();
        let id = document.content_hash.clone();

        tokio::task::spawn_blocking(move || -> Result<Chunk> {
            let mut reader = blobs.reader(&id)?;
            match source_type {
                SourceType::Delimited => {
                    let options = ParseOptions {
                        source_hint: Some(SourceType::Delimited),
                    };
                    let mut rows = RowIter::with_options(reader, &options)?;
                    let mut writer = csv::WriterBuilder::new()
                        .delimiter(delimiter as u8)
                        .from_writer(Vec::new());
                    writer.write_record(rows.headers())?;
                    for row in rows.by_ref().take(sample_rows) {
                        writer.write_record(&row?.fields)?;
                    }
                    let bytes = writer
                        .into_inner()
                        .map_err(|e| NormalizationError::IoError(e.into_error()))?;
                    let content = String::from_utf8_lossy(&bytes).into_owned();
                    Ok(Chunk {
                        index: 0,
                        estimated_tokens: estimate_tokens(&content),
                        content,
                    })
                }
                SourceType::Text => {
                    let mut bytes = Vec::new();
                    reader.read_to_end(&mut bytes)?;
                    chunk_text(&decode_text(&bytes)?, chunk_size)?
                        .into_iter()
                        .next()
                        .ok_or_else(|| {
                            NormalizationError::MalformedDocument(
                                "document has no text content".to_string(),
                            )
                        })
                }
            }
        })
        .await?
    }

    pub async fn generate_template(&self, document_id: Uuid) -> Result<NormalizationTemplate> {
        let document = self.known_document(document_id).await?;
        let sample = self.sample_chunk(&document).await?;
        self.generator.generate_template(document_id, &sample).await
    }

    pub async fn chunk_document(&self, document_id: Uuid) -> Result<Vec<Chunk>> {
        let document = self.known_document(document_id).await?;
        let bytes = self.blobs.get(&document.content_hash).await?;
        let chunk_size = self.config.chunk_size;
        tokio::task::spawn_blocking(move || chunk_text(&decode_text(&bytes)?, chunk_size)).await?
    }

    pub async fn approve_draft(
        &self,
        identity: &CallerIdentity,
        draft_id: Uuid,
    ) -> Result<ApprovalOutcome> {
        let org = identity.require_org_user()?;
        self.lifecycle.approve(draft_id, &org).await
    }

    pub async fn reject_draft(&self, draft_id: Uuid) -> Result<NormalizationTemplate> {
        self.lifecycle.reject(draft_id).await
    }

    pub async fn template(&self, template_id: Uuid) -> Result<NormalizationTemplate> {
        self.lifecycle.template(template_id).await
    }

    pub async fn template_versions(&self, document_id: Uuid) -> Result<Vec<NormalizationTemplate>> {
        self.lifecycle.versions(document_id).await
    }

    /// Materializes an approved template in the caller's organization. Idempotent per
    /// organization: a second call reports the existing table with `created: false`.
    pub async fn create_table(
        &self,
        identity: &CallerIdentity,
        schema_id: Uuid,
    ) -> Result<CreateTableResult> {
        let org = identity.require_org_user()?;
        let template = self.lifecycle.template(schema_id).await?;

        let org_key = org.to_string();
        let existing = self
            .store
            .call(move |conn| store::find_physical_table_for_template(conn, &org_key, schema_id))
            .await?;
        if let Some(table) = existing {
            return Ok(CreateTableResult {
                table_name: table.table_name,
                physical_name: table.physical_name,
                created: false,
            });
        }

        let table = self.materializer.materialize(&template, &org).await?;
        Ok(CreateTableResult {
            table_name: table.table_name,
            physical_name: table.physical_name,
            created: true,
        })
    }

    pub async fn list_tables(&self, identity: &CallerIdentity) -> Result<Vec<PhysicalTable>> {
        let org = identity.org_scope()?;
        self.materializer.list_tables(&org).await
    }

    pub async fn drop_table(&self, identity: &CallerIdentity, table_name: &str) -> Result<PhysicalTable> {
        let org = identity.require_org_user()?;
        self.materializer.drop_table(&org, table_name).await
    }

    pub async fn validate_proposed_schema(
        &self,
        identity: &CallerIdentity,
        table_name: Option<String>,
        columns: Vec<ProposedColumn>,
    ) -> Result<SchemaValidationReport> {
        let org = identity.org_scope()?;
        self.materializer
            .validate_proposed_schema(&org, table_name, columns)
            .await
    }

    pub fn usage_stats(&self) -> UsageStats {
        self.guardrail.usage_stats()
    }

    pub async fn check_credential(&self, api_key: &str) -> CredentialCheck {
        CredentialCheck {
            valid: self.generator.validate_credential(api_key).await,
        }
    }

    /// Balance sheet and income statement computed from the document's rows, without
    /// any model call.
    pub async fn extract_statements(
        &self,
        document_id: Uuid,
        options: &ExtractionOptions,
    ) -> Result<FinancialStatements> {
        let document = self.known_document(document_id).await?;
        if document.source_type != SourceType::Delimited {
            return Err(NormalizationError::ValidationError(format!(
                "document {} is not tabular; statements need a delimited ledger",
                document_id
            )));
        }

        let options = options.clone();
        let mark = options
            .decimal_mark
            .unwrap_or_else(|| DecimalMark::for_delimiter(document.delimiter));
        let blobs = self.blobs.clone();
        tokio::task::spawn_blocking(move || -> Result<FinancialStatements> {
            let parse = ParseOptions {
                source_hint: Some(SourceType::Delimited),
            };
            let rows = RowIter::with_options(blobs.reader(&document.content_hash)?, &parse)?;
            let columns = match options.columns {
                Some(columns) => columns,
                None => LedgerColumns::detect(rows.headers())?,
            };
            let ledger = ledger_rows(&columns, mark, rows)?;
            Ok(statements::extract_statements(&ledger, &options))
        })
        .await?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::StubProvider;
    use crate::parser::content_hash;
    use crate::schema::{InferredColumn, InferredTemplate};
    use std::time::Duration;

    fn stub() -> Arc<StubProvider> {
        Arc::new(StubProvider::new(&InferredTemplate {
            table_name: "ledger".to_string(),
            columns: vec![InferredColumn {
                source_field: "amount".to_string(),
                target_field: "amount".to_string(),
                logical_type: "decimal".to_string(),
                transform: None,
            }],
            confidence: None,
        }))
    }

    #[tokio::test]
    async fn test_upload_is_idempotent() {
        let pipeline = Pipeline::in_memory(PipelineConfig::default(), stub()).await.unwrap();
        let bytes = b"account_code;amount\n1.01;10\n1.02;20\n".to_vec();

        let first = pipeline.upload(Some("a.csv"), bytes.clone()).await.unwrap();
        let second = pipeline.upload(Some("b.csv"), bytes).await.unwrap();
        assert!(!first.deduplicated);
        assert!(second.deduplicated);
        assert_eq!(first.document_id, second.document_id);
        assert_eq!(first.row_count, 2);
        assert!(pipeline.uploads.is_empty());
    }

    #[tokio::test]
    async fn test_abandoned_upload_leaves_no_lock_entry() {
        let pipeline = Pipeline::in_memory(PipelineConfig::default(), stub()).await.unwrap();
        let bytes = b"account_code;amount\n1.01;10\n".to_vec();

        let held = pipeline.uploads.lock(content_hash(&bytes)).await;
        let waited = tokio::time::timeout(
            Duration::from_millis(50),
            pipeline.upload(Some("a.csv"), bytes.clone()),
        )
        .await;
        assert!(waited.is_err());
        assert_eq!(pipeline.uploads.len(), 1);

        drop(held);
        assert!(pipeline.uploads.is_empty());

        let upload = pipeline.upload(Some("a.csv"), bytes).await.unwrap();
        assert!(!upload.deduplicated);
        assert!(pipeline.uploads.is_empty());
    }

    #[tokio::test]
    async fn test_streamed_upload_is_parsed_from_the_blob() {
        let pipeline = Pipeline::in_memory(PipelineConfig::default(), stub()).await.unwrap();
        let mut csv = String::from("account_code;amount\n");
        for i in 0..5000 {
            csv.push_str(&format!("1.{:04};{},00\n", i, i));
        }
        let bytes = csv.into_bytes();

        let streamed = pipeline
            .upload_stream(Some("big.csv"), tokio::io::BufReader::with_capacity(4096, bytes.as_slice()))
            .await
            .unwrap();
        assert_eq!(streamed.row_count, 5000);
        assert_eq!(streamed.content_hash, content_hash(&bytes));

        let document = pipeline.document(streamed.document_id).await.unwrap();
        assert_eq!(document.byte_len, bytes.len() as u64);
        assert_eq!(document.delimiter, Some(';'));

        let buffered = pipeline.upload(None, bytes).await.unwrap();
        assert!(buffered.deduplicated);
        assert_eq!(buffered.document_id, streamed.document_id);
    }

    #[tokio::test]
    async fn test_oversized_upload_is_rejected() {
        let config = PipelineConfig {
            max_upload_bytes: 8,
            ..PipelineConfig::default()
        };
        let pipeline = Pipeline::in_memory(config, stub()).await.unwrap();

        let err = pipeline
            .upload_stream(None, &b"0123456789abcdef"[..])
            .await
            .unwrap_err();
        assert!(matches!(err, NormalizationError::ValidationError(_)));
    }

    #[tokio::test]
    async fn test_sample_is_header_plus_leading_rows() {
        let config = PipelineConfig {
            sample_rows: 2,
            ..PipelineConfig::default()
        };
        let pipeline = Pipeline::in_memory(config, stub()).await.unwrap();
        let upload = pipeline
            .upload(None, b"code;amount\n1;10\n2;20\n3;30\n".to_vec())
            .await
            .unwrap();

        let document = pipeline.known_document(upload.document_id).await.unwrap();
        let sample = pipeline.sample_chunk(&document).await.unwrap();
        let lines: Vec<&str> = sample.content.lines().collect();
        assert_eq!(lines, vec!["code;amount", "1;10", "2;20"]);
    }

    #[tokio::test]
    async fn test_unknown_document_is_validation_error() {
        let pipeline = Pipeline::in_memory(PipelineConfig::default(), stub()).await.unwrap();
        let err = pipeline.generate_template(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, NormalizationError::ValidationError(_)));
    }
}
