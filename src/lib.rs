//! # Financial Schema Builder
//!
//! A library for turning heterogeneous financial uploads (ledger exports, trial balances,
//! SPED/ECD extracts, free-text statements) into reviewed relational tables, plus a
//! deterministic path to multi-year financial statements.
//!
//! ## Core Concepts
//!
//! - **Document**: an upload identified by the SHA-256 of its bytes; identical uploads
//!   resolve to the same document
//! - **Normalization Template**: a model-proposed table schema for a document, versioned
//!   and moved through `draft -> approved | rejected` by a human reviewer
//! - **Usage Guardrail**: every model call reserves its estimated cost first; calls that
//!   would exceed the hard cap fail with `QuotaExceeded`
//! - **Materialization**: approving a draft creates `org_<org>__<table>` and registers it in
//!   one transaction
//! - **Financial Statements**: balance sheet and income statement rolled up the chart of
//!   accounts, with horizontal and vertical analysis, computed without any model call
//!
//! ## Example
//!
//! ```rust,ignore
//! use financial_schema_builder::*;
//! use std::sync::Arc;
//!
//! let pipeline = Pipeline::in_memory(PipelineConfig::default(), Arc::new(provider)).await?;
//!
//! let upload = pipeline.upload(Some("ledger.csv"), bytes).await?;
//! let draft = pipeline.generate_template(upload.document_id).await?;
//!
//! let identity = CallerIdentity::new("user-1", "acme");
//! let outcome = pipeline.approve_draft(&identity, draft.id).await?;
//! println!("created {}", outcome.table.physical_name);
//!
//! let statements = pipeline
//!     .extract_statements(upload.document_id, &ExtractionOptions::default())
//!     .await?;
//! println!("{}", statements.balance_sheet.to_csv()?);
//! ```

pub mod blob_store;
pub mod chart_of_accounts;
pub mod chunker;
pub mod config;
pub mod error;
pub mod guardrail;
pub mod identity;
pub mod ingestion;
pub mod keyed_lock;
pub mod lifecycle;
pub mod llm;
pub mod materializer;
pub mod parser;
pub mod pipeline;
pub mod schema;
pub mod statements;
pub mod store;
pub mod utils;

pub use blob_store::{BlobId, BlobStore, FsBlobStore, InMemoryBlobStore, StoredBlob};
pub use chart_of_accounts::{AccountEntry, ChartOfAccounts};
pub use chunker::{chunk_text, estimate_tokens, Chunk};
pub use config::{AiConfig, GuardrailConfig, PipelineConfig};
pub use error::{NormalizationError, Result};
pub use guardrail::{
    ModelPricing, Reservation, ReservationRequest, UsageGuardrail, UsageKind, UsageRecord,
    UsageSink, UsageStats,
};
pub use identity::{CallerIdentity, OrgScope};
pub use ingestion::{ledger_rows, BalanceNature, LedgerColumns, LedgerRow};
pub use keyed_lock::KeyedLocks;
pub use lifecycle::{ApprovalOutcome, DraftLifecycle, LifecycleAction, TemplateStatus};
pub use llm::{StubProvider, TemplateGenerator, TemplateProvider};
pub use materializer::{
    PhysicalColumn, PhysicalTable, ProposedColumn, SchemaMaterializer, SchemaValidationReport,
    StorageType,
};
pub use parser::{ParseOptions, ParseSummary, Row, RowIter, SourceType, TextEncoding};
pub use pipeline::{CreateTableResult, CredentialCheck, Pipeline, UploadResult};
pub use schema::*;
pub use statements::{
    extract_statements, ExtractionOptions, FinancialStatement, FinancialStatementRow,
    FinancialStatements, StatementKind, StatementLayout,
};
pub use store::Store;
pub use utils::DecimalMark;
