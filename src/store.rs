//! SQLite persistence for documents, template versions, the usage log and the
//! physical-table registry.
//!
//! The connection sits behind a mutex and all async entry points run their work on the
//! blocking pool, so database I/O never stalls the async runtime.

use crate::error::{NormalizationError, Result};
use crate::guardrail::{UsageKind, UsageRecord, UsageSink};
use crate::lifecycle::TemplateStatus;
use crate::materializer::{PhysicalColumn, PhysicalTable};
use crate::schema::{Document, NormalizationTemplate, TemplateColumn};
use chrono::{DateTime, Utc};
use log::{error, info};
use parking_lot::Mutex;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use std::path::Path;
use std::sync::Arc;
use uuid::Uuid;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS documents (
    id TEXT PRIMARY KEY,
    content_hash TEXT NOT NULL UNIQUE,
    source_type TEXT NOT NULL,
    file_name TEXT,
    encoding TEXT NOT NULL,
    delimiter TEXT,
    headers TEXT NOT NULL,
    row_count INTEGER NOT NULL,
    byte_len INTEGER NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS normalization_templates (
    id TEXT PRIMARY KEY,
    document_id TEXT NOT NULL REFERENCES documents(id),
    table_name TEXT NOT NULL,
    columns TEXT NOT NULL,
    status TEXT NOT NULL CHECK (status IN ('draft', 'approved', 'rejected')),
    version INTEGER NOT NULL,
    model TEXT NOT NULL,
    confidence REAL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    UNIQUE (document_id, version)
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_templates_one_active
    ON normalization_templates(document_id)
    WHERE status IN ('draft', 'approved');

CREATE TABLE IF NOT EXISTS usage_records (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    reservation_id TEXT NOT NULL,
    kind TEXT NOT NULL,
    timestamp TEXT NOT NULL,
    tokens_consumed INTEGER NOT NULL,
    estimated_cost REAL NOT NULL,
    model TEXT NOT NULL,
    document_id TEXT
);

CREATE TABLE IF NOT EXISTS physical_tables (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    org_scope TEXT NOT NULL,
    table_name TEXT NOT NULL,
    physical_name TEXT NOT NULL UNIQUE,
    template_id TEXT NOT NULL REFERENCES normalization_templates(id),
    columns TEXT NOT NULL,
    created_at TEXT NOT NULL,
    UNIQUE (org_scope, table_name)
);

CREATE INDEX IF NOT EXISTS idx_physical_tables_template ON physical_tables(template_id);
"#;

#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        info!("Opened store at {}", path.display());
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Runs `f` against the connection on the blocking pool.
    pub async fn call<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock();
            f(&mut guard)
        })
        .await?
    }

    /// Runs `f` inside an immediate transaction: commit on `Ok`, rollback on `Err`.
    pub async fn transaction<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        self.call(move |conn| with_transaction(conn, f)).await
    }

    /// Synchronous access, for callers already off the async runtime.
    pub fn blocking<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T>,
    {
        let mut guard = self.conn.lock();
        f(&mut guard)
    }
}

impl UsageSink for Store {
    /// Appends on the blocking pool when a runtime is available, inline otherwise.
    fn append(&self, record: UsageRecord) {
        let store = self.clone();
        let write = move || {
            if let Err(e) = store.blocking(|conn| insert_usage_record(conn, &record)) {
                error!(
                    "Failed to persist usage record for reservation {}: {}",
                    record.reservation_id, e
                );
            }
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(write);
            }
            Err(_) => write(),
        }
    }
}

pub fn with_transaction<F, T>(conn: &mut Connection, f: F) -> Result<T>
where
    F: FnOnce(&Connection) -> Result<T>,
{
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let value = f(&tx)?;
    tx.commit()?;
    Ok(value)
}

pub fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

fn conversion_error<E>(idx: usize, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

fn uuid_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Uuid> {
    let raw: String = row.get(idx)?;
    Uuid::parse_str(&raw).map_err(|e| conversion_error(idx, e))
}

fn timestamp_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, e))
}

fn json_at<T: serde::de::DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| conversion_error(idx, e))
}

fn parsed_at<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: std::str::FromStr<Err = NormalizationError>,
{
    let raw: String = row.get(idx)?;
    raw.parse::<T>().map_err(|e| conversion_error(idx, e))
}

const DOCUMENT_COLUMNS: &str = "id, content_hash, source_type, file_name, encoding, delimiter, \
     headers, row_count, byte_len, created_at";

fn document_from_row(row: &Row<'_>) -> rusqlite::Result<Document> {
    let delimiter: Option<String> = row.get(5)?;
    Ok(Document {
        id: uuid_at(row, 0)?,
        content_hash: row.get(1)?,
        source_type: parsed_at(row, 2)?,
        file_name: row.get(3)?,
        encoding: parsed_at(row, 4)?,
        delimiter: delimiter.and_then(|d| d.chars().next()),
        headers: json_at(row, 6)?,
        row_count: row.get::<_, i64>(7)? as u64,
        byte_len: row.get::<_, i64>(8)? as u64,
        created_at: timestamp_at(row, 9)?,
    })
}

/// Inserts the document unless one with the same content hash exists; returns the
/// stored row either way.
pub fn insert_document(conn: &Connection, doc: &Document) -> Result<Document> {
    conn.execute(
        &format!(
            "INSERT INTO documents ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(content_hash) DO NOTHING",
            DOCUMENT_COLUMNS
        ),
        params![
            doc.id.to_string(),
            doc.content_hash,
            doc.source_type.as_str(),
            doc.file_name,
            doc.encoding.as_str(),
            doc.delimiter.map(|d| d.to_string()),
            serde_json::to_string(&doc.headers)?,
            doc.row_count as i64,
            doc.byte_len as i64,
            doc.created_at.to_rfc3339(),
        ],
    )?;
    find_document_by_hash(conn, &doc.content_hash)?
        .ok_or_else(|| NormalizationError::not_found("document", &doc.content_hash))
}

pub fn find_document_by_hash(conn: &Connection, content_hash: &str) -> Result<Option<Document>> {
    Ok(conn
        .query_row(
            &format!("SELECT {} FROM documents WHERE content_hash = ?1", DOCUMENT_COLUMNS),
            params![content_hash],
            document_from_row,
        )
        .optional()?)
}

pub fn get_document(conn: &Connection, id: Uuid) -> Result<Document> {
    conn.query_row(
        &format!("SELECT {} FROM documents WHERE id = ?1", DOCUMENT_COLUMNS),
        params![id.to_string()],
        document_from_row,
    )
    .optional()?
    .ok_or_else(|| NormalizationError::not_found("document", id.to_string()))
}

const TEMPLATE_COLUMNS: &str = "id, document_id, table_name, columns, status, version, model, \
     confidence, created_at, updated_at";

fn template_from_row(row: &Row<'_>) -> rusqlite::Result<NormalizationTemplate> {
    let columns: Vec<TemplateColumn> = json_at(row, 3)?;
    Ok(NormalizationTemplate {
        id: uuid_at(row, 0)?,
        document_id: uuid_at(row, 1)?,
        table_name: row.get(2)?,
        columns,
        status: parsed_at(row, 4)?,
        version: row.get::<_, i64>(5)? as u32,
        model: row.get(6)?,
        confidence: row.get(7)?,
        created_at: timestamp_at(row, 8)?,
        updated_at: timestamp_at(row, 9)?,
    })
}

/// Fails with `ActiveTemplateExists` when the document already has a draft or approved
/// template; the partial unique index enforces this even under concurrent inserts.
pub fn insert_template(conn: &Connection, template: &NormalizationTemplate) -> Result<()> {
    let result = conn.execute(
        &format!(
            "INSERT INTO normalization_templates ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            TEMPLATE_COLUMNS
        ),
        params![
            template.id.to_string(),
            template.document_id.to_string(),
            template.table_name,
            serde_json::to_string(&template.columns)?,
            template.status.as_str(),
            template.version as i64,
            template.model,
            template.confidence,
            template.created_at.to_rfc3339(),
            template.updated_at.to_rfc3339(),
        ],
    );

    match result {
        Ok(_) => Ok(()),
        Err(e) if is_constraint_violation(&e) => {
            match active_template(conn, template.document_id)? {
                Some(active) => Err(NormalizationError::ActiveTemplateExists {
                    document_id: template.document_id.to_string(),
                    template_id: active.id.to_string(),
                }),
                None => Err(e.into()),
            }
        }
        Err(e) => Err(e.into()),
    }
}

pub fn get_template(conn: &Connection, id: Uuid) -> Result<NormalizationTemplate> {
    conn.query_row(
        &format!(
            "SELECT {} FROM normalization_templates WHERE id = ?1",
            TEMPLATE_COLUMNS
        ),
        params![id.to_string()],
        template_from_row,
    )
    .optional()?
    .ok_or_else(|| NormalizationError::not_found("template", id.to_string()))
}

pub fn active_template(conn: &Connection, document_id: Uuid) -> Result<Option<NormalizationTemplate>> {
    Ok(conn
        .query_row(
            &format!(
                "SELECT {} FROM normalization_templates
                 WHERE document_id = ?1 AND status IN ('draft', 'approved')",
                TEMPLATE_COLUMNS
            ),
            params![document_id.to_string()],
            template_from_row,
        )
        .optional()?)
}

pub fn list_templates(conn: &Connection, document_id: Uuid) -> Result<Vec<NormalizationTemplate>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM normalization_templates WHERE document_id = ?1 ORDER BY version",
        TEMPLATE_COLUMNS
    ))?;
    let rows = stmt.query_map(params![document_id.to_string()], template_from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

pub fn next_template_version(conn: &Connection, document_id: Uuid) -> Result<u32> {
    let max: Option<i64> = conn.query_row(
        "SELECT MAX(version) FROM normalization_templates WHERE document_id = ?1",
        params![document_id.to_string()],
        |row| row.get(0),
    )?;
    Ok(max.unwrap_or(0) as u32 + 1)
}

/// Compare-and-swap on status. Returns `false` when the stored status was not `from`.
pub fn transition_status(
    conn: &Connection,
    id: Uuid,
    from: TemplateStatus,
    to: TemplateStatus,
    at: DateTime<Utc>,
) -> Result<bool> {
    let updated = conn.execute(
        "UPDATE normalization_templates SET status = ?1, updated_at = ?2
         WHERE id = ?3 AND status = ?4",
        params![to.as_str(), at.to_rfc3339(), id.to_string(), from.as_str()],
    )?;
    Ok(updated == 1)
}

pub fn insert_usage_record(conn: &Connection, record: &UsageRecord) -> Result<()> {
    conn.execute(
        "INSERT INTO usage_records
            (reservation_id, kind, timestamp, tokens_consumed, estimated_cost, model, document_id)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            record.reservation_id.to_string(),
            record.kind.as_str(),
            record.timestamp.to_rfc3339(),
            record.tokens_consumed,
            record.estimated_cost,
            record.model,
            record.document_id,
        ],
    )?;
    Ok(())
}

pub fn list_usage_records(conn: &Connection) -> Result<Vec<UsageRecord>> {
    let mut stmt = conn.prepare(
        "SELECT reservation_id, kind, timestamp, tokens_consumed, estimated_cost, model, document_id
         FROM usage_records ORDER BY id",
    )?;
    let rows = stmt.query_map([], |row| {
        let kind: String = row.get(1)?;
        Ok(UsageRecord {
            reservation_id: uuid_at(row, 0)?,
            kind: if kind == "reservation" {
                UsageKind::Reservation
            } else {
                UsageKind::Reconciliation
            },
            timestamp: timestamp_at(row, 2)?,
            tokens_consumed: row.get(3)?,
            estimated_cost: row.get(4)?,
            model: row.get(5)?,
            document_id: row.get(6)?,
        })
    })?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

const REGISTRY_COLUMNS: &str =
    "org_scope, table_name, physical_name, template_id, columns, created_at";

fn physical_table_from_row(row: &Row<'_>) -> rusqlite::Result<PhysicalTable> {
    let columns: Vec<PhysicalColumn> = json_at(row, 4)?;
    Ok(PhysicalTable {
        org_scope: row.get(0)?,
        table_name: row.get(1)?,
        physical_name: row.get(2)?,
        template_id: uuid_at(row, 3)?,
        columns,
        created_at: timestamp_at(row, 5)?,
    })
}

pub fn find_physical_table(
    conn: &Connection,
    org_scope: &str,
    table_name: &str,
) -> Result<Option<PhysicalTable>> {
    Ok(conn
        .query_row(
            &format!(
                "SELECT {} FROM physical_tables WHERE org_scope = ?1 AND table_name = ?2",
                REGISTRY_COLUMNS
            ),
            params![org_scope, table_name],
            physical_table_from_row,
        )
        .optional()?)
}

pub fn find_physical_table_for_template(
    conn: &Connection,
    org_scope: &str,
    template_id: Uuid,
) -> Result<Option<PhysicalTable>> {
    Ok(conn
        .query_row(
            &format!(
                "SELECT {} FROM physical_tables WHERE org_scope = ?1 AND template_id = ?2",
                REGISTRY_COLUMNS
            ),
            params![org_scope, template_id.to_string()],
            physical_table_from_row,
        )
        .optional()?)
}

pub fn insert_physical_table(conn: &Connection, table: &PhysicalTable) -> Result<()> {
    conn.execute(
        &format!(
            "INSERT INTO physical_tables ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            REGISTRY_COLUMNS
        ),
        params![
            table.org_scope,
            table.table_name,
            table.physical_name,
            table.template_id.to_string(),
            serde_json::to_string(&table.columns)?,
            table.created_at.to_rfc3339(),
        ],
    )?;
    Ok(())
}

pub fn delete_physical_table(conn: &Connection, org_scope: &str, table_name: &str) -> Result<bool> {
    let deleted = conn.execute(
        "DELETE FROM physical_tables WHERE org_scope = ?1 AND table_name = ?2",
        params![org_scope, table_name],
    )?;
    Ok(deleted == 1)
}

pub fn list_physical_tables(conn: &Connection, org_scope: &str) -> Result<Vec<PhysicalTable>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM physical_tables WHERE org_scope = ?1 ORDER BY created_at, table_name",
        REGISTRY_COLUMNS
    ))?;
    let rows = stmt.query_map(params![org_scope], physical_table_from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

pub fn sqlite_table_exists(conn: &Connection, name: &str) -> Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
        params![name],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::{SourceType, TextEncoding};
    use crate::schema::LogicalType;

    fn document(hash: &str) -> Document {
        Document {
            id: Uuid::new_v4(),
            content_hash: hash.to_string(),
            source_type: SourceType::Delimited,
            file_name: Some("ledger.csv".to_string()),
            encoding: TextEncoding::Utf8,
            delimiter: Some(';'),
            headers: vec!["a".to_string(), "b".to_string()],
            row_count: 10,
            byte_len: 120,
            created_at: Utc::now(),
        }
    }

    fn template(document_id: Uuid, version: u32, status: TemplateStatus) -> NormalizationTemplate {
        NormalizationTemplate {
            id: Uuid::new_v4(),
            document_id,
            table_name: "ledger_abc".to_string(),
            columns: vec![TemplateColumn {
                source_field: "a".to_string(),
                target_field: "a".to_string(),
                logical_type: LogicalType::Text,
                transform: None,
            }],
            status,
            version,
            model: "stub".to_string(),
            confidence: Some(0.9),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_document_insert_is_idempotent_by_hash() {
        let store = Store::open_in_memory().unwrap();
        store
            .blocking(|conn| {
                let first = insert_document(conn, &document("h1"))?;
                let second = insert_document(conn, &document("h1"))?;
                assert_eq!(first.id, second.id);
                assert_eq!(first.delimiter, Some(';'));
                assert_eq!(get_document(conn, first.id)?.headers, vec!["a", "b"]);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_only_one_active_template_per_document() {
        let store = Store::open_in_memory().unwrap();
        store
            .blocking(|conn| {
                let doc = insert_document(conn, &document("h2"))?;
                let t1 = template(doc.id, 1, TemplateStatus::Draft);
                insert_template(conn, &t1)?;

                let err = insert_template(conn, &template(doc.id, 2, TemplateStatus::Draft))
                    .unwrap_err();
                assert!(matches!(err, NormalizationError::ActiveTemplateExists { .. }));

                assert!(transition_status(
                    conn,
                    t1.id,
                    TemplateStatus::Draft,
                    TemplateStatus::Rejected,
                    Utc::now()
                )?);
                assert_eq!(next_template_version(conn, doc.id)?, 2);
                insert_template(conn, &template(doc.id, 2, TemplateStatus::Draft))?;
                assert_eq!(list_templates(conn, doc.id)?.len(), 2);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_status_cas_fails_on_stale_state() {
        let store = Store::open_in_memory().unwrap();
        store
            .blocking(|conn| {
                let doc = insert_document(conn, &document("h3"))?;
                let t = template(doc.id, 1, TemplateStatus::Draft);
                insert_template(conn, &t)?;

                let now = Utc::now();
                assert!(transition_status(conn, t.id, TemplateStatus::Draft, TemplateStatus::Approved, now)?);
                assert!(!transition_status(conn, t.id, TemplateStatus::Draft, TemplateStatus::Approved, now)?);
                assert_eq!(get_template(conn, t.id)?.status, TemplateStatus::Approved);
                Ok(())
            })
            .unwrap();
    }

    #[tokio::test]
    async fn test_transaction_rolls_back_on_error() {
        let store = Store::open_in_memory().unwrap();
        let result: Result<()> = store
            .transaction(|conn| {
                insert_document(conn, &document("h4"))?;
                Err(NormalizationError::ValidationError("boom".to_string()))
            })
            .await;
        assert!(result.is_err());

        let found = store
            .call(|conn| find_document_by_hash(conn, "h4"))
            .await
            .unwrap();
        assert!(found.is_none());
    }
}
