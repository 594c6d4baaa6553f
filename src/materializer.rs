//! Turns approved templates into physical tables.
//!
//! Table creation and the registry insert always run in one transaction, so the
//! registry never points at a missing table and no table exists without its registry
//! row. Identifiers are validated against a strict pattern before they reach any DDL.

use crate::error::{NormalizationError, Result};
use crate::identity::OrgScope;
use crate::lifecycle::TemplateStatus;
use crate::schema::{LogicalType, NormalizationTemplate, TemplateColumn};
use crate::store::{self, Store};
use chrono::{DateTime, Utc};
use log::{error, info};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use uuid::Uuid;

pub const MAX_TABLE_NAME_LEN: usize = 63;
pub const MAX_COLUMNS: usize = 50;

/// Columns every materialized table carries ahead of the template's own columns.
pub const SYSTEM_COLUMNS: &[(&str, &str)] = &[
    ("id", "TEXT PRIMARY KEY"),
    ("organization_id", "TEXT NOT NULL"),
    ("document_id", "TEXT"),
    ("template_id", "TEXT NOT NULL"),
    ("extracted_at", "TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP"),
    ("confidence_score", "NUMERIC(3,2)"),
    ("metadata", "JSON"),
];

const SQL_KEYWORDS: &[&str] = &[
    "all", "alter", "and", "as", "between", "by", "case", "check", "column", "commit",
    "constraint", "create", "default", "delete", "distinct", "drop", "else", "end", "exists",
    "foreign", "from", "group", "having", "in", "index", "insert", "into", "is", "join", "key",
    "like", "limit", "not", "null", "offset", "on", "or", "order", "primary", "references",
    "rollback", "rowid", "oid", "_rowid_", "select", "set", "table", "then", "transaction",
    "union", "unique", "update", "user", "values", "when", "where",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageType {
    Text,
    Integer,
    Numeric,
    Date,
    Timestamp,
    Boolean,
    Json,
}

impl StorageType {
    pub fn as_sql(&self) -> &'static str {
        match self {
            StorageType::Text => "TEXT",
            StorageType::Integer => "INTEGER",
            StorageType::Numeric => "NUMERIC(15,2)",
            StorageType::Date => "DATE",
            StorageType::Timestamp => "TIMESTAMP",
            StorageType::Boolean => "BOOLEAN",
            StorageType::Json => "JSON",
        }
    }
}

/// Storage type for inferred types the mapping does not recognize.
pub const FALLBACK_STORAGE_TYPE: StorageType = StorageType::Text;

pub fn storage_type(logical: &LogicalType) -> StorageType {
    match logical {
        LogicalType::Text => StorageType::Text,
        LogicalType::Integer => StorageType::Integer,
        LogicalType::Decimal => StorageType::Numeric,
        LogicalType::Date => StorageType::Date,
        LogicalType::Timestamp => StorageType::Timestamp,
        LogicalType::Boolean => StorageType::Boolean,
        LogicalType::Json => StorageType::Json,
        LogicalType::Unrecognized(_) => FALLBACK_STORAGE_TYPE,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhysicalColumn {
    pub name: String,
    pub storage_type: StorageType,
    pub source_field: String,
}

/// Registry entry for a materialized table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhysicalTable {
    pub org_scope: String,
    pub table_name: String,
    pub physical_name: String,
    pub template_id: Uuid,
    pub columns: Vec<PhysicalColumn>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposedColumn {
    pub name: String,
    pub logical_type: LogicalType,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaValidationReport {
    pub valid: bool,
    pub table_name_available: Option<bool>,
    pub problems: Vec<String>,
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_lowercase())
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

pub fn is_reserved_column(name: &str) -> bool {
    SYSTEM_COLUMNS.iter().any(|(n, _)| *n == name) || SQL_KEYWORDS.contains(&name)
}

pub fn validate_table_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(NormalizationError::ValidationError(
            "table name cannot be empty".to_string(),
        ));
    }
    if name.len() > MAX_TABLE_NAME_LEN {
        return Err(NormalizationError::ValidationError(format!(
            "table name '{}' is longer than {} characters",
            name, MAX_TABLE_NAME_LEN
        )));
    }
    if !is_identifier(name) {
        return Err(NormalizationError::ValidationError(format!(
            "table name '{}' must start with a lowercase letter and contain only lowercase letters, digits and underscores",
            name
        )));
    }
    if name.starts_with("sqlite_") || name.starts_with("pg_") {
        return Err(NormalizationError::ValidationError(format!(
            "table name '{}' uses a reserved prefix",
            name
        )));
    }
    if SQL_KEYWORDS.contains(&name) {
        return Err(NormalizationError::ValidationError(format!(
            "table name '{}' is a reserved word",
            name
        )));
    }
    Ok(())
}

fn column_problems<'a>(names: impl Iterator<Item = &'a str>) -> Vec<String> {
    let mut problems = Vec::new();
    let mut seen = HashSet::new();
    let mut count = 0;

    for name in names {
        count += 1;
        if !is_identifier(name) || name.len() > MAX_TABLE_NAME_LEN {
            problems.push(format!("column '{}' is not a valid identifier", name));
        } else if is_reserved_column(name) {
            problems.push(format!("column '{}' is reserved", name));
        }
        if !seen.insert(name) {
            problems.push(format!("column '{}' appears more than once", name));
        }
    }

    if count == 0 {
        problems.push("at least one column is required".to_string());
    } else if count > MAX_COLUMNS {
        problems.push(format!(
            "{} columns exceed the limit of {}",
            count, MAX_COLUMNS
        ));
    }
    problems
}

pub fn validate_columns(columns: &[TemplateColumn]) -> Result<()> {
    let problems = column_problems(columns.iter().map(|c| c.target_field.as_str()));
    if problems.is_empty() {
        Ok(())
    } else {
        Err(NormalizationError::ValidationError(problems.join("; ")))
    }
}

pub fn physical_table_name(org: &OrgScope, table_name: &str) -> String {
    format!("org_{}__{}", org.slug(), table_name)
}

pub fn physical_columns(columns: &[TemplateColumn]) -> Vec<PhysicalColumn> {
    columns
        .iter()
        .map(|c| PhysicalColumn {
            name: c.target_field.clone(),
            storage_type: storage_type(&c.logical_type),
            source_field: c.source_field.clone(),
        })
        .collect()
}

pub fn create_table_sql(physical_name: &str, columns: &[PhysicalColumn]) -> String {
    let definitions: Vec<String> = SYSTEM_COLUMNS
        .iter()
        .map(|(name, ddl)| format!("    \"{}\" {}", name, ddl))
        .chain(
            columns
                .iter()
                .map(|c| format!("    \"{}\" {}", c.name, c.storage_type.as_sql())),
        )
        .collect();

    format!(
        "CREATE TABLE \"{}\" (\n{}\n)",
        physical_name,
        definitions.join(",\n")
    )
}

pub fn create_index_sql(physical_name: &str) -> Vec<String> {
    ["organization_id", "document_id"]
        .iter()
        .map(|column| {
            format!(
                "CREATE INDEX \"idx_{}_{}\" ON \"{}\" (\"{}\")",
                physical_name, column, physical_name, column
            )
        })
        .collect()
}

/// Materializes `template` for `org`. Must run inside a transaction; any failure after
/// the registry check is reported as `TransactionFailure` and the caller's rollback
/// discards the partial work.
pub fn materialize_in(
    conn: &Connection,
    template: &NormalizationTemplate,
    org: &OrgScope,
) -> Result<PhysicalTable> {
    if template.status != TemplateStatus::Approved {
        return Err(NormalizationError::ValidationError(format!(
            "template {} must be approved before materialization (status: {})",
            template.id, template.status
        )));
    }
    validate_table_name(&template.table_name)?;
    validate_columns(&template.columns)?;

    if store::find_physical_table(conn, org.as_str(), &template.table_name)?.is_some() {
        return Err(NormalizationError::DuplicateTable {
            table_name: template.table_name.clone(),
            org_scope: org.to_string(),
        });
    }

    let physical_name = physical_table_name(org, &template.table_name);
    let table = PhysicalTable {
        org_scope: org.to_string(),
        table_name: template.table_name.clone(),
        physical_name: physical_name.clone(),
        template_id: template.id,
        columns: physical_columns(&template.columns),
        created_at: Utc::now(),
    };

    let ddl = create_table_sql(&physical_name, &table.columns);
    let result = conn
        .execute_batch(&ddl)
        .map_err(NormalizationError::from)
        .and_then(|_| {
            for index in create_index_sql(&physical_name) {
                conn.execute_batch(&index)?;
            }
            Ok(())
        })
        .and_then(|_| store::insert_physical_table(conn, &table));

    if let Err(e) = result {
        error!(
            "Materialization of template {} as {} failed: {}",
            template.id, physical_name, e
        );
        return Err(NormalizationError::TransactionFailure {
            table_name: template.table_name.clone(),
        });
    }

    info!(
        "Materialized template {} as {} ({} columns)",
        template.id,
        physical_name,
        table.columns.len()
    );
    Ok(table)
}

/// Drops a materialized table and its registry row in the caller's transaction.
pub fn drop_table_in(conn: &Connection, org: &OrgScope, table_name: &str) -> Result<PhysicalTable> {
    let table = store::find_physical_table(conn, org.as_str(), table_name)?
        .ok_or_else(|| NormalizationError::not_found("table", table_name))?;

    let result = conn
        .execute_batch(&format!("DROP TABLE IF EXISTS \"{}\"", table.physical_name))
        .map_err(NormalizationError::from)
        .and_then(|_| store::delete_physical_table(conn, org.as_str(), table_name));

    if let Err(e) = result {
        error!("Dropping {} failed: {}", table.physical_name, e);
        return Err(NormalizationError::TransactionFailure {
            table_name: table_name.to_string(),
        });
    }
    info!("Dropped table {}", table.physical_name);
    Ok(table)
}

pub fn validate_proposed_schema_in(
    conn: &Connection,
    org: &OrgScope,
    table_name: Option<&str>,
    columns: &[ProposedColumn],
) -> Result<SchemaValidationReport> {
    let mut problems = column_problems(columns.iter().map(|c| c.name.as_str()));

    let table_name_available = match table_name {
        Some(name) => {
            if let Err(NormalizationError::ValidationError(msg)) = validate_table_name(name) {
                problems.push(msg);
            }
            let registered = store::find_physical_table(conn, org.as_str(), name)?.is_some();
            let exists = store::sqlite_table_exists(conn, &physical_table_name(org, name))?;
            if registered || exists {
                problems.push(format!(
                    "table '{}' already exists in organization '{}'",
                    name, org
                ));
            }
            Some(!registered && !exists)
        }
        None => None,
    };

    Ok(SchemaValidationReport {
        valid: problems.is_empty(),
        table_name_available,
        problems,
    })
}

#[derive(Clone)]
pub struct SchemaMaterializer {
    store: Store,
}

impl SchemaMaterializer {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub async fn materialize(
        &self,
        template: &NormalizationTemplate,
        org: &OrgScope,
    ) -> Result<PhysicalTable> {
        let template = template.clone();
        let org = org.clone();
        self.store
            .transaction(move |conn| materialize_in(conn, &template, &org))
            .await
    }

    pub async fn validate_proposed_schema(
        &self,
        org: &OrgScope,
        table_name: Option<String>,
        columns: Vec<ProposedColumn>,
    ) -> Result<SchemaValidationReport> {
        let org = org.clone();
        self.store
            .call(move |conn| {
                validate_proposed_schema_in(conn, &org, table_name.as_deref(), &columns)
            })
            .await
    }

    pub async fn list_tables(&self, org: &OrgScope) -> Result<Vec<PhysicalTable>> {
        let org = org.to_string();
        self.store
            .call(move |conn| store::list_physical_tables(conn, &org))
            .await
    }

    pub async fn table_exists(&self, org: &OrgScope, table_name: &str) -> Result<bool> {
        let org = org.to_string();
        let table_name = table_name.to_string();
        self.store
            .call(move |conn| Ok(store::find_physical_table(conn, &org, &table_name)?.is_some()))
            .await
    }

    pub async fn drop_table(&self, org: &OrgScope, table_name: &str) -> Result<PhysicalTable> {
        let org = org.clone();
        let table_name = table_name.to_string();
        self.store
            .transaction(move |conn| drop_table_in(conn, &org, &table_name))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::{SourceType, TextEncoding};
    use crate::schema::Document;

    fn column(name: &str, logical_type: LogicalType) -> TemplateColumn {
        TemplateColumn {
            source_field: name.to_uppercase(),
            target_field: name.to_string(),
            logical_type,
            transform: None,
        }
    }

    fn approved_template(conn: &Connection, table_name: &str) -> NormalizationTemplate {
        let doc = store::insert_document(
            conn,
            &Document {
                id: Uuid::new_v4(),
                content_hash: Uuid::new_v4().to_string(),
                source_type: SourceType::Delimited,
                file_name: None,
                encoding: TextEncoding::Utf8,
                delimiter: Some(','),
                headers: vec![],
                row_count: 0,
                byte_len: 0,
                created_at: Utc::now(),
            },
        )
        .unwrap();
        let template = NormalizationTemplate {
            id: Uuid::new_v4(),
            document_id: doc.id,
            table_name: table_name.to_string(),
            columns: vec![
                column("account_code", LogicalType::Text),
                column("amount", LogicalType::Decimal),
                column("location", LogicalType::Unrecognized("geo".to_string())),
            ],
            status: TemplateStatus::Approved,
            version: 1,
            model: "stub".to_string(),
            confidence: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        store::insert_template(conn, &template).unwrap();
        template
    }

    #[test]
    fn test_storage_type_mapping_is_total() {
        assert_eq!(storage_type(&LogicalType::Decimal).as_sql(), "NUMERIC(15,2)");
        assert_eq!(storage_type(&LogicalType::Boolean), StorageType::Boolean);
        assert_eq!(
            storage_type(&LogicalType::Unrecognized("geo".to_string())),
            FALLBACK_STORAGE_TYPE
        );
    }

    #[test]
    fn test_table_name_rules() {
        assert!(validate_table_name("ledger_3f2a9c1e").is_ok());
        assert!(validate_table_name("Ledger").is_err());
        assert!(validate_table_name("1ledger").is_err());
        assert!(validate_table_name("pg_stats").is_err());
        assert!(validate_table_name("sqlite_master").is_err());
        assert!(validate_table_name("select").is_err());
        assert!(validate_table_name(&"a".repeat(64)).is_err());
    }

    #[test]
    fn test_column_rules() {
        assert!(validate_columns(&[column("amount", LogicalType::Decimal)]).is_ok());
        assert!(validate_columns(&[]).is_err());
        assert!(validate_columns(&[column("id", LogicalType::Text)]).is_err());
        assert!(validate_columns(&[column("order", LogicalType::Text)]).is_err());
        assert!(validate_columns(&[
            column("amount", LogicalType::Decimal),
            column("amount", LogicalType::Decimal)
        ])
        .is_err());
        let many: Vec<TemplateColumn> = (0..51)
            .map(|i| column(&format!("c{}", i), LogicalType::Text))
            .collect();
        assert!(validate_columns(&many).is_err());
    }

    #[test]
    fn test_create_table_sql_includes_system_columns() {
        let sql = create_table_sql(
            "org_acme__ledger",
            &physical_columns(&[column("amount", LogicalType::Decimal)]),
        );
        assert!(sql.starts_with("CREATE TABLE \"org_acme__ledger\""));
        assert!(sql.contains("\"organization_id\" TEXT NOT NULL"));
        assert!(sql.contains("\"amount\" NUMERIC(15,2)"));
    }

    #[test]
    fn test_materialize_creates_table_and_registry_row() {
        let db = Store::open_in_memory().unwrap();
        let org = OrgScope::new("acme").unwrap();
        db.blocking(|conn| {
            let template = approved_template(conn, "ledger_d1");
            let table = store::with_transaction(conn, |tx| materialize_in(tx, &template, &org))?;

            assert_eq!(table.physical_name, "org_acme__ledger_d1");
            assert!(store::sqlite_table_exists(conn, "org_acme__ledger_d1")?);
            assert_eq!(store::list_physical_tables(conn, "acme")?.len(), 1);
            assert_eq!(table.columns[2].storage_type, StorageType::Text);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_duplicate_table_leaves_existing_untouched() {
        let db = Store::open_in_memory().unwrap();
        let org = OrgScope::new("acme").unwrap();
        db.blocking(|conn| {
            let first = approved_template(conn, "ledger_d1");
            store::with_transaction(conn, |tx| materialize_in(tx, &first, &org))?;
            conn.execute(
                "INSERT INTO \"org_acme__ledger_d1\" (id, organization_id, template_id, amount)
                 VALUES ('r1', 'acme', 't', 10.5)",
                [],
            )?;

            let second = approved_template(conn, "ledger_d1");
            let err = store::with_transaction(conn, |tx| materialize_in(tx, &second, &org))
                .unwrap_err();
            assert!(matches!(err, NormalizationError::DuplicateTable { .. }));

            let rows: i64 =
                conn.query_row("SELECT COUNT(*) FROM \"org_acme__ledger_d1\"", [], |r| r.get(0))?;
            assert_eq!(rows, 1);
            let registered = store::find_physical_table(conn, "acme", "ledger_d1")?.unwrap();
            assert_eq!(registered.template_id, first.id);

            // Same name in another org is a different table.
            let other = OrgScope::new("globex").unwrap();
            store::with_transaction(conn, |tx| materialize_in(tx, &second, &other))?;
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_ddl_failure_rolls_back_registry() {
        let db = Store::open_in_memory().unwrap();
        let org = OrgScope::new("acme").unwrap();
        db.blocking(|conn| {
            let template = approved_template(conn, "ledger_d1");
            // A stray table with the physical name but no registry row makes CREATE TABLE fail.
            conn.execute_batch("CREATE TABLE \"org_acme__ledger_d1\" (x TEXT)")?;

            let err = store::with_transaction(conn, |tx| materialize_in(tx, &template, &org))
                .unwrap_err();
            assert!(matches!(err, NormalizationError::TransactionFailure { .. }));
            assert!(store::find_physical_table(conn, "acme", "ledger_d1")?.is_none());
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_draft_template_cannot_be_materialized() {
        let db = Store::open_in_memory().unwrap();
        let org = OrgScope::new("acme").unwrap();
        db.blocking(|conn| {
            let mut template = approved_template(conn, "ledger_d1");
            template.status = TemplateStatus::Draft;
            let err = materialize_in(conn, &template, &org).unwrap_err();
            assert!(matches!(err, NormalizationError::ValidationError(_)));
            Ok(())
        })
        .unwrap();
    }

    #[tokio::test]
    async fn test_validate_proposed_schema_and_drop() {
        let db = Store::open_in_memory().unwrap();
        let materializer = SchemaMaterializer::new(db.clone());
        let org = OrgScope::new("acme").unwrap();

        let template = db.blocking(|conn| Ok(approved_template(conn, "ledger_d1"))).unwrap();
        materializer.materialize(&template, &org).await.unwrap();
        assert!(materializer.table_exists(&org, "ledger_d1").await.unwrap());

        let report = materializer
            .validate_proposed_schema(
                &org,
                Some("ledger_d1".to_string()),
                vec![
                    ProposedColumn {
                        name: "amount".to_string(),
                        logical_type: LogicalType::Decimal,
                    },
                    ProposedColumn {
                        name: "metadata".to_string(),
                        logical_type: LogicalType::Json,
                    },
                ],
            )
            .await
            .unwrap();
        assert!(!report.valid);
        assert_eq!(report.table_name_available, Some(false));
        assert_eq!(report.problems.len(), 2);

        materializer.drop_table(&org, "ledger_d1").await.unwrap();
        assert!(materializer.list_tables(&org).await.unwrap().is_empty());
        let report = materializer
            .validate_proposed_schema(&org, Some("ledger_d1".to_string()), vec![])
            .await
            .unwrap();
        assert_eq!(report.table_name_available, Some(true));
    }
}
