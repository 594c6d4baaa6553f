use crate::lifecycle::TemplateStatus;
use crate::parser::{SourceType, TextEncoding};
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// One uploaded file, identified by the SHA-256 of its bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: Uuid,
    pub content_hash: String,
    pub source_type: SourceType,
    pub file_name: Option<String>,
    pub encoding: TextEncoding,
    pub delimiter: Option<char>,
    pub headers: Vec<String>,
    pub row_count: u64,
    pub byte_len: u64,
    pub created_at: DateTime<Utc>,
}

/// Column type as inferred by the model. Anything outside the known set is kept
/// verbatim in `Unrecognized` and stored as text.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum LogicalType {
    Text,
    Integer,
    Decimal,
    Date,
    Timestamp,
    Boolean,
    Json,
    Unrecognized(String),
}

impl LogicalType {
    pub fn from_inferred(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "text" | "string" | "varchar" | "char" | "select" | "enum" | "category" => {
                LogicalType::Text
            }
            "integer" | "int" | "bigint" | "smallint" | "count" => LogicalType::Integer,
            "decimal" | "number" | "numeric" | "float" | "double" | "real" | "money"
            | "currency" | "amount" => LogicalType::Decimal,
            "date" => LogicalType::Date,
            "timestamp" | "datetime" | "time" => LogicalType::Timestamp,
            "boolean" | "bool" | "flag" => LogicalType::Boolean,
            "json" | "array" | "object" | "list" => LogicalType::Json,
            _ => LogicalType::Unrecognized(raw.trim().to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            LogicalType::Text => "text",
            LogicalType::Integer => "integer",
            LogicalType::Decimal => "decimal",
            LogicalType::Date => "date",
            LogicalType::Timestamp => "timestamp",
            LogicalType::Boolean => "boolean",
            LogicalType::Json => "json",
            LogicalType::Unrecognized(raw) => raw,
        }
    }
}

impl From<String> for LogicalType {
    fn from(raw: String) -> Self {
        LogicalType::from_inferred(&raw)
    }
}

impl From<LogicalType> for String {
    fn from(t: LogicalType) -> Self {
        t.as_str().to_string()
    }
}

impl fmt::Display for LogicalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateColumn {
    pub source_field: String,
    pub target_field: String,
    pub logical_type: LogicalType,
    pub transform: Option<String>,
}

/// An inferred table schema and its review state. Every generation creates a new
/// version; old versions are kept for audit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizationTemplate {
    pub id: Uuid,
    pub document_id: Uuid,
    pub table_name: String,
    pub columns: Vec<TemplateColumn>,
    pub status: TemplateStatus,
    pub version: u32,
    pub model: String,
    pub confidence: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct InferredColumn {
    #[schemars(description = "Header of the column in the uploaded document, exactly as it appears")]
    pub source_field: String,

    #[schemars(description = "snake_case column name for the normalized table")]
    pub target_field: String,

    #[schemars(
        description = "One of: text, integer, decimal, date, timestamp, boolean, json. Use decimal for monetary amounts."
    )]
    pub logical_type: String,

    #[schemars(
        description = "Optional cleanup applied before storing, e.g. 'parse_brazilian_number', 'parse_date:%d/%m/%Y', 'trim'"
    )]
    #[serde(default)]
    pub transform: Option<String>,
}

/// Structured reply expected from the model.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct InferredTemplate {
    #[schemars(description = "Short snake_case name describing the document's contents, e.g. 'ledger' or 'trial_balance'")]
    pub table_name: String,

    #[schemars(description = "Columns of the normalized table in display order")]
    pub columns: Vec<InferredColumn>,

    #[schemars(description = "Confidence in the inferred mapping between 0 and 1")]
    #[serde(default)]
    pub confidence: Option<f64>,
}

impl InferredTemplate {
    pub fn response_schema() -> serde_json::Value {
        serde_json::to_value(schemars::schema_for!(InferredTemplate)).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logical_type_parsing() {
        assert_eq!(LogicalType::from_inferred("Number"), LogicalType::Decimal);
        assert_eq!(LogicalType::from_inferred("select"), LogicalType::Text);
        assert_eq!(LogicalType::from_inferred(" datetime "), LogicalType::Timestamp);
        assert_eq!(LogicalType::from_inferred("array"), LogicalType::Json);
        assert_eq!(
            LogicalType::from_inferred("geo_point"),
            LogicalType::Unrecognized("geo_point".to_string())
        );
    }

    #[test]
    fn test_logical_type_serializes_as_string() {
        let column = TemplateColumn {
            source_field: "Valor".to_string(),
            target_field: "valor".to_string(),
            logical_type: LogicalType::Decimal,
            transform: None,
        };
        let json = serde_json::to_value(&column).unwrap();
        assert_eq!(json["logical_type"], "decimal");

        let back: TemplateColumn = serde_json::from_value(json).unwrap();
        assert_eq!(back.logical_type, LogicalType::Decimal);
    }

    #[test]
    fn test_response_schema_lists_columns() {
        let schema = InferredTemplate::response_schema();
        let properties = &schema["properties"];
        assert!(properties.get("table_name").is_some());
        assert!(properties.get("columns").is_some());
    }
}
