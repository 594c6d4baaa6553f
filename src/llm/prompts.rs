use crate::schema::{Document, InferredTemplate};

pub const SYSTEM_PROMPT_TEMPLATE_INFERENCE: &str = r#"
You are a data engineer specialising in accounting and financial exports (ledgers, trial balances,
bank statements, ECD/SPED files). You receive a short sample of an uploaded document and propose
the schema of a relational table that can hold its contents.

## YOUR TASK

1. Identify every column present in the sample. For delimited files the first line is the header.
   For free text, identify the recurring fields (dates, descriptions, amounts, account codes).
2. Map each column to a snake_case `target_field`. Keep names short and descriptive, in the
   language of the source when it is obvious (e.g. `valor`, `data_lancamento`).
3. Pick a `logical_type` for each column from this list only:
   text, integer, decimal, date, timestamp, boolean, json
4. Name the table after what the document contains (e.g. `ledger_entries`, `trial_balance`).

## RULES

- Monetary values are ALWAYS `decimal`, never `integer`, even if the sample shows whole numbers.
- Account codes are `text`. They often have leading zeros or dots ("1.01.001").
- Dates written as DD/MM/YYYY or DDMMYYYY are `date`; add a `transform` such as `parse_date:%d/%m/%Y`.
- Amounts written with a comma as decimal separator ("1.234,56") need the transform
  `parse_brazilian_number`.
- Do NOT invent columns that are not in the sample.
- Do NOT use these names, they are added by the system: id, organization_id, document_id,
  template_id, extracted_at, confidence_score, metadata.

## OUTPUT FORMAT

Return ONLY a JSON object, with no prose and no code fences:

{
  "table_name": "ledger_entries",
  "columns": [
    { "source_field": "Conta", "target_field": "conta", "logical_type": "text", "transform": null },
    { "source_field": "Valor", "target_field": "valor", "logical_type": "decimal", "transform": "parse_brazilian_number" }
  ],
  "confidence": 0.9
}
"#;

/// User turn: document facts, the sample itself and the expected response schema.
pub fn build_user_prompt(document: &Document, sample: &str) -> String {
    let schema = serde_json::to_string_pretty(&InferredTemplate::response_schema())
        .unwrap_or_default();

    let mut prompt = String::from("### DOCUMENT\n");
    if let Some(name) = &document.file_name {
        prompt.push_str(&format!("File name: {}\n", name));
    }
    prompt.push_str(&format!(
        "Format: {}\nEncoding: {}\nRows: {}\n",
        document.source_type.as_str(),
        document.encoding,
        document.row_count
    ));
    if let Some(delimiter) = document.delimiter {
        prompt.push_str(&format!("Delimiter: {:?}\n", delimiter));
    }
    if !document.headers.is_empty() {
        prompt.push_str(&format!("Headers: {}\n", document.headers.join(" | ")));
    }

    prompt.push_str("\n### SAMPLE\n```\n");
    prompt.push_str(sample.trim_end());
    prompt.push_str("\n```\n\n### RESPONSE SCHEMA\n");
    prompt.push_str(&schema);
    prompt.push_str("\n\nPropose the normalized table for this document. Return ONLY the JSON object.");
    prompt
}
