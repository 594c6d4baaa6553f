use crate::error::{NormalizationError, Result};
use log::debug;
use serde::{Deserialize, Serialize};

pub const PARAGRAPH_SEPARATOR: &str = "\n\n";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub index: usize,
    pub content: String,
    pub estimated_tokens: usize,
}

/// Rough token count used for chunk sizing and cost estimates: one token per four characters.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

/// Splits `text` into blank-line separated paragraphs, trimmed, with empty ones dropped.
pub fn paragraphs(text: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut start: Option<usize> = None;
    let mut end = 0;

    for (offset, line) in line_spans(text) {
        if line.trim().is_empty() {
            if let Some(s) = start.take() {
                out.push(text[s..end].trim());
            }
        } else {
            if start.is_none() {
                start = Some(offset);
            }
            end = offset + line.len();
        }
    }
    if let Some(s) = start {
        out.push(text[s..end].trim());
    }

    out.retain(|p| !p.is_empty());
    out
}

fn line_spans(text: &str) -> impl Iterator<Item = (usize, &str)> {
    let mut offset = 0;
    text.split_inclusive('\n').map(move |raw| {
        let start = offset;
        offset += raw.len();
        (start, raw.trim_end_matches(['\n', '\r']))
    })
}

/// Greedy paragraph packing. A paragraph that alone exceeds `chunk_size` becomes its own
/// oversized chunk instead of being split.
pub fn chunk_text(text: &str, chunk_size: usize) -> Result<Vec<Chunk>> {
    if chunk_size == 0 {
        return Err(NormalizationError::ValidationError(
            "chunk size must be greater than zero".to_string(),
        ));
    }

    let mut chunks = Vec::new();
    let mut buffer = String::new();
    let mut buffer_tokens = 0usize;

    for paragraph in paragraphs(text) {
        let tokens = estimate_tokens(paragraph);
        if !buffer.is_empty() && buffer_tokens + tokens > chunk_size {
            push_chunk(&mut chunks, std::mem::take(&mut buffer));
            buffer_tokens = 0;
        }
        if !buffer.is_empty() {
            buffer.push_str(PARAGRAPH_SEPARATOR);
        }
        buffer.push_str(paragraph);
        buffer_tokens += tokens;
    }
    if !buffer.is_empty() {
        push_chunk(&mut chunks, buffer);
    }

    debug!(
        "Chunked {} chars into {} chunks (size {})",
        text.len(),
        chunks.len(),
        chunk_size
    );
    Ok(chunks)
}

fn push_chunk(chunks: &mut Vec<Chunk>, content: String) {
    let estimated_tokens = estimate_tokens(&content);
    chunks.push(Chunk {
        index: chunks.len(),
        content,
        estimated_tokens,
    });
}
