//! Streaming document parser.
//!
//! Uploads are read once through a [`HashingReader`], so the SHA-256 content hash is
//! computed in the same pass that decodes records. Only a fixed-size sample is held in
//! memory for encoding and delimiter detection; records are pulled lazily from the rest
//! of the stream. UTF-16 input is the exception: it is transcoded in full before parsing.

use crate::error::{NormalizationError, Result};
use csv::ByteRecord;
use log::warn;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::io::{self, BufRead, BufReader, Chain, Cursor, Read};
use std::str::FromStr;

pub const SAMPLE_BYTES: usize = 64 * 1024;
const SAMPLE_LINES: usize = 10;
const HASH_CHUNK: usize = 64 * 1024;
const CANDIDATE_DELIMITERS: [u8; 4] = [b',', b';', b'\t', b'|'];
const UTF8_BOM: &[u8] = &[0xEF, 0xBB, 0xBF];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    Delimited,
    Text,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::Delimited => "delimited",
            SourceType::Text => "text",
        }
    }

    /// Guess from a file extension; `None` leaves the decision to content sniffing.
    pub fn from_file_name(name: &str) -> Option<Self> {
        let ext = name.rsplit_once('.')?.1.to_ascii_lowercase();
        match ext.as_str() {
            "csv" | "tsv" | "psv" => Some(SourceType::Delimited),
            "txt" | "md" | "text" => Some(SourceType::Text),
            _ => None,
        }
    }
}

impl FromStr for SourceType {
    type Err = NormalizationError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "delimited" => Ok(SourceType::Delimited),
            "text" => Ok(SourceType::Text),
            other => Err(NormalizationError::ValidationError(format!(
                "unknown source type: {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TextEncoding {
    Utf8,
    Utf16Le,
    Utf16Be,
    Latin1,
}

impl TextEncoding {
    pub fn as_str(&self) -> &'static str {
        match self {
            TextEncoding::Utf8 => "utf-8",
            TextEncoding::Utf16Le => "utf-16le",
            TextEncoding::Utf16Be => "utf-16be",
            TextEncoding::Latin1 => "latin1",
        }
    }
}

impl fmt::Display for TextEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TextEncoding {
    type Err = NormalizationError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "utf-8" => Ok(TextEncoding::Utf8),
            "utf-16le" => Ok(TextEncoding::Utf16Le),
            "utf-16be" => Ok(TextEncoding::Utf16Be),
            "latin1" => Ok(TextEncoding::Latin1),
            other => Err(NormalizationError::ValidationError(format!(
                "unknown encoding: {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ParseOptions {
    pub source_hint: Option<SourceType>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParseSummary {
    pub content_hash: String,
    pub byte_len: u64,
    pub source_type: SourceType,
    pub encoding: TextEncoding,
    pub delimiter: Option<char>,
    pub headers: Vec<String>,
    pub row_count: u64,
}

/// One decoded record. Text documents yield one single-field row per non-empty line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Row {
    pub line: u64,
    pub fields: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DelimiterGuess {
    pub delimiter: u8,
    /// Every sampled line had the same non-zero count.
    pub consistent: bool,
    pub score: f64,
}

pub struct HashingReader<R> {
    inner: R,
    hasher: Sha256,
    bytes_read: u64,
}

impl<R: Read> HashingReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            bytes_read: 0,
        }
    }

    /// Hex digest and byte count of everything read so far.
    pub fn finish(self) -> (String, u64) {
        (format!("{:x}", self.hasher.finalize()), self.bytes_read)
    }
}

impl<R: Read> Read for HashingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.hasher.update(&buf[..n]);
        self.bytes_read += n as u64;
        Ok(n)
    }
}

pub fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    for chunk in bytes.chunks(HASH_CHUNK) {
        hasher.update(chunk);
    }
    format!("{:x}", hasher.finalize())
}

/// `at_eof` tells whether the sample is the whole input; a multi-byte sequence cut by
/// the end of a partial sample is still treated as UTF-8.
pub fn detect_encoding(sample: &[u8], at_eof: bool) -> TextEncoding {
    if sample.starts_with(UTF8_BOM) {
        return TextEncoding::Utf8;
    }
    if sample.starts_with(&[0xFF, 0xFE]) {
        return TextEncoding::Utf16Le;
    }
    if sample.starts_with(&[0xFE, 0xFF]) {
        return TextEncoding::Utf16Be;
    }
    match std::str::from_utf8(sample) {
        Ok(_) => TextEncoding::Utf8,
        Err(e) if e.error_len().is_none() && !at_eof => TextEncoding::Utf8,
        Err(_) => TextEncoding::Latin1,
    }
}

/// Scores each candidate over the first non-empty lines: occurrences outside quotes,
/// averaged, and multiplied by ten when every line agrees.
pub fn detect_delimiter(sample: &str) -> Option<DelimiterGuess> {
    let lines: Vec<&str> = sample
        .lines()
        .filter(|l| !l.trim().is_empty())
        .take(SAMPLE_LINES)
        .collect();
    if lines.is_empty() {
        return None;
    }

    let mut best: Option<DelimiterGuess> = None;
    for &delimiter in &CANDIDATE_DELIMITERS {
        let counts: Vec<usize> = lines
            .iter()
            .map(|line| count_outside_quotes(line, delimiter as char))
            .collect();
        let total: usize = counts.iter().sum();
        if total == 0 {
            continue;
        }

        let avg = total as f64 / counts.len() as f64;
        let consistent = counts.iter().all(|&c| c > 0 && c == counts[0]);
        let score = if consistent { avg * 10.0 } else { avg };

        if best.map_or(true, |b| score > b.score) {
            best = Some(DelimiterGuess {
                delimiter,
                consistent,
                score,
            });
        }
    }
    best
}

fn count_outside_quotes(line: &str, delimiter: char) -> usize {
    let mut in_quotes = false;
    let mut count = 0;
    for c in line.chars() {
        if c == '"' {
            in_quotes = !in_quotes;
        } else if c == delimiter && !in_quotes {
            count += 1;
        }
    }
    count
}

fn decode_latin1(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| b as char).collect()
}

/// Decodes a whole document to text, used for chunking. Input without a BOM that is
/// plain ASCII up to its first invalid UTF-8 sequence is read as Latin-1.
pub fn decode_text(bytes: &[u8]) -> Result<String> {
    let sample = &bytes[..bytes.len().min(SAMPLE_BYTES)];
    match detect_encoding(sample, bytes.len() <= SAMPLE_BYTES) {
        TextEncoding::Utf8 => {
            let body = bytes.strip_prefix(UTF8_BOM);
            let has_bom = body.is_some();
            let body = body.unwrap_or(bytes);
            match std::str::from_utf8(body) {
                Ok(text) => Ok(text.to_string()),
                Err(e) if !has_bom && body[..e.valid_up_to()].is_ascii() => {
                    warn!(
                        "Invalid UTF-8 at byte {} after ASCII-only content; decoding as Latin-1",
                        e.valid_up_to()
                    );
                    Ok(decode_latin1(body))
                }
                Err(e) => Err(NormalizationError::MalformedDocument(format!(
                    "invalid UTF-8 sequence at byte {}",
                    e.valid_up_to()
                ))),
            }
        }
        TextEncoding::Latin1 => Ok(decode_latin1(bytes)),
        TextEncoding::Utf16Le => decode_utf16(&bytes[2..], false),
        TextEncoding::Utf16Be => decode_utf16(&bytes[2..], true),
    }
}

fn decode_utf16(bytes: &[u8], big_endian: bool) -> Result<String> {
    if bytes.len() % 2 != 0 {
        return Err(NormalizationError::MalformedDocument(
            "UTF-16 content has an odd number of bytes".to_string(),
        ));
    }
    let units = bytes.chunks_exact(2).map(|pair| {
        if big_endian {
            u16::from_be_bytes([pair[0], pair[1]])
        } else {
            u16::from_le_bytes([pair[0], pair[1]])
        }
    });
    char::decode_utf16(units)
        .collect::<std::result::Result<String, _>>()
        .map_err(|e| {
            NormalizationError::MalformedDocument(format!(
                "invalid UTF-16 code unit {:#06x}",
                e.unpaired_surrogate()
            ))
        })
}

/// Field decoding state. A document whose sample was pure ASCII is only provisionally
/// UTF-8: the first invalid sequence switches it to Latin-1, unless non-ASCII UTF-8 has
/// already been decoded, in which case the sequence is an error.
struct FieldDecoder {
    encoding: TextEncoding,
    decode_as: TextEncoding,
    utf8_committed: bool,
}

impl FieldDecoder {
    fn decode(&mut self, bytes: &[u8], line: u64) -> Result<String> {
        let text = match self.decode_as {
            TextEncoding::Latin1 => decode_latin1(bytes),
            _ => match std::str::from_utf8(bytes) {
                Ok(text) => {
                    if !text.is_ascii() {
                        self.utf8_committed = true;
                    }
                    text.to_string()
                }
                Err(_) if !self.utf8_committed => {
                    warn!(
                        "line {}: invalid UTF-8 after ASCII-only content; decoding as Latin-1",
                        line
                    );
                    self.encoding = TextEncoding::Latin1;
                    self.decode_as = TextEncoding::Latin1;
                    decode_latin1(bytes)
                }
                Err(_) => {
                    return Err(NormalizationError::MalformedDocument(format!(
                        "line {}: invalid UTF-8 byte sequence",
                        line
                    )))
                }
            },
        };
        if text.contains('\0') {
            return Err(NormalizationError::MalformedDocument(format!(
                "line {}: unexpected NUL byte",
                line
            )));
        }
        Ok(text.trim().to_string())
    }
}

fn csv_error(err: csv::Error) -> NormalizationError {
    let line = err.position().map(|p| p.line());
    match err.into_kind() {
        csv::ErrorKind::Io(e) => NormalizationError::IoError(e),
        kind => NormalizationError::MalformedDocument(match line {
            Some(line) => format!("line {}: {:?}", line, kind),
            None => format!("{:?}", kind),
        }),
    }
}

fn read_sample<R: Read>(reader: &mut R, limit: usize) -> io::Result<Vec<u8>> {
    let mut sample = Vec::with_capacity(limit.min(8 * 1024));
    reader.by_ref().take(limit as u64).read_to_end(&mut sample)?;
    Ok(sample)
}

type Prepared<R> = Chain<Cursor<Vec<u8>>, R>;

enum RowSource<R: Read> {
    Delimited {
        reader: csv::Reader<Prepared<R>>,
        record: ByteRecord,
    },
    Text {
        reader: BufReader<Prepared<R>>,
        buf: Vec<u8>,
        line: u64,
    },
}

/// Lazy row sequence over a document. Building a new iterator over the same bytes
/// yields the same rows.
pub struct RowIter<R: Read> {
    source: RowSource<R>,
    decoder: FieldDecoder,
    delimiter: Option<u8>,
    headers: Vec<String>,
    done: bool,
}

impl<R: Read> RowIter<R> {
    pub fn new(reader: R) -> Result<Self> {
        Self::with_options(reader, &ParseOptions::default())
    }

    pub fn with_options(mut reader: R, options: &ParseOptions) -> Result<Self> {
        let sample = read_sample(&mut reader, SAMPLE_BYTES)?;
        if sample.is_empty() {
            return Err(NormalizationError::MalformedDocument(
                "document is empty".to_string(),
            ));
        }
        let truncated = sample.len() == SAMPLE_BYTES;
        let encoding = detect_encoding(&sample, !truncated);

        let (prefix, decode_as, utf8_committed) = match encoding {
            TextEncoding::Utf16Le | TextEncoding::Utf16Be => {
                let mut all = sample;
                reader.read_to_end(&mut all)?;
                let text = decode_utf16(&all[2..], encoding == TextEncoding::Utf16Be)?;
                (text.into_bytes(), TextEncoding::Utf8, true)
            }
            TextEncoding::Utf8 => {
                let mut sample = sample;
                let has_bom = sample.starts_with(UTF8_BOM);
                if has_bom {
                    sample.drain(..UTF8_BOM.len());
                }
                let valid = match std::str::from_utf8(&sample) {
                    Ok(_) => sample.len(),
                    Err(e) => e.valid_up_to(),
                };
                let committed = has_bom || !sample[..valid].is_ascii();
                (sample, TextEncoding::Utf8, committed)
            }
            TextEncoding::Latin1 => (sample, TextEncoding::Latin1, false),
        };
        let mut decoder = FieldDecoder {
            encoding,
            decode_as,
            utf8_committed,
        };

        if prefix.contains(&0) {
            return Err(NormalizationError::MalformedDocument(
                "document contains NUL bytes; binary files are not supported".to_string(),
            ));
        }

        let delimiter = {
            let mut sample_text = match decode_as {
                TextEncoding::Latin1 => decode_latin1(&prefix),
                _ => String::from_utf8_lossy(&prefix).into_owned(),
            };
            // The last line of a cut sample is partial and would skew the counts.
            if truncated {
                if let Some(pos) = sample_text.rfind('\n') {
                    sample_text.truncate(pos);
                }
            }
            let guess = detect_delimiter(&sample_text);
            match options.source_hint {
                Some(SourceType::Text) => None,
                Some(SourceType::Delimited) => Some(guess.map_or(b',', |g| g.delimiter)),
                None => guess.filter(|g| g.consistent).map(|g| g.delimiter),
            }
        };

        let input = Cursor::new(prefix).chain(reader);
        match delimiter {
            Some(delimiter) => {
                let mut csv_reader = csv::ReaderBuilder::new()
                    .delimiter(delimiter)
                    .has_headers(false)
                    .flexible(true)
                    .from_reader(input);
                let mut record = ByteRecord::new();
                if !csv_reader
                    .read_byte_record(&mut record)
                    .map_err(csv_error)?
                {
                    return Err(NormalizationError::MalformedDocument(
                        "document has no header row".to_string(),
                    ));
                }
                let line = record.position().map_or(1, |p| p.line());
                let headers = record
                    .iter()
                    .enumerate()
                    .map(|(i, raw)| {
                        decoder.decode(raw, line).map(|h| {
                            if h.is_empty() {
                                format!("column_{}", i + 1)
                            } else {
                                h
                            }
                        })
                    })
                    .collect::<Result<Vec<_>>>()?;

                Ok(Self {
                    source: RowSource::Delimited {
                        reader: csv_reader,
                        record,
                    },
                    decoder,
                    delimiter: Some(delimiter),
                    headers,
                    done: false,
                })
            }
            None => Ok(Self {
                source: RowSource::Text {
                    reader: BufReader::new(input),
                    buf: Vec::new(),
                    line: 0,
                },
                decoder,
                delimiter: None,
                headers: Vec::new(),
                done: false,
            }),
        }
    }

    pub fn source_type(&self) -> SourceType {
        match self.source {
            RowSource::Delimited { .. } => SourceType::Delimited,
            RowSource::Text { .. } => SourceType::Text,
        }
    }

    /// Detected encoding. Can change to Latin-1 while rows are read.
    pub fn encoding(&self) -> TextEncoding {
        self.decoder.encoding
    }

    pub fn delimiter(&self) -> Option<char> {
        self.delimiter.map(char::from)
    }

    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    fn read_next(&mut self) -> Result<Option<Row>> {
        let decoder = &mut self.decoder;
        match &mut self.source {
            RowSource::Delimited { reader, record } => {
                if !reader.read_byte_record(record).map_err(csv_error)? {
                    return Ok(None);
                }
                let line = record.position().map_or(0, |p| p.line());
                if record.len() != self.headers.len() {
                    return Err(NormalizationError::MalformedDocument(format!(
                        "line {}: expected {} fields, found {}",
                        line,
                        self.headers.len(),
                        record.len()
                    )));
                }
                let fields = record
                    .iter()
                    .map(|raw| decoder.decode(raw, line))
                    .collect::<Result<Vec<_>>>()?;
                Ok(Some(Row { line, fields }))
            }
            RowSource::Text { reader, buf, line } => loop {
                buf.clear();
                if reader.read_until(b'\n', buf)? == 0 {
                    return Ok(None);
                }
                *line += 1;
                let text = decoder.decode(buf, *line)?;
                if !text.is_empty() {
                    return Ok(Some(Row {
                        line: *line,
                        fields: vec![text],
                    }));
                }
            },
        }
    }
}

impl<R: Read> Iterator for RowIter<R> {
    type Item = Result<Row>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.read_next() {
            Ok(Some(row)) => Some(Ok(row)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// Reads the whole stream once, hashing and validating every record.
pub fn scan<R: Read>(reader: R, options: &ParseOptions) -> Result<ParseSummary> {
    let mut hashing = HashingReader::new(reader);

    let mut rows = RowIter::with_options(&mut hashing, options)?;
    let mut row_count = 0u64;
    for row in rows.by_ref() {
        row?;
        row_count += 1;
    }
    let source_type = rows.source_type();
    let encoding = rows.encoding();
    let delimiter = rows.delimiter();
    let headers = rows.headers().to_vec();
    drop(rows);

    io::copy(&mut hashing, &mut io::sink())?;
    let (content_hash, byte_len) = hashing.finish();

    Ok(ParseSummary {
        content_hash,
        byte_len,
        source_type,
        encoding,
        delimiter,
        headers,
        row_count,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ledger_csv() -> Vec<u8> {
        let mut csv = String::from("account_code;account;year;amount\n");
        for i in 0..10 {
            csv.push_str(&format!("1.01.{:02};Caixa {};2021;{},50\n", i, i, 100 + i));
        }
        csv.into_bytes()
    }

    #[test]
    fn test_semicolon_ledger() {
        let bytes = ledger_csv();
        let summary = scan(bytes.as_slice(), &ParseOptions::default()).unwrap();

        assert_eq!(summary.source_type, SourceType::Delimited);
        assert_eq!(summary.delimiter, Some(';'));
        assert_eq!(summary.encoding, TextEncoding::Utf8);
        assert_eq!(summary.row_count, 10);
        assert_eq!(summary.headers, vec!["account_code", "account", "year", "amount"]);
        assert_eq!(summary.content_hash, content_hash(&bytes));
        assert_eq!(summary.byte_len, bytes.len() as u64);
    }

    #[test]
    fn test_rows_are_restartable() {
        let bytes = ledger_csv();
        let first: Vec<Row> = RowIter::new(bytes.as_slice())
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        let second: Vec<Row> = RowIter::new(bytes.as_slice())
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(first[0].line, 2);
        assert_eq!(first[0].fields[1], "Caixa 0");
    }

    #[test]
    fn test_quoted_commas_do_not_confuse_detection() {
        let sample = "name\tnote\n\"a, b\"\tx\n\"c, d, e\"\ty\n";
        let guess = detect_delimiter(sample).unwrap();
        assert_eq!(guess.delimiter, b'\t');
        assert!(guess.consistent);
    }

    #[test]
    fn test_latin1_fallback() {
        let mut bytes = b"codigo,descri".to_vec();
        bytes.extend_from_slice(&[0xE7, 0xE3, b'o', b'\n']);
        bytes.extend_from_slice(b"1,Caixa\n");

        let mut rows = RowIter::new(bytes.as_slice()).unwrap();
        assert_eq!(rows.encoding(), TextEncoding::Latin1);
        assert_eq!(rows.headers()[1], "descrição");
        assert_eq!(rows.next().unwrap().unwrap().fields, vec!["1", "Caixa"]);
    }

    #[test]
    fn test_utf8_bom_is_stripped() {
        let mut bytes = UTF8_BOM.to_vec();
        bytes.extend_from_slice(b"a,b\n1,2\n");
        let rows = RowIter::new(bytes.as_slice()).unwrap();
        assert_eq!(rows.headers(), &["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_utf16le_document() {
        let mut bytes = vec![0xFF, 0xFE];
        for unit in "a;b\n1;2\n3;4\n".encode_utf16() {
            bytes.extend_from_slice(&unit.to_le_bytes());
        }
        let summary = scan(bytes.as_slice(), &ParseOptions::default()).unwrap();
        assert_eq!(summary.encoding, TextEncoding::Utf16Le);
        assert_eq!(summary.row_count, 2);
        assert_eq!(summary.content_hash, content_hash(&bytes));
    }

    #[test]
    fn test_field_count_mismatch_is_malformed() {
        let bytes = b"a,b,c\n1,2,3\n4,5\n";
        let options = ParseOptions {
            source_hint: Some(SourceType::Delimited),
        };
        let err = scan(&bytes[..], &options).unwrap_err();
        match err {
            NormalizationError::MalformedDocument(msg) => assert!(msg.contains("line 3"), "{}", msg),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_empty_and_binary_documents_are_malformed() {
        assert!(matches!(
            scan(&b""[..], &ParseOptions::default()),
            Err(NormalizationError::MalformedDocument(_))
        ));
        assert!(matches!(
            scan(&b"a,b\n\x001,2\n"[..], &ParseOptions::default()),
            Err(NormalizationError::MalformedDocument(_))
        ));
    }

    #[test]
    fn test_invalid_utf8_after_utf8_sample_is_malformed() {
        let mut bytes = "conta,descrição\n".as_bytes().to_vec();
        while bytes.len() < SAMPLE_BYTES + 1024 {
            bytes.extend_from_slice(b"1,2\n");
        }
        bytes.extend_from_slice(&[0xFF, b',', b'3', b'\n']);

        let err = scan(bytes.as_slice(), &ParseOptions::default()).unwrap_err();
        assert!(matches!(err, NormalizationError::MalformedDocument(_)));
    }

    #[test]
    fn test_latin1_after_ascii_sample_falls_back() {
        let mut bytes = b"account_code;account;year;amount\n".to_vec();
        while bytes.len() < 70 * 1024 {
            bytes.extend_from_slice(b"1.01;Caixa;2021;10,00\n");
        }
        bytes.extend_from_slice(b"1.02;Aplica\xE7\xE3o;2021;20,00\n");
        let data_rows = bytes.iter().filter(|&&b| b == b'\n').count() as u64 - 1;

        let summary = scan(bytes.as_slice(), &ParseOptions::default()).unwrap();
        assert_eq!(summary.encoding, TextEncoding::Latin1);
        assert_eq!(summary.row_count, data_rows);

        let mut rows = RowIter::new(bytes.as_slice()).unwrap();
        assert_eq!(rows.encoding(), TextEncoding::Utf8);
        let last = rows.by_ref().last().unwrap().unwrap();
        assert_eq!(last.fields[1], "Aplicação");
        assert_eq!(rows.encoding(), TextEncoding::Latin1);

        assert!(decode_text(&bytes).unwrap().ends_with("Aplicação;2021;20,00\n"));
    }

    #[test]
    fn test_plain_text_yields_lines() {
        let text = b"Balance sheet notes.\n\nCash increased, mostly from sales.\nSee note 4.\n";
        let summary = scan(&text[..], &ParseOptions::default()).unwrap();
        assert_eq!(summary.source_type, SourceType::Text);
        assert_eq!(summary.row_count, 3);
        assert!(summary.headers.is_empty());
    }

    #[test]
    fn test_source_hint_from_file_name() {
        assert_eq!(SourceType::from_file_name("ledger.CSV"), Some(SourceType::Delimited));
        assert_eq!(SourceType::from_file_name("notes.txt"), Some(SourceType::Text));
        assert_eq!(SourceType::from_file_name("blob"), None);

        let options = ParseOptions {
            source_hint: Some(SourceType::Text),
        };
        let summary = scan(&b"a,b\n1,2\n"[..], &options).unwrap();
        assert_eq!(summary.source_type, SourceType::Text);
    }

    #[test]
    fn test_decode_text() {
        assert_eq!(decode_text(b"\xEF\xBB\xBFhello").unwrap(), "hello");
        assert_eq!(decode_text(&[b'a', 0xE9]).unwrap(), "aé");
    }
}
