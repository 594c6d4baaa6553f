use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};

/// Lowercase snake_case identifier: non-alphanumerics collapse to a single `_`,
/// a leading digit gets a `col_` prefix and an empty result becomes `field`.
pub fn sanitize_identifier(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut last_underscore = true;

    for c in raw.trim().chars().map(fold_accent) {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
            last_underscore = false;
        } else if !last_underscore {
            out.push('_');
            last_underscore = true;
        }
    }

    while out.ends_with('_') {
        out.pop();
    }

    if out.is_empty() {
        return "field".to_string();
    }
    if out.starts_with(|c: char| c.is_ascii_digit()) {
        out.insert_str(0, "col_");
    }
    out
}

// Latin-1 accented letters are common in Portuguese/Spanish headers ("Descrição", "Código").
fn fold_accent(c: char) -> char {
    match c {
        'á' | 'à' | 'â' | 'ã' | 'ä' | 'Á' | 'À' | 'Â' | 'Ã' | 'Ä' => 'a',
        'é' | 'è' | 'ê' | 'ë' | 'É' | 'È' | 'Ê' | 'Ë' => 'e',
        'í' | 'ì' | 'î' | 'ï' | 'Í' | 'Ì' | 'Î' | 'Ï' => 'i',
        'ó' | 'ò' | 'ô' | 'õ' | 'ö' | 'Ó' | 'Ò' | 'Ô' | 'Õ' | 'Ö' => 'o',
        'ú' | 'ù' | 'û' | 'ü' | 'Ú' | 'Ù' | 'Û' | 'Ü' => 'u',
        'ç' | 'Ç' => 'c',
        'ñ' | 'Ñ' => 'n',
        other => other,
    }
}

/// First eight alphanumeric characters of an id, lowercased.
pub fn short_id(id: &str) -> String {
    id.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .take(8)
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

/// Extracts the JSON object from a model reply that may be wrapped in prose or code fences.
pub fn clean_json_output(raw: &str) -> String {
    if let Some(start) = raw.find('{') {
        if let Some(end) = raw.rfind('}') {
            if end > start {
                return raw[start..=end].to_string();
            }
        }
    }
    raw.trim().to_string()
}

/// Parses amounts written as `1234.56`, `1,234.56`, `1.234,56`, `(1.234,56)` or `R$ -10`.
pub fn parse_amount(raw: &str) -> Option<f64> {
    parse_amount_with(raw, DecimalMark::Auto)
}

/// Which character separates the fractional part of an amount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecimalMark {
    /// Guess per value. A lone separator is a decimal mark unless it groups thousands.
    #[default]
    Auto,
    Comma,
    Dot,
}

impl DecimalMark {
    /// Semicolon-delimited files come from comma-decimal locales.
    pub fn for_delimiter(delimiter: Option<char>) -> Self {
        match delimiter {
            Some(';') => DecimalMark::Comma,
            _ => DecimalMark::Auto,
        }
    }
}

/// Like [`parse_amount`], with the decimal mark fixed when the source locale is known.
pub fn parse_amount_with(raw: &str, mark: DecimalMark) -> Option<f64> {
    let mut s: String = raw
        .trim()
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '$' && *c != 'R' && *c != '€')
        .collect();
    if s.is_empty() {
        return None;
    }

    let mut negative = false;
    if s.starts_with('(') && s.ends_with(')') {
        negative = true;
        s = s[1..s.len() - 1].to_string();
    }
    if let Some(rest) = s.strip_prefix('-') {
        negative = !negative;
        s = rest.to_string();
    }

    let last_comma = s.rfind(',');
    let last_dot = s.rfind('.');
    let normalized = match (last_comma, last_dot) {
        (Some(c), Some(d)) if c > d => s.replace('.', "").replace(',', "."),
        (Some(_), Some(_)) => s.replace(',', ""),
        (Some(_), None) if s.matches(',').count() > 1 => s.replace(',', ""),
        (Some(c), None) => {
            let thousands = match mark {
                DecimalMark::Comma => false,
                DecimalMark::Dot => true,
                DecimalMark::Auto => groups_thousands(&s, c),
            };
            if thousands {
                s.replace(',', "")
            } else {
                s.replace(',', ".")
            }
        }
        (None, Some(_)) if s.matches('.').count() > 1 => s.replace('.', ""),
        (None, Some(d)) if mark == DecimalMark::Comma && groups_thousands(&s, d) => {
            s.replace('.', "")
        }
        _ => s,
    };

    let value: f64 = normalized.parse().ok()?;
    Some(if negative { -value } else { value })
}

/// `1,500` groups thousands; `0,500`, `1234,567` and `1,50` do not.
fn groups_thousands(s: &str, separator: usize) -> bool {
    let (int_part, decimals) = (&s[..separator], &s[separator + 1..]);
    (1..=3).contains(&int_part.len())
        && int_part.bytes().all(|b| b.is_ascii_digit())
        && !int_part.starts_with('0')
        && decimals.len() == 3
        && decimals.bytes().all(|b| b.is_ascii_digit())
}

/// Extracts a fiscal year from `2021`, `2021-12-31`, `31/12/2021` or SPED-style `31122021`.
pub fn parse_year(raw: &str) -> Option<i32> {
    let s = raw.trim();
    if s.len() == 4 {
        return s.parse::<i32>().ok().filter(|y| (1900..=2200).contains(y));
    }

    let formats = ["%Y-%m-%d", "%d/%m/%Y", "%d%m%Y", "%Y/%m/%d", "%d-%m-%Y"];
    formats
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(s, fmt).ok())
        .map(|date| date.year())
}
