use crate::error::{NormalizationError, Result};
use crate::parser::Row;
use crate::utils::{parse_amount_with, parse_year, sanitize_identifier, DecimalMark};
use log::{debug, warn};
use serde::{Deserialize, Serialize};

/// Debit/credit indicator carried by SPED-style ledgers (`IND_DC`, `IND_DC_FIN`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BalanceNature {
    Debit,
    Credit,
}

impl BalanceNature {
    pub fn from_indicator(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "d" | "debit" | "debito" | "devedora" | "dr" => Some(BalanceNature::Debit),
            "c" | "credit" | "credito" | "credora" | "cr" => Some(BalanceNature::Credit),
            _ => None,
        }
    }
}

/// One account balance (or movement) for one fiscal year.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerRow {
    pub account_code: String,
    pub account_label: String,
    pub year: i32,
    pub amount: f64,
    pub nature: Option<BalanceNature>,
}

impl LedgerRow {
    pub fn new(code: impl Into<String>, label: impl Into<String>, year: i32, amount: f64) -> Self {
        Self {
            account_code: code.into(),
            account_label: label.into(),
            year,
            amount,
            nature: None,
        }
    }

    pub fn with_nature(mut self, nature: BalanceNature) -> Self {
        self.nature = Some(nature);
        self
    }
}

const CODE_HEADERS: &[&str] = &[
    "account_code",
    "cod_cta",
    "cod_cta_ref",
    "codigo_conta",
    "codigo",
    "code",
    "conta",
];
const LABEL_HEADERS: &[&str] = &[
    "account_label",
    "account_name",
    "account",
    "cta",
    "descricao",
    "description",
    "nome_conta",
    "nome",
    "label",
];
const YEAR_HEADERS: &[&str] = &[
    "year",
    "ano",
    "fiscal_year",
    "exercicio",
    "dt_fin",
    "dt_res",
    "date",
    "data",
    "period",
    "periodo",
];
const AMOUNT_HEADERS: &[&str] = &[
    "amount",
    "vl_sld_fin",
    "vl_cta",
    "value",
    "valor",
    "saldo_final",
    "saldo",
    "balance",
];
const NATURE_HEADERS: &[&str] = &["nature", "ind_dc_fin", "ind_dc", "natureza", "dc", "d_c"];

/// Positions of the ledger fields within a row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerColumns {
    pub account_code: usize,
    pub account_label: Option<usize>,
    pub year: usize,
    pub amount: usize,
    pub nature: Option<usize>,
}

impl LedgerColumns {
    /// Matches headers against common English, Portuguese and SPED names.
    pub fn detect(headers: &[String]) -> Result<Self> {
        let normalized: Vec<String> = headers.iter().map(|h| sanitize_identifier(h)).collect();
        let find = |candidates: &[&str], taken: &[usize]| {
            candidates.iter().find_map(|candidate| {
                normalized
                    .iter()
                    .enumerate()
                    .find(|(i, h)| h.as_str() == *candidate && !taken.contains(i))
                    .map(|(i, _)| i)
            })
        };

        let missing = |field: &str| {
            NormalizationError::ValidationError(format!(
                "no {} column found in headers [{}]",
                field,
                headers.join(", ")
            ))
        };

        let account_code = find(CODE_HEADERS, &[]).ok_or_else(|| missing("account code"))?;
        let year = find(YEAR_HEADERS, &[account_code]).ok_or_else(|| missing("year"))?;
        let amount = find(AMOUNT_HEADERS, &[account_code, year]).ok_or_else(|| missing("amount"))?;
        let account_label = find(LABEL_HEADERS, &[account_code, year, amount]);
        let nature = find(NATURE_HEADERS, &[account_code, year, amount]);

        let columns = Self {
            account_code,
            account_label,
            year,
            amount,
            nature,
        };
        debug!("Detected ledger columns {:?}", columns);
        Ok(columns)
    }
}

/// Converts parsed rows into ledger rows. Rows without an account code, a year or an
/// amount (totals, blank lines, notes) are skipped. Amounts are read with `mark`.
pub fn ledger_rows<I>(columns: &LedgerColumns, mark: DecimalMark, rows: I) -> Result<Vec<LedgerRow>>
where
    I: IntoIterator<Item = Result<Row>>,
{
    let mut out = Vec::new();
    let mut skipped = 0usize;

    for row in rows {
        let row = row?;
        let field = |i: usize| row.fields.get(i).map(|s| s.trim()).unwrap_or("");

        let code = field(columns.account_code);
        let year = parse_year(field(columns.year));
        let amount = parse_amount_with(field(columns.amount), mark);

        match (code.is_empty(), year, amount) {
            (false, Some(year), Some(amount)) => out.push(LedgerRow {
                account_code: code.to_string(),
                account_label: columns
                    .account_label
                    .map(|i| field(i).to_string())
                    .unwrap_or_default(),
                year,
                amount,
                nature: columns.nature.and_then(|i| BalanceNature::from_indicator(field(i))),
            }),
            _ => skipped += 1,
        }
    }

    if skipped > 0 {
        warn!("Skipped {} ledger rows without a code, year or amount", skipped);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn row(line: u64, fields: &[&str]) -> Result<Row> {
        Ok(Row {
            line,
            fields: fields.iter().map(|s| s.to_string()).collect(),
        })
    }

    #[test]
    fn test_detects_sped_headers() {
        let columns =
            LedgerColumns::detect(&headers(&["COD_CTA", "CTA", "DT_FIN", "VL_SLD_FIN", "IND_DC_FIN"]))
                .unwrap();
        assert_eq!(columns.account_code, 0);
        assert_eq!(columns.account_label, Some(1));
        assert_eq!(columns.year, 2);
        assert_eq!(columns.amount, 3);
        assert_eq!(columns.nature, Some(4));
    }

    #[test]
    fn test_detects_plain_headers() {
        let columns =
            LedgerColumns::detect(&headers(&["Account Code", "Account", "Year", "Amount"])).unwrap();
        assert_eq!(columns.account_label, Some(1));
        assert_eq!(columns.nature, None);
    }

    #[test]
    fn test_missing_amount_column() {
        let err = LedgerColumns::detect(&headers(&["Conta", "Ano"])).unwrap_err();
        assert!(matches!(err, NormalizationError::ValidationError(ref m) if m.contains("amount")));
    }

    #[test]
    fn test_rows_are_converted_and_junk_skipped() {
        let columns = LedgerColumns::detect(&headers(&["conta", "descricao", "data", "valor", "natureza"])).unwrap();
        let rows = vec![
            row(2, &["1.01", "Caixa", "31/12/2021", "1.234,56", "D"]),
            row(3, &["2.01", "Fornecedores", "31122021", "(500,00)", "C"]),
            row(4, &["", "Total", "2021", "734,56", ""]),
            row(5, &["1.02", "Bancos", "n/a", "10", "D"]),
        ];

        let ledger = ledger_rows(&columns, DecimalMark::Comma, rows).unwrap();
        assert_eq!(ledger.len(), 2);
        assert_eq!(ledger[0].account_label, "Caixa");
        assert_eq!(ledger[0].year, 2021);
        assert!((ledger[0].amount - 1234.56).abs() < 1e-9);
        assert_eq!(ledger[0].nature, Some(BalanceNature::Debit));
        assert!((ledger[1].amount + 500.0).abs() < 1e-9);
        assert_eq!(ledger[1].nature, Some(BalanceNature::Credit));
    }

    #[test]
    fn test_comma_ledger_reads_three_decimals() {
        let columns = LedgerColumns::detect(&headers(&["conta", "ano", "valor"])).unwrap();
        let rows = || vec![row(2, &["1.01", "2021", "1,250"]), row(3, &["1.02", "2021", "0,500"])];

        let comma = ledger_rows(&columns, DecimalMark::Comma, rows()).unwrap();
        assert!((comma[0].amount - 1.25).abs() < 1e-9);
        assert!((comma[1].amount - 0.5).abs() < 1e-9);

        let auto = ledger_rows(&columns, DecimalMark::Auto, rows()).unwrap();
        assert!((auto[0].amount - 1250.0).abs() < 1e-9);
        assert!((auto[1].amount - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_nature_indicators() {
        assert_eq!(BalanceNature::from_indicator(" d "), Some(BalanceNature::Debit));
        assert_eq!(BalanceNature::from_indicator("Credora"), Some(BalanceNature::Credit));
        assert_eq!(BalanceNature::from_indicator("x"), None);
    }
}
