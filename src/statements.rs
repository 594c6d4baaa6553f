//! Deterministic financial statements from ledger rows.
//!
//! Leaf balances are signed by their debit/credit nature, summed per fiscal year and
//! rolled up the chart of accounts, so every parent equals the sum of its children.
//! Horizontal analysis compares each year with the previous one; vertical analysis
//! expresses each account as a share of the statement's base account. Both are `None`
//! when the denominator is zero.

use crate::chart_of_accounts::{is_ancestor_code, ChartOfAccounts};
use crate::error::{NormalizationError, Result};
use crate::ingestion::{BalanceNature, LedgerColumns, LedgerRow};
use crate::utils::DecimalMark;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

pub const MAX_FISCAL_YEARS: usize = 5;

const ZERO_TOLERANCE: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatementKind {
    BalanceSheet,
    IncomeStatement,
}

impl StatementKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StatementKind::BalanceSheet => "balance_sheet",
            StatementKind::IncomeStatement => "income_statement",
        }
    }
}

/// Which accounts belong to a statement and which one is the vertical-analysis base.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatementLayout {
    pub kind: StatementKind,
    pub root_prefixes: Vec<String>,
    pub base_account: String,
}

impl StatementLayout {
    /// Assets (`1`) and liabilities plus equity (`2`), based on total assets.
    pub fn balance_sheet() -> Self {
        Self {
            kind: StatementKind::BalanceSheet,
            root_prefixes: vec!["1".to_string(), "2".to_string()],
            base_account: "1".to_string(),
        }
    }

    pub fn income_statement() -> Self {
        Self {
            kind: StatementKind::IncomeStatement,
            root_prefixes: vec!["3".to_string()],
            base_account: "3".to_string(),
        }
    }

    pub fn with_base_account(mut self, code: impl Into<String>) -> Self {
        self.base_account = code.into();
        self
    }

    pub fn includes(&self, code: &str) -> bool {
        self.root_prefixes
            .iter()
            .any(|root| root == code || is_ancestor_code(root, code))
    }

    /// Balance sheet: debit positive, credit negative. Income statement: the reverse.
    /// Rows without a nature keep their sign.
    pub fn signed_amount(&self, row: &LedgerRow) -> f64 {
        match (self.kind, row.nature) {
            (_, None) => row.amount,
            (StatementKind::BalanceSheet, Some(BalanceNature::Debit))
            | (StatementKind::IncomeStatement, Some(BalanceNature::Credit)) => row.amount,
            _ => -row.amount,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionOptions {
    /// Header mapping; detected from the document headers when `None`.
    pub columns: Option<LedgerColumns>,
    /// Decimal mark for amounts; taken from the document delimiter when `None`.
    pub decimal_mark: Option<DecimalMark>,
    pub balance_sheet: StatementLayout,
    pub income_statement: StatementLayout,
    pub max_years: usize,
}

impl Default for ExtractionOptions {
    fn default() -> Self {
        Self {
            columns: None,
            decimal_mark: None,
            balance_sheet: StatementLayout::balance_sheet(),
            income_statement: StatementLayout::income_statement(),
            max_years: MAX_FISCAL_YEARS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinancialStatementRow {
    pub account_code: String,
    pub account_label: String,
    pub level: usize,
    pub values_by_year: BTreeMap<i32, f64>,
    /// Percent change from the previous year; absent for the earliest year.
    pub horizontal_analysis: BTreeMap<i32, Option<f64>>,
    pub horizontal_delta: BTreeMap<i32, f64>,
    pub vertical_analysis: BTreeMap<i32, Option<f64>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinancialStatement {
    pub kind: StatementKind,
    pub years: Vec<i32>,
    pub base_account: String,
    pub rows: Vec<FinancialStatementRow>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinancialStatements {
    pub balance_sheet: FinancialStatement,
    pub income_statement: FinancialStatement,
}

fn percent(numerator: f64, denominator: f64) -> Option<f64> {
    if denominator.abs() < ZERO_TOLERANCE {
        None
    } else {
        Some(numerator / denominator * 100.0)
    }
}

impl FinancialStatement {
    pub fn row(&self, code: &str) -> Option<&FinancialStatementRow> {
        self.rows.iter().find(|r| r.account_code == code)
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// One line per account: values, then horizontal and vertical analysis per year.
    /// Missing analysis values are written as empty cells.
    pub fn to_csv(&self) -> Result<String> {
        let mut writer = csv::Writer::from_writer(Vec::new());

        let mut header = vec![
            "account_code".to_string(),
            "account_label".to_string(),
            "level".to_string(),
        ];
        for (i, year) in self.years.iter().enumerate() {
            header.push(year.to_string());
            if i > 0 {
                header.push(format!("ah_{}_abs", year));
                header.push(format!("ah_{}_pct", year));
            }
            header.push(format!("av_{}_pct", year));
        }
        writer.write_record(&header)?;

        let cell = |v: Option<f64>| v.map(|v| format!("{:.2}", v)).unwrap_or_default();
        for row in &self.rows {
            let mut record = vec![
                row.account_code.clone(),
                row.account_label.clone(),
                row.level.to_string(),
            ];
            for (i, year) in self.years.iter().enumerate() {
                record.push(cell(row.values_by_year.get(year).copied()));
                if i > 0 {
                    record.push(cell(row.horizontal_delta.get(year).copied()));
                    record.push(cell(row.horizontal_analysis.get(year).copied().flatten()));
                }
                record.push(cell(row.vertical_analysis.get(year).copied().flatten()));
            }
            writer.write_record(&record)?;
        }

        let bytes = writer
            .into_inner()
            .map_err(|e| NormalizationError::IoError(e.into_error()))?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

/// The latest `max_years` fiscal years present in `rows`, ascending.
pub fn fiscal_years<'a>(rows: impl IntoIterator<Item = &'a LedgerRow>, max_years: usize) -> Vec<i32> {
    let years: BTreeSet<i32> = rows.into_iter().map(|r| r.year).collect();
    let skip = years.len().saturating_sub(max_years);
    years.into_iter().skip(skip).collect()
}

pub fn build_statement(
    rows: &[LedgerRow],
    layout: &StatementLayout,
    max_years: usize,
) -> FinancialStatement {
    let selected: Vec<&LedgerRow> = rows.iter().filter(|r| layout.includes(&r.account_code)).collect();
    let years = fiscal_years(selected.iter().copied(), max_years);
    let selected: Vec<&LedgerRow> = selected
        .into_iter()
        .filter(|r| years.binary_search(&r.year).is_ok())
        .collect();

    // Roots missing from the ledger are added so every subtree has a total.
    let missing_roots = layout.root_prefixes.iter().filter(|root| {
        selected
            .iter()
            .any(|r| is_ancestor_code(root, &r.account_code))
            && !selected.iter().any(|r| &r.account_code == *root)
    });
    let chart = ChartOfAccounts::from_accounts(
        selected
            .iter()
            .map(|r| (r.account_code.clone(), r.account_label.clone()))
            .chain(missing_roots.map(|root| (root.clone(), format!("Total {}", root)))),
    );

    let parents: HashSet<&str> = chart.iter().filter_map(|a| a.parent.as_deref()).collect();
    let mut totals: HashMap<String, BTreeMap<i32, f64>> = chart
        .iter()
        .map(|a| (a.code.clone(), years.iter().map(|y| (*y, 0.0)).collect()))
        .collect();

    let mut ignored = 0usize;
    for row in &selected {
        // Parent balances are always recomputed from their children.
        if parents.contains(row.account_code.as_str()) {
            ignored += 1;
            continue;
        }
        if let Some(values) = totals.get_mut(&row.account_code) {
            *values.entry(row.year).or_insert(0.0) += layout.signed_amount(row);
        }
    }
    if ignored > 0 {
        debug!(
            "{}: ignored {} balances reported directly on parent accounts",
            layout.kind.as_str(),
            ignored
        );
    }

    // Descendants sort after their ancestors, so reverse order rolls leaves up first.
    let links: Vec<(String, String)> = chart
        .iter()
        .filter_map(|a| a.parent.clone().map(|p| (a.code.clone(), p)))
        .collect();
    for (code, parent) in links.into_iter().rev() {
        let child = totals.get(&code).cloned().unwrap_or_default();
        if let Some(parent_values) = totals.get_mut(&parent) {
            for (year, value) in child {
                *parent_values.entry(year).or_insert(0.0) += value;
            }
        }
    }

    let base = totals.get(&layout.base_account).cloned();
    let rows = chart
        .iter()
        .map(|account| {
            let values_by_year = totals.remove(&account.code).unwrap_or_default();
            let mut horizontal_analysis = BTreeMap::new();
            let mut horizontal_delta = BTreeMap::new();
            for pair in years.windows(2) {
                let previous = values_by_year.get(&pair[0]).copied().unwrap_or(0.0);
                let current = values_by_year.get(&pair[1]).copied().unwrap_or(0.0);
                horizontal_delta.insert(pair[1], current - previous);
                horizontal_analysis.insert(pair[1], percent(current - previous, previous));
            }

            let vertical_analysis = years
                .iter()
                .map(|year| {
                    let value = values_by_year.get(year).copied().unwrap_or(0.0);
                    let base_value = base
                        .as_ref()
                        .and_then(|b| b.get(year).copied())
                        .unwrap_or(0.0);
                    (*year, percent(value, base_value))
                })
                .collect();

            FinancialStatementRow {
                account_code: account.code.clone(),
                account_label: account.label.clone(),
                level: account.level,
                values_by_year,
                horizontal_analysis,
                horizontal_delta,
                vertical_analysis,
            }
        })
        .collect();

    FinancialStatement {
        kind: layout.kind,
        years,
        base_account: layout.base_account.clone(),
        rows,
    }
}

pub fn extract_statements(rows: &[LedgerRow], options: &ExtractionOptions) -> FinancialStatements {
    let balance_sheet = build_statement(rows, &options.balance_sheet, options.max_years);
    let income_statement = build_statement(rows, &options.income_statement, options.max_years);
    info!(
        "Extracted balance sheet ({} accounts) and income statement ({} accounts) over years {:?}",
        balance_sheet.rows.len(),
        income_statement.rows.len(),
        balance_sheet.years
    );
    FinancialStatements {
        balance_sheet,
        income_statement,
    }
}
