use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountEntry {
    pub code: String,
    pub label: String,
    pub parent: Option<String>,
    /// 1 for roots.
    pub level: usize,
}

/// Account hierarchy derived purely from code prefixes.
///
/// The parent of a code is the longest other code in the chart that is a proper prefix
/// of it. Dotted codes (`1.01.002`) only split on dots, so `1.10` is never placed under
/// `1.1`; undotted codes (`1101`) split anywhere.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChartOfAccounts {
    accounts: BTreeMap<String, AccountEntry>,
}

/// Whether `ancestor` is a proper prefix of `code` on a valid boundary.
pub fn is_ancestor_code(ancestor: &str, code: &str) -> bool {
    if ancestor.is_empty() || ancestor.len() >= code.len() || !code.starts_with(ancestor) {
        return false;
    }
    if code.contains('.') {
        code[ancestor.len()..].starts_with('.')
    } else {
        true
    }
}

impl ChartOfAccounts {
    /// Builds the chart from `(code, label)` pairs. Repeated codes keep the first
    /// non-empty label.
    pub fn from_accounts<I, C, L>(accounts: I) -> Self
    where
        I: IntoIterator<Item = (C, L)>,
        C: Into<String>,
        L: Into<String>,
    {
        let mut labels: BTreeMap<String, String> = BTreeMap::new();
        for (code, label) in accounts {
            let code: String = code.into();
            let code = code.trim().to_string();
            if code.is_empty() {
                continue;
            }
            let label: String = label.into();
            let slot = labels.entry(code).or_default();
            if slot.is_empty() {
                *slot = label.trim().to_string();
            }
        }

        let mut accounts: BTreeMap<String, AccountEntry> = BTreeMap::new();
        // Ancestors sort before their descendants, so parents are always resolved first.
        for (code, label) in labels {
            let parent = accounts
                .keys()
                .filter(|candidate| is_ancestor_code(candidate, &code))
                .max_by_key(|candidate| candidate.len())
                .cloned();
            let level = parent
                .as_ref()
                .and_then(|p| accounts.get(p))
                .map(|p| p.level + 1)
                .unwrap_or(1);

            accounts.insert(
                code.clone(),
                AccountEntry {
                    code,
                    label,
                    parent,
                    level,
                },
            );
        }

        Self { accounts }
    }

    pub fn get(&self, code: &str) -> Option<&AccountEntry> {
        self.accounts.get(code)
    }

    pub fn contains(&self, code: &str) -> bool {
        self.accounts.contains_key(code)
    }

    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }

    /// All accounts in code order, each parent directly before its subtree.
    pub fn iter(&self) -> impl Iterator<Item = &AccountEntry> {
        self.accounts.values()
    }

    pub fn roots(&self) -> impl Iterator<Item = &AccountEntry> {
        self.accounts.values().filter(|a| a.parent.is_none())
    }

    pub fn children<'a>(&'a self, code: &'a str) -> impl Iterator<Item = &'a AccountEntry> + 'a {
        self.accounts
            .values()
            .filter(move |a| a.parent.as_deref() == Some(code))
    }

    pub fn is_leaf(&self, code: &str) -> bool {
        self.children(code).next().is_none()
    }

    /// Codes from the direct parent up to the root.
    pub fn ancestors(&self, code: &str) -> Vec<&str> {
        let mut out = Vec::new();
        let mut current = self.accounts.get(code).and_then(|a| a.parent.as_deref());
        while let Some(parent) = current {
            out.push(parent);
            current = self.accounts.get(parent).and_then(|a| a.parent.as_deref());
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chart(codes: &[&str]) -> ChartOfAccounts {
        ChartOfAccounts::from_accounts(codes.iter().map(|c| (*c, format!("Account {}", c))))
    }

    #[test]
    fn test_dotted_hierarchy() {
        let chart = chart(&["1", "1.01", "1.01.001", "1.01.002", "1.02", "2", "2.01"]);
        assert_eq!(chart.get("1.01.001").unwrap().parent.as_deref(), Some("1.01"));
        assert_eq!(chart.get("1.01.001").unwrap().level, 3);
        assert_eq!(chart.get("2.01").unwrap().parent.as_deref(), Some("2"));
        assert_eq!(chart.roots().count(), 2);

        let children: Vec<&str> = chart.children("1").map(|a| a.code.as_str()).collect();
        assert_eq!(children, vec!["1.01", "1.02"]);
        assert!(chart.is_leaf("1.02"));
        assert_eq!(chart.ancestors("1.01.002"), vec!["1.01", "1"]);
    }

    #[test]
    fn test_dot_boundary_is_respected() {
        let chart = chart(&["1.1", "1.10", "1.10.1"]);
        assert_eq!(chart.get("1.10").unwrap().parent, None);
        assert_eq!(chart.get("1.10.1").unwrap().parent.as_deref(), Some("1.10"));
    }

    #[test]
    fn test_undotted_codes_skip_missing_levels() {
        let chart = chart(&["1", "11", "1101", "2"]);
        assert_eq!(chart.get("1101").unwrap().parent.as_deref(), Some("11"));
        assert_eq!(chart.get("11").unwrap().parent.as_deref(), Some("1"));

        let sparse = ChartOfAccounts::from_accounts([("3", "Resultado"), ("30101", "Vendas")]);
        assert_eq!(sparse.get("30101").unwrap().parent.as_deref(), Some("3"));
        assert_eq!(sparse.get("30101").unwrap().level, 2);
    }

    #[test]
    fn test_first_non_empty_label_wins() {
        let chart = ChartOfAccounts::from_accounts([("1", ""), ("1", "Ativo"), ("1", "Outro")]);
        assert_eq!(chart.len(), 1);
        assert_eq!(chart.get("1").unwrap().label, "Ativo");
    }
}
