//! Rule preconditions: a conjunction over field predicates (spec §4.3).

use std::collections::BTreeMap;

use regex::RegexBuilder;
use serde::Deserialize;

use crate::error::ValidationError;
use crate::model::{Account, AccountType, Category, CategoryKind, Transaction};

/// Raw, pre-compile precondition as loaded from YAML. Compiled once at load
/// time into `CompiledPrecondition` (load failure aborts the whole load,
/// per §4.3 "All precondition patterns must successfully compile").
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Precondition {
    pub merchant: Option<String>,
    pub account: Option<String>,
    pub category: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl Precondition {
    /// Compiles every pattern in this precondition, returning the first
    /// compile error encountered.
    pub fn compile(&self) -> Result<CompiledPrecondition, ValidationError> {
        let compile = |field: &'static str, pattern: &str| {
            RegexBuilder::new(pattern)
                .case_insensitive(true)
                .build()
                .map_err(|source| ValidationError::InvalidRegex { field, source })
        };

        let merchant = self.merchant.as_deref().map(|p| compile("merchant", p)).transpose()?;
        let account = self.account.as_deref().map(|p| compile("account", p)).transpose()?;
        let category = self.category.as_deref().map(|p| compile("category", p)).transpose()?;
        let mut metadata = Vec::with_capacity(self.metadata.len());
        for (key, pattern) in &self.metadata {
            metadata.push((key.clone(), compile("metadata", pattern)?));
        }

        Ok(CompiledPrecondition {
            merchant,
            account,
            category,
            metadata,
        })
    }

    /// Convenience used by `rule lookup`: compiles and matches in one step.
    pub fn matches(
        &self,
        txn: &Transaction,
        account: &Account,
        categories: &[Category],
    ) -> Result<bool, ValidationError> {
        let compiled = self.compile()?;
        Ok(compiled
            .matches(txn, account, categories)
            .unwrap_or_else(|never| match never {}))
    }
}

/// A precondition with every pattern already compiled.
#[derive(Debug, Clone)]
pub struct CompiledPrecondition {
    merchant: Option<regex::Regex>,
    account: Option<regex::Regex>,
    category: Option<regex::Regex>,
    metadata: Vec<(String, regex::Regex)>,
}

impl CompiledPrecondition {
    /// Missing condition keys match anything (§4.3); all present keys must
    /// match for the precondition (and thus the rule) to match.
    pub fn matches(
        &self,
        txn: &Transaction,
        account: &Account,
        categories: &[Category],
    ) -> Result<bool, std::convert::Infallible> {
        if let Some(re) = &self.merchant {
            if !re.is_match(&txn.payee) {
                return Ok(false);
            }
        }

        if let Some(re) = &self.account {
            if !matches!(account.account_type, AccountType::Asset | AccountType::Liability)
                || !re.is_match(&account.display_name)
            {
                return Ok(false);
            }
        }

        if let Some(re) = &self.category {
            let category_title = txn.category_id.and_then(|cid| {
                categories.iter().find(|c| {
                    c.id == cid && matches!(c.kind, CategoryKind::Income | CategoryKind::Expense)
                })
            });
            match category_title {
                Some(cat) if re.is_match(&cat.title) => {}
                _ => return Ok(false),
            }
        }

        for (key, re) in &self.metadata {
            let value = metadata_value(txn, key);
            match value {
                Some(v) if re.is_match(&v) => {}
                _ => return Ok(false),
            }
        }

        Ok(true)
    }
}

/// Projects transaction-level metadata used by precondition `metadata:`
/// matching: labels (space-joined) and `needs_review` as its string form.
fn metadata_value(txn: &Transaction, key: &str) -> Option<String> {
    match key {
        "needs_review" => Some(txn.needs_review.to_string()),
        "labels" => Some(
            txn.labels
                .iter()
                .map(|l| l.as_str().to_string())
                .collect::<Vec<_>>()
                .join(" "),
        ),
        other => txn.labels.iter().find(|l| l.as_str() == other).map(|l| l.as_str().to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use rust_decimal::Decimal;

    fn sample_txn(payee: &str) -> Transaction {
        Transaction {
            id: 1,
            date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            amount: Decimal::new(-500, 2),
            currency: "USD".into(),
            account_id: 1,
            category_id: None,
            payee: payee.into(),
            narration: String::new(),
            labels: Default::default(),
            needs_review: true,
            is_transfer: false,
            paired_id: None,
            suspect_reason: None,
            closing_balance: None,
            updated_at: None,
        }
    }

    fn sample_account() -> Account {
        Account {
            id: 1,
            display_name: "Checking".into(),
            account_type: AccountType::Asset,
            currency: "USD".into(),
            opening_date: NaiveDate::from_ymd_opt(2020, 1, 1).unwrap(),
            opening_balance: None,
            fx_enabled: false,
        }
    }

    #[test]
    fn merchant_regex_matches_case_insensitively() {
        let precondition = Precondition {
            merchant: Some("^starbucks".to_string()),
            ..Default::default()
        };
        let txn = sample_txn("Starbucks #42");
        assert!(precondition.matches(&txn, &sample_account(), &[]).unwrap());
    }

    #[test]
    fn missing_condition_matches_anything() {
        let precondition = Precondition::default();
        let txn = sample_txn("anything");
        assert!(precondition.matches(&txn, &sample_account(), &[]).unwrap());
    }

    #[test]
    fn non_matching_merchant_fails() {
        let precondition = Precondition {
            merchant: Some("^starbucks".to_string()),
            ..Default::default()
        };
        let txn = sample_txn("Woolworths");
        assert!(!precondition.matches(&txn, &sample_account(), &[]).unwrap());
    }
}
