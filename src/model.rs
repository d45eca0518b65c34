//! Canonical data model shared by every component: resolver, comparator, rule
//! engine, transfer detector and orchestrator all operate on these types.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, FixedOffset, NaiveDate};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// A stable, globally unique transaction id assigned by the remote service.
pub type TransactionId = i64;
pub type AccountId = i64;
pub type CategoryId = i64;

/// A normalized label token. Construction enforces `[a-z0-9][a-z0-9-]*`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Label(String);

impl Label {
    pub fn new(raw: &str) -> Result<Self, InvalidLabel> {
        let normalized = raw.trim().to_lowercase().replace('_', "-");
        if normalized.is_empty() {
            return Err(InvalidLabel(raw.to_string()));
        }
        let mut chars = normalized.chars();
        let first_ok = chars.next().is_some_and(|c| c.is_ascii_alphanumeric());
        let rest_ok = chars.all(|c| c.is_ascii_alphanumeric() || c == '-');
        if !first_ok || !rest_ok {
            return Err(InvalidLabel(raw.to_string()));
        }
        Ok(Label(normalized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Label {
    type Error = InvalidLabel;
    fn try_from(value: String) -> Result<Self, Self::Error> {
        Label::new(&value)
    }
}

impl From<Label> for String {
    fn from(value: Label) -> Self {
        value.0
    }
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("invalid label token: {0:?}")]
pub struct InvalidLabel(pub String);

/// A case-folded, order-insensitive set of labels. Serializes in sorted order
/// so diffs and log entries are stable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LabelSet(BTreeSet<Label>);

impl LabelSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_tokens<I: IntoIterator<Item = S>, S: AsRef<str>>(
        tokens: I,
    ) -> Result<Self, InvalidLabel> {
        let mut set = BTreeSet::new();
        for tok in tokens {
            set.insert(Label::new(tok.as_ref())?);
        }
        Ok(LabelSet(set))
    }

    pub fn contains(&self, label: &Label) -> bool {
        self.0.contains(label)
    }

    pub fn insert(&mut self, label: Label) -> bool {
        self.0.insert(label)
    }

    pub fn remove(&mut self, label: &Label) -> bool {
        self.0.remove(label)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Label> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Set union; returns the merged set.
    pub fn union(&self, other: &LabelSet) -> LabelSet {
        LabelSet(self.0.union(&other.0).cloned().collect())
    }
}

impl fmt::Display for LabelSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered: Vec<&str> = self.0.iter().map(Label::as_str).collect();
        write!(f, "[{}]", rendered.join(","))
    }
}

/// Account classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountType {
    Asset,
    Liability,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    pub display_name: String,
    pub account_type: AccountType,
    pub currency: String,
    pub opening_date: NaiveDate,
    pub opening_balance: Option<Decimal>,
    /// Whether this account participates in foreign-exchange transfers; used
    /// by the transfer detector's `amount-mismatch-fx` reason.
    pub fx_enabled: bool,
}

impl Account {
    /// Opening date is the earlier of the remote-declared date and the
    /// earliest transaction date observed for this account (§3).
    pub fn reconcile_opening_date(&mut self, earliest_transaction_date: Option<NaiveDate>) {
        if let Some(earliest) = earliest_transaction_date {
            if earliest < self.opening_date {
                self.opening_date = earliest;
            }
        }
    }
}

/// Category classification, used to scope rule preconditions and to resolve
/// the transfer category by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CategoryKind {
    Income,
    Expense,
    Transfer,
    Asset,
    Liability,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Category {
    pub id: CategoryId,
    pub title: String,
    pub parent_id: Option<CategoryId>,
    pub kind: CategoryKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BalanceAssertion {
    pub account_id: AccountId,
    pub date: NaiveDate,
    pub amount: Decimal,
}

/// The central record. See spec §3 for field-by-field invariants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: TransactionId,
    pub date: NaiveDate,
    pub amount: Decimal,
    pub currency: String,
    pub account_id: AccountId,
    pub category_id: Option<CategoryId>,
    pub payee: String,
    pub narration: String,
    pub labels: LabelSet,
    pub needs_review: bool,
    pub is_transfer: bool,
    pub paired_id: Option<TransactionId>,
    pub suspect_reason: Option<String>,
    pub closing_balance: Option<Decimal>,
    pub updated_at: Option<DateTime<FixedOffset>>,
}

impl Transaction {
    /// Validates the cross-field invariants from spec §3 that a single
    /// transaction can check in isolation (pairing symmetry across two
    /// transactions is checked by the transfer detector / applier instead).
    pub fn validate(&self) -> Result<(), TransactionInvariantViolation> {
        if self.is_transfer && self.paired_id.is_none() {
            return Err(TransactionInvariantViolation::TransferWithoutPair(self.id));
        }
        if self.is_transfer && self.suspect_reason.is_some() {
            return Err(TransactionInvariantViolation::TransferAndSuspect(self.id));
        }
        Ok(())
    }

    /// Earliest-representable instant, used by the comparator when one side
    /// is missing `updated_at` (§4.2).
    pub fn updated_at_or_epoch(&self) -> DateTime<FixedOffset> {
        self.updated_at.unwrap_or_else(|| {
            DateTime::<chrono::Utc>::from_timestamp(0, 0)
                .expect("epoch is representable")
                .with_timezone(&FixedOffset::east_opt(0).expect("zero offset is valid"))
        })
    }

    /// Applies a resolver mutation (a JSON value produced for `field`) back
    /// onto this transaction. Only ever called for the non-`Immutable`
    /// fields: the immutable strategy never emits a mutation (§4.1), so the
    /// remaining five never need a conversion here.
    pub fn set_field(&mut self, field: Field, value: &serde_json::Value) -> Result<(), FieldApplyError> {
        use serde_json::Value;
        match field {
            Field::CategoryId => {
                self.category_id = match value {
                    Value::Null => None,
                    Value::Number(n) => n.as_i64(),
                    other => return Err(FieldApplyError::Shape(field, other.clone())),
                };
            }
            Field::Payee => {
                self.payee = value
                    .as_str()
                    .ok_or_else(|| FieldApplyError::Shape(field, value.clone()))?
                    .to_string();
            }
            Field::Narration => {
                self.narration = value
                    .as_str()
                    .ok_or_else(|| FieldApplyError::Shape(field, value.clone()))?
                    .to_string();
            }
            Field::Labels => {
                let tokens = value
                    .as_array()
                    .ok_or_else(|| FieldApplyError::Shape(field, value.clone()))?
                    .iter()
                    .filter_map(|v| v.as_str());
                self.labels = LabelSet::from_tokens(tokens)
                    .map_err(|e| FieldApplyError::InvalidLabel(e))?;
            }
            Field::NeedsReview => {
                self.needs_review = value
                    .as_bool()
                    .ok_or_else(|| FieldApplyError::Shape(field, value.clone()))?;
            }
            Field::IsTransfer => {
                self.is_transfer = value
                    .as_bool()
                    .ok_or_else(|| FieldApplyError::Shape(field, value.clone()))?;
            }
            Field::PairedId => {
                self.paired_id = match value {
                    Value::Null => None,
                    Value::Number(n) => n.as_i64(),
                    other => return Err(FieldApplyError::Shape(field, other.clone())),
                };
            }
            Field::SuspectReason => {
                self.suspect_reason = match value {
                    Value::Null => None,
                    Value::String(s) => Some(s.clone()),
                    other => return Err(FieldApplyError::Shape(field, other.clone())),
                };
            }
            Field::UpdatedAt => {
                let raw = value
                    .as_str()
                    .ok_or_else(|| FieldApplyError::Shape(field, value.clone()))?;
                let parsed = DateTime::parse_from_rfc3339(raw)
                    .map_err(|_| FieldApplyError::Shape(field, value.clone()))?;
                self.updated_at = Some(parsed);
            }
            Field::Date | Field::Amount | Field::Currency | Field::AccountId | Field::ClosingBalance => {
                return Err(FieldApplyError::Immutable(field));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum FieldApplyError {
    #[error("field {0} is immutable and cannot be written")]
    Immutable(Field),
    #[error("unexpected JSON shape for field {0}: {1}")]
    Shape(Field, serde_json::Value),
    #[error("invalid label in mutation: {0}")]
    InvalidLabel(#[from] InvalidLabel),
}

/// Renders a JSON value in the changelog grammar's literal form: scalars
/// bare, arrays bracketed and comma-joined, `null` as the literal word
/// (§6: "`<old>` and `<new>` are literal where scalar, `[...]` for lists").
pub fn render_json(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Null => "null".to_string(),
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Array(items) => {
            let rendered: Vec<String> = items.iter().map(render_json).collect();
            format!("[{}]", rendered.join(","))
        }
        other => other.to_string(),
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum TransactionInvariantViolation {
    #[error("transaction {0} is marked is_transfer but has no paired_id")]
    TransferWithoutPair(TransactionId),
    #[error("transaction {0} is both is_transfer and suspected (mutually exclusive)")]
    TransferAndSuspect(TransactionId),
}

/// The full fixed field set the comparator/resolver iterate over, in
/// declaration order — mutations are emitted in this order so changelog
/// replay is deterministic (§4.5 "Ordering").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    Date,
    Amount,
    Currency,
    AccountId,
    CategoryId,
    Payee,
    Narration,
    Labels,
    NeedsReview,
    IsTransfer,
    PairedId,
    SuspectReason,
    ClosingBalance,
    UpdatedAt,
}

impl Field {
    /// Declaration order used for all diff/mutation emission.
    pub const ALL: [Field; 14] = [
        Field::Date,
        Field::Amount,
        Field::Currency,
        Field::AccountId,
        Field::CategoryId,
        Field::Payee,
        Field::Narration,
        Field::Labels,
        Field::NeedsReview,
        Field::IsTransfer,
        Field::PairedId,
        Field::SuspectReason,
        Field::ClosingBalance,
        Field::UpdatedAt,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Field::Date => "date",
            Field::Amount => "amount",
            Field::Currency => "currency",
            Field::AccountId => "account_id",
            Field::CategoryId => "category_id",
            Field::Payee => "payee",
            Field::Narration => "narration",
            Field::Labels => "labels",
            Field::NeedsReview => "needs_review",
            Field::IsTransfer => "is_transfer",
            Field::PairedId => "paired_id",
            Field::SuspectReason => "suspect_reason",
            Field::ClosingBalance => "closing_balance",
            Field::UpdatedAt => "updated_at",
        }
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn label_normalizes_case_and_underscores() {
        let label = Label::new("Coffee_Shop").unwrap();
        assert_eq!(label.as_str(), "coffee-shop");
    }

    #[test]
    fn label_rejects_invalid_tokens() {
        assert!(Label::new("").is_err());
        assert!(Label::new("-leading-dash").is_err());
        assert!(Label::new("has space").is_err());
    }

    #[test]
    fn label_set_union_is_case_folded_and_deduped() {
        let a = LabelSet::from_tokens(["coffee", "Coffee"]).unwrap();
        assert_eq!(a.len(), 1);
        let b = LabelSet::from_tokens(["morning"]).unwrap();
        let merged = a.union(&b);
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn transfer_without_pair_is_invalid() {
        let txn = sample_transaction();
        let mut t = txn.clone();
        t.is_transfer = true;
        t.paired_id = None;
        assert!(matches!(
            t.validate(),
            Err(TransactionInvariantViolation::TransferWithoutPair(_))
        ));
    }

    #[test]
    fn transfer_and_suspect_are_mutually_exclusive() {
        let txn = sample_transaction();
        let mut t = txn.clone();
        t.is_transfer = true;
        t.paired_id = Some(2);
        t.suspect_reason = Some("same-direction".into());
        assert!(matches!(
            t.validate(),
            Err(TransactionInvariantViolation::TransferAndSuspect(_))
        ));
    }

    fn sample_transaction() -> Transaction {
        Transaction {
            id: 1,
            date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            amount: Decimal::new(-1000, 2),
            currency: "USD".into(),
            account_id: 1,
            category_id: None,
            payee: String::new(),
            narration: String::new(),
            labels: LabelSet::new(),
            needs_review: true,
            is_transfer: false,
            paired_id: None,
            suspect_reason: None,
            closing_balance: None,
            updated_at: None,
        }
    }
}
