//! Pairs local and remote transactions by id and produces per-field diffs
//! (spec §4.2). Grounded on `vsevex-carry::engine::reconcile`'s
//! pair-by-id-then-classify loop, generalized from whole-operation conflicts
//! to per-field ones via the resolver.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::model::{Field, Transaction, TransactionId};
use crate::resolver::{resolve_field, Diagnostic, Direction, FieldResolution};

/// Classification of a single transaction id across the two sides (§4.2c).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    OnlyLocal,
    OnlyRemote,
    Identical,
    Differs,
}

/// One id's full comparison result: its classification plus, if present on
/// both sides, the per-field resolutions in declaration order.
#[derive(Debug, Clone)]
pub struct TransactionDiff {
    pub id: TransactionId,
    pub classification: Classification,
    pub field_diffs: Vec<FieldResolution>,
}

#[derive(Debug, Clone, Default)]
pub struct DiffSummary {
    pub identical: usize,
    pub differs: usize,
    pub only_local: usize,
    pub only_remote: usize,
}

#[derive(Debug, Clone)]
pub struct ComparisonResult {
    pub diffs: Vec<TransactionDiff>,
    pub summary: DiffSummary,
}

/// Extracts a transaction's field as a `serde_json::Value` so the generic
/// resolver can operate over any field by name (§4.1).
pub fn field_value(txn: &Transaction, field: Field) -> Value {
    match field {
        Field::Date => Value::String(txn.date.to_string()),
        Field::Amount => Value::String(txn.amount.to_string()),
        Field::Currency => Value::String(txn.currency.clone()),
        Field::AccountId => Value::from(txn.account_id),
        Field::CategoryId => match txn.category_id {
            Some(id) => Value::from(id),
            None => Value::Null,
        },
        Field::Payee => Value::String(txn.payee.clone()),
        Field::Narration => Value::String(txn.narration.clone()),
        Field::Labels => Value::Array(
            txn.labels
                .iter()
                .map(|l| Value::String(l.as_str().to_string()))
                .collect(),
        ),
        Field::NeedsReview => Value::Bool(txn.needs_review),
        Field::IsTransfer => Value::Bool(txn.is_transfer),
        Field::PairedId => match txn.paired_id {
            Some(id) => Value::from(id),
            None => Value::Null,
        },
        Field::SuspectReason => match &txn.suspect_reason {
            Some(reason) => Value::String(reason.clone()),
            None => Value::Null,
        },
        Field::ClosingBalance => match txn.closing_balance {
            Some(balance) => Value::String(balance.to_string()),
            None => Value::Null,
        },
        Field::UpdatedAt => match txn.updated_at {
            Some(ts) => Value::String(ts.to_rfc3339()),
            None => Value::Null,
        },
    }
}

/// Compares a single local/remote pair across the fixed field set, in
/// declaration order (§4.2b, §4.5 ordering guarantee (iii)).
pub fn compare_pair(direction: Direction, local: &Transaction, remote: &Transaction) -> Vec<FieldResolution> {
    Field::ALL
        .iter()
        .map(|&field| {
            let local_value = field_value(local, field);
            let remote_value = field_value(remote, field);
            resolve_field(
                field,
                direction,
                &local_value,
                &remote_value,
                local.updated_at,
                remote.updated_at,
            )
        })
        .collect()
}

/// Compares the full local and remote collections, pairing by id.
pub fn compare(
    direction: Direction,
    locals: &[Transaction],
    remotes: &[Transaction],
) -> ComparisonResult {
    let mut local_by_id: BTreeMap<TransactionId, &Transaction> =
        locals.iter().map(|t| (t.id, t)).collect();
    let mut remote_by_id: BTreeMap<TransactionId, &Transaction> =
        remotes.iter().map(|t| (t.id, t)).collect();

    let mut all_ids: Vec<TransactionId> = local_by_id
        .keys()
        .chain(remote_by_id.keys())
        .copied()
        .collect();
    all_ids.sort_unstable();
    all_ids.dedup();

    let mut summary = DiffSummary::default();
    let mut diffs = Vec::with_capacity(all_ids.len());

    for id in all_ids {
        let local = local_by_id.remove(&id);
        let remote = remote_by_id.remove(&id);

        let (classification, field_diffs) = match (local, remote) {
            (Some(_), None) => {
                summary.only_local += 1;
                (Classification::OnlyLocal, Vec::new())
            }
            (None, Some(_)) => {
                summary.only_remote += 1;
                (Classification::OnlyRemote, Vec::new())
            }
            (Some(l), Some(r)) => {
                let field_diffs = compare_pair(direction, l, r);
                let has_difference = field_diffs
                    .iter()
                    .any(|d| d.diagnostic != Diagnostic::None);
                if has_difference {
                    summary.differs += 1;
                } else {
                    summary.identical += 1;
                }
                (
                    if has_difference {
                        Classification::Differs
                    } else {
                        Classification::Identical
                    },
                    field_diffs,
                )
            }
            (None, None) => unreachable!("id came from one of the two maps"),
        };

        diffs.push(TransactionDiff {
            id,
            classification,
            field_diffs,
        });
    }

    ComparisonResult { diffs, summary }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use rust_decimal::Decimal;

    fn txn(id: TransactionId, amount: &str) -> Transaction {
        Transaction {
            id,
            date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            amount: amount.parse::<Decimal>().unwrap(),
            currency: "AUD".into(),
            account_id: 1,
            category_id: None,
            payee: String::new(),
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

    #[test]
    fn only_local_and_only_remote_are_classified() {
        let locals = vec![txn(1, "-10.00")];
        let remotes = vec![txn(2, "-10.00")];
        let result = compare(Direction::Pull, &locals, &remotes);
        assert_eq!(result.summary.only_local, 1);
        assert_eq!(result.summary.only_remote, 1);
    }

    #[test]
    fn identical_transactions_produce_no_diagnostics() {
        let locals = vec![txn(1, "-10.00")];
        let remotes = vec![txn(1, "-10.00")];
        let result = compare(Direction::Pull, &locals, &remotes);
        assert_eq!(result.summary.identical, 1);
        assert_eq!(result.diffs[0].classification, Classification::Identical);
    }

    #[test]
    fn immutable_amount_conflict_counts_as_differs() {
        // S2: local -10.00, remote -10.50.
        let locals = vec![txn(1, "-10.00")];
        let remotes = vec![txn(1, "-10.50")];
        let result = compare(Direction::Pull, &locals, &remotes);
        assert_eq!(result.summary.differs, 1);
        let diff = &result.diffs[0];
        let amount_diag = diff
            .field_diffs
            .iter()
            .find(|d| d.field == Field::Amount)
            .unwrap();
        assert_eq!(amount_diag.diagnostic, Diagnostic::ConflictWarning);
        assert!(amount_diag.local_mutation.is_none());
    }
}
