//! Declarative classification rules (spec §4.3). A rule directory holds any
//! number of YAML documents, each a list of `Rule`s; rule ids must be
//! globally unique across the whole directory, and rules match first-match-
//! wins in ascending id order.
//!
//! Grounded on `Lederstrumpf-farcaster-core`'s `serde_yaml` dependency for
//! the loading format, and the teacher's "open a transaction, perform
//! several related writes, commit" shape (`oplog::log_local_change` and
//! friends) for `apply_to_store`'s per-rule, per-transform application loop.

mod document;
mod edit;
mod load;
mod precondition;
mod transform;

pub use document::{Rule, RuleDocument};
pub use edit::{add_rule, remove_rule, NewRule};
pub use load::{load_rules_dir, RuleSet};
pub use precondition::Precondition;
pub use transform::{LabelOp, Transform, TransformOutcome, TransformStatus};

use crate::error::ValidationError;
use crate::model::{Account, Category, Transaction};

/// One applied transform, ready to be turned into an `APPLY` changelog entry
/// (§4.3 "Logging").
#[derive(Debug, Clone)]
pub struct AppliedTransform {
    pub rule_id: i64,
    pub txn_id: crate::model::TransactionId,
    pub field: &'static str,
    pub old_value: String,
    pub new_value: String,
    pub status: TransformStatus,
}

/// Evaluates the rule set against a single transaction in a known account/
/// category context, mutating `txn` in place with the first matching
/// rule's transforms and returning that rule (if any) plus the applied
/// transforms (empty if no rule matches, or if the sole match is
/// `disabled`).
///
/// Pure with respect to the rule set: re-evaluating an unchanged
/// transaction a second time yields no further mutations and an empty
/// applied list, which is what gives rule application its idempotence
/// (testable property #2).
pub fn evaluate<'a>(
    rules: &'a RuleSet,
    txn: &mut Transaction,
    account: &Account,
    categories: &[Category],
) -> Result<(Option<&'a Rule>, Vec<AppliedTransform>), ValidationError> {
    for loaded in rules.loaded_rules() {
        if loaded.rule.disabled {
            continue;
        }
        let matched = loaded
            .compiled
            .matches(txn, account, categories)
            .unwrap_or_else(|never| match never {});
        if matched {
            let applied = transform::apply_transforms(&loaded.rule, txn, categories);
            return Ok((Some(&loaded.rule), applied));
        }
    }
    Ok((None, Vec::new()))
}

/// Applies `rules` to every transaction in `transactions`, in ascending id
/// order, looking up each transaction's owning account by `account_id`
/// (transactions whose account is unknown are left untouched). This is the
/// engine behind the `rule apply` command (§4.3 "Apply command
/// semantics": local-only, never touches the remote).
///
/// Returns every applied transform across the whole pass, in the order
/// transactions were visited, ready to become `APPLY` changelog entries.
pub fn apply_to_transactions(
    rules: &RuleSet,
    transactions: &mut [Transaction],
    accounts: &[Account],
    categories: &[Category],
) -> Result<Vec<AppliedTransform>, ValidationError> {
    use std::collections::BTreeMap;

    let accounts_by_id: BTreeMap<crate::model::AccountId, &Account> =
        accounts.iter().map(|a| (a.id, a)).collect();

    let mut order: Vec<usize> = (0..transactions.len()).collect();
    order.sort_by_key(|&i| transactions[i].id);

    let mut all_applied = Vec::new();
    for i in order {
        let Some(&account) = accounts_by_id.get(&transactions[i].account_id) else {
            continue;
        };
        let (_, applied) = evaluate(rules, &mut transactions[i], account, categories)?;
        all_applied.extend(applied);
    }
    Ok(all_applied)
}
