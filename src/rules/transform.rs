//! Rule transforms (spec §4.3 "Transforms"). Each transform mutates one
//! field; multiple transforms in one rule compose in the order given, and a
//! transform whose target cannot be resolved is marked `invalid` without
//! aborting its sibling transforms.

use serde::Deserialize;

use crate::model::{Category, Label, Transaction};

use super::document::Rule;
use super::AppliedTransform;

/// One transform as loaded from the `then:` mapping, in YAML key order.
#[derive(Debug, Clone)]
pub enum Transform {
    Category(String),
    Labels(LabelSpec),
    Memo(String),
    Metadata(std::collections::BTreeMap<String, String>),
}

/// `labels:` accepts either a scalar (`"+coffee"`) or a list
/// (`["+coffee", "-uncategorized"]`); both normalize to the same `LabelOp`
/// list.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum LabelSpec {
    One(String),
    Many(Vec<String>),
}

impl LabelSpec {
    fn tokens(&self) -> Vec<&str> {
        match self {
            LabelSpec::One(s) => vec![s.as_str()],
            LabelSpec::Many(items) => items.iter().map(String::as_str).collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LabelOp {
    Add,
    Remove,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransformStatus {
    Applied,
    NoOp,
    Invalid,
    ConflictWarning,
}

#[derive(Debug, Clone)]
pub struct TransformOutcome {
    pub field: &'static str,
    pub old_value: String,
    pub new_value: String,
    pub status: TransformStatus,
}

/// Applies every transform in `rule.then`, in order, against `txn`,
/// mutating it in place and returning at most one `AppliedTransform` per
/// transform. A transform that resolves to no change at all (already-
/// applied, idempotent re-run) is silently skipped rather than logged, per
/// §4.3 "Determinism".
pub fn apply_transforms(
    rule: &Rule,
    txn: &mut Transaction,
    categories: &[Category],
) -> Vec<AppliedTransform> {
    let mut applied = Vec::new();
    let mut working_labels = txn.labels.clone();
    let mut working_narration = txn.narration.clone();
    let txn_id = txn.id;

    for transform in &rule.then {
        match transform {
            Transform::Category(name) => {
                let resolved = categories.iter().find(|c| &c.title == name);
                match resolved {
                    Some(cat) => {
                        let old = txn
                            .category_id
                            .map(|id| id.to_string())
                            .unwrap_or_else(|| "null".to_string());
                        if txn.category_id != Some(cat.id) {
                            applied.push(AppliedTransform {
                                rule_id: rule.id,
                                txn_id,
                                field: "category_id",
                                old_value: old,
                                new_value: cat.title.clone(),
                                status: TransformStatus::Applied,
                            });
                            txn.category_id = Some(cat.id);
                        }
                    }
                    None => applied.push(AppliedTransform {
                        rule_id: rule.id,
                        txn_id,
                        field: "category_id",
                        old_value: "null".to_string(),
                        new_value: name.clone(),
                        status: TransformStatus::Invalid,
                    }),
                }
            }
            Transform::Labels(spec) => {
                let before = working_labels.clone();
                for token in spec.tokens() {
                    let (op, raw) = if let Some(stripped) = token.strip_prefix('-') {
                        (LabelOp::Remove, stripped)
                    } else {
                        (LabelOp::Add, token.strip_prefix('+').unwrap_or(token))
                    };
                    if let Ok(label) = Label::new(raw) {
                        match op {
                            LabelOp::Add => {
                                working_labels.insert(label);
                            }
                            LabelOp::Remove => {
                                working_labels.remove(&label);
                            }
                        }
                    }
                }
                if working_labels != before {
                    applied.push(AppliedTransform {
                        rule_id: rule.id,
                        txn_id,
                        field: "labels",
                        old_value: before.to_string(),
                        new_value: working_labels.to_string(),
                        status: TransformStatus::Applied,
                    });
                }
            }
            Transform::Memo(text) => {
                if working_narration.is_empty() {
                    if text != &working_narration {
                        applied.push(AppliedTransform {
                            rule_id: rule.id,
                            txn_id,
                            field: "narration",
                            old_value: working_narration.clone(),
                            new_value: text.clone(),
                            status: TransformStatus::Applied,
                        });
                        working_narration = text.clone();
                    }
                } else if &working_narration != text {
                    applied.push(AppliedTransform {
                        rule_id: rule.id,
                        txn_id,
                        field: "narration",
                        old_value: working_narration.clone(),
                        new_value: text.clone(),
                        status: TransformStatus::ConflictWarning,
                    });
                }
            }
            Transform::Metadata(pairs) => {
                // Structured annotations share the `[key:value]` grammar
                // used for the remote's free-text note (§6); applied here
                // means folded into the local narration so push later
                // carries them across via the narration local-wins
                // writeback (§9 "structured metadata embedded in free
                // text").
                for (key, value) in pairs {
                    let (user_text, existing) = crate::metadata::parse_tags(&working_narration);
                    if existing.iter().any(|(k, v)| k == key && v == value) {
                        continue;
                    }
                    let mut tags: Vec<(&str, String)> = existing
                        .iter()
                        .filter(|(k, _)| k != key)
                        .map(|(k, v)| (k.as_str(), v.clone()))
                        .collect();
                    tags.push((key.as_str(), value.clone()));
                    let new_narration = crate::metadata::append_tags(&user_text, &tags);
                    applied.push(AppliedTransform {
                        rule_id: rule.id,
                        txn_id,
                        field: "narration",
                        old_value: working_narration.clone(),
                        new_value: new_narration.clone(),
                        status: TransformStatus::Applied,
                    });
                    working_narration = new_narration;
                }
            }
        }
    }

    txn.labels = working_labels;
    txn.narration = working_narration;

    applied
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CategoryId, CategoryKind};
    use chrono::NaiveDate;
    use rust_decimal::Decimal;

    fn sample_txn() -> Transaction {
        Transaction {
            id: 42,
            date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            amount: Decimal::new(-500, 2),
            currency: "USD".into(),
            account_id: 1,
            category_id: None,
            payee: "Starbucks #42".into(),
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

    fn sample_categories() -> Vec<Category> {
        vec![Category {
            id: 7 as CategoryId,
            title: "Expenses:Food:Coffee".into(),
            parent_id: None,
            kind: CategoryKind::Expense,
        }]
    }

    #[test]
    fn category_transform_applies_when_resolvable() {
        let rule = Rule {
            id: 1,
            if_: Default::default(),
            then: vec![Transform::Category("Expenses:Food:Coffee".to_string())],
            disabled: false,
        };
        let mut txn = sample_txn();
        let applied = apply_transforms(&rule, &mut txn, &sample_categories());
        assert_eq!(applied.len(), 1);
        assert_eq!(applied[0].status, TransformStatus::Applied);
        assert_eq!(applied[0].new_value, "Expenses:Food:Coffee");
    }

    #[test]
    fn category_transform_invalid_when_unresolvable() {
        let rule = Rule {
            id: 1,
            if_: Default::default(),
            then: vec![Transform::Category("Nonexistent:Category".to_string())],
            disabled: false,
        };
        let mut txn = sample_txn();
        let applied = apply_transforms(&rule, &mut txn, &[]);
        assert_eq!(applied[0].status, TransformStatus::Invalid);
    }

    #[test]
    fn labels_transform_adds_and_removes() {
        let mut txn = sample_txn();
        txn.labels = crate::model::LabelSet::from_tokens(["uncategorized"]).unwrap();
        let rule = Rule {
            id: 1,
            if_: Default::default(),
            then: vec![Transform::Labels(LabelSpec::Many(vec![
                "+coffee".to_string(),
                "-uncategorized".to_string(),
            ]))],
            disabled: false,
        };
        let applied = apply_transforms(&rule, &mut txn, &[]);
        assert_eq!(applied.len(), 1);
        assert!(applied[0].new_value.contains("coffee"));
        assert!(!applied[0].new_value.contains("uncategorized"));
    }

    #[test]
    fn rerunning_a_converged_rule_emits_nothing() {
        let mut txn = sample_txn();
        txn.category_id = Some(7);
        let rule = Rule {
            id: 1,
            if_: Default::default(),
            then: vec![Transform::Category("Expenses:Food:Coffee".to_string())],
            disabled: false,
        };
        let applied = apply_transforms(&rule, &mut txn, &sample_categories());
        assert!(applied.is_empty());
    }
}
