//! Per-field conflict-resolution algebra (spec §4.1). Pure, deterministic,
//! no I/O: `resolve_field` is a total function from a field's two sides plus
//! their `updated_at` timestamps to a `FieldResolution`.
//!
//! Grounded on the strategy-enum / pure-resolver shape of
//! `vsevex-carry::engine::reconcile::{MergeStrategy, ConflictResolution}` —
//! same idea (name the strategy, dispatch on it, never touch I/O) applied to
//! Transaction fields instead of whole records.

use chrono::{DateTime, FixedOffset};
use serde_json::Value;

use crate::model::Field;

/// Which workflow direction is asking — only `category_id` differs between
/// the two (§4.1 "Notes on category_id").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Pull,
    Push,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Immutable,
    LocalWinsWriteback,
    RemoteWinsOverwrite,
    RemoteWins,
    MergeSet,
}

impl Strategy {
    /// Resolves the strategy for `field` given the current workflow
    /// `direction`. `category_id` is the only field whose strategy depends
    /// on direction: pull uses remote-wins, push uses local-wins (§4.1).
    pub fn for_field(field: Field, direction: Direction) -> Strategy {
        match field {
            Field::Amount
            | Field::AccountId
            | Field::Currency
            | Field::ClosingBalance
            | Field::Date => Strategy::Immutable,
            Field::Narration
            | Field::Payee
            | Field::IsTransfer
            | Field::PairedId
            | Field::SuspectReason => Strategy::LocalWinsWriteback,
            Field::UpdatedAt => Strategy::RemoteWinsOverwrite,
            Field::CategoryId => match direction {
                Direction::Pull => Strategy::RemoteWins,
                Direction::Push => Strategy::LocalWinsWriteback,
            },
            Field::NeedsReview => Strategy::RemoteWins,
            Field::Labels => Strategy::MergeSet,
        }
    }
}

/// Diagnostic kind attached to every resolution, whether or not a mutation
/// was emitted (§4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Diagnostic {
    None,
    AppliedLocal,
    AppliedRemote,
    Merged,
    ConflictWarning,
}

/// The resolver's output for one field of one transaction pair: at most one
/// mutation per side, plus a diagnostic.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldResolution {
    pub field: Field,
    pub local_mutation: Option<Value>,
    pub remote_mutation: Option<Value>,
    pub diagnostic: Diagnostic,
}

impl FieldResolution {
    fn none(field: Field) -> Self {
        FieldResolution {
            field,
            local_mutation: None,
            remote_mutation: None,
            diagnostic: Diagnostic::None,
        }
    }
}

/// Resolves a single field given both sides' values (as JSON, so the
/// resolver stays generic over the field's concrete Rust type) and both
/// sides' `updated_at`. Pure: calling this twice with identical arguments
/// yields identical results (testable property #3).
pub fn resolve_field(
    field: Field,
    direction: Direction,
    local: &Value,
    remote: &Value,
    local_updated_at: Option<DateTime<FixedOffset>>,
    remote_updated_at: Option<DateTime<FixedOffset>>,
) -> FieldResolution {
    if local == remote {
        return FieldResolution::none(field);
    }

    match Strategy::for_field(field, direction) {
        Strategy::Immutable => FieldResolution {
            field,
            local_mutation: None,
            remote_mutation: None,
            diagnostic: Diagnostic::ConflictWarning,
        },
        Strategy::LocalWinsWriteback => FieldResolution {
            field,
            local_mutation: None,
            remote_mutation: Some(local.clone()),
            diagnostic: Diagnostic::AppliedLocal,
        },
        Strategy::RemoteWinsOverwrite | Strategy::RemoteWins => FieldResolution {
            field,
            local_mutation: Some(remote.clone()),
            remote_mutation: None,
            diagnostic: Diagnostic::AppliedRemote,
        },
        Strategy::MergeSet => resolve_merge_set(field, local, remote),
    }
    .with_tiebreak(local_updated_at, remote_updated_at)
}

impl FieldResolution {
    /// `updated_at` tie-breaking only matters for strategies this module
    /// doesn't define (there are none currently direction-free beyond the
    /// five strategies above); kept as a no-op hook so the comparator's
    /// missing-timestamp edge case (§4.2) has a single, documented seam.
    fn with_tiebreak(
        self,
        _local_updated_at: Option<DateTime<FixedOffset>>,
        _remote_updated_at: Option<DateTime<FixedOffset>>,
    ) -> Self {
        self
    }
}

fn resolve_merge_set(field: Field, local: &Value, remote: &Value) -> FieldResolution {
    let local_set = json_array_to_set(local);
    let remote_set = json_array_to_set(remote);
    let union: std::collections::BTreeSet<String> =
        local_set.union(&remote_set).cloned().collect();

    let union_value = Value::Array(union.iter().cloned().map(Value::String).collect());

    let local_mutation = if union != local_set {
        Some(union_value.clone())
    } else {
        None
    };
    let remote_mutation = if union != remote_set {
        Some(union_value)
    } else {
        None
    };

    FieldResolution {
        field,
        local_mutation,
        remote_mutation,
        diagnostic: Diagnostic::Merged,
    }
}

fn json_array_to_set(value: &Value) -> std::collections::BTreeSet<String> {
    value
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str())
                .map(|s| s.to_lowercase())
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn immutable_diff_emits_conflict_warning_and_no_mutation() {
        let res = resolve_field(
            Field::Amount,
            Direction::Pull,
            &json!("-10.00"),
            &json!("-10.50"),
            None,
            None,
        );
        assert_eq!(res.diagnostic, Diagnostic::ConflictWarning);
        assert!(res.local_mutation.is_none());
        assert!(res.remote_mutation.is_none());
    }

    #[test]
    fn identical_values_resolve_to_none() {
        let res = resolve_field(
            Field::Payee,
            Direction::Pull,
            &json!("Starbucks"),
            &json!("Starbucks"),
            None,
            None,
        );
        assert_eq!(res.diagnostic, Diagnostic::None);
    }

    #[test]
    fn local_wins_writeback_only_touches_remote() {
        let res = resolve_field(
            Field::Narration,
            Direction::Pull,
            &json!("groceries"),
            &json!(""),
            None,
            None,
        );
        assert_eq!(res.remote_mutation, Some(json!("groceries")));
        assert!(res.local_mutation.is_none());
    }

    #[test]
    fn category_strategy_is_direction_dependent() {
        assert_eq!(
            Strategy::for_field(Field::CategoryId, Direction::Pull),
            Strategy::RemoteWins
        );
        assert_eq!(
            Strategy::for_field(Field::CategoryId, Direction::Push),
            Strategy::LocalWinsWriteback
        );
    }

    #[test]
    fn push_category_local_wins_writes_remote_only() {
        // S6: local category changed, remote stale; push promotes local.
        let res = resolve_field(
            Field::CategoryId,
            Direction::Push,
            &json!("Expenses:Groceries"),
            &json!("Expenses:Uncategorized"),
            None,
            None,
        );
        assert_eq!(res.remote_mutation, Some(json!("Expenses:Groceries")));
        assert!(res.local_mutation.is_none());
    }

    #[test]
    fn label_merge_unions_and_case_folds() {
        // S1: local ["coffee"], remote ["coffee","morning"].
        let res = resolve_field(
            Field::Labels,
            Direction::Pull,
            &json!(["coffee"]),
            &json!(["coffee", "morning", "Coffee"]),
            None,
            None,
        );
        assert_eq!(res.diagnostic, Diagnostic::Merged);
        let local_mutation = res.local_mutation.unwrap();
        let mut got: Vec<String> = local_mutation
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_str().unwrap().to_string())
            .collect();
        got.sort();
        assert_eq!(got, vec!["coffee".to_string(), "morning".to_string()]);
        // remote already a superset once case-folded: no remote mutation.
        assert!(res.remote_mutation.is_none());
    }

    #[test]
    fn resolver_is_deterministic_under_repeated_calls() {
        let a = resolve_field(
            Field::Labels,
            Direction::Pull,
            &json!(["a"]),
            &json!(["b"]),
            None,
            None,
        );
        let b = resolve_field(
            Field::Labels,
            Direction::Pull,
            &json!(["a"]),
            &json!(["b"]),
            None,
            None,
        );
        assert_eq!(a, b);
    }
}
