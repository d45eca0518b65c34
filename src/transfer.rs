//! Transfer-pair detector (spec §4.4): a spatial-hash candidate search over
//! transactions, classifying pairs as confirmed or suspected, with a
//! degenerate-bucket fallback scan and idempotent re-runs.
//!
//! Grounded on the confirmed/suspected candidate vocabulary of
//! `other_examples/.../Techwizop-codexAccountant__...reconciliation.rs`
//! (`MatchCandidate`, scoring sessions) and the teacher's
//! `apply_remote_ops`'s "skip if already recorded" idempotent-application
//! pattern (`applied_remote_ops` lookup before applying).

use std::collections::{BTreeMap, HashSet};

use chrono::{Datelike, NaiveDate};
use regex::Regex;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

use crate::model::{Account, AccountId, CategoryId, Transaction, TransactionId};

#[derive(Debug, Clone, Copy)]
pub struct DetectorConfig {
    /// D_confirmed: max |Δdate| (inclusive) for a confirmed pair.
    pub confirmed_date_window_days: i64,
    /// D_suspected: max |Δdate| (inclusive) for a suspected date-delay pair.
    pub suspected_date_window_days: i64,
    /// P_fx: max relative amount mismatch tolerated for an FX-suspected pair.
    pub fx_tolerance_pct: Decimal,
    /// Bucket degeneracy safeguard threshold.
    pub max_bucket_size: usize,
    /// Minimum number of suspected pairs sharing a reason before the
    /// aggregate pattern notification fires.
    pub pattern_notification_threshold: usize,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        DetectorConfig {
            confirmed_date_window_days: 2,
            suspected_date_window_days: 4,
            fx_tolerance_pct: Decimal::new(5, 2), // 5%
            max_bucket_size: 1000,
            pattern_notification_threshold: 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairKind {
    Confirmed,
    Suspected,
}

#[derive(Debug, Clone)]
pub struct DetectedPair {
    pub a: TransactionId,
    pub b: TransactionId,
    pub kind: PairKind,
    /// Comma-separated reason tokens; empty for confirmed pairs. Owned since
    /// `date-delay-Nd` carries a dynamic day count.
    pub reasons: Vec<String>,
}

impl DetectedPair {
    pub fn suspect_reason_string(&self) -> Option<String> {
        if self.reasons.is_empty() {
            None
        } else {
            Some(self.reasons.join(","))
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PatternNotification {
    pub reason: String,
    pub count: usize,
}

#[derive(Debug, Clone, Default)]
pub struct DetectionReport {
    pub pairs: Vec<DetectedPair>,
    pub pattern_notifications: Vec<PatternNotification>,
}

/// Runs the transfer detector over `transactions` and `accounts`, returning
/// every newly detected pair. Already-paired transactions whose counterpart
/// still exists are skipped entirely (idempotence, testable property #4).
pub fn detect_transfers(
    transactions: &[Transaction],
    accounts: &[Account],
) -> DetectionReport {
    detect_transfers_with_config(transactions, accounts, DetectorConfig::default())
}

pub fn detect_transfers_with_config(
    transactions: &[Transaction],
    accounts: &[Account],
    config: DetectorConfig,
) -> DetectionReport {
    let accounts_by_id: BTreeMap<AccountId, &Account> =
        accounts.iter().map(|a| (a.id, a)).collect();
    let existing_ids: HashSet<TransactionId> = transactions.iter().map(|t| t.id).collect();

    let candidates: Vec<&Transaction> = transactions
        .iter()
        .filter(|t| match t.paired_id {
            // Already paired: idempotent skip only if the counterpart still
            // exists (§4.4 "Idempotence").
            Some(other) => !existing_ids.contains(&other),
            None => true,
        })
        .collect();

    let pairs = if bucket_would_degenerate(&candidates, &config) {
        fallback_scan(&candidates, &accounts_by_id, &config)
    } else {
        spatial_hash_scan(&candidates, &accounts_by_id, &config)
    };

    let pattern_notifications = aggregate_reasons(&pairs, &config);

    DetectionReport {
        pairs,
        pattern_notifications,
    }
}

fn bucket_would_degenerate(candidates: &[&Transaction], config: &DetectorConfig) -> bool {
    let d_total = config.suspected_date_window_days.max(1);
    let mut buckets: BTreeMap<(i64, i64), usize> = BTreeMap::new();
    for t in candidates {
        let key = (bucket_date(t.date, d_total), amount_cents(t.amount));
        *buckets.entry(key).or_insert(0) += 1;
    }
    buckets.values().any(|&count| count > config.max_bucket_size)
}

fn bucket_date(date: NaiveDate, d_total: i64) -> i64 {
    date.num_days_from_ce() as i64 / d_total
}

/// `bucket_amount(a) = round(a, 2)` from §4.4, represented as integer cents
/// so it can key a `BTreeMap` cheaply.
fn amount_cents(amount: Decimal) -> i64 {
    (amount.abs().round_dp(2) * Decimal::from(100))
        .to_i64()
        .unwrap_or(0)
}

/// The FX-fuzzy index key: `round(a, 0)`, whole currency units.
fn amount_units(amount: Decimal) -> i64 {
    amount.abs().round_dp(0).to_i64().unwrap_or(0)
}

/// Half-width (in whole units) of the fuzzy probe band around `center_units`
/// for a given FX tolerance. Deliberately generous: over-wide candidates are
/// filtered precisely by `classify_pair`'s relative-difference check, so
/// erring wide here only costs extra comparisons, never a missed pair.
fn fx_unit_tolerance(center_units: i64, fx_tolerance_pct: Decimal) -> i64 {
    if center_units == 0 {
        return 1;
    }
    let band = (Decimal::from(center_units) * fx_tolerance_pct)
        .ceil()
        .to_i64()
        .unwrap_or(0);
    (band + 1).max(1)
}

/// Spatial-hash scan: buckets by (date-bucket, rounded-amount) and only
/// compares transactions in the same or adjacent date buckets, as specced
/// in §4.4 "Indexing algorithm".
fn spatial_hash_scan(
    candidates: &[&Transaction],
    accounts: &BTreeMap<AccountId, &Account>,
    config: &DetectorConfig,
) -> Vec<DetectedPair> {
    let d_total = config.suspected_date_window_days.max(1);

    // Exact-amount index keyed on (date bucket, amount rounded to cents).
    let mut exact_index: BTreeMap<(i64, i64), Vec<TransactionId>> = BTreeMap::new();
    // Fuzzy-amount index keyed on (date bucket, amount rounded to whole units).
    let mut fuzzy_index: BTreeMap<(i64, i64), Vec<TransactionId>> = BTreeMap::new();

    let mut by_id: BTreeMap<TransactionId, &Transaction> = BTreeMap::new();
    for t in candidates {
        by_id.insert(t.id, t);
        let db = bucket_date(t.date, d_total);
        let exact_key = (db, amount_cents(t.amount));
        exact_index.entry(exact_key).or_default().push(t.id);
        let fuzzy_key = (db, amount_units(t.amount));
        fuzzy_index.entry(fuzzy_key).or_default().push(t.id);
    }

    let mut paired: HashSet<TransactionId> = HashSet::new();
    let mut pairs = Vec::new();

    let mut sorted_ids: Vec<TransactionId> = by_id.keys().copied().collect();
    sorted_ids.sort_unstable();

    for id in sorted_ids {
        if paired.contains(&id) {
            continue;
        }
        let t = by_id[&id];
        let db = bucket_date(t.date, d_total);

        let center_units = amount_units(t.amount);
        let tol = fx_unit_tolerance(center_units, config.fx_tolerance_pct);

        let mut bucket_candidates: Vec<TransactionId> = Vec::new();
        for delta in -1..=1 {
            let exact_key = (db + delta, amount_cents(t.amount));
            if let Some(ids) = exact_index.get(&exact_key) {
                bucket_candidates.extend(ids.iter().copied());
            }
            // An FX pair's two legs round to *different* whole-unit buckets
            // by definition, so the fuzzy probe must sweep every unit within
            // the tolerance band, not just the query's own bucket.
            for u in (center_units - tol)..=(center_units + tol) {
                if u < 0 {
                    continue;
                }
                let fuzzy_key = (db + delta, u);
                if let Some(ids) = fuzzy_index.get(&fuzzy_key) {
                    bucket_candidates.extend(ids.iter().copied());
                }
            }
        }
        bucket_candidates.sort_unstable();
        bucket_candidates.dedup();

        let mut best: Option<(i64, TransactionId, DetectedPair)> = None;
        for other_id in bucket_candidates {
            if other_id == id || paired.contains(&other_id) {
                continue;
            }
            let other = by_id[&other_id];
            if let Some(pair) = classify_pair(t, other, accounts, config) {
                let delta_days = (t.date - other.date).num_days().abs();
                let candidate_key = (delta_days, other_id);
                let better = match &best {
                    None => true,
                    Some((best_delta, best_id, _)) => {
                        candidate_key < (*best_delta, *best_id)
                    }
                };
                if better {
                    best = Some((delta_days, other_id, pair));
                }
            }
        }

        if let Some((_, other_id, pair)) = best {
            paired.insert(id);
            paired.insert(other_id);
            pairs.push(pair);
        }
    }

    pairs
}

/// Fallback scan used when a bucket degenerates (§4.4 "Bucket degeneracy
/// safeguard"): sort by date, binary-search a symmetric window, filter
/// linearly. Produces the same classification as the spatial-hash path,
/// just without the bucket index.
fn fallback_scan(
    candidates: &[&Transaction],
    accounts: &BTreeMap<AccountId, &Account>,
    config: &DetectorConfig,
) -> Vec<DetectedPair> {
    let mut sorted: Vec<&Transaction> = candidates.to_vec();
    sorted.sort_by_key(|t| (t.date, t.id));

    let window = config.suspected_date_window_days;
    let mut paired: HashSet<TransactionId> = HashSet::new();
    let mut pairs = Vec::new();

    for i in 0..sorted.len() {
        let t = sorted[i];
        if paired.contains(&t.id) {
            continue;
        }
        let lower = t.date - chrono::Duration::days(window);
        let upper = t.date + chrono::Duration::days(window);
        let start = sorted.partition_point(|candidate| candidate.date < lower);
        let end = sorted.partition_point(|candidate| candidate.date <= upper);

        let mut best: Option<(i64, TransactionId, DetectedPair)> = None;
        for other in &sorted[start..end] {
            if other.id == t.id || paired.contains(&other.id) {
                continue;
            }
            if let Some(pair) = classify_pair(t, other, accounts, config) {
                let delta_days = (t.date - other.date).num_days().abs();
                let candidate_key = (delta_days, other.id);
                let better = match &best {
                    None => true,
                    Some((best_delta, best_id, _)) => candidate_key < (*best_delta, *best_id),
                };
                if better {
                    best = Some((delta_days, other.id, pair));
                }
            }
        }

        if let Some((_, other_id, pair)) = best {
            paired.insert(t.id);
            paired.insert(other_id);
            pairs.push(pair);
        }
    }

    pairs
}

/// Classifies a candidate (t, other) pair, returning `None` if neither
/// confirmed nor suspected criteria are met.
fn classify_pair(
    t: &Transaction,
    other: &Transaction,
    accounts: &BTreeMap<AccountId, &Account>,
    config: &DetectorConfig,
) -> Option<DetectedPair> {
    if t.account_id == other.account_id {
        return None;
    }

    let delta_days = (t.date - other.date).num_days().abs();
    let opposite_signs = !t.amount.is_zero()
        && !other.amount.is_zero()
        && t.amount.is_sign_negative() != other.amount.is_sign_negative();
    let exact_amount_match = t.amount.abs() == other.amount.abs();

    if opposite_signs && exact_amount_match && delta_days <= config.confirmed_date_window_days {
        return Some(DetectedPair {
            a: t.id,
            b: other.id,
            kind: PairKind::Confirmed,
            reasons: Vec::new(),
        });
    }

    let mut reasons: Vec<String> = Vec::new();

    if !opposite_signs {
        reasons.push("same-direction".to_string());
    }

    let fx_enabled = accounts.get(&t.account_id).is_some_and(|a| a.fx_enabled)
        || accounts.get(&other.account_id).is_some_and(|a| a.fx_enabled);
    if fx_enabled && !exact_amount_match {
        let bigger = t.amount.abs().max(other.amount.abs());
        let diff = (t.amount.abs() - other.amount.abs()).abs();
        if !bigger.is_zero() && diff / bigger <= config.fx_tolerance_pct {
            reasons.push("amount-mismatch-fx".to_string());
        }
    }

    if delta_days > config.confirmed_date_window_days && delta_days <= config.suspected_date_window_days {
        reasons.push(date_delay_reason(delta_days));
    }

    if transfer_description_match(&t.payee) && transfer_description_match(&other.payee) {
        reasons.push("description-based".to_string());
    }

    if reasons.is_empty() || delta_days > config.suspected_date_window_days {
        None
    } else {
        Some(DetectedPair {
            a: t.id,
            b: other.id,
            kind: PairKind::Suspected,
            reasons,
        })
    }
}

fn date_delay_reason(delta_days: i64) -> String {
    format!("date-delay-{delta_days}d")
}

fn transfer_description_match(payee: &str) -> bool {
    static TRANSFER_PATTERN: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    let re = TRANSFER_PATTERN
        .get_or_init(|| Regex::new(r"(?i)transfer|xfer|internal\s*move").expect("static pattern"));
    re.is_match(payee)
}

/// Applies a detection report to the transaction set: confirmed pairs get
/// `is_transfer=true`, cross-linked `paired_id`, and the transfer category;
/// suspected pairs get only `paired_id`/`suspect_reason` (§4.4
/// "Application"). The pairing invariant `A.paired_id = B <-> B.paired_id =
/// A` is maintained as a two-step write per pair.
pub fn apply_detection(
    transactions: &mut [Transaction],
    report: &DetectionReport,
    transfer_category_id: CategoryId,
) {
    let mut index: BTreeMap<TransactionId, usize> = BTreeMap::new();
    for (i, t) in transactions.iter().enumerate() {
        index.insert(t.id, i);
    }

    for pair in &report.pairs {
        let (Some(&ia), Some(&ib)) = (index.get(&pair.a), index.get(&pair.b)) else {
            continue;
        };

        match pair.kind {
            PairKind::Confirmed => {
                transactions[ia].is_transfer = true;
                transactions[ia].paired_id = Some(pair.b);
                transactions[ia].category_id = Some(transfer_category_id);
                transactions[ia].suspect_reason = None;

                transactions[ib].is_transfer = true;
                transactions[ib].paired_id = Some(pair.a);
                transactions[ib].category_id = Some(transfer_category_id);
                transactions[ib].suspect_reason = None;
            }
            PairKind::Suspected => {
                let reason = pair.suspect_reason_string();
                transactions[ia].paired_id = Some(pair.b);
                transactions[ia].suspect_reason = reason.clone();

                transactions[ib].paired_id = Some(pair.a);
                transactions[ib].suspect_reason = reason;
            }
        }
    }
}

fn aggregate_reasons(pairs: &[DetectedPair], config: &DetectorConfig) -> Vec<PatternNotification> {
    let mut counts: BTreeMap<String, usize> = BTreeMap::new();
    for pair in pairs {
        if pair.kind == PairKind::Suspected {
            for reason in &pair.reasons {
                *counts.entry(reason.clone()).or_insert(0) += 1;
            }
        }
    }
    counts
        .into_iter()
        .filter(|(_, count)| *count >= config.pattern_notification_threshold)
        .map(|(reason, count)| PatternNotification { reason, count })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::AccountType;
    use chrono::NaiveDate;

    fn account(id: AccountId, fx: bool) -> Account {
        Account {
            id,
            display_name: format!("Account {id}"),
            account_type: AccountType::Asset,
            currency: "USD".into(),
            opening_date: NaiveDate::from_ymd_opt(2020, 1, 1).unwrap(),
            opening_balance: None,
            fx_enabled: fx,
        }
    }

    fn txn(id: TransactionId, account_id: AccountId, amount: &str, date: (i32, u32, u32)) -> Transaction {
        Transaction {
            id,
            date: NaiveDate::from_ymd_opt(date.0, date.1, date.2).unwrap(),
            amount: amount.parse().unwrap(),
            currency: "USD".into(),
            account_id,
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
    fn confirmed_pair_detected_and_idempotent_on_rerun() {
        // S4
        let accounts = vec![account(1, false), account(2, false)];
        let mut transactions = vec![
            txn(1001, 1, "-500.00", (2024, 1, 15)),
            txn(1002, 2, "500.00", (2024, 1, 16)),
        ];

        let report = detect_transfers(&transactions, &accounts);
        assert_eq!(report.pairs.len(), 1);
        assert_eq!(report.pairs[0].kind, PairKind::Confirmed);

        apply_detection(&mut transactions, &report, 99);
        assert!(transactions[0].is_transfer);
        assert_eq!(transactions[0].paired_id, Some(1002));
        assert_eq!(transactions[1].paired_id, Some(1001));
        assert_eq!(transactions[0].category_id, Some(99));

        let rerun = detect_transfers(&transactions, &accounts);
        assert!(rerun.pairs.is_empty());
    }

    #[test]
    fn suspected_fx_pair_flags_reasons_without_confirming() {
        // S5
        let accounts = vec![account(10, true), account(20, false)];
        let transactions = vec![
            txn(2001, 10, "-100.00", (2024, 1, 20)),
            txn(2002, 20, "-97.50", (2024, 1, 23)),
        ];

        let report = detect_transfers(&transactions, &accounts);
        assert_eq!(report.pairs.len(), 1);
        let pair = &report.pairs[0];
        assert_eq!(pair.kind, PairKind::Suspected);
        assert!(pair.reasons.iter().any(|r| r == "same-direction"));
        assert!(pair.reasons.iter().any(|r| r == "amount-mismatch-fx"));
        assert!(pair.reasons.iter().any(|r| r == "date-delay-3d"));
    }

    #[test]
    fn date_delay_reason_reflects_actual_delta_beyond_the_default_window() {
        let accounts = vec![account(1, false), account(2, false)];
        let transactions = vec![
            txn(1, 1, "-50.00", (2024, 1, 1)),
            txn(2, 2, "50.00", (2024, 1, 6)),
        ];
        let mut config = DetectorConfig::default();
        config.suspected_date_window_days = 5;

        let report = detect_transfers_with_config(&transactions, &accounts, config);
        assert_eq!(report.pairs.len(), 1);
        let pair = &report.pairs[0];
        assert_eq!(pair.kind, PairKind::Suspected);
        assert!(pair.reasons.iter().any(|r| r == "date-delay-5d"));
    }

    #[test]
    fn different_accounts_required() {
        let accounts = vec![account(1, false)];
        let transactions = vec![
            txn(1, 1, "-50.00", (2024, 1, 1)),
            txn(2, 1, "50.00", (2024, 1, 1)),
        ];
        let report = detect_transfers(&transactions, &accounts);
        assert!(report.pairs.is_empty());
    }

    #[test]
    fn confirmed_pairs_have_opposite_signs_and_distinct_accounts() {
        // Testable property #6
        let accounts = vec![account(1, false), account(2, false)];
        let transactions = vec![
            txn(1, 1, "-20.00", (2024, 3, 1)),
            txn(2, 2, "20.00", (2024, 3, 2)),
        ];
        let report = detect_transfers(&transactions, &accounts);
        let confirmed = &report.pairs[0];
        assert_eq!(confirmed.kind, PairKind::Confirmed);
    }
}
