//! Reconciliation orchestrator (spec §4.5, §5): drives the `clone`, `pull`,
//! `push` and `diff` workflows, sequencing fetch → compare → resolve →
//! mutate → log, honouring dry-run, interrupt and single-writer guarantees.
//!
//! Grounded on the teacher's `SyncClient::sync_cycle`, which wired a push
//! closure, then a pull closure, then a cursor advance, in that fixed
//! order; generalized here to the richer fetch/compare/resolve/mutate/log
//! pipeline. The resource-guard acquire/release pattern is grounded on the
//! facade style of `other_examples/.../reconciliation.rs`, which wraps
//! each operation with setup/teardown bookkeeping.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::NaiveDate;
use serde_json::Value;

use crate::changelog::{ChangelogSink, Entry};
use crate::comparator::{compare, Classification, ComparisonResult, TransactionDiff};
use crate::error::ReconcileError;
use crate::model::{render_json, CategoryId, Field, Transaction, TransactionId};
use crate::remote::{ListQuery, RemoteClient};
use crate::resolver::{Diagnostic, Direction};
use crate::rules::RuleSet;
use crate::store::{Archive, LocalStore, StoreLock};
use crate::transfer::{self, DetectionReport, DetectorConfig};

/// Restricts a workflow to an explicit transaction id and/or a date
/// window (§6 "Common options").
#[derive(Debug, Clone, Default)]
pub struct Scope {
    pub id: Option<TransactionId>,
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
}

impl Scope {
    fn matches(&self, txn: &Transaction) -> bool {
        if let Some(id) = self.id {
            return txn.id == id;
        }
        if let Some(from) = self.from {
            if txn.date < from {
                return false;
            }
        }
        if let Some(to) = self.to {
            if txn.date > to {
                return false;
            }
        }
        true
    }

    fn to_list_query(&self, updated_since: Option<chrono::DateTime<chrono::FixedOffset>>) -> ListQuery {
        ListQuery {
            updated_since,
            from: self.from,
            to: self.to,
            id: self.id,
        }
    }
}

/// A single accepted field mutation, ready to become one `UPDATE` log line.
#[derive(Debug, Clone)]
struct AcceptedMutation {
    txn_id: TransactionId,
    field: Field,
    old: Value,
    new: Value,
    applied_to: MutationSide,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MutationSide {
    Local,
    Remote,
}

/// Outcome of a write-emitting workflow: the mutations it performed (or,
/// under dry-run, would have performed) plus the comparison summary.
#[derive(Debug, Clone)]
pub struct WorkflowReport {
    pub summary: crate::comparator::DiffSummary,
    pub mutations: Vec<String>,
    pub conflicts: Vec<TransactionId>,
}

pub struct Orchestrator<'a, R, L, C> {
    remote: &'a R,
    store: &'a L,
    changelog: &'a C,
    dry_run: bool,
    interrupted: Arc<AtomicBool>,
}

impl<'a, R: RemoteClient, L: LocalStore, C: ChangelogSink> Orchestrator<'a, R, L, C> {
    pub fn new(remote: &'a R, store: &'a L, changelog: &'a C, dry_run: bool) -> Self {
        Orchestrator {
            remote,
            store,
            changelog,
            dry_run,
            interrupted: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Returns a clone of the cancellation flag so the binary can wire it
    /// to a signal handler (§5 "Cancellation").
    pub fn interrupt_flag(&self) -> Arc<AtomicBool> {
        self.interrupted.clone()
    }

    fn check_interrupt(&self) -> Result<(), ReconcileError> {
        if self.interrupted.load(Ordering::SeqCst) {
            Err(ReconcileError::Interrupted)
        } else {
            Ok(())
        }
    }

    /// Clone: materializes the entire local archive from the remote over
    /// `scope`'s date window (§4.5 "Clone").
    pub fn clone_archive(&self, scope: &Scope, archive_path: &std::path::Path) -> Result<WorkflowReport, ReconcileError> {
        let _lock = StoreLock::acquire(archive_path)?;
        self.check_interrupt()?;

        let query = scope.to_list_query(None);
        let mut transactions = self.remote.list_transactions(&query)?;
        self.check_interrupt()?;
        let mut accounts = self.remote.list_accounts()?;
        let categories = self.remote.list_categories()?;
        self.check_interrupt()?;

        transactions.sort_by_key(|t| t.id);

        for account in accounts.iter_mut() {
            let earliest = transactions
                .iter()
                .filter(|t| t.account_id == account.id)
                .map(|t| t.date)
                .min();
            account.reconcile_opening_date(earliest);
        }

        let archive = Archive {
            accounts,
            categories,
            transactions,
            balances: Vec::new(),
        };

        if !self.dry_run {
            self.store.save(&archive)?;
            self.changelog.append(&Entry::Clone {
                ts: now(),
                from: scope.from.map(|d| d.to_string()).unwrap_or_default(),
                to: scope.to.map(|d| d.to_string()).unwrap_or_default(),
            })?;
        }

        Ok(WorkflowReport {
            summary: crate::comparator::DiffSummary {
                only_remote: archive.transactions.len(),
                ..Default::default()
            },
            mutations: Vec::new(),
            conflicts: Vec::new(),
        })
    }

    /// Pull: fetches remote transactions since the watermark, resolves
    /// pull-direction mutations, applies local writes and remote
    /// write-backs, logs a `PULL` header plus per-field `UPDATE`s
    /// (§4.5 "Pull").
    pub fn pull(&self, scope: &Scope, archive_path: &std::path::Path) -> Result<WorkflowReport, ReconcileError>
    where
        R: Sync,
    {
        let _lock = StoreLock::acquire(archive_path)?;
        self.check_interrupt()?;

        let watermark = self.changelog.watermark()?;
        let query = scope.to_list_query(watermark);
        let remotes = self.remote.list_transactions(&query)?;
        self.check_interrupt()?;

        let mut archive = self.store.load()?;
        let locals: Vec<Transaction> = archive
            .transactions
            .iter()
            .filter(|t| scope.matches(t))
            .cloned()
            .collect();

        let comparison = compare(Direction::Pull, &locals, &remotes);
        self.check_interrupt()?;

        let mut remotes_by_id: BTreeMap<TransactionId, Transaction> =
            remotes.into_iter().map(|t| (t.id, t)).collect();

        let (mutations, conflicts, created) =
            apply_comparison(&comparison, &mut archive.transactions, &mut remotes_by_id, MutationDirection::Pull);

        if !self.dry_run {
            if !self.remote_side_mutations(&mutations, &remotes_by_id).is_empty() {
                self.dispatch_remote_mutations(&mutations, &remotes_by_id)?;
            }
            self.store.save(&archive)?;
            self.check_interrupt()?;
            for line in render_update_entries(&mutations) {
                self.changelog.append(&line)?;
            }
            self.changelog.append(&Entry::Pull {
                ts: now(),
                since: watermark.map(|w| w.format("%Y-%m-%d %H:%M:%S").to_string()).unwrap_or_default(),
                from: scope.from.map(|d| d.to_string()).unwrap_or_default(),
                to: scope.to.map(|d| d.to_string()).unwrap_or_default(),
            })?;
        }

        let _ = created;
        Ok(WorkflowReport {
            summary: comparison.summary,
            mutations: mutations.iter().map(render_mutation_line).collect(),
            conflicts,
        })
    }

    /// Push: resolves push-direction mutations (category is local-wins
    /// here) and applies them to the remote only, logging a `PUSH` header
    /// plus per-field `UPDATE`s (§4.5 "Push").
    pub fn push(&self, scope: &Scope, archive_path: &std::path::Path) -> Result<WorkflowReport, ReconcileError>
    where
        R: Sync,
    {
        let _lock = StoreLock::acquire(archive_path)?;
        self.check_interrupt()?;

        let archive = self.store.load()?;
        let locals: Vec<Transaction> = archive
            .transactions
            .iter()
            .filter(|t| scope.matches(t))
            .cloned()
            .collect();

        let query = scope.to_list_query(None);
        let remotes = self.remote.list_transactions(&query)?;
        self.check_interrupt()?;

        let comparison = compare(Direction::Push, &locals, &remotes);

        let mut remotes_by_id: BTreeMap<TransactionId, Transaction> =
            remotes.into_iter().map(|t| (t.id, t)).collect();
        let mut dummy_locals: Vec<Transaction> = locals.clone();

        let (mutations, conflicts, _) =
            apply_comparison(&comparison, &mut dummy_locals, &mut remotes_by_id, MutationDirection::Push);

        if !self.dry_run {
            self.dispatch_remote_mutations(&mutations, &remotes_by_id)?;
            self.check_interrupt()?;
            for line in render_update_entries(&mutations) {
                self.changelog.append(&line)?;
            }
            self.changelog.append(&Entry::Push {
                ts: now(),
                from: scope.from.map(|d| d.to_string()).unwrap_or_default(),
                to: scope.to.map(|d| d.to_string()).unwrap_or_default(),
            })?;
        }

        Ok(WorkflowReport {
            summary: comparison.summary,
            mutations: mutations.iter().map(render_mutation_line).collect(),
            conflicts,
        })
    }

    /// Diff: the same comparison pipeline, but read-only — no store,
    /// remote or changelog writes ever happen (§4.5 "Diff").
    pub fn diff(&self, scope: &Scope) -> Result<ComparisonResult, ReconcileError> {
        let archive = self.store.load()?;
        let locals: Vec<Transaction> = archive
            .transactions
            .iter()
            .filter(|t| scope.matches(t))
            .cloned()
            .collect();
        let query = scope.to_list_query(None);
        let remotes = self.remote.list_transactions(&query)?;
        Ok(compare(Direction::Pull, &locals, &remotes))
    }

    /// Applies a loaded rule set to every local transaction in `scope`
    /// (§4.3 "Apply command semantics"): local-only, never touches the
    /// remote. Logs one `APPLY` entry per accepted transform.
    pub fn apply_rules(&self, rules: &RuleSet, scope: &Scope) -> Result<Vec<crate::rules::AppliedTransform>, ReconcileError> {
        let mut archive = self.store.load()?;
        self.check_interrupt()?;

        let accounts = archive.accounts.clone();
        let categories = archive.categories.clone();
        let mut in_scope: Vec<usize> = archive
            .transactions
            .iter()
            .enumerate()
            .filter(|(_, t)| scope.matches(t))
            .map(|(i, _)| i)
            .collect();
        in_scope.sort_by_key(|&i| archive.transactions[i].id);

        let mut all_applied = Vec::new();
        let accounts_by_id: BTreeMap<crate::model::AccountId, &crate::model::Account> =
            accounts.iter().map(|a| (a.id, a)).collect();
        for i in in_scope {
            let account_id = archive.transactions[i].account_id;
            let Some(&account) = accounts_by_id.get(&account_id) else {
                continue;
            };
            let (_, applied) = crate::rules::evaluate(rules, &mut archive.transactions[i], account, &categories)?;
            all_applied.extend(applied);
        }

        if !self.dry_run && !all_applied.is_empty() {
            self.store.save(&archive)?;
            self.check_interrupt()?;
            for a in &all_applied {
                self.changelog.append(&Entry::Apply {
                    ts: now(),
                    txn_id: a.txn_id,
                    rule_id: a.rule_id,
                    field: a.field.to_string(),
                    old: a.old_value.clone(),
                    new: Some(a.new_value.clone()),
                })?;
            }
        }

        Ok(all_applied)
    }

    /// Runs the transfer detector over the local archive and applies
    /// confirmed/suspected pairs (§4.4 "Application"). Local-only, same as
    /// rule application: the remote is never mutated directly, but
    /// `paired_id`/`suspect_reason`/`is_transfer`/`category_id` all flow to
    /// the remote on the next `push` via their normal field strategies.
    pub fn detect_transfers(
        &self,
        config: DetectorConfig,
        transfer_category_id: CategoryId,
    ) -> Result<DetectionReport, ReconcileError> {
        let mut archive = self.store.load()?;
        self.check_interrupt()?;

        let report = transfer::detect_transfers_with_config(&archive.transactions, &archive.accounts, config);

        if !self.dry_run && !report.pairs.is_empty() {
            transfer::apply_detection(&mut archive.transactions, &report, transfer_category_id);
            self.store.save(&archive)?;
        }

        Ok(report)
    }

    /// Dispatches remote PATCHes for `mutations`, bounded by a concurrency
    /// ceiling (default 4, §5 "Scheduling model"), using plain
    /// `std::thread` scoped workers rather than an async runtime.
    fn dispatch_remote_mutations(
        &self,
        mutations: &[AcceptedMutation],
        remotes_by_id: &BTreeMap<TransactionId, Transaction>,
    ) -> Result<(), ReconcileError>
    where
        R: Sync,
    {
        const CONCURRENCY: usize = 4;
        let by_txn = self.remote_side_mutations(mutations, remotes_by_id);
        if by_txn.is_empty() {
            return Ok(());
        }

        let jobs: Vec<(TransactionId, BTreeMap<Field, Value>)> = by_txn.into_iter().collect();
        let remote = self.remote;
        let errors: std::sync::Mutex<Vec<crate::error::RemoteError>> = std::sync::Mutex::new(Vec::new());

        for chunk in jobs.chunks(CONCURRENCY.max(1)) {
            std::thread::scope(|scope| {
                for (txn_id, fields) in chunk {
                    let errors = &errors;
                    scope.spawn(move || {
                        if let Err(e) = remote.patch_transaction(*txn_id, fields) {
                            errors.lock().expect("errors mutex poisoned").push(e);
                        }
                    });
                }
            });
        }

        let mut errs = errors.into_inner().expect("errors mutex poisoned");
        match errs.pop() {
            Some(e) => Err(ReconcileError::Remote(e)),
            None => Ok(()),
        }
    }

    /// Groups the remote-bound mutations by transaction id. Whenever any of
    /// `narration`/`paired_id`/`suspect_reason` changes for a transaction,
    /// all three are included with their final post-mutation values (from
    /// `remotes_by_id`) rather than just the one that changed: the wire
    /// encodes them together in a single `note` field (§6 "Transfer
    /// metadata encoding on the remote"), so a partial PATCH would need to
    /// know the other two anyway to avoid clobbering them.
    fn remote_side_mutations(
        &self,
        mutations: &[AcceptedMutation],
        remotes_by_id: &BTreeMap<TransactionId, Transaction>,
    ) -> BTreeMap<TransactionId, BTreeMap<Field, Value>> {
        let mut by_txn: BTreeMap<TransactionId, BTreeMap<Field, Value>> = BTreeMap::new();
        for m in mutations {
            if m.applied_to == MutationSide::Remote {
                by_txn.entry(m.txn_id).or_default().insert(m.field, m.new.clone());
            }
        }

        for (txn_id, fields) in by_txn.iter_mut() {
            let touches_note = fields.contains_key(&Field::Narration)
                || fields.contains_key(&Field::PairedId)
                || fields.contains_key(&Field::SuspectReason);
            if !touches_note {
                continue;
            }
            let Some(txn) = remotes_by_id.get(txn_id) else {
                continue;
            };
            fields.insert(Field::Narration, Value::String(txn.narration.clone()));
            fields.insert(
                Field::PairedId,
                txn.paired_id.map(Value::from).unwrap_or(Value::Null),
            );
            fields.insert(
                Field::SuspectReason,
                txn.suspect_reason.clone().map(Value::String).unwrap_or(Value::Null),
            );
        }

        by_txn
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MutationDirection {
    Pull,
    Push,
}

/// Applies every per-field resolution in `comparison`, in ascending id
/// order and declaration field order (§4.5 "Ordering"), mutating `locals`
/// (for pull) and `remotes_by_id` (write-backs / push), and returning the
/// accepted mutations, the conflicting ids, and newly-created local ids.
fn apply_comparison(
    comparison: &ComparisonResult,
    locals: &mut Vec<Transaction>,
    remotes_by_id: &mut BTreeMap<TransactionId, Transaction>,
    direction: MutationDirection,
) -> (Vec<AcceptedMutation>, Vec<TransactionId>, Vec<TransactionId>) {
    let mut mutations = Vec::new();
    let mut conflicts = Vec::new();
    let mut created = Vec::new();

    let mut locals_by_id: BTreeMap<TransactionId, usize> =
        locals.iter().enumerate().map(|(i, t)| (t.id, i)).collect();

    let mut diffs: Vec<&TransactionDiff> = comparison.diffs.iter().collect();
    diffs.sort_by_key(|d| d.id);

    for diff in diffs {
        match diff.classification {
            Classification::OnlyRemote if direction == MutationDirection::Pull => {
                if let Some(remote) = remotes_by_id.get(&diff.id) {
                    created.push(diff.id);
                    locals_by_id.insert(diff.id, locals.len());
                    locals.push(remote.clone());
                }
            }
            Classification::Differs => {
                let Some(&idx) = locals_by_id.get(&diff.id) else { continue };
                for field_diff in &diff.field_diffs {
                    match field_diff.diagnostic {
                        Diagnostic::ConflictWarning => conflicts.push(diff.id),
                        Diagnostic::None => {}
                        _ => {
                            if let Some(new_value) = &field_diff.local_mutation {
                                let old = crate::comparator::field_value(&locals[idx], field_diff.field);
                                if locals[idx].set_field(field_diff.field, new_value).is_ok() {
                                    mutations.push(AcceptedMutation {
                                        txn_id: diff.id,
                                        field: field_diff.field,
                                        old,
                                        new: new_value.clone(),
                                        applied_to: MutationSide::Local,
                                    });
                                }
                            }
                            if let Some(new_value) = &field_diff.remote_mutation {
                                if let Some(remote) = remotes_by_id.get_mut(&diff.id) {
                                    let old = crate::comparator::field_value(remote, field_diff.field);
                                    if remote.set_field(field_diff.field, new_value).is_ok() {
                                        mutations.push(AcceptedMutation {
                                            txn_id: diff.id,
                                            field: field_diff.field,
                                            old,
                                            new: new_value.clone(),
                                            applied_to: MutationSide::Remote,
                                        });
                                    }
                                }
                            }
                        }
                    }
                }
            }
            _ => {}
        }
    }

    conflicts.sort_unstable();
    conflicts.dedup();
    (mutations, conflicts, created)
}

fn render_update_entries(mutations: &[AcceptedMutation]) -> Vec<Entry> {
    mutations
        .iter()
        .map(|m| Entry::Update {
            ts: now(),
            txn_id: m.txn_id,
            field: m.field.as_str().to_string(),
            old: render_json(&m.old),
            new: Some(render_json(&m.new)),
        })
        .collect()
}

fn render_mutation_line(m: &AcceptedMutation) -> String {
    let side = match m.applied_to {
        MutationSide::Local => "local",
        MutationSide::Remote => "remote",
    };
    format!(
        "{} {} {} -> {} ({side})",
        m.txn_id,
        m.field,
        render_json(&m.old),
        render_json(&m.new)
    )
}

fn now() -> chrono::DateTime<chrono::FixedOffset> {
    chrono::Local::now().fixed_offset()
}

/// Renders a `ComparisonResult` for the four diff presentation modes
/// (§4.5 "Diff"). `Changelog` mode is stdout-only per the grammar note.
pub fn render_diff(result: &ComparisonResult, mode: DiffMode) -> Vec<String> {
    match mode {
        DiffMode::Summary => vec![format!(
            "identical={} differs={} only_local={} only_remote={}",
            result.summary.identical,
            result.summary.differs,
            result.summary.only_local,
            result.summary.only_remote
        )],
        DiffMode::Ids => result
            .diffs
            .iter()
            .filter(|d| d.classification == Classification::Differs)
            .map(|d| d.id.to_string())
            .collect(),
        DiffMode::Changelog => result
            .diffs
            .iter()
            .filter(|d| d.classification == Classification::Differs)
            .flat_map(|d| {
                d.field_diffs.iter().filter(|f| f.diagnostic != Diagnostic::None).map(move |f| {
                    Entry::Diff {
                        ts: now(),
                        txn_id: d.id,
                        field: f.field.as_str().to_string(),
                        local: f.local_mutation.as_ref().map(render_json).unwrap_or_else(|| "-".to_string()),
                        remote: f.remote_mutation.as_ref().map(render_json).unwrap_or_else(|| "-".to_string()),
                    }
                    .render()
                })
            })
            .collect(),
        DiffMode::TwoColumn => result
            .diffs
            .iter()
            .filter(|d| d.classification == Classification::Differs)
            .flat_map(|d| {
                d.field_diffs
                    .iter()
                    .filter(|f| f.diagnostic != Diagnostic::None)
                    .map(move |f| format!("{:<6} {:<16} | {}", d.id, f.field.as_str(), f.diagnostic_label()))
            })
            .collect(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffMode {
    Summary,
    Ids,
    Changelog,
    TwoColumn,
}

impl crate::resolver::FieldResolution {
    fn diagnostic_label(&self) -> &'static str {
        match self.diagnostic {
            Diagnostic::None => "none",
            Diagnostic::AppliedLocal => "applied-local",
            Diagnostic::AppliedRemote => "applied-remote",
            Diagnostic::Merged => "merged",
            Diagnostic::ConflictWarning => "conflict-warning",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Account, AccountType, Category, LabelSet};
    use chrono::NaiveDate;
    use rust_decimal::Decimal;
    use std::cell::RefCell;
    use std::collections::BTreeMap as Map;
    use std::sync::Mutex;

    fn txn(id: TransactionId, payee: &str, category: Option<i64>, updated_at: Option<&str>) -> Transaction {
        Transaction {
            id,
            date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            amount: Decimal::new(-1000, 2),
            currency: "USD".into(),
            account_id: 1,
            category_id: category,
            payee: payee.into(),
            narration: String::new(),
            labels: LabelSet::new(),
            needs_review: true,
            is_transfer: false,
            paired_id: None,
            suspect_reason: None,
            closing_balance: None,
            updated_at: updated_at.map(|s| chrono::DateTime::parse_from_rfc3339(s).unwrap()),
        }
    }

    struct StubRemote {
        transactions: Vec<Transaction>,
        accounts: Vec<Account>,
        categories: Vec<Category>,
        patched: Mutex<Map<TransactionId, Map<Field, Value>>>,
    }

    impl RemoteClient for StubRemote {
        fn list_transactions(&self, _query: &ListQuery) -> Result<Vec<Transaction>, crate::error::RemoteError> {
            Ok(self.transactions.clone())
        }
        fn list_accounts(&self) -> Result<Vec<Account>, crate::error::RemoteError> {
            Ok(self.accounts.clone())
        }
        fn list_categories(&self) -> Result<Vec<Category>, crate::error::RemoteError> {
            Ok(self.categories.clone())
        }
        fn patch_transaction(
            &self,
            id: TransactionId,
            fields: &Map<Field, Value>,
        ) -> Result<(), crate::error::RemoteError> {
            self.patched.lock().expect("patched mutex poisoned").insert(id, fields.clone());
            Ok(())
        }
    }

    struct StubStore {
        archive: RefCell<Archive>,
    }

    impl LocalStore for StubStore {
        fn load(&self) -> Result<Archive, crate::error::LocalStoreError> {
            Ok(self.archive.borrow().clone())
        }
        fn save(&self, archive: &Archive) -> Result<(), crate::error::LocalStoreError> {
            *self.archive.borrow_mut() = archive.clone();
            Ok(())
        }
    }

    struct StubChangelog {
        entries: RefCell<Vec<Entry>>,
    }

    impl ChangelogSink for StubChangelog {
        fn append(&self, entry: &Entry) -> Result<(), crate::error::LocalStoreError> {
            self.entries.borrow_mut().push(entry.clone());
            Ok(())
        }
        fn read_all(&self) -> Result<Vec<Entry>, crate::error::LocalStoreError> {
            Ok(self.entries.borrow().clone())
        }
    }

    #[test]
    fn pull_creates_only_remote_transaction_locally() {
        let remote = StubRemote {
            transactions: vec![txn(1, "Woolworths", None, None)],
            accounts: vec![],
            categories: vec![],
            patched: Mutex::new(Map::new()),
        };
        let store = StubStore {
            archive: RefCell::new(Archive::default()),
        };
        let changelog = StubChangelog {
            entries: RefCell::new(Vec::new()),
        };

        let dir = tempfile::tempdir().unwrap();
        let archive_path = dir.path().join("main.ledger");
        let orchestrator = Orchestrator::new(&remote, &store, &changelog, false);
        let report = orchestrator.pull(&Scope::default(), &archive_path).unwrap();

        assert_eq!(report.summary.only_remote, 1);
        assert_eq!(store.archive.borrow().transactions.len(), 1);
        assert!(changelog
            .entries
            .borrow()
            .iter()
            .any(|e| matches!(e, Entry::Pull { .. })));
    }

    #[test]
    fn dry_run_pull_leaves_store_and_changelog_untouched() {
        let remote = StubRemote {
            transactions: vec![txn(1, "Woolworths", None, None)],
            accounts: vec![],
            categories: vec![],
            patched: Mutex::new(Map::new()),
        };
        let store = StubStore {
            archive: RefCell::new(Archive::default()),
        };
        let changelog = StubChangelog {
            entries: RefCell::new(Vec::new()),
        };

        let dir = tempfile::tempdir().unwrap();
        let archive_path = dir.path().join("main.ledger");
        let orchestrator = Orchestrator::new(&remote, &store, &changelog, true);
        orchestrator.pull(&Scope::default(), &archive_path).unwrap();

        assert!(store.archive.borrow().transactions.is_empty());
        assert!(changelog.entries.borrow().is_empty());
    }

    #[test]
    fn push_promotes_local_category_over_remote() {
        let local_txn = txn(1, "Woolworths", Some(2), None);
        let remote_txn = txn(1, "Woolworths", Some(1), None);

        let remote = StubRemote {
            transactions: vec![remote_txn],
            accounts: vec![],
            categories: vec![],
            patched: Mutex::new(Map::new()),
        };
        let store = StubStore {
            archive: RefCell::new(Archive {
                transactions: vec![local_txn],
                ..Default::default()
            }),
        };
        let changelog = StubChangelog {
            entries: RefCell::new(Vec::new()),
        };

        let dir = tempfile::tempdir().unwrap();
        let archive_path = dir.path().join("main.ledger");
        let orchestrator = Orchestrator::new(&remote, &store, &changelog, false);
        orchestrator.push(&Scope::default(), &archive_path).unwrap();

        let patched = remote.patched.lock().expect("patched mutex poisoned");
        let fields = patched.get(&1).expect("transaction 1 should have been patched");
        assert_eq!(fields.get(&Field::CategoryId), Some(&Value::from(2)));
    }

    #[test]
    fn apply_rules_logs_an_apply_entry_and_is_idempotent() {
        let rules_dir = tempfile::tempdir().unwrap();
        std::fs::write(
            rules_dir.path().join("a.yaml"),
            "- id: 1\n  if:\n    merchant: \"^starbucks\"\n  then:\n    category: \"Expenses:Food:Coffee\"\n",
        )
        .unwrap();
        let rules = crate::rules::load_rules_dir(rules_dir.path()).unwrap();

        let remote = StubRemote {
            transactions: vec![],
            accounts: vec![],
            categories: vec![],
            patched: Mutex::new(Map::new()),
        };
        let store = StubStore {
            archive: RefCell::new(Archive {
                accounts: vec![Account {
                    id: 1,
                    display_name: "Checking".into(),
                    account_type: AccountType::Asset,
                    currency: "USD".into(),
                    opening_date: NaiveDate::from_ymd_opt(2020, 1, 1).unwrap(),
                    opening_balance: None,
                    fx_enabled: false,
                }],
                categories: vec![Category {
                    id: 7,
                    title: "Expenses:Food:Coffee".into(),
                    parent_id: None,
                    kind: crate::model::CategoryKind::Expense,
                }],
                transactions: vec![txn(42, "Starbucks #42", None, None)],
                balances: vec![],
            }),
        };
        let changelog = StubChangelog {
            entries: RefCell::new(Vec::new()),
        };

        let orchestrator = Orchestrator::new(&remote, &store, &changelog, false);
        let applied = orchestrator.apply_rules(&rules, &Scope::default()).unwrap();
        assert_eq!(applied.len(), 1);
        assert_eq!(store.archive.borrow().transactions[0].category_id, Some(7));
        assert!(changelog.entries.borrow().iter().any(|e| matches!(e, Entry::Apply { .. })));
        assert!(remote.patched.lock().unwrap().is_empty());

        let second = orchestrator.apply_rules(&rules, &Scope::default()).unwrap();
        assert!(second.is_empty());
    }
}
