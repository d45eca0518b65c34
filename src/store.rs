//! Local archive storage (spec §1, §6): a `LocalStore` trait plus a
//! line-oriented, JSON-per-line default implementation. This is explicitly
//! a simplified stand-in for the real archive lexer/printer, which spec §1
//! delegates out of scope — the trait is the part that matters here.
//!
//! Grounded on the teacher's `SyncEngine`, which owned a connection and
//! exposed read/write/mark-status operations over rows; generalized here
//! from SQLite rows to archive records read from and written to a file.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::LocalStoreError;
use crate::model::{Account, BalanceAssertion, Category, Transaction};

/// Everything the archive holds, as plain in-memory values (§3
/// "Ownership": consumers mutate copies, never the store's own state).
#[derive(Debug, Clone, Default)]
pub struct Archive {
    pub accounts: Vec<Account>,
    pub categories: Vec<Category>,
    pub transactions: Vec<Transaction>,
    pub balances: Vec<BalanceAssertion>,
}

/// Read/write access to the local archive. Kept as a trait so the
/// orchestrator never hard-depends on a concrete file format (§1).
pub trait LocalStore {
    fn load(&self) -> Result<Archive, LocalStoreError>;
    fn save(&self, archive: &Archive) -> Result<(), LocalStoreError>;
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum Record {
    Account(Account),
    Category(Category),
    Transaction(Transaction),
    Balance(BalanceAssertion),
}

/// Default `LocalStore`: one JSON-encoded `Record` per line, UTF-8,
/// records grouped accounts-then-categories-then-transactions-then-
/// balances and each group sorted by id for stable diffs across saves.
pub struct FileLocalStore {
    path: PathBuf,
}

impl FileLocalStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        FileLocalStore { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl LocalStore for FileLocalStore {
    fn load(&self) -> Result<Archive, LocalStoreError> {
        if !self.path.exists() {
            return Ok(Archive::default());
        }
        let contents = std::fs::read_to_string(&self.path)?;
        let mut archive = Archive::default();
        for (line_no, line) in contents.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let record: Record = serde_json::from_str(line).map_err(|e| {
                LocalStoreError::Parse(format!("{}:{}: {e}", self.path.display(), line_no + 1))
            })?;
            match record {
                Record::Account(a) => archive.accounts.push(a),
                Record::Category(c) => archive.categories.push(c),
                Record::Transaction(t) => archive.transactions.push(t),
                Record::Balance(b) => archive.balances.push(b),
            }
        }
        Ok(archive)
    }

    fn save(&self, archive: &Archive) -> Result<(), LocalStoreError> {
        let mut accounts = archive.accounts.clone();
        accounts.sort_by_key(|a| a.id);
        let mut categories = archive.categories.clone();
        categories.sort_by_key(|c| c.id);
        let mut transactions = archive.transactions.clone();
        transactions.sort_by_key(|t| t.id);
        let mut balances = archive.balances.clone();
        balances.sort_by_key(|b| (b.account_id, b.date));

        let mut out = String::new();
        for a in accounts {
            out.push_str(&serde_json::to_string(&Record::Account(a))?);
            out.push('\n');
        }
        for c in categories {
            out.push_str(&serde_json::to_string(&Record::Category(c))?);
            out.push('\n');
        }
        for t in transactions {
            out.push_str(&serde_json::to_string(&Record::Transaction(t))?);
            out.push('\n');
        }
        for b in balances {
            out.push_str(&serde_json::to_string(&Record::Balance(b))?);
            out.push('\n');
        }

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(&self.path, out)
            .map_err(|e| LocalStoreError::Unwritable(format!("{}: {e}", self.path.display())))?;
        Ok(())
    }
}

/// RAII single-writer guard for the duration of a workflow (§5 "Shared
/// resource policy"). Acquired at orchestrator entry, released on every
/// exit path including panics, by virtue of `Drop`.
pub struct StoreLock {
    lock_path: PathBuf,
}

impl StoreLock {
    /// Acquires the lock by creating `<archive>.lock` exclusively. Returns
    /// `LocalStoreError::Locked` if another process already holds it.
    pub fn acquire(archive_path: &Path) -> Result<StoreLock, LocalStoreError> {
        let mut lock_name = archive_path.as_os_str().to_os_string();
        lock_name.push(".lock");
        let lock_path = PathBuf::from(lock_name);

        std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&lock_path)
            .map_err(|_| LocalStoreError::Locked(lock_path.display().to_string()))?;

        Ok(StoreLock { lock_path })
    }
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.lock_path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AccountType, CategoryKind, Label, LabelSet};
    use chrono::NaiveDate;
    use rust_decimal::Decimal;

    fn sample_archive() -> Archive {
        Archive {
            accounts: vec![Account {
                id: 1,
                display_name: "Checking".into(),
                account_type: AccountType::Asset,
                currency: "USD".into(),
                opening_date: NaiveDate::from_ymd_opt(2023, 1, 1).unwrap(),
                opening_balance: None,
                fx_enabled: false,
            }],
            categories: vec![Category {
                id: 1,
                title: "Expenses:Food:Coffee".into(),
                parent_id: None,
                kind: CategoryKind::Expense,
            }],
            transactions: vec![Transaction {
                id: 100,
                date: NaiveDate::from_ymd_opt(2024, 1, 15).unwrap(),
                amount: Decimal::new(-500, 2),
                currency: "USD".into(),
                account_id: 1,
                category_id: Some(1),
                payee: "Starbucks".into(),
                narration: String::new(),
                labels: LabelSet::from_tokens([Label::new("coffee").unwrap().as_str()]).unwrap(),
                needs_review: false,
                is_transfer: false,
                paired_id: None,
                suspect_reason: None,
                closing_balance: None,
                updated_at: None,
            }],
            balances: vec![],
        }
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileLocalStore::new(dir.path().join("main.ledger"));
        let archive = sample_archive();
        store.save(&archive).unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(loaded.accounts.len(), 1);
        assert_eq!(loaded.transactions.len(), 1);
        assert_eq!(loaded.transactions[0].payee, "Starbucks");
    }

    #[test]
    fn missing_file_loads_as_empty_archive() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileLocalStore::new(dir.path().join("missing.ledger"));
        let loaded = store.load().unwrap();
        assert!(loaded.accounts.is_empty());
        assert!(loaded.transactions.is_empty());
    }

    #[test]
    fn store_lock_prevents_concurrent_acquisition() {
        let dir = tempfile::tempdir().unwrap();
        let archive_path = dir.path().join("main.ledger");
        let _guard = StoreLock::acquire(&archive_path).unwrap();
        assert!(StoreLock::acquire(&archive_path).is_err());
    }

    #[test]
    fn store_lock_releases_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let archive_path = dir.path().join("main.ledger");
        {
            let _guard = StoreLock::acquire(&archive_path).unwrap();
        }
        assert!(StoreLock::acquire(&archive_path).is_ok());
    }
}
