//! Append-only changelog: the grammar of spec §6, a trait seam, and a
//! file-backed default implementation used to recover the pull/clone
//! watermark (§4.5).
//!
//! Grounded on the teacher's `sync_kv` key-value table, which played the
//! same role (remote-cursor/HLC bookkeeping) for a SQLite-backed client;
//! here the watermark lives in the changelog itself rather than a
//! database row, since the spec makes the changelog its authoritative home.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, FixedOffset, NaiveDateTime, TimeZone};
use regex::Regex;

use crate::error::LocalStoreError;
use crate::model::TransactionId;

const TIMESTAMP_FMT: &str = "%Y-%m-%d %H:%M:%S";

/// One parsed changelog line, per the §6 grammar. `Diff` entries are
/// produced for stdout only and are never written to a sink, but are
/// modelled here too so a single parser/renderer pair covers the grammar.
#[derive(Debug, Clone, PartialEq)]
pub enum Entry {
    Clone {
        ts: DateTime<FixedOffset>,
        from: String,
        to: String,
    },
    Pull {
        ts: DateTime<FixedOffset>,
        since: String,
        from: String,
        to: String,
    },
    Push {
        ts: DateTime<FixedOffset>,
        from: String,
        to: String,
    },
    Update {
        ts: DateTime<FixedOffset>,
        txn_id: TransactionId,
        field: String,
        old: String,
        new: Option<String>,
    },
    Apply {
        ts: DateTime<FixedOffset>,
        txn_id: TransactionId,
        rule_id: i64,
        field: String,
        old: String,
        new: Option<String>,
    },
    Diff {
        ts: DateTime<FixedOffset>,
        txn_id: TransactionId,
        field: String,
        local: String,
        remote: String,
    },
}

impl Entry {
    pub fn timestamp(&self) -> DateTime<FixedOffset> {
        match self {
            Entry::Clone { ts, .. }
            | Entry::Pull { ts, .. }
            | Entry::Push { ts, .. }
            | Entry::Update { ts, .. }
            | Entry::Apply { ts, .. }
            | Entry::Diff { ts, .. } => *ts,
        }
    }

    /// True for the header entries that establish a new watermark (§4.5:
    /// "the latest CLONE or PULL entry timestamp").
    pub fn is_watermark_header(&self) -> bool {
        matches!(self, Entry::Clone { .. } | Entry::Pull { .. })
    }

    /// Renders this entry in the exact grammar from §6. `<old>`/`<new>` are
    /// literal where scalar; `new = None` omits the arrow (used when
    /// creating a field from nothing, per §6's note).
    pub fn render(&self) -> String {
        let ts = self.timestamp().format(TIMESTAMP_FMT);
        match self {
            Entry::Clone { from, to, .. } => format!("[{ts}] CLONE [{from}] [{to}]"),
            Entry::Pull { since, from, to, .. } => {
                format!("[{ts}] PULL  [{since}] [{from}] [{to}]")
            }
            Entry::Push { from, to, .. } => format!("[{ts}] PUSH  [{from}] [{to}]"),
            Entry::Update {
                txn_id, field, old, new, ..
            } => match new {
                Some(new) => format!("[{ts}] UPDATE {txn_id} {field} {old} \u{2192} {new}"),
                None => format!("[{ts}] UPDATE {txn_id} {field} {old}"),
            },
            Entry::Apply {
                txn_id,
                rule_id,
                field,
                old,
                new,
                ..
            } => match new {
                Some(new) => format!(
                    "[{ts}] APPLY  {txn_id} RULE {rule_id} {field} {old} \u{2192} {new}"
                ),
                None => format!("[{ts}] APPLY  {txn_id} RULE {rule_id} {field} {old}"),
            },
            Entry::Diff {
                txn_id,
                field,
                local,
                remote,
                ..
            } => format!("[{ts}] DIFF   {txn_id} {field} {local} <> {remote}"),
        }
    }

    fn parse(line: &str) -> Option<Entry> {
        let re = line_pattern();
        let caps = re.captures(line)?;
        let ts = parse_timestamp(&caps["ts"])?;
        let kind = &caps["kind"];
        let rest = caps["rest"].trim();

        match kind {
            "CLONE" => {
                let (from, to) = parse_two_brackets(rest)?;
                Some(Entry::Clone { ts, from, to })
            }
            "PULL" => {
                let brackets = extract_brackets(rest);
                if brackets.len() != 3 {
                    return None;
                }
                Some(Entry::Pull {
                    ts,
                    since: brackets[0].clone(),
                    from: brackets[1].clone(),
                    to: brackets[2].clone(),
                })
            }
            "PUSH" => {
                let (from, to) = parse_two_brackets(rest)?;
                Some(Entry::Push { ts, from, to })
            }
            "UPDATE" => {
                let mut parts = rest.splitn(3, ' ');
                let txn_id: TransactionId = parts.next()?.parse().ok()?;
                let field = parts.next()?.to_string();
                let remainder = parts.next().unwrap_or("");
                let (old, new) = split_arrow(remainder);
                Some(Entry::Update {
                    ts,
                    txn_id,
                    field,
                    old,
                    new,
                })
            }
            "APPLY" => {
                let mut parts = rest.splitn(4, ' ');
                let txn_id: TransactionId = parts.next()?.parse().ok()?;
                let rule_marker = parts.next()?;
                if rule_marker != "RULE" {
                    return None;
                }
                let rest2 = parts.next()?;
                let mut rest2_parts = rest2.splitn(2, ' ');
                let rule_id: i64 = rest2_parts.next()?.parse().ok()?;
                let remaining_field = rest2_parts.next().unwrap_or("");
                let mut field_parts = remaining_field.splitn(2, ' ');
                let field = field_parts.next()?.to_string();
                let remainder = field_parts.next().unwrap_or("");
                let (old, new) = split_arrow(remainder);
                Some(Entry::Apply {
                    ts,
                    txn_id,
                    rule_id,
                    field,
                    old,
                    new,
                })
            }
            "DIFF" => {
                let mut parts = rest.splitn(3, ' ');
                let txn_id: TransactionId = parts.next()?.parse().ok()?;
                let field = parts.next()?.to_string();
                let remainder = parts.next().unwrap_or("");
                let (local, remote) = remainder.split_once(" <> ")?;
                Some(Entry::Diff {
                    ts,
                    txn_id,
                    field,
                    local: local.to_string(),
                    remote: remote.to_string(),
                })
            }
            _ => None,
        }
    }
}

fn split_arrow(s: &str) -> (String, Option<String>) {
    match s.split_once(" \u{2192} ") {
        Some((old, new)) => (old.to_string(), Some(new.to_string())),
        None => (s.to_string(), None),
    }
}

fn parse_two_brackets(rest: &str) -> Option<(String, String)> {
    let brackets = extract_brackets(rest);
    if brackets.len() != 2 {
        return None;
    }
    Some((brackets[0].clone(), brackets[1].clone()))
}

fn extract_brackets(s: &str) -> Vec<String> {
    static RE: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"\[([^\]]*)\]").expect("static pattern"));
    re.captures_iter(s)
        .map(|c| c[1].to_string())
        .collect()
}

fn line_pattern() -> &'static Regex {
    static RE: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^\[(?P<ts>[^\]]+)\]\s+(?P<kind>CLONE|PULL|PUSH|UPDATE|APPLY|DIFF)\s+(?P<rest>.*)$")
            .expect("static pattern")
    })
}

fn parse_timestamp(raw: &str) -> Option<DateTime<FixedOffset>> {
    let naive = NaiveDateTime::parse_from_str(raw, TIMESTAMP_FMT).ok()?;
    let offset = *local_offset();
    offset.from_local_datetime(&naive).single()
}

fn local_offset() -> &'static FixedOffset {
    static OFFSET: std::sync::OnceLock<FixedOffset> = std::sync::OnceLock::new();
    OFFSET.get_or_init(|| {
        chrono::Local::now()
            .offset()
            .fix()
    })
}

/// Append-only changelog sink, kept behind a trait so the orchestrator
/// doesn't hard-depend on the filesystem (spec §1: "the append-only
/// changelog writer... we specify the entry grammar it must accept").
pub trait ChangelogSink {
    fn append(&self, entry: &Entry) -> Result<(), LocalStoreError>;
    fn read_all(&self) -> Result<Vec<Entry>, LocalStoreError>;

    /// The watermark: the timestamp of the most recent CLONE or PULL entry
    /// (§4.5, GLOSSARY).
    fn watermark(&self) -> Result<Option<DateTime<FixedOffset>>, LocalStoreError> {
        Ok(self
            .read_all()?
            .into_iter()
            .filter(Entry::is_watermark_header)
            .map(|e| e.timestamp())
            .max())
    }
}

/// File-backed changelog: one rendered line per entry, UTF-8, append-only.
pub struct FileChangelogSink {
    path: PathBuf,
}

impl FileChangelogSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        FileChangelogSink { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ChangelogSink for FileChangelogSink {
    fn append(&self, entry: &Entry) -> Result<(), LocalStoreError> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{}", entry.render())?;
        Ok(())
    }

    fn read_all(&self) -> Result<Vec<Entry>, LocalStoreError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let contents = std::fs::read_to_string(&self.path)?;
        Ok(contents.lines().filter_map(Entry::parse).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts() -> DateTime<FixedOffset> {
        FixedOffset::east_opt(0)
            .unwrap()
            .with_ymd_and_hms(2024, 1, 15, 10, 30, 0)
            .unwrap()
    }

    #[test]
    fn update_entry_round_trips_through_render_and_parse() {
        let entry = Entry::Update {
            ts: ts(),
            txn_id: 42,
            field: "category_id".to_string(),
            old: "null".to_string(),
            new: Some("Expenses:Food:Coffee".to_string()),
        };
        let rendered = entry.render();
        assert!(rendered.contains("UPDATE 42 category_id null \u{2192} Expenses:Food:Coffee"));
        let reparsed = Entry::parse(&rendered).unwrap();
        assert_eq!(reparsed, entry);
    }

    #[test]
    fn apply_entry_round_trips() {
        let entry = Entry::Apply {
            ts: ts(),
            txn_id: 7,
            rule_id: 1,
            field: "category_id".to_string(),
            old: "null".to_string(),
            new: Some("Expenses:Food:Coffee".to_string()),
        };
        let rendered = entry.render();
        let reparsed = Entry::parse(&rendered).unwrap();
        assert_eq!(reparsed, entry);
    }

    #[test]
    fn watermark_is_the_latest_clone_or_pull() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FileChangelogSink::new(dir.path().join("main.ledger.log"));
        sink.append(&Entry::Clone {
            ts: ts(),
            from: "2024-01-01".to_string(),
            to: "2024-01-31".to_string(),
        })
        .unwrap();
        let later = ts() + chrono::Duration::days(1);
        sink.append(&Entry::Pull {
            ts: later,
            since: ts().format(TIMESTAMP_FMT).to_string(),
            from: String::new(),
            to: String::new(),
        })
        .unwrap();
        assert_eq!(sink.watermark().unwrap(), Some(later));
    }

    #[test]
    fn diff_entries_never_affect_the_watermark() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FileChangelogSink::new(dir.path().join("main.ledger.log"));
        sink.append(&Entry::Diff {
            ts: ts() + chrono::Duration::days(10),
            txn_id: 1,
            field: "amount".to_string(),
            local: "-10.00".to_string(),
            remote: "-10.50".to_string(),
        })
        .unwrap();
        assert_eq!(sink.watermark().unwrap(), None);
    }
}
