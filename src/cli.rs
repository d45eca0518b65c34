//! Command-line surface (spec §6). Argument parsing and date-window/rule-
//! flag resolution live here; `bin/ledgersync.rs` owns wiring parsed
//! arguments to the orchestrator and rendering results.
//!
//! Grounded on `Techwizop-codexAccountant`'s `ledger_cmd.rs` clap-derive
//! shape (`#[derive(Parser)]` top-level struct, `#[command(subcommand)]`
//! nested enums, `ValueEnum` output-format flags).

use std::path::PathBuf;

use chrono::{Datelike, NaiveDate};
use clap::{Parser, Subcommand, ValueEnum};

use crate::error::ConfigError;
use crate::model::TransactionId;

#[derive(Debug, Parser)]
#[command(name = "ledgersync", about = "Reconciles a local plain-text ledger archive against a remote ledger service", version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Materializes the entire local archive from the remote.
    Clone(CloneArgs),
    /// Fetches and applies remote changes since the last watermark.
    Pull(WorkflowArgs),
    /// Pushes locally-modified transactions to the remote.
    Push(WorkflowArgs),
    /// Compares local and remote transactions without writing anything.
    Diff(DiffArgs),
    /// Declarative classification rules.
    Rule {
        #[command(subcommand)]
        command: RuleCommand,
    },
    /// Detects transfer pairs between accounts.
    DetectTransfers(DetectTransfersArgs),
}

#[derive(Debug, Parser)]
pub struct CommonArgs {
    /// Archive destination (file or directory); auto-detected from the
    /// current directory if omitted.
    #[arg(long, value_name = "PATH")]
    pub destination: Option<PathBuf>,

    /// Print intended operations without writing to the store, remote, or
    /// changelog.
    #[arg(long)]
    pub dry_run: bool,

    /// Suppress non-essential output.
    #[arg(long, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Emit detailed per-step logging.
    #[arg(long)]
    pub verbose: bool,

    /// Override the remote base URL (defaults to `LEDGERSYNC_BASE_URL`).
    #[arg(long, value_name = "URL")]
    pub base_url: Option<String>,
}

#[derive(Debug, Parser)]
pub struct CloneArgs {
    #[command(flatten)]
    pub common: CommonArgs,
    #[command(flatten)]
    pub date_window: DateWindowArgs,
}

#[derive(Debug, Parser)]
pub struct WorkflowArgs {
    #[command(flatten)]
    pub common: CommonArgs,
    #[command(flatten)]
    pub date_window: DateWindowArgs,
    /// Restrict to a single transaction id.
    #[arg(long)]
    pub id: Option<TransactionId>,
}

#[derive(Debug, Parser)]
pub struct DiffArgs {
    #[command(flatten)]
    pub common: CommonArgs,
    #[command(flatten)]
    pub date_window: DateWindowArgs,
    #[arg(long)]
    pub id: Option<TransactionId>,
    /// Presentation mode for the comparison (§4.5 "Diff").
    #[arg(long, value_enum, default_value_t = DiffFormat::Summary)]
    pub format: DiffFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum DiffFormat {
    Summary,
    Ids,
    Changelog,
    TwoColumn,
}

impl From<DiffFormat> for crate::orchestrator::DiffMode {
    fn from(value: DiffFormat) -> Self {
        match value {
            DiffFormat::Summary => crate::orchestrator::DiffMode::Summary,
            DiffFormat::Ids => crate::orchestrator::DiffMode::Ids,
            DiffFormat::Changelog => crate::orchestrator::DiffMode::Changelog,
            DiffFormat::TwoColumn => crate::orchestrator::DiffMode::TwoColumn,
        }
    }
}

/// The `{--from, --to}` / `{--this-month, --last-month, --this-year,
/// --last-year}` date-window group (§6 "Common options"). Mutual exclusion
/// and `--to`-without-`--from` are enforced in `resolve`, not via clap's
/// `ArgGroup`, since the two halves of the group (an explicit pair vs. four
/// standalone convenience flags) don't map to a single flat group.
#[derive(Debug, Parser, Clone, Default)]
pub struct DateWindowArgs {
    #[arg(long, value_name = "YYYY-MM-DD")]
    pub from: Option<String>,
    #[arg(long, value_name = "YYYY-MM-DD")]
    pub to: Option<String>,
    #[arg(long)]
    pub this_month: bool,
    #[arg(long)]
    pub last_month: bool,
    #[arg(long)]
    pub this_year: bool,
    #[arg(long)]
    pub last_year: bool,
}

impl DateWindowArgs {
    pub fn resolve(&self) -> Result<(Option<NaiveDate>, Option<NaiveDate>), ConfigError> {
        let convenience_count = [self.this_month, self.last_month, self.this_year, self.last_year]
            .iter()
            .filter(|&&set| set)
            .count();
        if convenience_count > 1 {
            return Err(ConfigError::ConflictingDateFlags(
                "at most one of --this-month/--last-month/--this-year/--last-year may be given".to_string(),
            ));
        }

        let explicit = self.from.is_some() || self.to.is_some();
        if convenience_count > 0 && explicit {
            return Err(ConfigError::ConflictingDateFlags(
                "--from/--to cannot be combined with a convenience date-window flag".to_string(),
            ));
        }
        if self.to.is_some() && self.from.is_none() {
            return Err(ConfigError::ConflictingDateFlags("--to requires --from".to_string()));
        }

        if convenience_count > 0 {
            return Ok(convenience_window(chrono::Local::now().date_naive(), self));
        }

        let from = self.from.as_deref().map(parse_date).transpose()?;
        let to = self.to.as_deref().map(parse_date).transpose()?;
        Ok((from, to))
    }
}

fn parse_date(raw: &str) -> Result<NaiveDate, ConfigError> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d").map_err(|_| ConfigError::MalformedDate(raw.to_string()))
}

fn convenience_window(today: NaiveDate, args: &DateWindowArgs) -> (Option<NaiveDate>, Option<NaiveDate>) {
    if args.this_month {
        let from = NaiveDate::from_ymd_opt(today.year(), today.month(), 1).expect("valid date");
        (Some(from), Some(last_day_of_month(today.year(), today.month())))
    } else if args.last_month {
        let (y, m) = previous_month(today.year(), today.month());
        let from = NaiveDate::from_ymd_opt(y, m, 1).expect("valid date");
        (Some(from), Some(last_day_of_month(y, m)))
    } else if args.this_year {
        let from = NaiveDate::from_ymd_opt(today.year(), 1, 1).expect("valid date");
        let to = NaiveDate::from_ymd_opt(today.year(), 12, 31).expect("valid date");
        (Some(from), Some(to))
    } else if args.last_year {
        let year = today.year() - 1;
        let from = NaiveDate::from_ymd_opt(year, 1, 1).expect("valid date");
        let to = NaiveDate::from_ymd_opt(year, 12, 31).expect("valid date");
        (Some(from), Some(to))
    } else {
        (None, None)
    }
}

fn previous_month(year: i32, month: u32) -> (i32, u32) {
    if month == 1 {
        (year - 1, 12)
    } else {
        (year, month - 1)
    }
}

fn last_day_of_month(year: i32, month: u32) -> NaiveDate {
    let (next_year, next_month) = if month == 12 { (year + 1, 1) } else { (year, month + 1) };
    NaiveDate::from_ymd_opt(next_year, next_month, 1)
        .expect("valid date")
        .pred_opt()
        .expect("valid date")
}

#[derive(Debug, Subcommand)]
pub enum RuleCommand {
    /// Adds a rule to the rules directory.
    Add(RuleAddArgs),
    /// Removes a rule by id.
    Rm(RuleRmArgs),
    /// Applies the rule set to the local archive (local-only, §4.3 "Apply
    /// command semantics").
    Apply(RuleApplyArgs),
    /// Lists the loaded rule set in matching order.
    List(RulesDirArgs),
    /// Reports which rule (if any) would match a given transaction.
    Lookup(RuleLookupArgs),
}

#[derive(Debug, Parser)]
pub struct RulesDirArgs {
    /// Directory holding the rule YAML files.
    #[arg(long, value_name = "DIR", default_value = "rules")]
    pub rules_dir: PathBuf,
}

#[derive(Debug, Parser)]
pub struct RuleAddArgs {
    #[command(flatten)]
    pub rules: RulesDirArgs,

    /// Globally unique rule id.
    #[arg(long)]
    pub id: i64,

    /// Precondition: payee must match this regex.
    #[arg(long = "if-merchant", value_name = "REGEX")]
    pub if_merchant: Option<String>,
    /// Precondition: the owning account's display name must match this regex.
    #[arg(long = "if-account", value_name = "REGEX")]
    pub if_account: Option<String>,
    /// Precondition: the current category title must match this regex.
    #[arg(long = "if-category", value_name = "REGEX")]
    pub if_category: Option<String>,
    /// Precondition: a `[key:value]` narration tag must match this regex.
    /// Repeatable.
    #[arg(long = "if-metadata", value_name = "KEY=REGEX", value_parser = parse_kv)]
    pub if_metadata: Vec<(String, String)>,

    /// Transform: set the category by title.
    #[arg(long = "set-category", value_name = "TITLE")]
    pub set_category: Option<String>,
    /// Transform: add a label. Repeatable.
    #[arg(long = "add-label", value_name = "LABEL")]
    pub add_label: Vec<String>,
    /// Transform: remove a label. Repeatable.
    #[arg(long = "remove-label", value_name = "LABEL")]
    pub remove_label: Vec<String>,
    /// Transform: set the narration.
    #[arg(long = "set-memo", value_name = "TEXT")]
    pub set_memo: Option<String>,
    /// Transform: fold a `[key:value]` tag into the narration. Repeatable.
    #[arg(long = "set-metadata", value_name = "KEY=VALUE", value_parser = parse_kv)]
    pub set_metadata: Vec<(String, String)>,
}

fn parse_kv(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected KEY=VALUE, got {raw:?}"))
}

impl RuleAddArgs {
    pub fn into_new_rule(self) -> crate::rules::NewRule {
        crate::rules::NewRule {
            id: self.id,
            merchant: self.if_merchant,
            account: self.if_account,
            category_precondition: self.if_category,
            metadata_precondition: self.if_metadata.into_iter().collect(),
            set_category: self.set_category,
            add_labels: self.add_label,
            remove_labels: self.remove_label,
            memo: self.set_memo,
            set_metadata: self.set_metadata.into_iter().collect(),
        }
    }
}

#[derive(Debug, Parser)]
pub struct RuleRmArgs {
    #[command(flatten)]
    pub rules: RulesDirArgs,
    /// Id of the rule to remove.
    pub id: i64,
}

#[derive(Debug, Parser)]
pub struct RuleApplyArgs {
    #[command(flatten)]
    pub rules: RulesDirArgs,
    #[command(flatten)]
    pub workflow: WorkflowArgs,
}

#[derive(Debug, Parser)]
pub struct RuleLookupArgs {
    #[command(flatten)]
    pub rules: RulesDirArgs,
    #[command(flatten)]
    pub common: CommonArgs,
    /// Transaction to evaluate the rule set against.
    #[arg(long)]
    pub id: TransactionId,
}

#[derive(Debug, Parser)]
pub struct DetectTransfersArgs {
    #[command(flatten)]
    pub common: CommonArgs,
    /// Category title applied to confirmed transfer pairs.
    #[arg(long, value_name = "TITLE")]
    pub transfer_category: String,
    /// Overrides `DetectorConfig::confirmed_date_window_days`.
    #[arg(long)]
    pub confirmed_window_days: Option<i64>,
    /// Overrides `DetectorConfig::suspected_date_window_days`.
    #[arg(long)]
    pub suspected_window_days: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_dates_parse() {
        let args = DateWindowArgs {
            from: Some("2024-01-01".to_string()),
            to: Some("2024-01-31".to_string()),
            ..Default::default()
        };
        let (from, to) = args.resolve().unwrap();
        assert_eq!(from, NaiveDate::from_ymd_opt(2024, 1, 1));
        assert_eq!(to, NaiveDate::from_ymd_opt(2024, 1, 31));
    }

    #[test]
    fn to_without_from_is_rejected() {
        let args = DateWindowArgs {
            to: Some("2024-01-31".to_string()),
            ..Default::default()
        };
        assert!(args.resolve().is_err());
    }

    #[test]
    fn convenience_flag_combined_with_explicit_date_is_rejected() {
        let args = DateWindowArgs {
            from: Some("2024-01-01".to_string()),
            this_month: true,
            ..Default::default()
        };
        assert!(args.resolve().is_err());
    }

    #[test]
    fn two_convenience_flags_are_rejected() {
        let args = DateWindowArgs {
            this_month: true,
            last_year: true,
            ..Default::default()
        };
        assert!(args.resolve().is_err());
    }

    #[test]
    fn last_month_spans_the_full_prior_month() {
        let (from, to) = convenience_window(
            NaiveDate::from_ymd_opt(2024, 3, 15).unwrap(),
            &DateWindowArgs {
                last_month: true,
                ..Default::default()
            },
        );
        assert_eq!(from, NaiveDate::from_ymd_opt(2024, 2, 1));
        assert_eq!(to, NaiveDate::from_ymd_opt(2024, 2, 29));
    }

    #[test]
    fn january_last_month_wraps_to_prior_december() {
        let (from, to) = convenience_window(
            NaiveDate::from_ymd_opt(2024, 1, 10).unwrap(),
            &DateWindowArgs {
                last_month: true,
                ..Default::default()
            },
        );
        assert_eq!(from, NaiveDate::from_ymd_opt(2023, 12, 1));
        assert_eq!(to, NaiveDate::from_ymd_opt(2023, 12, 31));
    }
}
