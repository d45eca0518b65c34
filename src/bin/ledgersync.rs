//! `ledgersync` binary: wires the `clap`-derived command surface (§6) onto
//! the library's orchestrator, rule engine and transfer detector, installs
//! `tracing-subscriber` and maps errors onto the exit codes from §6/§7.
//!
//! Grounded on `other_examples/manifests/ejc3-claude-code-sync` and
//! `other_examples/manifests/pluveto-tesser` for the "derive a
//! `clap::Parser`, dispatch to library functions, install a `tracing`
//! subscriber once at startup" shape.

use std::process::ExitCode;
use std::sync::atomic::Ordering;

use clap::Parser;

use ledger_reconciler::changelog::FileChangelogSink;
use ledger_reconciler::cli::{
    Cli, Command, CommonArgs, DetectTransfersArgs, DiffArgs, RuleCommand, WorkflowArgs,
};
use ledger_reconciler::config::Config;
use ledger_reconciler::error::ReconcileError;
use ledger_reconciler::model::Transaction;
use ledger_reconciler::orchestrator::{DiffMode, Orchestrator, Scope};
use ledger_reconciler::remote::HttpRemoteClient;
use ledger_reconciler::rules;
use ledger_reconciler::store::{FileLocalStore, LocalStore as _};
use ledger_reconciler::transfer::{self, DetectorConfig};

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::from(err.exit_code() as u8)
        }
    }
}

fn run(cli: Cli) -> Result<(), ReconcileError> {
    match cli.command {
        Command::Clone(args) => {
            install_tracing(&args.common);
            let config = Config::resolve(args.common.destination.as_deref(), args.common.base_url.as_deref())?;
            let (from, to) = args.date_window.resolve()?;
            let scope = Scope { id: None, from, to };

            let remote = HttpRemoteClient::new(&config.base_url, &config.api_token)?;
            let store = FileLocalStore::new(&config.archive_path);
            let changelog = FileChangelogSink::new(&config.changelog_path);
            let orchestrator = Orchestrator::new(&remote, &store, &changelog, args.common.dry_run);
            install_interrupt_handler(&orchestrator);

            let report = orchestrator.clone_archive(&scope, &config.archive_path)?;
            print_report("clone", &args.common, &report);
            Ok(())
        }

        Command::Pull(args) => {
            install_tracing(&args.common);
            let config = Config::resolve(args.common.destination.as_deref(), args.common.base_url.as_deref())?;
            let scope = workflow_scope(&args)?;

            let remote = HttpRemoteClient::new(&config.base_url, &config.api_token)?;
            let store = FileLocalStore::new(&config.archive_path);
            let changelog = FileChangelogSink::new(&config.changelog_path);
            let orchestrator = Orchestrator::new(&remote, &store, &changelog, args.common.dry_run);
            install_interrupt_handler(&orchestrator);

            let report = orchestrator.pull(&scope, &config.archive_path)?;
            print_report("pull", &args.common, &report);
            Ok(())
        }

        Command::Push(args) => {
            install_tracing(&args.common);
            let config = Config::resolve(args.common.destination.as_deref(), args.common.base_url.as_deref())?;
            let scope = workflow_scope(&args)?;

            let remote = HttpRemoteClient::new(&config.base_url, &config.api_token)?;
            let store = FileLocalStore::new(&config.archive_path);
            let changelog = FileChangelogSink::new(&config.changelog_path);
            let orchestrator = Orchestrator::new(&remote, &store, &changelog, args.common.dry_run);
            install_interrupt_handler(&orchestrator);

            let report = orchestrator.push(&scope, &config.archive_path)?;
            print_report("push", &args.common, &report);
            Ok(())
        }

        Command::Diff(args) => run_diff(args),

        Command::Rule { command } => run_rule(command),

        Command::DetectTransfers(args) => run_detect_transfers(args),
    }
}

fn workflow_scope(args: &WorkflowArgs) -> Result<Scope, ReconcileError> {
    let (from, to) = args.date_window.resolve()?;
    Ok(Scope { id: args.id, from, to })
}

fn print_report(workflow: &str, common: &CommonArgs, report: &ledger_reconciler::orchestrator::WorkflowReport) {
    if common.quiet {
        return;
    }
    let prefix = if common.dry_run { "[dry-run] " } else { "" };
    println!(
        "{prefix}{workflow}: identical={} differs={} only_local={} only_remote={}",
        report.summary.identical, report.summary.differs, report.summary.only_local, report.summary.only_remote
    );
    for line in &report.mutations {
        println!("{prefix}  update {line}");
    }
    for id in &report.conflicts {
        println!("{prefix}  conflict: transaction {id} has an immutable-field mismatch");
    }
    if common.verbose && report.mutations.is_empty() && report.conflicts.is_empty() {
        println!("{prefix}  no changes");
    }
}

fn run_diff(args: DiffArgs) -> Result<(), ReconcileError> {
    install_tracing(&args.common);
    let config = Config::resolve(args.common.destination.as_deref(), args.common.base_url.as_deref())?;
    let (from, to) = args.date_window.resolve()?;
    let scope = Scope { id: args.id, from, to };

    let remote = HttpRemoteClient::new(&config.base_url, &config.api_token)?;
    let store = FileLocalStore::new(&config.archive_path);
    let changelog = FileChangelogSink::new(&config.changelog_path);
    let orchestrator = Orchestrator::new(&remote, &store, &changelog, true);

    let result = orchestrator.diff(&scope)?;
    for line in ledger_reconciler::orchestrator::render_diff(&result, DiffMode::from(args.format)) {
        println!("{line}");
    }
    Ok(())
}

fn run_rule(command: RuleCommand) -> Result<(), ReconcileError> {
    match command {
        RuleCommand::Add(args) => {
            rules::add_rule(&args.rules.rules_dir, args.into_new_rule())?;
            println!("rule added");
            Ok(())
        }
        RuleCommand::Rm(args) => {
            rules::remove_rule(&args.rules.rules_dir, args.id)?;
            println!("rule {} removed", args.id);
            Ok(())
        }
        RuleCommand::List(args) => {
            let rule_set = rules::load_rules_dir(&args.rules_dir)?;
            for rule in rule_set.iter_matching_order() {
                let status = if rule.disabled { " (disabled)" } else { "" };
                println!("{}{status}", rule.id);
            }
            Ok(())
        }
        RuleCommand::Apply(args) => {
            install_tracing(&args.workflow.common);
            let config = Config::resolve(
                args.workflow.common.destination.as_deref(),
                args.workflow.common.base_url.as_deref(),
            )?;
            let rule_set = rules::load_rules_dir(&args.rules.rules_dir)?;
            let scope = workflow_scope(&args.workflow)?;

            let remote = HttpRemoteClient::new(&config.base_url, &config.api_token)?;
            let store = FileLocalStore::new(&config.archive_path);
            let changelog = FileChangelogSink::new(&config.changelog_path);
            let orchestrator = Orchestrator::new(&remote, &store, &changelog, args.workflow.common.dry_run);

            let applied = orchestrator.apply_rules(&rule_set, &scope)?;
            if !args.workflow.common.quiet {
                for a in &applied {
                    println!(
                        "applied rule {} to transaction {}: {} {} -> {}",
                        a.rule_id, a.txn_id, a.field, a.old_value, a.new_value
                    );
                }
                if applied.is_empty() {
                    println!("no rules matched in scope");
                }
            }
            Ok(())
        }
        RuleCommand::Lookup(args) => {
            let config = Config::resolve(args.common.destination.as_deref(), args.common.base_url.as_deref())?;
            let rule_set = rules::load_rules_dir(&args.rules.rules_dir)?;
            let store = FileLocalStore::new(&config.archive_path);
            let archive = store.load()?;

            let Some(txn) = archive.transactions.iter().find(|t| t.id == args.id) else {
                return Err(ReconcileError::UserInput(format!("unknown transaction id {}", args.id)));
            };
            let Some(account) = archive.accounts.iter().find(|a| a.id == txn.account_id) else {
                return Err(ReconcileError::UserInput(format!(
                    "transaction {} references unknown account {}",
                    txn.id, txn.account_id
                )));
            };

            let mut probe: Transaction = txn.clone();
            let (matched, _applied) = rules::evaluate(&rule_set, &mut probe, account, &archive.categories)?;
            match matched {
                Some(rule) => println!("transaction {} matches rule {}", args.id, rule.id),
                None => println!("transaction {} matches no rule", args.id),
            }
            Ok(())
        }
    }
}

fn run_detect_transfers(args: DetectTransfersArgs) -> Result<(), ReconcileError> {
    install_tracing(&args.common);
    let config = Config::resolve(args.common.destination.as_deref(), args.common.base_url.as_deref())?;

    let store = FileLocalStore::new(&config.archive_path);
    let archive = store.load()?;
    let transfer_category_id = archive
        .categories
        .iter()
        .find(|c| c.title == args.transfer_category)
        .map(|c| c.id)
        .ok_or_else(|| {
            ReconcileError::UserInput(format!("unknown transfer category {:?}", args.transfer_category))
        })?;

    let mut detector_config = DetectorConfig::default();
    if let Some(days) = args.confirmed_window_days {
        detector_config.confirmed_date_window_days = days;
    }
    if let Some(days) = args.suspected_window_days {
        detector_config.suspected_date_window_days = days;
    }

    let remote = HttpRemoteClient::new(&config.base_url, &config.api_token)?;
    let changelog = FileChangelogSink::new(&config.changelog_path);
    let orchestrator = Orchestrator::new(&remote, &store, &changelog, args.common.dry_run);

    let report = orchestrator.detect_transfers(detector_config, transfer_category_id)?;
    if !args.common.quiet {
        for pair in &report.pairs {
            match pair.kind {
                transfer::PairKind::Confirmed => {
                    println!("confirmed transfer: {} <-> {}", pair.a, pair.b)
                }
                transfer::PairKind::Suspected => println!(
                    "suspected transfer: {} <-> {} ({})",
                    pair.a,
                    pair.b,
                    pair.suspect_reason_string().unwrap_or_default()
                ),
            }
        }
        for notification in &report.pattern_notifications {
            println!(
                "pattern notification: {} suspected pairs share reason {:?}",
                notification.count, notification.reason
            );
        }
    }
    Ok(())
}

/// Installs `tracing-subscriber` once per invocation, honouring
/// `--verbose`/`--quiet` (§6 "Common options").
fn install_tracing(common: &CommonArgs) {
    use tracing_subscriber::EnvFilter;

    let default_level = if common.quiet {
        "error"
    } else if common.verbose {
        "debug"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// Wires SIGINT to the orchestrator's cancellation flag (§5 "Cancellation").
/// Honoured at the next I/O boundary; in-flight PATCHes are awaited.
fn install_interrupt_handler<R, L, C>(orchestrator: &Orchestrator<'_, R, L, C>)
where
    R: ledger_reconciler::remote::RemoteClient,
    L: ledger_reconciler::store::LocalStore,
    C: ledger_reconciler::changelog::ChangelogSink,
{
    let flag = orchestrator.interrupt_flag();
    let _ = ctrlc::set_handler(move || {
        flag.store(true, Ordering::SeqCst);
    });
}
