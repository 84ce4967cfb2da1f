//! `gbank` command surface over the GuildBank ledger store.
//!
//! Each subcommand is an independent, idempotent unit of work intended for
//! cron or manual invocation: `migrate`, `reconcile`, `snapshot`, `verify`,
//! plus `account`/`ledger` inspection and adjustment commands. A zero exit
//! status means success; non-zero means at least one fatal failure.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use guildbank_core::{
    reconcile_source, AccountId, EntryKind, ReconciliationReport, RosterEntry, RosterError,
    RosterSource,
};
use guildbank_store_sqlite::{prune_snapshots, SqliteLedgerStore};
use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "gbank")]
#[command(about = "GuildBank account and ledger operations CLI")]
pub struct Cli {
    #[arg(long, default_value = "./guildbank.sqlite3")]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Apply pending additive schema migrations.
    Migrate(MigrateArgs),
    /// Reconcile the account set against a roster file.
    Reconcile(ReconcileArgs),
    /// Write a consistent snapshot of the store and prune old ones.
    Snapshot(SnapshotArgs),
    /// Check the balance/ledger invariant across all accounts.
    Verify(VerifyArgs),
    Account {
        #[command(subcommand)]
        command: Box<AccountCommand>,
    },
    Ledger {
        #[command(subcommand)]
        command: Box<LedgerCommand>,
    },
}

#[derive(Debug, Args)]
pub struct MigrateArgs {
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct ReconcileArgs {
    /// Roster file: {"guilds": [{"guild_id": .., "members": [..]}]}.
    #[arg(long)]
    roster: PathBuf,
    #[arg(long, default_value_t = 1000)]
    start_balance: i64,
    /// How many per-account failures to list in the human summary.
    #[arg(long, default_value_t = 10)]
    max_failures: usize,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct SnapshotArgs {
    #[arg(long)]
    dir: PathBuf,
    #[arg(long, default_value_t = 10)]
    keep: usize,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct VerifyArgs {
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Subcommand)]
pub enum AccountCommand {
    Show(AccountShowArgs),
    List,
}

#[derive(Debug, Args)]
pub struct AccountShowArgs {
    #[arg(long)]
    id: String,
}

#[derive(Debug, Subcommand)]
pub enum LedgerCommand {
    List(LedgerListArgs),
    Adjust(LedgerAdjustArgs),
    Sum(LedgerSumArgs),
}

#[derive(Debug, Args)]
pub struct LedgerListArgs {
    #[arg(long)]
    id: String,
    #[arg(long)]
    limit: Option<usize>,
}

#[derive(Debug, Args)]
pub struct LedgerAdjustArgs {
    #[arg(long)]
    id: String,
    /// Signed delta in the smallest currency unit.
    #[arg(long, allow_negative_numbers = true)]
    amount: i64,
}

#[derive(Debug, Args)]
pub struct LedgerSumArgs {
    #[arg(long)]
    id: String,
}

#[derive(Debug, Serialize, Deserialize, Eq, PartialEq)]
pub struct MigrateReport {
    pub applied_steps: usize,
}

#[derive(Debug, Serialize, Deserialize, Eq, PartialEq)]
pub struct SnapshotReport {
    pub snapshot: PathBuf,
    pub removed: Vec<PathBuf>,
}

#[derive(Debug, Serialize, Deserialize, Eq, PartialEq)]
pub struct SumReport {
    pub account_id: String,
    pub entry_sum: i64,
}

/// Executes the parsed top-level CLI command graph.
///
/// # Errors
/// Returns an error when store open or migration fails, or when the
/// requested command fails fatally.
pub fn run_cli(cli: Cli) -> Result<()> {
    let mut store = SqliteLedgerStore::open(&cli.db)?;

    if let Command::Migrate(args) = &cli.command {
        let applied_steps = store.migrate()?;
        let report = MigrateReport { applied_steps };
        if args.json {
            println!("{}", serde_json::to_string_pretty(&report)?);
        } else {
            println!("applied_steps={applied_steps}");
        }
        return Ok(());
    }

    // The schema manager must run to completion before any repository use.
    let _ = store.migrate()?;
    run_command(cli.command, &mut store)
}

fn run_command(command: Command, store: &mut SqliteLedgerStore) -> Result<()> {
    match command {
        Command::Migrate(_) => Err(anyhow!(
            "internal dispatch error: migrate is handled before repository commands"
        )),
        Command::Reconcile(args) => run_reconcile(store, &args),
        Command::Snapshot(args) => run_snapshot(store, &args),
        Command::Verify(args) => run_verify(store, &args),
        Command::Account { command } => run_account(*command, store),
        Command::Ledger { command } => run_ledger(*command, store),
    }
}

fn run_reconcile(store: &mut SqliteLedgerStore, args: &ReconcileArgs) -> Result<()> {
    let mut roster = FileRoster::load(&args.roster)?;
    let report = reconcile_source(store, &mut roster, args.start_balance)
        .map_err(|err| anyhow!("reconciliation aborted: {err}"))?;
    info!(
        total_seen = report.total_seen,
        added = report.added,
        updated = report.updated,
        "reconciliation run finished"
    );

    // The summary is printed even when the run was only partially
    // successful; per-account failures are non-fatal.
    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_reconciliation_report(&report, args.max_failures);
    }
    Ok(())
}

fn run_snapshot(store: &SqliteLedgerStore, args: &SnapshotArgs) -> Result<()> {
    let snapshot = store.write_snapshot(&args.dir)?;
    let removed = prune_snapshots(&args.dir, args.keep)?;

    if args.json {
        let report = SnapshotReport { snapshot, removed };
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("snapshot={} removed={}", snapshot.display(), removed.len());
    }
    Ok(())
}

fn run_verify(store: &SqliteLedgerStore, args: &VerifyArgs) -> Result<()> {
    let drifts = store.verify_balances()?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&drifts)?);
    } else if drifts.is_empty() {
        println!("balances=consistent accounts_with_drift=0");
    } else {
        println!("{:<24} {:<14} entry_sum", "account_id", "balance");
        println!("{}", "-".repeat(60));
        for drift in &drifts {
            println!(
                "{:<24} {:<14} {}",
                drift.account_id, drift.balance, drift.entry_sum
            );
        }
    }

    if drifts.is_empty() {
        Ok(())
    } else {
        Err(anyhow!(
            "balance drift detected on {} account(s)",
            drifts.len()
        ))
    }
}

fn run_account(command: AccountCommand, store: &SqliteLedgerStore) -> Result<()> {
    match command {
        AccountCommand::Show(args) => {
            let id = parse_account_id(&args.id)?;
            let Some(account) = store.get_account(&id)? else {
                return Err(anyhow!("account not found: {id}"));
            };
            println!("{}", serde_json::to_string_pretty(&account)?);
            Ok(())
        }
        AccountCommand::List => {
            let accounts = store.list_accounts()?;
            println!("{}", serde_json::to_string_pretty(&accounts)?);
            Ok(())
        }
    }
}

fn run_ledger(command: LedgerCommand, store: &mut SqliteLedgerStore) -> Result<()> {
    match command {
        LedgerCommand::List(args) => {
            let id = parse_account_id(&args.id)?;
            let entries = store.entries_for(&id, args.limit)?;
            println!("{}", serde_json::to_string_pretty(&entries)?);
            Ok(())
        }
        LedgerCommand::Adjust(args) => {
            let id = parse_account_id(&args.id)?;
            let entry = store.append_adjustment(&id, args.amount, EntryKind::Adjustment)?;
            println!("{}", serde_json::to_string_pretty(&entry)?);
            Ok(())
        }
        LedgerCommand::Sum(args) => {
            let id = parse_account_id(&args.id)?;
            let entry_sum = store.sum_for(&id)?;
            let report = SumReport {
                account_id: id.as_str().to_string(),
                entry_sum,
            };
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
    }
}

fn parse_account_id(raw: &str) -> Result<AccountId> {
    AccountId::new(raw).map_err(|err| anyhow!("invalid account id: {err}"))
}

fn print_reconciliation_report(report: &ReconciliationReport, max_failures: usize) {
    println!(
        "total_seen={} added={} updated={} skipped_bots={} failures={} guild_failures={}",
        report.total_seen,
        report.added,
        report.updated,
        report.skipped_bots,
        report.failures.len(),
        report.guild_failures.len()
    );

    for failure in report.failures.iter().take(max_failures) {
        println!("failure {}: {}", failure.external_id, failure.reason);
    }
    if report.failures.len() > max_failures {
        println!("(+{} more failures)", report.failures.len() - max_failures);
    }
    for failure in &report.guild_failures {
        println!("guild_failure {}: {}", failure.guild_id, failure.reason);
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct RosterFileBody {
    guilds: Vec<GuildRoster>,
}

#[derive(Debug, Serialize, Deserialize)]
struct GuildRoster {
    guild_id: String,
    members: Vec<RosterEntry>,
}

/// File-backed roster source for manual and scheduled reconciliation runs.
#[derive(Debug)]
pub struct FileRoster {
    guilds: Vec<GuildRoster>,
}

impl FileRoster {
    /// Loads a roster file from disk.
    ///
    /// # Errors
    /// Returns an error when the file cannot be read or decoded; the caller
    /// treats this as the roster source being unavailable (fatal for the run).
    pub fn load(path: &Path) -> Result<Self> {
        let body = fs::read_to_string(path)
            .with_context(|| format!("roster unavailable: cannot read {}", path.display()))?;
        let parsed: RosterFileBody = serde_json::from_str(&body)
            .with_context(|| format!("roster unavailable: invalid JSON in {}", path.display()))?;
        Ok(Self {
            guilds: parsed.guilds,
        })
    }
}

impl RosterSource for FileRoster {
    fn guild_ids(&mut self) -> Result<Vec<String>, RosterError> {
        Ok(self
            .guilds
            .iter()
            .map(|guild| guild.guild_id.clone())
            .collect())
    }

    fn members(&mut self, guild_id: &str) -> Result<Vec<RosterEntry>, RosterError> {
        let Some(guild) = self.guilds.iter().find(|guild| guild.guild_id == guild_id) else {
            return Err(RosterError::GuildFetch {
                guild_id: guild_id.to_string(),
                reason: "guild not present in roster file".to_string(),
            });
        };
        Ok(guild.members.clone())
    }
}
