use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::{OffsetDateTime, UtcOffset};
use tracing::{debug, warn};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum LedgerError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("account already exists: {0}")]
    DuplicateAccount(AccountId),
    #[error("account not found: {0}")]
    AccountNotFound(AccountId),
    #[error("storage error: {0}")]
    Storage(String),
}

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum RosterError {
    #[error("roster source unavailable: {0}")]
    Unavailable(String),
    #[error("guild {guild_id} member fetch failed: {reason}")]
    GuildFetch { guild_id: String, reason: String },
}

/// External-system identity of an account. Immutable once created; the
/// primary key of the account store.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct AccountId(String);

impl AccountId {
    /// Builds an id from an external identity string.
    ///
    /// # Errors
    /// Returns [`LedgerError::Validation`] when the id is blank.
    pub fn new(raw: &str) -> Result<Self, LedgerError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(LedgerError::Validation(
                "account id MUST be non-empty".to_string(),
            ));
        }
        Ok(Self(trimmed.to_string()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for AccountId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum EntryKind {
    InitialGrant,
    Adjustment,
}

impl EntryKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InitialGrant => "initial-grant",
            Self::Adjustment => "adjustment",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "initial-grant" => Some(Self::InitialGrant),
            "adjustment" => Some(Self::Adjustment),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Account {
    pub id: AccountId,
    pub display_name: String,
    /// Cached sum of this account's ledger entries, in the smallest
    /// currency unit. Updated only in the same transaction that appends
    /// the matching entry.
    pub balance: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct LedgerEntry {
    pub entry_seq: i64,
    pub account_id: AccountId,
    pub amount: i64,
    pub kind: EntryKind,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// One member record from the external roster.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct RosterEntry {
    pub external_id: String,
    pub display_name: String,
    pub is_bot: bool,
}

/// The authoritative external membership directory, injected so
/// reconciliation can run against a fake in tests.
pub trait RosterSource {
    /// Lists the guild ids to enumerate.
    ///
    /// # Errors
    /// Returns [`RosterError::Unavailable`] when the directory itself cannot
    /// be reached; this aborts the whole reconciliation run.
    fn guild_ids(&mut self) -> Result<Vec<String>, RosterError>;

    /// Fetches the member page for one guild.
    ///
    /// # Errors
    /// Returns [`RosterError::GuildFetch`] when this guild's page cannot be
    /// fetched; other guilds are still processed.
    fn members(&mut self, guild_id: &str) -> Result<Vec<RosterEntry>, RosterError>;
}

/// Account and ledger write surface the Reconciliation Engine drives.
///
/// There is deliberately no way to change a balance without the matching
/// ledger entry, and no balance parameter on the update path.
pub trait AccountLedger {
    /// # Errors
    /// Returns [`LedgerError::Storage`] when the store cannot be read.
    fn account_exists(&mut self, id: &AccountId) -> Result<bool, LedgerError>;

    /// Creates the account row and its `initial-grant` entry atomically and
    /// returns the new entry's sequence number.
    ///
    /// # Errors
    /// Returns [`LedgerError::DuplicateAccount`] when the id already exists,
    /// [`LedgerError::Storage`] on store failure.
    fn create_account_with_grant(
        &mut self,
        id: &AccountId,
        display_name: &str,
        initial_balance: i64,
    ) -> Result<i64, LedgerError>;

    /// Updates the last-observed display name; never touches the balance.
    /// Returns `true` only when the stored name actually changed.
    ///
    /// # Errors
    /// Returns [`LedgerError::AccountNotFound`] when the account is absent,
    /// [`LedgerError::Storage`] on store failure.
    fn update_display_name(
        &mut self,
        id: &AccountId,
        display_name: &str,
    ) -> Result<bool, LedgerError>;
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct AccountFailure {
    pub external_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct GuildFailure {
    pub guild_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct ReconciliationReport {
    pub total_seen: usize,
    pub added: usize,
    pub updated: usize,
    pub skipped_bots: usize,
    pub failures: Vec<AccountFailure>,
    pub guild_failures: Vec<GuildFailure>,
}

impl ReconciliationReport {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty() && self.guild_failures.is_empty()
    }
}

/// Brings the account set into agreement with one roster page.
///
/// Entries are processed strictly one at a time so each account's
/// transaction stays small; a per-entry failure is collected and the rest
/// of the roster is still drained. Re-running with an identical roster
/// adds and updates nothing.
pub fn reconcile_entries<L, I>(
    ledger: &mut L,
    roster: I,
    start_balance: i64,
) -> ReconciliationReport
where
    L: AccountLedger,
    I: IntoIterator<Item = RosterEntry>,
{
    let mut report = ReconciliationReport::default();
    for entry in roster {
        reconcile_one(&mut report, ledger, &entry, start_balance);
    }
    report
}

/// Runs a full reconciliation against every guild of a roster source.
///
/// # Errors
/// Returns [`RosterError::Unavailable`] when guild enumeration itself fails;
/// no progress is possible in that case and no state has been touched.
/// A single guild's member fetch failing is recorded in the report instead.
pub fn reconcile_source<L, S>(
    ledger: &mut L,
    source: &mut S,
    start_balance: i64,
) -> Result<ReconciliationReport, RosterError>
where
    L: AccountLedger,
    S: RosterSource + ?Sized,
{
    let guild_ids = match source.guild_ids() {
        Ok(ids) => ids,
        Err(RosterError::GuildFetch { guild_id, reason }) => {
            return Err(RosterError::Unavailable(format!(
                "guild enumeration failed at {guild_id}: {reason}"
            )));
        }
        Err(err) => return Err(err),
    };

    let mut report = ReconciliationReport::default();
    for guild_id in guild_ids {
        match source.members(&guild_id) {
            Ok(entries) => {
                for entry in entries {
                    reconcile_one(&mut report, ledger, &entry, start_balance);
                }
            }
            Err(err) => {
                warn!(guild_id, %err, "skipping guild after member fetch failure");
                report.guild_failures.push(GuildFailure {
                    guild_id,
                    reason: err.to_string(),
                });
            }
        }
    }

    Ok(report)
}

fn reconcile_one<L: AccountLedger>(
    report: &mut ReconciliationReport,
    ledger: &mut L,
    entry: &RosterEntry,
    start_balance: i64,
) {
    report.total_seen += 1;

    if entry.is_bot {
        report.skipped_bots += 1;
        return;
    }

    let id = match AccountId::new(&entry.external_id) {
        Ok(id) => id,
        Err(err) => {
            report.failures.push(AccountFailure {
                external_id: entry.external_id.clone(),
                reason: err.to_string(),
            });
            return;
        }
    };

    let outcome = match ledger.account_exists(&id) {
        Ok(true) => ledger
            .update_display_name(&id, &entry.display_name)
            .map(|changed| {
                if changed {
                    report.updated += 1;
                }
            }),
        Ok(false) => match ledger.create_account_with_grant(&id, &entry.display_name, start_balance)
        {
            Ok(_) => {
                report.added += 1;
                Ok(())
            }
            // The storage uniqueness constraint resolved a race with a
            // concurrent run; the account exists now, which is what we want.
            Err(LedgerError::DuplicateAccount(id)) => {
                debug!(%id, "account created concurrently by another run");
                Ok(())
            }
            Err(err) => Err(err),
        },
        Err(err) => Err(err),
    };

    if let Err(err) = outcome {
        warn!(id = %entry.external_id, %err, "per-account reconciliation failure");
        report.failures.push(AccountFailure {
            external_id: entry.external_id.clone(),
            reason: err.to_string(),
        });
    }
}

/// Parses an RFC3339 timestamp and requires UTC (`Z`) offset.
///
/// # Errors
/// Returns [`LedgerError::Validation`] when parsing fails or the input is
/// not UTC.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, LedgerError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| LedgerError::Validation(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(LedgerError::Validation(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }

    Ok(parsed)
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`LedgerError::Validation`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, LedgerError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| LedgerError::Validation(format!("failed to format timestamp: {err}")))
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{BTreeMap, BTreeSet};

    fn must<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    fn account_id(raw: &str) -> AccountId {
        must(AccountId::new(raw))
    }

    #[derive(Debug, Default)]
    struct FakeLedger {
        accounts: BTreeMap<AccountId, (String, i64)>,
        entries: Vec<(AccountId, i64, EntryKind)>,
        fail_ids: BTreeSet<AccountId>,
        race_ids: BTreeSet<AccountId>,
    }

    impl FakeLedger {
        fn entry_sum(&self, id: &AccountId) -> i64 {
            self.entries
                .iter()
                .filter(|(entry_id, _, _)| entry_id == id)
                .map(|(_, amount, _)| amount)
                .sum()
        }

        fn assert_invariant(&self) {
            for (id, (_, balance)) in &self.accounts {
                assert_eq!(*balance, self.entry_sum(id), "invariant broken for {id}");
            }
        }
    }

    impl AccountLedger for FakeLedger {
        fn account_exists(&mut self, id: &AccountId) -> Result<bool, LedgerError> {
            Ok(self.accounts.contains_key(id))
        }

        fn create_account_with_grant(
            &mut self,
            id: &AccountId,
            display_name: &str,
            initial_balance: i64,
        ) -> Result<i64, LedgerError> {
            if self.fail_ids.contains(id) {
                return Err(LedgerError::Storage("injected store failure".to_string()));
            }
            if self.race_ids.contains(id) || self.accounts.contains_key(id) {
                // Simulates the losing writer of a check-then-act race.
                self.accounts
                    .entry(id.clone())
                    .or_insert_with(|| (display_name.to_string(), 0));
                return Err(LedgerError::DuplicateAccount(id.clone()));
            }
            self.accounts
                .insert(id.clone(), (display_name.to_string(), initial_balance));
            self.entries
                .push((id.clone(), initial_balance, EntryKind::InitialGrant));
            Ok(i64::try_from(self.entries.len()).unwrap_or(i64::MAX))
        }

        fn update_display_name(
            &mut self,
            id: &AccountId,
            display_name: &str,
        ) -> Result<bool, LedgerError> {
            if self.fail_ids.contains(id) {
                return Err(LedgerError::Storage("injected store failure".to_string()));
            }
            let Some((name, _)) = self.accounts.get_mut(id) else {
                return Err(LedgerError::AccountNotFound(id.clone()));
            };
            if name == display_name {
                return Ok(false);
            }
            *name = display_name.to_string();
            Ok(true)
        }
    }

    fn member(id: &str, name: &str) -> RosterEntry {
        RosterEntry {
            external_id: id.to_string(),
            display_name: name.to_string(),
            is_bot: false,
        }
    }

    fn bot(id: &str, name: &str) -> RosterEntry {
        RosterEntry {
            external_id: id.to_string(),
            display_name: name.to_string(),
            is_bot: true,
        }
    }

    #[test]
    fn new_member_gets_account_and_funded_grant() {
        let mut ledger = FakeLedger::default();
        let report =
            reconcile_entries(&mut ledger, vec![member("A", "Alice"), bot("B", "Bot1")], 1000);

        assert_eq!(report.total_seen, 2);
        assert_eq!(report.added, 1);
        assert_eq!(report.skipped_bots, 1);
        assert!(report.is_clean());

        let id = account_id("A");
        assert_eq!(ledger.accounts.get(&id), Some(&("Alice".to_string(), 1000)));
        assert_eq!(
            ledger.entries,
            vec![(id, 1000, EntryKind::InitialGrant)]
        );
        ledger.assert_invariant();
    }

    #[test]
    fn bots_are_never_materialized() {
        let mut ledger = FakeLedger::default();
        let report = reconcile_entries(&mut ledger, vec![bot("B", "Bot1")], 1000);

        assert_eq!(report.skipped_bots, 1);
        assert!(ledger.accounts.is_empty());
        assert!(ledger.entries.is_empty());
    }

    #[test]
    fn rerun_with_identical_roster_is_a_no_op() {
        let roster = vec![member("A", "Alice"), member("C", "Carol")];
        let mut ledger = FakeLedger::default();

        let first = reconcile_entries(&mut ledger, roster.clone(), 1000);
        assert_eq!(first.added, 2);

        let second = reconcile_entries(&mut ledger, roster, 1000);
        assert_eq!(second.added, 0);
        assert_eq!(second.updated, 0);
        assert!(second.is_clean());
        ledger.assert_invariant();
    }

    #[test]
    fn display_name_drift_updates_without_touching_balance() {
        let mut ledger = FakeLedger::default();
        let _ = reconcile_entries(&mut ledger, vec![member("A", "Alice")], 1000);

        let report = reconcile_entries(&mut ledger, vec![member("A", "Alicia")], 1000);
        assert_eq!(report.updated, 1);
        assert_eq!(report.added, 0);

        let id = account_id("A");
        assert_eq!(
            ledger.accounts.get(&id),
            Some(&("Alicia".to_string(), 1000))
        );
        ledger.assert_invariant();
    }

    #[test]
    fn concurrent_duplicate_create_is_benign() {
        let mut ledger = FakeLedger::default();
        ledger.race_ids.insert(account_id("A"));

        let report = reconcile_entries(&mut ledger, vec![member("A", "Alice")], 1000);
        assert_eq!(report.added, 0);
        assert!(report.is_clean());
    }

    #[test]
    fn per_entry_failure_does_not_abort_the_drain() {
        let mut ledger = FakeLedger::default();
        ledger.fail_ids.insert(account_id("A"));

        let report = reconcile_entries(
            &mut ledger,
            vec![member("A", "Alice"), member("C", "Carol")],
            1000,
        );

        assert_eq!(report.added, 1);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].external_id, "A");
        assert!(ledger.accounts.contains_key(&account_id("C")));
    }

    #[test]
    fn blank_external_id_is_a_per_account_failure() {
        let mut ledger = FakeLedger::default();
        let report = reconcile_entries(&mut ledger, vec![member("  ", "Ghost")], 1000);

        assert_eq!(report.failures.len(), 1);
        assert!(ledger.accounts.is_empty());
    }

    #[derive(Debug)]
    struct FakeRoster {
        unavailable: bool,
        guilds: Vec<(String, Result<Vec<RosterEntry>, String>)>,
    }

    impl RosterSource for FakeRoster {
        fn guild_ids(&mut self) -> Result<Vec<String>, RosterError> {
            if self.unavailable {
                return Err(RosterError::Unavailable("directory offline".to_string()));
            }
            Ok(self.guilds.iter().map(|(id, _)| id.clone()).collect())
        }

        fn members(&mut self, guild_id: &str) -> Result<Vec<RosterEntry>, RosterError> {
            let Some((_, page)) = self.guilds.iter().find(|(id, _)| id == guild_id) else {
                return Err(RosterError::GuildFetch {
                    guild_id: guild_id.to_string(),
                    reason: "unknown guild".to_string(),
                });
            };
            match page {
                Ok(entries) => Ok(entries.clone()),
                Err(reason) => Err(RosterError::GuildFetch {
                    guild_id: guild_id.to_string(),
                    reason: reason.clone(),
                }),
            }
        }
    }

    #[test]
    fn failing_guild_is_recorded_and_others_still_process() {
        let mut ledger = FakeLedger::default();
        let mut roster = FakeRoster {
            unavailable: false,
            guilds: vec![
                ("g1".to_string(), Ok(vec![member("A", "Alice")])),
                ("g2".to_string(), Err("rate limited".to_string())),
                ("g3".to_string(), Ok(vec![member("C", "Carol")])),
            ],
        };

        let report = must(reconcile_source(&mut ledger, &mut roster, 500));
        assert_eq!(report.added, 2);
        assert_eq!(report.guild_failures.len(), 1);
        assert_eq!(report.guild_failures[0].guild_id, "g2");
    }

    #[test]
    fn unavailable_roster_is_fatal_and_touches_nothing() {
        let mut ledger = FakeLedger::default();
        let mut roster = FakeRoster {
            unavailable: true,
            guilds: Vec::new(),
        };

        let result = reconcile_source(&mut ledger, &mut roster, 500);
        assert!(matches!(result, Err(RosterError::Unavailable(_))));
        assert!(ledger.accounts.is_empty());
    }

    #[test]
    fn entry_kind_round_trips_through_its_tag() {
        assert_eq!(EntryKind::parse("initial-grant"), Some(EntryKind::InitialGrant));
        assert_eq!(EntryKind::parse("adjustment"), Some(EntryKind::Adjustment));
        assert_eq!(EntryKind::parse("wager-settlement"), None);
        assert_eq!(EntryKind::InitialGrant.as_str(), "initial-grant");
    }

    #[test]
    fn account_id_rejects_blank_input() {
        assert!(AccountId::new("   ").is_err());
        assert_eq!(account_id("  42  ").as_str(), "42");
    }

    #[test]
    fn rfc3339_parsing_requires_utc() {
        assert!(parse_rfc3339_utc("2026-08-01T12:00:00Z").is_ok());
        assert!(parse_rfc3339_utc("2026-08-01T12:00:00+02:00").is_err());
        assert!(parse_rfc3339_utc("not-a-timestamp").is_err());
    }
}
