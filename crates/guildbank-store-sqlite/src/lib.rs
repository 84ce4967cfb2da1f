#![allow(clippy::missing_errors_doc)]
#![allow(clippy::uninlined_format_args)]

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use guildbank_core::{
    format_rfc3339, now_utc, parse_rfc3339_utc, Account, AccountId, AccountLedger, EntryKind,
    LedgerEntry, LedgerError,
};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::info;
use ulid::Ulid;

#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    #[error("migration step {step} failed: {source}")]
    Step {
        step: &'static str,
        #[source]
        source: rusqlite::Error,
    },
    #[error("schema error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

/// One account whose cached balance disagrees with its ledger entry sum.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, Eq, PartialEq)]
pub struct BalanceDrift {
    pub account_id: AccountId,
    pub balance: i64,
    pub entry_sum: i64,
}

#[derive(Debug)]
enum MigrationTarget {
    Table {
        name: &'static str,
        create: &'static str,
    },
    Column {
        table: &'static str,
        column: &'static str,
        add: &'static str,
    },
}

struct MigrationStep {
    name: &'static str,
    target: MigrationTarget,
}

/// Additive-only schema evolution. Each step adds exactly one table or one
/// column; nothing is ever renamed or dropped.
const MIGRATIONS: &[MigrationStep] = &[
    MigrationStep {
        name: "create_accounts",
        target: MigrationTarget::Table {
            name: "accounts",
            create: "CREATE TABLE accounts (
                id TEXT PRIMARY KEY,
                display_name TEXT NOT NULL,
                balance INTEGER NOT NULL
            )",
        },
    },
    MigrationStep {
        name: "create_ledger_entries",
        target: MigrationTarget::Table {
            name: "ledger_entries",
            create: "CREATE TABLE ledger_entries (
                entry_seq INTEGER PRIMARY KEY AUTOINCREMENT,
                account_id TEXT NOT NULL REFERENCES accounts(id),
                amount INTEGER NOT NULL,
                kind TEXT NOT NULL,
                created_at TEXT NOT NULL
            )",
        },
    },
    MigrationStep {
        name: "create_matches",
        target: MigrationTarget::Table {
            name: "matches",
            create: "CREATE TABLE matches (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                created_at TEXT NOT NULL
            )",
        },
    },
    MigrationStep {
        name: "matches_add_match_type",
        target: MigrationTarget::Column {
            table: "matches",
            column: "match_type",
            add: "ALTER TABLE matches ADD COLUMN match_type TEXT",
        },
    },
    MigrationStep {
        name: "matches_add_player1_id",
        target: MigrationTarget::Column {
            table: "matches",
            column: "player1_id",
            add: "ALTER TABLE matches ADD COLUMN player1_id TEXT",
        },
    },
    MigrationStep {
        name: "matches_add_player2_id",
        target: MigrationTarget::Column {
            table: "matches",
            column: "player2_id",
            add: "ALTER TABLE matches ADD COLUMN player2_id TEXT",
        },
    },
    MigrationStep {
        name: "matches_add_game_type",
        target: MigrationTarget::Column {
            table: "matches",
            column: "game_type",
            add: "ALTER TABLE matches ADD COLUMN game_type TEXT",
        },
    },
    MigrationStep {
        name: "matches_add_event_title",
        target: MigrationTarget::Column {
            table: "matches",
            column: "event_title",
            add: "ALTER TABLE matches ADD COLUMN event_title TEXT",
        },
    },
    MigrationStep {
        name: "matches_add_event_description",
        target: MigrationTarget::Column {
            table: "matches",
            column: "event_description",
            add: "ALTER TABLE matches ADD COLUMN event_description TEXT",
        },
    },
    MigrationStep {
        name: "matches_add_participant_id",
        target: MigrationTarget::Column {
            table: "matches",
            column: "participant_id",
            add: "ALTER TABLE matches ADD COLUMN participant_id TEXT",
        },
    },
    MigrationStep {
        name: "matches_add_started_at",
        target: MigrationTarget::Column {
            table: "matches",
            column: "started_at",
            add: "ALTER TABLE matches ADD COLUMN started_at TEXT",
        },
    },
];

// Triggers and indexes are maintained with IF NOT EXISTS rather than as
// counted steps. The triggers make ledger_entries structurally append-only.
const SCHEMA_GUARDS: &str = r"
CREATE TRIGGER IF NOT EXISTS trg_ledger_entries_no_update
BEFORE UPDATE ON ledger_entries
BEGIN
  SELECT RAISE(FAIL, 'ledger_entries is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_ledger_entries_no_delete
BEFORE DELETE ON ledger_entries
BEGIN
  SELECT RAISE(FAIL, 'ledger_entries is append-only');
END;

CREATE INDEX IF NOT EXISTS idx_ledger_entries_account_seq
  ON ledger_entries(account_id, entry_seq);
";

pub struct SqliteLedgerStore {
    conn: Connection,
}

impl SqliteLedgerStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Applies every missing migration step inside one transaction and
    /// returns how many were applied. Safe to re-run; a second invocation
    /// applies zero steps. On any failure the whole invocation rolls back
    /// and the store is left exactly as it was.
    pub fn migrate(&mut self) -> Result<usize, SchemaError> {
        let tx = self.conn.transaction()?;

        tx.execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                step TEXT PRIMARY KEY,
                applied_at TEXT NOT NULL
            );",
        )?;

        let mut applied = 0_usize;
        for step in MIGRATIONS {
            let present = match &step.target {
                MigrationTarget::Table { name, .. } => table_exists(&tx, name)?,
                MigrationTarget::Column { table, column, .. } => {
                    table_exists(&tx, table)? && column_exists(&tx, table, column)?
                }
            };
            if present {
                continue;
            }

            let ddl = match &step.target {
                MigrationTarget::Table { create, .. } => create,
                MigrationTarget::Column { add, .. } => add,
            };
            tx.execute(ddl, []).map_err(|source| SchemaError::Step {
                step: step.name,
                source,
            })?;

            let now = format_rfc3339(now_utc())
                .map_err(|err| rusqlite::Error::ToSqlConversionFailure(Box::new(err)))?;
            tx.execute(
                "INSERT OR IGNORE INTO schema_migrations(step, applied_at) VALUES (?1, ?2)",
                params![step.name, now],
            )?;

            info!(step = step.name, "applied migration step");
            applied += 1;
        }

        tx.execute_batch(SCHEMA_GUARDS)?;
        tx.commit()?;
        Ok(applied)
    }

    pub fn get_account(&self, id: &AccountId) -> Result<Option<Account>, LedgerError> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, display_name, balance FROM accounts WHERE id = ?1")
            .map_err(storage)?;

        stmt.query_row(params![id.as_str()], parse_account_row)
            .optional()
            .map_err(storage)
    }

    pub fn list_accounts(&self) -> Result<Vec<Account>, LedgerError> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, display_name, balance FROM accounts ORDER BY id ASC")
            .map_err(storage)?;

        let rows = stmt.query_map([], parse_account_row).map_err(storage)?;
        collect_rows(rows)
    }

    /// Appends a signed adjustment entry and applies the same delta to the
    /// account's cached balance, as one transaction.
    pub fn append_adjustment(
        &mut self,
        id: &AccountId,
        amount: i64,
        kind: EntryKind,
    ) -> Result<LedgerEntry, LedgerError> {
        let created_at = now_utc();
        let created_at_text = format_rfc3339(created_at)?;

        let tx = self.conn.transaction().map_err(storage)?;
        let touched = tx
            .execute(
                "UPDATE accounts SET balance = balance + ?2 WHERE id = ?1",
                params![id.as_str(), amount],
            )
            .map_err(storage)?;
        if touched == 0 {
            return Err(LedgerError::AccountNotFound(id.clone()));
        }

        tx.execute(
            "INSERT INTO ledger_entries(account_id, amount, kind, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![id.as_str(), amount, kind.as_str(), created_at_text],
        )
        .map_err(storage)?;

        let entry_seq = tx.last_insert_rowid();
        tx.commit().map_err(storage)?;

        Ok(LedgerEntry {
            entry_seq,
            account_id: id.clone(),
            amount,
            kind,
            created_at,
        })
    }

    pub fn entries_for(
        &self,
        id: &AccountId,
        limit: Option<usize>,
    ) -> Result<Vec<LedgerEntry>, LedgerError> {
        let mut query = "SELECT entry_seq, account_id, amount, kind, created_at
             FROM ledger_entries
             WHERE account_id = ?1
             ORDER BY entry_seq ASC"
            .to_string();

        if let Some(raw_limit) = limit {
            query.push_str(" LIMIT ");
            query.push_str(&raw_limit.to_string());
        }

        let mut stmt = self.conn.prepare(&query).map_err(storage)?;
        let rows = stmt
            .query_map(params![id.as_str()], parse_entry_row)
            .map_err(storage)?;
        collect_rows(rows)
    }

    /// Diagnostic sum of an account's ledger entries; the account's cached
    /// balance must always equal this.
    pub fn sum_for(&self, id: &AccountId) -> Result<i64, LedgerError> {
        let exists = self
            .conn
            .query_row(
                "SELECT 1 FROM accounts WHERE id = ?1 LIMIT 1",
                params![id.as_str()],
                |_| Ok(()),
            )
            .optional()
            .map_err(storage)?
            .is_some();
        if !exists {
            return Err(LedgerError::AccountNotFound(id.clone()));
        }

        self.conn
            .query_row(
                "SELECT COALESCE(SUM(amount), 0) FROM ledger_entries WHERE account_id = ?1",
                params![id.as_str()],
                |row| row.get(0),
            )
            .map_err(storage)
    }

    /// Reports every account whose cached balance has drifted from the sum
    /// of its ledger entries. Empty means the core invariant holds.
    pub fn verify_balances(&self) -> Result<Vec<BalanceDrift>, LedgerError> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT accounts.id, accounts.balance, COALESCE(SUM(ledger_entries.amount), 0)
                 FROM accounts
                 LEFT JOIN ledger_entries ON ledger_entries.account_id = accounts.id
                 GROUP BY accounts.id
                 HAVING accounts.balance != COALESCE(SUM(ledger_entries.amount), 0)
                 ORDER BY accounts.id ASC",
            )
            .map_err(storage)?;

        let rows = stmt
            .query_map([], |row| {
                let id_raw: String = row.get(0)?;
                Ok(BalanceDrift {
                    account_id: parse_account_id(&id_raw)?,
                    balance: row.get(1)?,
                    entry_sum: row.get(2)?,
                })
            })
            .map_err(storage)?;
        collect_rows(rows)
    }

    /// Writes a consistent point-in-time copy of the store into `dir`.
    ///
    /// Uses `VACUUM INTO`, which produces a coherent image even with WAL
    /// journaling where a raw file copy could tear.
    pub fn write_snapshot(&self, dir: &Path) -> Result<PathBuf> {
        fs::create_dir_all(dir)
            .with_context(|| format!("failed to create snapshot dir {}", dir.display()))?;

        let name = format!(
            "guildbank-{}-{}.sqlite3",
            now_utc().unix_timestamp(),
            Ulid::new()
        );
        let target = dir.join(name);
        let target_str = target
            .to_str()
            .ok_or_else(|| anyhow!("snapshot path is not valid UTF-8: {}", target.display()))?;

        self.conn
            .execute("VACUUM INTO ?1", params![target_str])
            .with_context(|| format!("failed to snapshot store into {}", target.display()))?;

        Ok(target)
    }

    #[cfg(test)]
    fn connection(&self) -> &Connection {
        &self.conn
    }
}

impl AccountLedger for SqliteLedgerStore {
    fn account_exists(&mut self, id: &AccountId) -> Result<bool, LedgerError> {
        let row = self
            .conn
            .query_row(
                "SELECT 1 FROM accounts WHERE id = ?1 LIMIT 1",
                params![id.as_str()],
                |_| Ok(()),
            )
            .optional()
            .map_err(storage)?;
        Ok(row.is_some())
    }

    fn create_account_with_grant(
        &mut self,
        id: &AccountId,
        display_name: &str,
        initial_balance: i64,
    ) -> Result<i64, LedgerError> {
        let created_at = format_rfc3339(now_utc())?;

        let tx = self.conn.transaction().map_err(storage)?;
        tx.execute(
            "INSERT INTO accounts(id, display_name, balance) VALUES (?1, ?2, ?3)",
            params![id.as_str(), display_name, initial_balance],
        )
        .map_err(|err| {
            if is_constraint_violation(&err) {
                LedgerError::DuplicateAccount(id.clone())
            } else {
                storage(err)
            }
        })?;

        tx.execute(
            "INSERT INTO ledger_entries(account_id, amount, kind, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                id.as_str(),
                initial_balance,
                EntryKind::InitialGrant.as_str(),
                created_at
            ],
        )
        .map_err(storage)?;

        let entry_seq = tx.last_insert_rowid();
        tx.commit().map_err(storage)?;
        Ok(entry_seq)
    }

    fn update_display_name(
        &mut self,
        id: &AccountId,
        display_name: &str,
    ) -> Result<bool, LedgerError> {
        let changed = self
            .conn
            .execute(
                "UPDATE accounts SET display_name = ?2 WHERE id = ?1 AND display_name != ?2",
                params![id.as_str(), display_name],
            )
            .map_err(storage)?;
        if changed == 1 {
            return Ok(true);
        }

        let exists = self
            .conn
            .query_row(
                "SELECT 1 FROM accounts WHERE id = ?1 LIMIT 1",
                params![id.as_str()],
                |_| Ok(()),
            )
            .optional()
            .map_err(storage)?
            .is_some();
        if exists {
            Ok(false)
        } else {
            Err(LedgerError::AccountNotFound(id.clone()))
        }
    }
}

/// Deletes all but the `keep` most-recently-modified snapshot files in `dir`
/// and returns the removed paths.
pub fn prune_snapshots(dir: &Path, keep: usize) -> Result<Vec<PathBuf>> {
    let mut snapshots: Vec<(std::time::SystemTime, PathBuf)> = Vec::new();
    let entries = fs::read_dir(dir)
        .with_context(|| format!("failed to read snapshot dir {}", dir.display()))?;
    for entry in entries {
        let entry = entry.context("failed to read snapshot dir entry")?;
        let path = entry.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some("sqlite3") {
            continue;
        }
        let modified = entry
            .metadata()
            .and_then(|meta| meta.modified())
            .with_context(|| format!("failed to stat snapshot {}", path.display()))?;
        snapshots.push((modified, path));
    }

    snapshots.sort_by(|lhs, rhs| rhs.0.cmp(&lhs.0).then_with(|| rhs.1.cmp(&lhs.1)));

    let mut removed = Vec::new();
    for (_, path) in snapshots.into_iter().skip(keep) {
        fs::remove_file(&path)
            .with_context(|| format!("failed to remove old snapshot {}", path.display()))?;
        removed.push(path);
    }
    Ok(removed)
}

fn table_exists(conn: &Connection, table_name: &str) -> Result<bool, rusqlite::Error> {
    let exists = conn
        .query_row(
            "SELECT 1
             FROM sqlite_master
             WHERE type = 'table' AND name = ?1
             LIMIT 1",
            params![table_name],
            |_| Ok(()),
        )
        .optional()?
        .is_some();
    Ok(exists)
}

fn column_exists(
    conn: &Connection,
    table_name: &str,
    column_name: &str,
) -> Result<bool, rusqlite::Error> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table_name})"))?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column_name {
            return Ok(true);
        }
    }
    Ok(false)
}

fn storage(err: rusqlite::Error) -> LedgerError {
    LedgerError::Storage(err.to_string())
}

fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(failure, _)
            if failure.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

fn parse_account_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Account> {
    let id_raw: String = row.get(0)?;
    Ok(Account {
        id: parse_account_id(&id_raw)?,
        display_name: row.get(1)?,
        balance: row.get(2)?,
    })
}

fn parse_entry_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<LedgerEntry> {
    let account_id_raw: String = row.get(1)?;
    let kind_raw: String = row.get(3)?;
    let created_at_raw: String = row.get(4)?;

    let kind = EntryKind::parse(&kind_raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            3,
            rusqlite::types::Type::Text,
            Box::new(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("invalid entry kind: {kind_raw}"),
            )),
        )
    })?;
    let created_at = parse_rfc3339_utc(&created_at_raw).map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(
            4,
            rusqlite::types::Type::Text,
            Box::new(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                err.to_string(),
            )),
        )
    })?;

    Ok(LedgerEntry {
        entry_seq: row.get(0)?,
        account_id: parse_account_id(&account_id_raw)?,
        amount: row.get(2)?,
        kind,
        created_at,
    })
}

fn parse_account_id(raw: &str) -> rusqlite::Result<AccountId> {
    AccountId::new(raw).map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            Box::new(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                err.to_string(),
            )),
        )
    })
}

fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>>,
) -> Result<Vec<T>, LedgerError> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row.map_err(storage)?);
    }
    Ok(values)
}
