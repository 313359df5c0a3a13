//! SQLite storage implementation.
//!
//! The connection sits behind a `tokio::sync::Mutex`, so all ledger
//! read-modify-write sequences are serialized: two concurrent reservations
//! against the same account cannot interleave between the balance check and
//! the debit. Locks are only held for the in-memory/SQL bookkeeping, never
//! across network calls.

use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::models::*;
use crate::error::{Error, Result};
use crate::metrics;

/// Parse an RFC 3339 datetime string into a `chrono::DateTime<Utc>`.
///
/// Returns a `rusqlite::Error` on parse failure instead of panicking,
/// so it is safe to use inside `query_row` / `query_map` closures.
fn parse_datetime_utc(s: &str) -> rusqlite::Result<chrono::DateTime<Utc>> {
    chrono::DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })
}

fn parse_kind(s: &str) -> rusqlite::Result<TransactionKind> {
    TransactionKind::from_str(s).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            e.into(),
        )
    })
}

/// SQLite-based storage.
#[derive(Clone)]
pub struct SqliteStorage {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStorage {
    /// Open or create a database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::init_schema_sync(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema_sync(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn init_schema_sync(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            -- WAL for concurrent reads during writes
            PRAGMA journal_mode = WAL;
            -- Wait up to 5 seconds when the database is locked
            PRAGMA busy_timeout = 5000;
            PRAGMA synchronous = NORMAL;
            PRAGMA foreign_keys = ON;

            CREATE TABLE IF NOT EXISTS accounts (
                id TEXT PRIMARY KEY,
                email TEXT NOT NULL UNIQUE,
                credits INTEGER NOT NULL DEFAULT 0,
                language TEXT NOT NULL DEFAULT 'en',
                style TEXT NOT NULL DEFAULT 'basic',
                units TEXT NOT NULL DEFAULT 'metric',
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS transactions (
                id TEXT PRIMARY KEY,
                account_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                amount INTEGER NOT NULL,
                description TEXT NOT NULL,
                created_at TEXT NOT NULL,
                FOREIGN KEY (account_id) REFERENCES accounts(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS reports (
                id TEXT PRIMARY KEY,
                account_id TEXT NOT NULL,
                lat REAL NOT NULL,
                lon REAL NOT NULL,
                content TEXT NOT NULL,
                created_at TEXT NOT NULL,
                FOREIGN KEY (account_id) REFERENCES accounts(id) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_transactions_account
                ON transactions(account_id, created_at DESC);
            CREATE INDEX IF NOT EXISTS idx_reports_account
                ON reports(account_id, created_at DESC);
            "#,
        )?;
        Ok(())
    }

    // ========================================================================
    // Account operations
    // ========================================================================

    /// Create an account with the default starting balance and settings.
    pub async fn create_account(&self, email: &str) -> Result<Account> {
        let account = Account {
            id: Uuid::new_v4().to_string(),
            email: email.to_string(),
            credits: STARTING_CREDITS,
            language: "en".to_string(),
            style: "basic".to_string(),
            units: "metric".to_string(),
            created_at: Utc::now(),
        };

        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO accounts (id, email, credits, language, style, units, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                account.id,
                account.email,
                account.credits,
                account.language,
                account.style,
                account.units,
                account.created_at.to_rfc3339()
            ],
        )?;
        Ok(account)
    }

    pub async fn get_account(&self, account_id: &str) -> Result<Option<Account>> {
        let conn = self.conn.lock().await;
        Self::get_account_sync(&conn, account_id)
    }

    fn get_account_sync(conn: &Connection, account_id: &str) -> Result<Option<Account>> {
        let account = conn
            .query_row(
                "SELECT id, email, credits, language, style, units, created_at
                 FROM accounts WHERE id = ?1",
                [account_id],
                |row| {
                    Ok(Account {
                        id: row.get(0)?,
                        email: row.get(1)?,
                        credits: row.get(2)?,
                        language: row.get(3)?,
                        style: row.get(4)?,
                        units: row.get(5)?,
                        created_at: parse_datetime_utc(&row.get::<_, String>(6)?)?,
                    })
                },
            )
            .optional()?;
        Ok(account)
    }

    /// Update the opaque interpretation settings on an account.
    pub async fn update_account_settings(
        &self,
        account_id: &str,
        language: &str,
        style: &str,
        units: &str,
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        let updated = conn.execute(
            "UPDATE accounts SET language = ?1, style = ?2, units = ?3 WHERE id = ?4",
            params![language, style, units, account_id],
        )?;
        if updated == 0 {
            return Err(Error::AccountNotFound(account_id.to_string()));
        }
        Ok(())
    }

    /// Current credit balance.
    pub async fn balance(&self, account_id: &str) -> Result<i64> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT credits FROM accounts WHERE id = ?1",
            [account_id],
            |row| row.get(0),
        )
        .optional()?
        .ok_or_else(|| Error::AccountNotFound(account_id.to_string()))
    }

    // ========================================================================
    // Credit ledger
    //
    // Every balance mutation commits together with exactly one transaction
    // row, inside a single SQL transaction. Transaction rows are never
    // updated or deleted.
    // ========================================================================

    /// Atomically reserve `cost` credits: fails with `InsufficientCredits`
    /// (and no change) when the balance cannot cover it, otherwise debits the
    /// balance and appends a `debit` entry of `-cost`. Returns the new balance.
    pub async fn reserve_credits(
        &self,
        account_id: &str,
        cost: i64,
        description: &str,
    ) -> Result<i64> {
        if cost <= 0 {
            return Err(Error::Validation("cost must be positive".to_string()));
        }

        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;

        let balance: i64 = tx
            .query_row(
                "SELECT credits FROM accounts WHERE id = ?1",
                [account_id],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| Error::AccountNotFound(account_id.to_string()))?;

        if balance < cost {
            // Dropping the transaction rolls back; no row is written.
            return Err(Error::InsufficientCredits {
                required: cost,
                available: balance,
            });
        }

        tx.execute(
            "UPDATE accounts SET credits = credits - ?1 WHERE id = ?2",
            params![cost, account_id],
        )?;
        Self::append_entry_sync(&tx, account_id, TransactionKind::Debit, -cost, description)?;
        tx.commit()?;

        metrics::record_ledger_op("reserve", cost);
        Ok(balance - cost)
    }

    /// Reverse a prior reservation: credits the balance by `cost` and appends
    /// a `refund` entry of `+cost`. Trusts the caller to refund only what it
    /// reserved, exactly once. Returns the new balance.
    pub async fn refund_credits(
        &self,
        account_id: &str,
        cost: i64,
        description: &str,
    ) -> Result<i64> {
        if cost <= 0 {
            return Err(Error::Validation("cost must be positive".to_string()));
        }

        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;

        let balance: i64 = tx
            .query_row(
                "SELECT credits FROM accounts WHERE id = ?1",
                [account_id],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| Error::AccountNotFound(account_id.to_string()))?;

        tx.execute(
            "UPDATE accounts SET credits = credits + ?1 WHERE id = ?2",
            params![cost, account_id],
        )?;
        Self::append_entry_sync(&tx, account_id, TransactionKind::Refund, cost, description)?;
        tx.commit()?;

        metrics::record_ledger_op("refund", cost);
        Ok(balance + cost)
    }

    /// Add purchased credits. Requires `amount > 0`. Returns the new balance.
    pub async fn purchase_credits(
        &self,
        account_id: &str,
        amount: i64,
        description: &str,
    ) -> Result<i64> {
        if amount <= 0 {
            return Err(Error::Validation("amount must be positive".to_string()));
        }

        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;

        let balance: i64 = tx
            .query_row(
                "SELECT credits FROM accounts WHERE id = ?1",
                [account_id],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| Error::AccountNotFound(account_id.to_string()))?;

        tx.execute(
            "UPDATE accounts SET credits = credits + ?1 WHERE id = ?2",
            params![amount, account_id],
        )?;
        Self::append_entry_sync(
            &tx,
            account_id,
            TransactionKind::Purchase,
            amount,
            description,
        )?;
        tx.commit()?;

        metrics::record_ledger_op("purchase", amount);
        Ok(balance + amount)
    }

    fn append_entry_sync(
        conn: &Connection,
        account_id: &str,
        kind: TransactionKind,
        amount: i64,
        description: &str,
    ) -> Result<()> {
        conn.execute(
            "INSERT INTO transactions (id, account_id, kind, amount, description, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                Uuid::new_v4().to_string(),
                account_id,
                kind.to_string(),
                amount,
                description,
                Utc::now().to_rfc3339()
            ],
        )?;
        Ok(())
    }

    /// Ledger history for an account, newest first.
    pub async fn list_transactions(&self, account_id: &str) -> Result<Vec<LedgerEntry>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, account_id, kind, amount, description, created_at
             FROM transactions WHERE account_id = ?1
             ORDER BY created_at DESC, id",
        )?;
        let entries = stmt
            .query_map([account_id], |row| {
                Ok(LedgerEntry {
                    id: row.get(0)?,
                    account_id: row.get(1)?,
                    kind: parse_kind(&row.get::<_, String>(2)?)?,
                    amount: row.get(3)?,
                    description: row.get(4)?,
                    created_at: parse_datetime_utc(&row.get::<_, String>(5)?)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(entries)
    }

    /// Sum of all ledger amounts for an account (used for audits and tests;
    /// the balance column must always agree with it).
    pub async fn ledger_sum(&self, account_id: &str) -> Result<i64> {
        let conn = self.conn.lock().await;
        let sum: i64 = conn.query_row(
            "SELECT COALESCE(SUM(amount), 0) FROM transactions WHERE account_id = ?1",
            [account_id],
            |row| row.get(0),
        )?;
        Ok(sum)
    }

    // ========================================================================
    // Report operations
    // ========================================================================

    /// Persist a generated report. Called only after generation succeeds.
    pub async fn save_report(
        &self,
        account_id: &str,
        lat: f64,
        lon: f64,
        content: &str,
    ) -> Result<Report> {
        let report = Report {
            id: Uuid::new_v4().to_string(),
            account_id: account_id.to_string(),
            lat,
            lon,
            content: content.to_string(),
            created_at: Utc::now(),
        };

        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO reports (id, account_id, lat, lon, content, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                report.id,
                report.account_id,
                report.lat,
                report.lon,
                report.content,
                report.created_at.to_rfc3339()
            ],
        )?;
        Ok(report)
    }

    pub async fn list_reports(&self, account_id: &str) -> Result<Vec<Report>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, account_id, lat, lon, content, created_at
             FROM reports WHERE account_id = ?1
             ORDER BY created_at DESC, id",
        )?;
        let reports = stmt
            .query_map([account_id], |row| {
                Ok(Report {
                    id: row.get(0)?,
                    account_id: row.get(1)?,
                    lat: row.get(2)?,
                    lon: row.get(3)?,
                    content: row.get(4)?,
                    created_at: parse_datetime_utc(&row.get::<_, String>(5)?)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(reports)
    }

    pub async fn delete_report(&self, report_id: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        let deleted = conn.execute("DELETE FROM reports WHERE id = ?1", [report_id])?;
        if deleted == 0 {
            return Err(Error::ReportNotFound(report_id.to_string()));
        }
        Ok(())
    }

    // ========================================================================
    // Health
    // ========================================================================

    pub async fn check_health(&self) -> Result<DatabaseHealth> {
        let conn = self.conn.lock().await;

        let foreign_keys_enabled: bool =
            conn.query_row("PRAGMA foreign_keys", [], |row| row.get::<_, i64>(0))? == 1;
        let integrity_check: String =
            conn.query_row("PRAGMA integrity_check", [], |row| row.get(0))?;
        let journal_mode: String =
            conn.query_row("PRAGMA journal_mode", [], |row| row.get(0))?;
        let account_count: u64 =
            conn.query_row("SELECT COUNT(*) FROM accounts", [], |row| row.get::<_, i64>(0))? as u64;

        Ok(DatabaseHealth {
            foreign_keys_enabled,
            integrity_check,
            account_count,
            journal_mode,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn storage_with_account(credits: i64) -> (SqliteStorage, Account) {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let account = storage.create_account("pilot@example.com").await.unwrap();
        // Adjust upward via a ledger op so the transaction log stays
        // consistent with the balance column. Adjust downward by setting the
        // column directly: tests that start below STARTING_CREDITS expect a
        // ledger with no debit entries, and the starting grant itself has no
        // ledger row either.
        if credits > STARTING_CREDITS {
            storage
                .purchase_credits(&account.id, credits - STARTING_CREDITS, "test top-up")
                .await
                .unwrap();
        } else if credits < STARTING_CREDITS {
            let conn = storage.conn.lock().await;
            conn.execute(
                "UPDATE accounts SET credits = ?1 WHERE id = ?2",
                params![credits, account.id],
            )
            .unwrap();
        }
        (storage, account)
    }

    #[tokio::test]
    async fn test_reserve_debits_balance_and_writes_entry() {
        let (storage, account) = storage_with_account(3).await;

        let balance = storage
            .reserve_credits(&account.id, 1, "AI interpretation for 46.5,8.1")
            .await
            .unwrap();
        assert_eq!(balance, 2);

        let entries = storage.list_transactions(&account.id).await.unwrap();
        let debit = entries
            .iter()
            .find(|e| e.kind == TransactionKind::Debit)
            .unwrap();
        assert_eq!(debit.amount, -1);
    }

    #[tokio::test]
    async fn test_reserve_insufficient_makes_no_change() {
        let (storage, account) = storage_with_account(2).await;

        let err = storage
            .reserve_credits(&account.id, 5, "route analysis")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::InsufficientCredits {
                required: 5,
                available: 2
            }
        ));

        assert_eq!(storage.balance(&account.id).await.unwrap(), 2);
        let entries = storage.list_transactions(&account.id).await.unwrap();
        assert!(entries.iter().all(|e| e.kind != TransactionKind::Debit));
    }

    #[tokio::test]
    async fn test_refund_exactness() {
        let (storage, account) = storage_with_account(3).await;

        storage
            .reserve_credits(&account.id, 3, "route analysis")
            .await
            .unwrap();
        assert_eq!(storage.balance(&account.id).await.unwrap(), 0);

        let balance = storage
            .refund_credits(&account.id, 3, "Refund: route analysis failed")
            .await
            .unwrap();
        assert_eq!(balance, 3);
    }

    #[tokio::test]
    async fn test_purchase_requires_positive_amount() {
        let (storage, account) = storage_with_account(3).await;
        assert!(matches!(
            storage.purchase_credits(&account.id, 0, "zero").await,
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            storage.purchase_credits(&account.id, -5, "negative").await,
            Err(Error::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_balance_conservation() {
        // Final balance = starting balance + sum of all ledger amounts.
        let (storage, account) = storage_with_account(3).await;

        storage
            .purchase_credits(&account.id, 10, "purchase")
            .await
            .unwrap();
        storage
            .reserve_credits(&account.id, 4, "route")
            .await
            .unwrap();
        storage
            .refund_credits(&account.id, 4, "refund")
            .await
            .unwrap();
        storage
            .reserve_credits(&account.id, 2, "two points")
            .await
            .unwrap();

        let balance = storage.balance(&account.id).await.unwrap();
        let sum = storage.ledger_sum(&account.id).await.unwrap();
        assert_eq!(balance, STARTING_CREDITS + sum);
        assert_eq!(balance, 11);
    }

    #[tokio::test]
    async fn test_racing_reservations_cannot_overdraw() {
        // Two concurrent reservations that individually look affordable:
        // exactly one must succeed.
        let (storage, account) = storage_with_account(5).await;

        let (a, b) = tokio::join!(
            storage.reserve_credits(&account.id, 5, "first"),
            storage.reserve_credits(&account.id, 5, "second"),
        );

        let successes = [&a, &b].iter().filter(|r| r.is_ok()).count();
        assert_eq!(successes, 1);
        assert!(matches!(
            [a, b].into_iter().find(|r| r.is_err()).unwrap().unwrap_err(),
            Error::InsufficientCredits { .. }
        ));
        assert_eq!(storage.balance(&account.id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_reports_crud() {
        let (storage, account) = storage_with_account(3).await;

        let report = storage
            .save_report(&account.id, 46.5, 8.1, "Good thermals expected.")
            .await
            .unwrap();

        let reports = storage.list_reports(&account.id).await.unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].content, "Good thermals expected.");

        storage.delete_report(&report.id).await.unwrap();
        assert!(storage.list_reports(&account.id).await.unwrap().is_empty());
        assert!(matches!(
            storage.delete_report(&report.id).await,
            Err(Error::ReportNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_unknown_account() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        assert!(matches!(
            storage.reserve_credits("nope", 1, "x").await,
            Err(Error::AccountNotFound(_))
        ));
        assert!(matches!(
            storage.balance("nope").await,
            Err(Error::AccountNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_ledger_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.db");

        let account_id = {
            let storage = SqliteStorage::open(&path).unwrap();
            let account = storage.create_account("pilot@example.com").await.unwrap();
            storage
                .reserve_credits(&account.id, 1, "AI interpretation for 46.5,8.1")
                .await
                .unwrap();
            account.id
        };

        let storage = SqliteStorage::open(&path).unwrap();
        assert_eq!(storage.balance(&account_id).await.unwrap(), 2);
        let entries = storage.list_transactions(&account_id).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].amount, -1);
    }

    #[tokio::test]
    async fn test_health() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let health = storage.check_health().await.unwrap();
        assert!(health.foreign_keys_enabled);
        assert_eq!(health.integrity_check, "ok");
    }
}
