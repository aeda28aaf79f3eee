//! Wallet Ledger
//! Mission: move balances through an append-only journal, never directly
//!
//! Every balance change is a journal row; the `(user, type, reference)`
//! unique index makes credits and debits idempotent per reference, which is
//! what lets a retried settlement pass touch the same ticket without
//! double-paying anyone.

use crate::models::round2;
use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use std::fmt;
use tracing::warn;

/// Ledger failures the purchase flow branches on.
#[derive(Debug)]
pub enum LedgerError {
    InsufficientBalance {
        user_id: i64,
        balance: f64,
        requested: f64,
    },
    DuplicateReference {
        user_id: i64,
        reference: String,
    },
    Storage(anyhow::Error),
}

impl fmt::Display for LedgerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LedgerError::InsufficientBalance {
                user_id,
                balance,
                requested,
            } => write!(
                f,
                "insufficient balance for user {}: have {:.2}, need {:.2}",
                user_id, balance, requested
            ),
            LedgerError::DuplicateReference { user_id, reference } => write!(
                f,
                "duplicate ledger reference '{}' for user {}",
                reference, user_id
            ),
            LedgerError::Storage(e) => write!(f, "ledger storage error: {}", e),
        }
    }
}

impl std::error::Error for LedgerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LedgerError::Storage(e) => e.source(),
            _ => None,
        }
    }
}

impl From<rusqlite::Error> for LedgerError {
    fn from(e: rusqlite::Error) -> Self {
        LedgerError::Storage(e.into())
    }
}

/// Wallet storage with SQLite backend. Balances round to 2 decimal places
/// after every mutation.
pub struct WalletLedger {
    db_path: String,
}

impl WalletLedger {
    pub fn new(db_path: &str) -> Result<Self> {
        let ledger = Self {
            db_path: db_path.to_string(),
        };
        ledger.init_db()?;
        Ok(ledger)
    }

    fn init_db(&self) -> Result<()> {
        let conn = self.open()?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS wallets (
                user_id INTEGER PRIMARY KEY,
                balance REAL NOT NULL DEFAULT 0,
                currency TEXT NOT NULL DEFAULT 'USD',
                updated_at TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS wallet_transactions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL,
                type TEXT NOT NULL,
                amount REAL NOT NULL,
                currency TEXT NOT NULL DEFAULT 'USD',
                status TEXT NOT NULL DEFAULT 'completed',
                reference TEXT,
                description TEXT,
                balance_affecting INTEGER NOT NULL DEFAULT 1,
                metadata TEXT,
                created_at TEXT NOT NULL
            )",
            [],
        )?;

        // Idempotency: one journal row per (user, type, reference)
        conn.execute(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_wallet_tx_reference
             ON wallet_transactions(user_id, type, reference)
             WHERE reference IS NOT NULL",
            [],
        )?;

        Ok(())
    }

    pub fn open(&self) -> Result<Connection> {
        Connection::open(&self.db_path).context("Failed to open wallet database")
    }

    /// Current balance, creating the wallet row lazily.
    pub fn balance(&self, user_id: i64) -> Result<f64> {
        let conn = self.open()?;
        ensure_wallet(&conn, user_id)?;
        let balance: f64 = conn.query_row(
            "SELECT balance FROM wallets WHERE user_id = ?1",
            params![user_id],
            |row| row.get(0),
        )?;
        Ok(balance)
    }

    /// Debit inside its own transaction.
    pub fn debit(
        &self,
        user_id: i64,
        amount: f64,
        kind: &str,
        reference: &str,
        description: &str,
    ) -> Result<(), LedgerError> {
        let mut conn = self.open().map_err(LedgerError::Storage)?;
        let tx = conn.transaction()?;
        self.debit_in(&tx, user_id, amount, kind, reference, description)?;
        tx.commit()?;
        Ok(())
    }

    /// Debit inside a caller-provided transaction (the purchase flow).
    pub fn debit_in(
        &self,
        conn: &Connection,
        user_id: i64,
        amount: f64,
        kind: &str,
        reference: &str,
        description: &str,
    ) -> Result<(), LedgerError> {
        ensure_wallet(conn, user_id)?;
        if reference_exists(conn, user_id, kind, reference)? {
            return Err(LedgerError::DuplicateReference {
                user_id,
                reference: reference.to_string(),
            });
        }

        let balance: f64 = conn.query_row(
            "SELECT balance FROM wallets WHERE user_id = ?1",
            params![user_id],
            |row| row.get(0),
        )?;
        if balance < amount {
            return Err(LedgerError::InsufficientBalance {
                user_id,
                balance,
                requested: amount,
            });
        }

        conn.execute(
            "UPDATE wallets SET balance = ?2, updated_at = ?3 WHERE user_id = ?1",
            params![user_id, round2(balance - amount), Utc::now().to_rfc3339()],
        )?;
        insert_journal(conn, user_id, -amount, kind, reference, description, true, None)?;
        Ok(())
    }

    /// Credit inside its own transaction. Idempotent: a duplicate
    /// `(user, kind, reference)` is a logged no-op, never a double credit.
    pub fn credit(
        &self,
        user_id: i64,
        amount: f64,
        kind: &str,
        reference: &str,
        description: &str,
    ) -> Result<(), LedgerError> {
        let mut conn = self.open().map_err(LedgerError::Storage)?;
        let tx = conn.transaction()?;
        self.credit_in(&tx, user_id, amount, kind, reference, description)?;
        tx.commit()?;
        Ok(())
    }

    /// Credit inside a caller-provided transaction.
    pub fn credit_in(
        &self,
        conn: &Connection,
        user_id: i64,
        amount: f64,
        kind: &str,
        reference: &str,
        description: &str,
    ) -> Result<(), LedgerError> {
        ensure_wallet(conn, user_id)?;
        if reference_exists(conn, user_id, kind, reference)? {
            warn!(
                user_id,
                kind, reference, "Duplicate credit reference, skipping (already applied)"
            );
            return Ok(());
        }

        conn.execute(
            "UPDATE wallets SET balance = ?2, updated_at = ?3 WHERE user_id = ?1",
            params![
                user_id,
                round2(wallet_balance(conn, user_id)? + amount),
                Utc::now().to_rfc3339()
            ],
        )?;
        insert_journal(conn, user_id, amount, kind, reference, description, true, None)?;
        Ok(())
    }

    /// Journal-only entry that never touches a balance. Used for the
    /// platform commission deducted from a seller's gross payout — the
    /// balance impact is already captured by the reduced payout credit.
    pub fn record_transaction(
        &self,
        user_id: i64,
        amount: f64,
        kind: &str,
        reference: &str,
        description: &str,
        metadata: Option<serde_json::Value>,
    ) -> Result<(), LedgerError> {
        let conn = self.open().map_err(LedgerError::Storage)?;
        if reference_exists(&conn, user_id, kind, reference)? {
            warn!(
                user_id,
                kind, reference, "Duplicate journal reference, skipping (already recorded)"
            );
            return Ok(());
        }
        insert_journal(
            &conn,
            user_id,
            amount,
            kind,
            reference,
            description,
            false,
            metadata,
        )?;
        Ok(())
    }

    /// Journal rows for a user, newest first.
    pub fn transactions(&self, user_id: i64, limit: usize) -> Result<Vec<JournalEntry>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT type, amount, reference, description, balance_affecting
             FROM wallet_transactions WHERE user_id = ?1
             ORDER BY id DESC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![user_id, limit as i64], |row| {
                Ok(JournalEntry {
                    kind: row.get(0)?,
                    amount: row.get(1)?,
                    reference: row.get(2)?,
                    description: row.get(3)?,
                    balance_affecting: row.get::<_, i64>(4)? != 0,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

/// One journal row as read back for inspection/reporting.
#[derive(Debug, Clone)]
pub struct JournalEntry {
    pub kind: String,
    pub amount: f64,
    pub reference: Option<String>,
    pub description: Option<String>,
    pub balance_affecting: bool,
}

fn ensure_wallet(conn: &Connection, user_id: i64) -> Result<(), rusqlite::Error> {
    conn.execute(
        "INSERT OR IGNORE INTO wallets (user_id, balance, updated_at) VALUES (?1, 0, ?2)",
        params![user_id, Utc::now().to_rfc3339()],
    )?;
    Ok(())
}

fn wallet_balance(conn: &Connection, user_id: i64) -> Result<f64, rusqlite::Error> {
    conn.query_row(
        "SELECT balance FROM wallets WHERE user_id = ?1",
        params![user_id],
        |row| row.get(0),
    )
}

fn reference_exists(
    conn: &Connection,
    user_id: i64,
    kind: &str,
    reference: &str,
) -> Result<bool, rusqlite::Error> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM wallet_transactions
             WHERE user_id = ?1 AND type = ?2 AND reference = ?3",
            params![user_id, kind, reference],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

#[allow(clippy::too_many_arguments)]
fn insert_journal(
    conn: &Connection,
    user_id: i64,
    amount: f64,
    kind: &str,
    reference: &str,
    description: &str,
    balance_affecting: bool,
    metadata: Option<serde_json::Value>,
) -> Result<(), rusqlite::Error> {
    conn.execute(
        "INSERT INTO wallet_transactions
            (user_id, type, amount, reference, description, balance_affecting, metadata, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            user_id,
            kind,
            amount,
            reference,
            description,
            balance_affecting as i64,
            metadata.map(|m| m.to_string()),
            Utc::now().to_rfc3339(),
        ],
    )?;
    Ok(())
}
