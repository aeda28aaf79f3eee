//! Settlement Storage
//! Mission: persist tickets, legs and escrow holds with SQLite
//!
//! Cross-request coordination lives here, not in process memory: the
//! `(user, ticket)` unique constraints on escrow holds and purchases are
//! the primary defense against double-charging, and the `pending`-guarded
//! UPDATEs are what make overlapping settlement passes safe.

use crate::models::{
    EscrowHold, EscrowStatus, FinishedMatch, Leg, Listing, MatchKind, ResultStatus, Ticket,
};
use anyhow::{bail, Context, Result};
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension};

/// A leg as supplied at ticket-creation time.
#[derive(Debug, Clone)]
pub struct NewLeg {
    pub match_id: i64,
    pub match_kind: MatchKind,
    pub prediction: String,
    pub odds: f64,
    pub match_date: Option<DateTime<Utc>>,
}

/// True for SQLite unique-constraint violations. Purchase code treats these
/// as an expected concurrent-conflict signal, not a fatal error.
pub fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == rusqlite::ErrorCode::ConstraintViolation
                && (e.extended_code == 2067 || e.extended_code == 1555)
    )
}

/// Ticket/leg/escrow storage with SQLite backend.
pub struct SettlementStore {
    db_path: String,
}

impl SettlementStore {
    pub fn new(db_path: &str) -> Result<Self> {
        let store = Self {
            db_path: db_path.to_string(),
        };
        store.init_db()?;
        Ok(store)
    }

    fn init_db(&self) -> Result<()> {
        let conn = self.open()?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS tickets (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL,
                title TEXT NOT NULL,
                combined_odds REAL NOT NULL,
                price REAL NOT NULL DEFAULT 0,
                is_marketplace INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL DEFAULT 'active',
                result TEXT NOT NULL DEFAULT 'pending',
                created_at TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS legs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                ticket_id INTEGER NOT NULL REFERENCES tickets(id) ON DELETE CASCADE,
                match_id INTEGER NOT NULL,
                match_kind TEXT NOT NULL DEFAULT 'fixture',
                prediction TEXT NOT NULL,
                odds REAL NOT NULL,
                result TEXT NOT NULL DEFAULT 'pending',
                match_date TEXT
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS escrow_holds (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL,
                ticket_id INTEGER NOT NULL,
                amount REAL NOT NULL,
                reference TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'held',
                created_at TEXT NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_escrow_buyer_ticket
             ON escrow_holds(user_id, ticket_id)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS purchases (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL,
                ticket_id INTEGER NOT NULL,
                price REAL NOT NULL,
                purchased_at TEXT NOT NULL,
                UNIQUE(user_id, ticket_id)
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS listings (
                ticket_id INTEGER PRIMARY KEY,
                price REAL NOT NULL,
                status TEXT NOT NULL DEFAULT 'active',
                purchase_count INTEGER NOT NULL DEFAULT 0
            )",
            [],
        )?;

        init_match_tables(&conn)?;
        Ok(())
    }

    pub fn open(&self) -> Result<Connection> {
        let conn = Connection::open(&self.db_path).context("Failed to open settlement database")?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Ok(conn)
    }

    // -------------------------------------------------------------------
    // Tickets & legs
    // -------------------------------------------------------------------

    /// Create a ticket with its legs. Combined odds are the product of the
    /// leg odds, captured here and never recomputed.
    pub fn create_ticket(
        &self,
        user_id: i64,
        title: &str,
        price: f64,
        is_marketplace: bool,
        legs: &[NewLeg],
    ) -> Result<Ticket> {
        if legs.is_empty() || legs.len() > 20 {
            bail!("A ticket needs between 1 and 20 legs, got {}", legs.len());
        }
        if price < 0.0 {
            bail!("Ticket price must be >= 0");
        }
        for leg in legs {
            if leg.odds < 1.0 {
                bail!("Leg odds must be >= 1.0, got {}", leg.odds);
            }
        }
        let combined_odds: f64 = legs.iter().map(|l| l.odds).product();

        let mut conn = self.open()?;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO tickets (user_id, title, combined_odds, price, is_marketplace, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                user_id,
                title,
                combined_odds,
                price,
                is_marketplace as i64,
                Utc::now().to_rfc3339()
            ],
        )?;
        let ticket_id = tx.last_insert_rowid();
        for leg in legs {
            tx.execute(
                "INSERT INTO legs (ticket_id, match_id, match_kind, prediction, odds, match_date)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    ticket_id,
                    leg.match_id,
                    leg.match_kind.as_str(),
                    leg.prediction,
                    leg.odds,
                    leg.match_date.map(|d| d.to_rfc3339()),
                ],
            )?;
        }
        tx.commit()?;

        self.ticket(ticket_id)?
            .context("Ticket row missing after insert")
    }

    pub fn ticket(&self, ticket_id: i64) -> Result<Option<Ticket>> {
        let conn = self.open()?;
        ticket_in(&conn, ticket_id)
    }

    pub fn legs_for_ticket(&self, ticket_id: i64) -> Result<Vec<Leg>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT id, ticket_id, match_id, match_kind, prediction, odds, result, match_date
             FROM legs WHERE ticket_id = ?1 ORDER BY id",
        )?;
        let legs = stmt
            .query_map(params![ticket_id], leg_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(legs)
    }

    /// Every leg still awaiting a result, across all tickets.
    pub fn pending_legs(&self) -> Result<Vec<Leg>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT id, ticket_id, match_id, match_kind, prediction, odds, result, match_date
             FROM legs WHERE result = 'pending' ORDER BY id",
        )?;
        let legs = stmt
            .query_map([], leg_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(legs)
    }

    /// Persist a leg result. Guarded on `pending` so a leg settles exactly
    /// once; returns false when another pass got there first.
    pub fn set_leg_result(&self, leg_id: i64, result: ResultStatus) -> Result<bool> {
        let conn = self.open()?;
        let updated = conn.execute(
            "UPDATE legs SET result = ?2 WHERE id = ?1 AND result = 'pending'",
            params![leg_id, result.as_str()],
        )?;
        Ok(updated > 0)
    }

    pub fn pending_tickets(&self) -> Result<Vec<Ticket>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT id, user_id, title, combined_odds, price, is_marketplace, status, result
             FROM tickets WHERE result = 'pending' ORDER BY id",
        )?;
        let tickets = stmt
            .query_map([], ticket_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(tickets)
    }

    /// Flip a ticket's result and status in one `pending`-guarded UPDATE.
    /// This single statement is the mutual exclusion between overlapping
    /// settlement passes; returns false when the ticket is already settled.
    pub fn settle_ticket(&self, ticket_id: i64, result: ResultStatus) -> Result<bool> {
        let conn = self.open()?;
        let updated = conn.execute(
            "UPDATE tickets SET result = ?2, status = ?2 WHERE id = ?1 AND result = 'pending'",
            params![ticket_id, result.as_str()],
        )?;
        Ok(updated > 0)
    }

    // -------------------------------------------------------------------
    // Escrow holds
    // -------------------------------------------------------------------

    /// Insert an escrow hold inside a caller transaction. A unique-constraint
    /// failure here means a concurrent purchase won the race.
    pub fn create_escrow_in(
        &self,
        conn: &Connection,
        user_id: i64,
        ticket_id: i64,
        amount: f64,
        reference: &str,
    ) -> Result<i64, rusqlite::Error> {
        conn.execute(
            "INSERT INTO escrow_holds (user_id, ticket_id, amount, reference, status, created_at)
             VALUES (?1, ?2, ?3, ?4, 'held', ?5)",
            params![user_id, ticket_id, amount, reference, Utc::now().to_rfc3339()],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Holds still awaiting distribution for a ticket.
    pub fn held_escrows(&self, ticket_id: i64) -> Result<Vec<EscrowHold>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT id, user_id, ticket_id, amount, reference, status
             FROM escrow_holds WHERE ticket_id = ?1 AND status = 'held' ORDER BY id",
        )?;
        let holds = stmt
            .query_map(params![ticket_id], escrow_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(holds)
    }

    pub fn escrows_for_ticket(&self, ticket_id: i64) -> Result<Vec<EscrowHold>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT id, user_id, ticket_id, amount, reference, status
             FROM escrow_holds WHERE ticket_id = ?1 ORDER BY id",
        )?;
        let holds = stmt
            .query_map(params![ticket_id], escrow_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(holds)
    }

    /// Move a hold to its terminal state. Guarded on `held`: a hold never
    /// transitions twice.
    pub fn mark_escrow(&self, hold_id: i64, status: EscrowStatus) -> Result<bool> {
        let conn = self.open()?;
        let updated = conn.execute(
            "UPDATE escrow_holds SET status = ?2 WHERE id = ?1 AND status = 'held'",
            params![hold_id, status.as_str()],
        )?;
        Ok(updated > 0)
    }

    /// Tickets that settled but still have money in escrow. Happens when a
    /// pass dies between flipping the ticket and distributing the holds;
    /// the regular pending-ticket scan never revisits these.
    pub fn settled_tickets_with_held_escrow(&self) -> Result<Vec<Ticket>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT DISTINCT t.id, t.user_id, t.title, t.combined_odds, t.price,
                    t.is_marketplace, t.status, t.result
             FROM tickets t
             JOIN escrow_holds e ON e.ticket_id = t.id
             WHERE t.result != 'pending' AND e.status = 'held'
             ORDER BY t.id",
        )?;
        let tickets = stmt
            .query_map([], ticket_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(tickets)
    }

    // -------------------------------------------------------------------
    // Purchases & listings
    // -------------------------------------------------------------------

    pub fn insert_purchase_in(
        &self,
        conn: &Connection,
        user_id: i64,
        ticket_id: i64,
        price: f64,
    ) -> Result<i64, rusqlite::Error> {
        conn.execute(
            "INSERT INTO purchases (user_id, ticket_id, price, purchased_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![user_id, ticket_id, price, Utc::now().to_rfc3339()],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn has_purchase_in(
        &self,
        conn: &Connection,
        user_id: i64,
        ticket_id: i64,
    ) -> Result<bool, rusqlite::Error> {
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM purchases WHERE user_id = ?1 AND ticket_id = ?2",
                params![user_id, ticket_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub fn create_listing(&self, ticket_id: i64, price: f64) -> Result<()> {
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO listings (ticket_id, price, status) VALUES (?1, ?2, 'active')",
            params![ticket_id, price],
        )?;
        Ok(())
    }

    pub fn active_listing_in(
        &self,
        conn: &Connection,
        ticket_id: i64,
    ) -> Result<Option<Listing>, rusqlite::Error> {
        conn.query_row(
            "SELECT ticket_id, price, status, purchase_count
             FROM listings WHERE ticket_id = ?1 AND status = 'active'",
            params![ticket_id],
            |row| {
                Ok(Listing {
                    ticket_id: row.get(0)?,
                    price: row.get(1)?,
                    status: row.get(2)?,
                    purchase_count: row.get(3)?,
                })
            },
        )
        .optional()
    }

    pub fn increment_purchase_count_in(
        &self,
        conn: &Connection,
        ticket_id: i64,
    ) -> Result<(), rusqlite::Error> {
        conn.execute(
            "UPDATE listings SET purchase_count = purchase_count + 1 WHERE ticket_id = ?1",
            params![ticket_id],
        )?;
        Ok(())
    }

    pub fn listing(&self, ticket_id: i64) -> Result<Option<Listing>> {
        let conn = self.open()?;
        Ok(self.active_listing_in(&conn, ticket_id)?)
    }
}

/// Read a ticket inside an existing connection/transaction.
pub fn ticket_in(conn: &Connection, ticket_id: i64) -> Result<Option<Ticket>> {
    let ticket = conn
        .query_row(
            "SELECT id, user_id, title, combined_odds, price, is_marketplace, status, result
             FROM tickets WHERE id = ?1",
            params![ticket_id],
            ticket_from_row,
        )
        .optional()?;
    Ok(ticket)
}

fn ticket_from_row(row: &rusqlite::Row<'_>) -> Result<Ticket, rusqlite::Error> {
    let result: String = row.get(7)?;
    Ok(Ticket {
        id: row.get(0)?,
        user_id: row.get(1)?,
        title: row.get(2)?,
        combined_odds: row.get(3)?,
        price: row.get(4)?,
        is_marketplace: row.get::<_, i64>(5)? != 0,
        status: row.get(6)?,
        result: ResultStatus::from_str(&result).unwrap_or(ResultStatus::Pending),
    })
}

fn leg_from_row(row: &rusqlite::Row<'_>) -> Result<Leg, rusqlite::Error> {
    let kind: String = row.get(3)?;
    let result: String = row.get(6)?;
    let match_date: Option<String> = row.get(7)?;
    Ok(Leg {
        id: row.get(0)?,
        ticket_id: row.get(1)?,
        match_id: row.get(2)?,
        match_kind: MatchKind::from_str(&kind).unwrap_or(MatchKind::Fixture),
        prediction: row.get(4)?,
        odds: row.get(5)?,
        result: ResultStatus::from_str(&result).unwrap_or(ResultStatus::Pending),
        match_date: match_date
            .and_then(|d| DateTime::parse_from_rfc3339(&d).ok())
            .map(|d| d.with_timezone(&Utc)),
    })
}

fn escrow_from_row(row: &rusqlite::Row<'_>) -> Result<EscrowHold, rusqlite::Error> {
    let status: String = row.get(5)?;
    Ok(EscrowHold {
        id: row.get(0)?,
        user_id: row.get(1)?,
        ticket_id: row.get(2)?,
        amount: row.get(3)?,
        reference: row.get(4)?,
        status: EscrowStatus::from_str(&status).unwrap_or(EscrowStatus::Held),
    })
}

// =============================================================================
// FIXTURE / EVENT SOURCE
// =============================================================================

/// Read-only view of finished matches. The engine never writes scores; it
/// only consumes them (and corrects a stale status, see below).
pub trait FixtureSource {
    /// Finished matches with both scores present. Implementations must
    /// include matches whose status was never flipped by the upstream
    /// provider but whose kickoff is older than the grace window.
    fn list_finished(&self, grace_window_hours: i64) -> Result<Vec<FinishedMatch>>;
}

/// Fixture/event tables in the shared SQLite database.
pub struct SqliteFixtureSource {
    db_path: String,
}

impl SqliteFixtureSource {
    pub fn new(db_path: &str) -> Result<Self> {
        let source = Self {
            db_path: db_path.to_string(),
        };
        let conn = Connection::open(&source.db_path)?;
        init_match_tables(&conn)?;
        Ok(source)
    }

    fn open(&self) -> Result<Connection> {
        Connection::open(&self.db_path).context("Failed to open fixture database")
    }

    /// Upsert one match row. Used by score ingestion (out of scope here)
    /// and by tests.
    pub fn upsert_match(
        &self,
        kind: MatchKind,
        id: i64,
        home_name: &str,
        away_name: &str,
        home_score: Option<i64>,
        away_score: Option<i64>,
        status: &str,
        match_date: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.open()?;
        conn.execute(
            &format!(
                "INSERT INTO {} (id, home_name, away_name, home_score, away_score, status, match_date)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(id) DO UPDATE SET
                    home_score = excluded.home_score,
                    away_score = excluded.away_score,
                    status = excluded.status",
                table_for(kind)
            ),
            params![
                id,
                home_name,
                away_name,
                home_score,
                away_score,
                status,
                match_date.to_rfc3339()
            ],
        )?;
        Ok(())
    }

    pub fn match_status(&self, kind: MatchKind, id: i64) -> Result<Option<String>> {
        let conn = self.open()?;
        let status = conn
            .query_row(
                &format!("SELECT status FROM {} WHERE id = ?1", table_for(kind)),
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(status)
    }
}

impl FixtureSource for SqliteFixtureSource {
    fn list_finished(&self, grace_window_hours: i64) -> Result<Vec<FinishedMatch>> {
        let conn = self.open()?;
        let cutoff = (Utc::now() - Duration::hours(grace_window_hours)).to_rfc3339();
        let mut finished = Vec::new();

        for kind in [MatchKind::Fixture, MatchKind::Event] {
            let table = table_for(kind);

            let mut stmt = conn.prepare(&format!(
                "SELECT id, home_name, away_name, home_score, away_score FROM {}
                 WHERE home_score IS NOT NULL AND away_score IS NOT NULL
                   AND (status = 'FT' OR match_date < ?1)
                 ORDER BY id",
                table
            ))?;
            let rows = stmt
                .query_map(params![cutoff], |row| {
                    Ok(FinishedMatch {
                        id: row.get(0)?,
                        kind,
                        home_name: row.get(1)?,
                        away_name: row.get(2)?,
                        home_score: row.get(3)?,
                        away_score: row.get(4)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;

            // Providers sometimes never flip the status flag; once the grace
            // window has passed, correct the stored status ourselves.
            conn.execute(
                &format!(
                    "UPDATE {} SET status = 'FT'
                     WHERE home_score IS NOT NULL AND away_score IS NOT NULL
                       AND status != 'FT' AND match_date < ?1",
                    table
                ),
                params![cutoff],
            )?;

            finished.extend(rows);
        }

        Ok(finished)
    }
}

fn table_for(kind: MatchKind) -> &'static str {
    match kind {
        MatchKind::Fixture => "fixtures",
        MatchKind::Event => "sport_events",
    }
}

fn init_match_tables(conn: &Connection) -> Result<()> {
    for table in ["fixtures", "sport_events"] {
        conn.execute(
            &format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    id INTEGER PRIMARY KEY,
                    home_name TEXT NOT NULL,
                    away_name TEXT NOT NULL,
                    home_score INTEGER,
                    away_score INTEGER,
                    status TEXT NOT NULL DEFAULT 'NS',
                    match_date TEXT NOT NULL
                )",
                table
            ),
            [],
        )?;
    }
    Ok(())
}
