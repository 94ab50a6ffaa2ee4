//! Persistence layer.
//!
//! SQLite record store (sqlx) for events, bets, payouts and the lifecycle
//! audit trail. The store is the single owner of durable state.
//!
//! Every mutation of an event's aggregate state runs inside an event-scoped
//! write transaction opened with [`Store::begin_event`]. Its first statement
//! writes the event row, so SQLite hands that transaction the write lock up
//! front: concurrent mutations of the same event serialize, and reads made
//! inside the transaction see exactly the state the following writes apply to.

pub mod bets;
pub mod events;
pub mod payouts;

use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Sqlite, SqlitePool, Transaction};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

use crate::error::WagerError;
use crate::types::{Event, EventId};

pub type Tx = Transaction<'static, Sqlite>;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS events (
        id                INTEGER PRIMARY KEY AUTOINCREMENT,
        name              TEXT    NOT NULL,
        event_type        TEXT    NOT NULL,
        status            TEXT    NOT NULL,
        paused_from       TEXT,
        scheduled_time    TEXT,
        choices           TEXT    NOT NULL,
        min_bet           INTEGER NOT NULL,
        max_bet           INTEGER NOT NULL,
        limit_per_user    INTEGER NOT NULL,
        fee_percent       TEXT    NOT NULL,
        total_bets_amount INTEGER NOT NULL DEFAULT 0,
        total_bets_count  INTEGER NOT NULL DEFAULT 0,
        winner_approved   INTEGER NOT NULL DEFAULT 0,
        winning_choice    INTEGER,
        winning_label     TEXT,
        winners_count     INTEGER NOT NULL DEFAULT 0,
        losers_count      INTEGER NOT NULL DEFAULT 0,
        total_payout      INTEGER NOT NULL DEFAULT 0,
        card_message_id   TEXT,
        created_by        TEXT    NOT NULL,
        created_at        TEXT    NOT NULL,
        updated_at        TEXT    NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS bets (
        id             INTEGER PRIMARY KEY AUTOINCREMENT,
        event_id       INTEGER NOT NULL REFERENCES events(id) ON DELETE CASCADE,
        user_id        TEXT    NOT NULL,
        amount         INTEGER NOT NULL CHECK (amount > 0),
        choice_index   INTEGER NOT NULL CHECK (choice_index >= 0),
        status         TEXT    NOT NULL,
        is_winner      INTEGER NOT NULL DEFAULT 0,
        winning_amount INTEGER,
        flagged        INTEGER NOT NULL DEFAULT 0,
        created_at     TEXT    NOT NULL,
        updated_at     TEXT    NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_bets_event_status ON bets (event_id, status)",
    "CREATE INDEX IF NOT EXISTS idx_bets_user ON bets (user_id)",
    r#"
    CREATE TABLE IF NOT EXISTS payouts (
        id           INTEGER PRIMARY KEY AUTOINCREMENT,
        event_id     INTEGER NOT NULL REFERENCES events(id) ON DELETE CASCADE,
        bet_id       INTEGER NOT NULL UNIQUE REFERENCES bets(id) ON DELETE CASCADE,
        user_id      TEXT    NOT NULL,
        amount       INTEGER NOT NULL CHECK (amount >= 0),
        fee_amount   INTEGER NOT NULL CHECK (fee_amount >= 0),
        status       TEXT    NOT NULL,
        method       TEXT    NOT NULL,
        expires_at   TEXT    NOT NULL,
        processed_by TEXT,
        processed_at TEXT,
        created_at   TEXT    NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_payouts_event ON payouts (event_id)",
    r#"
    CREATE TABLE IF NOT EXISTS event_audit (
        id          INTEGER PRIMARY KEY AUTOINCREMENT,
        event_id    INTEGER NOT NULL REFERENCES events(id) ON DELETE CASCADE,
        actor       TEXT    NOT NULL,
        action      TEXT    NOT NULL,
        from_status TEXT    NOT NULL,
        to_status   TEXT    NOT NULL,
        detail      TEXT,
        at          TEXT    NOT NULL
    )
    "#,
];

/// Handle to the record store. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (creating if needed) the database at `url` and apply the schema.
    pub async fn connect(
        url: &str,
        max_connections: u32,
        busy_timeout: Duration,
    ) -> Result<Self, WagerError> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .foreign_keys(true)
            .busy_timeout(busy_timeout);

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        info!(url, max_connections, "Record store ready");
        Ok(store)
    }

    /// Private in-memory database. A single connection, since every
    /// SQLite in-memory connection is its own database.
    pub async fn in_memory() -> Result<Self, WagerError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<(), WagerError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        debug!(tables = 4, "Schema applied");
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Plain transaction, for writes that do not touch an event aggregate.
    pub async fn begin(&self) -> Result<Tx, WagerError> {
        Ok(self.pool.begin().await?)
    }

    /// Open a write transaction scoped to one event and load the event
    /// inside it. Dropping the returned transaction without committing
    /// rolls back everything done through it.
    pub async fn begin_event(&self, event_id: EventId) -> Result<(Tx, Event), WagerError> {
        let mut tx = self.pool.begin().await?;

        let claimed = sqlx::query("UPDATE events SET updated_at = ? WHERE id = ?")
            .bind(Utc::now())
            .bind(event_id)
            .execute(&mut *tx)
            .await?;
        if claimed.rows_affected() == 0 {
            return Err(WagerError::not_found("event", event_id));
        }

        let event = events::fetch(&mut tx, event_id)
            .await?
            .ok_or_else(|| WagerError::not_found("event", event_id))?;
        Ok((tx, event))
    }

    /// Read an event outside any write transaction.
    pub async fn event(&self, event_id: EventId) -> Result<Event, WagerError> {
        let mut conn = self.pool.acquire().await?;
        events::fetch(&mut conn, event_id)
            .await?
            .ok_or_else(|| WagerError::not_found("event", event_id))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
