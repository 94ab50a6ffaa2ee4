//! Bet rows and aggregate queries over them.

use chrono::{DateTime, Utc};
use sqlx::SqliteConnection;

use crate::error::WagerError;
use crate::types::{Bet, BetId, BetStatus, EventId};

#[derive(Debug, sqlx::FromRow)]
struct BetRow {
    id: i64,
    event_id: i64,
    user_id: String,
    amount: i64,
    choice_index: i64,
    status: BetStatus,
    is_winner: bool,
    winning_amount: Option<i64>,
    flagged: bool,
    created_at: DateTime<Utc>,
}

impl From<BetRow> for Bet {
    fn from(row: BetRow) -> Self {
        Bet {
            id: row.id,
            event_id: row.event_id,
            user_id: row.user_id,
            amount: row.amount,
            choice_index: row.choice_index as usize,
            status: row.status,
            is_winner: row.is_winner,
            winning_amount: row.winning_amount,
            flagged: row.flagged,
            created_at: row.created_at,
        }
    }
}

const BET_COLUMNS: &str =
    "id, event_id, user_id, amount, choice_index, status, is_winner, winning_amount, flagged, created_at";

/// Data for inserting a new active bet.
#[derive(Debug, Clone)]
pub struct BetInsert<'a> {
    pub event_id: EventId,
    pub user_id: &'a str,
    pub amount: i64,
    pub choice_index: usize,
    pub flagged: bool,
}

pub async fn insert(conn: &mut SqliteConnection, bet: &BetInsert<'_>) -> Result<BetId, WagerError> {
    let now = Utc::now();
    let result = sqlx::query(
        r#"
        INSERT INTO bets (event_id, user_id, amount, choice_index, status, flagged, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(bet.event_id)
    .bind(bet.user_id)
    .bind(bet.amount)
    .bind(bet.choice_index as i64)
    .bind(BetStatus::Active)
    .bind(bet.flagged)
    .bind(now)
    .bind(now)
    .execute(&mut *conn)
    .await?;
    Ok(result.last_insert_rowid())
}

pub async fn fetch(conn: &mut SqliteConnection, id: BetId) -> Result<Option<Bet>, WagerError> {
    let row: Option<BetRow> = sqlx::query_as(&format!("SELECT {BET_COLUMNS} FROM bets WHERE id = ?"))
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(row.map(Bet::from))
}

/// Every bet of an event, in placement order.
pub async fn list_by_event(
    conn: &mut SqliteConnection,
    event_id: EventId,
) -> Result<Vec<Bet>, WagerError> {
    let rows: Vec<BetRow> = sqlx::query_as(&format!(
        "SELECT {BET_COLUMNS} FROM bets WHERE event_id = ? ORDER BY id ASC"
    ))
    .bind(event_id)
    .fetch_all(&mut *conn)
    .await?;
    Ok(rows.into_iter().map(Bet::from).collect())
}

pub async fn list_by_choice(
    conn: &mut SqliteConnection,
    event_id: EventId,
    choice_index: usize,
) -> Result<Vec<Bet>, WagerError> {
    let rows: Vec<BetRow> = sqlx::query_as(&format!(
        "SELECT {BET_COLUMNS} FROM bets WHERE event_id = ? AND choice_index = ? ORDER BY id ASC"
    ))
    .bind(event_id)
    .bind(choice_index as i64)
    .fetch_all(&mut *conn)
    .await?;
    Ok(rows.into_iter().map(Bet::from).collect())
}

pub async fn list_by_user(
    conn: &mut SqliteConnection,
    user_id: &str,
) -> Result<Vec<Bet>, WagerError> {
    let rows: Vec<BetRow> = sqlx::query_as(&format!(
        "SELECT {BET_COLUMNS} FROM bets WHERE user_id = ? ORDER BY id DESC"
    ))
    .bind(user_id)
    .fetch_all(&mut *conn)
    .await?;
    Ok(rows.into_iter().map(Bet::from).collect())
}

pub async fn count_active_for_user(
    conn: &mut SqliteConnection,
    event_id: EventId,
    user_id: &str,
) -> Result<i64, WagerError> {
    let (count,): (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM bets WHERE event_id = ? AND user_id = ? AND status = ?",
    )
    .bind(event_id)
    .bind(user_id)
    .bind(BetStatus::Active)
    .fetch_one(&mut *conn)
    .await?;
    Ok(count)
}

/// Statuses whose stake stays in the pot. Settlement moves bets from
/// active to won/lost without changing the event aggregates.
const IN_POT: &str = "status IN ('active', 'won', 'lost')";

/// Sum and count of the bets in the pot, straight from the bet rows.
pub async fn pot_totals(
    conn: &mut SqliteConnection,
    event_id: EventId,
) -> Result<(i64, i64), WagerError> {
    let (sum, count): (i64, i64) = sqlx::query_as(&format!(
        "SELECT COALESCE(SUM(amount), 0), COUNT(*) FROM bets WHERE event_id = ? AND {IN_POT}"
    ))
    .bind(event_id)
    .fetch_one(&mut *conn)
    .await?;
    Ok((sum, count))
}

/// Pot stake grouped by choice: `(choice_index, amount, count)`.
pub async fn pot_by_choice(
    conn: &mut SqliteConnection,
    event_id: EventId,
) -> Result<Vec<(usize, i64, i64)>, WagerError> {
    let rows: Vec<(i64, i64, i64)> = sqlx::query_as(&format!(
        r#"
        SELECT choice_index, SUM(amount), COUNT(*)
        FROM bets WHERE event_id = ? AND {IN_POT}
        GROUP BY choice_index ORDER BY choice_index
        "#
    ))
    .bind(event_id)
    .fetch_all(&mut *conn)
    .await?;
    Ok(rows
        .into_iter()
        .map(|(index, amount, count)| (index as usize, amount, count))
        .collect())
}

pub async fn set_status(
    conn: &mut SqliteConnection,
    id: BetId,
    status: BetStatus,
) -> Result<(), WagerError> {
    sqlx::query("UPDATE bets SET status = ?, updated_at = ? WHERE id = ?")
        .bind(status)
        .bind(Utc::now())
        .bind(id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Move every active bet of an event to `status`. Returns how many moved.
pub async fn set_status_for_active(
    conn: &mut SqliteConnection,
    event_id: EventId,
    status: BetStatus,
) -> Result<u64, WagerError> {
    let result = sqlx::query(
        "UPDATE bets SET status = ?, updated_at = ? WHERE event_id = ? AND status = ?",
    )
    .bind(status)
    .bind(Utc::now())
    .bind(event_id)
    .bind(BetStatus::Active)
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected())
}

pub async fn set_winner_flag(
    conn: &mut SqliteConnection,
    id: BetId,
    is_winner: bool,
) -> Result<(), WagerError> {
    sqlx::query("UPDATE bets SET is_winner = ?, updated_at = ? WHERE id = ?")
        .bind(is_winner)
        .bind(Utc::now())
        .bind(id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Mark the active bets of an event as winners exactly when they are on
/// `choice_index`. Returns the number of winners.
pub async fn mark_winners_by_choice(
    conn: &mut SqliteConnection,
    event_id: EventId,
    choice_index: usize,
) -> Result<u64, WagerError> {
    sqlx::query(
        r#"
        UPDATE bets SET is_winner = (choice_index = ?), updated_at = ?
        WHERE event_id = ? AND status = ?
        "#,
    )
    .bind(choice_index as i64)
    .bind(Utc::now())
    .bind(event_id)
    .bind(BetStatus::Active)
    .execute(&mut *conn)
    .await?;

    let (winners,): (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM bets WHERE event_id = ? AND status = ? AND is_winner = 1",
    )
    .bind(event_id)
    .bind(BetStatus::Active)
    .fetch_one(&mut *conn)
    .await?;
    Ok(winners as u64)
}

/// Clear every winner flag on the event's active bets.
pub async fn clear_winners(
    conn: &mut SqliteConnection,
    event_id: EventId,
) -> Result<(), WagerError> {
    sqlx::query("UPDATE bets SET is_winner = 0, updated_at = ? WHERE event_id = ? AND status = ?")
        .bind(Utc::now())
        .bind(event_id)
        .bind(BetStatus::Active)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Record the settlement result of one bet.
pub async fn settle(
    conn: &mut SqliteConnection,
    id: BetId,
    status: BetStatus,
    winning_amount: Option<i64>,
) -> Result<(), WagerError> {
    sqlx::query("UPDATE bets SET status = ?, winning_amount = ?, updated_at = ? WHERE id = ?")
        .bind(status)
        .bind(winning_amount)
        .bind(Utc::now())
        .bind(id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
