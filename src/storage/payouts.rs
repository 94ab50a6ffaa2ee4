//! Payout rows.

use chrono::{DateTime, Utc};
use sqlx::SqliteConnection;

use crate::error::WagerError;
use crate::types::{BetId, EventId, Payout, PayoutId, PayoutStatus};

#[derive(Debug, sqlx::FromRow)]
struct PayoutRow {
    id: i64,
    event_id: i64,
    bet_id: i64,
    user_id: String,
    amount: i64,
    fee_amount: i64,
    status: PayoutStatus,
    method: String,
    expires_at: DateTime<Utc>,
    processed_by: Option<String>,
    processed_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl From<PayoutRow> for Payout {
    fn from(row: PayoutRow) -> Self {
        Payout {
            id: row.id,
            event_id: row.event_id,
            bet_id: row.bet_id,
            user_id: row.user_id,
            amount: row.amount,
            fee_amount: row.fee_amount,
            status: row.status,
            method: row.method,
            expires_at: row.expires_at,
            processed_by: row.processed_by,
            processed_at: row.processed_at,
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PayoutInsert<'a> {
    pub event_id: EventId,
    pub bet_id: BetId,
    pub user_id: &'a str,
    pub amount: i64,
    pub fee_amount: i64,
    pub method: &'a str,
    pub expires_at: DateTime<Utc>,
}

/// Insert a pending payout. The schema allows one payout per bet, so a
/// second insert for the same bet fails instead of duplicating money.
pub async fn insert(
    conn: &mut SqliteConnection,
    payout: &PayoutInsert<'_>,
) -> Result<PayoutId, WagerError> {
    let result = sqlx::query(
        r#"
        INSERT INTO payouts (event_id, bet_id, user_id, amount, fee_amount, status, method, expires_at, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(payout.event_id)
    .bind(payout.bet_id)
    .bind(payout.user_id)
    .bind(payout.amount)
    .bind(payout.fee_amount)
    .bind(PayoutStatus::Pending)
    .bind(payout.method)
    .bind(payout.expires_at)
    .bind(Utc::now())
    .execute(&mut *conn)
    .await?;
    Ok(result.last_insert_rowid())
}

pub async fn fetch(conn: &mut SqliteConnection, id: PayoutId) -> Result<Option<Payout>, WagerError> {
    let row: Option<PayoutRow> = sqlx::query_as("SELECT * FROM payouts WHERE id = ?")
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(row.map(Payout::from))
}

pub async fn list_by_event(
    conn: &mut SqliteConnection,
    event_id: EventId,
) -> Result<Vec<Payout>, WagerError> {
    let rows: Vec<PayoutRow> =
        sqlx::query_as("SELECT * FROM payouts WHERE event_id = ? ORDER BY bet_id ASC")
            .bind(event_id)
            .fetch_all(&mut *conn)
            .await?;
    Ok(rows.into_iter().map(Payout::from).collect())
}

pub async fn count_by_event(
    conn: &mut SqliteConnection,
    event_id: EventId,
) -> Result<i64, WagerError> {
    let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM payouts WHERE event_id = ?")
        .bind(event_id)
        .fetch_one(&mut *conn)
        .await?;
    Ok(count)
}

/// Move a payout out of `pending`. Returns false when it was no longer pending.
pub async fn resolve(
    conn: &mut SqliteConnection,
    id: PayoutId,
    status: PayoutStatus,
    processed_by: &str,
) -> Result<bool, WagerError> {
    let result = sqlx::query(
        r#"
        UPDATE payouts SET status = ?, processed_by = ?, processed_at = ?
        WHERE id = ? AND status = ?
        "#,
    )
    .bind(status)
    .bind(processed_by)
    .bind(Utc::now())
    .bind(id)
    .bind(PayoutStatus::Pending)
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Expire every pending payout whose deadline is at or before `now`.
pub async fn expire_overdue(
    conn: &mut SqliteConnection,
    now: DateTime<Utc>,
) -> Result<u64, WagerError> {
    let result = sqlx::query(
        r#"
        UPDATE payouts SET status = ?, processed_by = 'system', processed_at = ?
        WHERE status = ? AND expires_at <= ?
        "#,
    )
    .bind(PayoutStatus::Expired)
    .bind(now)
    .bind(PayoutStatus::Pending)
    .bind(now)
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected())
}
