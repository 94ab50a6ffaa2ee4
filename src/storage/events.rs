//! Event rows and the lifecycle audit trail.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::SqliteConnection;
use std::str::FromStr;

use crate::error::WagerError;
use crate::types::{
    AuditEntry, BettingTerms, Event, EventId, EventStatus, EventType, NewEvent, Outcome,
};

#[derive(Debug, sqlx::FromRow)]
struct EventRow {
    id: i64,
    name: String,
    event_type: EventType,
    status: EventStatus,
    paused_from: Option<EventStatus>,
    scheduled_time: Option<DateTime<Utc>>,
    choices: String,
    min_bet: i64,
    max_bet: i64,
    limit_per_user: i64,
    fee_percent: String,
    total_bets_amount: i64,
    total_bets_count: i64,
    winner_approved: bool,
    winning_choice: Option<i64>,
    winning_label: Option<String>,
    winners_count: i64,
    losers_count: i64,
    total_payout: i64,
    card_message_id: Option<String>,
    created_by: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<EventRow> for Event {
    type Error = WagerError;

    fn try_from(row: EventRow) -> Result<Self, Self::Error> {
        let choices: Vec<String> = serde_json::from_str(&row.choices)?;
        let fee_percent = Decimal::from_str(&row.fee_percent).map_err(|e| {
            WagerError::Computation(format!("event {} has bad fee_percent: {e}", row.id))
        })?;
        let winning_outcome = match (row.winning_choice, row.winning_label) {
            (Some(index), _) => Some(Outcome::Choice(index as usize)),
            (None, Some(label)) => Some(Outcome::Custom(label)),
            (None, None) => None,
        };

        Ok(Event {
            id: row.id,
            name: row.name,
            event_type: row.event_type,
            status: row.status,
            paused_from: row.paused_from,
            scheduled_time: row.scheduled_time,
            choices,
            terms: BettingTerms {
                min_bet: row.min_bet,
                max_bet: row.max_bet,
                limit_per_user: row.limit_per_user.max(0) as u32,
                fee_percent,
            },
            total_bets_amount: row.total_bets_amount,
            total_bets_count: row.total_bets_count,
            winner_approved: row.winner_approved,
            winning_outcome,
            winners_count: row.winners_count,
            losers_count: row.losers_count,
            total_payout: row.total_payout,
            card_message_id: row.card_message_id,
            created_by: row.created_by,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// Insert a new event in `pending` status. Returns its id.
pub async fn insert(
    conn: &mut SqliteConnection,
    new: &NewEvent,
    created_by: &str,
) -> Result<EventId, WagerError> {
    let now = Utc::now();
    let choices = serde_json::to_string(&new.choices)?;
    let result = sqlx::query(
        r#"
        INSERT INTO events (
            name, event_type, status, scheduled_time, choices,
            min_bet, max_bet, limit_per_user, fee_percent,
            created_by, created_at, updated_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&new.name)
    .bind(new.event_type)
    .bind(EventStatus::Pending)
    .bind(new.scheduled_time)
    .bind(choices)
    .bind(new.terms.min_bet)
    .bind(new.terms.max_bet)
    .bind(i64::from(new.terms.limit_per_user))
    .bind(new.terms.fee_percent.to_string())
    .bind(created_by)
    .bind(now)
    .bind(now)
    .execute(&mut *conn)
    .await?;
    Ok(result.last_insert_rowid())
}

pub async fn fetch(
    conn: &mut SqliteConnection,
    id: EventId,
) -> Result<Option<Event>, WagerError> {
    let row: Option<EventRow> = sqlx::query_as("SELECT * FROM events WHERE id = ?")
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;
    row.map(Event::try_from).transpose()
}

/// Events in any of the given statuses, newest first.
pub async fn list_by_status(
    conn: &mut SqliteConnection,
    statuses: &[EventStatus],
) -> Result<Vec<Event>, WagerError> {
    let mut builder = sqlx::QueryBuilder::new("SELECT * FROM events WHERE status IN (");
    let mut separated = builder.separated(", ");
    for status in statuses {
        separated.push_bind(*status);
    }
    separated.push_unseparated(") ORDER BY id DESC");

    let rows: Vec<EventRow> = builder.build_query_as().fetch_all(&mut *conn).await?;
    rows.into_iter().map(Event::try_from).collect()
}

pub async fn set_status(
    conn: &mut SqliteConnection,
    id: EventId,
    status: EventStatus,
    paused_from: Option<EventStatus>,
) -> Result<(), WagerError> {
    sqlx::query("UPDATE events SET status = ?, paused_from = ?, updated_at = ? WHERE id = ?")
        .bind(status)
        .bind(paused_from)
        .bind(Utc::now())
        .bind(id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Apply a signed change to the running pot aggregates. Both columns
/// change in the same statement.
pub async fn adjust_totals(
    conn: &mut SqliteConnection,
    id: EventId,
    amount_delta: i64,
    count_delta: i64,
) -> Result<(), WagerError> {
    let result = sqlx::query(
        r#"
        UPDATE events
        SET total_bets_amount = total_bets_amount + ?,
            total_bets_count  = total_bets_count + ?,
            updated_at = ?
        WHERE id = ?
          AND total_bets_amount + ? >= 0
          AND total_bets_count + ? >= 0
        "#,
    )
    .bind(amount_delta)
    .bind(count_delta)
    .bind(Utc::now())
    .bind(id)
    .bind(amount_delta)
    .bind(count_delta)
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() == 0 {
        return Err(WagerError::Computation(format!(
            "event {id} aggregates would go negative ({amount_delta:+}, {count_delta:+})"
        )));
    }
    Ok(())
}

pub async fn set_schedule(
    conn: &mut SqliteConnection,
    id: EventId,
    scheduled_time: DateTime<Utc>,
) -> Result<(), WagerError> {
    sqlx::query("UPDATE events SET scheduled_time = ?, updated_at = ? WHERE id = ?")
        .bind(scheduled_time)
        .bind(Utc::now())
        .bind(id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

pub async fn set_card_message(
    conn: &mut SqliteConnection,
    id: EventId,
    message_id: &str,
) -> Result<(), WagerError> {
    sqlx::query("UPDATE events SET card_message_id = ? WHERE id = ?")
        .bind(message_id)
        .bind(id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Settlement columns written by finalize.
#[derive(Debug, Clone)]
pub struct FinalizeRecord {
    pub outcome: Outcome,
    pub outcome_label: String,
    pub winners_count: i64,
    pub losers_count: i64,
    pub total_payout: i64,
}

/// Close the event. Only succeeds on an event that is not yet approved.
pub async fn mark_finalized(
    conn: &mut SqliteConnection,
    id: EventId,
    record: &FinalizeRecord,
) -> Result<(), WagerError> {
    let winning_choice = match record.outcome {
        Outcome::Choice(index) => Some(index as i64),
        Outcome::Custom(_) => None,
    };
    let result = sqlx::query(
        r#"
        UPDATE events
        SET status = ?, paused_from = NULL, winner_approved = 1,
            winning_choice = ?, winning_label = ?,
            winners_count = ?, losers_count = ?, total_payout = ?,
            updated_at = ?
        WHERE id = ? AND winner_approved = 0
        "#,
    )
    .bind(EventStatus::Completed)
    .bind(winning_choice)
    .bind(&record.outcome_label)
    .bind(record.winners_count)
    .bind(record.losers_count)
    .bind(record.total_payout)
    .bind(Utc::now())
    .bind(id)
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() == 0 {
        return Err(WagerError::AlreadyFinalized(id));
    }
    Ok(())
}

/// Delete an event; bets, payouts and audit rows cascade.
pub async fn delete(conn: &mut SqliteConnection, id: EventId) -> Result<bool, WagerError> {
    let result = sqlx::query("DELETE FROM events WHERE id = ?")
        .bind(id)
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected() > 0)
}

// ---------------------------------------------------------------------------
// Audit trail
// ---------------------------------------------------------------------------

pub async fn insert_audit(
    conn: &mut SqliteConnection,
    entry: &AuditEntry,
) -> Result<(), WagerError> {
    sqlx::query(
        r#"
        INSERT INTO event_audit (event_id, actor, action, from_status, to_status, detail, at)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(entry.event_id)
    .bind(&entry.actor)
    .bind(&entry.action)
    .bind(entry.from_status)
    .bind(entry.to_status)
    .bind(&entry.detail)
    .bind(entry.at)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub async fn list_audit(
    conn: &mut SqliteConnection,
    event_id: EventId,
) -> Result<Vec<AuditEntry>, WagerError> {
    let rows: Vec<(EventId, String, String, EventStatus, EventStatus, Option<String>, DateTime<Utc>)> =
        sqlx::query_as(
            r#"
            SELECT event_id, actor, action, from_status, to_status, detail, at
            FROM event_audit WHERE event_id = ? ORDER BY id ASC
            "#,
        )
        .bind(event_id)
        .fetch_all(&mut *conn)
        .await?;

    Ok(rows
        .into_iter()
        .map(|(event_id, actor, action, from_status, to_status, detail, at)| AuditEntry {
            event_id,
            actor,
            action,
            from_status,
            to_status,
            detail,
            at,
        })
        .collect())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
