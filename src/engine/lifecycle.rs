//! Event Lifecycle Manager.
//!
//! Owns the event status machine:
//!
//! - `pending → open` when creation completes
//! - `open ⇄ locked` (lock / unlock)
//! - `open | locked ⇄ paused` (pause / resume)
//! - `locked | paused → open` (reopen, never after finalize)
//! - any non-terminal status `→ cancelled`
//!
//! `completed` is only reachable through settlement.
//!
//! Every transition runs in the event's write transaction, writes an audit
//! row in that same transaction, and is announced only after commit.

use chrono::{DateTime, NaiveDateTime, Utc};
use tracing::{info, warn};

use super::ledger::{BetLedger, Refund};
use crate::error::WagerError;
use crate::platform::{Announcement, Announcer};
use crate::session::SessionStore;
use crate::storage::{events, Store};
use crate::types::{AuditEntry, Event, EventId, EventStatus, NewEvent};

/// Accepted input layouts besides RFC 3339; all read as UTC.
const TIME_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M", "%Y-%m-%dT%H:%M"];

/// Parse an operator-entered date/time.
pub fn parse_time(input: &str) -> Result<DateTime<Utc>, WagerError> {
    let input = input.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(input) {
        return Ok(dt.with_timezone(&Utc));
    }
    TIME_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(input, fmt).ok())
        .map(|naive| naive.and_utc())
        .ok_or_else(|| {
            WagerError::InvalidTime(format!("'{input}' is not a date/time (use YYYY-MM-DD HH:MM)"))
        })
}

pub(crate) fn audit_entry(
    event: &Event,
    actor: &str,
    action: &str,
    to_status: EventStatus,
    detail: Option<String>,
) -> AuditEntry {
    AuditEntry {
        event_id: event.id,
        actor: actor.to_string(),
        action: action.to_string(),
        from_status: event.status,
        to_status,
        detail,
        at: Utc::now(),
    }
}

pub(crate) fn log_audit(entry: &AuditEntry) {
    info!(
        event_id = entry.event_id,
        actor = %entry.actor,
        action = %entry.action,
        from = %entry.from_status,
        to = %entry.to_status,
        detail = entry.detail.as_deref().unwrap_or(""),
        at = %entry.at.to_rfc3339(),
        "Event transition"
    );
}

/// Result of a status change request.
#[derive(Debug, Clone)]
pub struct Transition {
    pub event: Event,
    /// False when the event was already in the requested state.
    pub changed: bool,
}

/// Target of a planned transition: new status and the status to remember
/// for a later resume.
type Step = Option<(EventStatus, Option<EventStatus>)>;

#[derive(Debug, Clone)]
pub struct CancelReport {
    pub event: Event,
    pub refund: Refund,
}

#[derive(Clone)]
pub struct LifecycleManager {
    store: Store,
    ledger: BetLedger,
    announcer: Announcer,
}

impl LifecycleManager {
    pub fn new(store: Store, ledger: BetLedger, announcer: Announcer) -> Self {
        Self {
            store,
            ledger,
            announcer,
        }
    }

    pub fn ledger(&self) -> &BetLedger {
        &self.ledger
    }

    // -- Creation ------------------------------------------------------------

    /// Persist a validated event in `pending`.
    pub async fn create_event(&self, new: &NewEvent, actor: &str) -> Result<Event, WagerError> {
        new.validate()?;
        let mut tx = self.store.begin().await?;
        let id = events::insert(&mut tx, new, actor).await?;
        let event = events::fetch(&mut tx, id)
            .await?
            .ok_or_else(|| WagerError::Computation(format!("event {id} vanished after insert")))?;
        let entry = audit_entry(&event, actor, "create", EventStatus::Pending, None);
        events::insert_audit(&mut tx, &entry).await?;
        tx.commit().await?;
        log_audit(&entry);
        Ok(event)
    }

    /// `pending → open`, then post the event card.
    pub async fn open_event(&self, event_id: EventId, actor: &str) -> Result<Event, WagerError> {
        let t = self
            .transition(event_id, actor, "open", None, |e| match e.status {
                EventStatus::Pending => Ok(Some((EventStatus::Open, None))),
                EventStatus::Open => Ok(None),
                other => Err(conflict(e.id, "open", other)),
            })
            .await?;
        if t.changed {
            self.announcer.publish(Announcement::status(&t.event, None));
            self.announcer.post_card(&self.store, &t.event);
        }
        Ok(t.event)
    }

    /// Create and immediately open an event.
    pub async fn launch(&self, new: &NewEvent, actor: &str) -> Result<Event, WagerError> {
        let event = self.create_event(new, actor).await?;
        self.open_event(event.id, actor).await
    }

    /// Finish the actor's creation wizard and launch the drafted event.
    pub async fn complete_draft(
        &self,
        sessions: &SessionStore,
        actor: &str,
    ) -> Result<Event, WagerError> {
        let new = sessions.complete(actor)?;
        self.launch(&new, actor).await
    }

    // -- Status transitions ------------------------------------------------

    pub async fn lock(&self, event_id: EventId, actor: &str) -> Result<Transition, WagerError> {
        let t = self
            .transition(event_id, actor, "lock", None, |e| match e.status {
                EventStatus::Open => Ok(Some((EventStatus::Locked, None))),
                EventStatus::Locked => Ok(None),
                other => Err(conflict(e.id, "lock", other)),
            })
            .await?;
        self.announce(&t, None);
        Ok(t)
    }

    pub async fn unlock(&self, event_id: EventId, actor: &str) -> Result<Transition, WagerError> {
        let t = self
            .transition(event_id, actor, "unlock", None, |e| match e.status {
                EventStatus::Locked => Ok(Some((EventStatus::Open, None))),
                EventStatus::Open => Ok(None),
                other => Err(conflict(e.id, "unlock", other)),
            })
            .await?;
        self.announce(&t, None);
        Ok(t)
    }

    pub async fn pause(&self, event_id: EventId, actor: &str) -> Result<Transition, WagerError> {
        let t = self
            .transition(event_id, actor, "pause", None, |e| match e.status {
                EventStatus::Open | EventStatus::Locked => {
                    Ok(Some((EventStatus::Paused, Some(e.status))))
                }
                EventStatus::Paused => Ok(None),
                other => Err(conflict(e.id, "pause", other)),
            })
            .await?;
        self.announce(&t, None);
        Ok(t)
    }

    /// Return a paused event to the status it was paused from.
    pub async fn resume(&self, event_id: EventId, actor: &str) -> Result<Transition, WagerError> {
        let t = self
            .transition(event_id, actor, "resume", None, |e| match e.status {
                EventStatus::Paused => {
                    Ok(Some((e.paused_from.unwrap_or(EventStatus::Open), None)))
                }
                EventStatus::Open | EventStatus::Locked => Ok(None),
                other => Err(conflict(e.id, "resume", other)),
            })
            .await?;
        self.announce(&t, None);
        Ok(t)
    }

    /// Put a locked or paused event back to `open`. A finalized event can
    /// never be reopened.
    pub async fn reopen(
        &self,
        event_id: EventId,
        reason: &str,
        actor: &str,
    ) -> Result<Transition, WagerError> {
        let detail = Some(reason.trim().to_string()).filter(|r| !r.is_empty());
        let t = self
            .transition(event_id, actor, "reopen", detail.clone(), |e| {
                if e.winner_approved {
                    return Err(WagerError::AlreadyFinalized(e.id));
                }
                match e.status {
                    EventStatus::Locked | EventStatus::Paused => Ok(Some((EventStatus::Open, None))),
                    EventStatus::Open => Ok(None),
                    other => Err(conflict(e.id, "reopen", other)),
                }
            })
            .await?;
        self.announce(&t, detail);
        Ok(t)
    }

    /// Move the scheduled time. Allowed in any non-terminal status and
    /// leaves every bet untouched.
    pub async fn reschedule(
        &self,
        event_id: EventId,
        new_time: &str,
        actor: &str,
    ) -> Result<Event, WagerError> {
        let when = parse_time(new_time)?;

        let (mut tx, event) = self.store.begin_event(event_id).await?;
        if event.status.is_terminal() {
            return Err(conflict(event_id, "reschedule", event.status));
        }
        events::set_schedule(&mut tx, event_id, when).await?;
        let entry = audit_entry(
            &event,
            actor,
            "reschedule",
            event.status,
            Some(when.to_rfc3339()),
        );
        events::insert_audit(&mut tx, &entry).await?;
        let updated = reload(&mut tx, event_id).await?;
        tx.commit().await?;
        log_audit(&entry);

        self.announcer.publish(Announcement::Rescheduled {
            event_id,
            name: updated.name.clone(),
            when,
        });
        self.announcer.refresh_card(&updated);
        Ok(updated)
    }

    /// Cancel a running event, refunding every active bet.
    pub async fn cancel(
        &self,
        event_id: EventId,
        reason: &str,
        actor: &str,
    ) -> Result<CancelReport, WagerError> {
        let (mut tx, event) = self.store.begin_event(event_id).await?;
        match event.status {
            EventStatus::Cancelled => {
                return Ok(CancelReport {
                    event,
                    refund: Refund::default(),
                })
            }
            EventStatus::Completed => return Err(WagerError::AlreadyFinalized(event_id)),
            _ => {}
        }

        let reason = match reason.trim() {
            "" => "cancelled by operator".to_string(),
            r => r.to_string(),
        };
        let refund = self.ledger.refund_active(&mut tx, event_id).await?;
        events::set_status(&mut tx, event_id, EventStatus::Cancelled, None).await?;
        let entry = audit_entry(
            &event,
            actor,
            "cancel",
            EventStatus::Cancelled,
            Some(format!("{reason}; refunded {} bet(s) totalling {}", refund.bets, refund.amount)),
        );
        events::insert_audit(&mut tx, &entry).await?;
        let updated = reload(&mut tx, event_id).await?;
        tx.commit().await?;
        log_audit(&entry);

        self.announcer.publish(Announcement::Cancelled {
            event_id,
            name: updated.name.clone(),
            reason,
            refunded: refund.bets,
        });
        self.announcer.refresh_card(&updated);
        Ok(CancelReport {
            event: updated,
            refund,
        })
    }

    /// Remove a pending or cancelled event and everything attached to it.
    pub async fn delete(&self, event_id: EventId, actor: &str) -> Result<(), WagerError> {
        let (mut tx, event) = self.store.begin_event(event_id).await?;
        if !matches!(event.status, EventStatus::Pending | EventStatus::Cancelled) {
            return Err(WagerError::StateConflict(format!(
                "event {event_id} is {}; only pending or cancelled events can be deleted",
                event.status
            )));
        }
        events::delete(&mut tx, event_id).await?;
        tx.commit().await?;
        warn!(event_id, actor, name = %event.name, "Event deleted");
        Ok(())
    }

    // -- Reads ---------------------------------------------------------------

    pub async fn get_event(&self, event_id: EventId) -> Result<Event, WagerError> {
        self.store.event(event_id).await
    }

    pub async fn list_events(&self, statuses: &[EventStatus]) -> Result<Vec<Event>, WagerError> {
        let mut conn = self.store.pool().acquire().await?;
        events::list_by_status(&mut conn, statuses).await
    }

    pub async fn audit_trail(&self, event_id: EventId) -> Result<Vec<AuditEntry>, WagerError> {
        let mut conn = self.store.pool().acquire().await?;
        events::list_audit(&mut conn, event_id).await
    }

    /// Re-render the event card, e.g. after the pot changed.
    pub async fn refresh_card(&self, event_id: EventId) -> Result<(), WagerError> {
        let event = self.store.event(event_id).await?;
        self.announcer.refresh_card(&event);
        Ok(())
    }

    // -- Internals -----------------------------------------------------------

    /// Apply the status change chosen by `plan`, audited, in one transaction.
    /// `plan` returning `None` means the event is already where the caller
    /// wants it; nothing is written.
    async fn transition<F>(
        &self,
        event_id: EventId,
        actor: &str,
        action: &str,
        detail: Option<String>,
        plan: F,
    ) -> Result<Transition, WagerError>
    where
        F: FnOnce(&Event) -> Result<Step, WagerError>,
    {
        let (mut tx, event) = self.store.begin_event(event_id).await?;
        let Some((to, paused_from)) = plan(&event)? else {
            return Ok(Transition {
                event,
                changed: false,
            });
        };

        events::set_status(&mut tx, event_id, to, paused_from).await?;
        let entry = audit_entry(&event, actor, action, to, detail);
        events::insert_audit(&mut tx, &entry).await?;
        let updated = reload(&mut tx, event_id).await?;
        tx.commit().await?;
        log_audit(&entry);

        Ok(Transition {
            event: updated,
            changed: true,
        })
    }

    fn announce(&self, t: &Transition, note: Option<String>) {
        if !t.changed {
            return;
        }
        self.announcer.publish(Announcement::status(&t.event, note));
        self.announcer.refresh_card(&t.event);
    }
}

async fn reload(tx: &mut crate::storage::Tx, event_id: EventId) -> Result<Event, WagerError> {
    events::fetch(tx, event_id)
        .await?
        .ok_or_else(|| WagerError::not_found("event", event_id))
}

fn conflict(event_id: EventId, action: &str, status: EventStatus) -> WagerError {
    match status {
        EventStatus::Completed => WagerError::AlreadyFinalized(event_id),
        _ => WagerError::StateConflict(format!("cannot {action} event {event_id} while {status}")),
    }
}
