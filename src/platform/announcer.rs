//! Announcements through the operation queue.
//!
//! State changes are committed before anything is announced, so every
//! announcement here is fire-and-forget: a failure is logged and, for
//! channel errors, re-enqueued a bounded number of times. Duplicate
//! announcements are cosmetic; a missing one never affects settlement.

use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::ChatChannel;
use crate::engine::queue::{OperationQueue, Queued};
use crate::error::WagerError;
use crate::storage::{events, Store};
use crate::types::{Event, EventId, EventStatus};

/// Textual announcement posted to the event channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Announcement {
    StatusChanged {
        event_id: EventId,
        name: String,
        status: EventStatus,
        note: Option<String>,
    },
    Rescheduled {
        event_id: EventId,
        name: String,
        when: DateTime<Utc>,
    },
    Cancelled {
        event_id: EventId,
        name: String,
        reason: String,
        refunded: u64,
    },
    Results {
        event_id: EventId,
        name: String,
        outcome: String,
        winners: i64,
        losers: i64,
        total_payout: i64,
    },
}

impl Announcement {
    pub fn status(event: &Event, note: Option<String>) -> Self {
        Announcement::StatusChanged {
            event_id: event.id,
            name: event.name.clone(),
            status: event.status,
            note,
        }
    }

    pub fn event_id(&self) -> EventId {
        match self {
            Announcement::StatusChanged { event_id, .. }
            | Announcement::Rescheduled { event_id, .. }
            | Announcement::Cancelled { event_id, .. }
            | Announcement::Results { event_id, .. } => *event_id,
        }
    }

    /// Queue label, for logs.
    pub fn label(&self) -> String {
        let kind = match self {
            Announcement::StatusChanged { status, .. } => status.as_str(),
            Announcement::Rescheduled { .. } => "rescheduled",
            Announcement::Cancelled { .. } => "cancelled",
            Announcement::Results { .. } => "results",
        };
        format!("announce:{kind}:{}", self.event_id())
    }
}

impl fmt::Display for Announcement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Announcement::StatusChanged { name, status, note, .. } => {
                let headline = match status {
                    EventStatus::Open => "Betting is open",
                    EventStatus::Locked => "Betting locked",
                    EventStatus::Paused => "Betting paused",
                    EventStatus::Pending => "Event pending",
                    EventStatus::Completed => "Event completed",
                    EventStatus::Cancelled => "Event cancelled",
                };
                write!(f, "{headline}: {name}")?;
                if let Some(note) = note {
                    write!(f, " ({note})")?;
                }
                Ok(())
            }
            Announcement::Rescheduled { name, when, .. } => {
                write!(f, "{name} rescheduled to {}", when.format("%Y-%m-%d %H:%M UTC"))
            }
            Announcement::Cancelled { name, reason, refunded, .. } => {
                write!(f, "{name} cancelled: {reason}. {refunded} bet(s) refunded")
            }
            Announcement::Results {
                name,
                outcome,
                winners,
                losers,
                total_payout,
                ..
            } => {
                if *winners == 0 {
                    write!(f, "Results for {name}: {outcome}. No winning bets")
                } else {
                    write!(
                        f,
                        "Results for {name}: {outcome}. {winners} winner(s), {losers} loser(s), {total_payout} paid out"
                    )
                }
            }
        }
    }
}

/// Plain-text event card; edited in place as the event changes.
pub fn render_card(event: &Event) -> String {
    let mut card = format!("{} [{}]\nStatus: {}\n", event.name, event.event_type, event.status);
    if let Some(when) = event.scheduled_time {
        card.push_str(&format!("Starts: {}\n", when.format("%Y-%m-%d %H:%M UTC")));
    }
    for (i, choice) in event.choices.iter().enumerate() {
        card.push_str(&format!("{}. {choice}\n", i + 1));
    }
    card.push_str(&format!(
        "Bets: {} to {} (max {} per user), fee {}%\nPot: {} from {} bet(s)",
        event.terms.min_bet,
        event.terms.max_bet,
        event.terms.limit_per_user,
        event.terms.fee_percent,
        event.total_bets_amount,
        event.total_bets_count,
    ));
    if let Some(summary) = event.result_summary() {
        card.push_str(&format!("\nResult: {summary}"));
    }
    card
}

/// Posts announcements and event cards through the shared queue.
#[derive(Clone)]
pub struct Announcer {
    channel: Arc<dyn ChatChannel>,
    queue: OperationQueue,
    target: String,
    retries: u32,
}

impl Announcer {
    pub fn new(
        channel: Arc<dyn ChatChannel>,
        queue: OperationQueue,
        target: impl Into<String>,
        retries: u32,
    ) -> Self {
        Self {
            channel,
            queue,
            target: target.into(),
            retries,
        }
    }

    pub fn queue(&self) -> &OperationQueue {
        &self.queue
    }

    /// Enqueue a send and hand back its eventual message id.
    pub fn send(&self, label: impl Into<String>, content: String) -> Queued<String> {
        let channel = self.channel.clone();
        let target = self.target.clone();
        self.queue
            .enqueue(label, move || async move { channel.send(&target, &content).await })
    }

    /// Enqueue an edit of an existing message.
    pub fn edit(&self, label: impl Into<String>, message_id: String, content: String) -> Queued<()> {
        let channel = self.channel.clone();
        let target = self.target.clone();
        self.queue.enqueue(label, move || async move {
            channel.edit(&target, &message_id, &content).await
        })
    }

    /// Fire-and-forget announcement. The first attempt is enqueued before
    /// this returns; the handle resolves with the message id, if any.
    pub fn publish(&self, announcement: Announcement) -> JoinHandle<Option<String>> {
        let label = announcement.label();
        let content = announcement.to_string();
        let first = self.send(label.clone(), content.clone());
        let this = self.clone();
        tokio::spawn(async move {
            let resend = {
                let this = this.clone();
                let label = label.clone();
                move || this.send(label.clone(), content.clone())
            };
            follow(&label, first, this.retries, resend).await
        })
    }

    /// Post the event card and remember its message id on the event.
    pub fn post_card(&self, store: &Store, event: &Event) -> JoinHandle<Option<String>> {
        let label = format!("card:post:{}", event.id);
        let content = render_card(event);
        let first = self.send(label.clone(), content.clone());
        let this = self.clone();
        let store = store.clone();
        let event_id = event.id;
        tokio::spawn(async move {
            let resend = {
                let this = this.clone();
                let label = label.clone();
                move || this.send(label.clone(), content.clone())
            };
            let message_id = follow(&label, first, this.retries, resend).await?;
            if let Err(e) = remember_card(&store, event_id, &message_id).await {
                warn!(event_id, error = %e, "Failed to store card message id");
            }
            Some(message_id)
        })
    }

    /// Re-render the event card in place. No-op when the event has no card.
    pub fn refresh_card(&self, event: &Event) -> Option<JoinHandle<Option<()>>> {
        let message_id = event.card_message_id.clone()?;
        let label = format!("card:edit:{}", event.id);
        let content = render_card(event);
        let first = self.edit(label.clone(), message_id.clone(), content.clone());
        let this = self.clone();
        Some(tokio::spawn(async move {
            let reedit = {
                let this = this.clone();
                let label = label.clone();
                move || this.edit(label.clone(), message_id.clone(), content.clone())
            };
            follow(&label, first, this.retries, reedit).await
        }))
    }
}

async fn remember_card(store: &Store, event_id: EventId, message_id: &str) -> Result<(), WagerError> {
    let mut conn = store.pool().acquire().await?;
    events::set_card_message(&mut conn, event_id, message_id).await
}

/// Await a queued announcement, re-enqueueing channel failures up to
/// `retries` times. Anything else (a cleared queue) ends the attempt.
async fn follow<T, F>(label: &str, first: Queued<T>, retries: u32, mut again: F) -> Option<T>
where
    F: FnMut() -> Queued<T>,
{
    let mut pending = first;
    let mut attempt = 0;
    loop {
        match pending.await {
            Ok(value) => {
                debug!(label, attempt, "Announcement delivered");
                return Some(value);
            }
            Err(WagerError::ExternalChannel(e)) if attempt < retries => {
                attempt += 1;
                warn!(label, attempt, error = %e, "Announcement failed, re-enqueueing");
                pending = again();
            }
            Err(e) => {
                warn!(label, attempt, error = %e, "Announcement dropped");
                return None;
            }
        }
    }
}
