//! Event-creation wizard sessions.
//!
//! An operator builds an event over several interactions. The partial
//! draft lives here, keyed by the operator's id, until it is completed,
//! cancelled, or left idle past the TTL. The store is bounded: starting a
//! draft when full evicts the least recently touched one.
//!
//! A draft is never a second copy of a persisted event; once completed it
//! is removed and the record store owns the result.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::engine::lifecycle::parse_time;
use crate::error::WagerError;
use crate::types::{BettingTerms, EventType, NewEvent, MAX_CHOICES};

#[derive(Debug, Clone, PartialEq)]
pub struct EventDraft {
    pub name: Option<String>,
    pub event_type: EventType,
    pub choices: Vec<String>,
    pub scheduled_time: Option<DateTime<Utc>>,
    pub terms: BettingTerms,
}

impl EventDraft {
    fn new(terms: BettingTerms) -> Self {
        Self {
            name: None,
            event_type: EventType::Other,
            choices: Vec::new(),
            scheduled_time: None,
            terms,
        }
    }

    /// Validate and convert into an insertable event.
    pub fn to_new_event(&self) -> Result<NewEvent, WagerError> {
        let name = self
            .name
            .clone()
            .ok_or_else(|| WagerError::Validation("event name is required".into()))?;
        let new = NewEvent {
            name,
            event_type: self.event_type,
            choices: self.choices.clone(),
            scheduled_time: self.scheduled_time,
            terms: self.terms.clone(),
        };
        new.validate()?;
        Ok(new)
    }
}

struct Session {
    draft: EventDraft,
    touched: Instant,
}

pub struct SessionStore {
    sessions: Mutex<HashMap<String, Session>>,
    ttl: Duration,
    capacity: usize,
    defaults: BettingTerms,
}

impl SessionStore {
    pub fn new(ttl: Duration, capacity: usize, defaults: BettingTerms) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            ttl,
            capacity: capacity.max(1),
            defaults,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Session>> {
        self.sessions.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Begin a fresh draft for `actor`, discarding any earlier one.
    pub fn start(&self, actor: &str) -> EventDraft {
        let now = Instant::now();
        let mut sessions = self.lock();
        sessions.retain(|_, s| now.duration_since(s.touched) < self.ttl);

        if !sessions.contains_key(actor) && sessions.len() >= self.capacity {
            let oldest = sessions
                .iter()
                .min_by_key(|(_, s)| s.touched)
                .map(|(k, _)| k.clone());
            if let Some(key) = oldest {
                sessions.remove(&key);
                debug!(evicted = %key, "Wizard session evicted at capacity");
            }
        }

        let draft = EventDraft::new(self.defaults.clone());
        sessions.insert(
            actor.to_string(),
            Session {
                draft: draft.clone(),
                touched: now,
            },
        );
        info!(actor, "Event draft started");
        draft
    }

    fn with_draft<T>(
        &self,
        actor: &str,
        f: impl FnOnce(&mut EventDraft) -> Result<T, WagerError>,
    ) -> Result<T, WagerError> {
        let now = Instant::now();
        let mut sessions = self.lock();
        let expired = sessions
            .get(actor)
            .is_some_and(|s| now.duration_since(s.touched) >= self.ttl);
        if expired {
            sessions.remove(actor);
            debug!(actor, "Wizard session expired");
        }
        let session = sessions.get_mut(actor).ok_or_else(|| {
            WagerError::StateConflict("no event draft in progress; start a new one".into())
        })?;
        let out = f(&mut session.draft)?;
        session.touched = now;
        Ok(out)
    }

    pub fn draft(&self, actor: &str) -> Option<EventDraft> {
        self.with_draft(actor, |d| Ok(d.clone())).ok()
    }

    pub fn set_name(&self, actor: &str, name: &str) -> Result<EventDraft, WagerError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(WagerError::Validation("event name is required".into()));
        }
        self.with_draft(actor, |d| {
            d.name = Some(name.to_string());
            Ok(d.clone())
        })
    }

    pub fn set_type(&self, actor: &str, event_type: &str) -> Result<EventDraft, WagerError> {
        let event_type: EventType = event_type.parse()?;
        self.with_draft(actor, |d| {
            d.event_type = event_type;
            Ok(d.clone())
        })
    }

    pub fn add_choice(&self, actor: &str, label: &str) -> Result<EventDraft, WagerError> {
        let label = label.trim();
        if label.is_empty() {
            return Err(WagerError::Validation("choice label is empty".into()));
        }
        self.with_draft(actor, |d| {
            if d.choices.len() >= MAX_CHOICES {
                return Err(WagerError::Validation(format!(
                    "an event may have at most {MAX_CHOICES} choices"
                )));
            }
            if d.choices.iter().any(|c| c.eq_ignore_ascii_case(label)) {
                return Err(WagerError::Validation(format!("duplicate choice: {label}")));
            }
            d.choices.push(label.to_string());
            Ok(d.clone())
        })
    }

    pub fn remove_choice(&self, actor: &str, index: usize) -> Result<EventDraft, WagerError> {
        self.with_draft(actor, |d| {
            if index >= d.choices.len() {
                return Err(WagerError::Validation(format!("choice {} does not exist", index + 1)));
            }
            d.choices.remove(index);
            Ok(d.clone())
        })
    }

    pub fn set_schedule(&self, actor: &str, when: &str) -> Result<EventDraft, WagerError> {
        let when = parse_time(when)?;
        self.with_draft(actor, |d| {
            d.scheduled_time = Some(when);
            Ok(d.clone())
        })
    }

    /// Override the copied defaults for this one event.
    pub fn set_terms(&self, actor: &str, terms: BettingTerms) -> Result<EventDraft, WagerError> {
        terms.validate()?;
        self.with_draft(actor, |d| {
            d.terms = terms;
            Ok(d.clone())
        })
    }

    /// Validate the draft and end the session. An invalid draft stays in
    /// place so the operator can fix it.
    pub fn complete(&self, actor: &str) -> Result<NewEvent, WagerError> {
        let new = self.with_draft(actor, |d| d.to_new_event())?;
        self.lock().remove(actor);
        debug!(actor, name = %new.name, "Event draft completed");
        Ok(new)
    }

    pub fn cancel(&self, actor: &str) -> bool {
        let removed = self.lock().remove(actor).is_some();
        if removed {
            info!(actor, "Event draft cancelled");
        }
        removed
    }

    /// Drop idle sessions. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut sessions = self.lock();
        let before = sessions.len();
        sessions.retain(|_, s| now.duration_since(s.touched) < self.ttl);
        before - sessions.len()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
