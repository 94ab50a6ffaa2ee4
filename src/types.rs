//! Shared types for the wagering service.
//!
//! Events, bets and payouts as persisted by the record store, plus the
//! small value types (terms, outcomes, odds) the engine modules pass
//! between each other.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::WagerError;

pub type EventId = i64;
pub type BetId = i64;
pub type PayoutId = i64;

/// Largest number of outcome choices a single event may carry.
pub const MAX_CHOICES: usize = 25;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Event lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum EventStatus {
    Pending,
    Open,
    Locked,
    Paused,
    Completed,
    Cancelled,
}

impl EventStatus {
    /// Completed and cancelled events accept no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, EventStatus::Completed | EventStatus::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Pending => "pending",
            EventStatus::Open => "open",
            EventStatus::Locked => "locked",
            EventStatus::Paused => "paused",
            EventStatus::Completed => "completed",
            EventStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for EventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Event category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum EventType {
    Sports,
    Esports,
    Gaming,
    Community,
    Other,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventType::Sports => write!(f, "Sports"),
            EventType::Esports => write!(f, "Esports"),
            EventType::Gaming => write!(f, "Gaming"),
            EventType::Community => write!(f, "Community"),
            EventType::Other => write!(f, "Other"),
        }
    }
}

/// Parse a category name (case-insensitive).
impl std::str::FromStr for EventType {
    type Err = WagerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "sports" | "sport" => Ok(EventType::Sports),
            "esports" | "e-sports" => Ok(EventType::Esports),
            "gaming" | "game" => Ok(EventType::Gaming),
            "community" => Ok(EventType::Community),
            "other" => Ok(EventType::Other),
            _ => Err(WagerError::Validation(format!("unknown event type: {s}"))),
        }
    }
}

/// Bet status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum BetStatus {
    Active,
    Won,
    Lost,
    Refunded,
    Cancelled,
}

impl fmt::Display for BetStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BetStatus::Active => "active",
            BetStatus::Won => "won",
            BetStatus::Lost => "lost",
            BetStatus::Refunded => "refunded",
            BetStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Payout status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum PayoutStatus {
    Pending,
    Completed,
    Cancelled,
    Expired,
}

impl fmt::Display for PayoutStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PayoutStatus::Pending => "pending",
            PayoutStatus::Completed => "completed",
            PayoutStatus::Cancelled => "cancelled",
            PayoutStatus::Expired => "expired",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for PayoutStatus {
    type Err = WagerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "pending" => Ok(PayoutStatus::Pending),
            "completed" | "processed" | "paid" => Ok(PayoutStatus::Completed),
            "cancelled" | "canceled" => Ok(PayoutStatus::Cancelled),
            "expired" => Ok(PayoutStatus::Expired),
            _ => Err(WagerError::Validation(format!("unknown payout status: {s}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Betting terms
// ---------------------------------------------------------------------------

/// Per-event betting limits, copied from the global defaults when the
/// event is created and never changed afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BettingTerms {
    pub min_bet: i64,
    pub max_bet: i64,
    /// Maximum number of simultaneously active bets one user may hold.
    pub limit_per_user: u32,
    /// House fee taken from each gross payout, in percent (0–100).
    pub fee_percent: Decimal,
}

impl Default for BettingTerms {
    fn default() -> Self {
        Self {
            min_bet: 10,
            max_bet: 10_000,
            limit_per_user: 3,
            fee_percent: dec!(5),
        }
    }
}

impl BettingTerms {
    pub fn validate(&self) -> Result<(), WagerError> {
        if self.min_bet <= 0 {
            return Err(WagerError::Validation("minimum bet must be positive".into()));
        }
        if self.max_bet < self.min_bet {
            return Err(WagerError::Validation(format!(
                "maximum bet {} is below minimum bet {}",
                self.max_bet, self.min_bet
            )));
        }
        if self.limit_per_user == 0 {
            return Err(WagerError::Validation("per-user bet limit must be at least 1".into()));
        }
        if self.fee_percent < Decimal::ZERO || self.fee_percent > dec!(100) {
            return Err(WagerError::Validation(format!(
                "fee percent {} outside 0–100",
                self.fee_percent
            )));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

/// The declared result of an event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum Outcome {
    /// Index into the event's choices; winners are matched automatically.
    Choice(usize),
    /// Free-text result; winners are whatever bets were toggled manually.
    Custom(String),
}

impl Outcome {
    /// Human label for the outcome given the event's choices.
    pub fn label(&self, choices: &[String]) -> String {
        match self {
            Outcome::Choice(i) => choices
                .get(*i)
                .cloned()
                .unwrap_or_else(|| format!("choice #{i}")),
            Outcome::Custom(text) => text.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// A wagering event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub name: String,
    pub event_type: EventType,
    pub status: EventStatus,
    /// Status to return to on resume; only set while paused.
    pub paused_from: Option<EventStatus>,
    pub scheduled_time: Option<DateTime<Utc>>,
    /// Ordered outcome labels; a choice is identified by its index.
    pub choices: Vec<String>,
    pub terms: BettingTerms,
    pub total_bets_amount: i64,
    pub total_bets_count: i64,
    pub winner_approved: bool,
    pub winning_outcome: Option<Outcome>,
    pub winners_count: i64,
    pub losers_count: i64,
    pub total_payout: i64,
    pub card_message_id: Option<String>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Event {
    pub fn choice_label(&self, index: usize) -> Option<&str> {
        self.choices.get(index).map(String::as_str)
    }

    /// Result summary line once the event is settled.
    pub fn result_summary(&self) -> Option<String> {
        let outcome = self.winning_outcome.as_ref()?;
        Some(format!(
            "{}: {} winning bet(s), {} losing bet(s), {} paid out",
            outcome.label(&self.choices),
            self.winners_count,
            self.losers_count,
            self.total_payout
        ))
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "#{} {} [{}] ({}) pot={} bets={}",
            self.id,
            self.name,
            self.event_type,
            self.status,
            self.total_bets_amount,
            self.total_bets_count,
        )
    }
}

/// Data for inserting a new event.
#[derive(Debug, Clone)]
pub struct NewEvent {
    pub name: String,
    pub event_type: EventType,
    pub choices: Vec<String>,
    pub scheduled_time: Option<DateTime<Utc>>,
    pub terms: BettingTerms,
}

impl NewEvent {
    pub fn validate(&self) -> Result<(), WagerError> {
        if self.name.trim().is_empty() {
            return Err(WagerError::Validation("event name is required".into()));
        }
        if self.choices.len() < 2 {
            return Err(WagerError::Validation("an event needs at least two choices".into()));
        }
        if self.choices.len() > MAX_CHOICES {
            return Err(WagerError::Validation(format!(
                "an event may have at most {MAX_CHOICES} choices"
            )));
        }
        for (i, choice) in self.choices.iter().enumerate() {
            if choice.trim().is_empty() {
                return Err(WagerError::Validation(format!("choice #{i} is empty")));
            }
            if self.choices[..i].iter().any(|c| c.eq_ignore_ascii_case(choice)) {
                return Err(WagerError::Validation(format!("duplicate choice: {choice}")));
            }
        }
        self.terms.validate()
    }
}

/// A user's stake on one choice of one event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bet {
    pub id: BetId,
    pub event_id: EventId,
    pub user_id: String,
    pub amount: i64,
    pub choice_index: usize,
    pub status: BetStatus,
    pub is_winner: bool,
    pub winning_amount: Option<i64>,
    /// Amount reached the suspicious-amount threshold at placement.
    pub flagged: bool,
    pub created_at: DateTime<Utc>,
}

impl fmt::Display for Bet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "bet #{} by {} on choice {}: {} ({})",
            self.id, self.user_id, self.choice_index, self.amount, self.status
        )
    }
}

/// Net amount owed to one winning bet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payout {
    pub id: PayoutId,
    pub event_id: EventId,
    pub bet_id: BetId,
    pub user_id: String,
    /// Net of fee.
    pub amount: i64,
    pub fee_amount: i64,
    pub status: PayoutStatus,
    pub method: String,
    pub expires_at: DateTime<Utc>,
    pub processed_by: Option<String>,
    pub processed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// One persisted lifecycle transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub event_id: EventId,
    pub actor: String,
    pub action: String,
    pub from_status: EventStatus,
    pub to_status: EventStatus,
    pub detail: Option<String>,
    pub at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Odds
// ---------------------------------------------------------------------------

/// Current pool position for one choice.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChoiceOdds {
    pub index: usize,
    pub label: String,
    pub staked: i64,
    pub bet_count: i64,
    /// Fraction of the pot, four decimal places.
    pub pot_share: Decimal,
    /// Net return per unit staked if this choice wins now; None without stake.
    pub multiplier: Option<Decimal>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventOdds {
    pub event_id: EventId,
    pub pot: i64,
    pub choices: Vec<ChoiceOdds>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
