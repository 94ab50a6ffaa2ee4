//! Bet Ledger.
//!
//! Owns bet placement and cancellation. Every write runs inside the owning
//! event's write transaction: the status check, the limit checks, the bet
//! insert and the aggregate update commit together or not at all.

use tracing::{debug, info, warn};

use crate::error::WagerError;
use crate::storage::{bets, events, Store, Tx};
use crate::types::{Bet, BetId, BetStatus, EventId, EventStatus};

/// Amount and count released back to bettors by a refund sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Refund {
    pub bets: u64,
    pub amount: i64,
}

#[derive(Debug, Clone)]
pub struct BetLedger {
    store: Store,
    suspicious_amount: i64,
}

impl BetLedger {
    pub fn new(store: Store, suspicious_amount: i64) -> Self {
        Self {
            store,
            suspicious_amount,
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Place a bet on an open event.
    pub async fn place_bet(
        &self,
        event_id: EventId,
        user_id: &str,
        choice_index: usize,
        amount: i64,
    ) -> Result<Bet, WagerError> {
        if amount <= 0 {
            return Err(WagerError::Validation(format!(
                "bet amount must be positive, got {amount}"
            )));
        }
        if user_id.trim().is_empty() {
            return Err(WagerError::Validation("bettor id is required".into()));
        }

        let (mut tx, event) = self.store.begin_event(event_id).await?;

        match event.status {
            EventStatus::Open => {}
            EventStatus::Locked => return Err(WagerError::EventLocked(event_id)),
            status => return Err(WagerError::EventNotOpen { id: event_id, status }),
        }

        if choice_index >= event.choices.len() {
            return Err(WagerError::Validation(format!(
                "choice {} does not exist (event has {} choices)",
                choice_index + 1,
                event.choices.len()
            )));
        }

        let terms = &event.terms;
        if amount < terms.min_bet || amount > terms.max_bet {
            return Err(WagerError::LimitExceeded(format!(
                "bet must be between {} and {}, got {amount}",
                terms.min_bet, terms.max_bet
            )));
        }

        let active = bets::count_active_for_user(&mut tx, event_id, user_id).await?;
        if active >= i64::from(terms.limit_per_user) {
            return Err(WagerError::LimitExceeded(format!(
                "at most {} active bet(s) per user on this event",
                terms.limit_per_user
            )));
        }

        let flagged = amount >= self.suspicious_amount;
        let bet_id = bets::insert(
            &mut tx,
            &bets::BetInsert {
                event_id,
                user_id,
                amount,
                choice_index,
                flagged,
            },
        )
        .await?;
        events::adjust_totals(&mut tx, event_id, amount, 1).await?;

        let bet = bets::fetch(&mut tx, bet_id)
            .await?
            .ok_or_else(|| WagerError::Computation(format!("bet {bet_id} vanished after insert")))?;
        tx.commit().await?;

        if flagged {
            warn!(
                event_id,
                bet_id,
                user_id,
                amount,
                threshold = self.suspicious_amount,
                "Suspicious bet flagged"
            );
        }
        info!(
            event_id,
            bet_id,
            user_id,
            choice = %event.choices[choice_index],
            amount,
            "Bet placed"
        );
        Ok(bet)
    }

    /// Cancel an active bet while its event is still running.
    pub async fn cancel_bet(&self, bet_id: BetId, actor: &str) -> Result<Bet, WagerError> {
        let event_id = self.bet(bet_id).await?.event_id;

        let (mut tx, event) = self.store.begin_event(event_id).await?;
        // re-read under the event's write lock
        let bet = bets::fetch(&mut tx, bet_id)
            .await?
            .ok_or_else(|| WagerError::not_found("bet", bet_id))?;

        if event.status.is_terminal() || event.winner_approved {
            return Err(WagerError::StateConflict(format!(
                "event {event_id} is {}; its bets can no longer be cancelled",
                event.status
            )));
        }
        if bet.status != BetStatus::Active {
            return Err(WagerError::StateConflict(format!(
                "bet {bet_id} is already {}",
                bet.status
            )));
        }

        bets::set_status(&mut tx, bet_id, BetStatus::Cancelled).await?;
        if bet.is_winner {
            bets::set_winner_flag(&mut tx, bet_id, false).await?;
        }
        events::adjust_totals(&mut tx, event_id, -bet.amount, -1).await?;
        tx.commit().await?;

        info!(event_id, bet_id, actor, amount = bet.amount, "Bet cancelled");
        Ok(Bet {
            status: BetStatus::Cancelled,
            is_winner: false,
            ..bet
        })
    }

    /// Refund every active bet of the event inside the caller's transaction.
    pub(crate) async fn refund_active(
        &self,
        tx: &mut Tx,
        event_id: EventId,
    ) -> Result<Refund, WagerError> {
        let active: Vec<Bet> = bets::list_by_event(tx, event_id)
            .await?
            .into_iter()
            .filter(|b| b.status == BetStatus::Active)
            .collect();
        if active.is_empty() {
            return Ok(Refund::default());
        }

        let refund = Refund {
            bets: active.len() as u64,
            amount: active.iter().map(|b| b.amount).sum(),
        };

        bets::clear_winners(tx, event_id).await?;
        let moved = bets::set_status_for_active(tx, event_id, BetStatus::Refunded).await?;
        if moved != refund.bets {
            return Err(WagerError::Computation(format!(
                "refund of event {event_id} moved {moved} bets, expected {}",
                refund.bets
            )));
        }
        events::adjust_totals(tx, event_id, -refund.amount, -(refund.bets as i64)).await?;

        debug!(event_id, bets = refund.bets, amount = refund.amount, "Active bets refunded");
        Ok(refund)
    }

    pub async fn bet(&self, bet_id: BetId) -> Result<Bet, WagerError> {
        let mut conn = self.store.pool().acquire().await?;
        bets::fetch(&mut conn, bet_id)
            .await?
            .ok_or_else(|| WagerError::not_found("bet", bet_id))
    }

    /// Every bet of the event, in placement order.
    pub async fn list_by_event(&self, event_id: EventId) -> Result<Vec<Bet>, WagerError> {
        let mut tx = self.store.begin().await?;
        if events::fetch(&mut tx, event_id).await?.is_none() {
            return Err(WagerError::not_found("event", event_id));
        }
        let list = bets::list_by_event(&mut tx, event_id).await?;
        tx.commit().await?;
        Ok(list)
    }

    pub async fn list_by_choice(
        &self,
        event_id: EventId,
        choice_index: usize,
    ) -> Result<Vec<Bet>, WagerError> {
        let mut tx = self.store.begin().await?;
        let event = events::fetch(&mut tx, event_id)
            .await?
            .ok_or_else(|| WagerError::not_found("event", event_id))?;
        if choice_index >= event.choices.len() {
            return Err(WagerError::Validation(format!(
                "choice {} does not exist",
                choice_index + 1
            )));
        }
        let list = bets::list_by_choice(&mut tx, event_id, choice_index).await?;
        tx.commit().await?;
        Ok(list)
    }

    /// A user's betting history across events, newest first.
    pub async fn list_by_user(&self, user_id: &str) -> Result<Vec<Bet>, WagerError> {
        let mut conn = self.store.pool().acquire().await?;
        bets::list_by_user(&mut conn, user_id).await
    }

    /// Pot amount and bet count, summed from the bet rows.
    pub async fn pot(&self, event_id: EventId) -> Result<(i64, i64), WagerError> {
        let mut conn = self.store.pool().acquire().await?;
        bets::pot_totals(&mut conn, event_id).await
    }
}
