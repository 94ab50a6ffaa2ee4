//! Settlement Engine.
//!
//! Winner determination, pari-mutuel payout computation and the one-way
//! `finalize` transition.
//!
//! Payout math is integer and deterministic:
//!
//! - `gross = floor(stake × pot / total_winning)` (exact, via i128)
//! - `fee   = floor(gross × fee_percent / 100)` (decimal)
//! - `net   = gross − fee`
//!
//! Flooring per bet guarantees `Σ(net + fee) ≤ pot`; the remainder is the
//! residual and is never distributed.
//!
//! Finalize reads the bets, computes the plan, writes bets, payouts and the
//! event, all inside the event's write transaction. Any error drops the
//! transaction and the event stays exactly as it was.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::Serialize;
use tracing::{info, warn};

use super::ledger::BetLedger;
use super::lifecycle::{audit_entry, log_audit};
use crate::error::WagerError;
use crate::platform::{Announcement, Announcer};
use crate::storage::events::FinalizeRecord;
use crate::storage::{bets, events, payouts, Store, Tx};
use crate::types::{
    Bet, BetId, BetStatus, ChoiceOdds, Event, EventId, EventOdds, EventStatus, Outcome, Payout,
    PayoutId, PayoutStatus,
};

// ---------------------------------------------------------------------------
// Payout plan
// ---------------------------------------------------------------------------

/// Computed payout for one winning bet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PayoutLine {
    pub bet_id: BetId,
    pub user_id: String,
    pub stake: i64,
    pub gross: i64,
    pub fee: i64,
    pub net: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PayoutPlan {
    pub pot: i64,
    pub total_winning_amount: i64,
    /// `pot / total_winning_amount`; `None` when nobody won.
    pub payout_ratio: Option<Decimal>,
    pub lines: Vec<PayoutLine>,
    pub total_net: i64,
    pub total_fees: i64,
    /// Kept back by flooring; never negative.
    pub residual: i64,
}

impl PayoutPlan {
    pub fn has_winners(&self) -> bool {
        !self.lines.is_empty()
    }
}

/// Split `pot` among `winners` in proportion to their stakes.
pub fn compute_payouts(
    pot: i64,
    winners: &[Bet],
    fee_percent: Decimal,
) -> Result<PayoutPlan, WagerError> {
    if pot < 0 {
        return Err(WagerError::Computation(format!("negative pot {pot}")));
    }
    if fee_percent < Decimal::ZERO || fee_percent > Decimal::ONE_HUNDRED {
        return Err(WagerError::Computation(format!(
            "fee percent {fee_percent} outside 0-100"
        )));
    }

    if winners.is_empty() {
        return Ok(PayoutPlan {
            pot,
            total_winning_amount: 0,
            payout_ratio: None,
            lines: Vec::new(),
            total_net: 0,
            total_fees: 0,
            residual: pot,
        });
    }

    let total_winning = winners
        .iter()
        .try_fold(0i64, |acc, b| acc.checked_add(b.amount))
        .ok_or_else(|| WagerError::Computation("winning stake overflow".into()))?;
    if total_winning <= 0 {
        return Err(WagerError::Computation(format!(
            "{} winner(s) with total stake {total_winning}",
            winners.len()
        )));
    }
    if total_winning > pot {
        return Err(WagerError::Computation(format!(
            "winning stake {total_winning} exceeds pot {pot}"
        )));
    }

    let mut lines = Vec::with_capacity(winners.len());
    for bet in winners {
        let gross = i64::try_from(i128::from(bet.amount) * i128::from(pot) / i128::from(total_winning))
            .map_err(|_| WagerError::Computation(format!("gross payout overflow on bet {}", bet.id)))?;
        let fee = (Decimal::from(gross) * fee_percent / Decimal::ONE_HUNDRED)
            .floor()
            .to_i64()
            .ok_or_else(|| WagerError::Computation(format!("fee overflow on bet {}", bet.id)))?;
        lines.push(PayoutLine {
            bet_id: bet.id,
            user_id: bet.user_id.clone(),
            stake: bet.amount,
            gross,
            fee,
            net: gross - fee,
        });
    }

    let total_net: i64 = lines.iter().map(|l| l.net).sum();
    let total_fees: i64 = lines.iter().map(|l| l.fee).sum();
    let residual = pot - total_net - total_fees;
    if residual < 0 {
        return Err(WagerError::Computation(format!(
            "payouts {total_net} + fees {total_fees} exceed pot {pot}"
        )));
    }

    Ok(PayoutPlan {
        pot,
        total_winning_amount: total_winning,
        payout_ratio: Decimal::from(pot).checked_div(Decimal::from(total_winning)),
        lines,
        total_net,
        total_fees,
        residual,
    })
}

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

/// Persisted result of a finalized event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SettlementReport {
    pub event_id: EventId,
    pub outcome: Outcome,
    pub outcome_label: String,
    pub pot: i64,
    pub winners_count: i64,
    pub losers_count: i64,
    pub total_payout: i64,
    pub total_fees: i64,
    pub residual: i64,
    pub payouts: Vec<Payout>,
}

#[derive(Debug, Clone)]
pub enum FinalizeOutcome {
    /// This call settled the event.
    Finalized(SettlementReport),
    /// The event was settled earlier; the stored result is returned as is.
    AlreadyFinalized(SettlementReport),
}

impl FinalizeOutcome {
    pub fn report(&self) -> &SettlementReport {
        match self {
            FinalizeOutcome::Finalized(r) | FinalizeOutcome::AlreadyFinalized(r) => r,
        }
    }

    pub fn into_report(self) -> SettlementReport {
        match self {
            FinalizeOutcome::Finalized(r) | FinalizeOutcome::AlreadyFinalized(r) => r,
        }
    }

    pub fn is_first(&self) -> bool {
        matches!(self, FinalizeOutcome::Finalized(_))
    }
}

/// Winner flags as persisted by `select_winners`, with the resulting plan.
#[derive(Debug, Clone)]
pub struct WinnerSelection {
    pub winners: Vec<Bet>,
    pub plan: PayoutPlan,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct SettlementEngine {
    store: Store,
    ledger: BetLedger,
    announcer: Announcer,
    payout_expiry: Duration,
}

impl SettlementEngine {
    pub fn new(store: Store, ledger: BetLedger, announcer: Announcer, payout_expiry_days: i64) -> Self {
        Self {
            store,
            ledger,
            announcer,
            payout_expiry: Duration::days(payout_expiry_days.max(1)),
        }
    }

    /// Close the event with `outcome` and create its payouts.
    ///
    /// Re-invoking on a finalized event is a no-op that returns the stored
    /// result, so a caller that timed out may simply call again.
    pub async fn finalize(
        &self,
        event_id: EventId,
        outcome: Outcome,
        actor: &str,
    ) -> Result<FinalizeOutcome, WagerError> {
        let (mut tx, event) = self.store.begin_event(event_id).await?;

        if event.winner_approved {
            let report = stored_report(&mut tx, &event).await?;
            drop(tx);
            if report.outcome != outcome {
                warn!(
                    event_id,
                    actor,
                    requested = %outcome.label(&event.choices),
                    settled = %report.outcome_label,
                    "Finalize repeated with a different outcome; keeping the settled one"
                );
            }
            info!(event_id, actor, "Finalize repeated; returning stored result");
            return Ok(FinalizeOutcome::AlreadyFinalized(report));
        }

        if !matches!(event.status, EventStatus::Locked | EventStatus::Paused) {
            return Err(WagerError::StateConflict(format!(
                "event {event_id} is {}; lock it before declaring a result",
                event.status
            )));
        }

        match &outcome {
            Outcome::Choice(index) => {
                check_choice(&event, *index)?;
                bets::mark_winners_by_choice(&mut tx, event_id, *index).await?;
            }
            Outcome::Custom(text) if text.trim().is_empty() => {
                return Err(WagerError::Validation("custom outcome text is empty".into()));
            }
            Outcome::Custom(_) => {}
        }

        let (pot, count) = bets::pot_totals(&mut tx, event_id).await?;
        if pot != event.total_bets_amount || count != event.total_bets_count {
            return Err(WagerError::Computation(format!(
                "event {event_id} aggregates ({}, {}) disagree with its bets ({pot}, {count})",
                event.total_bets_amount, event.total_bets_count
            )));
        }

        let (winners, losers): (Vec<Bet>, Vec<Bet>) = bets::list_by_event(&mut tx, event_id)
            .await?
            .into_iter()
            .filter(|b| b.status == BetStatus::Active)
            .partition(|b| b.is_winner);

        let plan = compute_payouts(pot, &winners, event.terms.fee_percent)?;

        let expires_at = Utc::now() + self.payout_expiry;
        for line in &plan.lines {
            bets::settle(&mut tx, line.bet_id, BetStatus::Won, Some(line.net)).await?;
            payouts::insert(
                &mut tx,
                &payouts::PayoutInsert {
                    event_id,
                    bet_id: line.bet_id,
                    user_id: &line.user_id,
                    amount: line.net,
                    fee_amount: line.fee,
                    method: "manual",
                    expires_at,
                },
            )
            .await?;
        }
        for bet in &losers {
            bets::settle(&mut tx, bet.id, BetStatus::Lost, None).await?;
        }

        let outcome_label = outcome.label(&event.choices);
        let record = FinalizeRecord {
            outcome: outcome.clone(),
            outcome_label: outcome_label.clone(),
            winners_count: plan.lines.len() as i64,
            losers_count: losers.len() as i64,
            total_payout: plan.total_net,
        };
        events::mark_finalized(&mut tx, event_id, &record).await?;

        let entry = audit_entry(
            &event,
            actor,
            "finalize",
            EventStatus::Completed,
            Some(format!(
                "{outcome_label}: {} winner(s), payout {}, fees {}",
                record.winners_count, plan.total_net, plan.total_fees
            )),
        );
        events::insert_audit(&mut tx, &entry).await?;

        let settled = events::fetch(&mut tx, event_id)
            .await?
            .ok_or_else(|| WagerError::not_found("event", event_id))?;
        let report = SettlementReport {
            event_id,
            outcome,
            outcome_label: outcome_label.clone(),
            pot,
            winners_count: record.winners_count,
            losers_count: record.losers_count,
            total_payout: plan.total_net,
            total_fees: plan.total_fees,
            residual: plan.residual,
            payouts: payouts::list_by_event(&mut tx, event_id).await?,
        };
        tx.commit().await?;

        log_audit(&entry);
        info!(
            event_id,
            actor,
            outcome = %outcome_label,
            pot,
            winners = report.winners_count,
            losers = report.losers_count,
            total_payout = report.total_payout,
            total_fees = report.total_fees,
            residual = report.residual,
            "Event finalized"
        );

        self.announcer.publish(Announcement::Results {
            event_id,
            name: settled.name.clone(),
            outcome: outcome_label,
            winners: report.winners_count,
            losers: report.losers_count,
            total_payout: report.total_payout,
        });
        self.announcer.refresh_card(&settled);

        Ok(FinalizeOutcome::Finalized(report))
    }

    /// Flip the manual winner flag of one active bet.
    pub async fn toggle_winner(&self, bet_id: BetId, actor: &str) -> Result<Bet, WagerError> {
        let event_id = self.ledger.bet(bet_id).await?.event_id;
        let (mut tx, event) = self.store.begin_event(event_id).await?;

        if event.winner_approved {
            return Err(WagerError::AlreadyFinalized(event_id));
        }
        if event.status.is_terminal() {
            return Err(WagerError::StateConflict(format!(
                "event {event_id} is {}",
                event.status
            )));
        }

        let bet = bets::fetch(&mut tx, bet_id)
            .await?
            .ok_or_else(|| WagerError::not_found("bet", bet_id))?;
        if bet.status != BetStatus::Active {
            return Err(WagerError::StateConflict(format!(
                "bet {bet_id} is {}; only active bets can win",
                bet.status
            )));
        }

        let is_winner = !bet.is_winner;
        bets::set_winner_flag(&mut tx, bet_id, is_winner).await?;
        tx.commit().await?;

        info!(event_id, bet_id, actor, is_winner, "Winner flag toggled");
        Ok(Bet { is_winner, ..bet })
    }

    /// Persist winner flags for `outcome` ahead of finalize: a choice marks
    /// its bets, a custom outcome clears every flag for manual selection.
    pub async fn select_winners(
        &self,
        event_id: EventId,
        outcome: &Outcome,
        actor: &str,
    ) -> Result<WinnerSelection, WagerError> {
        let (mut tx, event) = self.store.begin_event(event_id).await?;
        if event.winner_approved {
            return Err(WagerError::AlreadyFinalized(event_id));
        }
        if event.status.is_terminal() {
            return Err(WagerError::StateConflict(format!(
                "event {event_id} is {}",
                event.status
            )));
        }

        match outcome {
            Outcome::Choice(index) => {
                check_choice(&event, *index)?;
                bets::mark_winners_by_choice(&mut tx, event_id, *index).await?;
            }
            Outcome::Custom(_) => bets::clear_winners(&mut tx, event_id).await?,
        }

        let selection = current_selection(&mut tx, &event).await?;
        tx.commit().await?;

        info!(
            event_id,
            actor,
            outcome = %outcome.label(&event.choices),
            winners = selection.winners.len(),
            "Winners selected"
        );
        Ok(selection)
    }

    /// Payouts the current winner flags would produce. Writes nothing.
    pub async fn preview(&self, event_id: EventId) -> Result<WinnerSelection, WagerError> {
        let mut tx = self.store.begin().await?;
        let event = events::fetch(&mut tx, event_id)
            .await?
            .ok_or_else(|| WagerError::not_found("event", event_id))?;
        let selection = current_selection(&mut tx, &event).await?;
        tx.commit().await?;
        Ok(selection)
    }

    /// Pot split and implied net multiplier per choice.
    pub async fn compute_current_odds(&self, event_id: EventId) -> Result<EventOdds, WagerError> {
        let mut tx = self.store.begin().await?;
        let event = events::fetch(&mut tx, event_id)
            .await?
            .ok_or_else(|| WagerError::not_found("event", event_id))?;
        let by_choice = bets::pot_by_choice(&mut tx, event_id).await?;
        tx.commit().await?;

        let pot: i64 = by_choice.iter().map(|(_, amount, _)| amount).sum();
        let keep = (Decimal::ONE_HUNDRED - event.terms.fee_percent) / Decimal::ONE_HUNDRED;

        let choices = event
            .choices
            .iter()
            .enumerate()
            .map(|(index, label)| {
                let (staked, bet_count) = by_choice
                    .iter()
                    .find(|(i, _, _)| *i == index)
                    .map(|(_, amount, count)| (*amount, *count))
                    .unwrap_or((0, 0));
                let pot_share = if pot > 0 {
                    (Decimal::from(staked) / Decimal::from(pot))
                        .round_dp_with_strategy(4, RoundingStrategy::MidpointAwayFromZero)
                } else {
                    Decimal::ZERO
                };
                let multiplier = (staked > 0).then(|| {
                    (Decimal::from(pot) / Decimal::from(staked) * keep)
                        .round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
                });
                ChoiceOdds {
                    index,
                    label: label.clone(),
                    staked,
                    bet_count,
                    pot_share,
                    multiplier,
                }
            })
            .collect();

        Ok(EventOdds {
            event_id,
            pot,
            choices,
        })
    }

    // -- Payout administration ----------------------------------------------

    /// Move a pending payout to `completed`, `cancelled` or `expired`.
    pub async fn mark_payout(
        &self,
        payout_id: PayoutId,
        status: PayoutStatus,
        actor: &str,
    ) -> Result<Payout, WagerError> {
        if status == PayoutStatus::Pending {
            return Err(WagerError::Validation(
                "a payout can only be marked completed, cancelled or expired".into(),
            ));
        }

        // UPDATE before any read so the transaction holds the write lock
        let mut tx = self.store.begin().await?;
        if !payouts::resolve(&mut tx, payout_id, status, actor).await? {
            let payout = payouts::fetch(&mut tx, payout_id)
                .await?
                .ok_or_else(|| WagerError::not_found("payout", payout_id))?;
            return Err(WagerError::StateConflict(format!(
                "payout {payout_id} is already {}",
                payout.status
            )));
        }
        let updated = payouts::fetch(&mut tx, payout_id)
            .await?
            .ok_or_else(|| WagerError::not_found("payout", payout_id))?;
        tx.commit().await?;

        info!(
            payout_id,
            event_id = updated.event_id,
            user_id = %updated.user_id,
            amount = updated.amount,
            status = %status,
            actor,
            "Payout marked"
        );
        Ok(updated)
    }

    /// Expire every pending payout past its deadline.
    pub async fn expire_overdue_payouts(&self, now: DateTime<Utc>) -> Result<u64, WagerError> {
        let mut conn = self.store.pool().acquire().await?;
        let expired = payouts::expire_overdue(&mut conn, now).await?;
        if expired > 0 {
            warn!(expired, "Overdue payouts expired");
        }
        Ok(expired)
    }

    pub async fn list_payouts(&self, event_id: EventId) -> Result<Vec<Payout>, WagerError> {
        let mut tx = self.store.begin().await?;
        if events::fetch(&mut tx, event_id).await?.is_none() {
            return Err(WagerError::not_found("event", event_id));
        }
        let list = payouts::list_by_event(&mut tx, event_id).await?;
        tx.commit().await?;
        Ok(list)
    }
}

fn check_choice(event: &Event, index: usize) -> Result<(), WagerError> {
    if index >= event.choices.len() {
        return Err(WagerError::Validation(format!(
            "choice {} does not exist (event has {} choices)",
            index + 1,
            event.choices.len()
        )));
    }
    Ok(())
}

async fn current_selection(tx: &mut Tx, event: &Event) -> Result<WinnerSelection, WagerError> {
    let (pot, _) = bets::pot_totals(tx, event.id).await?;
    let winners: Vec<Bet> = bets::list_by_event(tx, event.id)
        .await?
        .into_iter()
        .filter(|b| b.status == BetStatus::Active && b.is_winner)
        .collect();
    let plan = compute_payouts(pot, &winners, event.terms.fee_percent)?;
    Ok(WinnerSelection { winners, plan })
}

/// Rebuild the report of an already finalized event from stored rows.
async fn stored_report(tx: &mut Tx, event: &Event) -> Result<SettlementReport, WagerError> {
    let outcome = event.winning_outcome.clone().ok_or_else(|| {
        WagerError::Computation(format!("event {} is approved but has no outcome", event.id))
    })?;
    let payouts = payouts::list_by_event(tx, event.id).await?;
    let total_fees: i64 = payouts.iter().map(|p| p.fee_amount).sum();
    Ok(SettlementReport {
        event_id: event.id,
        outcome_label: outcome.label(&event.choices),
        outcome,
        pot: event.total_bets_amount,
        winners_count: event.winners_count,
        losers_count: event.losers_count,
        total_payout: event.total_payout,
        total_fees,
        residual: event.total_bets_amount - event.total_payout - total_fees,
        payouts,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testutil::{announcer, open_event, setup_store};
    use crate::error::ErrorKind;
    use rust_decimal_macros::dec;

    fn bet(id: BetId, user: &str, amount: i64, choice: usize) -> Bet {
        Bet {
            id,
            event_id: 1,
            user_id: user.into(),
            amount,
            choice_index: choice,
            status: BetStatus::Active,
            is_winner: true,
            winning_amount: None,
            flagged: false,
            created_at: Utc::now(),
        }
    }

    // -- Pure math -------------------------------------------------------

    #[test]
    fn test_worked_example() {
        let winners = vec![bet(1, "A", 400, 0), bet(2, "B", 300, 0)];
        let plan = compute_payouts(1000, &winners, dec!(5)).unwrap();

        assert_eq!(plan.total_winning_amount, 700);
        let a = &plan.lines[0];
        assert_eq!((a.gross, a.fee, a.net), (571, 28, 543));
        let b = &plan.lines[1];
        assert_eq!((b.gross, b.fee, b.net), (428, 21, 407));
        assert_eq!(plan.total_net, 950);
        assert_eq!(plan.total_fees, 49);
        assert_eq!(plan.residual, 1);
        assert_eq!(plan.payout_ratio.unwrap().round_dp(4), dec!(1.4286));
    }

    #[test]
    fn test_no_winners_keeps_pot() {
        let plan = compute_payouts(500, &[], dec!(5)).unwrap();
        assert!(!plan.has_winners());
        assert_eq!(plan.payout_ratio, None);
        assert_eq!(plan.residual, 500);
    }

    #[test]
    fn test_zero_and_full_fee() {
        let winners = vec![bet(1, "A", 100, 0), bet(2, "B", 200, 0)];

        let free = compute_payouts(900, &winners, dec!(0)).unwrap();
        assert_eq!(free.total_net, 900);
        assert_eq!(free.total_fees, 0);

        let all_fee = compute_payouts(900, &winners, dec!(100)).unwrap();
        assert_eq!(all_fee.total_net, 0);
        assert_eq!(all_fee.total_fees, 900);
    }

    #[test]
    fn test_payouts_never_exceed_pot() {
        let winners = vec![bet(1, "A", 7, 0), bet(2, "B", 11, 0), bet(3, "C", 13, 0)];
        for fee in [dec!(0), dec!(2.5), dec!(5), dec!(33.33), dec!(99.9), dec!(100)] {
            for pot in [31, 97, 1_000, 12_345] {
                let plan = compute_payouts(pot, &winners, fee).unwrap();
                assert!(plan.total_net + plan.total_fees <= pot, "pot {pot} fee {fee}");
                assert!(plan.residual >= 0);
            }
        }
    }

    #[test]
    fn test_rejects_impossible_inputs() {
        let zero = vec![Bet { amount: 0, ..bet(1, "A", 1, 0) }];
        assert!(matches!(
            compute_payouts(100, &zero, dec!(5)),
            Err(WagerError::Computation(_))
        ));

        let big = vec![bet(1, "A", 500, 0)];
        assert!(compute_payouts(100, &big, dec!(5)).is_err());
        assert!(compute_payouts(1_000, &big, dec!(101)).is_err());
    }

    // -- Engine ----------------------------------------------------------

    struct Fixture {
        engine: SettlementEngine,
        ledger: BetLedger,
        store: Store,
        event_id: EventId,
    }

    async fn fixture() -> Fixture {
        let store = setup_store().await;
        let event_id = open_event(&store, &["Home", "Away"]).await;
        let ledger = BetLedger::new(store.clone(), 5_000);
        let engine = SettlementEngine::new(store.clone(), ledger.clone(), announcer(), 7);
        Fixture {
            engine,
            ledger,
            store,
            event_id,
        }
    }

    async fn set_status(store: &Store, id: EventId, status: EventStatus) {
        let mut conn = store.pool().acquire().await.unwrap();
        events::set_status(&mut conn, id, status, None).await.unwrap();
    }

    async fn place_example_bets(f: &Fixture) -> Vec<Bet> {
        let mut placed = Vec::new();
        for (user, amount, choice) in [("A", 400, 0), ("B", 300, 0), ("C", 200, 1), ("D", 100, 1)] {
            placed.push(f.ledger.place_bet(f.event_id, user, choice, amount).await.unwrap());
        }
        placed
    }

    #[tokio::test]
    async fn test_finalize_worked_example() {
        let f = fixture().await;
        place_example_bets(&f).await;
        set_status(&f.store, f.event_id, EventStatus::Locked).await;

        let outcome = f.engine.finalize(f.event_id, Outcome::Choice(0), "op").await.unwrap();
        assert!(outcome.is_first());
        let report = outcome.report();
        assert_eq!(report.pot, 1000);
        assert_eq!(report.total_payout, 950);
        assert_eq!(report.winners_count, 2);
        assert_eq!(report.losers_count, 2);
        let amounts: Vec<(i64, i64)> = report.payouts.iter().map(|p| (p.amount, p.fee_amount)).collect();
        assert_eq!(amounts, vec![(543, 28), (407, 21)]);

        let event = f.store.event(f.event_id).await.unwrap();
        assert_eq!(event.status, EventStatus::Completed);
        assert!(event.winner_approved);
        assert_eq!(event.total_payout, 950);
        assert_eq!(event.winning_outcome, Some(Outcome::Choice(0)));
        assert_eq!(event.total_bets_amount, 1000);

        let bets = f.ledger.list_by_event(f.event_id).await.unwrap();
        let summary: Vec<(BetStatus, bool, Option<i64>)> = bets
            .iter()
            .map(|b| (b.status, b.is_winner, b.winning_amount))
            .collect();
        assert_eq!(
            summary,
            vec![
                (BetStatus::Won, true, Some(543)),
                (BetStatus::Won, true, Some(407)),
                (BetStatus::Lost, false, None),
                (BetStatus::Lost, false, None),
            ]
        );
    }

    #[tokio::test]
    async fn test_finalize_twice_is_a_no_op() {
        let f = fixture().await;
        place_example_bets(&f).await;
        set_status(&f.store, f.event_id, EventStatus::Locked).await;

        let first = f
            .engine
            .finalize(f.event_id, Outcome::Choice(0), "op")
            .await
            .unwrap()
            .into_report();
        let second = f.engine.finalize(f.event_id, Outcome::Choice(0), "op").await.unwrap();
        assert!(!second.is_first());
        assert_eq!(second.report(), &first);
        assert_eq!(f.engine.list_payouts(f.event_id).await.unwrap().len(), 2);

        // a different outcome does not resettle either
        let third = f.engine.finalize(f.event_id, Outcome::Choice(1), "op").await.unwrap();
        assert_eq!(third.report(), &first);
    }

    #[tokio::test]
    async fn test_finalize_requires_locked() {
        let f = fixture().await;
        place_example_bets(&f).await;

        let err = f.engine.finalize(f.event_id, Outcome::Choice(0), "op").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::StateConflict);

        let event = f.store.event(f.event_id).await.unwrap();
        assert!(!event.winner_approved);
        assert!(f.engine.list_payouts(f.event_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_finalize_bad_choice_leaves_event_untouched() {
        let f = fixture().await;
        place_example_bets(&f).await;
        set_status(&f.store, f.event_id, EventStatus::Paused).await;

        let err = f.engine.finalize(f.event_id, Outcome::Choice(5), "op").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        let event = f.store.event(f.event_id).await.unwrap();
        assert_eq!(event.status, EventStatus::Paused);
        assert!(!event.winner_approved);
    }

    #[tokio::test]
    async fn test_finalize_with_no_winners() {
        let f = fixture().await;
        f.ledger.place_bet(f.event_id, "A", 0, 100).await.unwrap();
        set_status(&f.store, f.event_id, EventStatus::Locked).await;

        let report = f
            .engine
            .finalize(f.event_id, Outcome::Choice(1), "op")
            .await
            .unwrap()
            .into_report();
        assert_eq!(report.winners_count, 0);
        assert_eq!(report.losers_count, 1);
        assert!(report.payouts.is_empty());
        assert_eq!(report.residual, 100);
    }

    #[tokio::test]
    async fn test_custom_outcome_uses_manual_flags() {
        let f = fixture().await;
        let placed = place_example_bets(&f).await;

        // C and D picked manually
        f.engine.toggle_winner(placed[2].id, "op").await.unwrap();
        let d = f.engine.toggle_winner(placed[3].id, "op").await.unwrap();
        assert!(d.is_winner);
        set_status(&f.store, f.event_id, EventStatus::Locked).await;

        let report = f
            .engine
            .finalize(f.event_id, Outcome::Custom("Abandoned, replay".into()), "op")
            .await
            .unwrap()
            .into_report();
        assert_eq!(report.outcome_label, "Abandoned, replay");
        assert_eq!(report.winners_count, 2);
        // 200 * 1000/300 = 666 gross, 100 * 1000/300 = 333 gross
        let nets: Vec<i64> = report.payouts.iter().map(|p| p.amount).collect();
        assert_eq!(nets, vec![666 - 33, 333 - 16]);

        let err = f.engine.toggle_winner(placed[0].id, "op").await.unwrap_err();
        assert!(matches!(err, WagerError::AlreadyFinalized(_)));
    }

    #[tokio::test]
    async fn test_select_winners_and_preview() {
        let f = fixture().await;
        place_example_bets(&f).await;

        let selection = f
            .engine
            .select_winners(f.event_id, &Outcome::Choice(1), "op")
            .await
            .unwrap();
        assert_eq!(selection.winners.len(), 2);
        assert_eq!(selection.plan.total_winning_amount, 300);

        let preview = f.engine.preview(f.event_id).await.unwrap();
        assert_eq!(preview.plan, selection.plan);

        let cleared = f
            .engine
            .select_winners(f.event_id, &Outcome::Custom("void".into()), "op")
            .await
            .unwrap();
        assert!(cleared.winners.is_empty());
        assert!(f.engine.list_payouts(f.event_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_toggle_requires_active_bet() {
        let f = fixture().await;
        let bet = f.ledger.place_bet(f.event_id, "A", 0, 100).await.unwrap();
        f.ledger.cancel_bet(bet.id, "A").await.unwrap();

        let err = f.engine.toggle_winner(bet.id, "op").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::StateConflict);
    }

    #[tokio::test]
    async fn test_odds() {
        let f = fixture().await;
        place_example_bets(&f).await;

        let odds = f.engine.compute_current_odds(f.event_id).await.unwrap();
        assert_eq!(odds.pot, 1000);
        let home = &odds.choices[0];
        assert_eq!((home.staked, home.bet_count), (700, 2));
        assert_eq!(home.pot_share, dec!(0.7));
        // 1000 / 700 * 0.95
        assert_eq!(home.multiplier, Some(dec!(1.36)));
        let away = &odds.choices[1];
        assert_eq!(away.multiplier, Some(dec!(3.17)));
    }

    #[tokio::test]
    async fn test_odds_without_stake() {
        let f = fixture().await;
        f.ledger.place_bet(f.event_id, "A", 0, 100).await.unwrap();
        let odds = f.engine.compute_current_odds(f.event_id).await.unwrap();
        assert_eq!(odds.choices[1].staked, 0);
        assert_eq!(odds.choices[1].multiplier, None);
        assert_eq!(odds.choices[1].pot_share, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_payout_administration() {
        let f = fixture().await;
        place_example_bets(&f).await;
        set_status(&f.store, f.event_id, EventStatus::Locked).await;
        f.engine.finalize(f.event_id, Outcome::Choice(0), "op").await.unwrap();

        let list = f.engine.list_payouts(f.event_id).await.unwrap();
        let paid = f
            .engine
            .mark_payout(list[0].id, PayoutStatus::Completed, "cashier")
            .await
            .unwrap();
        assert_eq!(paid.status, PayoutStatus::Completed);
        assert_eq!(paid.processed_by.as_deref(), Some("cashier"));

        let err = f
            .engine
            .mark_payout(list[0].id, PayoutStatus::Cancelled, "cashier")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::StateConflict);
        assert!(f.engine.mark_payout(list[1].id, PayoutStatus::Pending, "x").await.is_err());
        let missing = f
            .engine
            .mark_payout(9_999, PayoutStatus::Completed, "cashier")
            .await
            .unwrap_err();
        assert_eq!(missing.kind(), ErrorKind::NotFound);

        // nothing is due yet
        assert_eq!(f.engine.expire_overdue_payouts(Utc::now()).await.unwrap(), 0);
        let later = Utc::now() + Duration::days(8);
        assert_eq!(f.engine.expire_overdue_payouts(later).await.unwrap(), 1);

        let list = f.engine.list_payouts(f.event_id).await.unwrap();
        assert_eq!(list[1].status, PayoutStatus::Expired);
        assert_eq!(list[0].status, PayoutStatus::Completed);
    }
}
