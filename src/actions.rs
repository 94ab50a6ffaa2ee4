//! Operator action dispatch.
//!
//! Interactive components (buttons, selects, forms) identify themselves
//! with a `custom_id` of the form `<prefix>:<id>`. The router maps each
//! prefix to a typed [`ActionKind`]; the table is checked once at startup
//! so a typo or a duplicated prefix fails fast instead of silently never
//! matching. Form values arrive as a string map and are parsed into the
//! typed [`Action`] before anything touches the engine.

use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::engine::settlement::FinalizeOutcome;
use crate::engine::Engine;
use crate::error::{ErrorKind, WagerError};
use crate::platform::{Capability, PermissionCheck};
use crate::types::{BetId, EventId, Outcome, PayoutId, PayoutStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionKind {
    PlaceBet,
    LockEvent,
    UnlockEvent,
    PauseEvent,
    ResumeEvent,
    ReopenEvent,
    RescheduleEvent,
    CancelEvent,
    ToggleWinner,
    SelectWinners,
    FinalizeEvent,
    CancelBet,
    MarkPayout,
}

impl ActionKind {
    pub const ALL: [ActionKind; 13] = [
        ActionKind::PlaceBet,
        ActionKind::LockEvent,
        ActionKind::UnlockEvent,
        ActionKind::PauseEvent,
        ActionKind::ResumeEvent,
        ActionKind::ReopenEvent,
        ActionKind::RescheduleEvent,
        ActionKind::CancelEvent,
        ActionKind::ToggleWinner,
        ActionKind::SelectWinners,
        ActionKind::FinalizeEvent,
        ActionKind::CancelBet,
        ActionKind::MarkPayout,
    ];

    pub fn prefix(&self) -> &'static str {
        match self {
            ActionKind::PlaceBet => "bet_place",
            ActionKind::LockEvent => "event_lock",
            ActionKind::UnlockEvent => "event_unlock",
            ActionKind::PauseEvent => "event_pause",
            ActionKind::ResumeEvent => "event_resume",
            ActionKind::ReopenEvent => "event_reopen",
            ActionKind::RescheduleEvent => "event_reschedule",
            ActionKind::CancelEvent => "event_cancel",
            ActionKind::ToggleWinner => "winner_toggle",
            ActionKind::SelectWinners => "winner_select",
            ActionKind::FinalizeEvent => "event_finalize",
            ActionKind::CancelBet => "bet_cancel",
            ActionKind::MarkPayout => "payout_mark",
        }
    }

    /// Capability the actor needs. Bet cancellation is additionally
    /// allowed to the bet's owner.
    pub fn capability(&self) -> Capability {
        match self {
            ActionKind::PlaceBet => Capability::PlaceBet,
            ActionKind::ToggleWinner | ActionKind::SelectWinners | ActionKind::FinalizeEvent => {
                Capability::SelectWinners
            }
            ActionKind::MarkPayout => Capability::ManageFees,
            _ => Capability::ManageEvents,
        }
    }
}

/// A fully parsed operator or participant action.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    PlaceBet {
        event_id: EventId,
        choice_index: usize,
        amount: i64,
    },
    Lock(EventId),
    Unlock(EventId),
    Pause(EventId),
    Resume(EventId),
    Reopen {
        event_id: EventId,
        reason: String,
    },
    Reschedule {
        event_id: EventId,
        when: String,
    },
    Cancel {
        event_id: EventId,
        reason: String,
    },
    ToggleWinner(BetId),
    SelectWinners {
        event_id: EventId,
        outcome: Outcome,
    },
    Finalize {
        event_id: EventId,
        outcome: Outcome,
    },
    CancelBet(BetId),
    MarkPayout {
        payout_id: PayoutId,
        status: PayoutStatus,
    },
}

impl Action {
    pub fn kind(&self) -> ActionKind {
        match self {
            Action::PlaceBet { .. } => ActionKind::PlaceBet,
            Action::Lock(_) => ActionKind::LockEvent,
            Action::Unlock(_) => ActionKind::UnlockEvent,
            Action::Pause(_) => ActionKind::PauseEvent,
            Action::Resume(_) => ActionKind::ResumeEvent,
            Action::Reopen { .. } => ActionKind::ReopenEvent,
            Action::Reschedule { .. } => ActionKind::RescheduleEvent,
            Action::Cancel { .. } => ActionKind::CancelEvent,
            Action::ToggleWinner(_) => ActionKind::ToggleWinner,
            Action::SelectWinners { .. } => ActionKind::SelectWinners,
            Action::Finalize { .. } => ActionKind::FinalizeEvent,
            Action::CancelBet(_) => ActionKind::CancelBet,
            Action::MarkPayout { .. } => ActionKind::MarkPayout,
        }
    }
}

pub type Fields = HashMap<String, String>;

#[derive(Debug, Clone)]
pub struct ActionRouter {
    table: HashMap<&'static str, ActionKind>,
}

impl ActionRouter {
    /// Build the prefix table, rejecting duplicate or malformed prefixes.
    pub fn new() -> Result<Self, WagerError> {
        let mut table = HashMap::new();
        for kind in ActionKind::ALL {
            let prefix = kind.prefix();
            if prefix.is_empty() || prefix.contains(':') {
                return Err(WagerError::Validation(format!(
                    "action prefix {prefix:?} is malformed"
                )));
            }
            if let Some(existing) = table.insert(prefix, kind) {
                return Err(WagerError::Validation(format!(
                    "action prefix {prefix} used by both {existing:?} and {kind:?}"
                )));
            }
        }
        debug!(actions = table.len(), "Action router ready");
        Ok(Self { table })
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    pub fn kind_of(&self, custom_id: &str) -> Option<ActionKind> {
        let prefix = custom_id.split_once(':').map_or(custom_id, |(p, _)| p);
        self.table.get(prefix).copied()
    }

    /// Turn a component id plus submitted form values into an [`Action`].
    pub fn parse(&self, custom_id: &str, fields: &Fields) -> Result<Action, WagerError> {
        let (prefix, raw_id) = custom_id
            .split_once(':')
            .ok_or_else(|| WagerError::Validation(format!("malformed action id: {custom_id}")))?;
        let kind = self
            .table
            .get(prefix)
            .copied()
            .ok_or_else(|| WagerError::Validation(format!("unknown action: {prefix}")))?;
        let id: i64 = raw_id
            .trim()
            .parse()
            .map_err(|_| WagerError::Validation(format!("malformed id in action: {custom_id}")))?;

        let action = match kind {
            ActionKind::PlaceBet => Action::PlaceBet {
                event_id: id,
                choice_index: choice(fields)?,
                amount: number(fields, "amount")?,
            },
            ActionKind::LockEvent => Action::Lock(id),
            ActionKind::UnlockEvent => Action::Unlock(id),
            ActionKind::PauseEvent => Action::Pause(id),
            ActionKind::ResumeEvent => Action::Resume(id),
            ActionKind::ReopenEvent => Action::Reopen {
                event_id: id,
                reason: text(fields, "reason"),
            },
            ActionKind::RescheduleEvent => Action::Reschedule {
                event_id: id,
                when: required(fields, "when")?,
            },
            ActionKind::CancelEvent => Action::Cancel {
                event_id: id,
                reason: text(fields, "reason"),
            },
            ActionKind::ToggleWinner => Action::ToggleWinner(id),
            ActionKind::SelectWinners => Action::SelectWinners {
                event_id: id,
                outcome: outcome(fields)?,
            },
            ActionKind::FinalizeEvent => Action::Finalize {
                event_id: id,
                outcome: outcome(fields)?,
            },
            ActionKind::CancelBet => Action::CancelBet(id),
            ActionKind::MarkPayout => Action::MarkPayout {
                payout_id: id,
                status: required(fields, "status")?.parse()?,
            },
        };
        Ok(action)
    }
}

fn text(fields: &Fields, name: &str) -> String {
    fields.get(name).map(|v| v.trim().to_string()).unwrap_or_default()
}

fn required(fields: &Fields, name: &str) -> Result<String, WagerError> {
    let value = text(fields, name);
    if value.is_empty() {
        return Err(WagerError::Validation(format!("{name} is required")));
    }
    Ok(value)
}

fn number<T: std::str::FromStr>(fields: &Fields, name: &str) -> Result<T, WagerError> {
    required(fields, name)?
        .parse()
        .map_err(|_| WagerError::Validation(format!("{name} must be a whole number")))
}

/// `choice` is the number shown on the event card, starting at 1.
fn choice(fields: &Fields) -> Result<usize, WagerError> {
    let n: usize = number(fields, "choice")?;
    n.checked_sub(1)
        .ok_or_else(|| WagerError::Validation("choices are numbered from 1".into()))
}

/// `choice` wins over `custom` (free text).
fn outcome(fields: &Fields) -> Result<Outcome, WagerError> {
    if fields.get("choice").is_some_and(|v| !v.trim().is_empty()) {
        return Ok(Outcome::Choice(choice(fields)?));
    }
    match required(fields, "custom") {
        Ok(text) => Ok(Outcome::Custom(text)),
        Err(_) => Err(WagerError::Validation(
            "pick a winning choice or enter a custom result".into(),
        )),
    }
}

/// Text returned to the actor after an action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionReply {
    pub ok: bool,
    pub message: String,
}

impl ActionReply {
    pub(crate) fn ok(message: impl Into<String>) -> Self {
        Self {
            ok: true,
            message: message.into(),
        }
    }

    pub(crate) fn failed(err: &WagerError) -> Self {
        Self {
            ok: false,
            message: err.user_message(),
        }
    }
}

/// Permission-checked entry point from the chat platform into the engine.
pub struct Dispatcher {
    engine: Engine,
    permissions: Arc<dyn PermissionCheck>,
    router: ActionRouter,
}

impl Dispatcher {
    pub fn new(engine: Engine, permissions: Arc<dyn PermissionCheck>) -> Result<Self, WagerError> {
        Ok(Self {
            engine,
            permissions,
            router: ActionRouter::new()?,
        })
    }

    pub fn router(&self) -> &ActionRouter {
        &self.router
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn permits(&self, actor: &str, capability: Capability) -> bool {
        self.permissions.has_capability(actor, capability)
    }

    /// Parse, authorize and run one interaction. Never fails: errors are
    /// rendered into the reply.
    pub async fn handle(&self, actor: &str, custom_id: &str, fields: &Fields) -> ActionReply {
        let result = match self.router.parse(custom_id, fields) {
            Ok(action) => self.dispatch(actor, action).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(message) => ActionReply::ok(message),
            Err(e) => {
                match e.kind() {
                    ErrorKind::Internal => {
                        warn!(actor, custom_id, error = %e, "Action failed")
                    }
                    _ => debug!(actor, custom_id, error = %e, "Action rejected"),
                }
                ActionReply::failed(&e)
            }
        }
    }

    pub async fn dispatch(&self, actor: &str, action: Action) -> Result<String, WagerError> {
        self.authorize(actor, &action).await?;
        let engine = &self.engine;

        match action {
            Action::PlaceBet {
                event_id,
                choice_index,
                amount,
            } => {
                let bet = engine
                    .ledger
                    .place_bet(event_id, actor, choice_index, amount)
                    .await?;
                self.refresh_card(event_id).await;
                Ok(format!("Bet #{} placed: {amount} on choice {}", bet.id, choice_index + 1))
            }
            Action::Lock(id) => {
                let t = engine.lifecycle.lock(id, actor).await?;
                Ok(unchanged_or(t.changed, "Betting locked", "Betting was already locked"))
            }
            Action::Unlock(id) => {
                let t = engine.lifecycle.unlock(id, actor).await?;
                Ok(unchanged_or(t.changed, "Betting reopened", "Betting was already open"))
            }
            Action::Pause(id) => {
                let t = engine.lifecycle.pause(id, actor).await?;
                Ok(unchanged_or(t.changed, "Event paused", "Event was already paused"))
            }
            Action::Resume(id) => {
                let t = engine.lifecycle.resume(id, actor).await?;
                Ok(format!("Event is {}", t.event.status))
            }
            Action::Reopen { event_id, reason } => {
                let t = engine.lifecycle.reopen(event_id, &reason, actor).await?;
                Ok(unchanged_or(t.changed, "Event reopened for betting", "Event was already open"))
            }
            Action::Reschedule { event_id, when } => {
                let event = engine.lifecycle.reschedule(event_id, &when, actor).await?;
                let when = event
                    .scheduled_time
                    .map(|t| t.format("%Y-%m-%d %H:%M UTC").to_string())
                    .unwrap_or_default();
                Ok(format!("Event rescheduled to {when}"))
            }
            Action::Cancel { event_id, reason } => {
                let report = engine.lifecycle.cancel(event_id, &reason, actor).await?;
                Ok(format!(
                    "Event cancelled; {} bet(s) refunded ({} total)",
                    report.refund.bets, report.refund.amount
                ))
            }
            Action::ToggleWinner(bet_id) => {
                let bet = engine.settlement.toggle_winner(bet_id, actor).await?;
                Ok(if bet.is_winner {
                    format!("Bet #{bet_id} marked as a winner")
                } else {
                    format!("Bet #{bet_id} no longer a winner")
                })
            }
            Action::SelectWinners { event_id, outcome } => {
                let selection = engine
                    .settlement
                    .select_winners(event_id, &outcome, actor)
                    .await?;
                Ok(format!(
                    "{} winning bet(s); payout {} with {} in fees",
                    selection.winners.len(),
                    selection.plan.total_net,
                    selection.plan.total_fees
                ))
            }
            Action::Finalize { event_id, outcome } => {
                let result = engine.settlement.finalize(event_id, outcome, actor).await?;
                let report = result.report();
                let prefix = match &result {
                    FinalizeOutcome::Finalized(_) => "Event finalized",
                    FinalizeOutcome::AlreadyFinalized(_) => "Event was already finalized",
                };
                Ok(format!(
                    "{prefix}: {} ({} winner(s), {} paid out)",
                    report.outcome_label, report.winners_count, report.total_payout
                ))
            }
            Action::CancelBet(bet_id) => {
                let bet = engine.ledger.cancel_bet(bet_id, actor).await?;
                self.refresh_card(bet.event_id).await;
                Ok(format!("Bet #{bet_id} cancelled"))
            }
            Action::MarkPayout { payout_id, status } => {
                let payout = engine.settlement.mark_payout(payout_id, status, actor).await?;
                Ok(format!("Payout #{payout_id} marked {}", payout.status))
            }
        }
    }

    async fn authorize(&self, actor: &str, action: &Action) -> Result<(), WagerError> {
        let capability = action.kind().capability();
        if self.permissions.has_capability(actor, capability) {
            return Ok(());
        }
        // bettors may withdraw their own bets
        if let Action::CancelBet(bet_id) = action {
            if self.engine.ledger.bet(*bet_id).await?.user_id == actor {
                return Ok(());
            }
        }
        Err(WagerError::PermissionDenied {
            actor: actor.to_string(),
            capability: capability.to_string(),
        })
    }

    async fn refresh_card(&self, event_id: EventId) {
        if let Err(e) = self.engine.lifecycle.refresh_card(event_id).await {
            warn!(event_id, error = %e, "Card refresh skipped");
        }
    }
}

fn unchanged_or(changed: bool, done: &str, already: &str) -> String {
    let text = if changed { done } else { already };
    text.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BettingConfig;
    use crate::engine::testutil::{announcer, open_event, setup_store};
    use crate::platform::{MockPermissionCheck, StaticPermissions};
    use crate::storage::Store;

    fn fields(pairs: &[(&str, &str)]) -> Fields {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    async fn dispatcher(permissions: Arc<dyn PermissionCheck>) -> (Dispatcher, Store, EventId) {
        let store = setup_store().await;
        let id = open_event(&store, &["Home", "Away"]).await;
        let engine = Engine::new(store.clone(), announcer(), &BettingConfig::default());
        (Dispatcher::new(engine, permissions).unwrap(), store, id)
    }

    #[test]
    fn test_router_covers_every_kind() {
        let router = ActionRouter::new().unwrap();
        for kind in ActionKind::ALL {
            let id = format!("{}:1", kind.prefix());
            assert_eq!(router.kind_of(&id), Some(kind));
        }
        assert_eq!(router.kind_of("nope:1"), None);
    }

    #[test]
    fn test_parse_place_bet() {
        let router = ActionRouter::new().unwrap();
        let action = router
            .parse("bet_place:7", &fields(&[("choice", "2"), ("amount", " 250 ")]))
            .unwrap();
        assert_eq!(
            action,
            Action::PlaceBet {
                event_id: 7,
                choice_index: 1,
                amount: 250
            }
        );

        let err = router
            .parse("bet_place:7", &fields(&[("choice", "0"), ("amount", "250")]))
            .unwrap_err();
        assert!(matches!(err, WagerError::Validation(_)));

        let err = router
            .parse("bet_place:7", &fields(&[("choice", "1"), ("amount", "lots")]))
            .unwrap_err();
        assert!(matches!(err, WagerError::Validation(_)));
    }

    #[test]
    fn test_parse_outcomes() {
        let router = ActionRouter::new().unwrap();
        assert_eq!(
            router.parse("event_finalize:3", &fields(&[("choice", "1")])).unwrap(),
            Action::Finalize {
                event_id: 3,
                outcome: Outcome::Choice(0)
            }
        );
        assert_eq!(
            router
                .parse("winner_select:3", &fields(&[("custom", "Draw by agreement")]))
                .unwrap(),
            Action::SelectWinners {
                event_id: 3,
                outcome: Outcome::Custom("Draw by agreement".into())
            }
        );
        assert!(router.parse("event_finalize:3", &Fields::new()).is_err());
    }

    #[test]
    fn test_parse_rejects_malformed_ids() {
        let router = ActionRouter::new().unwrap();
        assert!(router.parse("event_lock", &Fields::new()).is_err());
        assert!(router.parse("event_lock:abc", &Fields::new()).is_err());
        assert!(router.parse("event_explode:1", &Fields::new()).is_err());
        assert_eq!(
            router
                .parse("payout_mark:9", &fields(&[("status", "paid")]))
                .unwrap(),
            Action::MarkPayout {
                payout_id: 9,
                status: PayoutStatus::Completed
            }
        );
    }

    #[tokio::test]
    async fn test_permission_denied_without_capability() {
        let mut perms = MockPermissionCheck::new();
        perms
            .expect_has_capability()
            .withf(|actor, cap| actor == "mallory" && *cap == Capability::ManageEvents)
            .times(1)
            .return_const(false);

        let (dispatcher, store, id) = dispatcher(Arc::new(perms)).await;
        let reply = dispatcher
            .handle("mallory", &format!("event_lock:{id}"), &Fields::new())
            .await;
        assert!(!reply.ok);
        assert_eq!(reply.message, "You don't have permission to do that.");
        assert_eq!(store.event(id).await.unwrap().status, crate::types::EventStatus::Open);
    }

    #[tokio::test]
    async fn test_owner_may_cancel_own_bet() {
        let perms = StaticPermissions::with_operators(["op"]);
        let (dispatcher, _, id) = dispatcher(Arc::new(perms)).await;

        let reply = dispatcher
            .handle("u1", &format!("bet_place:{id}"), &fields(&[("choice", "1"), ("amount", "50")]))
            .await;
        assert!(reply.ok, "{}", reply.message);

        let bet_id = dispatcher.engine.ledger.list_by_event(id).await.unwrap()[0].id;
        let stranger = dispatcher
            .handle("u2", &format!("bet_cancel:{bet_id}"), &Fields::new())
            .await;
        assert!(!stranger.ok);

        let owner = dispatcher
            .handle("u1", &format!("bet_cancel:{bet_id}"), &Fields::new())
            .await;
        assert!(owner.ok, "{}", owner.message);
    }

    #[tokio::test]
    async fn test_operator_flow_through_dispatcher() {
        let perms = StaticPermissions::with_operators(["op"]);
        let (dispatcher, _, id) = dispatcher(Arc::new(perms)).await;

        for (user, choice, amount) in [("a", "1", "400"), ("b", "1", "300"), ("c", "2", "300")] {
            let reply = dispatcher
                .handle(
                    user,
                    &format!("bet_place:{id}"),
                    &fields(&[("choice", choice), ("amount", amount)]),
                )
                .await;
            assert!(reply.ok, "{}", reply.message);
        }

        let locked = dispatcher.handle("op", &format!("event_lock:{id}"), &Fields::new()).await;
        assert_eq!(locked.message, "Betting locked");

        let late = dispatcher
            .handle("d", &format!("bet_place:{id}"), &fields(&[("choice", "2"), ("amount", "20")]))
            .await;
        assert!(!late.ok);
        assert!(late.message.contains("locked"));

        let done = dispatcher
            .handle("op", &format!("event_finalize:{id}"), &fields(&[("choice", "1")]))
            .await;
        assert!(done.ok, "{}", done.message);
        assert!(done.message.starts_with("Event finalized: Home"));

        let again = dispatcher
            .handle("op", &format!("event_finalize:{id}"), &fields(&[("choice", "1")]))
            .await;
        assert!(again.message.starts_with("Event was already finalized"));
    }
}
