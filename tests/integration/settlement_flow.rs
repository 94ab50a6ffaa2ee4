//! Full event flow: open, bet, lock, settle, announce.
//!
//! Runs the real engine over an in-memory SQLite store. Announcements go
//! through the real operation queue into a recording `MockChannel`.

use std::sync::Arc;
use std::time::Duration;

use rust_decimal_macros::dec;
use wagerhall::config::BettingConfig;
use wagerhall::engine::queue::{OperationQueue, QueueConfig};
use wagerhall::engine::Engine;
use wagerhall::error::{ChannelError, ErrorKind, WagerError};
use wagerhall::platform::{Announcer, ChatChannel};
use wagerhall::storage::Store;
use wagerhall::types::{BetStatus, EventId, EventStatus, EventType, NewEvent, Outcome, PayoutStatus};

use crate::mock_channel::MockChannel;

struct Harness {
    engine: Engine,
    store: Store,
    channel: Arc<MockChannel>,
    queue: OperationQueue,
}

fn fast_queue() -> OperationQueue {
    OperationQueue::start(QueueConfig {
        base_spacing: Duration::from_millis(1),
        min_spacing: Duration::from_millis(1),
        max_spacing: Duration::from_millis(50),
        ..QueueConfig::default()
    })
}

async fn harness(retries: u32) -> Harness {
    harness_over(Store::in_memory().await.unwrap(), retries)
}

fn harness_over(store: Store, retries: u32) -> Harness {
    let channel = MockChannel::new();
    let queue = fast_queue();
    let announcer = Announcer::new(channel.clone(), queue.clone(), "hall", retries);
    let engine = Engine::new(store.clone(), announcer, &BettingConfig::default());
    Harness {
        engine,
        store,
        channel,
        queue,
    }
}

fn cup_final() -> NewEvent {
    NewEvent {
        name: "Cup final".into(),
        event_type: EventType::Sports,
        choices: vec!["Home".into(), "Away".into()],
        scheduled_time: None,
        terms: BettingConfig::default().terms(),
    }
}

async fn launch(h: &Harness) -> EventId {
    h.engine.lifecycle.launch(&cup_final(), "op").await.unwrap().id
}

/// Poll `check` until it holds or a second passes.
async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..100 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

async fn card_id(store: &Store, id: EventId) -> Option<String> {
    store.event(id).await.unwrap().card_message_id
}

// ---------------------------------------------------------------------------
// Worked example and settlement
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_worked_example_end_to_end() {
    let h = harness(0).await;
    let id = launch(&h).await;

    for (user, amount, choice) in [("A", 400, 0), ("B", 300, 0), ("C", 200, 1), ("D", 100, 1)] {
        h.engine.ledger.place_bet(id, user, choice, amount).await.unwrap();
    }
    h.engine.lifecycle.lock(id, "op").await.unwrap();

    let result = h.engine.settlement.finalize(id, Outcome::Choice(0), "op").await.unwrap();
    assert!(result.is_first());
    let report = result.into_report();
    assert_eq!(report.pot, 1000);
    assert_eq!(report.total_payout, 950);
    assert_eq!(report.total_fees, 49);
    assert_eq!(report.residual, 1);

    let mut payouts: Vec<(String, i64, i64)> = h
        .engine
        .settlement
        .list_payouts(id)
        .await
        .unwrap()
        .into_iter()
        .map(|p| (p.user_id, p.amount, p.fee_amount))
        .collect();
    payouts.sort();
    assert_eq!(
        payouts,
        vec![("A".to_string(), 543, 28), ("B".to_string(), 407, 21)]
    );

    let bets = h.engine.ledger.list_by_event(id).await.unwrap();
    for bet in &bets {
        let expected = if bet.choice_index == 0 { BetStatus::Won } else { BetStatus::Lost };
        assert_eq!(bet.status, expected, "{bet}");
    }

    h.queue.idle().await;
    assert!(h
        .channel
        .sent()
        .iter()
        .any(|m| m.content.starts_with("Results for Cup final")));
}

#[tokio::test]
async fn test_payouts_conserve_the_pot() {
    let h = harness(0).await;
    let id = launch(&h).await;
    let stakes = [("u1", 37, 0), ("u2", 91, 0), ("u3", 13, 0), ("u4", 250, 1), ("u5", 19, 1)];
    for (user, amount, choice) in stakes {
        h.engine.ledger.place_bet(id, user, choice, amount).await.unwrap();
    }
    h.engine.lifecycle.lock(id, "op").await.unwrap();

    let report = h
        .engine
        .settlement
        .finalize(id, Outcome::Choice(0), "op")
        .await
        .unwrap()
        .into_report();

    let pot: i64 = stakes.iter().map(|(_, a, _)| a).sum();
    assert_eq!(report.pot, pot);
    let paid: i64 = report.payouts.iter().map(|p| p.amount).sum();
    let fees: i64 = report.payouts.iter().map(|p| p.fee_amount).sum();
    assert_eq!(paid, report.total_payout);
    assert_eq!(paid + fees + report.residual, pot);
    assert!(paid + fees <= pot);
    assert!(report.residual >= 0 && report.residual < report.payouts.len() as i64 + 1);
}

#[tokio::test]
async fn test_concurrent_finalize_settles_once() {
    let h = harness(0).await;
    let id = launch(&h).await;
    h.engine.ledger.place_bet(id, "A", 0, 100).await.unwrap();
    h.engine.ledger.place_bet(id, "B", 1, 100).await.unwrap();
    h.engine.lifecycle.lock(id, "op").await.unwrap();

    let s1 = h.engine.settlement.clone();
    let s2 = h.engine.settlement.clone();
    let (r1, r2) = tokio::join!(
        s1.finalize(id, Outcome::Choice(0), "op-1"),
        s2.finalize(id, Outcome::Choice(0), "op-2"),
    );
    let (r1, r2) = (r1.unwrap(), r2.unwrap());

    assert_eq!([r1.is_first(), r2.is_first()].iter().filter(|f| **f).count(), 1);
    assert_eq!(r1.report(), r2.report());
    assert_eq!(h.engine.settlement.list_payouts(id).await.unwrap().len(), 1);

    // a later retry with another outcome still returns the stored result
    let again = h
        .engine
        .settlement
        .finalize(id, Outcome::Choice(1), "op")
        .await
        .unwrap();
    assert!(!again.is_first());
    assert_eq!(again.report().outcome, Outcome::Choice(0));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_payout_marks_conflict_cleanly() {
    let path = std::env::temp_dir().join(format!("wagerhall-{}.db", uuid::Uuid::new_v4()));
    let url = format!("sqlite://{}", path.display());
    let store = Store::connect(&url, 4, Duration::from_secs(5)).await.unwrap();
    let h = harness_over(store, 0);

    for round in 0..5 {
        let id = launch(&h).await;
        h.engine.ledger.place_bet(id, "A", 0, 100).await.unwrap();
        h.engine.ledger.place_bet(id, "B", 1, 100).await.unwrap();
        h.engine.lifecycle.lock(id, "op").await.unwrap();
        h.engine.settlement.finalize(id, Outcome::Choice(0), "op").await.unwrap();
        let payout_id = h.engine.settlement.list_payouts(id).await.unwrap()[0].id;

        let tasks: Vec<_> = ["cashier-1", "cashier-2"]
            .into_iter()
            .map(|actor| {
                let settlement = h.engine.settlement.clone();
                tokio::spawn(async move {
                    settlement.mark_payout(payout_id, PayoutStatus::Completed, actor).await
                })
            })
            .collect();
        let mut marked = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(payout) => {
                    assert_eq!(payout.status, PayoutStatus::Completed);
                    marked += 1;
                }
                Err(e) => assert_eq!(e.kind(), ErrorKind::StateConflict, "round {round}: {e}"),
            }
        }
        assert_eq!(marked, 1, "round {round}");
    }

    h.queue.shutdown().await;
    for suffix in ["", "-wal", "-shm"] {
        let _ = std::fs::remove_file(format!("{}{suffix}", path.display()));
    }
}

// ---------------------------------------------------------------------------
// Ledger rules
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_limits_are_enforced() {
    let h = harness(0).await;
    let id = launch(&h).await;
    let ledger = &h.engine.ledger;

    let too_small = ledger.place_bet(id, "u", 0, 5).await.unwrap_err();
    assert_eq!(too_small.kind(), ErrorKind::LimitExceeded);
    let too_big = ledger.place_bet(id, "u", 0, 10_001).await.unwrap_err();
    assert_eq!(too_big.kind(), ErrorKind::LimitExceeded);

    for _ in 0..3 {
        ledger.place_bet(id, "u", 0, 10).await.unwrap();
    }
    let fourth = ledger.place_bet(id, "u", 1, 10).await.unwrap_err();
    assert_eq!(fourth.kind(), ErrorKind::LimitExceeded);

    let event = h.store.event(id).await.unwrap();
    assert_eq!(event.total_bets_amount, 30);
    assert_eq!(event.total_bets_count, 3);
}

#[tokio::test]
async fn test_aggregates_match_bet_rows() {
    let h = harness(0).await;
    let id = launch(&h).await;
    let ledger = &h.engine.ledger;

    let a = ledger.place_bet(id, "a", 0, 120).await.unwrap();
    ledger.place_bet(id, "b", 1, 80).await.unwrap();
    ledger.place_bet(id, "c", 1, 45).await.unwrap();
    ledger.cancel_bet(a.id, "a").await.unwrap();

    let event = h.store.event(id).await.unwrap();
    let (pot, count) = ledger.pot(id).await.unwrap();
    assert_eq!((event.total_bets_amount, event.total_bets_count), (pot, count));
    assert_eq!((pot, count), (125, 2));
}

#[tokio::test]
async fn test_lock_race_is_all_or_nothing() {
    for _ in 0..10 {
        let h = harness(0).await;
        let id = launch(&h).await;

        let (bet, lock) = tokio::join!(
            h.engine.ledger.place_bet(id, "racer", 0, 50),
            h.engine.lifecycle.lock(id, "op"),
        );
        lock.unwrap();

        let event = h.store.event(id).await.unwrap();
        assert_eq!(event.status, EventStatus::Locked);
        match bet {
            Ok(_) => {
                assert_eq!(event.total_bets_amount, 50);
                assert_eq!(h.engine.ledger.list_by_event(id).await.unwrap().len(), 1);
            }
            Err(WagerError::EventLocked(locked)) => {
                assert_eq!(locked, id);
                assert_eq!(event.total_bets_amount, 0);
                assert!(h.engine.ledger.list_by_event(id).await.unwrap().is_empty());
            }
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
}

#[tokio::test]
async fn test_cancel_refunds_every_active_bet() {
    let h = harness(0).await;
    let id = launch(&h).await;
    h.engine.ledger.place_bet(id, "a", 0, 100).await.unwrap();
    h.engine.ledger.place_bet(id, "b", 1, 60).await.unwrap();

    let report = h.engine.lifecycle.cancel(id, "storm", "op").await.unwrap();
    assert_eq!(report.refund.bets, 2);
    assert_eq!(report.refund.amount, 160);
    assert_eq!(report.event.status, EventStatus::Cancelled);
    assert_eq!(report.event.total_bets_amount, 0);

    let bets = h.engine.ledger.list_by_event(id).await.unwrap();
    assert!(bets.iter().all(|b| b.status == BetStatus::Refunded));
    assert!(h.engine.settlement.list_payouts(id).await.unwrap().is_empty());

    let err = h
        .engine
        .settlement
        .finalize(id, Outcome::Choice(0), "op")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::StateConflict);
}

#[tokio::test]
async fn test_odds_track_the_pool() {
    let h = harness(0).await;
    let id = launch(&h).await;
    h.engine.ledger.place_bet(id, "a", 0, 300).await.unwrap();
    h.engine.ledger.place_bet(id, "b", 1, 100).await.unwrap();

    let odds = h.engine.settlement.compute_current_odds(id).await.unwrap();
    assert_eq!(odds.pot, 400);
    assert_eq!(odds.choices[0].staked, 300);
    assert_eq!(odds.choices[1].multiplier, Some(dec!(3.80)));
}

// ---------------------------------------------------------------------------
// Announcements and the queue
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_card_message_id_is_stored() {
    let h = harness(0).await;
    let id = launch(&h).await;
    let store = &h.store;

    assert!(eventually(|| async move { card_id(store, id).await.is_some() }).await);
    let stored = card_id(&h.store, id).await.unwrap();
    assert!(h.channel.sent().iter().any(|m| m.message_id == stored));

    // later changes edit the card in place
    h.engine.lifecycle.lock(id, "op").await.unwrap();
    h.queue.idle().await;
    assert!(h
        .channel
        .edited()
        .iter()
        .any(|e| e.message_id == stored && e.content.contains("Status: locked")));
}

#[tokio::test]
async fn test_rate_limits_back_off_then_recover() {
    let h = harness(0).await;
    h.channel.rate_limit_next(3);

    let mut results = Vec::new();
    for i in 0..4 {
        let channel = h.channel.clone();
        let queued = h.queue.enqueue(format!("ping:{i}"), move || async move {
            channel.send("hall", "ping").await
        });
        results.push(queued.await);
    }

    for r in &results[..3] {
        assert!(matches!(
            r,
            Err(WagerError::ExternalChannel(ChannelError::RateLimited { .. }))
        ));
    }
    assert!(results[3].is_ok());

    h.queue.idle().await;
    let stats = h.queue.stats();
    assert_eq!(stats.consecutive_failures, 0);
    assert_eq!(stats.failed, 3);
    // 1ms doubled three times, then one success decay
    assert!(stats.spacing > Duration::from_millis(1));
    assert!(stats.spacing < Duration::from_millis(8));
}

#[tokio::test]
async fn test_rate_limited_announcement_is_retried() {
    let h = harness(2).await;
    h.channel.rate_limit_next(1);

    let id = launch(&h).await;
    let (store, channel) = (&h.store, &h.channel);
    assert!(eventually(|| async move { channel.sent().len() >= 2 }).await);
    assert!(eventually(|| async move { card_id(store, id).await.is_some() }).await);

    let sent = h.channel.sent();
    assert!(sent.iter().any(|m| m.content.starts_with("Betting is open: Cup final")));
    assert!(sent.iter().all(|m| m.target == "hall"));
}
