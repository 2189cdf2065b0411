mod common;

use std::time::Duration;

use common::harness;
use duelnet::battle::{BattleState, EndReason, Outcome};
use duelnet::protocol::PlayerResult;
use duelnet::{Config, ServerEvent};
use tokio::time::{sleep, Instant};

#[tokio::test(start_paused = true)]
async fn test_grace_expiry_forfeits_absent_side() {
    let h = harness(Config::default());
    let (alice, mut bob, _battle_id) = h.started_battle().await;

    sleep(Duration::from_secs(100)).await;
    alice.disconnect();
    let dropped_at = Instant::now();

    match bob.expect("opponent_disconnected").await {
        ServerEvent::OpponentDisconnected(presence) => {
            assert_eq!(presence.user_id, "alice");
            assert_eq!(presence.grace_seconds, Some(30));
        }
        other => panic!("unexpected {:?}", other),
    }

    let end = bob.expect_battle_end().await;
    let waited = dropped_at.elapsed();
    assert!(waited >= Duration::from_secs(30) && waited < Duration::from_secs(31), "{:?}", waited);
    assert_eq!(end.outcome, Outcome::Forfeit { loser: "alice".into() });
    assert_eq!(end.reason, EndReason::DisconnectGraceExpired);
    assert_eq!(end.result, PlayerResult::Won);
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_inside_grace_resumes() {
    let h = harness(Config::default());
    let (alice, mut bob, battle_id) = h.started_battle().await;

    alice.submit(&battle_id, "print('draft')").await;
    bob.expect_submit_result().await;
    alice.disconnect();
    sleep(Duration::from_secs(10)).await;

    let mut alice = alice.reconnect();
    let snapshot = alice.expect_state().await;
    assert_eq!(snapshot.battle_id, battle_id);
    assert_eq!(snapshot.state, BattleState::InProgress);
    assert_eq!(snapshot.opponent.username, "Bob");
    assert_eq!(snapshot.you.last_code.as_deref(), Some("print('draft')"));
    assert_eq!(snapshot.you.submissions, 1);
    assert!(snapshot.remaining_seconds <= 1790);

    bob.expect("opponent_reconnected").await;

    // The cancelled grace timer must not fire.
    sleep(Duration::from_secs(60)).await;
    assert!(h.orchestrator.registry().is_active("alice"));
    bob.drain();
    assert_eq!(bob.received("battle_end"), 0);

    alice.submit(&battle_id, "ACCEPT").await;
    bob.forfeit(&battle_id).await;
    assert_eq!(alice.expect_battle_end().await.result, PlayerResult::Won);
}

#[tokio::test(start_paused = true)]
async fn test_join_battle_resends_state() {
    let h = harness(Config::default());
    let (mut alice, _bob, battle_id) = h.started_battle().await;

    alice.join_battle(&battle_id).await;
    let snapshot = alice.expect_state().await;
    assert!(snapshot.opponent_connected);
    assert!(snapshot.outcome.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_second_connection_replaces_first() {
    let h = harness(Config::default());
    let (mut alice, mut bob, battle_id) = h.started_battle().await;

    let mut alice2 = alice.reconnect();
    alice.expect("session_replaced").await;
    alice.expect_closed().await;
    alice2.expect_state().await;

    // The superseded socket closing does not count as a disconnect.
    alice.disconnect();
    alice.submit(&battle_id, "ACCEPT").await;
    sleep(Duration::from_secs(45)).await;
    bob.drain();
    assert_eq!(bob.received("opponent_disconnected"), 0);
    assert_eq!(bob.received("submit_result"), 0);

    alice2.submit(&battle_id, "ACCEPT").await;
    assert_eq!(bob.expect_submit_result().await.user_id, "alice");
}

#[tokio::test(start_paused = true)]
async fn test_both_lapse_is_draw_and_resynced() {
    let h = harness(Config::default());
    let (alice, bob, battle_id) = h.started_battle().await;

    alice.disconnect();
    sleep(Duration::from_secs(5)).await;
    bob.disconnect();
    sleep(Duration::from_secs(40)).await;

    let mut alice = alice.reconnect();
    let snapshot = alice.expect_state().await;
    assert_eq!(snapshot.state, BattleState::Drawn);

    let end = alice.expect_battle_end().await;
    assert_eq!(end.outcome, Outcome::Draw);
    assert_eq!(end.reason, EndReason::BothForfeited);
    assert_eq!(h.store.battle(&battle_id).unwrap().reason, EndReason::BothForfeited);
}

#[tokio::test(start_paused = true)]
async fn test_held_forfeit_resolves_when_opponent_returns() {
    let h = harness(Config::default());
    let (alice, bob, battle_id) = h.started_battle().await;

    alice.disconnect();
    sleep(Duration::from_secs(5)).await;
    bob.disconnect();
    // Alice's window has lapsed, Bob's has not.
    sleep(Duration::from_secs(27)).await;
    assert!(h.orchestrator.registry().is_active("bob"));

    let mut bob = bob.reconnect();
    let end = bob.expect_battle_end().await;
    assert_eq!(end.outcome, Outcome::Forfeit { loser: "alice".into() });
    assert_eq!(end.result, PlayerResult::Won);

    sleep(Duration::from_secs(1)).await;
    let record = h.store.battle(&battle_id).unwrap();
    assert_eq!(record.winner.as_deref(), Some("bob"));
}

#[tokio::test(start_paused = true)]
async fn test_lapsed_user_learns_reason_on_return() {
    let h = harness(Config::default());
    let (alice, mut bob, _battle_id) = h.started_battle().await;

    alice.disconnect();
    bob.expect_battle_end().await;

    let mut alice = alice.reconnect();
    let end = alice.expect_battle_end().await;
    assert_eq!(end.reason, EndReason::DisconnectGraceExpired);
    assert_eq!(end.result, PlayerResult::Lost);

    alice.join_queue().await;
    assert_eq!(h.orchestrator.matchmaker().position("alice"), Some(1));
    assert_eq!(alice.received("error"), 0);
}
