mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{harness, PROBLEM};
use duelnet::battle::{EndReason, Outcome};
use duelnet::judge::JudgeStatus;
use duelnet::protocol::{AttemptKind, PlayerResult};
use duelnet::{Config, ErrorCode, MemoryStore, Orchestrator, ServerEvent};
use duelnet_test_support::{ChaosJudge, ScriptedJudge, TestClient};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::time::Instant;

#[tokio::test(start_paused = true)]
async fn test_expiry_without_accept_is_draw() {
    let h = harness(Config::default());
    let (mut alice, mut bob, battle_id) = h.started_battle().await;
    let started = Instant::now();

    bob.submit(&battle_id, "print('close')").await;
    assert_eq!(
        alice.expect_submit_result().await.pass_summary.status,
        JudgeStatus::WrongAnswer
    );

    let end = alice.expect_battle_end().await;
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(1800) && elapsed < Duration::from_secs(1801));
    assert_eq!(end.outcome, Outcome::Draw);
    assert_eq!(end.reason, EndReason::TimeExpired);
    assert_eq!(end.result, PlayerResult::Draw);
    assert_eq!(end.opponent_name, "Bob");

    let end = bob.expect_battle_end().await;
    assert_eq!(end.opponent_name, "Alice");
    assert!(!h.orchestrator.registry().is_active("alice"));
}

#[tokio::test(start_paused = true)]
async fn test_accept_with_pending_run_wins_at_expiry() {
    let h = harness(Config::default());
    let (mut alice, mut bob, battle_id) = h.started_battle().await;

    alice.run(&battle_id, "SLEEP:5000 print(1)").await;
    alice.submit(&battle_id, "ACCEPT").await;

    let result = bob.expect_submit_result().await;
    assert_eq!(result.user_id, "alice");
    assert_eq!(result.pass_summary.status, JudgeStatus::Accepted);
    assert_eq!(result.pass_summary.attempt, 1);
    // The first accept fixes the winner but the battle stays open.
    assert!(h.orchestrator.registry().is_active("bob"));

    alice.expect("run_result").await;
    let end = bob.expect_battle_end().await;
    assert_eq!(end.outcome, Outcome::Win { winner: "alice".into() });
    assert_eq!(end.reason, EndReason::Accepted);
    assert_eq!(end.result, PlayerResult::Lost);
    assert_eq!(alice.expect_battle_end().await.result, PlayerResult::Won);
}

#[tokio::test(start_paused = true)]
async fn test_second_accept_ends_battle_for_earlier_solver() {
    let h = harness(Config::default());
    let (mut alice, bob, battle_id) = h.started_battle().await;

    alice.submit(&battle_id, "SLEEP:100 ACCEPT").await;
    bob.submit(&battle_id, "SLEEP:200 ACCEPT").await;

    let started = Instant::now();
    let end = alice.expect_battle_end().await;
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(end.outcome, Outcome::Win { winner: "alice".into() });
}

#[tokio::test(start_paused = true)]
async fn test_end_on_first_accept() {
    let h = harness(Config::default().with_end_on_first_accept(true));
    let (mut alice, mut bob, battle_id) = h.started_battle().await;

    bob.submit(&battle_id, "ACCEPT").await;
    let end = alice.expect_battle_end().await;
    assert_eq!(end.outcome, Outcome::Win { winner: "bob".into() });
    assert_eq!(bob.expect_battle_end().await.result, PlayerResult::Won);
}

#[tokio::test(start_paused = true)]
async fn test_run_result_is_private() {
    let h = harness(Config::default());
    let (mut alice, mut bob, battle_id) = h.started_battle().await;

    alice.run(&battle_id, "print(42)").await;

    match bob.expect("attempt_notification").await {
        ServerEvent::AttemptNotification(note) => {
            assert_eq!(note.side, "alice");
            assert_eq!(note.kind, AttemptKind::Run);
        }
        other => panic!("unexpected {:?}", other),
    }
    match alice.expect("run_result").await {
        ServerEvent::RunResult(run) => {
            assert_eq!(run.result.status, JudgeStatus::WrongAnswer);
            assert_eq!(run.result.test_case_results.len(), 1);
        }
        other => panic!("unexpected {:?}", other),
    }

    tokio::time::sleep(Duration::from_secs(1)).await;
    bob.drain();
    assert_eq!(bob.received("run_result"), 0);
    assert_eq!(alice.received("attempt_notification"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_double_submit_rejected() {
    let h = harness(Config::default());
    let (mut alice, _bob, battle_id) = h.started_battle().await;

    alice.submit(&battle_id, "SLEEP:1000 print(1)").await;
    alice.submit(&battle_id, "ACCEPT").await;

    let error = alice.expect_error(ErrorCode::InvalidState).await;
    assert_eq!(error.battle_id.as_deref(), Some(battle_id.as_str()));
    assert_eq!(alice.expect_submit_result().await.pass_summary.attempt, 1);
    assert_eq!(h.judge.call_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_actions_before_start_are_invalid() {
    let h = harness(Config::default());
    let mut alice = h.client("alice", "Alice");
    let bob = h.client("bob", "Bob");
    alice.join_queue().await;
    bob.join_queue().await;

    let found = alice.expect_battle_found().await;
    alice.submit(&found.battle_id, "ACCEPT").await;
    alice.expect_error(ErrorCode::InvalidState).await;
    assert_eq!(alice.received("battle_started"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_judge_failure_is_recoverable() {
    let h = harness(Config::default());
    let (mut alice, mut bob, battle_id) = h.started_battle().await;

    alice.submit(&battle_id, "CRASH").await;
    let error = alice.expect_error(ErrorCode::JudgeError).await;
    assert!(error.message.contains("container crashed"));
    assert_eq!(
        alice.expect_submit_result().await.pass_summary.status,
        JudgeStatus::Error
    );

    alice.submit(&battle_id, "ACCEPT").await;
    let result = bob.expect_submit_result().await;
    let result = if result.pass_summary.status == JudgeStatus::Error {
        bob.expect_submit_result().await
    } else {
        result
    };
    assert_eq!(result.pass_summary.status, JudgeStatus::Accepted);
    assert_eq!(result.pass_summary.attempt, 2);
}

#[tokio::test(start_paused = true)]
async fn test_judge_timeout_is_judge_error() {
    let h = harness(Config::default().with_judge_timeout(30));
    let (mut alice, _bob, battle_id) = h.started_battle().await;

    let sent = Instant::now();
    alice.run(&battle_id, "HANG").await;
    let error = alice.expect_error(ErrorCode::JudgeError).await;
    assert!(error.message.contains("timed out"));
    assert!(sent.elapsed() >= Duration::from_secs(30));

    // The run slot is free again.
    alice.run(&battle_id, "print(1)").await;
    alice.expect("run_result").await;
    alice.expect("run_result").await;
}

#[tokio::test(start_paused = true)]
async fn test_forfeit() {
    let h = harness(Config::default());
    let (mut alice, mut bob, battle_id) = h.started_battle().await;

    bob.forfeit(&battle_id).await;
    let end = alice.expect_battle_end().await;
    assert_eq!(end.outcome, Outcome::Forfeit { loser: "bob".into() });
    assert_eq!(end.reason, EndReason::Forfeit);
    assert_eq!(end.result, PlayerResult::Won);
    assert_eq!(bob.expect_battle_end().await.result, PlayerResult::Lost);

    // Decided battles reject further actions until evicted.
    alice.run(&battle_id, "print(1)").await;
    alice.expect_error(ErrorCode::InvalidState).await;
}

#[tokio::test(start_paused = true)]
async fn test_battle_evicted_after_grace() {
    let h = harness(Config::default());
    let (mut alice, _bob, battle_id) = h.started_battle().await;

    alice.forfeit(&battle_id).await;
    alice.expect_battle_end().await;
    assert_eq!(h.orchestrator.registry().count(), 1);

    tokio::time::sleep(Duration::from_secs(61)).await;
    assert_eq!(h.orchestrator.registry().count(), 0);

    alice.run(&battle_id, "print(1)").await;
    alice.expect_error(ErrorCode::Unauthorized).await;
}

#[tokio::test(start_paused = true)]
async fn test_late_verdict_does_not_change_outcome() {
    let h = harness(Config::default().with_time_limit(60));
    let (mut alice, _bob, battle_id) = h.started_battle().await;

    alice.submit(&battle_id, "SLEEP:90000 ACCEPT").await;
    let end = alice.expect_battle_end().await;
    assert_eq!(end.outcome, Outcome::Draw);

    tokio::time::sleep(Duration::from_secs(40)).await;
    let submissions = h.store.submissions(&battle_id);
    assert_eq!(submissions.len(), 1);
    assert!(submissions[0].after_outcome);
    assert_eq!(submissions[0].status, JudgeStatus::Accepted);
    assert_eq!(h.store.battle(&battle_id).unwrap().outcome, Outcome::Draw);
    assert_eq!(alice.received("battle_end"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_outsider_is_unauthorized() {
    let h = harness(Config::default());
    let (_alice, _bob, battle_id) = h.started_battle().await;
    let mut carol = h.client("carol", "Carol");

    carol.submit(&battle_id, "ACCEPT").await;
    let error = carol.expect_error(ErrorCode::Unauthorized).await;
    assert_eq!(error.battle_id.as_deref(), Some(battle_id.as_str()));

    carol.forfeit("no-such-battle").await;
    carol.expect_error(ErrorCode::Unauthorized).await;
    assert_eq!(h.judge.call_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_invalid_payloads() {
    let h = harness(Config::default());
    let (mut alice, _bob, battle_id) = h.started_battle().await;

    alice.send_text("{not json").await;
    alice.expect_error(ErrorCode::InvalidPayload).await;

    alice.send_text(r#"{"event":"bogus"}"#).await;
    alice.expect_error(ErrorCode::InvalidPayload).await;

    alice.submit(&battle_id, "   ").await;
    alice.expect_error(ErrorCode::InvalidPayload).await;

    let huge = "x".repeat(50_001);
    alice.run(&battle_id, &huge).await;
    alice.expect_error(ErrorCode::InvalidPayload).await;

    assert_eq!(h.judge.call_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_run_rate_limit() {
    let mut config = Config::default();
    config.limits.runs_per_minute = 2;
    let h = harness(config);
    let (mut alice, _bob, battle_id) = h.started_battle().await;

    for _ in 0..2 {
        alice.run(&battle_id, "print(1)").await;
        alice.expect("run_result").await;
    }
    alice.run(&battle_id, "print(1)").await;
    let error = alice.expect_error(ErrorCode::RateLimited).await;
    assert!(error.retry_after_ms.unwrap() > 0);
    assert_eq!(h.judge.call_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_rejected_run_does_not_spend_token() {
    let mut config = Config::default();
    config.limits.runs_per_minute = 2;
    let h = harness(config);
    let (mut alice, _bob, battle_id) = h.started_battle().await;

    alice.run(&battle_id, "SLEEP:1000 print(1)").await;
    alice.run(&battle_id, "print(1)").await;
    alice.run(&battle_id, "print(1)").await;
    alice.expect_error(ErrorCode::InvalidState).await;
    alice.expect_error(ErrorCode::InvalidState).await;
    alice.expect("run_result").await;

    alice.run(&battle_id, "print(1)").await;
    alice.expect("run_result").await;
    alice.run(&battle_id, "print(1)").await;
    alice.expect_error(ErrorCode::RateLimited).await;
    assert_eq!(h.judge.call_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_sledge() {
    let h = harness(Config::default());
    let (mut alice, mut bob, battle_id) = h.started_battle().await;

    alice.sledge(&battle_id, "   ").await;
    alice.expect_error(ErrorCode::InvalidPayload).await;
    alice.sledge(&battle_id, &"a".repeat(101)).await;
    alice.expect_error(ErrorCode::InvalidPayload).await;

    alice.sledge(&battle_id, "  too slow  ").await;
    for client in [&mut alice, &mut bob] {
        match client.expect("sledge").await {
            ServerEvent::Sledge(message) => {
                assert_eq!(message.text, "too slow");
                assert_eq!(message.from_user_id, "alice");
                assert_eq!(message.from_username, "Alice");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    alice.sledge(&battle_id, "again").await;
    let error = alice.expect_error(ErrorCode::RateLimited).await;
    let retry = error.retry_after_ms.unwrap();
    assert!(retry > 59_000 && retry <= 60_000, "retry after {}", retry);

    // Bob has his own cooldown.
    bob.sledge(&battle_id, "we'll see").await;
    alice.expect("sledge").await;
}

/// Random run/submit/forfeit bursts from both sides against a judge with
/// random latency and failures, ending at expiry unless decided earlier.
#[tokio::test(start_paused = true)]
async fn test_random_interleavings_end_exactly_once() {
    const CODES: [&str; 4] = ["ACCEPT", "print(1)", "COMPILE_ERROR", "CRASH"];

    for seed in 0..12u64 {
        let mut rng = StdRng::seed_from_u64(seed);
        let judge = ChaosJudge::new(Arc::new(ScriptedJudge::new()))
            .with_failure_probability(0.2)
            .with_delay_range(0, 4000);
        let store = Arc::new(MemoryStore::with_problems([PROBLEM]));
        let orchestrator = Orchestrator::start(
            Config::default().with_time_limit(120),
            Arc::new(judge),
            store.clone(),
        )
        .unwrap();

        let mut alice = TestClient::connect(&orchestrator, "alice", "Alice");
        let mut bob = TestClient::connect(&orchestrator, "bob", "Bob");
        alice.join_queue().await;
        bob.join_queue().await;
        let battle_id = alice.expect_battle_start().await;
        bob.expect_battle_start().await;

        for _ in 0..60 {
            let client = if rng.gen_bool(0.5) { &alice } else { &bob };
            let code = CODES[rng.gen_range(0..CODES.len())];
            match rng.gen_range(0..100) {
                0..=44 => client.run(&battle_id, code).await,
                45..=96 => client.submit(&battle_id, code).await,
                _ => client.forfeit(&battle_id).await,
            }
            // One run and one submit per side at most.
            assert!(orchestrator.judge_in_flight() <= 4, "seed {}", seed);
            if rng.gen_bool(0.6) {
                tokio::time::sleep(Duration::from_millis(rng.gen_range(0..3000))).await;
            }
        }

        // Past expiry and every outstanding verdict.
        tokio::time::sleep(Duration::from_secs(150)).await;
        alice.drain();
        bob.drain();

        assert_eq!(alice.received("battle_end"), 1, "seed {}", seed);
        assert_eq!(bob.received("battle_end"), 1, "seed {}", seed);
        let ends: Vec<_> = [&alice, &bob]
            .iter()
            .flat_map(|c| c.history().iter())
            .filter_map(|e| match e {
                ServerEvent::BattleEnd(end) => Some(end.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(ends[0].outcome, ends[1].outcome, "seed {}", seed);
        assert_eq!(ends[0].reason, ends[1].reason, "seed {}", seed);

        let record = store.battle(&battle_id).unwrap();
        assert_eq!(record.outcome, ends[0].outcome, "seed {}", seed);
        if let Outcome::Win { winner } = &record.outcome {
            let accepted = store
                .submissions(&battle_id)
                .into_iter()
                .any(|s| &s.user_id == winner && s.status == JudgeStatus::Accepted);
            assert!(accepted, "seed {}: winner without an accepted submission", seed);
        }
        orchestrator.shutdown();
    }
}
