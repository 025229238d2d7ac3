//! End-to-end round lifecycle: placement, scheduling, settlement, claims and
//! cancellation, driven directly against the engines.

use lucky12_backend::error::AppError;
use lucky12_backend::models::{Role, RoundStatus, SettlementStatus, SlipStatus};
use lucky12_backend::scheduler;
use lucky12_backend::settlement;
use lucky12_backend::state::AppState;
use lucky12_backend::store::{rounds, slips, users, wallet, Db};
use lucky12_backend::wager::{self, BetLineInput};

// Rounds live in the far future so they stay open against the real clock and
// armed alarms never fire mid-test.
const ROUND: &str = "299903011200";

async fn seed_round(state: &AppState, round_id: &str, status: RoundStatus) {
    let conn = state.db.conn().await;
    let start = state.clock.slot_start(round_id).unwrap();
    let end = state.clock.slot_end(round_id).unwrap();
    rounds::insert_if_missing(
        &conn,
        round_id,
        &state.clock.civil_string(start),
        &state.clock.civil_string(end),
        status,
        10.0,
    )
    .unwrap();
}

async fn seed_player(state: &AppState, username: &str, balance: f64) -> String {
    let conn = state.db.conn().await;
    users::create(&conn, username, "hash", Role::Player, balance, "2025-03-01 10:00:00")
        .unwrap()
        .id
}

async fn assert_balance_conserved(state: &AppState, user_id: &str, initial: f64) {
    let conn = state.db.conn().await;
    let balance = users::balance(&conn, user_id).unwrap();
    let ledger = wallet::ledger_sum(&conn, user_id).unwrap();
    assert!(
        (balance - initial - ledger).abs() < 1e-9,
        "balance {balance} != initial {initial} + ledger {ledger}"
    );
}

#[tokio::test]
async fn placement_replay_has_no_double_debit() {
    let state = AppState::for_tests().unwrap();
    seed_round(&state, ROUND, RoundStatus::Active).await;
    let user = seed_player(&state, "p1", 500.0).await;

    let bets = vec![
        BetLineInput { card: 3, stake: 100.0 },
        BetLineInput { card: 7, stake: 50.0 },
    ];
    let first = wager::place_bet(&state, &user, ROUND, &bets, "replay-key").await.unwrap();
    let second = wager::place_bet(&state, &user, ROUND, &bets, "replay-key").await.unwrap();

    assert!(!first.duplicate);
    assert!(second.duplicate);
    assert_eq!(first.slip.slip.slip_id, second.slip.slip.slip_id);
    assert_eq!(second.balance, 350.0);
    assert_balance_conserved(&state, &user, 500.0).await;
}

#[tokio::test]
async fn auto_settlement_prefers_the_house() {
    let state = AppState::for_tests().unwrap();
    seed_round(&state, ROUND, RoundStatus::Active).await;
    let a = seed_player(&state, "p1", 500.0).await;
    let b = seed_player(&state, "p2", 500.0).await;

    wager::place_bet(&state, &a, ROUND, &[BetLineInput { card: 3, stake: 100.0 }], "ka")
        .await
        .unwrap();
    wager::place_bet(&state, &b, ROUND, &[BetLineInput { card: 7, stake: 50.0 }], "kb")
        .await
        .unwrap();

    // With multiplier 10, paying card 3 or 7 loses money; every untouched
    // card yields the full pot, tie broken toward card 1.
    let summary = settlement::auto_settle(&state, ROUND).await.unwrap().unwrap();
    assert_eq!(summary.winning_card, 1);
    assert_eq!(summary.winning_slips, 0);
    assert_eq!(summary.losing_slips, 2);
    assert_eq!(summary.total_payout, 0.0);

    let conn = state.db.conn().await;
    let round = rounds::get_required(&conn, ROUND).unwrap();
    assert_eq!(round.settlement_status, SettlementStatus::Settled);
    assert_eq!(round.status, RoundStatus::Completed);
}

#[tokio::test]
async fn manual_settlement_wins_the_race_once() {
    let state = AppState::for_tests().unwrap();
    seed_round(&state, ROUND, RoundStatus::Active).await;
    let user = seed_player(&state, "p1", 500.0).await;
    wager::place_bet(&state, &user, ROUND, &[BetLineInput { card: 3, stake: 100.0 }], "k")
        .await
        .unwrap();

    let summary = settlement::settle_round(&state, ROUND, 3, "op1").await.unwrap();
    assert_eq!(summary.winning_card, 3);
    assert_eq!(summary.total_payout, 1000.0);

    // The automatic path arriving later is a no-op, the operator's card stays.
    assert!(settlement::auto_settle(&state, ROUND).await.unwrap().is_none());
    assert_eq!(
        settlement::settle_round(&state, ROUND, 5, "op2").await.unwrap_err(),
        AppError::AlreadySettled(ROUND.to_string())
    );

    let conn = state.db.conn().await;
    assert_eq!(rounds::get_required(&conn, ROUND).unwrap().winning_card, Some(3));
}

#[tokio::test]
async fn cancellation_excludes_the_slip_everywhere() {
    let state = AppState::for_tests().unwrap();
    seed_round(&state, ROUND, RoundStatus::Active).await;
    let a = seed_player(&state, "p1", 500.0).await;
    let b = seed_player(&state, "p2", 500.0).await;

    let slip_a = wager::place_bet(&state, &a, ROUND, &[BetLineInput { card: 3, stake: 100.0 }], "ka")
        .await
        .unwrap();
    wager::place_bet(&state, &b, ROUND, &[BetLineInput { card: 7, stake: 50.0 }], "kb")
        .await
        .unwrap();

    wager::cancel(&state, &a, false, &slip_a.slip.slip.slip_id, None)
        .await
        .unwrap();

    // Settle on the cancelled slip's card: it still must not win.
    let summary = settlement::settle_round(&state, ROUND, 3, "op1").await.unwrap();
    assert_eq!(summary.winning_slips, 0);
    assert_eq!(summary.total_payout, 0.0);

    {
        let conn = state.db.conn().await;
        let stats = wallet::round_stats(&conn, ROUND).unwrap();
        assert_eq!(stats.total_slips, 2);
        assert_eq!(stats.cancelled_slips, 1);
        assert_eq!(stats.total_wagered, 50.0);
        assert_eq!(stats.profit, 50.0);

        let cancelled = slips::get_by_identifier(&conn, &slip_a.slip.slip.slip_id).unwrap();
        assert_ne!(cancelled.status, SlipStatus::Won);
    }

    // Refund restored the bettor in full, loser paid their stake.
    assert_balance_conserved(&state, &a, 500.0).await;
    assert_balance_conserved(&state, &b, 500.0).await;
    let conn = state.db.conn().await;
    assert_eq!(users::balance(&conn, &a).unwrap(), 500.0);
    assert_eq!(users::balance(&conn, &b).unwrap(), 450.0);
}

#[tokio::test]
async fn scheduler_leaves_no_gap_at_the_boundary() {
    let state = AppState::for_tests().unwrap();
    seed_round(&state, ROUND, RoundStatus::Active).await;

    // One second past the deadline: old round completes and settles, the
    // successor is already active.
    let now = state.clock.parse_civil("2999-03-01 12:05:01").unwrap();
    scheduler::tick(&state, now).await.unwrap();

    let conn = state.db.conn().await;
    let ended = rounds::get_required(&conn, ROUND).unwrap();
    let next = rounds::get_required(&conn, "299903011205").unwrap();
    assert_eq!(ended.status, RoundStatus::Completed);
    assert_eq!(ended.settlement_status, SettlementStatus::Settled);
    assert_eq!(next.status, RoundStatus::Active);
    assert_eq!(next.start_at, ended.end_at);
}

#[tokio::test]
async fn concurrent_claims_pay_exactly_once() {
    let state = AppState::for_tests().unwrap();
    seed_round(&state, ROUND, RoundStatus::Active).await;
    let user = seed_player(&state, "p1", 500.0).await;

    let placed = wager::place_bet(&state, &user, ROUND, &[BetLineInput { card: 3, stake: 100.0 }], "k")
        .await
        .unwrap();
    let slip_id = placed.slip.slip.slip_id.clone();
    settlement::settle_round(&state, ROUND, 3, "op1").await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..10 {
        let state = state.clone();
        let user = user.clone();
        let slip_id = slip_id.clone();
        handles.push(tokio::spawn(async move {
            wager::claim(&state, &user, &slip_id).await
        }));
    }

    let mut successes = 0;
    let mut already = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(outcome) => {
                successes += 1;
                assert_eq!(outcome.credited, 1000.0);
            }
            Err(AppError::AlreadyClaimed) => already += 1,
            Err(e) => panic!("unexpected claim error: {e}"),
        }
    }
    assert_eq!(successes, 1);
    assert_eq!(already, 9);

    // Credited exactly once: 500 - 100 + 1000
    let conn = state.db.conn().await;
    assert_eq!(users::balance(&conn, &user).unwrap(), 1400.0);
    drop(conn);
    assert_balance_conserved(&state, &user, 500.0).await;
}

#[tokio::test]
async fn state_survives_a_restart() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("lucky12.db");
    let db_path = db_path.to_str().unwrap();

    let user_id;
    {
        let db = Db::open(db_path).unwrap();
        let state = AppState::new(db, "jwt".to_string(), "barcode");
        seed_round(&state, ROUND, RoundStatus::Active).await;
        user_id = seed_player(&state, "p1", 500.0).await;
        wager::place_bet(&state, &user_id, ROUND, &[BetLineInput { card: 3, stake: 100.0 }], "k")
            .await
            .unwrap();
    }

    // Reboot: rounds and slips are still there, the deadline alarm re-arms.
    let db = Db::open(db_path).unwrap();
    let state = AppState::new(db, "jwt".to_string(), "barcode");
    let restored = scheduler::restore_alarms(&state).await.unwrap();
    assert_eq!(restored, 1);
    assert!(state.alarms.is_armed(ROUND));

    let conn = state.db.conn().await;
    let round = rounds::get_required(&conn, ROUND).unwrap();
    assert_eq!(round.status, RoundStatus::Active);
    assert_eq!(users::balance(&conn, &user_id).unwrap(), 400.0);
    assert_eq!(slips::for_round(&conn, ROUND).unwrap().len(), 1);
}
