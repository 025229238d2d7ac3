//! Wager Service
//!
//! Placement, claim and cancellation of bet slips. Every mutation here is a
//! balance-affecting write, so each one runs inside a single transaction that
//! pairs the balance change with its ledger entry (Balance Conservation).
//! Placement is idempotent per (user, key); claim and cancellation are
//! race-safe through conditional updates and the cancellation ledger entry.

use crate::barcode;
use crate::error::{AppError, AppResult};
use crate::models::{LedgerDirection, LedgerKind, ReferenceKind, RoundStatus, SlipStatus, Slip};
use crate::state::AppState;
use crate::store::{audit, rounds, settings, slips, users, wallet};
use crate::store::slips::SlipView;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Clone, Deserialize)]
pub struct BetLineInput {
    pub card: u8,
    pub stake: f64,
}

#[derive(Debug, Serialize)]
pub struct PlacementOutcome {
    #[serde(flatten)]
    pub slip: SlipView,
    pub duplicate: bool,
    pub balance: f64,
}

#[derive(Debug, Serialize)]
pub struct ClaimOutcome {
    #[serde(flatten)]
    pub slip: SlipView,
    pub credited: f64,
    pub already_claimed: bool,
    pub balance: f64,
}

/// Place a slip on an active round. Replaying the same (user, key) pair
/// returns the original slip with `duplicate = true` and no balance effect.
pub async fn place_bet(
    state: &AppState,
    user_id: &str,
    round_id: &str,
    bets: &[BetLineInput],
    idempotency_key: &str,
) -> AppResult<PlacementOutcome> {
    state.clock.parse_round_id(round_id)?;
    if bets.is_empty() || idempotency_key.is_empty() {
        return Err(AppError::InvalidStake);
    }

    let mut conn = state.db.conn().await;
    users::require_active(&conn, user_id)?;

    if let Some(existing) = slips::get_by_idempotency(&conn, user_id, idempotency_key)? {
        let balance = users::balance(&conn, user_id)?;
        return Ok(PlacementOutcome {
            slip: slips::view(&conn, existing)?,
            duplicate: true,
            balance,
        });
    }

    let max_stake = settings::max_stake(&conn)?;
    let mut total_stake = 0.0;
    for bet in bets {
        if !(1..=12).contains(&bet.card) {
            return Err(AppError::InvalidCard(bet.card as i64));
        }
        if bet.stake <= 0.0 || bet.stake > max_stake {
            return Err(AppError::InvalidStake);
        }
        total_stake += bet.stake;
    }

    let round = rounds::get_required(&conn, round_id)?;
    let now_civil = state.clock.civil_string(state.clock.now());
    if round.status != RoundStatus::Active || round.end_at <= now_civil {
        return Err(AppError::RoundNotOpen(round_id.to_string()));
    }

    let slip_uuid = Uuid::new_v4();
    let prefix = barcode::slip_prefix(&slip_uuid);
    let slip = Slip {
        slip_id: slip_uuid.to_string(),
        barcode: barcode::derive(&state.barcode_secret, round_id, &prefix),
        user_id: user_id.to_string(),
        round_id: round_id.to_string(),
        total_stake,
        payout: 0.0,
        status: SlipStatus::Pending,
        claimed: false,
        claimed_at: None,
        idempotency_key: idempotency_key.to_string(),
        created_at: now_civil.clone(),
    };

    let tx = conn.transaction().map_err(AppError::from)?;
    if !slips::insert(&tx, &slip)? {
        // Lost the idempotency race; surface the winner's slip.
        drop(tx);
        let existing = slips::get_by_idempotency(&conn, user_id, idempotency_key)?
            .ok_or_else(|| AppError::Internal("idempotent slip vanished".to_string()))?;
        let balance = users::balance(&conn, user_id)?;
        return Ok(PlacementOutcome {
            slip: slips::view(&conn, existing)?,
            duplicate: true,
            balance,
        });
    }
    for bet in bets {
        slips::insert_line(&tx, &slip.slip_id, bet.card, bet.stake)?;
    }
    let balance = users::debit_with_retry(&tx, user_id, total_stake)?;
    wallet::append(
        &tx,
        user_id,
        total_stake,
        LedgerDirection::Debit,
        LedgerKind::Game,
        Some(ReferenceKind::BetPlacement),
        Some(&slip.slip_id),
        &now_civil,
    )?;
    tx.commit().map_err(AppError::from)?;

    info!(
        "🎫 Slip {} placed on round {} ({} line(s), stake {:.2})",
        slip.slip_id,
        round_id,
        bets.len(),
        total_stake
    );
    let view = slips::view(&conn, slip)?;
    Ok(PlacementOutcome {
        slip: view,
        duplicate: false,
        balance,
    })
}

/// Claim a won slip's payout. Exactly one claim succeeds per slip; the credit
/// and its ledger entry commit together.
pub async fn claim(state: &AppState, user_id: &str, identifier: &str) -> AppResult<ClaimOutcome> {
    let mut conn = state.db.conn().await;
    users::require_active(&conn, user_id)?;
    let slip = owned_slip(&conn, user_id, identifier)?;

    if wallet::is_cancelled(&conn, &slip.slip_id)? {
        return Err(AppError::SlipCancelled);
    }
    let round = rounds::get_required(&conn, &slip.round_id)?;
    if round.settlement_status != crate::models::SettlementStatus::Settled {
        return Err(AppError::SettlementNotReady);
    }
    if slip.status != SlipStatus::Won {
        return Err(AppError::WrongStatus(format!(
            "slip {} did not win",
            slip.slip_id
        )));
    }

    let now_civil = state.clock.civil_string(state.clock.now());
    let tx = conn.transaction().map_err(AppError::from)?;
    if !slips::try_mark_claimed(&tx, &slip.slip_id, &now_civil)? {
        return Err(AppError::AlreadyClaimed);
    }
    let balance = users::credit(&tx, user_id, slip.payout)?;
    wallet::append(
        &tx,
        user_id,
        slip.payout,
        LedgerDirection::Credit,
        LedgerKind::Game,
        Some(ReferenceKind::Claim),
        Some(&slip.slip_id),
        &now_civil,
    )?;
    tx.commit().map_err(AppError::from)?;

    info!("💰 Slip {} claimed, credited {:.2}", slip.slip_id, slip.payout);
    let credited = slip.payout;
    let refreshed = slips::get_by_identifier(&conn, &slip.slip_id)?;
    Ok(ClaimOutcome {
        slip: slips::view(&conn, refreshed)?,
        credited,
        already_claimed: false,
        balance,
    })
}

/// Counter flow: scan a printed barcode and pay it out. The barcode is
/// re-derived and compared before anything else. An already-claimed slip is
/// state at the counter, not an error: whether it was paid out long ago or a
/// concurrent claim landed first, the scan reports `already_claimed`.
pub async fn scan_and_claim(
    state: &AppState,
    user_id: &str,
    identifier: &str,
) -> AppResult<ClaimOutcome> {
    let slip = {
        let conn = state.db.conn().await;
        let slip = owned_slip(&conn, user_id, identifier)?;
        let slip_uuid = Uuid::parse_str(&slip.slip_id)
            .map_err(|_| AppError::SlipNotFound(identifier.to_string()))?;
        let prefix = barcode::slip_prefix(&slip_uuid);
        if !barcode::verify(&state.barcode_secret, &slip.round_id, &prefix, &slip.barcode) {
            return Err(AppError::SlipNotFound(identifier.to_string()));
        }
        slip
    };

    match claim(state, user_id, identifier).await {
        Err(AppError::AlreadyClaimed) => {
            let conn = state.db.conn().await;
            let refreshed = slips::get_by_identifier(&conn, &slip.slip_id)?;
            let balance = users::balance(&conn, user_id)?;
            Ok(ClaimOutcome {
                slip: slips::view(&conn, refreshed)?,
                credited: 0.0,
                already_claimed: true,
                balance,
            })
        }
        other => other,
    }
}

/// Cancel a slip before its round settles. The refund's cancellation ledger
/// entry is what marks the slip cancelled everywhere else. Operators may
/// cancel any slip; the refund always goes to the slip's owner.
pub async fn cancel(
    state: &AppState,
    actor_id: &str,
    is_operator: bool,
    identifier: &str,
    reason: Option<&str>,
) -> AppResult<SlipView> {
    let mut conn = state.db.conn().await;
    users::require_active(&conn, actor_id)?;
    let slip = slips::get_by_identifier(&conn, identifier)?;
    if !is_operator && slip.user_id != actor_id {
        return Err(AppError::Forbidden);
    }

    if slip.claimed {
        return Err(AppError::AlreadyClaimed);
    }
    if wallet::is_cancelled(&conn, &slip.slip_id)? {
        return Err(AppError::SlipCancelled);
    }
    let round = rounds::get_required(&conn, &slip.round_id)?;
    if round.settlement_status != crate::models::SettlementStatus::NotSettled {
        return Err(AppError::AlreadySettled(round.round_id));
    }

    let now_civil = state.clock.civil_string(state.clock.now());
    let mut detail = format!("refund={:.2}", slip.total_stake);
    if let Some(reason) = reason {
        detail.push_str(&format!(" reason={reason}"));
    }
    let tx = conn.transaction().map_err(AppError::from)?;
    wallet::append(
        &tx,
        &slip.user_id,
        slip.total_stake,
        LedgerDirection::Credit,
        LedgerKind::Game,
        Some(ReferenceKind::Cancellation),
        Some(&slip.slip_id),
        &now_civil,
    )?;
    users::credit(&tx, &slip.user_id, slip.total_stake)?;
    slips::set_slip_lost(&tx, &slip.slip_id)?;
    audit::append(
        &tx,
        actor_id,
        "slip_cancelled",
        "slip",
        &slip.slip_id,
        Some(&detail),
        None,
        None,
    )?;
    tx.commit().map_err(AppError::from)?;

    info!(
        "🚫 Slip {} cancelled, refunded {:.2}",
        slip.slip_id, slip.total_stake
    );
    let refreshed = slips::get_by_identifier(&conn, &slip.slip_id)?;
    slips::view(&conn, refreshed)
}

fn owned_slip(
    conn: &rusqlite::Connection,
    user_id: &str,
    identifier: &str,
) -> AppResult<Slip> {
    let slip = slips::get_by_identifier(conn, identifier)?;
    if slip.user_id != user_id {
        return Err(AppError::Forbidden);
    }
    Ok(slip)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Role;
    use crate::settlement;

    async fn fixture() -> (AppState, String) {
        let state = AppState::for_tests().unwrap();
        let user = {
            let conn = state.db.conn().await;
            users::create(&conn, "player1", "hash", Role::Player, 500.0, "2025-03-01 10:00:00")
                .unwrap()
        };
        (state, user.id)
    }

    // Far-future round so the open-for-betting check passes against the
    // real clock.
    const ROUND: &str = "299903011200";

    async fn seed_round(state: &AppState, status: RoundStatus) {
        let conn = state.db.conn().await;
        rounds::insert_if_missing(
            &conn,
            ROUND,
            "2999-03-01 12:00:00",
            "2999-03-01 12:05:00",
            status,
            10.0,
        )
        .unwrap();
    }

    #[tokio::test]
    async fn test_place_debits_and_logs() {
        let (state, user) = fixture().await;
        seed_round(&state, RoundStatus::Active).await;

        let bets = vec![
            BetLineInput { card: 3, stake: 100.0 },
            BetLineInput { card: 7, stake: 50.0 },
        ];
        let outcome = place_bet(&state, &user, ROUND, &bets, "key-1").await.unwrap();
        assert!(!outcome.duplicate);
        assert_eq!(outcome.balance, 350.0);
        assert_eq!(outcome.slip.slip.total_stake, 150.0);
        assert_eq!(outcome.slip.lines.len(), 2);
        assert!(barcode::is_well_formed(&outcome.slip.slip.barcode));

        let conn = state.db.conn().await;
        assert_eq!(users::balance(&conn, &user).unwrap(), 350.0);
        assert_eq!(wallet::ledger_sum(&conn, &user).unwrap(), -150.0);
        let entries =
            wallet::entries_for_reference(&conn, ReferenceKind::BetPlacement, &outcome.slip.slip.slip_id)
                .unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].amount, 150.0);
    }

    #[tokio::test]
    async fn test_placement_replay_is_idempotent() {
        let (state, user) = fixture().await;
        seed_round(&state, RoundStatus::Active).await;
        let bets = vec![BetLineInput { card: 3, stake: 100.0 }];

        let first = place_bet(&state, &user, ROUND, &bets, "key-1").await.unwrap();
        let second = place_bet(&state, &user, ROUND, &bets, "key-1").await.unwrap();
        assert!(!first.duplicate);
        assert!(second.duplicate);
        assert_eq!(first.slip.slip.slip_id, second.slip.slip.slip_id);

        // Debited exactly once
        let conn = state.db.conn().await;
        assert_eq!(users::balance(&conn, &user).unwrap(), 400.0);
    }

    #[tokio::test]
    async fn test_place_validation() {
        let (state, user) = fixture().await;
        seed_round(&state, RoundStatus::Active).await;

        let bad_card = vec![BetLineInput { card: 13, stake: 10.0 }];
        assert_eq!(
            place_bet(&state, &user, ROUND, &bad_card, "k").await.unwrap_err(),
            AppError::InvalidCard(13)
        );

        let bad_stake = vec![BetLineInput { card: 3, stake: 0.0 }];
        assert_eq!(
            place_bet(&state, &user, ROUND, &bad_stake, "k").await.unwrap_err(),
            AppError::InvalidStake
        );

        // Over the max_stake default of 10000
        let too_big = vec![BetLineInput { card: 3, stake: 10001.0 }];
        assert_eq!(
            place_bet(&state, &user, ROUND, &too_big, "k").await.unwrap_err(),
            AppError::InvalidStake
        );

        assert_eq!(
            place_bet(&state, &user, "not-a-round", &[BetLineInput { card: 1, stake: 1.0 }], "k")
                .await
                .unwrap_err(),
            AppError::InvalidRoundId("not-a-round".to_string())
        );
    }

    #[tokio::test]
    async fn test_place_rejects_closed_round() {
        let (state, user) = fixture().await;
        seed_round(&state, RoundStatus::Pending).await;
        let bets = vec![BetLineInput { card: 3, stake: 10.0 }];
        assert_eq!(
            place_bet(&state, &user, ROUND, &bets, "k").await.unwrap_err(),
            AppError::RoundNotOpen(ROUND.to_string())
        );
    }

    #[tokio::test]
    async fn test_place_insufficient_funds_leaves_nothing_behind() {
        let (state, user) = fixture().await;
        seed_round(&state, RoundStatus::Active).await;
        let bets = vec![BetLineInput { card: 3, stake: 600.0 }];
        assert_eq!(
            place_bet(&state, &user, ROUND, &bets, "k").await.unwrap_err(),
            AppError::InsufficientFunds
        );

        let conn = state.db.conn().await;
        assert_eq!(users::balance(&conn, &user).unwrap(), 500.0);
        assert_eq!(wallet::ledger_sum(&conn, &user).unwrap(), 0.0);
        assert!(slips::get_by_idempotency(&conn, &user, "k").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_claim_flow() {
        let (state, user) = fixture().await;
        seed_round(&state, RoundStatus::Active).await;
        let bets = vec![BetLineInput { card: 3, stake: 100.0 }];
        let placed = place_bet(&state, &user, ROUND, &bets, "key-1").await.unwrap();
        let slip_id = placed.slip.slip.slip_id.clone();

        // Not settled yet
        assert_eq!(
            claim(&state, &user, &slip_id).await.unwrap_err(),
            AppError::SettlementNotReady
        );

        settlement::settle_round(&state, ROUND, 3, "op1").await.unwrap();

        let outcome = claim(&state, &user, &slip_id).await.unwrap();
        assert_eq!(outcome.credited, 1000.0);
        assert_eq!(outcome.balance, 400.0 + 1000.0);
        assert!(outcome.slip.slip.claimed);

        // Second claim fails
        assert_eq!(
            claim(&state, &user, &slip_id).await.unwrap_err(),
            AppError::AlreadyClaimed
        );

        // Exactly one claim ledger entry
        let conn = state.db.conn().await;
        let entries =
            wallet::entries_for_reference(&conn, ReferenceKind::Claim, &slip_id).unwrap();
        assert_eq!(entries.len(), 1);
    }

    #[tokio::test]
    async fn test_claim_by_barcode_and_scan_short_circuit() {
        let (state, user) = fixture().await;
        seed_round(&state, RoundStatus::Active).await;
        let bets = vec![BetLineInput { card: 3, stake: 100.0 }];
        let placed = place_bet(&state, &user, ROUND, &bets, "key-1").await.unwrap();
        let code = placed.slip.slip.barcode.clone();

        settlement::settle_round(&state, ROUND, 3, "op1").await.unwrap();

        let outcome = scan_and_claim(&state, &user, &code).await.unwrap();
        assert!(!outcome.already_claimed);
        assert_eq!(outcome.credited, 1000.0);

        let replay = scan_and_claim(&state, &user, &code).await.unwrap();
        assert!(replay.already_claimed);
        assert_eq!(replay.credited, 0.0);
    }

    #[tokio::test]
    async fn test_losing_slip_cannot_claim() {
        let (state, user) = fixture().await;
        seed_round(&state, RoundStatus::Active).await;
        let bets = vec![BetLineInput { card: 7, stake: 100.0 }];
        let placed = place_bet(&state, &user, ROUND, &bets, "key-1").await.unwrap();

        settlement::settle_round(&state, ROUND, 3, "op1").await.unwrap();

        assert!(matches!(
            claim(&state, &user, &placed.slip.slip.slip_id).await.unwrap_err(),
            AppError::WrongStatus(_)
        ));
    }

    #[tokio::test]
    async fn test_cancel_refunds_and_excludes() {
        let (state, user) = fixture().await;
        seed_round(&state, RoundStatus::Active).await;
        let bets = vec![BetLineInput { card: 3, stake: 100.0 }];
        let placed = place_bet(&state, &user, ROUND, &bets, "key-1").await.unwrap();
        let slip_id = placed.slip.slip.slip_id.clone();

        let view = cancel(&state, &user, false, &slip_id, None).await.unwrap();
        assert_eq!(view.display_status, "cancelled");

        let conn = state.db.conn().await;
        assert_eq!(users::balance(&conn, &user).unwrap(), 500.0);
        assert_eq!(wallet::ledger_sum(&conn, &user).unwrap(), 0.0);
        assert!(wallet::is_cancelled(&conn, &slip_id).unwrap());
        drop(conn);

        // Re-cancel and post-cancel claim both fail
        assert_eq!(
            cancel(&state, &user, false, &slip_id, None).await.unwrap_err(),
            AppError::SlipCancelled
        );
        settlement::settle_round(&state, ROUND, 3, "op1").await.unwrap();
        assert_eq!(
            claim(&state, &user, &slip_id).await.unwrap_err(),
            AppError::SlipCancelled
        );
    }

    #[tokio::test]
    async fn test_cancel_rejected_after_settlement() {
        let (state, user) = fixture().await;
        seed_round(&state, RoundStatus::Active).await;
        let bets = vec![BetLineInput { card: 3, stake: 100.0 }];
        let placed = place_bet(&state, &user, ROUND, &bets, "key-1").await.unwrap();

        settlement::settle_round(&state, ROUND, 7, "op1").await.unwrap();
        assert_eq!(
            cancel(&state, &user, false, &placed.slip.slip.slip_id, None)
                .await
                .unwrap_err(),
            AppError::AlreadySettled(ROUND.to_string())
        );
    }

    #[tokio::test]
    async fn test_foreign_slip_is_forbidden() {
        let (state, user) = fixture().await;
        seed_round(&state, RoundStatus::Active).await;
        let other = {
            let conn = state.db.conn().await;
            users::create(&conn, "player2", "hash", Role::Player, 500.0, "2025-03-01 10:00:00")
                .unwrap()
        };
        let bets = vec![BetLineInput { card: 3, stake: 100.0 }];
        let placed = place_bet(&state, &user, ROUND, &bets, "key-1").await.unwrap();

        assert_eq!(
            cancel(&state, &other.id, false, &placed.slip.slip.slip_id, None)
                .await
                .unwrap_err(),
            AppError::Forbidden
        );
    }

    #[tokio::test]
    async fn test_operator_cancels_foreign_slip_with_reason() {
        let (state, user) = fixture().await;
        seed_round(&state, RoundStatus::Active).await;
        let operator = {
            let conn = state.db.conn().await;
            users::create(&conn, "op1", "hash", Role::Operator, 0.0, "2025-03-01 10:00:00")
                .unwrap()
        };
        let bets = vec![BetLineInput { card: 3, stake: 100.0 }];
        let placed = place_bet(&state, &user, ROUND, &bets, "key-1").await.unwrap();
        let slip_id = placed.slip.slip.slip_id.clone();

        let view = cancel(&state, &operator.id, true, &slip_id, Some("customer request"))
            .await
            .unwrap();
        assert_eq!(view.display_status, "cancelled");

        // Refund lands on the owner, never the operator.
        let conn = state.db.conn().await;
        assert_eq!(users::balance(&conn, &user).unwrap(), 500.0);
        assert_eq!(users::balance(&conn, &operator.id).unwrap(), 0.0);

        let entry = audit::list(&conn, 1, 10)
            .unwrap()
            .into_iter()
            .find(|e| e.action == "slip_cancelled")
            .unwrap();
        assert_eq!(entry.actor, operator.id);
        let detail = entry.detail.unwrap();
        assert!(detail.contains("refund=100.00"));
        assert!(detail.contains("reason=customer request"));
    }

    #[tokio::test]
    async fn test_scan_after_direct_claim_reports_state() {
        let (state, user) = fixture().await;
        seed_round(&state, RoundStatus::Active).await;
        let bets = vec![BetLineInput { card: 3, stake: 100.0 }];
        let placed = place_bet(&state, &user, ROUND, &bets, "key-1").await.unwrap();
        let code = placed.slip.slip.barcode.clone();

        settlement::settle_round(&state, ROUND, 3, "op1").await.unwrap();
        claim(&state, &user, &placed.slip.slip.slip_id).await.unwrap();

        // The claim raced ahead of the scan; the counter sees state, not an
        // error, and no second credit happens.
        let outcome = scan_and_claim(&state, &user, &code).await.unwrap();
        assert!(outcome.already_claimed);
        assert_eq!(outcome.credited, 0.0);
        assert_eq!(outcome.balance, 1400.0);

        let conn = state.db.conn().await;
        let entries = wallet::entries_for_reference(
            &conn,
            ReferenceKind::Claim,
            &placed.slip.slip.slip_id,
        )
        .unwrap();
        assert_eq!(entries.len(), 1);
    }

    #[tokio::test]
    async fn test_suspended_account_cannot_transact() {
        let (state, user) = fixture().await;
        seed_round(&state, RoundStatus::Active).await;
        let bets = vec![BetLineInput { card: 3, stake: 100.0 }];
        let placed = place_bet(&state, &user, ROUND, &bets, "key-1").await.unwrap();
        let slip_id = placed.slip.slip.slip_id.clone();

        {
            let conn = state.db.conn().await;
            conn.execute(
                "UPDATE users SET status = 'banned' WHERE id = ?1",
                rusqlite::params![user],
            )
            .unwrap();
        }

        assert_eq!(
            place_bet(&state, &user, ROUND, &bets, "key-2").await.unwrap_err(),
            AppError::Forbidden
        );
        assert_eq!(
            cancel(&state, &user, false, &slip_id, None).await.unwrap_err(),
            AppError::Forbidden
        );
        settlement::settle_round(&state, ROUND, 3, "op1").await.unwrap();
        assert_eq!(
            claim(&state, &user, &slip_id).await.unwrap_err(),
            AppError::Forbidden
        );

        // Nothing moved while the account was suspended.
        let conn = state.db.conn().await;
        assert_eq!(users::balance(&conn, &user).unwrap(), 400.0);
    }
}
