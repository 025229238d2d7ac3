//! Settlement Engine
//!
//! Finalizes a round given a winning card: bet-line winner flags and payouts,
//! slip statuses, round settlement status, audit trail. Multiple triggers may
//! race (deadline alarm, coarse tick, operator) — the conditional claim on
//! settlement_status serializes them, so exactly one caller applies the
//! effects and the rest observe AlreadySettled.

use crate::error::{AppError, AppResult};
use crate::models::{RoundStatus, SettlementStatus, SettlementSummary};
use crate::state::AppState;
use crate::store::{audit, rounds, slips, wallet};
use rand::Rng;
use rusqlite::Connection;
use serde::Serialize;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Rounds stuck in `settling` longer than this are re-driven by recovery.
pub const STUCK_SETTLING_SECS: i64 = 60;

/// Budget for one settlement pass. Checked at the checkpoint between the bulk
/// loser update and the per-winner updates; exceeding it surfaces as a
/// transient error, leaving `settling` for recovery.
pub const SETTLEMENT_BUDGET_SECS: u64 = 30;

const CARDS: std::ops::RangeInclusive<u8> = 1..=12;

/// Settle a round with a known winning card. `actor` is the operator's
/// username, or "system" for the automatic path.
pub async fn settle_round(
    state: &AppState,
    round_id: &str,
    winning_card: u8,
    actor: &str,
) -> AppResult<SettlementSummary> {
    if !CARDS.contains(&winning_card) {
        return Err(AppError::InvalidCard(winning_card as i64));
    }

    let mut conn = state.db.conn().await;
    let round = rounds::get_required(&conn, round_id)?;

    if round.status == RoundStatus::Pending {
        return Err(AppError::WrongStatus(format!(
            "round {round_id} has not started"
        )));
    }
    match round.settlement_status {
        SettlementStatus::Settled | SettlementStatus::Settling | SettlementStatus::Failed => {
            return Err(AppError::AlreadySettled(round_id.to_string()));
        }
        SettlementStatus::NotSettled => {}
    }

    // Claim the settlement slot. Committed on its own so a transient failure
    // mid-apply leaves `settling` behind for recovery, never a silent retry.
    let now_civil = state.clock.civil_string(state.clock.now());
    if !rounds::claim_settlement(&conn, round_id, &now_civil)? {
        return Err(AppError::AlreadySettled(round_id.to_string()));
    }

    match apply(&mut conn, state, round_id, round.multiplier, winning_card, actor) {
        Ok(summary) => {
            info!(
                "🏁 Round {} settled: card {} | {} won / {} lost | payout {:.2}",
                round_id,
                winning_card,
                summary.winning_slips,
                summary.losing_slips,
                summary.total_payout
            );
            Ok(summary)
        }
        Err(e) if e.is_transient() => {
            warn!(
                "Round {} settlement interrupted, left settling for recovery: {}",
                round_id, e
            );
            Err(e)
        }
        Err(e) => {
            // Deterministic failure: record it on the round.
            rounds::mark_settlement_failed(&conn, round_id, &e.to_string())?;
            warn!("Round {} settlement failed: {}", round_id, e);
            Err(e)
        }
    }
}

/// Steps 2-6 of the settlement algorithm, in one transaction. Each statement
/// is idempotent, so recovery may re-run the whole body.
fn apply(
    conn: &mut Connection,
    state: &AppState,
    round_id: &str,
    multiplier: f64,
    winning_card: u8,
    actor: &str,
) -> AppResult<SettlementSummary> {
    let started = Instant::now();
    let now_civil = state.clock.civil_string(state.clock.now());
    let tx = conn.transaction().map_err(AppError::from)?;

    let cancelled = wallet::cancelled_set(&tx, round_id)?;
    let all_slips = slips::for_round(&tx, round_id)?;

    // Losers in one bulk update, winners per row.
    slips::settle_loser_lines(&tx, round_id, winning_card)?;
    let winner_lines = slips::winner_lines(&tx, round_id, winning_card)?;
    check_budget(started)?;

    let mut slip_payouts: HashMap<String, f64> = HashMap::new();
    for line in &winner_lines {
        let payout = line.stake * multiplier;
        slips::set_line_winner(&tx, line.id, payout)?;
        if !cancelled.contains(&line.slip_id) {
            *slip_payouts.entry(line.slip_id.clone()).or_insert(0.0) += payout;
        }
    }

    // Slip statuses: cancelled slips are untouched; winners flip to won with
    // their summed payout; everyone else loses in one bulk update.
    let mut excluded: Vec<String> = cancelled.clone();
    excluded.extend(slip_payouts.keys().cloned());
    slips::settle_lost_slips(&tx, round_id, &excluded)?;

    let mut total_payout = 0.0;
    for (slip_id, payout) in &slip_payouts {
        slips::set_slip_won(&tx, slip_id, *payout)?;
        total_payout += payout;
    }

    rounds::finalize_settled(&tx, round_id, winning_card, &now_civil)?;

    let actor_label = if actor.is_empty() { "system" } else { actor };
    audit::append(
        &tx,
        actor_label,
        "round_settled",
        "round",
        round_id,
        Some(&format!("winning_card={winning_card}")),
        None,
        None,
    )?;

    tx.commit().map_err(AppError::from)?;

    let winning_slips = slip_payouts.len() as i64;
    let losing_slips = all_slips.len() as i64 - cancelled.len() as i64 - winning_slips;
    Ok(SettlementSummary {
        round_id: round_id.to_string(),
        winning_card,
        winning_slips,
        losing_slips,
        total_payout,
        multiplier,
    })
}

fn check_budget(started: Instant) -> AppResult<()> {
    if started.elapsed() > Duration::from_secs(SETTLEMENT_BUDGET_SECS) {
        return Err(AppError::TransientStore(
            "settlement budget exhausted".to_string(),
        ));
    }
    Ok(())
}

/// Automatic winning-card selection: argmax over per-card house profit
/// (total wagered minus that card's payout), cancelled slips excluded, ties
/// broken toward the lowest card. An empty round gets a uniform random card.
pub fn select_winning_card(conn: &Connection, round_id: &str, multiplier: f64) -> AppResult<u8> {
    let pools = wallet::card_pools(conn, round_id)?;
    if pools.is_empty() {
        return Ok(rand::thread_rng().gen_range(CARDS));
    }

    let by_card: HashMap<u8, f64> = pools.into_iter().collect();
    let total_wagered: f64 = by_card.values().sum();

    let mut best_card = 1u8;
    let mut best_profit = f64::NEG_INFINITY;
    for card in CARDS {
        let pool = by_card.get(&card).copied().unwrap_or(0.0);
        let profit = total_wagered - pool * multiplier;
        if profit > best_profit {
            best_profit = profit;
            best_card = card;
        }
    }
    Ok(best_card)
}

/// Settle with the auto-selected card. AlreadySettled is success for the
/// callers on this path (alarm, tick safety net).
pub async fn auto_settle(state: &AppState, round_id: &str) -> AppResult<Option<SettlementSummary>> {
    let card = {
        let conn = state.db.conn().await;
        let round = rounds::get_required(&conn, round_id)?;
        if round.settlement_status != SettlementStatus::NotSettled {
            return Ok(None);
        }
        select_winning_card(&conn, round_id, round.multiplier)?
    };
    match settle_round(state, round_id, card, "system").await {
        Ok(summary) => Ok(Some(summary)),
        Err(AppError::AlreadySettled(_)) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Re-drive rounds stuck in `settling` past the cutoff. The claim no longer
/// guards them; the apply body is idempotent so re-running is safe.
pub async fn recover_stuck(state: &AppState) -> AppResult<usize> {
    let now = state.clock.now();
    let cutoff = state
        .clock
        .civil_string(now - chrono::Duration::seconds(STUCK_SETTLING_SECS));

    let stuck = {
        let conn = state.db.conn().await;
        rounds::stuck_settling(&conn, &cutoff)?
    };
    if stuck.is_empty() {
        return Ok(0);
    }

    let mut recovered = 0usize;
    for round in stuck {
        let mut conn = state.db.conn().await;
        let card = match round.winning_card {
            Some(card) => card,
            None => select_winning_card(&conn, &round.round_id, round.multiplier)?,
        };
        match apply(
            &mut conn,
            state,
            &round.round_id,
            round.multiplier,
            card,
            "system",
        ) {
            Ok(_) => {
                info!("🩹 Recovered stuck settlement for round {}", round.round_id);
                recovered += 1;
            }
            Err(e) => warn!(
                "Recovery of round {} failed (will retry next tick): {}",
                round.round_id, e
            ),
        }
    }
    Ok(recovered)
}

/// Per-card preview for the operator decision screen.
#[derive(Debug, Clone, Serialize)]
pub struct CardProfit {
    pub card: u8,
    pub pool: f64,
    pub payout: f64,
    pub profit: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SettlementDecision {
    pub round_id: String,
    pub total_wagered: f64,
    pub multiplier: f64,
    pub cards: Vec<CardProfit>,
    pub recommended_card: u8,
}

pub fn settlement_decision(
    conn: &Connection,
    round_id: &str,
    multiplier: f64,
) -> AppResult<SettlementDecision> {
    let by_card: HashMap<u8, f64> = wallet::card_pools(conn, round_id)?.into_iter().collect();
    let total_wagered: f64 = by_card.values().sum();

    let mut cards = Vec::with_capacity(12);
    let mut recommended = 1u8;
    let mut best_profit = f64::NEG_INFINITY;
    for card in CARDS {
        let pool = by_card.get(&card).copied().unwrap_or(0.0);
        let payout = pool * multiplier;
        let profit = total_wagered - payout;
        if profit > best_profit {
            best_profit = profit;
            recommended = card;
        }
        cards.push(CardProfit {
            card,
            pool,
            payout,
            profit,
        });
    }

    Ok(SettlementDecision {
        round_id: round_id.to_string(),
        total_wagered,
        multiplier,
        cards,
        recommended_card: recommended,
    })
}
