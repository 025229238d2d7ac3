//! Round Scheduler
//!
//! Keeps the slot grid populated and drives round state forward. Two
//! mechanisms cooperate: a coarse periodic tick that reconciles everything
//! from the database, and per-round deadline alarms that give settlement
//! low latency. Every action both take is an idempotent conditional write,
//! so the tick, an alarm and an operator can all race safely.

pub mod alarms;

use crate::error::AppResult;
use crate::models::{ResultMode, Round, RoundStatus};
use crate::settlement;
use crate::state::AppState;
use crate::store::{rounds, settings};
use chrono::{DateTime, Duration, FixedOffset};
use tracing::{error, info, warn};

/// Coarse tick period when TICK_INTERVAL_SECS is unset.
pub const DEFAULT_TICK_SECS: u64 = 60;

/// Upper bound on rounds materialized per tick after downtime.
pub const BACKFILL_CAP: usize = 24;

/// Operator grace after the deadline in manual result mode.
pub const GRACE_MANUAL_SECS: i64 = 10;

/// Clock-skew allowance when restoring alarms on boot.
pub const ALARM_RESTORE_SKEW_SECS: i64 = 120;

/// Settlement delay after a round's deadline. Read once, at arm time.
pub fn grace_secs(mode: ResultMode) -> i64 {
    match mode {
        ResultMode::Auto => 0,
        ResultMode::Manual => GRACE_MANUAL_SECS,
    }
}

/// One reconciliation pass at `now`. The driver calls this on a timer; tests
/// call it directly with injected instants.
pub async fn tick(state: &AppState, now: DateTime<FixedOffset>) -> AppResult<()> {
    let (win_start, win_end) = {
        let conn = state.db.conn().await;
        settings::operating_window(&conn)?
    };

    // Backfill first: it walks from the latest known round, which must still
    // be the pre-downtime one when the current slot gets materialized below.
    backfill(state, now, win_start, win_end).await?;
    if state.clock.in_window(now, win_start, win_end) {
        ensure_round(state, state.clock.floor_to_slot(now)).await?;
    }
    activate_due_rounds(state, now).await?;
    complete_due_rounds(state, now).await?;
    settle_overdue(state, now).await?;
    settlement::recover_stuck(state).await?;
    Ok(())
}

/// Materialize the round for a slot start if it does not exist yet.
async fn ensure_round(state: &AppState, slot_start: DateTime<FixedOffset>) -> AppResult<bool> {
    let round_id = state.clock.format_round_id(slot_start);
    let start_civil = state.clock.civil_string(slot_start);
    let end_civil = state
        .clock
        .civil_string(slot_start + Duration::seconds(crate::clock::SLOT_SECS));

    let conn = state.db.conn().await;
    let multiplier = settings::round_multiplier(&conn)?;
    let created = rounds::insert_if_missing(
        &conn,
        &round_id,
        &start_civil,
        &end_civil,
        RoundStatus::Pending,
        multiplier,
    )?;
    if created {
        info!("🆕 Created round {} ({} → {})", round_id, start_civil, end_civil);
    }
    Ok(created)
}

/// Fill grid slots missed while the process was down. Slots fully in the past
/// are inserted already completed; the safety net settles them afterwards.
/// Bounded per tick so a long outage cannot stall the current round.
async fn backfill(
    state: &AppState,
    now: DateTime<FixedOffset>,
    win_start: chrono::NaiveTime,
    win_end: chrono::NaiveTime,
) -> AppResult<()> {
    let latest = {
        let conn = state.db.conn().await;
        rounds::latest(&conn)?
    };
    let Some(latest) = latest else {
        return Ok(());
    };

    let mut cursor = state.clock.parse_civil(&latest.end_at)?;
    let mut created = 0usize;
    while cursor + Duration::seconds(crate::clock::SLOT_SECS) <= now && created < BACKFILL_CAP {
        if state.clock.in_window(cursor, win_start, win_end) {
            let round_id = state.clock.format_round_id(cursor);
            let start_civil = state.clock.civil_string(cursor);
            let end_civil = state
                .clock
                .civil_string(cursor + Duration::seconds(crate::clock::SLOT_SECS));
            let conn = state.db.conn().await;
            let multiplier = settings::round_multiplier(&conn)?;
            if rounds::insert_if_missing(
                &conn,
                &round_id,
                &start_civil,
                &end_civil,
                RoundStatus::Completed,
                multiplier,
            )? {
                created += 1;
            }
        }
        cursor += Duration::seconds(crate::clock::SLOT_SECS);
    }
    if created > 0 {
        warn!("⏪ Backfilled {} missed round(s) up to {}", created, state.clock.civil_string(cursor));
    }
    Ok(())
}

/// Flip due pending rounds to active and arm their deadline alarms.
async fn activate_due_rounds(state: &AppState, now: DateTime<FixedOffset>) -> AppResult<()> {
    let now_civil = state.clock.civil_string(now);
    let (due, grace) = {
        let conn = state.db.conn().await;
        let ids = rounds::pending_due(&conn, &now_civil)?;
        let grace = grace_secs(settings::result_mode(&conn)?);
        let mut activated = Vec::new();
        for id in ids {
            if rounds::try_activate(&conn, &id)? {
                info!("▶️  Round {} is now active", id);
            }
            activated.push(rounds::get_required(&conn, &id)?);
        }
        (activated, grace)
    };

    for round in due {
        arm_deadline(state, &round, grace)?;
    }
    Ok(())
}

/// Complete active rounds past their end and spawn their successors.
async fn complete_due_rounds(state: &AppState, now: DateTime<FixedOffset>) -> AppResult<()> {
    let now_civil = state.clock.civil_string(now);
    let due = {
        let conn = state.db.conn().await;
        rounds::active_due(&conn, &now_civil)?
    };
    for round_id in due {
        let completed = {
            let conn = state.db.conn().await;
            rounds::try_complete(&conn, &round_id)?
        };
        if completed {
            info!("⏹️  Round {} completed", round_id);
        }
        create_next_immediately(state, &round_id, now).await?;
    }
    Ok(())
}

/// The no-gap rule: the successor round exists the moment its predecessor
/// ends, without waiting for the next coarse tick.
pub async fn create_next_immediately(
    state: &AppState,
    ended_round_id: &str,
    now: DateTime<FixedOffset>,
) -> AppResult<()> {
    let next_start = state.clock.slot_end(ended_round_id)?;
    let (win_start, win_end) = {
        let conn = state.db.conn().await;
        settings::operating_window(&conn)?
    };
    if !state.clock.in_window(next_start, win_start, win_end) {
        return Ok(());
    }

    ensure_round(state, next_start).await?;
    if next_start <= now {
        let next_id = state.clock.format_round_id(next_start);
        let (activated, round, grace) = {
            let conn = state.db.conn().await;
            let activated = rounds::try_activate(&conn, &next_id)?;
            let round = rounds::get_required(&conn, &next_id)?;
            let grace = grace_secs(settings::result_mode(&conn)?);
            (activated, round, grace)
        };
        if activated {
            info!("🔁 Successor round {} started immediately", next_id);
        }
        if round.status == RoundStatus::Active {
            arm_deadline(state, &round, grace)?;
        }
    }
    Ok(())
}

/// Safety net behind the alarms: settle completed rounds whose deadline plus
/// grace has passed and that nobody claimed yet.
async fn settle_overdue(state: &AppState, now: DateTime<FixedOffset>) -> AppResult<()> {
    let overdue = {
        let conn = state.db.conn().await;
        let grace = grace_secs(settings::result_mode(&conn)?);
        let deadline = state.clock.civil_string(now - Duration::seconds(grace));
        rounds::completed_unsettled(&conn, &deadline)?
    };
    for round in overdue {
        if let Err(e) = settlement::auto_settle(state, &round.round_id).await {
            warn!("Safety-net settlement of round {} failed: {}", round.round_id, e);
        }
    }
    Ok(())
}

/// Deadline alarm handler: complete the round, spawn the successor, then
/// settle if nobody else already did.
pub async fn on_alarm(state: AppState, round_id: String) {
    info!("⏰ Deadline alarm fired for round {}", round_id);
    let result = drive_deadline(&state, &round_id).await;
    if let Err(e) = result {
        // The coarse tick retries; transient claims stay settling for recovery.
        warn!("Alarm handling for round {} failed: {}", round_id, e);
    }
    state.alarms.forget(&round_id);
}

async fn drive_deadline(state: &AppState, round_id: &str) -> AppResult<()> {
    {
        let conn = state.db.conn().await;
        rounds::try_complete(&conn, round_id)?;
    }
    create_next_immediately(state, round_id, state.clock.now()).await?;
    settlement::auto_settle(state, round_id).await?;
    Ok(())
}

/// Rebuild the alarm registry after a restart. Rounds whose deadline already
/// passed (within the skew allowance) get an immediate alarm.
pub async fn restore_alarms(state: &AppState) -> AppResult<usize> {
    let now = state.clock.now();
    let min_end = state
        .clock
        .civil_string(now - Duration::seconds(ALARM_RESTORE_SKEW_SECS));

    let (to_restore, grace) = {
        let conn = state.db.conn().await;
        (
            rounds::alarm_restore_set(&conn, &min_end)?,
            grace_secs(settings::result_mode(&conn)?),
        )
    };

    let mut restored = 0usize;
    for round in &to_restore {
        if arm_deadline(state, round, grace)? {
            restored += 1;
        }
    }
    if restored > 0 {
        info!("🔔 Restored {} deadline alarm(s)", restored);
    }
    Ok(restored)
}

fn arm_deadline(state: &AppState, round: &Round, grace: i64) -> AppResult<bool> {
    let fire_at = state.clock.parse_civil(&round.end_at)? + Duration::seconds(grace);
    Ok(state.alarms.arm(state.clone(), &round.round_id, fire_at))
}

/// Background driver: one reconciliation pass per interval, errors logged
/// and swallowed so a bad pass never kills the loop.
pub async fn run_driver(state: AppState) {
    let secs = std::env::var("TICK_INTERVAL_SECS")
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(DEFAULT_TICK_SECS);
    info!("🕰️  Scheduler driver running every {}s", secs);

    let mut interval = tokio::time::interval(std::time::Duration::from_secs(secs));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        let now = state.clock.now();
        if let Err(e) = tick(&state, now).await {
            error!("Scheduler tick failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SettlementStatus;
    use rusqlite::Connection;

    // Far-future instants keep the armed alarms from firing mid-test.

    async fn fixture() -> AppState {
        AppState::for_tests().unwrap()
    }

    fn count_rounds(conn: &Connection) -> i64 {
        conn.query_row("SELECT COUNT(*) FROM rounds", [], |row| row.get(0))
            .unwrap()
    }

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

    #[tokio::test]
    async fn test_tick_creates_and_activates_current_round() {
        let state = fixture().await;
        let now = state.clock.parse_civil("2999-03-01 12:02:13").unwrap();

        tick(&state, now).await.unwrap();

        let conn = state.db.conn().await;
        let round = rounds::get_required(&conn, "299903011200").unwrap();
        assert_eq!(round.status, RoundStatus::Active);
        assert_eq!(round.start_at, "2999-03-01 12:00:00");
        assert_eq!(round.end_at, "2999-03-01 12:05:00");
        assert!(state.alarms.is_armed("299903011200"));
    }

    #[tokio::test]
    async fn test_tick_is_idempotent() {
        let state = fixture().await;
        let now = state.clock.parse_civil("2999-03-01 12:02:13").unwrap();

        tick(&state, now).await.unwrap();
        tick(&state, now).await.unwrap();

        let conn = state.db.conn().await;
        assert_eq!(count_rounds(&conn), 1);
        assert_eq!(state.alarms.armed_count(), 1);
    }

    #[tokio::test]
    async fn test_backfill_is_capped() {
        let state = fixture().await;
        // Last known round ended six hours before `now`: 73 missed slots.
        seed_round(&state, "299903010555", RoundStatus::Completed).await;
        let now = state.clock.parse_civil("2999-03-01 12:02:00").unwrap();

        tick(&state, now).await.unwrap();

        let conn = state.db.conn().await;
        // seed + BACKFILL_CAP backfilled + the current round
        assert_eq!(count_rounds(&conn), 1 + BACKFILL_CAP as i64 + 1);
        let first = rounds::get_required(&conn, "299903010600").unwrap();
        assert_eq!(first.status, RoundStatus::Completed);
    }

    #[tokio::test]
    async fn test_backfilled_rounds_get_settled_by_safety_net() {
        let state = fixture().await;
        seed_round(&state, "299903011150", RoundStatus::Completed).await;
        let now = state.clock.parse_civil("2999-03-01 12:02:00").unwrap();

        tick(&state, now).await.unwrap();

        let conn = state.db.conn().await;
        let seeded = rounds::get_required(&conn, "299903011150").unwrap();
        let filled = rounds::get_required(&conn, "299903011155").unwrap();
        assert_eq!(seeded.settlement_status, SettlementStatus::Settled);
        assert_eq!(filled.settlement_status, SettlementStatus::Settled);
        assert!(seeded.winning_card.is_some());
    }

    #[tokio::test]
    async fn test_no_gap_between_rounds() {
        let state = fixture().await;
        seed_round(&state, "299903011200", RoundStatus::Active).await;
        let now = state.clock.parse_civil("2999-03-01 12:05:01").unwrap();

        tick(&state, now).await.unwrap();

        let conn = state.db.conn().await;
        let ended = rounds::get_required(&conn, "299903011200").unwrap();
        let next = rounds::get_required(&conn, "299903011205").unwrap();
        assert_eq!(ended.status, RoundStatus::Completed);
        assert_eq!(next.status, RoundStatus::Active);
        assert!(state.alarms.is_armed("299903011205"));
    }

    #[tokio::test]
    async fn test_outside_operating_window_creates_nothing() {
        let state = fixture().await;
        {
            let mut conn = state.db.conn().await;
            settings::set(
                &mut conn,
                settings::KEY_ROUND_START_TIME,
                "09:00",
                "admin",
                "",
                "",
                "2999-03-01 08:00:00",
            )
            .unwrap();
            settings::set(
                &mut conn,
                settings::KEY_ROUND_END_TIME,
                "10:00",
                "admin",
                "",
                "",
                "2999-03-01 08:00:00",
            )
            .unwrap();
        }
        let now = state.clock.parse_civil("2999-03-01 12:02:00").unwrap();

        tick(&state, now).await.unwrap();

        let conn = state.db.conn().await;
        assert_eq!(count_rounds(&conn), 0);
    }

    #[tokio::test]
    async fn test_on_alarm_completes_and_settles() {
        let state = fixture().await;
        seed_round(&state, "299903011200", RoundStatus::Active).await;

        on_alarm(state.clone(), "299903011200".to_string()).await;

        let conn = state.db.conn().await;
        let round = rounds::get_required(&conn, "299903011200").unwrap();
        assert_eq!(round.status, RoundStatus::Completed);
        assert_eq!(round.settlement_status, SettlementStatus::Settled);
        // Successor exists (still pending: its start is in the far future)
        assert!(rounds::get(&conn, "299903011205").unwrap().is_some());
        assert!(!state.alarms.is_armed("299903011200"));
    }

    #[tokio::test]
    async fn test_alarm_is_noop_when_operator_already_settled() {
        let state = fixture().await;
        seed_round(&state, "299903011200", RoundStatus::Completed).await;
        {
            let conn = state.db.conn().await;
            rounds::claim_settlement(&conn, "299903011200", "2999-03-01 12:05:00").unwrap();
            rounds::finalize_settled(&conn, "299903011200", 7, "2999-03-01 12:05:01").unwrap();
        }

        on_alarm(state.clone(), "299903011200".to_string()).await;

        let conn = state.db.conn().await;
        let round = rounds::get_required(&conn, "299903011200").unwrap();
        assert_eq!(round.winning_card, Some(7)); // untouched
    }

    #[tokio::test]
    async fn test_restore_alarms_after_restart() {
        let state = fixture().await;
        seed_round(&state, "299903011200", RoundStatus::Active).await;
        seed_round(&state, "299903011205", RoundStatus::Pending).await;

        let restored = restore_alarms(&state).await.unwrap();
        assert_eq!(restored, 2);
        assert!(state.alarms.is_armed("299903011200"));
        assert!(state.alarms.is_armed("299903011205"));

        // Second restore is a no-op: arming is write-once.
        assert_eq!(restore_alarms(&state).await.unwrap(), 0);
    }

    #[test]
    fn test_grace_depends_on_result_mode() {
        assert_eq!(grace_secs(ResultMode::Auto), 0);
        assert_eq!(grace_secs(ResultMode::Manual), GRACE_MANUAL_SECS);
    }
}
