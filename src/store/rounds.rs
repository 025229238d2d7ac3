//! Round rows and their optimistic state transitions.
//!
//! Every transition is a conditional UPDATE predicated on the current status,
//! which is what linearizes the concurrent triggers (coarse tick, per-round
//! alarm, operator action). Zero rows affected means somebody else got there
//! first, never an error.

use crate::error::{is_unique_violation, AppError, AppResult};
use crate::models::{Round, RoundStatus, SettlementStatus};
use rusqlite::{params, Connection, OptionalExtension, Row};

fn row_to_round(row: &Row<'_>) -> rusqlite::Result<Round> {
    let status: String = row.get("status")?;
    let settlement: String = row.get("settlement_status")?;
    let winning_card: Option<i64> = row.get("winning_card")?;
    Ok(Round {
        round_id: row.get("round_id")?,
        start_at: row.get("start_at")?,
        end_at: row.get("end_at")?,
        status: RoundStatus::from_str(&status).unwrap_or(RoundStatus::Pending),
        winning_card: winning_card.map(|c| c as u8),
        multiplier: row.get("multiplier")?,
        settlement_status: SettlementStatus::from_str(&settlement)
            .unwrap_or(SettlementStatus::NotSettled),
        settlement_started_at: row.get("settlement_started_at")?,
        settlement_completed_at: row.get("settlement_completed_at")?,
        settlement_error: row.get("settlement_error")?,
    })
}

const ROUND_COLS: &str = "round_id, start_at, end_at, status, winning_card, multiplier, \
     settlement_status, settlement_started_at, settlement_completed_at, settlement_error";

/// Idempotent insert keyed on round_id. Returns true when the row was created
/// by this call. Concurrent callers are safe: the unique key absorbs the race.
pub fn insert_if_missing(
    conn: &Connection,
    round_id: &str,
    start_at: &str,
    end_at: &str,
    status: RoundStatus,
    multiplier: f64,
) -> AppResult<bool> {
    let result = conn.execute(
        "INSERT INTO rounds (round_id, start_at, end_at, status, multiplier, settlement_status)
         VALUES (?1, ?2, ?3, ?4, ?5, 'not_settled')",
        params![round_id, start_at, end_at, status.as_str(), multiplier],
    );
    match result {
        Ok(n) => Ok(n > 0),
        Err(e) if is_unique_violation(&e) => Ok(false),
        Err(e) => Err(e.into()),
    }
}

pub fn get(conn: &Connection, round_id: &str) -> AppResult<Option<Round>> {
    let mut stmt =
        conn.prepare_cached(&format!("SELECT {ROUND_COLS} FROM rounds WHERE round_id = ?1"))?;
    Ok(stmt.query_row(params![round_id], row_to_round).optional()?)
}

pub fn get_required(conn: &Connection, round_id: &str) -> AppResult<Round> {
    get(conn, round_id)?.ok_or_else(|| AppError::RoundNotFound(round_id.to_string()))
}

/// pending -> active, guarded by the status predicate.
pub fn try_activate(conn: &Connection, round_id: &str) -> AppResult<bool> {
    let n = conn.execute(
        "UPDATE rounds SET status = 'active' WHERE round_id = ?1 AND status = 'pending'",
        params![round_id],
    )?;
    Ok(n > 0)
}

/// active -> completed, guarded by the status predicate.
pub fn try_complete(conn: &Connection, round_id: &str) -> AppResult<bool> {
    let n = conn.execute(
        "UPDATE rounds SET status = 'completed' WHERE round_id = ?1 AND status = 'active'",
        params![round_id],
    )?;
    Ok(n > 0)
}

/// Ids of pending rounds due for activation at `now_civil`.
pub fn pending_due(conn: &Connection, now_civil: &str) -> AppResult<Vec<String>> {
    let mut stmt = conn.prepare_cached(
        "SELECT round_id FROM rounds WHERE status = 'pending' AND start_at <= ?1
         ORDER BY round_id ASC",
    )?;
    let ids = stmt
        .query_map(params![now_civil], |row| row.get(0))?
        .collect::<Result<Vec<String>, _>>()?;
    Ok(ids)
}

/// Ids of active rounds past their end.
pub fn active_due(conn: &Connection, now_civil: &str) -> AppResult<Vec<String>> {
    let mut stmt = conn.prepare_cached(
        "SELECT round_id FROM rounds WHERE status = 'active' AND end_at <= ?1
         ORDER BY round_id ASC",
    )?;
    let ids = stmt
        .query_map(params![now_civil], |row| row.get(0))?
        .collect::<Result<Vec<String>, _>>()?;
    Ok(ids)
}

/// Conditional settlement claim: not_settled -> settling. Exactly one caller
/// wins; everyone else observes zero rows and reports AlreadySettled.
pub fn claim_settlement(conn: &Connection, round_id: &str, started_at: &str) -> AppResult<bool> {
    let n = conn.execute(
        "UPDATE rounds SET settlement_status = 'settling', settlement_started_at = ?2
         WHERE round_id = ?1 AND settlement_status = 'not_settled'",
        params![round_id, started_at],
    )?;
    Ok(n > 0)
}

/// settling -> settled, also forcing completion for the early-settlement path.
pub fn finalize_settled(
    conn: &Connection,
    round_id: &str,
    winning_card: u8,
    completed_at: &str,
) -> AppResult<()> {
    conn.execute(
        "UPDATE rounds SET winning_card = ?2, settlement_status = 'settled',
                settlement_completed_at = ?3, settlement_error = NULL,
                status = 'completed'
         WHERE round_id = ?1",
        params![round_id, winning_card as i64, completed_at],
    )?;
    Ok(())
}

/// Deterministic settlement failures only; transient ones stay `settling`.
pub fn mark_settlement_failed(conn: &Connection, round_id: &str, error: &str) -> AppResult<()> {
    conn.execute(
        "UPDATE rounds SET settlement_status = 'failed', settlement_error = ?2
         WHERE round_id = ?1 AND settlement_status = 'settling'",
        params![round_id, error],
    )?;
    Ok(())
}

/// Latest round on the grid, by id (ids sort chronologically).
pub fn latest(conn: &Connection) -> AppResult<Option<Round>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {ROUND_COLS} FROM rounds ORDER BY round_id DESC LIMIT 1"
    ))?;
    Ok(stmt.query_row([], row_to_round).optional()?)
}

/// The round whose slot window contains `now_civil`, preferring active status.
pub fn current(conn: &Connection, now_civil: &str) -> AppResult<Option<Round>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {ROUND_COLS} FROM rounds
         WHERE start_at <= ?1 AND end_at > ?1
         ORDER BY CASE status WHEN 'active' THEN 0 ELSE 1 END, round_id DESC
         LIMIT 1"
    ))?;
    Ok(stmt.query_row(params![now_civil], row_to_round).optional()?)
}

/// Rounds stuck in `settling` with a start timestamp older than the cutoff,
/// candidates for recovery re-drive.
pub fn stuck_settling(conn: &Connection, cutoff_civil: &str) -> AppResult<Vec<Round>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {ROUND_COLS} FROM rounds
         WHERE settlement_status = 'settling' AND settlement_started_at <= ?1
         ORDER BY round_id ASC"
    ))?;
    let rounds = stmt
        .query_map(params![cutoff_civil], row_to_round)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rounds)
}

/// Completed rounds that nobody settled yet and whose deadline has passed.
/// The coarse tick uses this as the safety net behind the per-round alarms.
pub fn completed_unsettled(conn: &Connection, deadline_civil: &str) -> AppResult<Vec<Round>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {ROUND_COLS} FROM rounds
         WHERE status = 'completed' AND settlement_status = 'not_settled' AND end_at <= ?1
         ORDER BY round_id ASC"
    ))?;
    let rounds = stmt
        .query_map(params![deadline_civil], row_to_round)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rounds)
}

/// Rounds whose deadline alarms must be restored after a restart.
pub fn alarm_restore_set(conn: &Connection, min_end_civil: &str) -> AppResult<Vec<Round>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {ROUND_COLS} FROM rounds
         WHERE end_at >= ?1
           AND (status IN ('pending', 'active')
                OR settlement_status IN ('not_settled', 'settling'))
         ORDER BY round_id ASC"
    ))?;
    let rounds = stmt
        .query_map(params![min_end_civil], row_to_round)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rounds)
}

/// Most recently settled rounds, newest first.
pub fn recent_settled(conn: &Connection, limit: i64) -> AppResult<Vec<Round>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {ROUND_COLS} FROM rounds
         WHERE settlement_status = 'settled'
         ORDER BY round_id DESC LIMIT ?1"
    ))?;
    let rounds = stmt
        .query_map(params![limit], row_to_round)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rounds)
}

#[derive(Debug, Default, Clone)]
pub struct AdminRoundFilter {
    pub date: Option<String>, // YYYYMMDD round-id prefix
    pub status: Option<String>,
    pub settlement_status: Option<String>,
    pub page: i64,
    pub limit: i64,
}

/// Admin listing: active first, then pending by soonest start, then completed
/// most-recent.
pub fn list_admin(conn: &Connection, filter: &AdminRoundFilter) -> AppResult<(Vec<Round>, i64)> {
    let mut where_clauses: Vec<String> = Vec::new();
    let mut args: Vec<String> = Vec::new();

    if let Some(date) = &filter.date {
        args.push(format!("{date}%"));
        where_clauses.push(format!("round_id LIKE ?{}", args.len()));
    }
    if let Some(status) = &filter.status {
        args.push(status.clone());
        where_clauses.push(format!("status = ?{}", args.len()));
    }
    if let Some(settlement) = &filter.settlement_status {
        args.push(settlement.clone());
        where_clauses.push(format!("settlement_status = ?{}", args.len()));
    }

    let where_sql = if where_clauses.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", where_clauses.join(" AND "))
    };

    let count_sql = format!("SELECT COUNT(*) FROM rounds {where_sql}");
    let total: i64 = conn.query_row(
        &count_sql,
        rusqlite::params_from_iter(args.iter()),
        |row| row.get(0),
    )?;

    let limit = filter.limit.clamp(1, 100);
    let offset = (filter.page.max(1) - 1) * limit;
    let list_sql = format!(
        "SELECT {ROUND_COLS} FROM rounds {where_sql}
         ORDER BY CASE status WHEN 'active' THEN 0 WHEN 'pending' THEN 1 ELSE 2 END,
                  CASE WHEN status = 'pending' THEN round_id END ASC,
                  CASE WHEN status = 'completed' THEN round_id END DESC
         LIMIT {limit} OFFSET {offset}"
    );
    let mut stmt = conn.prepare(&list_sql)?;
    let rounds = stmt
        .query_map(rusqlite::params_from_iter(args.iter()), row_to_round)?
        .collect::<Result<Vec<_>, _>>()?;

    Ok((rounds, total))
}
