//! Append-only wallet ledger.
//!
//! The ledger is also where cancellation lives: a credit entry with
//! reference_kind = 'cancellation' naming a slip is the sole truth of that
//! slip's cancellation. The cancelled-set queries here are the primitive
//! every aggregate must go through.

use crate::error::AppResult;
use crate::models::{LedgerDirection, LedgerKind, ReferenceKind, RoundStats, WalletEntry};
use rusqlite::{params, Connection, Row};

fn row_to_entry(row: &Row<'_>) -> rusqlite::Result<WalletEntry> {
    Ok(WalletEntry {
        id: row.get("id")?,
        user_id: row.get("user_id")?,
        amount: row.get("amount")?,
        direction: row.get("direction")?,
        kind: row.get("kind")?,
        reference_kind: row.get("reference_kind")?,
        reference_id: row.get("reference_id")?,
        created_at: row.get("created_at")?,
    })
}

#[allow(clippy::too_many_arguments)]
pub fn append(
    conn: &Connection,
    user_id: &str,
    amount: f64,
    direction: LedgerDirection,
    kind: LedgerKind,
    reference_kind: Option<ReferenceKind>,
    reference_id: Option<&str>,
    created_at: &str,
) -> AppResult<i64> {
    conn.execute(
        "INSERT INTO wallet_logs (user_id, amount, direction, kind, reference_kind,
                                  reference_id, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            user_id,
            amount,
            direction.as_str(),
            kind.as_str(),
            reference_kind.map(|k| k.as_str()),
            reference_id,
            created_at,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Whether a cancellation ledger entry names this slip.
pub fn is_cancelled(conn: &Connection, slip_id: &str) -> AppResult<bool> {
    let mut stmt = conn.prepare_cached(
        "SELECT EXISTS(
            SELECT 1 FROM wallet_logs
            WHERE reference_kind = 'cancellation' AND reference_id = ?1)",
    )?;
    let exists: i64 = stmt.query_row(params![slip_id], |row| row.get(0))?;
    Ok(exists != 0)
}

/// All cancelled slip ids for a round.
pub fn cancelled_set(conn: &Connection, round_id: &str) -> AppResult<Vec<String>> {
    let mut stmt = conn.prepare_cached(
        "SELECT DISTINCT w.reference_id
         FROM wallet_logs w
         JOIN bet_slips s ON s.slip_id = w.reference_id
         WHERE w.reference_kind = 'cancellation' AND s.round_id = ?1",
    )?;
    let ids = stmt
        .query_map(params![round_id], |row| row.get(0))?
        .collect::<Result<Vec<String>, _>>()?;
    Ok(ids)
}

/// Per-card stake pools for a round, cancelled set subtracted. Drives both
/// the auto winning-card selection and the live-settlement view.
pub fn card_pools(conn: &Connection, round_id: &str) -> AppResult<Vec<(u8, f64)>> {
    let mut stmt = conn.prepare_cached(
        "SELECT d.card, SUM(d.stake)
         FROM bet_details d
         JOIN bet_slips s ON s.slip_id = d.slip_id
         WHERE s.round_id = ?1
           AND s.slip_id NOT IN (
               SELECT reference_id FROM wallet_logs
               WHERE reference_kind = 'cancellation' AND reference_id IS NOT NULL)
         GROUP BY d.card
         ORDER BY d.card ASC",
    )?;
    let pools = stmt
        .query_map(params![round_id], |row| {
            let card: i64 = row.get(0)?;
            let pool: f64 = row.get(1)?;
            Ok((card as u8, pool))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(pools)
}

/// One user's per-card stakes on a round, cancelled slips excluded. Feeds the
/// user filter on the operator's live view.
pub fn user_card_stakes(
    conn: &Connection,
    round_id: &str,
    user_id: &str,
) -> AppResult<Vec<(u8, f64)>> {
    let mut stmt = conn.prepare_cached(
        "SELECT d.card, SUM(d.stake)
         FROM bet_details d
         JOIN bet_slips s ON s.slip_id = d.slip_id
         WHERE s.round_id = ?1 AND s.user_id = ?2
           AND s.slip_id NOT IN (
               SELECT reference_id FROM wallet_logs
               WHERE reference_kind = 'cancellation' AND reference_id IS NOT NULL)
         GROUP BY d.card
         ORDER BY d.card ASC",
    )?;
    let stakes = stmt
        .query_map(params![round_id, user_id], |row| {
            let card: i64 = row.get(0)?;
            let stake: f64 = row.get(1)?;
            Ok((card as u8, stake))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(stakes)
}

/// Round aggregates with the cancelled set subtracted, per the Cancellation
/// Exclusion invariant.
pub fn round_stats(conn: &Connection, round_id: &str) -> AppResult<RoundStats> {
    let mut stmt = conn.prepare_cached(
        "SELECT
            COUNT(*),
            COALESCE(SUM(CASE WHEN cancelled = 0 THEN total_stake ELSE 0 END), 0),
            COALESCE(SUM(CASE WHEN cancelled = 0 THEN payout ELSE 0 END), 0),
            COALESCE(SUM(cancelled), 0)
         FROM (
            SELECT s.total_stake, s.payout,
                   EXISTS(SELECT 1 FROM wallet_logs w
                          WHERE w.reference_kind = 'cancellation'
                            AND w.reference_id = s.slip_id) AS cancelled
            FROM bet_slips s WHERE s.round_id = ?1
         )",
    )?;
    let (total_slips, total_wagered, total_payout, cancelled_slips): (i64, f64, f64, i64) = stmt
        .query_row(params![round_id], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
        })?;
    Ok(RoundStats {
        round_id: round_id.to_string(),
        total_slips,
        cancelled_slips,
        total_wagered,
        total_payout,
        profit: total_wagered - total_payout,
    })
}

pub fn list_for_user(
    conn: &Connection,
    user_id: &str,
    page: i64,
    limit: i64,
) -> AppResult<Vec<WalletEntry>> {
    let limit = limit.clamp(1, 100);
    let offset = (page.max(1) - 1) * limit;
    let mut stmt = conn.prepare_cached(
        "SELECT id, user_id, amount, direction, kind, reference_kind, reference_id, created_at
         FROM wallet_logs WHERE user_id = ?1
         ORDER BY id DESC LIMIT ?2 OFFSET ?3",
    )?;
    let entries = stmt
        .query_map(params![user_id, limit, offset], row_to_entry)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(entries)
}

/// Σcredits − Σdebits over the whole ledger for one user. Must equal the
/// user's stored balance delta at all times (Balance Conservation).
pub fn ledger_sum(conn: &Connection, user_id: &str) -> AppResult<f64> {
    let mut stmt = conn.prepare_cached(
        "SELECT COALESCE(SUM(CASE direction WHEN 'credit' THEN amount ELSE -amount END), 0)
         FROM wallet_logs WHERE user_id = ?1",
    )?;
    Ok(stmt.query_row(params![user_id], |row| row.get(0))?)
}

/// Entries of one reference kind naming a specific target (e.g. exactly one
/// claim credit per won slip).
pub fn entries_for_reference(
    conn: &Connection,
    reference_kind: ReferenceKind,
    reference_id: &str,
) -> AppResult<Vec<WalletEntry>> {
    let mut stmt = conn.prepare_cached(
        "SELECT id, user_id, amount, direction, kind, reference_kind, reference_id, created_at
         FROM wallet_logs WHERE reference_kind = ?1 AND reference_id = ?2
         ORDER BY id ASC",
    )?;
    let entries = stmt
        .query_map(params![reference_kind.as_str(), reference_id], row_to_entry)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(entries)
}
