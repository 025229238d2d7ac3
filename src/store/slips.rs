//! Bet slips and their bet lines. A slip exclusively owns its lines; both are
//! mutated only by placement (insert) and settlement (is_winner/payout).

use crate::error::{is_unique_violation, AppError, AppResult};
use crate::models::{BetLine, Slip, SlipStatus};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;

const SLIP_COLS: &str = "slip_id, barcode, user_id, round_id, total_stake, payout, status, \
     claimed, claimed_at, idempotency_key, created_at";

fn row_to_slip(row: &Row<'_>) -> rusqlite::Result<Slip> {
    let status: String = row.get("status")?;
    let claimed: i64 = row.get("claimed")?;
    Ok(Slip {
        slip_id: row.get("slip_id")?,
        barcode: row.get("barcode")?,
        user_id: row.get("user_id")?,
        round_id: row.get("round_id")?,
        total_stake: row.get("total_stake")?,
        payout: row.get("payout")?,
        status: SlipStatus::from_str(&status).unwrap_or(SlipStatus::Pending),
        claimed: claimed != 0,
        claimed_at: row.get("claimed_at")?,
        idempotency_key: row.get("idempotency_key")?,
        created_at: row.get("created_at")?,
    })
}

fn row_to_line(row: &Row<'_>) -> rusqlite::Result<BetLine> {
    let card: i64 = row.get("card")?;
    let is_winner: i64 = row.get("is_winner")?;
    Ok(BetLine {
        id: row.get("id")?,
        slip_id: row.get("slip_id")?,
        card: card as u8,
        stake: row.get("stake")?,
        is_winner: is_winner != 0,
        payout: row.get("payout")?,
    })
}

/// Insert a slip. Returns false when the (user, idempotency_key) pair already
/// exists; the caller then returns the existing slip instead.
pub fn insert(conn: &Connection, slip: &Slip) -> AppResult<bool> {
    let result = conn.execute(
        "INSERT INTO bet_slips (slip_id, barcode, user_id, round_id, total_stake, payout,
                                status, claimed, idempotency_key, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, ?8, ?9)",
        params![
            slip.slip_id,
            slip.barcode,
            slip.user_id,
            slip.round_id,
            slip.total_stake,
            slip.payout,
            slip.status.as_str(),
            slip.idempotency_key,
            slip.created_at,
        ],
    );
    match result {
        Ok(_) => Ok(true),
        Err(e) if is_unique_violation(&e) => Ok(false),
        Err(e) => Err(e.into()),
    }
}

pub fn insert_line(conn: &Connection, slip_id: &str, card: u8, stake: f64) -> AppResult<()> {
    conn.execute(
        "INSERT INTO bet_details (slip_id, card, stake, is_winner, payout)
         VALUES (?1, ?2, ?3, 0, 0)",
        params![slip_id, card as i64, stake],
    )?;
    Ok(())
}

pub fn get_by_id(conn: &Connection, slip_id: &str) -> AppResult<Option<Slip>> {
    let mut stmt =
        conn.prepare_cached(&format!("SELECT {SLIP_COLS} FROM bet_slips WHERE slip_id = ?1"))?;
    Ok(stmt.query_row(params![slip_id], row_to_slip).optional()?)
}

pub fn get_by_barcode(conn: &Connection, barcode: &str) -> AppResult<Option<Slip>> {
    let mut stmt =
        conn.prepare_cached(&format!("SELECT {SLIP_COLS} FROM bet_slips WHERE barcode = ?1"))?;
    Ok(stmt.query_row(params![barcode], row_to_slip).optional()?)
}

/// Slips are addressed by slip_id (UUID) or by printed barcode.
pub fn get_by_identifier(conn: &Connection, identifier: &str) -> AppResult<Slip> {
    if let Some(slip) = get_by_id(conn, identifier)? {
        return Ok(slip);
    }
    get_by_barcode(conn, identifier)?
        .ok_or_else(|| AppError::SlipNotFound(identifier.to_string()))
}

pub fn get_by_idempotency(
    conn: &Connection,
    user_id: &str,
    idempotency_key: &str,
) -> AppResult<Option<Slip>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {SLIP_COLS} FROM bet_slips WHERE user_id = ?1 AND idempotency_key = ?2"
    ))?;
    Ok(stmt
        .query_row(params![user_id, idempotency_key], row_to_slip)
        .optional()?)
}

pub fn for_round(conn: &Connection, round_id: &str) -> AppResult<Vec<Slip>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {SLIP_COLS} FROM bet_slips WHERE round_id = ?1 ORDER BY created_at ASC"
    ))?;
    let slips = stmt
        .query_map(params![round_id], row_to_slip)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(slips)
}

pub fn lines_for_slip(conn: &Connection, slip_id: &str) -> AppResult<Vec<BetLine>> {
    let mut stmt = conn.prepare_cached(
        "SELECT id, slip_id, card, stake, is_winner, payout
         FROM bet_details WHERE slip_id = ?1 ORDER BY id ASC",
    )?;
    let lines = stmt
        .query_map(params![slip_id], row_to_line)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(lines)
}

/// Bulk loser update for one round: every line off the winning card. Safe to
/// re-run during recovery.
pub fn settle_loser_lines(conn: &Connection, round_id: &str, winning_card: u8) -> AppResult<usize> {
    let n = conn.execute(
        "UPDATE bet_details SET is_winner = 0, payout = 0
         WHERE card <> ?2
           AND slip_id IN (SELECT slip_id FROM bet_slips WHERE round_id = ?1)",
        params![round_id, winning_card as i64],
    )?;
    Ok(n)
}

/// Lines on the winning card for a round, for per-row winner updates.
pub fn winner_lines(conn: &Connection, round_id: &str, winning_card: u8) -> AppResult<Vec<BetLine>> {
    let mut stmt = conn.prepare_cached(
        "SELECT d.id, d.slip_id, d.card, d.stake, d.is_winner, d.payout
         FROM bet_details d
         JOIN bet_slips s ON s.slip_id = d.slip_id
         WHERE s.round_id = ?1 AND d.card = ?2
         ORDER BY d.id ASC",
    )?;
    let lines = stmt
        .query_map(params![round_id, winning_card as i64], row_to_line)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(lines)
}

/// Idempotent by id: re-running writes the same values.
pub fn set_line_winner(conn: &Connection, line_id: i64, payout: f64) -> AppResult<()> {
    conn.execute(
        "UPDATE bet_details SET is_winner = 1, payout = ?2 WHERE id = ?1",
        params![line_id, payout],
    )?;
    Ok(())
}

/// Bulk lost update for a round's slips, excluding winners and the cancelled
/// set (cancelled slips are never touched by settlement).
pub fn settle_lost_slips(
    conn: &Connection,
    round_id: &str,
    excluded_slip_ids: &[String],
) -> AppResult<usize> {
    if excluded_slip_ids.is_empty() {
        let n = conn.execute(
            "UPDATE bet_slips SET status = 'lost', payout = 0 WHERE round_id = ?1",
            params![round_id],
        )?;
        return Ok(n);
    }
    let placeholders = excluded_slip_ids
        .iter()
        .enumerate()
        .map(|(i, _)| format!("?{}", i + 2))
        .collect::<Vec<_>>()
        .join(", ");
    let sql = format!(
        "UPDATE bet_slips SET status = 'lost', payout = 0
         WHERE round_id = ?1 AND slip_id NOT IN ({placeholders})"
    );
    let mut args: Vec<&dyn rusqlite::ToSql> = vec![&round_id];
    for id in excluded_slip_ids {
        args.push(id);
    }
    let n = conn.execute(&sql, args.as_slice())?;
    Ok(n)
}

pub fn set_slip_won(conn: &Connection, slip_id: &str, payout: f64) -> AppResult<()> {
    conn.execute(
        "UPDATE bet_slips SET status = 'won', payout = ?2 WHERE slip_id = ?1",
        params![slip_id, payout],
    )?;
    Ok(())
}

pub fn set_slip_lost(conn: &Connection, slip_id: &str) -> AppResult<()> {
    conn.execute(
        "UPDATE bet_slips SET status = 'lost', payout = 0 WHERE slip_id = ?1",
        params![slip_id],
    )?;
    Ok(())
}

/// Race-safe single claim: zero rows means somebody already claimed.
pub fn try_mark_claimed(conn: &Connection, slip_id: &str, claimed_at: &str) -> AppResult<bool> {
    let n = conn.execute(
        "UPDATE bet_slips SET claimed = 1, claimed_at = ?2
         WHERE slip_id = ?1 AND claimed = 0",
        params![slip_id, claimed_at],
    )?;
    Ok(n > 0)
}

/// Slip as shown to users: a cancellation ledger entry overrides the stored
/// status, per the Cancellation Exclusion invariant.
#[derive(Debug, Clone, Serialize)]
pub struct SlipView {
    #[serde(flatten)]
    pub slip: Slip,
    pub display_status: String,
    pub lines: Vec<BetLine>,
}

pub fn view(conn: &Connection, slip: Slip) -> AppResult<SlipView> {
    let cancelled = super::wallet::is_cancelled(conn, &slip.slip_id)?;
    let lines = lines_for_slip(conn, &slip.slip_id)?;
    let display_status = if cancelled {
        "cancelled".to_string()
    } else {
        slip.status.as_str().to_string()
    };
    Ok(SlipView {
        slip,
        display_status,
        lines,
    })
}

pub fn list_for_user(
    conn: &Connection,
    user_id: &str,
    round_id: Option<&str>,
    page: i64,
    limit: i64,
) -> AppResult<Vec<SlipView>> {
    let limit = limit.clamp(1, 100);
    let offset = (page.max(1) - 1) * limit;
    let slips = if let Some(round_id) = round_id {
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {SLIP_COLS} FROM bet_slips
             WHERE user_id = ?1 AND round_id = ?2
             ORDER BY created_at DESC LIMIT ?3 OFFSET ?4"
        ))?;
        let rows = stmt
            .query_map(params![user_id, round_id, limit, offset], row_to_slip)?
            .collect::<Result<Vec<_>, _>>()?;
        rows
    } else {
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {SLIP_COLS} FROM bet_slips
             WHERE user_id = ?1
             ORDER BY created_at DESC LIMIT ?2 OFFSET ?3"
        ))?;
        let rows = stmt
            .query_map(params![user_id, limit, offset], row_to_slip)?
            .collect::<Result<Vec<_>, _>>()?;
        rows
    };

    slips.into_iter().map(|s| view(conn, s)).collect()
}

/// Recently settled winning slips for the public winners board. Cancelled
/// slips can never appear here: they are excluded from `won` by settlement.
pub fn recent_winners(conn: &Connection, limit: i64) -> AppResult<Vec<Slip>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {SLIP_COLS} FROM bet_slips
         WHERE status = 'won'
         ORDER BY round_id DESC, payout DESC
         LIMIT ?1"
    ))?;
    let slips = stmt
        .query_map(params![limit.clamp(1, 100)], row_to_slip)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(slips)
}
