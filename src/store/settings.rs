//! Settings Store
//! Key -> string map with a typed reader and a change audit. Unknown keys are
//! rejected; missing or unparsable values fall back to typed defaults so a
//! bad write can never take the scheduler down.

use crate::error::{AppError, AppResult};
use crate::models::ResultMode;
use chrono::NaiveTime;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;

pub const KEY_ROUND_MULTIPLIER: &str = "round_multiplier";
pub const KEY_ROUND_START_TIME: &str = "round_start_time";
pub const KEY_ROUND_END_TIME: &str = "round_end_time";
pub const KEY_RESULT_MODE: &str = "result_mode";
pub const KEY_MAX_STAKE: &str = "max_stake";

pub const RECOGNIZED_KEYS: &[&str] = &[
    KEY_ROUND_MULTIPLIER,
    KEY_ROUND_START_TIME,
    KEY_ROUND_END_TIME,
    KEY_RESULT_MODE,
    KEY_MAX_STAKE,
];

pub fn default_for(key: &str) -> Option<&'static str> {
    match key {
        KEY_ROUND_MULTIPLIER => Some("10"),
        KEY_ROUND_START_TIME => Some("00:00"),
        KEY_ROUND_END_TIME => Some("23:59"),
        KEY_RESULT_MODE => Some("auto"),
        KEY_MAX_STAKE => Some("10000"),
        _ => None,
    }
}

pub fn get_raw(conn: &Connection, key: &str) -> AppResult<Option<String>> {
    let mut stmt = conn.prepare_cached("SELECT value FROM settings WHERE key = ?1")?;
    Ok(stmt.query_row(params![key], |row| row.get(0)).optional()?)
}

fn effective(conn: &Connection, key: &str) -> AppResult<String> {
    let default = default_for(key).ok_or_else(|| AppError::UnknownKey(key.to_string()))?;
    Ok(get_raw(conn, key)?.unwrap_or_else(|| default.to_string()))
}

/// Decimal reader; typed default on missing or invalid.
pub fn as_decimal(conn: &Connection, key: &str) -> AppResult<f64> {
    let raw = effective(conn, key)?;
    let fallback = default_for(key).unwrap_or("0");
    Ok(raw
        .trim()
        .parse::<f64>()
        .unwrap_or_else(|_| fallback.parse().unwrap_or(0.0)))
}

/// Civil HH:MM reader; typed default on missing or invalid.
pub fn as_civil_time(conn: &Connection, key: &str) -> AppResult<NaiveTime> {
    let raw = effective(conn, key)?;
    let fallback = default_for(key).unwrap_or("00:00");
    Ok(NaiveTime::parse_from_str(raw.trim(), "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(fallback, "%H:%M"))
        .unwrap_or_default())
}

pub fn result_mode(conn: &Connection) -> AppResult<ResultMode> {
    let raw = effective(conn, KEY_RESULT_MODE)?;
    Ok(ResultMode::from_str(raw.trim()).unwrap_or(ResultMode::Auto))
}

pub fn round_multiplier(conn: &Connection) -> AppResult<f64> {
    as_decimal(conn, KEY_ROUND_MULTIPLIER)
}

pub fn max_stake(conn: &Connection) -> AppResult<f64> {
    as_decimal(conn, KEY_MAX_STAKE)
}

/// Operating window (start, end) civil times-of-day.
pub fn operating_window(conn: &Connection) -> AppResult<(NaiveTime, NaiveTime)> {
    Ok((
        as_civil_time(conn, KEY_ROUND_START_TIME)?,
        as_civil_time(conn, KEY_ROUND_END_TIME)?,
    ))
}

/// Audited write: value update and change-log row in one transaction.
/// Requires the full (actor, ip, ua) triple.
#[allow(clippy::too_many_arguments)]
pub fn set(
    conn: &mut Connection,
    key: &str,
    value: &str,
    actor: &str,
    ip: &str,
    ua: &str,
    now_civil: &str,
) -> AppResult<()> {
    if !RECOGNIZED_KEYS.contains(&key) {
        return Err(AppError::UnknownKey(key.to_string()));
    }

    let tx = conn.transaction().map_err(AppError::from)?;
    let previous: Option<String> = tx
        .query_row(
            "SELECT value FROM settings WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()
        .map_err(AppError::from)?;
    tx.execute(
        "INSERT INTO settings (key, value, updated_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        params![key, value, now_civil],
    )
    .map_err(AppError::from)?;
    tx.execute(
        "INSERT INTO settings_logs (key, previous, new_value, admin, ip, ua, at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![key, previous, value, actor, ip, ua, now_civil],
    )
    .map_err(AppError::from)?;
    tx.commit().map_err(AppError::from)?;
    Ok(())
}

#[derive(Debug, Clone, Serialize)]
pub struct SettingsView {
    pub key: String,
    pub value: String,
    pub is_default: bool,
}

/// Every recognized key with its effective value.
pub fn list_all(conn: &Connection) -> AppResult<Vec<SettingsView>> {
    RECOGNIZED_KEYS
        .iter()
        .map(|key| {
            let stored = get_raw(conn, key)?;
            let is_default = stored.is_none();
            Ok(SettingsView {
                key: key.to_string(),
                value: stored.unwrap_or_else(|| default_for(key).unwrap_or("").to_string()),
                is_default,
            })
        })
        .collect()
}

#[derive(Debug, Clone, Serialize)]
pub struct SettingsLogEntry {
    pub id: i64,
    pub key: String,
    pub previous: Option<String>,
    pub new_value: String,
    pub admin: String,
    pub ip: String,
    pub ua: String,
    pub at: String,
}

pub fn logs(conn: &Connection, page: i64, limit: i64) -> AppResult<Vec<SettingsLogEntry>> {
    let limit = limit.clamp(1, 100);
    let offset = (page.max(1) - 1) * limit;
    let mut stmt = conn.prepare_cached(
        "SELECT id, key, previous, new_value, admin, ip, ua, at
         FROM settings_logs ORDER BY id DESC LIMIT ?1 OFFSET ?2",
    )?;
    let entries = stmt
        .query_map(params![limit, offset], |row| {
            Ok(SettingsLogEntry {
                id: row.get(0)?,
                key: row.get(1)?,
                previous: row.get(2)?,
                new_value: row.get(3)?,
                admin: row.get(4)?,
                ip: row.get(5)?,
                ua: row.get(6)?,
                at: row.get(7)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(entries)
}
