//! User accounts and balances.
//!
//! The balance column is mutated only through the Wager Service paths, always
//! via the optimistic read-modify-write here so Balance Conservation never
//! depends on who holds which lock.

use crate::error::{AppError, AppResult};
use crate::models::{Role, User};
use anyhow::{Context, Result};
use bcrypt::{hash, DEFAULT_COST};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::{info, warn};
use uuid::Uuid;

/// Optimistic conflict retries before giving up with ConcurrencyExceeded.
const BALANCE_RETRIES: usize = 3;

const USER_COLS: &str = "id, username, password_hash, role, status, balance, created_at";

fn row_to_user(row: &Row<'_>) -> rusqlite::Result<User> {
    let role: String = row.get("role")?;
    Ok(User {
        id: row.get("id")?,
        username: row.get("username")?,
        password_hash: row.get("password_hash")?,
        role: Role::from_str(&role).unwrap_or(Role::Player),
        status: row.get("status")?,
        balance: row.get("balance")?,
        created_at: row.get("created_at")?,
    })
}

pub fn get_by_id(conn: &Connection, user_id: &str) -> AppResult<Option<User>> {
    let mut stmt = conn.prepare_cached(&format!("SELECT {USER_COLS} FROM users WHERE id = ?1"))?;
    Ok(stmt.query_row(params![user_id], row_to_user).optional()?)
}

pub fn get_required(conn: &Connection, user_id: &str) -> AppResult<User> {
    get_by_id(conn, user_id)?.ok_or_else(|| AppError::UserNotFound(user_id.to_string()))
}

/// Wager paths are open to `active` accounts only; banned or inactive
/// accounts keep their balance but cannot transact.
pub fn require_active(conn: &Connection, user_id: &str) -> AppResult<User> {
    let user = get_required(conn, user_id)?;
    if user.status != "active" {
        return Err(AppError::Forbidden);
    }
    Ok(user)
}

pub fn get_by_username(conn: &Connection, username: &str) -> AppResult<Option<User>> {
    let mut stmt =
        conn.prepare_cached(&format!("SELECT {USER_COLS} FROM users WHERE username = ?1"))?;
    Ok(stmt.query_row(params![username], row_to_user).optional()?)
}

pub fn create(
    conn: &Connection,
    username: &str,
    password_hash: &str,
    role: Role,
    balance: f64,
    created_at: &str,
) -> AppResult<User> {
    let user = User {
        id: Uuid::new_v4().to_string(),
        username: username.to_string(),
        password_hash: password_hash.to_string(),
        role,
        status: "active".to_string(),
        balance,
        created_at: created_at.to_string(),
    };
    conn.execute(
        "INSERT INTO users (id, username, password_hash, role, status, balance, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            user.id,
            user.username,
            user.password_hash,
            user.role.as_str(),
            user.status,
            user.balance,
            user.created_at,
        ],
    )?;
    Ok(user)
}

/// First-boot bootstrap, same shape as the usual dev setup: an admin account
/// exists so the operator UI can log in immediately.
pub fn ensure_default_admin(conn: &Connection, created_at: &str) -> Result<()> {
    let count: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM users WHERE role = 'admin'",
            [],
            |row| row.get(0),
        )
        .context("Failed to check for admin users")?;

    if count == 0 {
        let password_hash = hash("admin123", DEFAULT_COST).context("Failed to hash password")?;
        create(conn, "admin", &password_hash, Role::Admin, 0.0, created_at)
            .map_err(|e| anyhow::anyhow!("{e}"))?;
        info!("🔐 Default admin user created (username: admin, password: admin123)");
        warn!("⚠️  CHANGE DEFAULT PASSWORD IN PRODUCTION!");
    }

    Ok(())
}

/// Successful logins only; failures are just logged.
pub fn record_login(
    conn: &Connection,
    user_id: &str,
    ip: &str,
    ua: &str,
    at: &str,
) -> AppResult<()> {
    conn.execute(
        "INSERT INTO login_history (user_id, ip, ua, at) VALUES (?1, ?2, ?3, ?4)",
        params![user_id, ip, ua, at],
    )?;
    Ok(())
}

pub fn balance(conn: &Connection, user_id: &str) -> AppResult<f64> {
    let mut stmt = conn.prepare_cached("SELECT balance FROM users WHERE id = ?1")?;
    stmt.query_row(params![user_id], |row| row.get(0))
        .optional()?
        .ok_or_else(|| AppError::UserNotFound(user_id.to_string()))
}

/// One optimistic debit attempt: succeeds only if the balance still equals
/// the observed value and covers the amount.
fn try_debit(conn: &Connection, user_id: &str, observed: f64, amount: f64) -> AppResult<bool> {
    let n = conn.execute(
        "UPDATE users SET balance = balance - ?3
         WHERE id = ?1 AND balance = ?2 AND balance >= ?3",
        params![user_id, observed, amount],
    )?;
    Ok(n > 0)
}

/// Debit with the read-modify-write retry loop from the concurrency model:
/// re-read, conditional update, up to 3 attempts, then ConcurrencyExceeded.
/// Returns the new balance.
pub fn debit_with_retry(conn: &Connection, user_id: &str, amount: f64) -> AppResult<f64> {
    for _ in 0..BALANCE_RETRIES {
        let observed = balance(conn, user_id)?;
        if observed < amount {
            return Err(AppError::InsufficientFunds);
        }
        if try_debit(conn, user_id, observed, amount)? {
            return Ok(observed - amount);
        }
    }
    Err(AppError::ConcurrencyExceeded)
}

/// Credits never fail a predicate; they are plain additions.
pub fn credit(conn: &Connection, user_id: &str, amount: f64) -> AppResult<f64> {
    let n = conn.execute(
        "UPDATE users SET balance = balance + ?2 WHERE id = ?1",
        params![user_id, amount],
    )?;
    if n == 0 {
        return Err(AppError::UserNotFound(user_id.to_string()));
    }
    balance(conn, user_id)
}
