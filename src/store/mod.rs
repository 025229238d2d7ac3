//! SQLite persistence layer
//!
//! One database file, one connection behind an async mutex. WAL mode keeps
//! readers cheap; multi-step writes run as explicit transactions on the
//! locked connection. Engines lock once per logical operation and call the
//! row-level helpers in the submodules against that connection.

pub mod audit;
pub mod rounds;
pub mod settings;
pub mod slips;
pub mod users;
pub mod wallet;

use anyhow::{Context, Result};
use rusqlite::Connection;
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};

/// Schema, applied idempotently at boot.
///
/// Civil-time columns hold pre-formatted "YYYY-MM-DD HH:MM:SS" strings in the
/// operating zone (UTC+05:30); string comparison on them is deterministic.
/// Only audit_logs.created_at is UTC.
const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS rounds (
    round_id TEXT PRIMARY KEY,
    start_at TEXT NOT NULL,
    end_at TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    winning_card INTEGER,
    multiplier REAL NOT NULL,
    settlement_status TEXT NOT NULL DEFAULT 'not_settled',
    settlement_started_at TEXT,
    settlement_completed_at TEXT,
    settlement_error TEXT
);

CREATE INDEX IF NOT EXISTS idx_rounds_status ON rounds(status, start_at);
CREATE INDEX IF NOT EXISTS idx_rounds_settlement ON rounds(settlement_status, end_at);

CREATE TABLE IF NOT EXISTS users (
    id TEXT PRIMARY KEY,
    username TEXT UNIQUE NOT NULL,
    password_hash TEXT NOT NULL,
    role TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'active',
    balance REAL NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS bet_slips (
    slip_id TEXT PRIMARY KEY,
    barcode TEXT UNIQUE NOT NULL,
    user_id TEXT NOT NULL,
    round_id TEXT NOT NULL,
    total_stake REAL NOT NULL,
    payout REAL NOT NULL DEFAULT 0,
    status TEXT NOT NULL DEFAULT 'pending',
    claimed INTEGER NOT NULL DEFAULT 0,
    claimed_at TEXT,
    idempotency_key TEXT NOT NULL,
    created_at TEXT NOT NULL,
    UNIQUE(user_id, idempotency_key)
);

CREATE INDEX IF NOT EXISTS idx_bet_slips_round ON bet_slips(round_id);
CREATE INDEX IF NOT EXISTS idx_bet_slips_user ON bet_slips(user_id, created_at DESC);

CREATE TABLE IF NOT EXISTS bet_details (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    slip_id TEXT NOT NULL,
    card INTEGER NOT NULL,
    stake REAL NOT NULL,
    is_winner INTEGER NOT NULL DEFAULT 0,
    payout REAL NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_bet_details_slip ON bet_details(slip_id);

CREATE TABLE IF NOT EXISTS wallet_logs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id TEXT NOT NULL,
    amount REAL NOT NULL,
    direction TEXT NOT NULL,
    kind TEXT NOT NULL,
    reference_kind TEXT,
    reference_id TEXT,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_wallet_logs_reference ON wallet_logs(reference_kind, reference_id);
CREATE INDEX IF NOT EXISTS idx_wallet_logs_user ON wallet_logs(user_id, id DESC);

CREATE TABLE IF NOT EXISTS settings (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS settings_logs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    key TEXT NOT NULL,
    previous TEXT,
    new_value TEXT NOT NULL,
    admin TEXT NOT NULL,
    ip TEXT NOT NULL,
    ua TEXT NOT NULL,
    at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS audit_logs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    actor TEXT NOT NULL,
    action TEXT NOT NULL,
    target_kind TEXT NOT NULL,
    target_id TEXT NOT NULL,
    detail TEXT,
    ip TEXT,
    ua TEXT,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS refresh_tokens (
    token TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    created_at TEXT NOT NULL,
    revoked INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS login_history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id TEXT NOT NULL,
    ip TEXT NOT NULL,
    ua TEXT NOT NULL,
    at TEXT NOT NULL
);
"#;

#[derive(Clone)]
pub struct Db {
    conn: Arc<Mutex<Connection>>,
}

impl Db {
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path)
            .with_context(|| format!("Failed to open database at {}", db_path))?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        conn.execute_batch(SCHEMA_SQL)
            .context("Failed to apply schema")?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// In-memory database for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        conn.execute_batch(SCHEMA_SQL)
            .context("Failed to apply schema")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub async fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().await
    }
}
