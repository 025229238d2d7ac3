//! Append-only audit trail. The one table whose timestamps are UTC.

use crate::error::AppResult;
use chrono::Utc;
use rusqlite::{params, Connection};
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct AuditEntry {
    pub id: i64,
    pub actor: String,
    pub action: String,
    pub target_kind: String,
    pub target_id: String,
    pub detail: Option<String>,
    pub ip: Option<String>,
    pub ua: Option<String>,
    pub created_at: String,
}

#[allow(clippy::too_many_arguments)]
pub fn append(
    conn: &Connection,
    actor: &str,
    action: &str,
    target_kind: &str,
    target_id: &str,
    detail: Option<&str>,
    ip: Option<&str>,
    ua: Option<&str>,
) -> AppResult<i64> {
    conn.execute(
        "INSERT INTO audit_logs (actor, action, target_kind, target_id, detail, ip, ua, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            actor,
            action,
            target_kind,
            target_id,
            detail,
            ip,
            ua,
            Utc::now().to_rfc3339(),
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn list(conn: &Connection, page: i64, limit: i64) -> AppResult<Vec<AuditEntry>> {
    let limit = limit.clamp(1, 100);
    let offset = (page.max(1) - 1) * limit;
    let mut stmt = conn.prepare_cached(
        "SELECT id, actor, action, target_kind, target_id, detail, ip, ua, created_at
         FROM audit_logs ORDER BY id DESC LIMIT ?1 OFFSET ?2",
    )?;
    let entries = stmt
        .query_map(params![limit, offset], |row| {
            Ok(AuditEntry {
                id: row.get(0)?,
                actor: row.get(1)?,
                action: row.get(2)?,
                target_kind: row.get(3)?,
                target_id: row.get(4)?,
                detail: row.get(5)?,
                ip: row.get(6)?,
                ua: row.get(7)?,
                created_at: row.get(8)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Db;

    #[tokio::test]
    async fn test_append_and_list() {
        let db = Db::open_in_memory().unwrap();
        let conn = db.conn().await;
        append(
            &conn,
            "system",
            "round_settled",
            "round",
            "202503011205",
            Some("winning_card=3"),
            None,
            None,
        )
        .unwrap();
        let entries = list(&conn, 1, 10).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].actor, "system");
        assert_eq!(entries[0].target_id, "202503011205");
    }
}
