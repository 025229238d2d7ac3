//! Public round views: the running round, history and the winners board.

use crate::error::AppResult;
use crate::models::Round;
use crate::state::AppState;
use crate::store::{rounds, slips, wallet};
use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

#[derive(Debug, Serialize)]
pub struct CurrentRound {
    pub round: Option<Round>,
    pub server_time: String,
    pub seconds_remaining: Option<i64>,
}

pub async fn current(State(state): State<AppState>) -> AppResult<Json<CurrentRound>> {
    let now = state.clock.now();
    let now_civil = state.clock.civil_string(now);
    let conn = state.db.conn().await;
    let round = rounds::current(&conn, &now_civil)?;

    let seconds_remaining = match &round {
        Some(r) => Some((state.clock.parse_civil(&r.end_at)? - now).num_seconds().max(0)),
        None => None,
    };
    Ok(Json(CurrentRound {
        round,
        server_time: now_civil,
        seconds_remaining,
    }))
}

pub async fn by_id(
    State(state): State<AppState>,
    Path(round_id): Path<String>,
) -> AppResult<Json<Value>> {
    state.clock.parse_round_id(&round_id)?;
    let conn = state.db.conn().await;
    let round = rounds::get_required(&conn, &round_id)?;
    let stats = wallet::round_stats(&conn, &round_id)?;
    Ok(Json(json!({ "round": round, "stats": stats })))
}

#[derive(Debug, Deserialize)]
pub struct PageQuery {
    #[serde(default = "default_page")]
    pub page: i64,
    #[serde(default = "default_limit")]
    pub limit: i64,
}

pub(crate) fn default_page() -> i64 {
    1
}

pub(crate) fn default_limit() -> i64 {
    20
}

#[derive(Debug, Deserialize)]
pub struct ByDateQuery {
    pub date: String,
    #[serde(default = "default_page")]
    pub page: i64,
    #[serde(default = "default_limit")]
    pub limit: i64,
}

/// Rounds of one civil day, `?date=YYYY-MM-DD`.
pub async fn by_date(
    State(state): State<AppState>,
    Query(query): Query<ByDateQuery>,
) -> AppResult<Json<Value>> {
    state.clock.parse_date(&query.date)?;
    let prefix = query.date.replace('-', "");

    let conn = state.db.conn().await;
    let (items, total) = rounds::list_admin(
        &conn,
        &rounds::AdminRoundFilter {
            date: Some(prefix),
            page: query.page,
            limit: query.limit,
            ..Default::default()
        },
    )?;
    Ok(Json(json!({
        "items": items,
        "total": total,
        "page": query.page.max(1),
        "limit": query.limit.clamp(1, 100),
    })))
}

pub async fn recent_winners(State(state): State<AppState>) -> AppResult<Json<Value>> {
    let conn = state.db.conn().await;
    let winners = slips::recent_winners(&conn, 20)?;
    Ok(Json(json!({ "winners": winners })))
}
