//! Operator console endpoints. Every handler starts with the role gate;
//! players get 403 regardless of what they ask for.

use crate::auth::{client_meta, require_operator, Claims};
use crate::error::AppResult;
use crate::settlement;
use crate::state::AppState;
use crate::store::{audit, rounds, settings, wallet};
use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    Extension, Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use super::games::{default_limit, default_page};

#[derive(Debug, Deserialize)]
pub struct GamesQuery {
    pub date: Option<String>,
    pub status: Option<String>,
    pub settlement_status: Option<String>,
    #[serde(default = "default_page")]
    pub page: i64,
    #[serde(default = "default_limit")]
    pub limit: i64,
}

pub async fn list_games(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Query(query): Query<GamesQuery>,
) -> AppResult<Json<Value>> {
    require_operator(&claims)?;
    let conn = state.db.conn().await;
    let (items, total) = rounds::list_admin(
        &conn,
        &rounds::AdminRoundFilter {
            // Accept both YYYY-MM-DD and the raw round-id prefix
            date: query.date.map(|d| d.replace('-', "")),
            status: query.status,
            settlement_status: query.settlement_status,
            page: query.page,
            limit: query.limit,
        },
    )?;
    Ok(Json(json!({
        "items": items,
        "total": total,
        "page": query.page.max(1),
        "limit": query.limit.clamp(1, 100),
    })))
}

/// Settled rounds shown alongside the running one on the live view.
const RECENT_SETTLED_LIMIT: i64 = 10;

#[derive(Debug, Deserialize)]
pub struct LiveSettlementQuery {
    pub user_id: Option<String>,
}

/// Read-only poll target for the operator console: the running round's card
/// pools and stats plus the last few settled rounds, optionally narrowed to
/// one user's stakes. Never mutates anything; settlement happens only through
/// `settle`.
pub async fn live_settlement(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Query(query): Query<LiveSettlementQuery>,
) -> AppResult<Json<Value>> {
    require_operator(&claims)?;
    let now_civil = state.clock.civil_string(state.clock.now());
    let conn = state.db.conn().await;
    let payload = live_settlement_payload(&conn, &now_civil, query.user_id.as_deref())?;
    Ok(Json(payload))
}

fn live_settlement_payload(
    conn: &rusqlite::Connection,
    now_civil: &str,
    user_id: Option<&str>,
) -> AppResult<Value> {
    let current = match rounds::current(conn, now_civil)? {
        Some(round) => {
            let stats = wallet::round_stats(conn, &round.round_id)?;
            let decision =
                settlement::settlement_decision(conn, &round.round_id, round.multiplier)?;
            let user_cards = match user_id {
                Some(uid) => Some(wallet::user_card_stakes(conn, &round.round_id, uid)?),
                None => None,
            };
            json!({
                "round": round,
                "stats": stats,
                "cards": decision.cards,
                "user_cards": user_cards,
            })
        }
        None => Value::Null,
    };

    let recent_settled = rounds::recent_settled(conn, RECENT_SETTLED_LIMIT)?
        .into_iter()
        .map(|round| {
            let stats = wallet::round_stats(conn, &round.round_id)?;
            Ok(json!({ "round": round, "stats": stats }))
        })
        .collect::<AppResult<Vec<Value>>>()?;

    Ok(json!({
        "current": current,
        "recent_settled": recent_settled,
    }))
}

#[derive(Debug, Deserialize)]
pub struct SettleRequest {
    pub winning_card: u8,
}

pub async fn settle(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(round_id): Path<String>,
    Json(req): Json<SettleRequest>,
) -> AppResult<Json<Value>> {
    require_operator(&claims)?;
    state.clock.parse_round_id(&round_id)?;

    let summary =
        settlement::settle_round(&state, &round_id, req.winning_card, &claims.username).await?;
    // The deadline alarm has nothing left to do for this round.
    state.alarms.cancel(&round_id);
    info!("🧑‍⚖️ Operator {} settled round {}", claims.username, round_id);
    Ok(Json(json!({ "summary": summary })))
}

pub async fn settlement_decision(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(round_id): Path<String>,
) -> AppResult<Json<Value>> {
    require_operator(&claims)?;
    state.clock.parse_round_id(&round_id)?;
    let conn = state.db.conn().await;
    let round = rounds::get_required(&conn, &round_id)?;
    let decision = settlement::settlement_decision(&conn, &round_id, round.multiplier)?;
    Ok(Json(json!({ "decision": decision })))
}

pub async fn list_settings(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> AppResult<Json<Value>> {
    require_operator(&claims)?;
    let conn = state.db.conn().await;
    let items = settings::list_all(&conn)?;
    Ok(Json(json!({ "settings": items })))
}

#[derive(Debug, Deserialize)]
pub struct UpdateSettingRequest {
    pub key: String,
    pub value: String,
}

pub async fn update_setting(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    headers: HeaderMap,
    Json(req): Json<UpdateSettingRequest>,
) -> AppResult<Json<Value>> {
    require_operator(&claims)?;
    let meta = client_meta(&headers);
    let now_civil = state.clock.civil_string(state.clock.now());

    let mut conn = state.db.conn().await;
    settings::set(
        &mut conn,
        &req.key,
        &req.value,
        &claims.username,
        &meta.ip,
        &meta.ua,
        &now_civil,
    )?;
    info!("⚙️  {} set {} = {}", claims.username, req.key, req.value);
    let items = settings::list_all(&conn)?;
    Ok(Json(json!({ "settings": items })))
}

pub async fn settings_logs(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Query(query): Query<super::games::PageQuery>,
) -> AppResult<Json<Value>> {
    require_operator(&claims)?;
    let conn = state.db.conn().await;
    let items = settings::logs(&conn, query.page, query.limit)?;
    Ok(Json(json!({ "items": items })))
}

pub async fn audit_logs(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Query(query): Query<super::games::PageQuery>,
) -> AppResult<Json<Value>> {
    require_operator(&claims)?;
    let conn = state.db.conn().await;
    let items = audit::list(&conn, query.page, query.limit)?;
    Ok(Json(json!({ "items": items })))
}
