//! Betting endpoints, all behind the bearer-token middleware.

use crate::auth::Claims;
use crate::error::AppResult;
use crate::state::AppState;
use crate::store::slips;
use crate::wager::{self, BetLineInput};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Extension, Json,
};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

#[derive(Debug, Deserialize)]
pub struct PlaceBetRequest {
    pub round_id: String,
    pub bets: Vec<BetLineInput>,
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

/// 201 for a fresh slip, 200 when the idempotency key replayed. The key comes
/// from the `x-idempotency-key` header or the body; a client that sends
/// neither gets a generated key (and therefore no replay protection).
pub async fn place(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    headers: axum::http::HeaderMap,
    Json(req): Json<PlaceBetRequest>,
) -> AppResult<Response> {
    let key = headers
        .get("x-idempotency-key")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .or(req.idempotency_key)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let outcome = wager::place_bet(&state, &claims.sub, &req.round_id, &req.bets, &key).await?;
    let status = if outcome.duplicate {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    Ok((status, Json(outcome)).into_response())
}

#[derive(Debug, Deserialize)]
pub struct ClaimRequest {
    pub identifier: String,
}

pub async fn claim(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<ClaimRequest>,
) -> AppResult<Response> {
    let outcome = wager::claim(&state, &claims.sub, &req.identifier).await?;
    Ok(Json(outcome).into_response())
}

#[derive(Debug, Default, Deserialize)]
pub struct CancelRequest {
    pub reason: Option<String>,
}

/// The body is optional; a bare POST cancels without a recorded reason.
/// Operators may cancel any slip, players only their own.
pub async fn cancel(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(identifier): Path<String>,
    body: Option<Json<CancelRequest>>,
) -> AppResult<Response> {
    let reason = body.and_then(|Json(req)| req.reason);
    let view = wager::cancel(
        &state,
        &claims.sub,
        claims.role.is_operator(),
        &identifier,
        reason.as_deref(),
    )
    .await?;
    Ok(Json(view).into_response())
}

pub async fn scan_and_claim(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(identifier): Path<String>,
) -> AppResult<Response> {
    let outcome = wager::scan_and_claim(&state, &claims.sub, &identifier).await?;
    Ok(Json(outcome).into_response())
}

#[derive(Debug, Deserialize)]
pub struct MySlipsQuery {
    pub round_id: Option<String>,
    #[serde(default = "super::games::default_page")]
    pub page: i64,
    #[serde(default = "super::games::default_limit")]
    pub limit: i64,
}

pub async fn my_slips(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Query(query): Query<MySlipsQuery>,
) -> AppResult<Response> {
    let conn = state.db.conn().await;
    let items = slips::list_for_user(
        &conn,
        &claims.sub,
        query.round_id.as_deref(),
        query.page,
        query.limit,
    )?;
    Ok(Json(json!({
        "items": items,
        "page": query.page.max(1),
        "limit": query.limit.clamp(1, 100),
    }))
    .into_response())
}
