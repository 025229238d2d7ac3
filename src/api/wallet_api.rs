//! Wallet read endpoints for the authenticated user.

use crate::auth::Claims;
use crate::error::AppResult;
use crate::state::AppState;
use crate::store::{users, wallet};
use axum::{
    extract::{Query, State},
    Extension, Json,
};
use serde_json::{json, Value};

use super::games::PageQuery;

pub async fn balance(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> AppResult<Json<Value>> {
    let conn = state.db.conn().await;
    let balance = users::balance(&conn, &claims.sub)?;
    Ok(Json(json!({ "balance": balance })))
}

pub async fn logs(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Query(query): Query<PageQuery>,
) -> AppResult<Json<Value>> {
    let conn = state.db.conn().await;
    let items = wallet::list_for_user(&conn, &claims.sub, query.page, query.limit)?;
    Ok(Json(json!({
        "items": items,
        "page": query.page.max(1),
        "limit": query.limit.clamp(1, 100),
    })))
}
