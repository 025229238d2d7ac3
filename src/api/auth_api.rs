//! Login, token refresh and logout.

use crate::auth::{client_meta, jwt};
use crate::error::{AppError, AppResult};
use crate::models::User;
use crate::state::AppState;
use crate::store::users;
use axum::{extract::State, http::HeaderMap, Json};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, warn};

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct TokenResponse {
    pub token: String,
    pub refresh_token: String,
    pub expires_in: usize,
    pub user: User,
}

pub async fn login(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<LoginRequest>,
) -> AppResult<Json<TokenResponse>> {
    let meta = client_meta(&headers);
    let conn = state.db.conn().await;

    let user = users::get_by_username(&conn, &req.username)?.ok_or_else(|| {
        warn!("Login failed for unknown user '{}' from {}", req.username, meta.ip);
        AppError::InvalidCredentials
    })?;
    let ok = bcrypt::verify(&req.password, &user.password_hash)
        .map_err(|e| AppError::Internal(format!("password verification failed: {e}")))?;
    if !ok {
        warn!("Login failed for '{}' from {}", user.username, meta.ip);
        return Err(AppError::InvalidCredentials);
    }
    if user.status != "active" {
        warn!(
            "Login rejected for '{}' from {}: account is {}",
            user.username, meta.ip, user.status
        );
        return Err(AppError::Forbidden);
    }

    let now_civil = state.clock.civil_string(state.clock.now());
    users::record_login(&conn, &user.id, &meta.ip, &meta.ua, &now_civil)?;
    let (token, expires_in) = state.jwt.generate_token(&user)?;
    let refresh_token = jwt::issue_refresh_token(&conn, &user.id, &now_civil)?;

    info!("🔓 {} logged in", user.username);
    Ok(Json(TokenResponse {
        token,
        refresh_token,
        expires_in,
        user,
    }))
}

#[derive(Debug, Deserialize)]
pub struct RefreshRequest {
    pub refresh_token: String,
}

/// Rotate: the presented refresh token is revoked and replaced.
pub async fn refresh(
    State(state): State<AppState>,
    Json(req): Json<RefreshRequest>,
) -> AppResult<Json<TokenResponse>> {
    let conn = state.db.conn().await;
    let user_id = jwt::refresh_token_owner(&conn, &req.refresh_token)?;
    let user = users::get_required(&conn, &user_id)?;

    let now_civil = state.clock.civil_string(state.clock.now());
    jwt::revoke_refresh_token(&conn, &req.refresh_token)?;
    let refresh_token = jwt::issue_refresh_token(&conn, &user.id, &now_civil)?;
    let (token, expires_in) = state.jwt.generate_token(&user)?;

    Ok(Json(TokenResponse {
        token,
        refresh_token,
        expires_in,
        user,
    }))
}

pub async fn logout(
    State(state): State<AppState>,
    Json(req): Json<RefreshRequest>,
) -> AppResult<Json<Value>> {
    let conn = state.db.conn().await;
    let revoked = jwt::revoke_refresh_token(&conn, &req.refresh_token)?;
    Ok(Json(json!({ "revoked": revoked })))
}
