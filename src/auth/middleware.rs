//! Bearer-token middleware and the operator role gate.

use crate::auth::jwt::{Claims, JwtHandler};
use crate::error::{AppError, AppResult};
use axum::{
    extract::{Request, State},
    http::HeaderMap,
    middleware::Next,
    response::Response,
};
use std::sync::Arc;

/// Validates the Authorization header and stashes the claims in request
/// extensions for handlers.
pub async fn auth_middleware(
    State(jwt_handler): State<Arc<JwtHandler>>,
    mut req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let token = req
        .headers()
        .get("Authorization")
        .and_then(|h| h.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
        .map(|t| t.to_string())
        .ok_or(AppError::MissingToken)?;

    let claims = jwt_handler.validate_token(&token)?;
    req.extensions_mut().insert(claims);
    Ok(next.run(req).await)
}

/// Role membership gate for operator endpoints.
pub fn require_operator(claims: &Claims) -> AppResult<()> {
    if claims.role.is_operator() {
        Ok(())
    } else {
        Err(AppError::Forbidden)
    }
}

/// Client metadata captured for the audit and settings change-log rows.
#[derive(Debug, Clone)]
pub struct ClientMeta {
    pub ip: String,
    pub ua: String,
}

pub fn client_meta(headers: &HeaderMap) -> ClientMeta {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string()
    };
    let ip = {
        let forwarded = header("x-forwarded-for");
        if forwarded.is_empty() {
            header("x-real-ip")
        } else {
            forwarded.split(',').next().unwrap_or("").trim().to_string()
        }
    };
    ClientMeta {
        ip,
        ua: header("user-agent"),
    }
}
