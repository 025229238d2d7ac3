//! JWT token handling: HS256 access tokens plus persisted refresh tokens.

use crate::error::{AppError, AppResult};
use crate::models::{Role, User};
use chrono::Utc;
use jsonwebtoken::{decode, encode, errors::ErrorKind, DecodingKey, EncodingKey, Header, Validation};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub username: String,
    pub role: Role,
    pub exp: usize,
}

pub struct JwtHandler {
    secret: String,
    expiration_hours: i64,
}

impl JwtHandler {
    pub fn new(secret: String) -> Self {
        Self {
            secret,
            expiration_hours: 24,
        }
    }

    pub fn generate_token(&self, user: &User) -> AppResult<(String, usize)> {
        let now = Utc::now();
        let expiration = now
            .checked_add_signed(chrono::Duration::hours(self.expiration_hours))
            .ok_or_else(|| AppError::Internal("invalid expiry timestamp".to_string()))?
            .timestamp() as usize;
        let expires_in = (self.expiration_hours * 3600) as usize;

        let claims = Claims {
            sub: user.id.clone(),
            username: user.username.clone(),
            role: user.role,
            exp: expiration,
        };

        debug!(
            "Generating JWT for user {} ({}), expires in {}h",
            user.username, user.id, self.expiration_hours
        );

        let token = encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(self.secret.as_bytes()),
        )
        .map_err(|e| AppError::Internal(format!("failed to sign token: {e}")))?;

        Ok((token, expires_in))
    }

    pub fn validate_token(&self, token: &str) -> AppResult<Claims> {
        let decoded = decode::<Claims>(
            token,
            &DecodingKey::from_secret(self.secret.as_bytes()),
            &Validation::default(),
        )
        .map_err(|e| match e.kind() {
            ErrorKind::ExpiredSignature => AppError::ExpiredToken,
            _ => AppError::InvalidToken,
        })?;
        Ok(decoded.claims)
    }
}

/// Issue a refresh token and persist it. Rotation revokes the old one.
pub fn issue_refresh_token(conn: &Connection, user_id: &str, now_civil: &str) -> AppResult<String> {
    let token = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO refresh_tokens (token, user_id, created_at, revoked) VALUES (?1, ?2, ?3, 0)",
        params![token, user_id, now_civil],
    )?;
    Ok(token)
}

/// Look up a live refresh token's owner.
pub fn refresh_token_owner(conn: &Connection, token: &str) -> AppResult<String> {
    let mut stmt = conn
        .prepare_cached("SELECT user_id FROM refresh_tokens WHERE token = ?1 AND revoked = 0")?;
    stmt.query_row(params![token], |row| row.get(0))
        .optional()?
        .ok_or(AppError::InvalidToken)
}

pub fn revoke_refresh_token(conn: &Connection, token: &str) -> AppResult<bool> {
    let n = conn.execute(
        "UPDATE refresh_tokens SET revoked = 1 WHERE token = ?1 AND revoked = 0",
        params![token],
    )?;
    Ok(n > 0)
}
