//! Application error taxonomy
//! Every domain path returns `AppError`; boot paths use anyhow.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::fmt;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Clone, PartialEq)]
pub enum AppError {
    // Validation -> 400
    InvalidRoundId(String),
    InvalidCard(i64),
    InvalidStake,
    UnknownKey(String),
    BadTimeFormat(String),

    // Auth -> 401 / 403
    InvalidCredentials,
    MissingToken,
    InvalidToken,
    ExpiredToken,
    Forbidden,

    // Not found -> 404
    RoundNotFound(String),
    SlipNotFound(String),
    UserNotFound(String),

    // State -> 400
    RoundNotOpen(String),
    WrongStatus(String),
    AlreadySettled(String),
    AlreadyClaimed,
    SlipCancelled,
    SettlementNotReady,

    // Balance -> 400 / 409
    InsufficientFunds,
    ConcurrencyExceeded,

    // Transient -> 5xx, caller-retryable
    TransientStore(String),
    Timeout,

    // Anything unclassified -> 500
    Internal(String),
}

impl AppError {
    /// Stable machine-readable code returned alongside the message.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::InvalidRoundId(_) => "INVALID_ROUND_ID",
            AppError::InvalidCard(_) => "INVALID_CARD",
            AppError::InvalidStake => "INVALID_STAKE",
            AppError::UnknownKey(_) => "UNKNOWN_KEY",
            AppError::BadTimeFormat(_) => "BAD_TIME_FORMAT",
            AppError::InvalidCredentials => "INVALID_CREDENTIALS",
            AppError::MissingToken => "MISSING_TOKEN",
            AppError::InvalidToken => "INVALID_TOKEN",
            AppError::ExpiredToken => "EXPIRED_TOKEN",
            AppError::Forbidden => "FORBIDDEN",
            AppError::RoundNotFound(_) => "ROUND_NOT_FOUND",
            AppError::SlipNotFound(_) => "SLIP_NOT_FOUND",
            AppError::UserNotFound(_) => "USER_NOT_FOUND",
            AppError::RoundNotOpen(_) => "ROUND_NOT_OPEN",
            AppError::WrongStatus(_) => "WRONG_STATUS",
            AppError::AlreadySettled(_) => "ALREADY_SETTLED",
            AppError::AlreadyClaimed => "ALREADY_CLAIMED",
            AppError::SlipCancelled => "SLIP_CANCELLED",
            AppError::SettlementNotReady => "SETTLEMENT_NOT_READY",
            AppError::InsufficientFunds => "INSUFFICIENT_FUNDS",
            AppError::ConcurrencyExceeded => "CONCURRENCY_EXCEEDED",
            AppError::TransientStore(_) => "TRANSIENT_STORE",
            AppError::Timeout => "TIMEOUT",
            AppError::Internal(_) => "INTERNAL",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AppError::InvalidRoundId(_)
            | AppError::InvalidCard(_)
            | AppError::InvalidStake
            | AppError::UnknownKey(_)
            | AppError::BadTimeFormat(_)
            | AppError::RoundNotOpen(_)
            | AppError::WrongStatus(_)
            | AppError::AlreadySettled(_)
            | AppError::AlreadyClaimed
            | AppError::SlipCancelled
            | AppError::SettlementNotReady
            | AppError::InsufficientFunds => StatusCode::BAD_REQUEST,
            AppError::InvalidCredentials
            | AppError::MissingToken
            | AppError::InvalidToken
            | AppError::ExpiredToken => StatusCode::UNAUTHORIZED,
            AppError::Forbidden => StatusCode::FORBIDDEN,
            AppError::RoundNotFound(_)
            | AppError::SlipNotFound(_)
            | AppError::UserNotFound(_) => StatusCode::NOT_FOUND,
            AppError::ConcurrencyExceeded => StatusCode::CONFLICT,
            AppError::TransientStore(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Timeout => StatusCode::GATEWAY_TIMEOUT,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Transient errors are safe to retry; everything else is deterministic.
    pub fn is_transient(&self) -> bool {
        matches!(self, AppError::TransientStore(_) | AppError::Timeout)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::InvalidRoundId(id) => write!(f, "invalid round id: {id}"),
            AppError::InvalidCard(c) => write!(f, "invalid card: {c} (expected 1..12)"),
            AppError::InvalidStake => write!(f, "stake must be positive and within max_stake"),
            AppError::UnknownKey(k) => write!(f, "unknown settings key: {k}"),
            AppError::BadTimeFormat(s) => write!(f, "bad time format: {s}"),
            AppError::InvalidCredentials => write!(f, "invalid username or password"),
            AppError::MissingToken => write!(f, "missing authorization token"),
            AppError::InvalidToken => write!(f, "invalid token"),
            AppError::ExpiredToken => write!(f, "expired token"),
            AppError::Forbidden => write!(f, "insufficient permissions"),
            AppError::RoundNotFound(id) => write!(f, "round not found: {id}"),
            AppError::SlipNotFound(id) => write!(f, "slip not found: {id}"),
            AppError::UserNotFound(id) => write!(f, "user not found: {id}"),
            AppError::RoundNotOpen(id) => write!(f, "round not open for betting: {id}"),
            AppError::WrongStatus(detail) => write!(f, "wrong status: {detail}"),
            AppError::AlreadySettled(id) => write!(f, "round already settled: {id}"),
            AppError::AlreadyClaimed => write!(f, "slip already claimed"),
            AppError::SlipCancelled => write!(f, "slip was cancelled"),
            AppError::SettlementNotReady => write!(f, "round is not settled yet"),
            AppError::InsufficientFunds => write!(f, "insufficient balance"),
            AppError::ConcurrencyExceeded => write!(f, "too many concurrent balance updates"),
            AppError::TransientStore(detail) => write!(f, "transient store error: {detail}"),
            AppError::Timeout => write!(f, "operation timed out"),
            AppError::Internal(detail) => write!(f, "internal error: {detail}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<rusqlite::Error> for AppError {
    fn from(e: rusqlite::Error) -> Self {
        AppError::TransientStore(e.to_string())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = Json(json!({
            "error": self.to_string(),
            "code": self.code(),
        }));
        (status, body).into_response()
    }
}

/// True when a rusqlite error is a unique-key violation. Idempotency and
/// slot-uniqueness races are resolved by mapping this to "row already exists".
pub fn is_unique_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _)
            if err.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            AppError::InvalidCard(13).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(AppError::MissingToken.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(AppError::Forbidden.status(), StatusCode::FORBIDDEN);
        assert_eq!(
            AppError::RoundNotFound("202501010000".into()).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            AppError::ConcurrencyExceeded.status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            AppError::TransientStore("db".into()).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn test_transient_classification() {
        assert!(AppError::TransientStore("x".into()).is_transient());
        assert!(AppError::Timeout.is_transient());
        assert!(!AppError::AlreadySettled("r".into()).is_transient());
        assert!(!AppError::Internal("x".into()).is_transient());
    }
}
