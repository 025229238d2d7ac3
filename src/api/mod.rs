//! HTTP surface: route table and the shared response envelope conventions.
//! Handlers stay thin; all domain logic lives in the engines and stores.

pub mod admin;
pub mod auth_api;
pub mod bets;
pub mod games;
pub mod wallet_api;

use crate::auth::auth_middleware;
use crate::error::AppError;
use crate::state::AppState;
use axum::{
    error_handling::HandleErrorLayer,
    extract::State,
    middleware::from_fn_with_state,
    routing::{get, post},
    Json, Router,
};
use axum::http::HeaderValue;
use serde_json::{json, Value};
use std::time::Duration;
use tower::timeout::TimeoutLayer;
use tower::{BoxError, ServiceBuilder};
use tower_http::cors::{AllowOrigin, CorsLayer};

/// Per-request deadline; settlement work has its own budget inside the
/// engine. Overridable with REQUEST_TIMEOUT_SECS.
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 5;

pub fn router(state: AppState) -> Router {
    let public = Router::new()
        .route("/health", get(health))
        .route("/auth/login", post(auth_api::login))
        .route("/auth/refresh-token", post(auth_api::refresh))
        .route("/auth/logout", post(auth_api::logout))
        .route("/games/current", get(games::current))
        .route("/games/recent-winners", get(games::recent_winners))
        .route("/games/by-date", get(games::by_date))
        .route("/games/:round_id", get(games::by_id));

    let protected = Router::new()
        .route("/bets/place", post(bets::place))
        .route("/bets/my", get(bets::my_slips))
        .route("/bets/claim", post(bets::claim))
        .route("/bets/cancel/:identifier", post(bets::cancel))
        .route("/bets/scan-and-claim/:identifier", post(bets::scan_and_claim))
        .route("/wallet/balance", get(wallet_api::balance))
        .route("/wallet/logs", get(wallet_api::logs))
        .route("/admin/games", get(admin::list_games))
        .route("/admin/games/live-settlement", get(admin::live_settlement))
        .route("/admin/games/:round_id/settle", post(admin::settle))
        .route(
            "/admin/games/:round_id/settlement-decision",
            get(admin::settlement_decision),
        )
        .route(
            "/admin/settings",
            get(admin::list_settings).put(admin::update_setting),
        )
        .route("/admin/settings/logs", get(admin::settings_logs))
        .route("/admin/audit-logs", get(admin::audit_logs))
        .layer(from_fn_with_state(state.jwt.clone(), auth_middleware));

    Router::new()
        .merge(public)
        .merge(protected)
        .layer(
            ServiceBuilder::new()
                .layer(HandleErrorLayer::new(handle_layer_error))
                .layer(TimeoutLayer::new(request_timeout())),
        )
        .layer(cors_layer())
        .with_state(state)
}

fn request_timeout() -> Duration {
    let secs = std::env::var("REQUEST_TIMEOUT_SECS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_REQUEST_TIMEOUT_SECS);
    Duration::from_secs(secs)
}

/// A request past its deadline surfaces as the retryable Timeout error, the
/// same envelope domain errors use.
async fn handle_layer_error(err: BoxError) -> AppError {
    if err.is::<tower::timeout::error::Elapsed>() {
        AppError::Timeout
    } else {
        AppError::Internal(err.to_string())
    }
}

/// CORS_ORIGINS is a comma-separated allow-list; unset means permissive.
fn cors_layer() -> CorsLayer {
    match std::env::var("CORS_ORIGINS") {
        Ok(origins) => {
            let parsed: Vec<HeaderValue> = origins
                .split(',')
                .filter_map(|o| o.trim().parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(AllowOrigin::list(parsed))
                .allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any)
        }
        Err(_) => CorsLayer::permissive(),
    }
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "server_time": state.clock.civil_string(state.clock.now()),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_slow_request_maps_to_gateway_timeout() {
        let app: Router = Router::new()
            .route(
                "/slow",
                get(|| async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    "done"
                }),
            )
            .layer(
                ServiceBuilder::new()
                    .layer(HandleErrorLayer::new(handle_layer_error))
                    .layer(TimeoutLayer::new(Duration::from_millis(20))),
            );

        let response = app
            .oneshot(Request::builder().uri("/slow").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
    }

    #[tokio::test]
    async fn test_fast_request_passes_through() {
        let app: Router = Router::new()
            .route("/fast", get(|| async { "ok" }))
            .layer(
                ServiceBuilder::new()
                    .layer(HandleErrorLayer::new(handle_layer_error))
                    .layer(TimeoutLayer::new(request_timeout())),
            );

        let response = app
            .oneshot(Request::builder().uri("/fast").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
