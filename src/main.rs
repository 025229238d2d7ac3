//! Lucky 12 Backend - Round Lifecycle Engine
//! 12 cards, one round every 5 minutes on the civil clock, settlement on a
//! deadline alarm. The scheduler driver and the HTTP server share one state.

use anyhow::{Context, Result};
use dotenv::dotenv;
use lucky12_backend::scheduler;
use lucky12_backend::state::AppState;
use lucky12_backend::store::{users, Db};
use std::env;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "lucky12_backend=debug,tower_http=debug".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("🎴 Lucky 12 backend starting");

    let db_path = env::var("DB_PATH").unwrap_or_else(|_| "lucky12.db".to_string());
    let db = Db::open(&db_path)?;
    info!("💾 Database ready at {}", db_path);

    let jwt_secret = env::var("JWT_SECRET").unwrap_or_else(|_| {
        warn!("⚠️  JWT_SECRET not set, using insecure default");
        "dev-jwt-secret-change-me".to_string()
    });
    let barcode_secret = env::var("BARCODE_SECRET").unwrap_or_else(|_| {
        warn!("⚠️  BARCODE_SECRET not set, using insecure default");
        "dev-barcode-secret-change-me".to_string()
    });

    let state = AppState::new(db, jwt_secret, &barcode_secret);

    {
        let conn = state.db.conn().await;
        let now_civil = state.clock.civil_string(state.clock.now());
        users::ensure_default_admin(&conn, &now_civil)?;
    }

    let restored = scheduler::restore_alarms(&state)
        .await
        .map_err(|e| anyhow::anyhow!("{e}"))?;
    info!("⏰ {} deadline alarm(s) restored", restored);

    tokio::spawn(scheduler::run_driver(state.clone()));

    let bind_addr = env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3000".to_string());
    let listener = TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", bind_addr))?;
    info!("🚀 Listening on {}", bind_addr);

    axum::serve(listener, lucky12_backend::api::router(state))
        .await
        .context("Server error")?;
    Ok(())
}
