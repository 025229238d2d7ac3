//! Application state shared across handlers, the scheduler and the alarms.
//! No process-wide mutable globals: everything flows through this context.

use crate::auth::JwtHandler;
use crate::clock::Clock;
use crate::scheduler::alarms::AlarmRegistry;
use crate::store::Db;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub db: Db,
    pub clock: Clock,
    pub alarms: Arc<AlarmRegistry>,
    pub jwt: Arc<JwtHandler>,
    pub barcode_secret: Arc<Vec<u8>>,
}

impl AppState {
    pub fn new(db: Db, jwt_secret: String, barcode_secret: &str) -> Self {
        Self {
            db,
            clock: Clock::new(),
            alarms: Arc::new(AlarmRegistry::new()),
            jwt: Arc::new(JwtHandler::new(jwt_secret)),
            barcode_secret: Arc::new(barcode_secret.as_bytes().to_vec()),
        }
    }

    /// Test fixture over an in-memory database.
    pub fn for_tests() -> anyhow::Result<Self> {
        Ok(Self::new(
            Db::open_in_memory()?,
            "test-jwt-secret".to_string(),
            "test-barcode-secret",
        ))
    }
}
