//! Lucky 12 Backend Library
//!
//! Round lifecycle engine for the 12-card, 5-minute betting product:
//! clock-driven scheduling, settlement, wagers and the HTTP surface.

pub mod api;
pub mod auth;
pub mod barcode;
pub mod clock;
pub mod error;
pub mod models;
pub mod scheduler;
pub mod settlement;
pub mod state;
pub mod store;
pub mod wager;
