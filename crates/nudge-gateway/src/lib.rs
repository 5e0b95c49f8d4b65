//! # Nudge Gateway
//!
//! Axum HTTP front end: event ingestion, manual task dispatch, and
//! read-only views of user state and the audit trail.

pub mod routes;
pub mod server;

pub use server::{AppState, build_router, start};
