//! relaymail API - REST surface for direct sends, jobs and domains
//!
//! This crate provides API key authentication, per-key rate limiting, and the
//! handlers that expose the core pipeline over HTTP.

pub mod auth;
pub mod handlers;
pub mod routes;

pub use auth::AppState;
pub use routes::create_router;
