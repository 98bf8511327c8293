//! HTTP API for the firmware cryptographic analysis engine.
//!
//! Routes are served at the root: `/analyze`, `/results`, `/protocol/{file}`,
//! `/compliance/{file}`, `/jobs/{id}`, `/keys/{id}/revoke` and `/health`. Every route
//! except `/health` requires a bearer API key.

pub mod config;
pub mod error;
pub mod routes;
pub mod security;
pub mod server;
pub mod webhooks;

pub use config::ServerConfig;
pub use server::{router, AppState, WebServer};
