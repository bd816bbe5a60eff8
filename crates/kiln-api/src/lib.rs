//! API server for Kiln.
//!
//! Provides the HTTP REST API and the WebSocket log stream.

pub mod error;
pub mod routes;
pub mod state;
pub mod ws;

pub use state::AppState;
