//! REST API HTTP server module.
//!
//! JSON endpoints over tasks, agents, sessions, planning and the gateway
//! connection. Every response uses the `{success, data, error, message}`
//! envelope.

mod handlers;
mod response;
mod server;

pub use response::{ApiError, Envelope, status_for};
pub use server::{
    AppState, ServerHandle, ServerStatus, build_router, start_server, start_server_with_retry,
};
