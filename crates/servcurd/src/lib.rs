//! servcurd: HTTP and WebSocket gateway of servcur.
//!
//! Exposes the Resource Proxy, projects and build jobs over axum, with
//! runtime events, container logs and job output as WebSocket streams.

pub mod api;
pub mod config;
pub mod error;
pub mod handlers;
pub mod server;

pub use api::{create_router, AppState};
pub use config::DaemonConfig;
pub use error::{ApiError, ApiResult};
