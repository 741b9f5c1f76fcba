//! Request handlers, grouped by surface.

pub mod projects;
pub mod resources;
pub mod streams;

/// Liveness check.
pub async fn root() -> &'static str {
    "ok"
}
