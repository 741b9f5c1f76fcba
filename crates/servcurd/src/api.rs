//! Gateway router.
//!
//! Resource routes are registered once per [`ResourceKind`] rather than
//! behind a `/{kind}` capture, so `/projects` and `/system` never collide
//! with a resource kind and unknown kinds fall through to 404.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::Router;
use servcur_core::{Orchestrator, ResourceKind, ResourceProxy, RetryPolicy};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::handlers::resources::{ActionPath, IdPath};
use crate::handlers::{self, projects, resources, streams};

const PRUNE: &str = "prune";

/// Application state shared with handlers.
#[derive(Clone)]
pub struct AppState {
    pub proxy: Arc<ResourceProxy>,
    pub orchestrator: Orchestrator,
    /// Retry applied to runtime calls made on behalf of a request.
    pub retry: RetryPolicy,
}

/// Creates the gateway router with all endpoints.
#[must_use]
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let mut router = Router::new()
        .route("/", get(handlers::root))
        .route("/system", get(resources::system_info))
        .route("/events", get(streams::events))
        .route("/containers/{id}/logs", get(streams::container_logs))
        .merge(project_routes());
    for kind in ResourceKind::ALL {
        router = router.merge(resource_routes(kind));
    }

    router
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

fn resource_routes(kind: ResourceKind) -> Router<AppState> {
    let base = format!("/{kind}");
    Router::new()
        .route(
            &base,
            get(move |state: State<AppState>| resources::list(state, kind)),
        )
        // A resource literally named `prune` is still reachable by GET and
        // DELETE; only POST means prune.
        .route(
            &format!("{base}/prune"),
            post(move |state: State<AppState>| resources::prune(state, kind))
                .get(move |state: State<AppState>| {
                    resources::inspect(state, Ok(Path(PRUNE.to_string())), kind)
                })
                .delete(move |state: State<AppState>| {
                    resources::remove(state, Ok(Path(PRUNE.to_string())), kind)
                }),
        )
        .route(
            &format!("{base}/{{id}}"),
            get(move |state: State<AppState>, path: IdPath| {
                resources::inspect(state, path, kind)
            })
            .delete(move |state: State<AppState>, path: IdPath| {
                resources::remove(state, path, kind)
            }),
        )
        .route(
            &format!("{base}/{{id}}/{{verb}}"),
            post(move |state: State<AppState>, path: ActionPath| {
                resources::action(state, path, kind)
            }),
        )
}

fn project_routes() -> Router<AppState> {
    Router::new()
        .route(
            "/projects",
            get(projects::list)
                .post(projects::create)
                .delete(projects::remove),
        )
        .route("/projects/pull", post(projects::pull))
        .route("/projects/webhook/{name}/{*branch}", post(projects::webhook))
        .route("/projects/action/{name}/{*branch}", post(projects::action))
        .route("/projects/builds", get(projects::active))
        .route("/projects/builds/history", get(projects::history))
        .route("/projects/builds/{io_id}", get(projects::job))
        .route("/projects/builds/{io_id}/archive", get(projects::archive))
        .route("/projects/builds/{io_id}/{channel}", get(projects::read_output))
        .route(
            "/projects/builds/{io_id}/{channel}/stream",
            get(streams::stream_output),
        )
}
