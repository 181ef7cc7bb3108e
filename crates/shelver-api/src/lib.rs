//! shelver-api — JSON control surface for the UI layer.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/api/status` | Instance record, recent audit events, next auto-shelve time |
//! | GET | `/api/events` | Recent audit events (`?limit=N`) |
//! | POST | `/api/unshelve` | Operator unshelve (idempotent) |
//! | POST | `/api/wake` | Public wake button (idempotent) |
//! | POST | `/api/shelve` | Operator shelve (idempotent) |
//! | GET | `/healthz` | Liveness |
//!
//! Authentication is the job of the fronting proxy.

pub mod handlers;

use axum::Router;
use axum::routing::{get, post};
use shelver_lifecycle::LifecycleHandle;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub lifecycle: LifecycleHandle,
}

pub fn build_router(lifecycle: LifecycleHandle) -> Router {
    let state = ApiState { lifecycle };

    let api_routes = Router::new()
        .route("/status", get(handlers::get_status))
        .route("/events", get(handlers::list_events))
        .route("/unshelve", post(handlers::unshelve))
        .route("/wake", post(handlers::wake))
        .route("/shelve", post(handlers::shelve))
        .with_state(state);

    Router::new()
        .nest("/api", api_routes)
        .route("/healthz", get(handlers::healthz))
}
