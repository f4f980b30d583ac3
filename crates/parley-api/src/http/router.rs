//! Axum router configuration with middleware.
//!
//! API routes are under `/api/v1/`; listeners connect at `/ws/events`.
//! Middleware: CORS, tracing.

use axum::Router;
use axum::routing::{get, post};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::http::handlers;
use crate::state::AppState;

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api_routes = Router::new()
        .route("/speak", post(handlers::speech::speak))
        .route("/status", get(handlers::speech::status));

    Router::new()
        .nest("/api/v1", api_routes)
        .route("/ws/events", get(handlers::ws::ws_handler))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
