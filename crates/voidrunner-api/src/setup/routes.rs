use std::sync::Arc;

use axum::http::HeaderValue;
use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

use crate::auth::auth_middleware;
use crate::handlers::{auth, executions, health, tasks};
use crate::state::AppState;

pub fn router(state: Arc<AppState>) -> Router {
    let public = Router::new()
        .route("/health", get(health::health))
        .route("/health/ready", get(health::ready))
        .route("/api/v1/auth/register", post(auth::register))
        .route("/api/v1/auth/login", post(auth::login));

    let protected = Router::new()
        .route(
            "/api/v1/tasks",
            post(tasks::create_task).get(tasks::list_tasks),
        )
        .route(
            "/api/v1/tasks/{id}",
            get(tasks::get_task)
                .put(tasks::update_task)
                .delete(tasks::delete_task),
        )
        .route(
            "/api/v1/tasks/{id}/executions",
            post(executions::create_execution).get(executions::list_executions),
        )
        .route(
            "/api/v1/executions/{id}",
            get(executions::get_execution)
                .put(executions::update_execution)
                .delete(executions::cancel_execution),
        )
        .route("/api/v1/queue/stats", get(health::queue_stats))
        .route("/api/v1/queue/dead-letters", get(health::dead_letters))
        .route("/api/v1/workers/stats", get(health::worker_stats))
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            auth_middleware,
        ));

    public
        .merge(protected)
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer(&state))
        .layer(RequestBodyLimitLayer::new(state.config.server.max_body_bytes))
        .with_state(state)
}

fn cors_layer(state: &AppState) -> CorsLayer {
    let origins = &state.config.server.cors_origins;
    if origins.is_empty() {
        return CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);
    }
    let parsed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| origin.parse().ok())
        .collect();
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(parsed))
        .allow_methods(Any)
        .allow_headers(Any)
}
