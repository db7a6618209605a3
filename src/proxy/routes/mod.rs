use std::time::Duration;

use axum::routing::{delete, get, post, put};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::timeout::TimeoutLayer;

use crate::proxy::handlers;
use crate::proxy::middleware::{admin_auth, not_found, track_request};
use crate::proxy::state::AppState;

pub fn build_router(state: AppState) -> Router {
    // Streaming responses must outlive any write deadline, so the request
    // timeout applies to the admin/aux surface only.
    let admin_timeout = TimeoutLayer::new(Duration::from_secs(
        state.config.server.write_timeout_seconds.max(1),
    ));

    let admin_routes = Router::new()
        .route("/keys", get(handlers::admin::list_keys))
        .route("/keys", post(handlers::admin::create_key))
        .route("/keys/:id", delete(handlers::admin::delete_key))
        .route("/keys/import", post(handlers::admin::import_keys))
        .route("/keys/:id/test", post(handlers::admin::test_key))
        .route("/keys/validate", post(handlers::admin::validate_key))
        .route("/stats", get(handlers::admin::stats))
        .route("/pool/settings", get(handlers::admin::get_pool_settings))
        .route("/pool/settings", put(handlers::admin::update_pool_settings))
        .layer(admin_timeout)
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            admin_auth,
        ))
        // Outermost so preflight requests clear before the auth guard.
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );

    Router::new()
        .route(
            "/v1/chat/completions",
            post(handlers::openai::handle_chat_completions),
        )
        .route("/v1/models", get(handlers::openai::handle_list_models))
        .route("/health", get(handlers::common::handle_health))
        .route("/ping", get(handlers::common::handle_ping))
        .nest("/api", admin_routes)
        .fallback(not_found)
        .layer(axum::middleware::from_fn(track_request))
        .with_state(state)
}
