//! Request tracking and admin authentication middleware.

use axum::extract::{Request, State};
use axum::http::{HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use std::time::Instant;
use tracing::info;
use uuid::Uuid;

use crate::error::AppError;
use crate::proxy::state::AppState;

/// Tags every request with an id, logs one line per request.
pub async fn track_request(request: Request, next: Next) -> Response {
    let request_id = Uuid::new_v4().to_string();
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let started = Instant::now();

    let mut response = next.run(request).await;

    info!(
        request_id = %request_id,
        method = %method,
        path = %path,
        status = response.status().as_u16(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "request completed"
    );

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert("X-Request-Id", value);
    }
    response
}

/// Bearer-token guard for the /api surface. A missing `admin_key` in config
/// leaves the surface open (local desktop use).
pub async fn admin_auth(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let Some(expected) = state.config.server.admin_key.as_deref() else {
        return next.run(request).await;
    };

    let authorized = request
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .is_some_and(|token| token == expected);

    if !authorized {
        return AppError::authentication("Invalid or missing admin token").into_response();
    }
    next.run(request).await
}

/// 404 fallback in the error-envelope shape.
pub async fn not_found() -> Response {
    let err = AppError::not_found("route");
    (StatusCode::NOT_FOUND, axum::Json(err.to_api_error())).into_response()
}
