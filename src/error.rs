use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

// Stable error codes. The first three digits match the HTTP status class.
pub const ERR_CODE_INVALID_REQUEST: u32 = 40001;
pub const ERR_CODE_UNSUPPORTED_MODEL: u32 = 40002;
pub const ERR_CODE_INVALID_MESSAGES: u32 = 40003;
pub const ERR_CODE_AUTHENTICATION: u32 = 40101;
pub const ERR_CODE_PERMISSION: u32 = 40301;
pub const ERR_CODE_NOT_FOUND: u32 = 40401;
pub const ERR_CODE_RATE_LIMIT: u32 = 42901;
pub const ERR_CODE_INTERNAL: u32 = 50001;
pub const ERR_CODE_UPSTREAM: u32 = 50201;
pub const ERR_CODE_SERVICE_UNAVAILABLE: u32 = 50301;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidRequest,
    Authentication,
    Permission,
    NotFound,
    RateLimit,
    Server,
    Upstream,
    ServiceUnavailable,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidRequest => "invalid_request_error",
            ErrorKind::Authentication => "authentication_error",
            ErrorKind::Permission => "permission_error",
            ErrorKind::NotFound => "not_found_error",
            ErrorKind::RateLimit => "rate_limit_error",
            ErrorKind::Server => "server_error",
            ErrorKind::Upstream => "upstream_error",
            ErrorKind::ServiceUnavailable => "service_unavailable",
        }
    }
}

/// Application error carried through the whole request path. Classified once
/// at the boundary that observes the failure; layers above pass it through.
#[derive(Debug, Error)]
#[error("[{code}] {message}")]
pub struct AppError {
    pub code: u32,
    pub kind: ErrorKind,
    pub status: StatusCode,
    pub message: String,
    pub param: Option<String>,
    pub retry_after: Option<u64>,
    #[source]
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl AppError {
    fn new(code: u32, kind: ErrorKind, status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            kind,
            status,
            message: message.into(),
            param: None,
            retry_after: None,
            source: None,
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        let message = non_empty(message.into(), "Invalid request format");
        Self::new(
            ERR_CODE_INVALID_REQUEST,
            ErrorKind::InvalidRequest,
            StatusCode::BAD_REQUEST,
            message,
        )
    }

    pub fn invalid_messages(message: impl Into<String>) -> Self {
        let message = non_empty(message.into(), "Invalid messages format");
        Self::new(
            ERR_CODE_INVALID_MESSAGES,
            ErrorKind::InvalidRequest,
            StatusCode::BAD_REQUEST,
            message,
        )
        .with_param("messages")
    }

    pub fn unsupported_model(model: &str) -> Self {
        Self::new(
            ERR_CODE_UNSUPPORTED_MODEL,
            ErrorKind::InvalidRequest,
            StatusCode::BAD_REQUEST,
            format!("The specified model '{model}' is not supported"),
        )
        .with_param("model")
    }

    pub fn authentication(message: impl Into<String>) -> Self {
        let message = non_empty(message.into(), "Invalid or missing API key");
        Self::new(
            ERR_CODE_AUTHENTICATION,
            ErrorKind::Authentication,
            StatusCode::UNAUTHORIZED,
            message,
        )
    }

    pub fn permission(message: impl Into<String>) -> Self {
        let message = non_empty(message.into(), "Access denied");
        Self::new(
            ERR_CODE_PERMISSION,
            ErrorKind::Permission,
            StatusCode::FORBIDDEN,
            message,
        )
    }

    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::new(
            ERR_CODE_NOT_FOUND,
            ErrorKind::NotFound,
            StatusCode::NOT_FOUND,
            format!("Resource not found: {}", resource.into()),
        )
    }

    pub fn rate_limit(retry_after: u64) -> Self {
        let mut err = Self::new(
            ERR_CODE_RATE_LIMIT,
            ErrorKind::RateLimit,
            StatusCode::TOO_MANY_REQUESTS,
            "All API keys are currently rate limited",
        );
        err.retry_after = Some(retry_after);
        err
    }

    pub fn internal(message: impl Into<String>) -> Self {
        let message = non_empty(message.into(), "Internal server error");
        Self::new(
            ERR_CODE_INTERNAL,
            ErrorKind::Server,
            StatusCode::INTERNAL_SERVER_ERROR,
            message,
        )
    }

    pub fn upstream(message: impl Into<String>) -> Self {
        let message = non_empty(message.into(), "Upstream API error");
        Self::new(
            ERR_CODE_UPSTREAM,
            ErrorKind::Upstream,
            StatusCode::BAD_GATEWAY,
            message,
        )
    }

    pub fn service_unavailable(message: impl Into<String>) -> Self {
        let message = non_empty(message.into(), "Service temporarily unavailable");
        Self::new(
            ERR_CODE_SERVICE_UNAVAILABLE,
            ErrorKind::ServiceUnavailable,
            StatusCode::SERVICE_UNAVAILABLE,
            message,
        )
    }

    pub fn no_available_keys() -> Self {
        Self::service_unavailable("No available API keys in the pool")
    }

    pub fn all_keys_rate_limited() -> Self {
        Self::rate_limit(crate::constants::RATE_LIMIT_RETRY_AFTER_SECS)
    }

    pub fn with_cause(mut self, cause: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(cause));
        self
    }

    pub fn with_param(mut self, param: impl Into<String>) -> Self {
        self.param = Some(param.into());
        self
    }

    /// Copy without the source chain, for when one failure must be both
    /// delivered on a channel and reported to the pool.
    pub fn shallow_clone(&self) -> Self {
        Self {
            code: self.code,
            kind: self.kind,
            status: self.status,
            message: self.message.clone(),
            param: self.param.clone(),
            retry_after: self.retry_after,
            source: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        let message = message.into();
        if !message.is_empty() {
            self.message = message;
        }
        self
    }

    /// True when this error should push the failing key into cooldown
    /// immediately. Falls back to message sniffing for errors that were not
    /// classified at the dispatch boundary.
    pub fn is_rate_limit(&self) -> bool {
        if self.kind == ErrorKind::RateLimit || self.status == StatusCode::TOO_MANY_REQUESTS {
            return true;
        }
        let message = self.message.to_ascii_lowercase();
        message.contains("429")
            || message.contains("rate limit")
            || message.contains("quota exceeded")
            || message.contains("too many requests")
    }

    pub fn to_api_error(&self) -> ApiError {
        ApiError {
            error: ErrorDetail {
                code: self.code,
                message: self.message.clone(),
                kind: self.kind.as_str(),
                param: self.param.clone(),
                retry_after: self.retry_after,
            },
        }
    }
}

fn non_empty(message: String, fallback: &str) -> String {
    if message.is_empty() {
        fallback.to_string()
    } else {
        message
    }
}

/// Client-facing error envelope, OpenAI style.
#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: ErrorDetail,
}

#[derive(Debug, Serialize)]
pub struct ErrorDetail {
    pub code: u32,
    pub message: String,
    #[serde(rename = "type")]
    pub kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub param: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let mut response = (self.status, Json(self.to_api_error())).into_response();
        if let Some(retry_after) = self.retry_after {
            if let Ok(value) = retry_after.to_string().parse() {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

pub type AppResult<T> = Result<T, AppError>;
