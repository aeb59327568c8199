use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use crate::config::ConfigError;

/// Client-visible failure. Every non-proxied response the gateway produces
/// itself goes through this type so clients can branch on `error`.
#[derive(Debug, Clone)]
pub struct AppError {
    pub status: StatusCode,
    pub error: String,
    pub message: Option<String>,
    pub retry_after: Option<u64>,
}

impl AppError {
    pub fn new(status: StatusCode, error: impl Into<String>) -> Self {
        Self {
            status,
            error: error.into(),
            message: None,
            retry_after: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_retry_after(mut self, seconds: u64) -> Self {
        self.retry_after = Some(seconds);
        self
    }

    pub fn adapter_required(header: &str) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "adapter name required")
            .with_message(format!("send the adapter name in the {header} header"))
    }

    pub fn adapter_not_found(name: &str) -> Self {
        Self::new(
            StatusCode::NOT_FOUND,
            format!("adapter '{name}' not found"),
        )
    }

    pub fn invalid_path() -> Self {
        Self::new(StatusCode::BAD_REQUEST, "invalid path")
            .with_message("dot segments are not allowed in proxied paths")
    }

    pub fn origin_not_allowed() -> Self {
        Self::new(StatusCode::FORBIDDEN, "origin not allowed")
            .with_message("this origin is not permitted to call the gateway")
    }

    pub fn too_many_requests(retry_after_secs: u64) -> Self {
        Self::new(StatusCode::TOO_MANY_REQUESTS, "too many requests")
            .with_message(format!(
                "rate limit exceeded, retry after {retry_after_secs} seconds"
            ))
            .with_retry_after(retry_after_secs)
    }

    pub fn proxy_failure(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "proxy error").with_message(message)
    }

    pub fn shutting_down() -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, "server shutting down")
            .with_message("the gateway is draining and no longer accepts requests")
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
    #[serde(rename = "retryAfter", skip_serializing_if = "Option::is_none")]
    retry_after: Option<u64>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: self.error,
            message: self.message,
            retry_after: self.retry_after,
        };
        (self.status, axum::Json(body)).into_response()
    }
}

/// Failures that stop the process before it serves traffic.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to build http client for adapter '{adapter}': {source}")]
    HttpClient {
        adapter: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("server error: {0}")]
    Serve(#[source] std::io::Error),
    #[error("metrics recorder unavailable: {0}")]
    Metrics(String),
}
