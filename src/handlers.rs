use crate::app::AppState;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

pub async fn health() -> impl IntoResponse {
    axum::Json(json!({ "status": "ok" }))
}

/// 503 while draining or when no adapter is loaded.
pub async fn ready(State(state): State<AppState>) -> Response {
    let adapters = state.adapters.adapter_count();
    if state.shutdown.is_draining() {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            axum::Json(json!({ "status": "draining", "adapters": adapters })),
        )
            .into_response();
    }
    if adapters == 0 {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            axum::Json(json!({ "status": "no adapters configured", "adapters": 0 })),
        )
            .into_response();
    }
    axum::Json(json!({ "status": "ready", "adapters": adapters })).into_response()
}

/// Names only. Keys and upstream URLs never leave the gateway.
pub async fn list_adapters(State(state): State<AppState>) -> impl IntoResponse {
    axum::Json(json!({ "adapters": state.adapters.names() }))
}

pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    state.metrics.render()
}
