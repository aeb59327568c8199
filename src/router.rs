//! Request pipeline for proxied traffic:
//! CORS -> rate limit -> adapter lookup -> [`ProxyEngine`](crate::proxy::ProxyEngine).
//!
//! Every rejection is produced before the upstream is contacted.

use axum::extract::{ConnectInfo, Request, State};
use axum::http::header::{self, HeaderMap, HeaderName, HeaderValue};
use axum::http::Method;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use std::net::SocketAddr;

use crate::app::AppState;
use crate::config::RateLimitKeyKind;
use crate::cors::CorsDecision;
use crate::error::AppError;
use crate::rate_limit::{RateLimitDecision, RateLimitKey};

const RATE_LIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
const RATE_LIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
const RATE_LIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// Count the request as in flight, or turn it away while draining.
pub async fn track_in_flight(State(state): State<AppState>, mut req: Request, next: Next) -> Response {
    let Some(guard) = state.shutdown.track() else {
        tracing::debug!(path = %req.uri().path(), "rejecting request while draining");
        let mut response = AppError::shutting_down().into_response();
        response
            .headers_mut()
            .insert(header::CONNECTION, HeaderValue::from_static("close"));
        return response;
    };
    req.extensions_mut().insert(guard);
    next.run(req).await
}

/// Origin check. Runs before anything else so a rejected origin learns
/// nothing about adapters or quotas.
pub async fn cors(State(state): State<AppState>, mut req: Request, next: Next) -> Response {
    let Some(decision) = state.cors.evaluate(req.headers().get(header::ORIGIN)) else {
        tracing::debug!(
            origin = ?req.headers().get(header::ORIGIN),
            path = %req.uri().path(),
            "origin rejected"
        );
        return AppError::origin_not_allowed().into_response();
    };
    if req.method() == Method::OPTIONS {
        return state.cors.preflight(&decision, &req);
    }
    req.extensions_mut().insert(decision.clone());
    let mut response = next.run(req).await;
    state.cors.apply(&decision, response.headers_mut());
    response
}

/// Fallback handler for every path that is not a gateway endpoint.
pub async fn dispatch(State(state): State<AppState>, req: Request) -> Response {
    let adapter = state.headers.adapter_name(req.headers()).map(str::to_string);

    let quota = if state.rate_limit.enabled {
        let key = rate_limit_key(&state, &req, adapter.as_deref());
        let policy = adapter
            .as_deref()
            .and_then(|name| state.adapters.window_for(name))
            .unwrap_or_else(|| state.limiter.default_policy());
        let decision = state.limiter.allow_with(&key, policy);
        if !decision.allowed {
            tracing::debug!(
                key = ?key,
                retry_after = decision.retry_after_secs(),
                "rate limit exceeded"
            );
            metrics::counter!("chatgate_rate_limited_total").increment(1);
            let mut response = AppError::too_many_requests(decision.retry_after_secs()).into_response();
            apply_rate_limit_headers(&decision, response.headers_mut());
            return response;
        }
        Some(decision)
    } else {
        None
    };

    let mut response = route(&state, req, adapter).await;
    if let Some(decision) = quota {
        apply_rate_limit_headers(&decision, response.headers_mut());
    }
    response
}

async fn route(state: &AppState, req: Request, adapter: Option<String>) -> Response {
    let Some(name) = adapter else {
        tracing::debug!(path = %req.uri().path(), "request without adapter name");
        return AppError::adapter_required(state.headers.adapter_header().as_str()).into_response();
    };
    let Some(engine) = state.adapters.engine(&name) else {
        tracing::debug!(adapter = %name, "unknown adapter");
        return AppError::adapter_not_found(&name).into_response();
    };
    let decision = req
        .extensions()
        .get::<CorsDecision>()
        .cloned()
        .unwrap_or(CorsDecision::NoOrigin);
    engine.forward(req, &state.cors, &decision).await
}

fn rate_limit_key(state: &AppState, req: &Request, adapter: Option<&str>) -> RateLimitKey {
    match (state.rate_limit.key, adapter) {
        (RateLimitKeyKind::Adapter, Some(name)) => RateLimitKey::Adapter(name.to_string()),
        _ => {
            let peer = req
                .extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| addr.ip());
            RateLimitKey::ClientIp(state.client_ip.resolve(peer, req.headers()))
        }
    }
}

fn apply_rate_limit_headers(decision: &RateLimitDecision, headers: &mut HeaderMap) {
    headers.insert(RATE_LIMIT_LIMIT, HeaderValue::from(decision.limit));
    headers.insert(RATE_LIMIT_REMAINING, HeaderValue::from(decision.remaining));
    headers.insert(RATE_LIMIT_RESET, HeaderValue::from(decision.reset_at_unix()));
    if !decision.allowed {
        headers.insert(header::RETRY_AFTER, HeaderValue::from(decision.retry_after_secs()));
    }
}
