//! Per-adapter forwarding engine.
//!
//! Each [`ProxyEngine`] owns a pooled HTTP client for one upstream and
//! runs three hooks in order for every request: `before_forward` builds
//! the outbound request, `after_receive_headers` rewrites the upstream
//! response head and decides whether it is an event stream, and
//! `on_error` maps a failure that happened before any byte was relayed
//! into a JSON 500. Bodies are relayed chunk by chunk through
//! [`RelayStream`]; dropping it (client went away) drops the upstream
//! response and with it the upstream connection.

use axum::body::{Body, HttpBody};
use axum::http::header::{self, HeaderMap, HeaderValue};
use axum::http::{Method, Request, request};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures_util::Stream;
use futures_util::stream::BoxStream;
use reqwest::Url;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::time::{Instant, Sleep};

use crate::adapters::AdapterDescriptor;
use crate::config::{ConfigError, ProxyConfig};
use crate::cors::{CorsDecision, CorsPolicy};
use crate::error::{AppError, GatewayError};
use crate::headers::HeaderPolicy;
use crate::shutdown::InFlightGuard;

const MOUNT_PREFIX: &str = "/api";
/// Upstream paths that live under the mount prefix themselves.
const MOUNTED_SEGMENTS: &[&str] = &["files", "threads"];

/// Map a gateway path to the upstream path.
///
/// `/api/v1/chat` -> `/v1/chat`, `/api/files/7` -> `/api/files/7`,
/// anything outside the mount is returned unchanged.
///
/// The gateway's own routes ([`BUILTIN_PATHS`] and the metrics path) are
/// matched before this runs and are never forwarded. An upstream
/// `/adapters` is reached as `/adapters`, not `/api/adapters`; an upstream
/// `/health`, `/ready` or metrics endpoint only through the mount, e.g.
/// `/api/health`.
///
/// [`BUILTIN_PATHS`]: crate::config::BUILTIN_PATHS
pub fn rewrite_path(path: &str) -> String {
    let Some(rest) = path
        .strip_prefix(MOUNT_PREFIX)
        .filter(|rest| rest.is_empty() || rest.starts_with('/'))
    else {
        return path.to_string();
    };
    let first_segment = rest.trim_start_matches('/').split('/').next().unwrap_or("");
    if MOUNTED_SEGMENTS.contains(&first_segment) {
        return path.to_string();
    }
    if rest.is_empty() {
        "/".to_string()
    } else {
        rest.to_string()
    }
}

/// Join `path` under the adapter's base path. Returns `None` when the
/// result would leave the base path, which only dot segments (plain or
/// percent-encoded) can cause.
fn target_url(base: &Url, path: &str, query: Option<&str>) -> Option<Url> {
    if path.split(['/', '\\']).any(is_dot_segment) {
        return None;
    }
    let base_path = base.path().trim_end_matches('/');
    let mut url = base.clone();
    url.set_path(&format!("{base_path}{path}"));
    url.set_query(query);
    url.path().starts_with(base_path).then_some(url)
}

fn is_dot_segment(segment: &str) -> bool {
    let decoded = segment.to_ascii_lowercase().replace("%2e", ".");
    decoded == "." || decoded == ".."
}

/// `target` with any userinfo removed, for logs.
fn loggable(target: &Url) -> String {
    let mut url = target.clone();
    let _ = url.set_username("");
    let _ = url.set_password(None);
    url.to_string()
}

#[derive(Debug, Clone)]
pub struct ProxySettings {
    pub request_timeout: Duration,
    pub idle_timeout: Option<Duration>,
    pub connect_timeout: Duration,
    pub pool_max_idle_per_host: usize,
    pub expose_error_detail: bool,
}

impl ProxySettings {
    pub fn from_config(config: &ProxyConfig, expose_error_detail: bool) -> Self {
        Self {
            request_timeout: config.request_timeout(),
            idle_timeout: config.stream_idle_timeout(),
            connect_timeout: config.connect_timeout(),
            pool_max_idle_per_host: config.pool_max_idle_per_host,
            expose_error_detail,
        }
    }
}

/// Everything known about one proxied request. Lives until the response
/// body finishes or the client disconnects.
#[derive(Debug, Clone)]
pub struct ProxyRequestContext {
    pub adapter: String,
    pub method: Method,
    pub path: String,
    pub headers: HeaderMap,
    pub target: Url,
    pub request_id: Option<String>,
    pub streaming: bool,
    pub started_at: Instant,
}

#[derive(Debug, thiserror::Error)]
enum ForwardError {
    #[error("upstream request failed: {0}")]
    Transport(#[source] reqwest::Error),
    #[error("upstream did not respond within {0:?}")]
    Timeout(Duration),
}

impl ForwardError {
    fn kind(&self) -> &'static str {
        match self {
            Self::Timeout(_) => "timeout",
            Self::Transport(err) if err.is_timeout() => "timeout",
            Self::Transport(err) if err.is_connect() => "connect",
            Self::Transport(_) => "transport",
        }
    }
}

#[derive(Debug)]
pub struct ProxyEngine {
    adapter: Arc<AdapterDescriptor>,
    client: reqwest::Client,
    policy: Arc<HeaderPolicy>,
    credential: HeaderValue,
    settings: ProxySettings,
}

impl ProxyEngine {
    pub fn new(
        adapter: Arc<AdapterDescriptor>,
        policy: Arc<HeaderPolicy>,
        settings: ProxySettings,
    ) -> Result<Self, GatewayError> {
        let mut credential = HeaderValue::from_str(adapter.api_key())
            .map_err(|_| ConfigError::InvalidApiKey(adapter.name.clone()))?;
        credential.set_sensitive(true);
        let client = reqwest::Client::builder()
            .user_agent(concat!("chatgate/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(settings.connect_timeout)
            .pool_max_idle_per_host(settings.pool_max_idle_per_host)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|source| GatewayError::HttpClient {
                adapter: adapter.name.clone(),
                source,
            })?;
        Ok(Self {
            adapter,
            client,
            policy,
            credential,
            settings,
        })
    }

    pub fn adapter(&self) -> &AdapterDescriptor {
        &self.adapter
    }

    /// Forward `req` to this adapter's upstream and relay the answer.
    ///
    /// An [`InFlightGuard`] found in the request extensions moves into the
    /// response body so the request counts as in flight until the body is
    /// done.
    pub async fn forward(
        &self,
        req: Request<Body>,
        cors: &CorsPolicy,
        decision: &CorsDecision,
    ) -> Response {
        let started_at = Instant::now();
        let (mut parts, body) = req.into_parts();
        let guard = parts.extensions.remove::<InFlightGuard>();
        let Some((mut ctx, outbound)) = self.before_forward(parts, started_at) else {
            tracing::debug!(adapter = %self.adapter.name, "rejected path with dot segments");
            let mut response = AppError::invalid_path().into_response();
            cors.apply(decision, response.headers_mut());
            return response;
        };

        metrics::counter!("chatgate_requests_total", "adapter" => ctx.adapter.clone()).increment(1);

        let mut builder = self
            .client
            .request(ctx.method.clone(), ctx.target.clone())
            .headers(outbound);
        match body.size_hint().exact() {
            Some(0) => {}
            Some(len) => {
                builder = builder
                    .header(header::CONTENT_LENGTH, len)
                    .body(reqwest::Body::wrap_stream(body.into_data_stream()));
            }
            None => {
                builder = builder.body(reqwest::Body::wrap_stream(body.into_data_stream()));
            }
        }

        let upstream = match tokio::time::timeout(self.settings.request_timeout, builder.send()).await
        {
            Ok(Ok(upstream)) => upstream,
            Ok(Err(err)) => return self.on_error(&ctx, ForwardError::Transport(err), cors, decision),
            Err(_) => {
                return self.on_error(
                    &ctx,
                    ForwardError::Timeout(self.settings.request_timeout),
                    cors,
                    decision,
                );
            }
        };

        let status = upstream.status();
        let headers = self.after_receive_headers(&mut ctx, upstream.headers(), cors, decision);
        tracing::info!(
            adapter = %ctx.adapter,
            target = %loggable(&ctx.target),
            method = %ctx.method,
            status = status.as_u16(),
            streaming = ctx.streaming,
            elapsed_ms = ctx.started_at.elapsed().as_millis() as u64,
            request_id = ctx.request_id.as_deref().unwrap_or(""),
            "upstream responded"
        );

        let relay = RelayStream::new(
            Box::pin(upstream.bytes_stream()),
            self.settings.idle_timeout,
            ctx,
            guard,
        );
        let mut response = Response::new(Body::from_stream(relay));
        *response.status_mut() = status;
        *response.headers_mut() = headers;
        response
    }

    fn before_forward(
        &self,
        parts: request::Parts,
        started_at: Instant,
    ) -> Option<(ProxyRequestContext, HeaderMap)> {
        let path = rewrite_path(parts.uri.path());
        let target = target_url(&self.adapter.upstream_base_url, &path, parts.uri.query())?;
        let outbound = self.policy.outbound(&parts.headers, &self.credential);
        let request_id = parts
            .headers
            .get("x-request-id")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let ctx = ProxyRequestContext {
            adapter: self.adapter.name.clone(),
            method: parts.method,
            path,
            headers: parts.headers,
            target,
            request_id,
            streaming: false,
            started_at,
        };
        Some((ctx, outbound))
    }

    fn after_receive_headers(
        &self,
        ctx: &mut ProxyRequestContext,
        upstream: &HeaderMap,
        cors: &CorsPolicy,
        decision: &CorsDecision,
    ) -> HeaderMap {
        let mut headers = self.policy.inbound(upstream);
        cors.apply(decision, &mut headers);
        ctx.streaming = is_event_stream(&headers);
        if ctx.streaming {
            headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
            headers.insert("x-accel-buffering", HeaderValue::from_static("no"));
            headers.remove(header::CONTENT_LENGTH);
        }
        headers
    }

    fn on_error(
        &self,
        ctx: &ProxyRequestContext,
        err: ForwardError,
        cors: &CorsPolicy,
        decision: &CorsDecision,
    ) -> Response {
        let kind = err.kind();
        tracing::error!(
            adapter = %ctx.adapter,
            target = %loggable(&ctx.target),
            kind,
            error = %err,
            elapsed_ms = ctx.started_at.elapsed().as_millis() as u64,
            "upstream request failed"
        );
        metrics::counter!(
            "chatgate_upstream_errors_total",
            "adapter" => ctx.adapter.clone(),
            "kind" => kind
        )
        .increment(1);

        let message = if self.settings.expose_error_detail {
            error_chain(&err)
        } else {
            "upstream service unavailable".to_string()
        };
        let mut response = AppError::proxy_failure(message).into_response();
        cors.apply(decision, response.headers_mut());
        response
    }
}

fn is_event_stream(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<mime::Mime>().ok())
        .is_some_and(|m| m.type_() == mime::TEXT && m.subtype() == mime::EVENT_STREAM)
}

fn error_chain(err: &dyn std::error::Error) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("upstream stream failed: {0}")]
    Upstream(#[source] reqwest::Error),
    #[error("upstream stream idle for {0:?}")]
    IdleTimeout(Duration),
}

/// Relays upstream chunks in arrival order without buffering.
///
/// Once headers are out, failures can only end the stream early.
pub struct RelayStream {
    inner: BoxStream<'static, reqwest::Result<Bytes>>,
    idle_timeout: Option<Duration>,
    idle: Option<Pin<Box<Sleep>>>,
    ctx: ProxyRequestContext,
    bytes: u64,
    chunks: u64,
    finished: bool,
    _guard: Option<InFlightGuard>,
}

impl RelayStream {
    pub fn new(
        inner: BoxStream<'static, reqwest::Result<Bytes>>,
        idle_timeout: Option<Duration>,
        ctx: ProxyRequestContext,
        guard: Option<InFlightGuard>,
    ) -> Self {
        Self {
            inner,
            idle_timeout,
            idle: idle_timeout.map(|d| Box::pin(tokio::time::sleep(d))),
            ctx,
            bytes: 0,
            chunks: 0,
            finished: false,
            _guard: guard,
        }
    }

    fn finish(&mut self) {
        self.finished = true;
        tracing::debug!(
            adapter = %self.ctx.adapter,
            streaming = self.ctx.streaming,
            bytes = self.bytes,
            chunks = self.chunks,
            elapsed_ms = self.ctx.started_at.elapsed().as_millis() as u64,
            "relay complete"
        );
    }

    fn fail(&mut self, err: RelayError, kind: &'static str) -> RelayError {
        self.finished = true;
        tracing::warn!(
            adapter = %self.ctx.adapter,
            target = %loggable(&self.ctx.target),
            bytes = self.bytes,
            error = %err,
            "relay terminated early"
        );
        metrics::counter!(
            "chatgate_upstream_errors_total",
            "adapter" => self.ctx.adapter.clone(),
            "kind" => kind
        )
        .increment(1);
        err
    }
}

impl Stream for RelayStream {
    type Item = Result<Bytes, RelayError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(None);
        }
        match this.inner.as_mut().poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                this.bytes += chunk.len() as u64;
                this.chunks += 1;
                if let (Some(idle), Some(timeout)) = (this.idle.as_mut(), this.idle_timeout) {
                    idle.as_mut().reset(Instant::now() + timeout);
                }
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(err))) => {
                let err = this.fail(RelayError::Upstream(err), "stream");
                Poll::Ready(Some(Err(err)))
            }
            Poll::Ready(None) => {
                this.finish();
                Poll::Ready(None)
            }
            Poll::Pending => {
                let idle_fired = this
                    .idle
                    .as_mut()
                    .is_some_and(|idle| idle.as_mut().poll(cx).is_ready());
                match (idle_fired, this.idle_timeout) {
                    (true, Some(timeout)) => {
                        let err = this.fail(RelayError::IdleTimeout(timeout), "idle_timeout");
                        Poll::Ready(Some(Err(err)))
                    }
                    _ => Poll::Pending,
                }
            }
        }
    }
}

impl Drop for RelayStream {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        tracing::info!(
            adapter = %self.ctx.adapter,
            target = %loggable(&self.ctx.target),
            bytes = self.bytes,
            chunks = self.chunks,
            "client disconnected, aborting upstream request"
        );
        metrics::counter!("chatgate_streams_aborted_total", "adapter" => self.ctx.adapter.clone())
            .increment(1);
    }
}
