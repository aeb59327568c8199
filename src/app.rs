use crate::adapters::AdapterRegistry;
use crate::config::{
    ADAPTERS_PATH, GatewayConfig, HEALTH_PATH, READY_PATH, RateLimitConfig, RuntimeConfig,
};
use crate::cors::CorsPolicy;
use crate::error::GatewayError;
use crate::headers::HeaderPolicy;
use crate::proxy::ProxySettings;
use crate::rate_limit::{ClientIpResolver, RateLimiter, WindowPolicy};
use crate::shutdown::ShutdownCoordinator;
use axum::Router;
use axum::middleware;
use axum::routing::get;
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::{Arc, Once, OnceLock};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub runtime: Arc<RuntimeConfig>,
    pub adapters: AdapterRegistry,
    pub limiter: Arc<RateLimiter>,
    pub rate_limit: Arc<RateLimitConfig>,
    pub client_ip: Arc<ClientIpResolver>,
    pub cors: Arc<CorsPolicy>,
    pub headers: Arc<HeaderPolicy>,
    pub shutdown: Arc<ShutdownCoordinator>,
    pub max_request_body_bytes: usize,
    pub metrics: PrometheusHandle,
}

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();
static METRICS_ERROR: OnceLock<String> = OnceLock::new();
static METRICS_INIT: Once = Once::new();

impl AppState {
    /// Re-read configuration from the runtime sources and swap in a new
    /// adapter table. Only the adapter list is reloaded.
    pub fn reload_adapters(&self) -> Result<usize, GatewayError> {
        let config = self.runtime.load_gateway_config()?;
        self.adapters.reload(&config.adapters)
    }
}

pub fn load_state() -> Result<AppState, GatewayError> {
    let runtime = RuntimeConfig::from_env();
    let config = runtime.load_gateway_config()?;
    load_state_with_config(runtime, config)
}

pub fn load_state_with_config(
    runtime: RuntimeConfig,
    config: GatewayConfig,
) -> Result<AppState, GatewayError> {
    runtime.validate()?;
    config.validate()?;
    let headers = Arc::new(HeaderPolicy::from_config(&config.proxy)?);
    let settings =
        ProxySettings::from_config(&config.proxy, runtime.environment.exposes_error_detail());
    let adapters = AdapterRegistry::build(&config.adapters, Arc::clone(&headers), settings)?;
    let default_window = WindowPolicy::from_config("rate_limit", &config.rate_limit.window())?;
    let client_ip = ClientIpResolver::from_config(&config.rate_limit)?;
    let cors = CorsPolicy::from_config(&config.cors)?;
    let metrics = init_metrics()?;

    if adapters.adapter_count() == 0 {
        tracing::warn!("no adapters configured, every proxied request will be rejected");
    }
    tracing::info!(
        adapters = ?adapters.names(),
        rate_limit_enabled = config.rate_limit.enabled,
        environment = ?runtime.environment,
        "gateway state loaded"
    );

    Ok(AppState {
        runtime: Arc::new(runtime),
        adapters,
        limiter: Arc::new(RateLimiter::new(default_window)),
        rate_limit: Arc::new(config.rate_limit),
        client_ip: Arc::new(client_ip),
        cors: Arc::new(cors),
        headers,
        shutdown: ShutdownCoordinator::new(config.shutdown.grace_period()),
        max_request_body_bytes: config.proxy.max_request_body_bytes,
        metrics,
    })
}

fn init_metrics() -> Result<PrometheusHandle, GatewayError> {
    METRICS_INIT.call_once(|| {
        match metrics_exporter_prometheus::PrometheusBuilder::new().install_recorder() {
            Ok(handle) => {
                let _ = METRICS_HANDLE.set(handle);
            }
            Err(err) => {
                let _ = METRICS_ERROR.set(err.to_string());
            }
        }
    });

    if let Some(err) = METRICS_ERROR.get() {
        return Err(GatewayError::Metrics(err.clone()));
    }
    METRICS_HANDLE
        .get()
        .cloned()
        .ok_or_else(|| GatewayError::Metrics("metrics recorder not available".to_string()))
}

pub fn build_app(state: AppState) -> Router {
    let metrics_path = state.runtime.metrics_path.clone();
    let body_limit = state.max_request_body_bytes;
    Router::<AppState>::new()
        .route(HEALTH_PATH, get(crate::handlers::health))
        .route(READY_PATH, get(crate::handlers::ready))
        .route(ADAPTERS_PATH, get(crate::handlers::list_adapters))
        .route(&metrics_path, get(crate::handlers::metrics))
        .fallback(crate::router::dispatch)
        .layer(middleware::from_fn_with_state(
            state.clone(),
            crate::router::track_in_flight,
        ))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            crate::router::cors,
        ))
        .with_state(state)
        .layer(RequestBodyLimitLayer::new(body_limit))
        .layer(SetRequestIdLayer::new(
            axum::http::header::HeaderName::from_static("x-request-id"),
            MakeRequestUuid,
        ))
        .layer(PropagateRequestIdLayer::new(
            axum::http::header::HeaderName::from_static("x-request-id"),
        ))
        .layer(TraceLayer::new_for_http())
}
