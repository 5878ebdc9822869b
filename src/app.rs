use crate::config::GatewayConfig;
use crate::error::{AppError, AppResult};
use crate::interceptors::{InterceptorChain, InterceptorDeps};
use crate::stream::{CompletionStreamer, HttpStreamer};
use axum::Router;
use axum::http::{HeaderName, HeaderValue};
use axum::http::header::{
    ACCESS_CONTROL_ALLOW_CREDENTIALS, ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS,
    ACCESS_CONTROL_ALLOW_ORIGIN,
};
use axum::routing::get;
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::{Arc, Once, OnceLock};
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;

const REQUEST_ID_HEADER: &str = "x-request-id";
pub const ALLOWED_METHODS: &str = "GET,HEAD,OPTIONS,POST,PUT";
pub const ALLOWED_HEADERS: &str = "Origin, Accept, X-Requested-With, Content-Type, Access-Control-Request-Method, Access-Control-Request-Headers, Authorization";

/// Everything a request needs, built once at startup and never mutated.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<GatewayConfig>,
    pub interceptors: Arc<InterceptorChain>,
    pub streamer: Arc<dyn CompletionStreamer>,
    pub metrics: PrometheusHandle,
}

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();
static METRICS_ERROR: OnceLock<AppError> = OnceLock::new();
static METRICS_INIT: Once = Once::new();

pub fn http_client(config: &GatewayConfig) -> AppResult<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent("relaygate/0.1")
        .connect_timeout(config.connection_timeout)
        .build()
        .map_err(|err| AppError::internal(format!("http client init failed: {err}")))
}

pub fn load_state(config: GatewayConfig) -> AppResult<AppState> {
    let http = http_client(&config)?;
    let deps = InterceptorDeps { http: http.clone() };
    let interceptors = InterceptorChain::build(&config.interceptors, &deps)
        .map_err(|err| AppError::internal(err.to_string()))?;
    let streamer = Arc::new(HttpStreamer::new(http, config.openai_base_url.clone()));
    load_state_with(config, interceptors, streamer)
}

pub fn load_state_with(
    config: GatewayConfig,
    interceptors: InterceptorChain,
    streamer: Arc<dyn CompletionStreamer>,
) -> AppResult<AppState> {
    let metrics = init_metrics()?;
    tracing::info!(
        upstreams = config.upstreams.len(),
        interceptors = ?interceptors.names(),
        "gateway state loaded"
    );
    Ok(AppState {
        config: Arc::new(config),
        interceptors: Arc::new(interceptors),
        streamer,
        metrics,
    })
}

fn init_metrics() -> AppResult<PrometheusHandle> {
    METRICS_INIT.call_once(|| {
        match metrics_exporter_prometheus::PrometheusBuilder::new().install_recorder() {
            Ok(handle) => {
                let _ = METRICS_HANDLE.set(handle);
            }
            Err(err) => {
                let _ = METRICS_ERROR.set(AppError::internal(format!(
                    "metrics init failed: {err}"
                )));
            }
        }
    });

    if let Some(err) = METRICS_ERROR.get() {
        return Err(err.clone());
    }
    METRICS_HANDLE
        .get()
        .cloned()
        .ok_or_else(|| AppError::internal("metrics recorder not available"))
}

pub fn build_app(state: AppState) -> Router {
    let metrics_path = state.config.metrics_path.clone();
    Router::new()
        .route(
            &metrics_path,
            get(crate::handlers::render_metrics).options(crate::handlers::preflight),
        )
        .fallback(crate::handlers::gateway)
        .with_state(state)
        .layer(SetResponseHeaderLayer::overriding(
            ACCESS_CONTROL_ALLOW_ORIGIN,
            HeaderValue::from_static("*"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            ACCESS_CONTROL_ALLOW_CREDENTIALS,
            HeaderValue::from_static("true"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            ACCESS_CONTROL_ALLOW_METHODS,
            HeaderValue::from_static(ALLOWED_METHODS),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            ACCESS_CONTROL_ALLOW_HEADERS,
            HeaderValue::from_static(ALLOWED_HEADERS),
        ))
        .layer(PropagateRequestIdLayer::new(HeaderName::from_static(
            REQUEST_ID_HEADER,
        )))
        .layer(TraceLayer::new_for_http())
        .layer(SetRequestIdLayer::new(
            HeaderName::from_static(REQUEST_ID_HEADER),
            MakeRequestUuid,
        ))
}
