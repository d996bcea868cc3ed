//! The HTTP gateway polled by the metrics collector.

use std::{
    io,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::Arc,
};

use axum::{
    Router,
    extract::{Path, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use iroh_metrics::{MetricsSource, Registry};
use n0_future::task::AbortOnDropHandle;
use nested_enum_utils::common_fields;
use serde::{Deserialize, Serialize};
use snafu::{Backtrace, ResultExt, Snafu};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::{
    alias_server::correlation_id, metrics::Metrics, registry::AliasRegistry,
    wire::MetricsResponse,
};

/// Content type of the Prometheus text exposition format.
pub const METRICS_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";
/// Content type of the bridge's own metrics.
pub const OPENMETRICS_CONTENT_TYPE: &str = "application/openmetrics-text; version=1.0.0; charset=utf-8";

/// Config for the HTTP server.
#[derive(Debug, Default, Serialize, Deserialize, Clone)]
pub struct HttpConfig {
    /// Port to bind to, 0 for an ephemeral port.
    pub port: u16,
    /// Optionally set a custom bind address (will use 127.0.0.1 if unset)
    pub bind_addr: Option<IpAddr>,
}

/// Errors of the HTTP server.
#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum HttpError {
    #[snafu(display("Failed to bind {addr}"))]
    Bind { addr: SocketAddr, source: io::Error },
    #[snafu(display("Failed to serve HTTP"))]
    Serve { source: io::Error },
    #[snafu(display("HTTP server task failed"))]
    Join { source: tokio::task::JoinError },
}

/// State shared by the request handlers.
#[derive(Debug, Clone)]
pub struct AppState {
    registry: AliasRegistry,
    metrics: Arc<Metrics>,
}

impl AppState {
    /// Serves scrapes for the aliases in `registry`.
    pub fn new(registry: AliasRegistry, metrics: Arc<Metrics>) -> Self {
        Self { registry, metrics }
    }
}

/// The HTTP server.
#[derive(Debug)]
pub struct HttpServer {
    http_addr: SocketAddr,
    cancel: CancellationToken,
    task: AbortOnDropHandle<Result<(), HttpError>>,
}

impl HttpServer {
    /// Binds the listener and starts serving.
    pub async fn spawn(config: HttpConfig, state: AppState) -> Result<HttpServer, HttpError> {
        let bind_addr = SocketAddr::new(
            config.bind_addr.unwrap_or(Ipv4Addr::LOCALHOST.into()),
            config.port,
        );
        let listener = TcpListener::bind(bind_addr)
            .await
            .context(BindSnafu { addr: bind_addr })?;
        let http_addr = listener
            .local_addr()
            .context(BindSnafu { addr: bind_addr })?;
        let cancel = CancellationToken::new();
        let shutdown = cancel.clone();
        let app = create_app(state);
        let task = tokio::spawn(
            async move {
                axum::serve(listener, app)
                    .with_graceful_shutdown(async move { shutdown.cancelled().await })
                    .await
                    .context(ServeSnafu)
            }
            .instrument(info_span!("http", addr = %http_addr)),
        );
        info!("HTTP server listening on {http_addr}");
        Ok(HttpServer {
            http_addr,
            cancel,
            task: AbortOnDropHandle::new(task),
        })
    }

    /// The bound address of the HTTP socket.
    pub fn http_addr(&self) -> SocketAddr {
        self.http_addr
    }

    /// Stops accepting requests and waits for in-flight requests to complete.
    pub async fn shutdown(self) -> Result<(), HttpError> {
        self.cancel.cancel();
        self.task.await.context(JoinSnafu)?
    }
}

/// Creates the router.
pub fn create_app(state: AppState) -> Router {
    Router::new()
        .route("/scrape/{alias}/metrics", get(scrape))
        .route("/healthcheck", get(|| async { "OK" }))
        .route("/metrics", get(own_metrics))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

async fn own_metrics(State(state): State<AppState>) -> Response {
    let mut registry = Registry::default();
    registry.register(state.metrics.clone());
    match registry.encode_openmetrics_to_string() {
        Ok(body) => ([(header::CONTENT_TYPE, OPENMETRICS_CONTENT_TYPE)], body).into_response(),
        Err(err) => {
            warn!("metrics-encode-failed: {err:#}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn scrape(State(state): State<AppState>, Path(alias): Path<String>) -> Response {
    let Some(entry) = state.registry.lookup(&alias) else {
        debug!(%alias, "unknown alias");
        state.metrics.scrapes_unknown_alias.inc();
        return (StatusCode::NOT_FOUND, "Unknown alias").into_response();
    };
    match entry.client.fetch_metrics().await {
        Ok(MetricsResponse::Success { metrics }) => {
            state.metrics.scrapes_ok.inc();
            ([(header::CONTENT_TYPE, METRICS_CONTENT_TYPE)], metrics).into_response()
        }
        Ok(MetricsResponse::Failure { error_message }) => {
            let request_id = correlation_id();
            warn!(%alias, target = %entry.target, %request_id, "upstream-error: {error_message}");
            state.metrics.scrapes_upstream_error.inc();
            let body = format!("Upstream error (request {request_id}): {error_message}");
            (StatusCode::BAD_GATEWAY, body).into_response()
        }
        Err(err) => {
            warn!(%alias, target = %entry.target, "upstream-unavailable: {err:#}");
            state.metrics.scrapes_upstream_unavailable.inc();
            (StatusCode::BAD_GATEWAY, "Upstream unavailable").into_response()
        }
    }
}
