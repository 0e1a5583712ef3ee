//! The admission HTTP server.

mod webhook;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::Extension;
use axum::http::{header::HeaderName, HeaderMap, HeaderValue, StatusCode};
use axum::routing::{get, post};
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::resolver::RatioSource;
use crate::store::KeyValueStore;

/// Shared state for the admission handlers.
pub struct AppState {
    /// The application's runtime config.
    pub config: Arc<Config>,
    /// The shared state store holding counter and ratio records.
    pub store: Arc<dyn KeyValueStore>,
    /// The resolver of per-job target ratios.
    pub resolver: Arc<dyn RatioSource>,
}

/// The HTTP server hosting the admission endpoints and healthcheck.
///
/// TLS is terminated in front of this process, so the server binds plain TCP.
pub struct WebhookServer {
    state: Arc<AppState>,
    /// A channel used for triggering graceful shutdown.
    shutdown_rx: broadcast::Receiver<()>,
    metrics: PrometheusHandle,
}

impl WebhookServer {
    /// Construct a new instance.
    pub fn new(state: Arc<AppState>, shutdown_rx: broadcast::Receiver<()>, metrics: PrometheusHandle) -> Self {
        webhook::register_metrics();
        Self { state, shutdown_rx, metrics }
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(self) -> Result<()> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.state.config.http_port));
        let router = Router::new()
            .route("/healthz", get(healthz))
            .route("/metrics", get(prom_metrics))
            .route("/mutate", post(webhook::mutate))
            .route("/validate", post(webhook::validate))
            .layer(TraceLayer::new_for_http())
            .layer(Extension(self.state.clone()))
            .layer(Extension(self.metrics.clone()));

        let mut shutdown_rx = self.shutdown_rx;
        tracing::info!(addr = %addr, "admission webhook server listening");
        axum::Server::bind(&addr)
            .serve(router.into_make_service())
            .with_graceful_shutdown(async move {
                let _res = shutdown_rx.recv().await;
            })
            .await
            .context("error running webhook server")
    }
}

/// Healthcheck handler, green only while the state store answers a ping.
async fn healthz(Extension(state): Extension<Arc<AppState>>) -> StatusCode {
    match tokio::time::timeout(state.config.webhook_timeout(), state.store.ping()).await {
        Ok(Ok(())) => StatusCode::OK,
        Ok(Err(err)) => {
            tracing::error!(error = ?err, "state store ping failed");
            StatusCode::SERVICE_UNAVAILABLE
        }
        Err(_elapsed) => {
            tracing::error!("state store ping timed out");
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

/// Handler for serving Prometheus metrics.
async fn prom_metrics(Extension(handle): Extension<PrometheusHandle>) -> (StatusCode, HeaderMap, String) {
    let mut headers = HeaderMap::new();
    headers.insert(HeaderName::from_static("content-type"), HeaderValue::from_static("text/plain; version=0.0.4"));
    (StatusCode::OK, headers, handle.render())
}
