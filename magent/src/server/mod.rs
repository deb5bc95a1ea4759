//! HTTP surface of the agent.
//!
//! Two read-only endpoints: `/metrics` runs a federation pass and serves
//! the merged exposition, `/sandboxes` lists what the registry currently
//! tracks.

mod encode;

pub use encode::{accepts_gzip, EncodedBody, ExpositionFormat, ResponseEncoder};

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderMap, HeaderName, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use tokio_util::sync::CancellationToken;

use magent_shared::{MagentError, MagentResult};

use crate::federation::MetricsFederator;
use crate::registry::SandboxRegistry;
use crate::telemetry::AgentMetrics;

/// Shared state behind the HTTP handlers.
#[derive(Clone)]
pub struct AppState {
    federator: Arc<MetricsFederator>,
    metrics: AgentMetrics,
    registry: SandboxRegistry,
    encoder: Arc<ResponseEncoder>,
}

impl AppState {
    pub fn new(
        federator: Arc<MetricsFederator>,
        metrics: AgentMetrics,
        registry: SandboxRegistry,
    ) -> Self {
        Self {
            federator,
            metrics,
            registry,
            encoder: Arc::new(ResponseEncoder::new()),
        }
    }
}

/// Build the agent's router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/metrics", get(serve_metrics))
        .route("/sandboxes", get(serve_sandboxes))
        .with_state(state)
}

/// Bind `addr` and serve until `shutdown` fires.
pub async fn serve(
    addr: SocketAddr,
    state: AppState,
    shutdown: CancellationToken,
) -> MagentResult<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| MagentError::Config(format!("failed to bind {addr}: {e}")))?;
    tracing::info!(address = %addr, "Serving metrics");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(|e| MagentError::Internal(format!("metrics server failed: {e}")))
}

async fn serve_metrics(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let federated = match state.federator.collect().await {
        Ok(snapshot) => snapshot,
        Err(e) => {
            tracing::error!(error = %e, "Federation pass failed");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("metrics collection failed: {e}\n"),
            )
                .into_response();
        }
    };
    let own = state.metrics.gather();

    let format = ExpositionFormat::negotiate(header_str(&headers, header::ACCEPT));
    let gzip = accepts_gzip(header_str(&headers, header::ACCEPT_ENCODING));

    match state.encoder.encode(&own, &federated, format, gzip) {
        Ok(encoded) => {
            let mut response = Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, encoded.content_type);
            if let Some(encoding) = encoded.content_encoding {
                response = response.header(header::CONTENT_ENCODING, encoding);
            }
            match response.body(Body::from(encoded.body)) {
                Ok(response) => response,
                Err(e) => {
                    tracing::error!(error = %e, "Failed to build metrics response");
                    (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        format!("response assembly failed: {e}\n"),
                    )
                        .into_response()
                }
            }
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to encode metrics response");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("metrics encoding failed: {e}\n"),
            )
                .into_response()
        }
    }
}

async fn serve_sandboxes(State(state): State<AppState>) -> Response {
    match state.registry.snapshot() {
        Ok(snapshot) => {
            let mut pairs: Vec<(String, String)> = snapshot.into_iter().collect();
            pairs.sort();

            let mut body = String::new();
            for (id, namespace) in &pairs {
                body.push_str(id);
                body.push(' ');
                body.push_str(namespace);
                body.push('\n');
            }

            (
                StatusCode::OK,
                [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
                body,
            )
                .into_response()
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to list sandboxes");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

fn header_str(headers: &HeaderMap, name: HeaderName) -> Option<&str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}
