// Server module - exposes the metrics registry over HTTP
//
// Scrapes only read the instruments; collection happens in the scheduler.
// Routes:
// - GET /metrics  Prometheus text exposition of every registered instrument
// - GET /health   liveness probe

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use prometheus::{Encoder, Registry, TextEncoder};
use std::net::SocketAddr;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info};

/// Errors from binding or running the HTTP listener
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Failed to bind metrics listener on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("Metrics server failed: {0}")]
    Serve(#[source] std::io::Error),
}

/// Error returned by the scrape handler
#[derive(Debug)]
pub enum MetricsError {
    EncodingFailed(prometheus::Error),
}

impl IntoResponse for MetricsError {
    fn into_response(self) -> Response {
        match self {
            MetricsError::EncodingFailed(e) => {
                error!("Failed to encode metrics: {}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "Failed to encode metrics").into_response()
            }
        }
    }
}

/// Builds the router serving `registry`
pub fn router(registry: Registry) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .with_state(registry)
}

/// Renders every registered instrument in the text exposition format
pub async fn metrics_handler(State(registry): State<Registry>) -> Result<Response, MetricsError> {
    let families = registry.gather();
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder
        .encode(&families, &mut buffer)
        .map_err(MetricsError::EncodingFailed)?;

    debug!("Served {} metric families ({} bytes)", families.len(), buffer.len());
    Ok(([(header::CONTENT_TYPE, encoder.format_type().to_string())], buffer).into_response())
}

pub async fn health_handler() -> &'static str {
    "ok"
}

/// Binds the scrape listener on all interfaces
pub async fn bind(port: u16) -> Result<TcpListener, ServerError> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|source| ServerError::Bind { addr, source })?;
    info!("Metrics endpoint listening on http://{}/metrics", addr);
    Ok(listener)
}

/// Serves scrapes until `shutdown` turns true
pub async fn serve(
    listener: TcpListener,
    registry: Registry,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), ServerError> {
    axum::serve(listener, router(registry))
        .with_graceful_shutdown(async move {
            // A dropped sender also stops the server
            let _ = shutdown.wait_for(|stop| *stop).await;
            info!("Metrics server shutting down");
        })
        .await
        .map_err(ServerError::Serve)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::instruments::{register_gauge, LabeledGauge};

    async fn body_text(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_metrics_handler_renders_registry() {
        let registry = Registry::new();
        let total = register_gauge(&registry, "openwebui_users_total", "Total users").unwrap();
        total.set(4.0);
        let by_role =
            LabeledGauge::register(&registry, "openwebui_users_by_role", "By role", &["role"])
                .unwrap();
        by_role.replace(vec![(vec!["admin".to_string()], 1.0)]);

        let response = metrics_handler(State(registry)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            prometheus::TEXT_FORMAT
        );

        let body = body_text(response).await;
        assert!(body.contains("openwebui_users_total 4"));
        assert!(body.contains("openwebui_users_by_role{role=\"admin\"} 1"));
    }

    #[tokio::test]
    async fn test_health_handler() {
        assert_eq!(health_handler().await, "ok");
    }

    #[tokio::test]
    async fn test_serve_stops_on_signal() {
        let listener = bind(0).await.unwrap();
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(serve(listener, Registry::new(), stop_rx));

        stop_tx.send(true).unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[test]
    fn test_encoding_error_is_a_server_error() {
        let err = prometheus::Error::Msg("broken".to_string());
        let response = MetricsError::EncodingFailed(err).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
