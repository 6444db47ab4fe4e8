//! HTTP endpoint for Prometheus scraping and readiness probes.

use crate::metrics::MetricsCollector;
use crate::registry::RouterRegistry;
use axum::{Router, extract::State, http::StatusCode, response::IntoResponse, routing::get};
use prometheus::{Encoder, TextEncoder};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Clone)]
struct MetricsServerState {
    collector: MetricsCollector,
    registry: Arc<RouterRegistry>,
}

/// Builds the axum app serving `/metrics` and `/ready`.
pub fn app(collector: MetricsCollector, registry: Arc<RouterRegistry>) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/ready", get(ready_handler))
        .with_state(MetricsServerState {
            collector,
            registry,
        })
}

/// Serves the metrics app on `listener` until `shutdown` is cancelled.
pub async fn serve(
    listener: TcpListener,
    collector: MetricsCollector,
    registry: Arc<RouterRegistry>,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let addr: SocketAddr = listener.local_addr()?;
    info!("Starting metrics server on http://{}/metrics", addr);

    axum::serve(listener, app(collector, registry))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

async fn metrics_handler(State(state): State<MetricsServerState>) -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = state.collector.registry.gather();

    let mut buffer = vec![];
    match encoder.encode(&metric_families, &mut buffer) {
        Ok(_) => (
            StatusCode::OK,
            [("content-type", encoder.format_type())],
            buffer,
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "Failed to encode metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to encode metrics",
            )
                .into_response()
        }
    }
}

async fn ready_handler(State(state): State<MetricsServerState>) -> impl IntoResponse {
    let mut body = String::new();
    let mut all_ready = true;

    for router in state.registry.routers() {
        for vrf in router.vrfs() {
            for table in vrf.tables() {
                let ready = table.is_ready();
                all_ready &= ready;
                body.push_str(&format!(
                    "{} {} {} {}\n",
                    router.name(),
                    vrf.label(),
                    table.family(),
                    if ready { "ready" } else { "not-ready" }
                ));
            }
        }
    }

    let status = if all_ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, body)
}
