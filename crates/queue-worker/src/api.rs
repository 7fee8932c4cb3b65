//! Prometheus endpoint for the worker

use autoscaler_lib::WorkerPhase;
use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Router};
use prometheus::{Encoder, TextEncoder};
use tokio::sync::watch;
use tracing::{info, warn};

/// Lifecycle phase as seen by the HTTP handlers
#[derive(Clone)]
pub struct AppState {
    pub phase: watch::Receiver<WorkerPhase>,
}

/// 200 until the worker starts shutting down
async fn healthz(State(state): State<AppState>) -> impl IntoResponse {
    let phase = *state.phase.borrow();
    let status_code = match phase {
        WorkerPhase::Terminating | WorkerPhase::Stopped => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::OK,
    };
    (status_code, phase.to_string())
}

async fn metrics() -> impl IntoResponse {
    let mut buffer = Vec::new();

    if let Err(e) = TextEncoder::new().encode(&prometheus::gather(), &mut buffer) {
        warn!(error = %e, "Failed to encode metrics");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            [("content-type", "text/plain; charset=utf-8")],
            Vec::new(),
        );
    }

    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        buffer,
    )
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .with_state(state)
}

pub async fn serve(port: u16, state: AppState) -> anyhow::Result<()> {
    let addr = format!("0.0.0.0:{}", port);
    info!(addr = %addr, "Starting metrics server");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, create_router(state)).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use autoscaler_lib::WorkerMetrics;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn app(phase: WorkerPhase) -> (Router, watch::Sender<WorkerPhase>) {
        let (tx, rx) = watch::channel(phase);
        (create_router(AppState { phase: rx }), tx)
    }

    #[tokio::test]
    async fn test_metrics_exposes_worker_metrics() {
        let (app, _tx) = app(WorkerPhase::Consuming);
        WorkerMetrics::new().inc_reconnects();

        let response = app
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("queue_worker_reconnects_total"));
    }

    #[tokio::test]
    async fn test_healthz_follows_phase() {
        let (app, tx) = app(WorkerPhase::Consuming);

        let response = app
            .clone()
            .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        tx.send_replace(WorkerPhase::Terminating);
        let response = app
            .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
