//! HTTP surface: Prometheus exposition and a health probe.

use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use serde_json::json;

use metricgrid_graph::Pipeline;
use metricgrid_metrics::render_prometheus;

#[derive(Clone)]
pub struct HttpState {
    pub pipeline: Arc<Pipeline>,
}

pub fn build_router(state: HttpState) -> Router {
    Router::new()
        .route("/metrics", get(prometheus_metrics))
        .route("/healthz", get(healthz))
        .with_state(state)
}

/// GET /metrics
async fn prometheus_metrics(State(state): State<HttpState>) -> impl IntoResponse {
    state.pipeline.publish_queue_stats();
    let body = render_prometheus(&state.pipeline.context().telemetry);
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}

/// GET /healthz
async fn healthz(State(state): State<HttpState>) -> impl IntoResponse {
    let ctx = state.pipeline.context();
    let peers: Vec<String> = ctx.remote.peers().iter().map(ToString::to_string).collect();
    Json(json!({
        "status": "ok",
        "self": ctx.remote.self_address(),
        "peers": peers,
        "stages": state.pipeline.stages().len(),
    }))
}
