//! kiln-metrics — observability for the runner fleet.
//!
//! An explicitly constructed sink ([`RunnerGauges`]) the reconciliation
//! loop updates with plain method calls — no global metrics registry.
//! The disposition gauges are set once per tick; the preparing gauge is
//! held high for the duration of a bake through an RAII guard.
//!
//! [`render_prometheus`] produces the text exposition served at
//! `/metrics` by [`metrics_router`].

pub mod gauges;
pub mod prometheus;

use std::sync::Arc;

use axum::Router;
use axum::extract::State;
use axum::http::header;
use axum::response::IntoResponse;
use axum::routing::get;

pub use gauges::{PreparingGuard, RunnerGauges};
pub use prometheus::render_prometheus;

/// Build the router serving the Prometheus exposition.
pub fn metrics_router(gauges: Arc<RunnerGauges>) -> Router {
    Router::new().route("/metrics", get(serve_metrics).with_state(gauges))
}

async fn serve_metrics(State(gauges): State<Arc<RunnerGauges>>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        render_prometheus(&gauges),
    )
}
