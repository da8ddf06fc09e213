use crate::admission::Webhook;
use crate::metrics::CounterRegistry;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::header::CONTENT_TYPE;
use axum::routing::{get, post};
use axum::{Json, Router, http::StatusCode, response::IntoResponse};
use kube::core::DynamicObject;
use kube::core::admission::AdmissionReview;
use std::sync::Arc;

pub async fn readiness_probe() -> impl IntoResponse {
    StatusCode::NO_CONTENT
}

pub async fn liveness_probe() -> impl IntoResponse {
    StatusCode::NO_CONTENT
}

async fn metrics(State(registry): State<Arc<CounterRegistry>>) -> impl IntoResponse {
    (
        [(CONTENT_TYPE, "text/plain; version=0.0.4")],
        registry.render(),
    )
}

async fn mutate(
    State(webhook): State<Arc<Webhook>>,
    body: Bytes,
) -> Json<AdmissionReview<DynamicObject>> {
    Json(webhook.handle(&body))
}

pub fn create_health_app() -> Router {
    Router::new()
        .route("/healthz", get(liveness_probe))
        .route("/readyz", get(readiness_probe))
}

pub fn create_metrics_app(registry: Arc<CounterRegistry>) -> Router {
    Router::new()
        .route("/metrics", get(metrics))
        .with_state(registry)
}

pub fn create_webhook_app(webhook: Arc<Webhook>) -> Router {
    Router::new()
        .route("/mutate", post(mutate))
        .with_state(webhook)
}
