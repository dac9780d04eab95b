//! HTTP surface: webhook intake, health and read-only contact snapshots.

use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use serde_json::{Value, json};
use tower_http::trace::TraceLayer;
use tracing::{error, warn};

use crate::ingress::payload::normalize_contact_id;
use crate::pipeline::MessagePipeline;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<MessagePipeline>,
}

/// Build the Axum router.
pub fn routes(pipeline: Arc<MessagePipeline>) -> Router {
    let state = AppState { pipeline };

    Router::new()
        .route("/health", get(health))
        .route("/webhook", post(webhook))
        .route("/webhook/{event}", post(webhook_by_event))
        .route("/api/contacts/{id}", get(contact_snapshot))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ── Health ──────────────────────────────────────────────────────────────

async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "lead-relay"
    }))
}

// ── Webhook ─────────────────────────────────────────────────────────────

/// Unparseable bodies still go through ingress, which reports them as
/// malformed instead of failing the request.
fn parse_body(body: &[u8]) -> Value {
    serde_json::from_slice(body).unwrap_or_else(|e| {
        warn!(error = %e, len = body.len(), "Webhook body is not valid JSON");
        Value::Null
    })
}

async fn webhook(State(state): State<AppState>, body: Bytes) -> impl IntoResponse {
    process(&state, parse_body(&body)).await
}

/// Gateways configured for per-event URLs put the event name in the path
/// rather than the body.
async fn webhook_by_event(
    State(state): State<AppState>,
    Path(event): Path<String>,
    body: Bytes,
) -> impl IntoResponse {
    let mut payload = parse_body(&body);
    if let Some(obj) = payload.as_object_mut() {
        obj.entry("event").or_insert_with(|| Value::String(event));
    }
    process(&state, payload).await
}

/// Processing runs in its own task, so a gateway that drops the connection
/// mid-request cannot cancel a turn halfway. A failed message has its
/// identity released by the pipeline, so the gateway's retry after a 500 is
/// processed again.
async fn process(state: &AppState, payload: Value) -> (StatusCode, Json<Value>) {
    let pipeline = Arc::clone(&state.pipeline);
    let task = tokio::spawn(async move { pipeline.process(&payload).await });

    match task.await {
        Ok(Ok(outcome)) => (StatusCode::OK, Json(json!({"outcome": outcome.label()}))),
        Ok(Err(e)) => {
            error!(error = %e, "Webhook processing failed");
            internal_error()
        }
        Err(e) => {
            error!(error = %e, "Webhook processing task aborted");
            internal_error()
        }
    }
}

fn internal_error() -> (StatusCode, Json<Value>) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"error": "internal error"})),
    )
}

// ── Contacts ────────────────────────────────────────────────────────────

async fn contact_snapshot(State(state): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    let Some(contact) = normalize_contact_id(&id) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "Invalid contact ID"})),
        );
    };

    match state.pipeline.hub().conversation(&contact).await {
        Ok(Some(conversation)) => (StatusCode::OK, Json(json!(conversation))),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "Contact not found"})),
        ),
        Err(e) => {
            error!(contact = %contact, error = %e, "Contact lookup failed");
            internal_error()
        }
    }
}
