//! HTTP surface of the new-session queue.
//!
//! Routes:
//! - `POST /session` — public; raw WebDriver new-session payload, blocks
//! - `POST /se/grid/newsessionqueuer/session` — public; pre-formed request
//! - `POST /se/grid/newsessionqueuer/session/retry/{requestId}` 🔒
//! - `GET  /se/grid/newsessionqueuer/session/{requestId}` 🔒 — dequeue by id
//! - `GET  /se/grid/newsessionqueuer/queue` — public; capability sets
//! - `DELETE /se/grid/newsessionqueuer/queue` 🔒 — clear

use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::middleware;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use serde_json::Value;

use super::SessionQueue;
use crate::server::{Secret, error_response, require_secret};
use crate::session::{RequestId, SessionRequest};

/// Shared state for queue handlers.
#[derive(Clone)]
pub struct QueueService {
    queue: Arc<dyn SessionQueue>,
}

/// Build the queue's router.
pub fn router(queue: Arc<dyn SessionQueue>, secret: Secret) -> Router {
    let state = QueueService { queue };

    let protected = Router::new()
        .route("/se/grid/newsessionqueuer/session/retry/{request_id}", post(retry_add))
        .route("/se/grid/newsessionqueuer/session/{request_id}", get(remove))
        .route("/se/grid/newsessionqueuer/queue", delete(clear))
        .route_layer(middleware::from_fn_with_state(secret, require_secret));

    Router::new()
        .route("/session", post(add_payload))
        .route("/se/grid/newsessionqueuer/session", post(add_request))
        .route("/se/grid/newsessionqueuer/queue", get(contents))
        .merge(protected)
        .with_state(state)
}

async fn add_payload(State(service): State<QueueService>, Json(payload): Json<Value>) -> Response {
    let request = match SessionRequest::from_new_session_payload(&payload) {
        Ok(request) => request,
        Err(err) => return error_response(&err),
    };
    add_and_wait(&service, request).await
}

async fn add_request(
    State(service): State<QueueService>,
    Json(request): Json<SessionRequest>,
) -> Response {
    add_and_wait(&service, request).await
}

async fn add_and_wait(service: &QueueService, request: SessionRequest) -> Response {
    match service.queue.add(request).await {
        Ok(encoded) => Json(encoded).into_response(),
        Err(err) => error_response(&err),
    }
}

async fn retry_add(
    State(service): State<QueueService>,
    Path(request_id): Path<String>,
    Json(request): Json<SessionRequest>,
) -> Response {
    if request_id.parse::<RequestId>().is_err() {
        return StatusCode::BAD_REQUEST.into_response();
    }
    match service.queue.retry_add(request).await {
        Ok(accepted) => Json(accepted).into_response(),
        Err(err) => error_response(&err),
    }
}

async fn remove(State(service): State<QueueService>, Path(request_id): Path<String>) -> Response {
    let id = match request_id.parse::<RequestId>() {
        Ok(id) => id,
        Err(_) => return StatusCode::BAD_REQUEST.into_response(),
    };
    match service.queue.remove(id).await {
        Ok(Some(request)) => Json(request).into_response(),
        Ok(None) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => error_response(&err),
    }
}

async fn clear(State(service): State<QueueService>) -> Response {
    match service.queue.clear().await {
        Ok(count) => Json(count).into_response(),
        Err(err) => error_response(&err),
    }
}

async fn contents(State(service): State<QueueService>) -> Response {
    match service.queue.contents().await {
        Ok(capabilities) => Json(capabilities).into_response(),
        Err(err) => error_response(&err),
    }
}
