//! HTTP surface of a node.
//!
//! Routes:
//! - `POST /session` — create a session (intra-cluster, called by the distributor)
//! - `ANY  /session/{sessionId}/{*command}` — forward a WebDriver command
//! - `DELETE /session/{sessionId}` — stop a session
//! - `GET  /status` — status snapshot
//! - `GET  /healthz` — self-probe
//! - `POST /se/grid/node/drain` 🔒 — start draining

use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{Method, StatusCode};
use axum::middleware;
use axum::response::{IntoResponse, Response};
use axum::routing::{any, delete, get, post};
use serde_json::Value;

use super::Node;
use crate::node::factory::CommandRequest;
use crate::server::{Secret, error_response, require_secret};
use crate::session::{CreateSessionRequest, SessionId};

/// Shared state for node handlers.
#[derive(Clone)]
pub struct NodeService {
    node: Arc<dyn Node>,
}

/// Build the node's router.
pub fn router(node: Arc<dyn Node>, secret: Secret) -> Router {
    let state = NodeService { node };

    let protected = Router::new()
        .route("/se/grid/node/drain", post(drain))
        .route_layer(middleware::from_fn_with_state(secret, require_secret));

    Router::new()
        .route("/session", post(new_session))
        .route("/session/{session_id}", delete(stop_session))
        .route("/session/{session_id}/{*command}", any(forward_command))
        .route("/status", get(status))
        .route("/healthz", get(healthz))
        .merge(protected)
        .with_state(state)
}

async fn new_session(
    State(service): State<NodeService>,
    Json(request): Json<CreateSessionRequest>,
) -> impl IntoResponse {
    Json(service.node.new_session(request).await)
}

async fn forward_command(
    State(service): State<NodeService>,
    Path((session_id, command)): Path<(String, String)>,
    method: Method,
    body: Bytes,
) -> Response {
    let session_id = SessionId::from_string(session_id);
    let body = if body.is_empty() {
        Value::Null
    } else {
        match serde_json::from_slice(&body) {
            Ok(value) => value,
            Err(err) => return error_response(&err.into()),
        }
    };

    let request = CommandRequest {
        method: method.to_string(),
        path: format!("/{command}"),
        body,
    };

    match service.node.execute_webdriver_command(&session_id, request).await {
        Ok(response) => {
            let status =
                StatusCode::from_u16(response.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            (status, Json(response.body)).into_response()
        }
        Err(err) => error_response(&err),
    }
}

async fn stop_session(
    State(service): State<NodeService>,
    Path(session_id): Path<String>,
) -> Response {
    let session_id = SessionId::from_string(session_id);
    match service.node.stop(&session_id).await {
        Ok(()) => Json(serde_json::json!({ "value": null })).into_response(),
        Err(err) => error_response(&err),
    }
}

async fn status(State(service): State<NodeService>) -> Response {
    match service.node.status().await {
        Ok(status) => Json(status).into_response(),
        Err(err) => error_response(&err),
    }
}

async fn healthz(State(service): State<NodeService>) -> impl IntoResponse {
    Json(service.node.health_check().await)
}

async fn drain(State(service): State<NodeService>) -> Response {
    match service.node.drain().await {
        Ok(()) => Json(serde_json::json!({ "value": null })).into_response(),
        Err(err) => error_response(&err),
    }
}
