//! HTTP surface of the distributor.
//!
//! Routes:
//! - `POST /se/grid/distributor/node` 🔒 — register a node by status
//! - `POST /se/grid/distributor/session` — create a session synchronously
//! - `POST /se/grid/distributor/node/{nodeId}/drain` 🔒
//! - `GET  /se/grid/distributor/status` — status snapshot

use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::middleware;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};

use super::LocalDistributor;
use crate::node::NodeStatus;
use crate::server::{Secret, error_response, require_secret};
use crate::session::{NodeId, SessionRequest};

/// Build the distributor's router.
pub fn router(distributor: Arc<LocalDistributor>, secret: Secret) -> Router {
    let protected = Router::new()
        .route("/se/grid/distributor/node", post(register_node))
        .route("/se/grid/distributor/node/{node_id}/drain", post(drain_node))
        .route_layer(middleware::from_fn_with_state(secret, require_secret));

    Router::new()
        .route("/se/grid/distributor/session", post(create_session))
        .route("/se/grid/distributor/status", get(status))
        .merge(protected)
        .with_state(distributor)
}

async fn register_node(
    State(distributor): State<Arc<LocalDistributor>>,
    Json(node_status): Json<NodeStatus>,
) -> Response {
    match distributor.register(node_status).await {
        Ok(()) => Json(serde_json::json!({ "value": null })).into_response(),
        Err(err) => error_response(&err),
    }
}

async fn create_session(
    State(distributor): State<Arc<LocalDistributor>>,
    Json(request): Json<SessionRequest>,
) -> Response {
    Json(distributor.new_session(request).await).into_response()
}

async fn drain_node(
    State(distributor): State<Arc<LocalDistributor>>,
    Path(node_id): Path<String>,
) -> Response {
    let node_id = match node_id.parse::<NodeId>() {
        Ok(id) => id,
        Err(_) => return StatusCode::BAD_REQUEST.into_response(),
    };
    match distributor.drain(node_id).await {
        Ok(draining) => Json(draining).into_response(),
        Err(err) => error_response(&err),
    }
}

async fn status(State(distributor): State<Arc<LocalDistributor>>) -> Response {
    Json(distributor.status().await).into_response()
}
