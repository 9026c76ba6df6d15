//! HTTP surface of the session map.
//!
//! Routes under `/se/grid/sessions`:
//! - `POST /se/grid/sessions` 🔒 — bind a session
//! - `GET /se/grid/sessions/{sessionId}` — look a session up
//! - `DELETE /se/grid/sessions/{sessionId}` 🔒 — remove a binding

use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::middleware;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};

use super::SessionMap;
use crate::server::{Secret, error_response, require_secret};
use crate::session::{Session, SessionId};

/// Shared state for session-map handlers.
#[derive(Clone)]
pub struct SessionMapService {
    sessions: Arc<dyn SessionMap>,
}

/// Build the session map's router.
pub fn router(sessions: Arc<dyn SessionMap>, secret: Secret) -> Router {
    let state = SessionMapService { sessions };

    let protected = Router::new()
        .route("/se/grid/sessions", post(add_session))
        .route("/se/grid/sessions/{session_id}", delete(remove_session))
        .route_layer(middleware::from_fn_with_state(secret, require_secret));

    Router::new()
        .route("/se/grid/sessions/{session_id}", get(get_session))
        .merge(protected)
        .with_state(state)
}

async fn add_session(
    State(service): State<SessionMapService>,
    Json(session): Json<Session>,
) -> Response {
    match service.sessions.add(session).await {
        Ok(()) => StatusCode::CREATED.into_response(),
        Err(err) => error_response(&err),
    }
}

async fn get_session(
    State(service): State<SessionMapService>,
    Path(session_id): Path<String>,
) -> Response {
    let id = SessionId::from_string(session_id);
    match service.sessions.get(&id).await {
        Ok(session) => Json(session).into_response(),
        Err(err) => error_response(&err),
    }
}

async fn remove_session(
    State(service): State<SessionMapService>,
    Path(session_id): Path<String>,
) -> Response {
    let id = SessionId::from_string(session_id);
    match service.sessions.remove(&id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => error_response(&err),
    }
}
