//! Shared HTTP plumbing for all grid roles.
//!
//! Each role (queue, distributor, session map, node) builds its own axum
//! router; this module provides the pieces they share: the registration
//! secret filter, the error-to-response mapping, and the listener loop with
//! graceful shutdown.

pub mod secret;

use axum::Json;
use axum::Router;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tokio_util::sync::CancellationToken;

pub use self::secret::{REGISTRATION_SECRET_HEADER, Secret, require_secret};
use crate::error::{ErrorKind, GridError, Result};

/// Map a grid error onto a WebDriver-shaped HTTP response.
pub fn error_response(err: &GridError) -> Response {
    let (status, code) = match (err.kind(), err) {
        (_, GridError::RequestTimedOut { .. }) => (StatusCode::INTERNAL_SERVER_ERROR, "timeout"),
        (ErrorKind::NotFound, GridError::NoSuchSession { .. }) => {
            (StatusCode::NOT_FOUND, "invalid session id")
        }
        (ErrorKind::NotFound, _) => (StatusCode::NOT_FOUND, "unknown error"),
        (ErrorKind::Unauthorized, _) => (StatusCode::UNAUTHORIZED, "unknown error"),
        (ErrorKind::InvalidInput, _) => (StatusCode::BAD_REQUEST, "invalid argument"),
        (ErrorKind::Retryable, _) => (StatusCode::SERVICE_UNAVAILABLE, "session not created"),
        (ErrorKind::Terminal, _) => (StatusCode::INTERNAL_SERVER_ERROR, "session not created"),
    };

    (
        status,
        Json(serde_json::json!({
            "value": {
                "error": code,
                "message": err.to_string(),
            }
        })),
    )
        .into_response()
}

/// Readiness probe response: 204 when ready, 503 otherwise.
pub fn ready_response(ready: bool) -> StatusCode {
    if ready {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

/// A `/readyz` route backed by an async probe. Each role mounts exactly one.
pub fn readyz_router<F, Fut>(probe: F) -> Router
where
    F: Fn() -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = bool> + Send + 'static,
{
    Router::new().route(
        "/readyz",
        axum::routing::get(move || {
            let probe = probe.clone();
            async move { ready_response(probe().await) }
        }),
    )
}

/// Bind `addr` and serve `router` until the token is cancelled.
pub async fn serve(router: Router, addr: &str, cancel: CancellationToken) -> Result<()> {
    let listener =
        tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|source| GridError::Server {
                addr: addr.to_string(),
                source,
            })?;
    tracing::info!(%addr, "listening");
    axum::serve(listener, router)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .map_err(|source| GridError::Server {
            addr: addr.to_string(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_such_session_maps_to_404() {
        let err = GridError::NoSuchSession { id: "abc".into() };
        assert_eq!(error_response(&err).status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn unauthorized_maps_to_401() {
        assert_eq!(
            error_response(&GridError::UnauthorizedSecret).status(),
            StatusCode::UNAUTHORIZED
        );
    }

    #[test]
    fn timeout_maps_to_500() {
        let err = GridError::RequestTimedOut {
            waited: std::time::Duration::from_secs(1),
        };
        assert_eq!(error_response(&err).status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn ready_is_204_not_ready_is_503() {
        assert_eq!(ready_response(true), StatusCode::NO_CONTENT);
        assert_eq!(ready_response(false), StatusCode::SERVICE_UNAVAILABLE);
    }
}
