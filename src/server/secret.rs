//! Registration secret: proof that a caller belongs to this cluster.
//!
//! Every intra-cluster mutation carries the secret in a request header;
//! receivers install [`require_secret`] on those routes and answer 401 on a
//! mismatch. An empty secret disables the check, which is what single-process
//! deployments use.

use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;

/// Header carrying the registration secret on intra-cluster requests.
pub const REGISTRATION_SECRET_HEADER: &str = "x-registration-secret";

/// A shared cluster secret. Comparison is constant-time.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    /// Wrap a secret value.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// The empty secret: all callers are accepted.
    pub fn none() -> Self {
        Self(String::new())
    }

    /// Whether authentication is effectively disabled.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Check a presented value against this secret.
    pub fn matches(&self, presented: &str) -> bool {
        if self.0.is_empty() {
            return true;
        }
        self.0.as_bytes().ct_eq(presented.as_bytes()).into()
    }

    /// The raw value, for attaching to outbound requests.
    pub fn value(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never leak the value through logs.
        write!(f, "Secret(****)")
    }
}

/// Axum middleware rejecting requests without a matching secret.
pub async fn require_secret(State(secret): State<Secret>, request: Request, next: Next) -> Response {
    let presented = request
        .headers()
        .get(REGISTRATION_SECRET_HEADER)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("");

    if secret.matches(presented) {
        next.run(request).await
    } else {
        tracing::warn!(path = %request.uri().path(), "rejected request with bad registration secret");
        (
            StatusCode::UNAUTHORIZED,
            axum::Json(serde_json::json!({
                "value": {
                    "error": "unknown error",
                    "message": "registration secret missing or does not match",
                }
            })),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_secret_matches_anything() {
        let secret = Secret::none();
        assert!(secret.matches(""));
        assert!(secret.matches("whatever"));
    }

    #[test]
    fn non_empty_secret_requires_equality() {
        let secret = Secret::new("right");
        assert!(secret.matches("right"));
        assert!(!secret.matches("wrong"));
        assert!(!secret.matches(""));
    }

    #[test]
    fn debug_redacts_the_value() {
        let secret = Secret::new("hunter2");
        assert!(!format!("{secret:?}").contains("hunter2"));
    }

    #[test]
    fn serde_round_trip() {
        let secret = Secret::new("cluster-token");
        let json = serde_json::to_string(&secret).unwrap();
        assert_eq!(json, "\"cluster-token\"");
        let back: Secret = serde_json::from_str(&json).unwrap();
        assert_eq!(secret, back);
    }
}
