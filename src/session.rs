//! Session and request data model.
//!
//! Identifier newtypes are serde-transparent so they appear on the wire as
//! plain strings. `SessionId` values are chosen by the node that created the
//! session; `RequestId` and `NodeId` are minted locally.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::capabilities::Capabilities;
use crate::error::{GridError, Result};

/// Globally-unique node identifier, minted at node start-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(Uuid);

impl NodeId {
    /// Mint a new unique node ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for NodeId {
    type Err = GridError;

    fn from_str(s: &str) -> Result<Self> {
        let id = Uuid::parse_str(s).map_err(|e| GridError::InvalidConfig {
            key: "nodeId".into(),
            reason: e.to_string(),
        })?;
        Ok(Self(id))
    }
}

/// Unique identifier for a single new-session request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(Uuid);

impl RequestId {
    /// Mint a new unique request ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for RequestId {
    type Err = GridError;

    fn from_str(s: &str) -> Result<Self> {
        let id = Uuid::parse_str(s).map_err(|e| GridError::InvalidConfig {
            key: "requestId".into(),
            reason: e.to_string(),
        })?;
        Ok(Self(id))
    }
}

/// Identifier of a created session. Chosen by the owning node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Mint a fresh session ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Wrap an externally-chosen ID.
    pub fn from_string(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// String representation.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Wire-protocol variant the client speaks. Propagated so the response
/// encoding can match what the client expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Dialect {
    /// The W3C WebDriver protocol.
    W3c,
    /// The legacy JSON wire protocol.
    Oss,
}

/// A session running on a slot somewhere in the grid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    /// Session identifier.
    pub id: SessionId,
    /// URI of the node hosting the session.
    pub uri: String,
    /// Stereotype of the slot the session occupies.
    pub stereotype: Capabilities,
    /// Capabilities the session was actually started with.
    pub capabilities: Capabilities,
    /// When the session started.
    pub started_at: DateTime<Utc>,
}

/// A queued request for a new session.
///
/// `capabilities_choices` may enumerate alternative capability profiles from
/// a single client request; the matcher tries them in iteration order and all
/// are equally acceptable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRequest {
    /// Request identifier.
    pub request_id: RequestId,
    /// When the request entered the queue.
    pub enqueued_at: DateTime<Utc>,
    /// Protocol dialects the client can speak.
    pub dialects: Vec<Dialect>,
    /// Alternative capability profiles, in preference order.
    pub capabilities_choices: Vec<Capabilities>,
}

impl SessionRequest {
    /// Build a request with a fresh ID, enqueued now.
    pub fn new(dialects: Vec<Dialect>, capabilities_choices: Vec<Capabilities>) -> Self {
        Self {
            request_id: RequestId::new(),
            enqueued_at: Utc::now(),
            dialects,
            capabilities_choices,
        }
    }

    /// Parse a client-facing new-session payload.
    ///
    /// W3C payloads carry `capabilities.alwaysMatch` merged (right-biased)
    /// with each `capabilities.firstMatch` entry; legacy payloads carry a
    /// single `desiredCapabilities` object. A payload with both yields both
    /// dialects, W3C choices first.
    pub fn from_new_session_payload(payload: &Value) -> Result<Self> {
        let mut dialects = Vec::new();
        let mut choices = Vec::new();

        if let Some(w3c) = payload.get("capabilities") {
            dialects.push(Dialect::W3c);
            let always: Capabilities = match w3c.get("alwaysMatch") {
                Some(v) => serde_json::from_value(v.clone())?,
                None => Capabilities::new(),
            };
            match w3c.get("firstMatch").and_then(Value::as_array) {
                Some(entries) if !entries.is_empty() => {
                    for entry in entries {
                        let first: Capabilities = serde_json::from_value(entry.clone())?;
                        choices.push(always.merge(&first));
                    }
                }
                _ => choices.push(always),
            }
        }

        if let Some(desired) = payload.get("desiredCapabilities") {
            dialects.push(Dialect::Oss);
            choices.push(serde_json::from_value(desired.clone())?);
        }

        if choices.is_empty() {
            return Err(GridError::SessionNotCreated {
                message: "new session payload contains no capabilities".into(),
            });
        }

        Ok(Self::new(dialects, choices))
    }

    /// The first capability choice, surfaced by the queue's `contents()`.
    pub fn first_choice(&self) -> Capabilities {
        self.capabilities_choices.first().cloned().unwrap_or_default()
    }
}

/// What the distributor hands a node when asking it to create a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateSessionRequest {
    /// Protocol dialects the client can speak.
    pub dialects: Vec<Dialect>,
    /// The single capability choice being attempted.
    pub capabilities: Capabilities,
    /// Request metadata forwarded verbatim (tracing baggage and the like).
    #[serde(default)]
    pub metadata: Value,
}

/// A successfully created session plus the response bytes already encoded in
/// the client's dialect.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateSessionResponse {
    /// The created session.
    pub session: Session,
    /// Dialect-encoded response body, returned to the client untouched.
    pub encoded: Value,
}

/// Outcome of asking a node for a new session.
///
/// Transport failures during session creation collapse into `Retry`; only
/// the terminal reject carries a user-visible failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum NewSessionOutcome {
    /// The session was created.
    Created(CreateSessionResponse),
    /// Transient failure; re-queue the request at the head.
    Retry {
        /// Why the attempt should be retried.
        message: String,
    },
    /// Terminal failure; reject the request.
    Rejected {
        /// User-visible failure message.
        message: String,
    },
}
