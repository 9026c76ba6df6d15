//! Error types for the grid core.
//!
//! A single [`GridError`] enum covers every component boundary. The
//! distributor and queue never use errors as control flow between each other;
//! the retry/reject split travels as tagged variants on the new-session
//! outcome instead. What remains here are the failures that are surfaced to
//! callers or propagated across the intra-cluster HTTP boundary.

use std::time::Duration;

use snafu::Snafu;

/// Result type for grid operations.
pub type Result<T, E = GridError> = std::result::Result<T, E>;

/// Errors that can occur in the grid core.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum GridError {
    /// A new session could not be created. Terminal for the request.
    #[snafu(display("Session not created: {message}"))]
    SessionNotCreated {
        /// Why the session was not created.
        message: String,
    },

    /// A transient failure while creating a session. The scheduler converts
    /// this into a head-retry in the queue rather than a user-visible error.
    #[snafu(display("Session request can be retried: {message}"))]
    RetrySession {
        /// Why the attempt should be retried.
        message: String,
    },

    /// Session map lookup missed.
    #[snafu(display("No session found with id {id}"))]
    NoSuchSession {
        /// Session ID that was not found.
        id: String,
    },

    /// A session with this ID is already bound in the session map.
    #[snafu(display("Session already exists: {id}"))]
    SessionExists {
        /// Session ID that is already bound.
        id: String,
    },

    /// Node lookup missed.
    #[snafu(display("No node found with id {id}"))]
    NoSuchNode {
        /// Node ID that was not found.
        id: String,
    },

    /// Intra-cluster mutation without the correct registration secret.
    #[snafu(display("Registration secret missing or does not match"))]
    UnauthorizedSecret,

    /// A queued request reached its deadline before it was matched.
    #[snafu(display("New session request timed out after {:?} in queue", waited))]
    RequestTimedOut {
        /// How long the request waited.
        waited: Duration,
    },

    /// Bad configuration at start-up.
    #[snafu(display("Invalid configuration for {key}: {reason}"))]
    InvalidConfig {
        /// Configuration key at fault.
        key: String,
        /// Why the value was rejected.
        reason: String,
    },

    /// I/O failure at the intra-cluster HTTP boundary.
    #[snafu(display("Transport error talking to {uri}: {source}"))]
    Transport {
        /// Remote URI that failed.
        uri: String,
        /// Source error.
        source: reqwest::Error,
    },

    /// JSON encode/decode failure.
    #[snafu(display("Serialization error: {source}"))]
    Serialization {
        /// Source error.
        source: serde_json::Error,
    },

    /// Failure binding or serving a listener.
    #[snafu(display("Server error on {addr}: {source}"))]
    Server {
        /// Bind address.
        addr: String,
        /// Source error.
        source: std::io::Error,
    },
}

/// Coarse classification used for retry decisions and HTTP mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Transient; the operation may succeed if retried.
    Retryable,
    /// Terminal; retrying will not help.
    Terminal,
    /// A referenced entity does not exist.
    NotFound,
    /// Caller is not part of the cluster.
    Unauthorized,
    /// Invalid input or configuration.
    InvalidInput,
}

impl GridError {
    /// Get the error kind for retry logic.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::SessionNotCreated { .. } => ErrorKind::Terminal,
            Self::RetrySession { .. } => ErrorKind::Retryable,
            Self::NoSuchSession { .. } => ErrorKind::NotFound,
            Self::SessionExists { .. } => ErrorKind::InvalidInput,
            Self::NoSuchNode { .. } => ErrorKind::NotFound,
            Self::UnauthorizedSecret => ErrorKind::Unauthorized,
            Self::RequestTimedOut { .. } => ErrorKind::Terminal,
            Self::InvalidConfig { .. } => ErrorKind::InvalidInput,
            Self::Transport { .. } => ErrorKind::Retryable,
            Self::Serialization { .. } => ErrorKind::Terminal,
            Self::Server { .. } => ErrorKind::Terminal,
        }
    }

    /// Check if the error is retryable.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Retryable
    }
}

impl From<serde_json::Error> for GridError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization { source: err }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_session_is_retryable() {
        let err = GridError::RetrySession {
            message: "all slots busy".into(),
        };
        assert!(err.is_retryable());
        assert_eq!(err.kind(), ErrorKind::Retryable);
    }

    #[test]
    fn session_not_created_is_terminal() {
        let err = GridError::SessionNotCreated {
            message: "no slot matched".into(),
        };
        assert!(!err.is_retryable());
        assert_eq!(err.kind(), ErrorKind::Terminal);
    }

    #[test]
    fn timeout_is_terminal() {
        let err = GridError::RequestTimedOut {
            waited: Duration::from_secs(300),
        };
        assert_eq!(err.kind(), ErrorKind::Terminal);
    }
}
