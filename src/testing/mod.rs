//! Test doubles shared by unit and integration tests.
//!
//! The happy path runs on the node module's [`LoopbackSessionFactory`]; the
//! factories here exercise the unhappy paths — retryable bounces and
//! terminal failures — without any driver involved.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;

use crate::capabilities::Capabilities;
use crate::node::factory::{ActiveSession, FactoryFailure, LoopbackSession, SessionFactory};
use crate::session::CreateSessionRequest;

/// A factory that fails retryably a fixed number of times, then succeeds.
pub struct FlakySessionFactory {
    remaining_failures: AtomicUsize,
}

impl FlakySessionFactory {
    /// Fail the first `failures` creation attempts.
    pub fn new(failures: usize) -> Self {
        Self {
            remaining_failures: AtomicUsize::new(failures),
        }
    }
}

#[async_trait]
impl SessionFactory for FlakySessionFactory {
    async fn create(
        &self,
        stereotype: &Capabilities,
        request: &CreateSessionRequest,
    ) -> std::result::Result<Arc<dyn ActiveSession>, FactoryFailure> {
        let remaining = self.remaining_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.remaining_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(FactoryFailure::retryable("driver busy, try again"));
        }
        let capabilities = stereotype.merge(&request.capabilities);
        Ok(Arc::new(LoopbackSession::new(capabilities)))
    }
}

/// A factory that always fails terminally.
pub struct RejectingSessionFactory {
    message: String,
}

impl RejectingSessionFactory {
    /// Fail every attempt with the given message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[async_trait]
impl SessionFactory for RejectingSessionFactory {
    async fn create(
        &self,
        _stereotype: &Capabilities,
        _request: &CreateSessionRequest,
    ) -> std::result::Result<Arc<dyn ActiveSession>, FactoryFailure> {
        Err(FactoryFailure::fatal(self.message.clone()))
    }
}

/// Build a `CreateSessionRequest` for tests.
pub fn create_request(capabilities: Capabilities) -> CreateSessionRequest {
    CreateSessionRequest {
        dialects: vec![crate::session::Dialect::W3c],
        capabilities,
        metadata: serde_json::Value::Null,
    }
}
