//! Session factory seam.
//!
//! Browser driver discovery and launch are outside the core: a
//! [`SessionFactory`] is a black box that either produces an
//! [`ActiveSession`] or reports a typed failure. The core only needs the
//! registry mapping stereotypes to factories, injected at node construction.
//!
//! Factories are selected by *name* from a registry of constructors wired at
//! program start; configuration never names runtime types.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::capabilities::Capabilities;
use crate::error::{GridError, Result};
use crate::session::{CreateSessionRequest, SessionId};

/// A WebDriver command forwarded to a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandRequest {
    /// HTTP method of the command.
    pub method: String,
    /// Command path below `/session/{id}`, leading slash included.
    pub path: String,
    /// JSON body, `null` for body-less commands.
    #[serde(default)]
    pub body: Value,
}

/// Response to a forwarded WebDriver command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResponse {
    /// HTTP status to relay.
    pub status: u16,
    /// JSON body to relay.
    pub body: Value,
}

/// A live session produced by a factory.
#[async_trait]
pub trait ActiveSession: Send + Sync {
    /// The session's identifier, chosen by the factory.
    fn id(&self) -> SessionId;

    /// Capabilities the session actually started with.
    fn capabilities(&self) -> Capabilities;

    /// Execute one WebDriver command against the session.
    async fn execute(&self, request: CommandRequest) -> Result<CommandResponse>;

    /// Tear the session down. Idempotent.
    async fn stop(&self);
}

/// Typed failure from a session factory.
#[derive(Debug, Clone)]
pub struct FactoryFailure {
    /// Whether the failure is transient (slot pressure, driver hiccup).
    pub retryable: bool,
    /// Human-readable cause.
    pub message: String,
}

impl FactoryFailure {
    /// A transient failure the scheduler should retry.
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            retryable: true,
            message: message.into(),
        }
    }

    /// A terminal failure.
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            retryable: false,
            message: message.into(),
        }
    }
}

/// Produces sessions for one stereotype.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    /// Create a session for the given request.
    async fn create(
        &self,
        stereotype: &Capabilities,
        request: &CreateSessionRequest,
    ) -> std::result::Result<Arc<dyn ActiveSession>, FactoryFailure>;
}

/// Configuration-supplied description of one driver the node should host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverDescriptor {
    /// Display name for logs and status output.
    pub display_name: String,
    /// The stereotype each of this driver's slots advertises.
    pub stereotype: Capabilities,
    /// How many concurrent sessions (slots) this driver supports.
    pub max_sessions: usize,
    /// Name of the factory constructor to build the driver with.
    pub factory: String,
}

/// Constructor for a named factory.
pub type FactoryConstructor = Arc<dyn Fn(&DriverDescriptor) -> Arc<dyn SessionFactory> + Send + Sync>;

/// Registry of named factory constructors, wired at program start.
#[derive(Default, Clone)]
pub struct FactoryRegistry {
    constructors: HashMap<String, FactoryConstructor>,
}

impl FactoryRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a constructor under a name. Later registrations win.
    pub fn register<F>(&mut self, name: impl Into<String>, constructor: F)
    where
        F: Fn(&DriverDescriptor) -> Arc<dyn SessionFactory> + Send + Sync + 'static,
    {
        self.constructors.insert(name.into(), Arc::new(constructor));
    }

    /// Build the factory a descriptor names.
    pub fn create(&self, descriptor: &DriverDescriptor) -> Result<Arc<dyn SessionFactory>> {
        let constructor =
            self.constructors
                .get(&descriptor.factory)
                .ok_or_else(|| GridError::InvalidConfig {
                    key: "node.drivers".into(),
                    reason: format!("unknown session factory {:?}", descriptor.factory),
                })?;
        Ok(constructor(descriptor))
    }

    /// Names currently registered, for diagnostics.
    pub fn names(&self) -> Vec<&str> {
        self.constructors.keys().map(String::as_str).collect()
    }
}

impl std::fmt::Debug for FactoryRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FactoryRegistry").field("names", &self.names()).finish()
    }
}

/// A session that exists only inside the node: every command is answered
/// with an empty success body.
///
/// Useful for smoke-testing a grid's wiring when no driver binaries are
/// linked into the process; the scheduler, queue and session map behave
/// exactly as they would with a real browser behind the slot.
pub struct LoopbackSession {
    id: SessionId,
    capabilities: Capabilities,
    stopped: std::sync::atomic::AtomicBool,
}

impl LoopbackSession {
    /// Create a loopback session with a fresh ID.
    pub fn new(capabilities: Capabilities) -> Self {
        Self {
            id: SessionId::new(),
            capabilities,
            stopped: std::sync::atomic::AtomicBool::new(false),
        }
    }

    /// Whether `stop` has been called.
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[async_trait]
impl ActiveSession for LoopbackSession {
    fn id(&self) -> SessionId {
        self.id.clone()
    }

    fn capabilities(&self) -> Capabilities {
        self.capabilities.clone()
    }

    async fn execute(&self, _request: CommandRequest) -> Result<CommandResponse> {
        Ok(CommandResponse {
            status: 200,
            body: serde_json::json!({ "value": null }),
        })
    }

    async fn stop(&self) {
        self.stopped.store(true, std::sync::atomic::Ordering::SeqCst);
    }
}

/// Factory producing [`LoopbackSession`]s. Always succeeds.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoopbackSessionFactory;

#[async_trait]
impl SessionFactory for LoopbackSessionFactory {
    async fn create(
        &self,
        stereotype: &Capabilities,
        request: &CreateSessionRequest,
    ) -> std::result::Result<Arc<dyn ActiveSession>, FactoryFailure> {
        let capabilities = stereotype.merge(&request.capabilities);
        Ok(Arc::new(LoopbackSession::new(capabilities)))
    }
}

/// Driver binaries the autodetect probe knows how to recognize.
const KNOWN_DRIVERS: &[(&str, &str)] = &[
    ("chromedriver", "chrome"),
    ("geckodriver", "firefox"),
    ("msedgedriver", "MicrosoftEdge"),
];

/// Factory name assigned to autodetected drivers.
pub const DETECTED_DRIVER_FACTORY: &str = "webdriver-binary";

/// Walk a search path and return descriptors for the driver binaries found.
///
/// Each detected driver gets a single-session descriptor with a
/// `browserName`-only stereotype; configuration can always override.
pub fn detect_drivers(search_path: &str) -> Vec<DriverDescriptor> {
    let mut found = Vec::new();
    for dir in std::env::split_paths(search_path) {
        for (binary, browser_name) in KNOWN_DRIVERS {
            if found.iter().any(|d: &DriverDescriptor| d.display_name == *binary) {
                continue;
            }
            if is_executable(&dir.join(binary)) {
                tracing::info!(driver = binary, browser = browser_name, "detected driver binary");
                found.push(DriverDescriptor {
                    display_name: (*binary).to_string(),
                    stereotype: [("browserName".to_string(), Value::String((*browser_name).to_string()))]
                        .into_iter()
                        .collect(),
                    max_sessions: 1,
                    factory: DETECTED_DRIVER_FACTORY.to_string(),
                });
            }
        }
    }
    found
}

fn is_executable(path: &Path) -> bool {
    path.is_file()
}

/// Search path used when the configuration does not supply one.
pub fn default_search_path() -> PathBuf {
    std::env::var_os("PATH").map(PathBuf::from).unwrap_or_default()
}
