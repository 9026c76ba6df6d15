//! Centralized configuration.
//!
//! Every knob is an environment variable with a sensible default; `load()`
//! validates and the process exits on bad values before any component
//! starts. Durations are stored as seconds and exposed as accessors so the
//! clamping rules live in exactly one place.

use std::time::Duration;

use crate::error::{GridError, Result};
use crate::node::factory::DriverDescriptor;

/// Default client-facing port, shared by the standalone role.
pub const DEFAULT_PORT: u16 = 4444;

/// Default health-check interval in seconds.
pub const DEFAULT_HEALTHCHECK_INTERVAL: u64 = 300;

/// Floor applied to the health-check interval. A configured zero or negative
/// interval is clamped up to this rather than treated as "disabled".
pub const MIN_HEALTHCHECK_INTERVAL: u64 = 10;

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> Result<T> {
    match std::env::var(key) {
        Err(_) => Ok(default),
        Ok(raw) => raw.parse().map_err(|_| GridError::InvalidConfig {
            key: key.to_string(),
            reason: format!("unable to parse {raw:?}"),
        }),
    }
}

/// Listener configuration shared by every role.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address.
    pub host: String,
    /// Bind port.
    pub port: u16,
}

impl ServerConfig {
    fn load() -> Result<Self> {
        Ok(Self {
            host: env_string("TRELLIS_HOST", "0.0.0.0"),
            port: env_parse("TRELLIS_PORT", DEFAULT_PORT)?,
        })
    }

    /// The address to bind.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Distributor tuning.
#[derive(Debug, Clone)]
pub struct DistributorConfig {
    /// Full distributor URI; wins over hostname + port when set.
    pub host: Option<String>,
    /// Hostname used to derive the URI when `host` is unset.
    pub hostname: Option<String>,
    /// Port used to derive the URI when `host` is unset.
    pub port: Option<u16>,
    /// Seconds between node health checks. Clamped to a 10 s floor.
    pub healthcheck_interval_secs: u64,
    /// Seconds without a heartbeat before a node is purged.
    pub purge_timeout_secs: u64,
}

impl DistributorConfig {
    fn load() -> Result<Self> {
        Ok(Self {
            host: std::env::var("TRELLIS_DISTRIBUTOR_HOST").ok(),
            hostname: std::env::var("TRELLIS_DISTRIBUTOR_HOSTNAME").ok(),
            port: match std::env::var("TRELLIS_DISTRIBUTOR_PORT") {
                Err(_) => None,
                Ok(raw) => Some(raw.parse().map_err(|_| GridError::InvalidConfig {
                    key: "TRELLIS_DISTRIBUTOR_PORT".into(),
                    reason: format!("unable to parse {raw:?}"),
                })?),
            },
            healthcheck_interval_secs: env_parse(
                "TRELLIS_HEALTHCHECK_INTERVAL_SECS",
                DEFAULT_HEALTHCHECK_INTERVAL,
            )?,
            purge_timeout_secs: env_parse("TRELLIS_PURGE_TIMEOUT_SECS", 120)?,
        })
    }

    /// The distributor URI a remote node should talk to.
    ///
    /// `host` wins; otherwise hostname + port are combined. With neither
    /// set, configuration is incomplete.
    pub fn uri(&self) -> Result<String> {
        if let Some(host) = &self.host {
            if !host.starts_with("http://") && !host.starts_with("https://") {
                return Err(GridError::InvalidConfig {
                    key: "TRELLIS_DISTRIBUTOR_HOST".into(),
                    reason: "must start with http:// or https://".into(),
                });
            }
            return Ok(host.trim_end_matches('/').to_string());
        }

        match (&self.hostname, self.port) {
            (Some(hostname), Some(port)) => Ok(format!("http://{hostname}:{port}")),
            _ => Err(GridError::InvalidConfig {
                key: "TRELLIS_DISTRIBUTOR_HOST".into(),
                reason: "unable to determine host and port for the distributor".into(),
            }),
        }
    }

    /// Health-check interval with the floor applied.
    pub fn healthcheck_interval(&self) -> Duration {
        let seconds = self.healthcheck_interval_secs.max(MIN_HEALTHCHECK_INTERVAL);
        if seconds != self.healthcheck_interval_secs {
            tracing::warn!(
                configured = self.healthcheck_interval_secs,
                clamped = seconds,
                "health-check interval clamped to the minimum"
            );
        }
        Duration::from_secs(seconds)
    }

    /// How long a node may stay silent before the purge scan drops it.
    pub fn purge_timeout(&self) -> Duration {
        Duration::from_secs(self.purge_timeout_secs)
    }
}

/// New-session queue tuning.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Maximum seconds a request may spend in the queue.
    pub request_timeout_secs: u64,
    /// Seconds between expiry sweeps over the queue head.
    pub retry_interval_secs: u64,
}

impl QueueConfig {
    fn load() -> Result<Self> {
        Ok(Self {
            request_timeout_secs: env_parse("TRELLIS_REQUEST_TIMEOUT_SECS", 300)?,
            retry_interval_secs: env_parse("TRELLIS_RETRY_INTERVAL_SECS", 5)?,
        })
    }

    /// Total time a request may wait.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Expiry sweep cadence.
    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_secs.max(1))
    }
}

/// Session-map service location, for roles that use a remote map.
#[derive(Debug, Clone)]
pub struct SessionsConfig {
    /// URI of a remote session-map service; unset means in-process.
    pub host: Option<String>,
}

impl SessionsConfig {
    fn load() -> Self {
        Self {
            host: std::env::var("TRELLIS_SESSIONS_HOST").ok(),
        }
    }
}

/// Node tuning.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Externally-reachable URI this node announces; derived from the bind
    /// address when unset.
    pub uri: Option<String>,
    /// Seconds between heartbeats.
    pub heartbeat_period_secs: u64,
    /// Seconds between registration attempts before the node is accepted.
    pub register_cycle_secs: u64,
    /// Seconds before an unregistered node gives up.
    pub register_period_secs: u64,
    /// Seconds a session may sit idle before it is stopped.
    pub session_timeout_secs: u64,
    /// Configured session cap; clamped to the CPU count unless overridden.
    pub max_sessions: Option<usize>,
    /// Allow `max_sessions` to exceed the CPU count.
    pub override_max_sessions: bool,
    /// Probe the search path for known driver binaries.
    pub detect_drivers: bool,
    /// Explicit driver descriptors (JSON array).
    pub drivers: Vec<DriverDescriptor>,
}

impl NodeConfig {
    fn load() -> Result<Self> {
        let drivers = match std::env::var("TRELLIS_DRIVERS") {
            Err(_) => Vec::new(),
            Ok(raw) => serde_json::from_str(&raw).map_err(|e| GridError::InvalidConfig {
                key: "TRELLIS_DRIVERS".into(),
                reason: e.to_string(),
            })?,
        };

        Ok(Self {
            uri: std::env::var("TRELLIS_NODE_URI").ok(),
            heartbeat_period_secs: env_parse("TRELLIS_HEARTBEAT_PERIOD_SECS", 60)?,
            register_cycle_secs: env_parse("TRELLIS_REGISTER_CYCLE_SECS", 10)?,
            register_period_secs: env_parse("TRELLIS_REGISTER_PERIOD_SECS", 120)?,
            session_timeout_secs: env_parse("TRELLIS_SESSION_TIMEOUT_SECS", 300)?,
            max_sessions: match std::env::var("TRELLIS_MAX_SESSIONS") {
                Err(_) => None,
                Ok(raw) => Some(raw.parse().map_err(|_| GridError::InvalidConfig {
                    key: "TRELLIS_MAX_SESSIONS".into(),
                    reason: format!("unable to parse {raw:?}"),
                })?),
            },
            override_max_sessions: env_parse("TRELLIS_OVERRIDE_MAX_SESSIONS", false)?,
            detect_drivers: env_parse("TRELLIS_DETECT_DRIVERS", true)?,
            drivers,
        })
    }

    /// Heartbeat cadence.
    pub fn heartbeat_period(&self) -> Duration {
        Duration::from_secs(self.heartbeat_period_secs.max(1))
    }

    /// Registration attempt cadence.
    pub fn register_cycle(&self) -> Duration {
        Duration::from_secs(self.register_cycle_secs.max(1))
    }

    /// How long to keep trying to register.
    pub fn register_period(&self) -> Duration {
        Duration::from_secs(self.register_period_secs)
    }

    /// Idle session timeout.
    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_secs)
    }

    /// Session cap after CPU clamping.
    pub fn effective_max_sessions(&self) -> usize {
        let cpus = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
        let configured = self.max_sessions.unwrap_or(cpus);
        if self.override_max_sessions {
            if configured > cpus {
                tracing::warn!(
                    configured,
                    cpus,
                    "running more concurrent sessions than CPUs; expect contention"
                );
            }
            configured.max(1)
        } else {
            configured.clamp(1, cpus)
        }
    }
}

/// Secret configuration.
#[derive(Debug, Clone)]
pub struct SecretConfig {
    /// Registration secret; empty disables authentication.
    pub value: Option<String>,
}

impl SecretConfig {
    fn load() -> Self {
        Self {
            value: std::env::var("TRELLIS_SECRET").ok().filter(|v| !v.is_empty()),
        }
    }

    /// The secret as used by filters and clients.
    pub fn secret(&self) -> crate::server::Secret {
        match &self.value {
            Some(value) => crate::server::Secret::new(value.clone()),
            None => crate::server::Secret::none(),
        }
    }
}

/// Top-level configuration for every role.
#[derive(Debug, Clone)]
pub struct GridConfig {
    /// Listener settings.
    pub server: ServerConfig,
    /// Distributor settings.
    pub distributor: DistributorConfig,
    /// Queue settings.
    pub queue: QueueConfig,
    /// Session-map location.
    pub sessions: SessionsConfig,
    /// Node settings.
    pub node: NodeConfig,
    /// Secret settings.
    pub secret: SecretConfig,
}

impl GridConfig {
    /// Load the complete configuration from the environment.
    pub fn load() -> Result<Self> {
        Ok(Self {
            server: ServerConfig::load()?,
            distributor: DistributorConfig::load()?,
            queue: QueueConfig::load()?,
            sessions: SessionsConfig::load(),
            node: NodeConfig::load()?,
            secret: SecretConfig::load(),
        })
    }

    /// Defaults without touching the environment, for tests.
    pub fn defaults() -> Self {
        Self {
            server: ServerConfig {
                host: "0.0.0.0".into(),
                port: DEFAULT_PORT,
            },
            distributor: DistributorConfig {
                host: None,
                hostname: None,
                port: None,
                healthcheck_interval_secs: DEFAULT_HEALTHCHECK_INTERVAL,
                purge_timeout_secs: 120,
            },
            queue: QueueConfig {
                request_timeout_secs: 300,
                retry_interval_secs: 5,
            },
            sessions: SessionsConfig { host: None },
            node: NodeConfig {
                uri: None,
                heartbeat_period_secs: 60,
                register_cycle_secs: 10,
                register_period_secs: 120,
                session_timeout_secs: 300,
                max_sessions: None,
                override_max_sessions: false,
                detect_drivers: true,
                drivers: Vec::new(),
            },
            secret: SecretConfig { value: None },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = GridConfig::defaults();
        assert_eq!(config.server.port, 4444);
        assert_eq!(config.queue.request_timeout(), Duration::from_secs(300));
        assert_eq!(config.queue.retry_interval(), Duration::from_secs(5));
        assert_eq!(config.node.heartbeat_period(), Duration::from_secs(60));
        assert_eq!(
            config.distributor.healthcheck_interval(),
            Duration::from_secs(300)
        );
    }

    #[test]
    fn healthcheck_interval_is_clamped_to_the_floor() {
        let mut config = GridConfig::defaults();
        config.distributor.healthcheck_interval_secs = 0;
        assert_eq!(config.distributor.healthcheck_interval(), Duration::from_secs(10));
    }

    #[test]
    fn distributor_host_wins_over_hostname_and_port() {
        let mut config = GridConfig::defaults();
        config.distributor.host = Some("http://dist.example:9999/".into());
        config.distributor.hostname = Some("ignored".into());
        config.distributor.port = Some(1);
        assert_eq!(config.distributor.uri().unwrap(), "http://dist.example:9999");
    }

    #[test]
    fn distributor_uri_from_hostname_and_port() {
        let mut config = GridConfig::defaults();
        config.distributor.hostname = Some("dist.example".into());
        config.distributor.port = Some(5553);
        assert_eq!(config.distributor.uri().unwrap(), "http://dist.example:5553");
    }

    #[test]
    fn distributor_uri_requires_host_information() {
        let config = GridConfig::defaults();
        assert!(matches!(
            config.distributor.uri().unwrap_err(),
            GridError::InvalidConfig { .. }
        ));
    }

    #[test]
    fn non_http_distributor_host_is_rejected() {
        let mut config = GridConfig::defaults();
        config.distributor.host = Some("dist.example:9999".into());
        assert!(config.distributor.uri().is_err());
    }

    #[test]
    fn max_sessions_is_clamped_to_cpu_count() {
        let mut config = GridConfig::defaults();
        config.node.max_sessions = Some(10_000);
        let cpus = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
        assert_eq!(config.node.effective_max_sessions(), cpus);

        config.node.override_max_sessions = true;
        assert_eq!(config.node.effective_max_sessions(), 10_000);
    }
}
