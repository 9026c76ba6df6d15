//! Trellis entry point: pick a role, wire its components, serve.

use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use trellis::config::GridConfig;
use trellis::distributor::remote::{RemoteDistributor, run_registration_loop};
use trellis::distributor::{LocalDistributor, service as distributor_service};
use trellis::events::{EventBus, LocalEventBus};
use trellis::node::factory::{
    DETECTED_DRIVER_FACTORY, DriverDescriptor, FactoryRegistry, LoopbackSessionFactory, SessionFactory,
    detect_drivers,
};
use trellis::node::{LocalNode, Node, service as node_service};
use trellis::queue::{LocalSessionQueue, service as queue_service};
use trellis::server::{readyz_router, serve};
use trellis::sessionmap::remote::RemoteSessionMap;
use trellis::sessionmap::{LocalSessionMap, SessionMap, service as sessionmap_service};

#[derive(Parser)]
#[command(name = "trellis", version, about = "Session distribution core for a browser-automation grid")]
struct Cli {
    #[command(subcommand)]
    role: Role,
}

#[derive(Subcommand)]
enum Role {
    /// Queue, distributor, session map and an embedded node in one process.
    Standalone,
    /// Queue, distributor and (unless remote) session map; nodes register
    /// over HTTP.
    Hub,
    /// A node that registers itself with a remote distributor.
    Node,
    /// The session map on its own.
    Sessions,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = GridConfig::load().context("invalid configuration")?;

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown signal received");
            ctrl_c.cancel();
        }
    });

    match cli.role {
        Role::Standalone => run_hub(config, cancel, true).await,
        Role::Hub => run_hub(config, cancel, false).await,
        Role::Node => run_node(config, cancel).await,
        Role::Sessions => run_sessions(config, cancel).await,
    }
}

/// Factory constructors linked into this binary.
///
/// Driver-launching factories live outside the core; what ships here is the
/// loopback factory for smoke-testing grid wiring. Autodetected driver
/// descriptors resolve to it too, with a warning, until a real factory is
/// registered under their name.
fn factory_registry() -> FactoryRegistry {
    let mut registry = FactoryRegistry::new();
    registry.register("loopback", |_descriptor| {
        Arc::new(LoopbackSessionFactory) as Arc<dyn SessionFactory>
    });
    registry.register(DETECTED_DRIVER_FACTORY, |descriptor| {
        tracing::warn!(
            driver = %descriptor.display_name,
            "no driver-launching factory linked into this binary; serving loopback sessions"
        );
        Arc::new(LoopbackSessionFactory) as Arc<dyn SessionFactory>
    });
    registry
}

fn node_descriptors(config: &GridConfig) -> anyhow::Result<Vec<DriverDescriptor>> {
    let mut descriptors = config.node.drivers.clone();
    if config.node.detect_drivers {
        let search_path = trellis::node::factory::default_search_path();
        descriptors.extend(detect_drivers(&search_path.to_string_lossy()));
    }
    anyhow::ensure!(
        !descriptors.is_empty(),
        "no drivers configured or detected; set TRELLIS_DRIVERS or install a known driver binary"
    );
    Ok(descriptors)
}

fn build_node(
    config: &GridConfig,
    bus: Arc<dyn EventBus>,
    uri: String,
) -> anyhow::Result<Arc<LocalNode>> {
    let registry = factory_registry();
    let descriptors = node_descriptors(config)?;
    let node = LocalNode::builder(uri, bus)
        .max_sessions(config.node.effective_max_sessions())
        .heartbeat_period(config.node.heartbeat_period())
        .session_timeout(config.node.session_timeout())
        .add_descriptors(&registry, &descriptors)?
        .build();
    Ok(node)
}

async fn run_hub(config: GridConfig, cancel: CancellationToken, embed_node: bool) -> anyhow::Result<()> {
    let secret = config.secret.secret();
    let bus: Arc<dyn EventBus> = Arc::new(LocalEventBus::new());

    let local_sessions = match &config.sessions.host {
        Some(_) => None,
        None => Some(LocalSessionMap::new(bus.clone())),
    };
    let sessions: Arc<dyn SessionMap> = match (&config.sessions.host, &local_sessions) {
        (Some(uri), _) => Arc::new(RemoteSessionMap::new(uri.clone(), secret.clone())),
        (None, Some(local)) => local.clone(),
        (None, None) => unreachable!("local session map constructed above"),
    };

    let queue = LocalSessionQueue::new(
        bus.clone(),
        config.queue.request_timeout(),
        config.queue.retry_interval(),
    );
    let distributor = LocalDistributor::new(
        bus.clone(),
        sessions.clone(),
        queue.clone(),
        secret.clone(),
        config.distributor.healthcheck_interval(),
        config.distributor.purge_timeout(),
    );

    let node = if embed_node {
        let uri = format!("http://localhost:{}", config.server.port);
        let node = build_node(&config, bus.clone(), uri)?;
        distributor.add(node.clone()).await.context("failed to register embedded node")?;
        Some(node)
    } else {
        None
    };

    let mut router = queue_service::router(queue.clone(), secret.clone())
        .merge(distributor_service::router(distributor.clone(), secret.clone()));
    if let Some(local) = &local_sessions {
        router = router.merge(sessionmap_service::router(local.clone(), secret.clone()));
    }
    let probe = distributor.clone();
    router = router.merge(readyz_router(move || {
        let probe = probe.clone();
        async move { probe.is_ready().await }
    }));

    serve(router, &config.server.bind_addr(), cancel).await?;

    // Teardown in reverse construction order.
    if let Some(node) = node {
        node.shutdown();
    }
    distributor.shutdown();
    queue.shutdown();
    if let Some(local) = local_sessions {
        local.shutdown();
    }
    Ok(())
}

async fn run_node(config: GridConfig, cancel: CancellationToken) -> anyhow::Result<()> {
    let secret = config.secret.secret();
    let bus: Arc<dyn EventBus> = Arc::new(LocalEventBus::new());

    let uri = config
        .node
        .uri
        .clone()
        .unwrap_or_else(|| format!("http://localhost:{}", config.server.port));
    let node = build_node(&config, bus, uri)?;

    let distributor_uri = config.distributor.uri().context("node role needs a distributor")?;
    let distributor = Arc::new(RemoteDistributor::new(distributor_uri, secret.clone()));

    let registration = tokio::spawn(run_registration_loop(
        distributor,
        node.clone() as Arc<dyn Node>,
        config.node.register_cycle(),
        config.node.register_period(),
        config.node.heartbeat_period(),
        cancel.clone(),
    ));

    let probe = node.clone();
    let router = node_service::router(node.clone(), secret).merge(readyz_router(move || {
        let probe = probe.clone();
        async move { probe.status().await.is_ok() }
    }));

    serve(router, &config.server.bind_addr(), cancel).await?;

    node.shutdown();
    registration.abort();
    Ok(())
}

async fn run_sessions(config: GridConfig, cancel: CancellationToken) -> anyhow::Result<()> {
    let secret = config.secret.secret();
    let bus: Arc<dyn EventBus> = Arc::new(LocalEventBus::new());
    let sessions = LocalSessionMap::new(bus);

    let probe = sessions.clone();
    let router = sessionmap_service::router(sessions.clone(), secret).merge(readyz_router(move || {
        let probe = probe.clone();
        async move { probe.is_ready().await }
    }));

    serve(router, &config.server.bind_addr(), cancel).await?;

    sessions.shutdown();
    Ok(())
}
