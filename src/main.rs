//! Nominee - Leader Election and Membership Sync
//!
//! Command line entry point: configuration checks and an in-memory
//! failover demo.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use nominee::config::NomineeConfig;
use nominee::coordination::{MemoryBackend, MemoryConnector};
use nominee::election::{Elector, Observer};
use nominee::lifecycle::Stonither;
use nominee::node::{DummyNode, Node, NodeSpec, Role};
use nominee::proxy::RoutingProxy;

/// How often the demo fences the current leader
const DEMO_FAILOVER_EVERY: Duration = Duration::from_secs(3);

/// First port handed to demo nodes
const DEMO_BASE_PORT: u16 = 5432;

/// Upper bound on `demo --nodes`
const MAX_DEMO_NODES: usize = 256;

/// Nominee - Leader Election and Membership Sync
#[derive(Parser)]
#[command(name = "nominee")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file (defaults to NOMINEE_* environment variables)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate configuration
    Validate,

    /// Show effective configuration
    Info,

    /// Run dummy nodes and an observer against the in-memory backend
    Demo {
        /// Number of dummy nodes
        #[arg(short, long, default_value_t = 3)]
        nodes: usize,

        /// How long to run
        #[arg(short, long, default_value_t = 10)]
        duration_secs: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match &cli.command {
        Commands::Demo { .. } if cli.config.is_none() => Ok(demo_config()),
        _ => load_config(cli.config.as_ref()),
    };

    // Initialize logging
    let (level, format) = match &config {
        Ok(c) => (c.logging.level.clone(), c.logging.format.clone()),
        Err(_) => ("info".to_string(), "text".to_string()),
    };
    init_logging(cli.log_level.as_deref().unwrap_or(&level), &format);

    match cli.command {
        Commands::Validate => run_validate(config),
        Commands::Info => run_info(config?),
        Commands::Demo { nodes, duration_secs } => {
            run_demo(config?, nodes, Duration::from_secs(duration_secs)).await
        }
    }
}

/// Load configuration from a file or the environment
fn load_config(path: Option<&PathBuf>) -> anyhow::Result<NomineeConfig> {
    match path {
        Some(path) => NomineeConfig::from_file(path)
            .with_context(|| format!("Failed to load configuration from {:?}", path)),
        None => NomineeConfig::from_env().context("Failed to load configuration from environment"),
    }
}

/// Initialize logging
fn init_logging(level: &str, format: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    let (json, pretty, text) = match format {
        "json" => (Some(tracing_subscriber::fmt::layer().json()), None, None),
        "pretty" => (None, Some(tracing_subscriber::fmt::layer().pretty()), None),
        _ => (None, None, Some(tracing_subscriber::fmt::layer())),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(json)
        .with(pretty)
        .with(text)
        .init();
}

/// Validate configuration
fn run_validate(config: anyhow::Result<NomineeConfig>) -> anyhow::Result<()> {
    match config {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!("  Election: {}", config.election_key());
            println!("  Endpoints: {}", config.backend.endpoints_display());
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {:#}", e);
            Err(e)
        }
    }
}

/// Show effective configuration
fn run_info(config: NomineeConfig) -> anyhow::Result<()> {
    let config = config.redacted();

    println!("Nominee Configuration");
    println!("=====================");
    println!();
    println!("Election:         {}", config.election_key());
    println!("  Domain:         {}", config.election.domain);
    println!("  Cluster:        {}", config.election.cluster);
    println!();
    println!("Backend:");
    println!("  Endpoints:      {}", config.backend.endpoints_display());
    println!("  Username:       {}", config.backend.username.as_deref().unwrap_or("(none)"));
    println!("  Password:       {}", config.backend.password.as_deref().unwrap_or("(none)"));
    println!("  Session TTL:    {} s", config.backend.session_ttl_secs);
    println!();
    println!("Reconnect:");
    println!("  Backoff:        {}..{} ms", config.reconnect.initial_backoff_ms, config.reconnect.max_backoff_ms);
    println!("  Max Retries:    {}", config.reconnect.max_retries);
    println!();
    println!("Observer:");
    println!("  Publish Every:  {} ms", config.observer.publish_interval_ms);
    println!();
    println!("Logging:          {} ({})", config.logging.level, config.logging.format);

    Ok(())
}

/// Configuration used by `demo` when none is given
fn demo_config() -> NomineeConfig {
    let mut config = NomineeConfig::default();
    config.election.domain = "dummy".into();
    config.election.cluster = "demo".into();
    config.backend.endpoints = vec!["memory".into()];
    config
}

struct DemoMember {
    node: Arc<DummyNode>,
    elector: Elector,
    connector: Arc<MemoryConnector>,
}

/// Run the in-memory failover demo
async fn run_demo(config: NomineeConfig, nodes: usize, duration: Duration) -> anyhow::Result<()> {
    anyhow::ensure!(nodes > 0, "demo needs at least one node");
    anyhow::ensure!(
        nodes <= MAX_DEMO_NODES,
        "demo supports at most {} nodes, got {}",
        MAX_DEMO_NODES,
        nodes
    );

    // Signals are handled once for the whole demo.
    let shutdown = Stonither::new();
    if config.lifecycle.handle_signals {
        shutdown.install_os_signals()?;
    }
    let mut config = config;
    config.lifecycle.handle_signals = false;

    let backend = MemoryBackend::new();
    tracing::info!("Starting demo with {} nodes on {}", nodes, config.election_key());

    let proxy = Arc::new(RoutingProxy::new("demo-router"));
    let observer = Observer::new(config.clone(), Arc::new(backend.connector()));
    observer
        .observe(proxy.clone())
        .await
        .context("Failed to start observer")?;

    let mut members = Vec::with_capacity(nodes);
    for i in 0..nodes {
        let node = demo_node(i)?;
        let connector = Arc::new(backend.connector());
        let elector = Elector::new(config.clone(), connector.clone());
        elector
            .run(node.clone())
            .await
            .with_context(|| format!("Failed to start elector for {}", node.spec()))?;
        members.push(DemoMember { node, elector, connector });
    }

    let deadline = tokio::time::sleep(duration);
    tokio::pin!(deadline);
    let mut failover = tokio::time::interval_at(
        tokio::time::Instant::now() + DEMO_FAILOVER_EVERY,
        DEMO_FAILOVER_EVERY,
    );
    let done = shutdown.done();

    loop {
        tokio::select! {
            _ = &mut deadline => break,
            _ = done.wait() => break,
            _ = failover.tick() => {
                print_routing(&proxy).await;
                fence_leader(&backend, &members).await;
            }
        }
    }

    for member in &members {
        member.elector.stonith();
        member.elector.cleanup().await;
    }
    // Let the observer publish the final state before stopping it.
    tokio::time::sleep(config.observer.publish_interval() * 2).await;
    observer.stonith();
    observer.cleanup().await;

    let summary = observer.summary().await;
    println!();
    println!("Demo finished");
    println!("  Leader:         {}", summary.leader.as_deref().unwrap_or("(none)"));
    println!("  Followers:      {}", summary.followers);
    println!("  Changes:        {} (published up to {})", summary.version, summary.published);
    print_routing(&proxy).await;

    Ok(())
}

/// Dummy node number `i`, listening on its own port
fn demo_node(i: usize) -> anyhow::Result<Arc<DummyNode>> {
    let port = u16::try_from(i)
        .ok()
        .and_then(|offset| DEMO_BASE_PORT.checked_add(offset))
        .with_context(|| format!("no port left for demo node at offset {}", i))?;
    let spec = NodeSpec::new(format!("dummy-{}", i + 1), "127.0.0.1", port);
    Ok(Arc::new(DummyNode::new(spec)))
}

/// Stop the current leader the way a crashed process would
async fn fence_leader(backend: &MemoryBackend, members: &[DemoMember]) {
    let mut alive = 0;
    let mut leader = None;
    for member in members {
        if member.elector.done().is_done() {
            continue;
        }
        alive += 1;
        if member.node.role().await == Role::Leader {
            leader = Some(member);
        }
    }

    let Some(member) = leader else {
        return;
    };
    if alive < 2 {
        tracing::info!("{} is the last node standing, not fencing", member.node.spec());
        return;
    }

    tracing::warn!("Fencing leader {}", member.node.spec());
    member.node.shutdown();
    if let Some(lease) = member.connector.lease_id() {
        backend.expire_session(lease);
    }
}

async fn print_routing(proxy: &RoutingProxy) {
    let stats = proxy.stats().await;
    println!("Routing:");
    println!("  Writes:         {}", stats.leader_endpoint.as_deref().unwrap_or("(none)"));
    println!("  Reads:          {:?}", stats.read_endpoints);
    println!("  Publishes:      {}", stats.publishes);
}
