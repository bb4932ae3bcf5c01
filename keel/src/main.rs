#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

mod config;
mod health;
mod runtime;
mod services;

use clap::Parser;
use kel_cluster::{main_queue, Controller, Message, OutputBus, TokioTimers};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "keel")]
#[command(about = "KEEL - replicated, leader-based event-log database node")]
#[command(version)]
pub struct Args {
    /// Unique node identifier within the cluster (0-65535)
    #[arg(short, long, default_value = "0")]
    instance_id: u16,

    /// Number of nodes in the cluster
    #[arg(short, long, default_value = "1")]
    cluster_size: usize,

    /// Client HTTP endpoint
    #[arg(long, default_value = "0.0.0.0:2113")]
    http: SocketAddr,

    /// Health check endpoint
    #[arg(long, default_value = "0.0.0.0:8080")]
    health: SocketAddr,

    /// External client TCP endpoint
    #[arg(long)]
    external_tcp: Option<SocketAddr>,

    /// External client TCP endpoint with TLS
    #[arg(long)]
    external_secure_tcp: Option<SocketAddr>,

    /// Internal node-to-node endpoint
    #[arg(long, default_value = "0.0.0.0:1112")]
    internal_tcp: SocketAddr,

    /// Run as a read-only replica (never participates in elections)
    #[arg(long)]
    read_only: bool,

    #[arg(short, long, default_value = "./data")]
    data_dir: PathBuf,

    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long, value_name = "PATH")]
    gen_config: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    if let Some(path) = &args.gen_config {
        if let Err(e) = generate_config(path) {
            eprintln!("Failed to generate config: {e}");
            std::process::exit(1);
        }
        println!("Generated default config at: {}", path.display());
        return;
    }

    init_tracing();

    let config = match &args.config {
        Some(path) => match config::Config::from_file(path) {
            Ok(c) => c,
            Err(e) => {
                error!(
                    target: "keel",
                    error = %e,
                    path = %path.display(),
                    "Failed to load config file"
                );
                std::process::exit(1);
            },
        },
        None => config::Config::from_args(&args),
    };

    if let Err(e) = config.validate() {
        error!(target: "keel", error = %e, "Invalid configuration");
        std::process::exit(1);
    }

    info!(
        target: "keel",
        version = env!("CARGO_PKG_VERSION"),
        instance = config.instance_id,
        cluster_size = config.cluster_size,
        read_only = config.read_only_replica,
        http = %config.http_addr,
        health = %config.health_addr,
        data_dir = %config.data_dir.display(),
        "Starting KEEL node"
    );

    if let Err(e) = std::fs::create_dir_all(&config.data_dir) {
        error!(target: "keel", error = %e, "Failed to create data directory");
        std::process::exit(1);
    }

    let (queue, queue_rx) = main_queue();
    let output = OutputBus::new(512);

    // Health endpoints, driven by controller output.
    let health_state = Arc::new(health::HealthState::new());
    tokio::spawn(health::watch_bus(
        Arc::clone(&health_state),
        output.subscribe(),
    ));
    let health_addr = config.health_addr;
    tokio::spawn(async move {
        if let Err(e) = health::run_health_server(health_addr, health_state).await {
            error!(target: "keel::health", error = %e, "Health server failed");
        }
    });

    // In-process stand-ins for the node's subordinate services.
    let harness = services::ServiceHarness::new(
        config.node_info(),
        config.internal_tcp_addr,
        config.cluster_size,
        queue.clone(),
    );
    tokio::spawn(harness.run(output.subscribe()));

    // Signals request an orderly shutdown through the controller.
    tokio::spawn(shutdown_on_signal(queue.clone()));

    let controller = Controller::new(
        config.controller_options(),
        output,
        queue.clone(),
        Arc::new(TokioTimers::new(queue.clone())),
        Arc::new(runtime::ProcessRuntime::new(config.data_dir.clone())),
    );

    queue.publish(Message::SystemInit);
    controller.run(queue_rx).await;

    info!(target: "keel", "KEEL node stopped");
}

#[cfg(unix)]
async fn shutdown_on_signal(queue: kel_cluster::MainQueue) {
    use tokio::signal::unix::{signal, SignalKind};

    let (Ok(mut sigterm), Ok(mut sigint)) = (
        signal(SignalKind::terminate()),
        signal(SignalKind::interrupt()),
    ) else {
        error!(target: "keel", "Failed to install signal handlers");
        return;
    };

    tokio::select! {
        _ = sigterm.recv() => {
            info!(target: "keel", "SIGTERM received, requesting shutdown");
        }
        _ = sigint.recv() => {
            info!(target: "keel", "SIGINT received, requesting shutdown");
        }
    }

    queue.publish(Message::RequestShutdown {
        exit_process: false,
        shutdown_http: true,
    });
}

#[cfg(not(unix))]
async fn shutdown_on_signal(queue: kel_cluster::MainQueue) {
    if tokio::signal::ctrl_c().await.is_err() {
        error!(target: "keel", "Failed to listen for Ctrl+C");
        return;
    }
    info!(target: "keel", "Ctrl+C received, requesting shutdown");
    queue.publish(Message::RequestShutdown {
        exit_process: false,
        shutdown_http: true,
    });
}

fn init_tracing() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,keel=debug"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(filter)
        .init();
}

fn generate_config(path: &Path) -> std::io::Result<()> {
    let config = config::Config::default();

    let content = format!(
        r#"# KEEL Configuration File
# Generated by: keel --gen-config {}
#
# All values shown are defaults. Uncomment and modify as needed.

# Unique node identifier within the cluster (0-65535)
instance_id = {}

# Number of nodes in the cluster. A single-node cluster skips leader
# discovery and elects itself.
cluster_size = {}

# Client HTTP endpoint
http_addr = "{}"

# Health check endpoints (/health/live, /health/ready, /health/startup)
health_addr = "{}"

# Internal node-to-node endpoint, advertised to peers via gossip
internal_tcp_addr = "{}"

# External client TCP endpoints (plain and TLS)
# external_tcp_addr = "0.0.0.0:1113"
# external_secure_tcp_addr = "0.0.0.0:1114"

# Run as a read-only replica (never participates in elections)
read_only_replica = {}

# Plugin subsystems expected to report in before the node is ready
subsystems = []

# Write path timeouts; forwarded writes allow prepare + commit + 300ms
prepare_timeout_ms = {}
commit_timeout_ms = {}

# Directory for the event log
data_dir = "{}"
"#,
        path.display(),
        config.instance_id,
        config.cluster_size,
        config.http_addr,
        config.health_addr,
        config.internal_tcp_addr,
        config.read_only_replica,
        config.prepare_timeout_ms,
        config.commit_timeout_ms,
        config.data_dir.display(),
    );

    std::fs::write(path, content)
}
