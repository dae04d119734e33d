//! leaderwatch -- leader fault detection node.
//!
//! Serves the leader ping protocol over HTTP, discovers the configured peers
//! by handshake, and on a follower pings the configured leader until it
//! fails.  SIGTERM/SIGINT stop accepting connections, then detection is shut
//! down and the scheduler refuses further work.

use std::future::IntoFuture;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::info;

use leaderwatch::cluster::discovery::{ForgetFailedLeader, PeerDiscovery};
use leaderwatch::cluster::leader_fd::LeaderFaultDetection;
use leaderwatch::cluster::node::{ClusterName, DiscoveryNode};
use leaderwatch::cluster::ping_handler::LeaderPingValidator;
use leaderwatch::cluster::scheduler::TokioScheduler;
use leaderwatch::cluster::state::{ClusterState, ClusterStateService};
use leaderwatch::cluster::transport::HttpTransport;
use leaderwatch::config::LoggingConfig;

/// Command-line arguments for the leaderwatch node.
#[derive(Parser, Debug)]
#[command(
    name = "leaderwatch",
    version,
    about = "Leader fault detection for cluster membership"
)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "leaderwatch.example.yaml")]
    config: String,

    /// Override the bind address (host:port).
    #[arg(short, long)]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = leaderwatch::config::load_config(&cli.config)?;
    init_tracing(&config.logging);
    info!("Loaded configuration from {}", cli.config);
    config.validate()?;

    let bind_addr = cli
        .bind
        .unwrap_or_else(|| format!("{}:{}", config.server.host, config.server.port));

    if config.observability.metrics {
        leaderwatch::metrics::init_metrics()?;
        leaderwatch::metrics::describe_metrics();
        info!("Prometheus metrics initialized");
    }

    let cluster_name = ClusterName::new(config.cluster.name.clone());
    let local_node = DiscoveryNode::new(config.cluster.node_id.clone(), config.advertise_address());
    info!("Starting node {} in cluster [{}]", local_node, cluster_name);

    let cluster_state = ClusterStateService::start(
        ClusterState::new(cluster_name.clone(), local_node.clone())
            .with_leader(config.cluster.leader_id.clone()),
    );
    let transport = Arc::new(HttpTransport::new(config.cluster.connect_timeout())?);
    let scheduler = Arc::new(TokioScheduler::current());

    let detector = Arc::new(LeaderFaultDetection::new(
        config.fault_detection.clone(),
        cluster_name.clone(),
        cluster_state.clone(),
        transport.clone(),
        scheduler.clone(),
    ));
    detector.add_listener(Arc::new(ForgetFailedLeader::new(cluster_state.clone())));

    let discovery = PeerDiscovery::new(
        &config.cluster,
        transport,
        cluster_state.clone(),
        cluster_state.clone(),
        Arc::clone(&detector),
    );
    let discovery_task = tokio::spawn(async move { discovery.run().await });

    let state = Arc::new(leaderwatch::AppState {
        local_node,
        validator: LeaderPingValidator::new(cluster_name, cluster_state.clone(), cluster_state),
    });
    let app = leaderwatch::server::app(state);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("leaderwatch listening on {}", bind_addr);

    let shutdown_timeout = Duration::from_secs(config.server.shutdown_timeout);
    let server = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal());
    let mut server = std::pin::pin!(server.into_future());
    tokio::select! {
        result = &mut server => result?,
        _ = async {
            shutdown_signal().await;
            tokio::time::sleep(shutdown_timeout).await;
        } => {
            tracing::warn!("Graceful shutdown timed out after {:?}", shutdown_timeout);
        }
    }

    discovery_task.abort();
    detector.shutdown();
    scheduler.close();
    info!("leaderwatch shut down");

    Ok(())
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if logging.format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to listen for Ctrl+C: {}", err);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::error!("failed to install SIGTERM handler: {}", err);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received SIGINT, shutting down");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, shutting down");
        },
    }
}
