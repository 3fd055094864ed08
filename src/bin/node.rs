//! `threatmesh-node`: runs a single polling miner (or aggregator) node
//! standalone, with reference in-process table/interval stores and an
//! in-process bus, plus a health/metrics endpoint for operators.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use clap::Parser;
use prometheus::{Encoder, Registry, TextEncoder};
use tokio::sync::RwLock;
use tracing_subscriber::EnvFilter;

use threatmesh::aggregator::RangeAggregator;
use threatmesh::config::load_node_config;
use threatmesh::interval::InMemoryIntervalStore;
use threatmesh::monitor::NodeMetrics;
use threatmesh::node::{Node, RecordingBus};
use threatmesh::poller::PollerEngine;
use threatmesh::table::InMemoryIndicatorTable;
use threatmesh::taxii::PullFeedDriver;

#[derive(Parser, Debug)]
#[command(name = "threatmesh-node", about = "Run a threatmesh polling node")]
struct Cli {
    /// Path to the node's YAML configuration file.
    #[arg(long, env = "THREATMESH_CONFIG")]
    config: PathBuf,

    /// Address to bind the health/metrics HTTP endpoint on.
    #[arg(long, default_value = "0.0.0.0:9090", env = "THREATMESH_LISTEN")]
    listen: SocketAddr,
}

struct AppState {
    registry: Registry,
    engine: Arc<RwLock<dyn Node>>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).json().init();

    let cli = Cli::parse();
    let node_config = load_node_config(&cli.config)?;
    let config_dir = cli.config.parent().map(PathBuf::from).unwrap_or_else(|| PathBuf::from("."));

    let registry = Registry::new();
    let metrics = Arc::new(NodeMetrics::new(&registry, &node_config.name)?);

    let bus = Arc::new(RecordingBus::new());

    let engine: Arc<RwLock<dyn Node>> = if let Some(pull_driver_config) = node_config.pull_driver {
        let poller_config = node_config.miner.clone().into_poller_config(&node_config.name)?;
        let table = Arc::new(RwLock::new(InMemoryIndicatorTable::new()));
        let driver = PullFeedDriver::new(pull_driver_config.into_runtime_config(&node_config.name, &config_dir))?;
        let mut engine = PollerEngine::new(driver, poller_config, bus, table).with_metrics(metrics.clone());
        engine.configure()?;
        engine.initialize().await?;
        engine.start().await?;
        Arc::new(RwLock::new(engine))
    } else if let Some(aggregator_config) = node_config.aggregator {
        let interval_store = Box::new(InMemoryIntervalStore::new());
        let mut engine =
            RangeAggregator::new(aggregator_config.into_runtime_config(), bus, interval_store).with_metrics(metrics.clone());
        engine.configure()?;
        engine.initialize().await?;
        engine.start().await?;
        Arc::new(RwLock::new(engine))
    } else {
        return Err(Box::new(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "node config must specify either pull_driver or aggregator",
        )));
    };

    {
        let status = engine.read().await.mgmtbus_status();
        metrics.observe_status(&status);
    }

    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics_handler))
        .with_state(Arc::new(AppState { registry, engine: engine.clone() }));

    tracing::info!(addr = %cli.listen, "starting health/metrics endpoint");
    let listener = tokio::net::TcpListener::bind(cli.listen).await?;

    axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await?;

    tracing::info!("shutting down node");
    engine.write().await.stop().await?;

    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let status = state.engine.read().await.mgmtbus_status();
    axum::Json(serde_json::json!({
        "state": format!("{:?}", status.state),
        "last_run": status.last_run,
        "length": status.length,
    }))
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = state.registry.gather();
    let mut buffer = Vec::new();
    if let Err(err) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %err, "failed to encode metrics");
        return (axum::http::StatusCode::INTERNAL_SERVER_ERROR, String::new());
    }
    (axum::http::StatusCode::OK, String::from_utf8_lossy(&buffer).to_string())
}
