//! upstream-mux
//!
//! Drives a concurrent request load through the connection pool against the
//! in-process loopback upstream and prints the resulting stats.
//!
//! ```text
//!   requests ──▶ ConnectionPool ──▶ UpstreamConnection tasks ──▶ LoopbackPeer
//!      ▲               │                     │
//!      └── responses ──┴──── Stats ◀─────────┘
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use clap::Parser;
use http::Request;

use upstream_mux::config::loader::load_config;
use upstream_mux::config::{ClusterConfig, MuxConfig};
use upstream_mux::net::loopback::{LoopbackConnector, LoopbackSettings, RESPONSE_SIZE_HEADER};
use upstream_mux::observability::{logging, metrics};
use upstream_mux::{ConnectionPool, Stats, UpstreamResponse};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Parser)]
#[command(name = "upstream-mux")]
#[command(about = "Run a request load through the multiplexed upstream pool", long_about = None)]
struct Cli {
    /// TOML config file; defaults apply when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Cluster to send requests to (first configured cluster by default).
    #[arg(long)]
    cluster: Option<String>,

    #[arg(short = 'n', long, default_value_t = 100)]
    requests: usize,

    /// Request body size in bytes (0 sends header-only requests).
    #[arg(long, default_value_t = 0)]
    request_size: usize,

    #[arg(long, default_value_t = 1024)]
    response_size: usize,

    /// Concurrency limit the loopback peer announces.
    #[arg(long)]
    peer_max_streams: Option<u32>,
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => load_config(path)?,
        None => MuxConfig::default(),
    };
    if config.clusters.is_empty() {
        config.clusters.push(ClusterConfig {
            name: "loopback".into(),
            address: "loopback".into(),
        });
    }

    logging::init(&config.observability);

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let cluster = match cli.cluster.clone() {
        Some(cluster) => cluster,
        None => config
            .clusters
            .first()
            .map(|c| c.name.clone())
            .unwrap_or_default(),
    };

    tracing::info!(
        cluster = %cluster,
        requests = cli.requests,
        protocol = config.upstream.protocol.stats_root(),
        max_concurrent_streams = config.upstream.max_concurrent_streams,
        max_connections = config.upstream.max_connections_per_destination,
        "Configuration loaded"
    );

    let stats = Stats::new();
    let connector = Arc::new(LoopbackConnector::with_settings(LoopbackSettings {
        max_concurrent_streams: cli.peer_max_streams,
        ..LoopbackSettings::default()
    }));
    let pool = ConnectionPool::new(&config, connector, stats.clone());

    let started = Instant::now();
    let results = futures_util::future::join_all(
        (0..cli.requests).map(|_| run_request(&pool, &cluster, cli.request_size, cli.response_size)),
    )
    .await;

    let mut completed = 0;
    for result in &results {
        match result {
            Ok(response) if response.complete && response.reset.is_none() => completed += 1,
            Ok(response) => tracing::warn!(
                status = ?response.status,
                reset = ?response.reset,
                "Request did not complete"
            ),
            Err(e) => tracing::warn!(error = %e, "Request failed"),
        }
    }
    tracing::info!(
        requests = cli.requests,
        completed,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Load finished"
    );

    println!("{}", serde_json::to_string_pretty(&stats.snapshot())?);
    pool.shutdown();
    Ok(())
}

async fn run_request(
    pool: &ConnectionPool,
    cluster: &str,
    request_size: usize,
    response_size: usize,
) -> Result<UpstreamResponse, BoxError> {
    let request = Request::builder()
        .uri("/")
        .header(RESPONSE_SIZE_HEADER, response_size.to_string())
        .body(())?;
    let header_only = request_size == 0;

    let mut handle = pool.acquire_stream(cluster, request, header_only).await?;
    if !header_only {
        handle
            .send_data(Bytes::from(vec![b'r'; request_size]), true)
            .await?;
    }
    Ok(handle.collect().await)
}
