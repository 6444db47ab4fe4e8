//! RIS mirror daemon
//!
//! Mirrors the RIBs of the configured routers from redundant upstream feeds
//! and exposes readiness and Prometheus metrics over HTTP.

use anyhow::{Context, Result};
use clap::Parser;
use rismirror::config::DEFAULT_CONFIG_PATH;
use rismirror::{FeedSource, JsonLinesSubscriber, MetricsCollector, MirrorConfig, RouterRegistry};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Mirror remote routers' RIBs from redundant streaming feeds
#[derive(Parser, Debug)]
#[command(name = "ris-mirror")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file
    #[arg(short = 'c', long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(short = 'l', long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level);

    info!(config = %args.config.display(), "ris-mirror starting");

    match run(args).await {
        Ok(()) => {
            info!("ris-mirror exiting normally");
            Ok(())
        }
        Err(e) => {
            error!(error = ?e, "ris-mirror exiting with error");
            Err(e)
        }
    }
}

fn init_logging(log_level: &str) {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).compact())
        .init();
}

async fn run(args: Args) -> Result<()> {
    let config = MirrorConfig::load_or_default(&args.config)?;
    config.validate().context("invalid configuration")?;

    let collector = if config.metrics.enabled {
        Some(MetricsCollector::new().context("failed to register metrics")?)
    } else {
        None
    };

    let registry = RouterRegistry::new(config.feed.clone());
    let registry = Arc::new(match &collector {
        Some(collector) => registry.with_metrics(collector.clone()),
        None => registry,
    });

    // One subscriber per endpoint, shared by every router it serves.
    let mut endpoints: HashMap<&str, FeedSource> = HashMap::new();
    for router in &config.routers {
        let sources: Vec<FeedSource> = router
            .sources
            .iter()
            .map(|endpoint| {
                endpoints
                    .entry(endpoint.as_str())
                    .or_insert_with(|| JsonLinesSubscriber::source(endpoint))
                    .clone()
            })
            .collect();

        registry
            .add_target(&router.name, router.address, &sources, &router.vrfs)
            .with_context(|| format!("failed to register router {}", router.name))?;
    }

    info!(
        routers = config.routers.len(),
        endpoints = endpoints.len(),
        "Mirroring configured routers"
    );

    let shutdown = CancellationToken::new();
    let server = match collector {
        Some(collector) => {
            let listener = TcpListener::bind(&config.metrics.listen)
                .await
                .with_context(|| format!("failed to bind metrics listener {}", config.metrics.listen))?;
            Some(tokio::spawn(rismirror::metrics_server::serve(
                listener,
                collector,
                Arc::clone(&registry),
                shutdown.clone(),
            )))
        }
        None => None,
    };

    signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("Received shutdown signal");

    shutdown.cancel();
    registry.shutdown().await;

    if let Some(server) = server {
        server
            .await
            .context("metrics server task failed")?
            .context("metrics server error")?;
    }

    info!("Graceful shutdown complete");
    Ok(())
}
