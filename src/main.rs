//! Burrow node binary.
//!
//! Loads the config named by the first argument (or `BURROW_CONFIG`),
//! joins the cluster, serves health endpoints and runs until interrupted.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use burrow::cluster::MemoryNetwork;
use burrow::config::{Config, CONFIG_ENV};
use burrow::health::start_health_server;
use burrow::logging;
use burrow::node::Node;
use tokio_util::sync::CancellationToken;

fn config_path() -> Option<PathBuf> {
    std::env::args_os()
        .nth(1)
        .or_else(|| std::env::var_os(CONFIG_ENV))
        .map(PathBuf::from)
}

/// Join targets the in-process transport can never reach.
fn unreachable_join_targets(config: &Config) -> Option<&[String]> {
    let targets = config.cluster.join.as_slice();
    (!targets.is_empty()).then_some(targets)
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load(config_path().as_deref())?;
    // Reject a bad config before any listener opens.
    config.validate()?;

    logging::init(&config.log).context("failed to initialize logging")?;
    tracing::info!("burrow starting");

    let gossip_addr: SocketAddr = config
        .server
        .gossip_addr
        .parse()
        .context("invalid gossip addr")?;
    let health_addr: SocketAddr = config
        .server
        .health_addr
        .parse()
        .context("invalid health addr")?;

    // In-process transport; a network transport plugs in behind the same
    // trait.
    if let Some(targets) = unreachable_join_targets(&config) {
        tracing::warn!(
            targets = ?targets,
            abort_if_join_fails = config.cluster.abort_if_join_fails,
            timeout_seconds = config.cluster.join_timeout_seconds,
            "join targets configured but the gossip transport is in-process; \
             they cannot be reached and the join will wait out its timeout"
        );
    }
    let network = MemoryNetwork::new();
    let node_id = config.node_id();
    let transport = network.bind(gossip_addr, node_id.clone(), config.advertise_addr());
    let node = Arc::new(Node::new(config, node_id, Arc::new(transport))?);

    let cancel = CancellationToken::new();
    let health = tokio::spawn(start_health_server(
        health_addr,
        Arc::clone(&node),
        cancel.clone(),
    ));

    if let Err(e) = node.start().await {
        cancel.cancel();
        return Err(e).context("node failed to start");
    }

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("shutdown signal received");

    node.shutdown().await;
    cancel.cancel();
    match health.await {
        Ok(Err(e)) => tracing::warn!(error = %e, "health server failed"),
        Err(e) => tracing::warn!(error = %e, "health server task failed"),
        Ok(Ok(())) => {}
    }

    tracing::info!("burrow stopped");
    Ok(())
}
