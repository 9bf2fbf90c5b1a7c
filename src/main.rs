//! CoucheCache Smoke Check
//!
//! Builds a cache topology from a YAML or JSON file, backs every leaf with an
//! in-process cache, and runs a write-then-read round trip through it.
//!
//! ```text
//! couchecache --config topology.yaml --keys 1000
//! ```

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use clap::Parser;
use tracing::{info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use couchecache::config::{ClusterConfig, NodeConfig};
use couchecache::{CacheItem, InMemoryLeafFactory, TopologyConfig};

// =============================================================================
// CLI Arguments
// =============================================================================

/// CoucheCache - exercise a cache topology end to end
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Topology file (.yaml, .yml or .json). Defaults to a three-node cluster.
    #[arg(long, env = "COUCHECACHE_CONFIG")]
    config: Option<PathBuf>,

    /// Number of keys to write and read back
    #[arg(long, env = "COUCHECACHE_KEYS", default_value = "100")]
    keys: usize,

    /// TTL of written keys in seconds
    #[arg(long, env = "COUCHECACHE_TTL_SECONDS", default_value = "60")]
    ttl_seconds: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    init_logging(&args);

    let topology = match &args.config {
        Some(path) => TopologyConfig::from_file(path)
            .with_context(|| format!("loading topology from {}", path.display()))?,
        None => default_topology(),
    };

    info!("Starting CoucheCache smoke check");
    info!("  Topology: {}", topology_name(&topology));
    info!("  Keys: {}", args.keys);
    info!("  TTL: {}s", args.ttl_seconds);

    let cache = topology
        .build(&InMemoryLeafFactory::default())
        .context("building topology")?;
    cache.connect().await.context("connecting topology")?;
    info!("Topology connected, available = {}", cache.is_available());

    let keys: Vec<String> = (0..args.keys).map(|i| format!("smoke:{}", i)).collect();
    let items: Vec<CacheItem> = keys
        .iter()
        .map(|key| CacheItem::new(key.clone(), Bytes::from(format!("value for {}", key))))
        .collect();
    let ttl = Some(Duration::from_secs(args.ttl_seconds));

    if let Err(e) = cache.mset(&items, ttl, false).await {
        match e.as_partial() {
            Some(partial) => warn!(
                "mset partially failed: {} keys written, {} keys failed",
                partial.data().len(),
                partial.errors().len()
            ),
            None => {
                cache.destroy().await;
                return Err(e).context("writing keys");
            }
        }
    }

    let hits = match cache.mget(&keys).await {
        Ok(values) => values.iter().filter(|v| v.is_some()).count(),
        Err(e) => match e.as_partial() {
            Some(partial) => {
                warn!(
                    "mget partially failed: {} keys read, {} keys failed",
                    partial.data().len(),
                    partial.errors().len()
                );
                partial.data().values().filter(|v| v.is_some()).count()
            }
            None => {
                cache.destroy().await;
                return Err(e).context("reading keys");
            }
        },
    };

    let ratio = if keys.is_empty() {
        0.0
    } else {
        hits as f64 / keys.len() as f64
    };
    info!("Read back {} of {} keys (hit ratio {:.3})", hits, keys.len(), ratio);

    cache.disconnect().await;
    cache.destroy().await;
    info!("Smoke check complete");
    Ok(())
}

/// Three in-memory nodes sharing the key space
fn default_topology() -> TopologyConfig {
    TopologyConfig::Cluster(ClusterConfig {
        nodes: (0..3)
            .map(|i| NodeConfig {
                uri: format!("memory://node-{}", i),
                capacity: 40,
                warm_up_ms: None,
                instance: None,
            })
            .collect(),
    })
}

fn topology_name(topology: &TopologyConfig) -> &'static str {
    match topology {
        TopologyConfig::Memory(_) => "memory",
        TopologyConfig::Leaf(_) => "leaf",
        TopologyConfig::Cluster(_) => "cluster",
        TopologyConfig::Redundant(_) => "redundant",
        TopologyConfig::Multiplexed(_) => "multiplexed",
        TopologyConfig::Fanout(_) => "fanout",
    }
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}
