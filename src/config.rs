//! Topology Configuration
//!
//! A cache topology is a tree of composed instances described in YAML or
//! JSON. Leaves that talk to real cache servers are created by a
//! caller-supplied [`LeafFactory`]; everything else is built here.
//!
//! ```yaml
//! kind: multiplexed
//! inner:
//!   kind: redundant
//!   tiers:
//!     - priority: 10
//!       instance:
//!         kind: cluster
//!         nodes:
//!           - uri: cache-a:11211
//!             capacity: 40
//!           - uri: cache-b:11211
//!             capacity: 40
//!             warmUpMs: 250
//!     - priority: 1
//!       instance:
//!         kind: memory
//! ```

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::backend::{InMemoryCache, InMemoryOptions};
use crate::cluster::{NodeOptions, ShardedCluster};
use crate::error::{Error, Result};
use crate::fanout::{WriteBackOptions, WriteFanoutPair};
use crate::instance::SharedInstance;
use crate::multiplex::RequestMultiplexer;
use crate::redundant::TieredRedundantGroup;

/// Creates the leaf instance for a node URI
pub trait LeafFactory: Send + Sync {
    fn create(&self, uri: &str) -> Result<SharedInstance>;
}

/// Backs every leaf URI with an in-process cache
#[derive(Debug, Clone, Default)]
pub struct InMemoryLeafFactory {
    pub options: InMemoryOptions,
}

impl LeafFactory for InMemoryLeafFactory {
    fn create(&self, uri: &str) -> Result<SharedInstance> {
        Ok(Arc::new(InMemoryCache::with_options(uri, self.options.clone())))
    }
}

/// One node of a topology tree
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum TopologyConfig {
    /// In-process cache
    Memory(MemoryConfig),
    /// Instance created by the [`LeafFactory`]
    Leaf(LeafConfig),
    /// Consistent-hash sharded cluster
    Cluster(ClusterConfig),
    /// Priority-ordered redundant tiers
    Redundant(RedundantConfig),
    /// Single-flight reads in front of another instance
    Multiplexed(MultiplexedConfig),
    /// Primary with write-through secondaries
    Fanout(FanoutConfig),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MemoryConfig {
    /// Reported URI. A unique `memory://` URI is generated when unset.
    #[serde(default)]
    pub uri: Option<String>,

    /// TTL applied to every write, replacing the caller's
    #[serde(default)]
    pub max_age_override_ms: Option<u64>,

    /// How often expired entries are purged
    #[serde(default = "default_reaper_interval_ms")]
    pub reaper_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LeafConfig {
    pub uri: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterConfig {
    pub nodes: Vec<NodeConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodeConfig {
    pub uri: String,

    /// Ring points
    #[serde(default = "default_capacity")]
    pub capacity: usize,

    /// Interval between single-point capacity steps
    #[serde(default)]
    pub warm_up_ms: Option<u64>,

    /// Node instance. Defaults to a leaf for `uri`.
    #[serde(default)]
    pub instance: Option<Box<TopologyConfig>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RedundantConfig {
    pub tiers: Vec<TierConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TierConfig {
    #[serde(default)]
    pub priority: i32,
    pub instance: TopologyConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MultiplexedConfig {
    pub inner: Box<TopologyConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FanoutConfig {
    pub primary: Box<TopologyConfig>,

    #[serde(default)]
    pub secondaries: Vec<TopologyConfig>,

    /// Serve primary misses from the secondaries when set
    #[serde(default)]
    pub read_from_secondary: Option<ReadFallbackConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReadFallbackConfig {
    /// TTL of values copied back to the primary
    #[serde(default)]
    pub write_back_max_age_ms: Option<u64>,
}

fn default_capacity() -> usize {
    1
}

fn default_reaper_interval_ms() -> u64 {
    InMemoryOptions::default().reaper_interval.as_millis() as u64
}

fn millis(ms: Option<u64>) -> Option<Duration> {
    ms.map(Duration::from_millis)
}

impl TopologyConfig {
    /// Parse a YAML document
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        serde_yaml::from_str(content)
            .map_err(|e| Error::Config(format!("invalid YAML topology: {}", e)))
    }

    /// Parse a JSON document
    pub fn from_json_str(content: &str) -> Result<Self> {
        serde_json::from_str(content)
            .map_err(|e| Error::Config(format!("invalid JSON topology: {}", e)))
    }

    /// Load from a `.yaml`, `.yml` or `.json` file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {}", path.display(), e)))?;

        match path.extension().and_then(|ext| ext.to_str()) {
            Some("yaml") | Some("yml") => Self::from_yaml_str(&content),
            Some("json") => Self::from_json_str(&content),
            _ => Err(Error::Config(format!(
                "unsupported topology file {}: expected .yaml, .yml or .json",
                path.display()
            ))),
        }
    }

    /// Build the instance tree. Nothing is connected yet.
    pub fn build(&self, factory: &dyn LeafFactory) -> Result<SharedInstance> {
        match self {
            TopologyConfig::Memory(config) => {
                if config.reaper_interval_ms == 0 {
                    return Err(Error::Config(
                        "memory instance needs a positive reaperIntervalMs".to_string(),
                    ));
                }
                let options = InMemoryOptions {
                    max_age_override: millis(config.max_age_override_ms),
                    reaper_interval: Duration::from_millis(config.reaper_interval_ms),
                };
                let cache = match &config.uri {
                    Some(uri) => InMemoryCache::with_options(uri.clone(), options),
                    None => InMemoryCache::with_options(
                        format!("memory://{}", uuid::Uuid::new_v4()),
                        options,
                    ),
                };
                Ok(Arc::new(cache))
            }

            TopologyConfig::Leaf(config) => factory.create(&config.uri),

            TopologyConfig::Cluster(config) => {
                if config.nodes.is_empty() {
                    return Err(Error::Config("cluster has no nodes".to_string()));
                }
                let cluster = ShardedCluster::new();
                for node in &config.nodes {
                    let instance = match &node.instance {
                        Some(inner) => inner.build(factory)?,
                        None => factory.create(&node.uri)?,
                    };
                    let options = NodeOptions {
                        capacity: node.capacity,
                        warm_up: millis(node.warm_up_ms),
                    };
                    cluster
                        .add_node(node.uri.clone(), instance, options)
                        .map_err(|e| Error::Config(format!("cluster node {}: {}", node.uri, e)))?;
                }
                debug!(nodes = config.nodes.len(), "Built cluster");
                Ok(Arc::new(cluster))
            }

            TopologyConfig::Redundant(config) => {
                if config.tiers.is_empty() {
                    return Err(Error::Config("redundant group has no tiers".to_string()));
                }
                let group = TieredRedundantGroup::new();
                for tier in &config.tiers {
                    group.add(tier.instance.build(factory)?, tier.priority);
                }
                Ok(Arc::new(group))
            }

            TopologyConfig::Multiplexed(config) => {
                Ok(Arc::new(RequestMultiplexer::new(config.inner.build(factory)?)))
            }

            TopologyConfig::Fanout(config) => {
                let pair = WriteFanoutPair::new(config.primary.build(factory)?);
                for secondary in &config.secondaries {
                    pair.add_secondary(secondary.build(factory)?);
                }
                if let Some(fallback) = &config.read_from_secondary {
                    pair.enable_read_from_secondary(WriteBackOptions {
                        max_age: millis(fallback.write_back_max_age_ms),
                    });
                }
                Ok(Arc::new(pair))
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
