//! CoucheCache - Composable Client-Side Cache Routing
//!
//! Routes cache reads and writes across many cache servers. Every building
//! block implements the same [`CacheInstance`] trait, so blocks nest freely:
//! a redundant group of sharded clusters, a multiplexer in front of a
//! migration pair, and so on.
//!
//! # Architecture
//!
//! ```text
//!                 ┌────────────────────┐
//!    caller ────▶ │ RequestMultiplexer │  one in-flight read per key
//!                 └─────────┬──────────┘
//!                 ┌─────────▼────────────┐
//!                 │ TieredRedundantGroup │  priority reads, write to all
//!                 └───┬──────────────┬───┘
//!          ┌──────────▼─────┐  ┌─────▼───────────┐
//!          │ ShardedCluster │  │ WriteFanoutPair │  old + new layout
//!          └──┬─────┬─────┬─┘  └─────────────────┘
//!           leaf  leaf  leaf
//! ```
//!
//! Batched operations that fail on some destinations return
//! [`PartialResultError`] with per-key outcomes; nested partial results are
//! always flattened.
//!
//! # Modules
//!
//! - [`instance`] - The `CacheInstance` trait shared by every component
//! - [`ring`] - Consistent hash ring
//! - [`cluster`] - Sharded cluster with gradual capacity changes
//! - [`redundant`] - Priority-ordered redundant tiers
//! - [`multiplex`] - Single-flight read coalescing
//! - [`fanout`] - Primary with write-through secondaries
//! - [`backend`] - In-process and fake leaf instances
//! - [`config`] - YAML/JSON topology configuration
//! - [`metrics`] - Per-component counters
//! - [`error`] - Error types

pub mod backend;
pub mod cluster;
pub mod config;
pub mod error;
pub mod fanout;
pub mod instance;
pub mod metrics;
pub mod multiplex;
pub mod redundant;
pub mod ring;

// Re-export commonly used types
pub use backend::{FakeCache, InMemoryCache, InMemoryOptions};
pub use cluster::{NodeCapacity, NodeOptions, RampState, ShardedCluster};
pub use config::{InMemoryLeafFactory, LeafFactory, TopologyConfig};
pub use error::{Error, PartialResultError, Result};
pub use fanout::{WriteBackOptions, WriteFanoutPair};
pub use instance::{CacheInstance, CacheItem, SharedInstance};
pub use metrics::{CacheMetrics, MetricsSnapshot, Operation};
pub use multiplex::RequestMultiplexer;
pub use redundant::TieredRedundantGroup;
pub use ring::HashRing;
