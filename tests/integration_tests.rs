//! CoucheCache Integration Tests
//!
//! End-to-end scenarios across composed topologies:
//! - Sharded cluster round trips and node failure
//! - Gradual node warm-up on a live cluster
//! - Multiplexed reads over redundant clusters
//! - Layout migration through a write fan-out pair
//! - Topologies built from configuration

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio_test::assert_ok;

use couchecache::{
    CacheInstance, CacheItem, Error, FakeCache, LeafFactory, NodeOptions, Operation, RampState,
    RequestMultiplexer, Result, ShardedCluster, SharedInstance, TieredRedundantGroup,
    TopologyConfig, WriteFanoutPair,
};

// =============================================================================
// Helpers
// =============================================================================

fn fake_node(uri: &str, latency: Duration) -> Arc<FakeCache> {
    let node = Arc::new(FakeCache::with_uri(uri));
    node.set_latency(latency);
    node
}

fn keys(range: std::ops::RangeInclusive<usize>) -> Vec<String> {
    range.map(|i| format!("key{}", i)).collect()
}

fn items(keys: &[String]) -> Vec<CacheItem> {
    keys.iter()
        .map(|key| CacheItem::new(key.clone(), format!("value-{}", key)))
        .collect()
}

fn value_of(key: &str) -> Option<Bytes> {
    Some(Bytes::from(format!("value-{}", key)))
}

fn cluster_of(nodes: &[Arc<FakeCache>], capacity: usize) -> ShardedCluster {
    let cluster = ShardedCluster::new();
    for node in nodes {
        cluster
            .add_node(
                node.uri(),
                node.clone() as SharedInstance,
                NodeOptions {
                    capacity,
                    warm_up: None,
                },
            )
            .unwrap();
    }
    cluster
}

/// Hands out one shared fake per URI so layouts can overlap.
#[derive(Default)]
struct FakeLeafFactory {
    leaves: Mutex<HashMap<String, Arc<FakeCache>>>,
}

impl FakeLeafFactory {
    fn leaf(&self, uri: &str) -> Arc<FakeCache> {
        self.leaves
            .lock()
            .entry(uri.to_string())
            .or_insert_with(|| fake_node(uri, Duration::ZERO))
            .clone()
    }
}

impl LeafFactory for FakeLeafFactory {
    fn create(&self, uri: &str) -> Result<SharedInstance> {
        let leaf: SharedInstance = self.leaf(uri);
        Ok(leaf)
    }
}

// =============================================================================
// Sharded Cluster
// =============================================================================

mod cluster_tests {
    use super::*;

    #[tokio::test]
    async fn test_round_trip_then_node_failure() {
        let nodes: Vec<Arc<FakeCache>> = ["fake://a", "fake://b", "fake://c"]
            .iter()
            .map(|uri| fake_node(uri, Duration::ZERO))
            .collect();
        let cluster = cluster_of(&nodes, 40);
        assert_ok!(cluster.connect().await);

        let all = keys(1..=100);
        assert_ok!(cluster.mset(&items(&all), None, false).await);

        let values = assert_ok!(cluster.mget(&all).await);
        let expected: Vec<Option<Bytes>> = all.iter().map(|key| value_of(key)).collect();
        assert_eq!(values, expected);
        for node in &nodes {
            assert_eq!(node.request_counts().mget, 1);
        }

        nodes[1].set_failure_count(1);
        let error = cluster.mget(&all).await.unwrap_err();
        let partial = error.as_partial().expect("partial result");

        assert!(partial.is_complete_for(all.iter().map(String::as_str)));
        let owned_by_b: Vec<&String> = all
            .iter()
            .filter(|key| cluster.uris_by_key(key) == vec!["fake://b".to_string()])
            .collect();
        assert!(!owned_by_b.is_empty());
        assert_eq!(partial.errors().len(), owned_by_b.len());
        for key in owned_by_b {
            assert!(matches!(partial.errors()[key], Error::Backend { .. }));
        }
        for (key, value) in partial.data() {
            assert_eq!(value, &value_of(key));
        }

        // The failure was a one-off.
        assert_eq!(assert_ok!(cluster.mget(&all).await), expected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_node_warms_up_on_live_cluster() {
        let nodes: Vec<Arc<FakeCache>> = ["fake://a", "fake://b", "fake://c"]
            .iter()
            .map(|uri| fake_node(uri, Duration::ZERO))
            .collect();
        let cluster = cluster_of(&nodes, 40);
        assert_ok!(cluster.connect().await);

        let all = keys(1..=200);
        let before: Vec<Vec<String>> = all.iter().map(|key| cluster.uris_by_key(key)).collect();

        let d = fake_node("fake://d", Duration::ZERO);
        assert_ok!(d.connect().await);
        assert_ok!(cluster.add_node(
            "fake://d",
            d.clone(),
            NodeOptions {
                capacity: 40,
                warm_up: Some(Duration::from_millis(50)),
            },
        ));
        assert_eq!(cluster.ramp_state("fake://d"), Some(RampState::RampingUp));
        assert_eq!(cluster.ring_points("fake://d"), 0);

        tokio::time::sleep(Duration::from_millis(525)).await;
        assert_eq!(cluster.ring_points("fake://d"), 10);

        tokio::time::sleep(Duration::from_millis(2000)).await;
        assert_eq!(cluster.ring_points("fake://d"), 40);
        assert_eq!(cluster.ramp_state("fake://d"), Some(RampState::Idle));

        // Keys only ever move onto the new node.
        let mut moved = 0;
        for (key, old) in all.iter().zip(&before) {
            let now = cluster.uris_by_key(key);
            if &now != old {
                assert_eq!(now, vec!["fake://d".to_string()]);
                moved += 1;
            }
        }
        assert!(moved > 0);
    }
}

// =============================================================================
// Composed Topologies
// =============================================================================

mod composed_tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_multiplexed_reads_over_redundant_clusters() {
        let latency = Duration::from_millis(20);
        let hot: Vec<Arc<FakeCache>> = ["fake://hot-1", "fake://hot-2"]
            .iter()
            .map(|uri| fake_node(uri, latency))
            .collect();
        let cold: Vec<Arc<FakeCache>> = ["fake://cold-1", "fake://cold-2"]
            .iter()
            .map(|uri| fake_node(uri, latency))
            .collect();
        let hot_cluster = cluster_of(&hot, 40);
        let cold_cluster = cluster_of(&cold, 40);

        let group = TieredRedundantGroup::new();
        group.add(Arc::new(cold_cluster.clone()), 1);
        group.add(Arc::new(hot_cluster.clone()), 10);
        let group = Arc::new(group);
        let multiplexer = RequestMultiplexer::new(group.clone());
        assert_ok!(multiplexer.connect().await);
        assert!(multiplexer.is_available());

        let all = keys(1..=20);
        assert_ok!(cold_cluster.mset(&items(&all), None, false).await);
        assert_ok!(hot_cluster.mset(&items(&all[..10]), None, false).await);
        for node in hot.iter().chain(&cold) {
            node.reset_request_counts();
        }

        let (first, second, third) = tokio::join!(
            multiplexer.mget(&all),
            multiplexer.mget(&all),
            multiplexer.get("key15"),
        );

        let expected: Vec<Option<Bytes>> = all.iter().map(|key| value_of(key)).collect();
        assert_eq!(assert_ok!(first), expected);
        assert_eq!(assert_ok!(second), expected);
        assert_eq!(assert_ok!(third), value_of("key15"));

        let hot_mgets: usize = hot.iter().map(|node| node.request_counts().mget).sum();
        let cold_mgets: usize = cold.iter().map(|node| node.request_counts().mget).sum();
        assert!(hot_mgets <= 2);
        assert!(cold_mgets <= 2);
        assert_eq!(multiplexer.metrics().snapshot().delegate_fetches, 1);
        assert_eq!(group.metrics().calls(Operation::Mget), 1);
        assert_eq!(multiplexer.pending_count(), 0);

        // Writes through the stack reach every tier.
        assert_ok!(multiplexer.set("fresh", Bytes::from_static(b"new"), None, false).await);
        assert_eq!(
            assert_ok!(hot_cluster.get("fresh").await),
            Some(Bytes::from_static(b"new"))
        );
        assert_eq!(
            assert_ok!(cold_cluster.get("fresh").await),
            Some(Bytes::from_static(b"new"))
        );

        multiplexer.destroy().await;
        assert!(hot.iter().chain(&cold).all(|node| node.is_destroyed()));
    }

    #[tokio::test]
    async fn test_migration_writes_each_key_once_per_layout() {
        let a = fake_node("fake://a", Duration::ZERO);
        let b = fake_node("fake://b", Duration::ZERO);
        let c = fake_node("fake://c", Duration::ZERO);
        let d = fake_node("fake://d", Duration::ZERO);
        let old_layout = cluster_of(&[a.clone(), b.clone(), c.clone()], 40);
        let new_layout = cluster_of(&[a.clone(), b.clone(), c.clone(), d.clone()], 40);

        let pair = WriteFanoutPair::new(Arc::new(new_layout.clone()));
        pair.add_secondary(Arc::new(old_layout.clone()));
        assert_ok!(pair.connect().await);

        let all = keys(1..=100);
        assert_ok!(pair.mset(&items(&all), None, false).await);

        let relocated = all
            .iter()
            .filter(|key| new_layout.uris_by_key(key) != old_layout.uris_by_key(key))
            .count();
        assert!(relocated > 0);
        let stored: usize = [&a, &b, &c, &d].iter().map(|node| node.data().len()).sum();
        assert_eq!(stored, all.len() + relocated);

        let expected: Vec<Option<Bytes>> = all.iter().map(|key| value_of(key)).collect();
        assert_eq!(assert_ok!(old_layout.mget(&all).await), expected);
        assert_eq!(assert_ok!(new_layout.mget(&all).await), expected);
    }
}

// =============================================================================
// Configuration
// =============================================================================

mod config_tests {
    use super::*;

    const MIGRATION: &str = r#"
kind: fanout
primary:
  kind: cluster
  nodes:
    - uri: fake://a
      capacity: 40
    - uri: fake://b
      capacity: 40
    - uri: fake://d
      capacity: 40
secondaries:
  - kind: cluster
    nodes:
      - uri: fake://a
        capacity: 40
      - uri: fake://b
        capacity: 40
      - uri: fake://c
        capacity: 40
readFromSecondary:
  writeBackMaxAgeMs: 60000
"#;

    #[tokio::test]
    async fn test_configured_migration_reads_from_old_layout() {
        let factory = FakeLeafFactory::default();
        let config = assert_ok!(TopologyConfig::from_yaml_str(MIGRATION));
        let cache = assert_ok!(config.build(&factory));
        assert_ok!(cache.connect().await);

        // Only the old layout has been populated.
        let all = keys(1..=50);
        let old_only = ShardedCluster::new();
        for uri in ["fake://a", "fake://b", "fake://c"] {
            assert_ok!(old_only.add_node(
                uri,
                factory.leaf(uri),
                NodeOptions {
                    capacity: 40,
                    warm_up: None,
                },
            ));
        }
        assert_ok!(old_only.connect().await);
        assert_ok!(old_only.mset(&items(&all), None, false).await);

        let expected: Vec<Option<Bytes>> = all.iter().map(|key| value_of(key)).collect();
        assert_eq!(assert_ok!(cache.mget(&all).await), expected);

        // Misses were copied back into the new layout in the background.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let d = factory.leaf("fake://d");
        assert!(!d.data().is_empty());
        for (key, value) in d.data() {
            assert_eq!(Some(value), value_of(&key));
        }
    }

    #[tokio::test]
    async fn test_configured_fanout_exposes_both_layouts() {
        let factory = FakeLeafFactory::default();
        let config = assert_ok!(TopologyConfig::from_yaml_str(MIGRATION));
        let cache = assert_ok!(config.build(&factory));
        assert_ok!(cache.connect().await);

        for key in keys(1..=20) {
            let uris = cache.uris_by_key(&key);
            assert!(!uris.is_empty() && uris.len() <= 2);
        }

        cache.destroy().await;
        for uri in ["fake://a", "fake://b", "fake://c", "fake://d"] {
            assert!(factory.leaf(uri).is_destroyed());
        }
    }
}
