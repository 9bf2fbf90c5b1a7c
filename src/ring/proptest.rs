//! Property-Based Tests for the Hash Ring
//!
//! # Test Properties
//!
//! 1. **Determinism**: a fixed ring maps a key to the same node every time
//! 2. **Capacity Conservation**: `set_node_capacity(n, k)` leaves exactly `k` points for `n`
//! 3. **Batch Equivalence**: `lookup_many` agrees with per-key `primary`
//! 4. **Replica Distinctness**: replica lists never repeat a node

#![cfg(test)]

use proptest::prelude::*;

use super::HashRing;

// =============================================================================
// Property Strategies
// =============================================================================

/// Up to six nodes with 0..40 points each.
fn capacities_strategy() -> impl Strategy<Value = Vec<usize>> {
    prop::collection::vec(0usize..40, 1..6)
}

fn keys_strategy() -> impl Strategy<Value = Vec<String>> {
    prop::collection::vec("[a-z0-9:]{1,16}", 0..200)
}

fn build_ring(capacities: &[usize]) -> HashRing {
    let mut ring = HashRing::new();
    for (i, points) in capacities.iter().enumerate() {
        ring.set_node_capacity(&format!("node-{}", i), *points);
    }
    ring
}

// =============================================================================
// Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_lookup_is_deterministic(capacities in capacities_strategy(), keys in keys_strategy()) {
        let ring = build_ring(&capacities);
        for key in &keys {
            prop_assert_eq!(ring.primary(key), ring.primary(key));
        }
    }

    #[test]
    fn prop_capacity_is_conserved(
        capacities in capacities_strategy(),
        changes in prop::collection::vec((0usize..6, 0usize..40), 0..20),
    ) {
        let mut ring = build_ring(&capacities);
        let mut expected: Vec<usize> = capacities.clone();
        expected.resize(6, 0);

        for (node, points) in changes {
            ring.set_node_capacity(&format!("node-{}", node), points);
            expected[node] = points;
        }

        for (i, points) in expected.iter().enumerate() {
            let name = format!("node-{}", i);
            prop_assert_eq!(ring.node_points(&name), *points);
            prop_assert_eq!(
                ring.points().iter().filter(|p| *p.node == *name).count(),
                *points
            );
        }
        prop_assert_eq!(ring.len(), expected.iter().sum::<usize>());
    }

    #[test]
    fn prop_batch_lookup_matches_per_key(capacities in capacities_strategy(), keys in keys_strategy()) {
        let ring = build_ring(&capacities);
        let batch = ring.lookup_many(&keys);
        prop_assert_eq!(batch.len(), keys.len());
        for (key, owner) in keys.iter().zip(batch) {
            prop_assert_eq!(owner, ring.primary(key));
        }
    }

    #[test]
    fn prop_replicas_are_distinct(
        capacities in capacities_strategy(),
        keys in keys_strategy(),
        replicas in 1usize..8,
    ) {
        let ring = build_ring(&capacities);
        let live_nodes = capacities.iter().filter(|c| **c > 0).count();

        for key in &keys {
            let nodes = ring.lookup(key, replicas);
            prop_assert_eq!(nodes.len(), replicas.min(live_nodes));

            let mut deduped = nodes.clone();
            deduped.sort();
            deduped.dedup();
            prop_assert_eq!(deduped.len(), nodes.len());
            if let Some(first) = nodes.first() {
                prop_assert_eq!(Some(first.clone()), ring.primary(key));
            }
        }
    }
}
