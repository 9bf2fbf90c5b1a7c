//! Consistent Hash Ring
//!
//! Maps keys to nodes through virtual points. A node with capacity `N` owns
//! exactly `N` points, named `"0:node" .. "{N-1}:node"` and hashed with SHA-1
//! (first eight bytes, big-endian).
//!
//! # Layout
//!
//! ```text
//!   0 ───────────────────────────────────────────────────────── u64::MAX
//!      ▲A0        ▲B1     ▲A1          ▲C0       ▲B0        ▲C1
//!            key ─┘ owned by B1 (smallest point hash >= key hash)
//!   keys past the last point wrap around to A0
//! ```
//!
//! Points live in an ordered set; a flat sorted index is rebuilt after every
//! capacity change and is what lookups binary-search.

#[cfg(test)]
mod proptest;

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use sha1::{Digest, Sha1};

/// A virtual position on the ring owned by one node.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct RingPoint {
    /// Position on the ring
    pub hash: u64,
    /// Owning node
    pub node: Arc<str>,
}

/// Hash a key (or a point name) onto the ring.
pub fn hash_key(key: &str) -> u64 {
    let digest = Sha1::digest(key.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(prefix)
}

fn point_name(node: &str, index: usize) -> String {
    format!("{}:{}", index, node)
}

/// Consistent hash ring with per-node point counts.
#[derive(Debug, Default, Clone)]
pub struct HashRing {
    /// All points, ordered by (hash, node)
    points: BTreeSet<RingPoint>,
    /// Sorted snapshot of `points` used for binary search
    index: Vec<RingPoint>,
    /// Current number of points per node
    counts: HashMap<String, usize>,
}

impl HashRing {
    /// Create an empty ring
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or remove points until `node` owns exactly `points` of them.
    pub fn set_node_capacity(&mut self, node: &str, points: usize) {
        let current = self.node_points(node);
        if current == points {
            return;
        }

        let owner: Arc<str> = Arc::from(node);
        if points < current {
            for idx in points..current {
                self.points.remove(&RingPoint {
                    hash: hash_key(&point_name(node, idx)),
                    node: owner.clone(),
                });
            }
        } else {
            for idx in current..points {
                self.points.insert(RingPoint {
                    hash: hash_key(&point_name(node, idx)),
                    node: owner.clone(),
                });
            }
        }

        if points == 0 {
            self.counts.remove(node);
        } else {
            self.counts.insert(node.to_string(), points);
        }
        self.index = self.points.iter().cloned().collect();
    }

    /// Number of points `node` currently owns
    pub fn node_points(&self, node: &str) -> usize {
        self.counts.get(node).copied().unwrap_or(0)
    }

    /// Total number of points on the ring
    pub fn len(&self) -> usize {
        self.index.len()
    }

    /// True if the ring has no points
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Nodes that own at least one point
    pub fn nodes(&self) -> impl Iterator<Item = &str> {
        self.counts.keys().map(String::as_str)
    }

    /// Sorted points, for inspection
    pub fn points(&self) -> &[RingPoint] {
        &self.index
    }

    /// Index of the point that owns `hash`, wrapping past the end.
    fn locate(&self, hash: u64) -> Option<usize> {
        if self.index.is_empty() {
            return None;
        }
        let pos = self.index.partition_point(|p| p.hash < hash);
        Some(if pos == self.index.len() { 0 } else { pos })
    }

    /// Node owning `key`, if the ring has any points.
    pub fn primary(&self, key: &str) -> Option<Arc<str>> {
        self.locate(hash_key(key))
            .map(|pos| self.index[pos].node.clone())
    }

    /// Up to `replicas` distinct nodes for `key`: the owner first, then the
    /// nodes met walking backward around the ring.
    pub fn lookup(&self, key: &str, replicas: usize) -> Vec<Arc<str>> {
        let Some(start) = self.locate(hash_key(key)) else {
            return Vec::new();
        };
        if replicas == 0 {
            return Vec::new();
        }

        let len = self.index.len();
        let mut nodes: Vec<Arc<str>> = Vec::with_capacity(replicas);
        for step in 0..len {
            let pos = (start + len - step) % len;
            let node = &self.index[pos].node;
            if !nodes.iter().any(|n| n == node) {
                nodes.push(node.clone());
                if nodes.len() == replicas {
                    break;
                }
            }
        }
        nodes
    }

    /// Owner of every key, in input order.
    ///
    /// Sorts the key hashes once and splits the sorted point index around
    /// them, instead of running one binary search per key. Same answers as
    /// calling [`primary`](Self::primary) for each key.
    pub fn lookup_many<K: AsRef<str>>(&self, keys: &[K]) -> Vec<Option<Arc<str>>> {
        if self.index.is_empty() {
            return vec![None; keys.len()];
        }

        let mut hashes: Vec<(u64, usize)> = keys
            .iter()
            .enumerate()
            .map(|(i, k)| (hash_key(k.as_ref()), i))
            .collect();
        hashes.sort_unstable();

        let mut positions = vec![0usize; keys.len()];
        self.resolve_sorted(&hashes, 0, self.index.len(), &mut positions);

        let len = self.index.len();
        positions
            .into_iter()
            .map(|pos| Some(self.index[if pos == len { 0 } else { pos }].node.clone()))
            .collect()
    }

    /// Resolve insertion positions for `sorted` hashes, all of which are known
    /// to land in `lo..=hi` of the point index.
    fn resolve_sorted(&self, sorted: &[(u64, usize)], lo: usize, hi: usize, out: &mut [usize]) {
        if sorted.is_empty() {
            return;
        }
        if lo == hi {
            for &(_, original) in sorted {
                out[original] = lo;
            }
            return;
        }

        let mid = sorted.len() / 2;
        let (hash, original) = sorted[mid];
        let pos = lo + self.index[lo..hi].partition_point(|p| p.hash < hash);
        out[original] = pos;

        self.resolve_sorted(&sorted[..mid], lo, pos, out);
        self.resolve_sorted(&sorted[mid + 1..], pos, hi, out);
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn ring_with(nodes: &[(&str, usize)]) -> HashRing {
        let mut ring = HashRing::new();
        for (node, points) in nodes {
            ring.set_node_capacity(node, *points);
        }
        ring
    }

    #[test]
    fn test_empty_ring_routes_nowhere() {
        let ring = HashRing::new();
        assert!(ring.is_empty());
        assert!(ring.primary("key").is_none());
        assert!(ring.lookup("key", 3).is_empty());
        assert_eq!(ring.lookup_many(&["a", "b"]), vec![None, None]);
    }

    #[test]
    fn test_capacity_changes_adjust_points() {
        let mut ring = ring_with(&[("a", 4), ("b", 2)]);
        assert_eq!(ring.node_points("a"), 4);
        assert_eq!(ring.node_points("b"), 2);
        assert_eq!(ring.len(), 6);

        ring.set_node_capacity("a", 1);
        assert_eq!(ring.node_points("a"), 1);
        assert_eq!(ring.len(), 3);

        ring.set_node_capacity("b", 0);
        assert_eq!(ring.node_points("b"), 0);
        assert_eq!(ring.nodes().collect::<Vec<_>>(), vec!["a"]);
        assert!(ring.points().iter().all(|p| &*p.node == "a"));
    }

    #[test]
    fn test_index_is_sorted() {
        let ring = ring_with(&[("a", 16), ("b", 16), ("c", 16)]);
        assert!(ring.points().windows(2).all(|w| w[0].hash <= w[1].hash));
    }

    #[test]
    fn test_lookup_is_ceiling_with_wraparound() {
        let ring = ring_with(&[("a", 8), ("b", 8)]);
        let first = ring.points()[0].clone();
        let last = ring.points()[ring.len() - 1].clone();

        assert_eq!(ring.locate(0), Some(0));
        assert_eq!(ring.locate(first.hash), Some(0));
        assert_eq!(ring.locate(last.hash), Some(ring.len() - 1));
        if last.hash < u64::MAX {
            assert_eq!(ring.locate(last.hash + 1), Some(0));
        }
    }

    #[test]
    fn test_primary_is_deterministic() {
        let ring = ring_with(&[("a", 4), ("b", 4), ("c", 4)]);
        for i in 0..100 {
            let key = format!("key{}", i);
            assert_eq!(ring.primary(&key), ring.primary(&key));
        }
    }

    #[test]
    fn test_replicas_are_distinct_and_start_at_owner() {
        let ring = ring_with(&[("a", 4), ("b", 4), ("c", 4)]);
        for i in 0..50 {
            let key = format!("key{}", i);
            let nodes = ring.lookup(&key, 2);
            assert_eq!(nodes.len(), 2);
            assert_ne!(nodes[0], nodes[1]);
            assert_eq!(Some(nodes[0].clone()), ring.primary(&key));
        }
    }

    #[test]
    fn test_replicas_capped_by_distinct_nodes() {
        let ring = ring_with(&[("a", 3), ("b", 5)]);
        let nodes = ring.lookup("some-key", 5);
        assert_eq!(nodes.len(), 2);
    }

    #[test]
    fn test_batch_lookup_matches_single_lookup() {
        let ring = ring_with(&[("a", 10), ("b", 7), ("c", 3)]);
        let keys: Vec<String> = (0..500).map(|i| format!("key{}", i)).collect();
        let batch = ring.lookup_many(&keys);
        for (key, owner) in keys.iter().zip(batch) {
            assert_eq!(owner, ring.primary(key));
        }
    }

    #[test]
    fn test_adding_capacity_only_moves_keys_to_new_node() {
        let mut ring = ring_with(&[("a", 8), ("b", 8)]);
        let keys: Vec<String> = (0..1000).map(|i| format!("key{}", i)).collect();
        let before = ring.lookup_many(&keys);

        ring.set_node_capacity("c", 8);
        let after = ring.lookup_many(&keys);

        for (old, new) in before.iter().zip(after.iter()) {
            if old != new {
                assert_eq!(new.as_deref(), Some("c"));
            }
        }
    }
}
