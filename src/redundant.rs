//! Tiered Redundant Group
//!
//! Several instances holding the same data, tried in priority order for
//! reads and all written to.
//!
//! Reads go to the highest-priority available tier first. Keys it misses are
//! asked of the next available tier, and only those keys, so each tier is
//! queried at most once per batch whatever the pattern of misses. Writes go
//! to every available tier concurrently.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::{join_all, BoxFuture, FutureExt};
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::error::{Error, PartialResultBuilder, Result};
use crate::instance::{extend_unique, CacheInstance, CacheItem, SharedInstance};
use crate::metrics::{CacheMetrics, Operation};

struct Tier {
    instance: SharedInstance,
    priority: i32,
}

/// Instances ordered by descending priority; equal priorities keep insertion order
#[derive(Default)]
pub struct TieredRedundantGroup {
    tiers: RwLock<Vec<Tier>>,
    metrics: CacheMetrics,
}

impl TieredRedundantGroup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a tier. Higher `priority` is read first.
    pub fn add(&self, instance: SharedInstance, priority: i32) {
        let mut tiers = self.tiers.write();
        tiers.push(Tier { instance, priority });
        tiers.sort_by(|a, b| b.priority.cmp(&a.priority));
        debug!(priority, tiers = tiers.len(), "Added redundant tier");
    }

    pub fn tier_count(&self) -> usize {
        self.tiers.read().len()
    }

    pub fn metrics(&self) -> &CacheMetrics {
        &self.metrics
    }

    /// Tiers in read order
    fn ordered(&self) -> Vec<SharedInstance> {
        self.tiers
            .read()
            .iter()
            .map(|tier| tier.instance.clone())
            .collect()
    }

    fn available(&self) -> Vec<SharedInstance> {
        self.ordered()
            .into_iter()
            .filter(|instance| instance.is_available())
            .collect()
    }

    async fn write_to_available<F, Fut>(&self, op: Operation, keys: usize, write: F) -> Result<()>
    where
        F: Fn(SharedInstance) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        self.metrics.record_call(op);
        let results = join_all(self.available().into_iter().map(write)).await;
        match results.into_iter().find_map(|result| result.err()) {
            Some(error) => {
                self.metrics.record_failed_keys(op, keys);
                warn!(op = %op, error = %error, "Redundant write failed on a tier");
                Err(error)
            }
            None => Ok(()),
        }
    }
}

fn next_available(tiers: &[SharedInstance], start: usize) -> Option<usize> {
    (start..tiers.len()).find(|&index| tiers[index].is_available())
}

async fn get_from(tiers: &[SharedInstance], key: &str) -> Result<Option<Bytes>> {
    let mut start = 0;
    while let Some(index) = next_available(tiers, start) {
        if let Some(value) = tiers[index].get(key).await? {
            return Ok(Some(value));
        }
        start = index + 1;
    }
    Ok(None)
}

/// Ask the first available tier at or after `start` for `keys`, then the
/// remaining tiers for whatever it missed.
fn mget_from(
    tiers: &[SharedInstance],
    keys: Vec<String>,
    start: usize,
) -> BoxFuture<'_, Result<Vec<Option<Bytes>>>> {
    async move {
        let Some(index) = next_available(tiers, start) else {
            return Ok(vec![None; keys.len()]);
        };

        let mut values = tiers[index].mget(&keys).await?;
        if values.len() != keys.len() {
            return Err(Error::Internal(format!(
                "tier {} returned {} values for {} keys",
                index,
                values.len(),
                keys.len()
            )));
        }

        let holes: Vec<usize> = values
            .iter()
            .enumerate()
            .filter_map(|(i, value)| value.is_none().then_some(i))
            .collect();
        if holes.is_empty() || next_available(tiers, index + 1).is_none() {
            return Ok(values);
        }

        let hole_keys: Vec<String> = holes.iter().map(|&i| keys[i].clone()).collect();
        debug!(tier = index, holes = holes.len(), "Filling misses from lower tiers");

        match mget_from(tiers, hole_keys.clone(), index + 1).await {
            Ok(found) => {
                for (&i, value) in holes.iter().zip(found) {
                    values[i] = value;
                }
                Ok(values)
            }
            Err(error) => {
                let hits = keys.len() - holes.len();
                if hits == 0 && !error.is_partial() {
                    return Err(error);
                }
                let mut outcome = PartialResultBuilder::new();
                for (key, value) in keys.iter().zip(&values) {
                    if value.is_some() {
                        outcome.succeed(key, value.clone());
                    }
                }
                outcome.fail(hole_keys.iter().map(String::as_str), &error);
                Err(outcome.build().into())
            }
        }
    }
    .boxed()
}

#[async_trait]
impl CacheInstance for TieredRedundantGroup {
    fn is_available(&self) -> bool {
        self.tiers.read().iter().any(|tier| tier.instance.is_available())
    }

    async fn connect(&self) -> Result<()> {
        let pending: Vec<SharedInstance> = self
            .ordered()
            .into_iter()
            .filter(|instance| !instance.is_available())
            .collect();
        for result in join_all(pending.iter().map(|instance| instance.connect())).await {
            if let Err(error) = result {
                warn!(error = %error, "Failed to connect redundant tier");
            }
        }
        info!(tiers = self.tier_count(), "Redundant group connected");
        Ok(())
    }

    async fn disconnect(&self) {
        let tiers = self.ordered();
        join_all(tiers.iter().map(|instance| instance.disconnect())).await;
        info!(tiers = tiers.len(), "Redundant group disconnected");
    }

    async fn destroy(&self) {
        let tiers: Vec<Tier> = std::mem::take(&mut *self.tiers.write());
        join_all(tiers.iter().map(|tier| tier.instance.destroy())).await;
        info!(tiers = tiers.len(), "Redundant group destroyed");
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        self.metrics.record_call(Operation::Get);
        let tiers = self.ordered();
        let value = get_from(&tiers, key).await.inspect_err(|_| {
            self.metrics.record_failed_keys(Operation::Get, 1);
        })?;
        self.metrics.record_reads(std::slice::from_ref(&value));
        Ok(value)
    }

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<Bytes>>> {
        self.metrics.record_call(Operation::Mget);
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let tiers = self.ordered();
        match mget_from(&tiers, keys.to_vec(), 0).await {
            Ok(values) => {
                self.metrics.record_reads(&values);
                Ok(values)
            }
            Err(error) => {
                let failed = error.as_partial().map_or(keys.len(), |p| p.errors().len());
                self.metrics.record_failed_keys(Operation::Mget, failed);
                Err(error)
            }
        }
    }

    async fn set(
        &self,
        key: &str,
        value: Bytes,
        max_age: Option<Duration>,
        set_if_absent: bool,
    ) -> Result<()> {
        self.write_to_available(Operation::Set, 1, |tier| {
            let value = value.clone();
            async move { tier.set(key, value, max_age, set_if_absent).await }
        })
        .await
    }

    async fn mset(
        &self,
        items: &[CacheItem],
        max_age: Option<Duration>,
        set_if_absent: bool,
    ) -> Result<()> {
        self.write_to_available(Operation::Mset, items.len(), |tier| async move {
            tier.mset(items, max_age, set_if_absent).await
        })
        .await
    }

    async fn del(&self, key: &str) -> Result<()> {
        self.write_to_available(Operation::Del, 1, |tier| async move { tier.del(key).await })
            .await
    }

    fn uris_by_key(&self, key: &str) -> Vec<String> {
        let mut uris = Vec::new();
        for instance in self.ordered() {
            extend_unique(&mut uris, instance.uris_by_key(key));
        }
        uris
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{FakeCache, InMemoryCache};
    use crate::error::PartialResultError;
    use assert_matches::assert_matches;
    use proptest::prelude::*;
    use std::collections::HashMap;
    use std::sync::Arc;

    fn fake_tier(uri: &str) -> Arc<FakeCache> {
        let tier = Arc::new(FakeCache::with_uri(uri));
        tier.set_latency(Duration::ZERO);
        tier
    }

    fn group_of(tiers: &[(Arc<FakeCache>, i32)]) -> TieredRedundantGroup {
        let group = TieredRedundantGroup::new();
        for (tier, priority) in tiers {
            group.add(tier.clone(), *priority);
        }
        group
    }

    fn keys(list: &[&str]) -> Vec<String> {
        list.iter().map(|k| k.to_string()).collect()
    }

    fn bytes(v: &str) -> Option<Bytes> {
        Some(Bytes::copy_from_slice(v.as_bytes()))
    }

    #[tokio::test]
    async fn test_reads_follow_priority() {
        let low = fake_tier("fake://low");
        let high = fake_tier("fake://high");
        let group = group_of(&[(low.clone(), 1), (high.clone(), 10)]);

        low.set_sync("k", "low");
        high.set_sync("k", "high");
        low.set_sync("only-low", "low");

        assert_eq!(group.get("k").await.unwrap(), bytes("high"));
        assert_eq!(group.get("only-low").await.unwrap(), bytes("low"));
        assert_eq!(group.get("nowhere").await.unwrap(), None);
        assert_eq!(low.request_counts().get, 2);
    }

    #[tokio::test]
    async fn test_mget_asks_lower_tiers_only_for_misses() {
        let first = fake_tier("fake://1");
        let second = fake_tier("fake://2");
        let third = fake_tier("fake://3");
        let group = group_of(&[(first.clone(), 3), (second.clone(), 2), (third.clone(), 1)]);

        first.set_sync("k0", "1");
        first.set_sync("k2", "1");
        first.set_sync("k4", "1");
        second.set_sync("k1", "2");
        second.set_sync("k3", "2");
        third.set_sync("k5", "3");

        let query = keys(&["k0", "k1", "k2", "k3", "k4", "k5", "k6"]);
        let values = group.mget(&query).await.unwrap();
        assert_eq!(
            values,
            vec![
                bytes("1"),
                bytes("2"),
                bytes("1"),
                bytes("2"),
                bytes("1"),
                bytes("3"),
                None
            ]
        );

        assert_eq!(first.request_counts().mget_item_counts, vec![7]);
        assert_eq!(second.request_counts().mget_item_counts, vec![4]);
        assert_eq!(third.request_counts().mget_item_counts, vec![2]);
    }

    #[tokio::test]
    async fn test_unavailable_tiers_are_skipped() {
        let first = fake_tier("fake://1");
        let second = fake_tier("fake://2");
        let group = group_of(&[(first.clone(), 2), (second.clone(), 1)]);
        second.set_sync("k", "2");
        first.set_available(false);

        assert_eq!(group.get("k").await.unwrap(), bytes("2"));
        assert_eq!(first.request_counts().total(), 0);

        second.set_available(false);
        assert!(!group.is_available());
        assert_eq!(group.get("k").await.unwrap(), None);
        assert_eq!(group.mget(&keys(&["a", "b"])).await.unwrap(), vec![None, None]);
        group.set("k", Bytes::from_static(b"x"), None, false).await.unwrap();
    }

    #[tokio::test]
    async fn test_deeper_partial_result_merges_hits() {
        let first = fake_tier("fake://1");
        let second = fake_tier("fake://2");
        let group = group_of(&[(first.clone(), 2), (second.clone(), 1)]);
        first.set_sync("a", "1");

        let nested = PartialResultError::new(
            HashMap::from([("b".to_string(), bytes("2"))]),
            HashMap::from([("c".to_string(), Error::backend("fake://2", "down"))]),
        );
        second.set_failure_count(1);
        second.set_next_failure(nested.into());

        let query = keys(&["a", "b", "c"]);
        let error = group.mget(&query).await.unwrap_err();
        let partial = error.as_partial().expect("partial result");
        assert!(partial.is_complete_for(["a", "b", "c"]));
        assert_eq!(partial.data().get("a"), Some(&bytes("1")));
        assert_eq!(partial.data().get("b"), Some(&bytes("2")));
        assert_matches!(partial.errors().get("c"), Some(Error::Backend { .. }));
    }

    #[tokio::test]
    async fn test_deeper_plain_error() {
        let first = fake_tier("fake://1");
        let second = fake_tier("fake://2");
        let group = group_of(&[(first.clone(), 2), (second.clone(), 1)]);

        // No hits on the first tier: the plain error passes through.
        second.set_failure_count(1);
        assert_matches!(
            group.mget(&keys(&["a", "b"])).await,
            Err(Error::Backend { .. })
        );

        // Some hits: the misses carry the error.
        first.set_sync("a", "1");
        second.set_failure_count(1);
        let error = group.mget(&keys(&["a", "b"])).await.unwrap_err();
        let partial = error.as_partial().expect("partial result");
        assert_eq!(partial.data().get("a"), Some(&bytes("1")));
        assert_matches!(partial.errors().get("b"), Some(Error::Backend { .. }));
    }

    #[tokio::test]
    async fn test_first_tier_error_propagates() {
        let first = fake_tier("fake://1");
        let second = fake_tier("fake://2");
        let group = group_of(&[(first.clone(), 2), (second.clone(), 1)]);
        first.set_failure_count(2);

        assert_matches!(group.get("a").await, Err(Error::Backend { .. }));
        assert_matches!(group.mget(&keys(&["a"])).await, Err(Error::Backend { .. }));
        assert_eq!(second.request_counts().total(), 0);
    }

    #[tokio::test]
    async fn test_writes_reach_every_available_tier() {
        let first = fake_tier("fake://1");
        let second = fake_tier("fake://2");
        let offline = fake_tier("fake://3");
        offline.set_available(false);
        let group = group_of(&[(first.clone(), 3), (second.clone(), 2), (offline.clone(), 1)]);

        group.set("k", Bytes::from_static(b"v"), None, false).await.unwrap();
        group
            .mset(&[CacheItem::new("m", "v")], None, false)
            .await
            .unwrap();
        for tier in [&first, &second] {
            assert_eq!(tier.get_sync("k"), bytes("v"));
            assert_eq!(tier.get_sync("m"), bytes("v"));
        }
        assert_eq!(offline.request_counts().total(), 0);

        group.del("k").await.unwrap();
        assert_eq!(first.get_sync("k"), None);
        assert_eq!(second.get_sync("k"), None);

        second.set_failure_count(1);
        assert_matches!(
            group.set("k", Bytes::from_static(b"v"), None, false).await,
            Err(Error::Backend { .. })
        );
        assert_eq!(first.get_sync("k"), bytes("v"));
        assert_eq!(group.metrics().failed_keys(Operation::Set), 1);
    }

    #[tokio::test]
    async fn test_lifecycle_and_uris() {
        let memory = Arc::new(InMemoryCache::new());
        let fake = fake_tier("fake://1");
        let group = TieredRedundantGroup::new();
        group.add(memory.clone(), 1);
        group.add(fake.clone(), 5);

        assert!(!memory.is_available());
        group.connect().await.unwrap();
        assert!(memory.is_available());

        assert_eq!(
            group.uris_by_key("k"),
            vec!["fake://1".to_string(), memory.uri().to_string()]
        );

        group.destroy().await;
        assert!(fake.is_destroyed());
        assert_eq!(group.tier_count(), 0);
        assert!(!group.is_available());
    }

    // =========================================================================
    // Properties
    // =========================================================================

    /// For each key, which of three tiers hold it.
    fn placement_strategy() -> impl Strategy<Value = Vec<[bool; 3]>> {
        prop::collection::vec(any::<[bool; 3]>(), 1..40)
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(48))]

        /// Misses need not be contiguous: every key resolves from the
        /// highest tier holding it, and each tier is asked once, for exactly
        /// the keys all higher tiers missed.
        #[test]
        fn prop_scattered_holes_resolve_from_best_tier(placement in placement_strategy()) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();

            let tiers: Vec<Arc<FakeCache>> =
                (0..3).map(|i| fake_tier(&format!("fake://{}", i))).collect();
            let group = TieredRedundantGroup::new();
            for (i, tier) in tiers.iter().enumerate() {
                group.add(tier.clone(), 10 - i as i32);
            }

            let query: Vec<String> = (0..placement.len()).map(|i| format!("k{}", i)).collect();
            for (key, held) in query.iter().zip(&placement) {
                for (t, tier) in tiers.iter().enumerate() {
                    if held[t] {
                        tier.set_sync(key, format!("{}@{}", key, t));
                    }
                }
            }

            let values = runtime.block_on(group.mget(&query)).unwrap();

            let mut still_missing = query.len();
            for (t, tier) in tiers.iter().enumerate() {
                let asked = tier.request_counts().mget_item_counts;
                if t == 0 || still_missing > 0 {
                    prop_assert_eq!(asked, vec![still_missing]);
                } else {
                    prop_assert!(asked.is_empty());
                }
                still_missing = placement
                    .iter()
                    .filter(|held| !held[..=t].iter().any(|h| *h))
                    .count();
            }

            for ((key, held), value) in query.iter().zip(&placement).zip(&values) {
                let expected = held
                    .iter()
                    .position(|h| *h)
                    .map(|t| Bytes::from(format!("{}@{}", key, t)));
                prop_assert_eq!(value, &expected);
            }
        }
    }
}
