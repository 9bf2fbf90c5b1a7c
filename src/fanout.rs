//! Write Fan-out Pair
//!
//! A primary instance serving reads and writes, plus secondaries that receive
//! copies of every write. Used while moving between two cluster layouts: the
//! old and new configurations often share physical nodes, so a write only
//! reaches a secondary when the secondary would store the key on a node no
//! earlier destination of the same write covers.
//!
//! With read fallback enabled, keys the primary misses are looked up on the
//! secondaries that might hold them, and hits are copied back to the primary
//! in the background without overwriting newer data.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::join_all;
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::instance::{extend_unique, has_uncovered, CacheInstance, CacheItem, SharedInstance};
use crate::metrics::{CacheMetrics, Operation};

/// How values found on a secondary are copied back to the primary
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteBackOptions {
    /// TTL of the copied value
    pub max_age: Option<Duration>,
}

/// Primary instance with write-through secondaries
pub struct WriteFanoutPair {
    primary: SharedInstance,
    secondaries: RwLock<Vec<SharedInstance>>,
    read_fallback: RwLock<Option<WriteBackOptions>>,
    connected: AtomicBool,
    metrics: CacheMetrics,
}

impl WriteFanoutPair {
    pub fn new(primary: SharedInstance) -> Self {
        Self {
            primary,
            secondaries: RwLock::new(Vec::new()),
            read_fallback: RwLock::new(None),
            connected: AtomicBool::new(false),
            metrics: CacheMetrics::new(),
        }
    }

    /// Add a secondary. Earlier secondaries take precedence when several
    /// cover the same node.
    pub fn add_secondary(&self, instance: SharedInstance) {
        self.secondaries.write().push(instance);
    }

    /// Serve primary misses from the secondaries and copy hits back.
    pub fn enable_read_from_secondary(&self, write_back: WriteBackOptions) {
        *self.read_fallback.write() = Some(write_back);
    }

    pub fn primary(&self) -> &SharedInstance {
        &self.primary
    }

    pub fn secondary_count(&self) -> usize {
        self.secondaries.read().len()
    }

    pub fn metrics(&self) -> &CacheMetrics {
        &self.metrics
    }

    fn secondaries(&self) -> Vec<SharedInstance> {
        self.secondaries.read().clone()
    }

    /// Indices of the secondaries a write of `key` must reach.
    fn write_targets(&self, secondaries: &[SharedInstance], key: &str) -> Vec<usize> {
        let mut covered = self.primary.uris_by_key(key);
        let mut targets = Vec::new();
        for (index, secondary) in secondaries.iter().enumerate() {
            let uris = secondary.uris_by_key(key);
            if has_uncovered(&covered, &uris) {
                extend_unique(&mut covered, uris);
                targets.push(index);
            }
        }
        targets
    }

    /// True if `secondary` stores `key` on a node the primary does not.
    fn maybe_on_secondary(&self, secondary: &SharedInstance, key: &str) -> bool {
        has_uncovered(&self.primary.uris_by_key(key), &secondary.uris_by_key(key))
    }

    /// Run `write` against the primary and `targets`; every one must succeed.
    async fn fan_out<F, Fut>(
        &self,
        op: Operation,
        keys: usize,
        targets: Vec<SharedInstance>,
        write: F,
    ) -> Result<()>
    where
        F: Fn(SharedInstance) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        self.metrics.record_call(op);
        let destinations = std::iter::once(Arc::clone(&self.primary)).chain(targets);
        let results = join_all(destinations.map(write)).await;
        match results.into_iter().find_map(|result| result.err()) {
            Some(error) => {
                self.metrics.record_failed_keys(op, keys);
                warn!(op = %op, error = %error, "Fan-out write failed");
                Err(error)
            }
            None => Ok(()),
        }
    }

    fn write_back(&self, items: Vec<CacheItem>, options: WriteBackOptions) {
        let primary = Arc::clone(&self.primary);
        debug!(items = items.len(), "Writing secondary hits back to primary");
        tokio::spawn(async move {
            let result = match items.as_slice() {
                [item] => {
                    primary
                        .set(&item.key, item.value.clone(), options.max_age, true)
                        .await
                }
                _ => primary.mset(&items, options.max_age, true).await,
            };
            if let Err(error) = result {
                warn!(items = items.len(), error = %error, "Write-back to primary failed");
            }
        });
    }
}

#[async_trait]
impl CacheInstance for WriteFanoutPair {
    fn is_available(&self) -> bool {
        self.connected.load(Ordering::Acquire) && self.primary.is_available()
    }

    async fn connect(&self) -> Result<()> {
        self.connected.store(true, Ordering::Release);
        let secondaries = self.secondaries();
        let destinations = std::iter::once(&self.primary).chain(secondaries.iter());
        let results = join_all(destinations.map(|instance| instance.connect())).await;
        info!(secondaries = secondaries.len(), "Fan-out pair connected");
        results.into_iter().collect::<Result<Vec<()>>>().map(|_| ())
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::Release);
        let secondaries = self.secondaries();
        let destinations = std::iter::once(&self.primary).chain(secondaries.iter());
        join_all(destinations.map(|instance| instance.disconnect())).await;
        info!("Fan-out pair disconnected");
    }

    async fn destroy(&self) {
        self.disconnect().await;
        let secondaries = std::mem::take(&mut *self.secondaries.write());
        let destinations = std::iter::once(&self.primary).chain(secondaries.iter());
        join_all(destinations.map(|instance| instance.destroy())).await;
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        self.metrics.record_call(Operation::Get);
        let value = self.primary.get(key).await?;
        let fallback = *self.read_fallback.read();
        let (None, Some(write_back)) = (&value, fallback) else {
            self.metrics.record_reads(std::slice::from_ref(&value));
            return Ok(value);
        };

        for secondary in self.secondaries() {
            if !self.maybe_on_secondary(&secondary, key) {
                continue;
            }
            if let Some(found) = secondary.get(key).await? {
                self.write_back(vec![CacheItem::new(key, found.clone())], write_back);
                self.metrics.record_reads(&[Some(())]);
                return Ok(Some(found));
            }
        }
        self.metrics.record_reads(&[None::<()>]);
        Ok(None)
    }

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<Bytes>>> {
        self.metrics.record_call(Operation::Mget);
        let mut values = self.primary.mget(keys).await?;
        let Some(write_back) = *self.read_fallback.read() else {
            self.metrics.record_reads(&values);
            return Ok(values);
        };
        if values.len() != keys.len() {
            return Err(Error::Internal(format!(
                "primary returned {} values for {} keys",
                values.len(),
                keys.len()
            )));
        }

        let mut holes: Vec<usize> = (0..keys.len()).filter(|&i| values[i].is_none()).collect();
        let mut recovered: Vec<CacheItem> = Vec::new();
        for secondary in self.secondaries() {
            let (candidates, rest): (Vec<usize>, Vec<usize>) = holes
                .iter()
                .copied()
                .partition(|&i| self.maybe_on_secondary(&secondary, &keys[i]));
            if candidates.is_empty() {
                continue;
            }

            let sub_keys: Vec<String> = candidates.iter().map(|&i| keys[i].clone()).collect();
            let found = secondary.mget(&sub_keys).await?;
            holes = rest;
            for (&index, value) in candidates.iter().zip(found) {
                match value {
                    Some(value) => {
                        recovered.push(CacheItem::new(keys[index].clone(), value.clone()));
                        values[index] = Some(value);
                    }
                    None => holes.push(index),
                }
            }
            if holes.is_empty() {
                break;
            }
            holes.sort_unstable();
        }

        if !recovered.is_empty() {
            self.write_back(recovered, write_back);
        }
        self.metrics.record_reads(&values);
        Ok(values)
    }

    async fn set(
        &self,
        key: &str,
        value: Bytes,
        max_age: Option<Duration>,
        set_if_absent: bool,
    ) -> Result<()> {
        let secondaries = self.secondaries();
        let targets = self
            .write_targets(&secondaries, key)
            .into_iter()
            .map(|index| Arc::clone(&secondaries[index]))
            .collect();
        self.fan_out(Operation::Set, 1, targets, |instance| {
            let value = value.clone();
            async move { instance.set(key, value, max_age, set_if_absent).await }
        })
        .await
    }

    async fn mset(
        &self,
        items: &[CacheItem],
        max_age: Option<Duration>,
        set_if_absent: bool,
    ) -> Result<()> {
        self.metrics.record_call(Operation::Mset);
        let secondaries = self.secondaries();
        let mut per_secondary: Vec<Vec<CacheItem>> = vec![Vec::new(); secondaries.len()];
        for item in items {
            for index in self.write_targets(&secondaries, &item.key) {
                per_secondary[index].push(item.clone());
            }
        }

        let mut writes = vec![self.primary.mset(items, max_age, set_if_absent)];
        for (secondary, subset) in secondaries.iter().zip(&per_secondary) {
            if !subset.is_empty() {
                writes.push(secondary.mset(subset, max_age, set_if_absent));
            }
        }

        match join_all(writes).await.into_iter().find_map(|result| result.err()) {
            Some(error) => {
                self.metrics.record_failed_keys(Operation::Mset, items.len());
                warn!(items = items.len(), error = %error, "Fan-out mset failed");
                Err(error)
            }
            None => Ok(()),
        }
    }

    async fn del(&self, key: &str) -> Result<()> {
        let secondaries = self.secondaries();
        let targets = self
            .write_targets(&secondaries, key)
            .into_iter()
            .map(|index| Arc::clone(&secondaries[index]))
            .collect();
        self.fan_out(Operation::Del, 1, targets, |instance| async move {
            instance.del(key).await
        })
        .await
    }

    fn uris_by_key(&self, key: &str) -> Vec<String> {
        let mut uris = self.primary.uris_by_key(key);
        for secondary in self.secondaries() {
            extend_unique(&mut uris, secondary.uris_by_key(key));
        }
        uris
    }
}

// =============================================================================
// Tests
// =============================================================================
