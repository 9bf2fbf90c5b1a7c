//! Request Multiplexer
//!
//! Wraps one delegate so that at most one read per key is in flight at a
//! time. Concurrent readers of a key share the delegate call already issued
//! for it, even when that call was an `mget` for a different set of keys.
//!
//! ```text
//!   R1 mget [a b c]  ──▶  delegate.mget [a b c]
//!   R2 mget [b c d]  ──▶  waits on R1 for b c, delegate.mget [d]
//!   R3 get  d        ──▶  waits on R2's fetch
//! ```
//!
//! Writes and deletes drop the pending entries of the keys they touch before
//! reaching the delegate, so a later read issues a fresh call. A read that
//! started before the write may still resolve with the older value.
//!
//! A settling fetch clears only the entries it registered itself. Entries
//! that a newer fetch took over after an invalidation stay pending until
//! that newer fetch settles.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::{join_all, BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::error::{Error, PartialResultBuilder, Result};
use crate::instance::{CacheInstance, CacheItem, SharedInstance};
use crate::metrics::{CacheMetrics, Operation};

type FetchResult = Result<Arc<HashMap<String, Option<Bytes>>>>;
type PendingFetch = Shared<BoxFuture<'static, FetchResult>>;

#[derive(Clone)]
struct PendingEntry {
    fetch_id: u64,
    fetch: PendingFetch,
}

type PendingTable = Mutex<HashMap<String, PendingEntry>>;

/// Single-flight reads in front of a delegate instance
pub struct RequestMultiplexer {
    delegate: SharedInstance,
    pending: Arc<PendingTable>,
    next_fetch: AtomicU64,
    metrics: CacheMetrics,
}

impl RequestMultiplexer {
    pub fn new(delegate: SharedInstance) -> Self {
        Self {
            delegate,
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_fetch: AtomicU64::new(0),
            metrics: CacheMetrics::new(),
        }
    }

    pub fn delegate(&self) -> &SharedInstance {
        &self.delegate
    }

    /// Keys with a delegate read in flight
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn metrics(&self) -> &CacheMetrics {
        &self.metrics
    }

    fn invalidate<'a>(&self, keys: impl IntoIterator<Item = &'a str>) {
        let mut pending = self.pending.lock();
        for key in keys {
            pending.remove(key);
        }
    }

    /// Delegate `mget` whose settlement clears its own pending entries.
    fn fetch(&self, fetch_id: u64, keys: Vec<String>) -> PendingFetch {
        let delegate = Arc::clone(&self.delegate);
        let pending: Weak<PendingTable> = Arc::downgrade(&self.pending);

        async move {
            let result = delegate.mget(&keys).await;

            if let Some(pending) = pending.upgrade() {
                let mut pending = pending.lock();
                for key in &keys {
                    if pending.get(key).is_some_and(|entry| entry.fetch_id == fetch_id) {
                        pending.remove(key);
                    }
                }
            }

            let values = result?;
            if values.len() != keys.len() {
                return Err(Error::Internal(format!(
                    "delegate returned {} values for {} keys",
                    values.len(),
                    keys.len()
                )));
            }
            trace!(fetch_id, keys = keys.len(), "Delegate fetch settled");
            Ok(Arc::new(keys.into_iter().zip(values).collect()))
        }
        .boxed()
        .shared()
    }

    /// Join in-flight fetches and start one fetch for the remaining keys.
    ///
    /// Lookup and registration happen under one lock acquisition, before the
    /// first await.
    async fn load(&self, keys: &[String]) -> Result<Vec<Option<Bytes>>> {
        let (waits, sources) = {
            let mut pending = self.pending.lock();
            let mut waits: Vec<PendingFetch> = Vec::new();
            let mut slots: HashMap<u64, usize> = HashMap::new();
            let mut fetch_ids: Vec<Option<u64>> = Vec::with_capacity(keys.len());
            let mut to_fetch: Vec<String> = Vec::new();
            let mut queued: HashSet<&str> = HashSet::new();
            let mut coalesced = 0;

            for key in keys {
                match pending.get(key) {
                    Some(entry) => {
                        coalesced += 1;
                        slots.entry(entry.fetch_id).or_insert_with(|| {
                            waits.push(entry.fetch.clone());
                            waits.len() - 1
                        });
                        fetch_ids.push(Some(entry.fetch_id));
                    }
                    None => {
                        if queued.insert(key.as_str()) {
                            to_fetch.push(key.clone());
                        }
                        fetch_ids.push(None);
                    }
                }
            }

            let mut fresh_slot = None;
            if !to_fetch.is_empty() {
                let fetch_id = self.next_fetch.fetch_add(1, Ordering::Relaxed);
                let fetch = self.fetch(fetch_id, to_fetch.clone());
                for key in to_fetch {
                    pending.insert(
                        key,
                        PendingEntry {
                            fetch_id,
                            fetch: fetch.clone(),
                        },
                    );
                }
                waits.push(fetch);
                fresh_slot = Some(waits.len() - 1);
                self.metrics.record_delegate_fetch();
            }
            self.metrics.record_coalesced(coalesced);
            if coalesced > 0 {
                debug!(coalesced, keys = keys.len(), "Joined in-flight reads");
            }

            let sources: Vec<usize> = fetch_ids
                .into_iter()
                .map(|id| match id {
                    Some(id) => slots[&id],
                    None => fresh_slot.unwrap_or_default(),
                })
                .collect();
            (waits, sources)
        };

        let results = join_all(waits).await;
        assemble(keys, &sources, &results)
    }
}

/// Outcome for one key from the fetch that covered it
fn lookup<'a>(
    result: &'a FetchResult,
    key: &str,
) -> std::result::Result<Option<Bytes>, &'a Error> {
    match result {
        Ok(values) => Ok(values.get(key).cloned().flatten()),
        Err(error) => match error.as_partial() {
            Some(partial) => match partial.data().get(key) {
                Some(value) => Ok(value.clone()),
                None => Err(partial.errors().get(key).unwrap_or(error)),
            },
            None => Err(error),
        },
    }
}

fn assemble(
    keys: &[String],
    sources: &[usize],
    results: &[FetchResult],
) -> Result<Vec<Option<Bytes>>> {
    let mut values = Vec::with_capacity(keys.len());
    let mut failures: Vec<(usize, &Error)> = Vec::new();
    for (index, (key, &source)) in keys.iter().zip(sources).enumerate() {
        match lookup(&results[source], key) {
            Ok(value) => values.push(value),
            Err(error) => {
                values.push(None);
                failures.push((index, error));
            }
        }
    }

    let Some(&(_, first)) = failures.first() else {
        return Ok(values);
    };
    if failures.len() == keys.len() && !first.is_partial() {
        return Err(first.clone());
    }

    let mut outcome = PartialResultBuilder::new();
    let mut failed = failures.iter().peekable();
    for (index, (key, value)) in keys.iter().zip(values).enumerate() {
        match failed.peek() {
            Some(&&(failed_index, error)) if failed_index == index => {
                outcome.fail([key.as_str()], error);
                failed.next();
            }
            _ => outcome.succeed(key, value),
        }
    }
    Err(outcome.build().into())
}

#[async_trait]
impl CacheInstance for RequestMultiplexer {
    fn is_available(&self) -> bool {
        self.delegate.is_available()
    }

    async fn connect(&self) -> Result<()> {
        self.delegate.connect().await
    }

    async fn disconnect(&self) {
        self.delegate.disconnect().await
    }

    async fn destroy(&self) {
        self.pending.lock().clear();
        self.delegate.destroy().await
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        self.metrics.record_call(Operation::Get);
        let keys = [key.to_string()];
        let mut values = self.load(&keys).await?;
        self.metrics.record_reads(&values);
        Ok(values.pop().flatten())
    }

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<Bytes>>> {
        self.metrics.record_call(Operation::Mget);
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let values = self.load(keys).await?;
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
        self.metrics.record_call(Operation::Set);
        self.invalidate([key]);
        self.delegate.set(key, value, max_age, set_if_absent).await
    }

    async fn mset(
        &self,
        items: &[CacheItem],
        max_age: Option<Duration>,
        set_if_absent: bool,
    ) -> Result<()> {
        self.metrics.record_call(Operation::Mset);
        self.invalidate(items.iter().map(|item| item.key.as_str()));
        self.delegate.mset(items, max_age, set_if_absent).await
    }

    async fn del(&self, key: &str) -> Result<()> {
        self.metrics.record_call(Operation::Del);
        self.invalidate([key]);
        self.delegate.del(key).await
    }

    fn uris_by_key(&self, key: &str) -> Vec<String> {
        self.delegate.uris_by_key(key)
    }
}

// =============================================================================
// Tests
// =============================================================================
