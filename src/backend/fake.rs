//! Fake leaf back end for tests
//!
//! Behaves like a remote cache node: every call takes `latency`, reads see
//! the data as it was when the call was issued, and failures can be injected
//! for the next N calls. An injected failure is reported after the same
//! latency and is not counted as a request. Request counts record what
//! actually reached the node, including the item count of every `mget`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tracing::trace;

use crate::error::{Error, Result};
use crate::instance::{CacheInstance, CacheItem};

/// Default artificial latency per call
pub const DEFAULT_FAKE_LATENCY: Duration = Duration::from_millis(5);

/// Calls that reached a [`FakeCache`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestCounts {
    pub get: usize,
    pub mget: usize,
    pub set: usize,
    pub mset: usize,
    pub del: usize,
    /// Number of keys in each mget, in call order
    pub mget_item_counts: Vec<usize>,
    pub hits: usize,
    pub misses: usize,
}

impl RequestCounts {
    /// Total number of calls of any kind
    pub fn total(&self) -> usize {
        self.get + self.mget + self.set + self.mset + self.del
    }
}

#[derive(Debug, Default)]
struct FailurePlan {
    remaining: usize,
    next: Option<Error>,
}

/// A cache node double with latency and failure injection
pub struct FakeCache {
    uri: String,
    data: Mutex<HashMap<String, Bytes>>,
    latency: Mutex<Duration>,
    failures: Mutex<FailurePlan>,
    counts: Mutex<RequestCounts>,
    available: AtomicBool,
    destroyed: AtomicBool,
}

impl Default for FakeCache {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeCache {
    /// Create a fake node with a unique `fake://` URI
    pub fn new() -> Self {
        Self::with_uri(format!("fake://{}", uuid::Uuid::new_v4()))
    }

    /// Create a fake node reporting `uri` for every key
    pub fn with_uri(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            data: Mutex::new(HashMap::new()),
            latency: Mutex::new(DEFAULT_FAKE_LATENCY),
            failures: Mutex::new(FailurePlan::default()),
            counts: Mutex::new(RequestCounts::default()),
            available: AtomicBool::new(true),
            destroyed: AtomicBool::new(false),
        }
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Set the latency of every subsequent call
    pub fn set_latency(&self, latency: Duration) -> &Self {
        *self.latency.lock() = latency;
        self
    }

    /// Fail the next `count` calls
    pub fn set_failure_count(&self, count: usize) {
        self.failures.lock().remaining = count;
    }

    /// Error returned by the next injected failure, instead of a generic one
    pub fn set_next_failure(&self, error: Error) {
        self.failures.lock().next = Some(error);
    }

    /// Toggle what `is_available` reports
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Release);
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    pub fn request_counts(&self) -> RequestCounts {
        self.counts.lock().clone()
    }

    pub fn reset_request_counts(&self) {
        *self.counts.lock() = RequestCounts::default();
    }

    /// Read without latency or accounting
    pub fn get_sync(&self, key: &str) -> Option<Bytes> {
        self.data.lock().get(key).cloned()
    }

    /// Write without latency or accounting
    pub fn set_sync(&self, key: &str, value: impl Into<Bytes>) {
        self.data.lock().insert(key.to_string(), value.into());
    }

    /// Snapshot of everything stored
    pub fn data(&self) -> HashMap<String, Bytes> {
        self.data.lock().clone()
    }

    /// Drop all data and reset counts
    pub fn flush(&self) {
        self.data.lock().clear();
        self.reset_request_counts();
    }

    fn take_failure(&self) -> Option<Error> {
        let mut plan = self.failures.lock();
        if plan.remaining == 0 {
            return None;
        }
        plan.remaining -= 1;
        Some(
            plan.next
                .take()
                .unwrap_or_else(|| Error::backend(self.uri.clone(), "Fake Error")),
        )
    }

    fn read(&self, key: &str) -> Option<Bytes> {
        let value = self.data.lock().get(key).cloned();
        let mut counts = self.counts.lock();
        if value.is_some() {
            counts.hits += 1;
        } else {
            counts.misses += 1;
        }
        trace!(uri = %self.uri, key, hit = value.is_some(), "FakeCache read");
        value
    }

    fn write(&self, key: &str, value: Bytes, set_if_absent: bool) {
        let mut data = self.data.lock();
        if set_if_absent && data.contains_key(key) {
            return;
        }
        data.insert(key.to_string(), value);
    }

    async fn delay(&self) {
        let latency = *self.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl CacheInstance for FakeCache {
    fn is_available(&self) -> bool {
        self.available.load(Ordering::Acquire)
    }

    async fn connect(&self) -> Result<()> {
        Ok(())
    }

    async fn disconnect(&self) {}

    async fn destroy(&self) {
        self.destroyed.store(true, Ordering::Release);
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        if let Some(error) = self.take_failure() {
            self.delay().await;
            return Err(error);
        }
        self.counts.lock().get += 1;
        let value = self.read(key);
        self.delay().await;
        Ok(value)
    }

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<Bytes>>> {
        if let Some(error) = self.take_failure() {
            self.delay().await;
            return Err(error);
        }
        {
            let mut counts = self.counts.lock();
            counts.mget += 1;
            counts.mget_item_counts.push(keys.len());
        }
        let values = keys.iter().map(|k| self.read(k)).collect();
        self.delay().await;
        Ok(values)
    }

    async fn set(
        &self,
        key: &str,
        value: Bytes,
        _max_age: Option<Duration>,
        set_if_absent: bool,
    ) -> Result<()> {
        if let Some(error) = self.take_failure() {
            self.delay().await;
            return Err(error);
        }
        self.counts.lock().set += 1;
        self.write(key, value, set_if_absent);
        self.delay().await;
        Ok(())
    }

    async fn mset(
        &self,
        items: &[CacheItem],
        _max_age: Option<Duration>,
        set_if_absent: bool,
    ) -> Result<()> {
        if let Some(error) = self.take_failure() {
            self.delay().await;
            return Err(error);
        }
        self.counts.lock().mset += 1;
        for item in items {
            self.write(&item.key, item.value.clone(), set_if_absent);
        }
        self.delay().await;
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<()> {
        if let Some(error) = self.take_failure() {
            self.delay().await;
            return Err(error);
        }
        self.counts.lock().del += 1;
        self.data.lock().remove(key);
        self.delay().await;
        Ok(())
    }

    fn uris_by_key(&self, _key: &str) -> Vec<String> {
        vec![self.uri.clone()]
    }
}

// =============================================================================
// Tests
// =============================================================================
