//! In-process leaf back end
//!
//! Keeps every key in memory for a short time, for access patterns that read
//! the same data many times within a few seconds. Each key carries its own
//! TTL; a reaper task started by `connect` periodically drops expired keys.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::instance::{CacheInstance, CacheItem};
use crate::metrics::{CacheMetrics, Operation};

/// Configuration for [`InMemoryCache`]
#[derive(Debug, Clone)]
pub struct InMemoryOptions {
    /// If set, every key lives this long regardless of the TTL passed to set/mset
    pub max_age_override: Option<Duration>,
    /// How often the reaper sweeps expired keys
    pub reaper_interval: Duration,
}

impl Default for InMemoryOptions {
    fn default() -> Self {
        Self {
            max_age_override: None,
            reaper_interval: Duration::from_millis(2500),
        }
    }
}

#[derive(Debug, Clone)]
struct StoredValue {
    value: Bytes,
    expires_at: Instant,
}

/// In-memory cache instance with per-key TTL
pub struct InMemoryCache {
    uri: String,
    options: InMemoryOptions,
    entries: Arc<DashMap<String, StoredValue>>,
    available: AtomicBool,
    destroyed: AtomicBool,
    reaper: Mutex<Option<CancellationToken>>,
    metrics: CacheMetrics,
}

impl Default for InMemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryCache {
    /// Create an in-memory cache with a unique `memory://` URI
    pub fn new() -> Self {
        Self::with_options(
            format!("memory://{}", uuid::Uuid::new_v4()),
            InMemoryOptions::default(),
        )
    }

    /// Create an in-memory cache with an explicit URI and options
    pub fn with_options(uri: impl Into<String>, options: InMemoryOptions) -> Self {
        Self {
            uri: uri.into(),
            options,
            entries: Arc::new(DashMap::new()),
            available: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
            reaper: Mutex::new(None),
            metrics: CacheMetrics::new(),
        }
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Number of stored keys, including expired ones the reaper has not
    /// removed yet
    pub fn key_count(&self) -> usize {
        self.entries.len()
    }

    pub fn metrics(&self) -> &CacheMetrics {
        &self.metrics
    }

    /// Drop every expired key now. Returns how many were removed.
    pub fn reap_expired(&self) -> usize {
        reap(&self.entries)
    }

    fn ensure_usable(&self) -> Result<()> {
        if self.destroyed.load(Ordering::Acquire) {
            return Err(Error::Unavailable(format!("{} has been destroyed", self.uri)));
        }
        Ok(())
    }

    /// Expiry instant for a write made at `now`
    fn expiry(&self, max_age: Option<Duration>, now: Instant) -> Result<Instant> {
        let ttl = match self.options.max_age_override.or(max_age) {
            Some(ttl) if !ttl.is_zero() => ttl,
            _ => {
                return Err(Error::InvalidArgument(
                    "max_age must be positive or overridden with max_age_override".to_string(),
                ))
            }
        };
        now.checked_add(ttl)
            .ok_or_else(|| Error::InvalidArgument(format!("max_age {:?} is too large", ttl)))
    }

    fn live_value(&self, key: &str, now: Instant) -> Option<Bytes> {
        self.entries
            .get(key)
            .filter(|stored| stored.expires_at > now)
            .map(|stored| stored.value.clone())
    }

    fn store(
        &self,
        key: &str,
        value: Bytes,
        now: Instant,
        expires_at: Instant,
        set_if_absent: bool,
    ) {
        let stored = StoredValue { value, expires_at };
        // The entry holds its shard lock across the presence check and the write.
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(existing) if set_if_absent && existing.get().expires_at > now => {
                trace!(key, "set_if_absent: key already present");
            }
            Entry::Occupied(mut existing) => {
                existing.insert(stored);
            }
            Entry::Vacant(vacant) => {
                vacant.insert(stored);
            }
        }
    }

    fn start_reaper(&self) {
        let mut slot = self.reaper.lock();
        if let Some(previous) = slot.take() {
            previous.cancel();
        }

        let token = CancellationToken::new();
        let entries = Arc::clone(&self.entries);
        let every = self.options.reaper_interval;
        let cancelled = token.clone();
        let uri = self.uri.clone();

        tokio::spawn(async move {
            let mut tick = interval(every);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancelled.cancelled() => break,
                    _ = tick.tick() => {
                        let removed = reap(&entries);
                        if removed > 0 {
                            debug!(uri = %uri, removed, "Reaped expired keys");
                        }
                    }
                }
            }
        });

        *slot = Some(token);
    }

    fn stop_reaper(&self) {
        if let Some(token) = self.reaper.lock().take() {
            token.cancel();
        }
    }
}

fn reap(entries: &DashMap<String, StoredValue>) -> usize {
    let now = Instant::now();
    let before = entries.len();
    entries.retain(|_, stored| stored.expires_at > now);
    before.saturating_sub(entries.len())
}

#[async_trait]
impl CacheInstance for InMemoryCache {
    fn is_available(&self) -> bool {
        self.available.load(Ordering::Acquire)
    }

    async fn connect(&self) -> Result<()> {
        self.ensure_usable()?;
        if self.options.reaper_interval.is_zero() {
            return Err(Error::InvalidArgument(format!(
                "{} has a zero reaper interval",
                self.uri
            )));
        }
        self.available.store(true, Ordering::Release);
        self.start_reaper();
        Ok(())
    }

    async fn disconnect(&self) {
        self.stop_reaper();
        self.available.store(false, Ordering::Release);
    }

    async fn destroy(&self) {
        self.stop_reaper();
        self.available.store(false, Ordering::Release);
        self.destroyed.store(true, Ordering::Release);
        self.entries.clear();
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        self.ensure_usable()?;
        self.metrics.record_call(Operation::Get);
        let value = self.live_value(key, Instant::now());
        self.metrics.record_reads(std::slice::from_ref(&value));
        Ok(value)
    }

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<Bytes>>> {
        self.ensure_usable()?;
        self.metrics.record_call(Operation::Mget);
        let now = Instant::now();
        let values: Vec<Option<Bytes>> = keys.iter().map(|k| self.live_value(k, now)).collect();
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
        self.ensure_usable()?;
        self.metrics.record_call(Operation::Set);
        let now = Instant::now();
        let expires_at = self.expiry(max_age, now)?;
        self.store(key, value, now, expires_at, set_if_absent);
        Ok(())
    }

    async fn mset(
        &self,
        items: &[CacheItem],
        max_age: Option<Duration>,
        set_if_absent: bool,
    ) -> Result<()> {
        self.ensure_usable()?;
        self.metrics.record_call(Operation::Mset);
        let now = Instant::now();
        let expires_at = self.expiry(max_age, now)?;
        for item in items {
            self.store(&item.key, item.value.clone(), now, expires_at, set_if_absent);
        }
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<()> {
        self.ensure_usable()?;
        self.metrics.record_call(Operation::Del);
        self.entries.remove(key);
        Ok(())
    }

    fn uris_by_key(&self, _key: &str) -> Vec<String> {
        vec![self.uri.clone()]
    }
}

// =============================================================================
// Tests
// =============================================================================
