//! The CacheInstance capability
//!
//! Every leaf back end and every composing component (cluster, redundant
//! group, multiplexer, fanout pair) implements the same trait, so any of them
//! can be nested inside any other.
//!
//! # Contract for leaf implementations
//!
//! - a missing key is `Ok(None)`, never an error;
//! - `uris_by_key` reports the physical nodes truthfully, since the fanout
//!   pair relies on it to skip duplicate writes;
//! - failures are a single [`Error`](crate::Error) value; partial results are
//!   only synthesized by the composing layers.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;

/// One key/value pair of a batched write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheItem {
    pub key: String,
    pub value: Bytes,
}

impl CacheItem {
    pub fn new(key: impl Into<String>, value: impl Into<Bytes>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Shared handle to any cache instance.
pub type SharedInstance = Arc<dyn CacheInstance>;

/// Uniform asynchronous cache API.
#[async_trait]
pub trait CacheInstance: Send + Sync {
    /// Whether this instance can currently serve requests.
    fn is_available(&self) -> bool;

    /// Connect this instance. Idempotent.
    async fn connect(&self) -> Result<()>;

    /// Disconnect this instance. Idempotent.
    async fn disconnect(&self);

    /// Tear down this instance and release its resources. Idempotent.
    async fn destroy(&self);

    /// Get one key. `Ok(None)` on a miss.
    async fn get(&self, key: &str) -> Result<Option<Bytes>>;

    /// Get several keys. The result has the same length and order as `keys`.
    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<Bytes>>>;

    /// Set one key.
    async fn set(
        &self,
        key: &str,
        value: Bytes,
        max_age: Option<Duration>,
        set_if_absent: bool,
    ) -> Result<()>;

    /// Set several keys with one TTL.
    async fn mset(
        &self,
        items: &[CacheItem],
        max_age: Option<Duration>,
        set_if_absent: bool,
    ) -> Result<()>;

    /// Delete one key.
    async fn del(&self, key: &str) -> Result<()>;

    /// Physical nodes backing `key`.
    fn uris_by_key(&self, key: &str) -> Vec<String>;
}

/// Append every URI of `extra` not already in `uris`.
pub(crate) fn extend_unique(uris: &mut Vec<String>, extra: Vec<String>) {
    for uri in extra {
        if !uris.contains(&uri) {
            uris.push(uri);
        }
    }
}

/// True if `candidate` names at least one node missing from `covered`.
pub(crate) fn has_uncovered(covered: &[String], candidate: &[String]) -> bool {
    candidate.iter().any(|uri| !covered.contains(uri))
}
