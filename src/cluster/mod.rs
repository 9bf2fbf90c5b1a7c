//! Sharded Cluster
//!
//! Partitions the key space across independent nodes with a consistent hash
//! ring. Single-key operations go to the owning node and surface its outcome
//! unchanged. Batches are split per node, issued concurrently and reassembled
//! in the caller's key order.
//!
//! ```text
//!              mget [k1 k2 k3 k4]
//!                     │
//!            ┌────────┴────────┐   ring.lookup_many
//!            ▼                 ▼
//!     node-a [k1 k3]    node-b [k2 k4]
//!            └────────┬────────┘   join_all
//!                     ▼
//!     [v1 v2 v3 v4]  or  PartialResultError { data, errors }
//! ```
//!
//! Node capacity changes are applied gradually when a warm-up interval is
//! set; see [`NodeCapacity`].

mod capacity;

pub use capacity::{NodeCapacity, RampState};

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::join_all;
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::error::{Error, PartialResultBuilder, Result};
use crate::instance::{CacheInstance, CacheItem, SharedInstance};
use crate::metrics::{CacheMetrics, Operation};
use crate::ring::HashRing;
use capacity::{RampTicker, TickOutcome};

/// Options for a node joining a cluster
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeOptions {
    /// Target number of ring points
    pub capacity: usize,
    /// Interval between single-point capacity steps
    pub warm_up: Option<Duration>,
}

impl Default for NodeOptions {
    fn default() -> Self {
        Self {
            capacity: 1,
            warm_up: None,
        }
    }
}

struct ClusterNode {
    instance: SharedInstance,
    capacity: NodeCapacity,
    ramp: Option<RampTicker>,
}

/// Ring and node table change together under one lock.
#[derive(Default)]
struct ClusterState {
    ring: HashRing,
    nodes: HashMap<String, ClusterNode>,
}

struct ClusterInner {
    state: RwLock<ClusterState>,
    connected: AtomicBool,
    metrics: CacheMetrics,
}

/// Keys of one batch owned by a single node
struct NodeBatch {
    uri: Arc<str>,
    instance: SharedInstance,
    indices: Vec<usize>,
}

impl ClusterInner {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Move `uri` toward its target, replacing any running ramp. Returns the
    /// node's instance if the node was retired and must be destroyed.
    fn schedule(self: &Arc<Self>, state: &mut ClusterState, uri: &str) -> Option<SharedInstance> {
        let ClusterState { ring, nodes } = state;
        let node = nodes.get_mut(uri)?;
        node.ramp = None;

        if node.capacity.state() == RampState::Idle {
            return Self::retire(nodes, uri);
        }
        if !self.is_connected() {
            return None;
        }

        match node.capacity.ramp_interval() {
            None => {
                node.capacity.settle();
                ring.set_node_capacity(uri, node.capacity.current);
                debug!(uri, points = node.capacity.current, "Applied node capacity");
                Self::retire(nodes, uri)
            }
            Some(every) => {
                debug!(
                    uri,
                    current = node.capacity.current,
                    target = node.capacity.target,
                    every_ms = every.as_millis() as u64,
                    "Starting capacity ramp"
                );
                node.ramp = Some(self.spawn_ramp(uri, every));
                None
            }
        }
    }

    fn spawn_ramp(self: &Arc<Self>, uri: &str, every: Duration) -> RampTicker {
        let cluster = Arc::downgrade(self);
        let uri = uri.to_string();
        RampTicker::spawn(every, move |token| {
            let cluster = cluster.clone();
            let uri = uri.clone();
            async move {
                let Some(cluster) = cluster.upgrade() else {
                    return TickOutcome::Done;
                };
                let (outcome, retired) = cluster.ramp_tick(&uri, &token);
                if let Some(instance) = retired {
                    instance.destroy().await;
                }
                outcome
            }
        })
    }

    /// One ramp step. A missing node or a cancelled ticker ends the ramp.
    fn ramp_tick(
        &self,
        uri: &str,
        token: &CancellationToken,
    ) -> (TickOutcome, Option<SharedInstance>) {
        let mut state = self.state.write();
        if token.is_cancelled() || !self.is_connected() {
            return (TickOutcome::Done, None);
        }

        let ClusterState { ring, nodes } = &mut *state;
        let Some(node) = nodes.get_mut(uri) else {
            return (TickOutcome::Done, None);
        };

        if node.capacity.step() {
            ring.set_node_capacity(uri, node.capacity.current);
            debug!(
                uri,
                current = node.capacity.current,
                target = node.capacity.target,
                "Ramped node capacity"
            );
        }

        if node.capacity.state() != RampState::Idle {
            return (TickOutcome::Continue, None);
        }
        node.ramp = None;
        (TickOutcome::Done, Self::retire(nodes, uri))
    }

    fn retire(nodes: &mut HashMap<String, ClusterNode>, uri: &str) -> Option<SharedInstance> {
        if !nodes.get(uri).is_some_and(|node| node.capacity.is_retired()) {
            return None;
        }
        info!(uri, "Removing cluster node with zero capacity");
        nodes.remove(uri).map(|node| node.instance)
    }
}

/// A set of cache nodes sharing the key space through a consistent hash ring
#[derive(Clone)]
pub struct ShardedCluster {
    inner: Arc<ClusterInner>,
}

impl Default for ShardedCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl ShardedCluster {
    /// Create an empty, disconnected cluster
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ClusterInner {
                state: RwLock::new(ClusterState::default()),
                connected: AtomicBool::new(false),
                metrics: CacheMetrics::new(),
            }),
        }
    }

    /// Add a node. It joins the ring with zero points and moves to
    /// `options.capacity` once the cluster is connected.
    ///
    /// The cluster does not connect the instance itself when it is already
    /// connected; callers adding nodes to a live cluster connect them first.
    ///
    /// A zero capacity is rejected: a node with no points and a zero target
    /// is retired as soon as it is scheduled. Park a node by lowering its
    /// capacity with [`set_node_capacity`](Self::set_node_capacity) instead.
    pub fn add_node(
        &self,
        uri: impl Into<String>,
        instance: SharedInstance,
        options: NodeOptions,
    ) -> Result<()> {
        let uri = uri.into();
        if options.capacity == 0 {
            return Err(Error::InvalidArgument(format!(
                "node {} added with zero capacity",
                uri
            )));
        }

        let mut state = self.inner.state.write();
        if state.nodes.contains_key(&uri) {
            return Err(Error::InvalidArgument(format!("node {} already exists", uri)));
        }
        state.nodes.insert(
            uri.clone(),
            ClusterNode {
                instance,
                capacity: NodeCapacity::new(options.capacity, options.warm_up),
                ramp: None,
            },
        );
        info!(uri = %uri, capacity = options.capacity, "Added cluster node");

        // A non-zero target never retires the node here.
        let _ = self.inner.schedule(&mut state, &uri);
        Ok(())
    }

    /// Change a node's target capacity and warm-up interval.
    ///
    /// With no warm-up the ring changes at once. A node whose current and
    /// target capacity both reach zero is removed and its instance destroyed.
    /// Setting zero on an unknown node is a no-op.
    pub async fn set_node_capacity(
        &self,
        uri: &str,
        capacity: usize,
        warm_up: Option<Duration>,
    ) -> Result<()> {
        let retired = {
            let mut state = self.inner.state.write();
            let Some(node) = state.nodes.get_mut(uri) else {
                if capacity == 0 {
                    return Ok(());
                }
                return Err(Error::InvalidArgument(format!("unknown node {}", uri)));
            };
            node.capacity.target = capacity;
            node.capacity.warm_up = warm_up;
            self.inner.schedule(&mut state, uri)
        };

        if let Some(instance) = retired {
            instance.destroy().await;
        }
        Ok(())
    }

    pub fn node_capacity(&self, uri: &str) -> Option<NodeCapacity> {
        self.inner.state.read().nodes.get(uri).map(|node| node.capacity)
    }

    pub fn ramp_state(&self, uri: &str) -> Option<RampState> {
        self.node_capacity(uri).map(|capacity| capacity.state())
    }

    /// Points `uri` currently owns on the ring
    pub fn ring_points(&self, uri: &str) -> usize {
        self.inner.state.read().ring.node_points(uri)
    }

    /// URIs of every node, sorted
    pub fn node_uris(&self) -> Vec<String> {
        let mut uris: Vec<String> = self.inner.state.read().nodes.keys().cloned().collect();
        uris.sort();
        uris
    }

    pub fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    pub fn metrics(&self) -> &CacheMetrics {
        &self.inner.metrics
    }

    /// Delete many keys, one concurrent sub-call per key on its owning node.
    pub async fn mdel(&self, keys: &[String]) -> Result<()> {
        self.inner.metrics.record_call(Operation::Del);
        if keys.is_empty() {
            return Ok(());
        }
        let batches = self.partition(keys)?;

        let calls = batches.iter().flat_map(|batch| {
            batch.indices.iter().map(move |&index| {
                let key = keys[index].as_str();
                async move { (batch, key, batch.instance.del(key).await) }
            })
        });

        let mut outcome = PartialResultBuilder::new();
        for (batch, key, result) in join_all(calls).await {
            match result {
                Ok(()) => outcome.succeed(key, None),
                Err(error) => {
                    self.inner.metrics.record_failed_keys(Operation::Del, 1);
                    warn!(node = %batch.uri, key, error = %error, "Cluster del sub-call failed");
                    outcome.fail([key], &error);
                }
            }
        }

        if outcome.has_errors() {
            return Err(outcome.build().into());
        }
        Ok(())
    }

    fn instances(&self) -> Vec<(String, SharedInstance)> {
        self.inner
            .state
            .read()
            .nodes
            .iter()
            .map(|(uri, node)| (uri.clone(), Arc::clone(&node.instance)))
            .collect()
    }

    fn route(&self, key: &str) -> Result<(Arc<str>, SharedInstance)> {
        let state = self.inner.state.read();
        let uri = state
            .ring
            .primary(key)
            .ok_or_else(|| Error::NoRoute(key.to_string()))?;
        let node = state
            .nodes
            .get(&*uri)
            .ok_or_else(|| Error::Internal(format!("ring points at unknown node {}", uri)))?;
        Ok((uri, Arc::clone(&node.instance)))
    }

    /// Group key positions by owning node, in order of first appearance.
    fn partition<K: AsRef<str>>(&self, keys: &[K]) -> Result<Vec<NodeBatch>> {
        let state = self.inner.state.read();
        let owners = state.ring.lookup_many(keys);

        let mut batches: Vec<NodeBatch> = Vec::new();
        let mut slots: HashMap<Arc<str>, usize> = HashMap::new();
        for (index, owner) in owners.into_iter().enumerate() {
            let uri = owner.ok_or_else(|| Error::NoRoute(keys[index].as_ref().to_string()))?;
            let slot = match slots.get(&uri) {
                Some(&slot) => slot,
                None => {
                    let node = state.nodes.get(&*uri).ok_or_else(|| {
                        Error::Internal(format!("ring points at unknown node {}", uri))
                    })?;
                    batches.push(NodeBatch {
                        uri: Arc::clone(&uri),
                        instance: Arc::clone(&node.instance),
                        indices: Vec::new(),
                    });
                    slots.insert(uri, batches.len() - 1);
                    batches.len() - 1
                }
            };
            batches[slot].indices.push(index);
        }
        Ok(batches)
    }

    fn record_failure(&self, op: Operation, uri: &str, error: &Error) {
        self.inner.metrics.record_failed_keys(op, 1);
        debug!(node = uri, op = %op, error = %error, "Cluster node call failed");
    }
}

#[async_trait]
impl CacheInstance for ShardedCluster {
    fn is_available(&self) -> bool {
        self.inner.is_connected()
            && self
                .inner
                .state
                .read()
                .nodes
                .values()
                .any(|node| node.instance.is_available())
    }

    async fn connect(&self) -> Result<()> {
        self.inner.connected.store(true, Ordering::Release);

        let instances = self.instances();
        let connects = instances
            .iter()
            .map(|(uri, instance)| async move { (uri, instance.connect().await) });
        for (uri, result) in join_all(connects).await {
            if let Err(error) = result {
                warn!(node = %uri, error = %error, "Failed to connect cluster node");
            }
        }

        let retired: Vec<SharedInstance> = {
            let mut state = self.inner.state.write();
            let uris: Vec<String> = state.nodes.keys().cloned().collect();
            uris.iter()
                .filter_map(|uri| self.inner.schedule(&mut state, uri))
                .collect()
        };
        join_all(retired.iter().map(|instance| instance.destroy())).await;

        info!(nodes = instances.len(), "Cluster connected");
        Ok(())
    }

    async fn disconnect(&self) {
        self.inner.connected.store(false, Ordering::Release);
        {
            let mut state = self.inner.state.write();
            for node in state.nodes.values_mut() {
                node.ramp = None;
            }
        }

        let instances = self.instances();
        join_all(instances.iter().map(|(_, instance)| instance.disconnect())).await;
        info!(nodes = instances.len(), "Cluster disconnected");
    }

    async fn destroy(&self) {
        self.disconnect().await;
        let nodes: Vec<ClusterNode> = {
            let mut state = self.inner.state.write();
            state.ring = HashRing::new();
            state.nodes.drain().map(|(_, node)| node).collect()
        };
        join_all(nodes.iter().map(|node| node.instance.destroy())).await;
        info!(nodes = nodes.len(), "Cluster destroyed");
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        self.inner.metrics.record_call(Operation::Get);
        let (uri, instance) = self.route(key)?;
        match instance.get(key).await {
            Ok(value) => {
                self.inner.metrics.record_reads(std::slice::from_ref(&value));
                Ok(value)
            }
            Err(error) => {
                self.record_failure(Operation::Get, &uri, &error);
                Err(error)
            }
        }
    }

    #[instrument(skip(self, keys), fields(keys = keys.len()))]
    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<Bytes>>> {
        self.inner.metrics.record_call(Operation::Mget);
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let batches = self.partition(keys)?;

        let calls = batches.iter().map(|batch| async move {
            let sub_keys: Vec<String> = batch.indices.iter().map(|&i| keys[i].clone()).collect();
            let result = match batch.instance.mget(&sub_keys).await {
                Ok(found) if found.len() != sub_keys.len() => Err(Error::Internal(format!(
                    "node {} returned {} values for {} keys",
                    batch.uri,
                    found.len(),
                    sub_keys.len()
                ))),
                other => other,
            };
            (batch, result)
        });

        let mut values: Vec<Option<Bytes>> = vec![None; keys.len()];
        let mut answered: Vec<&NodeBatch> = Vec::with_capacity(batches.len());
        let mut failed: Vec<(&NodeBatch, Error)> = Vec::new();
        for (batch, result) in join_all(calls).await {
            match result {
                Ok(found) => {
                    for (&index, value) in batch.indices.iter().zip(found) {
                        values[index] = value;
                    }
                    answered.push(batch);
                }
                Err(error) => {
                    self.inner
                        .metrics
                        .record_failed_keys(Operation::Mget, batch.indices.len());
                    warn!(
                        node = %batch.uri,
                        keys = batch.indices.len(),
                        error = %error,
                        "Cluster mget sub-call failed"
                    );
                    failed.push((batch, error));
                }
            }
        }

        if failed.is_empty() {
            self.inner.metrics.record_reads(&values);
            return Ok(values);
        }

        let mut outcome = PartialResultBuilder::new();
        for batch in answered {
            for &index in &batch.indices {
                outcome.succeed(&keys[index], values[index].clone());
            }
        }
        for (batch, error) in &failed {
            outcome.fail(batch.indices.iter().map(|&i| keys[i].as_str()), error);
        }
        Err(outcome.build().into())
    }

    async fn set(
        &self,
        key: &str,
        value: Bytes,
        max_age: Option<Duration>,
        set_if_absent: bool,
    ) -> Result<()> {
        self.inner.metrics.record_call(Operation::Set);
        let (uri, instance) = self.route(key)?;
        instance
            .set(key, value, max_age, set_if_absent)
            .await
            .inspect_err(|error| self.record_failure(Operation::Set, &uri, error))
    }

    #[instrument(skip(self, items), fields(items = items.len()))]
    async fn mset(
        &self,
        items: &[CacheItem],
        max_age: Option<Duration>,
        set_if_absent: bool,
    ) -> Result<()> {
        self.inner.metrics.record_call(Operation::Mset);
        if items.is_empty() {
            return Ok(());
        }
        let keys: Vec<&str> = items.iter().map(|item| item.key.as_str()).collect();
        let batches = self.partition(&keys)?;

        let calls = batches.iter().map(|batch| async move {
            let sub_items: Vec<CacheItem> =
                batch.indices.iter().map(|&i| items[i].clone()).collect();
            (batch, batch.instance.mset(&sub_items, max_age, set_if_absent).await)
        });

        let mut outcome = PartialResultBuilder::new();
        for (batch, result) in join_all(calls).await {
            let batch_keys = batch.indices.iter().map(|&i| keys[i]);
            match result {
                Ok(()) => {
                    for key in batch_keys {
                        outcome.succeed(key, None);
                    }
                }
                Err(error) => {
                    self.inner
                        .metrics
                        .record_failed_keys(Operation::Mset, batch.indices.len());
                    warn!(
                        node = %batch.uri,
                        items = batch.indices.len(),
                        error = %error,
                        "Cluster mset sub-call failed"
                    );
                    outcome.fail(batch_keys, &error);
                }
            }
        }

        if outcome.has_errors() {
            return Err(outcome.build().into());
        }
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<()> {
        self.inner.metrics.record_call(Operation::Del);
        let (uri, instance) = self.route(key)?;
        instance
            .del(key)
            .await
            .inspect_err(|error| self.record_failure(Operation::Del, &uri, error))
    }

    fn uris_by_key(&self, key: &str) -> Vec<String> {
        match self.route(key) {
            Ok((uri, instance)) => {
                let uris = instance.uris_by_key(key);
                if uris.is_empty() {
                    vec![uri.to_string()]
                } else {
                    uris
                }
            }
            Err(_) => Vec::new(),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
