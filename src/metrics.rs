//! Cache Metrics Collection
//!
//! Passive counters each component updates as it routes requests. Nothing
//! here exports or aggregates across processes; callers read snapshots.

use std::sync::atomic::{AtomicU64, Ordering};

/// Operations tracked per component
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Get,
    Mget,
    Set,
    Mset,
    Del,
}

impl Operation {
    fn index(self) -> usize {
        match self {
            Operation::Get => 0,
            Operation::Mget => 1,
            Operation::Set => 2,
            Operation::Mset => 3,
            Operation::Del => 4,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Operation::Get => "get",
            Operation::Mget => "mget",
            Operation::Set => "set",
            Operation::Mset => "mset",
            Operation::Del => "del",
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

const OPERATIONS: usize = 5;

/// Cache metrics collector
#[derive(Debug, Default)]
pub struct CacheMetrics {
    // Per-operation call counts
    calls: [AtomicU64; OPERATIONS],
    // Per-operation failed keys
    failed_keys: [AtomicU64; OPERATIONS],

    // Read accounting
    accesses: AtomicU64,
    hits: AtomicU64,

    // Multiplexer accounting
    coalesced_reads: AtomicU64,
    delegate_fetches: AtomicU64,
}

impl CacheMetrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_call(&self, op: Operation) {
        self.calls[op.index()].fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed_keys(&self, op: Operation, keys: usize) {
        self.failed_keys[op.index()].fetch_add(keys as u64, Ordering::Relaxed);
    }

    /// Count a read result: one access per value, one hit per `Some`.
    pub fn record_reads<T>(&self, values: &[Option<T>]) {
        self.accesses.fetch_add(values.len() as u64, Ordering::Relaxed);
        let hits = values.iter().filter(|v| v.is_some()).count();
        self.hits.fetch_add(hits as u64, Ordering::Relaxed);
    }

    pub fn record_coalesced(&self, keys: usize) {
        self.coalesced_reads.fetch_add(keys as u64, Ordering::Relaxed);
    }

    pub fn record_delegate_fetch(&self) {
        self.delegate_fetches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn calls(&self, op: Operation) -> u64 {
        self.calls[op.index()].load(Ordering::Relaxed)
    }

    pub fn failed_keys(&self, op: Operation) -> u64 {
        self.failed_keys[op.index()].load(Ordering::Relaxed)
    }

    pub fn accesses(&self) -> u64 {
        self.accesses.load(Ordering::Relaxed)
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn hit_ratio(&self) -> f64 {
        let accesses = self.accesses() as f64;
        if accesses == 0.0 {
            0.0
        } else {
            self.hits() as f64 / accesses
        }
    }

    /// Reset access and hit counts, e.g. at the start of a reporting interval.
    pub fn reset_counts(&self) {
        self.accesses.store(0, Ordering::Relaxed);
        self.hits.store(0, Ordering::Relaxed);
    }

    /// Get a point-in-time snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        let per_op = |counters: &[AtomicU64; OPERATIONS]| {
            let mut out = [0u64; OPERATIONS];
            for (slot, counter) in out.iter_mut().zip(counters.iter()) {
                *slot = counter.load(Ordering::Relaxed);
            }
            out
        };

        MetricsSnapshot {
            calls: per_op(&self.calls),
            failed_keys: per_op(&self.failed_keys),
            accesses: self.accesses(),
            hits: self.hits(),
            hit_ratio: self.hit_ratio(),
            coalesced_reads: self.coalesced_reads.load(Ordering::Relaxed),
            delegate_fetches: self.delegate_fetches.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time metrics snapshot
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricsSnapshot {
    calls: [u64; OPERATIONS],
    failed_keys: [u64; OPERATIONS],
    pub accesses: u64,
    pub hits: u64,
    pub hit_ratio: f64,
    pub coalesced_reads: u64,
    pub delegate_fetches: u64,
}

impl MetricsSnapshot {
    pub fn calls(&self, op: Operation) -> u64 {
        self.calls[op.index()]
    }

    pub fn failed_keys(&self, op: Operation) -> u64 {
        self.failed_keys[op.index()]
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_per_operation_counters() {
        let metrics = CacheMetrics::new();
        metrics.record_call(Operation::Mget);
        metrics.record_call(Operation::Mget);
        metrics.record_failed_keys(Operation::Mget, 7);
        metrics.record_call(Operation::Del);

        assert_eq!(metrics.calls(Operation::Mget), 2);
        assert_eq!(metrics.calls(Operation::Del), 1);
        assert_eq!(metrics.calls(Operation::Set), 0);
        assert_eq!(metrics.failed_keys(Operation::Mget), 7);
    }

    #[test]
    fn test_hit_ratio() {
        let metrics = CacheMetrics::new();
        assert_eq!(metrics.hit_ratio(), 0.0);

        metrics.record_reads(&[Some(1), None, Some(3), None]);
        assert_eq!(metrics.accesses(), 4);
        assert_eq!(metrics.hits(), 2);
        assert_eq!(metrics.hit_ratio(), 0.5);

        metrics.reset_counts();
        assert_eq!(metrics.accesses(), 0);
    }

    #[test]
    fn test_snapshot() {
        let metrics = CacheMetrics::new();
        metrics.record_call(Operation::Get);
        metrics.record_coalesced(3);
        metrics.record_delegate_fetch();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.calls(Operation::Get), 1);
        assert_eq!(snapshot.coalesced_reads, 3);
        assert_eq!(snapshot.delegate_fetches, 1);
        assert_eq!(Operation::Mset.to_string(), "mset");
    }
}
