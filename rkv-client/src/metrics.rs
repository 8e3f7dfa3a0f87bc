//! # Client Metrics
//!
//! Lightweight counters describing how the connection core spends its effort:
//! cache efficiency, metadata traffic, retry pressure and idle reclamation.
//!
//! ## Design Principles
//! 1. **Accumulator Pattern**: Relaxed atomic counters aggregate events cheaply.
//! 2. **Zero-Cost Access**: Snapshots are plain structs without heap work.
//!
//! ## Notes
//! - Counters never reset; callers diff two snapshots to get rates.

use std::sync::atomic::{AtomicU64, Ordering};

/// Snapshot of all client counters at a point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub cache_hits: u64,
    pub cache_misses: u64,
    /// Floor-row lookups issued against the metadata table.
    pub meta_lookups: u64,
    /// Locations cached by prefetch scans.
    pub prefetched: u64,
    pub stubs_created: u64,
    pub batch_waves: u64,
    pub actions_retried: u64,
    pub actions_failed: u64,
    /// Idle coordinator sessions and stubs closed by the sweeper.
    pub idle_reclaimed: u64,
}

/// Thread-safe counters shared by every component of one connection.
///
/// `Ordering::Relaxed` is enough: fields are independent and only read for
/// reporting.
#[derive(Debug, Default)]
pub struct ClientMetrics {
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    meta_lookups: AtomicU64,
    prefetched: AtomicU64,
    stubs_created: AtomicU64,
    batch_waves: AtomicU64,
    actions_retried: AtomicU64,
    actions_failed: AtomicU64,
    idle_reclaimed: AtomicU64,
}

impl ClientMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_meta_lookup(&self) {
        self.meta_lookups.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_prefetched(&self, count: u64) {
        self.prefetched.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_stub_created(&self) {
        self.stubs_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_batch_wave(&self) {
        self.batch_waves.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retried(&self, count: u64) {
        self.actions_retried.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_failed(&self, count: u64) {
        self.actions_failed.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_idle_reclaimed(&self) {
        self.idle_reclaimed.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns a snapshot of all counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            meta_lookups: self.meta_lookups.load(Ordering::Relaxed),
            prefetched: self.prefetched.load(Ordering::Relaxed),
            stubs_created: self.stubs_created.load(Ordering::Relaxed),
            batch_waves: self.batch_waves.load(Ordering::Relaxed),
            actions_retried: self.actions_retried.load(Ordering::Relaxed),
            actions_failed: self.actions_failed.load(Ordering::Relaxed),
            idle_reclaimed: self.idle_reclaimed.load(Ordering::Relaxed),
        }
    }
}
