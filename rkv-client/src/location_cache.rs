//! # Region Location Cache
//!
//! Purpose: Remember which server owns each partition so most row lookups never
//! touch the metadata table.
//!
//! ## Design Principles
//! 1. **Sorted Per-Table Maps**: Start keys live in a `BTreeMap`, so the owning
//!    partition of a row is a floor lookup plus an end-key check.
//! 2. **Single Writer Lock**: One `RwLock` covers every table of a connection.
//!    Reads are the hot path and share the lock; writes serialize, which makes the
//!    staleness check atomic with the replacement.
//! 3. **Sequence-Ordered Updates**: An update whose open sequence number is not
//!    newer than the cached one is ignored.
//! 4. **Bounded Tables**: An optional per-table capacity evicts the oldest
//!    insertion first.
//!
//! ## Structure Overview
//!
//! ```text
//! RegionLocationCache
//!   └── state: RwLock<CacheState>
//!         ├── tables: HashMap<TableName, BTreeMap<start key, CachedEntry>>
//!         │     └── CachedEntry { location: Arc<Location>, generation }
//!         └── servers: HashSet<ServerName>   (referenced by some entry)
//! ```

use std::collections::{BTreeMap, HashMap, HashSet};
use std::ops::Bound;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;
use rkv_common::{Location, ServerName, TableName};
use tracing::{debug, trace};

#[derive(Debug, Clone)]
struct CachedEntry {
    location: Arc<Location>,
    // Insertion order, used for capacity eviction.
    generation: u64,
}

#[derive(Debug, Default)]
struct CacheState {
    tables: HashMap<TableName, BTreeMap<Bytes, CachedEntry>>,
    servers: HashSet<ServerName>,
    next_generation: u64,
}

impl CacheState {
    fn lookup(&self, table: &TableName, row: &[u8]) -> Option<&CachedEntry> {
        let entries = self.tables.get(table)?;
        let (_, entry) = entries
            .range::<[u8], _>((Bound::Unbounded, Bound::Included(row)))
            .next_back()?;
        if entry.location.descriptor().row_below_end(row) {
            Some(entry)
        } else {
            None
        }
    }

    fn remove(&mut self, table: &TableName, start_key: &[u8]) -> Option<Arc<Location>> {
        let entries = self.tables.get_mut(table)?;
        entries.remove(start_key).map(|entry| entry.location)
    }
}

/// Per-connection cache of partition locations.
#[derive(Debug, Default)]
pub struct RegionLocationCache {
    state: RwLock<CacheState>,
    capacity: usize,
}

impl RegionLocationCache {
    /// Creates a cache keeping at most `capacity` entries per table (0 = unbounded).
    pub fn new(capacity: usize) -> Self {
        RegionLocationCache {
            state: RwLock::new(CacheState::default()),
            capacity,
        }
    }

    /// Returns the cached location of the partition containing `row`.
    ///
    /// A hit requires the greatest start key `<= row` and `row` below that
    /// partition's end key.
    pub fn get(&self, table: &TableName, row: &[u8]) -> Option<Arc<Location>> {
        let state = self.state.read();
        state.lookup(table, row).map(|entry| entry.location.clone())
    }

    /// Caches `location`, unless it is older than what is already cached.
    ///
    /// `source` is the server that reported a redirect, or `None` for an update
    /// read from the metadata table. Both kinds are ignored when the incoming
    /// sequence number is not greater than the cached one. Returns true when the
    /// cache changed.
    pub fn put(&self, table: &TableName, source: Option<&ServerName>, location: Location) -> bool {
        let mut state = self.state.write();
        state.servers.insert(location.server().clone());

        let generation = state.next_generation;
        state.next_generation += 1;

        let entries = state.tables.entry(table.clone()).or_default();
        let start_key = location.start_key().clone();
        if let Some(old) = entries.get(&start_key) {
            if location.seq_num() <= old.location.seq_num() {
                trace!(
                    table = %table,
                    from_meta = source.is_none(),
                    cached_seq = old.location.seq_num(),
                    new_seq = location.seq_num(),
                    "ignoring stale location update"
                );
                return false;
            }
        }

        trace!(table = %table, location = %location, "caching location");
        entries.insert(
            start_key.clone(),
            CachedEntry {
                location: Arc::new(location),
                generation,
            },
        );

        if self.capacity > 0 && entries.len() > self.capacity {
            let oldest = entries
                .iter()
                .filter(|(key, _)| **key != start_key)
                .min_by_key(|(_, entry)| entry.generation)
                .map(|(key, _)| key.clone());
            if let Some(key) = oldest {
                entries.remove(&key);
                debug!(table = %table, capacity = self.capacity, "evicted oldest cached location");
            }
        }
        true
    }

    /// Removes the entry covering `row`, returning it.
    pub fn invalidate(&self, table: &TableName, row: &[u8]) -> Option<Arc<Location>> {
        let mut state = self.state.write();
        let start_key = state.lookup(table, row)?.location.start_key().clone();
        let removed = state.remove(table, &start_key);
        if let Some(location) = &removed {
            debug!(table = %table, location = %location, "removed cached location");
        }
        removed
    }

    /// Removes the entry covering `row` only if it still points at `source`.
    pub fn invalidate_if_source(
        &self,
        table: &TableName,
        row: &[u8],
        source: &ServerName,
    ) -> Option<Arc<Location>> {
        let mut state = self.state.write();
        let entry = state.lookup(table, row)?;
        if !entry.location.server().same_endpoint(source) {
            return None;
        }
        let start_key = entry.location.start_key().clone();
        let removed = state.remove(table, &start_key);
        if let Some(location) = &removed {
            debug!(table = %table, location = %location, source = %source, "removed cached location");
        }
        removed
    }

    /// Removes whatever entry is cached under `location`'s start key.
    pub fn invalidate_location(&self, location: &Location) -> Option<Arc<Location>> {
        let mut state = self.state.write();
        let removed = state.remove(location.table(), location.start_key());
        if removed.is_some() {
            debug!(location = %location, "removed cached location");
        }
        removed
    }

    /// Removes every entry on `server` across all tables; returns how many.
    pub fn invalidate_all(&self, server: &ServerName) -> usize {
        let mut state = self.state.write();
        if !state.servers.remove(server) {
            return 0;
        }
        let mut removed = 0;
        for entries in state.tables.values_mut() {
            let before = entries.len();
            entries.retain(|_, entry| entry.location.server() != server);
            removed += before - entries.len();
        }
        debug!(server = %server, removed, "removed cached locations for server");
        removed
    }

    /// Drops cached entries for one table, or for every table.
    pub fn clear(&self, table: Option<&TableName>) {
        let mut state = self.state.write();
        match table {
            Some(table) => {
                state.tables.remove(table);
            }
            None => {
                state.tables.clear();
                state.servers.clear();
            }
        }
    }

    /// Number of cached entries for `table`.
    pub fn cached_count(&self, table: &TableName) -> usize {
        let state = self.state.read();
        state.tables.get(table).map(BTreeMap::len).unwrap_or(0)
    }

    /// Returns true when a valid entry covers `row`.
    pub fn is_cached(&self, table: &TableName, row: &[u8]) -> bool {
        self.state.read().lookup(table, row).is_some()
    }

    /// Returns true when some cached entry was last known on `server`.
    pub fn references_server(&self, server: &ServerName) -> bool {
        self.state.read().servers.contains(server)
    }
}
