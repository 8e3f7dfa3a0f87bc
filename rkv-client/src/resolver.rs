//! # Region Resolver
//!
//! Purpose: Turn `(table, row)` into the location of the partition serving it,
//! consulting the cache first and the metadata table otherwise.
//!
//! ## Design Principles
//! 1. **Cache First**: A valid cache hit returns without any I/O.
//! 2. **One Lookup per Table**: A per-table async lock serializes metadata reads
//!    for the same table; waiters re-check the cache once they get the lock.
//! 3. **Read Ahead**: Under the lock, a miss prefetches the next few partitions of
//!    the table so neighbouring rows resolve from cache.
//! 4. **Bounded Retries**: Transient failures retry with table-driven backoff;
//!    a floor row of another table and a dead owner fail at once. An empty
//!    floor lookup is retried and ends in `NotFound`.
//!
//! ## Lookup Algorithm
//!
//! ```text
//! locate(table, row)
//!   cache hit? ──yes──> done
//!   for attempt in 0..N:
//!     meta  = metadata partition location (coordinator, cached per resolver)
//!     lock(table)
//!       recheck cache / prefetch       (or drop the entry when relocating)
//!       row = meta.get_row_or_before("table,row,99999999999999")
//!     validate row ──ok──> cache + return
//!     floor row of another table / dead owner ──> fail
//!     last attempt ──> fail with this error
//!     relocate meta unless RegionOffline / NotFound; sleep pause_time(attempt)
//! ```

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use rkv_common::{meta_key, Location, MetaRow, ServerName, TableName};
use tracing::{debug, trace, warn};

use crate::config::{pause_time, ConnectionConfig};
use crate::error::{ClientError, Result};
use crate::keepalive::KeepAliveCoordinatorLink;
use crate::keyed_lock::KeyedLocks;
use crate::location_cache::RegionLocationCache;
use crate::metrics::ClientMetrics;
use crate::rpc::RegionServerStub;
use crate::stub_pool::{DeadServers, StubPool};

/// Failure of one lookup attempt.
enum LookupError {
    /// Retrying cannot change the answer.
    Fatal(ClientError),
    /// Worth another attempt.
    Transient(ClientError),
}

impl From<ClientError> for LookupError {
    fn from(err: ClientError) -> Self {
        LookupError::Transient(err)
    }
}

impl From<anyhow::Error> for LookupError {
    fn from(err: anyhow::Error) -> Self {
        LookupError::Transient(err.into())
    }
}

/// Resolves rows to partition locations for one connection.
pub struct Resolver {
    cache: Arc<RegionLocationCache>,
    pool: Arc<StubPool>,
    link: KeepAliveCoordinatorLink,
    dead: Arc<DeadServers>,
    metrics: Arc<ClientMetrics>,
    pause: Duration,
    retries: u32,
    prefetch_limit: usize,
    table_locks: KeyedLocks<TableName>,
    prefetch_disabled: RwLock<HashSet<TableName>>,
    meta_location: Mutex<Option<Arc<Location>>>,
}

impl Resolver {
    pub fn new(
        config: &ConnectionConfig,
        cache: Arc<RegionLocationCache>,
        pool: Arc<StubPool>,
        link: KeepAliveCoordinatorLink,
        dead: Arc<DeadServers>,
        metrics: Arc<ClientMetrics>,
    ) -> Self {
        Resolver {
            cache,
            pool,
            link,
            dead,
            metrics,
            pause: config.pause,
            retries: config.retries.max(1),
            prefetch_limit: config.prefetch_limit,
            table_locks: KeyedLocks::new(),
            prefetch_disabled: RwLock::new(HashSet::new()),
            meta_location: Mutex::new(None),
        }
    }

    /// Returns the location of the partition of `table` containing `row`.
    ///
    /// With `use_cache` false the cached entry is dropped and the metadata table
    /// is consulted. With `retry` false a single attempt is made.
    pub async fn locate(
        &self,
        table: &TableName,
        row: &[u8],
        use_cache: bool,
        retry: bool,
    ) -> Result<Arc<Location>> {
        if table.is_empty() {
            return Err(ClientError::InvalidArgument(
                "table name cannot be empty".into(),
            ));
        }
        if table.is_meta() {
            if !use_cache {
                self.relocate_meta();
            }
            return self.meta_location().await;
        }

        if use_cache {
            if let Some(location) = self.cache.get(table, row) {
                self.metrics.record_cache_hit();
                return Ok(location);
            }
            self.metrics.record_cache_miss();
        }

        let key = meta_key(table, row);
        let attempts = if retry { self.retries } else { 1 };
        for attempt in 0..attempts {
            let err = match self.lookup_once(table, row, &key, use_cache).await {
                Ok(location) => return Ok(location),
                Err(LookupError::Fatal(err)) => return Err(err),
                Err(LookupError::Transient(err)) => err,
            };

            if attempt + 1 >= attempts {
                return Err(err);
            }

            let pause = pause_time(self.pause, attempt);
            debug!(
                table = %table,
                attempt = attempt + 1,
                max = attempts,
                pause_ms = pause.as_millis() as u64,
                error = %err,
                "metadata lookup failed; retrying"
            );
            if !matches!(
                err,
                ClientError::RegionOffline { .. } | ClientError::NotFound { .. }
            ) {
                self.relocate_meta();
            }
            tokio::time::sleep(pause).await;
        }

        Err(ClientError::not_found(
            table,
            row,
            format!("unable to find region after {} tries", attempts),
        ))
    }

    async fn lookup_once(
        &self,
        table: &TableName,
        row: &[u8],
        key: &Bytes,
        use_cache: bool,
    ) -> std::result::Result<Arc<Location>, LookupError> {
        let meta = self.meta_location().await?;
        let stub = self.pool.region_stub(meta.server()).await?;
        let meta_region = meta.descriptor().region_name();

        let meta_row = {
            let _guard = self.table_locks.lock(table).await;
            if use_cache {
                if let Some(location) = self.cache.get(table, row) {
                    return Ok(location);
                }
                if self.region_cache_prefetch(table) && self.prefetch_limit > 0 {
                    self.prefetch(stub.as_ref(), &meta_region, table, key).await;
                    if let Some(location) = self.cache.get(table, row) {
                        return Ok(location);
                    }
                }
            } else {
                self.cache.invalidate(table, row);
            }
            self.metrics.record_meta_lookup();
            stub.get_row_or_before(&meta_region, key).await?
        };

        let meta_row = meta_row.ok_or_else(|| no_partitions(table, row))?;
        let location = validate_row(table, row, meta_row)?;
        if self.dead.is_dead(location.server()) {
            return Err(LookupError::Fatal(ClientError::ServerStopped(
                location.server().clone(),
            )));
        }

        let location = Arc::new(location);
        self.cache.put(table, None, Location::clone(&location));
        trace!(table = %table, location = %location, "resolved from metadata");
        Ok(location)
    }

    /// Caches up to `prefetch_limit` partitions starting at `key`'s partition.
    ///
    /// Failures are logged and otherwise ignored.
    async fn prefetch(
        &self,
        stub: &dyn RegionServerStub,
        meta_region: &[u8],
        table: &TableName,
        key: &[u8],
    ) {
        let rows = match stub.scan_metadata(meta_region, key, self.prefetch_limit).await {
            Ok(rows) => rows,
            Err(err) => {
                warn!(table = %table, error = %err, "metadata prefetch failed");
                return;
            }
        };
        let cached = self.cache_scanned_rows(table, rows).len();
        self.metrics.record_prefetched(cached as u64);
        trace!(table = %table, cached, "prefetched locations");
    }

    /// Caches every usable row of `table` until the scan leaves the table.
    fn cache_scanned_rows(&self, table: &TableName, rows: Vec<MetaRow>) -> Vec<Arc<Location>> {
        let mut locations = Vec::new();
        for row in rows {
            let descriptor = match row.descriptor {
                Some(descriptor) => descriptor,
                None => continue,
            };
            if descriptor.table != *table {
                if locations.is_empty() && descriptor.table < *table {
                    // Floor row from the preceding table.
                    continue;
                }
                break;
            }
            if descriptor.offline || descriptor.split {
                continue;
            }
            let server = match row.server {
                Some(server) if !self.dead.is_dead(&server) => server,
                _ => continue,
            };
            let location = Location::new(descriptor, server, row.seq_num);
            self.cache.put(table, None, location.clone());
            locations.push(Arc::new(location));
        }
        locations
    }

    /// Returns the online partitions of `table` in key order, caching each.
    pub async fn locate_regions(&self, table: &TableName) -> Result<Vec<Arc<Location>>> {
        if table.is_empty() || table.is_meta() {
            return Err(ClientError::InvalidArgument(format!(
                "cannot list regions of table '{}'",
                table
            )));
        }
        let meta = self.meta_location().await?;
        let stub = self.pool.region_stub(meta.server()).await?;
        let rows = stub
            .scan_metadata(&meta.descriptor().region_name(), &meta_key(table, b""), usize::MAX)
            .await?;
        self.metrics.record_meta_lookup();

        let has_table = rows
            .iter()
            .any(|row| matches!(&row.descriptor, Some(d) if d.table == *table));
        if !has_table {
            return Err(ClientError::TableNotFound(table.clone()));
        }
        Ok(self.cache_scanned_rows(table, rows))
    }

    /// Location of the metadata partition, read from the coordinator on a miss.
    pub async fn meta_location(&self) -> Result<Arc<Location>> {
        let cached = self.meta_location.lock().clone();
        if let Some(location) = cached {
            return Ok(location);
        }

        let session = self.link.session().await?;
        let location = session.session().metadata_location().await?;
        drop(session);

        match location {
            Some(location) => {
                let location = Arc::new(location);
                *self.meta_location.lock() = Some(location.clone());
                debug!(location = %location, "located metadata partition");
                Ok(location)
            }
            None => Err(ClientError::not_found(
                &TableName::meta(),
                b"",
                "metadata location is not published",
            )),
        }
    }

    /// Forgets the metadata partition location so the next lookup re-reads it.
    pub fn relocate_meta(&self) {
        if self.meta_location.lock().take().is_some() {
            debug!("relocating metadata partition");
        }
    }

    /// Drops the metadata location if it points at `server`.
    pub fn forget_meta_on(&self, server: &ServerName) {
        let mut slot = self.meta_location.lock();
        if matches!(slot.as_ref(), Some(loc) if loc.server() == server) {
            *slot = None;
        }
    }

    pub fn set_region_cache_prefetch(&self, table: &TableName, enable: bool) {
        let mut disabled = self.prefetch_disabled.write();
        if enable {
            disabled.remove(table);
        } else {
            disabled.insert(table.clone());
        }
    }

    pub fn region_cache_prefetch(&self, table: &TableName) -> bool {
        !self.prefetch_disabled.read().contains(table)
    }
}

fn no_partitions(table: &TableName, row: &[u8]) -> ClientError {
    ClientError::not_found(table, row, format!("table {} has no partitions", table))
}

/// Checks a metadata row for `table`/`row` and builds its location.
fn validate_row(
    table: &TableName,
    row: &[u8],
    meta_row: MetaRow,
) -> std::result::Result<Location, LookupError> {
    let descriptor = meta_row.descriptor.ok_or_else(|| {
        ClientError::MalformedMetadata(format!(
            "metadata row for {} has no partition descriptor",
            table
        ))
    })?;

    if descriptor.table != *table {
        return Err(LookupError::Fatal(ClientError::TableNotFound(table.clone())));
    }
    if !descriptor.contains_row(row) {
        return Err(ClientError::not_found(
            table,
            row,
            format!(
                "region {} does not cover the row; metadata may be mid-update",
                descriptor.region_name_string()
            ),
        )
        .into());
    }
    if descriptor.split {
        return Err(ClientError::RegionOffline {
            region: descriptor.region_name_string(),
            reason: "only available region is a split parent; daughters should be online soon"
                .into(),
        }
        .into());
    }
    if descriptor.offline {
        return Err(ClientError::RegionOffline {
            region: descriptor.region_name_string(),
            reason: "region is offline; the table may be disabled".into(),
        }
        .into());
    }

    let server = match meta_row.server {
        Some(server) => server,
        None => {
            return Err(ClientError::not_found(
                table,
                row,
                format!(
                    "no server address listed for region {}",
                    descriptor.region_name_string()
                ),
            )
            .into())
        }
    };
    Ok(Location::new(descriptor, server, meta_row.seq_num))
}
