//! # Core Connection
//!
//! Purpose: The facade callers hold. It owns the location cache, stub pool,
//! coordinator link and resolver of one cluster connection and exposes location
//! lookup, batch execution, cache maintenance and lifecycle.
//!
//! ## Design Principles
//! 1. **Facade Pattern**: `CoreConnection` hides the resolver, pool and keep-alive
//!    machinery behind a small async API.
//! 2. **Explicit Sharing**: Instances are handed out as `Arc<CoreConnection>` and
//!    carry their own user count for the registry; nothing is finalized
//!    implicitly.
//! 3. **Idempotent Teardown**: `close` may be called any number of times.
//!
//! ## Structure Overview
//!
//! ```text
//! CoreConnection
//!   ├── cache:    Arc<RegionLocationCache>
//!   ├── pool:     Arc<StubPool>           ── RpcConnector
//!   ├── link:     KeepAliveCoordinatorLink ── Discovery  (+ SweepHandle)
//!   ├── resolver: Resolver  (cache + pool + link)
//!   └── dead:     Arc<DeadServers>
//! ```

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use rkv_common::{parse_region_name, Location, RemoteError, RowOperation, ServerName, TableName};
use tracing::{debug, error, info, warn};

use crate::batch::BatchProcess;
use crate::config::{ConnectionConfig, ConnectionKey, SWEEP_INTERVAL};
use crate::error::{ActionResult, ClientError, Result};
use crate::keepalive::{CoordinatorServiceHandle, KeepAliveCoordinatorLink, SweepHandle};
use crate::location_cache::RegionLocationCache;
use crate::metrics::{ClientMetrics, MetricsSnapshot};
use crate::resolver::Resolver;
use crate::rpc::{ClusterBackend, ServiceRole};
use crate::stub_pool::{DeadServers, StubPool};

/// Cluster id used when the coordinator has none published.
pub const DEFAULT_CLUSTER_ID: &str = "default-cluster";

/// Client-side connection core for one cluster.
pub struct CoreConnection {
    pub(crate) config: ConnectionConfig,
    key: ConnectionKey,
    cluster_id: String,
    pub(crate) cache: Arc<RegionLocationCache>,
    pub(crate) pool: Arc<StubPool>,
    pub(crate) resolver: Resolver,
    link: KeepAliveCoordinatorLink,
    dead: Arc<DeadServers>,
    pub(crate) metrics: Arc<ClientMetrics>,
    sweeper: Mutex<Option<SweepHandle>>,
    closed: AtomicBool,
    aborted: AtomicBool,
    refs: AtomicUsize,
}

impl CoreConnection {
    /// Builds a connection and starts its keep-alive sweeper.
    ///
    /// Must be called from within a tokio runtime.
    pub async fn connect(config: ConnectionConfig, backend: ClusterBackend) -> Result<Arc<Self>> {
        config.validate()?;

        let metrics = Arc::new(ClientMetrics::new());
        let dead = Arc::new(DeadServers::default());
        let cache = Arc::new(RegionLocationCache::new(config.location_cache_capacity));
        let pool = Arc::new(StubPool::new(
            backend.rpc.clone(),
            config.rpc_timeout,
            dead.clone(),
            metrics.clone(),
        ));
        let link = KeepAliveCoordinatorLink::new(
            backend.discovery.clone(),
            pool.clone(),
            dead.clone(),
            metrics.clone(),
            config.pause,
            config.retries,
        );
        let resolver = Resolver::new(
            &config,
            cache.clone(),
            pool.clone(),
            link.clone(),
            dead.clone(),
            metrics.clone(),
        );

        let cluster_id = retrieve_cluster_id(&link).await;
        let sweeper = link.start_sweeper(SWEEP_INTERVAL);
        info!(quorum = %config.quorum, cluster_id = %cluster_id, "connection established");

        Ok(Arc::new(CoreConnection {
            key: config.key(),
            config,
            cluster_id,
            cache,
            pool,
            resolver,
            link,
            dead,
            metrics,
            sweeper: Mutex::new(Some(sweeper)),
            closed: AtomicBool::new(false),
            aborted: AtomicBool::new(false),
            refs: AtomicUsize::new(0),
        }))
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Registry key of this connection's configuration.
    pub fn key(&self) -> &ConnectionKey {
        &self.key
    }

    pub fn cluster_id(&self) -> &str {
        &self.cluster_id
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(ClientError::Closed)
        } else {
            Ok(())
        }
    }

    // ---- location lookup ----

    /// Returns the location of the partition of `table` containing `row`.
    pub async fn locate(&self, table: &TableName, row: &[u8]) -> Result<Arc<Location>> {
        self.ensure_open()?;
        self.resolver.locate(table, row, true, true).await
    }

    /// Like `locate`, with explicit cache and retry control.
    pub async fn locate_with(
        &self,
        table: &TableName,
        row: &[u8],
        use_cache: bool,
        retry: bool,
    ) -> Result<Arc<Location>> {
        self.ensure_open()?;
        self.resolver.locate(table, row, use_cache, retry).await
    }

    /// Drops the cached entry for `row` and resolves it again from metadata.
    pub async fn relocate_region(&self, table: &TableName, row: &[u8]) -> Result<Arc<Location>> {
        self.ensure_open()?;
        self.resolver.locate(table, row, false, true).await
    }

    /// Resolves a region by its full name `table,start,id`, bypassing the cache.
    pub async fn locate_region(&self, region_name: &[u8]) -> Result<Arc<Location>> {
        self.ensure_open()?;
        let (table, start_key, _) = parse_region_name(region_name).ok_or_else(|| {
            ClientError::InvalidArgument(format!(
                "malformed region name '{}'",
                String::from_utf8_lossy(region_name)
            ))
        })?;
        self.resolver.locate(&table, &start_key, false, true).await
    }

    /// Lists and caches every online partition of `table`.
    pub async fn locate_regions(&self, table: &TableName) -> Result<Vec<Arc<Location>>> {
        self.ensure_open()?;
        self.resolver.locate_regions(table).await
    }

    // ---- batches ----

    /// Executes `actions` against `table`.
    ///
    /// On success `results[i]` holds the outcome of `actions[i]`. If any action
    /// failed permanently the call returns `RetriesExhausted`, whose report carries
    /// every failure and the complete result list.
    pub async fn process_batch(
        &self,
        table: &TableName,
        actions: Vec<RowOperation>,
    ) -> Result<Vec<ActionResult>> {
        self.process_batch_callback(table, actions, |_, _, _| {}).await
    }

    /// Like `process_batch`, invoking `callback(region, row, value)` for every
    /// successful action as its result arrives.
    pub async fn process_batch_callback<F>(
        &self,
        table: &TableName,
        actions: Vec<RowOperation>,
        callback: F,
    ) -> Result<Vec<ActionResult>>
    where
        F: FnMut(&Bytes, &Bytes, Option<&Bytes>) + Send,
    {
        self.ensure_open()?;
        BatchProcess::new(self, table.clone(), actions, callback)
            .run()
            .await
    }

    // ---- cache maintenance ----

    /// Adjusts the cache after `source` reported `error` (or nothing) for `row`.
    ///
    /// A redirect caches the new server, a partition still opening keeps the
    /// entry, and anything else drops the entry if it still points at `source`.
    pub fn update_cached_locations(
        &self,
        table: &TableName,
        row: &[u8],
        error: Option<&RemoteError>,
        source: &Location,
    ) {
        let cached = match self.cache.get(table, row) {
            Some(cached) => cached,
            None => return,
        };

        if let Some((server, seq_num)) = error.and_then(RemoteError::moved_to) {
            info!(
                region = %cached.descriptor().region_name_string(),
                to = %server.host_port(),
                reported_by = %source.server().host_port(),
                "region moved"
            );
            self.cache.put(
                table,
                Some(source.server()),
                cached.moved_to(server.clone(), seq_num),
            );
        } else if error.map(RemoteError::is_region_opening).unwrap_or(false) {
            info!(
                region = %cached.descriptor().region_name_string(),
                server = %source.server().host_port(),
                "region is opening; keeping cache entry"
            );
        } else {
            self.cache.invalidate_if_source(table, row, source.server());
        }
    }

    /// Removes the cache entry for `location`'s partition.
    pub fn delete_cached_location(&self, location: &Location) {
        self.cache.invalidate_location(location);
    }

    /// Drops every cached location.
    pub fn clear_region_cache(&self) {
        self.cache.clear(None);
    }

    /// Drops cached locations of one table.
    pub fn clear_region_cache_for(&self, table: &TableName) {
        self.cache.clear(Some(table));
    }

    /// Drops every cached location on `server`.
    pub fn clear_caches(&self, server: &ServerName) -> usize {
        self.resolver.forget_meta_on(server);
        self.cache.invalidate_all(server)
    }

    pub fn set_region_cache_prefetch(&self, table: &TableName, enable: bool) {
        self.resolver.set_region_cache_prefetch(table, enable);
    }

    pub fn region_cache_prefetch(&self, table: &TableName) -> bool {
        self.resolver.region_cache_prefetch(table)
    }

    pub fn cached_location_count(&self, table: &TableName) -> usize {
        self.cache.cached_count(table)
    }

    pub fn is_region_cached(&self, table: &TableName, row: &[u8]) -> bool {
        self.cache.is_cached(table, row)
    }

    // ---- servers and coordinator ----

    /// Records `server` as dead and forgets everything that points at it.
    pub fn mark_server_dead(&self, server: &ServerName) {
        if self.dead.mark(server.clone()) {
            let cleared = self.clear_caches(server);
            let stubs = self.pool.remove_server(server);
            warn!(server = %server, cleared, stubs, "server marked dead");
        }
    }

    pub fn is_dead_server(&self, server: &ServerName) -> bool {
        self.dead.is_dead(server)
    }

    /// Shared handle to the administrative coordinator service.
    pub async fn coordinator_admin(&self) -> Result<CoordinatorServiceHandle> {
        self.ensure_open()?;
        self.link.service(ServiceRole::CoordinatorAdmin).await
    }

    /// Shared handle to the read-only coordinator service.
    pub async fn coordinator_monitor(&self) -> Result<CoordinatorServiceHandle> {
        self.ensure_open()?;
        self.link.service(ServiceRole::CoordinatorMonitor).await
    }

    /// Returns true if a running coordinator could be reached.
    pub async fn is_coordinator_running(&self) -> Result<bool> {
        match self.coordinator_monitor().await {
            Ok(_handle) => Ok(true),
            Err(ClientError::CoordinatorUnavailable { message, .. }) => {
                debug!(reason = %message, "coordinator is not running");
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }

    /// Keep-alive link shared by the coordinator handles.
    pub fn coordinator_link(&self) -> &KeepAliveCoordinatorLink {
        &self.link
    }

    // ---- lifecycle ----

    /// Reacts to an unrecoverable error.
    ///
    /// An expired coordinator session only drops the session; it is reopened on
    /// next use. Anything else closes the connection.
    pub fn abort(&self, reason: &str, err: &ClientError) {
        if matches!(err, ClientError::SessionExpired) {
            warn!(reason, "coordinator session expired; it will be reopened");
            self.link.close_session();
            return;
        }
        error!(reason, error = %err, "aborting connection");
        self.aborted.store(true, Ordering::Release);
        self.close();
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    /// Stops the sweeper and releases the coordinator link and all stubs.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(sweeper) = self.sweeper.lock().take() {
            sweeper.stop();
        }
        self.link.close();
        self.pool.clear();
        info!(quorum = %self.config.quorum, "connection closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Registers one more user of this instance.
    pub fn inc_ref(&self) -> usize {
        self.refs.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Unregisters a user; never goes below zero.
    pub fn dec_ref(&self) -> usize {
        let mut current = self.refs.load(Ordering::Acquire);
        loop {
            if current == 0 {
                return 0;
            }
            match self.refs.compare_exchange(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return current - 1,
                Err(actual) => current = actual,
            }
        }
    }

    pub fn is_zero_reference(&self) -> bool {
        self.refs.load(Ordering::Acquire) == 0
    }

    pub fn ref_count(&self) -> usize {
        self.refs.load(Ordering::Acquire)
    }

    /// Number of open server stubs.
    pub fn stub_count(&self) -> usize {
        self.pool.len()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }
}

impl Drop for CoreConnection {
    fn drop(&mut self) {
        self.close();
    }
}

/// Reads the cluster id, falling back to the default on any failure.
async fn retrieve_cluster_id(link: &KeepAliveCoordinatorLink) -> String {
    let id = match link.session().await {
        Ok(session) => session.session().cluster_id().await,
        Err(err) => {
            warn!(error = %err, "cannot open coordinator session to read cluster id");
            return DEFAULT_CLUSTER_ID.to_string();
        }
    };
    match id {
        Ok(Some(id)) => id,
        Ok(None) => {
            debug!("cluster id not published; using default");
            DEFAULT_CLUSTER_ID.to_string()
        }
        Err(err) => {
            warn!(error = %err, "cannot read cluster id; using default");
            DEFAULT_CLUSTER_ID.to_string()
        }
    }
}
