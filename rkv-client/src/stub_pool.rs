//! # Stub Pool
//!
//! Purpose: Reuse RPC stubs to partition servers and coordinator services so a
//! channel is opened once per `(service, host:port)`.
//!
//! ## Design Principles
//! 1. **Object Pool Pattern**: Stubs are shared `Arc`s handed to every caller.
//! 2. **Lock Striping**: Creation takes a lock scoped to one key, so first use of
//!    different servers proceeds in parallel while racing callers for the same
//!    server wait for a single creation.
//! 3. **Minimal Locking**: The maps themselves are only locked to clone or insert
//!    an `Arc`, never across a network call.
//! 4. **Fail Fast**: Servers known to be dead are rejected before any channel is
//!    opened.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use rkv_common::ServerName;
use tracing::{debug, trace};

use crate::error::{ClientError, Result};
use crate::keyed_lock::KeyedLocks;
use crate::metrics::ClientMetrics;
use crate::rpc::{RegionServerStub, RpcConnector, ServiceRole, ServiceStub};

/// Service name used to key partition server data stubs.
const REGION_CLIENT_SERVICE: &str = "RegionClient";

/// Builds the pool key `service@host:port`.
pub fn stub_key(service: &str, server: &ServerName) -> String {
    format!("{}@{}", service, server.host_port())
}

/// Servers reported dead by the cluster.
#[derive(Debug, Default)]
pub struct DeadServers {
    servers: RwLock<HashSet<ServerName>>,
}

impl DeadServers {
    pub fn mark(&self, server: ServerName) -> bool {
        self.servers.write().insert(server)
    }

    pub fn is_dead(&self, server: &ServerName) -> bool {
        self.servers.read().contains(server)
    }

    pub fn clear(&self) {
        self.servers.write().clear();
    }
}

/// Shared pool of stubs for one connection.
pub struct StubPool {
    rpc: Arc<dyn RpcConnector>,
    rpc_timeout: Duration,
    region_stubs: Mutex<HashMap<String, Arc<dyn RegionServerStub>>>,
    service_stubs: Mutex<HashMap<String, Arc<dyn ServiceStub>>>,
    creation_locks: KeyedLocks<String>,
    dead: Arc<DeadServers>,
    metrics: Arc<ClientMetrics>,
}

impl StubPool {
    pub fn new(
        rpc: Arc<dyn RpcConnector>,
        rpc_timeout: Duration,
        dead: Arc<DeadServers>,
        metrics: Arc<ClientMetrics>,
    ) -> Self {
        StubPool {
            rpc,
            rpc_timeout,
            region_stubs: Mutex::new(HashMap::new()),
            service_stubs: Mutex::new(HashMap::new()),
            creation_locks: KeyedLocks::new(),
            dead,
            metrics,
        }
    }

    /// Returns the data stub for `server`, opening a channel on first use.
    pub async fn region_stub(&self, server: &ServerName) -> Result<Arc<dyn RegionServerStub>> {
        let key = stub_key(REGION_CLIENT_SERVICE, server);
        self.get_or_create(&self.region_stubs, key, server, || {
            self.rpc.region_stub(server, self.rpc_timeout)
        })
        .await
    }

    /// Returns the `role` stub for `server`, opening a channel on first use.
    ///
    /// The stub is not health-checked; callers that need liveness check it themselves.
    pub async fn service_stub(
        &self,
        role: ServiceRole,
        server: &ServerName,
    ) -> Result<Arc<dyn ServiceStub>> {
        let key = stub_key(role.service_name(), server);
        self.get_or_create(&self.service_stubs, key, server, || {
            self.rpc.service_stub(role, server, self.rpc_timeout)
        })
        .await
    }

    /// Double-checked creation under the per-key lock.
    async fn get_or_create<T, F, Fut>(
        &self,
        map: &Mutex<HashMap<String, Arc<T>>>,
        key: String,
        server: &ServerName,
        open: F,
    ) -> Result<Arc<T>>
    where
        T: ?Sized,
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<Arc<T>>>,
    {
        if self.dead.is_dead(server) {
            return Err(ClientError::ServerStopped(server.clone()));
        }
        let pooled = map.lock().get(&key).cloned();
        if let Some(stub) = pooled {
            return Ok(stub);
        }

        let _guard = self.creation_locks.lock(&key).await;
        let pooled = map.lock().get(&key).cloned();
        if let Some(stub) = pooled {
            return Ok(stub);
        }

        let stub = open().await?;
        map.lock().insert(key.clone(), stub.clone());
        self.metrics.record_stub_created();
        debug!(key = %key, "created stub");
        Ok(stub)
    }

    /// Drops the `role` stub for `server` so the next request recreates it.
    pub fn evict_service(&self, role: ServiceRole, server: &ServerName) -> bool {
        let key = stub_key(role.service_name(), server);
        let removed = self.service_stubs.lock().remove(&key);
        match removed {
            Some(stub) => {
                stub.close();
                trace!(key = %key, "evicted service stub");
                true
            }
            None => false,
        }
    }

    /// Drops every stub pointing at `server`'s endpoint.
    pub fn remove_server(&self, server: &ServerName) -> usize {
        let suffix = format!("@{}", server.host_port());
        let mut removed = 0;
        {
            let mut stubs = self.region_stubs.lock();
            let before = stubs.len();
            stubs.retain(|key, _| !key.ends_with(&suffix));
            removed += before - stubs.len();
        }
        {
            let mut stubs = self.service_stubs.lock();
            let doomed: Vec<String> = stubs
                .keys()
                .filter(|key| key.ends_with(&suffix))
                .cloned()
                .collect();
            for key in doomed {
                if let Some(stub) = stubs.remove(&key) {
                    stub.close();
                    removed += 1;
                }
            }
        }
        if removed > 0 {
            debug!(server = %server, removed, "dropped stubs for server");
        }
        removed
    }

    /// Drops every pooled stub.
    pub fn clear(&self) {
        self.region_stubs.lock().clear();
        for (_, stub) in self.service_stubs.lock().drain() {
            stub.close();
        }
    }

    /// Number of pooled stubs of either kind.
    pub fn len(&self) -> usize {
        self.region_stubs.lock().len() + self.service_stubs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use bytes::Bytes;
    use rkv_common::{MetaRow, MultiRequest, MultiResponse};

    struct NullStub;

    #[async_trait]
    impl RegionServerStub for NullStub {
        async fn get_row_or_before(&self, _: &[u8], _: &[u8]) -> anyhow::Result<Option<MetaRow>> {
            Ok(None)
        }

        async fn scan_metadata(&self, _: &[u8], _: &[u8], _: usize) -> anyhow::Result<Vec<MetaRow>> {
            Ok(Vec::new())
        }

        async fn multi(&self, _: MultiRequest) -> anyhow::Result<MultiResponse> {
            Ok(MultiResponse::default())
        }
    }

    #[async_trait]
    impl ServiceStub for NullStub {
        async fn call(&self, _: &str, payload: Bytes) -> anyhow::Result<Bytes> {
            Ok(payload)
        }

        async fn is_running(&self) -> anyhow::Result<bool> {
            Ok(true)
        }
    }

    #[derive(Default)]
    struct CountingConnector {
        opened: AtomicUsize,
    }

    #[async_trait]
    impl RpcConnector for CountingConnector {
        async fn region_stub(
            &self,
            _: &ServerName,
            _: Duration,
        ) -> anyhow::Result<Arc<dyn RegionServerStub>> {
            self.opened.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            Ok(Arc::new(NullStub))
        }

        async fn service_stub(
            &self,
            _: ServiceRole,
            _: &ServerName,
            _: Duration,
        ) -> anyhow::Result<Arc<dyn ServiceStub>> {
            self.opened.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(NullStub))
        }
    }

    fn pool(connector: Arc<CountingConnector>) -> (Arc<StubPool>, Arc<DeadServers>) {
        let dead = Arc::new(DeadServers::default());
        let pool = StubPool::new(
            connector,
            Duration::from_secs(1),
            dead.clone(),
            Arc::new(ClientMetrics::new()),
        );
        (Arc::new(pool), dead)
    }

    #[tokio::test]
    async fn concurrent_first_use_creates_one_stub() {
        let connector = Arc::new(CountingConnector::default());
        let (pool, _) = pool(connector.clone());
        let server = ServerName::new("rs1", 16020, 1);

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let pool = pool.clone();
            let server = server.clone();
            tasks.push(tokio::spawn(async move { pool.region_stub(&server).await.is_ok() }));
        }
        for task in tasks {
            assert!(task.await.expect("join"));
        }
        assert_eq!(connector.opened.load(Ordering::SeqCst), 1);
        assert_eq!(pool.len(), 1);
        assert_eq!(pool.creation_locks.len(), 0);
    }

    #[tokio::test]
    async fn creation_locks_do_not_accumulate() {
        let connector = Arc::new(CountingConnector::default());
        let (pool, _) = pool(connector.clone());
        for port in 0..50 {
            let server = ServerName::new("rs", 16000 + port, 1);
            pool.region_stub(&server).await.expect("stub");
            pool.service_stub(ServiceRole::RegionAdmin, &server).await.expect("stub");
        }
        assert_eq!(pool.len(), 100);
        assert_eq!(pool.creation_locks.len(), 0);
    }

    #[tokio::test]
    async fn dead_servers_fail_fast() {
        let connector = Arc::new(CountingConnector::default());
        let (pool, dead) = pool(connector.clone());
        let server = ServerName::new("rs1", 16020, 1);
        dead.mark(server.clone());

        let err = pool.region_stub(&server).await.err().expect("must fail");
        assert!(matches!(err, ClientError::ServerStopped(_)));
        assert_eq!(connector.opened.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn remove_server_drops_both_kinds() {
        let connector = Arc::new(CountingConnector::default());
        let (pool, _) = pool(connector.clone());
        let rs1 = ServerName::new("rs1", 16020, 1);
        let rs2 = ServerName::new("rs2", 16020, 1);
        pool.region_stub(&rs1).await.expect("stub");
        pool.service_stub(ServiceRole::RegionAdmin, &rs1).await.expect("stub");
        pool.region_stub(&rs2).await.expect("stub");

        assert_eq!(pool.remove_server(&rs1), 2);
        assert_eq!(pool.len(), 1);

        assert!(!pool.evict_service(ServiceRole::RegionAdmin, &rs1));
        pool.clear();
        assert!(pool.is_empty());
    }
}
