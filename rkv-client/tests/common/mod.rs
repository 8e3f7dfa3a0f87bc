#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use rkv_client::common::{
    Location, MetaRow, MetaSortKey, MultiRequest, MultiResponse, PartitionDescriptor, RemoteError,
    RowOperation, ServerName, TableName,
};
use rkv_client::{
    ClusterBackend, ConnectionConfig, CoreConnection, Discovery, DiscoverySession,
    RegionServerStub, RpcConnector, ServiceRole, ServiceStub,
};
use tracing_subscriber::EnvFilter;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn server(n: u16) -> ServerName {
    ServerName::new(format!("rs{}", n), 16020, 1)
}

pub fn meta_server() -> ServerName {
    ServerName::new("meta", 16020, 1)
}

pub fn coordinator() -> ServerName {
    ServerName::new("coord", 16000, 1)
}

pub fn users() -> TableName {
    TableName::from("users")
}

/// Short pauses and few retries; tests run on a paused clock anyway.
pub fn fast_config() -> ConnectionConfig {
    ConnectionConfig {
        pause: Duration::from_millis(10),
        retries: 3,
        rpc_timeout: Duration::from_secs(5),
        ..ConnectionConfig::default()
    }
}

/// Call counters observed by tests.
#[derive(Default)]
pub struct Counters {
    pub meta_lookups: AtomicUsize,
    pub meta_scans: AtomicUsize,
    pub multi_calls: AtomicUsize,
    pub region_stubs: AtomicUsize,
    pub service_stubs: AtomicUsize,
    pub sessions_opened: AtomicUsize,
    pub sessions_closed: AtomicUsize,
    pub liveness_checks: AtomicUsize,
}

impl Counters {
    pub fn get(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

struct ClusterState {
    // Keyed by region name in metadata order.
    meta: BTreeMap<MetaSortKey, MetaRow>,
    meta_location: Option<Location>,
    cluster_id: Option<String>,
    down: HashSet<String>,
    // Remaining failures per host:port before it starts answering.
    flaky: HashMap<String, usize>,
    moved: HashMap<Bytes, (ServerName, u64)>,
    row_errors: HashMap<Bytes, RemoteError>,
    coordinator: Option<ServerName>,
    coordinator_running: bool,
    registered: bool,
    data: HashMap<Bytes, Bytes>,
}

struct Shared {
    state: Mutex<ClusterState>,
    counters: Counters,
}

/// In-memory cluster implementing every collaborator trait.
#[derive(Clone)]
pub struct FakeCluster {
    shared: Arc<Shared>,
}

impl FakeCluster {
    pub fn new() -> Self {
        let meta_desc = PartitionDescriptor::new(TableName::meta(), Bytes::new(), Bytes::new(), 1);
        FakeCluster {
            shared: Arc::new(Shared {
                state: Mutex::new(ClusterState {
                    meta: BTreeMap::new(),
                    meta_location: Some(Location::new(meta_desc, meta_server(), 1)),
                    cluster_id: Some("test-cluster".to_string()),
                    down: HashSet::new(),
                    flaky: HashMap::new(),
                    moved: HashMap::new(),
                    row_errors: HashMap::new(),
                    coordinator: Some(coordinator()),
                    coordinator_running: true,
                    registered: true,
                    data: HashMap::new(),
                }),
                counters: Counters::default(),
            }),
        }
    }

    /// Three partitions of `users`: ["", g) on rs1, [g, p) on rs2, [p, "") on rs3,
    /// plus a one-partition `orders` table on rs1.
    pub fn standard() -> Self {
        let cluster = FakeCluster::new();
        cluster.add_region(users(), "", "g", Some(server(1)), 1);
        cluster.add_region(users(), "g", "p", Some(server(2)), 1);
        cluster.add_region(users(), "p", "", Some(server(3)), 1);
        cluster.add_region(TableName::from("orders"), "", "", Some(server(1)), 1);
        cluster
    }

    pub fn backend(&self) -> ClusterBackend {
        ClusterBackend::new(Arc::new(self.clone()), Arc::new(self.clone()))
    }

    pub async fn connect(&self, config: ConnectionConfig) -> Arc<CoreConnection> {
        CoreConnection::connect(config, self.backend())
            .await
            .expect("connect")
    }

    pub fn counters(&self) -> &Counters {
        &self.shared.counters
    }

    pub fn add_region(
        &self,
        table: TableName,
        start: &'static str,
        end: &'static str,
        server: Option<ServerName>,
        seq_num: u64,
    ) -> PartitionDescriptor {
        let desc = PartitionDescriptor::new(table, start, end, 1);
        self.shared.state.lock().meta.insert(
            MetaSortKey::new(desc.region_name()),
            MetaRow::new(desc.clone(), server, seq_num),
        );
        desc
    }

    pub fn add_raw_row(&self, key: &'static str, row: MetaRow) {
        self.shared
            .state
            .lock()
            .meta
            .insert(MetaSortKey::new(Bytes::from_static(key.as_bytes())), row);
    }

    pub fn update_descriptor(&self, region: &PartitionDescriptor, f: impl FnOnce(&mut PartitionDescriptor)) {
        let mut state = self.shared.state.lock();
        if let Some(row) = state.meta.get_mut(&MetaSortKey::new(region.region_name())) {
            if let Some(desc) = row.descriptor.as_mut() {
                f(desc);
            }
        }
    }

    /// Reassigns a partition in the metadata table.
    pub fn move_region(&self, region: &PartitionDescriptor, to: ServerName, seq_num: u64) {
        let mut state = self.shared.state.lock();
        if let Some(row) = state.meta.get_mut(&MetaSortKey::new(region.region_name())) {
            row.server = Some(to);
            row.seq_num = seq_num;
        }
    }

    /// Moves a partition and makes every other server answer with a redirect.
    pub fn redirect(&self, region: &PartitionDescriptor, to: ServerName, seq_num: u64) {
        self.move_region(region, to.clone(), seq_num);
        self.shared
            .state
            .lock()
            .moved
            .insert(region.region_name(), (to, seq_num));
    }

    pub fn take_down(&self, server: &ServerName) {
        self.shared.state.lock().down.insert(server.host_port());
    }

    pub fn bring_up(&self, server: &ServerName) {
        self.shared.state.lock().down.remove(&server.host_port());
    }

    /// The next `times` calls to `server` fail with a refused connection.
    pub fn fail_next(&self, server: &ServerName, times: usize) {
        self.shared
            .state
            .lock()
            .flaky
            .insert(server.host_port(), times);
    }

    pub fn fail_row(&self, row: &'static str, error: RemoteError) {
        self.shared
            .state
            .lock()
            .row_errors
            .insert(Bytes::from_static(row.as_bytes()), error);
    }

    pub fn clear_row_error(&self, row: &'static str) {
        self.shared.state.lock().row_errors.remove(row.as_bytes());
    }

    pub fn set_meta_location(&self, location: Option<Location>) {
        self.shared.state.lock().meta_location = location;
    }

    pub fn set_cluster_id(&self, id: Option<&str>) {
        self.shared.state.lock().cluster_id = id.map(str::to_string);
    }

    pub fn set_coordinator(&self, server: Option<ServerName>) {
        self.shared.state.lock().coordinator = server;
    }

    pub fn set_coordinator_running(&self, running: bool) {
        self.shared.state.lock().coordinator_running = running;
    }

    pub fn set_registered(&self, registered: bool) {
        self.shared.state.lock().registered = registered;
    }

    pub fn value(&self, row: &str) -> Option<Bytes> {
        self.shared.state.lock().data.get(row.as_bytes()).cloned()
    }
}

impl Shared {
    /// Fails the call when `server` is down or still flaky.
    fn check_reachable(&self, server: &ServerName) -> anyhow::Result<()> {
        let mut state = self.state.lock();
        let key = server.host_port();
        if state.down.contains(&key) {
            return Err(refused(&key));
        }
        if let Some(remaining) = state.flaky.get_mut(&key) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(refused(&key));
            }
        }
        Ok(())
    }
}

fn refused(endpoint: &str) -> anyhow::Error {
    anyhow::Error::new(io::Error::new(
        io::ErrorKind::ConnectionRefused,
        format!("connection to {} refused", endpoint),
    ))
}

#[async_trait]
impl Discovery for FakeCluster {
    async fn connect(&self) -> anyhow::Result<Arc<dyn DiscoverySession>> {
        self.shared.counters.sessions_opened.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(FakeSession {
            shared: self.shared.clone(),
            closed: AtomicBool::new(false),
        }))
    }
}

struct FakeSession {
    shared: Arc<Shared>,
    closed: AtomicBool,
}

#[async_trait]
impl DiscoverySession for FakeSession {
    async fn cluster_id(&self) -> anyhow::Result<Option<String>> {
        Ok(self.shared.state.lock().cluster_id.clone())
    }

    async fn metadata_location(&self) -> anyhow::Result<Option<Location>> {
        Ok(self.shared.state.lock().meta_location.clone())
    }

    async fn check_service_registered(&self) -> anyhow::Result<bool> {
        Ok(self.shared.state.lock().registered)
    }

    async fn active_coordinator_address(&self) -> anyhow::Result<Option<ServerName>> {
        Ok(self.shared.state.lock().coordinator.clone())
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.shared.counters.sessions_closed.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl RpcConnector for FakeCluster {
    async fn region_stub(
        &self,
        server: &ServerName,
        _timeout: Duration,
    ) -> anyhow::Result<Arc<dyn RegionServerStub>> {
        self.shared.counters.region_stubs.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(FakeRegionServer {
            shared: self.shared.clone(),
            server: server.clone(),
        }))
    }

    async fn service_stub(
        &self,
        role: ServiceRole,
        server: &ServerName,
        _timeout: Duration,
    ) -> anyhow::Result<Arc<dyn ServiceStub>> {
        self.shared.counters.service_stubs.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(FakeService {
            shared: self.shared.clone(),
            role,
            server: server.clone(),
        }))
    }
}

struct FakeRegionServer {
    shared: Arc<Shared>,
    server: ServerName,
}

#[async_trait]
impl RegionServerStub for FakeRegionServer {
    async fn get_row_or_before(
        &self,
        _meta_region: &[u8],
        key: &[u8],
    ) -> anyhow::Result<Option<MetaRow>> {
        self.shared.check_reachable(&self.server)?;
        self.shared.counters.meta_lookups.fetch_add(1, Ordering::SeqCst);
        let state = self.shared.state.lock();
        Ok(state
            .meta
            .range(..=MetaSortKey::new(Bytes::copy_from_slice(key)))
            .next_back()
            .map(|(_, row)| row.clone()))
    }

    async fn scan_metadata(
        &self,
        _meta_region: &[u8],
        start_key: &[u8],
        limit: usize,
    ) -> anyhow::Result<Vec<MetaRow>> {
        self.shared.check_reachable(&self.server)?;
        self.shared.counters.meta_scans.fetch_add(1, Ordering::SeqCst);
        let state = self.shared.state.lock();
        let from = state
            .meta
            .range(..=MetaSortKey::new(Bytes::copy_from_slice(start_key)))
            .next_back()
            .map(|(key, _)| key.clone());
        let rows = match from {
            Some(from) => state
                .meta
                .range(from..)
                .take(limit)
                .map(|(_, row)| row.clone())
                .collect(),
            None => state
                .meta
                .values()
                .take(limit)
                .cloned()
                .collect(),
        };
        Ok(rows)
    }

    async fn multi(&self, request: MultiRequest) -> anyhow::Result<MultiResponse> {
        self.shared.counters.multi_calls.fetch_add(1, Ordering::SeqCst);
        self.shared.check_reachable(&self.server)?;

        let mut guard = self.shared.state.lock();
        let state = &mut *guard;
        let mut response = MultiResponse::default();
        for group in request.regions {
            for action in group.actions {
                let row = action.operation.row().clone();
                if let Some(error) = state.row_errors.get(&row) {
                    response.push(group.region_name.clone(), action.index, Err(error.clone()));
                    continue;
                }
                if let Some((to, seq_num)) = state.moved.get(&group.region_name) {
                    if !to.same_endpoint(&self.server) {
                        let moved = RemoteError::RegionMoved {
                            server: to.clone(),
                            seq_num: *seq_num,
                        };
                        response.push(group.region_name.clone(), action.index, Err(moved));
                        continue;
                    }
                }
                let hosted = matches!(
                    state
                        .meta
                        .get(&MetaSortKey::new(group.region_name.clone()))
                        .and_then(|r| r.server.as_ref()),
                    Some(owner) if owner.same_endpoint(&self.server)
                );
                if !hosted {
                    let error = RemoteError::NotServingRegion {
                        region: group.region_name.clone(),
                    };
                    response.push(group.region_name.clone(), action.index, Err(error));
                    continue;
                }
                let outcome = match action.operation {
                    RowOperation::Get { row } => state.data.get(&row).cloned(),
                    RowOperation::Put { row, value } => {
                        state.data.insert(row, value);
                        None
                    }
                    RowOperation::Delete { row } => {
                        state.data.remove(&row);
                        None
                    }
                };
                response.push(group.region_name.clone(), action.index, Ok(outcome));
            }
        }
        Ok(response)
    }
}

struct FakeService {
    shared: Arc<Shared>,
    role: ServiceRole,
    server: ServerName,
}

#[async_trait]
impl ServiceStub for FakeService {
    async fn call(&self, method: &str, _payload: Bytes) -> anyhow::Result<Bytes> {
        self.shared.check_reachable(&self.server)?;
        Ok(Bytes::from(format!("{}:{}", self.role, method)))
    }

    async fn is_running(&self) -> anyhow::Result<bool> {
        self.shared.counters.liveness_checks.fetch_add(1, Ordering::SeqCst);
        self.shared.check_reachable(&self.server)?;
        let state = self.shared.state.lock();
        if !state.coordinator_running {
            return Ok(false);
        }
        Ok(state.coordinator.as_ref() == Some(&self.server))
    }
}
