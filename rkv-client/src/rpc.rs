//! # Collaborator Interfaces
//!
//! Purpose: The seams between the connection core and the outside world: the
//! coordinator service that knows where the metadata table lives, and the RPC
//! layer that opens channels to servers.
//!
//! ## Design Principles
//! 1. **Trait Objects at the Edge**: The core only holds `Arc<dyn ...>` handles so
//!    transports and fakes plug in without generics leaking everywhere.
//! 2. **Opaque Failures**: Collaborators return `anyhow::Result`; the core
//!    classifies by walking the cause chain.
//! 3. **No Probing**: Opening a stub never performs a round trip. The first real
//!    call is the health check.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use rkv_common::{Location, MetaRow, MultiRequest, MultiResponse, ServerName};

/// Coordinator-side service a `ServiceStub` talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceRole {
    /// Administrative interface of a partition server.
    RegionAdmin,
    /// Mutating coordinator operations.
    CoordinatorAdmin,
    /// Read-only coordinator operations.
    CoordinatorMonitor,
}

impl ServiceRole {
    pub fn service_name(&self) -> &'static str {
        match self {
            ServiceRole::RegionAdmin => "RegionAdmin",
            ServiceRole::CoordinatorAdmin => "CoordinatorAdmin",
            ServiceRole::CoordinatorMonitor => "CoordinatorMonitor",
        }
    }
}

impl fmt::Display for ServiceRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.service_name())
    }
}

/// Entry point to the coordinator service.
#[async_trait]
pub trait Discovery: Send + Sync {
    /// Opens a new session with the coordinator.
    async fn connect(&self) -> anyhow::Result<Arc<dyn DiscoverySession>>;
}

/// An open coordinator session.
#[async_trait]
pub trait DiscoverySession: Send + Sync {
    /// Identity of the cluster, if one was published.
    async fn cluster_id(&self) -> anyhow::Result<Option<String>>;

    /// Current location of the single metadata partition.
    async fn metadata_location(&self) -> anyhow::Result<Option<Location>>;

    /// Returns true when the cluster's base node is registered.
    async fn check_service_registered(&self) -> anyhow::Result<bool>;

    /// Address of the active coordinator process, if any.
    async fn active_coordinator_address(&self) -> anyhow::Result<Option<ServerName>>;

    /// Closes the session. Must be idempotent.
    fn close(&self);
}

/// Opens channels to servers.
#[async_trait]
pub trait RpcConnector: Send + Sync {
    async fn region_stub(
        &self,
        server: &ServerName,
        timeout: Duration,
    ) -> anyhow::Result<Arc<dyn RegionServerStub>>;

    async fn service_stub(
        &self,
        role: ServiceRole,
        server: &ServerName,
        timeout: Duration,
    ) -> anyhow::Result<Arc<dyn ServiceStub>>;
}

/// Client side of a partition server.
#[async_trait]
pub trait RegionServerStub: Send + Sync {
    /// Returns the metadata row at `key` or the closest one before it.
    ///
    /// "Before" follows `MetaSortKey` order, which compares region names by
    /// `(table, start key, region id)` rather than by raw bytes. With that order a
    /// key built by `meta_key(table, row)` lands on the partition owning `row`.
    async fn get_row_or_before(
        &self,
        meta_region: &[u8],
        key: &[u8],
    ) -> anyhow::Result<Option<MetaRow>>;

    /// Returns up to `limit` metadata rows in `MetaSortKey` order, beginning with
    /// the row at or before `start_key`.
    async fn scan_metadata(
        &self,
        meta_region: &[u8],
        start_key: &[u8],
        limit: usize,
    ) -> anyhow::Result<Vec<MetaRow>>;

    /// Executes a batched request.
    async fn multi(&self, request: MultiRequest) -> anyhow::Result<MultiResponse>;
}

/// Client side of a coordinator or admin service.
#[async_trait]
pub trait ServiceStub: Send + Sync {
    /// Forwards an opaque call.
    async fn call(&self, method: &str, payload: Bytes) -> anyhow::Result<Bytes>;

    /// Liveness check.
    async fn is_running(&self) -> anyhow::Result<bool>;

    /// Releases the underlying channel.
    fn close(&self) {}
}

/// Collaborators used by one connection.
#[derive(Clone)]
pub struct ClusterBackend {
    pub discovery: Arc<dyn Discovery>,
    pub rpc: Arc<dyn RpcConnector>,
}

impl ClusterBackend {
    pub fn new(discovery: Arc<dyn Discovery>, rpc: Arc<dyn RpcConnector>) -> Self {
        ClusterBackend { discovery, rpc }
    }
}
