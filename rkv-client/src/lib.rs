//! # RKV Connection Core
//!
//! Purpose: Client-side plumbing for a range-partitioned KV store. Rows are mapped
//! to the server hosting their partition, batches are routed per server and
//! replayed on failure, and coordinator resources are shared and reclaimed.
//!
//! ## Design Principles
//! 1. **Cache First**: Locations come from a per-connection cache; the metadata
//!    table is consulted only on a miss or after an error.
//! 2. **Pluggable Collaborators**: The coordinator and the RPC layer are traits, so
//!    transports and in-memory fakes drop in alike.
//! 3. **Bounded Retries**: Every retry loop is limited by a count or a deadline and
//!    backs off with a fixed multiplier table.
//! 4. **Explicit Lifetimes**: Shared connections are counted by a registry value;
//!    nothing depends on finalization.

mod batch;
mod config;
mod connection;
mod error;
mod keepalive;
mod keyed_lock;
mod location_cache;
mod metrics;
mod registry;
mod resolver;
mod rpc;
mod stub_pool;
mod tracker;

pub use config::{pause_time, ConnectionConfig, ConnectionKey, KEEP_ALIVE, RETRY_BACKOFF, SWEEP_INTERVAL};
pub use connection::{CoreConnection, DEFAULT_CLUSTER_ID};
pub use error::{ActionResult, BatchFailure, ClientError, FailedAction, Result};
pub use keepalive::{CoordinatorServiceHandle, CoordinatorSession, KeepAliveCoordinatorLink, SweepHandle};
pub use location_cache::RegionLocationCache;
pub use metrics::{ClientMetrics, MetricsSnapshot};
pub use registry::{BackendFactory, ConnectionRegistry, MAX_CACHED_CONNECTIONS};
pub use rpc::{
    ClusterBackend, Discovery, DiscoverySession, RegionServerStub, RpcConnector, ServiceRole,
    ServiceStub,
};
pub use stub_pool::{stub_key, DeadServers, StubPool};
pub use tracker::ServerErrorTracker;

pub use rkv_common as common;
