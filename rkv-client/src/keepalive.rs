//! # Keep-Alive Coordinator Link
//!
//! Purpose: Share one coordinator session and one stub per coordinator service
//! among every user of a connection, and reclaim them after they sit idle.
//!
//! ## Design Principles
//! 1. **RAII Handles**: Callers hold a `CoordinatorSession` or
//!    `CoordinatorServiceHandle`; dropping it releases the reference.
//! 2. **Idle Deadlines**: When the last user releases a resource its deadline is
//!    set to now + `KEEP_ALIVE`. A periodic sweep closes resources whose deadline
//!    has passed.
//! 3. **Merged Gate**: Opening the session and creating coordinator stubs share
//!    one async gate. Creating a stub needs the session, so two separate locks
//!    would invite ordering deadlocks.
//! 4. **Lazy Recreation**: A stub that fails its liveness check is dropped and
//!    rebuilt; the failure is never surfaced to the caller.
//!
//! ## Structure Overview
//!
//! ```text
//! KeepAliveCoordinatorLink
//!   └── inner: Arc<LinkInner>
//!         ├── gate: tokio::Mutex<()>          (connect / create)
//!         └── state: parking_lot::Mutex<LinkState>
//!               ├── session: Slot<DiscoverySession>
//!               ├── admin:   Slot<ServiceStub>
//!               └── monitor: Slot<ServiceStub>
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use rkv_common::ServerName;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::{pause_time, KEEP_ALIVE};
use crate::error::{ClientError, Result};
use crate::metrics::ClientMetrics;
use crate::rpc::{Discovery, DiscoverySession, ServiceRole, ServiceStub};
use crate::stub_pool::{DeadServers, StubPool};

/// One shared, reference-counted resource.
struct Slot<T: ?Sized> {
    value: Option<Arc<T>>,
    server: Option<ServerName>,
    users: u32,
    // `None` while in use or never released.
    idle_deadline: Option<Instant>,
    // Bumped whenever the slot is reset so stale handles release nothing.
    epoch: u64,
}

impl<T: ?Sized> Slot<T> {
    fn empty() -> Self {
        Slot {
            value: None,
            server: None,
            users: 0,
            idle_deadline: None,
            epoch: 0,
        }
    }

    fn acquire(&mut self) -> u64 {
        self.users += 1;
        self.idle_deadline = None;
        self.epoch
    }

    fn release(&mut self, epoch: u64, now: Instant) {
        if epoch != self.epoch {
            return;
        }
        self.users = self.users.saturating_sub(1);
        if self.users == 0 {
            self.idle_deadline = Some(now + KEEP_ALIVE);
        }
    }

    fn reset(&mut self) -> (Option<Arc<T>>, Option<ServerName>) {
        self.users = 0;
        self.idle_deadline = None;
        self.epoch += 1;
        (self.value.take(), self.server.take())
    }

    fn expired(&self, now: Instant) -> bool {
        matches!(self.idle_deadline, Some(deadline) if now > deadline)
    }
}

struct LinkState {
    session: Slot<dyn DiscoverySession>,
    admin: Slot<dyn ServiceStub>,
    monitor: Slot<dyn ServiceStub>,
    closed: bool,
}

impl LinkState {
    fn service_slot(&mut self, role: ServiceRole) -> &mut Slot<dyn ServiceStub> {
        match role {
            ServiceRole::CoordinatorMonitor => &mut self.monitor,
            _ => &mut self.admin,
        }
    }
}

struct LinkInner {
    discovery: Arc<dyn Discovery>,
    pool: Arc<StubPool>,
    dead: Arc<DeadServers>,
    metrics: Arc<ClientMetrics>,
    pause: Duration,
    retries: u32,
    gate: AsyncMutex<()>,
    state: Mutex<LinkState>,
}

/// Shared coordinator session and coordinator service stubs.
#[derive(Clone)]
pub struct KeepAliveCoordinatorLink {
    inner: Arc<LinkInner>,
}

impl KeepAliveCoordinatorLink {
    pub fn new(
        discovery: Arc<dyn Discovery>,
        pool: Arc<StubPool>,
        dead: Arc<DeadServers>,
        metrics: Arc<ClientMetrics>,
        pause: Duration,
        retries: u32,
    ) -> Self {
        KeepAliveCoordinatorLink {
            inner: Arc::new(LinkInner {
                discovery,
                pool,
                dead,
                metrics,
                pause,
                retries: retries.max(1),
                gate: AsyncMutex::new(()),
                state: Mutex::new(LinkState {
                    session: Slot::empty(),
                    admin: Slot::empty(),
                    monitor: Slot::empty(),
                    closed: false,
                }),
            }),
        }
    }

    /// Returns the shared coordinator session, opening it if needed.
    pub async fn session(&self) -> Result<CoordinatorSession> {
        let _gate = self.inner.gate.lock().await;
        self.inner.session_locked().await
    }

    /// Returns the shared stub for a coordinator service.
    ///
    /// An existing stub is reused only if it passes a liveness check; otherwise
    /// a new one is built with retries, failing with `CoordinatorUnavailable`.
    pub async fn service(&self, role: ServiceRole) -> Result<CoordinatorServiceHandle> {
        if role == ServiceRole::RegionAdmin {
            return Err(ClientError::InvalidArgument(format!(
                "{} is not a coordinator service",
                role
            )));
        }

        let _gate = self.inner.gate.lock().await;
        if self.inner.state.lock().closed {
            return Err(ClientError::Closed);
        }

        let existing = self.inner.state.lock().service_slot(role).value.clone();
        let live = match existing {
            Some(stub) => {
                if self.inner.connected_and_running(&stub).await {
                    Some(stub)
                } else {
                    self.inner.reset_service(role);
                    None
                }
            }
            None => None,
        };

        let (stub, server) = match live {
            Some(stub) => {
                let server = self.inner.state.lock().service_slot(role).server.clone();
                (stub, server)
            }
            None => {
                let (stub, server) = self.inner.make_stub_with_retries(role).await?;
                (stub, Some(server))
            }
        };

        let mut state = self.inner.state.lock();
        if state.closed {
            return Err(ClientError::Closed);
        }
        let slot = state.service_slot(role);
        slot.value = Some(stub.clone());
        slot.server = server;
        let epoch = slot.acquire();
        Ok(CoordinatorServiceHandle {
            link: self.inner.clone(),
            role,
            stub,
            epoch,
        })
    }

    /// Closes every resource whose idle deadline has passed; returns how many.
    pub async fn sweep(&self) -> usize {
        self.inner.sweep().await
    }

    /// Starts the periodic sweep on the current tokio runtime.
    ///
    /// The task holds only a weak reference and exits once the link is dropped.
    pub fn start_sweeper(&self, interval: Duration) -> SweepHandle {
        let interval = if interval.is_zero() {
            Duration::from_millis(1)
        } else {
            interval
        };

        let stop = Arc::new(AtomicBool::new(false));
        let stop_task = Arc::clone(&stop);
        let link: Weak<LinkInner> = Arc::downgrade(&self.inner);

        let join = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            while !stop_task.load(Ordering::Acquire) {
                ticker.tick().await;
                let inner = match link.upgrade() {
                    Some(inner) => inner,
                    None => break,
                };
                inner.sweep().await;
            }
        });

        SweepHandle {
            stop,
            join: Some(join),
        }
    }

    /// Drops the coordinator session only; it is reopened on next use.
    pub fn close_session(&self) {
        let (session, _) = self.inner.state.lock().session.reset();
        if let Some(session) = session {
            info!("closing coordinator session");
            session.close();
        }
    }

    /// Closes the session and both coordinator stubs. Later calls fail with `Closed`.
    pub fn close(&self) {
        self.inner.state.lock().closed = true;
        self.close_session();
        self.inner.reset_service(ServiceRole::CoordinatorAdmin);
        self.inner.reset_service(ServiceRole::CoordinatorMonitor);
    }

    /// Current user count of the session and of each coordinator stub.
    pub fn user_counts(&self) -> (u32, u32, u32) {
        let state = self.inner.state.lock();
        (state.session.users, state.admin.users, state.monitor.users)
    }

    /// Returns true while a session is open.
    pub fn has_session(&self) -> bool {
        self.inner.state.lock().session.value.is_some()
    }

    /// Returns true while a stub for `role` is held.
    pub fn has_service(&self, role: ServiceRole) -> bool {
        self.inner.state.lock().service_slot(role).value.is_some()
    }
}

impl LinkInner {
    /// Acquires the session. The caller must hold `gate`.
    async fn session_locked(self: &Arc<Self>) -> Result<CoordinatorSession> {
        let existing = {
            let state = self.state.lock();
            if state.closed {
                return Err(ClientError::Closed);
            }
            state.session.value.clone()
        };

        let session = match existing {
            Some(session) => session,
            None => {
                debug!("opening coordinator session");
                let session = self.discovery.connect().await?;
                let mut state = self.state.lock();
                if state.closed {
                    session.close();
                    return Err(ClientError::Closed);
                }
                state.session.value = Some(session.clone());
                session
            }
        };

        let epoch = self.state.lock().session.acquire();
        Ok(CoordinatorSession {
            link: self.clone(),
            session,
            epoch,
        })
    }

    fn release_session(&self, epoch: u64) {
        self.state.lock().session.release(epoch, Instant::now());
    }

    fn release_service(&self, role: ServiceRole, epoch: u64) {
        self.state
            .lock()
            .service_slot(role)
            .release(epoch, Instant::now());
    }

    fn reset_service(&self, role: ServiceRole) {
        let (stub, server) = self.state.lock().service_slot(role).reset();
        if stub.is_some() {
            info!(role = %role, "closing coordinator stub");
        }
        if let Some(server) = server {
            self.pool.evict_service(role, &server);
        }
    }

    /// Liveness check; any failure counts as "not running".
    async fn connected_and_running(&self, stub: &Arc<dyn ServiceStub>) -> bool {
        match stub.is_running().await {
            Ok(running) => running,
            Err(err) => {
                let err = ClientError::from(err);
                if err.is_connection_failure() {
                    debug!(error = %err, "coordinator stub lost its connection");
                } else {
                    warn!(error = %err, "coordinator liveness check failed");
                }
                false
            }
        }
    }

    /// Builds a coordinator stub, retrying with backoff. The caller holds `gate`.
    async fn make_stub_with_retries(
        self: &Arc<Self>,
        role: ServiceRole,
    ) -> Result<(Arc<dyn ServiceStub>, ServerName)> {
        let mut tries = 0;
        loop {
            if self.state.lock().closed {
                return Err(ClientError::Closed);
            }
            tries += 1;
            match self.make_stub_no_retries(role).await {
                Ok(created) => return Ok(created),
                Err(err) if tries < self.retries => {
                    let pause = pause_time(self.pause, tries - 1);
                    info!(
                        role = %role,
                        attempt = tries,
                        max = self.retries,
                        pause_ms = pause.as_millis() as u64,
                        error = %err,
                        "coordinator not ready, retrying"
                    );
                    tokio::time::sleep(pause).await;
                }
                Err(err) => {
                    return Err(ClientError::coordinator_unavailable(
                        format!("{} unreachable after {} attempts", role, tries),
                        Some(err),
                    ));
                }
            }
        }
    }

    async fn make_stub_no_retries(
        self: &Arc<Self>,
        role: ServiceRole,
    ) -> Result<(Arc<dyn ServiceStub>, ServerName)> {
        let session = self.session_locked().await?;

        if !session.session().check_service_registered().await? {
            return Err(ClientError::coordinator_unavailable(
                "cluster base node is not registered; check root_path",
                None,
            ));
        }
        let server = match session.session().active_coordinator_address().await? {
            Some(server) => server,
            None => {
                return Err(ClientError::coordinator_unavailable(
                    "coordinator reachable but no active address published",
                    None,
                ))
            }
        };
        if self.dead.is_dead(&server) {
            return Err(ClientError::coordinator_unavailable(
                format!("{} is dead", server),
                None,
            ));
        }

        let stub = self.pool.service_stub(role, &server).await?;
        match stub.is_running().await {
            Ok(true) => {}
            Ok(false) => {
                self.pool.evict_service(role, &server);
                return Err(ClientError::coordinator_unavailable(
                    format!("{} at {} is not running", role, server.host_port()),
                    None,
                ));
            }
            Err(err) => {
                self.pool.evict_service(role, &server);
                return Err(ClientError::coordinator_unavailable(
                    format!("{} at {} failed its liveness check", role, server.host_port()),
                    Some(err.into()),
                ));
            }
        }
        info!(role = %role, server = %server, "connected to coordinator service");
        Ok((stub, server))
    }

    async fn sweep(&self) -> usize {
        let _gate = self.gate.lock().await;
        let now = Instant::now();
        let mut closed = 0;

        let session = {
            let mut state = self.state.lock();
            if state.session.expired(now) {
                state.session.reset().0
            } else {
                None
            }
        };
        if let Some(session) = session {
            info!("closing idle coordinator session");
            session.close();
            self.metrics.record_idle_reclaimed();
            closed += 1;
        }

        for role in [ServiceRole::CoordinatorAdmin, ServiceRole::CoordinatorMonitor] {
            let expired = self.state.lock().service_slot(role).expired(now);
            if expired {
                info!(role = %role, "closing idle coordinator stub");
                self.reset_service(role);
                self.metrics.record_idle_reclaimed();
                closed += 1;
            }
        }
        closed
    }
}

/// A counted reference to the shared coordinator session.
pub struct CoordinatorSession {
    link: Arc<LinkInner>,
    session: Arc<dyn DiscoverySession>,
    epoch: u64,
}

impl CoordinatorSession {
    pub fn session(&self) -> &Arc<dyn DiscoverySession> {
        &self.session
    }
}

impl Drop for CoordinatorSession {
    fn drop(&mut self) {
        self.link.release_session(self.epoch);
    }
}

/// A counted reference to a shared coordinator service stub.
pub struct CoordinatorServiceHandle {
    link: Arc<LinkInner>,
    role: ServiceRole,
    stub: Arc<dyn ServiceStub>,
    epoch: u64,
}

impl CoordinatorServiceHandle {
    pub fn role(&self) -> ServiceRole {
        self.role
    }

    /// Forwards an opaque call to the coordinator service.
    pub async fn call(&self, method: &str, payload: Bytes) -> Result<Bytes> {
        Ok(self.stub.call(method, payload).await?)
    }

    /// Checks the service; failures read as "not running".
    pub async fn is_running(&self) -> bool {
        self.link.connected_and_running(&self.stub).await
    }
}

impl Drop for CoordinatorServiceHandle {
    fn drop(&mut self) {
        self.link.release_service(self.role, self.epoch);
    }
}

/// Handle for the background keep-alive sweeper.
///
/// Call `stop` to end the task; dropping the handle also stops it.
pub struct SweepHandle {
    stop: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl SweepHandle {
    pub fn stop(mut self) {
        self.halt();
    }

    fn halt(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(join) = self.join.take() {
            join.abort();
        }
    }
}

impl Drop for SweepHandle {
    fn drop(&mut self) {
        self.halt();
    }
}
