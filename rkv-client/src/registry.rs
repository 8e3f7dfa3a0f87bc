//! # Connection Registry
//!
//! Purpose: Share one `CoreConnection` among every caller that asks for the same
//! logical configuration.
//!
//! ## Design Principles
//! 1. **Explicit Registry**: The registry is a value the application owns and
//!    passes around; there is no process-wide singleton.
//! 2. **Counted Sharing**: `acquire` increments the connection's user count and
//!    `release` decrements it; the last release closes the connection.
//! 3. **Bounded**: At most `MAX_CACHED_CONNECTIONS` keys are remembered. The least
//!    recently acquired key is forgotten first, and closed if nobody uses it.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::config::{ConnectionConfig, ConnectionKey};
use crate::connection::CoreConnection;
use crate::error::Result;
use crate::rpc::ClusterBackend;

/// Maximum number of configurations the registry remembers.
pub const MAX_CACHED_CONNECTIONS: usize = 31;

/// Builds the collaborators for a new connection.
pub trait BackendFactory: Send + Sync {
    fn backend(&self, config: &ConnectionConfig) -> Result<ClusterBackend>;
}

impl<F> BackendFactory for F
where
    F: Fn(&ConnectionConfig) -> Result<ClusterBackend> + Send + Sync,
{
    fn backend(&self, config: &ConnectionConfig) -> Result<ClusterBackend> {
        self(config)
    }
}

#[derive(Default)]
struct RegistryState {
    connections: HashMap<ConnectionKey, Arc<CoreConnection>>,
    // Least recently acquired first.
    order: VecDeque<ConnectionKey>,
}

impl RegistryState {
    fn touch(&mut self, key: &ConnectionKey) {
        if let Some(pos) = self.order.iter().position(|k| k == key) {
            self.order.remove(pos);
        }
        self.order.push_back(key.clone());
    }

    fn remove(&mut self, key: &ConnectionKey) -> Option<Arc<CoreConnection>> {
        if let Some(pos) = self.order.iter().position(|k| k == key) {
            self.order.remove(pos);
        }
        self.connections.remove(key)
    }

    /// Removes `conn` only if it is the instance registered under its key.
    fn remove_instance(&mut self, conn: &Arc<CoreConnection>) -> bool {
        let registered = matches!(
            self.connections.get(conn.key()),
            Some(current) if Arc::ptr_eq(current, conn)
        );
        if registered {
            self.remove(conn.key());
        }
        registered
    }
}

/// Shares connections per configuration.
pub struct ConnectionRegistry {
    factory: Arc<dyn BackendFactory>,
    capacity: usize,
    state: Mutex<RegistryState>,
}

impl ConnectionRegistry {
    pub fn new(factory: Arc<dyn BackendFactory>) -> Self {
        Self::with_capacity(factory, MAX_CACHED_CONNECTIONS)
    }

    pub fn with_capacity(factory: Arc<dyn BackendFactory>, capacity: usize) -> Self {
        ConnectionRegistry {
            factory,
            capacity: capacity.max(1),
            state: Mutex::new(RegistryState::default()),
        }
    }

    /// Returns the shared connection for `config`, creating it if needed.
    ///
    /// A registered connection that has been closed is replaced by a new one.
    pub async fn acquire(&self, config: &ConnectionConfig) -> Result<Arc<CoreConnection>> {
        config.validate()?;
        let key = config.key();
        let mut state = self.state.lock().await;

        let existing = state.connections.get(&key).cloned();
        let conn = match existing {
            Some(conn) if !conn.is_closed() => conn,
            stale => {
                if stale.is_some() {
                    debug!(quorum = %key.quorum(), "replacing closed connection");
                    state.remove(&key);
                }
                let backend = self.factory.backend(config)?;
                let conn = CoreConnection::connect(config.clone(), backend).await?;
                state.connections.insert(key.clone(), conn.clone());
                conn
            }
        };
        state.touch(&key);

        while state.order.len() > self.capacity {
            let eldest = match state.order.front().cloned() {
                Some(eldest) => eldest,
                None => break,
            };
            if let Some(evicted) = state.remove(&eldest) {
                info!(quorum = %eldest.quorum(), users = evicted.ref_count(), "registry full; forgetting connection");
                if evicted.is_zero_reference() {
                    evicted.close();
                }
            }
        }

        let users = conn.inc_ref();
        debug!(quorum = %key.quorum(), users, "connection acquired");
        Ok(conn)
    }

    /// Gives up one use of `conn`. The last release closes it.
    pub async fn release(&self, conn: &Arc<CoreConnection>) {
        let mut state = self.state.lock().await;
        let users = conn.dec_ref();
        if users == 0 {
            state.remove_instance(conn);
            conn.close();
            debug!(quorum = %conn.key().quorum(), "last user released connection");
        }
    }

    /// Forgets and closes `conn` regardless of how many users remain.
    pub async fn release_stale(&self, conn: &Arc<CoreConnection>) {
        let mut state = self.state.lock().await;
        conn.dec_ref();
        state.remove_instance(conn);
        conn.close();
        info!(quorum = %conn.key().quorum(), "closed stale connection");
    }

    /// Closes and forgets every registered connection.
    pub async fn close_all(&self) {
        let mut state = self.state.lock().await;
        state.order.clear();
        for (_, conn) in state.connections.drain() {
            conn.close();
        }
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.connections.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn contains(&self, config: &ConnectionConfig) -> bool {
        self.state.lock().await.connections.contains_key(&config.key())
    }
}
