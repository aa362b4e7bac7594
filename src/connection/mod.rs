//! Connection manager
//!
//! Keeps one logical connection per remote agent. Connections are created on
//! first acquire, shared between concurrent leases, and replaced after a
//! transport failure.

use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tracing::{debug, info, warn};

use crate::domain::{AgentId, RemoteAgentTransport, RemoteRequest, RemoteStream};
use crate::error::{DispatchError, DispatchResult};
use crate::registry::DescriptorStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Idle,
    Active,
    Closed,
    Failed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Active => "active",
            ConnectionState::Closed => "closed",
            ConnectionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug)]
struct Lifecycle {
    state: ConnectionState,
    leases: usize,
}

/// Logical channel to one remote agent
pub struct Connection {
    generation: u64,
    agent: AgentId,
    address: String,
    transport: Arc<dyn RemoteAgentTransport>,
    lifecycle: Mutex<Lifecycle>,
}

impl Connection {
    fn new(
        generation: u64,
        agent: AgentId,
        address: String,
        transport: Arc<dyn RemoteAgentTransport>,
    ) -> Self {
        Self {
            generation,
            agent,
            address,
            transport,
            lifecycle: Mutex::new(Lifecycle {
                state: ConnectionState::Idle,
                leases: 0,
            }),
        }
    }

    fn lifecycle(&self) -> std::sync::MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> ConnectionState {
        self.lifecycle().state
    }

    pub fn leases(&self) -> usize {
        self.lifecycle().leases
    }

    pub fn agent(&self) -> &AgentId {
        &self.agent
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Distinguishes a recreated connection from the one it replaced
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Takes a lease; only usable (idle or active) connections can be leased
    fn lease(&self) -> bool {
        let mut lifecycle = self.lifecycle();
        match lifecycle.state {
            ConnectionState::Idle | ConnectionState::Active => {
                lifecycle.state = ConnectionState::Active;
                lifecycle.leases += 1;
                true
            }
            ConnectionState::Closed | ConnectionState::Failed => false,
        }
    }

    fn release(&self) {
        let mut lifecycle = self.lifecycle();
        lifecycle.leases = lifecycle.leases.saturating_sub(1);
        if lifecycle.leases == 0 && lifecycle.state == ConnectionState::Active {
            lifecycle.state = ConnectionState::Idle;
        }
    }

    fn mark_failed(&self) {
        let mut lifecycle = self.lifecycle();
        if lifecycle.state != ConnectionState::Closed {
            lifecycle.state = ConnectionState::Failed;
        }
    }

    fn close(&self) {
        self.lifecycle().state = ConnectionState::Closed;
    }
}

/// Lease on a pooled connection. Dropping it releases the lease.
pub struct ConnectionHandle {
    connection: Arc<Connection>,
    released: bool,
}

impl ConnectionHandle {
    pub fn agent(&self) -> &AgentId {
        self.connection.agent()
    }

    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn generation(&self) -> u64 {
        self.connection.generation()
    }

    /// Submits a request; a transport error marks the connection failed
    pub async fn send(&self, request: &RemoteRequest) -> DispatchResult<RemoteStream> {
        let result = self
            .connection
            .transport
            .send(&self.connection.address, request)
            .await;
        if let Err(e) = &result {
            if e.poisons_connection() {
                self.mark_failed();
            }
        }
        result
    }

    /// Asks the remote agent to cancel one of its tasks
    pub async fn cancel_task(&self, remote_task_id: &str) -> DispatchResult<()> {
        self.connection
            .transport
            .cancel(&self.connection.address, remote_task_id)
            .await
    }

    /// Flags the connection so the next acquire replaces it
    pub fn mark_failed(&self) {
        warn!(
            agent = %self.connection.agent,
            generation = self.connection.generation,
            "Connection marked failed"
        );
        self.connection.mark_failed();
    }

    fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.connection.release();
        }
    }
}

impl Drop for ConnectionHandle {
    fn drop(&mut self) {
        self.release();
    }
}

/// Pool of per-agent connections
pub struct ConnectionManager {
    store: Arc<DescriptorStore>,
    transport: Arc<dyn RemoteAgentTransport>,
    pool: RwLock<HashMap<AgentId, Arc<Connection>>>,
    next_generation: AtomicU64,
}

impl ConnectionManager {
    pub fn new(store: Arc<DescriptorStore>, transport: Arc<dyn RemoteAgentTransport>) -> Self {
        Self {
            store,
            transport,
            pool: RwLock::new(HashMap::new()),
            next_generation: AtomicU64::new(1),
        }
    }

    /// Leases the connection to `agent`, creating it if absent or unusable
    pub fn acquire(&self, agent: &AgentId) -> DispatchResult<ConnectionHandle> {
        let descriptor = self
            .store
            .get(agent)
            .ok_or_else(|| DispatchError::UnknownAgent(agent.clone()))?;

        {
            let pool = self.pool.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(connection) = pool.get(agent) {
                if connection.address == descriptor.url && connection.lease() {
                    return Ok(self.handle(connection.clone()));
                }
            }
        }

        let mut pool = self.pool.write().unwrap_or_else(PoisonError::into_inner);
        // Another caller may have replaced it between the two locks.
        if let Some(connection) = pool.get(agent) {
            if connection.address == descriptor.url && connection.lease() {
                return Ok(self.handle(connection.clone()));
            }
            debug!(
                agent = %agent,
                state = %connection.state(),
                "Replacing unusable connection"
            );
            connection.close();
        }

        let connection = Arc::new(Connection::new(
            self.next_generation.fetch_add(1, Ordering::SeqCst),
            agent.clone(),
            descriptor.url.clone(),
            self.transport.clone(),
        ));
        connection.lease();
        pool.insert(agent.clone(), connection.clone());
        debug!(agent = %agent, address = %descriptor.url, "Connection created");
        Ok(self.handle(connection))
    }

    /// Returns a lease to the pool
    pub fn release(&self, mut handle: ConnectionHandle) {
        handle.release();
    }

    /// Closes and forgets the connection to `agent`
    pub fn evict(&self, agent: &AgentId) -> bool {
        let removed = self
            .pool
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(agent);
        match removed {
            Some(connection) => {
                connection.close();
                debug!(agent = %agent, "Connection evicted");
                true
            }
            None => false,
        }
    }

    /// Closes every pooled connection
    pub fn shutdown(&self) {
        let mut pool = self.pool.write().unwrap_or_else(PoisonError::into_inner);
        for connection in pool.values() {
            connection.close();
        }
        info!(connections = pool.len(), "Connection pool shut down");
        pool.clear();
    }

    pub fn state(&self, agent: &AgentId) -> Option<ConnectionState> {
        self.pool
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(agent)
            .map(|c| c.state())
    }

    pub fn len(&self) -> usize {
        self.pool.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn handle(&self, connection: Arc<Connection>) -> ConnectionHandle {
        ConnectionHandle {
            connection,
            released: false,
        }
    }
}
