//! Connection registry with per-address admission control.

use super::connection::{Connection, ConnectionId};
use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;

/// Owns every open [`Connection`] of one event loop.
///
/// Also tracks how many connections each remote address holds; the count is
/// incremented on insert and decremented on remove, never below zero.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: BTreeMap<ConnectionId, Connection>,
    per_address: HashMap<IpAddr, usize>,
    next_id: u64,
}

impl ConnectionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the next connection id.
    pub fn next_id(&mut self) -> ConnectionId {
        self.next_id += 1;
        ConnectionId::new(self.next_id)
    }

    /// Whether another connection from `addr` fits under `cap`
    /// (0 = unlimited).
    #[must_use]
    pub fn admits(&self, addr: IpAddr, cap: usize) -> bool {
        cap == 0 || self.count_for(addr) < cap
    }

    /// Open connections from `addr`.
    #[must_use]
    pub fn count_for(&self, addr: IpAddr) -> usize {
        self.per_address.get(&addr).copied().unwrap_or(0)
    }

    /// Register a connection.
    pub fn insert(&mut self, connection: Connection) {
        *self.per_address.entry(connection.remote_addr()).or_insert(0) += 1;
        if let Some(previous) = self.connections.insert(connection.id(), connection) {
            self.release(previous.remote_addr());
        }
    }

    /// Deregister a connection and hand it back to the caller.
    pub fn remove(&mut self, id: ConnectionId) -> Option<Connection> {
        let connection = self.connections.remove(&id)?;
        self.release(connection.remote_addr());
        Some(connection)
    }

    fn release(&mut self, addr: IpAddr) {
        if let Some(count) = self.per_address.get_mut(&addr) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.per_address.remove(&addr);
            }
        }
    }

    /// Look up a connection.
    #[must_use]
    pub fn get(&self, id: ConnectionId) -> Option<&Connection> {
        self.connections.get(&id)
    }

    /// Look up a connection mutably.
    pub fn get_mut(&mut self, id: ConnectionId) -> Option<&mut Connection> {
        self.connections.get_mut(&id)
    }

    /// Whether `id` is registered.
    #[must_use]
    pub fn contains(&self, id: ConnectionId) -> bool {
        self.connections.contains_key(&id)
    }

    /// Registered connections in id order.
    pub fn iter(&self) -> impl Iterator<Item = &Connection> {
        self.connections.values()
    }

    /// Registered ids in order.
    #[must_use]
    pub fn ids(&self) -> Vec<ConnectionId> {
        self.connections.keys().copied().collect()
    }

    /// Number of open connections.
    #[must_use]
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Whether no connection is open.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}
