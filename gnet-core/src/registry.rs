//! Process-wide table of live connections, owned by the core and passed by reference.

use std::collections::BTreeMap;
use std::net::SocketAddr;

use crate::connection::{ConnState, Connection, ConnectionId};

#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    conns: BTreeMap<ConnectionId, Connection>,
    next_id: u64,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn allocate_id(&mut self) -> ConnectionId {
        self.next_id += 1;
        ConnectionId(self.next_id)
    }

    pub(crate) fn insert(&mut self, conn: Connection) {
        self.conns.insert(conn.id, conn);
    }

    pub(crate) fn remove(&mut self, id: ConnectionId) -> Option<Connection> {
        self.conns.remove(&id)
    }

    pub fn get(&self, id: ConnectionId) -> Option<&Connection> {
        self.conns.get(&id)
    }

    pub(crate) fn get_mut(&mut self, id: ConnectionId) -> Option<&mut Connection> {
        self.conns.get_mut(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Connection> {
        self.conns.values()
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut Connection> {
        self.conns.values_mut()
    }

    pub fn ids(&self) -> Vec<ConnectionId> {
        self.conns.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.conns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }

    /// Connections counted against `max_connections`.
    pub fn node_count(&self) -> usize {
        self.conns.values().filter(|c| c.is_node()).count()
    }

    /// Fully established, non-placeholder connections.
    pub fn connected_count(&self) -> usize {
        self.conns
            .values()
            .filter(|c| c.is_connected() && !c.flags.placeholder)
            .count()
    }

    /// Established connections other than `except`, eligible to receive relays.
    pub fn connected_peers(&self, except: ConnectionId) -> Vec<ConnectionId> {
        self.conns
            .values()
            .filter(|c| c.id != except && c.is_connected() && !c.flags.placeholder)
            .map(|c| c.id)
            .collect()
    }

    /// Whether a live connection other than `exclude` already reaches `addr`.
    ///
    /// Inbound attempts match on IP alone when `per_host` is set (one inbound
    /// connection per host); otherwise, and for outbound attempts, IP and port must
    /// both match either the socket address or the peer's advertised listening address.
    pub fn is_duplicate(
        &self,
        addr: SocketAddr,
        incoming: bool,
        exclude: ConnectionId,
        per_host: bool,
    ) -> bool {
        self.conns
            .values()
            .filter(|c| c.id != exclude && c.state != ConnState::Removing && !c.flags.placeholder)
            .any(|c| {
                if incoming && per_host {
                    return c.is_incoming() && c.addr.ip() == addr.ip();
                }
                c.addr == addr || c.gnet_addr.map(SocketAddr::V4) == Some(addr)
            })
    }
}
