//! Message routing: broadcast of requests, reverse-path routing of replies.

use std::collections::HashMap;

use crate::connection::ConnectionId;
use crate::protocol::{Guid, Message, MessageKind};

/// Routing verdict for one dispatched message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Route {
    /// Whether the core should process the message itself.
    pub handle_locally: bool,
    /// Connections that should receive a relayed copy.
    pub forward_to: Vec<ConnectionId>,
    /// Set when the message was a duplicate or had no return path.
    pub dropped: Option<&'static str>,
}

impl Route {
    fn discard(reason: &'static str) -> Self {
        Route {
            handle_locally: false,
            forward_to: Vec::new(),
            dropped: Some(reason),
        }
    }
}

/// Routing table collaborator. Called once per message that passed sanity checks.
pub trait RoutingTable {
    /// `peers` lists the other connected connections, source excluded.
    fn route(&mut self, msg: &Message, source: ConnectionId, peers: &[ConnectionId]) -> Route;

    /// Mark `guid` as originated here, so replies are handled locally.
    fn originate(&mut self, guid: Guid, kind: MessageKind);

    /// Drop every entry pointing at a removed connection.
    fn forget(&mut self, id: ConnectionId);
}

/// Where a request came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    Local,
    Peer(ConnectionId),
}

/// Two-generation table: once `current` holds `max_entries`, it becomes `previous`.
#[derive(Debug)]
struct Generations<K> {
    current: HashMap<K, Origin>,
    previous: HashMap<K, Origin>,
    max_entries: usize,
}

impl<K: std::hash::Hash + Eq + Copy> Generations<K> {
    fn new(max_entries: usize) -> Self {
        Self {
            current: HashMap::new(),
            previous: HashMap::new(),
            max_entries,
        }
    }

    fn get(&self, key: &K) -> Option<Origin> {
        self.current
            .get(key)
            .or_else(|| self.previous.get(key))
            .copied()
    }

    fn insert(&mut self, key: K, origin: Origin) {
        if self.current.len() >= self.max_entries {
            self.previous = std::mem::take(&mut self.current);
        }
        self.current.insert(key, origin);
    }

    fn forget(&mut self, id: ConnectionId) {
        let keep = |_: &K, o: &mut Origin| *o != Origin::Peer(id);
        self.current.retain(keep);
        self.previous.retain(keep);
    }
}

/// Default GUID routing: pings and queries are flooded, pongs and hits follow the
/// request back, pushes follow the servent id learnt from hits.
#[derive(Debug)]
pub struct GuidRoutes {
    requests: Generations<(Guid, u8)>,
    servents: Generations<Guid>,
}

impl GuidRoutes {
    pub fn new(max_entries: usize) -> Self {
        Self {
            requests: Generations::new(max_entries),
            servents: Generations::new(max_entries),
        }
    }

    fn flood(&mut self, msg: &Message, source: ConnectionId, peers: &[ConnectionId]) -> Route {
        let key = (msg.guid(), msg.kind().as_byte());
        if self.requests.get(&key).is_some() {
            return Route::discard("duplicate");
        }
        self.requests.insert(key, Origin::Peer(source));
        Route {
            handle_locally: true,
            forward_to: if msg.header.ttl > 1 {
                peers.to_vec()
            } else {
                Vec::new()
            },
            dropped: None,
        }
    }

    fn back(&self, key: Option<Origin>, msg: &Message, source: ConnectionId) -> Route {
        match key {
            Some(Origin::Local) => Route {
                handle_locally: true,
                ..Route::default()
            },
            Some(Origin::Peer(to)) if to != source => Route {
                handle_locally: true,
                forward_to: if msg.header.ttl > 1 { vec![to] } else { Vec::new() },
                dropped: None,
            },
            Some(Origin::Peer(_)) => Route::discard("reply sent back to its origin"),
            None => Route {
                handle_locally: true,
                forward_to: Vec::new(),
                dropped: Some("no route"),
            },
        }
    }
}

impl Default for GuidRoutes {
    fn default() -> Self {
        Self::new(32 * 1024)
    }
}

/// Servent id trailing a query hit.
fn hit_servent(msg: &Message) -> Option<Guid> {
    let len = msg.payload.len();
    let tail = msg.payload.get(len.checked_sub(16)?..)?;
    let mut id = [0u8; 16];
    id.copy_from_slice(tail);
    Some(Guid(id))
}

impl RoutingTable for GuidRoutes {
    fn route(&mut self, msg: &Message, source: ConnectionId, peers: &[ConnectionId]) -> Route {
        match msg.kind() {
            MessageKind::Ping | MessageKind::Query => self.flood(msg, source, peers),
            MessageKind::Pong => {
                let origin = self.requests.get(&(msg.guid(), MessageKind::Ping.as_byte()));
                self.back(origin, msg, source)
            }
            MessageKind::QueryHit => {
                if let Some(id) = hit_servent(msg) {
                    self.servents.insert(id, Origin::Peer(source));
                }
                let origin = self
                    .requests
                    .get(&(msg.guid(), MessageKind::Query.as_byte()));
                self.back(origin, msg, source)
            }
            MessageKind::Push => {
                let target = msg.payload.get(..16).and_then(|id| {
                    let mut g = [0u8; 16];
                    g.copy_from_slice(id);
                    self.servents.get(&Guid(g))
                });
                self.back(target, msg, source)
            }
            MessageKind::Unknown(_) => Route::discard("unknown message type"),
        }
    }

    fn originate(&mut self, guid: Guid, kind: MessageKind) {
        self.requests.insert((guid, kind.as_byte()), Origin::Local);
    }

    fn forget(&mut self, id: ConnectionId) {
        self.requests.forget(id);
        self.servents.forget(id);
    }
}
