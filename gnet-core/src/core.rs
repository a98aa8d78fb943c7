//! Host-driven API: ServentCore receives readiness events from the host, returns actions.

use std::net::{SocketAddr, SocketAddrV4};
use std::time::Instant;

use chrono::{DateTime, Utc};
use tracing::{debug, info, trace, warn};

use crate::config::{ConfigError, NodeConfig};
use crate::connection::{ConnState, Connection, ConnectionId, Direction, Interest};
use crate::dh::{HitRecord, HitRouter};
use crate::dispatch::Dispatcher;
use crate::handshake::HandshakeEngine;
use crate::hosts::{is_private, AddressCache};
use crate::protocol::{Guid, Message, MessageKind, Version, HEADER_SIZE};
use crate::registry::ConnectionRegistry;
use crate::routing::RoutingTable;
use crate::stream::{ByteStream, Preread};
use crate::wire::{self, FrameError};

/// Notification for the host (UI, logs, telemetry).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeEvent {
    Added {
        id: ConnectionId,
        addr: SocketAddr,
        direction: Direction,
    },
    StateChanged {
        id: ConnectionId,
        state: ConnState,
    },
    Connected {
        id: ConnectionId,
        version: Version,
    },
    Removed {
        id: ConnectionId,
        reason: String,
    },
    /// Our externally visible address, as reported by a peer, changed.
    LocalAddressChanged {
        addr: SocketAddr,
    },
}

/// Action for host to perform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Open a TCP connection and report back with `connected` or `connect_failed`.
    Connect { id: ConnectionId, addr: SocketAddr },
    /// Change the readiness the host watches for. `Interest::NONE` means stop
    /// watching; the stream has been released once a `Removed` event follows.
    Interest { id: ConnectionId, interest: Interest },
    Event(NodeEvent),
    /// A message the core handled locally, for host-level consumers.
    Deliver { from: ConnectionId, message: Message },
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DialError {
    #[error("already connected to {0}")]
    Duplicate(SocketAddr),
    #[error("{0} is our own address")]
    OwnAddress(SocketAddr),
    #[error("{0} is a private address")]
    Private(SocketAddr),
}

/// Global counters, for the host's periodic telemetry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    pub messages_received: u64,
    pub messages_sent: u64,
    pub dropped: u64,
    pub malformed: u64,
    pub routing_errors: u64,
    pub connected: usize,
}

#[derive(Debug, Clone)]
pub(crate) struct LocalInfo {
    /// Our listening address as peers should see it.
    pub(crate) addr: Option<SocketAddr>,
    pub(crate) started: DateTime<Utc>,
}

impl LocalInfo {
    pub(crate) fn addr_v4(&self) -> Option<SocketAddrV4> {
        match self.addr {
            Some(SocketAddr::V4(a)) if !a.ip().is_unspecified() && a.port() != 0 => Some(a),
            _ => None,
        }
    }
}

/// Borrowed view of the core's state for one host event. Handshake and dispatch
/// run against it; actions accumulate until [`finish`](Ctx::finish).
pub(crate) struct Ctx<'a> {
    pub(crate) config: &'a NodeConfig,
    pub(crate) registry: &'a mut ConnectionRegistry,
    pub(crate) router: &'a mut HitRouter,
    pub(crate) hosts: &'a mut Box<dyn AddressCache>,
    pub(crate) routes: &'a mut Box<dyn RoutingTable>,
    pub(crate) local: &'a mut LocalInfo,
    pub(crate) stats: &'a mut Stats,
    pub(crate) actions: Vec<Action>,
    pub(crate) now: Instant,
}

impl<'a> Ctx<'a> {
    pub(crate) fn emit(&mut self, event: NodeEvent) {
        self.actions.push(Action::Event(event));
    }

    /// Move a connection along its state graph, announcing the change.
    pub(crate) fn set_state(&mut self, id: ConnectionId, to: ConnState) -> bool {
        let Some(conn) = self.registry.get_mut(id) else {
            return false;
        };
        let from = conn.state;
        if !conn.set_state(to) {
            warn!(id = %id, from = %from, to = %to, "refused state transition");
            return false;
        }
        trace!(id = %id, from = %from, to = %to, "state change");
        self.emit(NodeEvent::StateChanged { id, state: to });
        true
    }

    /// Tear a connection down: stop watching it, release its stream and queue,
    /// resolve pending hit tickets as discarded, forget its routes.
    pub(crate) fn remove(&mut self, id: ConnectionId, reason: impl Into<String>) {
        let reason = reason.into();
        let Some(conn) = self.registry.get_mut(id) else {
            return;
        };
        if conn.state == ConnState::Removing {
            return;
        }
        if conn.interest != Interest::NONE {
            conn.interest = Interest::NONE;
            self.actions.push(Action::Interest {
                id,
                interest: Interest::NONE,
            });
        }
        conn.stream = None;
        conn.handshake = None;
        conn.remove_reason = Some(reason.clone());
        let tickets = conn.queue.discard_all();
        let (addr, counters) = (conn.addr, conn.counters);
        self.set_state(id, ConnState::Removing);
        for ticket in tickets {
            self.router.complete(ticket, false);
        }
        self.routes.forget(id);
        self.registry.remove(id);
        info!(
            id = %id,
            peer = %addr,
            reason = %reason,
            sent = counters.sent,
            received = counters.received,
            dropped = counters.dropped,
            "connection removed"
        );
        self.emit(NodeEvent::Removed { id, reason });
    }

    pub(crate) fn send_message(&mut self, id: ConnectionId, msg: &Message) {
        let bytes = wire::encode_message(msg);
        self.send_bytes(id, &bytes);
    }

    /// Queue one packet for `id`, writing right away if the queue was idle. A full
    /// queue kills the connection.
    pub(crate) fn send_bytes(&mut self, id: ConnectionId, bytes: &[u8]) {
        let Some(conn) = self.registry.get_mut(id) else {
            return;
        };
        let was_empty = conn.queue.is_empty();
        if let Err((e, _)) = conn.queue.push_packet(bytes, None) {
            self.remove(id, e.to_string());
            return;
        }
        if was_empty {
            self.flush(id);
        }
    }

    /// A hit admitted by the router was queued for `id`.
    pub(crate) fn queued(&mut self, id: ConnectionId, was_empty: bool) {
        if was_empty {
            self.flush(id);
        }
    }

    /// Drain the outbound queue of `id` as far as the stream allows.
    pub(crate) fn flush(&mut self, id: ConnectionId) {
        let Some(conn) = self.registry.get_mut(id) else {
            return;
        };
        let Some(stream) = conn.stream.as_mut() else {
            return;
        };
        let drained = conn.queue.drain(stream);
        conn.counters.sent += drained.packets as u64;
        conn.counters.tx_bytes += drained.bytes as u64;
        self.stats.messages_sent += drained.packets as u64;
        for ticket in drained.sent {
            self.router.complete(ticket, true);
        }
        if let Some(e) = drained.error {
            self.remove(id, format!("Write error: {}", e));
        }
    }

    /// Bring every connection's declared readiness interest in line with its state.
    fn sync_interest(&mut self) {
        for conn in self.registry.iter_mut() {
            let wanted = if conn.stream.is_none() || conn.state == ConnState::Removing {
                Interest::NONE
            } else {
                Interest {
                    read: true,
                    write: !conn.queue.is_empty(),
                }
            };
            if wanted != conn.interest {
                conn.interest = wanted;
                self.actions.push(Action::Interest {
                    id: conn.id,
                    interest: wanted,
                });
            }
        }
    }

    pub(crate) fn finish(mut self) -> Vec<Action> {
        self.sync_interest();
        self.stats.connected = self.registry.connected_count();
        self.actions
    }
}

/// Main coordinator. Host passes events; core returns actions.
pub struct ServentCore {
    config: NodeConfig,
    registry: ConnectionRegistry,
    router: HitRouter,
    hosts: Box<dyn AddressCache>,
    routes: Box<dyn RoutingTable>,
    local: LocalInfo,
    stats: Stats,
}

impl ServentCore {
    pub fn new(
        config: NodeConfig,
        hosts: Box<dyn AddressCache>,
        routes: Box<dyn RoutingTable>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            router: HitRouter::new(config.hits.clone(), Instant::now()),
            config,
            registry: ConnectionRegistry::new(),
            hosts,
            routes,
            local: LocalInfo {
                addr: None,
                started: Utc::now(),
            },
            stats: Stats::default(),
        })
    }

    fn ctx(&mut self, now: Instant) -> Ctx<'_> {
        Ctx {
            config: &self.config,
            registry: &mut self.registry,
            router: &mut self.router,
            hosts: &mut self.hosts,
            routes: &mut self.routes,
            local: &mut self.local,
            stats: &mut self.stats,
            actions: Vec::new(),
            now,
        }
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// Address advertised in pongs and handshake headers.
    pub fn set_local_addr(&mut self, addr: SocketAddr) {
        self.local.addr = Some(addr);
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local.addr
    }

    /// Register a freshly accepted inbound stream and start reading its hello.
    pub fn accept(
        &mut self,
        stream: Box<dyn ByteStream>,
        peer: SocketAddr,
        now: Instant,
    ) -> (ConnectionId, Vec<Action>) {
        let mut ctx = self.ctx(now);
        let id = ctx.registry.allocate_id();
        let mut conn = Connection::new(id, peer, Direction::Inbound, ctx.config, now);
        conn.stream = Some(Preread::new(stream));
        ctx.registry.insert(conn);
        debug!(id = %id, peer = %peer, "accepted connection");
        ctx.emit(NodeEvent::Added {
            id,
            addr: peer,
            direction: Direction::Inbound,
        });
        HandshakeEngine::new(&mut ctx, id).start_inbound();
        (id, ctx.finish())
    }

    /// Start an outbound connection. The host dials and reports back.
    pub fn dial(
        &mut self,
        addr: SocketAddr,
        now: Instant,
    ) -> Result<(ConnectionId, Vec<Action>), DialError> {
        if Some(addr) == self.local.addr {
            return Err(DialError::OwnAddress(addr));
        }
        if let SocketAddr::V4(v4) = addr {
            if self.config.reject_private && is_private(v4.ip()) {
                return Err(DialError::Private(addr));
            }
        }
        let unallocated = ConnectionId(0);
        if self.registry.is_duplicate(addr, false, unallocated, false) {
            return Err(DialError::Duplicate(addr));
        }
        let mut ctx = self.ctx(now);
        let id = ctx.registry.allocate_id();
        let conn = Connection::new(id, addr, Direction::Outbound, ctx.config, now);
        ctx.registry.insert(conn);
        debug!(id = %id, peer = %addr, "dialing");
        ctx.emit(NodeEvent::Added {
            id,
            addr,
            direction: Direction::Outbound,
        });
        ctx.actions.push(Action::Connect { id, addr });
        Ok((id, ctx.finish()))
    }

    /// The host's dial for `id` succeeded.
    pub fn connected(
        &mut self,
        id: ConnectionId,
        stream: Box<dyn ByteStream>,
        now: Instant,
    ) -> Vec<Action> {
        let mut ctx = self.ctx(now);
        match ctx.registry.get_mut(id) {
            Some(conn) if conn.state == ConnState::Connecting && conn.stream.is_none() => {
                conn.stream = Some(Preread::new(stream));
                conn.last_activity = now;
                HandshakeEngine::new(&mut ctx, id).start_outbound();
            }
            _ => debug!(id = %id, "connect completion for unknown connection"),
        }
        ctx.finish()
    }

    /// The host's dial for `id` failed.
    pub fn connect_failed(&mut self, id: ConnectionId, reason: &str, now: Instant) -> Vec<Action> {
        let mut ctx = self.ctx(now);
        ctx.remove(id, reason);
        ctx.finish()
    }

    pub fn readable(&mut self, id: ConnectionId, now: Instant) -> Vec<Action> {
        let mut ctx = self.ctx(now);
        let state = ctx.registry.get(id).map(|c| c.state);
        match state {
            Some(s) if s.is_handshaking() => {
                if HandshakeEngine::new(&mut ctx, id).on_readable() {
                    read_messages(&mut ctx, id);
                }
            }
            Some(ConnState::Connected) => read_messages(&mut ctx, id),
            _ => {}
        }
        ctx.finish()
    }

    pub fn writable(&mut self, id: ConnectionId, now: Instant) -> Vec<Action> {
        let mut ctx = self.ctx(now);
        ctx.flush(id);
        ctx.finish()
    }

    /// Queue a message we originate (or relay on behalf of the host) to one peer.
    pub fn send(&mut self, id: ConnectionId, msg: Message, now: Instant) -> Vec<Action> {
        let mut ctx = self.ctx(now);
        if ctx.registry.get(id).is_some_and(|c| c.is_connected()) {
            if matches!(msg.kind(), MessageKind::Ping | MessageKind::Query) {
                ctx.routes.originate(msg.guid(), msg.kind());
            }
            ctx.send_message(id, &msg);
        }
        ctx.finish()
    }

    /// Periodic timer: timeouts, hit table aging, and keeping enough connections up.
    pub fn tick(&mut self, now: Instant) -> Vec<Action> {
        let mut ctx = self.ctx(now);
        ctx.router.rotate(now);

        let mut expired = Vec::new();
        for conn in ctx.registry.iter() {
            let reason = match conn.state {
                ConnState::Connecting | ConnState::HelloSent
                    if now.saturating_duration_since(conn.last_activity)
                        > ctx.config.connect_timeout() =>
                {
                    Some("Connection timeout")
                }
                ConnState::ReceivingHello | ConnState::WelcomeSent
                    if now.saturating_duration_since(conn.created)
                        > ctx.config.handshake_timeout() =>
                {
                    Some("Handshake timeout")
                }
                ConnState::Connected
                    if now.saturating_duration_since(conn.last_activity)
                        > ctx.config.idle_timeout() =>
                {
                    Some("Activity timeout")
                }
                _ => None,
            };
            if let Some(reason) = reason {
                expired.push((conn.id, reason));
            }
        }
        for (id, reason) in expired {
            ctx.remove(id, reason);
        }
        let mut actions = ctx.finish();
        actions.extend(self.keep_up(now));
        actions
    }

    /// Dial cached addresses until `up_connections` nodes are live or the cache runs dry.
    fn keep_up(&mut self, now: Instant) -> Vec<Action> {
        let mut actions = Vec::new();
        let mut budget = self.config.up_connections;
        while budget > 0 && self.registry.node_count() < self.config.up_connections {
            let Some(addr) = self.hosts.take() else {
                break;
            };
            budget -= 1;
            match self.dial(SocketAddr::V4(addr), now) {
                Ok((_, more)) => actions.extend(more),
                Err(e) => trace!(peer = %addr, error = %e, "skipping cached address"),
            }
        }
        actions
    }

    /// Remove every connection.
    pub fn shutdown(&mut self) -> Vec<Action> {
        let mut ctx = self.ctx(Instant::now());
        for id in ctx.registry.ids() {
            ctx.remove(id, "Servent shutdown");
        }
        ctx.finish()
    }

    pub fn connection(&self, id: ConnectionId) -> Option<&Connection> {
        self.registry.get(id)
    }

    pub fn connections(&self) -> impl Iterator<Item = &Connection> {
        self.registry.iter()
    }

    pub fn stats(&self) -> Stats {
        Stats {
            connected: self.registry.connected_count(),
            ..self.stats
        }
    }

    /// Statistics kept by the hit router for a query.
    pub fn hit_record(&self, guid: &Guid) -> Option<HitRecord> {
        self.router.record(guid)
    }
}

/// Data phase: frame and dispatch messages until the stream would block.
fn read_messages(ctx: &mut Ctx<'_>, id: ConnectionId) {
    loop {
        let Some(conn) = ctx.registry.get_mut(id) else {
            return;
        };
        if conn.state != ConnState::Connected {
            return;
        }
        let Some(stream) = conn.stream.as_mut() else {
            return;
        };
        match conn.framer.read_message(stream) {
            Ok(Some(msg)) => {
                conn.last_activity = ctx.now;
                conn.counters.rx_bytes += (HEADER_SIZE + msg.payload.len()) as u64;
                Dispatcher::new(ctx).dispatch(id, msg);
            }
            Ok(None) => return,
            Err(e) => {
                if let FrameError::TooBig { kind, size, limit } = &e {
                    warn!(id = %id, kind = %kind, size, limit, "message too big");
                }
                ctx.remove(id, e.to_string());
                return;
            }
        }
    }
}
