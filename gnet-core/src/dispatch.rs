//! Data-phase message handling: sanity checks, routing, relaying, local handling.

use std::io::IoSlice;
use std::net::SocketAddrV4;

use tracing::{debug, trace, warn};

use crate::connection::ConnectionId;
use crate::core::{Action, Ctx};
use crate::dh::RouteOutcome;
use crate::hosts::is_private;
use crate::protocol::{
    hex_prefix, Message, MessageKind, HEADER_SIZE, PONG_PAYLOAD_LEN, PUSH_PAYLOAD_LEN,
};
use crate::stream::ByteStream;
use crate::wire;

/// Bytes of payload shown when logging a rejected message.
const DUMP_BYTES: usize = 80;

/// Why a message failed its sanity checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Insane {
    Malformed(&'static str),
    /// Legal on the wire, but larger than we relay.
    TooBig(&'static str),
}

pub(crate) struct Dispatcher<'c, 'a> {
    ctx: &'c mut Ctx<'a>,
}

impl<'c, 'a> Dispatcher<'c, 'a> {
    pub(crate) fn new(ctx: &'c mut Ctx<'a>) -> Self {
        Self { ctx }
    }

    pub(crate) fn dispatch(&mut self, from: ConnectionId, msg: Message) {
        let Some(conn) = self.ctx.registry.get_mut(from) else {
            return;
        };
        conn.counters.received += 1;
        self.ctx.stats.messages_received += 1;
        trace!(
            id = %from,
            kind = %msg.kind(),
            guid = %msg.guid(),
            ttl = msg.header.ttl,
            hops = msg.header.hops,
            size = msg.header.size,
            "message"
        );

        if conn.flags.placeholder {
            self.send_connection_pongs(from, &msg);
            return;
        }
        if conn.flags.awaiting_handshake_ping {
            conn.flags.awaiting_handshake_ping = false;
            if msg.kind() == MessageKind::Ping && msg.header.hops == 0 {
                conn.flags.ping_limit = msg.guid().is_ping_limiting();
                debug!(id = %from, ping_limit = conn.flags.ping_limit, "handshake ping");
            }
        }

        if msg.header.ttl == 0 {
            self.malformed(from, &msg, "TTL=0");
            let threshold = self.ctx.config.up_connections.max(2);
            if self.ctx.registry.connected_count() > threshold {
                let verb = if msg.header.hops == 0 { "sent" } else { "relayed" };
                self.ctx.remove(
                    from,
                    format!("Kicked: {} {} message with TTL=0", verb, msg.kind()),
                );
            }
            return;
        }

        match self.check(&msg) {
            Ok(()) => {}
            Err(Insane::Malformed(what)) => {
                self.malformed(from, &msg, what);
                return;
            }
            Err(Insane::TooBig(what)) => {
                debug!(id = %from, kind = %msg.kind(), size = msg.header.size, "{}", what);
                self.dropped(from);
                return;
            }
        }

        let peers = self.ctx.registry.connected_peers(from);
        let route = self.ctx.routes.route(&msg, from, &peers);
        if let Some(reason) = route.dropped {
            self.ctx.stats.routing_errors += 1;
            debug!(id = %from, kind = %msg.kind(), guid = %msg.guid(), reason, "routing");
            if !route.handle_locally {
                self.dropped(from);
            }
        }
        if !route.forward_to.is_empty() {
            self.relay(from, &msg, &route.forward_to);
        }
        if route.handle_locally {
            self.handle_locally(from, msg);
        }
    }

    fn check(&self, msg: &Message) -> Result<(), Insane> {
        let len = msg.payload.len();
        let cfg = self.ctx.config;
        match msg.kind() {
            MessageKind::Ping if len != 0 => Err(Insane::Malformed("ping with payload")),
            MessageKind::Pong if len != PONG_PAYLOAD_LEN => {
                Err(Insane::Malformed("pong with bad payload size"))
            }
            MessageKind::Push if len != PUSH_PAYLOAD_LEN => {
                Err(Insane::Malformed("push with bad payload size"))
            }
            MessageKind::Query if len == 0 => Err(Insane::Malformed("empty query")),
            MessageKind::Query if len > cfg.query_forward_size as usize => {
                Err(Insane::TooBig("query too big to relay"))
            }
            MessageKind::QueryHit if len > cfg.query_hit_forward_size as usize => {
                Err(Insane::TooBig("query hit too big to relay"))
            }
            MessageKind::QueryHit if msg.hit_count().is_none() || msg.hit_addr().is_none() => {
                Err(Insane::Malformed("query hit without results"))
            }
            MessageKind::Unknown(_) => Err(Insane::Malformed("unknown message type")),
            _ => Ok(()),
        }
    }

    fn malformed(&mut self, from: ConnectionId, msg: &Message, what: &str) {
        warn!(
            id = %from,
            kind = %msg.kind(),
            ttl = msg.header.ttl,
            hops = msg.header.hops,
            size = msg.header.size,
            payload = %hex_prefix(&msg.payload, DUMP_BYTES),
            "dropping message: {}",
            what
        );
        if let Some(conn) = self.ctx.registry.get_mut(from) {
            conn.counters.malformed += 1;
        }
        self.ctx.stats.malformed += 1;
    }

    fn dropped(&mut self, from: ConnectionId) {
        if let Some(conn) = self.ctx.registry.get_mut(from) {
            conn.counters.dropped += 1;
        }
        self.ctx.stats.dropped += 1;
    }

    /// Forward a copy to each target. Query hits go through the hit router.
    fn relay(&mut self, from: ConnectionId, msg: &Message, targets: &[ConnectionId]) {
        let relayed = msg.relayed();
        let bytes = wire::encode_message(&relayed);
        if msg.kind() != MessageKind::QueryHit {
            for &dest in targets {
                self.ctx.send_bytes(dest, &bytes);
            }
            return;
        }

        let guid = msg.guid();
        let count = u32::from(msg.hit_count().unwrap_or(0));
        self.ctx.router.got_results(guid, count);
        for &dest in targets {
            let Some(conn) = self.ctx.registry.get_mut(dest) else {
                continue;
            };
            let was_empty = conn.queue.is_empty();
            match self.ctx.router.route(guid, count, &bytes, &mut conn.queue) {
                RouteOutcome::Queued => self.ctx.queued(dest, was_empty),
                RouteOutcome::Dropped(reason) => {
                    debug!(id = %from, dest = %dest, guid = %guid, count, reason = %reason, "query hit not relayed");
                    self.dropped(from);
                }
                RouteOutcome::Rejected(e) => self.ctx.remove(dest, e.to_string()),
            }
        }
    }

    fn handle_locally(&mut self, from: ConnectionId, msg: Message) {
        match msg.kind() {
            MessageKind::Ping => {
                if let Some(addr) = self.ctx.local.addr_v4() {
                    let ttl = msg.header.hops.saturating_add(1);
                    let pong = Message::pong(msg.guid(), ttl, addr, 0, 0);
                    self.ctx.send_message(from, &pong);
                }
            }
            MessageKind::Pong => {
                if let Some(addr) = msg.pong_addr() {
                    self.add_candidate(addr);
                }
            }
            MessageKind::QueryHit => {
                if self.ctx.hosts.is_low() {
                    if let Some(addr) = msg.hit_addr() {
                        self.add_candidate(addr);
                    }
                }
            }
            _ => {}
        }
        self.ctx.actions.push(Action::Deliver { from, message: msg });
    }

    fn add_candidate(&mut self, addr: SocketAddrV4) {
        if self.ctx.config.reject_private && is_private(addr.ip()) {
            return;
        }
        self.ctx.hosts.add_candidate(addr);
    }

    /// Placeholder connection: answer the peer's handshake ping with cached
    /// addresses in one write, then hang up.
    fn send_connection_pongs(&mut self, from: ConnectionId, msg: &Message) {
        if msg.kind() != MessageKind::Ping || msg.header.hops != 0 {
            self.ctx
                .remove(from, "Ponging connection did not send handshaking ping");
            return;
        }
        let own = self.ctx.local.addr_v4();
        let Some(conn) = self.ctx.registry.get_mut(from) else {
            return;
        };
        let peer = conn.gnet_addr;
        let addrs: Vec<SocketAddrV4> = self
            .ctx
            .hosts
            .fill(self.ctx.config.connect_pongs + 2)
            .into_iter()
            .filter(|a| Some(*a) != own && Some(*a) != peer)
            .take(self.ctx.config.connect_pongs)
            .collect();
        let pongs: Vec<Vec<u8>> = addrs
            .iter()
            .map(|addr| wire::encode_message(&Message::pong(msg.guid(), 1, *addr, 0, 0)))
            .collect();
        let slices: Vec<IoSlice<'_>> = pongs.iter().map(|p| IoSlice::new(p)).collect();

        let written = match conn.stream.as_mut() {
            Some(stream) if !slices.is_empty() => match stream.write_vectored(&slices) {
                Ok(n) => n,
                Err(e) => {
                    debug!(id = %from, error = %e, "could not send connection pongs");
                    0
                }
            },
            _ => 0,
        };
        let sent = written / (HEADER_SIZE + PONG_PAYLOAD_LEN);
        conn.counters.sent += sent as u64;
        conn.counters.tx_bytes += written as u64;
        self.ctx.stats.messages_sent += sent as u64;
        self.ctx.remove(
            from,
            format!(
                "Sent {} connection pong{}",
                sent,
                if sent == 1 { "" } else { "s" }
            ),
        );
    }
}
