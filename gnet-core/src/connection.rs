//! One peer connection: identity, lifecycle state, buffers, counters.

use std::fmt;
use std::net::{SocketAddr, SocketAddrV4};
use std::time::Instant;

use crate::config::NodeConfig;
use crate::dh::HitTicket;
use crate::handshake::HandshakeContext;
use crate::protocol::Version;
use crate::queue::OutboundQueue;
use crate::stream::{ByteStream, Preread};
use crate::wire::MessageFramer;

/// Locally assigned sequence number, unique for the life of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lifecycle. Outbound: `Connecting → HelloSent → Connected`; inbound:
/// `ReceivingHello → WelcomeSent → Connected`; any live state may go to `Removing`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnState {
    Connecting,
    HelloSent,
    ReceivingHello,
    WelcomeSent,
    Connected,
    Removing,
}

impl ConnState {
    /// Whether `self → to` is an edge of the state graph. `Removing → Connecting`
    /// is the legacy downgrade edge.
    pub fn can_transition(self, to: ConnState) -> bool {
        use ConnState::*;
        matches!(
            (self, to),
            (Connecting, HelloSent)
                | (HelloSent, Connected)
                | (ReceivingHello, WelcomeSent)
                | (WelcomeSent, Connected)
                | (Removing, Connecting)
        ) || (to == Removing && self != Removing)
    }

    pub fn is_handshaking(self) -> bool {
        matches!(
            self,
            ConnState::Connecting
                | ConnState::HelloSent
                | ConnState::ReceivingHello
                | ConnState::WelcomeSent
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            ConnState::Connecting => "connecting",
            ConnState::HelloSent => "hello sent",
            ConnState::ReceivingHello => "receiving hello",
            ConnState::WelcomeSent => "welcome sent",
            ConnState::Connected => "connected",
            ConnState::Removing => "removing",
        }
    }
}

impl fmt::Display for ConnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Readiness the host should watch for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Interest {
    pub read: bool,
    pub write: bool,
}

impl Interest {
    pub const NONE: Interest = Interest {
        read: false,
        write: false,
    };
    pub const READ: Interest = Interest {
        read: true,
        write: false,
    };
    pub const READ_WRITE: Interest = Interest {
        read: true,
        write: true,
    };
}

/// Per-connection message counters. Only ever incremented.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counters {
    pub sent: u64,
    pub received: u64,
    pub dropped: u64,
    pub malformed: u64,
    pub tx_bytes: u64,
    pub rx_bytes: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Flags {
    /// Busy placeholder: only there to answer the peer's first ping with pongs.
    pub placeholder: bool,
    /// Peer marks its GUIDs the ping-limiting way.
    pub ping_limit: bool,
    /// Outbound modern attempt that may be retried with the legacy dialect.
    pub retry_legacy: bool,
    /// Already downgraded to the legacy dialect once.
    pub downgraded: bool,
    /// Waiting for the peer's first (hops = 0) ping.
    pub awaiting_handshake_ping: bool,
    /// Peer announced pong caching support.
    pub pong_caching: bool,
}

pub struct Connection {
    pub(crate) id: ConnectionId,
    pub(crate) addr: SocketAddr,
    pub(crate) direction: Direction,
    pub(crate) version: Version,
    pub(crate) state: ConnState,
    pub(crate) stream: Option<Preread<Box<dyn ByteStream>>>,
    pub(crate) handshake: Option<HandshakeContext>,
    pub(crate) framer: MessageFramer,
    pub(crate) queue: OutboundQueue<HitTicket>,
    pub(crate) counters: Counters,
    pub(crate) flags: Flags,
    pub(crate) interest: Interest,
    pub(crate) created: Instant,
    pub(crate) last_activity: Instant,
    pub(crate) connected_since: Option<Instant>,
    /// Listening address the peer advertised during the handshake.
    pub(crate) gnet_addr: Option<SocketAddrV4>,
    pub(crate) user_agent: Option<String>,
    pub(crate) remove_reason: Option<String>,
}

impl Connection {
    pub(crate) fn new(
        id: ConnectionId,
        addr: SocketAddr,
        direction: Direction,
        config: &NodeConfig,
        now: Instant,
    ) -> Self {
        let state = match direction {
            Direction::Inbound => ConnState::ReceivingHello,
            Direction::Outbound => ConnState::Connecting,
        };
        Self {
            id,
            addr,
            direction,
            version: Version::MODERN,
            state,
            stream: None,
            handshake: None,
            framer: MessageFramer::new(config.kick_limits()),
            queue: OutboundQueue::new(config.queue_size, config.queue_lowat, config.queue_hiwat),
            counters: Counters::default(),
            flags: Flags::default(),
            interest: Interest::NONE,
            created: now,
            last_activity: now,
            connected_since: None,
            gnet_addr: None,
            user_agent: None,
            remove_reason: None,
        }
    }

    /// Move along the state graph. Returns false, leaving the state alone, for an
    /// edge that does not exist.
    pub(crate) fn set_state(&mut self, to: ConnState) -> bool {
        if !self.state.can_transition(to) {
            return false;
        }
        self.state = to;
        true
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn is_incoming(&self) -> bool {
        self.direction == Direction::Inbound
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn counters(&self) -> &Counters {
        &self.counters
    }

    pub fn flags(&self) -> &Flags {
        &self.flags
    }

    pub fn created(&self) -> Instant {
        self.created
    }

    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    pub fn connected_since(&self) -> Option<Instant> {
        self.connected_since
    }

    pub fn gnet_addr(&self) -> Option<SocketAddrV4> {
        self.gnet_addr
    }

    pub fn user_agent(&self) -> Option<&str> {
        self.user_agent.as_deref()
    }

    pub fn remove_reason(&self) -> Option<&str> {
        self.remove_reason.as_deref()
    }

    pub fn queue_size(&self) -> usize {
        self.queue.size()
    }

    /// Readiness last declared to the host.
    pub fn interest(&self) -> Interest {
        self.interest
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnState::Connected
    }

    /// Counts toward the connection limit: live, and not a placeholder.
    pub fn is_node(&self) -> bool {
        self.state != ConnState::Removing && !self.flags.placeholder
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("addr", &self.addr)
            .field("direction", &self.direction)
            .field("version", &self.version)
            .field("state", &self.state)
            .field("counters", &self.counters)
            .field("flags", &self.flags)
            .field("queue", &self.queue.size())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ConnState::*;

    const ALL: [ConnState; 6] = [
        Connecting,
        HelloSent,
        ReceivingHello,
        WelcomeSent,
        Connected,
        Removing,
    ];

    #[test]
    fn only_downgrade_edge_leaves_removing() {
        for to in ALL {
            assert_eq!(Removing.can_transition(to), to == Connecting, "{to}");
        }
    }

    #[test]
    fn no_backward_edges() {
        assert!(!Connected.can_transition(HelloSent));
        assert!(!WelcomeSent.can_transition(ReceivingHello));
        assert!(!HelloSent.can_transition(Connecting));
        assert!(!Connecting.can_transition(Connected));
        for from in ALL.into_iter().filter(|s| *s != Removing) {
            assert!(from.can_transition(Removing));
        }
    }

    #[test]
    fn set_state_refuses_missing_edges() {
        let cfg = NodeConfig::default();
        let now = Instant::now();
        let addr: SocketAddr = "1.2.3.4:6346".parse().unwrap();
        let mut c = Connection::new(ConnectionId(1), addr, Direction::Inbound, &cfg, now);
        assert_eq!(c.state(), ReceivingHello);
        assert!(!c.set_state(Connected));
        assert!(c.set_state(WelcomeSent));
        assert!(c.set_state(Connected));
        assert!(c.set_state(Removing));
        assert!(!c.set_state(Removing));
        assert_eq!(ConnectionId(7).to_string(), "#7");
    }
}
