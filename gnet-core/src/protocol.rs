//! Gnutella wire protocol: message header, message kinds, handshake literals, version.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};

/// Size of the binary message header: GUID (16) + function (1) + TTL (1) + hops (1) + size (4 LE).
pub const HEADER_SIZE: usize = 23;

/// Protocol name used in both handshake dialects.
pub const PROTO_NAME: &str = "GNUTELLA";

/// Prefix of every hello request line, followed by `<major>.<minor>`.
pub const HELLO_PREFIX: &str = "GNUTELLA CONNECT/";

/// Fixed acknowledgment of a legacy (0.4) hello.
pub const LEGACY_WELCOME: &[u8] = b"GNUTELLA OK\n\n";

/// Payload size of a pong: port (2) + IPv4 (4) + files (4) + kbytes (4).
pub const PONG_PAYLOAD_LEN: usize = 14;

/// Payload size of a push request: servent id (16) + file index (4) + IPv4 (4) + port (2).
pub const PUSH_PAYLOAD_LEN: usize = 26;

/// Protocol version, as carried on hello and status lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Version {
    pub major: u8,
    pub minor: u8,
}

impl Version {
    /// The minimal single-line dialect.
    pub const LEGACY: Version = Version { major: 0, minor: 4 };
    /// The header-carrying dialect we propose on outbound connections.
    pub const MODERN: Version = Version { major: 0, minor: 6 };

    pub fn is_legacy(self) -> bool {
        self <= Version::LEGACY
    }

    /// Parse `"<major>.<minor>"`, ignoring anything after the minor digits.
    pub fn parse(s: &str) -> Option<Version> {
        let (major, rest) = s.trim_start().split_once('.')?;
        let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
        Some(Version {
            major: major.trim().parse().ok()?,
            minor: digits.parse().ok()?,
        })
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Message / query identifier (a.k.a. MUID). Copied by value everywhere.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Guid(pub [u8; 16]);

impl Guid {
    /// Fresh random GUID, marked the way ping-limiting servents mark theirs
    /// (byte 8 = 0xff, byte 15 = protocol level 1).
    pub fn random() -> Self {
        let mut bytes = uuid::Uuid::new_v4().into_bytes();
        bytes[8] = 0xff;
        bytes[15] = 1;
        Guid(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Whether the GUID follows the ping-limiting convention.
    pub fn is_ping_limiting(&self) -> bool {
        self.0[8] == 0xff && self.0[15] >= 1
    }
}

impl fmt::Debug for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Guid({})", hex::encode(self.0))
    }
}

impl fmt::Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// Message function codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Ping,
    Pong,
    Push,
    Query,
    QueryHit,
    Unknown(u8),
}

impl MessageKind {
    pub fn from_byte(b: u8) -> Self {
        match b {
            0x00 => MessageKind::Ping,
            0x01 => MessageKind::Pong,
            0x40 => MessageKind::Push,
            0x80 => MessageKind::Query,
            0x81 => MessageKind::QueryHit,
            other => MessageKind::Unknown(other),
        }
    }

    pub fn as_byte(self) -> u8 {
        match self {
            MessageKind::Ping => 0x00,
            MessageKind::Pong => 0x01,
            MessageKind::Push => 0x40,
            MessageKind::Query => 0x80,
            MessageKind::QueryHit => 0x81,
            MessageKind::Unknown(b) => b,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            MessageKind::Ping => "ping",
            MessageKind::Pong => "pong",
            MessageKind::Push => "push",
            MessageKind::Query => "query",
            MessageKind::QueryHit => "query hit",
            MessageKind::Unknown(_) => "unknown",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Fixed-size binary envelope preceding every payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub guid: Guid,
    pub kind: MessageKind,
    pub ttl: u8,
    pub hops: u8,
    /// Payload length in bytes (little-endian on the wire).
    pub size: u32,
}

impl MessageHeader {
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[..16].copy_from_slice(&self.guid.0);
        out[16] = self.kind.as_byte();
        out[17] = self.ttl;
        out[18] = self.hops;
        out[19..23].copy_from_slice(&self.size.to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8; HEADER_SIZE]) -> Self {
        let mut guid = [0u8; 16];
        guid.copy_from_slice(&bytes[..16]);
        MessageHeader {
            guid: Guid(guid),
            kind: MessageKind::from_byte(bytes[16]),
            ttl: bytes[17],
            hops: bytes[18],
            size: u32::from_le_bytes([bytes[19], bytes[20], bytes[21], bytes[22]]),
        }
    }
}

/// A complete message: header plus payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub header: MessageHeader,
    pub payload: Vec<u8>,
}

impl Message {
    /// Build a message, filling in the header size from the payload.
    pub fn new(guid: Guid, kind: MessageKind, ttl: u8, hops: u8, payload: Vec<u8>) -> Self {
        Message {
            header: MessageHeader {
                guid,
                kind,
                ttl,
                hops,
                size: payload.len() as u32,
            },
            payload,
        }
    }

    pub fn kind(&self) -> MessageKind {
        self.header.kind
    }

    pub fn guid(&self) -> Guid {
        self.header.guid
    }

    pub fn ping(guid: Guid, ttl: u8) -> Self {
        Message::new(guid, MessageKind::Ping, ttl, 0, Vec::new())
    }

    /// Pong advertising `addr` with the given shared file count / size.
    pub fn pong(guid: Guid, ttl: u8, addr: SocketAddrV4, files: u32, kbytes: u32) -> Self {
        let mut payload = Vec::with_capacity(PONG_PAYLOAD_LEN);
        payload.extend_from_slice(&addr.port().to_le_bytes());
        payload.extend_from_slice(&addr.ip().octets());
        payload.extend_from_slice(&files.to_le_bytes());
        payload.extend_from_slice(&kbytes.to_le_bytes());
        Message::new(guid, MessageKind::Pong, ttl, 0, payload)
    }

    /// Address advertised by a pong, if this is a well-formed one.
    pub fn pong_addr(&self) -> Option<SocketAddrV4> {
        if self.kind() != MessageKind::Pong || self.payload.len() != PONG_PAYLOAD_LEN {
            return None;
        }
        Some(addr_at(&self.payload, 0))
    }

    /// Number of results carried by a query hit (first payload byte).
    pub fn hit_count(&self) -> Option<u8> {
        match (self.kind(), self.payload.first()) {
            (MessageKind::QueryHit, Some(&n)) if n > 0 => Some(n),
            _ => None,
        }
    }

    /// Address of the servent that produced a query hit.
    pub fn hit_addr(&self) -> Option<SocketAddrV4> {
        if self.kind() != MessageKind::QueryHit || self.payload.len() < 11 {
            return None;
        }
        Some(addr_at(&self.payload, 1))
    }

    /// Copy suitable for relaying: one hop more, one TTL less.
    pub fn relayed(&self) -> Message {
        let mut out = self.clone();
        out.header.ttl = out.header.ttl.saturating_sub(1);
        out.header.hops = out.header.hops.saturating_add(1);
        out
    }
}

/// Hex of at most `max` leading bytes, for logging peer input.
pub fn hex_prefix(bytes: &[u8], max: usize) -> String {
    let mut out = hex::encode(&bytes[..bytes.len().min(max)]);
    if bytes.len() > max {
        out.push_str("..");
    }
    out
}

/// Port (LE u16) followed by IPv4 octets.
fn addr_at(payload: &[u8], at: usize) -> SocketAddrV4 {
    let port = u16::from_le_bytes([payload[at], payload[at + 1]]);
    let ip = Ipv4Addr::new(
        payload[at + 2],
        payload[at + 3],
        payload[at + 4],
        payload[at + 5],
    );
    SocketAddrV4::new(ip, port)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_layout_is_little_endian() {
        let header = MessageHeader {
            guid: Guid([7; 16]),
            kind: MessageKind::QueryHit,
            ttl: 5,
            hops: 2,
            size: 0x0102_0304,
        };
        let bytes = header.encode();
        assert_eq!(bytes[16], 0x81);
        assert_eq!(bytes[17], 5);
        assert_eq!(bytes[18], 2);
        assert_eq!(&bytes[19..], &[0x04, 0x03, 0x02, 0x01]);
        assert_eq!(MessageHeader::decode(&bytes), header);
    }

    #[test]
    fn version_parse() {
        assert_eq!(Version::parse("0.6"), Some(Version::MODERN));
        assert_eq!(Version::parse("0.4\r"), Some(Version::LEGACY));
        assert_eq!(Version::parse("1.0 extra"), Some(Version { major: 1, minor: 0 }));
        assert_eq!(Version::parse("x.y"), None);
        assert!(Version::LEGACY.is_legacy());
        assert!(!Version::MODERN.is_legacy());
    }

    #[test]
    fn pong_carries_address() {
        let addr = SocketAddrV4::new(Ipv4Addr::new(10, 1, 2, 3), 6346);
        let pong = Message::pong(Guid::default(), 1, addr, 12, 3400);
        assert_eq!(pong.payload.len(), PONG_PAYLOAD_LEN);
        assert_eq!(pong.pong_addr(), Some(addr));
    }

    #[test]
    fn hex_prefix_truncates() {
        assert_eq!(hex_prefix(&[0xde, 0xad, 0xbe, 0xef], 2), "dead..");
        assert_eq!(hex_prefix(&[1, 2], 8), "0102");
    }

    #[test]
    fn random_guid_is_marked() {
        assert!(Guid::random().is_ping_limiting());
        assert!(!Guid([0; 16]).is_ping_limiting());
    }

    #[test]
    fn relayed_adjusts_ttl_and_hops() {
        let ping = Message::ping(Guid::random(), 3);
        let relayed = ping.relayed();
        assert_eq!(relayed.header.ttl, 2);
        assert_eq!(relayed.header.hops, 1);
    }
}
