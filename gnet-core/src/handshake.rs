//! Connection handshake.
//!
//! Two dialects share the engine. The legacy one is a single
//! `GNUTELLA CONNECT/0.4` line answered by the fixed `GNUTELLA OK` literal. The
//! modern one exchanges HTTP-like header blocks: the initiator sends its hello
//! headers, the acceptor answers with a status line plus headers, and the
//! initiator confirms with a final status line and (usually empty) headers.
//!
//! Outbound modern attempts that die before any status line was understood are
//! retried once with the legacy dialect.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};

use tracing::{debug, info, warn};

use crate::config::NodeConfig;
use crate::connection::{ConnState, ConnectionId, Direction, Interest};
use crate::core::{Action, Ctx, NodeEvent};
use crate::getline::{LineRead, LineReader};
use crate::header::{HeaderBlock, HeaderStatus};
use crate::hosts::{format_try_header, is_private, parse_try_field};
use crate::protocol::{
    hex_prefix, Guid, Message, MessageKind, Version, HELLO_PREFIX, LEGACY_WELCOME, PROTO_NAME,
};
use crate::stream::{pull, ByteStream, Preread, Transfer};

type Stream = Preread<Box<dyn ByteStream>>;

const READ_CHUNK: usize = 4096;

/// Addresses offered in the X-Try header of a busy reply.
const TRY_ADDRESSES: usize = 10;

/// What the engine is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Inbound: the `GNUTELLA CONNECT/x.y` request line.
    RequestLine,
    /// Inbound legacy: the empty line closing the hello.
    LegacyTrailer,
    /// Inbound modern: the peer's hello headers.
    Hello,
    /// Inbound modern: the peer's final status line and headers.
    Ack,
    /// Outbound modern: status line and headers answering our hello.
    Reply,
    /// Outbound legacy: the fixed welcome literal.
    LegacyWelcome,
}

/// A parsed `GNUTELLA/<version> <code> <message>` line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    pub version: Version,
    pub code: u16,
    pub message: String,
}

impl Status {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.code)
    }
}

pub fn parse_status(line: &str) -> Option<Status> {
    let rest = line.strip_prefix(PROTO_NAME)?.strip_prefix('/')?;
    let (version, rest) = rest.split_once(' ')?;
    let version = Version::parse(version)?;
    let rest = rest.trim_start();
    let (code, message) = rest.split_once(' ').unwrap_or((rest, ""));
    if code.len() != 3 || !code.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some(Status {
        version,
        code: code.parse().ok()?,
        message: message.trim().to_string(),
    })
}

/// Transient per-connection negotiation state. Dropped once connected or removed.
#[derive(Debug)]
pub struct HandshakeContext {
    lines: LineReader,
    header: HeaderBlock,
    phase: Phase,
    /// Bytes may follow the current header block in the same read.
    extra_data_ok: bool,
    /// The next line is a status line rather than a header.
    expect_status_line: bool,
    status: Option<Status>,
    welcome_read: usize,
}

impl HandshakeContext {
    fn new(config: &NodeConfig, phase: Phase) -> Self {
        Self {
            lines: LineReader::new(config.max_line_size),
            header: HeaderBlock::new(config.max_header_size, config.max_header_lines),
            phase,
            extra_data_ok: false,
            expect_status_line: matches!(phase, Phase::Reply | Phase::Ack),
            status: None,
            welcome_read: 0,
        }
    }

    fn enter(&mut self, phase: Phase) {
        self.phase = phase;
        self.header.reset();
        self.lines.reset();
        self.status = None;
        self.expect_status_line = matches!(phase, Phase::Reply | Phase::Ack);
        self.extra_data_ok = !matches!(phase, Phase::Hello);
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }
}

/// Why a handshake ended early.
#[derive(Debug)]
struct Failure {
    reason: String,
    /// Eligible for the legacy retry (outbound only, and only before a status line was understood).
    retry: bool,
}

impl Failure {
    fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            retry: false,
        }
    }

    fn retryable(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            retry: true,
        }
    }
}

enum Step {
    Continue,
    Connected,
    Fail(Failure),
}

enum Progress {
    NeedMore,
    /// Handshake complete; bytes from this offset on belong to the data phase.
    Connected(usize),
    Failed(Failure),
}

/// At most 80 characters of a peer-supplied line, for logs and reasons.
fn excerpt(s: &str) -> String {
    let mut out: String = s.chars().take(80).collect();
    if out.len() < s.len() {
        out.push_str("...");
    }
    out
}

/// Write all of `bytes` right now. Handshake replies are small; a short write
/// means the peer is not reading and is treated as fatal.
fn write_direct(stream: &mut Stream, bytes: &[u8]) -> Result<usize, String> {
    let mut off = 0;
    while off < bytes.len() {
        match stream.write(&bytes[off..]) {
            Ok(0) => break,
            Ok(n) => off += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
            Err(e) => return Err(format!("Write error during handshake: {}", e)),
        }
    }
    if off < bytes.len() {
        return Err(format!(
            "Partial write during handshake ({} of {} bytes)",
            off,
            bytes.len()
        ));
    }
    Ok(off)
}

/// Per-connection handshake driver over the shared core state.
pub(crate) struct HandshakeEngine<'c, 'a> {
    ctx: &'c mut Ctx<'a>,
    id: ConnectionId,
}

impl<'c, 'a> HandshakeEngine<'c, 'a> {
    pub(crate) fn new(ctx: &'c mut Ctx<'a>, id: ConnectionId) -> Self {
        Self { ctx, id }
    }

    pub(crate) fn start_inbound(&mut self) {
        let hs = HandshakeContext::new(self.ctx.config, Phase::RequestLine);
        if let Some(conn) = self.ctx.registry.get_mut(self.id) {
            conn.handshake = Some(hs);
        }
    }

    /// Send our hello on a freshly dialed connection.
    pub(crate) fn start_outbound(&mut self) {
        let Some(conn) = self.ctx.registry.get_mut(self.id) else {
            return;
        };
        let legacy = conn.flags.downgraded;
        let Some(mut stream) = conn.stream.take() else {
            return;
        };
        let (hello, phase, version) = if legacy {
            (
                format!("{}{}\n\n", HELLO_PREFIX, Version::LEGACY),
                Phase::LegacyWelcome,
                Version::LEGACY,
            )
        } else {
            (self.modern_hello(), Phase::Reply, Version::MODERN)
        };
        match write_direct(&mut stream, hello.as_bytes()) {
            Ok(n) => {
                let mut hs = HandshakeContext::new(self.ctx.config, phase);
                hs.enter(phase);
                if let Some(conn) = self.ctx.registry.get_mut(self.id) {
                    conn.counters.tx_bytes += n as u64;
                    conn.version = version;
                    conn.flags.retry_legacy = !legacy;
                    conn.handshake = Some(hs);
                    conn.stream = Some(stream);
                }
                debug!(id = %self.id, version = %version, "hello sent");
                self.ctx.set_state(self.id, ConnState::HelloSent);
            }
            Err(reason) => self.ctx.remove(self.id, reason),
        }
    }

    /// Consume whatever the peer sent. Returns true when the connection just
    /// became `Connected`; bytes read past the handshake then wait in the
    /// stream's pre-read buffer.
    pub(crate) fn on_readable(&mut self) -> bool {
        let Some(conn) = self.ctx.registry.get_mut(self.id) else {
            return false;
        };
        let (mut hs, mut stream) = match (conn.handshake.take(), conn.stream.take()) {
            (Some(hs), Some(stream)) => (hs, stream),
            (hs, stream) => {
                conn.handshake = hs;
                conn.stream = stream;
                return false;
            }
        };

        let mut buf = [0u8; READ_CHUNK];
        loop {
            let want = if hs.phase == Phase::LegacyWelcome {
                LEGACY_WELCOME.len() - hs.welcome_read
            } else {
                READ_CHUNK
            };
            let n = match pull(&mut stream, &mut buf[..want]) {
                Ok(Transfer::Bytes(n)) => n,
                Ok(Transfer::WouldBlock) => {
                    self.restore(Some(hs), stream);
                    return false;
                }
                Ok(Transfer::Eof) => {
                    self.fail(Failure::retryable("Failed (EOF)"));
                    return false;
                }
                Err(e) => {
                    self.fail(Failure::retryable(format!("Read error in handshake: {}", e)));
                    return false;
                }
            };
            if let Some(conn) = self.ctx.registry.get_mut(self.id) {
                conn.last_activity = self.ctx.now;
                conn.counters.rx_bytes += n as u64;
            }
            match self.process(&mut hs, &mut stream, &buf[..n]) {
                Progress::NeedMore => continue,
                Progress::Connected(at) => {
                    stream.unread(&buf[at..n]);
                    self.restore(None, stream);
                    self.on_connected();
                    return true;
                }
                Progress::Failed(f) => {
                    drop(stream);
                    self.fail(f);
                    return false;
                }
            }
        }
    }

    fn restore(&mut self, hs: Option<HandshakeContext>, stream: Stream) {
        if let Some(conn) = self.ctx.registry.get_mut(self.id) {
            conn.handshake = hs;
            conn.stream = Some(stream);
        }
    }

    fn process(&mut self, hs: &mut HandshakeContext, stream: &mut Stream, data: &[u8]) -> Progress {
        let mut pos = 0;
        while pos < data.len() {
            if hs.phase == Phase::LegacyWelcome {
                let take = (LEGACY_WELCOME.len() - hs.welcome_read).min(data.len() - pos);
                let expected = &LEGACY_WELCOME[hs.welcome_read..hs.welcome_read + take];
                if &data[pos..pos + take] != expected {
                    warn!(
                        id = %self.id,
                        got = %hex_prefix(&data[pos..pos + take], 16),
                        "bad legacy welcome"
                    );
                    return Progress::Failed(Failure::new("Not a Gnutella server?"));
                }
                hs.welcome_read += take;
                pos += take;
                if hs.welcome_read == LEGACY_WELCOME.len() {
                    self.ctx.set_state(self.id, ConnState::Connected);
                    return Progress::Connected(pos);
                }
                continue;
            }

            match hs.lines.feed(&data[pos..]) {
                LineRead::NeedMore => return Progress::NeedMore,
                LineRead::Overflow => {
                    warn!(
                        id = %self.id,
                        phase = ?hs.phase,
                        start = %excerpt(&hs.lines.as_str()),
                        "handshake line too long"
                    );
                    if hs.phase == Phase::Hello {
                        self.send_error(stream, 413, "Header line too long", false);
                    }
                    return Progress::Failed(Failure::new("Failed (Header line too long)"));
                }
                LineRead::Done(n) => {
                    pos += n;
                    let line = hs.lines.take();
                    match self.on_line(hs, stream, &line, data.len() - pos) {
                        Step::Continue => {}
                        Step::Connected => return Progress::Connected(pos),
                        Step::Fail(f) => return Progress::Failed(f),
                    }
                }
            }
        }
        Progress::NeedMore
    }

    fn on_line(
        &mut self,
        hs: &mut HandshakeContext,
        stream: &mut Stream,
        line: &str,
        remaining: usize,
    ) -> Step {
        match hs.phase {
            Phase::RequestLine => self.on_request_line(hs, line),
            Phase::LegacyTrailer => self.on_legacy_trailer(stream, line),
            Phase::LegacyWelcome => Step::Continue,
            Phase::Hello | Phase::Ack | Phase::Reply => {
                if hs.expect_status_line && hs.status.is_none() {
                    return self.on_status_line(hs, line);
                }
                match hs.header.append(line) {
                    HeaderStatus::Ok => Step::Continue,
                    status @ (HeaderStatus::BadField | HeaderStatus::MalformedContinuation) => {
                        debug!(id = %self.id, line = %excerpt(line), "{}", status);
                        Step::Continue
                    }
                    HeaderStatus::EndOfHeaders => match hs.phase {
                        Phase::Hello => self.on_hello_headers(hs, stream, remaining),
                        Phase::Ack => self.on_ack(hs),
                        _ => self.on_reply(hs, stream),
                    },
                    status => {
                        warn!(id = %self.id, phase = ?hs.phase, "{}", status);
                        if hs.phase == Phase::Hello {
                            self.send_error(stream, 413, status.as_str(), false);
                        }
                        Step::Fail(Failure::new(format!("Failed (Header error: {})", status)))
                    }
                }
            }
        }
    }

    fn on_request_line(&mut self, hs: &mut HandshakeContext, line: &str) -> Step {
        let Some(version) = line.strip_prefix(HELLO_PREFIX).and_then(Version::parse) else {
            warn!(id = %self.id, line = %excerpt(line), "invalid hello");
            return Step::Fail(Failure::new(format!("Invalid hello: {}", excerpt(line))));
        };
        let legacy = version.is_legacy();
        if let Some(conn) = self.ctx.registry.get_mut(self.id) {
            conn.version = if legacy {
                version
            } else {
                version.min(Version::MODERN)
            };
        }
        debug!(id = %self.id, version = %version, "hello received");
        hs.enter(if legacy {
            Phase::LegacyTrailer
        } else {
            Phase::Hello
        });
        Step::Continue
    }

    /// Inbound legacy: the hello is complete. Admit, answer, connect.
    fn on_legacy_trailer(&mut self, stream: &mut Stream, line: &str) -> Step {
        if !line.is_empty() {
            debug!(id = %self.id, line = %excerpt(line), "ignoring text after legacy hello");
        }
        match self.admission() {
            Some((503, _)) => {
                // Keep it just long enough to hand out pongs for other servents.
                if let Some(conn) = self.ctx.registry.get_mut(self.id) {
                    conn.flags.placeholder = true;
                }
                debug!(id = %self.id, "busy, accepting as pong placeholder");
            }
            Some((_, reason)) => return Step::Fail(Failure::new(reason)),
            None => {}
        }
        if let Err(reason) = self.write(stream, LEGACY_WELCOME) {
            return Step::Fail(Failure::new(reason));
        }
        self.ctx.set_state(self.id, ConnState::WelcomeSent);
        self.ctx.set_state(self.id, ConnState::Connected);
        Step::Connected
    }

    fn on_status_line(&mut self, hs: &mut HandshakeContext, line: &str) -> Step {
        if hs.phase == Phase::Reply && line.trim_end() == "GNUTELLA OK" {
            warn!(id = %self.id, "legacy welcome in reply to modern hello");
            return Step::Fail(Failure::new("Protocol mismatch: legacy reply to modern hello"));
        }
        let Some(status) = parse_status(line) else {
            warn!(id = %self.id, phase = ?hs.phase, line = %excerpt(line), "weird status line");
            let reason = format!("Weird handshake reply: {}", excerpt(line));
            return Step::Fail(if hs.phase == Phase::Reply {
                Failure::retryable(reason)
            } else {
                Failure::new(reason)
            });
        };
        if let Some(conn) = self.ctx.registry.get_mut(self.id) {
            conn.flags.retry_legacy = false;
            if status.is_success() && status.version != conn.version {
                debug!(
                    id = %self.id,
                    phase = ?hs.phase,
                    proposed = %conn.version,
                    replied = %status.version,
                    "adopting peer protocol version"
                );
                conn.version = status.version;
            }
        }
        hs.status = Some(status);
        Step::Continue
    }

    /// Inbound modern: the peer's hello headers are in. Admit and welcome.
    fn on_hello_headers(
        &mut self,
        hs: &mut HandshakeContext,
        stream: &mut Stream,
        remaining: usize,
    ) -> Step {
        if remaining > 0 && !hs.extra_data_ok {
            warn!(id = %self.id, bytes = remaining, "data after hello headers");
            return Step::Fail(Failure::new("Failed (Extra data after handshake header)"));
        }
        self.absorb_headers(&hs.header, true);
        if let Some((code, reason)) = self.admission() {
            self.send_error(stream, code, reason, code == 503);
            return Step::Fail(Failure::new(reason));
        }
        let peer = self.peer_ip();
        let mut welcome = format!("{}/{} 200 OK\r\n", PROTO_NAME, Version::MODERN);
        welcome.push_str(&self.common_headers(peer));
        welcome.push_str("Pong-Caching: 0.1\r\n\r\n");
        if let Err(reason) = self.write(stream, welcome.as_bytes()) {
            return Step::Fail(Failure::new(reason));
        }
        self.ctx.set_state(self.id, ConnState::WelcomeSent);
        hs.enter(Phase::Ack);
        Step::Continue
    }

    fn on_ack(&mut self, hs: &mut HandshakeContext) -> Step {
        let Some(status) = hs.status.take() else {
            return Step::Fail(Failure::new("Failed (No status line)"));
        };
        if !status.is_success() {
            return Step::Fail(Failure::new(format!(
                "Peer refused our welcome: {} {}",
                status.code, status.message
            )));
        }
        self.absorb_headers(&hs.header, false);
        self.ctx.set_state(self.id, ConnState::Connected);
        Step::Connected
    }

    /// Outbound modern: the peer answered our hello.
    fn on_reply(&mut self, hs: &mut HandshakeContext, stream: &mut Stream) -> Step {
        let Some(status) = hs.status.take() else {
            return Step::Fail(Failure::new("Failed (No status line)"));
        };
        self.detect_local_address(&hs.header);
        if status.code == 204 {
            return Step::Fail(Failure::new("Shielded node"));
        }
        if !status.is_success() {
            let mut harvested = 0;
            for name in ["X-Try", "X-Try-Ultrapeers"] {
                if let Some(list) = hs.header.get(name) {
                    for addr in parse_try_field(&list) {
                        self.add_candidate(addr);
                        harvested += 1;
                    }
                }
            }
            info!(
                id = %self.id,
                code = status.code,
                message = %status.message,
                harvested,
                "hello refused"
            );
            return Step::Fail(Failure::new(format!(
                "Hello refused: {} {}",
                status.code, status.message
            )));
        }
        self.absorb_headers(&hs.header, false);
        let ack = format!("{}/{} 200 OK\r\n\r\n", PROTO_NAME, Version::MODERN);
        if let Err(reason) = self.write(stream, ack.as_bytes()) {
            return Step::Fail(Failure::new(reason));
        }
        self.ctx.set_state(self.id, ConnState::Connected);
        Step::Connected
    }

    /// Refusal status for an inbound peer, if any.
    fn admission(&self) -> Option<(u16, &'static str)> {
        let conn = self.ctx.registry.get(self.id)?;
        let cfg = self.ctx.config;
        if let IpAddr::V4(ip) = conn.addr.ip() {
            if cfg.reject_private && is_private(&ip) {
                return Some((404, "Denied access from private IP"));
            }
        }
        let own = self.ctx.local.addr_v4();
        if own.is_some() && conn.gnet_addr == own {
            return Some((404, "Already connected"));
        }
        if self.ctx.registry.is_duplicate(
            conn.addr,
            conn.is_incoming(),
            self.id,
            cfg.unique_inbound_per_host,
        ) {
            return Some((404, "Already connected"));
        }
        if self.ctx.registry.node_count() > cfg.max_connections {
            return Some((503, "Too many Gnet connections"));
        }
        None
    }

    /// Record what the peer told us about itself.
    fn absorb_headers(&mut self, header: &HeaderBlock, hello: bool) {
        let advertised = if hello {
            ["X-My-Address", "Listen-IP", "Node"]
                .iter()
                .filter_map(|name| header.get(name))
                .find_map(|v| v.trim().parse::<SocketAddrV4>().ok())
        } else {
            None
        };
        if let Some(conn) = self.ctx.registry.get_mut(self.id) {
            if let Some(ua) = header.get("User-Agent") {
                conn.user_agent = Some(ua);
            }
            conn.flags.pong_caching = header.contains("Pong-Caching");
            if advertised.is_some() {
                conn.gnet_addr = advertised;
            }
        }
        if let Some(addr) = advertised {
            self.add_candidate(addr);
        }
    }

    fn add_candidate(&mut self, addr: SocketAddrV4) {
        if self.ctx.config.reject_private && is_private(addr.ip()) {
            return;
        }
        self.ctx.hosts.add_candidate(addr);
    }

    /// Adopt the address a peer reports seeing us from, if it differs from ours.
    fn detect_local_address(&mut self, header: &HeaderBlock) {
        let Some(ip) = header
            .get("Remote-IP")
            .and_then(|v| v.trim().parse::<Ipv4Addr>().ok())
        else {
            return;
        };
        if ip.is_unspecified() {
            return;
        }
        let Some(SocketAddr::V4(current)) = self.ctx.local.addr else {
            return;
        };
        if *current.ip() == ip {
            return;
        }
        let addr = SocketAddr::V4(SocketAddrV4::new(ip, current.port()));
        info!(id = %self.id, old = %current, new = %addr, "peer reports a different local address");
        self.ctx.local.addr = Some(addr);
        self.ctx.emit(NodeEvent::LocalAddressChanged { addr });
    }

    fn peer_ip(&self) -> Option<IpAddr> {
        self.ctx.registry.get(self.id).map(|c| c.addr.ip())
    }

    fn common_headers(&self, peer: Option<IpAddr>) -> String {
        let mut out = format!("User-Agent: {}\r\n", self.ctx.config.user_agent);
        if let Some(ip) = peer {
            out.push_str(&format!("Remote-IP: {}\r\n", ip));
        }
        out.push_str(&format!(
            "X-Live-Since: {}\r\n",
            self.ctx.local.started.to_rfc2822()
        ));
        out
    }

    fn modern_hello(&self) -> String {
        let mut out = format!("{}{}\r\n", HELLO_PREFIX, Version::MODERN);
        if let Some(addr) = self.ctx.local.addr_v4() {
            out.push_str(&format!("Node: {}\r\n", addr));
        }
        out.push_str(&format!("User-Agent: {}\r\n", self.ctx.config.user_agent));
        out.push_str("Pong-Caching: 0.1\r\n");
        out.push_str(&format!(
            "X-Live-Since: {}\r\n\r\n",
            self.ctx.local.started.to_rfc2822()
        ));
        out
    }

    /// Best-effort refusal. A failed write changes nothing: the connection goes anyway.
    fn send_error(&mut self, stream: &mut Stream, code: u16, message: &str, with_try: bool) {
        let mut reply = format!("{}/{} {} {}\r\n", PROTO_NAME, Version::MODERN, code, message);
        reply.push_str(&self.common_headers(self.peer_ip()));
        if with_try {
            let own = self.ctx.local.addr_v4();
            let peer = self.ctx.registry.get(self.id).and_then(|c| c.gnet_addr);
            let hosts: Vec<SocketAddrV4> = self
                .ctx
                .hosts
                .fill(TRY_ADDRESSES + 2)
                .into_iter()
                .filter(|a| Some(*a) != own && Some(*a) != peer)
                .take(TRY_ADDRESSES)
                .collect();
            reply.push_str(&format_try_header("X-Try", &hosts));
        }
        reply.push_str("\r\n");
        if let Err(e) = self.write(stream, reply.as_bytes()) {
            debug!(id = %self.id, code, error = %e, "could not send refusal");
        }
    }

    fn write(&mut self, stream: &mut Stream, bytes: &[u8]) -> Result<(), String> {
        let n = write_direct(stream, bytes)?;
        if let Some(conn) = self.ctx.registry.get_mut(self.id) {
            conn.counters.tx_bytes += n as u64;
        }
        Ok(())
    }

    /// Remove the connection, or downgrade it to the legacy dialect and redial.
    fn fail(&mut self, f: Failure) {
        let Some(conn) = self.ctx.registry.get_mut(self.id) else {
            return;
        };
        let retry = f.retry
            && conn.flags.retry_legacy
            && !conn.flags.downgraded
            && conn.direction == Direction::Outbound;
        if !retry {
            debug!(id = %self.id, reason = %f.reason, "handshake failed");
            self.ctx.remove(self.id, f.reason);
            return;
        }

        info!(id = %self.id, peer = %conn.addr, reason = %f.reason, "retrying with legacy handshake");
        let addr = conn.addr;
        let deregister = conn.interest != Interest::NONE;
        conn.interest = Interest::NONE;
        conn.stream = None;
        conn.handshake = None;
        conn.flags.retry_legacy = false;
        conn.flags.downgraded = true;
        conn.version = Version::LEGACY;
        conn.last_activity = self.ctx.now;
        if deregister {
            self.ctx.actions.push(Action::Interest {
                id: self.id,
                interest: Interest::NONE,
            });
        }
        self.ctx.set_state(self.id, ConnState::Removing);
        self.ctx.set_state(self.id, ConnState::Connecting);
        self.ctx.actions.push(Action::Connect { id: self.id, addr });
    }

    /// Handshake done: announce, and greet with our own ping unless the
    /// connection is a placeholder.
    fn on_connected(&mut self) {
        let Some(conn) = self.ctx.registry.get_mut(self.id) else {
            return;
        };
        conn.connected_since = Some(self.ctx.now);
        conn.handshake = None;
        conn.flags.awaiting_handshake_ping = true;
        let (version, placeholder) = (conn.version, conn.flags.placeholder);
        info!(
            id = %self.id,
            peer = %conn.addr,
            version = %version,
            agent = conn.user_agent.as_deref().unwrap_or("-"),
            placeholder,
            "connection established"
        );
        self.ctx.emit(NodeEvent::Connected {
            id: self.id,
            version,
        });
        if !placeholder {
            let guid = Guid::random();
            self.ctx.routes.originate(guid, MessageKind::Ping);
            self.ctx.send_message(self.id, &Message::ping(guid, 1));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_lines() {
        assert_eq!(
            parse_status("GNUTELLA/0.6 200 OK"),
            Some(Status {
                version: Version::MODERN,
                code: 200,
                message: "OK".into()
            })
        );
        let busy = parse_status("GNUTELLA/0.6 503 Too many Gnet connections").unwrap();
        assert_eq!(busy.code, 503);
        assert_eq!(busy.message, "Too many Gnet connections");
        assert!(!busy.is_success());
        assert_eq!(parse_status("GNUTELLA/0.7 204").unwrap().message, "");
        assert!(parse_status("GNUTELLA OK").is_none());
        assert!(parse_status("HTTP/1.1 200 OK").is_none());
        assert!(parse_status("GNUTELLA/0.6 20 OK").is_none());
    }

    #[test]
    fn excerpt_truncates() {
        let long = "x".repeat(200);
        assert_eq!(excerpt(&long).len(), 83);
        assert_eq!(excerpt("short"), "short");
    }

    #[test]
    fn phases_set_status_expectations() {
        let mut hs = HandshakeContext::new(&NodeConfig::default(), Phase::RequestLine);
        assert!(!hs.expect_status_line);
        hs.enter(Phase::Hello);
        assert!(!hs.extra_data_ok);
        hs.enter(Phase::Ack);
        assert!(hs.expect_status_line && hs.extra_data_ok);
        assert_eq!(hs.phase(), Phase::Ack);
    }
}
