//! Candidate peer addresses: the cache contract, an in-memory cache, and X-Try header helpers.

use std::collections::{HashSet, VecDeque};
use std::net::{Ipv4Addr, SocketAddrV4};

use rand::seq::IteratorRandom;

/// Port assumed when an address list entry carries none.
pub const DEFAULT_PORT: u16 = 6346;

/// Column at which X-Try lists are folded onto continuation lines.
const FOLD_COLUMN: usize = 72;

/// Source of peer addresses, fed by pongs, handshake headers and query hits.
pub trait AddressCache {
    fn add_candidate(&mut self, addr: SocketAddrV4);

    /// Up to `n` known addresses, left in the cache.
    fn fill(&mut self, n: usize) -> Vec<SocketAddrV4>;

    /// Whether the cache wants more addresses.
    fn is_low(&self) -> bool;

    /// Remove and return one address to dial.
    fn take(&mut self) -> Option<SocketAddrV4> {
        None
    }
}

/// Bounded most-recent-first address cache.
#[derive(Debug)]
pub struct HostCache {
    hosts: VecDeque<SocketAddrV4>,
    known: HashSet<SocketAddrV4>,
    max: usize,
    low: usize,
}

impl HostCache {
    pub fn new(max: usize, low: usize) -> Self {
        Self {
            hosts: VecDeque::new(),
            known: HashSet::new(),
            max,
            low,
        }
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    pub fn contains(&self, addr: &SocketAddrV4) -> bool {
        self.known.contains(addr)
    }
}

impl Default for HostCache {
    fn default() -> Self {
        Self::new(1024, 20)
    }
}

impl AddressCache for HostCache {
    fn add_candidate(&mut self, addr: SocketAddrV4) {
        if addr.port() == 0 || addr.ip().is_unspecified() || addr.ip().is_broadcast() {
            return;
        }
        if !self.known.insert(addr) {
            return;
        }
        self.hosts.push_front(addr);
        while self.hosts.len() > self.max {
            if let Some(old) = self.hosts.pop_back() {
                self.known.remove(&old);
            }
        }
    }

    fn fill(&mut self, n: usize) -> Vec<SocketAddrV4> {
        self.hosts
            .iter()
            .copied()
            .choose_multiple(&mut rand::thread_rng(), n)
    }

    fn is_low(&self) -> bool {
        self.hosts.len() < self.low
    }

    fn take(&mut self) -> Option<SocketAddrV4> {
        let addr = self.hosts.pop_front()?;
        self.known.remove(&addr);
        Some(addr)
    }
}

/// Parse an X-Try style list: `ip[:port]` entries separated by `,` or `;`.
/// Unparseable entries are skipped.
pub fn parse_try_field(value: &str) -> Vec<SocketAddrV4> {
    value
        .split([',', ';'])
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .filter_map(|entry| {
            entry.parse::<SocketAddrV4>().ok().or_else(|| {
                entry
                    .parse::<Ipv4Addr>()
                    .ok()
                    .map(|ip| SocketAddrV4::new(ip, DEFAULT_PORT))
            })
        })
        .collect()
}

/// Render `Name: a:p, b:p` folded with `,\r\n    ` continuations, CRLF-terminated.
/// Empty when there are no addresses.
pub fn format_try_header(name: &str, addrs: &[SocketAddrV4]) -> String {
    let mut out = String::new();
    if addrs.is_empty() {
        return out;
    }
    out.push_str(name);
    out.push_str(": ");
    let mut column = out.len();
    for (i, addr) in addrs.iter().enumerate() {
        let item = addr.to_string();
        if i > 0 {
            if column + 2 + item.len() > FOLD_COLUMN {
                out.push_str(",\r\n    ");
                column = 4;
            } else {
                out.push_str(", ");
                column += 2;
            }
        }
        out.push_str(&item);
        column += item.len();
    }
    out.push_str("\r\n");
    out
}

/// RFC 1918, loopback and link-local addresses.
pub fn is_private(ip: &Ipv4Addr) -> bool {
    ip.is_private() || ip.is_loopback() || ip.is_link_local()
}
