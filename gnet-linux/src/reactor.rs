//! Single-threaded reactor: owns the core, multiplexes every socket and the timer.
//!
//! Each socket gets a small watcher task that waits for the readiness the core
//! asked for and reports it over a channel. The watcher then parks until the
//! reactor has handled the event, so a level-triggered socket does not spin.

use std::cell::Cell;
use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::{Duration, Instant};

use gnet_core::{Action, ConnectionId, Interest, NodeEvent, ServentCore};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Notify};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

use crate::net::TcpByteStream;

const STATS_EVERY: Duration = Duration::from_secs(60);

enum Event {
    Accepted {
        socket: TcpStream,
        peer: SocketAddr,
    },
    Dialed {
        id: ConnectionId,
        token: u64,
        result: io::Result<TcpStream>,
    },
    Ready {
        id: ConnectionId,
        token: u64,
        readable: bool,
        writable: bool,
    },
}

/// Interest shared between the reactor and one watcher task.
struct Watch {
    interest: Cell<Interest>,
    closed: Cell<bool>,
    wake: Notify,
}

impl Watch {
    fn set(&self, interest: Interest) {
        self.interest.set(interest);
        self.wake.notify_one();
    }

    fn close(&self) {
        self.closed.set(true);
        self.wake.notify_one();
    }
}

struct Peer {
    /// Distinguishes this socket from an earlier one under the same id (legacy redial).
    token: u64,
    watch: Rc<Watch>,
}

pub struct Reactor {
    core: ServentCore,
    peers: HashMap<ConnectionId, Peer>,
    dialing: HashMap<ConnectionId, u64>,
    next_token: u64,
    connect_timeout: Duration,
    events_tx: mpsc::UnboundedSender<Event>,
    events_rx: mpsc::UnboundedReceiver<Event>,
}

impl Reactor {
    pub fn new(core: ServentCore, connect_timeout: Duration) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            core,
            peers: HashMap::new(),
            dialing: HashMap::new(),
            next_token: 0,
            connect_timeout,
            events_tx,
            events_rx,
        }
    }

    /// Dial the configured bootstrap peers.
    pub fn bootstrap(&mut self, peers: &[SocketAddr]) {
        for addr in peers {
            match self.core.dial(*addr, Instant::now()) {
                Ok((_, actions)) => self.apply(actions),
                Err(e) => warn!(peer = %addr, error = %e, "not dialing bootstrap peer"),
            }
        }
    }

    /// Run until `shutdown` resolves. Must be polled inside a `LocalSet`.
    pub async fn run(
        mut self,
        listener: TcpListener,
        tick: Duration,
        shutdown: impl Future<Output = anyhow::Result<()>>,
    ) -> anyhow::Result<()> {
        tokio::task::spawn_local(accept_loop(listener, self.events_tx.clone()));
        let mut ticker = tokio::time::interval(tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_stats = Instant::now();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                res = &mut shutdown => {
                    res?;
                    info!(connections = self.peers.len(), "shutting down");
                    let actions = self.core.shutdown();
                    self.apply(actions);
                    return Ok(());
                }
                _ = ticker.tick() => {
                    let now = Instant::now();
                    let actions = self.core.tick(now);
                    self.apply(actions);
                    if now.duration_since(last_stats) >= STATS_EVERY {
                        last_stats = now;
                        let s = self.core.stats();
                        info!(
                            connected = s.connected,
                            received = s.messages_received,
                            sent = s.messages_sent,
                            dropped = s.dropped,
                            malformed = s.malformed,
                            routing_errors = s.routing_errors,
                            "stats"
                        );
                    }
                }
                Some(event) = self.events_rx.recv() => self.handle(event),
            }
        }
    }

    fn handle(&mut self, event: Event) {
        let now = Instant::now();
        match event {
            Event::Accepted { socket, peer } => {
                let socket = Rc::new(socket);
                let stream = Box::new(TcpByteStream::new(socket.clone()));
                let (id, actions) = self.core.accept(stream, peer, now);
                self.watch(id, socket);
                self.apply(actions);
            }
            Event::Dialed { id, token, result } => {
                if self.dialing.get(&id) != Some(&token) {
                    return;
                }
                self.dialing.remove(&id);
                let actions = match result {
                    Ok(socket) => {
                        let socket = Rc::new(socket);
                        self.watch(id, socket.clone());
                        self.core
                            .connected(id, Box::new(TcpByteStream::new(socket)), now)
                    }
                    Err(e) => self.core.connect_failed(id, &e.to_string(), now),
                };
                self.apply(actions);
            }
            Event::Ready {
                id,
                token,
                readable,
                writable,
            } => {
                if self.peers.get(&id).map(|p| p.token) != Some(token) {
                    return;
                }
                if writable {
                    let actions = self.core.writable(id, now);
                    self.apply(actions);
                }
                if readable {
                    let actions = self.core.readable(id, now);
                    self.apply(actions);
                }
                if let Some(peer) = self.peers.get(&id) {
                    peer.watch.wake.notify_one();
                }
            }
        }
    }

    fn apply(&mut self, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::Connect { id, addr } => self.dial(id, addr),
                Action::Interest { id, interest } => {
                    if let Some(peer) = self.peers.get(&id) {
                        peer.watch.set(interest);
                    }
                }
                Action::Event(event) => self.on_event(event),
                Action::Deliver { from, message } => trace!(
                    id = %from,
                    kind = %message.kind(),
                    guid = %message.guid(),
                    "delivered"
                ),
            }
        }
    }

    fn on_event(&mut self, event: NodeEvent) {
        match event {
            NodeEvent::Removed { id, reason } => {
                if let Some(peer) = self.peers.remove(&id) {
                    peer.watch.close();
                }
                self.dialing.remove(&id);
                debug!(id = %id, reason = %reason, "socket released");
            }
            NodeEvent::LocalAddressChanged { addr } => {
                info!(addr = %addr, "advertising new local address");
            }
            NodeEvent::Connected { id, version } => {
                debug!(id = %id, version = %version, "handshake complete");
            }
            NodeEvent::Added { .. } | NodeEvent::StateChanged { .. } => {}
        }
    }

    fn token(&mut self) -> u64 {
        self.next_token += 1;
        self.next_token
    }

    fn watch(&mut self, id: ConnectionId, socket: Rc<TcpStream>) {
        let token = self.token();
        let watch = Rc::new(Watch {
            interest: Cell::new(Interest::NONE),
            closed: Cell::new(false),
            wake: Notify::new(),
        });
        let peer = Peer {
            token,
            watch: watch.clone(),
        };
        if let Some(old) = self.peers.insert(id, peer) {
            old.watch.close();
        }
        tokio::task::spawn_local(watch_socket(id, token, socket, watch, self.events_tx.clone()));
    }

    fn dial(&mut self, id: ConnectionId, addr: SocketAddr) {
        // A redial under a known id replaces the old socket.
        if let Some(old) = self.peers.remove(&id) {
            old.watch.close();
        }
        let token = self.token();
        self.dialing.insert(id, token);
        let tx = self.events_tx.clone();
        let limit = self.connect_timeout;
        debug!(id = %id, peer = %addr, "dialing");
        tokio::task::spawn_local(async move {
            let result = match tokio::time::timeout(limit, TcpStream::connect(addr)).await {
                Ok(r) => r,
                Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "connect timed out")),
            };
            let _ = tx.send(Event::Dialed { id, token, result });
        });
    }
}

async fn accept_loop(listener: TcpListener, tx: mpsc::UnboundedSender<Event>) {
    loop {
        match listener.accept().await {
            Ok((socket, peer)) => {
                if tx.send(Event::Accepted { socket, peer }).is_err() {
                    return;
                }
            }
            Err(e) => {
                warn!(error = %e, "accept failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

async fn watch_socket(
    id: ConnectionId,
    token: u64,
    socket: Rc<TcpStream>,
    watch: Rc<Watch>,
    tx: mpsc::UnboundedSender<Event>,
) {
    use tokio::io::Interest as Mask;

    while !watch.closed.get() {
        let interest = watch.interest.get();
        let mask = match (interest.read, interest.write) {
            (true, true) => Mask::READABLE | Mask::WRITABLE,
            (true, false) => Mask::READABLE,
            (false, true) => Mask::WRITABLE,
            (false, false) => {
                watch.wake.notified().await;
                continue;
            }
        };
        tokio::select! {
            ready = socket.ready(mask) => {
                let (readable, writable) = match ready {
                    Ok(r) => (
                        r.is_readable() || r.is_read_closed(),
                        r.is_writable() || r.is_write_closed(),
                    ),
                    // Let the core's next read surface the error.
                    Err(_) => (true, false),
                };
                let event = Event::Ready { id, token, readable, writable };
                if tx.send(event).is_err() {
                    return;
                }
                watch.wake.notified().await;
            }
            _ = watch.wake.notified() => {}
        }
    }
}
