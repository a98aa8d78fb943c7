//! Gnutella servent protocol engine.
//! Host-driven: no socket I/O; the host passes streams and readiness events and receives actions.

pub mod config;
pub mod connection;
pub mod core;
pub mod dh;
mod dispatch;
pub mod getline;
pub mod handshake;
pub mod header;
pub mod hosts;
pub mod protocol;
pub mod queue;
pub mod registry;
pub mod routing;
pub mod stream;
pub mod wire;

pub use crate::core::{Action, DialError, NodeEvent, ServentCore, Stats};
pub use config::{ConfigError, HitsConfig, NodeConfig};
pub use connection::{ConnState, Connection, ConnectionId, Direction, Interest};
pub use dh::{DropReason, HitRecord, HitRouter};
pub use hosts::{AddressCache, HostCache};
pub use protocol::{Guid, Message, MessageHeader, MessageKind, Version};
pub use queue::{FlowState, OutboundQueue, QueueError};
pub use routing::{GuidRoutes, Route, RoutingTable};
pub use stream::{ByteStream, MemoryStream};
pub use wire::{decode_message, encode_message, FrameDecodeError, FrameError, MessageFramer};
