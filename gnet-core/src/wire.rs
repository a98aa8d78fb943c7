//! Framing: 23-byte binary header + payload, and the streaming reader that enforces size ceilings.

use std::io;

use crate::protocol::{Message, MessageHeader, MessageKind, HEADER_SIZE};
use crate::stream::{pull, ByteStream, Transfer};

/// Encode a message as header followed by payload.
pub fn encode_message(msg: &Message) -> Vec<u8> {
    let mut header = msg.header;
    header.size = msg.payload.len() as u32;
    let mut out = Vec::with_capacity(HEADER_SIZE + msg.payload.len());
    out.extend_from_slice(&header.encode());
    out.extend_from_slice(&msg.payload);
    out
}

/// Decode one message from the front of `bytes`. Returns the message and the number of bytes consumed.
/// Call with partial buffer; returns error if not enough bytes (caller should try again after more data).
pub fn decode_message(
    bytes: &[u8],
    limits: &SizeLimits,
) -> Result<(Message, usize), FrameDecodeError> {
    let Some(raw) = bytes.get(..HEADER_SIZE) else {
        return Err(FrameDecodeError::NeedMore);
    };
    let mut fixed = [0u8; HEADER_SIZE];
    fixed.copy_from_slice(raw);
    let header = MessageHeader::decode(&fixed);
    let size = header.size as usize;
    if header.size > limits.ceiling(header.kind) {
        return Err(FrameDecodeError::TooLarge {
            kind: header.kind,
            size: header.size,
        });
    }
    let Some(payload) = bytes.get(HEADER_SIZE..HEADER_SIZE + size) else {
        return Err(FrameDecodeError::NeedMore);
    };
    Ok((
        Message {
            header,
            payload: payload.to_vec(),
        },
        HEADER_SIZE + size,
    ))
}

/// Error decoding a message from a byte slice.
#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("need more bytes")]
    NeedMore,
    #[error("{kind} message too big ({size} bytes)")]
    TooLarge { kind: MessageKind, size: u32 },
}

/// Largest payload accepted per message kind. Anything larger kills the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeLimits {
    pub query: u32,
    pub query_hit: u32,
    pub other: u32,
}

impl SizeLimits {
    pub fn ceiling(&self, kind: MessageKind) -> u32 {
        match kind {
            MessageKind::Query => self.query,
            MessageKind::QueryHit => self.query_hit,
            _ => self.other,
        }
    }

    /// The largest ceiling across all kinds; bounds the framer's payload buffer.
    pub fn max(&self) -> u32 {
        self.query.max(self.query_hit).max(self.other)
    }
}

impl Default for SizeLimits {
    fn default() -> Self {
        Self {
            query: 1024,
            query_hit: 64 * 1024,
            other: 40_000,
        }
    }
}

/// Fatal outcome of reading from a connection in the data phase.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("Got EOF")]
    Eof,
    #[error("Read error: {0}")]
    Io(#[from] io::Error),
    #[error("Kicked: {kind} message too big ({size} bytes, limit {limit})")]
    TooBig {
        kind: MessageKind,
        size: u32,
        limit: u32,
    },
}

/// Two-phase streaming reader: the fixed header first, then exactly the declared payload.
///
/// The payload buffer only grows and never past [`SizeLimits::max`]; it is reused
/// from one message to the next.
#[derive(Debug)]
pub struct MessageFramer {
    limits: SizeLimits,
    header: [u8; HEADER_SIZE],
    header_len: usize,
    pending: Option<MessageHeader>,
    payload: Vec<u8>,
    payload_len: usize,
}

impl MessageFramer {
    pub fn new(limits: SizeLimits) -> Self {
        Self {
            limits,
            header: [0; HEADER_SIZE],
            header_len: 0,
            pending: None,
            payload: Vec::new(),
            payload_len: 0,
        }
    }

    pub fn limits(&self) -> &SizeLimits {
        &self.limits
    }

    /// Bytes currently reserved for payloads.
    pub fn allocated(&self) -> usize {
        self.payload.capacity()
    }

    /// True between messages (no partial header or payload held).
    pub fn is_idle(&self) -> bool {
        self.header_len == 0 && self.pending.is_none()
    }

    /// Read until one full message is available. `Ok(None)` means the stream would
    /// block; call again on the next readiness event. Never reads past the end of
    /// the current message.
    pub fn read_message<S: ByteStream + ?Sized>(
        &mut self,
        stream: &mut S,
    ) -> Result<Option<Message>, FrameError> {
        loop {
            match self.pending {
                None => {
                    let n = match pull(stream, &mut self.header[self.header_len..])? {
                        Transfer::Bytes(n) => n,
                        Transfer::WouldBlock => return Ok(None),
                        Transfer::Eof => return Err(FrameError::Eof),
                    };
                    self.header_len += n;
                    if self.header_len < HEADER_SIZE {
                        continue;
                    }
                    let header = MessageHeader::decode(&self.header);
                    self.header_len = 0;
                    if header.size == 0 {
                        return Ok(Some(Message {
                            header,
                            payload: Vec::new(),
                        }));
                    }
                    let limit = self.limits.ceiling(header.kind);
                    if header.size > limit {
                        return Err(FrameError::TooBig {
                            kind: header.kind,
                            size: header.size,
                            limit,
                        });
                    }
                    let size = header.size as usize;
                    if self.payload.capacity() < size {
                        let target = size.max(self.payload.capacity() * 2);
                        let target = target.min(self.limits.max() as usize).max(size);
                        self.payload.reserve_exact(target - self.payload.len());
                    }
                    self.payload.clear();
                    self.payload.resize(size, 0);
                    self.payload_len = 0;
                    self.pending = Some(header);
                }
                Some(header) => {
                    let size = header.size as usize;
                    let n = match pull(stream, &mut self.payload[self.payload_len..size])? {
                        Transfer::Bytes(n) => n,
                        Transfer::WouldBlock => return Ok(None),
                        Transfer::Eof => return Err(FrameError::Eof),
                    };
                    self.payload_len += n;
                    if self.payload_len < size {
                        continue;
                    }
                    self.pending = None;
                    self.payload_len = 0;
                    return Ok(Some(Message {
                        header,
                        payload: self.payload[..size].to_vec(),
                    }));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Guid;
    use crate::stream::MemoryStream;
    use proptest::prelude::*;

    fn query(text: &str) -> Message {
        let mut payload = vec![0, 0];
        payload.extend_from_slice(text.as_bytes());
        payload.push(0);
        Message::new(Guid::random(), MessageKind::Query, 7, 0, payload)
    }

    #[test]
    fn slice_decode_roundtrip_and_need_more() {
        let msg = query("hello");
        let bytes = encode_message(&msg);
        let (decoded, n) = decode_message(&bytes, &SizeLimits::default()).unwrap();
        assert_eq!(n, bytes.len());
        assert_eq!(decoded, msg);
        assert!(matches!(
            decode_message(&bytes[..10], &SizeLimits::default()),
            Err(FrameDecodeError::NeedMore)
        ));
        assert!(matches!(
            decode_message(&bytes[..HEADER_SIZE + 1], &SizeLimits::default()),
            Err(FrameDecodeError::NeedMore)
        ));
    }

    #[test]
    fn zero_length_dispatches_immediately() {
        let mem = MemoryStream::new();
        let ping = Message::ping(Guid::random(), 1);
        mem.push_input(&encode_message(&ping));
        let mut framer = MessageFramer::new(SizeLimits::default());
        let got = framer.read_message(&mut mem.clone()).unwrap();
        assert_eq!(got, Some(ping));
        assert_eq!(framer.allocated(), 0);
        assert!(framer.read_message(&mut mem.clone()).unwrap().is_none());
    }

    #[test]
    fn oversized_message_is_refused_before_allocation() {
        let limits = SizeLimits {
            query: 16,
            query_hit: 64,
            other: 32,
        };
        let msg = query("this query is longer than sixteen bytes");
        let mem = MemoryStream::new();
        mem.push_input(&encode_message(&msg));
        let mut framer = MessageFramer::new(limits);
        let err = framer.read_message(&mut mem.clone()).unwrap_err();
        assert!(matches!(err, FrameError::TooBig { limit: 16, .. }));
        assert!(err.to_string().contains("message too big"));
        assert_eq!(framer.allocated(), 0);
    }

    #[test]
    fn eof_mid_message_fails() {
        let mem = MemoryStream::new();
        let bytes = encode_message(&query("abc"));
        mem.push_input(&bytes[..HEADER_SIZE + 2]);
        mem.close_input();
        let mut framer = MessageFramer::new(SizeLimits::default());
        assert!(matches!(
            framer.read_message(&mut mem.clone()),
            Err(FrameError::Eof)
        ));
    }

    #[test]
    fn does_not_read_past_current_message() {
        let mem = MemoryStream::new();
        let a = query("a");
        let b = query("bb");
        mem.push_input(&encode_message(&a));
        mem.push_input(&encode_message(&b));
        let mut framer = MessageFramer::new(SizeLimits::default());
        assert_eq!(framer.read_message(&mut mem.clone()).unwrap(), Some(a));
        assert_eq!(mem.pending_input(), HEADER_SIZE + b.payload.len());
        assert_eq!(framer.read_message(&mut mem.clone()).unwrap(), Some(b));
    }

    #[test]
    fn buffer_never_shrinks_and_stays_capped() {
        let limits = SizeLimits {
            query: 100,
            query_hit: 100,
            other: 100,
        };
        let mut framer = MessageFramer::new(limits);
        let mem = MemoryStream::new();
        mem.push_input(&encode_message(&query(&"x".repeat(60))));
        framer.read_message(&mut mem.clone()).unwrap();
        let after_big = framer.allocated();
        assert!(after_big >= 63 && after_big <= 100);
        mem.push_input(&encode_message(&query("y")));
        framer.read_message(&mut mem.clone()).unwrap();
        assert_eq!(framer.allocated(), after_big);
        mem.push_input(&encode_message(&query(&"z".repeat(90))));
        framer.read_message(&mut mem.clone()).unwrap();
        assert!(framer.allocated() <= 100);
    }

    proptest! {
        #[test]
        fn chunking_does_not_change_messages(
            payloads in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 0..80), 1..6),
            chunk in 1usize..40,
        ) {
            let msgs: Vec<Message> = payloads
                .into_iter()
                .map(|p| Message::new(Guid::random(), MessageKind::QueryHit, 3, 1, p))
                .collect();
            let mut data = Vec::new();
            for m in &msgs {
                data.extend_from_slice(&encode_message(m));
            }

            let mem = MemoryStream::new();
            let mut framer = MessageFramer::new(SizeLimits::default());
            let mut got = Vec::new();
            for piece in data.chunks(chunk) {
                mem.push_input(piece);
                while let Some(m) = framer.read_message(&mut mem.clone()).unwrap() {
                    got.push(m);
                }
            }
            prop_assert_eq!(got, msgs);
            prop_assert!(framer.is_idle());
        }
    }
}
