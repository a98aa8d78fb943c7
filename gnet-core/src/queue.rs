//! Per-connection outbound byte queue with packet-boundary accounting and watermarks.

use std::collections::VecDeque;
use std::io;

use bytes::{Buf, BytesMut};

use crate::stream::{is_transient, ByteStream};

/// Flow-control classification callers use to throttle new work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum FlowState {
    Normal,
    /// Size above the low watermark.
    FlowControlled,
    /// Size above the high watermark.
    SeverelyControlled,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("Outbound queue full ({size} + {needed} > {capacity} bytes)")]
    Full {
        size: usize,
        needed: usize,
        capacity: usize,
    },
}

/// Remaining bytes of one logical message, with the token resolved once it has
/// fully left the queue.
#[derive(Debug)]
struct Boundary<T> {
    len: usize,
    tag: Option<T>,
}

/// Result of one drain attempt.
#[derive(Debug)]
pub struct Drained<T> {
    pub bytes: usize,
    /// Packets whose last byte was written.
    pub packets: usize,
    /// Tokens of those packets, in queue order.
    pub sent: Vec<T>,
    /// Set when the stream failed; bytes and packets above still count.
    pub error: Option<io::Error>,
}

/// Bounded outbound buffer. `T` is the completion token carried by a packet.
#[derive(Debug)]
pub struct OutboundQueue<T> {
    buf: BytesMut,
    boundaries: VecDeque<Boundary<T>>,
    /// Bytes enqueued since the last boundary mark.
    unmarked: usize,
    capacity: usize,
    lowat: usize,
    hiwat: usize,
}

impl<T> OutboundQueue<T> {
    pub fn new(capacity: usize, lowat: usize, hiwat: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            boundaries: VecDeque::new(),
            unmarked: 0,
            capacity,
            lowat,
            hiwat,
        }
    }

    /// Append bytes. Nothing is written when the result would exceed the capacity.
    pub fn enqueue(&mut self, bytes: &[u8]) -> Result<(), QueueError> {
        if self.buf.len() + bytes.len() > self.capacity {
            return Err(QueueError::Full {
                size: self.buf.len(),
                needed: bytes.len(),
                capacity: self.capacity,
            });
        }
        self.buf.extend_from_slice(bytes);
        self.unmarked += bytes.len();
        Ok(())
    }

    /// Close the logical message made of everything enqueued since the last mark.
    pub fn mark_packet_boundary(&mut self, tag: Option<T>) {
        self.boundaries.push_back(Boundary {
            len: self.unmarked,
            tag,
        });
        self.unmarked = 0;
    }

    /// Enqueue one whole packet and mark its end. On rejection the token is handed back.
    pub fn push_packet(&mut self, bytes: &[u8], tag: Option<T>) -> Result<(), (QueueError, Option<T>)> {
        match self.enqueue(bytes) {
            Ok(()) => {
                self.mark_packet_boundary(tag);
                Ok(())
            }
            Err(e) => Err((e, tag)),
        }
    }

    /// Write as much as the stream accepts, crediting every packet fully written.
    pub fn drain<S: ByteStream + ?Sized>(&mut self, stream: &mut S) -> Drained<T> {
        let mut out = Drained {
            bytes: 0,
            packets: 0,
            sent: Vec::new(),
            error: None,
        };
        while !self.buf.is_empty() {
            match stream.write(&self.buf) {
                Ok(0) => {
                    out.error = Some(io::ErrorKind::WriteZero.into());
                    break;
                }
                Ok(n) => {
                    self.buf.advance(n);
                    out.bytes += n;
                    self.consume(n, &mut out);
                }
                Err(e) if is_transient(&e) => break,
                Err(e) => {
                    out.error = Some(e);
                    break;
                }
            }
        }
        out
    }

    fn consume(&mut self, mut n: usize, out: &mut Drained<T>) {
        while n > 0 {
            let Some(head) = self.boundaries.front_mut() else {
                self.unmarked -= n.min(self.unmarked);
                return;
            };
            if head.len > n {
                head.len -= n;
                return;
            }
            n -= head.len;
            if let Some(done) = self.boundaries.pop_front() {
                out.packets += 1;
                out.sent.extend(done.tag);
            }
        }
        // Zero-length packets at the head are complete as soon as they are reached.
        while self.boundaries.front().is_some_and(|b| b.len == 0) {
            if let Some(done) = self.boundaries.pop_front() {
                out.packets += 1;
                out.sent.extend(done.tag);
            }
        }
    }

    /// Drop everything buffered, returning the tokens of packets never written.
    pub fn discard_all(&mut self) -> Vec<T> {
        self.buf.clear();
        self.unmarked = 0;
        self.boundaries.drain(..).filter_map(|b| b.tag).collect()
    }

    pub fn flow_state(&self) -> FlowState {
        let size = self.buf.len();
        if size > self.hiwat {
            FlowState::SeverelyControlled
        } else if size > self.lowat {
            FlowState::FlowControlled
        } else {
            FlowState::Normal
        }
    }

    pub fn size(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Logical packets not yet fully written.
    pub fn packets(&self) -> usize {
        self.boundaries.len()
    }

    /// Sum of the remaining lengths of marked packets.
    pub fn outstanding(&self) -> usize {
        self.boundaries.iter().map(|b| b.len).sum()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn lowat(&self) -> usize {
        self.lowat
    }

    pub fn hiwat(&self) -> usize {
        self.hiwat
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::MemoryStream;
    use proptest::prelude::*;

    #[test]
    fn rejects_past_capacity() {
        let mut q: OutboundQueue<u32> = OutboundQueue::new(10, 4, 8);
        assert!(q.enqueue(b"12345678").is_ok());
        assert_eq!(
            q.enqueue(b"abc"),
            Err(QueueError::Full {
                size: 8,
                needed: 3,
                capacity: 10
            })
        );
        assert_eq!(q.size(), 8);
        assert!(q.enqueue(b"ab").is_ok());
    }

    #[test]
    fn flow_states() {
        let mut q: OutboundQueue<()> = OutboundQueue::new(100, 10, 20);
        assert_eq!(q.flow_state(), FlowState::Normal);
        q.enqueue(&[0; 10]).unwrap();
        assert_eq!(q.flow_state(), FlowState::Normal);
        q.enqueue(&[0; 1]).unwrap();
        assert_eq!(q.flow_state(), FlowState::FlowControlled);
        q.enqueue(&[0; 9]).unwrap();
        assert_eq!(q.flow_state(), FlowState::FlowControlled);
        q.enqueue(&[0; 1]).unwrap();
        assert_eq!(q.flow_state(), FlowState::SeverelyControlled);

        let mem = MemoryStream::new();
        mem.set_write_budget(Some(5));
        q.drain(&mut mem.clone());
        assert_eq!(q.flow_state(), FlowState::FlowControlled);
        mem.set_write_budget(None);
        q.drain(&mut mem.clone());
        assert_eq!(q.flow_state(), FlowState::Normal);
    }

    #[test]
    fn severe_without_any_drain() {
        let mut q: OutboundQueue<()> = OutboundQueue::new(1000, 100, 200);
        q.enqueue(&[0; 300]).unwrap();
        assert_eq!(q.flow_state(), FlowState::SeverelyControlled);
        q.discard_all();
        assert_eq!(q.flow_state(), FlowState::Normal);
    }

    #[test]
    fn partial_drain_credits_whole_packets_only() {
        let mem = MemoryStream::new();
        let mut q = OutboundQueue::new(1000, 100, 200);
        q.push_packet(b"aaaa", Some(1)).unwrap();
        q.push_packet(b"bbbb", Some(2)).unwrap();
        q.push_packet(b"cc", None).unwrap();

        mem.set_write_budget(Some(6));
        let d = q.drain(&mut mem.clone());
        assert_eq!(d.bytes, 6);
        assert_eq!(d.packets, 1);
        assert_eq!(d.sent, vec![1]);
        assert!(d.error.is_none());
        assert_eq!(q.outstanding(), q.size());

        mem.set_write_budget(None);
        let d = q.drain(&mut mem.clone());
        assert_eq!(d.packets, 2);
        assert_eq!(d.sent, vec![2]);
        assert!(q.is_empty());
        assert_eq!(mem.output(), b"aaaabbbbcc");
    }

    #[test]
    fn discard_returns_unsent_tokens() {
        let mem = MemoryStream::new();
        let mut q = OutboundQueue::new(1000, 100, 200);
        q.push_packet(b"xx", Some("a")).unwrap();
        q.push_packet(b"yy", Some("b")).unwrap();
        q.push_packet(b"zz", Some("c")).unwrap();
        mem.set_write_budget(Some(3));
        let d = q.drain(&mut mem.clone());
        assert_eq!(d.sent, vec!["a"]);
        assert_eq!(q.discard_all(), vec!["b", "c"]);
        assert!(q.is_empty());
        assert_eq!(q.packets(), 0);
    }

    #[test]
    fn rejected_packet_returns_token() {
        let mut q = OutboundQueue::new(4, 1, 2);
        let err = q.push_packet(b"too long", Some(7)).unwrap_err();
        assert_eq!(err.1, Some(7));
        assert_eq!(q.packets(), 0);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Push(usize),
        Drain(usize),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (1usize..60).prop_map(Op::Push),
            (0usize..80).prop_map(Op::Drain),
        ]
    }

    proptest! {
        #[test]
        fn accounting_matches_buffer(ops in proptest::collection::vec(op(), 1..50)) {
            let mem = MemoryStream::new();
            let mut q = OutboundQueue::new(200, 50, 100);
            let mut accepted = 0usize;
            let mut credited = 0usize;
            for op in ops {
                match op {
                    Op::Push(n) => {
                        let before = q.size();
                        match q.push_packet(&vec![1u8; n], Some(n)) {
                            Ok(()) => accepted += 1,
                            Err(_) => prop_assert!(before + n > q.capacity()),
                        }
                    }
                    Op::Drain(budget) => {
                        mem.set_write_budget(Some(budget));
                        let d = q.drain(&mut mem.clone());
                        prop_assert_eq!(d.packets, d.sent.len());
                        credited += d.packets;
                    }
                }
                prop_assert!(q.size() <= q.capacity());
                prop_assert_eq!(q.outstanding(), q.size());
            }
            prop_assert_eq!(accepted, credited + q.packets());
        }
    }
}
