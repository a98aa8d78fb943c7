//! Byte-stream contract between the core and the host's sockets (plain or TLS).
//!
//! Semantics follow `std::io`: `read` returning `Ok(0)` is end-of-stream, and an
//! error of kind `WouldBlock` means "try again on the next readiness event".

use std::cell::RefCell;
use std::collections::VecDeque;
use std::io::{self, IoSlice, IoSliceMut};
use std::rc::Rc;

use bytes::{Buf, BytesMut};

/// Non-blocking full-duplex stream. Implementations must never block longer than
/// it takes to report `WouldBlock`.
pub trait ByteStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;

    fn flush(&mut self) -> io::Result<()>;

    /// Scatter read. The default fills the first non-empty buffer only.
    fn read_vectored(&mut self, bufs: &mut [IoSliceMut<'_>]) -> io::Result<usize> {
        match bufs.iter_mut().find(|b| !b.is_empty()) {
            Some(buf) => self.read(buf),
            None => Ok(0),
        }
    }

    /// Gather write. The default writes element by element and stops at the first
    /// short write; `WouldBlock` after some progress reports that progress.
    fn write_vectored(&mut self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
        let mut total = 0;
        for buf in bufs.iter().filter(|b| !b.is_empty()) {
            match self.write(buf) {
                Ok(n) => {
                    total += n;
                    if n < buf.len() {
                        break;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock && total > 0 => break,
                Err(e) => return Err(e),
            }
        }
        Ok(total)
    }
}

impl<S: ByteStream + ?Sized> ByteStream for Box<S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        (**self).read(buf)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        (**self).write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        (**self).flush()
    }

    fn read_vectored(&mut self, bufs: &mut [IoSliceMut<'_>]) -> io::Result<usize> {
        (**self).read_vectored(bufs)
    }

    fn write_vectored(&mut self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
        (**self).write_vectored(bufs)
    }
}

/// Result of one read attempt, with the "would block" case separated out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transfer {
    Bytes(usize),
    WouldBlock,
    Eof,
}

/// Read once and classify the outcome. `Interrupted` is reported as `WouldBlock`.
pub fn pull<S: ByteStream + ?Sized>(stream: &mut S, buf: &mut [u8]) -> io::Result<Transfer> {
    match stream.read(buf) {
        Ok(0) if !buf.is_empty() => Ok(Transfer::Eof),
        Ok(n) => Ok(Transfer::Bytes(n)),
        Err(e) if is_transient(&e) => Ok(Transfer::WouldBlock),
        Err(e) => Err(e),
    }
}

pub fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

/// Stream wrapper that serves bytes set aside during the handshake before reading
/// from the live stream, so the data phase has a single read path.
pub struct Preread<S> {
    pending: BytesMut,
    inner: S,
}

impl<S: ByteStream> Preread<S> {
    pub fn new(inner: S) -> Self {
        Self {
            pending: BytesMut::new(),
            inner,
        }
    }

    /// Queue bytes that were read past the end of the handshake.
    pub fn unread(&mut self, bytes: &[u8]) {
        self.pending.extend_from_slice(bytes);
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.inner
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: ByteStream> ByteStream for Preread<S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if !self.pending.is_empty() {
            let n = buf.len().min(self.pending.len());
            buf[..n].copy_from_slice(&self.pending[..n]);
            self.pending.advance(n);
            return Ok(n);
        }
        self.inner.read(buf)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }

    fn write_vectored(&mut self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
        self.inner.write_vectored(bufs)
    }
}

#[derive(Debug, Default)]
struct Pipe {
    incoming: VecDeque<u8>,
    outgoing: Vec<u8>,
    eof: bool,
    write_budget: Option<usize>,
    fail_reads: Option<io::ErrorKind>,
}

/// In-memory stream for driving the core without sockets. Clones share state:
/// keep one clone to inject input and inspect output while the core owns another.
#[derive(Debug, Clone, Default)]
pub struct MemoryStream {
    pipe: Rc<RefCell<Pipe>>,
}

impl MemoryStream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make bytes available to the next reads.
    pub fn push_input(&self, bytes: &[u8]) {
        self.pipe.borrow_mut().incoming.extend(bytes);
    }

    /// Once the pending input is drained, reads report end-of-stream.
    pub fn close_input(&self) {
        self.pipe.borrow_mut().eof = true;
    }

    /// Make subsequent reads fail with the given error kind.
    pub fn fail_reads(&self, kind: io::ErrorKind) {
        self.pipe.borrow_mut().fail_reads = Some(kind);
    }

    /// Cap how many bytes writes will accept before reporting `WouldBlock`.
    /// `None` means unlimited.
    pub fn set_write_budget(&self, budget: Option<usize>) {
        self.pipe.borrow_mut().write_budget = budget;
    }

    /// Everything written so far, leaving it in place.
    pub fn output(&self) -> Vec<u8> {
        self.pipe.borrow().outgoing.clone()
    }

    /// Everything written so far, clearing it.
    pub fn take_output(&self) -> Vec<u8> {
        std::mem::take(&mut self.pipe.borrow_mut().outgoing)
    }

    pub fn pending_input(&self) -> usize {
        self.pipe.borrow().incoming.len()
    }
}

impl ByteStream for MemoryStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut pipe = self.pipe.borrow_mut();
        if let Some(kind) = pipe.fail_reads {
            return Err(io::Error::new(kind, "injected read failure"));
        }
        if pipe.incoming.is_empty() {
            return if pipe.eof {
                Ok(0)
            } else {
                Err(io::ErrorKind::WouldBlock.into())
            };
        }
        let n = buf.len().min(pipe.incoming.len());
        for (dst, src) in buf.iter_mut().zip(pipe.incoming.drain(..n)) {
            *dst = src;
        }
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut pipe = self.pipe.borrow_mut();
        let n = match pipe.write_budget {
            Some(0) if !buf.is_empty() => return Err(io::ErrorKind::WouldBlock.into()),
            Some(budget) => budget.min(buf.len()),
            None => buf.len(),
        };
        if let Some(budget) = pipe.write_budget.as_mut() {
            *budget -= n;
        }
        pipe.outgoing.extend_from_slice(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preread_drains_pending_first() {
        let mem = MemoryStream::new();
        mem.push_input(b"live");
        let mut s = Preread::new(mem.clone());
        s.unread(b"early-");
        let mut buf = [0u8; 4];
        assert_eq!(s.read(&mut buf).unwrap(), 4);
        assert_eq!(&buf, b"earl");
        let mut buf = [0u8; 16];
        assert_eq!(s.read(&mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], b"y-");
        assert_eq!(s.read(&mut buf).unwrap(), 4);
        assert_eq!(&buf[..4], b"live");
        assert_eq!(pull(&mut s, &mut buf).unwrap(), Transfer::WouldBlock);
    }

    #[test]
    fn pull_classifies_eof_and_errors() {
        let mem = MemoryStream::new();
        let mut s = mem.clone();
        let mut buf = [0u8; 8];
        assert_eq!(pull(&mut s, &mut buf).unwrap(), Transfer::WouldBlock);
        mem.push_input(b"ab");
        assert_eq!(pull(&mut s, &mut buf).unwrap(), Transfer::Bytes(2));
        mem.close_input();
        assert_eq!(pull(&mut s, &mut buf).unwrap(), Transfer::Eof);
        mem.fail_reads(io::ErrorKind::ConnectionReset);
        assert!(pull(&mut s, &mut buf).is_err());
    }

    #[test]
    fn write_budget_and_vectored_writes() {
        let mem = MemoryStream::new();
        let mut s = mem.clone();
        mem.set_write_budget(Some(5));
        let n = s
            .write_vectored(&[IoSlice::new(b"abc"), IoSlice::new(b"defg")])
            .unwrap();
        assert_eq!(n, 5);
        assert_eq!(mem.output(), b"abcde");
        let err = s.write(b"x").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
        mem.set_write_budget(None);
        assert_eq!(s.write(b"fg").unwrap(), 2);
        assert_eq!(mem.take_output(), b"abcdefg");
        assert!(mem.output().is_empty());
    }
}
