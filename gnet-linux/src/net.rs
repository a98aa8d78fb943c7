//! ByteStream over a non-blocking tokio TCP socket.

use std::io::{self, IoSlice};
use std::rc::Rc;

use gnet_core::ByteStream;
use tokio::net::TcpStream;

/// Handed to the core; the reactor keeps another handle to wait on readiness.
pub struct TcpByteStream(Rc<TcpStream>);

impl TcpByteStream {
    pub fn new(socket: Rc<TcpStream>) -> Self {
        Self(socket)
    }
}

impl ByteStream for TcpByteStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.try_read(buf)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.try_write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn write_vectored(&mut self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
        self.0.try_write_vectored(bufs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn reports_would_block_then_data() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();

        let server = Rc::new(server);
        let mut ours = TcpByteStream::new(server.clone());
        let mut buf = [0u8; 16];
        let err = ours.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);

        client.writable().await.unwrap();
        client.try_write(b"GNUTELLA").unwrap();
        server.readable().await.unwrap();
        let n = loop {
            match ours.read(&mut buf) {
                Ok(n) => break n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    server.readable().await.unwrap();
                }
                Err(e) => panic!("{e}"),
            }
        };
        assert_eq!(&buf[..n], &b"GNUTELLA"[..n]);
    }
}
