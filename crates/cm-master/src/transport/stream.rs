//! Connection stream types shared by the transport layer

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Buf, Bytes};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Byte stream the servers can read from and write to
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

/// Plain or TLS connection behind one type
pub type BoxedStream = Box<dyn AsyncStream>;

/// Connection handed to a protocol server after detection
///
/// Bytes consumed while sniffing are replayed before anything else is read
/// from the underlying stream.
pub struct MuxStream {
    replay: Bytes,
    inner: BoxedStream,
    peer: SocketAddr,
}

impl MuxStream {
    /// Wrap a stream, replaying `replay` first
    pub fn new(replay: Bytes, inner: BoxedStream, peer: SocketAddr) -> Self {
        Self {
            replay,
            inner,
            peer,
        }
    }

    /// Remote address
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }
}

impl std::fmt::Debug for MuxStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MuxStream")
            .field("peer", &self.peer)
            .field("replay", &self.replay.len())
            .finish()
    }
}

impl AsyncRead for MuxStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.replay.has_remaining() {
            let n = this.replay.len().min(buf.remaining());
            buf.put_slice(&this.replay[..n]);
            this.replay.advance(n);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for MuxStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// Connection metadata exposed to gRPC handlers
#[derive(Debug, Clone, Copy)]
pub struct MuxConnectInfo {
    pub peer: SocketAddr,
}

impl tonic::transport::server::Connected for MuxStream {
    type ConnectInfo = MuxConnectInfo;

    fn connect_info(&self) -> Self::ConnectInfo {
        MuxConnectInfo { peer: self.peer }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tonic::transport::server::Connected;

    #[tokio::test]
    async fn test_replay_precedes_stream() {
        let (client, server) = tokio::io::duplex(64);
        let peer: SocketAddr = "127.0.0.1:4000".parse().unwrap();
        let mut stream = MuxStream::new(Bytes::from_static(b"PRI "), Box::new(server), peer);

        let mut client = client;
        client.write_all(b"* HTTP/2.0").await.unwrap();
        drop(client);

        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"PRI * HTTP/2.0");
    }

    #[tokio::test]
    async fn test_replay_respects_small_reads() {
        let (_client, server) = tokio::io::duplex(64);
        let peer: SocketAddr = "127.0.0.1:4000".parse().unwrap();
        let mut stream = MuxStream::new(Bytes::from_static(b"abcdef"), Box::new(server), peer);

        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"abcd");
        let mut buf = [0u8; 2];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ef");
    }

    #[tokio::test]
    async fn test_writes_pass_through() {
        let (mut client, server) = tokio::io::duplex(64);
        let peer: SocketAddr = "127.0.0.1:4000".parse().unwrap();
        let mut stream = MuxStream::new(Bytes::new(), Box::new(server), peer);

        stream.write_all(b"pong").await.unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
        assert_eq!(stream.connect_info().peer, peer);
    }
}
