//! Protocol demultiplexer
//!
//! One [`SecureListener`] feeds two sub-listeners: gRPC connections go to
//! the RPC side and everything else to the HTTP side. Each accepted
//! connection is handshaken and sniffed on its own task, then handed over
//! with the sniffed bytes replayed in front.

use std::io;
use std::time::Duration;

use bytes::BytesMut;
use futures::stream::{self, BoxStream, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use cm_wire::{Classifier, Protocol, EMPTY_SETTINGS};

use super::stream::{BoxedStream, MuxStream};
use super::tls::{Pending, SecureListener};

/// Connections waiting to be accepted per sub-listener
const ROUTE_BACKLOG: usize = 128;

/// Accept errors that do not mean the listener is broken
fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    )
}

#[derive(Clone)]
struct Route {
    tx: mpsc::Sender<MuxStream>,
    closed: CancellationToken,
}

impl Route {
    async fn deliver(&self, conn: MuxStream) {
        let peer = conn.peer_addr();
        tokio::select! {
            _ = self.closed.cancelled() => {
                tracing::debug!("Dropping connection from {}: sub-listener closed", peer);
            }
            result = self.tx.send(conn) => {
                if result.is_err() {
                    tracing::debug!("Dropping connection from {}: sub-listener gone", peer);
                }
            }
        }
    }
}

/// Accept loop that routes connections to the sub-listeners
pub struct Demux {
    listener: SecureListener,
    rpc: Route,
    http: Route,
    sniff_timeout: Duration,
}

/// The two sub-listeners produced by [`Demux::new`]
pub struct Routes {
    pub rpc: SubListener,
    pub http: SubListener,
}

impl Demux {
    /// Split a listener into RPC and HTTP sub-listeners
    ///
    /// `sniff_timeout` bounds the TLS handshake plus protocol detection for
    /// each connection.
    pub fn new(listener: SecureListener, sniff_timeout: Duration) -> (Self, Routes) {
        let (rpc, rpc_listener) = sub_listener(Protocol::Rpc);
        let (http, http_listener) = sub_listener(Protocol::Http);

        let demux = Self {
            listener,
            rpc,
            http,
            sniff_timeout,
        };
        let routes = Routes {
            rpc: rpc_listener,
            http: http_listener,
        };
        (demux, routes)
    }

    /// Run the accept loop until the base listener fails
    ///
    /// Returning drops the base listener, which closes both sub-listeners.
    pub async fn serve(self) -> io::Result<()> {
        tracing::info!(
            "Demultiplexing {} connections on port {}",
            if self.listener.is_tls() { "TLS" } else { "plaintext" },
            self.listener.port()
        );

        loop {
            let pending = match self.listener.accept().await {
                Ok(pending) => pending,
                Err(e) if is_transient(&e) => {
                    tracing::debug!("Transient accept error: {}", e);
                    continue;
                }
                Err(e) => return Err(e),
            };

            let rpc = self.rpc.clone();
            let http = self.http.clone();
            let sniff_timeout = self.sniff_timeout;
            tokio::spawn(async move {
                route_connection(pending, rpc, http, sniff_timeout).await;
            });
        }
    }
}

async fn route_connection(pending: Pending, rpc: Route, http: Route, sniff_timeout: Duration) {
    let peer = pending.peer();

    let detected = tokio::time::timeout(sniff_timeout, async move {
        let stream = pending.establish().await?;
        sniff(stream).await
    })
    .await;

    let (protocol, replay, stream) = match detected {
        Ok(Ok(detected)) => detected,
        Ok(Err(e)) => {
            tracing::debug!("Closing connection from {}: {}", peer, e);
            return;
        }
        Err(_) => {
            tracing::debug!(
                "Closing connection from {}: no protocol detected within {:?}",
                peer,
                sniff_timeout
            );
            return;
        }
    };

    tracing::trace!("Routing connection from {} to {}", peer, protocol);
    let conn = MuxStream::new(replay.freeze(), stream, peer);
    match protocol {
        Protocol::Rpc => rpc.deliver(conn).await,
        Protocol::Http => http.deliver(conn).await,
    }
}

/// Read from `stream` until the classifier decides
///
/// Clients that hold their request until the server's SETTINGS arrive get
/// an empty SETTINGS frame. Their ACK is cut from the replayed bytes.
async fn sniff(mut stream: BoxedStream) -> io::Result<(Protocol, BytesMut, BoxedStream)> {
    let mut buf = BytesMut::with_capacity(1024);
    let mut classifier = Classifier::new();

    loop {
        let decided = match classifier.classify(&buf) {
            Ok(decided) => decided,
            Err(e) => {
                tracing::debug!("Unparseable HTTP/2 preamble, routing to HTTP: {}", e);
                Some(Protocol::Http)
            }
        };
        if let Some(protocol) = decided {
            if let Some(ack) = classifier.settings_ack() {
                strip(&mut buf, ack);
            }
            return Ok((protocol, buf, stream));
        }

        if classifier.should_send_settings() {
            stream.write_all(&EMPTY_SETTINGS).await?;
            stream.flush().await?;
            classifier.settings_sent();
        }

        if stream.read_buf(&mut buf).await? == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed before its protocol was identified",
            ));
        }
    }
}

fn strip(buf: &mut BytesMut, range: std::ops::Range<usize>) {
    let tail = buf.split_off(range.end);
    buf.truncate(range.start);
    buf.unsplit(tail);
}

fn sub_listener(kind: Protocol) -> (Route, SubListener) {
    let (tx, rx) = mpsc::channel(ROUTE_BACKLOG);
    let closed = CancellationToken::new();
    let route = Route {
        tx,
        closed: closed.clone(),
    };
    let listener = SubListener {
        kind,
        rx: Mutex::new(rx),
        closed,
    };
    (route, listener)
}

/// Listener view over one protocol's share of the base listener
pub struct SubListener {
    kind: Protocol,
    rx: Mutex<mpsc::Receiver<MuxStream>>,
    closed: CancellationToken,
}

impl SubListener {
    /// Protocol this listener receives
    pub fn kind(&self) -> Protocol {
        self.kind
    }

    /// Wait for the next connection
    ///
    /// Fails once this sub-listener is closed or the base listener is gone.
    pub async fn accept(&self) -> io::Result<MuxStream> {
        let mut rx = self.rx.lock().await;
        let received = tokio::select! {
            biased;
            _ = self.closed.cancelled() => None,
            conn = rx.recv() => Some(conn),
        };

        match received {
            Some(Some(conn)) => Ok(conn),
            Some(None) => Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                format!("base listener closed under the {} listener", self.kind),
            )),
            None => {
                rx.close();
                Err(io::Error::new(
                    io::ErrorKind::NotConnected,
                    format!("{} listener closed", self.kind),
                ))
            }
        }
    }

    /// Close this sub-listener without affecting the other one
    pub fn close(&self) {
        self.closed.cancel();
    }

    /// Stream of accepted connections that ends when the listener closes
    pub fn into_incoming(self) -> BoxStream<'static, io::Result<MuxStream>> {
        stream::unfold(self, |listener| async move {
            match listener.accept().await {
                Ok(conn) => Some((Ok(conn), listener)),
                Err(e) => {
                    tracing::debug!("{}", e);
                    None
                }
            }
        })
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_close_is_independent() {
        let (rpc_route, rpc) = sub_listener(Protocol::Rpc);
        let (http_route, http) = sub_listener(Protocol::Http);

        rpc.close();
        assert!(rpc.accept().await.is_err());
        assert!(rpc_route.tx.is_closed());

        assert!(!http.closed.is_cancelled());
        assert!(!http_route.tx.is_closed());
    }

    #[tokio::test]
    async fn test_dropped_route_closes_listener() {
        let (route, http) = sub_listener(Protocol::Http);
        drop(route);
        let err = http.accept().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }

    #[tokio::test]
    async fn test_incoming_ends_on_close() {
        let (_route, rpc) = sub_listener(Protocol::Rpc);
        rpc.close();
        let mut incoming = rpc.into_incoming();
        assert!(incoming.next().await.is_none());
    }

    #[tokio::test]
    async fn test_sniff_keeps_consumed_bytes() {
        let (client, server) = tokio::io::duplex(256);
        let mut client = client;
        tokio::io::AsyncWriteExt::write_all(&mut client, b"GET /health HTTP/1.1\r\n\r\n")
            .await
            .unwrap();

        let (protocol, replay, _stream) = sniff(Box::new(server)).await.unwrap();
        assert_eq!(protocol, Protocol::Http);
        assert!(b"GET /health HTTP/1.1\r\n\r\n".starts_with(&replay));
        assert!(!replay.is_empty());
    }

    #[tokio::test]
    async fn test_sniff_answers_settings_and_drops_ack() {
        use cm_wire::{FrameHeader, FrameKind, FLAG_ACK, FLAG_END_HEADERS, HTTP2_PREFACE};

        let (mut client, server) = tokio::io::duplex(1024);
        let sniffing = tokio::spawn(sniff(Box::new(server)));

        let mut opening = BytesMut::from(HTTP2_PREFACE);
        FrameHeader::new(FrameKind::Settings, 0, 0, 0).encode(&mut opening);
        client.write_all(&opening).await.unwrap();

        let mut reply = [0u8; 9];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, EMPTY_SETTINGS);

        let block = hpack::Encoder::new().encode(vec![
            (&b":method"[..], &b"POST"[..]),
            (&b"content-type"[..], &b"application/grpc"[..]),
        ]);
        let mut rest = BytesMut::new();
        FrameHeader::new(FrameKind::Settings, FLAG_ACK, 0, 0).encode(&mut rest);
        FrameHeader::new(FrameKind::Headers, FLAG_END_HEADERS, 1, block.len() as u32)
            .encode(&mut rest);
        rest.extend_from_slice(&block);
        client.write_all(&rest).await.unwrap();

        let (protocol, replay, _stream) = sniffing.await.unwrap().unwrap();
        assert_eq!(protocol, Protocol::Rpc);

        let mut expected = opening.clone();
        FrameHeader::new(FrameKind::Headers, FLAG_END_HEADERS, 1, block.len() as u32)
            .encode(&mut expected);
        expected.extend_from_slice(&block);
        assert_eq!(replay, expected);
    }

    #[test]
    fn test_strip_removes_middle_range() {
        let mut buf = BytesMut::from(&b"abcdefgh"[..]);
        strip(&mut buf, 2..5);
        assert_eq!(&buf[..], b"abfgh");
    }

    #[tokio::test]
    async fn test_sniff_eof_is_an_error() {
        let (client, server) = tokio::io::duplex(256);
        drop(client);
        let err = sniff(Box::new(server))
            .await
            .err()
            .expect("sniff should fail on EOF");
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }
}
