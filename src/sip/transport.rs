//! Connection-oriented and datagram wire transports.
//!
//! One `Wire` per account connection. The read side runs as its own task and
//! feeds framed messages into an mpsc channel; the account task owns the
//! write side. Message processing therefore stays strictly sequential: the
//! account takes one `WireEvent` at a time and runs its handler to
//! completion. Closing the channel (dropping the account or the wire)
//! terminates the reader.

use super::message::{parse_datagram, parse_message, ParseError, SipMessage};
use super::types::{DEFAULT_PORT, DEFAULT_TLS_PORT, MAX_DATAGRAM_SIZE};
use bytes::BytesMut;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, WriteHalf};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Tls,
    Tcp,
    Udp,
}

impl TransportKind {
    pub fn default_port(self) -> u16 {
        match self {
            TransportKind::Tls => DEFAULT_TLS_PORT,
            TransportKind::Tcp | TransportKind::Udp => DEFAULT_PORT,
        }
    }

    /// Token used in Via headers and `transport=` URI parameters.
    pub fn descriptor(self) -> &'static str {
        match self {
            TransportKind::Tls => "tls",
            TransportKind::Tcp => "tcp",
            TransportKind::Udp => "udp",
        }
    }
}

#[derive(Debug, Error)]
pub enum WireError {
    #[error("could not connect: {0}")]
    Connect(String),
    #[error("connection closed by server")]
    Closed,
    #[error("write failed: {0}")]
    Write(String),
    #[error("read failed: {0}")]
    Read(String),
    #[error("TLS setup failed: {0}")]
    Tls(String),
    #[error(transparent)]
    Parse(#[from] ParseError),
}

/// What the reader task reports to the account.
#[derive(Debug)]
pub enum WireEvent {
    Message(SipMessage),
    /// The connection is gone; no further events follow.
    Closed(WireError),
}

enum Writer {
    Tcp(OwnedWriteHalf),
    Tls(WriteHalf<TlsStream<TcpStream>>),
    Udp(Arc<UdpSocket>),
}

/// Write side of a live connection; the paired reader feeds the account's
/// event channel until close.
pub struct Wire {
    kind: TransportKind,
    writer: Writer,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
}

impl Wire {
    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub async fn send(&mut self, bytes: &[u8]) -> Result<(), WireError> {
        match &mut self.writer {
            Writer::Tcp(w) => w
                .write_all(bytes)
                .await
                .map_err(|e| WireError::Write(e.to_string())),
            Writer::Tls(w) => {
                w.write_all(bytes)
                    .await
                    .map_err(|e| WireError::Write(e.to_string()))?;
                w.flush().await.map_err(|e| WireError::Write(e.to_string()))
            }
            Writer::Udp(sock) => sock
                .send(bytes)
                .await
                .map(|_| ())
                .map_err(|e| WireError::Write(e.to_string())),
        }
    }

    /// Keep-alive payload: double CRLF on stream transports, a single zero
    /// byte on UDP (enough to hold the NAT binding).
    pub async fn send_keepalive(&mut self) -> Result<(), WireError> {
        match self.kind {
            TransportKind::Udp => self.send(&[0]).await,
            _ => self.send(b"\r\n\r\n").await,
        }
    }
}

/// Open a connection and spawn its reader task.
pub async fn connect(
    kind: TransportKind,
    host: &str,
    port: u16,
    events: mpsc::Sender<WireEvent>,
) -> Result<Wire, WireError> {
    info!(transport = kind.descriptor(), %host, port, "connecting");
    match kind {
        TransportKind::Tcp => {
            let stream = TcpStream::connect((host, port))
                .await
                .map_err(|e| WireError::Connect(e.to_string()))?;
            let local_addr = stream
                .local_addr()
                .map_err(|e| WireError::Connect(e.to_string()))?;
            let peer_addr = stream
                .peer_addr()
                .map_err(|e| WireError::Connect(e.to_string()))?;
            let (read_half, write_half) = stream.into_split();
            tokio::spawn(run_stream_reader(read_half, events));
            Ok(Wire {
                kind,
                writer: Writer::Tcp(write_half),
                local_addr,
                peer_addr,
            })
        }
        TransportKind::Tls => {
            let stream = TcpStream::connect((host, port))
                .await
                .map_err(|e| WireError::Connect(e.to_string()))?;
            let local_addr = stream
                .local_addr()
                .map_err(|e| WireError::Connect(e.to_string()))?;
            let peer_addr = stream
                .peer_addr()
                .map_err(|e| WireError::Connect(e.to_string()))?;

            let mut roots = rustls::RootCertStore::empty();
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            let config = rustls::ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth();
            let connector = TlsConnector::from(Arc::new(config));
            let server_name = rustls::pki_types::ServerName::try_from(host.to_string())
                .map_err(|e| WireError::Tls(e.to_string()))?;
            let tls = connector
                .connect(server_name, stream)
                .await
                .map_err(|e| WireError::Tls(e.to_string()))?;

            let (read_half, write_half) = tokio::io::split(tls);
            tokio::spawn(run_stream_reader(read_half, events));
            Ok(Wire {
                kind,
                writer: Writer::Tls(write_half),
                local_addr,
                peer_addr,
            })
        }
        TransportKind::Udp => {
            let socket = UdpSocket::bind("0.0.0.0:0")
                .await
                .map_err(|e| WireError::Connect(e.to_string()))?;
            socket
                .connect((host, port))
                .await
                .map_err(|e| WireError::Connect(e.to_string()))?;
            let local_addr = socket
                .local_addr()
                .map_err(|e| WireError::Connect(e.to_string()))?;
            let peer_addr = socket
                .peer_addr()
                .map_err(|e| WireError::Connect(e.to_string()))?;
            let socket = Arc::new(socket);
            tokio::spawn(run_datagram_reader(socket.clone(), events));
            Ok(Wire {
                kind,
                writer: Writer::Udp(socket),
                local_addr,
                peer_addr,
            })
        }
    }
}

async fn run_stream_reader<R>(mut reader: R, events: mpsc::Sender<WireEvent>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut buf = BytesMut::with_capacity(8192);
    loop {
        loop {
            match parse_message(&mut buf) {
                Ok(Some(msg)) => {
                    debug!(
                        method = %msg.method,
                        response = msg.response,
                        "message received"
                    );
                    if events.send(WireEvent::Message(msg)).await.is_err() {
                        return;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    // The stream is desynchronized; nothing after this point
                    // can be trusted.
                    let _ = events.send(WireEvent::Closed(e.into())).await;
                    return;
                }
            }
        }
        match reader.read_buf(&mut buf).await {
            Ok(0) => {
                let _ = events.send(WireEvent::Closed(WireError::Closed)).await;
                return;
            }
            Ok(_) => {}
            Err(e) => {
                let _ = events
                    .send(WireEvent::Closed(WireError::Read(e.to_string())))
                    .await;
                return;
            }
        }
    }
}

async fn run_datagram_reader(socket: Arc<UdpSocket>, events: mpsc::Sender<WireEvent>) {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    loop {
        match socket.recv(&mut buf).await {
            Ok(0) => continue,
            Ok(n) => match parse_datagram(&buf[..n]) {
                Ok(msg) => {
                    if events.send(WireEvent::Message(msg)).await.is_err() {
                        return;
                    }
                }
                Err(e) => {
                    // Datagram framing is self-contained; drop and go on.
                    warn!(error = %e, "discarding undecodable datagram");
                }
            },
            Err(e) => {
                let _ = events
                    .send(WireEvent::Closed(WireError::Read(e.to_string())))
                    .await;
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt as _;
    use tokio::net::TcpListener;

    #[test]
    fn test_default_ports() {
        assert_eq!(TransportKind::Tls.default_port(), 5061);
        assert_eq!(TransportKind::Tcp.default_port(), 5060);
        assert_eq!(TransportKind::Udp.default_port(), 5060);
        assert_eq!(TransportKind::Tls.descriptor(), "tls");
    }

    #[tokio::test]
    async fn test_tcp_roundtrip_and_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            // Split response across two writes to exercise re-buffering,
            // preceded by keep-alive noise.
            sock.write_all(b"\r\n\r\nSIP/2.0 200 OK\r\nCSeq: 1 REGIS")
                .await
                .unwrap();
            sock.write_all(b"TER\r\nContent-Length: 2\r\n\r\nhi").await.unwrap();
            // Read whatever the client sent, then close.
            let mut scratch = [0u8; 256];
            let _ = sock.try_read(&mut scratch);
        });

        let (tx, mut rx) = mpsc::channel(16);
        let mut wire = connect(TransportKind::Tcp, "127.0.0.1", addr.port(), tx)
            .await
            .unwrap();
        wire.send(b"REGISTER sip:x SIP/2.0\r\nCSeq: 1 REGISTER\r\nContent-Length: 0\r\n\r\n")
            .await
            .unwrap();

        match rx.recv().await.unwrap() {
            WireEvent::Message(msg) => {
                assert_eq!(msg.response, 200);
                assert_eq!(msg.method, "REGISTER");
                assert_eq!(msg.body, b"hi");
            }
            other => panic!("unexpected event: {:?}", other),
        }
        // Server closes after responding.
        match rx.recv().await.unwrap() {
            WireEvent::Closed(WireError::Closed) => {}
            other => panic!("unexpected event: {:?}", other),
        }
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_udp_datagram() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();

        let (tx, mut rx) = mpsc::channel(16);
        let mut wire = connect(TransportKind::Udp, "127.0.0.1", server_addr.port(), tx)
            .await
            .unwrap();
        wire.send(b"ping").await.unwrap();

        let mut buf = [0u8; 64];
        let (_, client_addr) = server.recv_from(&mut buf).await.unwrap();
        server
            .send_to(
                b"BENOTIFY sip:me SIP/2.0\r\nCSeq: 1 BENOTIFY\r\nEvent: presence\r\nContent-Length: 0\r\n\r\n",
                client_addr,
            )
            .await
            .unwrap();

        match rx.recv().await.unwrap() {
            WireEvent::Message(msg) => {
                assert_eq!(msg.method, "BENOTIFY");
                assert_eq!(msg.header("Event"), Some("presence"));
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_parse_error_closes_stream() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            sock.write_all(b"garbage that is not sip\r\n\r\n").await.unwrap();
        });

        let (tx, mut rx) = mpsc::channel(16);
        let _wire = connect(TransportKind::Tcp, "127.0.0.1", addr.port(), tx)
            .await
            .unwrap();
        match rx.recv().await.unwrap() {
            WireEvent::Closed(WireError::Parse(_)) => {}
            other => panic!("unexpected event: {:?}", other),
        }
    }
}
