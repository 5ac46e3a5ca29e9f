//! QUIC Transport
//!
//! Implements the Transport port with QUIC (via Quinn). Every node serves a
//! self-signed certificate; peers skip verification and identify each other
//! with a hello frame carrying the dialer's node id.
//!
//! Peers are dialed through an address book seeded from configuration. An
//! endpoint dials and listens on the same socket, so the remote address of an
//! inbound connection is where its peer can be dialed back; the acceptor
//! records it, which lets the reconnect loop reach peers that dialed in first.
//!
//! Each direction of a channel is one unidirectional stream of frames:
//!
//! ```text
//! +------------+-------------+-----------------+
//! | len: u32be | crc32: u32be | payload (len B) |
//! +------------+-------------+-----------------+
//! ```
//!
//! Uses Sans-IO pattern: frame encoding/decoding is separated from I/O for testability.

use crate::domain::identity::NodeId;
use crate::domain::ports::{Channel, FrameSink, FrameStream, Transport, TransportError};
use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::RwLock;
use quinn::{ClientConfig, Connection, Endpoint, RecvStream, SendStream, ServerConfig};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

/// Largest accepted frame payload.
const MAX_FRAME_LEN: usize = 10 * 1024 * 1024;

/// Size of the frame header.
const HEADER_LEN: usize = 8;

/// Server name presented when dialing; certificates are not verified.
const SERVER_NAME: &str = "inspection-sync";

/// Time an inbound connection gets to send its hello.
const HELLO_TIMEOUT: Duration = Duration::from_secs(10);

// ==================== Sans-IO Functions ====================

/// Encode a payload into a checksummed frame (Sans-IO pattern).
fn encode_frame(payload: &[u8]) -> Result<Bytes, TransportError> {
    if payload.len() > MAX_FRAME_LEN {
        return Err(TransportError::FrameTooLarge(payload.len()));
    }
    let mut frame = BytesMut::with_capacity(HEADER_LEN + payload.len());
    frame.put_u32(payload.len() as u32);
    frame.put_u32(crc32fast::hash(payload));
    frame.put_slice(payload);
    Ok(frame.freeze())
}

/// Decode a frame header into `(payload length, checksum)` (Sans-IO pattern).
fn decode_header(header: &[u8; HEADER_LEN]) -> Result<(usize, u32), TransportError> {
    let len = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
    let crc = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);
    if len > MAX_FRAME_LEN {
        return Err(TransportError::FrameTooLarge(len));
    }
    Ok((len, crc))
}

/// Check a payload against the checksum from its header (Sans-IO pattern).
fn verify_payload(payload: &[u8], crc: u32) -> Result<(), TransportError> {
    if crc32fast::hash(payload) == crc {
        Ok(())
    } else {
        Err(TransportError::Checksum)
    }
}

/// QUIC transport settings.
#[derive(Debug, Clone)]
pub struct QuicConfig {
    pub local_id: NodeId,
    pub listen_addr: SocketAddr,
    /// Where to dial each peer.
    pub address_book: HashMap<NodeId, SocketAddr>,
}

impl QuicConfig {
    pub fn new(local_id: NodeId, listen_addr: SocketAddr) -> Self {
        Self {
            local_id,
            listen_addr,
            address_book: HashMap::new(),
        }
    }

    pub fn peer(mut self, id: NodeId, addr: SocketAddr) -> Self {
        self.address_book.insert(id, addr);
        self
    }
}

type AddressBook = Arc<RwLock<HashMap<NodeId, SocketAddr>>>;

/// Transport over a Quinn endpoint.
pub struct QuicTransport {
    local_id: NodeId,
    endpoint: Endpoint,
    address_book: AddressBook,
    incoming: Mutex<mpsc::UnboundedReceiver<Channel>>,
    accept_task: JoinHandle<()>,
}

impl QuicTransport {
    /// Bind the endpoint and start accepting channels. Must run inside a tokio runtime.
    pub fn bind(config: QuicConfig) -> anyhow::Result<Self> {
        let (server_config, client_config) = crypto_configs(&config.local_id)?;

        let mut endpoint = Endpoint::server(server_config, config.listen_addr)?;
        endpoint.set_default_client_config(client_config);

        tracing::info!(
            node = %config.local_id,
            addr = %endpoint.local_addr()?,
            peers = config.address_book.len(),
            "quic transport listening"
        );

        let (tx, rx) = mpsc::unbounded_channel();
        let address_book = Arc::new(RwLock::new(config.address_book));
        let accept_task = tokio::spawn(accept_loop(endpoint.clone(), address_book.clone(), tx));

        Ok(Self {
            local_id: config.local_id,
            endpoint,
            address_book,
            incoming: Mutex::new(rx),
            accept_task,
        })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.endpoint.local_addr()?)
    }

    /// Address the peer is dialed at, if known.
    pub fn peer_addr(&self, id: &NodeId) -> Option<SocketAddr> {
        self.address_book.read().get(id).copied()
    }

    /// Stop accepting and close every connection.
    pub fn close(&self) {
        self.accept_task.abort();
        self.endpoint.close(0u32.into(), b"shutdown");
    }
}

impl Drop for QuicTransport {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

fn crypto_configs(local_id: &NodeId) -> anyhow::Result<(ServerConfig, ClientConfig)> {
    let cert = rcgen::generate_simple_self_signed(vec![
        SERVER_NAME.to_string(),
        local_id.to_string(),
        "localhost".to_string(),
    ])?;
    let cert_chain = vec![cert.cert.der().clone()];
    let private_key = rustls::pki_types::PrivateKeyDer::Pkcs8(
        rustls::pki_types::PrivatePkcs8KeyDer::from(cert.key_pair.serialize_der()),
    );

    let provider = Arc::new(rustls::crypto::ring::default_provider());

    let server_crypto = quinn::rustls::ServerConfig::builder_with_provider(provider.clone())
        .with_protocol_versions(&[&rustls::version::TLS13])?
        .with_no_client_auth()
        .with_single_cert(cert_chain, private_key)?;
    let server_config = ServerConfig::with_crypto(Arc::new(
        quinn::crypto::rustls::QuicServerConfig::try_from(server_crypto)?,
    ));

    // Peers present self-signed certs; identity comes from the hello frame
    let client_crypto = quinn::rustls::ClientConfig::builder_with_provider(provider)
        .with_protocol_versions(&[&rustls::version::TLS13])?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(SkipServerVerification))
        .with_no_client_auth();
    let client_config = ClientConfig::new(Arc::new(
        quinn::crypto::rustls::QuicClientConfig::try_from(client_crypto)?,
    ));

    Ok((server_config, client_config))
}

#[cfg_attr(coverage_nightly, coverage(off))]
async fn accept_loop(
    endpoint: Endpoint,
    address_book: AddressBook,
    tx: mpsc::UnboundedSender<Channel>,
) {
    while let Some(incoming) = endpoint.accept().await {
        let tx = tx.clone();
        let address_book = address_book.clone();
        tokio::spawn(async move {
            let remote = incoming.remote_address();
            match tokio::time::timeout(HELLO_TIMEOUT, handshake(incoming)).await {
                Ok(Ok(channel)) => {
                    tracing::debug!(peer = %channel.peer, %remote, "inbound quic channel");
                    address_book.write().insert(channel.peer.clone(), remote);
                    let _ = tx.send(channel);
                }
                Ok(Err(e)) => tracing::warn!(%remote, error = %e, "inbound handshake failed"),
                Err(_) => tracing::warn!(%remote, "inbound handshake timed out"),
            }
        });
    }
    tracing::debug!("quic accept loop finished");
}

/// Complete an inbound connection: read the hello, open the reply stream.
async fn handshake(incoming: quinn::Incoming) -> Result<Channel, TransportError> {
    let conn = incoming
        .await
        .map_err(|e| TransportError::Handshake(e.to_string()))?;
    let recv = conn
        .accept_uni()
        .await
        .map_err(|e| TransportError::Handshake(e.to_string()))?;

    let mut stream = QuicStream {
        conn: conn.clone(),
        recv: Some(recv),
    };
    let hello = stream
        .read_frame()
        .await?
        .ok_or_else(|| TransportError::Handshake("missing hello".into()))?;
    let peer = std::str::from_utf8(&hello)
        .map(NodeId::from)
        .map_err(|_| TransportError::Handshake("hello is not utf-8".into()))?;

    let send = conn
        .open_uni()
        .await
        .map_err(|e| TransportError::Handshake(e.to_string()))?;

    Ok(Channel {
        peer,
        sink: Arc::new(QuicSink {
            conn,
            send: Mutex::new(send),
        }),
        stream: Box::new(stream),
    })
}

#[async_trait]
impl Transport for QuicTransport {
    fn local_id(&self) -> &NodeId {
        &self.local_id
    }

    async fn dial(&self, peer: &NodeId) -> Result<Channel, TransportError> {
        let addr = self
            .peer_addr(peer)
            .ok_or_else(|| TransportError::Unreachable(peer.clone()))?;

        let conn = self
            .endpoint
            .connect(addr, SERVER_NAME)
            .map_err(|e| TransportError::Handshake(e.to_string()))?
            .await
            .map_err(|e| TransportError::Handshake(e.to_string()))?;
        let send = conn
            .open_uni()
            .await
            .map_err(|e| TransportError::Handshake(e.to_string()))?;

        let sink = QuicSink {
            conn: conn.clone(),
            send: Mutex::new(send),
        };
        sink.send(Bytes::copy_from_slice(self.local_id.as_str().as_bytes()))
            .await?;

        tracing::debug!(%peer, %addr, "outbound quic channel");
        Ok(Channel {
            peer: peer.clone(),
            sink: Arc::new(sink),
            // the reply stream is announced once the peer writes to it
            stream: Box::new(QuicStream { conn, recv: None }),
        })
    }

    async fn accept(&self) -> Option<Channel> {
        self.incoming.lock().await.recv().await
    }
}

struct QuicSink {
    conn: Connection,
    send: Mutex<SendStream>,
}

#[async_trait]
impl FrameSink for QuicSink {
    async fn send(&self, frame: Bytes) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::Closed);
        }
        let frame = encode_frame(&frame)?;
        self.send
            .lock()
            .await
            .write_all(&frame)
            .await
            .map_err(|e| TransportError::Io(e.to_string()))
    }

    async fn close(&self) {
        self.conn.close(0u32.into(), b"closed");
    }

    fn is_open(&self) -> bool {
        self.conn.close_reason().is_none()
    }
}

struct QuicStream {
    conn: Connection,
    recv: Option<RecvStream>,
}

impl QuicStream {
    /// Read one frame. `Ok(None)` once the stream or connection ended.
    async fn read_frame(&mut self) -> Result<Option<Bytes>, TransportError> {
        if self.recv.is_none() {
            match self.conn.accept_uni().await {
                Ok(recv) => self.recv = Some(recv),
                Err(_) => return Ok(None),
            }
        }
        let Some(recv) = self.recv.as_mut() else {
            return Ok(None);
        };

        let mut header = [0u8; HEADER_LEN];
        if recv.read_exact(&mut header).await.is_err() {
            return Ok(None);
        }
        let (len, crc) = decode_header(&header)?;

        let mut payload = vec![0u8; len];
        if recv.read_exact(&mut payload).await.is_err() {
            return Ok(None);
        }
        verify_payload(&payload, crc)?;
        Ok(Some(Bytes::from(payload)))
    }
}

#[async_trait]
impl FrameStream for QuicStream {
    async fn next_frame(&mut self) -> Option<Bytes> {
        loop {
            match self.read_frame().await {
                Ok(frame) => return frame,
                Err(TransportError::Checksum) => {
                    tracing::warn!("dropping frame with bad checksum");
                }
                Err(e) => {
                    tracing::warn!(error = %e, "closing channel on bad frame");
                    self.conn.close(1u32.into(), b"bad frame");
                    return None;
                }
            }
        }
    }
}

/// Skip server certificate verification for self-signed peer certs.
#[derive(Debug)]
struct SkipServerVerification;

#[cfg_attr(coverage_nightly, coverage(off))]
impl quinn::rustls::client::danger::ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<quinn::rustls::client::danger::ServerCertVerified, quinn::rustls::Error> {
        Ok(quinn::rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &quinn::rustls::DigitallySignedStruct,
    ) -> Result<quinn::rustls::client::danger::HandshakeSignatureValid, quinn::rustls::Error> {
        Ok(quinn::rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &quinn::rustls::DigitallySignedStruct,
    ) -> Result<quinn::rustls::client::danger::HandshakeSignatureValid, quinn::rustls::Error> {
        Ok(quinn::rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<quinn::rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}
