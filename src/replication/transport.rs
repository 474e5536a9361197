//! QUIC Transport
//!
//! Carries replication messages between the two sites over QUIC (via Quinn),
//! one message per unidirectional stream.
//!
//! Uses Sans-IO pattern: message encoding/decoding is separated from I/O for testability.

use crate::domain::value_objects::NodeId;
use crate::replication::config::ReplicationConfig;
use crate::replication::link::{LinkEvent, PeerLink};
use crate::replication::types::Message;
use async_trait::async_trait;
use quinn::{ClientConfig, Connection as QuinnConnection, Endpoint, ServerConfig};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};

/// Largest accepted frame body.
pub const MAX_MESSAGE_SIZE: usize = 10 * 1024 * 1024;

// ==================== Sans-IO Functions ====================

/// Encode a message for transport (Sans-IO pattern).
/// Returns length-prefixed binary data ready for sending.
pub fn encode_message(msg: &Message) -> anyhow::Result<Vec<u8>> {
    let data = bincode::serialize(msg)?;
    if data.len() > MAX_MESSAGE_SIZE {
        anyhow::bail!("message too large: {} bytes", data.len());
    }
    let len = data.len() as u32;

    let mut result = Vec::with_capacity(4 + data.len());
    result.extend_from_slice(&len.to_be_bytes());
    result.extend_from_slice(&data);

    Ok(result)
}

/// Decode a length from the first 4 bytes.
pub fn decode_length(buf: &[u8; 4]) -> u32 {
    u32::from_be_bytes(*buf)
}

/// Decode a message from binary data (Sans-IO pattern).
pub fn decode_message(data: &[u8]) -> anyhow::Result<Message> {
    let msg: Message = bincode::deserialize(data)?;
    Ok(msg)
}

/// Transport service: owns the QUIC endpoint and forwards inbound messages.
pub struct TransportService {
    config: ReplicationConfig,
    endpoint: Option<Endpoint>,
    event_tx: mpsc::Sender<LinkEvent>,
    event_rx: Option<mpsc::Receiver<LinkEvent>>,
    shutdown: Arc<AtomicBool>,
}

impl TransportService {
    /// Create a new transport service.
    pub fn new(config: ReplicationConfig) -> Self {
        let (event_tx, event_rx) = mpsc::channel(1024);

        Self {
            config,
            endpoint: None,
            event_tx,
            event_rx: Some(event_rx),
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Get the event receiver.
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<LinkEvent>> {
        self.event_rx.take()
    }

    /// Address the endpoint is bound to, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.endpoint.as_ref().and_then(|e| e.local_addr().ok())
    }

    /// Signal shutdown.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(endpoint) = &self.endpoint {
            endpoint.close(0u32.into(), b"shutdown");
        }
    }

    /// Check if shutdown was signaled.
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Bind the endpoint and start accepting the peer's connections.
    #[cfg_attr(coverage_nightly, coverage(off))]
    pub async fn start(&mut self) -> anyhow::Result<()> {
        let endpoint = site_endpoint(&self.config)?;
        tracing::info!(
            node = %self.config.node_id,
            "transport listening on {}",
            endpoint.local_addr().unwrap_or(self.config.transport_addr)
        );

        tokio::spawn(accept_loop(
            endpoint.clone(),
            self.event_tx.clone(),
            self.shutdown.clone(),
        ));
        self.endpoint = Some(endpoint);
        Ok(())
    }

    /// Outbound link to the peer, dialed lazily on first send.
    pub fn link(&self, peer_id: NodeId, addr: SocketAddr) -> anyhow::Result<QuicPeerLink> {
        let endpoint = self
            .endpoint
            .clone()
            .ok_or_else(|| anyhow::anyhow!("transport not started"))?;
        Ok(QuicPeerLink {
            peer_id,
            addr,
            endpoint,
            handshake_timeout: self.config.handshake_timeout,
            connection: Mutex::new(None),
        })
    }
}

/// Server and client halves of a site endpoint, both on one self-signed identity.
fn site_endpoint(config: &ReplicationConfig) -> anyhow::Result<Endpoint> {
    let identity = rcgen::generate_simple_self_signed(vec![
        config.node_id.to_string(),
        "localhost".to_string(),
    ])?;
    let key = rustls::pki_types::PrivateKeyDer::try_from(identity.key_pair.serialize_der())
        .map_err(|e| anyhow::anyhow!("unusable transport key: {}", e))?;
    let certs = vec![rustls::pki_types::CertificateDer::from(identity.cert.der().to_vec())];

    let server_tls = quinn::rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    let client_tls = quinn::rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(SkipServerVerification))
        .with_no_client_auth();

    let server = ServerConfig::with_crypto(Arc::new(
        quinn::crypto::rustls::QuicServerConfig::try_from(server_tls)?,
    ));
    let client = ClientConfig::new(Arc::new(
        quinn::crypto::rustls::QuicClientConfig::try_from(client_tls)?,
    ));

    let mut endpoint = Endpoint::server(server, config.transport_addr)?;
    endpoint.set_default_client_config(client);
    Ok(endpoint)
}

#[cfg_attr(coverage_nightly, coverage(off))]
async fn accept_loop(endpoint: Endpoint, events: mpsc::Sender<LinkEvent>, stop: Arc<AtomicBool>) {
    while !stop.load(Ordering::SeqCst) {
        let Some(incoming) = endpoint.accept().await else {
            break;
        };
        let events = events.clone();
        tokio::spawn(async move {
            match incoming.await {
                Ok(conn) => {
                    tracing::info!(remote = %conn.remote_address(), "peer site connected");
                    let _ = events.send(LinkEvent::Connected).await;
                    serve_peer(conn, events).await;
                }
                Err(e) => tracing::warn!("inbound handshake failed: {}", e),
            }
        });
    }
}

/// Forward every frame the peer opens a stream for, until the connection ends.
#[cfg_attr(coverage_nightly, coverage(off))]
async fn serve_peer(conn: QuinnConnection, events: mpsc::Sender<LinkEvent>) {
    let reason = loop {
        let recv = match conn.accept_uni().await {
            Ok(recv) => recv,
            Err(e) => break e,
        };
        let events = events.clone();
        tokio::spawn(async move {
            match read_frame(recv).await {
                Ok(msg) => {
                    let _ = events.send(LinkEvent::Message(msg)).await;
                }
                Err(e) => tracing::debug!("dropping inbound frame: {}", e),
            }
        });
    };

    tracing::info!(remote = %conn.remote_address(), %reason, "peer site disconnected");
    let _ = events.send(LinkEvent::Disconnected).await;
}

async fn read_frame(mut recv: quinn::RecvStream) -> anyhow::Result<Message> {
    let mut len_buf = [0u8; 4];
    recv.read_exact(&mut len_buf).await?;
    let len = decode_length(&len_buf) as usize;
    if len > MAX_MESSAGE_SIZE {
        anyhow::bail!("frame of {} bytes exceeds the limit", len);
    }
    let mut body = vec![0u8; len];
    recv.read_exact(&mut body).await?;
    decode_message(&body)
}

/// QUIC connection to the peer site.
pub struct QuicPeerLink {
    peer_id: NodeId,
    addr: SocketAddr,
    endpoint: Endpoint,
    handshake_timeout: Duration,
    connection: Mutex<Option<QuinnConnection>>,
}

impl QuicPeerLink {
    /// Live connection, dialing the peer if needed.
    async fn connection(&self) -> anyhow::Result<QuinnConnection> {
        let mut guard = self.connection.lock().await;
        if let Some(conn) = guard.as_ref() {
            if conn.close_reason().is_none() {
                return Ok(conn.clone());
            }
        }

        let connecting = self.endpoint.connect(self.addr, "localhost")?;
        let conn = tokio::time::timeout(self.handshake_timeout, connecting)
            .await
            .map_err(|_| anyhow::anyhow!("handshake with {} timed out", self.addr))??;
        tracing::info!("connected to peer {} at {}", self.peer_id, self.addr);
        *guard = Some(conn.clone());
        Ok(conn)
    }

    async fn reset(&self) {
        self.connection.lock().await.take();
    }
}

#[async_trait]
impl PeerLink for QuicPeerLink {
    fn peer_id(&self) -> &NodeId {
        &self.peer_id
    }

    async fn send(&self, message: &Message) -> anyhow::Result<()> {
        let frame = encode_message(message)?;
        let conn = self.connection().await?;

        let result: anyhow::Result<()> = async {
            let mut send = conn.open_uni().await?;
            send.write_all(&frame).await?;
            send.finish()?;
            Ok(())
        }
        .await;

        if result.is_err() {
            self.reset().await;
        }
        result
    }
}

/// Accepts the peer's self-signed certificate; sites are configured by address.
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
