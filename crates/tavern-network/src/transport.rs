//! QUIC transport implementation for Tavern
//!
//! Uses Quinn for QUIC protocol support. Each session carries one
//! bidirectional stream of length-prefixed envelope frames; close conditions
//! travel as QUIC application close codes.

use crate::link::{Connector, Link, LinkCommand, LinkEvent, LinkPeer};
use crate::NetworkError;
use async_trait::async_trait;
use bytes::BytesMut;
use quinn::{
    congestion, ClientConfig, Connection, ConnectionError, Endpoint, RecvStream, SendStream,
    ServerConfig, VarInt,
};
use rustls::pki_types::{CertificateDer, PrivatePkcs8KeyDer};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tavern_protocol::close::CLOSE_ABNORMAL;
use tavern_protocol::{CloseReason, FramedCodec};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tracing::{debug, warn};

/// ALPN protocol identifier for Tavern
const ALPN_TAVERN: &[u8] = b"tavern/1";

/// Read buffer size for the stream pump
const READ_CHUNK: usize = 16 * 1024;

/// How long a closing side waits for buffered frames and the close code
const CLOSE_LINGER: Duration = Duration::from_secs(1);

/// Configuration for transport layer
#[derive(Debug, Clone)]
pub struct QuicTransportConfig {
    /// QUIC keep-alive interval (0 to disable)
    pub keep_alive_interval: Duration,
    /// Maximum idle timeout before the transport gives up
    pub max_idle_timeout: Duration,
    /// Initial congestion window in packets
    pub initial_window: u32,
    /// Stream receive window
    pub stream_receive_window: VarInt,
    /// Frame codec settings
    pub codec: tavern_protocol::CodecConfig,
}

impl Default for QuicTransportConfig {
    fn default() -> Self {
        Self {
            keep_alive_interval: Duration::from_secs(5),
            max_idle_timeout: Duration::from_secs(60),
            initial_window: 20,                                   // packets
            stream_receive_window: VarInt::from_u32(1024 * 1024), // 1 MB
            codec: tavern_protocol::CodecConfig::default(),
        }
    }
}

/// Client side connector to a single authority
pub struct QuicConnector {
    endpoint: Endpoint,
    server_addr: SocketAddr,
    server_name: String,
    client_config: ClientConfig,
    codec: FramedCodec,
}

impl QuicConnector {
    /// Create a new client endpoint bound to an ephemeral port
    pub fn new(
        server_addr: SocketAddr,
        server_name: impl Into<String>,
        config: QuicTransportConfig,
    ) -> Result<Self, NetworkError> {
        let bind: SocketAddr = if server_addr.is_ipv4() {
            SocketAddr::from(([0, 0, 0, 0], 0))
        } else {
            SocketAddr::from(([0u16; 8], 0))
        };
        let endpoint = Endpoint::client(bind).map_err(|e| {
            NetworkError::TransportError(format!("Failed to create endpoint: {}", e))
        })?;
        let client_config = create_client_config(&config)?;

        Ok(Self {
            endpoint,
            server_addr,
            server_name: server_name.into(),
            client_config,
            codec: FramedCodec::new(config.codec),
        })
    }
}

#[async_trait]
impl Connector for QuicConnector {
    async fn connect(&self) -> Result<Link, NetworkError> {
        let connection = self
            .endpoint
            .connect_with(self.client_config.clone(), self.server_addr, &self.server_name)
            .map_err(|e| {
                NetworkError::ConnectionFailed(format!("Failed to initiate connection: {}", e))
            })?
            .await
            .map_err(|e| NetworkError::ConnectionFailed(format!("Connection failed: {}", e)))?;

        let (send, recv) = connection
            .open_bi()
            .await
            .map_err(|e| NetworkError::TransportError(format!("Failed to open stream: {}", e)))?;

        debug!("QUIC session established with {}", self.server_addr);
        Ok(spawn_stream_pump(
            connection,
            send,
            recv,
            self.codec.clone(),
            self.server_addr.to_string(),
        ))
    }
}

/// Server transport endpoint
pub struct ServerTransport {
    endpoint: Endpoint,
    codec: FramedCodec,
}

impl ServerTransport {
    /// Create a new server transport with a self-signed development certificate
    pub fn new(bind_addr: SocketAddr, config: QuicTransportConfig) -> Result<Self, NetworkError> {
        let (server_config, _) = create_server_config(&config)?;

        let endpoint = Endpoint::server(server_config, bind_addr).map_err(|e| {
            NetworkError::TransportError(format!("Failed to create server endpoint: {}", e))
        })?;

        Ok(Self {
            endpoint,
            codec: FramedCodec::new(config.codec),
        })
    }

    /// Wait for the next connection attempt
    ///
    /// The handshake is left to [`IncomingSession::establish`] so a slow
    /// client never holds up the accept loop.
    pub async fn accept(&self) -> Result<IncomingSession, NetworkError> {
        let incoming = self
            .endpoint
            .accept()
            .await
            .ok_or(NetworkError::EndpointClosed)?;

        Ok(IncomingSession {
            incoming,
            codec: self.codec.clone(),
        })
    }

    /// Get the server's bound address
    pub fn local_addr(&self) -> Result<SocketAddr, NetworkError> {
        self.endpoint.local_addr().map_err(|e| {
            NetworkError::TransportError(format!("Failed to get local address: {}", e))
        })
    }
}

/// A connection attempt that has not finished its handshake yet
pub struct IncomingSession {
    incoming: quinn::Incoming,
    codec: FramedCodec,
}

impl IncomingSession {
    pub fn remote_address(&self) -> SocketAddr {
        self.incoming.remote_address()
    }

    /// Complete the handshake and wait for the client's envelope stream
    pub async fn establish(self) -> Result<Link, NetworkError> {
        let connection = self.incoming.await.map_err(|e| {
            NetworkError::ConnectionFailed(format!("Failed to accept connection: {}", e))
        })?;
        let remote = connection.remote_address();

        let (send, recv) = connection
            .accept_bi()
            .await
            .map_err(|e| NetworkError::TransportError(format!("Failed to accept stream: {}", e)))?;

        Ok(spawn_stream_pump(
            connection,
            send,
            recv,
            self.codec,
            remote.to_string(),
        ))
    }
}

/// Bridge a QUIC stream pair onto link channels
fn spawn_stream_pump(
    connection: Connection,
    send: SendStream,
    recv: RecvStream,
    codec: FramedCodec,
    peer: String,
) -> Link {
    let (link, LinkPeer { commands, events }) = Link::channel(peer);

    tokio::spawn(read_frames(connection.clone(), recv, codec.clone(), events));
    tokio::spawn(write_frames(connection, send, codec, commands));

    link
}

async fn read_frames(
    connection: Connection,
    mut recv: RecvStream,
    codec: FramedCodec,
    events: UnboundedSender<LinkEvent>,
) {
    let mut buf = BytesMut::with_capacity(READ_CHUNK);
    let mut chunk = vec![0u8; READ_CHUNK];

    loop {
        match recv.read(&mut chunk).await {
            Ok(Some(n)) => {
                buf.extend_from_slice(&chunk[..n]);
                loop {
                    match codec.decode(&mut buf) {
                        Ok(Some(envelope)) => {
                            if events.send(LinkEvent::Frame(envelope)).is_err() {
                                return;
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            warn!("Undecodable frame, closing link: {}", e);
                            let reason = CloseReason::new(
                                tavern_protocol::close::CLOSE_POLICY_VIOLATION,
                                "malformed frame",
                            );
                            connection.close(close_code(&reason), reason.reason.as_bytes());
                            let _ = events.send(LinkEvent::Closed(reason));
                            return;
                        }
                    }
                }
            }
            Ok(None) => {
                // The peer finished its stream; its close code follows
                let reason = match tokio::time::timeout(CLOSE_LINGER, connection.closed()).await {
                    Ok(err) => close_reason_from(&err),
                    Err(_) => CloseReason::normal(),
                };
                let _ = events.send(LinkEvent::Closed(reason));
                return;
            }
            Err(e) => {
                debug!("Stream read ended: {}", e);
                let reason = connection
                    .close_reason()
                    .map(|err| close_reason_from(&err))
                    .unwrap_or_else(|| CloseReason::abnormal(e.to_string()));
                let _ = events.send(LinkEvent::Closed(reason));
                return;
            }
        }
    }
}

async fn write_frames(
    connection: Connection,
    mut send: SendStream,
    codec: FramedCodec,
    mut commands: UnboundedReceiver<LinkCommand>,
) {
    let mut buf = BytesMut::new();

    while let Some(command) = commands.recv().await {
        match command {
            LinkCommand::Send(envelope) => {
                buf.clear();
                if let Err(e) = codec.encode(&envelope, &mut buf) {
                    warn!("Dropping unencodable {} envelope: {}", envelope.kind(), e);
                    continue;
                }
                if let Err(e) = send.write_all(&buf).await {
                    debug!("Stream write failed: {}", e);
                    return;
                }
            }
            LinkCommand::Close(reason) => {
                if send.finish().is_ok() {
                    let _ = tokio::time::timeout(CLOSE_LINGER, send.stopped()).await;
                }
                connection.close(close_code(&reason), reason.reason.as_bytes());
                return;
            }
        }
    }

    // Local side dropped the link
    connection.close(close_code(&CloseReason::normal()), b"");
}

fn close_code(reason: &CloseReason) -> VarInt {
    VarInt::from_u32(u32::from(reason.code))
}

/// Translate a QUIC connection error into the protocol's close vocabulary
pub fn close_reason_from(err: &ConnectionError) -> CloseReason {
    match err {
        ConnectionError::ApplicationClosed(close) => CloseReason::new(
            u16::try_from(close.error_code.into_inner()).unwrap_or(CLOSE_ABNORMAL),
            String::from_utf8_lossy(&close.reason).into_owned(),
        ),
        ConnectionError::LocallyClosed => CloseReason::normal(),
        ConnectionError::TimedOut => CloseReason::abnormal("idle timeout"),
        other => CloseReason::abnormal(other.to_string()),
    }
}

fn crypto_provider() -> Arc<rustls::crypto::CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Create client configuration
fn create_client_config(config: &QuicTransportConfig) -> Result<ClientConfig, NetworkError> {
    // Development mode: the authority uses a self-signed certificate
    let mut client_crypto = rustls::ClientConfig::builder_with_provider(crypto_provider())
        .with_safe_default_protocol_versions()
        .map_err(|e| NetworkError::TransportError(format!("Invalid TLS versions: {}", e)))?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(SkipServerVerification))
        .with_no_client_auth();

    client_crypto.alpn_protocols = vec![ALPN_TAVERN.to_vec()];

    let mut client_config = ClientConfig::new(Arc::new(
        quinn::crypto::rustls::QuicClientConfig::try_from(client_crypto).map_err(|e| {
            NetworkError::TransportError(format!("Failed to create QUIC client config: {}", e))
        })?,
    ));

    client_config.transport_config(Arc::new(create_transport_config(config)?));

    Ok(client_config)
}

/// Create server configuration with self-signed certificate
fn create_server_config(
    config: &QuicTransportConfig,
) -> Result<(ServerConfig, CertificateDer<'static>), NetworkError> {
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).map_err(|e| {
        NetworkError::TransportError(format!("Failed to generate certificate: {}", e))
    })?;

    let cert_der = cert.cert.der().clone();
    let key_der = PrivatePkcs8KeyDer::from(cert.key_pair.serialize_der());

    let mut server_crypto = rustls::ServerConfig::builder_with_provider(crypto_provider())
        .with_safe_default_protocol_versions()
        .map_err(|e| NetworkError::TransportError(format!("Invalid TLS versions: {}", e)))?
        .with_no_client_auth()
        .with_single_cert(vec![cert_der.clone()], key_der.into())
        .map_err(|e| {
            NetworkError::TransportError(format!("Failed to create server crypto config: {}", e))
        })?;

    server_crypto.alpn_protocols = vec![ALPN_TAVERN.to_vec()];

    let mut server_config = ServerConfig::with_crypto(Arc::new(
        quinn::crypto::rustls::QuicServerConfig::try_from(server_crypto).map_err(|e| {
            NetworkError::TransportError(format!("Failed to create QUIC server config: {}", e))
        })?,
    ));

    server_config.transport_config(Arc::new(create_transport_config(config)?));

    Ok((server_config, cert_der))
}

/// Create QUIC transport configuration
fn create_transport_config(
    config: &QuicTransportConfig,
) -> Result<quinn::TransportConfig, NetworkError> {
    let mut transport = quinn::TransportConfig::default();

    let idle = config
        .max_idle_timeout
        .try_into()
        .map_err(|e| NetworkError::TransportError(format!("Invalid idle timeout: {}", e)))?;
    transport.max_idle_timeout(Some(idle));
    if !config.keep_alive_interval.is_zero() {
        transport.keep_alive_interval(Some(config.keep_alive_interval));
    }

    transport.initial_rtt(Duration::from_millis(100));

    // Set flow control windows
    transport.stream_receive_window(config.stream_receive_window);
    transport.receive_window(config.stream_receive_window);

    // Set initial congestion window
    let mut cc_config = congestion::BbrConfig::default();
    cc_config.initial_window(config.initial_window as u64);
    transport.congestion_controller_factory(Arc::new(cc_config));

    Ok(transport)
}

/// Skip certificate verification for development
#[derive(Debug)]
struct SkipServerVerification;

impl rustls::client::danger::ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ED25519,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_config_accepts_defaults() {
        assert!(create_transport_config(&QuicTransportConfig::default()).is_ok());
    }

    #[test]
    fn test_close_reason_mapping() {
        assert_eq!(close_reason_from(&ConnectionError::LocallyClosed), CloseReason::normal());
        assert!(!close_reason_from(&ConnectionError::TimedOut).is_clean());
    }
}
