//! Signaling Transport
//!
//! Framed, optionally TLS-wrapped TCP streams between voice clients and the relay.
//! The server side pumps frames into the relay task; the client side keeps one
//! connection alive with bounded exponential backoff.

use async_trait::async_trait;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_rustls::rustls::{self, pki_types::PrivateKeyDer, pki_types::ServerName};
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::config::{ClientConfig, ReconnectConfig};
use crate::protocol::{
    read_frame, receive_message, send_message, ErrorCode, ProtocolError, SignalingMessage, MAX_FRAME_LEN,
};
use crate::relay::RelayEvent;
use crate::room::ConnectionId;

/// Any bidirectional byte stream the signaling channel can run over
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

/// Transport setup errors
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),
    #[error("Invalid server name: {0}")]
    InvalidServerName(String),
    #[error("No private key found in {0}")]
    NoPrivateKey(String),
}

/// Pump one accepted connection into the relay until either side goes away.
pub async fn serve_connection<S>(
    stream: S,
    peer: String,
    events: mpsc::Sender<RelayEvent>,
    max_frame_len: usize,
) -> Result<(), ProtocolError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let connection_id = ConnectionId::new();
    let (message_tx, mut message_rx) = mpsc::unbounded_channel::<SignalingMessage>();

    if events
        .send(RelayEvent::Connected {
            connection_id,
            outbound: message_tx.clone(),
        })
        .await
        .is_err()
    {
        return Ok(());
    }
    log::info!("Connection {} from {}", connection_id, peer);

    let (mut read_half, mut write_half) = tokio::io::split(stream);

    let writer = tokio::spawn(async move {
        while let Some(message) = message_rx.recv().await {
            if send_message(&mut write_half, &message).await.is_err() {
                break;
            }
        }
    });

    let result = loop {
        let frame = match read_frame(&mut read_half, max_frame_len).await {
            Ok(frame) => frame,
            Err(ProtocolError::Closed) => break Ok(()),
            Err(e) => break Err(e),
        };

        match SignalingMessage::from_bytes(&frame) {
            Ok(message) => {
                let event = RelayEvent::Message {
                    connection_id,
                    message,
                };
                if events.send(event).await.is_err() {
                    break Ok(());
                }
            }
            Err(e) => {
                log::warn!("Invalid message from {}: {}", peer, e);
                let _ = message_tx.send(SignalingMessage::error(
                    "Invalid message format",
                    ErrorCode::InvalidMessage,
                ));
            }
        }
    };

    let _ = events.send(RelayEvent::Disconnected { connection_id }).await;
    drop(message_tx);
    // The relay drops its sender on disconnect, letting the writer flush and exit.
    if tokio::time::timeout(Duration::from_secs(1), writer).await.is_err() {
        log::debug!("Writer for {} did not drain in time", connection_id);
    }
    log::info!("Connection {} from {} closed", connection_id, peer);
    result
}

/// Build a TLS acceptor from PEM certificate and key files
pub fn load_tls_acceptor(certfile: &Path, keyfile: &Path) -> Result<TlsAcceptor, TransportError> {
    let certs = load_certs(certfile)?;
    let key = load_key(keyfile)?;
    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Load TLS certificates
fn load_certs(path: &Path) -> Result<Vec<rustls::pki_types::CertificateDer<'static>>, TransportError> {
    let file = std::fs::File::open(path)?;
    let mut reader = io::BufReader::new(file);
    let certs = rustls_pemfile::certs(&mut reader).collect::<Result<Vec<_>, _>>()?;
    Ok(certs)
}

/// Load TLS private key
fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, TransportError> {
    let file = std::fs::File::open(path)?;
    let mut reader = io::BufReader::new(file);
    rustls_pemfile::private_key(&mut reader)?
        .ok_or_else(|| TransportError::NoPrivateKey(path.display().to_string()))
}

/// Something that can open a fresh signaling stream
#[async_trait]
pub trait Dialer: Send + Sync + 'static {
    async fn dial(&self) -> io::Result<Box<dyn AsyncStream>>;
}

/// TCP dialer with optional TLS
pub struct Connector {
    addr: String,
    tls: Option<(TlsConnector, ServerName<'static>)>,
}

impl Connector {
    pub fn from_config(config: &ClientConfig) -> Result<Self, TransportError> {
        let addr = format!("{}:{}", config.server_host, config.server_port);
        if !config.tls {
            return Ok(Self { addr, tls: None });
        }

        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        if let Some(ca) = &config.ca_certfile {
            for cert in load_certs(ca)? {
                roots.add(cert)?;
            }
        }
        let tls_config = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        let server_name = ServerName::try_from(config.server_host.clone())
            .map_err(|_| TransportError::InvalidServerName(config.server_host.clone()))?;

        Ok(Self {
            addr,
            tls: Some((TlsConnector::from(Arc::new(tls_config)), server_name)),
        })
    }
}

#[async_trait]
impl Dialer for Connector {
    async fn dial(&self) -> io::Result<Box<dyn AsyncStream>> {
        let stream = TcpStream::connect(&self.addr).await?;
        stream.set_nodelay(true)?;
        match &self.tls {
            Some((connector, name)) => {
                let tls_stream = connector.connect(name.clone(), stream).await?;
                Ok(Box::new(tls_stream))
            }
            None => Ok(Box::new(stream)),
        }
    }
}

/// What the client transport reports to its owner
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// A stream is up; `reconnect` is true for every connection after the first.
    Connected { reconnect: bool },
    Message(SignalingMessage),
    /// The stream dropped; reconnection is being attempted.
    Disconnected,
    /// Reconnection attempts are exhausted.
    GaveUp,
}

enum SessionEnd {
    Lost,
    Shutdown,
}

/// A signaling connection that re-dials on loss
pub struct SignalingClient {
    outbound: mpsc::UnboundedSender<SignalingMessage>,
    task: JoinHandle<()>,
}

impl SignalingClient {
    /// Inbound frames longer than `max_frame_len` end the connection.
    pub fn spawn<D: Dialer>(
        dialer: D,
        policy: ReconnectConfig,
        max_frame_len: usize,
    ) -> (Self, mpsc::UnboundedReceiver<ClientEvent>) {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(connection_loop(
            dialer,
            policy,
            max_frame_len,
            outbound_rx,
            event_tx,
        ));
        (Self { outbound, task }, event_rx)
    }

    /// Handle for queuing outbound messages
    pub fn sender(&self) -> mpsc::UnboundedSender<SignalingMessage> {
        self.outbound.clone()
    }

    pub fn shutdown(self) {
        self.task.abort();
    }
}

async fn connection_loop<D: Dialer>(
    dialer: D,
    policy: ReconnectConfig,
    max_frame_len: usize,
    mut outbound: mpsc::UnboundedReceiver<SignalingMessage>,
    events: mpsc::UnboundedSender<ClientEvent>,
) {
    let mut attempt = 0u32;
    let mut connected_before = false;

    loop {
        match dialer.dial().await {
            Ok(stream) => {
                attempt = 0;
                // Anything queued while offline belongs to the previous session.
                let mut stale = 0;
                while outbound.try_recv().is_ok() {
                    stale += 1;
                }
                if stale > 0 {
                    log::debug!("Discarded {} message(s) queued while disconnected", stale);
                }

                if events
                    .send(ClientEvent::Connected {
                        reconnect: connected_before,
                    })
                    .is_err()
                {
                    return;
                }
                connected_before = true;
                log::info!("Signaling connected");

                match run_session(stream, max_frame_len, &mut outbound, &events).await {
                    SessionEnd::Shutdown => return,
                    SessionEnd::Lost => {
                        log::warn!("Signaling connection lost, reconnecting");
                        if events.send(ClientEvent::Disconnected).is_err() {
                            return;
                        }
                    }
                }
            }
            Err(e) => log::warn!("Failed to connect to relay: {}", e),
        }

        attempt += 1;
        if attempt > policy.attempts {
            log::error!("Giving up after {} reconnection attempts", policy.attempts);
            let _ = events.send(ClientEvent::GaveUp);
            return;
        }
        tokio::time::sleep(policy.delay_for(attempt)).await;
    }
}

async fn run_session(
    stream: Box<dyn AsyncStream>,
    max_frame_len: usize,
    outbound: &mut mpsc::UnboundedReceiver<SignalingMessage>,
    events: &mpsc::UnboundedSender<ClientEvent>,
) -> SessionEnd {
    let (mut reader, mut writer) = tokio::io::split(stream);

    let inbound = events.clone();
    let mut reader_task = tokio::spawn(async move {
        loop {
            match receive_message(&mut reader, max_frame_len).await {
                Ok(message) => {
                    if inbound.send(ClientEvent::Message(message)).is_err() {
                        break;
                    }
                }
                Err(ProtocolError::Json(e)) => log::warn!("Ignoring malformed message: {}", e),
                Err(e) => {
                    log::debug!("Signaling read ended: {}", e);
                    break;
                }
            }
        }
    });

    loop {
        tokio::select! {
            message = outbound.recv() => match message {
                Some(message) => {
                    if let Err(e) = send_message(&mut writer, &message).await {
                        log::warn!("Failed to send {}: {}", message.kind(), e);
                        reader_task.abort();
                        return SessionEnd::Lost;
                    }
                }
                None => {
                    reader_task.abort();
                    return SessionEnd::Shutdown;
                }
            },
            _ = &mut reader_task => return SessionEnd::Lost,
        }
    }
}
