//! SSH sessions to the bastion host, built on russh.
//!
//! The tunnel manager only sees the [`SshConnector`] and [`SshSession`]
//! traits; [`RusshConnector`] is the production implementation.

use async_trait::async_trait;
use russh::client;
use russh::Disconnect;
use russh_keys::key::KeyPair;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, Mutex};

use crate::error::{QuarryError, QuarryResult};
use crate::models::SshDescriptor;

/// Time allowed for the TCP connect and SSH handshake.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Byte stream carried by one forwarded channel.
pub trait ForwardIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> ForwardIo for T {}

/// Boxed forwarded channel.
pub type ForwardStream = Box<dyn ForwardIo>;

/// Lifecycle notifications emitted by an SSH session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// The session reported an error and can no longer forward
    Error(String),
    /// The session closed or reached end of stream
    Closed,
}

/// An authenticated SSH session able to open forwarded channels.
#[async_trait]
pub trait SshSession: Send + Sync {
    /// Open a direct-tcpip channel to `host:port` as seen from the bastion.
    async fn open_forward(&self, host: &str, port: u16) -> QuarryResult<ForwardStream>;

    /// Disconnect the session.
    async fn close(&self);
}

/// A connected session plus the channel its lifecycle events arrive on.
pub struct SshLink {
    /// The shared session
    pub session: Arc<dyn SshSession>,
    /// Session close/error notifications
    pub events: mpsc::UnboundedReceiver<SessionEvent>,
}

/// Opens authenticated sessions to a bastion.
///
/// Missing or undecodable keys fail with [`QuarryError::Config`]; network
/// and authentication failures with [`QuarryError::Tunnel`].
#[async_trait]
pub trait SshConnector: Send + Sync {
    /// Connect and authenticate.
    async fn connect(&self, bastion: &SshDescriptor) -> QuarryResult<SshLink>;
}

/// SSH client handler for russh.
///
/// Dropped by russh when the session task ends, which is how session
/// termination reaches the tunnel.
struct SshClientHandler {
    events: mpsc::UnboundedSender<SessionEvent>,
}

#[async_trait]
impl client::Handler for SshClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh_keys::key::PublicKey,
    ) -> Result<bool, Self::Error> {
        // Bastion host keys are not pinned
        Ok(true)
    }
}

impl Drop for SshClientHandler {
    fn drop(&mut self) {
        let _ = self.events.send(SessionEvent::Closed);
    }
}

/// Production connector using russh with public key authentication.
pub struct RusshConnector {
    config: Arc<client::Config>,
}

impl RusshConnector {
    /// Create a connector with keepalives enabled.
    pub fn new() -> Self {
        let config = client::Config {
            keepalive_interval: Some(Duration::from_secs(30)),
            ..Default::default()
        };
        Self { config: Arc::new(config) }
    }
}

impl Default for RusshConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SshConnector for RusshConnector {
    async fn connect(&self, bastion: &SshDescriptor) -> QuarryResult<SshLink> {
        let key = load_private_key(&bastion.key_path, bastion.key_passphrase.as_deref()).await?;

        tracing::info!(host = %bastion.host, port = bastion.port, "Connecting to SSH bastion");

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let handler = SshClientHandler { events: events_tx.clone() };

        let connect = client::connect(
            self.config.clone(),
            (bastion.host.as_str(), bastion.port),
            handler,
        );
        let mut handle = tokio::time::timeout(CONNECT_TIMEOUT, connect)
            .await
            .map_err(|_| {
                QuarryError::tunnel(format!(
                    "Timed out connecting to SSH bastion {}:{}",
                    bastion.host, bastion.port
                ))
            })?
            .map_err(|e| {
                QuarryError::tunnel_with_source(
                    format!("Failed to connect to SSH bastion {}:{}", bastion.host, bastion.port),
                    e,
                )
            })?;

        let authenticated = handle
            .authenticate_publickey(bastion.username.as_str(), key)
            .await
            .map_err(|e| QuarryError::tunnel_with_source("SSH key authentication failed", e))?;

        if !authenticated {
            return Err(QuarryError::tunnel(format!(
                "SSH bastion rejected key for user '{}'",
                bastion.username
            )));
        }

        tracing::info!(
            "SSH authentication successful for {}@{}",
            bastion.username,
            bastion.host
        );

        Ok(SshLink {
            session: Arc::new(RusshSession { handle: Mutex::new(handle), events: events_tx }),
            events: events_rx,
        })
    }
}

/// A russh client session shared by every forwarded connection.
struct RusshSession {
    handle: Mutex<client::Handle<SshClientHandler>>,
    events: mpsc::UnboundedSender<SessionEvent>,
}

#[async_trait]
impl SshSession for RusshSession {
    async fn open_forward(&self, host: &str, port: u16) -> QuarryResult<ForwardStream> {
        let handle = self.handle.lock().await;
        match handle.channel_open_direct_tcpip(host, port as u32, "127.0.0.1", 0).await {
            Ok(channel) => Ok(Box::new(channel.into_stream())),
            Err(e) => {
                if handle.is_closed() {
                    let _ = self.events.send(SessionEvent::Error(e.to_string()));
                }
                Err(QuarryError::tunnel_with_source(
                    format!("Failed to open SSH channel to {host}:{port}"),
                    e,
                ))
            }
        }
    }

    async fn close(&self) {
        let handle = self.handle.lock().await;
        if let Err(e) = handle.disconnect(Disconnect::ByApplication, "", "en").await {
            tracing::debug!(error = %e, "SSH disconnect after session already ended");
        }
    }
}

/// Load a private key from a file.
async fn load_private_key(path: &Path, passphrase: Option<&str>) -> QuarryResult<Arc<KeyPair>> {
    let key_data = tokio::fs::read_to_string(path).await.map_err(|e| {
        QuarryError::config_with_hint(
            format!("Failed to read SSH key file {}: {}", path.display(), e),
            "Check that SSH_KEY_PATH exists and is readable",
        )
    })?;

    let key = russh_keys::decode_secret_key(&key_data, passphrase).map_err(|e| {
        QuarryError::config_with_hint(
            format!("Failed to parse SSH key {}: {}", path.display(), e),
            "The key may be encrypted - set SSH_KEY_PASSPHRASE",
        )
    })?;

    Ok(Arc::new(key))
}
