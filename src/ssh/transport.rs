/// Layered transports for SSH hops: a direct socket, or a channel of an existing session
use async_trait::async_trait;
use russh::client::{self, Handle};
use russh::keys::{HashAlg, PrivateKey, PrivateKeyWithHashAlg, PublicKey};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::error::{Hop, Result, TunnelError};

/// SSH client callbacks
///
/// Host keys are NOT verified: every key the server presents is accepted.
/// The fingerprint is logged so the accepted key is at least visible.
pub struct ClientHandler {
    endpoint: String,
}

impl ClientHandler {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
        }
    }
}

impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        debug!(
            "Accepting host key {} for {} without verification",
            server_public_key.fingerprint(HashAlg::Sha256),
            self.endpoint
        );
        Ok(true)
    }
}

/// Produces the byte stream an SSH session runs over
#[async_trait]
pub trait HopConnector: Send + Sync {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    async fn connect(&self, hop: Hop, host: &str, port: u16) -> Result<Self::Stream>;
}

/// Plain TCP connection
pub struct DirectConnector;

#[async_trait]
impl HopConnector for DirectConnector {
    type Stream = TcpStream;

    async fn connect(&self, hop: Hop, host: &str, port: u16) -> Result<Self::Stream> {
        let stream = TcpStream::connect((host, port))
            .await
            .map_err(|e| dial_failed(hop, host, port, e))?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Could not set TCP_NODELAY: {}", e);
        }
        Ok(stream)
    }
}

/// `direct-tcpip` channel carried by an established session
pub struct TunneledConnector<'a> {
    carrier: &'a Handle<ClientHandler>,
}

impl<'a> TunneledConnector<'a> {
    pub fn new(carrier: &'a Handle<ClientHandler>) -> Self {
        Self { carrier }
    }
}

#[async_trait]
impl HopConnector for TunneledConnector<'_> {
    type Stream = russh::ChannelStream<client::Msg>;

    async fn connect(&self, hop: Hop, host: &str, port: u16) -> Result<Self::Stream> {
        let channel = self
            .carrier
            .channel_open_direct_tcpip(host, u32::from(port), "127.0.0.1", 0)
            .await
            .map_err(|e| dial_failed(hop, host, port, e))?;
        Ok(channel.into_stream())
    }
}

/// Connect, handshake and authenticate one hop
pub async fn establish<C: HopConnector>(
    connector: &C,
    hop: Hop,
    host: &str,
    port: u16,
    user: &str,
    key: &Arc<PrivateKey>,
    timeout: Option<Duration>,
) -> Result<Handle<ClientHandler>> {
    let endpoint = format!("{}:{}", host, port);

    let stream = bounded(timeout, connector.connect(hop, host, port))
        .await
        .map_err(|elapsed| dial_failed(hop, host, port, elapsed))??;

    let config = Arc::new(client::Config::default());
    let handshake = client::connect_stream(config, stream, ClientHandler::new(endpoint.clone()));
    let mut handle = bounded(timeout, handshake)
        .await
        .map_err(|elapsed| dial_failed(hop, host, port, elapsed))?
        .map_err(|e| TunnelError::AuthenticationFailed {
            hop,
            reason: format!("SSH handshake with {} failed: {}", endpoint, e),
        })?;

    if let Err(e) = authenticate(&mut handle, hop, user, key).await {
        disconnect(&handle).await;
        return Err(e);
    }

    debug!("Authenticated as {} on {} ({} hop)", user, endpoint, hop);
    Ok(handle)
}

async fn authenticate(
    handle: &mut Handle<ClientHandler>,
    hop: Hop,
    user: &str,
    key: &Arc<PrivateKey>,
) -> Result<()> {
    let hash_alg = handle.best_supported_rsa_hash().await.ok().flatten().flatten();

    let result = handle
        .authenticate_publickey(user, PrivateKeyWithHashAlg::new(key.clone(), hash_alg))
        .await
        .map_err(|e| TunnelError::AuthenticationFailed {
            hop,
            reason: e.to_string(),
        })?;

    if !result.success() {
        return Err(TunnelError::AuthenticationFailed {
            hop,
            reason: format!("public key rejected for user {}", user),
        });
    }
    Ok(())
}

/// Politely end a session; errors only get logged
pub async fn disconnect(handle: &Handle<ClientHandler>) {
    if let Err(e) = handle
        .disconnect(russh::Disconnect::ByApplication, "", "en")
        .await
    {
        warn!("Failed to disconnect cleanly: {}", e);
    }
}

async fn bounded<F: Future>(
    timeout: Option<Duration>,
    future: F,
) -> std::result::Result<F::Output, String> {
    match timeout {
        Some(limit) => tokio::time::timeout(limit, future)
            .await
            .map_err(|_| format!("timed out after {}s", limit.as_secs())),
        None => Ok(future.await),
    }
}

fn dial_failed(hop: Hop, host: &str, port: u16, reason: impl std::fmt::Display) -> TunnelError {
    TunnelError::DialFailed {
        hop,
        addr: format!("{}:{}", host, port),
        reason: reason.to_string(),
    }
}
