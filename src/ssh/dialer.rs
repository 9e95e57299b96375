/// Chained SSH connection: bastion first, then the target through a bastion channel
use russh::client::{Handle, Msg};
use russh::keys::PrivateKey;
use russh::Channel;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use super::session::TerminalConfig;
use super::transport::{disconnect, establish, ClientHandler, DirectConnector, HopConnector, TunneledConnector};
use crate::config::{AppContext, BastionServerConfig};
use crate::error::{Hop, Result, TunnelError};

/// Final destination of a bastion hop
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HopTarget {
    pub host: String,
    pub port: u16,
}

impl HopTarget {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl std::fmt::Display for HopTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// An authenticated session on the target, together with the bastion session carrying it
///
/// The nested session's bytes travel inside a channel of the bastion
/// session, so it cannot outlive it. [`close`](Self::close) tears the target
/// down before the bastion.
pub struct SessionHandle {
    target: Handle<ClientHandler>,
    bastion: Handle<ClientHandler>,
    target_host: String,
    terminal: Option<TerminalConfig>,
}

impl SessionHandle {
    /// Host name of the target
    pub fn target_host(&self) -> &str {
        &self.target_host
    }

    /// Terminal configuration to request for interactive shells
    pub fn with_terminal(mut self, terminal: TerminalConfig) -> Self {
        self.terminal = Some(terminal);
        self
    }

    pub fn terminal(&self) -> Option<&TerminalConfig> {
        self.terminal.as_ref()
    }

    /// Open a session channel on the target
    pub async fn open_channel(&self) -> Result<Channel<Msg>> {
        self.target
            .channel_open_session()
            .await
            .map_err(|e| TunnelError::Session(format!("failed to open channel: {}", e)))
    }

    /// Disconnect the target, then the bastion
    pub async fn close(self) {
        disconnect(&self.target).await;
        disconnect(&self.bastion).await;
    }
}

/// Dials targets through a bastion host with key-based authentication
pub struct BastionDialer {
    connect_timeout: Option<Duration>,
}

impl BastionDialer {
    pub fn new(ctx: &AppContext) -> Self {
        Self::with_timeout(ctx.connect_timeout)
    }

    pub(crate) fn with_timeout(connect_timeout: Option<Duration>) -> Self {
        Self { connect_timeout }
    }

    /// Reach `target` through `bastion`
    ///
    /// The private key is loaded first, then the bastion hop is established;
    /// the nested hop is only attempted once the bastion is authenticated.
    /// Both hops use the bastion entry's user and key.
    pub async fn dial(
        &self,
        bastion: &BastionServerConfig,
        target: &HopTarget,
    ) -> Result<SessionHandle> {
        self.dial_via(&DirectConnector, bastion, target).await
    }

    pub(crate) async fn dial_via<C: HopConnector>(
        &self,
        outer: &C,
        bastion: &BastionServerConfig,
        target: &HopTarget,
    ) -> Result<SessionHandle> {
        let key = load_key(&bastion.keyfile_path)?;

        info!("Connecting to bastion {}...", bastion.endpoint());
        let bastion_session = establish(
            outer,
            Hop::Bastion,
            &bastion.address,
            bastion.port,
            &bastion.user,
            &key,
            self.connect_timeout,
        )
        .await?;
        info!("✓ Connected to bastion {}", bastion.endpoint());

        info!("Connecting to {} through {}...", target, bastion.key);
        let nested = establish(
            &TunneledConnector::new(&bastion_session),
            Hop::Target,
            &target.host,
            target.port,
            &bastion.user,
            &key,
            self.connect_timeout,
        )
        .await;

        match nested {
            Ok(target_session) => {
                info!("✓ Connected to {}", target);
                Ok(SessionHandle {
                    target: target_session,
                    bastion: bastion_session,
                    target_host: target.host.clone(),
                    terminal: None,
                })
            }
            Err(e) => {
                disconnect(&bastion_session).await;
                Err(e)
            }
        }
    }
}

fn load_key(path: &Path) -> Result<Arc<PrivateKey>> {
    russh::keys::load_secret_key(path, None)
        .map(Arc::new)
        .map_err(|e| TunnelError::AuthenticationFailed {
            hop: Hop::Bastion,
            reason: format!("failed to load private key {}: {}", path.display(), e),
        })
}
