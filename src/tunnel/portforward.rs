/// Local TCP listeners relayed over multiplexed upstream streams
use async_trait::async_trait;
use futures::future::{join_all, BoxFuture, FutureExt};
use std::future::Future;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use super::lifecycle::TunnelLifecycle;
use crate::error::{Result, TunnelError};
use crate::utils::ports::PortPair;

/// First pause after a failed `accept`
const ACCEPT_BACKOFF_MIN: Duration = Duration::from_millis(5);

/// Longest pause between `accept` retries
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// Byte stream to one remote port
pub trait UpstreamStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> UpstreamStream for T {}

pub type BoxedStream = Box<dyn UpstreamStream>;

/// Streams produced by one upgrade, together with the session carrying them
pub struct UpstreamSession {
    pub streams: Vec<BoxedStream>,
    ended: BoxFuture<'static, Result<()>>,
}

impl UpstreamSession {
    /// A session whose end is never reported
    pub fn new(streams: Vec<BoxedStream>) -> Self {
        Self {
            streams,
            ended: futures::future::pending().boxed(),
        }
    }

    /// Resolve `ended` when the carrying session goes away; an `Err` stops the tunnel
    pub fn with_end<F>(mut self, ended: F) -> Self
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        self.ended = ended.boxed();
        self
    }
}

/// Transport that reaches ports inside a pod
#[async_trait]
pub trait StreamUpstream: Send + Sync {
    /// Upgrade a connection to the pod and return one stream per requested port, in order
    async fn open(&self, remote_ports: &[u16]) -> Result<UpstreamSession>;

    /// Human readable target, used in log lines
    fn describe(&self) -> String;
}

/// A pod port-forward request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodTunnelRequest {
    pub namespace: String,
    pub pod: String,
    pub ports: Vec<PortPair>,
}

/// Binds local listeners and relays them to a pod
pub struct PodTunnel {
    upstream: Arc<dyn StreamUpstream>,
    request: PodTunnelRequest,
    bind_addr: Ipv4Addr,
}

struct Forward {
    pair: PortPair,
    listener: TcpListener,
    /// Stream opened during the upgrade, used by the first connection
    preopened: Option<BoxedStream>,
}

impl PodTunnel {
    /// Create a tunnel bound to the loopback interface
    pub fn new(upstream: Arc<dyn StreamUpstream>, request: PodTunnelRequest) -> Self {
        Self {
            upstream,
            request,
            bind_addr: Ipv4Addr::LOCALHOST,
        }
    }

    /// Establish the tunnel and relay until stopped
    ///
    /// Readiness is signalled on `lifecycle` once every listener is bound.
    /// Errors raised before that point are also delivered to the readiness
    /// waiter, and a stop arriving while the upgrade is pending abandons it.
    /// The lifecycle is `Closed` when this returns, and every accepted
    /// connection has been released by then.
    pub async fn run(self, lifecycle: TunnelLifecycle) -> Result<()> {
        let _closed = lifecycle.close_on_drop();
        lifecycle.begin();

        let established = tokio::select! {
            biased;
            _ = lifecycle.stopped() => None,
            result = self.establish() => Some(result),
        };

        let (forwards, session_end) = match established {
            Some(Ok(established)) => established,
            Some(Err(e)) => {
                lifecycle.fail(e.clone());
                return Err(e);
            }
            None => {
                info!("Stop requested while negotiating the port-forward, closing");
                lifecycle.mark_ready();
                return Ok(());
            }
        };

        if !lifecycle.mark_ready() {
            info!("Stop requested before the tunnel became ready, closing");
            return Ok(());
        }

        for forward in &forwards {
            info!(
                "Forwarding from 127.0.0.1:{} -> {}:{}",
                forward.pair.local,
                self.upstream.describe(),
                forward.pair.remote
            );
        }

        let upstream = self.upstream;
        let mut tasks = vec![tokio::spawn(watch_session(
            session_end,
            lifecycle.clone(),
            upstream.describe(),
        ))];
        tasks.extend(forwards.into_iter().map(|forward| {
            tokio::spawn(accept_loop(forward, upstream.clone(), lifecycle.clone()))
        }));

        for result in join_all(tasks).await {
            if let Err(e) = result {
                error!("Port-forward task failed: {}", e);
            }
        }

        info!("✓ Port forwarding closed");
        Ok(())
    }

    async fn establish(&self) -> Result<(Vec<Forward>, BoxFuture<'static, Result<()>>)> {
        let remote_ports: Vec<u16> = self.request.ports.iter().map(|p| p.remote).collect();

        debug!(
            "Negotiating port-forward to {}/{} for ports {:?}",
            self.request.namespace, self.request.pod, remote_ports
        );
        let session = self.upstream.open(&remote_ports).await?;
        if session.streams.len() != remote_ports.len() {
            return Err(TunnelError::TunnelUpgradeFailed {
                pod: format!("{}/{}", self.request.namespace, self.request.pod),
                reason: format!(
                    "expected {} streams, upstream returned {}",
                    remote_ports.len(),
                    session.streams.len()
                ),
            });
        }

        let mut forwards = Vec::with_capacity(session.streams.len());
        for (pair, stream) in self.request.ports.iter().zip(session.streams) {
            let addr = SocketAddr::from((self.bind_addr, pair.local));
            let listener =
                TcpListener::bind(addr)
                    .await
                    .map_err(|e| TunnelError::ListenerBindFailed {
                        port: pair.local,
                        reason: e.to_string(),
                    })?;

            forwards.push(Forward {
                pair: *pair,
                listener,
                preopened: Some(stream),
            });
        }

        Ok((forwards, session.ended))
    }
}

/// Stop the tunnel when the multiplexed session carrying it fails
async fn watch_session(
    ended: BoxFuture<'static, Result<()>>,
    lifecycle: TunnelLifecycle,
    target: String,
) {
    tokio::select! {
        _ = lifecycle.stopped() => {}
        result = ended => match result {
            Ok(()) => debug!("Port-forward session to {} ended", target),
            Err(e) => {
                error!("Port-forward session to {} failed: {}", target, e);
                lifecycle.request_stop();
            }
        },
    }
}

fn next_backoff(previous: Option<Duration>) -> Duration {
    match previous {
        None => ACCEPT_BACKOFF_MIN,
        Some(delay) => (delay * 2).min(ACCEPT_BACKOFF_MAX),
    }
}

async fn accept_loop(
    mut forward: Forward,
    upstream: Arc<dyn StreamUpstream>,
    lifecycle: TunnelLifecycle,
) {
    let mut connections = JoinSet::new();
    let mut backoff = None;

    loop {
        let (socket, peer) = tokio::select! {
            _ = lifecycle.stopped() => break,
            Some(_) = connections.join_next(), if !connections.is_empty() => continue,
            accepted = forward.listener.accept() => match accepted {
                Ok(accepted) => {
                    backoff = None;
                    accepted
                }
                Err(e) => {
                    let delay = next_backoff(backoff);
                    backoff = Some(delay);
                    warn!(
                        "Failed to accept on port {}: {} (retrying in {:?})",
                        forward.pair.local, e, delay
                    );
                    tokio::select! {
                        _ = lifecycle.stopped() => break,
                        _ = tokio::time::sleep(delay) => continue,
                    }
                }
            },
        };

        debug!("Handling connection for {} from {}", forward.pair.local, peer);

        let stream = match forward.preopened.take() {
            Some(stream) => stream,
            None => {
                let remote_ports = [forward.pair.remote];
                let opened = tokio::select! {
                    _ = lifecycle.stopped() => break,
                    opened = upstream.open(&remote_ports) => opened,
                };
                match opened {
                    Ok(mut session) if !session.streams.is_empty() => {
                        let stream = session.streams.swap_remove(0);
                        connections.spawn(watch_session(
                            session.ended,
                            lifecycle.clone(),
                            upstream.describe(),
                        ));
                        stream
                    }
                    Ok(_) => {
                        error!("Upstream returned no stream for port {}", forward.pair.remote);
                        lifecycle.request_stop();
                        break;
                    }
                    Err(e) => {
                        error!("Port-forward session to {} failed: {}", upstream.describe(), e);
                        lifecycle.request_stop();
                        break;
                    }
                }
            }
        };

        connections.spawn(relay(socket, stream, forward.pair, lifecycle.clone()));
    }

    debug!("Stopped accepting on port {}", forward.pair.local);
    while connections.join_next().await.is_some() {}
}

async fn relay(
    mut socket: TcpStream,
    mut stream: BoxedStream,
    pair: PortPair,
    lifecycle: TunnelLifecycle,
) {
    tokio::select! {
        result = tokio::io::copy_bidirectional(&mut socket, &mut stream) => match result {
            Ok((sent, received)) => debug!(
                "Connection on {} closed ({} bytes sent, {} bytes received)",
                pair, sent, received
            ),
            Err(e) => debug!("Connection on {} ended: {}", pair, e),
        },
        _ = lifecycle.stopped() => debug!("Dropping connection on {}", pair),
    }
}
