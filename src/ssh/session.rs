/// Interactive shell over a dialed SSH session
use russh::client::Msg;
use russh::{Channel, ChannelMsg, Pty};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

use super::dialer::SessionHandle;
use super::terminal::{LocalTerminal, RawModeGuard};
use crate::config::DEFAULT_TERM;
use crate::error::{Result, TunnelError};
use crate::tunnel::TunnelLifecycle;

/// Pseudo-terminal request parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminalConfig {
    pub term: String,
    pub cols: u32,
    pub rows: u32,
    pub modes: Vec<(Pty, u32)>,
}

impl TerminalConfig {
    /// 80x40 with echo on and 14.4 kbaud line speeds
    pub fn new(term: impl Into<String>) -> Self {
        Self {
            term: term.into(),
            cols: u32::from(super::terminal::DEFAULT_COLS),
            rows: u32::from(super::terminal::DEFAULT_ROWS),
            modes: vec![
                (Pty::ECHO, 1),
                (Pty::TTY_OP_ISPEED, 14400),
                (Pty::TTY_OP_OSPEED, 14400),
            ],
        }
    }

    /// Same configuration, sized to the local terminal
    pub fn sized_to<T: LocalTerminal + ?Sized>(mut self, terminal: &T) -> Self {
        let (cols, rows) = terminal.size_or_default();
        self.cols = u32::from(cols);
        self.rows = u32::from(rows);
        self
    }
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self::new(DEFAULT_TERM)
    }
}

/// Standard streams relayed to and from the remote shell
pub(crate) struct LocalStreams<I, O, E> {
    pub stdin: I,
    pub stdout: O,
    pub stderr: E,
}

/// Attach the local terminal to a remote shell until it exits
///
/// Returns the remote exit status when the server reported one. Raw mode is
/// restored on every path out of this function.
pub async fn run_interactive<T: LocalTerminal + ?Sized>(
    handle: &SessionHandle,
    terminal: &T,
    lifecycle: &TunnelLifecycle,
) -> Result<Option<u32>> {
    let mut streams = LocalStreams {
        stdin: tokio::io::stdin(),
        stdout: tokio::io::stdout(),
        stderr: tokio::io::stderr(),
    };
    run_with_streams(handle, terminal, lifecycle, &mut streams).await
}

pub(crate) async fn run_with_streams<T, I, O, E>(
    handle: &SessionHandle,
    terminal: &T,
    lifecycle: &TunnelLifecycle,
    streams: &mut LocalStreams<I, O, E>,
) -> Result<Option<u32>>
where
    T: LocalTerminal + ?Sized,
    I: AsyncRead + Unpin,
    O: AsyncWrite + Unpin,
    E: AsyncWrite + Unpin,
{
    let _closed = lifecycle.close_on_drop();
    lifecycle.begin();

    let outcome = attach(handle, terminal, lifecycle, streams).await;
    if let Err(e) = &outcome {
        lifecycle.fail(e.clone());
    }

    info!("Connection to {} closed.", handle.target_host());
    outcome
}

async fn attach<T, I, O, E>(
    handle: &SessionHandle,
    terminal: &T,
    lifecycle: &TunnelLifecycle,
    streams: &mut LocalStreams<I, O, E>,
) -> Result<Option<u32>>
where
    T: LocalTerminal + ?Sized,
    I: AsyncRead + Unpin,
    O: AsyncWrite + Unpin,
    E: AsyncWrite + Unpin,
{
    debug!("Getting new session...");
    let mut channel = handle.open_channel().await?;

    let raw_mode = RawModeGuard::acquire(terminal)
        .map_err(|e| TunnelError::Session(format!("failed to enter raw mode: {}", e)))?;

    if terminal.is_tty() {
        let config = handle.terminal().cloned().unwrap_or_default().sized_to(terminal);
        debug!(
            "Requesting {} pty {}x{}",
            config.term, config.cols, config.rows
        );
        channel
            .request_pty(true, &config.term, config.cols, config.rows, 0, 0, &config.modes)
            .await
            .map_err(|e| TunnelError::PtyNegotiationFailed(e.to_string()))?;
        await_reply(&mut channel)
            .await
            .map_err(TunnelError::PtyNegotiationFailed)?;
    }

    channel
        .request_shell(true)
        .await
        .map_err(|e| TunnelError::Session(format!("shell request failed: {}", e)))?;
    await_reply(&mut channel)
        .await
        .map_err(|reason| TunnelError::PtyNegotiationFailed(format!("shell request: {}", reason)))?;

    if !lifecycle.mark_ready() {
        let _ = channel.close().await;
        return Ok(None);
    }

    let exit_status = relay(&mut channel, terminal, lifecycle, streams).await;

    if let Err(e) = raw_mode.release() {
        warn!("Failed to restore terminal mode: {}", e);
    }
    exit_status
}

async fn await_reply(channel: &mut Channel<Msg>) -> std::result::Result<(), String> {
    loop {
        match channel.wait().await {
            Some(ChannelMsg::Success) => return Ok(()),
            Some(ChannelMsg::Failure) => return Err("request refused by remote".to_string()),
            Some(ChannelMsg::Close) | None => return Err("channel closed".to_string()),
            Some(other) => debug!("Ignoring {:?} while waiting for reply", other),
        }
    }
}

async fn relay<T, I, O, E>(
    channel: &mut Channel<Msg>,
    terminal: &T,
    lifecycle: &TunnelLifecycle,
    streams: &mut LocalStreams<I, O, E>,
) -> Result<Option<u32>>
where
    T: LocalTerminal + ?Sized,
    I: AsyncRead + Unpin,
    O: AsyncWrite + Unpin,
    E: AsyncWrite + Unpin,
{
    let LocalStreams {
        stdin,
        stdout,
        stderr,
    } = streams;
    let mut resizes = ResizeEvents::new();

    let mut buf = vec![0u8; 8192];
    let mut stdin_closed = false;
    let mut exit_status = None;

    loop {
        tokio::select! {
            _ = lifecycle.stopped() => {
                debug!("Stop requested, closing shell channel");
                let _ = channel.close().await;
                break;
            }
            read = stdin.read(&mut buf), if !stdin_closed => match read {
                Ok(0) => {
                    stdin_closed = true;
                    channel.eof().await.map_err(session_error)?;
                }
                Ok(n) => channel.data(&buf[..n]).await.map_err(session_error)?,
                Err(e) => return Err(TunnelError::Session(format!("stdin: {}", e))),
            },
            _ = resizes.recv() => {
                let (cols, rows) = terminal.size_or_default();
                if let Err(e) = channel.window_change(u32::from(cols), u32::from(rows), 0, 0).await {
                    debug!("Window change not delivered: {}", e);
                }
            }
            msg = channel.wait() => match msg {
                Some(ChannelMsg::Data { ref data }) => {
                    stdout.write_all(data).await.map_err(local_io_error)?;
                    stdout.flush().await.map_err(local_io_error)?;
                }
                Some(ChannelMsg::ExtendedData { ref data, ext: 1 }) => {
                    stderr.write_all(data).await.map_err(local_io_error)?;
                    stderr.flush().await.map_err(local_io_error)?;
                }
                Some(ChannelMsg::ExitStatus { exit_status: status }) => {
                    exit_status = Some(status);
                    if !stdin_closed {
                        let _ = channel.eof().await;
                    }
                    break;
                }
                Some(ChannelMsg::Close) | None => {
                    debug!("Remote closed the channel");
                    break;
                }
                Some(_) => {}
            },
        }
    }

    Ok(exit_status)
}

fn session_error(e: russh::Error) -> TunnelError {
    TunnelError::Session(e.to_string())
}

fn local_io_error(e: std::io::Error) -> TunnelError {
    TunnelError::Session(format!("local terminal: {}", e))
}

/// Local window size changes
struct ResizeEvents {
    #[cfg(unix)]
    signal: Option<tokio::signal::unix::Signal>,
}

impl ResizeEvents {
    fn new() -> Self {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let signal = match signal(SignalKind::window_change()) {
                Ok(signal) => Some(signal),
                Err(e) => {
                    debug!("Window size changes will not be forwarded: {}", e);
                    None
                }
            };
            Self { signal }
        }

        #[cfg(not(unix))]
        {
            Self {}
        }
    }

    async fn recv(&mut self) {
        #[cfg(unix)]
        if let Some(signal) = self.signal.as_mut() {
            if signal.recv().await.is_some() {
                return;
            }
            self.signal = None;
        }

        std::future::pending::<()>().await
    }
}

#[cfg(test)]
mod tests {
    use super::super::terminal::fake::FakeTerminal;
    use super::super::testing::{dial_node, BastionServer, InProcessConnector, ShellScript};
    use super::*;
    use crate::tunnel::lifecycle::LifecycleState;
    use tokio::io::DuplexStream;

    /// Stdin held open for the whole session, output captured in memory
    fn captured_streams() -> (DuplexStream, LocalStreams<DuplexStream, Vec<u8>, Vec<u8>>) {
        let (keyboard, stdin) = tokio::io::duplex(1024);
        let streams = LocalStreams {
            stdin,
            stdout: Vec::new(),
            stderr: Vec::new(),
        };
        (keyboard, streams)
    }

    #[tokio::test]
    async fn test_shell_exit_restores_terminal() {
        let bastion = BastionServer::forwarding_to(ShellScript {
            output: b"Welcome to node-1\r\n".to_vec(),
            exit_status: Some(3),
            ..Default::default()
        });
        let recorder = bastion.recorder();
        let connector = InProcessConnector::new(bastion);
        let handle = dial_node(&connector).await.unwrap();

        let terminal = FakeTerminal::new(true, false, Some((120, 50)));
        let (lifecycle, ready) = TunnelLifecycle::new();
        let (_keyboard, mut streams) = captured_streams();

        let status = run_with_streams(&handle, &terminal, &lifecycle, &mut streams).await;

        assert_eq!(status.unwrap(), Some(3));
        assert_eq!(streams.stdout, b"Welcome to node-1\r\n");
        assert!(!terminal.raw.get());
        assert_eq!(terminal.enables.get(), 1);
        assert_eq!(terminal.disables.get(), 1);
        assert_eq!(
            recorder.pty_requests(),
            vec![("xterm-256color".to_string(), 120, 50)]
        );
        tokio_test::assert_ok!(ready.wait().await);
        assert_eq!(lifecycle.state(), LifecycleState::Closed);

        handle.close().await;
    }

    #[tokio::test]
    async fn test_refused_pty_restores_terminal() {
        let bastion = BastionServer::forwarding_to(ShellScript {
            refuse_pty: true,
            ..Default::default()
        });
        let connector = InProcessConnector::new(bastion);
        let handle = dial_node(&connector).await.unwrap();

        let terminal = FakeTerminal::new(true, false, Some((120, 50)));
        let (lifecycle, ready) = TunnelLifecycle::new();
        let (_keyboard, mut streams) = captured_streams();

        let outcome = run_with_streams(&handle, &terminal, &lifecycle, &mut streams).await;

        assert!(matches!(outcome, Err(TunnelError::PtyNegotiationFailed(_))));
        assert!(!terminal.raw.get());
        assert_eq!(terminal.disables.get(), 1);
        assert!(matches!(
            ready.wait().await,
            Err(TunnelError::PtyNegotiationFailed(_))
        ));
        assert_eq!(lifecycle.state(), LifecycleState::Closed);

        handle.close().await;
    }

    #[tokio::test]
    async fn test_stop_before_ready_closes_channel() {
        let bastion = BastionServer::forwarding_to(ShellScript::default());
        let recorder = bastion.recorder();
        let connector = InProcessConnector::new(bastion);
        let handle = dial_node(&connector).await.unwrap();

        let terminal = FakeTerminal::new(true, false, Some((120, 50)));
        let (lifecycle, ready) = TunnelLifecycle::new();
        let (_keyboard, mut streams) = captured_streams();
        lifecycle.request_stop();

        let outcome = run_with_streams(&handle, &terminal, &lifecycle, &mut streams).await;

        assert_eq!(outcome.unwrap(), None);
        assert!(matches!(ready.wait().await, Err(TunnelError::Interrupted)));
        assert!(recorder.channel_closed().await);
        assert!(!terminal.raw.get());
        assert_eq!(terminal.enables.get(), terminal.disables.get());
        assert_eq!(lifecycle.state(), LifecycleState::Closed);

        handle.close().await;
    }

    #[tokio::test]
    async fn test_interrupt_ends_running_shell() {
        let bastion = BastionServer::forwarding_to(ShellScript::default());
        let recorder = bastion.recorder();
        let connector = InProcessConnector::new(bastion);
        let handle = dial_node(&connector).await.unwrap();

        let terminal = FakeTerminal::new(true, false, Some((120, 50)));
        let (lifecycle, ready) = TunnelLifecycle::new();
        let (_keyboard, mut streams) = captured_streams();

        let interrupt = async {
            ready.wait().await.unwrap();
            assert!(terminal.raw.get());
            lifecycle.request_stop();
        };
        let (outcome, ()) = tokio::join!(
            run_with_streams(&handle, &terminal, &lifecycle, &mut streams),
            interrupt
        );

        assert_eq!(outcome.unwrap(), None);
        assert!(recorder.channel_closed().await);
        assert!(!terminal.raw.get());
        assert_eq!(terminal.enables.get(), 1);
        assert_eq!(terminal.disables.get(), 1);
        assert_eq!(lifecycle.state(), LifecycleState::Closed);

        handle.close().await;
    }

    #[test]
    fn test_terminal_config_defaults() {
        let config = TerminalConfig::default();
        assert_eq!(config.term, "xterm-256color");
        assert_eq!((config.cols, config.rows), (80, 40));
        assert!(config.modes.contains(&(Pty::ECHO, 1)));
        assert!(config.modes.contains(&(Pty::TTY_OP_ISPEED, 14400)));
        assert!(config.modes.contains(&(Pty::TTY_OP_OSPEED, 14400)));
    }

    #[test]
    fn test_terminal_config_sized_to_local() {
        let local = FakeTerminal::new(true, false, Some((132, 43)));
        let config = TerminalConfig::new("vt100").sized_to(&local);
        assert_eq!((config.cols, config.rows), (132, 43));
        assert_eq!(config.term, "vt100");
    }

    #[test]
    fn test_terminal_config_unknown_size_falls_back() {
        let local = FakeTerminal::new(false, false, None);
        let config = TerminalConfig::default().sized_to(&local);
        assert_eq!((config.cols, config.rows), (80, 40));
    }
}
