/// Operator interrupt handling for running tunnels
use tracing::{info, warn};

use crate::tunnel::TunnelLifecycle;

/// Wait for SIGINT or SIGTERM
pub async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
            }
            Err(e) => {
                warn!("Could not install SIGTERM handler: {}", e);
                if tokio::signal::ctrl_c().await.is_err() {
                    std::future::pending::<()>().await;
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Could not install Ctrl-C handler: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

/// Fire the stop signal on the first operator interrupt
///
/// Returns once the stop signal fired or the tunnel closed on its own.
/// Handlers stay installed afterwards, so repeated interrupts are swallowed.
pub async fn observe_interrupts(lifecycle: TunnelLifecycle) {
    observe(lifecycle, shutdown_signal()).await
}

async fn observe<F>(lifecycle: TunnelLifecycle, interrupt: F)
where
    F: std::future::Future<Output = ()>,
{
    tokio::select! {
        _ = interrupt => {
            if lifecycle.request_stop() {
                info!("Finishing tunnel...");
            }
        }
        _ = lifecycle.stopped() => {}
        _ = lifecycle.closed() => {}
    }
}
