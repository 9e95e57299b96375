/// kubenx - remote access to Kubernetes cluster nodes and pods
///
/// Opens interactive shells on cluster nodes through a bastion host and
/// forwards local ports to pods.
mod config;
mod error;
mod k8s;
mod prompt;
mod signals;
mod ssh;
mod tunnel;
mod utils;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{AppContext, BastionRegistry, TARGET_DEFAULT_PORT};
use crate::error::{Hop, TunnelError};
use crate::k8s::{KubePortForward, KubernetesClient, NodeManager, PodManager};
use crate::ssh::{run_interactive, BastionDialer, CrosstermTerminal, HopTarget, TerminalConfig};
use crate::tunnel::{PodTunnel, PodTunnelRequest, TunnelLifecycle};
use crate::utils::parse_port_pair;

#[derive(Parser)]
#[command(name = "kubenx")]
#[command(about = "Reach Kubernetes nodes over SSH and forward ports to pods", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Bastion registry file [default: ~/.kubenx/ssh]
    #[arg(long, global = true, env = "KUBENX_REGISTRY")]
    registry: Option<PathBuf>,

    /// Directory holding the registry's private keys [default: ~/.ssh]
    #[arg(long, global = true)]
    key_dir: Option<PathBuf>,

    /// Seconds allowed for each connect and handshake (0 waits forever)
    #[arg(long, global = true, env = "KUBENX_CONNECT_TIMEOUT")]
    connect_timeout: Option<u64>,

    /// Kubeconfig context to use
    #[arg(long, global = true)]
    context: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Open a shell on a node through a bastion host
    Ssh {
        /// Bastion registry key
        key: String,

        /// Target host; chosen from the cluster nodes when omitted
        #[arg(long)]
        host: Option<String>,

        /// Target SSH port
        #[arg(long, default_value_t = TARGET_DEFAULT_PORT)]
        port: u16,
    },

    /// Forward local ports to a pod
    PortForward {
        /// Pod name; chosen interactively when omitted
        pod: Option<String>,

        /// Namespace [default: the kubeconfig context's namespace]
        #[arg(short, long)]
        namespace: Option<String>,

        /// LOCAL[:REMOTE] port pair, may be repeated
        #[arg(short, long = "port")]
        ports: Vec<String>,
    },

    /// Generate an example bastion registry
    Init,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("kubenx={}", log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let result = match AppContext::new(
        cli.registry.clone(),
        cli.key_dir.clone(),
        cli.connect_timeout,
        cli.context.clone(),
    ) {
        Ok(ctx) => match cli.command {
            Commands::Ssh {
                ref key,
                ref host,
                port,
            } => open_shell(&ctx, key, host.clone(), port).await,
            Commands::PortForward {
                ref pod,
                ref namespace,
                ref ports,
            } => port_forward(&ctx, pod.clone(), namespace.clone(), ports).await,
            Commands::Init => init_registry(&ctx).await,
        },
        Err(e) => Err(e.into()),
    };

    if let Err(e) = result {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }

    // The stdin reader of an interactive session may still be parked in a
    // blocking read, which would hold up runtime shutdown.
    std::process::exit(0);
}

/// Open an interactive shell on a node through a bastion
async fn open_shell(ctx: &AppContext, key: &str, host: Option<String>, port: u16) -> Result<()> {
    let bastion = ctx
        .resolve_bastion(key)
        .with_context(|| format!("Failed to resolve bastion {}", key))?;

    let host = match host {
        Some(host) => host,
        None => {
            let client = KubernetesClient::new(ctx.kube_context.as_deref()).await?;
            let nodes = NodeManager::new(client).list_node_names().await?;
            prompt::select("Select a node", &nodes)?
        }
    };
    let target = HopTarget::new(host, port);

    let session = match BastionDialer::new(ctx).dial(&bastion, &target).await {
        Ok(session) => session.with_terminal(TerminalConfig::new(ctx.term.clone())),
        Err(e) => {
            let failed = failed_endpoint(&e, &bastion.endpoint(), &target);
            return Err(e).with_context(|| format!("Failed to reach {}", failed));
        }
    };

    let (lifecycle, _ready) = TunnelLifecycle::new();
    let observer = tokio::spawn(signals::observe_interrupts(lifecycle.clone()));

    let outcome = run_interactive(&session, &CrosstermTerminal, &lifecycle).await;

    session.close().await;
    if let Err(e) = observer.await {
        debug!("Interrupt observer ended abnormally: {}", e);
    }

    match outcome {
        Ok(Some(status)) => {
            debug!("Remote shell exited with status {}", status);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(e) => Err(e).with_context(|| format!("Session on {} failed", target)),
    }
}

/// Endpoint of the hop a dial error belongs to
fn failed_endpoint(err: &TunnelError, bastion: &str, target: &HopTarget) -> String {
    match err.hop() {
        Some(Hop::Target) => format!("{} through bastion {}", target, bastion),
        _ => format!("bastion {}", bastion),
    }
}

/// Forward local ports to a pod until interrupted
async fn port_forward(
    ctx: &AppContext,
    pod: Option<String>,
    namespace: Option<String>,
    ports: &[String],
) -> Result<()> {
    let client = KubernetesClient::new(ctx.kube_context.as_deref()).await?;
    let namespace = namespace.unwrap_or_else(|| client.default_namespace().to_string());

    let pod = match pod {
        Some(pod) => pod,
        None => {
            let pods = PodManager::new(client.clone())
                .list_pod_names(&namespace)
                .await?;
            prompt::select("Select a pod", &pods)?
        }
    };

    let ports = if ports.is_empty() {
        vec![prompt::port_pair()?]
    } else {
        ports
            .iter()
            .map(|p| parse_port_pair(p))
            .collect::<std::result::Result<Vec<_>, _>>()?
    };

    let request = PodTunnelRequest {
        namespace: namespace.clone(),
        pod: pod.clone(),
        ports,
    };
    let upstream = Arc::new(KubePortForward::new(&client, &namespace, &pod));

    info!("Starting port forwarding to {}/{}...", namespace, pod);
    let (lifecycle, ready) = TunnelLifecycle::new();
    let observer = tokio::spawn(signals::observe_interrupts(lifecycle.clone()));
    let tunnel = tokio::spawn(PodTunnel::new(upstream, request).run(lifecycle.clone()));

    match ready.wait().await {
        Ok(()) => info!("✓ Port forwarding is ready to get traffic"),
        Err(TunnelError::Interrupted) => info!("Port forwarding cancelled"),
        Err(e) => debug!("Port forwarding never became ready: {}", e),
    }

    let (tunnel_result, observer_result) = tokio::join!(tunnel, observer);
    if let Err(e) = observer_result {
        debug!("Interrupt observer ended abnormally: {}", e);
    }
    debug!("Tunnel finished in state {:?}", lifecycle.state());

    tunnel_result
        .context("Port-forward task failed")?
        .with_context(|| format!("Failed to forward ports to {}/{}", namespace, pod))
}

/// Generate an example bastion registry
async fn init_registry(ctx: &AppContext) -> Result<()> {
    let path = &ctx.registry_path;
    if path.exists() {
        anyhow::bail!("Bastion registry already exists: {}", path.display());
    }

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }

    let json = serde_json::to_string_pretty(&BastionRegistry::example())?;
    tokio::fs::write(path, json)
        .await
        .context("Failed to write bastion registry")?;

    info!("Example bastion registry created: {}", path.display());
    info!("");
    info!("Next steps:");
    info!("  1. Edit the registry to list your bastion hosts");
    info!(
        "  2. Put each entry's private key under {}",
        ctx.key_dir.display()
    );
    info!("  3. Open a shell on a node:");
    info!("     kubenx ssh prod-bastion");

    Ok(())
}
