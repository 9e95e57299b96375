/// Kubernetes API client
use anyhow::{Context, Result};
use kube::config::KubeConfigOptions;
use kube::{Client, Config};
use tracing::debug;

/// Kubernetes client built from the local kubeconfig
#[derive(Clone)]
pub struct KubernetesClient {
    client: Client,
}

impl KubernetesClient {
    /// Connect using the current kubeconfig context, or `context` when given
    pub async fn new(context: Option<&str>) -> Result<Self> {
        let config = match context {
            Some(context) => {
                let options = KubeConfigOptions {
                    context: Some(context.to_string()),
                    ..Default::default()
                };
                Config::from_kubeconfig(&options)
                    .await
                    .with_context(|| format!("Failed to load kubeconfig context {}", context))?
            }
            None => Config::infer()
                .await
                .context("Failed to load Kubernetes configuration")?,
        };

        debug!("Using Kubernetes API server {}", config.cluster_url);

        let client = Client::try_from(config).context("Failed to create Kubernetes client")?;
        Ok(Self { client })
    }

    /// Namespace selected by the kubeconfig context
    pub fn default_namespace(&self) -> &str {
        self.client.default_namespace()
    }

    /// Underlying API client
    pub fn client(&self) -> Client {
        self.client.clone()
    }
}
