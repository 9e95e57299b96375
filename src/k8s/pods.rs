/// Kubernetes pod operations
use anyhow::{Context, Result};
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, ListParams};

use super::client::KubernetesClient;
use super::nodes::sorted_names;

/// Kubernetes pod queries
pub struct PodManager {
    client: KubernetesClient,
}

impl PodManager {
    pub fn new(client: KubernetesClient) -> Self {
        Self { client }
    }

    /// Names of the pods in `namespace`, sorted
    pub async fn list_pod_names(&self, namespace: &str) -> Result<Vec<String>> {
        let pods: Api<Pod> = Api::namespaced(self.client.client(), namespace);
        let list = pods
            .list(&ListParams::default())
            .await
            .with_context(|| format!("Failed to list pods in namespace {}", namespace))?;

        Ok(sorted_names(list.items.into_iter().filter_map(|p| p.metadata.name)))
    }
}
