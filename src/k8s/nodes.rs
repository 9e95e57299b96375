/// Kubernetes node operations
use anyhow::{Context, Result};
use k8s_openapi::api::core::v1::Node;
use kube::api::{Api, ListParams};

use super::client::KubernetesClient;

/// Kubernetes node queries
pub struct NodeManager {
    client: KubernetesClient,
}

impl NodeManager {
    pub fn new(client: KubernetesClient) -> Self {
        Self { client }
    }

    /// Names of all nodes, sorted
    ///
    /// On managed clusters node names are the private DNS names of the
    /// instances, which the bastion can resolve.
    pub async fn list_node_names(&self) -> Result<Vec<String>> {
        let nodes: Api<Node> = Api::all(self.client.client());
        let list = nodes
            .list(&ListParams::default())
            .await
            .context("Failed to list nodes")?;

        Ok(sorted_names(list.items.into_iter().filter_map(|n| n.metadata.name)))
    }
}

pub(crate) fn sorted_names<I: IntoIterator<Item = String>>(names: I) -> Vec<String> {
    let mut names: Vec<String> = names.into_iter().collect();
    names.sort();
    names.dedup();
    names
}
