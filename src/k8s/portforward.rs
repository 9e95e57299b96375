/// Pod port-forward upstream over the cluster API
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::Api;

use super::client::KubernetesClient;
use crate::error::{Result, TunnelError};
use crate::tunnel::{BoxedStream, StreamUpstream, UpstreamSession};

/// Opens streams through the pod `portforward` subresource
///
/// Every [`open`](StreamUpstream::open) performs one upgrade and carries one
/// stream per requested port. The upgrade's message loop failing ends the
/// returned session with an error.
pub struct KubePortForward {
    pods: Api<Pod>,
    namespace: String,
    name: String,
}

impl KubePortForward {
    pub fn new(client: &KubernetesClient, namespace: &str, name: &str) -> Self {
        Self {
            pods: Api::namespaced(client.client(), namespace),
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }
}

#[async_trait]
impl StreamUpstream for KubePortForward {
    async fn open(&self, remote_ports: &[u16]) -> Result<UpstreamSession> {
        let mut forwarder = self
            .pods
            .portforward(&self.name, remote_ports)
            .await
            .map_err(|e| TunnelError::TunnelUpgradeFailed {
                pod: self.describe(),
                reason: e.to_string(),
            })?;

        let mut streams = Vec::with_capacity(remote_ports.len());
        for port in remote_ports {
            let stream =
                forwarder
                    .take_stream(*port)
                    .ok_or_else(|| TunnelError::TunnelUpgradeFailed {
                        pod: self.describe(),
                        reason: format!("no stream for port {}", port),
                    })?;
            streams.push(Box::new(stream) as BoxedStream);
        }

        let pod = self.describe();
        Ok(UpstreamSession::new(streams).with_end(async move {
            forwarder
                .join()
                .await
                .map_err(|e| TunnelError::Session(format!("{} failed: {}", pod, e)))
        }))
    }

    fn describe(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}
