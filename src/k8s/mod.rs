/// Kubernetes cluster operations
pub mod client;
pub mod nodes;
pub mod pods;
pub mod portforward;

pub use client::KubernetesClient;
pub use nodes::NodeManager;
pub use pods::PodManager;
pub use portforward::KubePortForward;
