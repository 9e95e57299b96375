/// Pod port-forward tunnels and the lifecycle shared with SSH sessions
pub mod lifecycle;
pub mod portforward;

pub use lifecycle::TunnelLifecycle;
pub use portforward::{BoxedStream, PodTunnel, PodTunnelRequest, StreamUpstream, UpstreamSession};
