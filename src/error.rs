/// Error taxonomy for bastion hops and pod tunnels
use std::fmt;

/// Which leg of a chained connection an error belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hop {
    Bastion,
    Target,
}

impl fmt::Display for Hop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Hop::Bastion => write!(f, "bastion"),
            Hop::Target => write!(f, "target"),
        }
    }
}

/// Errors raised while establishing or running a tunnel
///
/// Variants carry rendered messages rather than source errors so the same
/// error can both resolve a readiness waiter and be returned by the task
/// that produced it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TunnelError {
    #[error("configuration not found: {0}")]
    ConfigNotFound(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("authentication failed on {hop} hop: {reason}")]
    AuthenticationFailed { hop: Hop, reason: String },

    #[error("failed to dial {hop} hop {addr}: {reason}")]
    DialFailed {
        hop: Hop,
        addr: String,
        reason: String,
    },

    #[error("remote refused pseudo-terminal: {0}")]
    PtyNegotiationFailed(String),

    #[error("port-forward upgrade rejected for pod {pod}: {reason}")]
    TunnelUpgradeFailed { pod: String, reason: String },

    #[error("failed to bind local port {port}: {reason}")]
    ListenerBindFailed { port: u16, reason: String },

    #[error("invalid port {0:?}: expected a number between 1 and 65535")]
    InvalidPort(String),

    #[error("interrupted before the tunnel became ready")]
    Interrupted,

    #[error("tunnel task ended before it became ready")]
    Closed,

    #[error("session error: {0}")]
    Session(String),
}

impl TunnelError {
    /// The hop this error is attributed to, if any
    pub fn hop(&self) -> Option<Hop> {
        match self {
            TunnelError::AuthenticationFailed { hop, .. } | TunnelError::DialFailed { hop, .. } => {
                Some(*hop)
            }
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, TunnelError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_names_hop() {
        let err = TunnelError::DialFailed {
            hop: Hop::Bastion,
            addr: "10.0.0.5:22".to_string(),
            reason: "connection refused".to_string(),
        };
        assert_eq!(err.hop(), Some(Hop::Bastion));
        assert!(err.to_string().contains("bastion hop 10.0.0.5:22"));

        let err = TunnelError::AuthenticationFailed {
            hop: Hop::Target,
            reason: "rejected".to_string(),
        };
        assert!(err.to_string().contains("target hop"));
    }

    #[test]
    fn test_error_names_port() {
        let err = TunnelError::ListenerBindFailed {
            port: 8080,
            reason: "address in use".to_string(),
        };
        assert!(err.to_string().contains("8080"));
        assert_eq!(err.hop(), None);
    }
}
