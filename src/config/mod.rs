/// Configuration management for kubenx
pub mod registry;

pub use registry::{BastionRegistry, BastionServerConfig};

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Result, TunnelError};

/// Directory under the user's home holding kubenx state
pub const KUBENX_HOMEDIR: &str = ".kubenx";

/// Bastion registry file name inside [`KUBENX_HOMEDIR`]
pub const REGISTRY_FILE: &str = "ssh";

/// Directory under the user's home holding private keys
pub const KEY_DIR: &str = ".ssh";

/// SSH port used for target hosts when none is given
pub const TARGET_DEFAULT_PORT: u16 = 22;

/// Terminal type requested for remote pseudo-terminals
pub const DEFAULT_TERM: &str = "xterm-256color";

/// Explicit per-invocation context handed to the dialer and the tunnel
#[derive(Debug, Clone)]
pub struct AppContext {
    /// Bastion registry file
    pub registry_path: PathBuf,

    /// Directory `keyfile` entries are resolved against
    pub key_dir: PathBuf,

    /// Upper bound for each dial/handshake phase; unbounded when `None`
    pub connect_timeout: Option<Duration>,

    /// Terminal type requested for the remote PTY
    pub term: String,

    /// Kubeconfig context to use instead of the current one
    pub kube_context: Option<String>,
}

impl AppContext {
    /// Build the context from the user's home directory and optional overrides
    pub fn new(
        registry_path: Option<PathBuf>,
        key_dir: Option<PathBuf>,
        connect_timeout_secs: Option<u64>,
        kube_context: Option<String>,
    ) -> Result<Self> {
        let home = dirs::home_dir();

        let registry_path = match (registry_path, &home) {
            (Some(path), _) => path,
            (None, Some(home)) => home.join(KUBENX_HOMEDIR).join(REGISTRY_FILE),
            (None, None) => {
                return Err(TunnelError::ConfigNotFound(
                    "could not determine home directory for the bastion registry".to_string(),
                ))
            }
        };

        let key_dir = match (key_dir, &home) {
            (Some(dir), _) => dir,
            (None, Some(home)) => home.join(KEY_DIR),
            (None, None) => {
                return Err(TunnelError::ConfigNotFound(
                    "could not determine home directory for private keys".to_string(),
                ))
            }
        };

        Ok(Self {
            registry_path,
            key_dir,
            connect_timeout: connect_timeout_secs
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs),
            term: DEFAULT_TERM.to_string(),
            kube_context,
        })
    }

    /// Load the registry and resolve one entry by key
    pub fn resolve_bastion(&self, key: &str) -> Result<BastionServerConfig> {
        BastionRegistry::from_file(&self.registry_path)?.resolve(key, &self.key_dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_overrides() {
        let ctx = AppContext::new(
            Some(PathBuf::from("/tmp/registry.json")),
            Some(PathBuf::from("/tmp/keys")),
            Some(15),
            Some("staging".to_string()),
        )
        .unwrap();

        assert_eq!(ctx.registry_path, PathBuf::from("/tmp/registry.json"));
        assert_eq!(ctx.key_dir, PathBuf::from("/tmp/keys"));
        assert_eq!(ctx.connect_timeout, Some(Duration::from_secs(15)));
        assert_eq!(ctx.term, DEFAULT_TERM);
    }

    #[test]
    fn test_zero_timeout_means_unbounded() {
        let ctx = AppContext::new(
            Some(PathBuf::from("/tmp/registry.json")),
            Some(PathBuf::from("/tmp/keys")),
            Some(0),
            None,
        )
        .unwrap();
        assert_eq!(ctx.connect_timeout, None);
    }

    #[test]
    fn test_resolve_bastion_missing_registry() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = AppContext::new(
            Some(dir.path().join("absent")),
            Some(dir.path().to_path_buf()),
            None,
            None,
        )
        .unwrap();

        let err = ctx.resolve_bastion("prod-bastion").unwrap_err();
        assert!(matches!(err, TunnelError::ConfigNotFound(_)));
    }
}
