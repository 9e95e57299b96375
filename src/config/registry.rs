/// Bastion registry: logical names mapped to SSH jump hosts
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Result, TunnelError};
use crate::utils::ports::parse_port;

/// Registry file contents
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BastionRegistry {
    /// Known bastion hosts
    #[serde(rename = "bastion", default)]
    pub servers: Vec<BastionEntry>,
}

/// One registry entry as stored on disk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BastionEntry {
    /// Logical name selected on the command line
    pub key: String,

    /// Bastion host name or IP
    pub addr: String,

    /// SSH port, stored as a string
    pub port: String,

    /// Login user on both hops
    pub user: String,

    /// Private key file, relative to the key directory
    pub keyfile: String,
}

/// A resolved registry entry, ready for dialing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BastionServerConfig {
    pub key: String,
    pub address: String,
    pub port: u16,
    pub user: String,
    pub keyfile_path: PathBuf,
}

impl BastionServerConfig {
    /// `address:port` of the bastion
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

impl BastionRegistry {
    /// Load the registry from a JSON file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            TunnelError::ConfigNotFound(format!(
                "bastion registry {} could not be read: {}",
                path.display(),
                e
            ))
        })?;

        let registry: BastionRegistry = serde_json::from_str(&content).map_err(|e| {
            TunnelError::InvalidConfig(format!(
                "bastion registry {} is not valid JSON: {}",
                path.display(),
                e
            ))
        })?;
        registry.validate()?;
        Ok(registry)
    }

    /// Validate the registry
    pub fn validate(&self) -> Result<()> {
        for (index, entry) in self.servers.iter().enumerate() {
            if entry.key.is_empty() {
                return Err(TunnelError::InvalidConfig(format!(
                    "bastion entry #{} has an empty key",
                    index
                )));
            }
            if entry.addr.is_empty() {
                return Err(TunnelError::InvalidConfig(format!(
                    "bastion entry {} has an empty addr",
                    entry.key
                )));
            }
        }
        Ok(())
    }

    /// Registry keys in file order
    pub fn keys(&self) -> Vec<&str> {
        self.servers.iter().map(|s| s.key.as_str()).collect()
    }

    /// Find the first entry named `key` and resolve its key file against `key_dir`
    pub fn resolve(&self, key: &str, key_dir: &Path) -> Result<BastionServerConfig> {
        let entry = self
            .servers
            .iter()
            .find(|s| s.key == key)
            .ok_or_else(|| {
                TunnelError::ConfigNotFound(format!(
                    "no bastion named {:?} in registry (known: {})",
                    key,
                    self.keys().join(", ")
                ))
            })?;

        let keyfile = Path::new(&entry.keyfile);
        let keyfile_path = if keyfile.is_absolute() {
            keyfile.to_path_buf()
        } else {
            key_dir.join(keyfile)
        };

        Ok(BastionServerConfig {
            key: entry.key.clone(),
            address: entry.addr.clone(),
            port: parse_port(&entry.port)?,
            user: entry.user.clone(),
            keyfile_path,
        })
    }

    /// Generate an example registry
    pub fn example() -> Self {
        Self {
            servers: vec![BastionEntry {
                key: "prod-bastion".to_string(),
                addr: "10.0.0.5".to_string(),
                port: "22".to_string(),
                user: "ec2-user".to_string(),
                keyfile: "prod.pem".to_string(),
            }],
        }
    }
}
