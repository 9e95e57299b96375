/// Port parsing for prompt and command-line input
use crate::error::{Result, TunnelError};

/// A local port forwarded to a remote port
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortPair {
    pub local: u16,
    pub remote: u16,
}

impl PortPair {
    pub fn new(local: u16, remote: u16) -> Self {
        Self { local, remote }
    }
}

impl std::fmt::Display for PortPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.local, self.remote)
    }
}

/// Parse a port number, rejecting zero and non-numeric input
pub fn parse_port(input: &str) -> Result<u16> {
    match input.trim().parse::<u16>() {
        Ok(port) if port > 0 => Ok(port),
        _ => Err(TunnelError::InvalidPort(input.to_string())),
    }
}

/// Parse `LOCAL[:REMOTE]`; the remote port defaults to the local one
pub fn parse_port_pair(input: &str) -> Result<PortPair> {
    match input.split_once(':') {
        Some((local, remote)) => Ok(PortPair::new(parse_port(local)?, parse_port(remote)?)),
        None => {
            let port = parse_port(input)?;
            Ok(PortPair::new(port, port))
        }
    }
}
