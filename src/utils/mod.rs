/// Shared helpers
pub mod ports;

pub use ports::{parse_port, parse_port_pair, PortPair};
