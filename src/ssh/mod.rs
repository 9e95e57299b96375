/// SSH access to cluster nodes through a bastion host
pub mod dialer;
pub mod session;
pub mod terminal;
pub mod transport;

#[cfg(test)]
mod testing;

pub use dialer::{BastionDialer, HopTarget};
pub use session::{run_interactive, TerminalConfig};
pub use terminal::CrosstermTerminal;
