/// Local terminal mode and size
use std::io::{self, IsTerminal};
use tracing::debug;

/// Columns used when the local terminal size is unknown
pub const DEFAULT_COLS: u16 = 80;

/// Rows used when the local terminal size is unknown
pub const DEFAULT_ROWS: u16 = 40;

/// The controlling terminal of this process
pub trait LocalTerminal {
    /// Whether stdin is attached to a terminal
    fn is_tty(&self) -> bool;

    fn is_raw(&self) -> io::Result<bool>;

    fn enable_raw(&self) -> io::Result<()>;

    fn disable_raw(&self) -> io::Result<()>;

    /// `(columns, rows)`
    fn size(&self) -> io::Result<(u16, u16)>;

    /// Current size, or 80x40 when it cannot be determined
    fn size_or_default(&self) -> (u16, u16) {
        match self.size() {
            Ok((cols, rows)) if cols > 0 && rows > 0 => (cols, rows),
            Ok(_) => (DEFAULT_COLS, DEFAULT_ROWS),
            Err(e) => {
                debug!("Could not read terminal size: {}", e);
                (DEFAULT_COLS, DEFAULT_ROWS)
            }
        }
    }
}

/// Terminal backed by crossterm
pub struct CrosstermTerminal;

impl LocalTerminal for CrosstermTerminal {
    fn is_tty(&self) -> bool {
        io::stdin().is_terminal()
    }

    fn is_raw(&self) -> io::Result<bool> {
        crossterm::terminal::is_raw_mode_enabled()
    }

    fn enable_raw(&self) -> io::Result<()> {
        crossterm::terminal::enable_raw_mode()
    }

    fn disable_raw(&self) -> io::Result<()> {
        crossterm::terminal::disable_raw_mode()
    }

    fn size(&self) -> io::Result<(u16, u16)> {
        crossterm::terminal::size()
    }
}

/// Holds the terminal in raw mode until released or dropped
///
/// Only a guard that switched raw mode on switches it back off, so the mode
/// after the session equals the mode before it.
pub struct RawModeGuard<'a, T: LocalTerminal + ?Sized> {
    terminal: &'a T,
    restore: bool,
}

impl<'a, T: LocalTerminal + ?Sized> RawModeGuard<'a, T> {
    /// Enter raw mode if stdin is a terminal that is not already raw
    pub fn acquire(terminal: &'a T) -> io::Result<Self> {
        let mut guard = Self {
            terminal,
            restore: false,
        };

        if terminal.is_tty() && !terminal.is_raw()? {
            terminal.enable_raw()?;
            guard.restore = true;
            debug!("Entered raw mode");
        }

        Ok(guard)
    }

    /// Restore the previous mode now, reporting failures
    pub fn release(mut self) -> io::Result<()> {
        self.restore_once()
    }

    fn restore_once(&mut self) -> io::Result<()> {
        if std::mem::take(&mut self.restore) {
            debug!("Leaving raw mode");
            self.terminal.disable_raw()?;
        }
        Ok(())
    }
}

impl<T: LocalTerminal + ?Sized> Drop for RawModeGuard<'_, T> {
    fn drop(&mut self) {
        let _ = self.restore_once();
    }
}
