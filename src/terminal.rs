//! Terminal handling - raw mode and signal registration.
//!
//! Key pieces:
//! - TerminalGuard: RAII wrapper that restores terminal modes on drop
//! - get_terminal_size: current window size with an 80x24 fallback
//! - set_handler / ignore_signal: sigaction plumbing for the atomic
//!   signal flags the event loops drain

use anyhow::{Context, Result};
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::sys::termios::{cfmakeraw, tcgetattr, tcsetattr, SetArg, Termios};
use nix::unistd::isatty;
use std::io;
use std::os::fd::AsRawFd;

/// RAII guard that restores terminal settings when dropped.
///
/// When created, puts stdin into raw mode (no line buffering, no echo,
/// no special characters). If stdin is not a TTY the guard is a no-op.
pub struct TerminalGuard {
    original: Option<Termios>,
}

impl TerminalGuard {
    pub fn new() -> Result<Self> {
        let stdin = io::stdin();
        if !isatty(stdin.as_raw_fd()).unwrap_or(false) {
            return Ok(Self { original: None });
        }

        let original = tcgetattr(&stdin).context("tcgetattr failed")?;
        let mut raw = original.clone();
        cfmakeraw(&mut raw);
        tcsetattr(&stdin, SetArg::TCSANOW, &raw).context("tcsetattr failed")?;
        Ok(Self {
            original: Some(original),
        })
    }

    /// Restore the saved settings immediately. Idempotent; drop calls it
    /// too, so the terminal is restored on every exit path.
    pub fn restore(&mut self) {
        if let Some(termios) = self.original.take() {
            let _ = tcsetattr(io::stdin(), SetArg::TCSANOW, &termios);
        }
    }
}

impl Drop for TerminalGuard {
    fn drop(&mut self) {
        self.restore();
    }
}

/// Current terminal size as (cols, rows). Falls back to 80x24 when
/// stdin is not a terminal or reports a zero dimension.
pub fn get_terminal_size() -> (u16, u16) {
    // SAFETY: winsize is a plain C struct; all-zero is a valid value
    // that the ioctl overwrites.
    let mut ws: libc::winsize = unsafe { std::mem::zeroed() };

    // SAFETY: stdin is a valid descriptor and TIOCGWINSZ is the query
    // request for it; the return value and fields are checked below.
    let ret = unsafe {
        libc::ioctl(
            io::stdin().as_raw_fd(),
            libc::TIOCGWINSZ as libc::c_ulong,
            &mut ws,
        )
    };
    if ret == -1 || ws.ws_col == 0 || ws.ws_row == 0 {
        return (80, 24);
    }
    (ws.ws_col, ws.ws_row)
}

/// Register a handler for one signal.
///
/// `restart` controls SA_RESTART: handlers that must wake a poll() out
/// of its wait (SIGCHLD, SIGTERM) are installed without it so the loop
/// sees EINTR promptly.
pub fn set_handler(
    signal: Signal,
    handler: extern "C" fn(libc::c_int),
    restart: bool,
) -> Result<()> {
    let flags = if restart {
        SaFlags::SA_RESTART
    } else {
        SaFlags::empty()
    };
    let action = SigAction::new(SigHandler::Handler(handler), flags, SigSet::empty());
    // SAFETY: every handler installed through this function only stores
    // to an AtomicBool, which is async-signal-safe.
    unsafe { sigaction(signal, &action) }.context(format!("sigaction {:?} failed", signal))?;
    Ok(())
}

/// Ignore a signal. Used for SIGPIPE so a write to a dead peer returns
/// EPIPE instead of killing the process.
pub fn ignore_signal(signal: Signal) -> Result<()> {
    let action = SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty());
    // SAFETY: SIG_IGN carries no handler code.
    unsafe { sigaction(signal, &action) }.context(format!("sigaction {:?} failed", signal))?;
    Ok(())
}
