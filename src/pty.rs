//! PTY allocation and session child spawn.
//!
//! The daemon owns the master side; the child shell gets the slave as
//! its controlling terminal and stdio. The master is non-blocking so a
//! slow read can never stall the event loop.

use std::io;
use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::os::unix::process::CommandExt;
use std::process::{Child, Command, ExitStatus};

use anyhow::{Context, Result};
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::pty::{openpty, Winsize};

/// A session's PTY master plus the shell running on its slave side.
pub struct PtySession {
    pub master: OwnedFd,
    pub child: Child,
}

/// Open a PTY and spawn the session shell on its slave side.
///
/// The shell is invoked as a login shell (`-l`), with `-c <command>`
/// appended when a command string was given.
pub fn spawn_shell(shell: &str, command: Option<&str>) -> Result<PtySession> {
    let winsize = Winsize {
        ws_row: 24,
        ws_col: 80,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    let pty = openpty(&winsize, None).context("openpty failed")?;

    let slave_fd = pty.slave.as_raw_fd();
    let master_fd = pty.master.as_raw_fd();

    let mut cmd = Command::new(shell);
    cmd.arg("-l");
    if let Some(script) = command {
        cmd.arg("-c").arg(script);
    }

    // SAFETY: pre_exec runs in the child between fork() and exec(). All
    // operations are async-signal-safe (setsid, ioctl, dup2, close).
    // The raw fds are i32 (Copy), captured by value before the OwnedFds
    // are moved.
    let child = unsafe {
        cmd.pre_exec(move || {
            // New session with the slave as controlling terminal
            if libc::setsid() == -1 {
                return Err(io::Error::last_os_error());
            }
            if libc::ioctl(slave_fd, libc::TIOCSCTTY as libc::c_ulong, 0) == -1 {
                return Err(io::Error::last_os_error());
            }
            // Redirect stdio to the slave
            if libc::dup2(slave_fd, 0) == -1 {
                return Err(io::Error::last_os_error());
            }
            if libc::dup2(slave_fd, 1) == -1 {
                return Err(io::Error::last_os_error());
            }
            if libc::dup2(slave_fd, 2) == -1 {
                return Err(io::Error::last_os_error());
            }
            if slave_fd > 2 {
                libc::close(slave_fd);
            }
            // The child must hold only the slave side. A master ref here
            // would keep the PTY open and block SIGHUP delivery on
            // teardown.
            libc::close(master_fd);
            Ok(())
        })
        .spawn()
        .context("failed to spawn session shell")?
    };

    // Close the slave in the daemon; only the child keeps it.
    drop(pty.slave);

    set_nonblocking(&pty.master)?;

    Ok(PtySession {
        master: pty.master,
        child,
    })
}

/// Apply a window size to the PTY master (delivers SIGWINCH to the child).
pub fn set_winsize<F: AsRawFd>(fd: &F, cols: u16, rows: u16) {
    let ws = Winsize {
        ws_row: rows,
        ws_col: cols,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    // SAFETY: fd is a live PTY master owned by the caller, ws is a
    // properly initialized Winsize, and TIOCSWINSZ is the matching
    // request. Resize is best-effort; the return value is ignored.
    unsafe {
        libc::ioctl(fd.as_raw_fd(), libc::TIOCSWINSZ as libc::c_ulong, &ws);
    }
}

/// Set a descriptor to non-blocking mode.
pub fn set_nonblocking<Fd: AsFd>(fd: &Fd) -> Result<()> {
    let flags = fcntl(fd.as_fd().as_raw_fd(), FcntlArg::F_GETFL).context("fcntl F_GETFL failed")?;
    let flags = OFlag::from_bits_truncate(flags);
    fcntl(fd.as_fd().as_raw_fd(), FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK))
        .context("fcntl F_SETFL failed")?;
    Ok(())
}

/// Map an exit status to a shell-style exit code (128 + signal number
/// when the process was killed by a signal).
pub fn exit_code_from_status(status: ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    if let Some(code) = status.code() {
        code
    } else if let Some(signal) = status.signal() {
        128 + signal
    } else {
        1
    }
}
