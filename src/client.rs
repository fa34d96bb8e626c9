//! Attach mode: the interactive client end of a session.
//!
//! Connects to the session socket, sends HELLO with the current window
//! size, puts the controlling terminal into raw mode and then shuttles
//! bytes both ways until the user detaches (Ctrl+\), the daemon reports
//! the child's exit, or either side hangs up.

use std::io;
use std::os::fd::{AsRawFd, BorrowedFd};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{bail, Context, Result};
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::signal::Signal;
use nix::unistd::read;

use crate::log::log_debug;
use crate::protocol::{self, Message};
use crate::registry;
use crate::terminal::{self, TerminalGuard};

/// Detach byte: Ctrl+\ (FS). Scanned byte-wise in stdin and never
/// forwarded to the session.
pub const DETACH_BYTE: u8 = 0x1c;

const POLL_TICK_MS: u16 = 500;
const STDIN_BUF_SIZE: usize = 8192;

static SIGWINCH_RECEIVED: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_sigwinch(_: libc::c_int) {
    SIGWINCH_RECEIVED.store(true, Ordering::Release);
}

/// Position of the first detach byte in a stdin chunk.
fn find_detach(buf: &[u8]) -> Option<usize> {
    buf.iter().position(|&b| b == DETACH_BYTE)
}

/// Attach to a running session. Returns the process exit code: the
/// child's exit code when the session ended, 0 on user detach.
pub fn attach(name: &str) -> Result<i32> {
    if !registry::is_valid_name(name) {
        bail!("invalid session name '{}'", name);
    }

    // A daemon death mid-write must surface as EPIPE, not kill us.
    terminal::ignore_signal(Signal::SIGPIPE)?;

    let spath = registry::socket_path(name);
    let stream = UnixStream::connect(&spath)
        .with_context(|| format!("cannot attach to session '{}': not running", name))?;

    let (cols, rows) = terminal::get_terminal_size();
    protocol::send_message(&stream, &Message::Hello { cols, rows })
        .map_err(|e| anyhow::anyhow!("failed to send handshake to '{}': {}", name, e))?;

    log_debug("client", "attach", &format!("attached to '{}'", name));

    let mut guard = TerminalGuard::new()?;
    terminal::set_handler(Signal::SIGWINCH, handle_sigwinch, true)?;

    let stdin = io::stdin();
    let stdout = io::stdout();
    let mut buf = [0u8; STDIN_BUF_SIZE];
    let mut exit_code = 0i32;

    loop {
        let stdin_raw = stdin.as_raw_fd();
        let sock_raw = stream.as_raw_fd();
        // SAFETY: both fds outlive this iteration.
        let mut poll_fds = [
            PollFd::new(
                unsafe { BorrowedFd::borrow_raw(stdin_raw) },
                PollFlags::POLLIN,
            ),
            PollFd::new(
                unsafe { BorrowedFd::borrow_raw(sock_raw) },
                PollFlags::POLLIN,
            ),
        ];

        match poll(&mut poll_fds, PollTimeout::from(POLL_TICK_MS)) {
            Ok(_) => {}
            Err(Errno::EINTR) => {
                send_pending_winch(&stream);
                continue;
            }
            Err(_) => break,
        }

        send_pending_winch(&stream);

        let stdin_re = poll_fds[0].revents().unwrap_or(PollFlags::empty());
        let sock_re = poll_fds[1].revents().unwrap_or(PollFlags::empty());

        // Keystrokes -> session
        if stdin_re.intersects(PollFlags::POLLIN) {
            match read(stdin.as_raw_fd(), &mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    let data = &buf[..n];
                    if find_detach(data).is_some() {
                        let _ = protocol::send_message(&stream, &Message::Detach);
                        guard.restore();
                        log_debug("client", "detach", &format!("detached from '{}'", name));
                        eprint!("\r\n[detached from '{}']\r\n", name);
                        return Ok(0);
                    }
                    if protocol::send_frame(&stream, protocol::MSG_DATA, data).is_err() {
                        break;
                    }
                }
                Err(Errno::EINTR) | Err(Errno::EAGAIN) => {}
                Err(_) => break,
            }
        } else if stdin_re.intersects(PollFlags::POLLHUP | PollFlags::POLLERR) {
            break;
        }

        // Session output -> terminal
        if sock_re.intersects(PollFlags::POLLIN) {
            match protocol::recv_message(&stream) {
                Ok(Message::Data(data)) => {
                    if protocol::write_all(&stdout, &data).is_err() {
                        break;
                    }
                }
                Ok(Message::Exit(code)) => {
                    exit_code = code as i32;
                    break;
                }
                Ok(_) => {} // unknown types are ignored
                Err(_) => break,
            }
        } else if sock_re.intersects(PollFlags::POLLHUP | PollFlags::POLLERR) {
            break;
        }
    }

    guard.restore();
    Ok(exit_code)
}

fn send_pending_winch(stream: &UnixStream) {
    if SIGWINCH_RECEIVED.swap(false, Ordering::AcqRel) {
        let (cols, rows) = terminal::get_terminal_size();
        let _ = protocol::send_message(stream, &Message::Winch { cols, rows });
    }
}
