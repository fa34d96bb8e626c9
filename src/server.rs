//! Session daemon: creation, daemonization and the poll event loop.
//!
//! One daemon process per session, single-threaded, driven by a single
//! poll() over the listening socket, the PTY master and every attached
//! client. Clients come and go; the daemon lives until its child shell
//! exits or it receives SIGTERM.
//!
//! Signal handlers store to the two atomics below and nothing else; the
//! loop drains them at the top of every iteration. The 1-second poll
//! tick bounds how long a signal can go unnoticed.

use std::fs;
use std::os::fd::{AsRawFd, BorrowedFd};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::{UnixListener, UnixStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::waitpid;
use nix::unistd::{fork, setsid, ForkResult, Pid};

use crate::config::Config;
use crate::log::{log_error, log_info, log_warn};
use crate::protocol::{self, Message};
use crate::pty::{exit_code_from_status, set_winsize, spawn_shell, PtySession};
use crate::registry;
use crate::terminal;

/// Hard cap on simultaneous attachments per session.
const MAX_CLIENTS: usize = 16;
/// PTY read chunk; also the upper bound on a broadcast DATA payload.
const PTY_BUF_SIZE: usize = 8192;
/// A connecting client must present HELLO within this window.
const HELLO_TIMEOUT: Duration = Duration::from_secs(2);
/// Operational receive timeout; a client silent mid-frame this long is detached.
const CLIENT_RECV_TIMEOUT: Duration = Duration::from_secs(30);
/// Send timeout so a full kernel buffer surfaces as EAGAIN for write_all's probe.
const CLIENT_SEND_TIMEOUT: Duration = Duration::from_secs(1);
/// Event loop tick.
const POLL_TICK_MS: u16 = 1000;

// Signal flags. Set by the handlers, drained by the event loop; nothing
// else may touch them.
static SIGCHLD_RECEIVED: AtomicBool = AtomicBool::new(false);
static SIGTERM_RECEIVED: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_sigchld(_: libc::c_int) {
    SIGCHLD_RECEIVED.store(true, Ordering::Release);
}

extern "C" fn handle_sigterm(_: libc::c_int) {
    SIGTERM_RECEIVED.store(true, Ordering::Release);
}

/// Validate, check for a live duplicate, and daemonize a new session.
///
/// Returns once the daemon is (very likely) listening: the foreground
/// process waits up to ~1 s for the socket file to appear, then reports
/// success either way. Callers needing certainty re-probe the registry.
pub fn create(name: &str, command: Option<&str>) -> Result<()> {
    if !registry::is_valid_name(name) {
        bail!(
            "invalid session name '{}': use [A-Za-z0-9._-], max {} bytes",
            name,
            registry::MAX_NAME_LEN
        );
    }

    registry::ensure_dir()?;

    let spath = registry::socket_path(name);
    if !registry::socket_path_fits(&spath) {
        bail!("socket path too long: {}", spath.display());
    }

    if spath.exists() {
        if registry::live(name) {
            bail!(
                "session '{}' already exists (pid {})",
                name,
                registry::read_pid(name).unwrap_or(0)
            );
        }
        // Stale leftovers from a dead daemon
        registry::cleanup(name);
    }

    daemonize(name, command)
}

/// Double fork: the intermediate child calls setsid and forks again;
/// the grandchild becomes the daemon with stdio on /dev/null.
fn daemonize(name: &str, command: Option<&str>) -> Result<()> {
    // SAFETY: the CLI is single-threaded here; no locks or threads can
    // be left in an inconsistent state across the fork.
    match unsafe { fork() }.context("fork failed")? {
        ForkResult::Parent { child } => {
            // The intermediate child exits right after its own fork.
            let _ = waitpid(child, None);

            // Near-synchronous feel: wait briefly for the daemon's
            // socket, then report success regardless.
            let spath = registry::socket_path(name);
            for _ in 0..20 {
                std::thread::sleep(Duration::from_millis(50));
                if spath.exists() {
                    break;
                }
            }
            Ok(())
        }
        ForkResult::Child => {
            let _ = setsid();
            // SAFETY: still single-threaded; see above.
            match unsafe { fork() } {
                Ok(ForkResult::Parent { .. }) => std::process::exit(0),
                Ok(ForkResult::Child) => {
                    redirect_stdio_to_null();
                    let code = match run_server(name, command) {
                        Ok(code) => code,
                        Err(e) => {
                            log_error("server", "fatal", &format!("{:#}", e));
                            registry::cleanup(name);
                            1
                        }
                    };
                    std::process::exit(code);
                }
                Err(_) => std::process::exit(1),
            }
        }
    }
}

fn redirect_stdio_to_null() {
    if let Ok(null) = fs::OpenOptions::new().read(true).write(true).open("/dev/null") {
        let fd = null.as_raw_fd();
        // SAFETY: fd is a freshly opened /dev/null; duplicating it onto
        // the three standard descriptors cannot alias anything else.
        unsafe {
            libc::dup2(fd, 0);
            libc::dup2(fd, 1);
            libc::dup2(fd, 2);
        }
        // `null` drops here, closing the extra descriptor.
    }
}

struct ServerState {
    name: String,
    /// Display string for the info file ("bash" when no command given).
    command: String,
    created: i64,
    pty: PtySession,
    listener: UnixListener,
    clients: Vec<UnixStream>,
    /// Child exit code, captured exactly once.
    exit_code: Option<i32>,
    running: bool,
}

impl ServerState {
    fn write_info(&self) {
        let _ = registry::write_info(
            &self.name,
            std::process::id() as i32,
            self.clients.len(),
            self.created,
            &self.command,
        );
    }
}

/// The daemon body: bind, write registry files, run the event loop,
/// shut down. Returns the child's exit code.
fn run_server(name: &str, command: Option<&str>) -> Result<i32> {
    registry::ensure_dir()?;

    let config = Config::get();
    let mut pty = spawn_shell(&config.shell, command.filter(|c| !c.is_empty()))?;

    let spath = registry::socket_path(name);
    let _ = fs::remove_file(&spath);
    let listener = match UnixListener::bind(&spath) {
        Ok(l) => l,
        Err(e) => {
            // No socket means no session; don't leave the shell behind.
            let _ = kill(Pid::from_raw(pty.child.id() as i32), Signal::SIGTERM);
            let _ = pty.child.wait();
            return Err(e).with_context(|| format!("cannot bind {}", spath.display()));
        }
    };
    fs::set_permissions(&spath, fs::Permissions::from_mode(0o600))
        .with_context(|| format!("cannot set permissions on {}", spath.display()))?;

    let mut srv = ServerState {
        name: name.to_string(),
        command: command
            .filter(|c| !c.is_empty())
            .unwrap_or("bash")
            .to_string(),
        created: chrono::Utc::now().timestamp(),
        pty,
        listener,
        clients: Vec::new(),
        exit_code: None,
        running: true,
    };

    registry::write_pid(name, std::process::id() as i32)?;
    srv.write_info();

    terminal::ignore_signal(Signal::SIGPIPE)?;
    // No SA_RESTART: these must break poll() out of its wait.
    terminal::set_handler(Signal::SIGCHLD, handle_sigchld, false)?;
    terminal::set_handler(Signal::SIGTERM, handle_sigterm, false)?;

    log_info(
        "server",
        "start",
        &format!(
            "session '{}' pid {} child {} cmd '{}'",
            name,
            std::process::id(),
            srv.pty.child.id(),
            srv.command
        ),
    );

    event_loop(&mut srv);

    Ok(shutdown(srv))
}

fn event_loop(srv: &mut ServerState) {
    let mut buf = [0u8; PTY_BUF_SIZE];

    while srv.running {
        drain_signals(srv);
        if !srv.running {
            break;
        }

        let listen_raw = srv.listener.as_raw_fd();
        let master_raw = srv.pty.master.as_raw_fd();
        let client_raws: Vec<i32> = srv.clients.iter().map(|c| c.as_raw_fd()).collect();

        // SAFETY: all raw fds are owned by srv and stay open for this
        // iteration; nothing is removed until poll_fds is consumed.
        let mut poll_fds = vec![
            PollFd::new(
                unsafe { BorrowedFd::borrow_raw(listen_raw) },
                PollFlags::POLLIN,
            ),
            PollFd::new(
                unsafe { BorrowedFd::borrow_raw(master_raw) },
                PollFlags::POLLIN,
            ),
        ];
        for raw in &client_raws {
            poll_fds.push(PollFd::new(
                unsafe { BorrowedFd::borrow_raw(*raw) },
                PollFlags::POLLIN,
            ));
        }

        match poll(&mut poll_fds, PollTimeout::from(POLL_TICK_MS)) {
            Ok(0) => continue,
            Ok(_) => {}
            Err(Errno::EINTR) => continue,
            Err(e) => {
                log_error("server", "poll", &format!("poll failed: {}", e));
                break;
            }
        }

        let revents: Vec<PollFlags> = poll_fds
            .iter()
            .map(|p| p.revents().unwrap_or(PollFlags::empty()))
            .collect();
        drop(poll_fds);

        // New connection
        if revents[0].intersects(PollFlags::POLLIN) {
            if let Ok((stream, _)) = srv.listener.accept() {
                accept_client(srv, stream);
            }
        }

        // PTY output -> broadcast
        if revents[1].intersects(PollFlags::POLLIN) {
            match nix::unistd::read(srv.pty.master.as_raw_fd(), &mut buf) {
                Ok(0) => srv.running = false,
                Ok(n) => broadcast(srv, protocol::MSG_DATA, &buf[..n]),
                Err(Errno::EAGAIN) | Err(Errno::EINTR) => {}
                // EIO is how the master reports the slave side closing
                Err(Errno::EIO) => srv.running = false,
                Err(e) => {
                    log_error("server", "pty.read", &format!("read failed: {}", e));
                    srv.running = false;
                }
            }
        }
        if revents[1].intersects(PollFlags::POLLHUP | PollFlags::POLLERR) {
            srv.running = false;
        }

        // Client input; reverse so removal keeps remaining indices valid
        for i in (0..client_raws.len()).rev() {
            let re = revents[2 + i];
            if re.intersects(PollFlags::POLLIN) {
                client_input(srv, i);
            } else if re.intersects(PollFlags::POLLHUP | PollFlags::POLLERR) {
                remove_client(srv, i);
            }
        }
    }
}

fn drain_signals(srv: &mut ServerState) {
    if SIGCHLD_RECEIVED.swap(false, Ordering::AcqRel) {
        // Reap without blocking and capture the exit code exactly once.
        if let Ok(Some(status)) = srv.pty.child.try_wait() {
            if srv.exit_code.is_none() {
                srv.exit_code = Some(exit_code_from_status(status));
            }
        }
        srv.running = false;
    }
    if SIGTERM_RECEIVED.swap(false, Ordering::AcqRel) {
        log_info("server", "sigterm", "terminating on request");
        srv.running = false;
    }
}

fn accept_client(srv: &mut ServerState, stream: UnixStream) {
    if srv.clients.len() >= MAX_CLIENTS {
        log_warn("server", "client.limit", "rejecting connection at capacity");
        return; // dropping the stream closes it
    }

    match await_hello(&stream) {
        Some((cols, rows)) => {
            set_winsize(&srv.pty.master, cols, rows);
            let _ = stream.set_read_timeout(Some(CLIENT_RECV_TIMEOUT));
            let _ = stream.set_write_timeout(Some(CLIENT_SEND_TIMEOUT));
            srv.clients.push(stream);
            srv.write_info();
            log_info(
                "server",
                "client.attach",
                &format!("{} client(s) attached", srv.clients.len()),
            );
        }
        None => {
            log_warn("server", "client.reject", "handshake missing or malformed");
        }
    }
}

/// Await the handshake on a fresh connection. Anything other than a
/// well-formed HELLO within the window rejects the client.
fn await_hello(stream: &UnixStream) -> Option<(u16, u16)> {
    let _ = stream.set_read_timeout(Some(HELLO_TIMEOUT));
    match protocol::recv_message(stream) {
        Ok(Message::Hello { cols, rows }) => Some((cols, rows)),
        _ => None,
    }
}

fn client_input(srv: &mut ServerState, idx: usize) {
    match protocol::recv_message(&srv.clients[idx]) {
        Ok(Message::Data(data)) => {
            if !data.is_empty() {
                if let Err(e) = protocol::write_all(&srv.pty.master, &data) {
                    log_warn("server", "pty.write", &format!("dropped input: {}", e));
                }
            }
        }
        Ok(Message::Winch { cols, rows }) => set_winsize(&srv.pty.master, cols, rows),
        Ok(Message::Detach) => remove_client(srv, idx),
        Ok(_) => {} // unknown types are ignored
        Err(_) => remove_client(srv, idx),
    }
}

fn remove_client(srv: &mut ServerState, idx: usize) {
    srv.clients.swap_remove(idx);
    srv.write_info();
    log_info(
        "server",
        "client.detach",
        &format!("{} client(s) attached", srv.clients.len()),
    );
}

/// Send one frame to every attached client, detaching any that fail.
fn broadcast(srv: &mut ServerState, msg_type: u8, payload: &[u8]) {
    for i in (0..srv.clients.len()).rev() {
        if protocol::send_frame(&srv.clients[i], msg_type, payload).is_err() {
            remove_client(srv, i);
        }
    }
}

/// Terminate the child if needed, notify clients, remove registry files.
fn shutdown(mut srv: ServerState) -> i32 {
    if srv.exit_code.is_none() {
        let pid = Pid::from_raw(srv.pty.child.id() as i32);
        // HUP first (terminal hangup), then escalate.
        for (sig, wait_ms) in [
            (Signal::SIGHUP, 50u64),
            (Signal::SIGTERM, 100),
            (Signal::SIGKILL, 100),
        ] {
            match srv.pty.child.try_wait() {
                Ok(Some(status)) => {
                    srv.exit_code = Some(exit_code_from_status(status));
                    break;
                }
                _ => {}
            }
            let _ = kill(pid, sig);
            std::thread::sleep(Duration::from_millis(wait_ms));
        }
        if srv.exit_code.is_none() {
            // SIGKILL is already in flight, so this wait is bounded.
            if let Ok(status) = srv.pty.child.wait() {
                srv.exit_code = Some(exit_code_from_status(status));
            }
        }
    }

    let code = srv.exit_code.unwrap_or(0);
    broadcast(&mut srv, protocol::MSG_EXIT, &[(code & 0xff) as u8]);

    registry::cleanup(&srv.name);
    log_info(
        "server",
        "stop",
        &format!("session '{}' exit code {}", srv.name, code),
    );
    // clients, listener and PTY master close as srv drops
    code
}
