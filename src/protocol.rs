//! Wire protocol framing and the shared fd I/O helpers.
//!
//! Every message is a 5-byte header (1 byte type, 4 bytes payload
//! length big-endian) followed by the payload. Frames above 1 MiB are
//! a protocol violation and fail the connection.
//!
//! [`write_all`] and [`read_exact`] are the only places bytes cross a
//! descriptor. They are correct for both blocking fds (client sockets,
//! bounded by socket timeouts) and the non-blocking PTY master, where
//! EAGAIN gets one bounded POLLOUT wait before the peer is declared
//! stalled.

use std::io;
use std::os::fd::{AsFd, AsRawFd};

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::unistd::{read, write};

/// Message type codes on the wire.
pub const MSG_DATA: u8 = 0x01;
pub const MSG_WINCH: u8 = 0x02;
pub const MSG_DETACH: u8 = 0x03;
pub const MSG_EXIT: u8 = 0x04;
pub const MSG_HELLO: u8 = 0x05;

/// Maximum payload size per frame.
pub const MAX_PAYLOAD: u32 = 1024 * 1024;

/// How long a single write may wait for the peer to become writable.
const WRITE_WAIT_MS: u16 = 1000;

/// Framing and descriptor I/O failures.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// Peer closed the connection (EOF mid-frame or zero-length write).
    #[error("connection closed")]
    Closed,
    /// Header announced a payload above [`MAX_PAYLOAD`].
    #[error("frame payload of {0} bytes exceeds limit")]
    Oversized(u32),
    /// Read hit the socket receive timeout.
    #[error("read timed out")]
    Timeout,
    /// Peer stayed unwritable past the output-wait bound.
    #[error("write stalled")]
    WriteStalled,
    /// Any other descriptor error.
    #[error("io error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },
}

impl From<Errno> for FrameError {
    fn from(e: Errno) -> Self {
        FrameError::Io {
            source: io::Error::from_raw_os_error(e as i32),
        }
    }
}

/// A decoded wire message.
///
/// Frames with a known type but a malformed payload length decode as
/// [`Message::Unknown`], which receivers ignore. The one exception is
/// the HELLO handshake, where anything but a well-formed HELLO rejects
/// the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Raw PTY bytes, either direction.
    Data(Vec<u8>),
    /// Window-size update, client to server.
    Winch { cols: u16, rows: u16 },
    /// Clean client departure.
    Detach,
    /// Child exit code, server to client; ends the attachment.
    Exit(u8),
    /// First message of every attachment, carrying the initial size.
    Hello { cols: u16, rows: u16 },
    /// Unrecognized or malformed frame; ignored by receivers.
    Unknown(u8),
}

/// Write the whole buffer, retrying short writes.
///
/// EINTR retries transparently. EAGAIN (the PTY master is non-blocking,
/// and client sockets carry a send timeout) gets one POLLOUT wait of
/// [`WRITE_WAIT_MS`]; if the fd is still unwritable the write fails so
/// a slow peer can be detached instead of back-pressuring the loop.
pub fn write_all<F: AsFd>(fd: &F, data: &[u8]) -> Result<(), FrameError> {
    let mut written = 0;
    while written < data.len() {
        match write(fd, &data[written..]) {
            Ok(0) => return Err(FrameError::Closed),
            Ok(n) => written += n,
            Err(Errno::EINTR) => continue,
            Err(Errno::EAGAIN) => {
                let mut fds = [PollFd::new(fd.as_fd(), PollFlags::POLLOUT)];
                match poll(&mut fds, PollTimeout::from(WRITE_WAIT_MS)) {
                    Ok(n) if n > 0 => continue,
                    Ok(_) => return Err(FrameError::WriteStalled),
                    Err(Errno::EINTR) => continue,
                    Err(e) => return Err(e.into()),
                }
            }
            Err(Errno::EPIPE) => return Err(FrameError::Closed),
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

/// Read exactly `buf.len()` bytes.
///
/// EOF mid-frame is [`FrameError::Closed`]; an expired receive timeout
/// surfaces as [`FrameError::Timeout`].
pub fn read_exact<F: AsFd>(fd: &F, buf: &mut [u8]) -> Result<(), FrameError> {
    let mut filled = 0;
    while filled < buf.len() {
        match read(fd.as_fd().as_raw_fd(), &mut buf[filled..]) {
            Ok(0) => return Err(FrameError::Closed),
            Ok(n) => filled += n,
            Err(Errno::EINTR) => continue,
            Err(Errno::EAGAIN) => return Err(FrameError::Timeout),
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

/// Write one frame. The low-level entry point; [`send_message`] wraps it.
pub fn send_frame<F: AsFd>(fd: &F, msg_type: u8, payload: &[u8]) -> Result<(), FrameError> {
    let len = payload.len() as u32;
    let mut header = [0u8; 5];
    header[0] = msg_type;
    header[1..5].copy_from_slice(&len.to_be_bytes());
    write_all(fd, &header)?;
    if !payload.is_empty() {
        write_all(fd, payload)?;
    }
    Ok(())
}

/// Encode cols/rows as the 4-byte WINCH/HELLO payload.
pub fn winsize_payload(cols: u16, rows: u16) -> [u8; 4] {
    let mut buf = [0u8; 4];
    buf[0..2].copy_from_slice(&cols.to_be_bytes());
    buf[2..4].copy_from_slice(&rows.to_be_bytes());
    buf
}

fn parse_winsize(payload: &[u8]) -> Option<(u16, u16)> {
    if payload.len() != 4 {
        return None;
    }
    let cols = u16::from_be_bytes([payload[0], payload[1]]);
    let rows = u16::from_be_bytes([payload[2], payload[3]]);
    Some((cols, rows))
}

/// Write one message.
pub fn send_message<F: AsFd>(fd: &F, message: &Message) -> Result<(), FrameError> {
    match message {
        Message::Data(data) => send_frame(fd, MSG_DATA, data),
        Message::Winch { cols, rows } => send_frame(fd, MSG_WINCH, &winsize_payload(*cols, *rows)),
        Message::Detach => send_frame(fd, MSG_DETACH, &[]),
        Message::Exit(code) => send_frame(fd, MSG_EXIT, &[*code]),
        Message::Hello { cols, rows } => send_frame(fd, MSG_HELLO, &winsize_payload(*cols, *rows)),
        Message::Unknown(t) => send_frame(fd, *t, &[]),
    }
}

/// Read and decode exactly one message.
pub fn recv_message<F: AsFd>(fd: &F) -> Result<Message, FrameError> {
    let mut header = [0u8; 5];
    read_exact(fd, &mut header)?;

    let msg_type = header[0];
    let len = u32::from_be_bytes([header[1], header[2], header[3], header[4]]);
    if len > MAX_PAYLOAD {
        return Err(FrameError::Oversized(len));
    }

    let mut payload = vec![0u8; len as usize];
    if len > 0 {
        read_exact(fd, &mut payload)?;
    }

    Ok(match msg_type {
        MSG_DATA => Message::Data(payload),
        MSG_WINCH => match parse_winsize(&payload) {
            Some((cols, rows)) => Message::Winch { cols, rows },
            None => Message::Unknown(MSG_WINCH),
        },
        MSG_DETACH => Message::Detach,
        MSG_EXIT => Message::Exit(payload.first().copied().unwrap_or(0)),
        MSG_HELLO => match parse_winsize(&payload) {
            Some((cols, rows)) => Message::Hello { cols, rows },
            None => Message::Unknown(MSG_HELLO),
        },
        other => Message::Unknown(other),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use std::os::unix::net::UnixStream;

    #[test]
    fn test_hello_over_socketpair() {
        let (a, b) = UnixStream::pair().expect("socketpair");
        send_message(&a, &Message::Hello { cols: 120, rows: 40 }).expect("send");
        let msg = recv_message(&b).expect("recv");
        assert_eq!(msg, Message::Hello { cols: 120, rows: 40 });
    }

    #[test]
    fn test_data_preserves_bytes() {
        let (a, b) = UnixStream::pair().expect("socketpair");
        let payload = vec![0x00, 0x1b, 0x5b, 0xff, 0x1c];
        send_message(&a, &Message::Data(payload.clone())).expect("send");
        assert_eq!(recv_message(&b).expect("recv"), Message::Data(payload));
    }

    #[test]
    fn test_detach_is_empty_frame() {
        let (a, b) = UnixStream::pair().expect("socketpair");
        send_message(&a, &Message::Detach).expect("send");
        assert_eq!(recv_message(&b).expect("recv"), Message::Detach);
    }

    #[test]
    fn test_winch_with_bad_length_decodes_unknown() {
        let (mut a, b) = UnixStream::pair().expect("socketpair");
        a.write_all(&[MSG_WINCH, 0, 0, 0, 2, 0x01, 0x02]).unwrap();
        assert_eq!(recv_message(&b).expect("recv"), Message::Unknown(MSG_WINCH));
    }

    #[test]
    fn test_unknown_type_carries_type_byte() {
        let (mut a, b) = UnixStream::pair().expect("socketpair");
        a.write_all(&[0x7f, 0, 0, 0, 0]).unwrap();
        assert_eq!(recv_message(&b).expect("recv"), Message::Unknown(0x7f));
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let (mut a, b) = UnixStream::pair().expect("socketpair");
        let too_big = (MAX_PAYLOAD + 1).to_be_bytes();
        a.write_all(&[MSG_DATA, too_big[0], too_big[1], too_big[2], too_big[3]])
            .unwrap();
        match recv_message(&b) {
            Err(FrameError::Oversized(n)) => assert_eq!(n, MAX_PAYLOAD + 1),
            other => panic!("expected Oversized, got {:?}", other),
        }
    }

    #[test]
    fn test_closed_peer_reports_closed() {
        let (a, b) = UnixStream::pair().expect("socketpair");
        drop(a);
        match recv_message(&b) {
            Err(FrameError::Closed) => {}
            other => panic!("expected Closed, got {:?}", other),
        }
    }

    #[test]
    fn test_exit_with_empty_payload_is_code_zero() {
        let (mut a, b) = UnixStream::pair().expect("socketpair");
        a.write_all(&[MSG_EXIT, 0, 0, 0, 0]).unwrap();
        assert_eq!(recv_message(&b).expect("recv"), Message::Exit(0));
    }
}
