//! Length-prefixed JSON framing over a Unix domain socket, with optional
//! ancillary file descriptors riding the first read/write of the frame.
//!
//! Wire format: `length: u32 BE || payload: UTF-8 JSON`, `0 < length <=
//! MAX_PAYLOAD`. Ancillary FDs (if any) are attached via `SCM_RIGHTS` to the
//! `sendmsg`/`recvmsg` call that carries the frame's first bytes. The codec
//! never looks inside the JSON payload — see `json_probe` for that.

use std::io;
use std::os::unix::io::{AsRawFd, OwnedFd, RawFd};
use std::time::{Duration, Instant};

use crate::error::{BrokerError, Result};

/// Maximum frame payload size in bytes.
pub const MAX_PAYLOAD: u32 = 65536;

/// Size of the big-endian length prefix.
const LEN_PREFIX: usize = 4;

/// Outcome of a single `recv_frame` attempt.
pub enum RecvOutcome {
    /// A complete frame was decoded. `fds` carries any ancillary file
    /// descriptors that arrived with it (owned by the caller now).
    Frame { payload: Vec<u8>, fds: Vec<OwnedFd> },
    /// No complete frame arrived within the deadline; the partial read (if
    /// any) is retained internally and will be resumed on the next call.
    Timeout,
    /// The peer closed the connection (read returned 0 with nothing
    /// in-flight).
    Eof,
}

/// Per-connection decode state, carried across `recv_frame` calls so a
/// frame that spans multiple readiness events is not lost.
enum PartialFrame {
    /// Nothing read yet for the next frame.
    Idle,
    /// Reading the 4-byte length prefix.
    ReadingLength { buf: [u8; LEN_PREFIX], have: usize },
    /// Reading the payload of a known length.
    ReadingPayload { want: u32, buf: Vec<u8>, have: usize },
}

pub struct FrameReader {
    state: PartialFrame,
    pending_fds: Vec<OwnedFd>,
}

impl Default for FrameReader {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameReader {
    pub fn new() -> Self {
        Self { state: PartialFrame::Idle, pending_fds: Vec::new() }
    }

    /// Attempt to read one complete frame from `fd` within `timeout`,
    /// resuming any partial frame left over from a prior call.
    ///
    /// At most one complete frame is ever returned per call; if more than
    /// one frame's worth of bytes is already buffered on the socket, the
    /// remainder is read on the next call. This keeps a single chatty
    /// sender from starving the rest of the event loop's ready set.
    pub fn recv_frame(&mut self, fd: RawFd, timeout: Duration) -> Result<RecvOutcome> {
        let deadline = Instant::now() + timeout;

        loop {
            match &mut self.state {
                PartialFrame::Idle => {
                    self.state = PartialFrame::ReadingLength { buf: [0u8; LEN_PREFIX], have: 0 };
                }
                PartialFrame::ReadingLength { buf, have } => {
                    if !wait_readable(fd, deadline)? {
                        return Ok(RecvOutcome::Timeout);
                    }
                    let (n, fds) = recvmsg_fds(fd, &mut buf[*have..])?;
                    self.pending_fds.extend(fds);
                    if n == 0 && *have == 0 {
                        return Ok(RecvOutcome::Eof);
                    }
                    if n == 0 {
                        // Peer closed mid-length — treat as EOF, discarding
                        // the unusable partial prefix.
                        self.state = PartialFrame::Idle;
                        return Ok(RecvOutcome::Eof);
                    }
                    *have += n;
                    if *have == LEN_PREFIX {
                        let len = u32::from_be_bytes(*buf);
                        if len == 0 || len > MAX_PAYLOAD {
                            self.state = PartialFrame::Idle;
                            return Err(BrokerError::BadLength { got: len, max: MAX_PAYLOAD });
                        }
                        self.state = PartialFrame::ReadingPayload {
                            want: len,
                            buf: vec![0u8; len as usize],
                            have: 0,
                        };
                    }
                }
                PartialFrame::ReadingPayload { want, buf, have } => {
                    if *have == *want as usize {
                        let payload = std::mem::take(buf);
                        self.state = PartialFrame::Idle;
                        let fds = std::mem::take(&mut self.pending_fds);
                        return Ok(RecvOutcome::Frame { payload, fds });
                    }
                    if !wait_readable(fd, deadline)? {
                        return Ok(RecvOutcome::Timeout);
                    }
                    let (n, fds) = recvmsg_fds(fd, &mut buf[*have..])?;
                    self.pending_fds.extend(fds);
                    if n == 0 {
                        self.state = PartialFrame::Idle;
                        return Ok(RecvOutcome::Eof);
                    }
                    *have += n;
                }
            }
        }
    }
}

/// Write one complete frame to `fd`: the 4-byte big-endian length, the
/// payload, and (on the first send) any ancillary FDs. Short writes are
/// retried until the frame is fully written or the peer is observed dead;
/// the caller may close its own copies of `fds` immediately after this
/// returns `Ok`, since they have been duplicated into the peer by the
/// kernel.
pub fn send_frame(fd: RawFd, payload: &[u8], fds: &[RawFd]) -> Result<()> {
    if payload.is_empty() || payload.len() as u64 > MAX_PAYLOAD as u64 {
        return Err(BrokerError::BadLength { got: payload.len() as u32, max: MAX_PAYLOAD });
    }

    let len_prefix = (payload.len() as u32).to_be_bytes();
    let mut framed = Vec::with_capacity(LEN_PREFIX + payload.len());
    framed.extend_from_slice(&len_prefix);
    framed.extend_from_slice(payload);

    let deadline = Instant::now() + Duration::from_millis(50);
    let mut sent = 0usize;
    let mut first = true;

    while sent < framed.len() {
        if !wait_writable(fd, deadline)? {
            return Err(BrokerError::TimedOut);
        }
        let chunk = &framed[sent..];
        let n = if first {
            sendmsg_fds(fd, chunk, fds)?
        } else {
            write_plain(fd, chunk)?
        };
        first = false;
        if n == 0 {
            return Err(BrokerError::PeerClosed);
        }
        sent += n;
    }
    Ok(())
}

fn wait_readable(fd: RawFd, deadline: Instant) -> Result<bool> {
    poll_one(fd, libc::POLLIN, deadline)
}

fn wait_writable(fd: RawFd, deadline: Instant) -> Result<bool> {
    poll_one(fd, libc::POLLOUT, deadline)
}

fn poll_one(fd: RawFd, events: i16, deadline: Instant) -> Result<bool> {
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Ok(false);
        }
        let mut pfd = libc::pollfd { fd, events, revents: 0 };
        let timeout_ms = remaining.as_millis().min(i32::MAX as u128) as i32;
        let rc = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
        match rc {
            -1 => {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(BrokerError::IoError(err));
            }
            0 => return Ok(false),
            _ => return Ok(pfd.revents & events != 0 || pfd.revents & (libc::POLLHUP | libc::POLLERR) != 0),
        }
    }
}

/// `recvmsg` with room for ancillary SCM_RIGHTS data, returning the number
/// of payload bytes read and any FDs received alongside them.
fn recvmsg_fds(fd: RawFd, buf: &mut [u8]) -> Result<(usize, Vec<OwnedFd>)> {
    use std::os::unix::io::FromRawFd;

    let cmsg_space = unsafe { libc::CMSG_SPACE((std::mem::size_of::<libc::c_int>() * 16) as u32) } as usize;
    let mut cmsg_buf = vec![0u8; cmsg_space];

    let mut iov = libc::iovec { iov_base: buf.as_mut_ptr() as *mut libc::c_void, iov_len: buf.len() };
    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
    msg.msg_controllen = cmsg_buf.len();

    let n = unsafe { libc::recvmsg(fd, &mut msg, 0) };
    if n < 0 {
        let err = io::Error::last_os_error();
        if matches!(err.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted) {
            return Ok((0, Vec::new()));
        }
        return Err(BrokerError::IoError(err));
    }

    let mut fds = Vec::new();
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
        while !cmsg.is_null() {
            if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_RIGHTS {
                let data = libc::CMSG_DATA(cmsg);
                let count = ((*cmsg).cmsg_len as usize - libc::CMSG_LEN(0) as usize)
                    / std::mem::size_of::<libc::c_int>();
                for i in 0..count {
                    let raw: libc::c_int =
                        std::ptr::read_unaligned(data.add(i * std::mem::size_of::<libc::c_int>()) as *const _);
                    fds.push(OwnedFd::from_raw_fd(raw));
                }
            }
            cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
        }
    }

    Ok((n as usize, fds))
}

/// `sendmsg` attaching `fds` via `SCM_RIGHTS`, or a plain `write` if `fds`
/// is empty.
fn sendmsg_fds(fd: RawFd, buf: &[u8], fds: &[RawFd]) -> Result<usize> {
    if fds.is_empty() {
        return write_plain(fd, buf);
    }

    let cmsg_space = unsafe { libc::CMSG_SPACE((std::mem::size_of::<libc::c_int>() * fds.len()) as u32) } as usize;
    let mut cmsg_buf = vec![0u8; cmsg_space];

    let mut iov = libc::iovec { iov_base: buf.as_ptr() as *mut libc::c_void, iov_len: buf.len() };
    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
    msg.msg_controllen = cmsg_buf.len();

    unsafe {
        let cmsg = libc::CMSG_FIRSTHDR(&msg);
        (*cmsg).cmsg_level = libc::SOL_SOCKET;
        (*cmsg).cmsg_type = libc::SCM_RIGHTS;
        (*cmsg).cmsg_len = libc::CMSG_LEN((std::mem::size_of::<libc::c_int>() * fds.len()) as u32) as _;
        let data = libc::CMSG_DATA(cmsg);
        for (i, rawfd) in fds.iter().enumerate() {
            std::ptr::write_unaligned(data.add(i * std::mem::size_of::<libc::c_int>()) as *mut libc::c_int, *rawfd);
        }
    }
    msg.msg_controllen = cmsg_space;

    let n = unsafe { libc::sendmsg(fd, &msg, 0) };
    if n < 0 {
        return Err(BrokerError::IoError(io::Error::last_os_error()));
    }
    Ok(n as usize)
}

fn write_plain(fd: RawFd, buf: &[u8]) -> Result<usize> {
    let n = unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
    if n < 0 {
        let err = io::Error::last_os_error();
        if matches!(err.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted) {
            return Ok(0);
        }
        return Err(BrokerError::IoError(err));
    }
    Ok(n as usize)
}

/// Small convenience used by tests and single-shot callers that don't need
/// to hold a `FrameReader` across multiple polling ticks.
pub fn recv_frame_once(fd: RawFd, timeout: Duration) -> Result<RecvOutcome> {
    FrameReader::new().recv_frame(fd, timeout)
}

pub(crate) fn raw_fd_of<T: AsRawFd>(t: &T) -> RawFd {
    t.as_raw_fd()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixStream;

    #[test]
    fn round_trip_simple() {
        let (a, b) = UnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();
        b.set_nonblocking(true).unwrap();

        send_frame(raw_fd_of(&a), br#"{"type":"ping"}"#, &[]).unwrap();

        let mut reader = FrameReader::new();
        let outcome = reader.recv_frame(raw_fd_of(&b), Duration::from_millis(500)).unwrap();
        match outcome {
            RecvOutcome::Frame { payload, fds } => {
                assert_eq!(&payload, br#"{"type":"ping"}"#);
                assert!(fds.is_empty());
            }
            _ => panic!("expected a frame"),
        }
    }

    #[test]
    fn rejects_oversize_length() {
        let (a, b) = UnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();
        b.set_nonblocking(true).unwrap();

        let bogus = (MAX_PAYLOAD + 1).to_be_bytes();
        write_plain(raw_fd_of(&a), &bogus).unwrap();

        let mut reader = FrameReader::new();
        let err = reader.recv_frame(raw_fd_of(&b), Duration::from_millis(200)).unwrap_err();
        assert!(matches!(err, BrokerError::BadLength { .. }));
    }

    #[test]
    fn eof_on_closed_peer() {
        let (a, b) = UnixStream::pair().unwrap();
        b.set_nonblocking(true).unwrap();
        drop(a);

        let mut reader = FrameReader::new();
        let outcome = reader.recv_frame(raw_fd_of(&b), Duration::from_millis(200)).unwrap();
        assert!(matches!(outcome, RecvOutcome::Eof));
    }

    #[test]
    fn partial_frame_resumes_across_calls() {
        let (a, b) = UnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();
        b.set_nonblocking(true).unwrap();

        // Write the length prefix and half the payload, then pause.
        let payload = br#"{"type":"publish","feed":"t","data":"hello","encoding":"utf8"}"#;
        let mut framed = Vec::new();
        framed.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        framed.extend_from_slice(payload);

        write_plain(raw_fd_of(&a), &framed[..6]).unwrap();

        let mut reader = FrameReader::new();
        let outcome = reader.recv_frame(raw_fd_of(&b), Duration::from_millis(50)).unwrap();
        assert!(matches!(outcome, RecvOutcome::Timeout));

        write_plain(raw_fd_of(&a), &framed[6..]).unwrap();
        let outcome = reader.recv_frame(raw_fd_of(&b), Duration::from_millis(500)).unwrap();
        match outcome {
            RecvOutcome::Frame { payload: p, .. } => assert_eq!(&p, payload),
            _ => panic!("expected frame after resume"),
        }
    }

    #[test]
    fn fd_relay_round_trips() {
        use std::io::{Read, Write};
        use std::os::unix::io::IntoRawFd;

        let (a, b) = UnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();
        b.set_nonblocking(true).unwrap();

        let mut tmp = tempfile::tempfile().unwrap();
        tmp.write_all(b"shared").unwrap();
        let raw = tmp.into_raw_fd();

        send_frame(raw_fd_of(&a), br#"{"type":"publish"}"#, &[raw]).unwrap();
        unsafe { libc::close(raw) };

        let mut reader = FrameReader::new();
        let outcome = reader.recv_frame(raw_fd_of(&b), Duration::from_millis(500)).unwrap();
        match outcome {
            RecvOutcome::Frame { fds, .. } => {
                assert_eq!(fds.len(), 1);
                use std::os::unix::io::FromRawFd;
                let mut f = unsafe { std::fs::File::from_raw_fd(fds[0].as_raw_fd()) };
                std::mem::forget(fds);
                let mut buf = String::new();
                use std::io::Seek;
                f.seek(std::io::SeekFrom::Start(0)).unwrap();
                f.read_to_string(&mut buf).unwrap();
                assert_eq!(buf, "shared");
            }
            _ => panic!("expected frame with fd"),
        }
    }
}
