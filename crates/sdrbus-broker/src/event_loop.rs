//! The single-threaded broker event loop: accept, read one frame per ready
//! client per tick, dispatch, sweep dead connections.
//!
//! Uses `libc::poll` over a plain `Vec<pollfd>` rather than `select`/
//! `fd_set`, which in C is capped at 1024 descriptors by the `fd_set`
//! bitmap layout; `poll` has no such cap and keeps the same
//! single-threaded, non-async shape. This is the one place in the
//! workspace that deliberately does not use `tokio`; see DESIGN.md for
//! the rationale.

use std::collections::HashMap;
use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixListener;
use std::time::Duration;

use tracing::{info, warn};

use sdrbus_protocol::RecvOutcome;

use crate::broker::Broker;
use crate::connection::Connection;

/// Run the event loop until `broker.shutdown_requested()` becomes true
/// (via `cli-control exit` or the process's SIGINT handler). On return,
/// the caller is responsible for unlinking the socket path.
pub fn run(broker: &Broker, listener: UnixListener) -> io::Result<()> {
    listener.set_nonblocking(true)?;
    let listener_fd = listener.as_raw_fd();

    let poll_interval = Duration::from_millis(broker.config().timing.poll_interval_ms);
    let read_budget = Duration::from_millis(broker.config().timing.frame_read_budget_ms);

    let mut conns: HashMap<RawFd, Connection> = HashMap::new();

    while !broker.shutdown_requested() && !crate::signal::received() {
        let mut pollfds: Vec<libc::pollfd> =
            Vec::with_capacity(conns.len() + 1);
        pollfds.push(libc::pollfd { fd: listener_fd, events: libc::POLLIN, revents: 0 });
        for &fd in conns.keys() {
            pollfds.push(libc::pollfd { fd, events: libc::POLLIN, revents: 0 });
        }

        let timeout_ms = poll_interval.as_millis().min(i32::MAX as u128) as i32;
        let rc = unsafe { libc::poll(pollfds.as_mut_ptr(), pollfds.len() as libc::nfds_t, timeout_ms) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        if rc == 0 {
            continue; // readiness timeout, nothing to do this tick
        }

        if pollfds[0].revents & libc::POLLIN != 0 {
            accept_pending(&listener, &mut conns);
        }

        let mut dead = Vec::new();
        for pfd in &pollfds[1..] {
            if pfd.revents == 0 {
                continue;
            }
            let fd = pfd.fd;
            let Some(conn) = conns.get_mut(&fd) else { continue };
            match conn.reader.recv_frame(fd, read_budget) {
                Ok(RecvOutcome::Frame { payload, fds }) => {
                    broker.handle_message(fd, &payload, fds);
                }
                Ok(RecvOutcome::Timeout) => {}
                Ok(RecvOutcome::Eof) => {
                    dead.push(fd);
                }
                Err(e) => {
                    warn!(fd, error = %e, "client read error, dropping connection");
                    dead.push(fd);
                }
            }
        }

        for fd in dead {
            conns.remove(&fd);
            broker.feeds().unsubscribe_all(fd);
            info!(fd, "client disconnected");
        }
    }

    broker.plugins().stop_all();
    Ok(())
}

fn accept_pending(listener: &UnixListener, conns: &mut HashMap<RawFd, Connection>) {
    loop {
        match listener.accept() {
            Ok((stream, _addr)) => {
                if let Err(e) = stream.set_nonblocking(true) {
                    warn!(error = %e, "failed to set accepted socket nonblocking");
                    continue;
                }
                let fd = stream.as_raw_fd();
                info!(fd, "client connected");
                conns.insert(fd, Connection::new(stream));
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) => {
                warn!(error = %e, "accept failed");
                break;
            }
        }
    }
}

/// Bind the broker's UDS listener at `path`, removing any stale socket
/// file left over from an unclean prior shutdown first — matching
/// `uds_listen_create`'s `unlink`-then-`bind` sequence.
pub fn bind(path: &str) -> io::Result<UnixListener> {
    let _ = std::fs::remove_file(path);
    UnixListener::bind(path)
}
