//! A single accepted client connection: its socket and the per-connection
//! frame decode state that must survive across readiness ticks.
//!
//! Owned exclusively by the event loop from accept to close, matching the
//! `Connection` invariant in the data model: the broker never keeps a
//! connection around after it observes EOF or an I/O error on it.

use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;

use sdrbus_protocol::FrameReader;

pub struct Connection {
    pub stream: UnixStream,
    pub reader: FrameReader,
}

impl Connection {
    pub fn new(stream: UnixStream) -> Self {
        Self { stream, reader: FrameReader::new() }
    }

    pub fn fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }
}
