//! Control-plane helpers an addon uses to talk back to the broker over the
//! same UDS socket the host connected it through: create a feed, subscribe
//! or unsubscribe, publish a message (with or without attached FDs), and
//! reply to a dispatched command.

use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::time::Duration;

use sdrbus_protocol::{send_frame, FrameReader, RecvOutcome};
use serde_json::{json, Value};

use crate::error::{AddonError, Result};

/// A connection an addon uses to issue control-plane requests to the
/// broker. Cheap to clone the underlying fd via `try_clone` if the addon
/// needs to read and write from different threads.
pub struct ControlClient {
    stream: UnixStream,
    reader: FrameReader,
}

impl ControlClient {
    pub fn connect(sock_path: &str) -> Result<Self> {
        let stream = UnixStream::connect(sock_path).map_err(AddonError::Io)?;
        stream.set_nonblocking(true).map_err(AddonError::Io)?;
        Ok(Self { stream, reader: FrameReader::new() })
    }

    fn fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    fn send(&self, value: &Value) -> Result<()> {
        let bytes = serde_json::to_vec(value)?;
        send_frame(self.fd(), &bytes, &[]).map_err(AddonError::Protocol)
    }

    fn send_with_fds(&self, value: &Value, fds: &[RawFd]) -> Result<()> {
        let bytes = serde_json::to_vec(value)?;
        send_frame(self.fd(), &bytes, fds).map_err(AddonError::Protocol)
    }

    /// Wait up to `timeout` for the broker's reply to the last request.
    pub fn recv_reply(&mut self, timeout: Duration) -> Result<Value> {
        match self.reader.recv_frame(self.fd(), timeout).map_err(AddonError::Protocol)? {
            RecvOutcome::Frame { payload, .. } => Ok(serde_json::from_slice(&payload)?),
            RecvOutcome::Timeout => Err(AddonError::Protocol(sdrbus_protocol::BrokerError::TimedOut)),
            RecvOutcome::Eof => Err(AddonError::Protocol(sdrbus_protocol::BrokerError::PeerClosed)),
        }
    }

    /// Like [`Self::recv_reply`], but also surfaces any ancillary file
    /// descriptors carried on the frame — what a subscriber to an info
    /// feed (e.g. `soapy.IQ-info`) needs to pick up a ring handle.
    pub fn recv_reply_with_fds(&mut self, timeout: Duration) -> Result<(Value, Vec<std::os::fd::OwnedFd>)> {
        match self.reader.recv_frame(self.fd(), timeout).map_err(AddonError::Protocol)? {
            RecvOutcome::Frame { payload, fds } => Ok((serde_json::from_slice(&payload)?, fds)),
            RecvOutcome::Timeout => Err(AddonError::Protocol(sdrbus_protocol::BrokerError::TimedOut)),
            RecvOutcome::Eof => Err(AddonError::Protocol(sdrbus_protocol::BrokerError::PeerClosed)),
        }
    }

    pub fn create_feed(&self, feed: &str) -> Result<()> {
        self.send(&json!({ "type": "create_feed", "feed": feed }))
    }

    pub fn subscribe(&self, feed: &str) -> Result<()> {
        self.send(&json!({ "type": "subscribe", "feed": feed }))
    }

    pub fn unsubscribe(&self, feed: &str) -> Result<()> {
        self.send(&json!({ "type": "unsubscribe", "feed": feed }))
    }

    pub fn publish(&self, feed: &str, data: &Value) -> Result<()> {
        self.send(&json!({ "type": "publish", "feed": feed, "data": data }))
    }

    pub fn publish_with_fds(&self, feed: &str, data: &Value, fds: &[RawFd]) -> Result<()> {
        self.send_with_fds(&json!({ "type": "publish", "feed": feed, "data": data }), fds)
    }

    pub fn reply_ok(&self, request_id: &Value) -> Result<()> {
        self.send(&json!({ "type": "reply", "id": request_id, "ok": true }))
    }

    pub fn reply_okf(&self, request_id: &Value, data: &Value) -> Result<()> {
        self.send(&json!({ "type": "reply", "id": request_id, "ok": true, "data": data }))
    }

    pub fn reply_err(&self, request_id: &Value, message: &str) -> Result<()> {
        self.send(&json!({ "type": "reply", "id": request_id, "ok": false, "error": message }))
    }
}
