//! The broker's process-wide state and its per-message dispatch logic.
//! The event loop (see `event_loop.rs`) owns connections and readiness
//! polling; this module owns what a decoded message *means*.

use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};

use serde_json::json;
use tracing::{debug, warn};

use sdrbus_protocol::{json_probe, send_frame};

use crate::commands;
use crate::config::BrokerConfig;
use crate::feed_registry::FeedRegistry;
use crate::plugin_host::PluginTable;

pub struct Broker {
    config: BrokerConfig,
    feeds: FeedRegistry,
    plugins: PluginTable,
    run: AtomicBool,
}

impl Broker {
    pub fn new(config: BrokerConfig) -> Self {
        Self { config, feeds: FeedRegistry::new(), plugins: PluginTable::new(), run: AtomicBool::new(true) }
    }

    pub fn socket_path(&self) -> &str {
        &self.config.broker.socket_path
    }

    pub fn addon_roots(&self) -> &[String] {
        &self.config.addons.roots
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn feeds(&self) -> &FeedRegistry {
        &self.feeds
    }

    pub fn plugins(&self) -> &PluginTable {
        &self.plugins
    }

    pub fn request_shutdown(&self) {
        self.run.store(false, Ordering::SeqCst);
    }

    pub fn shutdown_requested(&self) -> bool {
        !self.run.load(Ordering::SeqCst)
    }

    /// Autoload every addon under the configured roots, if enabled. Called
    /// once at startup, before the event loop begins serving clients.
    pub fn autoload_addons(&self) {
        if !self.config.addons.autoload {
            return;
        }
        let loaded = self.plugins.autoload(&self.config.addons.roots, self.socket_path());
        tracing::info!(count = loaded, "autoload complete");
    }

    /// Dispatch one decoded frame from `fd`. Every fd in `fds` is either
    /// handed to `broadcast` (which duplicates it into each subscriber)
    /// or closed before this function returns.
    pub fn handle_message(&self, fd: RawFd, payload: &[u8], fds: Vec<OwnedFd>) {
        let Some(msg_type) = json_probe::get_type(payload) else {
            warn!(fd, "discarding message with no \"type\" field");
            return;
        };

        match msg_type.as_ref() {
            "create_feed" => {
                if let Some(feed) = json_probe::get_string_field(payload, "feed") {
                    self.feeds.ensure(&feed);
                }
            }
            "subscribe" => {
                if let Some(feed) = json_probe::get_string_field(payload, "feed") {
                    self.feeds.subscribe(&feed, fd);
                }
            }
            "unsubscribe" => {
                if let Some(feed) = json_probe::get_string_field(payload, "feed") {
                    self.feeds.unsubscribe(&feed, fd);
                }
            }
            "publish" => {
                if let Some(feed) = json_probe::get_string_field(payload, "feed") {
                    let raw_fds: Vec<RawFd> = fds.iter().map(|f| f.as_raw_fd()).collect();
                    self.feeds.broadcast(&feed, payload, &raw_fds);
                } else {
                    warn!(fd, "publish with no \"feed\" field, dropping");
                }
            }
            "command" => {
                self.handle_command(fd, payload);
            }
            "ping" => {
                let pong = br#"{"type":"pong"}"#;
                if let Err(e) = send_frame(fd, pong, &[]) {
                    debug!(fd, error = %e, "failed to send pong");
                }
            }
            other => {
                warn!(fd, msg_type = %other, "unrecognized message type, discarding");
            }
        }
        // `fds` drops here, closing any ancillary descriptors the broker
        // did not need to retain beyond this dispatch.
    }

    fn handle_command(&self, fd: RawFd, payload: &[u8]) {
        let Some(feed) = json_probe::get_string_field(payload, "feed") else { return };
        if feed.as_ref() != "cli-control" {
            return;
        }
        let Some(data) = json_probe::get_string_field(payload, "data") else {
            let _ = send_frame(fd, error_frame("command missing \"data\"").as_slice(), &[]);
            return;
        };
        commands::dispatch(fd, data.as_ref(), self);
    }
}

fn error_frame(msg: &str) -> Vec<u8> {
    serde_json::to_vec(&json!({ "type": "error", "msg": msg })).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;

    fn broker() -> Broker {
        let cfg = BrokerConfig::from_str(
            r#"
            [broker]
            socket_path = "/tmp/.sdrbus-broker-test.sock"
            [addons]
            roots = []
            autoload = false
            "#,
        )
        .unwrap();
        Broker::new(cfg)
    }

    #[test]
    fn ping_yields_pong() {
        let broker = broker();
        let (a, b) = UnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();
        b.set_nonblocking(true).unwrap();

        broker.handle_message(a.as_raw_fd(), br#"{"type":"ping"}"#, Vec::new());

        let mut reader = sdrbus_protocol::FrameReader::new();
        match reader.recv_frame(b.as_raw_fd(), std::time::Duration::from_millis(200)).unwrap() {
            sdrbus_protocol::RecvOutcome::Frame { payload, .. } => {
                assert_eq!(&payload, br#"{"type":"pong"}"#);
            }
            _ => panic!("expected pong frame"),
        }
    }

    #[test]
    fn publish_routes_to_subscriber_not_publisher() {
        let broker = broker();
        let (publisher, _publisher_peer) = UnixStream::pair().unwrap();
        let (sub_a, sub_a_peer) = UnixStream::pair().unwrap();
        sub_a_peer.set_nonblocking(true).unwrap();

        broker.feeds().subscribe("t", sub_a.as_raw_fd());

        let publish = br#"{"type":"publish","feed":"t","data":"hello","encoding":"utf8"}"#;
        broker.handle_message(publisher.as_raw_fd(), publish, Vec::new());

        let mut reader = sdrbus_protocol::FrameReader::new();
        match reader.recv_frame(sub_a_peer.as_raw_fd(), std::time::Duration::from_millis(200)).unwrap() {
            sdrbus_protocol::RecvOutcome::Frame { payload, .. } => assert_eq!(&payload, publish),
            _ => panic!("expected the publish to be relayed verbatim"),
        }
    }

    #[test]
    fn create_feed_is_idempotent() {
        let broker = broker();
        let (a, _b) = UnixStream::pair().unwrap();
        broker.handle_message(a.as_raw_fd(), br#"{"type":"create_feed","feed":"x"}"#, Vec::new());
        broker.handle_message(a.as_raw_fd(), br#"{"type":"create_feed","feed":"x"}"#, Vec::new());
        assert_eq!(broker.feeds().list(), vec!["x".to_string()]);
    }

    #[test]
    fn malformed_message_is_discarded_not_fatal() {
        let broker = broker();
        let (a, _b) = UnixStream::pair().unwrap();
        broker.handle_message(a.as_raw_fd(), b"{not json at all", Vec::new());
        // No panic, no feeds created.
        assert!(broker.feeds().list().is_empty());
    }
}
