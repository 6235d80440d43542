//! Name -> subscriber-set registry. A feed is created implicitly by
//! `ensure` (called by both `create_feed` and `subscribe`) and lives until
//! the broker exits; nothing ever deletes a feed, only the subscriber sets
//! shrink. `unsubscribe` is a full implementation, not a stub.

use std::collections::{HashMap, HashSet};
use std::os::unix::io::RawFd;
use std::sync::Mutex;

use tracing::warn;

#[derive(Default)]
struct FeedRecord {
    subs: HashSet<RawFd>,
}

#[derive(Default)]
pub struct FeedRegistry {
    feeds: Mutex<HashMap<String, FeedRecord>>,
}

impl FeedRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the feed if it doesn't already exist. Idempotent.
    pub fn ensure(&self, feed: &str) {
        let mut feeds = self.feeds.lock().unwrap();
        feeds.entry(feed.to_string()).or_default();
    }

    /// Subscribe `fd` to `feed`, creating the feed first if needed.
    /// Subscribing twice is a no-op, not an error.
    pub fn subscribe(&self, feed: &str, fd: RawFd) {
        let mut feeds = self.feeds.lock().unwrap();
        feeds.entry(feed.to_string()).or_default().subs.insert(fd);
    }

    /// Remove `fd` from `feed`'s subscriber set. Unsubscribing from a feed
    /// you never joined, or from a feed that doesn't exist, is a no-op.
    pub fn unsubscribe(&self, feed: &str, fd: RawFd) {
        let mut feeds = self.feeds.lock().unwrap();
        if let Some(record) = feeds.get_mut(feed) {
            record.subs.remove(&fd);
        }
    }

    /// Remove `fd` from every feed it is subscribed to. Called when a
    /// client disconnects.
    pub fn unsubscribe_all(&self, fd: RawFd) {
        let mut feeds = self.feeds.lock().unwrap();
        for record in feeds.values_mut() {
            record.subs.remove(&fd);
        }
    }

    /// List feed names.
    pub fn list(&self) -> Vec<String> {
        let feeds = self.feeds.lock().unwrap();
        let mut names: Vec<String> = feeds.keys().cloned().collect();
        names.sort();
        names
    }

    /// Send `payload` (with any ancillary `fds`) to every current
    /// subscriber of `feed`. A send failure to one subscriber does not
    /// stop delivery to the others; it is logged and otherwise ignored —
    /// the subscriber will be reaped on its next disconnect sweep.
    pub fn broadcast(&self, feed: &str, payload: &[u8], fds: &[RawFd]) {
        let feeds = self.feeds.lock().unwrap();
        let Some(record) = feeds.get(feed) else { return };
        for &fd in &record.subs {
            if let Err(e) = sdrbus_protocol::send_frame(fd, payload, fds) {
                warn!(feed, fd, error = %e, "dropping message to subscriber");
            }
        }
    }

    pub fn subscriber_count(&self, feed: &str) -> usize {
        let feeds = self.feeds.lock().unwrap();
        feeds.get(feed).map(|r| r.subs.len()).unwrap_or(0)
    }
}
