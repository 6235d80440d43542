//! Per-addon command dispatcher: an addon subscribes to its own
//! `<name>.config.in` feed, and whatever gets published there is handed to
//! the addon's `CommandDispatcher` and the result published back on
//! `<name>.config.out`. Every addon gets `help` and `ping` for free;
//! `subscribe <feed>` / `unsubscribe <feed>` and addon-specific verbs are
//! layered on top by the dispatcher it wraps.

use std::time::Duration;

use serde_json::Value;
use tracing::{debug, warn};

use crate::control::ControlClient;
use crate::error::Result;

/// Implemented by an addon to answer commands published to its
/// `<name>.config.in` feed. `cmd` is the first whitespace-separated token
/// of the command string, `args` the rest.
pub trait CommandDispatcher {
    fn handle(&mut self, cmd: &str, args: &[&str]) -> Value;
}

/// A dispatcher providing the `help` and `ping` verbs every addon
/// supports, falling back to `inner` for anything else.
pub struct WithBaseCommands<D> {
    pub inner: D,
    pub extra_help: Vec<&'static str>,
}

impl<D: CommandDispatcher> CommandDispatcher for WithBaseCommands<D> {
    fn handle(&mut self, cmd: &str, args: &[&str]) -> Value {
        match cmd {
            "help" => {
                let mut lines = vec!["help", "ping"];
                lines.extend(self.extra_help.iter().copied());
                serde_json::json!({ "commands": lines })
            }
            "ping" => serde_json::json!({ "pong": true }),
            _ => self.inner.handle(cmd, args),
        }
    }
}

/// Subscribe to `<name>.config.in` and loop forever, dispatching each
/// command that arrives and publishing the reply to `<name>.config.out`.
/// Returns only on a connection error.
pub fn run_command_loop<D: CommandDispatcher>(
    client: &mut ControlClient,
    name: &str,
    mut dispatcher: D,
) -> Result<()> {
    let in_feed = format!("{name}.config.in");
    let out_feed = format!("{name}.config.out");

    client.create_feed(&out_feed)?;
    client.subscribe(&in_feed)?;

    loop {
        let msg = match client.recv_reply(Duration::from_secs(3600)) {
            Ok(m) => m,
            Err(err) if is_timeout(&err) => continue,
            Err(e) => return Err(e),
        };

        let feed = msg.get("feed").and_then(Value::as_str);
        if feed != Some(in_feed.as_str()) {
            continue;
        }
        let Some(data) = msg.get("data") else {
            warn!(%in_feed, "command message missing data field");
            continue;
        };
        let Some(line) = data.as_str() else {
            warn!(%in_feed, "command message data was not a string");
            continue;
        };

        let mut parts = line.split_whitespace();
        let Some(cmd) = parts.next() else { continue };
        let args: Vec<&str> = parts.collect();
        debug!(%cmd, ?args, "dispatching addon command");

        let reply = dispatcher.handle(cmd, &args);
        client.publish(&out_feed, &reply)?;
    }
}

fn is_timeout(err: &crate::error::AddonError) -> bool {
    matches!(err, crate::error::AddonError::Protocol(sdrbus_protocol::BrokerError::TimedOut))
}
