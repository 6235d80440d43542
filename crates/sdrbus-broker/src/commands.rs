//! Handlers for `command` messages on the well-known `cli-control` feed.
//! Each verb writes its reply (or replies — `feeds` and `plugins` each
//! emit one frame per item) directly to the requesting connection's fd.

use std::os::fd::RawFd;

use serde_json::json;
use tracing::{info, warn};

use sdrbus_addon_sdk::abi::PLUGIN_ABI_VERSION;
use sdrbus_protocol::send_frame;

use crate::broker::Broker;
use crate::plugin_host::discover_addons;

/// Dispatch one `cli-control` command line, sending its reply (or replies)
/// to `fd`. Never kills the connection on an unknown or malformed verb —
/// command failures are logged, not fatal to the peer.
pub fn dispatch(fd: RawFd, line: &str, broker: &Broker) {
    match line {
        "help" => reply(fd, &json!({
            "type": "info",
            "msg": "commands: help, feeds, load <name>, unload <name>, plugins, available-addons, exit",
            "abi": PLUGIN_ABI_VERSION,
            "socket": broker.socket_path(),
        })),
        "feeds" | "list feeds" => list_feeds(fd, broker),
        "plugins" | "list addons" => list_plugins(fd, broker),
        "available-addons" | "list available-addons" => list_available_addons(fd, broker),
        "exit" => {
            info!("cli-control requested shutdown");
            broker.request_shutdown();
            reply(fd, &json!({ "type": "info", "msg": "shutting down" }));
        }
        _ if line.starts_with("load ") => load_addon(fd, line["load ".len()..].trim(), broker),
        _ if line.starts_with("unload ") => unload_addon(fd, line["unload ".len()..].trim(), broker),
        other => {
            warn!(command = %other, "unknown cli-control command");
            reply(fd, &json!({ "type": "error", "msg": format!("unknown command: {other}") }));
        }
    }
}

fn list_feeds(fd: RawFd, broker: &Broker) {
    for name in broker.feeds().list() {
        reply(fd, &json!({ "type": "info", "feed": name }));
    }
}

fn list_plugins(fd: RawFd, broker: &Broker) {
    for name in broker.plugins().names() {
        reply(fd, &json!({ "type": "info", "plugin": name }));
    }
}

fn list_available_addons(fd: RawFd, broker: &Broker) {
    let paths: Vec<String> = discover_addons(broker.addon_roots())
        .into_iter()
        .map(|p| p.display().to_string())
        .collect();
    reply(fd, &json!({ "type": "available-addons", "paths": paths }));
}

fn load_addon(fd: RawFd, name_or_path: &str, broker: &Broker) {
    if name_or_path.is_empty() {
        reply(fd, &json!({ "type": "error", "msg": "load requires a name or path" }));
        return;
    }
    let path = resolve_addon_path(name_or_path, broker);
    match broker.plugins().load(&path, broker.socket_path()) {
        Ok(name) => {
            info!(plugin = %name, path = %path.display(), "loaded plugin via cli-control");
            reply(fd, &json!({ "type": "info", "msg": format!("loaded {name}") }));
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "load failed");
            reply(fd, &json!({ "type": "error", "msg": e.to_string() }));
        }
    }
}

fn unload_addon(fd: RawFd, name: &str, broker: &Broker) {
    if name.is_empty() {
        reply(fd, &json!({ "type": "error", "msg": "unload requires a name" }));
        return;
    }
    match broker.plugins().unload(name) {
        Ok(()) => {
            info!(plugin = %name, "unloaded plugin via cli-control");
            reply(fd, &json!({ "type": "info", "msg": format!("unloaded {name}") }));
        }
        Err(e) => {
            warn!(plugin = %name, error = %e, "unload failed");
            reply(fd, &json!({ "type": "error", "msg": e.to_string() }));
        }
    }
}

/// `name_or_path` may be a bare addon name (searched for among the
/// discoverable paths) or an explicit path to a library file.
fn resolve_addon_path(name_or_path: &str, broker: &Broker) -> std::path::PathBuf {
    let direct = std::path::PathBuf::from(name_or_path);
    if direct.is_file() {
        return direct;
    }
    discover_addons(broker.addon_roots())
        .into_iter()
        .find(|p| {
            p.file_stem()
                .and_then(|s| s.to_str())
                .is_some_and(|s| s == name_or_path || s == format!("lib{name_or_path}"))
        })
        .unwrap_or(direct)
}

fn reply(fd: RawFd, value: &serde_json::Value) {
    let Ok(bytes) = serde_json::to_vec(value) else { return };
    if let Err(e) = send_frame(fd, &bytes, &[]) {
        warn!(fd, error = %e, "failed to send cli-control reply");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BrokerConfig;

    fn test_broker() -> Broker {
        let cfg = BrokerConfig::from_str(
            r#"
            [broker]
            socket_path = "/tmp/.sdrbus-test.sock"
            [addons]
            roots = []
            autoload = false
            "#,
        )
        .unwrap();
        Broker::new(cfg)
    }

    #[test]
    fn unknown_command_does_not_panic() {
        let broker = test_broker();
        let (a, _b) = std::os::unix::net::UnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();
        dispatch(std::os::fd::AsRawFd::as_raw_fd(&a), "definitely-not-a-verb", &broker);
    }

    #[test]
    fn exit_sets_shutdown_flag() {
        let broker = test_broker();
        let (a, _b) = std::os::unix::net::UnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();
        assert!(!broker.shutdown_requested());
        dispatch(std::os::fd::AsRawFd::as_raw_fd(&a), "exit", &broker);
        assert!(broker.shutdown_requested());
    }
}
