//! The broker: feed registry, plugin host, and the single-threaded event
//! loop that ties them to a Unix-domain control socket. Exposed as a
//! library so integration tests can spin up a real broker against a
//! `tempfile`-scoped socket path rather than mocking the event loop.

pub mod broker;
pub mod commands;
pub mod config;
pub mod connection;
pub mod event_loop;
pub mod feed_registry;
pub mod plugin_host;
pub mod signal;

pub use broker::Broker;
pub use config::BrokerConfig;
